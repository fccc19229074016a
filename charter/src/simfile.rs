//! Chart text format: `#KEY:value;` header tags followed by `#NOTES:` bodies.

use crate::config::Difficulty;
use crate::error::{ChartError, Result};
use crate::grid::{Measure, NoteGrid, Row};
use crate::timing::TimingGrid;
use std::fmt::Write as _;
use std::path::Path;

pub const STEP_STYLE: &str = "dance-single";
const NOTES_TAG: &str = "NOTES";
const FIELD_INDENT: &str = "     ";

/// Seconds after beat 0 where the song preview starts.
const SAMPLE_START_DELAY: f64 = 20.0;
const SAMPLE_LENGTH: f64 = 15.0;

#[derive(Clone, Debug, PartialEq)]
pub struct ChartBody {
    pub step_style: String,
    pub description: String,
    pub difficulty: String,
    pub meter: u32,
    pub radar: Vec<f64>,
    pub grid: NoteGrid,
}

impl ChartBody {
    pub fn new(difficulty: Difficulty, description: &str, grid: NoteGrid) -> Self {
        ChartBody {
            step_style: STEP_STYLE.to_string(),
            description: description.to_string(),
            difficulty: difficulty.name().to_string(),
            meter: difficulty.default_meter(),
            radar: vec![0.0; 5],
            grid,
        }
    }

    pub fn is_difficulty(&self, difficulty: Difficulty) -> bool {
        self.difficulty.trim().eq_ignore_ascii_case(difficulty.name())
    }
}

/// Song-level fields for a fresh chart file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SongMeta {
    pub title: String,
    pub artist: String,
    pub music: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Simfile {
    pub tags: Vec<(String, String)>,
    pub charts: Vec<ChartBody>,
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(i) => &line[..i],
        None => line,
    }
}

fn line_of(text: &str, byte: usize) -> usize {
    text[..byte].matches('\n').count() + 1
}

fn parse_note_data(data: &str, line: usize) -> Result<NoteGrid> {
    if data.trim().is_empty() {
        return Ok(NoteGrid::default());
    }

    let mut measures = Vec::new();
    for chunk in data.split(',') {
        let mut rows = Vec::new();
        for text in chunk.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let row = Row::parse(text)
                .ok_or_else(|| ChartError::parse(line, format!("malformed row '{}'", text)))?;
            rows.push(row);
        }
        measures.push(Measure::new(rows));
    }

    let mut grid = NoteGrid::new(measures);
    grid.mark_hold_bodies();
    Ok(grid)
}

fn parse_chart_body(value: &str, line: usize) -> Result<ChartBody> {
    let fields: Vec<&str> = value.splitn(6, ':').collect();
    if fields.len() < 6 {
        return Err(ChartError::parse(
            line,
            format!("chart body has {} fields, expected 6", fields.len()),
        ));
    }

    let meter = fields[3]
        .trim()
        .parse::<u32>()
        .map_err(|_| ChartError::parse(line, format!("bad meter '{}'", fields[3].trim())))?;

    let radar = fields[4]
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<f64>()
                .map_err(|_| ChartError::parse(line, format!("bad radar value '{}'", v)))
        })
        .collect::<Result<Vec<f64>>>()?;

    Ok(ChartBody {
        step_style: fields[0].trim().to_string(),
        description: fields[1].trim().to_string(),
        difficulty: fields[2].trim().to_string(),
        meter,
        radar,
        grid: parse_note_data(fields[5], line)?,
    })
}

impl Simfile {
    pub fn parse(text: &str) -> Result<Self> {
        let cleaned = text.lines().map(strip_comment).collect::<Vec<_>>().join("\n");
        let mut sim = Simfile::default();
        let mut cursor = 0;

        while let Some(found) = cleaned[cursor..].find('#') {
            let start = cursor + found;
            let line = line_of(&cleaned, start);
            let body_start = start + 1;

            let end = cleaned[body_start..]
                .find(';')
                .map(|i| body_start + i)
                .ok_or_else(|| ChartError::parse(line, "unterminated tag"))?;
            let body = &cleaned[body_start..end];

            let (key, value) = body
                .split_once(':')
                .ok_or_else(|| ChartError::parse(line, format!("tag '{}' has no value", body.trim())))?;
            let key = key.trim();

            if key.eq_ignore_ascii_case(NOTES_TAG) {
                sim.charts.push(parse_chart_body(value, line)?);
            } else {
                sim.tags.push((key.to_string(), value.trim().to_string()));
            }
            cursor = end + 1;
        }

        Ok(sim)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ChartError::MissingInput(path.to_path_buf()));
        }
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Standard header for a freshly generated chart file.
    pub fn with_header(meta: &SongMeta, timing: &TimingGrid) -> Self {
        let offset = timing.offset();
        let sample_start = (-offset + SAMPLE_START_DELAY).max(0.0);
        let bpms = format_bpms(&timing.bpm_changes());

        let tags: Vec<(&str, String)> = vec![
            ("TITLE", meta.title.clone()),
            ("SUBTITLE", String::new()),
            ("ARTIST", meta.artist.clone()),
            ("TITLETRANSLIT", String::new()),
            ("SUBTITLETRANSLIT", String::new()),
            ("ARTISTTRANSLIT", String::new()),
            ("GENRE", String::new()),
            ("CREDIT", "stepchart".to_string()),
            ("MUSIC", meta.music.clone()),
            ("BANNER", String::new()),
            ("BACKGROUND", String::new()),
            ("CDTITLE", String::new()),
            ("SAMPLESTART", format!("{:.3}", sample_start)),
            ("SAMPLELENGTH", format!("{:.3}", SAMPLE_LENGTH)),
            ("SELECTABLE", "YES".to_string()),
            ("OFFSET", format!("{:.3}", offset)),
            ("BPMS", bpms),
            ("STOPS", String::new()),
            ("DELAYS", String::new()),
            ("WARPS", String::new()),
            ("TIMESIGNATURES", "0.000=4=4".to_string()),
            ("TICKCOUNTS", "0.000=4".to_string()),
            ("COMBOS", "0.000=1".to_string()),
            ("SPEEDS", "0.000=1.000=0.000=0".to_string()),
            ("SCROLLS", "0.000=1.000".to_string()),
            ("FAKES", String::new()),
            ("LABELS", "0.000=Song Start".to_string()),
        ];

        Simfile {
            tags: tags.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            charts: Vec::new(),
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_tag(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.tags.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some(slot) => slot.1 = value,
            None => self.tags.push((key.to_string(), value)),
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.tag("TITLE")
    }

    pub fn artist(&self) -> Option<&str> {
        self.tag("ARTIST")
    }

    pub fn music(&self) -> Option<&str> {
        self.tag("MUSIC")
    }

    pub fn offset(&self) -> Result<f64> {
        match self.tag("OFFSET").map(str::trim) {
            None | Some("") => Ok(0.0),
            Some(v) => v
                .parse()
                .map_err(|_| ChartError::InvalidTiming(format!("bad offset '{}'", v))),
        }
    }

    /// `(beat, bpm)` pairs from the `BPMS` tag, sorted by beat.
    pub fn bpms(&self) -> Result<Vec<(f64, f64)>> {
        let raw = self
            .tag("BPMS")
            .ok_or_else(|| ChartError::InvalidTiming("missing BPMS tag".into()))?;

        let mut pairs = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parsed = entry
                .split_once('=')
                .and_then(|(b, v)| Some((b.trim().parse::<f64>().ok()?, v.trim().parse::<f64>().ok()?)));
            match parsed {
                Some(pair) => pairs.push(pair),
                None => {
                    return Err(ChartError::InvalidTiming(format!("bad BPMS entry '{}'", entry)))
                }
            }
        }
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(pairs)
    }

    pub fn timing(&self) -> Result<TimingGrid> {
        TimingGrid::from_bpm_changes(self.offset()?, &self.bpms()?)
    }

    pub fn chart(&self, difficulty: Difficulty) -> Result<&ChartBody> {
        self.charts
            .iter()
            .find(|c| c.is_difficulty(difficulty))
            .ok_or_else(|| ChartError::MissingChart(difficulty.name().to_string()))
    }

    pub fn chart_mut(&mut self, difficulty: Difficulty) -> Result<&mut ChartBody> {
        self.charts
            .iter_mut()
            .find(|c| c.is_difficulty(difficulty))
            .ok_or_else(|| ChartError::MissingChart(difficulty.name().to_string()))
    }

    /// Replace the body with the same difficulty name, or append it.
    pub fn upsert_chart(&mut self, chart: ChartBody) {
        let existing = self
            .charts
            .iter_mut()
            .find(|c| c.difficulty.trim().eq_ignore_ascii_case(chart.difficulty.trim()));
        match existing {
            Some(slot) => *slot = chart,
            None => self.charts.push(chart),
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.tags {
            let _ = writeln!(out, "#{}:{};", key, value);
        }
        for chart in &self.charts {
            write_chart(&mut out, chart);
        }
        out
    }
}

pub fn format_bpms(changes: &[(f64, f64)]) -> String {
    changes
        .iter()
        .map(|(beat, bpm)| format!("{:.3}={:.3}", beat, bpm))
        .collect::<Vec<_>>()
        .join(",\n")
}

fn write_chart(out: &mut String, chart: &ChartBody) {
    let radar = chart
        .radar
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let _ = write!(
        out,
        "\n//---------------{} - {}----------------\n#{}:\n",
        chart.step_style, chart.difficulty, NOTES_TAG
    );
    for field in [
        chart.step_style.as_str(),
        chart.description.as_str(),
        chart.difficulty.as_str(),
    ] {
        let _ = writeln!(out, "{}{}:", FIELD_INDENT, field);
    }
    let _ = writeln!(out, "{}{}:", FIELD_INDENT, chart.meter);
    let _ = writeln!(out, "{}{}:", FIELD_INDENT, radar);

    let measures = chart
        .grid
        .measures()
        .iter()
        .map(|m| {
            m.rows
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n,\n");
    out.push_str(&measures);
    out.push_str("\n;\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{GridPos, LaneSymbol};

    const SAMPLE: &str = "#TITLE:Test Song;
#ARTIST:Someone;
#MUSIC:song.ogg;
#OFFSET:-0.250;
#BPMS:0.000=120.000,
8.000=140.000;

//---------------dance-single - Medium----------------
#NOTES:
     dance-single:
     :
     Medium:
     5:
     0.100,0.200,0.300,0.400,0.500:
1000
0000
2000
0000
,  // measure 2
0100
0000
3000
M000
;
";

    #[test]
    fn test_parse_header_and_chart() {
        let sim = Simfile::parse(SAMPLE).unwrap();
        assert_eq!(sim.title(), Some("Test Song"));
        assert_eq!(sim.music(), Some("song.ogg"));
        assert_eq!(sim.offset().unwrap(), -0.25);
        assert_eq!(sim.bpms().unwrap(), vec![(0.0, 120.0), (8.0, 140.0)]);

        let chart = sim.chart(Difficulty::Medium).unwrap();
        assert_eq!(chart.meter, 5);
        assert_eq!(chart.radar.len(), 5);
        assert_eq!(chart.grid.len(), 2);
        // hold bodies re-derived between head and tail
        assert_eq!(
            chart.grid.row(GridPos::new(0, 3)).unwrap().get(0),
            LaneSymbol::HoldBody
        );
        assert_eq!(chart.grid.row(GridPos::new(1, 3)).unwrap().get(0), LaneSymbol::Mine);
        assert!(matches!(
            sim.chart(Difficulty::Hard),
            Err(ChartError::MissingChart(_))
        ));
    }

    #[test]
    fn test_serialize_then_parse_is_identity() {
        let sim = Simfile::parse(SAMPLE).unwrap();
        let text = sim.to_text();
        assert!(text.contains("#NOTES:\n     dance-single:\n"));
        assert!(text.contains("2000\n0000\n,\n0100"));
        assert_eq!(Simfile::parse(&text).unwrap(), sim);
    }

    #[test]
    fn test_upsert_replaces_same_difficulty() {
        let mut sim = Simfile::parse(SAMPLE).unwrap();
        let grid = NoteGrid::from_rows(vec![Row::single(3); 4], 4);
        let mut body = ChartBody::new(Difficulty::Medium, "regenerated", grid.clone());
        body.difficulty = "medium".to_string();
        sim.upsert_chart(body);
        assert_eq!(sim.charts.len(), 1);
        assert_eq!(sim.chart(Difficulty::Medium).unwrap().grid, grid);

        sim.upsert_chart(ChartBody::new(Difficulty::Hard, "", grid));
        assert_eq!(sim.charts.len(), 2);
    }

    #[test]
    fn test_unterminated_tag_is_parse_error() {
        let err = Simfile::parse("#TITLE:x;\n#ARTIST:never closed\n").unwrap_err();
        assert!(matches!(err, ChartError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_malformed_body_is_parse_error() {
        let short = "#NOTES:dance-single:desc:Easy:1;";
        assert!(matches!(Simfile::parse(short), Err(ChartError::Parse { .. })));

        let bad_row = "#NOTES:dance-single::Easy:1::\n10X0\n;";
        assert!(matches!(Simfile::parse(bad_row), Err(ChartError::Parse { .. })));
    }

    #[test]
    fn test_header_timing() {
        let timing = TimingGrid::from_bpm_changes(-1.5, &[(0.0, 120.0), (16.0, 150.0)]).unwrap();
        let meta = SongMeta {
            title: "T".into(),
            artist: "A".into(),
            music: "t.ogg".into(),
        };
        let sim = Simfile::with_header(&meta, &timing);
        assert_eq!(sim.tag("SAMPLESTART"), Some("21.500"));
        assert_eq!(sim.tag("BPMS"), Some("0.000=120.000,\n16.000=150.000"));

        let back = Simfile::parse(&sim.to_text()).unwrap();
        assert_eq!(back.timing().unwrap(), timing);
    }

    #[test]
    fn test_empty_grid_round_trip() {
        let mut sim = Simfile::default();
        sim.upsert_chart(ChartBody::new(Difficulty::Easy, "", NoteGrid::default()));
        assert_eq!(Simfile::parse(&sim.to_text()).unwrap(), sim);
    }

    #[test]
    fn test_radar_keeps_full_precision() {
        let mut sim = Simfile::parse(SAMPLE).unwrap();
        let mut body = ChartBody::new(Difficulty::Hard, "", NoteGrid::from_rows(vec![Row::single(0); 4], 4));
        body.radar = vec![0.1234567, 1.0 / 3.0, 0.0, 0.5, 2.75];
        sim.upsert_chart(body.clone());

        let back = Simfile::parse(&sim.to_text()).unwrap();
        assert_eq!(back.chart(Difficulty::Hard).unwrap().radar, body.radar);
    }
}
