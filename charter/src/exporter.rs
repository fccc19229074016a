use crate::config::Difficulty;
use crate::error::Result;
use crate::grid::{LaneSymbol, NoteGrid, LANES};
use crate::simfile::Simfile;
use crate::timing::TimingGrid;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Write `contents` next to `path` and rename it into place.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Save a chart file; the destination is either fully replaced or untouched.
pub fn save_simfile(path: &Path, sim: &Simfile) -> Result<()> {
    write_atomic(path, &sim.to_text())?;
    log::debug!("wrote {} charts to {}", sim.charts.len(), path.display());
    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChartExport {
    pub title: String,
    pub artist: String,
    pub difficulty: String,
    pub meter: u32,
    pub columns: u8,
    pub offset: f64,
    pub bpms: Vec<(f64, f64)>,
    pub generated_at: i64,
    pub notes: Vec<NoteExport>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NoteExport {
    pub time: f64,
    pub col: u8,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub duration: f64,
}

fn is_zero(n: &f64) -> bool {
    *n < 0.001
}

/// Flatten a grid into timed notes. Holds and rolls carry their length.
pub fn timed_notes(grid: &NoteGrid, timing: &TimingGrid) -> Vec<NoteExport> {
    let positions = grid.positions();
    let mut notes = Vec::new();

    for (i, &(pos, beat)) in positions.iter().enumerate() {
        let Some(row) = grid.row(pos) else { continue };
        for lane in 0..LANES {
            let symbol = row.get(lane);
            if !symbol.is_note() {
                continue;
            }

            let time = timing.time_at_beat(beat);
            let duration = if symbol.is_hold_start() {
                positions[i + 1..]
                    .iter()
                    .find(|(p, _)| grid.row(*p).map(|r| r.get(lane)) == Some(LaneSymbol::HoldTail))
                    .map(|&(_, end)| timing.time_at_beat(end) - time)
                    .unwrap_or(0.0)
            } else {
                0.0
            };

            notes.push(NoteExport {
                time,
                col: lane as u8,
                duration,
            });
        }
    }

    notes
}

impl ChartExport {
    pub fn from_simfile(sim: &Simfile, difficulty: Difficulty) -> Result<Self> {
        let chart = sim.chart(difficulty)?;
        let timing = sim.timing()?;

        let generated_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Ok(ChartExport {
            title: sim.title().unwrap_or_default().to_string(),
            artist: sim.artist().unwrap_or_default().to_string(),
            difficulty: chart.difficulty.clone(),
            meter: chart.meter,
            columns: LANES as u8,
            offset: timing.offset(),
            bpms: timing.bpm_changes(),
            generated_at,
            notes: timed_notes(&chart.grid, &timing),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_json()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChartError;
    use crate::grid::Row;
    use crate::simfile::{ChartBody, SongMeta};
    use tempfile::TempDir;

    fn song() -> Simfile {
        let timing = TimingGrid::constant(0.0, 120.0).unwrap();
        let meta = SongMeta {
            title: "Test".into(),
            artist: "Band".into(),
            music: "test.ogg".into(),
        };
        let mut sim = Simfile::with_header(&meta, &timing);

        let rows = ["1000", "0000", "0200", "0000", "0010", "0300", "0000", "0000"]
            .iter()
            .map(|r| Row::parse(r).unwrap())
            .collect();
        let mut grid = NoteGrid::from_rows(rows, 8);
        grid.mark_hold_bodies();
        sim.upsert_chart(ChartBody::new(Difficulty::Easy, "", grid));
        sim
    }

    #[test]
    fn test_chart_export_json() {
        let export = ChartExport::from_simfile(&song(), Difficulty::Easy).unwrap();
        assert_eq!(export.columns, 4);
        assert_eq!(
            export.notes,
            vec![
                NoteExport { time: 0.0, col: 0, duration: 0.0 },
                NoteExport { time: 0.5, col: 1, duration: 0.75 },
                NoteExport { time: 1.0, col: 2, duration: 0.0 },
            ]
        );

        let json = export.to_json().unwrap();
        assert!(json.contains("\"time\": 0.5"));
        assert!(json.contains("\"duration\": 0.75"));
        assert_eq!(json.matches("\"duration\"").count(), 1);
    }

    #[test]
    fn test_export_missing_difficulty() {
        let err = ChartExport::from_simfile(&song(), Difficulty::Hard).unwrap_err();
        assert!(matches!(err, ChartError::MissingChart(_)));
    }

    #[test]
    fn test_save_simfile_replaces_in_place() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("song.sm");
        std::fs::write(&path, "old contents").unwrap();

        let sim = song();
        save_simfile(&path, &sim).unwrap();
        assert_eq!(Simfile::load(&path).unwrap(), sim);
        // no stray temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
