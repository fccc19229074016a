//! Note grid: measures of fixed-width rows addressed in fractional-beat space.

use crate::error::{ChartError, Result};
use num_integer::Integer;
use std::fmt;

pub const LANES: usize = 4;
pub const BEATS_PER_MEASURE: usize = 4;

/// Row alignment tolerance, in rows, when looking up a beat.
const ALIGN_TOLERANCE: f64 = 0.01;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LaneSymbol {
    #[default]
    Empty,
    Tap,
    HoldHead,
    HoldTail,
    HoldBody, // written as '0'; re-derived on parse
    RollHead,
    Mine,
}

impl LaneSymbol {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(LaneSymbol::Empty),
            '1' => Some(LaneSymbol::Tap),
            '2' => Some(LaneSymbol::HoldHead),
            '3' => Some(LaneSymbol::HoldTail),
            '4' => Some(LaneSymbol::RollHead),
            'M' => Some(LaneSymbol::Mine),
            _ => None,
        }
    }

    pub fn to_char(self) -> char {
        match self {
            LaneSymbol::Empty | LaneSymbol::HoldBody => '0',
            LaneSymbol::Tap => '1',
            LaneSymbol::HoldHead => '2',
            LaneSymbol::HoldTail => '3',
            LaneSymbol::RollHead => '4',
            LaneSymbol::Mine => 'M',
        }
    }

    /// Something the player must hit at this row.
    pub fn is_note(self) -> bool {
        matches!(self, LaneSymbol::Tap | LaneSymbol::HoldHead | LaneSymbol::RollHead)
    }

    pub fn is_hold_start(self) -> bool {
        matches!(self, LaneSymbol::HoldHead | LaneSymbol::RollHead)
    }

    /// Occupies an input at this row: a note, or a hold passing through.
    pub fn is_active(self) -> bool {
        self.is_note() || self == LaneSymbol::HoldBody
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Row(pub [LaneSymbol; LANES]);

impl Row {
    pub fn empty() -> Self {
        Row::default()
    }

    pub fn single(lane: usize) -> Self {
        let mut row = Row::empty();
        row.0[lane] = LaneSymbol::Tap;
        row
    }

    pub fn get(&self, lane: usize) -> LaneSymbol {
        self.0[lane]
    }

    pub fn set(&mut self, lane: usize, symbol: LaneSymbol) {
        self.0[lane] = symbol;
    }

    pub fn note_count(&self) -> usize {
        self.0.iter().filter(|s| s.is_note()).count()
    }

    pub fn has_note(&self) -> bool {
        self.0.iter().any(|s| s.is_note())
    }

    pub fn is_jump(&self) -> bool {
        self.note_count() >= 2
    }

    pub fn note_lanes(&self) -> Vec<usize> {
        (0..LANES).filter(|&l| self.0[l].is_note()).collect()
    }

    pub fn tap_lanes(&self) -> Vec<usize> {
        (0..LANES).filter(|&l| self.0[l] == LaneSymbol::Tap).collect()
    }

    pub fn active_inputs(&self) -> usize {
        self.0.iter().filter(|s| s.is_active()).count()
    }

    pub fn is_blank(&self) -> bool {
        self.0.iter().all(|&s| s == LaneSymbol::Empty)
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut row = Row::empty();
        let mut count = 0;
        for (lane, c) in text.chars().enumerate() {
            if lane >= LANES {
                return None;
            }
            row.0[lane] = LaneSymbol::from_char(c)?;
            count += 1;
        }
        (count == LANES).then_some(row)
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for symbol in &self.0 {
            write!(f, "{}", symbol.to_char())?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Measure {
    pub rows: Vec<Row>,
}

impl Measure {
    pub fn new(rows: Vec<Row>) -> Self {
        Measure { rows }
    }

    pub fn empty(resolution: usize) -> Self {
        Measure {
            rows: vec![Row::empty(); resolution],
        }
    }

    pub fn resolution(&self) -> usize {
        self.rows.len()
    }
}

/// Address of one row in the grid. Ordering is beat order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct GridPos {
    pub measure: usize,
    pub row: usize,
}

impl GridPos {
    pub fn new(measure: usize, row: usize) -> Self {
        GridPos { measure, row }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct NoteGrid {
    measures: Vec<Measure>,
}

impl NoteGrid {
    pub fn new(measures: Vec<Measure>) -> Self {
        NoteGrid { measures }
    }

    /// Chunk a flat row list into measures, padding the last one with empty rows.
    pub fn from_rows(rows: Vec<Row>, rows_per_measure: usize) -> Self {
        let measures = rows
            .chunks(rows_per_measure.max(1))
            .map(|chunk| {
                let mut rows = chunk.to_vec();
                rows.resize(rows_per_measure.max(1), Row::empty());
                Measure::new(rows)
            })
            .collect();
        NoteGrid { measures }
    }

    pub fn measures(&self) -> &[Measure] {
        &self.measures
    }

    pub fn measures_mut(&mut self) -> &mut [Measure] {
        &mut self.measures
    }

    pub fn len(&self) -> usize {
        self.measures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measures.is_empty()
    }

    pub fn row(&self, pos: GridPos) -> Option<&Row> {
        self.measures.get(pos.measure)?.rows.get(pos.row)
    }

    pub fn row_mut(&mut self, pos: GridPos) -> Option<&mut Row> {
        self.measures.get_mut(pos.measure)?.rows.get_mut(pos.row)
    }

    /// Beat of a row: `4m + 4r/R`.
    pub fn beat_of(&self, pos: GridPos) -> f64 {
        let rows = self
            .measures
            .get(pos.measure)
            .map(|m| m.resolution())
            .unwrap_or(1)
            .max(1);
        (pos.measure * BEATS_PER_MEASURE) as f64
            + pos.row as f64 / rows as f64 * BEATS_PER_MEASURE as f64
    }

    /// Every row with its beat, in beat order.
    pub fn positions(&self) -> Vec<(GridPos, f64)> {
        let mut out = Vec::with_capacity(self.total_rows());
        for (m, measure) in self.measures.iter().enumerate() {
            for r in 0..measure.resolution() {
                let pos = GridPos::new(m, r);
                out.push((pos, self.beat_of(pos)));
            }
        }
        out
    }

    pub fn total_rows(&self) -> usize {
        self.measures.iter().map(|m| m.resolution()).sum()
    }

    /// Number of note cells (taps, hold and roll heads).
    pub fn note_count(&self) -> usize {
        self.measures
            .iter()
            .flat_map(|m| m.rows.iter())
            .map(|r| r.note_count())
            .sum()
    }

    pub fn flatten(&self) -> Vec<Row> {
        self.measures
            .iter()
            .flat_map(|m| m.rows.iter().copied())
            .collect()
    }

    /// Multiply every measure's resolution, inserting empty rows after each
    /// existing row. Notes keep their beat positions.
    pub fn expand_resolution(&mut self, factor: usize) {
        if factor <= 1 {
            return;
        }
        for measure in &mut self.measures {
            let mut rows = Vec::with_capacity(measure.resolution() * factor);
            for row in &measure.rows {
                rows.push(*row);
                rows.extend(std::iter::repeat(Row::empty()).take(factor - 1));
            }
            measure.rows = rows;
        }
    }

    /// The quarter-note rows of the grid, one per beat. Beats that fall between
    /// rows of an odd-resolution measure come back empty.
    pub fn primary_rows(&self) -> Vec<Row> {
        let mut out = Vec::with_capacity(self.measures.len() * BEATS_PER_MEASURE);
        for measure in &self.measures {
            let rows = measure.resolution();
            for b in 0..BEATS_PER_MEASURE {
                let (r, rem) = (b * rows).div_rem(&BEATS_PER_MEASURE);
                let row = if rem == 0 {
                    measure.rows.get(r).copied().unwrap_or_default()
                } else {
                    Row::empty()
                };
                out.push(row);
            }
        }
        out
    }

    /// Row exactly aligned with `beat`, if this measure's resolution has one.
    pub fn pos_at_beat(&self, beat: f64) -> Option<GridPos> {
        if beat < 0.0 {
            return None;
        }
        let m = (beat / BEATS_PER_MEASURE as f64).floor() as usize;
        let measure = self.measures.get(m)?;
        let rows = measure.resolution();
        if rows == 0 {
            return None;
        }

        let remainder = beat - (m * BEATS_PER_MEASURE) as f64;
        let r_float = remainder / BEATS_PER_MEASURE as f64 * rows as f64;
        let r = r_float.round();
        if (r_float - r).abs() > ALIGN_TOLERANCE || r as usize >= rows {
            return None;
        }
        Some(GridPos::new(m, r as usize))
    }

    pub fn has_note_at(&self, beat: f64) -> bool {
        self.pos_at_beat(beat)
            .and_then(|pos| self.row(pos))
            .map(|row| row.has_note())
            .unwrap_or(false)
    }

    /// True when no row with a beat in `[start, end]` holds a note.
    pub fn is_range_empty(&self, start: f64, end: f64) -> bool {
        if self.measures.is_empty() || end < start {
            return true;
        }
        let first = (start / BEATS_PER_MEASURE as f64).floor().max(0.0) as usize;
        let last = ((end / BEATS_PER_MEASURE as f64).floor().max(0.0) as usize)
            .min(self.measures.len() - 1);

        for m in first..=last {
            for (r, row) in self.measures[m].rows.iter().enumerate() {
                let beat = self.beat_of(GridPos::new(m, r));
                if beat >= start && beat <= end && row.has_note() {
                    return false;
                }
            }
        }
        true
    }

    /// Last row at or before `beat`; beats past the end map to the final row.
    pub fn pos_at_or_before(&self, beat: f64) -> Option<GridPos> {
        let last_measure = self.measures.len().checked_sub(1)?;
        let m = (beat / BEATS_PER_MEASURE as f64).floor().max(0.0) as usize;
        if m > last_measure {
            let rows = self.measures[last_measure].resolution();
            return rows.checked_sub(1).map(|r| GridPos::new(last_measure, r));
        }

        let rows = self.measures[m].resolution();
        if rows == 0 {
            return None;
        }
        let remainder = (beat - (m * BEATS_PER_MEASURE) as f64).max(0.0);
        let r = ((remainder / BEATS_PER_MEASURE as f64) * rows as f64).floor() as usize;
        Some(GridPos::new(m, r.min(rows - 1)))
    }

    pub fn active_inputs(&self, pos: GridPos) -> usize {
        self.row(pos).map(|r| r.active_inputs()).unwrap_or(0)
    }

    pub fn max_active_inputs(&self) -> usize {
        self.measures
            .iter()
            .flat_map(|m| m.rows.iter())
            .map(|r| r.active_inputs())
            .max()
            .unwrap_or(0)
    }

    fn lane_positions(&self) -> Vec<GridPos> {
        self.positions().into_iter().map(|(pos, _)| pos).collect()
    }

    fn set_cell(&mut self, pos: GridPos, lane: usize, symbol: LaneSymbol) {
        if let Some(row) = self.row_mut(pos) {
            row.set(lane, symbol);
        }
    }

    fn cell(&self, pos: GridPos, lane: usize) -> LaneSymbol {
        self.row(pos).map(|r| r.get(lane)).unwrap_or_default()
    }

    /// Fill cells between each hold head and its tail with `HoldBody`.
    pub fn mark_hold_bodies(&mut self) {
        let positions = self.lane_positions();
        for lane in 0..LANES {
            let mut open = false;
            for &pos in &positions {
                match self.cell(pos, lane) {
                    s if s.is_hold_start() => open = true,
                    LaneSymbol::HoldTail => open = false,
                    LaneSymbol::Empty if open => self.set_cell(pos, lane, LaneSymbol::HoldBody),
                    LaneSymbol::HoldBody if !open => self.set_cell(pos, lane, LaneSymbol::Empty),
                    _ => {}
                }
            }
        }
    }

    /// Restore hold structure after rows were cleared: orphan tails are
    /// dropped, heads without a tail become taps, bodies are re-derived.
    /// Returns the number of cells changed.
    pub fn repair_holds(&mut self) -> usize {
        let positions = self.lane_positions();
        let mut fixes = 0;

        for lane in 0..LANES {
            let mut open: Option<GridPos> = None;
            let mut body: Vec<GridPos> = Vec::new();

            for &pos in &positions {
                match self.cell(pos, lane) {
                    s if s.is_hold_start() => {
                        if let Some(head) = open.take() {
                            self.demote_hold(head, &body, lane);
                            fixes += 1;
                        }
                        open = Some(pos);
                        body.clear();
                    }
                    LaneSymbol::HoldTail => {
                        if open.take().is_none() {
                            self.set_cell(pos, lane, LaneSymbol::Empty);
                            fixes += 1;
                        }
                        body.clear();
                    }
                    LaneSymbol::Empty if open.is_some() => {
                        self.set_cell(pos, lane, LaneSymbol::HoldBody);
                        body.push(pos);
                    }
                    LaneSymbol::HoldBody if open.is_some() => body.push(pos),
                    LaneSymbol::HoldBody => self.set_cell(pos, lane, LaneSymbol::Empty),
                    LaneSymbol::Tap if open.is_some() => {
                        self.set_cell(pos, lane, LaneSymbol::HoldBody);
                        body.push(pos);
                        fixes += 1;
                    }
                    _ => {}
                }
            }

            if let Some(head) = open {
                self.demote_hold(head, &body, lane);
                fixes += 1;
            }
        }

        fixes
    }

    fn demote_hold(&mut self, head: GridPos, body: &[GridPos], lane: usize) {
        self.set_cell(head, lane, LaneSymbol::Tap);
        for &pos in body {
            self.set_cell(pos, lane, LaneSymbol::Empty);
        }
    }

    /// Check that every hold head on a lane reaches exactly one tail with only
    /// bodies or empty cells in between.
    pub fn validate_holds(&self) -> Result<()> {
        let positions = self.lane_positions();
        for lane in 0..LANES {
            let mut open: Option<GridPos> = None;
            for &pos in &positions {
                match (self.cell(pos, lane), open) {
                    (s, Some(head)) if s.is_hold_start() => {
                        return Err(ChartError::InvalidGrid(format!(
                            "lane {}: hold at {:?} starts before hold at {:?} ends",
                            lane, pos, head
                        )))
                    }
                    (s, None) if s.is_hold_start() => open = Some(pos),
                    (LaneSymbol::HoldTail, Some(_)) => open = None,
                    (LaneSymbol::HoldTail, None) => {
                        return Err(ChartError::InvalidGrid(format!(
                            "lane {}: tail at {:?} without a head",
                            lane, pos
                        )))
                    }
                    (LaneSymbol::Tap, Some(head)) => {
                        return Err(ChartError::InvalidGrid(format!(
                            "lane {}: note at {:?} inside hold from {:?}",
                            lane, pos, head
                        )))
                    }
                    _ => {}
                }
            }
            if let Some(head) = open {
                return Err(ChartError::InvalidGrid(format!(
                    "lane {}: hold at {:?} never ends",
                    lane, head
                )));
            }
        }
        Ok(())
    }
}
