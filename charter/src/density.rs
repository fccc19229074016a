//! Manual density adjustment: add taps where the music is loudest or clear
//! tap rows where it is quietest.

use crate::config::DensityParams;
use crate::error::{ChartError, Result};
use crate::features::FeatureSampler;
use crate::grid::{GridPos, LaneSymbol, NoteGrid, Row, LANES};
use crate::lane_assigner::LaneAssigner;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DensityChange {
    Increase,
    Decrease,
}

impl fmt::Display for DensityChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DensityChange::Increase => "increase",
            DensityChange::Decrease => "decrease",
        })
    }
}

impl FromStr for DensityChange {
    type Err = ChartError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "increase" | "up" => Ok(DensityChange::Increase),
            "decrease" | "down" => Ok(DensityChange::Decrease),
            other => Err(ChartError::InvalidConfig(format!(
                "unknown density change '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DensityReport {
    pub taps_before: usize,
    /// Taps to add, or rows to clear
    pub target: usize,
    /// Taps added, or rows cleared
    pub changed: usize,
    pub taps_after: usize,
}

fn tap_count(grid: &NoteGrid) -> usize {
    grid.measures()
        .iter()
        .flat_map(|m| m.rows.iter())
        .map(|r| r.tap_lanes().len())
        .sum()
}

/// Hold heads and tails pin a row; only plain rows are edited.
fn touches_hold_end(row: &Row) -> bool {
    row.0
        .iter()
        .any(|&s| s.is_hold_start() || s == LaneSymbol::HoldTail)
}

/// Rows matching `keep`, with the onset energy at their beat, in beat order.
fn rows_by_energy(
    grid: &NoteGrid,
    sampler: &FeatureSampler,
    keep: impl Fn(&Row) -> bool,
) -> Vec<(GridPos, f64)> {
    grid.positions()
        .into_iter()
        .filter(|&(pos, _)| grid.row(pos).map(&keep).unwrap_or(false))
        .map(|(pos, beat)| {
            let energy = sampler
                .time_at_beat(beat)
                .map(|t| sampler.onset_at_time(t))
                .unwrap_or(0.0);
            (pos, energy)
        })
        .collect()
}

/// Add or remove `fraction` of the chart's taps.
///
/// Increasing adds one tap to each of the loudest rows that still have a
/// free input, on a lane that is empty and not inside a hold. Decreasing
/// clears every tap on the quietest tap rows. Rows holding a hold head or
/// tail are never touched, so holds stay well formed.
pub fn adjust_density<R: Rng + ?Sized>(
    grid: &mut NoteGrid,
    sampler: &FeatureSampler,
    change: DensityChange,
    params: &DensityParams,
    lanes: &mut LaneAssigner,
    rng: &mut R,
) -> DensityReport {
    let taps_before = tap_count(grid);
    let target = (taps_before as f64 * params.fraction).floor() as usize;
    let mut report = DensityReport {
        taps_before,
        target,
        ..Default::default()
    };

    match change {
        DensityChange::Increase => {
            let cap = params.max_active_inputs;
            let mut rows = rows_by_energy(grid, sampler, |row| {
                !touches_hold_end(row) && row.active_inputs() < cap
            });
            rows.sort_by(|a, b| b.1.total_cmp(&a.1));

            for (pos, _) in rows {
                if report.changed >= target {
                    break;
                }
                let Some(row) = grid.row_mut(pos) else { continue };
                let taken: Vec<usize> = (0..LANES).filter(|&l| row.get(l) != LaneSymbol::Empty).collect();
                if let Some(lane) = lanes.assign_avoiding(rng, &taken) {
                    row.set(lane, LaneSymbol::Tap);
                    report.changed += 1;
                }
            }
        }
        DensityChange::Decrease => {
            let mut rows = rows_by_energy(grid, sampler, |row| {
                !touches_hold_end(row) && !row.tap_lanes().is_empty()
            });
            rows.sort_by(|a, b| a.1.total_cmp(&b.1));

            for (pos, _) in rows.into_iter().take(target) {
                let Some(row) = grid.row_mut(pos) else { continue };
                for lane in row.tap_lanes() {
                    row.set(lane, LaneSymbol::Empty);
                }
                report.changed += 1;
            }
        }
    }

    report.taps_after = tap_count(grid);
    log::debug!(
        "density {}: {} taps, target {}, {} changed",
        change,
        report.taps_before,
        report.target,
        report.changed
    );
    report
}
