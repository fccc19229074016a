//! Sustained notes: turn analyzer hold segments into hold notes while keeping
//! at most two simultaneous inputs.

use crate::config::HoldParams;
use crate::features::{FeatureSampler, HoldSegment};
use crate::grid::{GridPos, LaneSymbol, NoteGrid, LANES};
use crate::timing::TimingGrid;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum HoldStatus {
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HoldCandidate {
    pub lane: usize,
    pub start: GridPos,
    pub end: GridPos,
    pub start_beat: f64,
    pub end_beat: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub status: HoldStatus,
}

impl HoldCandidate {
    fn remaining(&self, beat: f64) -> f64 {
        self.end_beat - beat
    }

    fn is_accepted(&self) -> bool {
        self.status == HoldStatus::Accepted
    }

    fn truncate(&mut self, pos: GridPos, beat: f64) {
        self.end = pos;
        self.end_beat = beat;
    }

    fn overlaps(&self, lane: usize, start: GridPos, end: GridPos) -> bool {
        self.lane == lane && start <= self.end && self.start <= end
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HoldReport {
    pub candidates: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub truncated: usize,
    pub taps_removed: usize,
}

fn occupies_lane(symbol: LaneSymbol) -> bool {
    matches!(
        symbol,
        LaneSymbol::HoldHead | LaneSymbol::RollHead | LaneSymbol::HoldBody | LaneSymbol::HoldTail
    )
}

fn matching_segment<'s>(segments: &'s [HoldSegment], time: f64, params: &HoldParams) -> Option<&'s HoldSegment> {
    segments.iter().find(|seg| {
        seg.duration() >= params.min_segment_secs
            && time >= seg.start - params.start_lead_secs
            && time <= seg.start + params.start_lag_secs
    })
}

/// One candidate per tap that starts close to a long enough segment.
///
/// Segments are matched in start order, so the earliest qualifying segment
/// wins when several are near a tap. The hold ends on the last row at or before the segment end. Candidates
/// that would overlap another candidate or an existing hold on the same lane
/// are skipped.
pub fn identify_candidates(
    grid: &NoteGrid,
    timing: &TimingGrid,
    segments: &[HoldSegment],
    params: &HoldParams,
) -> Vec<HoldCandidate> {
    let mut candidates: Vec<HoldCandidate> = Vec::new();
    if segments.is_empty() {
        return candidates;
    }
    let mut segments = segments.to_vec();
    segments.sort_by(|a, b| a.start.total_cmp(&b.start));
    let positions = grid.positions();

    for &(pos, beat) in &positions {
        let Some(row) = grid.row(pos) else { continue };
        let time = timing.time_at_beat(beat);

        for lane in row.tap_lanes() {
            let Some(seg) = matching_segment(&segments, time, params) else {
                continue;
            };

            let Some(end) = grid.pos_at_or_before(timing.beat_at_time(seg.end)) else {
                continue;
            };
            if end <= pos {
                continue;
            }
            if candidates.iter().any(|c| c.overlaps(lane, pos, end)) {
                continue;
            }
            let blocked = positions
                .iter()
                .filter(|(p, _)| *p > pos && *p <= end)
                .any(|(p, _)| grid.row(*p).map(|r| occupies_lane(r.get(lane))).unwrap_or(false));
            if blocked {
                continue;
            }

            candidates.push(HoldCandidate {
                lane,
                start: pos,
                end,
                start_beat: beat,
                end_beat: grid.beat_of(end),
                start_time: time,
                end_time: seg.end,
                status: HoldStatus::Accepted,
            });
        }
    }

    candidates
}

fn clear_tap(grid: &mut NoteGrid, pos: GridPos, lane: usize) -> bool {
    match grid.row_mut(pos) {
        Some(row) if row.get(lane) == LaneSymbol::Tap => {
            row.set(lane, LaneSymbol::Empty);
            true
        }
        _ => false,
    }
}

/// Sweep rows in beat order and settle every row where taps and holds compete
/// for more inputs than allowed.
///
/// Above the energy threshold taps win: holds starting on the row are
/// rejected and running holds are cut short. Otherwise holds win: the longest
/// remaining holds are kept and surplus taps are removed. Remaining spans are
/// recomputed at every row since earlier truncations change them.
pub fn resolve_conflicts(
    grid: &mut NoteGrid,
    candidates: &mut [HoldCandidate],
    timing: &TimingGrid,
    sampler: &FeatureSampler,
    params: &HoldParams,
    report: &mut HoldReport,
) {
    let cap = params.max_active_inputs;
    let hold_limit = params.max_concurrent_holds.min(cap);

    for (pos, beat) in grid.positions() {
        let active: Vec<usize> = (0..candidates.len())
            .filter(|&i| {
                let c = &candidates[i];
                c.is_accepted() && c.start <= pos && c.end_beat > beat
            })
            .collect();
        if active.is_empty() {
            continue;
        }

        let Some(row) = grid.row(pos) else { continue };
        // cells of holds that were already in the chart
        let fixed = (0..LANES)
            .filter(|&l| matches!(row.get(l), LaneSymbol::HoldHead | LaneSymbol::RollHead | LaneSymbol::HoldBody))
            .count();
        let taps: Vec<usize> = row
            .tap_lanes()
            .into_iter()
            .filter(|&l| !active.iter().any(|&i| candidates[i].lane == l && candidates[i].start == pos))
            .collect();

        let total = fixed + active.len() + taps.len();
        if total <= cap && active.len() <= hold_limit {
            continue;
        }

        let (new, mut ongoing): (Vec<usize>, Vec<usize>) =
            active.iter().partition(|&&i| candidates[i].start == pos);

        let time = timing.time_at_beat(beat);
        let energy = sampler.energy_in_range(time, time + params.energy_window_secs);

        let by_remaining = |list: &mut Vec<usize>, candidates: &[HoldCandidate]| {
            list.sort_by(|&a, &b| {
                candidates[b]
                    .remaining(beat)
                    .partial_cmp(&candidates[a].remaining(beat))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        };

        if energy > params.energy_threshold {
            log::debug!("row {:?}: energy {:.2} favours taps", pos, energy);
            for &i in &new {
                candidates[i].status = HoldStatus::Rejected;
                report.rejected += 1;
            }
            let slots = hold_limit.min(cap.saturating_sub(fixed + taps.len() + new.len()));
            by_remaining(&mut ongoing, candidates);
            for &i in ongoing.iter().skip(slots) {
                candidates[i].truncate(pos, beat);
                report.truncated += 1;
            }
        } else {
            log::debug!("row {:?}: energy {:.2} favours holds", pos, energy);
            let mut all = active.clone();
            by_remaining(&mut all, candidates);
            let keep = hold_limit.min(cap.saturating_sub(fixed));

            for &i in all.iter().skip(keep) {
                if candidates[i].start == pos {
                    candidates[i].status = HoldStatus::Rejected;
                    report.rejected += 1;
                    if clear_tap(grid, pos, candidates[i].lane) {
                        report.taps_removed += 1;
                    }
                } else {
                    candidates[i].truncate(pos, beat);
                    report.truncated += 1;
                }
            }

            let kept = all.len().min(keep);
            let tap_slots = cap.saturating_sub(fixed + kept);
            for &lane in taps.iter().skip(tap_slots) {
                if clear_tap(grid, pos, lane) {
                    report.taps_removed += 1;
                }
            }
        }
    }
}

/// Write accepted candidates into the grid. Mines inside a hold are kept;
/// same-lane taps after the head are absorbed and counted as removed.
pub fn materialize(grid: &mut NoteGrid, candidates: &[HoldCandidate], report: &mut HoldReport) {
    let positions: Vec<GridPos> = grid.positions().into_iter().map(|(p, _)| p).collect();

    for c in candidates.iter().filter(|c| c.is_accepted()) {
        for &pos in positions.iter().filter(|&&p| p >= c.start && p <= c.end) {
            let Some(row) = grid.row_mut(pos) else { continue };
            let symbol = if pos == c.start {
                LaneSymbol::HoldHead
            } else if pos == c.end {
                LaneSymbol::HoldTail
            } else if row.get(c.lane) == LaneSymbol::Mine {
                continue;
            } else {
                LaneSymbol::HoldBody
            };
            if pos != c.start && row.get(c.lane) == LaneSymbol::Tap {
                report.taps_removed += 1;
            }
            row.set(c.lane, symbol);
        }
        report.accepted += 1;
    }
}

/// Identify, arbitrate and write holds.
pub fn place_holds(
    grid: &mut NoteGrid,
    timing: &TimingGrid,
    sampler: &FeatureSampler,
    params: &HoldParams,
) -> HoldReport {
    let mut candidates = identify_candidates(grid, timing, sampler.hold_segments(), params);
    let mut report = HoldReport {
        candidates: candidates.len(),
        ..Default::default()
    };
    if candidates.is_empty() {
        return report;
    }

    resolve_conflicts(grid, &mut candidates, timing, sampler, params, &mut report);
    materialize(grid, &candidates, &mut report);

    log::debug!(
        "holds: {} candidates, {} accepted, {} truncated, {} taps removed",
        report.candidates,
        report.accepted,
        report.truncated,
        report.taps_removed
    );
    report
}
