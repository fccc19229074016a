//! Note placement: the quarter-note foundation layer and the off-beat layer
//! laid on top of it.

use crate::config::{PrimaryParams, SecondaryParams};
use crate::features::{local_average, FeatureSampler};
use crate::grid::{NoteGrid, Row};
use crate::lane_assigner::LaneAssigner;
use rand::Rng;

/// Rows per measure of the foundation layer.
pub const PRIMARY_ROWS: usize = 4;
/// Rows per measure once the off-beat layer is applied.
pub const SECONDARY_ROWS: usize = 8;

/// Seconds after the last beat used as its half-beat when no next beat exists.
const TAIL_HALF_BEAT_SECS: f64 = 0.3;

/// Build the foundation layer: one row per analyzed beat.
///
/// A beat gets a note when it is a downbeat, when the preceding rest run hit
/// `rest_cap`, or when its onset beats the local average scaled by the tier
/// threshold.
pub fn place_primary<R: Rng + ?Sized>(
    sampler: &FeatureSampler,
    params: &PrimaryParams,
    lanes: &mut LaneAssigner,
    rng: &mut R,
) -> NoteGrid {
    let onsets = sampler.onset_series();
    let mut rows = Vec::with_capacity(onsets.len());
    let mut rests = 0;

    for (i, stat) in sampler.beat_stats().iter().enumerate() {
        let is_note = stat.is_downbeat
            || rests >= params.rest_cap
            || stat.onset_strength > local_average(&onsets, i) * params.threshold;

        if is_note {
            rows.push(Row::single(lanes.assign(rng)));
            rests = 0;
        } else {
            rows.push(Row::empty());
            rests += 1;
        }
    }

    let placed = rows.iter().filter(|r| r.has_note()).count();
    log::debug!("foundation layer: {} notes over {} beats", placed, rows.len());

    NoteGrid::from_rows(rows, PRIMARY_ROWS)
}

/// Off-beat layer generator. Holds everything that does not depend on
/// sensitivity so the tuner can regenerate cheaply.
pub struct OffbeatLayer<'a> {
    sampler: &'a FeatureSampler<'a>,
    params: &'a SecondaryParams,
    primary: Vec<Row>,
    local_avgs: Vec<f64>,
    global_avg: f64,
}

impl<'a> OffbeatLayer<'a> {
    /// `primary` is the quarter-note row sequence the layer is built around.
    pub fn new(sampler: &'a FeatureSampler<'a>, params: &'a SecondaryParams, primary: Vec<Row>) -> Self {
        let energies: Vec<f64> = (0..=primary.len())
            .map(|i| {
                sampler
                    .stat(i)
                    .map(|s| sampler.onset_at_time(s.time))
                    .unwrap_or(0.0)
            })
            .collect();
        let local_avgs = (0..energies.len())
            .map(|i| local_average(&energies, i))
            .collect();

        OffbeatLayer {
            sampler,
            params,
            global_avg: sampler.global_onset_mean(),
            primary,
            local_avgs,
        }
    }

    pub fn primary(&self) -> &[Row] {
        &self.primary
    }

    fn half_beat_time(&self, i: usize) -> Option<f64> {
        let current = self.sampler.stat(i)?;
        Some(match self.sampler.stat(i + 1) {
            Some(next) => (current.time + next.time) / 2.0,
            None => current.time + TAIL_HALF_BEAT_SECS,
        })
    }

    /// Interleave the primary rows with generated off-beat rows.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        sensitivity: f64,
        lanes: &mut LaneAssigner,
        rng: &mut R,
    ) -> NoteGrid {
        let p = self.params;
        let total = self.primary.len();
        let mut rows = Vec::with_capacity(total * 2);
        let mut streak = 0usize;
        let mut since_last = 0usize;

        for i in 0..total {
            let current = self.primary[i];
            rows.push(current);

            let is_note = current.has_note();
            streak = if is_note { streak + 1 } else { 0 };

            let Some(&next) = self.primary.get(i + 1) else {
                rows.push(Row::empty());
                continue;
            };
            let is_next_note = next.has_note();

            if p.avoid_jump_adjacency && (current.is_jump() || next.is_jump()) {
                rows.push(Row::empty());
                streak = 0;
                since_last += 1;
                continue;
            }

            // stream cap
            if is_next_note && streak >= p.max_stream {
                rows.push(Row::empty());
                streak = 0;
                since_last += 1;
                continue;
            }

            let Some(t_mid) = self.half_beat_time(i) else {
                rows.push(Row::empty());
                since_last += 1;
                continue;
            };

            if !self.sampler.bass_passes(t_mid, p.bass_floor_ratio) {
                rows.push(Row::empty());
                since_last += 1;
                continue;
            }

            let energy = self.sampler.onset_at_time(t_mid);
            let floor = self.global_avg * p.floor_ratio;
            let threshold = if sensitivity > 0.0 {
                floor.max(self.local_avgs[i] * p.local_ratio) / sensitivity
            } else {
                0.0
            };

            let is_bridge = is_note && is_next_note;
            let is_synco = !is_note && is_next_note;

            let mut place = (is_bridge && energy > threshold)
                || (is_synco && energy > threshold * p.syncopation_factor);

            if !place && since_last > p.drought_limit && (is_note || is_next_note) {
                place = true;
            }

            let lane = if place {
                let mut taken = current.note_lanes();
                taken.extend(next.note_lanes());
                lanes.assign_avoiding(rng, &taken)
            } else {
                None
            };

            match lane {
                Some(lane) => {
                    rows.push(Row::single(lane));
                    streak += 1;
                    since_last = 0;
                }
                None => {
                    rows.push(Row::empty());
                    streak = 0;
                    since_last += 1;
                }
            }
        }

        NoteGrid::from_rows(rows, SECONDARY_ROWS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{BeatStat, FeatureSet};
    use crate::lane_assigner::LaneAssignmentStrategy;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn features(onsets: &[f64], downbeat_every: Option<usize>) -> FeatureSet {
        FeatureSet {
            beat_stats: onsets
                .iter()
                .enumerate()
                .map(|(i, &onset)| BeatStat {
                    beat_index: i,
                    time: i as f64 * 0.5,
                    is_downbeat: downbeat_every.map(|n| i % n == 0).unwrap_or(false),
                    onset_strength: onset,
                    rms: 0.5,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn primary_notes(set: &FeatureSet, params: &PrimaryParams) -> Vec<bool> {
        let mut rng = StdRng::seed_from_u64(1);
        let mut lanes = LaneAssigner::new(LaneAssignmentStrategy::Random);
        place_primary(&set.sampler(), params, &mut lanes, &mut rng)
            .primary_rows()
            .iter()
            .map(|r| r.has_note())
            .collect()
    }

    #[test]
    fn test_weak_offbeats_skipped_under_easy_threshold() {
        let onsets: Vec<f64> = (0..16).map(|i| if i % 4 == 0 { 0.9 } else { 0.1 }).collect();
        let set = features(&onsets, Some(4));
        let params = PrimaryParams {
            threshold: 0.6,
            rest_cap: usize::MAX,
        };
        let notes = primary_notes(&set, &params);
        for (i, &n) in notes.iter().enumerate() {
            assert_eq!(n, i % 4 == 0, "beat {}", i);
        }
    }

    #[test]
    fn test_stronger_offbeats_placed_under_easy_threshold() {
        let onsets: Vec<f64> = (0..16).map(|i| if i % 4 == 0 { 0.9 } else { 0.4 }).collect();
        let set = features(&onsets, Some(4));
        let params = PrimaryParams {
            threshold: 0.6,
            rest_cap: usize::MAX,
        };
        assert!(primary_notes(&set, &params).iter().all(|&n| n));
    }

    #[test]
    fn test_rest_run_capped() {
        let set = features(&[0.0; 20], None);
        let notes = primary_notes(&set, &PrimaryParams::default());
        let mut run = 0;
        for n in notes {
            run = if n { 0 } else { run + 1 };
            assert!(run <= 2);
        }
    }

    #[test]
    fn test_primary_layout() {
        let set = features(&[0.5; 6], Some(4));
        let mut rng = StdRng::seed_from_u64(3);
        let mut lanes = LaneAssigner::new(LaneAssignmentStrategy::Random);
        let grid = place_primary(&set.sampler(), &PrimaryParams::default(), &mut lanes, &mut rng);
        assert_eq!(grid.len(), 2);
        assert_eq!(grid.measures()[1].resolution(), PRIMARY_ROWS);
        assert!(grid.flatten().iter().all(|r| r.note_count() <= 1));
    }

    fn secondary_grid(onsets: &[f64], params: &SecondaryParams, sensitivity: f64) -> NoteGrid {
        let set = features(onsets, Some(4));
        let sampler = set.sampler();
        let primary: Vec<Row> = (0..onsets.len()).map(|i| Row::single(i % 4)).collect();
        let layer = OffbeatLayer::new(&sampler, params, primary);
        let mut rng = StdRng::seed_from_u64(9);
        let mut lanes = LaneAssigner::new(LaneAssignmentStrategy::Random);
        layer.generate(sensitivity, &mut lanes, &mut rng)
    }

    #[test]
    fn test_offbeat_layer_keeps_primary_rows() {
        let grid = secondary_grid(&[0.5; 8], &SecondaryParams::default(), 1.0);
        assert_eq!(grid.len(), 2);
        assert_eq!(grid.measures()[0].resolution(), SECONDARY_ROWS);
        let flat = grid.flatten();
        for i in 0..8 {
            assert_eq!(flat[i * 2], Row::single(i % 4));
        }
        // nothing after the last beat
        assert!(flat[15].is_blank());
    }

    #[test]
    fn test_offbeat_stream_capped_and_lanes_avoid_neighbours() {
        let params = SecondaryParams {
            max_stream: 5,
            ..Default::default()
        };
        let grid = secondary_grid(&[0.8; 32], &params, 3.0);
        let flat = grid.flatten();

        let mut run = 0;
        let mut placed = 0;
        for (i, row) in flat.iter().enumerate() {
            run = if row.has_note() { run + 1 } else { 0 };
            assert!(run <= params.max_stream + 1, "stream too long ending at row {}", i);

            if i % 2 == 1 && row.has_note() {
                placed += 1;
                let lane = row.note_lanes()[0];
                assert!(!flat[i - 1].note_lanes().contains(&lane));
                if let Some(next) = flat.get(i + 1) {
                    assert!(!next.note_lanes().contains(&lane));
                }
            }
        }
        assert!(placed > 0);
    }

    #[test]
    fn test_higher_sensitivity_never_fewer_offbeats() {
        let onsets: Vec<f64> = (0..32).map(|i| 0.2 + (i % 5) as f64 * 0.15).collect();
        let params = SecondaryParams {
            drought_limit: usize::MAX,
            max_stream: usize::MAX,
            ..Default::default()
        };
        let count = |s| {
            secondary_grid(&onsets, &params, s)
                .flatten()
                .iter()
                .skip(1)
                .step_by(2)
                .filter(|r| r.has_note())
                .count()
        };
        assert!(count(3.0) >= count(0.5));
    }
}
