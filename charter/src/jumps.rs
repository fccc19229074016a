use crate::config::{JumpEnergy, JumpParams};
use crate::features::FeatureSampler;
use crate::grid::{GridPos, LaneSymbol, NoteGrid, LANES};
use crate::lane_assigner::LaneAssigner;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;

const EPSILON: f64 = 0.01;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct JumpReport {
    pub candidates: usize,
    pub promoted: usize,
    pub rejected_unsafe: usize,
}

#[derive(Clone, Debug)]
struct Candidate {
    pos: GridPos,
    beat: f64,
    lane: usize,
    energy: f64,
    is_downbeat: bool,
}

fn collect_candidates(grid: &NoteGrid, sampler: &FeatureSampler, params: &JumpParams) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for (pos, beat) in grid.positions() {
        let Some(row) = grid.row(pos) else { continue };
        let taps = row.tap_lanes();
        if row.active_inputs() != 1 || taps.len() != 1 {
            continue;
        }

        let Some(stat) = sampler.stat(beat.round_ties_even().max(0.0) as usize) else {
            continue;
        };
        if !sampler.bass_passes(stat.time, params.bass_gate_ratio) {
            continue;
        }

        let energy = match params.energy {
            JumpEnergy::Rms => stat.rms,
            JumpEnergy::Bass => stat.bass_rms,
        };
        candidates.push(Candidate {
            pos,
            beat,
            lane: taps[0],
            energy,
            is_downbeat: stat.is_downbeat && (beat - beat.round()).abs() < EPSILON,
        });
    }

    candidates
}

/// Whether doubling the note at `beat` keeps the surrounding cluster playable.
///
/// With a note half a beat before or after, the resulting two-row cluster
/// needs an empty stretch on at least one side.
pub fn is_jump_safe(grid: &NoteGrid, beat: f64) -> bool {
    let has_prev = grid.has_note_at(beat - 0.5);
    let has_next = grid.has_note_at(beat + 0.5);

    if has_prev {
        let pause_before = grid.is_range_empty(beat - 1.5, beat - 0.5 - EPSILON);
        let pause_after = grid.is_range_empty(beat + EPSILON, beat + 1.0);
        if !(pause_before || pause_after) {
            return false;
        }
    }

    if has_next {
        let pause_before = grid.is_range_empty(beat - 1.0, beat - EPSILON);
        let pause_after = grid.is_range_empty(beat + 0.5 + EPSILON, beat + 1.5);
        if !(pause_before || pause_after) {
            return false;
        }
    }

    true
}

/// Promote selected single taps to two-lane jumps.
pub fn place_jumps<R: Rng + ?Sized>(
    grid: &mut NoteGrid,
    sampler: &FeatureSampler,
    params: &JumpParams,
    lanes: &mut LaneAssigner,
    rng: &mut R,
) -> JumpReport {
    let candidates = collect_candidates(grid, sampler, params);
    let mut report = JumpReport {
        candidates: candidates.len(),
        ..Default::default()
    };
    if candidates.is_empty() {
        return report;
    }

    // promoted position -> lane already holding the tap
    let mut chosen: BTreeMap<GridPos, usize> = BTreeMap::new();
    let mut consider = |c: &Candidate, report: &mut JumpReport| {
        if params.safety_check && !is_jump_safe(grid, c.beat) {
            report.rejected_unsafe += 1;
            return;
        }
        chosen.insert(c.pos, c.lane);
    };

    let mut downbeats: Vec<&Candidate> = candidates.iter().filter(|c| c.is_downbeat).collect();
    downbeats.sort_by(|a, b| {
        b.energy
            .partial_cmp(&a.energy)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let quota = (downbeats.len() as f64 * params.downbeat_fraction).floor() as usize;
    for c in downbeats.into_iter().take(quota) {
        consider(c, &mut report);
    }

    if let Some(multiplier) = params.offbeat_multiplier {
        let mean = candidates.iter().map(|c| c.energy).sum::<f64>() / candidates.len() as f64;
        let threshold = mean * multiplier;
        for c in candidates.iter().filter(|c| !c.is_downbeat && c.energy > threshold) {
            consider(c, &mut report);
        }
    }

    for (pos, lane) in chosen {
        let extra = if params.mirror_lane {
            Some(LANES - 1 - lane)
        } else {
            lanes.assign_avoiding(rng, &[lane])
        };

        if let (Some(extra), Some(row)) = (extra, grid.row_mut(pos)) {
            if row.get(extra) == LaneSymbol::Empty && row.note_count() < 2 {
                row.set(extra, LaneSymbol::Tap);
                report.promoted += 1;
            }
        }
    }

    log::debug!(
        "jumps: {} candidates, {} promoted, {} unsafe",
        report.candidates,
        report.promoted,
        report.rejected_unsafe
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Difficulty, TierConfig};
    use crate::features::{BeatStat, FeatureSet};
    use crate::grid::Row;
    use crate::lane_assigner::LaneAssignmentStrategy;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn stats(beats: usize, rms: impl Fn(usize) -> f64) -> FeatureSet {
        FeatureSet {
            beat_stats: (0..beats)
                .map(|i| BeatStat {
                    beat_index: i,
                    time: i as f64 * 0.5,
                    is_downbeat: i % 4 == 0,
                    rms: rms(i),
                    bass_rms: rms(i),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn run(grid: &mut NoteGrid, set: &FeatureSet, params: &JumpParams) -> JumpReport {
        let mut rng = StdRng::seed_from_u64(2);
        let mut lanes = LaneAssigner::new(LaneAssignmentStrategy::Random);
        place_jumps(grid, &set.sampler(), params, &mut lanes, &mut rng)
    }

    #[test]
    fn test_top_downbeats_promoted() {
        // one tap per beat, downbeats every 4 beats with rising energy
        let rows: Vec<Row> = (0..40).map(|i| Row::single(i % 4)).collect();
        let mut grid = NoteGrid::from_rows(rows, 4);
        let set = stats(40, |i| i as f64 / 40.0);
        let params = JumpParams {
            offbeat_multiplier: None,
            safety_check: false,
            ..TierConfig::for_difficulty(Difficulty::Medium).jumps
        };

        let report = run(&mut grid, &set, &params);
        assert_eq!(report.candidates, 40);
        assert_eq!(report.promoted, 4);
        // the strongest downbeats are the last four measures
        for m in 0..10 {
            let jump = grid.row(GridPos::new(m, 0)).unwrap().is_jump();
            assert_eq!(jump, m >= 6, "measure {}", m);
        }
        assert!(grid.max_active_inputs() <= 2);
    }

    #[test]
    fn test_easy_mirrors_lane() {
        let mut rows = vec![Row::empty(); 8];
        rows[0] = Row::single(1);
        rows[4] = Row::single(0);
        let mut grid = NoteGrid::from_rows(rows, 4);
        let set = stats(8, |i| if i == 4 { 1.0 } else { 0.1 });
        let params = JumpParams {
            downbeat_fraction: 0.5,
            ..TierConfig::for_difficulty(Difficulty::Easy).jumps
        };

        run(&mut grid, &set, &params);
        let row = grid.row(GridPos::new(1, 0)).unwrap();
        assert_eq!(row.note_lanes(), vec![0, 3]);
        assert!(!grid.row(GridPos::new(0, 0)).unwrap().is_jump());
    }

    #[test]
    fn test_unsafe_cluster_rejected() {
        // continuous eighth-note stream from beat 2 to beat 6
        let mut rows = vec![Row::empty(); 16];
        for r in 4..=12 {
            rows[r] = Row::single(r % 4);
        }
        let mut grid = NoteGrid::from_rows(rows, 8);
        assert!(!is_jump_safe(&grid, 4.0));

        let set = stats(8, |_| 1.0);
        let params = JumpParams {
            downbeat_fraction: 1.0,
            offbeat_multiplier: None,
            ..TierConfig::for_difficulty(Difficulty::Hard).jumps
        };
        let report = run(&mut grid, &set, &params);
        assert_eq!(report.promoted, 0);
        assert_eq!(report.rejected_unsafe, 1);
    }

    #[test]
    fn test_isolated_pair_is_safe() {
        let mut rows = vec![Row::empty(); 16];
        rows[8] = Row::single(0); // beat 4
        rows[9] = Row::single(1); // beat 4.5
        let grid = NoteGrid::from_rows(rows, 8);
        assert!(is_jump_safe(&grid, 4.0));
        assert!(is_jump_safe(&grid, 4.5));
    }

    #[test]
    fn test_strong_offbeat_promoted() {
        let rows: Vec<Row> = (0..8).map(|i| Row::single(i % 4)).collect();
        let mut grid = NoteGrid::from_rows(rows, 4);
        let set = stats(8, |i| if i == 6 { 2.0 } else { 0.2 });
        let params = JumpParams {
            downbeat_fraction: 0.0,
            safety_check: false,
            ..TierConfig::for_difficulty(Difficulty::Hard).jumps
        };

        let report = run(&mut grid, &set, &params);
        assert_eq!(report.promoted, 1);
        assert!(grid.row(GridPos::new(1, 2)).unwrap().is_jump());
    }

    #[test]
    fn test_half_beat_reads_even_neighbour() {
        // taps on the "and" of beats 0, 2 and 6; only beat 2 is loud
        let mut rows = vec![Row::empty(); 16];
        rows[1] = Row::single(0);
        rows[5] = Row::single(1);
        rows[13] = Row::single(2);
        let mut grid = NoteGrid::from_rows(rows, 8);
        let set = stats(8, |i| if i == 2 { 2.0 } else { 0.2 });
        let params = JumpParams {
            downbeat_fraction: 0.0,
            safety_check: false,
            ..TierConfig::for_difficulty(Difficulty::Hard).jumps
        };

        // beat 2.5 ties to stat 2, not 3
        let report = run(&mut grid, &set, &params);
        assert_eq!(report.promoted, 1);
        assert!(grid.row(GridPos::new(0, 5)).unwrap().is_jump());
    }
}
