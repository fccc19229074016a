use crate::config::TunerParams;
use crate::grid::NoteGrid;
use crate::lane_assigner::LaneAssigner;
use crate::placement::OffbeatLayer;
use rand::Rng;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TuningReport {
    pub iterations: usize,
    pub ratio: f64,
    pub sensitivity: f64,
    pub converged: bool,
}

/// Off-beat note rows divided by on-beat note rows.
///
/// Even rows of a measure are on-beat. Zero when there are no on-beat notes.
pub fn offbeat_ratio(grid: &NoteGrid) -> f64 {
    let (mut on, mut off) = (0usize, 0usize);
    for measure in grid.measures() {
        for (i, row) in measure.rows.iter().enumerate() {
            if row.has_note() {
                if i % 2 == 0 {
                    on += 1;
                } else {
                    off += 1;
                }
            }
        }
    }
    if on == 0 {
        0.0
    } else {
        off as f64 / on as f64
    }
}

/// Regenerate the off-beat layer, nudging sensitivity toward `target`.
///
/// Stops once the ratio is within tolerance or after `max_iterations`
/// attempts, and returns the closest attempt seen.
pub fn tune<R: Rng + ?Sized>(
    layer: &OffbeatLayer,
    target: f64,
    params: &TunerParams,
    lanes: &mut LaneAssigner,
    rng: &mut R,
) -> (NoteGrid, TuningReport) {
    let mut sensitivity = params.initial_sensitivity;
    let mut best: Option<(NoteGrid, f64, f64)> = None;
    let mut best_diff = f64::INFINITY;
    let mut iterations = 0;

    for _ in 0..params.max_iterations.max(1) {
        iterations += 1;
        let grid = layer.generate(sensitivity, lanes, rng);
        let ratio = offbeat_ratio(&grid);
        let diff = (ratio - target).abs();

        log::debug!(
            "tuning pass {}: sensitivity {:.3} -> ratio {:.3} (target {:.3})",
            iterations,
            sensitivity,
            ratio,
            target
        );

        if diff < best_diff {
            best_diff = diff;
            best = Some((grid, ratio, sensitivity));
        }
        if diff <= params.tolerance {
            break;
        }

        sensitivity += (target - ratio) * params.gain;
        sensitivity = sensitivity.clamp(params.min_sensitivity, params.max_sensitivity);
    }

    let (grid, ratio, sensitivity) = match best {
        Some(best) => best,
        None => (NoteGrid::default(), 0.0, sensitivity),
    };

    let report = TuningReport {
        iterations,
        ratio,
        sensitivity,
        converged: best_diff <= params.tolerance,
    };
    (grid, report)
}
