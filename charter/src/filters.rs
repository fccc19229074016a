//! Post-filters applied to finished charts: silence muting and intro/outro trim.

use crate::config::{MuteParams, TrimParams};
use crate::features::FeatureSampler;
use crate::grid::{LaneSymbol, NoteGrid, Row};
use serde::Serialize;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FilterReport {
    pub rows_cleared: usize,
    pub holds_repaired: usize,
}

fn clear_rows(grid: &mut NoteGrid, mut should_clear: impl FnMut(f64) -> bool) -> FilterReport {
    let mut report = FilterReport::default();

    for (pos, beat) in grid.positions() {
        if !should_clear(beat) {
            continue;
        }
        if let Some(row) = grid.row_mut(pos) {
            // bodies are re-derived by the repair below
            if row.0.iter().any(|&s| s != LaneSymbol::Empty && s != LaneSymbol::HoldBody) {
                *row = Row::empty();
                report.rows_cleared += 1;
            }
        }
    }

    if report.rows_cleared > 0 {
        report.holds_repaired = grid.repair_holds();
    }
    report
}

/// RMS below which a beat counts as silent.
pub fn silence_threshold(sampler: &FeatureSampler, params: &MuteParams) -> f64 {
    sampler.mean_rms() * params.ratio
}

/// Clear every row whose beat is quieter than the silence threshold.
pub fn mute_silence(grid: &mut NoteGrid, sampler: &FeatureSampler, params: &MuteParams) -> FilterReport {
    if sampler.beat_count() == 0 {
        return FilterReport::default();
    }
    let threshold = silence_threshold(sampler, params);
    let report = clear_rows(grid, |beat| sampler.rms_at_beat(beat) < threshold);
    log::debug!(
        "mute: threshold {:.4}, {} rows cleared",
        threshold,
        report.rows_cleared
    );
    report
}

/// Beats bounding the audible part of the track.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActiveRange {
    pub first_active: f64,
    pub fade_out_start: f64,
    pub last_active: f64,
}

pub fn active_range(sampler: &FeatureSampler, params: &TrimParams) -> ActiveRange {
    let stats = sampler.beat_stats();
    let window = params.window_beats.max(1);

    let first_active = stats
        .windows(window)
        // the last full window is never inspected
        .take(stats.len().saturating_sub(window))
        .find(|w| w.iter().map(|b| b.rms).sum::<f64>() / window as f64 > params.silence_threshold)
        .map(|w| w[0].beat_index as f64)
        .unwrap_or(0.0);

    let last_active = stats
        .iter()
        .rev()
        .find(|b| b.rms > params.silence_threshold)
        .map(|b| b.beat_index as f64)
        .unwrap_or(f64::INFINITY);

    let fade_out_start = stats
        .iter()
        .rev()
        .filter(|b| (b.beat_index as f64) <= last_active)
        .find(|b| b.rms > params.low_volume_threshold)
        .map(|b| b.beat_index as f64)
        .unwrap_or(f64::INFINITY);

    ActiveRange {
        first_active,
        fade_out_start,
        last_active,
    }
}

/// Clear notes before the track becomes audible and after it goes silent;
/// during the fade-out only on-beat rows survive.
pub fn trim_intro_end(grid: &mut NoteGrid, sampler: &FeatureSampler, params: &TrimParams) -> FilterReport {
    if sampler.beat_count() == 0 {
        return FilterReport::default();
    }
    let range = active_range(sampler, params);
    log::debug!(
        "trim: first active {}, fade out {}, last active {}",
        range.first_active,
        range.fade_out_start,
        range.last_active
    );

    clear_rows(grid, |beat| {
        if beat < range.first_active || beat > range.last_active {
            true
        } else if beat > range.fade_out_start {
            (beat - beat.round()).abs() >= 0.001
        } else {
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{BeatStat, FeatureSet};
    use crate::grid::GridPos;

    fn features(rms: &[f64]) -> FeatureSet {
        FeatureSet {
            beat_stats: rms
                .iter()
                .enumerate()
                .map(|(i, &r)| BeatStat {
                    beat_index: i,
                    time: i as f64 * 0.5,
                    rms: r,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn eighth_grid(beats: usize) -> NoteGrid {
        NoteGrid::from_rows((0..beats * 2).map(|i| Row::single(i % 4)).collect(), 8)
    }

    #[test]
    fn test_mute_clears_quiet_beats() {
        // mean 0.4875, threshold about 0.073
        let mut rms = vec![0.55; 8];
        rms[3] = 0.05;
        let set = features(&rms);
        let mut grid = eighth_grid(8);

        let report = mute_silence(&mut grid, &set.sampler(), &MuteParams::default());
        assert_eq!(report.rows_cleared, 2);
        assert!(!grid.has_note_at(3.0));
        assert!(!grid.has_note_at(3.5));
        assert!(grid.has_note_at(4.0));
    }

    #[test]
    fn test_mute_is_idempotent() {
        let rms: Vec<f64> = (0..16).map(|i| if i % 5 == 2 { 0.01 } else { 0.4 }).collect();
        let set = features(&rms);
        let mut grid = eighth_grid(16);
        // a hold crossing a silent beat
        *grid.row_mut(GridPos::new(0, 2)).unwrap() = Row::parse("0020").unwrap();
        *grid.row_mut(GridPos::new(1, 2)).unwrap() = Row::parse("0030").unwrap();
        grid.repair_holds();

        let sampler = set.sampler();
        let params = MuteParams::default();
        mute_silence(&mut grid, &sampler, &params);
        let once = grid.clone();
        let again = mute_silence(&mut grid, &sampler, &params);
        assert_eq!(grid, once);
        assert_eq!(again.rows_cleared, 0);
        assert!(grid.validate_holds().is_ok());
    }

    #[test]
    fn test_mute_without_stats_is_noop() {
        let set = features(&[]);
        let mut grid = eighth_grid(4);
        let before = grid.clone();
        mute_silence(&mut grid, &set.sampler(), &MuteParams::default());
        assert_eq!(grid, before);
    }

    #[test]
    fn test_active_range() {
        let rms = [0.0, 0.0, 0.1, 0.3, 0.3, 0.3, 0.3, 0.1, 0.05, 0.0, 0.0];
        let set = features(&rms);
        let range = active_range(&set.sampler(), &TrimParams::default());
        // the very first window already averages 0.1
        assert_eq!(range.first_active, 0.0);
        assert_eq!(range.last_active, 8.0);
        assert_eq!(range.fade_out_start, 6.0);
    }

    #[test]
    fn test_trim_intro_and_fade_out() {
        let rms = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.01, 0.3, 0.3, 0.3, 0.3, 0.3, 0.1, 0.1, 0.0, 0.0];
        let set = features(&rms);
        let mut grid = eighth_grid(16);

        let range = active_range(&set.sampler(), &TrimParams::default());
        assert_eq!(range.first_active, 4.0);
        assert_eq!(range.fade_out_start, 11.0);
        assert_eq!(range.last_active, 13.0);

        trim_intro_end(&mut grid, &set.sampler(), &TrimParams::default());
        assert!(!grid.has_note_at(3.5));
        assert!(grid.has_note_at(4.0));
        assert!(grid.has_note_at(10.5));
        assert!(grid.has_note_at(12.0));
        assert!(!grid.has_note_at(12.5));
        assert!(grid.has_note_at(13.0));
        assert!(!grid.has_note_at(14.0));
    }
}
