use crate::error::{ChartError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tempo events closer than this (seconds) are merged before quantization.
pub const MIN_EVENT_SPACING: f64 = 0.1;

/// Seconds trimmed from the end of the track when laying out beats.
pub const SONG_END_MARGIN: f64 = 1.5;

#[derive(Clone, Debug, PartialEq)]
pub struct TempoSegment {
    pub start_beat: f64,
    pub bpm: f64,
    pub duration_beats: Option<f64>, // None = runs to the end of the track
}

impl TempoSegment {
    pub fn seconds_per_beat(&self) -> f64 {
        60.0 / self.bpm
    }

    pub fn end_beat(&self) -> Option<f64> {
        self.duration_beats.map(|d| self.start_beat + d)
    }
}

/// Maps beat positions to seconds across a sequence of tempo segments.
///
/// Beat 0 sits at `-offset` seconds, matching the chart header convention.
#[derive(Clone, Debug, PartialEq)]
pub struct TimingGrid {
    offset: f64,
    segments: Vec<TempoSegment>,
}

impl TimingGrid {
    pub fn new(offset: f64, segments: Vec<TempoSegment>) -> Result<Self> {
        if segments.is_empty() {
            return Err(ChartError::InvalidTiming("no tempo segments".into()));
        }

        for (i, seg) in segments.iter().enumerate() {
            if !(seg.bpm.is_finite() && seg.bpm > 0.0) {
                return Err(ChartError::InvalidTiming(format!(
                    "segment {} has non-positive tempo {}",
                    i, seg.bpm
                )));
            }

            let is_last = i + 1 == segments.len();
            match (seg.duration_beats, is_last) {
                (None, false) => {
                    return Err(ChartError::InvalidTiming(format!(
                        "segment {} is open-ended but not last",
                        i
                    )))
                }
                (Some(d), _) if d <= 0.0 => {
                    return Err(ChartError::InvalidTiming(format!(
                        "segment {} has empty duration",
                        i
                    )))
                }
                _ => {}
            }

            if let Some(next) = segments.get(i + 1) {
                if next.start_beat <= seg.start_beat {
                    return Err(ChartError::InvalidTiming(format!(
                        "segment {} starts at {} which is not after {}",
                        i + 1,
                        next.start_beat,
                        seg.start_beat
                    )));
                }
                let end = seg.end_beat().unwrap_or(f64::INFINITY);
                if (end - next.start_beat).abs() > 1e-6 {
                    return Err(ChartError::InvalidTiming(format!(
                        "segment {} ends at beat {} but segment {} starts at {}",
                        i,
                        end,
                        i + 1,
                        next.start_beat
                    )));
                }
            }
        }

        Ok(TimingGrid { offset, segments })
    }

    /// Constant tempo from beat 0.
    pub fn constant(offset: f64, bpm: f64) -> Result<Self> {
        Self::new(
            offset,
            vec![TempoSegment {
                start_beat: 0.0,
                bpm,
                duration_beats: None,
            }],
        )
    }

    /// Build from `(beat, bpm)` pairs as listed in a chart header.
    pub fn from_bpm_changes(offset: f64, changes: &[(f64, f64)]) -> Result<Self> {
        let mut sorted = changes.to_vec();
        sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let segments = sorted
            .iter()
            .enumerate()
            .map(|(i, &(beat, bpm))| TempoSegment {
                start_beat: beat,
                bpm,
                duration_beats: sorted.get(i + 1).map(|next| next.0 - beat),
            })
            .collect();

        Self::new(offset, segments)
    }

    /// Build from raw `(time, bpm)` tempo events, snapping every closed segment
    /// to a whole number of beats.
    ///
    /// Each segment's tempo is recomputed so the rounded beat count fills the
    /// observed wall-clock span exactly. The last event's tempo is kept as given.
    pub fn from_tempo_events(offset: f64, events: &[(f64, f64)]) -> Result<Self> {
        let mut sorted = events.to_vec();
        sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        // Merge near-duplicate taps: keep the earlier time, take the later tempo.
        let mut merged: Vec<(f64, f64)> = Vec::with_capacity(sorted.len());
        for (time, bpm) in sorted {
            match merged.last_mut() {
                Some(last) if time - last.0 < MIN_EVENT_SPACING => last.1 = bpm,
                _ => merged.push((time, bpm)),
            }
        }

        let Some(&(_, last_bpm)) = merged.last() else {
            return Err(ChartError::InvalidTiming("no tempo events".into()));
        };

        let mut segments = Vec::with_capacity(merged.len());
        let mut current_beat = 0.0;

        for pair in merged.windows(2) {
            let (t_start, bpm_est) = pair[0];
            let (t_end, _) = pair[1];
            let dt = t_end - t_start;

            let beats = (dt * bpm_est / 60.0).round().max(1.0);
            let corrected_bpm = beats * 60.0 / dt;

            log::debug!(
                "tempo segment at {:.3}s: {:.3} bpm -> {} beats @ {:.3} bpm",
                t_start,
                bpm_est,
                beats,
                corrected_bpm
            );

            segments.push(TempoSegment {
                start_beat: current_beat,
                bpm: corrected_bpm,
                duration_beats: Some(beats),
            });
            current_beat += beats;
        }

        segments.push(TempoSegment {
            start_beat: current_beat,
            bpm: last_bpm,
            duration_beats: None,
        });

        Self::new(offset, segments)
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn segments(&self) -> &[TempoSegment] {
        &self.segments
    }

    /// `(beat, bpm)` pairs for the chart header.
    pub fn bpm_changes(&self) -> Vec<(f64, f64)> {
        self.segments.iter().map(|s| (s.start_beat, s.bpm)).collect()
    }

    /// Seconds at which `beat` occurs.
    pub fn time_at_beat(&self, beat: f64) -> f64 {
        let mut time = -self.offset;

        for seg in &self.segments {
            match seg.end_beat() {
                Some(end) if beat >= end => {
                    time += (end - seg.start_beat) * seg.seconds_per_beat();
                }
                _ => return time + (beat - seg.start_beat) * seg.seconds_per_beat(),
            }
        }

        time
    }

    /// Beat position at `time` seconds; inverse of [`time_at_beat`](Self::time_at_beat).
    pub fn beat_at_time(&self, time: f64) -> f64 {
        let mut seg_time = -self.offset;

        for seg in &self.segments {
            if let Some(duration) = seg.duration_beats {
                let seg_seconds = duration * seg.seconds_per_beat();
                if time >= seg_time + seg_seconds {
                    seg_time += seg_seconds;
                    continue;
                }
            }
            return seg.start_beat + (time - seg_time) / seg.seconds_per_beat();
        }

        // Only reachable if every segment is closed, which `new` rejects.
        self.segments
            .last()
            .and_then(|s| s.end_beat())
            .unwrap_or(0.0)
    }

    /// Timestamps of integer beats from beat 0 until `song_duration - margin`.
    pub fn beat_times(&self, song_duration: f64, margin: f64) -> Vec<f64> {
        let end = (song_duration - margin).max(0.0);
        let mut times = Vec::new();
        let mut beat = 0.0;

        loop {
            let t = self.time_at_beat(beat);
            if t >= end {
                break;
            }
            times.push(t);
            beat += 1.0;
        }

        times
    }
}

/// Raw tempo detection output: the first-beat offset and `(time, bpm)` events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TempoMap {
    pub offset: f64,
    pub bpm_changes: Vec<(f64, f64)>,
}

impl TempoMap {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ChartError::MissingInput(path.to_path_buf()));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    pub fn to_grid(&self) -> Result<TimingGrid> {
        TimingGrid::from_tempo_events(self.offset, &self.bpm_changes)
    }
}
