//! Beat-aligned analysis features and lookups over them.
//!
//! The analysis JSON is produced by an external analyzer; only the fields the
//! charting stages read are modelled here. Every lookup tolerates short or
//! missing series and falls back to a neutral value.

use crate::error::{ChartError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

/// Neutral energy returned when no data covers the requested window.
pub const NEUTRAL_ENERGY: f64 = 0.5;

/// Half-width of the local averaging window, in beats.
pub const LOCAL_WINDOW: usize = 4;

fn beat_index_from_number<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Ok(value.max(0.0).round() as usize)
}

/// Per-beat summary of the analyzed track.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BeatStat {
    #[serde(deserialize_with = "beat_index_from_number")]
    pub beat_index: usize,
    pub time: f64,
    #[serde(default)]
    pub is_downbeat: bool,
    #[serde(default, alias = "onset_env_max")]
    pub onset_strength: f64,
    #[serde(default, alias = "onset_env_mean")]
    pub onset_mean: f64,
    #[serde(default, alias = "rms_mean")]
    pub rms: f64,
    #[serde(default, alias = "low_freq_rms_mean")]
    pub bass_rms: f64,
    #[serde(default)]
    pub harmonic_rms: f64,
    #[serde(default)]
    pub percussive_rms: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub sr: f64,
    pub hop_length: f64,
}

/// Frame-rate series the per-beat stats were summarized from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawFeatures {
    pub metadata: FrameMetadata,
    #[serde(default)]
    pub onset_env: Vec<f64>,
    #[serde(default)]
    pub rms: Vec<f64>,
    #[serde(default)]
    pub low_freq_rms: Option<Vec<f64>>,
}

/// Sustained harmonic region detected by the analyzer, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HoldSegment {
    pub start: f64,
    pub end: f64,
}

impl HoldSegment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    #[serde(default)]
    pub beat_stats: Vec<BeatStat>,
    #[serde(default)]
    pub raw_features: Option<RawFeatures>,
    #[serde(default)]
    pub hold_segments: Vec<HoldSegment>,
}

impl FeatureSet {
    pub fn from_json(text: &str) -> Result<Self> {
        let set: FeatureSet = serde_json::from_str(text)?;
        set.validate()?;
        Ok(set)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ChartError::MissingInput(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let set = Self::from_json(&text)?;
        log::debug!(
            "loaded {} beat stats, {} hold segments from {}",
            set.beat_stats.len(),
            set.hold_segments.len(),
            path.display()
        );
        Ok(set)
    }

    fn validate(&self) -> Result<()> {
        if let Some(raw) = &self.raw_features {
            if !(raw.metadata.sr > 0.0 && raw.metadata.hop_length > 0.0) {
                return Err(ChartError::InvalidFeatures(format!(
                    "frame metadata sr={} hop_length={} must be positive",
                    raw.metadata.sr, raw.metadata.hop_length
                )));
            }
        }
        Ok(())
    }

    pub fn sampler(&self) -> FeatureSampler<'_> {
        FeatureSampler::new(self)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Read-only energy lookups by beat or by time.
pub struct FeatureSampler<'a> {
    features: &'a FeatureSet,
}

impl<'a> FeatureSampler<'a> {
    pub fn new(features: &'a FeatureSet) -> Self {
        FeatureSampler { features }
    }

    pub fn beat_stats(&self) -> &'a [BeatStat] {
        &self.features.beat_stats
    }

    pub fn hold_segments(&self) -> &'a [HoldSegment] {
        &self.features.hold_segments
    }

    pub fn beat_count(&self) -> usize {
        self.features.beat_stats.len()
    }

    pub fn stat(&self, index: usize) -> Option<&'a BeatStat> {
        self.features.beat_stats.get(index)
    }

    /// Frame index for `time`, clamped to the last frame of `len` frames.
    pub fn frame_at(&self, time: f64, len: usize) -> Option<usize> {
        let raw = self.features.raw_features.as_ref()?;
        if len == 0 {
            return None;
        }
        let frame = (time.max(0.0) * raw.metadata.sr / raw.metadata.hop_length) as usize;
        Some(frame.min(len - 1))
    }

    fn nearest_stat(&self, time: f64) -> Option<&'a BeatStat> {
        self.features.beat_stats.iter().min_by(|a, b| {
            (a.time - time)
                .abs()
                .partial_cmp(&(b.time - time).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// Onset envelope at `time`, or the nearest beat's onset strength.
    pub fn onset_at_time(&self, time: f64) -> f64 {
        if let Some(raw) = &self.features.raw_features {
            if let Some(frame) = self.frame_at(time, raw.onset_env.len()) {
                return raw.onset_env[frame];
            }
        }
        self.nearest_stat(time).map(|s| s.onset_strength).unwrap_or(0.0)
    }

    /// Analyzer time of a fractional beat, interpolated between beat times
    /// and extrapolated from the nearest pair outside them. `None` without beats.
    pub fn time_at_beat(&self, beat: f64) -> Option<f64> {
        let stats = &self.features.beat_stats;
        let last = stats.len().checked_sub(1)?;
        if last == 0 {
            return Some(stats[0].time);
        }
        let i = (beat.max(0.0).floor() as usize).min(last - 1);
        let (t0, t1) = (stats[i].time, stats[i + 1].time);
        Some(t0 + (beat - i as f64) * (t1 - t0))
    }

    /// Bass RMS at `time`. `None` when the analysis carries no bass series.
    pub fn bass_at_time(&self, time: f64) -> Option<f64> {
        let raw = self.features.raw_features.as_ref()?;
        let bass = raw.low_freq_rms.as_ref()?;
        let frame = self.frame_at(time, bass.len())?;
        Some(bass[frame])
    }

    pub fn mean_raw_bass(&self) -> Option<f64> {
        let bass = self.features.raw_features.as_ref()?.low_freq_rms.as_ref()?;
        mean(bass.iter().copied())
    }

    /// Bass gate: false when bass at `time` is below `mean_bass * ratio`.
    /// Always passes without a bass series.
    pub fn bass_passes(&self, time: f64, ratio: f64) -> bool {
        match (self.bass_at_time(time), self.mean_raw_bass()) {
            (Some(bass), Some(mean_bass)) => bass >= mean_bass * ratio,
            _ => true,
        }
    }

    pub fn beat_onset(&self, index: usize) -> f64 {
        self.stat(index).map(|s| s.onset_strength).unwrap_or(0.0)
    }

    pub fn onset_series(&self) -> Vec<f64> {
        self.features.beat_stats.iter().map(|s| s.onset_strength).collect()
    }

    /// Mean of the raw onset envelope, or of the beat onsets without one.
    pub fn global_onset_mean(&self) -> f64 {
        self.features
            .raw_features
            .as_ref()
            .and_then(|raw| mean(raw.onset_env.iter().copied()))
            .unwrap_or_else(|| self.mean_onset())
    }

    pub fn mean_onset(&self) -> f64 {
        mean(self.features.beat_stats.iter().map(|s| s.onset_strength)).unwrap_or(0.0)
    }

    pub fn mean_rms(&self) -> f64 {
        mean(self.features.beat_stats.iter().map(|s| s.rms)).unwrap_or(0.0)
    }

    pub fn mean_bass(&self) -> f64 {
        mean(self.features.beat_stats.iter().map(|s| s.bass_rms)).unwrap_or(0.0)
    }

    /// RMS of the beat containing `beat`, zero past the analyzed range.
    pub fn rms_at_beat(&self, beat: f64) -> f64 {
        if beat < 0.0 {
            return 0.0;
        }
        self.stat(beat.floor() as usize).map(|s| s.rms).unwrap_or(0.0)
    }

    /// Mean onset of beats whose time falls in `[t0, t1]`.
    pub fn energy_in_range(&self, t0: f64, t1: f64) -> f64 {
        mean(
            self.features
                .beat_stats
                .iter()
                .filter(|s| s.time >= t0 && s.time <= t1)
                .map(|s| s.onset_mean),
        )
        .unwrap_or(NEUTRAL_ENERGY)
    }
}

/// Mean of `values` over `[i - 4, i + 4)`, clamped to the slice.
pub fn local_average(values: &[f64], i: usize) -> f64 {
    let start = i.saturating_sub(LOCAL_WINDOW);
    let end = (i + LOCAL_WINDOW).min(values.len());
    if start >= end {
        return 0.0;
    }
    mean(values[start..end].iter().copied()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "info": {"sr": 22050, "offset": 0.0},
        "beat_stats": [
            {"beat_index": 0.0, "time": 0.0, "is_downbeat": true,
             "onset_env_max": 0.9, "onset_env_mean": 0.4, "rms_mean": 0.3, "low_freq_rms_mean": 0.2},
            {"beat_index": 1, "time": 0.5, "is_downbeat": false,
             "onset_env_max": 0.1, "onset_env_mean": 0.2, "rms_mean": 0.1}
        ],
        "raw_features": {
            "metadata": {"sr": 100, "hop_length": 10},
            "onset_env": [0.0, 1.0, 2.0, 3.0],
            "rms": [0.1, 0.1, 0.1, 0.1]
        },
        "hold_segments": [{"start": 1.0, "end": 2.5, "duration": 1.5}]
    }"#;

    #[test]
    fn test_parse_analysis_keys() {
        let set = FeatureSet::from_json(SAMPLE).unwrap();
        assert_eq!(set.beat_stats.len(), 2);
        assert_eq!(set.beat_stats[0].onset_strength, 0.9);
        assert_eq!(set.beat_stats[0].bass_rms, 0.2);
        assert_eq!(set.beat_stats[1].bass_rms, 0.0);
        assert_eq!(set.beat_stats[1].beat_index, 1);
        assert_eq!(set.hold_segments[0].duration(), 1.5);
    }

    #[test]
    fn test_frame_lookup_clamps() {
        let set = FeatureSet::from_json(SAMPLE).unwrap();
        let sampler = set.sampler();
        // 10 frames per second
        assert_eq!(sampler.onset_at_time(0.25), 2.0);
        assert_eq!(sampler.onset_at_time(50.0), 3.0);
        assert_eq!(sampler.bass_at_time(0.1), None);
    }

    #[test]
    fn test_fallback_without_raw_series() {
        let set = FeatureSet {
            beat_stats: vec![
                BeatStat { time: 0.0, onset_strength: 0.7, ..Default::default() },
                BeatStat { beat_index: 1, time: 1.0, onset_strength: 0.2, ..Default::default() },
            ],
            ..Default::default()
        };
        let sampler = set.sampler();
        assert_eq!(sampler.onset_at_time(0.8), 0.2);
        assert_eq!(sampler.rms_at_beat(7.0), 0.0);
    }

    #[test]
    fn test_time_at_fractional_beat() {
        let set = FeatureSet::from_json(SAMPLE).unwrap();
        let sampler = set.sampler();
        assert_eq!(sampler.time_at_beat(0.5), Some(0.25));
        // past the last beat the final interval is extended
        assert_eq!(sampler.time_at_beat(3.0), Some(1.5));
        assert_eq!(FeatureSet::default().sampler().time_at_beat(1.0), None);
    }

    #[test]
    fn test_energy_in_range_neutral_when_empty() {
        let set = FeatureSet::from_json(SAMPLE).unwrap();
        let sampler = set.sampler();
        assert_eq!(sampler.energy_in_range(10.0, 10.5), NEUTRAL_ENERGY);
        assert!((sampler.energy_in_range(0.0, 0.5) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_local_average_window() {
        let values = [1.0, 1.0, 1.0, 1.0, 5.0, 5.0, 5.0, 5.0, 9.0];
        // [0, 8) for i = 4
        assert_eq!(local_average(&values, 4), 3.0);
        // [0, 4) for i = 0
        assert_eq!(local_average(&values, 0), 1.0);
        assert_eq!(local_average(&[], 3), 0.0);
    }

    #[test]
    fn test_invalid_metadata_rejected() {
        let text = r#"{"raw_features": {"metadata": {"sr": 0, "hop_length": 512}}}"#;
        assert!(matches!(
            FeatureSet::from_json(text),
            Err(ChartError::InvalidFeatures(_))
        ));
    }
}
