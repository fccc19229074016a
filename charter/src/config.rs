//! Tier parameters and pipeline configuration.
//!
//! All tier-specific thresholds live here so they can be inspected with
//! `show-config` and overridden from a JSON file.

use crate::error::{ChartError, Result};
use crate::lane_assigner::LaneAssignmentStrategy;
use crate::timing::SONG_END_MARGIN;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub const ALL: [Difficulty; 3] = [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

    pub fn name(self) -> &'static str {
        match self {
            Difficulty::Easy => "Easy",
            Difficulty::Medium => "Medium",
            Difficulty::Hard => "Hard",
        }
    }

    /// Meter written into a freshly created chart body.
    pub fn default_meter(self) -> u32 {
        match self {
            Difficulty::Easy => 3,
            Difficulty::Medium => 5,
            Difficulty::Hard => 8,
        }
    }

    pub fn index(self) -> u64 {
        self as u64
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Difficulty {
    type Err = ChartError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(ChartError::InvalidConfig(format!(
                "unknown difficulty '{}'",
                other
            ))),
        }
    }
}

/// Quarter-note foundation layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimaryParams {
    /// Onset must exceed `local_average * threshold`
    pub threshold: f64,
    /// Longest allowed run of empty beats
    pub rest_cap: usize,
}

impl Default for PrimaryParams {
    fn default() -> Self {
        PrimaryParams {
            threshold: 0.8,
            rest_cap: 2,
        }
    }
}

/// Off-beat (eighth-note) layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondaryParams {
    /// When false the rhythm stage only moves the chart to eighth-note
    /// resolution and leaves every off-beat row empty
    pub generate_offbeats: bool,
    /// Off-beat rows per on-beat row the tuner aims for
    pub target_ratio: f64,
    /// Half-beat bass below `mean_bass * bass_floor_ratio` is skipped
    pub bass_floor_ratio: f64,
    pub floor_ratio: f64,
    pub local_ratio: f64,
    /// Extra energy required when only the following beat has a note
    pub syncopation_factor: f64,
    /// Longest unbroken eighth-note stream
    pub max_stream: usize,
    /// Omissions after which a note is forced
    pub drought_limit: usize,
    /// Keep off-beats away from jumps
    pub avoid_jump_adjacency: bool,
}

impl Default for SecondaryParams {
    fn default() -> Self {
        SecondaryParams {
            generate_offbeats: true,
            target_ratio: 0.25,
            bass_floor_ratio: 0.4,
            floor_ratio: 0.4,
            local_ratio: 0.9,
            syncopation_factor: 1.2,
            max_stream: 5,
            drought_limit: 6,
            avoid_jump_adjacency: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerParams {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub gain: f64,
    pub initial_sensitivity: f64,
    pub min_sensitivity: f64,
    pub max_sensitivity: f64,
}

impl Default for TunerParams {
    fn default() -> Self {
        TunerParams {
            max_iterations: 5,
            tolerance: 0.02,
            gain: 3.0,
            initial_sensitivity: 1.0,
            min_sensitivity: 0.5,
            max_sensitivity: 3.0,
        }
    }
}

/// Energy series used to rank jump candidates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JumpEnergy {
    Rms,
    Bass,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JumpParams {
    pub energy: JumpEnergy,
    /// Candidates whose bass is below `mean_bass * bass_gate_ratio` are dropped
    pub bass_gate_ratio: f64,
    /// Share of downbeat candidates promoted
    pub downbeat_fraction: f64,
    /// Off-beats promote above `mean * multiplier`; `None` disables
    pub offbeat_multiplier: Option<f64>,
    pub safety_check: bool,
    /// Add the mirrored lane instead of a random free one
    pub mirror_lane: bool,
}

impl Default for JumpParams {
    fn default() -> Self {
        JumpParams {
            energy: JumpEnergy::Rms,
            bass_gate_ratio: 0.4,
            downbeat_fraction: 0.4,
            offbeat_multiplier: Some(1.5),
            safety_check: true,
            mirror_lane: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldParams {
    /// Shortest analyzer segment that can become a hold, seconds
    pub min_segment_secs: f64,
    /// Tap may precede the segment start by this much
    pub start_lead_secs: f64,
    /// Tap may trail the segment start by this much
    pub start_lag_secs: f64,
    /// Energy window sampled after a conflicting row
    pub energy_window_secs: f64,
    /// Above this energy taps win over holds
    pub energy_threshold: f64,
    pub max_active_inputs: usize,
    pub max_concurrent_holds: usize,
}

impl Default for HoldParams {
    fn default() -> Self {
        HoldParams {
            min_segment_secs: 1.0,
            start_lead_secs: 0.2,
            start_lag_secs: 0.4,
            energy_window_secs: 0.5,
            energy_threshold: 0.6,
            max_active_inputs: 2,
            max_concurrent_holds: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub primary: PrimaryParams,
    pub secondary: SecondaryParams,
    pub tuner: TunerParams,
    pub jumps: JumpParams,
    pub holds: HoldParams,
}

impl Default for TierConfig {
    fn default() -> Self {
        TierConfig::for_difficulty(Difficulty::Medium)
    }
}

impl TierConfig {
    pub fn for_difficulty(difficulty: Difficulty) -> Self {
        match difficulty {
            Difficulty::Easy => TierConfig {
                primary: PrimaryParams {
                    threshold: 0.6,
                    ..Default::default()
                },
                secondary: SecondaryParams {
                    generate_offbeats: false,
                    target_ratio: 0.05,
                    bass_floor_ratio: 0.5,
                    floor_ratio: 0.5,
                    local_ratio: 1.0,
                    syncopation_factor: 1.3,
                    max_stream: 3,
                    drought_limit: 8,
                    avoid_jump_adjacency: true,
                },
                tuner: TunerParams::default(),
                jumps: JumpParams {
                    energy: JumpEnergy::Bass,
                    bass_gate_ratio: 0.0,
                    downbeat_fraction: 0.1,
                    offbeat_multiplier: None,
                    safety_check: false,
                    mirror_lane: true,
                },
                holds: HoldParams {
                    max_concurrent_holds: 1,
                    ..Default::default()
                },
            },
            Difficulty::Medium => TierConfig {
                primary: PrimaryParams::default(),
                secondary: SecondaryParams::default(),
                tuner: TunerParams::default(),
                jumps: JumpParams::default(),
                holds: HoldParams::default(),
            },
            Difficulty::Hard => TierConfig {
                primary: PrimaryParams {
                    threshold: 1.0,
                    ..Default::default()
                },
                secondary: SecondaryParams {
                    generate_offbeats: true,
                    target_ratio: 0.5,
                    bass_floor_ratio: 0.3,
                    floor_ratio: 0.3,
                    local_ratio: 0.8,
                    syncopation_factor: 1.1,
                    max_stream: 7,
                    drought_limit: 4,
                    avoid_jump_adjacency: false,
                },
                tuner: TunerParams::default(),
                jumps: JumpParams {
                    bass_gate_ratio: 0.3,
                    downbeat_fraction: 0.6,
                    offbeat_multiplier: Some(1.3),
                    ..Default::default()
                },
                holds: HoldParams {
                    energy_threshold: 0.8,
                    ..Default::default()
                },
            },
        }
    }

    fn validate(&self, difficulty: Difficulty) -> Result<()> {
        let bad = |what: &str| {
            Err(ChartError::InvalidConfig(format!(
                "{} tier: {}",
                difficulty, what
            )))
        };

        if self.primary.threshold < 0.0 {
            return bad("primary.threshold must not be negative");
        }
        if self.secondary.max_stream == 0 {
            return bad("secondary.max_stream must be at least 1");
        }
        if self.tuner.min_sensitivity <= 0.0 || self.tuner.min_sensitivity > self.tuner.max_sensitivity {
            return bad("tuner sensitivity range is empty");
        }
        if !(0.0..=1.0).contains(&self.jumps.downbeat_fraction) {
            return bad("jumps.downbeat_fraction must be within [0, 1]");
        }
        if self.holds.max_active_inputs == 0 || self.holds.max_active_inputs > 2 {
            return bad("holds.max_active_inputs must be 1 or 2");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuteParams {
    /// Rows below `mean_rms * ratio` are cleared
    pub ratio: f64,
}

impl Default for MuteParams {
    fn default() -> Self {
        MuteParams { ratio: 0.15 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimParams {
    pub silence_threshold: f64,
    pub low_volume_threshold: f64,
    pub window_beats: usize,
}

impl Default for TrimParams {
    fn default() -> Self {
        TrimParams {
            silence_threshold: 0.02,
            low_volume_threshold: 0.15,
            window_beats: 4,
        }
    }
}

/// Manual density adjustment of a finished chart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityParams {
    /// Share of the chart's taps added, or of tap rows cleared, per pass
    pub fraction: f64,
    /// Added taps never push a row above this many inputs
    pub max_active_inputs: usize,
}

impl Default for DensityParams {
    fn default() -> Self {
        DensityParams {
            fraction: 0.2,
            max_active_inputs: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierSet {
    pub easy: TierConfig,
    pub medium: TierConfig,
    pub hard: TierConfig,
}

impl Default for TierSet {
    fn default() -> Self {
        TierSet {
            easy: TierConfig::for_difficulty(Difficulty::Easy),
            medium: TierConfig::for_difficulty(Difficulty::Medium),
            hard: TierConfig::for_difficulty(Difficulty::Hard),
        }
    }
}

/// Main charter configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharterConfig {
    pub seed: Option<u64>,              // None = seed from entropy
    pub lane_strategy: LaneAssignmentStrategy,
    pub song_margin_secs: f64,          // trimmed from the end when laying out beats
    pub tiers: TierSet,
    pub mute: MuteParams,
    pub trim: TrimParams,
    pub density: DensityParams,
}

impl Default for CharterConfig {
    fn default() -> Self {
        CharterConfig {
            seed: None,
            lane_strategy: LaneAssignmentStrategy::Random,
            song_margin_secs: SONG_END_MARGIN,
            tiers: TierSet::default(),
            mute: MuteParams::default(),
            trim: TrimParams::default(),
            density: DensityParams::default(),
        }
    }
}

impl CharterConfig {
    pub fn tier(&self, difficulty: Difficulty) -> &TierConfig {
        match difficulty {
            Difficulty::Easy => &self.tiers.easy,
            Difficulty::Medium => &self.tiers.medium,
            Difficulty::Hard => &self.tiers.hard,
        }
    }

    /// Parse a (possibly partial) config; keys not given keep their tier defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut merged = serde_json::to_value(CharterConfig::default())?;
        merge_json(&mut merged, serde_json::from_str(text)?);
        let config: CharterConfig = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ChartError::MissingInput(path.to_path_buf()));
        }
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        for difficulty in Difficulty::ALL {
            self.tier(difficulty).validate(difficulty)?;
        }
        if self.mute.ratio < 0.0 {
            return Err(ChartError::InvalidConfig("mute.ratio must not be negative".into()));
        }
        if self.trim.window_beats == 0 {
            return Err(ChartError::InvalidConfig("trim.window_beats must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.density.fraction) {
            return Err(ChartError::InvalidConfig("density.fraction must be within [0, 1]".into()));
        }
        if self.density.max_active_inputs == 0 || self.density.max_active_inputs > 2 {
            return Err(ChartError::InvalidConfig("density.max_active_inputs must be 1 or 2".into()));
        }
        Ok(())
    }
}

fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charter_config_default() {
        let config = CharterConfig::default();
        assert!(config.seed.is_none());
        assert_eq!(config.song_margin_secs, 1.5);
        assert_eq!(config.tier(Difficulty::Easy).primary.threshold, 0.6);
        assert_eq!(config.tier(Difficulty::Hard).holds.energy_threshold, 0.8);
        assert_eq!(config.tier(Difficulty::Easy).holds.max_concurrent_holds, 1);
        assert!(!config.tier(Difficulty::Easy).secondary.generate_offbeats);
        assert!(config.tier(Difficulty::Hard).secondary.generate_offbeats);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            CharterConfig::from_json(r#"{"seed": 7, "tiers": {"hard": {"primary": {"threshold": 1.2}}}}"#)
                .unwrap();
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.tiers.hard.primary.threshold, 1.2);
        assert_eq!(config.tiers.hard.primary.rest_cap, 2);
        assert_eq!(config.tiers.hard.secondary.max_stream, 7);
        assert_eq!(config.tiers.easy, TierConfig::for_difficulty(Difficulty::Easy));
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = CharterConfig::default();
        let back = CharterConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = CharterConfig::from_json(r#"{"tiers": {"medium": {"holds": {"max_active_inputs": 3}}}}"#)
            .unwrap_err();
        assert!(matches!(err, ChartError::InvalidConfig(_)));
    }

    #[test]
    fn test_density_fraction_bounded() {
        let config = CharterConfig::from_json(r#"{"density": {"fraction": 0.35}}"#).unwrap();
        assert_eq!(config.density.fraction, 0.35);
        assert_eq!(config.density.max_active_inputs, 2);
        assert!(CharterConfig::from_json(r#"{"density": {"fraction": 1.5}}"#).is_err());
    }

    #[test]
    fn test_difficulty_parse() {
        assert_eq!("HARD".parse::<Difficulty>().unwrap(), Difficulty::Hard);
        assert_eq!(Difficulty::Medium.to_string(), "Medium");
        assert!("expert".parse::<Difficulty>().is_err());
    }
}
