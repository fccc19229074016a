pub mod config;
pub mod density;
pub mod error;
pub mod exporter;
pub mod features;
pub mod filters;
pub mod grid;
pub mod holds;
pub mod jumps;
pub mod lane_assigner;
pub mod placement;
pub mod simfile;
pub mod timing;
pub mod tuner;

pub use config::{CharterConfig, Difficulty};
pub use error::{ChartError, Result};

use density::{DensityChange, DensityReport};
use features::FeatureSet;
use filters::FilterReport;
use grid::{LaneSymbol, NoteGrid, Row, BEATS_PER_MEASURE, LANES};
use holds::HoldReport;
use jumps::JumpReport;
use lane_assigner::LaneAssigner;
use placement::OffbeatLayer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use simfile::{ChartBody, Simfile, SongMeta};
use timing::TempoMap;
use tuner::TuningReport;

const CHART_DESCRIPTION: &str = "stepchart";
const REFERENCE_DESCRIPTION: &str = "timing";
const REFERENCE_RADAR: f64 = 0.5;

/// Outcome of every stage run for one tier.
#[derive(Clone, Debug, Serialize)]
pub struct TierReport {
    pub difficulty: Difficulty,
    pub foundation_notes: Option<usize>,
    pub tuning: Option<TuningReport>,
    pub jumps: Option<JumpReport>,
    pub holds: Option<HoldReport>,
    pub final_notes: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PipelineReport {
    pub tiers: Vec<TierReport>,
    pub mute: FilterReport,
    pub trim: FilterReport,
}

/// Log a stage failure that only aborts that stage; anything else propagates.
fn recover<T>(stage: &str, difficulty: Difficulty, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_recoverable() => {
            log::warn!("{} stage skipped for {}: {}", stage, difficulty, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Main charter that runs the chart stages over a chart file
pub struct Charter {
    config: CharterConfig,
}

impl Charter {
    pub fn new(config: CharterConfig) -> Self {
        Charter { config }
    }

    pub fn config(&self) -> &CharterConfig {
        &self.config
    }

    /// Random source for a tier; a fixed seed makes every stage reproducible.
    fn rng(&self, difficulty: Difficulty) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(difficulty.index())),
            None => StdRng::from_entropy(),
        }
    }

    fn lanes(&self) -> LaneAssigner {
        LaneAssigner::new(self.config.lane_strategy)
    }

    /// Build a chart file from raw tempo events: header plus a reference
    /// chart with one note per beat (jumps on downbeats) for checking sync.
    pub fn init_simfile(&self, tempo: &TempoMap, meta: &SongMeta, song_duration: f64) -> Result<Simfile> {
        let timing = tempo.to_grid()?;
        let mut sim = Simfile::with_header(meta, &timing);

        let beats = timing.beat_times(song_duration, self.config.song_margin_secs).len();
        let rows = (0..beats)
            .map(|b| {
                let mut row = Row::single(LANES - 1);
                if b % BEATS_PER_MEASURE == 0 {
                    row.set(0, LaneSymbol::Tap);
                }
                row
            })
            .collect();

        let mut reference = ChartBody::new(
            Difficulty::Medium,
            REFERENCE_DESCRIPTION,
            NoteGrid::from_rows(rows, BEATS_PER_MEASURE),
        );
        reference.radar = vec![REFERENCE_RADAR; 5];
        sim.upsert_chart(reference);

        log::info!(
            "initialized '{}': {} tempo segments, {} beats",
            meta.title,
            timing.segments().len(),
            beats
        );
        Ok(sim)
    }

    /// One note per beat where the music supports it; replaces the tier's chart.
    pub fn foundation(&self, sim: &mut Simfile, features: &FeatureSet, difficulty: Difficulty) -> Result<usize> {
        let tier = self.config.tier(difficulty);
        let sampler = features.sampler();
        let mut rng = self.rng(difficulty);
        let mut lanes = self.lanes();

        let grid = placement::place_primary(&sampler, &tier.primary, &mut lanes, &mut rng);
        let notes = grid.note_count();
        sim.upsert_chart(ChartBody::new(difficulty, CHART_DESCRIPTION, grid));

        log::info!("{}: foundation layer with {} notes", difficulty, notes);
        Ok(notes)
    }

    /// Add the off-beat layer to the tier's chart, tuned to its density target.
    /// Tiers without off-beats only get the eighth-note resolution.
    pub fn rhythm(&self, sim: &mut Simfile, features: &FeatureSet, difficulty: Difficulty) -> Result<TuningReport> {
        let tier = self.config.tier(difficulty);
        let sampler = features.sampler();
        let chart = sim.chart_mut(difficulty)?;

        if !tier.secondary.generate_offbeats {
            let mut grid = NoteGrid::from_rows(chart.grid.primary_rows(), BEATS_PER_MEASURE);
            grid.expand_resolution(2);
            let report = TuningReport {
                iterations: 0,
                ratio: tuner::offbeat_ratio(&grid),
                sensitivity: tier.tuner.initial_sensitivity,
                converged: true,
            };
            chart.grid = grid;
            log::info!("{}: eighth-note resolution, no off-beat layer", difficulty);
            return Ok(report);
        }

        let layer = OffbeatLayer::new(&sampler, &tier.secondary, chart.grid.primary_rows());
        let mut rng = self.rng(difficulty);
        let mut lanes = self.lanes();
        let (grid, report) = tuner::tune(
            &layer,
            tier.secondary.target_ratio,
            &tier.tuner,
            &mut lanes,
            &mut rng,
        );
        chart.grid = grid;

        log::info!(
            "{}: off-beat ratio {:.3} (target {:.3}) after {} passes{}",
            difficulty,
            report.ratio,
            tier.secondary.target_ratio,
            report.iterations,
            if report.converged { "" } else { ", not converged" }
        );
        Ok(report)
    }

    pub fn jumps(&self, sim: &mut Simfile, features: &FeatureSet, difficulty: Difficulty) -> Result<JumpReport> {
        let tier = self.config.tier(difficulty);
        let sampler = features.sampler();
        let chart = sim.chart_mut(difficulty)?;

        let mut rng = self.rng(difficulty);
        let mut lanes = self.lanes();
        let report = jumps::place_jumps(&mut chart.grid, &sampler, &tier.jumps, &mut lanes, &mut rng);

        log::info!(
            "{}: {} jumps from {} candidates ({} unsafe)",
            difficulty,
            report.promoted,
            report.candidates,
            report.rejected_unsafe
        );
        Ok(report)
    }

    pub fn holds(&self, sim: &mut Simfile, features: &FeatureSet, difficulty: Difficulty) -> Result<HoldReport> {
        let tier = self.config.tier(difficulty);
        let sampler = features.sampler();
        let timing = sim.timing()?;
        let chart = sim.chart_mut(difficulty)?;

        let report = holds::place_holds(&mut chart.grid, &timing, &sampler, &tier.holds);
        chart.grid.validate_holds()?;

        log::info!(
            "{}: {} holds accepted, {} rejected, {} truncated, {} taps removed",
            difficulty,
            report.accepted,
            report.rejected,
            report.truncated,
            report.taps_removed
        );
        Ok(report)
    }

    /// Add taps on the loudest open rows, or clear the quietest tap rows, of
    /// one tier's chart by `config.density.fraction` of its taps.
    pub fn adjust_density(
        &self,
        sim: &mut Simfile,
        features: &FeatureSet,
        difficulty: Difficulty,
        change: DensityChange,
    ) -> Result<DensityReport> {
        let sampler = features.sampler();
        let chart = sim.chart_mut(difficulty)?;

        let mut rng = self.rng(difficulty);
        let mut lanes = self.lanes();
        let report = density::adjust_density(
            &mut chart.grid,
            &sampler,
            change,
            &self.config.density,
            &mut lanes,
            &mut rng,
        );

        log::info!(
            "{}: density {} by {} of {} taps, {} taps now",
            difficulty,
            change,
            report.changed,
            report.taps_before,
            report.taps_after
        );
        Ok(report)
    }

    /// Clear silent beats in every chart of the file.
    pub fn mute(&self, sim: &mut Simfile, features: &FeatureSet) -> FilterReport {
        let sampler = features.sampler();
        let mut total = FilterReport::default();
        for chart in &mut sim.charts {
            let report = filters::mute_silence(&mut chart.grid, &sampler, &self.config.mute);
            total.rows_cleared += report.rows_cleared;
            total.holds_repaired += report.holds_repaired;
        }
        log::info!("mute: {} rows cleared", total.rows_cleared);
        total
    }

    /// Clear the intro, the tail and off-beat rows in the fade-out of every chart.
    pub fn trim(&self, sim: &mut Simfile, features: &FeatureSet) -> FilterReport {
        let sampler = features.sampler();
        let mut total = FilterReport::default();
        for chart in &mut sim.charts {
            let report = filters::trim_intro_end(&mut chart.grid, &sampler, &self.config.trim);
            total.rows_cleared += report.rows_cleared;
            total.holds_repaired += report.holds_repaired;
        }
        log::info!("trim: {} rows cleared", total.rows_cleared);
        total
    }

    /// Run every stage for the given tiers, then the post-filters.
    pub fn generate(
        &self,
        sim: &mut Simfile,
        features: &FeatureSet,
        difficulties: &[Difficulty],
    ) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();

        for &difficulty in difficulties {
            let foundation_notes = recover("foundation", difficulty, self.foundation(sim, features, difficulty))?;
            let tuning = recover("rhythm", difficulty, self.rhythm(sim, features, difficulty))?;
            let jumps = recover("jumps", difficulty, self.jumps(sim, features, difficulty))?;
            let holds = recover("holds", difficulty, self.holds(sim, features, difficulty))?;
            report.tiers.push(TierReport {
                difficulty,
                foundation_notes,
                tuning,
                jumps,
                holds,
                final_notes: 0,
            });
        }

        report.mute = self.mute(sim, features);
        report.trim = self.trim(sim, features);

        for tier in &mut report.tiers {
            tier.final_notes = sim
                .chart(tier.difficulty)
                .map(|c| c.grid.note_count())
                .unwrap_or(0);
        }
        Ok(report)
    }
}
