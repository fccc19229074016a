use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use stepchart::density::DensityChange;
use stepchart::exporter::{self, ChartExport};
use stepchart::features::FeatureSet;
use stepchart::lane_assigner::LaneAssignmentStrategy;
use stepchart::simfile::{Simfile, SongMeta};
use stepchart::timing::TempoMap;
use stepchart::{Charter, CharterConfig, Difficulty, PipelineReport};

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat-synchronized step chart generator", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file (missing keys keep their defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Seed for lane choices; same seed and inputs give the same chart
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Lane assignment strategy (sequential, random)
    #[arg(long, global = true)]
    lane_strategy: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args, Debug)]
struct StageArgs {
    /// Chart file to read
    input: PathBuf,
    /// Chart file to write (may equal the input)
    output: PathBuf,
    /// Beat feature JSON from the analyzer
    features: PathBuf,
    #[arg(short, long, default_value = "medium")]
    difficulty: Difficulty,
}

#[derive(clap::Args, Debug)]
struct FilterArgs {
    input: PathBuf,
    output: PathBuf,
    features: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a chart file header and timing reference chart from tempo events
    Init {
        /// Tempo JSON: {"offset": s, "bpm_changes": [[time, bpm], ...]}
        #[arg(long)]
        timing: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        artist: String,
        /// Audio file name written to the MUSIC tag
        #[arg(long)]
        music: String,
        /// Track length in seconds
        #[arg(long)]
        duration: f64,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// One note per supported beat
    Foundation(StageArgs),
    /// Off-beat layer tuned to the tier's density target
    Rhythm(StageArgs),
    Jumps(StageArgs),
    Holds(StageArgs),
    /// Add taps where the music is loudest, or clear the quietest tap rows
    Density {
        #[command(flatten)]
        stage: StageArgs,
        /// increase or decrease
        #[arg(long, default_value = "increase")]
        change: DensityChange,
        /// Share of the chart's taps to change, in percent (default from config)
        #[arg(long)]
        percent: Option<f64>,
    },
    /// Clear silent beats in every chart
    Mute(FilterArgs),
    /// Clear intro, outro and fade-out off-beats in every chart
    Trim(FilterArgs),
    /// Run every stage and both filters
    Generate {
        input: PathBuf,
        output: PathBuf,
        features: PathBuf,
        /// Tiers to build, comma separated (default: all)
        #[arg(short, long, value_delimiter = ',')]
        difficulty: Vec<Difficulty>,
    },
    /// Export one chart as timed JSON notes
    Export {
        input: PathBuf,
        output: PathBuf,
        #[arg(short, long, default_value = "medium")]
        difficulty: Difficulty,
    },
    /// Print the effective configuration
    ShowConfig,
}

fn load_config(args: &Args) -> Result<CharterConfig> {
    let mut config = match &args.config {
        Some(path) => CharterConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => CharterConfig::default(),
    };

    if args.seed.is_some() {
        config.seed = args.seed;
    }
    if let Some(name) = &args.lane_strategy {
        config.lane_strategy = LaneAssignmentStrategy::from_str(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown lane strategy: {}", name))?;
    }
    Ok(config)
}

fn load_inputs(input: &Path, features: &Path) -> Result<(Simfile, FeatureSet)> {
    let sim = Simfile::load(input).with_context(|| format!("failed to read chart {}", input.display()))?;
    let features =
        FeatureSet::load(features).with_context(|| format!("failed to read features {}", features.display()))?;
    Ok((sim, features))
}

fn save(path: &Path, sim: &Simfile) -> Result<()> {
    exporter::save_simfile(path, sim).with_context(|| format!("failed to write {}", path.display()))?;
    log::info!("Saved chart file to: {}", path.display());
    Ok(())
}

fn run_stage(
    stage: &StageArgs,
    run: impl FnOnce(&mut Simfile, &FeatureSet, Difficulty) -> stepchart::Result<()>,
) -> Result<()> {
    let (mut sim, features) = load_inputs(&stage.input, &stage.features)?;
    run(&mut sim, &features, stage.difficulty)?;
    save(&stage.output, &sim)
}

fn run_filter(filter: &FilterArgs, run: impl FnOnce(&mut Simfile, &FeatureSet)) -> Result<()> {
    let (mut sim, features) = load_inputs(&filter.input, &filter.features)?;
    run(&mut sim, &features);
    save(&filter.output, &sim)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_default_env()
        .filter_level(level.parse()?)
        .init();

    let mut config = load_config(&args)?;
    if let Command::Density {
        percent: Some(percent),
        ..
    } = &args.command
    {
        config.density.fraction = percent / 100.0;
        config.validate()?;
    }
    let charter = Charter::new(config);

    match &args.command {
        Command::Init {
            timing,
            title,
            artist,
            music,
            duration,
            output,
        } => {
            let tempo = TempoMap::load(timing).with_context(|| format!("failed to read timing {}", timing.display()))?;
            let meta = SongMeta {
                title: title.clone(),
                artist: artist.clone(),
                music: music.clone(),
            };
            let sim = charter.init_simfile(&tempo, &meta, *duration)?;
            save(output, &sim)?;
        }
        Command::Foundation(stage) => {
            run_stage(stage, |sim, f, d| charter.foundation(sim, f, d).map(|_| ()))?;
        }
        Command::Rhythm(stage) => {
            run_stage(stage, |sim, f, d| charter.rhythm(sim, f, d).map(|_| ()))?;
        }
        Command::Jumps(stage) => {
            run_stage(stage, |sim, f, d| charter.jumps(sim, f, d).map(|_| ()))?;
        }
        Command::Holds(stage) => {
            run_stage(stage, |sim, f, d| charter.holds(sim, f, d).map(|_| ()))?;
        }
        Command::Density { stage, change, .. } => {
            run_stage(stage, |sim, f, d| charter.adjust_density(sim, f, d, *change).map(|_| ()))?;
        }
        Command::Mute(filter) => {
            run_filter(filter, |sim, f| {
                charter.mute(sim, f);
            })?;
        }
        Command::Trim(filter) => {
            run_filter(filter, |sim, f| {
                charter.trim(sim, f);
            })?;
        }
        Command::Generate {
            input,
            output,
            features,
            difficulty,
        } => {
            let tiers: &[Difficulty] = if difficulty.is_empty() {
                &Difficulty::ALL
            } else {
                difficulty
            };
            let (mut sim, features) = load_inputs(input, features)?;

            log::info!("Generating charts for {} difficulties...", tiers.len());
            let report = charter.generate(&mut sim, &features, tiers)?;
            save(output, &sim)?;

            log::info!("✓ Chart generation complete!");
            print_summary(&report);
        }
        Command::Export {
            input,
            output,
            difficulty,
        } => {
            let sim = Simfile::load(input).with_context(|| format!("failed to read chart {}", input.display()))?;
            let export = ChartExport::from_simfile(&sim, *difficulty)?;
            export.save(output)?;
            log::info!(
                "Saved {} chart ({} notes) to: {}",
                export.difficulty,
                export.notes.len(),
                output.display()
            );
        }
        Command::ShowConfig => {
            println!("{}", charter.config().to_json()?);
        }
    }

    Ok(())
}

fn print_summary(report: &PipelineReport) {
    println!("\n=== Chart Summary ===");
    for tier in &report.tiers {
        let ratio = tier
            .tuning
            .as_ref()
            .map(|t| format!("{:.2}", t.ratio))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<7} | {} notes | off-beat ratio {} | {} jumps | {} holds",
            tier.difficulty.name(),
            tier.final_notes,
            ratio,
            tier.jumps.as_ref().map(|j| j.promoted).unwrap_or(0),
            tier.holds.as_ref().map(|h| h.accepted).unwrap_or(0)
        );
    }
    println!(
        "filters | {} rows muted | {} rows trimmed",
        report.mute.rows_cleared, report.trim.rows_cleared
    );
    println!("=== End Summary ===\n");
}
