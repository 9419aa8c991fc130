use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;

use calmsense::analysis;
use calmsense::calibration::{CalibrationEngine, CalibrationRecord};
use calmsense::clock::SystemClock;
use calmsense::config::AppConfig;
use calmsense::events::{drain, MonitorEvent, MonitorStatus, TracingSink};
use calmsense::logging::init_logging;
use calmsense::models::{Demographics, Gender, HeartRateSample, SensitivityConfig, StressLabel};
use calmsense::monitor::StressMonitor;
use calmsense::runtime::run_until_settled;
use calmsense::session::SessionState;
use calmsense::source::MemorySampleSource;
use calmsense::store::{KeyValueStore, SqliteStore};

/// calmsense - HRV stress detection engine
///
/// Runs timed heart-rate measurements against a synthetic sample source,
/// learns a personal stress threshold from labeled readings and classifies
/// new readings against it.
#[derive(Parser)]
#[command(name = "calmsense")]
#[command(version = "0.1.0")]
#[command(about = "HRV stress detection engine", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one measurement against synthetic heart-rate data
    Simulate {
        /// How the user feels (stressed/calm), required while training
        #[arg(short, long)]
        label: Option<StressLabel>,

        /// Resting heart rate of the synthetic data
        #[arg(long, default_value = "68")]
        bpm: f64,

        /// Beat-to-beat swing of the synthetic data in bpm
        #[arg(long, default_value = "4")]
        variability: f64,

        /// Produce no heart-rate data at all
        #[arg(long)]
        poor_signal: bool,

        /// Run on the wall clock instead of a virtual one
        #[arg(long)]
        realtime: bool,

        /// Keep calibration in memory only
        #[arg(long)]
        ephemeral: bool,
    },

    /// Start a new training phase
    Train {
        /// User age in years
        #[arg(long)]
        age: Option<u8>,

        /// User gender (female, male, other)
        #[arg(long, default_value = "unspecified")]
        gender: Gender,

        /// Stressed readings (X) required in the window
        #[arg(short = 'x', long, default_value = "3")]
        stressed_count: u8,

        /// Readings (Y) kept in the window
        #[arg(short = 'y', long, default_value = "5")]
        window_size: u8,
    },

    /// Inspect or edit the persisted calibration
    Calibration {
        #[command(subcommand)]
        action: CalibrationAction,
    },

    /// Summarize a labeled HRV dataset (Subject, HRV (ms), Stress or not)
    Analyze {
        /// CSV file
        file: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum CalibrationAction {
    /// Show the calibration record and thresholds
    Show,
    /// Clear labeled readings and re-enter training
    Reset,
    /// Change the X-of-Y sensitivity window
    Sensitivity {
        #[arg(short = 'x', long)]
        stressed_count: Option<u8>,

        #[arg(short = 'y', long)]
        window_size: Option<u8>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_or_default(cli.config.as_deref());
    init_logging(&config.logging.clone().with_verbosity(cli.verbose))?;

    match cli.command {
        Commands::Simulate {
            label,
            bpm,
            variability,
            poor_signal,
            realtime,
            ephemeral,
        } => {
            let store = if ephemeral {
                SqliteStore::in_memory()?
            } else {
                open_store(&config)?
            };
            let start = Utc::now();
            let source = if poor_signal {
                MemorySampleSource::empty()
            } else {
                synthetic_source(start, bpm, variability)
            };
            simulate(&config, source, store, start, label, realtime)?;
        }

        Commands::Train {
            age,
            gender,
            stressed_count,
            window_size,
        } => {
            let mut store = open_store(&config)?;
            let mut engine = load_engine(&config, &store)?;
            let sensitivity = SensitivityConfig::new(stressed_count, window_size);
            engine.start_training(Demographics { age, gender }, sensitivity, Utc::now(), &mut store)?;
            println!("{}", "✓ Training started".green().bold());
            println!(
                "  Sensitivity: {} of {}",
                sensitivity.stressed_count(),
                sensitivity.window_size()
            );
            println!(
                "  Next: {}",
                "calmsense simulate --label stressed|calm".cyan()
            );
        }

        Commands::Calibration { action } => {
            let mut store = open_store(&config)?;
            let mut engine = load_engine(&config, &store)?;
            match action {
                CalibrationAction::Show => print_calibration(&engine),
                CalibrationAction::Reset => {
                    engine.reset(Utc::now(), &mut store)?;
                    println!("{}", "✓ Calibration reset, training restarted".yellow().bold());
                }
                CalibrationAction::Sensitivity {
                    stressed_count,
                    window_size,
                } => {
                    if stressed_count.is_none() && window_size.is_none() {
                        bail!("Pass --stressed-count and/or --window-size");
                    }
                    if let Some(x) = stressed_count {
                        engine.set_sensitivity_stressed_count(x, &mut store)?;
                    }
                    if let Some(y) = window_size {
                        engine.set_sensitivity_window_size(y, &mut store)?;
                    }
                    let sensitivity = engine.sensitivity();
                    println!(
                        "{} {} of {}",
                        "✓ Sensitivity:".green().bold(),
                        sensitivity.stressed_count(),
                        sensitivity.window_size()
                    );
                }
            }
        }

        Commands::Analyze { file, json } => {
            let summaries = analysis::analyze_file(&file)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                println!("{}", format!("HRV dataset: {}", file.display()).cyan().bold());
                println!("{}", analysis::render_table(&summaries));
            }
        }

        Commands::Config { action } => {
            let path = cli.config.clone().unwrap_or_else(AppConfig::default_config_path);
            match action {
                ConfigAction::Init { force } => {
                    if path.exists() && !force {
                        bail!("{} already exists (use --force to overwrite)", path.display());
                    }
                    AppConfig::default().save_to_file(&path)?;
                    println!("{} {}", "✓ Wrote".green().bold(), path.display());
                }
                ConfigAction::Show => {
                    println!("{}", format!("# {}", path.display()).dimmed());
                    println!("{}", toml::to_string_pretty(&config)?);
                }
            }
        }
    }

    Ok(())
}

fn open_store(config: &AppConfig) -> Result<SqliteStore> {
    let path = &config.storage.database_path;
    SqliteStore::open(path).with_context(|| format!("Failed to open calibration store: {}", path.display()))
}

fn load_engine<K: KeyValueStore>(config: &AppConfig, store: &K) -> Result<CalibrationEngine> {
    Ok(CalibrationEngine::load(
        store,
        config.calibration.policy.clone(),
        config.calibration.default_threshold_ms,
    )?)
}

/// Samples every 5 s from 15 s before `start` to 70 s after it
fn synthetic_source(start: DateTime<Utc>, bpm: f64, variability: f64) -> MemorySampleSource {
    const PATTERN: [f64; 6] = [0.0, 1.0, -0.5, 0.75, -1.0, 0.25];
    let samples = (-3..=14)
        .zip(PATTERN.iter().cycle())
        .filter_map(|(i, swing)| {
            HeartRateSample::new(start + Duration::seconds(i * 5), bpm + swing * variability)
        })
        .collect();
    MemorySampleSource::new(samples)
}

fn simulate<K: KeyValueStore>(
    config: &AppConfig,
    source: MemorySampleSource,
    store: K,
    start: DateTime<Utc>,
    label: Option<StressLabel>,
    realtime: bool,
) -> Result<()> {
    let mut monitor = StressMonitor::new(config.monitor_config(), source, store, TracingSink, start)?;
    if !monitor.authorize() {
        bail!("Heart rate access denied");
    }
    let mut events = monitor.subscribe();

    println!(
        "{} ({} mode)",
        "Measuring, stay still...".blue().bold(),
        monitor.mode()
    );
    if let Err(err) = monitor.start_measurement(label) {
        bail!(err.user_message());
    }

    if realtime {
        let timeout = std::time::Duration::from_secs(
            u64::from(config.session.duration_secs)
                + u64::from(config.session.max_retries + 1) * u64::from(config.session.retry_backoff_secs)
                + 30,
        );
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(run_until_settled(
            &mut monitor,
            &SystemClock,
            std::time::Duration::from_millis(u64::from(config.session.tick_ms)),
            timeout,
        ))?;
    } else {
        while monitor.session_state().is_active() {
            let Some(due) = monitor.next_due() else {
                break;
            };
            monitor.advance_to(due)?;
        }
    }

    for event in drain(&mut events) {
        match event {
            MonitorEvent::SessionStateChanged(SessionState::Finalizing) => {
                println!("  {}", "Capture finished, analyzing".dimmed());
            }
            MonitorEvent::ReadingProduced(reading) => {
                println!(
                    "  HRV: {} ({} samples)",
                    format!("{:.1} ms", reading.value_ms).bold(),
                    reading.sample_count
                );
            }
            MonitorEvent::TrainingCompleted { threshold } => {
                println!(
                    "{} threshold {:.1} ms",
                    "✓ Training complete:".green().bold(),
                    threshold
                );
            }
            MonitorEvent::AdvisoryChanged(Some(message)) => {
                println!("  {}", message.yellow());
            }
            MonitorEvent::InterventionChanged { active: true } => {
                println!("  {}", "Breathing exercise suggested".magenta());
            }
            _ => {}
        }
    }

    match monitor.status() {
        MonitorStatus::Calm { hrv_ms } => println!("{} {:.1} ms", "✓ Calm".green().bold(), hrv_ms),
        MonitorStatus::Stressed { hrv_ms } => println!("{} {:.1} ms", "⚠ Stressed".red().bold(), hrv_ms),
        MonitorStatus::Recorded { hrv_ms } => {
            println!("{} {:.1} ms", "✓ Recorded training reading".green().bold(), hrv_ms)
        }
        MonitorStatus::PoorSignal => println!("{}", "✗ Poor signal, try again".red().bold()),
        other => println!("Status: {:?}", other),
    }
    print_calibration(monitor.calibration());
    Ok(())
}

fn print_calibration(engine: &CalibrationEngine) {
    let record: &CalibrationRecord = engine.record();
    println!("{}", "Calibration".cyan().bold());
    println!("  Mode: {}", engine.mode());
    println!(
        "  Readings: {} stressed, {} calm",
        record.stressed_readings.len(),
        record.calm_readings.len()
    );
    match record.custom_threshold {
        Some(threshold) => println!("  Threshold: {:.1} ms", threshold),
        None => println!(
            "  Threshold: {:.1} ms {}",
            engine.tentative_threshold(),
            "(tentative)".dimmed()
        ),
    }
    println!(
        "  Sensitivity: {} of {}",
        record.sensitivity.stressed_count(),
        record.sensitivity.window_size()
    );
    if let Some(age) = record.demographics.age {
        println!("  Age: {}", age);
    }
    if record.demographics.gender != Gender::Unspecified {
        println!("  Gender: {}", record.demographics.gender);
    }
}
