//! CLI Entry Point for waterfall-daq
//!
//! Provides command-line interface for:
//! - Acquiring sweeps on the bench (interactive or one named sweep)
//! - Checking both device connections
//! - Running a sweep against simulated devices
//!
//! # Usage
//!
//! Interactive acquisition (asks for a measurement name, then whether to repeat):
//! ```bash
//! waterfall-daq sweep
//! ```
//!
//! One named sweep with a custom config file:
//! ```bash
//! waterfall-daq --config bench.toml sweep --name prop_10x4_run1
//! ```
//!
//! Simulated sweep:
//! ```bash
//! waterfall-daq simulate --name demo
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{error, info, warn};
use waterfall_daq::acquisition::{run_sweep, AbortedSweep, StopSignal, SweepSettings};
use waterfall_daq::config::{WaterfallConfig, DEFAULT_CONFIG_PATH};
use waterfall_daq::export::Exporter;
use waterfall_daq::hardware::capabilities::{RotationStage, SpectrumInstrument};
use waterfall_daq::hardware::mock::{MockRotator, MockScpiTransport};
use waterfall_daq::hardware::{self, InstrumentSession};
use waterfall_daq::logging;
use waterfall_daq::sweep::Sweep;

#[derive(Parser)]
#[command(name = "waterfall-daq")]
#[command(about = "Angle-synchronized propeller Vpp and FFT waterfall acquisition", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire sweeps on the rotation stage and oscilloscope
    Sweep {
        /// Measurement name; without it, prompt for names until the operator stops
        #[arg(long)]
        name: Option<String>,
    },

    /// Open both devices, print the instrument identity and FFT configuration
    Check,

    /// Run one sweep against simulated devices and export it
    Simulate {
        /// Measurement name
        #[arg(long, default_value = "simulated")]
        name: String,

        /// Encoder advance per line, in tenths of a degree
        #[arg(long, default_value_t = 1)]
        step_ticks: u32,

        /// FFT points per waveform
        #[arg(long, default_value_t = 1000)]
        points: usize,
    },
}

/// How one sweep ended, after export.
enum SweepOutcome {
    Exported,
    Aborted(AbortedSweep),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WaterfallConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    info!(app = %config.application.name, "Starting");

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; stopping");
                stop.trigger("interrupted by operator");
            }
        });
    }

    match cli.command {
        Commands::Sweep { name: Some(name) } => match acquire_one(&config, &name, &stop).await? {
            SweepOutcome::Exported => Ok(()),
            SweepOutcome::Aborted(aborted) => Err(aborted.into()),
        },
        Commands::Sweep { name: None } => operator_loop(&config, &stop).await,
        Commands::Check => check_devices(&config).await,
        Commands::Simulate {
            name,
            step_ticks,
            points,
        } => simulate(&config, &name, step_ticks, points, &stop).await,
    }
}

/// Prompt for names and sweep until the operator declines or interrupts.
async fn operator_loop(config: &WaterfallConfig, stop: &StopSignal) -> Result<()> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let Some(name) = prompt(&mut input, "Measurement name: ", stop).await? else {
            break;
        };
        if name.is_empty() {
            continue;
        }

        // Connection failures end the program; a failed sweep does not.
        if let SweepOutcome::Aborted(aborted) = acquire_one(config, &name, stop).await? {
            eprintln!("❌ {}", aborted);
        }
        if stop.is_triggered() {
            break;
        }

        match prompt(&mut input, "New measurement? (y/n): ", stop).await? {
            Some(answer) if answer.eq_ignore_ascii_case("y") => continue,
            _ => break,
        }
    }

    println!("👋 Done");
    Ok(())
}

/// Print a prompt and read one trimmed line; `None` on EOF or interrupt.
async fn prompt(
    input: &mut Lines<BufReader<Stdin>>,
    text: &str,
    stop: &StopSignal,
) -> Result<Option<String>> {
    print!("{text}");
    std::io::stdout().flush()?;
    tokio::select! {
        _ = stop.triggered() => Ok(None),
        line = input.next_line() => Ok(line?.map(|l| l.trim().to_string())),
    }
}

/// Open fresh sessions, run one sweep, export what the policy keeps.
async fn acquire_one(config: &WaterfallConfig, name: &str, stop: &StopSignal) -> Result<SweepOutcome> {
    let mut rotator = hardware::connect_rotator(&config.rotator)
        .context("Rotation stage unavailable")?;
    let instrument = match hardware::connect_instrument(&config.instrument).await {
        Ok(instrument) => instrument,
        Err(e) => {
            if let Err(close_err) = rotator.close().await {
                warn!(error = %close_err, "Failed to close rotation stage");
            }
            return Err(e).context(format!(
                "Oscilloscope unavailable at {}",
                config.instrument.address()
            ));
        }
    };

    println!("▶️  Sweep '{name}' started");
    let settings = SweepSettings::from_config(config);
    let exporter = Exporter::new(&config.storage.output_dir);
    finish(run_sweep(rotator, instrument, &settings, stop).await, &exporter, name)
}

/// Export a finished sweep, or the partial sweep of an aborted one.
fn finish(
    outcome: Result<Sweep, AbortedSweep>,
    exporter: &Exporter,
    name: &str,
) -> Result<SweepOutcome> {
    match outcome {
        Ok(sweep) => {
            let paths = exporter.export(name, &sweep)?;
            println!(
                "✅ Sweep complete: {} degrees in {:.1} s (started {})",
                sweep.len(),
                sweep.duration().num_milliseconds() as f64 / 1000.0,
                sweep.started_at().format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!("   Vpp series: {}", paths.scalar.display());
            println!("   FFT matrix: {}", paths.fft.display());
            Ok(SweepOutcome::Exported)
        }
        Err(mut aborted) => {
            if let Some(partial) = aborted.partial.take() {
                match exporter.export(name, &partial) {
                    Ok(paths) => println!(
                        "⚠️  Incomplete sweep saved ({} degrees): {}",
                        partial.len(),
                        paths.scalar.display()
                    ),
                    Err(e) => error!(error = %e, "Failed to export incomplete sweep"),
                }
            }
            Ok(SweepOutcome::Aborted(aborted))
        }
    }
}

async fn check_devices(config: &WaterfallConfig) -> Result<()> {
    let mut rotator = hardware::connect_rotator(&config.rotator)
        .context("Rotation stage unavailable")?;
    println!("✅ Rotation stage: {} @ {} baud", rotator.port_name(), config.rotator.baud_rate);

    let mut instrument = match hardware::connect_instrument(&config.instrument).await {
        Ok(instrument) => instrument,
        Err(e) => {
            let _ = rotator.close().await;
            return Err(e).context(format!(
                "Oscilloscope unavailable at {}",
                config.instrument.address()
            ));
        }
    };
    println!("✅ Oscilloscope: {}", instrument.identity());

    let axis = instrument.read_sweep_config().await;
    rotator.close().await?;
    instrument.close().await?;

    let axis = axis.context("Failed to read FFT configuration")?;
    println!("   FFT span:      {} Hz .. {} Hz", axis.start_frequency_hz, axis.end_frequency_hz);
    println!("   Points:        {}", axis.point_count);
    println!("   Scale/offset:  {} / {}", axis.vertical_scale, axis.vertical_offset);
    println!("   Time base:     {} s/div", axis.time_scale_s);
    Ok(())
}

async fn simulate(
    config: &WaterfallConfig,
    name: &str,
    step_ticks: u32,
    points: usize,
    stop: &StopSignal,
) -> Result<()> {
    println!("🔧 Initializing mock hardware...");
    let settings = SweepSettings::from_config(config).with_timing(Duration::ZERO, Duration::ZERO);
    let stage = MockRotator::spinning(step_ticks, settings.span_degrees)
        .with_line_interval(Duration::from_millis(1));
    let scope = InstrumentSession::open(MockScpiTransport::oscilloscope(points)).await?;

    let exporter = Exporter::new(&config.storage.output_dir);
    match finish(run_sweep(stage, scope, &settings, stop).await, &exporter, name)? {
        SweepOutcome::Exported => Ok(()),
        SweepOutcome::Aborted(aborted) => Err(aborted.into()),
    }
}
