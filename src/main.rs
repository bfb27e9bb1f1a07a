//! CLI entry point for the photodiag acquisition core.
//!
//! Two headless demo commands, both wired against mock collaborators:
//! - `monitor` runs a parity-split monitoring session on a noisy mock stream
//!   and logs each refresh summary.
//! - `calibrate` runs a full calibration scan end to end (intensity norms,
//!   both axis scans, push-back) and prints the persisted constants.
//!
//! # Usage
//!
//! ```bash
//! photodiag monitor --duration 10s
//! photodiag calibrate --config photodiag.toml
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rand::Rng;
use tracing::info;

use photodiag::acquisition::{AcquisitionSession, DeriveMode, SessionOptions, StreamSource};
use photodiag::config::{Config, DeviceConfig};
use photodiag::control::ConfigValue;
use photodiag::logging::{self, TracingConfig};
use photodiag::measurement::PulseMessage;
use photodiag::mock::{MockChannelAccess, MockLogbook, MockPipelineStore, MockStreamSource};
use photodiag::refresh::{ParitySummarizer, RefreshTask};
use photodiag::scan::{
    Actuator, CalibrationSettings, DeviceCalibrator, DiodeChannels, MoveFailure,
};

#[derive(Parser)]
#[command(name = "photodiag")]
#[command(about = "Photon diagnostics acquisition core", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "photodiag.toml")]
    config: std::path::PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mock monitoring session and log each refresh summary
    Monitor {
        /// How long to monitor before stopping
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        duration: Duration,
    },

    /// Run a mock calibration scan end to end and print the constants
    Calibrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_from(&cli.config)?;
    config.validate()?;

    let level = logging::parse_log_level(&config.application.log_level)?;
    logging::init(TracingConfig::new(level), None)?;

    match cli.command {
        Commands::Monitor { duration } => monitor(&config, duration).await,
        Commands::Calibrate => calibrate(&config).await,
    }
}

async fn monitor(config: &Config, duration: Duration) -> Result<()> {
    let device = first_device(config)?;
    let channels = vec![
        device.diodes.down.clone(),
        device.diodes.up.clone(),
        device.diodes.right.clone(),
        device.diodes.left.clone(),
    ];

    let source = MockStreamSource::generator(
        channels.iter().map(|ch| (ch.clone(), 10.0)).collect(),
        Duration::from_millis(10),
    )
    .with_dropout(0.01);

    let options = SessionOptions {
        capacity: config.acquisition.buffer_capacity,
        receive_timeout: config.acquisition.receive_timeout,
    };
    let mut session = AcquisitionSession::new(channels, DeriveMode::Raw, options)?;
    session.start(source)?;

    let refresh = RefreshTask::spawn(
        session.buffer(),
        ParitySummarizer::new(config.acquisition.min_samples),
        config.acquisition.refresh_period,
    );
    let mut summaries = refresh.subscribe();

    info!(device = %device.name, "monitoring for {:?}", duration);
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            changed = summaries.changed() => {
                if changed.is_err() {
                    break;
                }
                let summary = summaries.borrow_and_update().clone();
                if summary.is_empty() {
                    info!("waiting for samples");
                } else {
                    info!(
                        even = summary.even.count,
                        odd = summary.odd.count,
                        even_mean = ?summary.even.mean,
                        odd_mean = ?summary.odd.mean,
                        "refresh"
                    );
                }
            }
        }
    }

    refresh.stop().await;
    session.stop().await;
    info!("monitoring session stopped");
    Ok(())
}

async fn calibrate(config: &Config) -> Result<()> {
    let device = first_device(config)?;
    let beamline = DemoBeamline::new();

    let settings = CalibrationSettings {
        device_prefix: device.prefix(),
        pipeline: device.pipeline_name(),
        channels: DiodeChannels {
            down: device.diodes.down.clone(),
            up: device.diodes.up.clone(),
            right: device.diodes.right.clone(),
            left: device.diodes.left.clone(),
        },
        positions: config.scan.positions(),
        num_shots: config.scan.num_shots.min(50), // demo run, keep it quick
        receive_timeout: config.acquisition.receive_timeout,
    };

    let calibrator = DeviceCalibrator::new(settings);
    let mut source = beamline.source(&device.diodes);
    let mut x_axis = beamline.x_axis();
    let mut y_axis = beamline.y_axis();

    let outcome = calibrator.run(&mut source, &mut x_axis, &mut y_axis).await?;

    let channel_access = MockChannelAccess::new();
    let pipeline_store = MockPipelineStore::new();
    let logbook = MockLogbook::new();
    calibrator
        .persist(&outcome, &channel_access, &pipeline_store)
        .await?;
    calibrator.post_logbook(&outcome, &logbook).await;

    println!("calibration of {}", device.name);
    println!("  horiz_calib = {:.6}", outcome.horiz.constant);
    println!("  vert_calib  = {:.6}", outcome.vert.constant);
    println!(
        "  norm factors (down/up/right/left): {:.6e} {:.6e} {:.6e} {:.6e}",
        outcome.norms.down, outcome.norms.up, outcome.norms.right, outcome.norms.left
    );
    if let Some(saved) = pipeline_store.saved_config(&device.pipeline_name()) {
        if let Some(ConfigValue::Int(queue)) = saved.get("queue_length") {
            println!("  pipeline queue_length = {queue}");
        }
    }
    Ok(())
}

fn first_device(config: &Config) -> Result<&DeviceConfig> {
    config
        .devices
        .first()
        .ok_or_else(|| anyhow!("no devices configured"))
}

/// Shared state of the demo beamline: the two stepper positions the mock
/// diode currents respond to.
#[derive(Clone)]
struct DemoBeamline {
    position: Arc<Mutex<(f64, f64)>>,
}

impl DemoBeamline {
    fn new() -> Self {
        Self {
            position: Arc::new(Mutex::new((0.0, 0.0))),
        }
    }

    fn source(&self, diodes: &photodiag::config::DiodeConfig) -> DemoSource {
        DemoSource {
            position: self.position.clone(),
            channels: [
                diodes.down.clone(),
                diodes.up.clone(),
                diodes.right.clone(),
                diodes.left.clone(),
            ],
            next_pulse: 0,
        }
    }

    fn x_axis(&self) -> DemoAxis {
        DemoAxis {
            position: self.position.clone(),
            horizontal: true,
        }
    }

    fn y_axis(&self) -> DemoAxis {
        DemoAxis {
            position: self.position.clone(),
            horizontal: false,
        }
    }
}

/// Mock stream whose diode currents depend on the stepper positions, so the
/// calibration scan sees a real position response.
struct DemoSource {
    position: Arc<Mutex<(f64, f64)>>,
    /// Channel names in record order (down, up, right, left).
    channels: [String; 4],
    next_pulse: u64,
}

#[async_trait]
impl StreamSource for DemoSource {
    async fn receive(&mut self) -> Result<PulseMessage> {
        let (x, y) = *self.position.lock().unwrap_or_else(|p| p.into_inner());
        let base = 10.0;
        let ideal = [
            base * (1.0 - y), // down
            base * (1.0 + y), // up
            base * (1.0 + x), // right
            base * (1.0 - x), // left
        ];
        let values = {
            let mut rng = rand::thread_rng();
            self.channels
                .iter()
                .zip(ideal)
                .map(|(name, v)| (name.clone(), Some(v * rng.gen_range(0.999..1.001))))
                .collect::<Vec<_>>()
        };
        let pulse_id = self.next_pulse;
        self.next_pulse += 1;
        tokio::time::sleep(Duration::from_micros(100)).await;
        Ok(PulseMessage::from_scalars(pulse_id, values))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct DemoAxis {
    position: Arc<Mutex<(f64, f64)>>,
    horizontal: bool,
}

#[async_trait]
impl Actuator for DemoAxis {
    async fn move_to(&mut self, target: f64) -> Result<(), MoveFailure> {
        if !(-1.0..=1.0).contains(&target) {
            return Err(MoveFailure::OutOfSoftLimits {
                target,
                low: -1.0,
                high: 1.0,
            });
        }
        let mut position = self.position.lock().unwrap_or_else(|p| p.into_inner());
        if self.horizontal {
            position.0 = target;
        } else {
            position.1 = target;
        }
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        let position = self.position.lock().unwrap_or_else(|p| p.into_inner());
        Ok(if self.horizontal {
            position.0
        } else {
            position.1
        })
    }
}
