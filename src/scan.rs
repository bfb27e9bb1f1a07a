//! Calibration scan orchestration.
//!
//! A position-sensitive detector carries four diodes (down, up, right, left)
//! behind two stepper axes. Calibration runs in three steps:
//!
//! 1. Stationary acquisition to derive per-diode intensity norm factors.
//! 2. One scan per axis: move, settle, acquire N pulses, record per-channel
//!    mean/std; the normalized asymmetry of the axis pair yields the
//!    position response.
//! 3. Push-back of the constants to the control-system records and the
//!    processing pipeline configuration.
//!
//! A move failure aborts the whole scan and nothing is persisted. The
//! persisted position constant is the endpoint/first-difference ratio of the
//! measured response, not the regression slope, which is only fitted for the
//! display overlay.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::acquisition::{DeriveMode, StreamSource};
use crate::control::{Attachment, ChannelAccess, ConfigValue, Logbook, PipelineStore};
use crate::error::{AppResult, PhotodiagError};
use crate::fit::{fit_line, LinearFit};
use crate::measurement::{ChannelValue, StreamRecord};
use crate::stats::per_channel_mean_std;

/// Why an actuator move did not complete.
#[derive(Debug, thiserror::Error)]
pub enum MoveFailure {
    /// The requested target lies outside the configured soft limits.
    #[error("target {target} outside soft limits [{low}, {high}]")]
    OutOfSoftLimits {
        /// Requested target position.
        target: f64,
        /// Lower soft limit.
        low: f64,
        /// Upper soft limit.
        high: f64,
    },
    /// The motion itself failed (stall, timeout, controller fault).
    #[error("move failed: {0}")]
    MoveError(String),
}

/// A positionable axis with wait-for-completion moves.
#[async_trait]
pub trait Actuator: Send {
    /// Move to `target` and wait until motion completes.
    async fn move_to(&mut self, target: f64) -> Result<(), MoveFailure>;

    /// Current position.
    async fn position(&self) -> anyhow::Result<f64>;
}

/// Collect `shots` value-complete pulses from the stream as raw records.
///
/// Unlike the monitoring worker, a stalled source is an error here: a scan
/// must not hang at one position, so a receive that exceeds `receive_timeout`
/// aborts the batch.
pub async fn acquire_batch<S: StreamSource>(
    source: &mut S,
    channels: &[String],
    shots: usize,
    receive_timeout: Duration,
) -> AppResult<Vec<StreamRecord>> {
    let mut records = Vec::with_capacity(shots);
    while records.len() < shots {
        let msg = tokio::time::timeout(receive_timeout, source.receive())
            .await
            .map_err(|_| PhotodiagError::Stream("receive timed out during batch".into()))?
            .map_err(PhotodiagError::Collaborator)?;
        if let Some(record) = DeriveMode::Raw.derive(channels, &msg) {
            records.push(record);
        }
    }
    Ok(records)
}

/// Per-channel statistics acquired at one scan position.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanPoint {
    /// Actuator position the batch was taken at.
    pub position: f64,
    /// Per-channel mean over the batch.
    pub mean: Vec<f64>,
    /// Per-channel population standard deviation over the batch.
    pub std: Vec<f64>,
}

/// Step an actuator over `positions`, acquiring one batch per point.
///
/// Aborts on the first move failure; the caller must not persist anything
/// from a partial scan.
pub async fn position_scan<A, S>(
    actuator: &mut A,
    source: &mut S,
    channels: &[String],
    positions: &[f64],
    shots: usize,
    receive_timeout: Duration,
) -> AppResult<Vec<ScanPoint>>
where
    A: Actuator,
    S: StreamSource,
{
    let mut points = Vec::with_capacity(positions.len());
    for &position in positions {
        actuator.move_to(position).await?;
        let batch = acquire_batch(source, channels, shots, receive_timeout).await?;
        let (mean, std) = per_channel_mean_std(&batch)?;
        info!(position, shots = batch.len(), "scan point acquired");
        points.push(ScanPoint {
            position,
            mean,
            std,
        });
    }
    Ok(points)
}

/// Normalized asymmetry of an opposing diode pair,
/// `(b·cb − a·ca) / (b·cb + a·ca)`.
pub fn normalized_asymmetry(a: f64, b: f64, ca: f64, cb: f64) -> f64 {
    (b * cb - a * ca) / (b * cb + a * ca)
}

/// Per-diode intensity norm factor, `1 / mean / 4`.
pub fn intensity_norm(mean: f64) -> AppResult<f64> {
    if mean == 0.0 {
        return Err(PhotodiagError::Fit(
            "diode mean is zero, cannot normalize".into(),
        ));
    }
    Ok(1.0 / mean / 4.0)
}

/// The persisted position constant: full scanned span over the mean first
/// difference of the normalized response,
/// `(x[last] - x[0]) / mean(diff(normalized))`.
pub fn position_calibration(positions: &[f64], normalized: &[f64]) -> AppResult<f64> {
    if positions.len() < 2 || normalized.len() != positions.len() {
        return Err(PhotodiagError::InsufficientSamples {
            needed: 2,
            got: positions.len().min(normalized.len()),
        });
    }
    let diffs: Vec<f64> = normalized.windows(2).map(|w| w[1] - w[0]).collect();
    let mean_diff = diffs.iter().sum::<f64>() / diffs.len() as f64;
    if mean_diff == 0.0 {
        return Err(PhotodiagError::Fit(
            "flat asymmetry response, calibration undefined".into(),
        ));
    }
    let span = positions[positions.len() - 1] - positions[0];
    Ok(span / mean_diff)
}

/// Diode data channels of one detector, in record order.
#[derive(Clone, Debug)]
pub struct DiodeChannels {
    /// Bottom diode channel.
    pub down: String,
    /// Top diode channel.
    pub up: String,
    /// Right diode channel.
    pub right: String,
    /// Left diode channel.
    pub left: String,
}

impl DiodeChannels {
    fn as_vec(&self) -> Vec<String> {
        vec![
            self.down.clone(),
            self.up.clone(),
            self.right.clone(),
            self.left.clone(),
        ]
    }
}

/// Per-diode norm factors, same order as [`DiodeChannels`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DiodeNorms {
    /// Bottom diode factor.
    pub down: f64,
    /// Top diode factor.
    pub up: f64,
    /// Right diode factor.
    pub right: f64,
    /// Left diode factor.
    pub left: f64,
}

/// Calibration result of one axis.
#[derive(Clone, Debug)]
pub struct AxisCalibration {
    /// Scan positions.
    pub positions: Vec<f64>,
    /// Normalized asymmetry per position.
    pub normalized: Vec<f64>,
    /// Overlay fit of normalized vs position.
    pub fit: LinearFit,
    /// The constant that gets persisted.
    pub constant: f64,
}

/// Complete outcome of a calibration run, ready for push-back.
#[derive(Clone, Debug)]
pub struct CalibrationOutcome {
    /// Per-diode intensity norm factors.
    pub norms: DiodeNorms,
    /// Horizontal axis calibration (right/left pair).
    pub horiz: AxisCalibration,
    /// Vertical axis calibration (down/up pair).
    pub vert: AxisCalibration,
}

/// Settings for one detector's calibration run.
#[derive(Clone, Debug)]
pub struct CalibrationSettings {
    /// Record prefix of the detector (e.g. `SAROP11-PBPS110:`).
    pub device_prefix: String,
    /// Processing pipeline instance name.
    pub pipeline: String,
    /// Diode data channels.
    pub channels: DiodeChannels,
    /// Scan positions for both axes.
    pub positions: Vec<f64>,
    /// Pulses per batch.
    pub num_shots: usize,
    /// Per-receive bound during batches.
    pub receive_timeout: Duration,
}

/// Orchestrates a full calibration run for one detector.
pub struct DeviceCalibrator {
    settings: CalibrationSettings,
}

impl DeviceCalibrator {
    /// Create a calibrator from settings.
    pub fn new(settings: CalibrationSettings) -> Self {
        Self { settings }
    }

    /// Run the stationary intensity calibration plus both axis scans.
    ///
    /// Any move or stream failure aborts; no partial outcome is returned.
    pub async fn run<S, X, Y>(
        &self,
        source: &mut S,
        x_axis: &mut X,
        y_axis: &mut Y,
    ) -> AppResult<CalibrationOutcome>
    where
        S: StreamSource,
        X: Actuator,
        Y: Actuator,
    {
        let channels = self.settings.channels.as_vec();
        let shots = self.settings.num_shots;
        let timeout = self.settings.receive_timeout;

        info!(device = %self.settings.device_prefix, "starting intensity calibration");
        let batch = acquire_batch(source, &channels, shots, timeout).await?;
        let (mean, _) = per_channel_mean_std(&batch)?;
        let norms = DiodeNorms {
            down: intensity_norm(mean[0])?,
            up: intensity_norm(mean[1])?,
            right: intensity_norm(mean[2])?,
            left: intensity_norm(mean[3])?,
        };

        info!("starting horizontal position scan");
        let x_points = position_scan(
            x_axis,
            source,
            &channels,
            &self.settings.positions,
            shots,
            timeout,
        )
        .await?;
        let horiz = axis_calibration(&x_points, 2, 3, norms.right, norms.left)?;

        info!("starting vertical position scan");
        let y_points = position_scan(
            y_axis,
            source,
            &channels,
            &self.settings.positions,
            shots,
            timeout,
        )
        .await?;
        let vert = axis_calibration(&y_points, 0, 1, norms.down, norms.up)?;

        info!(
            horiz = horiz.constant,
            vert = vert.constant,
            "calibration complete"
        );
        Ok(CalibrationOutcome { norms, horiz, vert })
    }

    /// Push the outcome to the position/intensity records and the pipeline
    /// configuration. Only ever called with a complete outcome.
    pub async fn persist<C, P>(
        &self,
        outcome: &CalibrationOutcome,
        channel_access: &C,
        pipeline_store: &P,
    ) -> AppResult<()>
    where
        C: ChannelAccess,
        P: PipelineStore,
    {
        let prefix = &self.settings.device_prefix;
        let ch = &self.settings.channels;
        let norms = &outcome.norms;

        let put = |field: &str, value: ChannelValue| {
            let channel = format!("{prefix}{field}");
            async move { channel_access.put(&channel, value).await }
        };

        // Combined intensity record: one input and one norm factor per diode.
        put("INTENSITY.INPA", ch.down.as_str().into()).await?;
        put("INTENSITY.INPB", ch.up.as_str().into()).await?;
        put("INTENSITY.INPC", ch.right.as_str().into()).await?;
        put("INTENSITY.INPD", ch.left.as_str().into()).await?;
        put("INTENSITY.E", norms.down.into()).await?;
        put("INTENSITY.F", norms.up.into()).await?;
        put("INTENSITY.G", norms.right.into()).await?;
        put("INTENSITY.H", norms.left.into()).await?;
        put("INTENSITY.CALC", "A*E+B*F+C*G+D*H".into()).await?;

        // Position records gate on the intensity threshold (J<D) and
        // otherwise evaluate the calibrated asymmetry.
        put("XPOS.INPA", ch.right.as_str().into()).await?;
        put("XPOS.INPB", ch.left.as_str().into()).await?;
        put("XPOS.D", 0.2.into()).await?;
        put("XPOS.E", norms.right.into()).await?;
        put("XPOS.F", norms.left.into()).await?;
        put("XPOS.G", 0.0.into()).await?;
        put("XPOS.I", outcome.horiz.constant.into()).await?;
        put("XPOS.INPJ", format!("{prefix}INTENSITY").as_str().into()).await?;
        put("XPOS.CALC", "J<D?G:I*(A*E-B*F)/(A*E+B*F)".into()).await?;

        put("YPOS.INPA", ch.down.as_str().into()).await?;
        put("YPOS.INPB", ch.up.as_str().into()).await?;
        put("YPOS.D", 0.2.into()).await?;
        put("YPOS.E", norms.down.into()).await?;
        put("YPOS.F", norms.up.into()).await?;
        put("YPOS.G", 1.0.into()).await?;
        put("YPOS.I", outcome.vert.constant.into()).await?;
        put("YPOS.INPJ", format!("{prefix}INTENSITY").as_str().into()).await?;
        put("YPOS.CALC", "J<D?G:I*(A*E-B*F)/(A*E+B*F)".into()).await?;

        // Processing pipeline restarts with the updated constants.
        let mut config = pipeline_store.get_config(&self.settings.pipeline).await?;
        config.insert("right_calib".into(), ConfigValue::Float(norms.right));
        config.insert("left_calib".into(), ConfigValue::Float(norms.left));
        config.insert("up_calib".into(), ConfigValue::Float(norms.up));
        config.insert("down_calib".into(), ConfigValue::Float(norms.down));
        config.insert(
            "horiz_calib".into(),
            ConfigValue::Float(outcome.horiz.constant),
        );
        config.insert(
            "vert_calib".into(),
            ConfigValue::Float(outcome.vert.constant),
        );
        config.insert("queue_length".into(), ConfigValue::Int(5000));
        pipeline_store
            .save_config(&self.settings.pipeline, config)
            .await?;
        pipeline_store.stop_instance(&self.settings.pipeline).await?;

        info!(pipeline = %self.settings.pipeline, "calibration persisted");
        Ok(())
    }

    /// Post the outcome to the electronic logbook. A logbook failure is
    /// logged but never fails the calibration.
    pub async fn post_logbook<L: Logbook>(&self, outcome: &CalibrationOutcome, logbook: &L) {
        let message = format!(
            "Calibration of {device}\n\
             horiz_calib = {horiz:.6}\n\
             vert_calib = {vert:.6}\n\
             norm factors (down/up/right/left): {down:.6e} {up:.6e} {right:.6e} {left:.6e}",
            device = self.settings.device_prefix,
            horiz = outcome.horiz.constant,
            vert = outcome.vert.constant,
            down = outcome.norms.down,
            up = outcome.norms.up,
            right = outcome.norms.right,
            left = outcome.norms.left,
        );
        let mut attributes = HashMap::new();
        attributes.insert("device".to_string(), self.settings.device_prefix.clone());
        attributes.insert("pipeline".to_string(), self.settings.pipeline.clone());

        let attachments: Vec<Attachment> = Vec::new();
        match logbook.post(&message, &attachments, &attributes).await {
            Ok(id) => info!(entry = id, "calibration posted to logbook"),
            Err(e) => warn!(error = %e, "logbook post failed"),
        }
    }
}

fn axis_calibration(
    points: &[ScanPoint],
    idx_a: usize,
    idx_b: usize,
    norm_a: f64,
    norm_b: f64,
) -> AppResult<AxisCalibration> {
    let positions: Vec<f64> = points.iter().map(|p| p.position).collect();
    let normalized: Vec<f64> = points
        .iter()
        .map(|p| normalized_asymmetry(p.mean[idx_a], p.mean[idx_b], norm_a, norm_b))
        .collect();
    let fit = fit_line(&positions, &normalized)?;
    let constant = position_calibration(&positions, &normalized)?;
    Ok(AxisCalibration {
        positions,
        normalized,
        fit,
        constant,
    })
}
