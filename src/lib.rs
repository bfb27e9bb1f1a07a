//! Acquisition core for beamline photon diagnostics.
//!
//! Streams beam-synchronous pulse data from position-sensitive detectors and
//! spectrometers into bounded in-memory buffers, aggregates them on a fixed
//! refresh cadence and orchestrates detector calibration scans. The browser
//! UI, plotting and the control-system wire formats live elsewhere; this
//! crate exposes the sessions, summarizers and collaborator traits they plug
//! into.
//!
//! # Modules
//!
//! - [`config`]: figment-backed configuration (TOML + environment)
//! - [`logging`]: tracing setup and the capture buffer for the log panel
//! - [`error`]: crate error type and `AppResult`
//! - [`measurement`]: pulse messages, stream records, parity
//! - [`buffer`]: bounded FIFO ring buffer and its shared wrapper
//! - [`acquisition`]: streaming worker and session lifecycle
//! - [`stats`]: parity splits, moments, correlations, peak detection
//! - [`fit`]: linear least squares and the three-Gaussian model
//! - [`refresh`]: periodic snapshot/aggregate/publish tasks
//! - [`spectral`]: waveform sessions and the spectral panel summarizers
//! - [`scan`]: calibration scans and push-back of the constants
//! - [`control`]: control-system, pipeline and logbook trait seams
//! - [`mock`]: mock collaborators for tests and the demo binary

pub mod acquisition;
pub mod buffer;
pub mod config;
pub mod control;
pub mod error;
pub mod fit;
pub mod logging;
pub mod measurement;
pub mod mock;
pub mod refresh;
pub mod scan;
pub mod spectral;
pub mod stats;

pub use error::{AppResult, PhotodiagError};
