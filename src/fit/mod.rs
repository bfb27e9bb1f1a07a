//! Curve fitting for calibration scans and autocorrelation waveforms.
//!
//! Two fit families cover every panel:
//!
//! - [`linear`]: least-squares line fits for calibration scans, solved
//!   directly from the normal equations.
//! - [`gaussian`]: the three-component Gaussian decomposition (background +
//!   spectral envelope + spike width) of the pooled autocorrelation waveform,
//!   solved by Levenberg–Marquardt with box-bounded sigmas.
//!
//! Fit results carry a nominal value and a standard deviation per parameter.
//! All fits are recomputed from scratch on each refresh tick; nothing is
//! warm-started from the previous tick.

pub mod gaussian;
pub mod linear;

pub use gaussian::{fit_autocorrelation, AutocorrelationFit, GaussianComponent};
pub use linear::{fit_line, LinearFit};

/// A fitted parameter: nominal value plus standard deviation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FittedParam {
    /// Best-fit value.
    pub value: f64,
    /// One-sigma standard error of the value.
    pub stderr: f64,
}

impl FittedParam {
    pub(crate) fn new(value: f64, stderr: f64) -> Self {
        Self { value, stderr }
    }
}
