//! Three-component Gaussian decomposition of the autocorrelation waveform.
//!
//! The pooled, normalized autocorrelation of the spectrometer waveform is
//! modeled as the sum of three Gaussians sharing a center fixed at zero lag:
//! a broad background, the spectral envelope, and the spike-width component.
//! Sigmas are box-bounded to keep the components from swapping roles:
//!
//! | component | start | bounds      |
//! |-----------|-------|-------------|
//! | bkg       | 9.0   | 8.0 – 11.0  |
//! | env       | 5.0   | 4.0 – 7.0   |
//! | spike     | 0.3   | 0.05 – 1.5  |
//!
//! The solver is a plain Levenberg–Marquardt iteration over the free
//! parameters (three amplitudes, three bounded sigmas). Bounds use the
//! MINUIT-style sine transform, so the internal parameters stay unbounded.
//!
//! Fitted autocorrelation sigmas are converted to source-width sigmas by
//! dividing by 1.4. That factor is the expected autocorrelation-to-source
//! width relationship for these waveforms and is used as-is, not re-derived.

use nalgebra::{DMatrix, DVector};

use crate::error::{AppResult, PhotodiagError};
use crate::fit::FittedParam;

/// Conversion factor from an autocorrelation sigma to the corresponding
/// source sigma.
pub const AUTOCORR_TO_SOURCE_SIGMA: f64 = 1.4;

/// FWHM of a Gaussian with unit sigma.
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_4; // 2*sqrt(2*ln 2)

const COMPONENT_NAMES: [&str; 3] = ["bkg", "env", "spike"];
const SIGMA_START: [f64; 3] = [9.0, 5.0, 0.3];
const SIGMA_BOUNDS: [(f64, f64); 3] = [(8.0, 11.0), (4.0, 7.0), (0.05, 1.5)];

const MAX_ITERATIONS: usize = 200;
const COST_TOLERANCE: f64 = 1e-12;

/// Area-normalized Gaussian centered at zero:
/// `A / (σ√(2π)) · exp(−x² / 2σ²)`.
pub fn gaussian_at_zero(x: f64, amplitude: f64, sigma: f64) -> f64 {
    let norm = amplitude / (sigma * (2.0 * std::f64::consts::PI).sqrt());
    norm * (-x * x / (2.0 * sigma * sigma)).exp()
}

/// One fitted Gaussian component.
#[derive(Clone, Debug)]
pub struct GaussianComponent {
    /// Component label: `bkg`, `env` or `spike`.
    pub name: &'static str,
    /// Fitted area amplitude.
    pub amplitude: FittedParam,
    /// Fitted autocorrelation sigma.
    pub sigma: FittedParam,
}

impl GaussianComponent {
    /// Sigma of the corresponding source Gaussian (`sigma / 1.4`).
    pub fn source_sigma(&self) -> f64 {
        self.sigma.value / AUTOCORR_TO_SOURCE_SIGMA
    }

    /// FWHM of the corresponding source Gaussian.
    pub fn source_fwhm(&self) -> f64 {
        self.source_sigma() * FWHM_PER_SIGMA
    }

    /// Evaluate this component over the lag axis.
    pub fn eval(&self, lags: &[f64]) -> Vec<f64> {
        lags.iter()
            .map(|&x| gaussian_at_zero(x, self.amplitude.value, self.sigma.value))
            .collect()
    }
}

/// Result of the three-component autocorrelation fit.
#[derive(Clone, Debug)]
pub struct AutocorrelationFit {
    /// Background, envelope and spike components, in that order.
    pub components: [GaussianComponent; 3],
    /// The summed best-fit curve over the input lag axis.
    pub best_fit: Vec<f64>,
    /// Sum of squared residuals at the optimum.
    pub residual_norm: f64,
}

impl AutocorrelationFit {
    /// The background component.
    pub fn background(&self) -> &GaussianComponent {
        &self.components[0]
    }

    /// The spectral envelope component.
    pub fn envelope(&self) -> &GaussianComponent {
        &self.components[1]
    }

    /// The spike-width component.
    pub fn spike(&self) -> &GaussianComponent {
        &self.components[2]
    }
}

// MINUIT-style sine transform keeps the internal parameter unbounded while
// the external sigma stays inside its box.
fn sigma_from_internal(t: f64, (lo, hi): (f64, f64)) -> f64 {
    lo + (hi - lo) * (t.sin() + 1.0) / 2.0
}

fn internal_from_sigma(sigma: f64, (lo, hi): (f64, f64)) -> f64 {
    (2.0 * (sigma - lo) / (hi - lo) - 1.0).asin()
}

fn sigma_derivative(t: f64, (lo, hi): (f64, f64)) -> f64 {
    (hi - lo) * t.cos() / 2.0
}

/// Evaluate the summed model for an internal parameter vector
/// `[a0, a1, a2, t0, t1, t2]`.
fn model(params: &DVector<f64>, lags: &[f64]) -> Vec<f64> {
    let sigmas: Vec<f64> = (0..3)
        .map(|i| sigma_from_internal(params[3 + i], SIGMA_BOUNDS[i]))
        .collect();
    lags.iter()
        .map(|&x| {
            (0..3)
                .map(|i| gaussian_at_zero(x, params[i], sigmas[i]))
                .sum()
        })
        .collect()
}

fn residuals(params: &DVector<f64>, lags: &[f64], y: &[f64]) -> DVector<f64> {
    let m = model(params, lags);
    DVector::from_iterator(y.len(), m.iter().zip(y).map(|(mi, yi)| mi - yi))
}

/// Forward-difference Jacobian of the residual vector.
fn jacobian(params: &DVector<f64>, lags: &[f64], y: &[f64]) -> DMatrix<f64> {
    let base = residuals(params, lags, y);
    let n = y.len();
    let mut jac = DMatrix::zeros(n, 6);
    for p in 0..6 {
        let h = 1e-7 * params[p].abs().max(1.0);
        let mut stepped = params.clone();
        stepped[p] += h;
        let r = residuals(&stepped, lags, y);
        for i in 0..n {
            jac[(i, p)] = (r[i] - base[i]) / h;
        }
    }
    jac
}

/// Fit the background + envelope + spike model to a normalized
/// autocorrelation waveform.
///
/// `lags` and `y` must have equal length with at least as many samples as
/// free parameters. Non-convergence is reported as an error value; callers
/// at the refresh boundary catch it and degrade to an empty display state.
pub fn fit_autocorrelation(lags: &[f64], y: &[f64]) -> AppResult<AutocorrelationFit> {
    if lags.len() != y.len() {
        return Err(PhotodiagError::ShapeMismatch {
            expected: lags.len(),
            got: y.len(),
        });
    }
    if y.len() < 6 {
        return Err(PhotodiagError::InsufficientSamples {
            needed: 6,
            got: y.len(),
        });
    }

    let mut params = DVector::from_vec(vec![
        1.0,
        1.0,
        1.0,
        internal_from_sigma(SIGMA_START[0], SIGMA_BOUNDS[0]),
        internal_from_sigma(SIGMA_START[1], SIGMA_BOUNDS[1]),
        internal_from_sigma(SIGMA_START[2], SIGMA_BOUNDS[2]),
    ]);
    let mut cost = residuals(&params, lags, y).norm_squared();
    let mut lambda = 1e-3;
    let mut converged = false;

    for _ in 0..MAX_ITERATIONS {
        let jac = jacobian(&params, lags, y);
        let r = residuals(&params, lags, y);
        let jtj = jac.transpose() * &jac;
        let jtr = jac.transpose() * &r;

        let mut improved = false;
        for _ in 0..16 {
            let mut damped = jtj.clone();
            for i in 0..6 {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let Some(step) = damped.lu().solve(&(-&jtr)) else {
                lambda *= 4.0;
                continue;
            };
            let candidate = &params + &step;
            let candidate_cost = residuals(&candidate, lags, y).norm_squared();
            if candidate_cost < cost {
                let relative_drop = (cost - candidate_cost) / cost.max(1e-300);
                params = candidate;
                cost = candidate_cost;
                lambda = (lambda * 0.5).max(1e-12);
                improved = true;
                if relative_drop < COST_TOLERANCE {
                    converged = true;
                }
                break;
            }
            lambda *= 4.0;
        }

        if converged || !improved {
            converged = true;
            break;
        }
    }

    if !converged {
        return Err(PhotodiagError::Fit(
            "autocorrelation fit did not converge".into(),
        ));
    }

    // Parameter covariance: s²(JᵀJ)⁻¹ in internal space, propagated through
    // the sigma transform.
    let jac = jacobian(&params, lags, y);
    let dof = y.len().saturating_sub(6).max(1);
    let s2 = cost / dof as f64;
    let stderr: Vec<f64> = match (jac.transpose() * &jac).try_inverse() {
        Some(cov) => (0..6).map(|i| (s2 * cov[(i, i)].max(0.0)).sqrt()).collect(),
        None => vec![f64::NAN; 6],
    };

    let components: [GaussianComponent; 3] = std::array::from_fn(|i| {
        let t = params[3 + i];
        let sigma = sigma_from_internal(t, SIGMA_BOUNDS[i]);
        let sigma_err = sigma_derivative(t, SIGMA_BOUNDS[i]).abs() * stderr[3 + i];
        GaussianComponent {
            name: COMPONENT_NAMES[i],
            amplitude: FittedParam::new(params[i], stderr[i]),
            sigma: FittedParam::new(sigma, sigma_err),
        }
    });

    let best_fit = model(&params, lags);
    Ok(AutocorrelationFit {
        components,
        best_fit,
        residual_norm: cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn lag_axis(n: usize, span: f64) -> Vec<f64> {
        (0..n)
            .map(|i| -span + 2.0 * span * i as f64 / (n - 1) as f64)
            .collect()
    }

    fn synthetic(lags: &[f64], amps: [f64; 3], sigmas: [f64; 3]) -> Vec<f64> {
        lags.iter()
            .map(|&x| {
                (0..3)
                    .map(|i| gaussian_at_zero(x, amps[i], sigmas[i]))
                    .sum()
            })
            .collect()
    }

    #[test]
    fn gaussian_peak_height_matches_area_normalization() {
        let peak = gaussian_at_zero(0.0, 1.0, 2.0);
        assert_relative_eq!(peak, 1.0 / (2.0 * (2.0 * std::f64::consts::PI).sqrt()));
    }

    #[test]
    fn sigma_transform_round_trips_inside_bounds() {
        for &(lo, hi) in &SIGMA_BOUNDS {
            for sigma in [lo + 0.01, (lo + hi) / 2.0, hi - 0.01] {
                let t = internal_from_sigma(sigma, (lo, hi));
                assert_relative_eq!(sigma_from_internal(t, (lo, hi)), sigma, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn recovers_synthetic_three_component_waveform() {
        let lags = lag_axis(401, 30.0);
        let amps = [5.0, 3.0, 0.4];
        let sigmas = [9.5, 5.5, 0.4];
        let y = synthetic(&lags, amps, sigmas);

        let fit = fit_autocorrelation(&lags, &y).expect("fit");
        for i in 0..3 {
            assert_relative_eq!(fit.components[i].sigma.value, sigmas[i], max_relative = 0.02);
            assert_relative_eq!(
                fit.components[i].amplitude.value,
                amps[i],
                max_relative = 0.05
            );
        }
        assert!(fit.residual_norm < 1e-8);
    }

    #[test]
    fn source_sigma_uses_fixed_conversion_factor() {
        let component = GaussianComponent {
            name: "env",
            amplitude: FittedParam::new(1.0, 0.0),
            sigma: FittedParam::new(7.0, 0.1),
        };
        assert_relative_eq!(component.source_sigma(), 5.0);
        assert_relative_eq!(component.source_fwhm(), 5.0 * FWHM_PER_SIGMA);
    }

    #[test]
    fn mismatched_axes_are_rejected() {
        let err = fit_autocorrelation(&[0.0; 10], &[0.0; 9]).unwrap_err();
        assert!(matches!(err, PhotodiagError::ShapeMismatch { .. }));
    }

    #[test]
    fn too_few_samples_are_rejected() {
        let err = fit_autocorrelation(&[0.0; 4], &[0.0; 4]).unwrap_err();
        assert!(matches!(err, PhotodiagError::InsufficientSamples { .. }));
    }

    #[test]
    fn best_fit_and_components_share_the_lag_axis() {
        let lags = lag_axis(201, 25.0);
        let y = synthetic(&lags, [4.0, 2.0, 0.3], [9.0, 5.0, 0.3]);
        let fit = fit_autocorrelation(&lags, &y).expect("fit");
        assert_eq!(fit.best_fit.len(), lags.len());
        for component in &fit.components {
            assert_eq!(component.eval(&lags).len(), lags.len());
        }
    }
}
