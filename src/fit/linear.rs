//! Least-squares line fit `y = m·x + a`.

use nalgebra::{DMatrix, DVector};

use crate::error::{AppResult, PhotodiagError};
use crate::fit::FittedParam;

/// Result of a least-squares line fit.
#[derive(Clone, Debug)]
pub struct LinearFit {
    /// Fitted slope `m`.
    pub slope: FittedParam,
    /// Fitted intercept `a`.
    pub intercept: FittedParam,
}

impl LinearFit {
    /// Evaluate the fitted line at `x`.
    pub fn eval(&self, x: f64) -> f64 {
        self.slope.value * x + self.intercept.value
    }

    /// Evaluate the fitted line over a set of points.
    pub fn eval_many(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.eval(x)).collect()
    }
}

/// Fit `y = m·x + a` by solving the normal equations.
///
/// Requires at least two points with distinct x values. With exactly two
/// points the standard errors are zero (the fit is exact). The fitted slope
/// is used for display overlays only; the persisted calibration constant is
/// the endpoint-difference ratio computed in [`crate::scan`], not this slope.
pub fn fit_line(x: &[f64], y: &[f64]) -> AppResult<LinearFit> {
    if x.len() != y.len() {
        return Err(PhotodiagError::ShapeMismatch {
            expected: x.len(),
            got: y.len(),
        });
    }
    let n = x.len();
    if n < 2 {
        return Err(PhotodiagError::InsufficientSamples { needed: 2, got: n });
    }

    // Design matrix [x | 1]; solve (AᵀA)β = Aᵀy.
    let a = DMatrix::from_fn(n, 2, |row, col| if col == 0 { x[row] } else { 1.0 });
    let yv = DVector::from_column_slice(y);
    let ata = a.transpose() * &a;
    let aty = a.transpose() * &yv;
    let ata_inv = ata
        .try_inverse()
        .ok_or_else(|| PhotodiagError::Fit("x values are not distinct".into()))?;
    let beta = &ata_inv * aty;

    let residuals = &yv - &a * &beta;
    let dof = n.saturating_sub(2);
    let sigma2 = if dof > 0 {
        residuals.norm_squared() / dof as f64
    } else {
        0.0
    };

    Ok(LinearFit {
        slope: FittedParam::new(beta[0], (sigma2 * ata_inv[(0, 0)]).sqrt()),
        intercept: FittedParam::new(beta[1], (sigma2 * ata_inv[(1, 1)]).sqrt()),
    })
}
