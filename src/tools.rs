use nalgebra::{DMatrix, DVector};

use crate::error::{FilterError, FilterResult};
use crate::types::{MEASURE_DIM_RADAR, STATE_DIM};

/// Below this `px² + py²` the radar Jacobian is not evaluated.
const MIN_JACOBIAN_RANGE_SQUARED: f64 = 1e-4;

/// Component-wise root-mean-square error between estimates and ground truth.
pub fn calculate_rmse(
    estimations: &[DVector<f64>],
    ground_truth: &[DVector<f64>],
) -> FilterResult<DVector<f64>> {
    if estimations.is_empty() {
        return Err(FilterError::InvalidParameters(
            "no estimations to compare".to_string(),
        ));
    }
    if estimations.len() != ground_truth.len() {
        return Err(FilterError::InvalidParameters(format!(
            "{} estimations but {} ground truth samples",
            estimations.len(),
            ground_truth.len()
        )));
    }

    let dim = estimations[0].len();
    let mut sum_sq = DVector::<f64>::zeros(dim);
    for (est, truth) in estimations.iter().zip(ground_truth) {
        if est.len() != dim || truth.len() != dim {
            return Err(FilterError::InvalidParameters(format!(
                "sample dimensions differ: estimate {}, ground truth {}, expected {}",
                est.len(),
                truth.len(),
                dim
            )));
        }
        let residual = est - truth;
        sum_sq += residual.component_mul(&residual);
    }

    Ok((sum_sq / estimations.len() as f64).map(f64::sqrt))
}

/// Jacobian of the radar observation function at `x = (px, py, vx, vy)`.
///
/// Rows are d(range), d(bearing), d(range_rate). Returns a zero matrix when
/// the target sits on top of the sensor, where the derivatives blow up.
pub fn calculate_jacobian(x: &DVector<f64>) -> DMatrix<f64> {
    let mut hj = DMatrix::<f64>::zeros(MEASURE_DIM_RADAR, STATE_DIM);
    if x.len() < STATE_DIM {
        log::warn!("calculate_jacobian: state has {} components, need {}", x.len(), STATE_DIM);
        return hj;
    }
    let (px, py, vx, vy) = (x[0], x[1], x[2], x[3]);

    let c1 = px * px + py * py;
    if c1 < MIN_JACOBIAN_RANGE_SQUARED {
        log::warn!("calculate_jacobian: division by zero (px={:.5}, py={:.5})", px, py);
        return hj;
    }
    let c2 = c1.sqrt();
    let c3 = c1 * c2;

    hj[(0, 0)] = px / c2;
    hj[(0, 1)] = py / c2;

    hj[(1, 0)] = -py / c1;
    hj[(1, 1)] = px / c1;

    hj[(2, 0)] = py * (vx * py - vy * px) / c3;
    hj[(2, 1)] = px * (px * vy - py * vx) / c3;
    hj[(2, 2)] = px / c2;
    hj[(2, 3)] = py / c2;

    hj
}

/// Radar `(range, bearing, range_rate)` to a `(px, py, vx, vy)` state.
///
/// Velocity is the radial component only; the tangential part is unobservable
/// from a single radar return.
pub fn polar_to_cartesian(rho: f64, phi: f64, rho_dot: f64) -> DVector<f64> {
    let (sin_phi, cos_phi) = phi.sin_cos();
    DVector::from_column_slice(&[
        rho * cos_phi,
        rho * sin_phi,
        rho_dot * cos_phi,
        rho_dot * sin_phi,
    ])
}
