//! Linear / Extended Kalman Filter core
//!
//! Owns the state vector `x`, covariance `P` and the four model matrices
//! (`F`, `H`, `R`, `Q`). The caller sizes every matrix, hands them to
//! [`KalmanFilter::init`], and then drives `predict` followed by either
//! `update` (linear sensor) or `update_ekf` (radar) as measurements arrive.
//!
//! The core never decides when to predict; the fusion layer sets `F`/`Q`
//! for the current time step and `H`/`R` for the current sensor before
//! each call.

use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

use crate::error::{ensure_shape, FilterError, FilterResult};
use crate::types::{MEASURE_DIM_RADAR, RADAR_BEARING_IDX, STATE_DIM};

/// Floor applied to `px² + py²` before the radar prediction divides by it.
pub const MIN_RANGE_SQUARED: f64 = 1e-5;

/// `‖S·S⁻¹ − I‖∞` above this is reported as a poorly conditioned innovation.
const INVERSION_RESIDUAL_TOL: f64 = 1e-6;

/// Which observation model a measurement goes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObservationModel {
    /// `z = H·x`
    Linear,
    /// `z = h(x)` for a radar, with `H` holding the Jacobian at `x`
    Extended,
}

#[derive(Clone, Debug)]
pub struct KalmanFilter {
    /// State vector [N]
    pub x: DVector<f64>,

    /// State covariance [N×N]
    pub p: DMatrix<f64>,

    /// State transition [N×N]
    pub f: DMatrix<f64>,

    /// Observation model or Jacobian [M×N]
    pub h: DMatrix<f64>,

    /// Measurement noise [M×M]
    pub r: DMatrix<f64>,

    /// Process noise [N×N]
    pub q: DMatrix<f64>,

    /// Normalized innovation squared of the last successful update
    last_nis: Option<f64>,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl KalmanFilter {
    /// Empty filter; every matrix is 0×0 until `init` is called.
    pub fn new() -> Self {
        Self {
            x: DVector::zeros(0),
            p: DMatrix::zeros(0, 0),
            f: DMatrix::zeros(0, 0),
            h: DMatrix::zeros(0, 0),
            r: DMatrix::zeros(0, 0),
            q: DMatrix::zeros(0, 0),
            last_nis: None,
        }
    }

    /// Copy the initial state and model matrices into the filter,
    /// replacing whatever it held before. Shapes are not checked here.
    pub fn init(
        &mut self,
        x_in: &DVector<f64>,
        p_in: &DMatrix<f64>,
        f_in: &DMatrix<f64>,
        h_in: &DMatrix<f64>,
        r_in: &DMatrix<f64>,
        q_in: &DMatrix<f64>,
    ) {
        self.x = x_in.clone();
        self.p = p_in.clone();
        self.f = f_in.clone();
        self.h = h_in.clone();
        self.r = r_in.clone();
        self.q = q_in.clone();
        self.last_nis = None;
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.x
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.p
    }

    pub fn state_dim(&self) -> usize {
        self.x.len()
    }

    /// `yᵗ·S⁻¹·y` from the most recent `update`/`update_ekf`.
    pub fn last_nis(&self) -> Option<f64> {
        self.last_nis
    }

    /// Prediction step: `x ← F·x`, `P ← F·P·Fᵗ + Q`.
    pub fn predict(&mut self) -> FilterResult<()> {
        let n = self.x.len();
        ensure_shape("F", (n, n), self.f.shape())?;
        ensure_shape("P", (n, n), self.p.shape())?;
        ensure_shape("Q", (n, n), self.q.shape())?;

        self.x = &self.f * &self.x;
        self.p = &self.f * &self.p * self.f.transpose() + &self.q;
        Ok(())
    }

    /// Linear measurement update with `z = H·x + v`.
    pub fn update(&mut self, z: &DVector<f64>) -> FilterResult<()> {
        self.check_observation(z.len())?;
        ensure_finite(z)?;

        let z_pred = &self.h * &self.x;
        let y = z - z_pred;
        self.correct(&y)
    }

    /// Radar measurement update. `H` must already hold the Jacobian of the
    /// radar observation function at the current `x`.
    pub fn update_ekf(&mut self, z: &DVector<f64>) -> FilterResult<()> {
        ensure_shape("z", (MEASURE_DIM_RADAR, 1), (z.len(), 1))?;
        self.check_observation(z.len())?;
        ensure_finite(z)?;

        let z_pred = radar_measurement(&self.x)?;
        let mut y = z - z_pred;

        // Bearing is circular; keep the innovation in [-pi, pi]
        y[RADAR_BEARING_IDX] = normalize_angle(y[RADAR_BEARING_IDX]);

        self.correct(&y)
    }

    /// Dispatch to `update` or `update_ekf`.
    pub fn update_with(&mut self, model: ObservationModel, z: &DVector<f64>) -> FilterResult<()> {
        match model {
            ObservationModel::Linear => self.update(z),
            ObservationModel::Extended => self.update_ekf(z),
        }
    }

    fn check_observation(&self, m: usize) -> FilterResult<()> {
        let n = self.x.len();
        ensure_shape("H", (m, n), self.h.shape())?;
        ensure_shape("R", (m, m), self.r.shape())?;
        ensure_shape("P", (n, n), self.p.shape())
    }

    /// Shared correction given an innovation `y`. Nothing is written back
    /// unless `S` inverts.
    fn correct(&mut self, y: &DVector<f64>) -> FilterResult<()> {
        let n = self.x.len();
        let m = y.len();

        let ht = self.h.transpose();
        let s = &self.h * &self.p * &ht + &self.r;
        let Some(s_inv) = s.clone().try_inverse() else {
            let determinant = s.determinant();
            log::warn!("Innovation covariance is singular (det = {:e})", determinant);
            return Err(FilterError::SingularInnovation { determinant });
        };

        let residual = (&s * &s_inv - DMatrix::<f64>::identity(m, m)).amax();
        if residual > INVERSION_RESIDUAL_TOL {
            log::warn!(
                "Innovation covariance poorly conditioned: inversion residual {:e}",
                residual
            );
        }

        let k = &self.p * &ht * &s_inv;
        self.x += &k * y;

        let identity = DMatrix::<f64>::identity(n, n);
        self.p = (identity - &k * &self.h) * &self.p;

        let nis = y.dot(&(&s_inv * y));
        self.last_nis = Some(nis);
        log::debug!("correction: |y| = {:.4}, nis = {:.4}", y.norm(), nis);
        Ok(())
    }
}

/// Beyond this many radians the wrap is done in one step instead of by
/// repeated turns.
const WRAP_LOOP_LIMIT: f64 = 16.0 * PI;

/// Wrap an angle into `[-pi, pi]` by whole turns. Non-finite input comes
/// back as NaN.
pub fn normalize_angle(mut angle: f64) -> f64 {
    if !angle.is_finite() || angle.abs() > WRAP_LOOP_LIMIT {
        angle = (angle + PI).rem_euclid(2.0 * PI) - PI;
    }
    while angle < -PI {
        angle += 2.0 * PI;
    }
    while angle > PI {
        angle -= 2.0 * PI;
    }
    angle
}

/// Reject a measurement holding NaN or infinity before it touches the state.
pub fn ensure_finite(z: &DVector<f64>) -> FilterResult<()> {
    match z.iter().position(|v| !v.is_finite()) {
        Some(i) => Err(FilterError::InvalidParameters(format!(
            "measurement component {} is not finite ({})",
            i, z[i]
        ))),
        None => Ok(()),
    }
}

/// Radar observation function `h(x) = (range, bearing, range_rate)` for a
/// `(px, py, vx, vy, ...)` state. `px² + py²` is floored at
/// [`MIN_RANGE_SQUARED`] so a target at the origin stays finite.
pub fn radar_measurement(x: &DVector<f64>) -> FilterResult<DVector<f64>> {
    if x.len() < STATE_DIM {
        return Err(FilterError::DimensionMismatch {
            name: "x",
            expected: (STATE_DIM, 1),
            actual: (x.len(), 1),
        });
    }
    let (px, py, vx, vy) = (x[0], x[1], x[2], x[3]);

    let c1 = (px * px + py * py).max(MIN_RANGE_SQUARED);
    let range = c1.sqrt();

    Ok(DVector::from_column_slice(&[
        range,
        py.atan2(px),
        (px * vx + py * vy) / range,
    ]))
}
