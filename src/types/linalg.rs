//! Linear algebra type system for the tracker
//!
//! The filter core works on dynamically sized nalgebra storage so that any
//! state dimension can be initialized; the constants below describe the
//! constant-velocity model the fusion layer builds.

use nalgebra::DVector;

// ===== State Dimensions =====
pub const STATE_DIM: usize = 4; // (px, py, vx, vy)

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_LIDAR: usize = 2; // (px, py)
pub const MEASURE_DIM_RADAR: usize = 3; // (range, bearing, range_rate)

// ===== Measurement indices =====
pub const RADAR_BEARING_IDX: usize = 1;

// ===== Filter Types =====
pub type StateVec = DVector<f64>;
pub type MeasurementVec = DVector<f64>;
