pub mod kalman;

pub use kalman::{ensure_finite, normalize_angle, radar_measurement, KalmanFilter, ObservationModel};
