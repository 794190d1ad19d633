//! Lidar/radar tracking with a linear + extended Kalman filter.
//!
//! [`filters::KalmanFilter`] is the estimator core. [`sensor_fusion::FusionEkf`]
//! schedules it over a stream of [`types::MeasurementPackage`]s, and
//! [`sensors`] reads those from recorded logs.

pub mod error;
pub mod filters;
pub mod sensor_fusion;
pub mod sensors;
pub mod tools;
pub mod types;

pub use error::{FilterError, FilterResult};
pub use filters::{KalmanFilter, ObservationModel};
pub use sensor_fusion::{FusionConfig, FusionEkf, FusionEvent};
