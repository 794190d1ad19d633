pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Lidar,
    Radar,
}

impl SensorType {
    pub fn measurement_dim(self) -> usize {
        match self {
            SensorType::Lidar => MEASURE_DIM_LIDAR,
            SensorType::Radar => MEASURE_DIM_RADAR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SensorType::Lidar => "lidar",
            SensorType::Radar => "radar",
        }
    }
}

/// One sensor reading handed to the fusion layer.
///
/// Lidar: `(px, py)`. Radar: `(range, bearing, range_rate)`.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementPackage {
    pub sensor_type: SensorType,
    /// Microseconds
    pub timestamp: i64,
    pub raw_measurements: MeasurementVec,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub px: f64,
    pub py: f64,
    pub vx: f64,
    pub vy: f64,
}

impl GroundTruth {
    pub fn to_vector(&self) -> StateVec {
        StateVec::from_column_slice(&[self.px, self.py, self.vx, self.vy])
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub px: f64,
    pub py: f64,
    pub vx: f64,
    pub vy: f64,
}

impl Estimate {
    pub fn to_vector(&self) -> StateVec {
        StateVec::from_column_slice(&[self.px, self.py, self.vx, self.vy])
    }

    pub fn speed(&self) -> f64 {
        (self.vx * self.vx + self.vy * self.vy).sqrt()
    }
}
