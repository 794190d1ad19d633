// sensor_fusion.rs — Lidar/radar scheduling layer around the filter core
//
// The filter core only knows predict/update. This layer decides when to call
// them: it initializes the state from the first measurement, turns timestamp
// deltas into F and Q, and picks H/R (or the radar Jacobian) per sensor.
// No I/O happens here, so recorded logs and unit tests drive it directly.

use std::path::Path;

use anyhow::Context;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, FilterResult};
use crate::filters::{ensure_finite, KalmanFilter};
use crate::tools::{calculate_jacobian, polar_to_cartesian};
use crate::types::{Estimate, MeasurementPackage, SensorType, MEASURE_DIM_LIDAR, STATE_DIM};

const MICROS_PER_SEC: f64 = 1_000_000.0;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    // ── Process noise (white-noise acceleration variances) ──
    pub noise_ax: f64,
    pub noise_ay: f64,

    // ── Lidar noise (std devs, meters) ──
    pub lidar_std_px: f64,
    pub lidar_std_py: f64,

    // ── Radar noise (std devs) ──
    pub radar_std_rho: f64,
    pub radar_std_phi: f64,
    pub radar_std_rho_dot: f64,

    // ── Initial covariance ──
    pub initial_position_variance: f64,
    pub initial_velocity_variance: f64,

    // ── Feature flags ──
    pub use_lidar: bool,
    pub use_radar: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            noise_ax: 9.0,
            noise_ay: 9.0,
            lidar_std_px: 0.15,
            lidar_std_py: 0.15,
            radar_std_rho: 0.3,
            radar_std_phi: 0.03,
            radar_std_rho_dot: 0.3,
            initial_position_variance: 1.0,
            initial_velocity_variance: 1000.0,
            use_lidar: true,
            use_radar: true,
        }
    }
}

impl FusionConfig {
    /// Load a JSON config; fields missing from the file keep their defaults.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FilterResult<()> {
        let std_devs = [
            ("lidar_std_px", self.lidar_std_px),
            ("lidar_std_py", self.lidar_std_py),
            ("radar_std_rho", self.radar_std_rho),
            ("radar_std_phi", self.radar_std_phi),
            ("radar_std_rho_dot", self.radar_std_rho_dot),
        ];
        for (name, value) in std_devs {
            if !(value > 0.0) {
                return Err(FilterError::InvalidParameters(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }

        let variances = [
            ("noise_ax", self.noise_ax),
            ("noise_ay", self.noise_ay),
            ("initial_position_variance", self.initial_position_variance),
            ("initial_velocity_variance", self.initial_velocity_variance),
        ];
        for (name, value) in variances {
            if !(value >= 0.0) {
                return Err(FilterError::InvalidParameters(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }

        if !self.use_lidar && !self.use_radar {
            return Err(FilterError::InvalidParameters(
                "at least one of use_lidar / use_radar must be enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lidar_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_column_slice(&[
            self.lidar_std_px.powi(2),
            self.lidar_std_py.powi(2),
        ]))
    }

    pub fn radar_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_column_slice(&[
            self.radar_std_rho.powi(2),
            self.radar_std_phi.powi(2),
            self.radar_std_rho_dot.powi(2),
        ]))
    }

    pub fn sensor_enabled(&self, sensor: SensorType) -> bool {
        match sensor {
            SensorType::Lidar => self.use_lidar,
            SensorType::Radar => self.use_radar,
        }
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum FusionEvent {
    Initialized { sensor: SensorType, timestamp: i64 },
    SensorSkipped { sensor: SensorType },
    Predicted { dt: f64 },
    LidarUpdated { nis: f64 },
    RadarUpdated { nis: f64 },
}

// ─── The main fusion struct ──────────────────────────────────────────────────

pub struct FusionEkf {
    config: FusionConfig,

    ekf: KalmanFilter,

    // Sensor models
    r_laser: DMatrix<f64>,
    r_radar: DMatrix<f64>,
    h_laser: DMatrix<f64>,

    initialized: bool,
    previous_timestamp: i64,
}

impl FusionEkf {
    pub fn new(config: FusionConfig) -> Self {
        let mut h_laser = DMatrix::<f64>::zeros(MEASURE_DIM_LIDAR, STATE_DIM);
        h_laser[(0, 0)] = 1.0;
        h_laser[(1, 1)] = 1.0;

        Self {
            r_laser: config.lidar_noise(),
            r_radar: config.radar_noise(),
            h_laser,
            ekf: KalmanFilter::new(),
            initialized: false,
            previous_timestamp: 0,
            config,
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn filter(&self) -> &KalmanFilter {
        &self.ekf
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Current estimate; all zeros before the first measurement.
    pub fn estimate(&self) -> Estimate {
        if !self.initialized {
            return Estimate::default();
        }
        let x = self.ekf.state();
        Estimate {
            px: x[0],
            py: x[1],
            vx: x[2],
            vy: x[3],
        }
    }

    /// Run one measurement through initialize or predict + update.
    ///
    /// Malformed packages (disabled-sensor aside) are rejected before the
    /// filter is touched. If the update itself fails after the prediction
    /// ran, the predicted state and its timestamp are kept and the error is
    /// returned; the next package predicts from there.
    pub fn process_measurement(
        &mut self,
        package: &MeasurementPackage,
    ) -> FilterResult<Vec<FusionEvent>> {
        let mut events = Vec::new();
        let sensor = package.sensor_type;

        if !self.config.sensor_enabled(sensor) {
            log::debug!("skipping {} package at t={}", sensor.as_str(), package.timestamp);
            events.push(FusionEvent::SensorSkipped { sensor });
            return Ok(events);
        }

        let z = &package.raw_measurements;
        let expected_dim = sensor.measurement_dim();
        if z.len() != expected_dim {
            return Err(FilterError::DimensionMismatch {
                name: "z",
                expected: (expected_dim, 1),
                actual: (z.len(), 1),
            });
        }
        ensure_finite(z)?;

        // Cold start: first measurement initializes the state
        if !self.initialized {
            self.initialize(package);
            events.push(FusionEvent::Initialized {
                sensor,
                timestamp: package.timestamp,
            });
            return Ok(events);
        }

        if package.timestamp < self.previous_timestamp {
            return Err(FilterError::NonMonotonicTimestamp {
                previous: self.previous_timestamp,
                current: package.timestamp,
            });
        }
        let Some(elapsed) = package.timestamp.checked_sub(self.previous_timestamp) else {
            return Err(FilterError::InvalidParameters(format!(
                "time step from t={} to t={} overflows",
                self.previous_timestamp, package.timestamp
            )));
        };
        let dt = elapsed as f64 / MICROS_PER_SEC;

        // Prediction
        self.ekf.f = transition_matrix(dt);
        self.ekf.q = process_noise(dt, self.config.noise_ax, self.config.noise_ay);
        self.ekf.predict()?;
        self.previous_timestamp = package.timestamp;
        events.push(FusionEvent::Predicted { dt });

        // Measurement update
        match sensor {
            SensorType::Lidar => {
                self.ekf.h = self.h_laser.clone();
                self.ekf.r = self.r_laser.clone();
                self.ekf.update(z)?;
                events.push(FusionEvent::LidarUpdated {
                    nis: self.ekf.last_nis().unwrap_or_default(),
                });
            }
            SensorType::Radar => {
                self.ekf.h = calculate_jacobian(self.ekf.state());
                self.ekf.r = self.r_radar.clone();
                self.ekf.update_ekf(z)?;
                events.push(FusionEvent::RadarUpdated {
                    nis: self.ekf.last_nis().unwrap_or_default(),
                });
            }
        }

        log::debug!(
            "t={} dt={:.3}s x=[{:.3}, {:.3}, {:.3}, {:.3}]",
            package.timestamp,
            dt,
            self.ekf.x[0],
            self.ekf.x[1],
            self.ekf.x[2],
            self.ekf.x[3]
        );

        Ok(events)
    }

    fn initialize(&mut self, package: &MeasurementPackage) {
        let z = &package.raw_measurements;
        let x0 = match package.sensor_type {
            SensorType::Lidar => DVector::from_column_slice(&[z[0], z[1], 0.0, 0.0]),
            SensorType::Radar => polar_to_cartesian(z[0], z[1], z[2]),
        };

        let pos_var = self.config.initial_position_variance;
        let vel_var = self.config.initial_velocity_variance;
        let p0 = DMatrix::from_diagonal(&DVector::from_column_slice(&[
            pos_var, pos_var, vel_var, vel_var,
        ]));

        self.ekf.init(
            &x0,
            &p0,
            &DMatrix::identity(STATE_DIM, STATE_DIM),
            &self.h_laser,
            &self.r_laser,
            &DMatrix::zeros(STATE_DIM, STATE_DIM),
        );
        self.previous_timestamp = package.timestamp;
        self.initialized = true;

        log::info!(
            "initialized from {} at t={}: px={:.3} py={:.3}",
            package.sensor_type.as_str(),
            package.timestamp,
            x0[0],
            x0[1]
        );
    }
}

/// Constant-velocity transition for a step of `dt` seconds.
pub fn transition_matrix(dt: f64) -> DMatrix<f64> {
    let mut f = DMatrix::<f64>::identity(STATE_DIM, STATE_DIM);
    f[(0, 2)] = dt;
    f[(1, 3)] = dt;
    f
}

/// Process noise of the white-noise acceleration model.
pub fn process_noise(dt: f64, noise_ax: f64, noise_ay: f64) -> DMatrix<f64> {
    let dt2 = dt * dt;
    let dt3 = dt2 * dt;
    let dt4 = dt3 * dt;

    let mut q = DMatrix::<f64>::zeros(STATE_DIM, STATE_DIM);
    for (pos, vel, noise) in [(0, 2, noise_ax), (1, 3, noise_ay)] {
        q[(pos, pos)] = dt4 / 4.0 * noise;
        q[(pos, vel)] = dt3 / 2.0 * noise;
        q[(vel, pos)] = dt3 / 2.0 * noise;
        q[(vel, vel)] = dt2 * noise;
    }
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn lidar(timestamp: i64, px: f64, py: f64) -> MeasurementPackage {
        MeasurementPackage {
            sensor_type: SensorType::Lidar,
            timestamp,
            raw_measurements: DVector::from_column_slice(&[px, py]),
        }
    }

    fn radar(timestamp: i64, rho: f64, phi: f64, rho_dot: f64) -> MeasurementPackage {
        MeasurementPackage {
            sensor_type: SensorType::Radar,
            timestamp,
            raw_measurements: DVector::from_column_slice(&[rho, phi, rho_dot]),
        }
    }

    #[test]
    fn test_lidar_cold_start() {
        let mut fusion = FusionEkf::new(FusionConfig::default());
        assert_eq!(fusion.estimate(), Estimate::default());

        let events = fusion.process_measurement(&lidar(1_000, 0.5, -0.3)).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            FusionEvent::Initialized { sensor: SensorType::Lidar, timestamp: 1_000 }
        )));
        assert!(fusion.is_initialized());

        let est = fusion.estimate();
        assert_eq!((est.px, est.py, est.vx, est.vy), (0.5, -0.3, 0.0, 0.0));
        assert_eq!(fusion.filter().p[(2, 2)], 1000.0);
        assert_eq!(fusion.filter().p[(0, 0)], 1.0);
    }

    #[test]
    fn test_radar_cold_start() {
        let mut fusion = FusionEkf::new(FusionConfig::default());
        fusion
            .process_measurement(&radar(0, 2.0, std::f64::consts::FRAC_PI_2, 1.0))
            .unwrap();

        let est = fusion.estimate();
        assert_abs_diff_eq!(est.px, 0.0, epsilon = 1e-12);
        assert_relative_eq!(est.py, 2.0, epsilon = 1e-12);
        assert_relative_eq!(est.vy, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_predict_and_update_events() {
        let mut fusion = FusionEkf::new(FusionConfig::default());
        fusion.process_measurement(&lidar(0, 1.0, 1.0)).unwrap();

        let events = fusion.process_measurement(&lidar(100_000, 1.1, 1.0)).unwrap();
        assert_eq!(events.len(), 2);
        match events[0] {
            FusionEvent::Predicted { dt } => assert_relative_eq!(dt, 0.1),
            ref other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(events[1], FusionEvent::LidarUpdated { .. }));
        assert_relative_eq!(fusion.filter().f[(0, 2)], 0.1);

        let events = fusion.process_measurement(&radar(200_000, 1.6, 0.7, 0.5)).unwrap();
        assert!(matches!(events[1], FusionEvent::RadarUpdated { .. }));
        assert_eq!(fusion.filter().h.shape(), (3, 4));
    }

    #[test]
    fn test_timestamp_regression_is_rejected() {
        let mut fusion = FusionEkf::new(FusionConfig::default());
        fusion.process_measurement(&lidar(500, 1.0, 1.0)).unwrap();
        let before = fusion.estimate();

        let err = fusion.process_measurement(&lidar(100, 2.0, 2.0)).unwrap_err();
        assert_eq!(
            err,
            FilterError::NonMonotonicTimestamp {
                previous: 500,
                current: 100
            }
        );
        assert_eq!(fusion.estimate(), before);
    }

    #[test]
    fn test_timestamp_overflow_is_rejected() {
        let mut fusion = FusionEkf::new(FusionConfig::default());
        fusion.process_measurement(&lidar(i64::MIN, 1.0, 1.0)).unwrap();
        let before = fusion.estimate();

        let err = fusion.process_measurement(&lidar(i64::MAX, 2.0, 2.0)).unwrap_err();
        assert!(matches!(err, FilterError::InvalidParameters(_)));
        assert_eq!(fusion.estimate(), before);
        assert_eq!(fusion.previous_timestamp, i64::MIN);
    }

    #[test]
    fn test_huge_bearing_is_processed() {
        let mut fusion = FusionEkf::new(FusionConfig::default());
        fusion.process_measurement(&radar(0, 2.0, 0.5, 0.1)).unwrap();

        let events = fusion
            .process_measurement(&radar(100_000, 2.0, 1e20, 0.1))
            .unwrap();
        assert!(matches!(events[1], FusionEvent::RadarUpdated { .. }));
        assert!(fusion.filter().state().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_non_finite_measurement_leaves_filter_untouched() {
        let mut fusion = FusionEkf::new(FusionConfig::default());
        assert!(matches!(
            fusion.process_measurement(&radar(0, 2.0, f64::INFINITY, 0.1)),
            Err(FilterError::InvalidParameters(_))
        ));
        assert!(!fusion.is_initialized());

        fusion.process_measurement(&radar(0, 2.0, 0.5, 0.1)).unwrap();
        let before = fusion.filter().clone();
        assert!(matches!(
            fusion.process_measurement(&radar(100_000, 2.0, f64::NAN, 0.1)),
            Err(FilterError::InvalidParameters(_))
        ));
        assert_eq!(fusion.filter().x, before.x);
        assert_eq!(fusion.filter().p, before.p);
        assert_eq!(fusion.previous_timestamp, 0);
    }

    #[test]
    fn test_failed_update_keeps_prediction() {
        let mut fusion = FusionEkf::new(FusionConfig::default());
        fusion.process_measurement(&lidar(0, 1.0, 1.0)).unwrap();
        let p_before = fusion.filter().p[(0, 0)];

        // Zero H and R make the innovation covariance singular
        fusion.h_laser = DMatrix::zeros(MEASURE_DIM_LIDAR, STATE_DIM);
        fusion.r_laser = DMatrix::zeros(MEASURE_DIM_LIDAR, MEASURE_DIM_LIDAR);
        let err = fusion.process_measurement(&lidar(1_000_000, 1.5, 1.5)).unwrap_err();
        assert!(matches!(err, FilterError::SingularInnovation { .. }));

        assert_eq!(fusion.previous_timestamp, 1_000_000);
        assert!(fusion.filter().p[(0, 0)] > p_before);
        assert!(matches!(
            fusion.process_measurement(&lidar(500_000, 1.5, 1.5)),
            Err(FilterError::NonMonotonicTimestamp { .. })
        ));
    }

    #[test]
    fn test_disabled_sensor_is_skipped() {
        let config = FusionConfig {
            use_radar: false,
            ..FusionConfig::default()
        };
        let mut fusion = FusionEkf::new(config);

        let events = fusion.process_measurement(&radar(0, 1.0, 0.0, 0.0)).unwrap();
        assert_eq!(
            events,
            vec![FusionEvent::SensorSkipped {
                sensor: SensorType::Radar
            }]
        );
        assert!(!fusion.is_initialized());
    }

    #[test]
    fn test_wrong_measurement_size() {
        let mut fusion = FusionEkf::new(FusionConfig::default());
        let bad = MeasurementPackage {
            sensor_type: SensorType::Radar,
            timestamp: 0,
            raw_measurements: DVector::from_column_slice(&[1.0, 0.5]),
        };
        assert!(matches!(
            fusion.process_measurement(&bad),
            Err(FilterError::DimensionMismatch { name: "z", .. })
        ));
    }

    #[test]
    fn test_tracks_constant_velocity_target() {
        let mut fusion = FusionEkf::new(FusionConfig::default());
        let (vx, vy) = (2.0, 1.0);
        let step_us = 50_000;

        for k in 0..120i64 {
            let t = k as f64 * 0.05;
            let (px, py) = (3.0 + vx * t, 1.0 + vy * t);
            let package = if k % 2 == 0 {
                lidar(k * step_us, px, py)
            } else {
                let rho = (px * px + py * py).sqrt();
                radar(k * step_us, rho, py.atan2(px), (px * vx + py * vy) / rho)
            };
            fusion.process_measurement(&package).unwrap();
        }

        let est = fusion.estimate();
        let t_end = 119.0 * 0.05;
        assert_abs_diff_eq!(est.px, 3.0 + vx * t_end, epsilon = 0.1);
        assert_abs_diff_eq!(est.py, 1.0 + vy * t_end, epsilon = 0.1);
        assert_abs_diff_eq!(est.vx, vx, epsilon = 0.25);
        assert_abs_diff_eq!(est.vy, vy, epsilon = 0.25);
    }

    #[test]
    fn test_process_noise_matrix() {
        let q = process_noise(0.1, 9.0, 4.0);
        assert_relative_eq!(q[(0, 0)], 0.0001 / 4.0 * 9.0, epsilon = 1e-15);
        assert_relative_eq!(q[(0, 2)], 0.001 / 2.0 * 9.0, epsilon = 1e-15);
        assert_relative_eq!(q[(3, 1)], 0.001 / 2.0 * 4.0, epsilon = 1e-15);
        assert_relative_eq!(q[(3, 3)], 0.01 * 4.0, epsilon = 1e-15);
        assert_eq!(q[(0, 1)], 0.0);
        assert_eq!(q, q.transpose());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: FusionConfig =
            serde_json::from_str(r#"{ "noise_ax": 5.0, "use_lidar": false }"#).unwrap();
        assert_eq!(config.noise_ax, 5.0);
        assert_eq!(config.noise_ay, 9.0);
        assert!(!config.use_lidar);
        assert!(config.use_radar);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_json_file() {
        let path = std::env::temp_dir().join(format!(
            "ekf_tracker_config_{}.json",
            std::process::id()
        ));
        std::fs::write(&path, r#"{ "radar_std_phi": 0.05 }"#).unwrap();
        let config = FusionConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.radar_std_phi, 0.05);
        assert_relative_eq!(config.radar_noise()[(1, 1)], 0.0025, epsilon = 1e-15);
    }

    #[test]
    fn test_config_validation() {
        assert!(FusionConfig::default().validate().is_ok());

        let negative = FusionConfig {
            lidar_std_px: -0.1,
            ..FusionConfig::default()
        };
        assert!(matches!(
            negative.validate(),
            Err(FilterError::InvalidParameters(_))
        ));

        let nothing = FusionConfig {
            use_lidar: false,
            use_radar: false,
            ..FusionConfig::default()
        };
        assert!(nothing.validate().is_err());
    }

    #[test]
    fn test_default_noise_matrices() {
        let config = FusionConfig::default();
        let r_laser = config.lidar_noise();
        assert_relative_eq!(r_laser[(0, 0)], 0.0225, epsilon = 1e-15);
        assert_relative_eq!(r_laser[(1, 1)], 0.0225, epsilon = 1e-15);

        let r_radar = config.radar_noise();
        assert_relative_eq!(r_radar[(0, 0)], 0.09, epsilon = 1e-15);
        assert_relative_eq!(r_radar[(1, 1)], 0.0009, epsilon = 1e-15);
        assert_relative_eq!(r_radar[(2, 2)], 0.09, epsilon = 1e-15);
    }
}
