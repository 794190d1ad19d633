use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde_json::json;

use ekf_tracker_rs::sensor_fusion::{FusionConfig, FusionEkf, FusionEvent};
use ekf_tracker_rs::sensors::{self, SensorRecord};
use ekf_tracker_rs::tools::{calculate_rmse, polar_to_cartesian};
use ekf_tracker_rs::types::{Estimate, SensorType, StateVec};

#[derive(Parser, Debug)]
#[command(name = "ekf_tracker")]
#[command(about = "Replay a lidar/radar measurement log through the EKF tracker", long_about = None)]
struct Args {
    /// Measurement log (plain text or .gz)
    #[arg(long)]
    input: PathBuf,

    /// Write per-package estimates (tab separated) to this file
    #[arg(long)]
    output: Option<PathBuf>,

    /// JSON fusion config; missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override process noise variance along x
    #[arg(long)]
    noise_ax: Option<f64>,

    /// Override process noise variance along y
    #[arg(long)]
    noise_ay: Option<f64>,

    /// Ignore lidar packages
    #[arg(long, default_value_t = false)]
    no_lidar: bool,

    /// Ignore radar packages
    #[arg(long, default_value_t = false)]
    no_radar: bool,
}

fn build_config(args: &Args) -> Result<FusionConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => FusionConfig::from_json_file(path)?,
        None => FusionConfig::default(),
    };
    if let Some(noise_ax) = args.noise_ax {
        config.noise_ax = noise_ax;
    }
    if let Some(noise_ay) = args.noise_ay {
        config.noise_ay = noise_ay;
    }
    if args.no_lidar {
        config.use_lidar = false;
    }
    if args.no_radar {
        config.use_radar = false;
    }
    config.validate()?;
    Ok(config)
}

/// Measured position in cartesian coordinates, for the output file.
fn measured_position(record: &SensorRecord) -> (f64, f64) {
    let z = &record.measurement.raw_measurements;
    match record.measurement.sensor_type {
        SensorType::Lidar => (z[0], z[1]),
        SensorType::Radar => {
            let p = polar_to_cartesian(z[0], z[1], z[2]);
            (p[0], p[1])
        }
    }
}

fn write_row(out: &mut impl Write, est: &Estimate, record: &SensorRecord) -> Result<()> {
    let (meas_px, meas_py) = measured_position(record);
    write!(
        out,
        "{}\t{}\t{}\t{}\t{}\t{}",
        est.px, est.py, est.vx, est.vy, meas_px, meas_py
    )?;
    if let Some(gt) = record.ground_truth.as_ref() {
        write!(out, "\t{}\t{}\t{}\t{}", gt.px, gt.py, gt.vx, gt.vy)?;
    }
    writeln!(out)?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = build_config(&args)?;
    log::info!("config: {:?}", config);

    let records = sensors::load_records(&args.input)?;

    let mut output = match args.output.as_ref() {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => None,
    };

    let mut fusion = FusionEkf::new(config);
    let mut estimations: Vec<StateVec> = Vec::new();
    let mut ground_truth: Vec<StateVec> = Vec::new();
    let mut lidar_count = 0u64;
    let mut radar_count = 0u64;
    let mut skipped_count = 0u64;
    let mut error_count = 0u64;
    let mut max_lidar_nis = 0.0_f64;
    let mut max_radar_nis = 0.0_f64;

    for record in &records {
        let events = match fusion.process_measurement(&record.measurement) {
            Ok(events) => events,
            Err(e) => {
                log::warn!("t={}: {}", record.measurement.timestamp, e);
                error_count += 1;
                continue;
            }
        };

        let mut skipped = false;
        for event in &events {
            match event {
                FusionEvent::SensorSkipped { .. } => skipped = true,
                FusionEvent::LidarUpdated { nis } => max_lidar_nis = max_lidar_nis.max(*nis),
                FusionEvent::RadarUpdated { nis } => max_radar_nis = max_radar_nis.max(*nis),
                FusionEvent::Initialized { .. } | FusionEvent::Predicted { .. } => {}
            }
        }
        if skipped {
            skipped_count += 1;
            continue;
        }
        match record.measurement.sensor_type {
            SensorType::Lidar => lidar_count += 1,
            SensorType::Radar => radar_count += 1,
        }

        let est = fusion.estimate();
        if let Some(out) = output.as_mut() {
            write_row(out, &est, record)?;
        }
        if let Some(gt) = record.ground_truth.as_ref() {
            estimations.push(est.to_vector());
            ground_truth.push(gt.to_vector());
        }
    }

    if let Some(mut out) = output {
        out.flush()?;
    }

    let rmse = if ground_truth.is_empty() {
        None
    } else {
        Some(calculate_rmse(&estimations, &ground_truth)?)
    };
    let final_estimate = fusion.estimate();

    let summary = json!({
        "generated_at": Utc::now().to_rfc3339(),
        "input": args.input.display().to_string(),
        "records": records.len(),
        "lidar_updates": lidar_count,
        "radar_updates": radar_count,
        "skipped": skipped_count,
        "errors": error_count,
        "max_lidar_nis": max_lidar_nis,
        "max_radar_nis": max_radar_nis,
        "rmse": rmse.map(|r| r.iter().copied().collect::<Vec<f64>>()),
        "final_estimate": final_estimate,
        "final_speed": final_estimate.speed(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
