//! Measurement log reader
//!
//! One package per line, whitespace separated:
//!
//! ```text
//! L  px  py  timestamp  [gt_px gt_py gt_vx gt_vy ...]
//! R  rho phi rho_dot timestamp  [gt_px gt_py gt_vx gt_vy ...]
//! ```
//!
//! Timestamps are microseconds. Blank lines and `#` comments are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use flate2::read::GzDecoder;
use nalgebra::DVector;

use crate::types::{GroundTruth, MeasurementPackage, SensorType};

#[derive(Clone, Debug, PartialEq)]
pub struct SensorRecord {
    pub measurement: MeasurementPackage,
    pub ground_truth: Option<GroundTruth>,
}

/// Parse one log line. `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str) -> anyhow::Result<Option<SensorRecord>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut tokens = line.split_whitespace();
    let tag = tokens.next().ok_or_else(|| anyhow!("empty line"))?;
    let sensor_type = match tag {
        "L" => SensorType::Lidar,
        "R" => SensorType::Radar,
        other => bail!("unknown sensor tag {other:?}"),
    };

    let dim = sensor_type.measurement_dim();
    let mut values = Vec::with_capacity(dim);
    for i in 0..dim {
        let token = tokens
            .next()
            .ok_or_else(|| anyhow!("{} line missing measurement {}", sensor_type.as_str(), i))?;
        values.push(parse_f64(token)?);
    }

    let ts_token = tokens.next().ok_or_else(|| anyhow!("missing timestamp"))?;
    let timestamp: i64 = ts_token
        .parse()
        .with_context(|| format!("bad timestamp {ts_token:?}"))?;

    let gt: Vec<f64> = tokens.take(4).map(parse_f64).collect::<anyhow::Result<_>>()?;
    let ground_truth = match gt.as_slice() {
        [] => None,
        [px, py, vx, vy] => Some(GroundTruth {
            px: *px,
            py: *py,
            vx: *vx,
            vy: *vy,
        }),
        partial => bail!("incomplete ground truth: {} of 4 values", partial.len()),
    };

    Ok(Some(SensorRecord {
        measurement: MeasurementPackage {
            sensor_type,
            timestamp,
            raw_measurements: DVector::from_vec(values),
        },
        ground_truth,
    }))
}

fn parse_f64(token: &str) -> anyhow::Result<f64> {
    let value = token
        .parse::<f64>()
        .with_context(|| format!("bad number {token:?}"))?;
    if !value.is_finite() {
        bail!("non-finite number {token:?}");
    }
    Ok(value)
}

/// Read every record from a reader, reporting the line number on failure.
pub fn read_records<R: Read>(reader: R) -> anyhow::Result<Vec<SensorRecord>> {
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(reader).lines().enumerate() {
        let line = line?;
        if let Some(record) = parse_line(&line).with_context(|| format!("line {}", idx + 1))? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Load a plain-text or gzip (`.gz`) measurement log.
pub fn load_records(path: &Path) -> anyhow::Result<Vec<SensorRecord>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let records = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        read_records(GzDecoder::new(file))
    } else {
        read_records(file)
    }
    .with_context(|| format!("reading {}", path.display()))?;

    log::info!("loaded {} records from {}", records.len(), path.display());
    Ok(records)
}
