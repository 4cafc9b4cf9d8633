//! Fixed-interval acquisition loop: read every sensor, convert, persist,
//! evaluate irrigation, sweep old snapshots, sleep.
//!
//! Per-sensor failures degrade a cycle (the field is stored as NULL);
//! persistence and supervisor failures abort the loop — a logger that can
//! neither record nor prove it is alive has no business driving a pump.

use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use time::format_description::FormatItem;
use time::macros::format_description;
use tracing::{error, info, warn};

use crate::calibration::CalibrationProfile;
use crate::config::Config;
use crate::db::{now_local, Db, SensorReading};
use crate::irrigation::{Decision, IrrigationController};
use crate::relay::RelayBoard;
use crate::sensor::{SensorContext, SensorError};
use crate::supervisor::Supervisor;

const LOG_TS_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");

/// Snapshot retention is counted in 30-day months.
const SNAPSHOT_MONTH_SECS: u64 = 30 * 24 * 3600;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the acquisition loop until cancelled or a fatal store/supervisor
/// fault. Intended to sit inside main's `tokio::select!` against ctrl_c.
pub async fn run(
    cfg: &Config,
    db: &Db,
    sensors: &mut SensorContext,
    relays: &mut RelayBoard,
    supervisor: &Supervisor,
) -> Result<()> {
    let irrigation = IrrigationController::new(cfg);
    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.poll_interval_sec));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        period_sec = cfg.poll_interval_sec,
        threshold_pct = cfg.watering_threshold_pct,
        "acquisition loop started"
    );

    loop {
        ticker.tick().await;
        run_cycle(cfg, db, sensors, relays, supervisor, &irrigation).await?;
    }
}

/// One acquisition cycle. Returns the persisted reading so tests can
/// inspect what a tick produced.
pub async fn run_cycle(
    cfg: &Config,
    db: &Db,
    sensors: &mut SensorContext,
    relays: &mut RelayBoard,
    supervisor: &Supervisor,
    irrigation: &IrrigationController,
) -> Result<SensorReading> {
    // Heartbeat first: the marker timestamp is how the outside world tells
    // a live logger from a wedged one.
    supervisor.refresh().context("refreshing status marker")?;

    let lux = sample("bh1750", sensors.read_illuminance());

    let moisture = sample("ads1115", sensors.read_moisture_raw());
    let (soil_raw, soil_voltage) = match moisture {
        Some((raw, v)) => (Some(raw as i64), Some(round3(v))),
        None => (None, None),
    };

    // Reloaded every cycle so an operator recalibration takes effect
    // without a restart.
    let profile = CalibrationProfile::load(Path::new(&cfg.calibration_file));
    let soil_percent = soil_voltage.map(|v| profile.percent_from_voltage(Some(v)));

    let air = sample("dht22", sensors.read_air_temp_humidity());
    let soil_temp = sample("ds18b20", sensors.read_soil_temperature());

    let reading = SensorReading {
        timestamp: now_local().format(LOG_TS_FORMAT).unwrap_or_default(),
        air_temp: air.map(|(t, _)| round3(t)),
        air_humidity: air.map(|(_, h)| round3(h)),
        soil_temp: soil_temp.map(round3),
        soil_raw,
        soil_voltage,
        soil_percent,
        lux,
        stable: true,
    };

    info!(
        pct = ?reading.soil_percent,
        air_temp = ?reading.air_temp,
        soil_temp = ?reading.soil_temp,
        lux = ?reading.lux,
        "cycle readings"
    );

    match irrigation.decide(soil_percent, unix_now()) {
        Decision::Water => {
            if let Err(e) = irrigation.water(relays, db).await {
                error!("watering failed: {e:#}");
            }
        }
        Decision::Skip(reason) => {
            tracing::debug!(?reason, "no watering this cycle");
        }
    }

    db.insert_reading(&reading)
        .await
        .context("persisting sensor reading")?;

    prune_snapshots(Path::new(&cfg.snapshots_dir), cfg.snapshot_retention_months);

    Ok(reading)
}

fn sample<T>(sensor: &str, result: Result<T, SensorError>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(sensor, "read failed: {e}");
            None
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ---------------------------------------------------------------------------
// Snapshot maintenance
// ---------------------------------------------------------------------------

/// Whether a snapshot's mtime has aged past the retention window.
fn snapshot_expired(modified: SystemTime, now: SystemTime, retention_months: u64) -> bool {
    match now.duration_since(modified) {
        Ok(age) => age.as_secs() > retention_months * SNAPSHOT_MONTH_SECS,
        // mtime in the future: clock skew, keep the file
        Err(_) => false,
    }
}

/// Delete `.jpg` snapshots older than the retention window. Best-effort:
/// a missing directory or an undeletable file is logged and skipped.
fn prune_snapshots(dir: &Path, retention_months: u64) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return, // no snapshot directory on this host
    };

    let now = SystemTime::now();
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jpg") {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if snapshot_expired(modified, now, retention_months) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), "failed to remove snapshot: {e}"),
            }
        }
    }
    if removed > 0 {
        info!(removed, "pruned expired snapshots");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
