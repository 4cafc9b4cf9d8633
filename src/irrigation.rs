//! Irrigation decision logic and the watering action itself.
//!
//! The controller is evaluated once per acquisition cycle with that cycle's
//! soil percentage. Cooldown is a guard, not a state: the only durable
//! watering state is the timestamp of the last successful watering, which
//! survives restarts in a single-value file.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::relay::{Relay, RelayBoard};

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Water,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No soil reading this cycle; cannot safely decide without data.
    NoReading,
    /// Moisture at or above the threshold.
    MoistOk,
    /// A watering happened within the cooldown window.
    Cooldown,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct IrrigationController {
    threshold_pct: f64,
    cooldown: Duration,
    hold: Duration,
    watering_file: PathBuf,
}

impl IrrigationController {
    pub fn new(cfg: &Config) -> Self {
        Self {
            threshold_pct: cfg.watering_threshold_pct,
            cooldown: Duration::from_secs(cfg.watering_cooldown_sec),
            hold: Duration::from_secs(cfg.watering_duration_sec),
            watering_file: PathBuf::from(&cfg.watering_file),
        }
    }

    /// Evaluate the threshold and cooldown guards for this cycle.
    pub fn decide(&self, soil_percent: Option<f64>, now: i64) -> Decision {
        let pct = match soil_percent {
            Some(p) => p,
            None => return Decision::Skip(SkipReason::NoReading),
        };
        if pct >= self.threshold_pct {
            return Decision::Skip(SkipReason::MoistOk);
        }
        if let Some(last) = self.last_watered_at() {
            if now - last < self.cooldown.as_secs() as i64 {
                info!(
                    last_watered_at = last,
                    "skipping watering (cooldown active)"
                );
                return Decision::Skip(SkipReason::Cooldown);
            }
        }
        Decision::Water
    }

    /// Energize the pump for the configured hold, then de-energize and
    /// record the watering timestamp.
    ///
    /// The OFF write is unconditional: it runs whether or not the hold
    /// completed normally. Termination mid-hold is covered by the
    /// process-level cleanup, which forces every relay off.
    pub async fn water(&self, relays: &mut RelayBoard, db: &Db) -> Result<()> {
        info!(hold_sec = self.hold.as_secs(), "soil below threshold — energizing pump");
        relays.set_logged(db, Relay::Irrigation, true, "automatic").await;

        tokio::time::sleep(self.hold).await;

        relays.set_logged(db, Relay::Irrigation, false, "automatic").await;
        self.record_watering(now_unix())?;
        info!("watering finished");
        Ok(())
    }

    /// The last watering timestamp, or `None` if never watered. A corrupt
    /// file is treated as "never watered" so a damaged marker can only make
    /// the system water sooner, not wedge it shut.
    fn last_watered_at(&self) -> Option<i64> {
        let contents = std::fs::read_to_string(&self.watering_file).ok()?;
        match contents.trim().parse::<f64>() {
            Ok(ts) => Some(ts as i64),
            Err(_) => {
                warn!(
                    path = %self.watering_file.display(),
                    "unreadable watering timestamp — treating as never watered"
                );
                None
            }
        }
    }

    fn record_watering(&self, now: i64) -> Result<()> {
        std::fs::write(&self.watering_file, now.to_string()).with_context(|| {
            format!("writing watering timestamp {}", self.watering_file.display())
        })
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NOW: i64 = 1_756_000_000;

    fn controller(dir: &TempDir) -> IrrigationController {
        controller_with_hold(dir, 10)
    }

    fn controller_with_hold(dir: &TempDir, hold_sec: u64) -> IrrigationController {
        let cfg = Config {
            watering_file: dir
                .path()
                .join("last_watering.txt")
                .to_string_lossy()
                .into_owned(),
            watering_duration_sec: hold_sec,
            ..Config::default()
        };
        IrrigationController::new(&cfg)
    }

    fn write_last_watering(ctl: &IrrigationController, ts: &str) {
        std::fs::write(&ctl.watering_file, ts).unwrap();
    }

    // -- decide ------------------------------------------------------------

    #[test]
    fn absent_reading_skips() {
        let dir = TempDir::new().unwrap();
        let ctl = controller(&dir);
        assert_eq!(ctl.decide(None, NOW), Decision::Skip(SkipReason::NoReading));
    }

    #[test]
    fn moisture_at_threshold_skips() {
        let dir = TempDir::new().unwrap();
        let ctl = controller(&dir);
        assert_eq!(
            ctl.decide(Some(40.0), NOW),
            Decision::Skip(SkipReason::MoistOk)
        );
    }

    #[test]
    fn moisture_above_threshold_skips() {
        let dir = TempDir::new().unwrap();
        let ctl = controller(&dir);
        assert_eq!(
            ctl.decide(Some(72.5), NOW),
            Decision::Skip(SkipReason::MoistOk)
        );
    }

    #[test]
    fn dry_soil_with_no_history_waters() {
        let dir = TempDir::new().unwrap();
        let ctl = controller(&dir);
        assert_eq!(ctl.decide(Some(35.0), NOW), Decision::Water);
    }

    #[test]
    fn dry_soil_within_cooldown_skips() {
        let dir = TempDir::new().unwrap();
        let ctl = controller(&dir);
        write_last_watering(&ctl, &(NOW - 600).to_string());
        assert_eq!(
            ctl.decide(Some(35.0), NOW),
            Decision::Skip(SkipReason::Cooldown)
        );
    }

    #[test]
    fn dry_soil_after_cooldown_waters() {
        let dir = TempDir::new().unwrap();
        let ctl = controller(&dir);
        // exactly the cooldown boundary: elapsed == cooldown is allowed
        write_last_watering(&ctl, &(NOW - 3600).to_string());
        assert_eq!(ctl.decide(Some(35.0), NOW), Decision::Water);
    }

    #[test]
    fn fractional_legacy_timestamp_is_accepted() {
        let dir = TempDir::new().unwrap();
        let ctl = controller(&dir);
        // the previous deployment wrote float epoch seconds
        write_last_watering(&ctl, &format!("{}.123456", NOW - 60));
        assert_eq!(
            ctl.decide(Some(35.0), NOW),
            Decision::Skip(SkipReason::Cooldown)
        );
    }

    #[test]
    fn corrupt_watering_file_is_never_watered() {
        let dir = TempDir::new().unwrap();
        let ctl = controller(&dir);
        write_last_watering(&ctl, "yesterday-ish");
        assert_eq!(ctl.decide(Some(35.0), NOW), Decision::Water);
    }

    // -- water -------------------------------------------------------------

    #[cfg(not(feature = "hardware"))]
    #[tokio::test]
    async fn watering_deenergizes_and_records() {
        let dir = TempDir::new().unwrap();
        let ctl = controller_with_hold(&dir, 0); // no hold in tests

        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.init_schema().await.unwrap();
        let mut relays = RelayBoard::new(&Config::default()).unwrap();

        ctl.water(&mut relays, &db).await.unwrap();

        assert!(!relays.get(Relay::Irrigation), "pump must end OFF");

        let events = db.recent_relay_events(10).await.unwrap();
        assert_eq!(events.len(), 2, "one ON and one OFF audit record");
        assert!(events.iter().all(|e| e.source == "automatic"));

        let recorded = ctl.last_watered_at().expect("timestamp persisted");
        assert!((recorded - now_unix()).abs() <= 2);
    }

    #[cfg(not(feature = "hardware"))]
    #[tokio::test]
    async fn watering_then_immediate_retry_is_suppressed() {
        let dir = TempDir::new().unwrap();
        let ctl = controller_with_hold(&dir, 0);

        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.init_schema().await.unwrap();
        let mut relays = RelayBoard::new(&Config::default()).unwrap();

        assert_eq!(ctl.decide(Some(35.0), now_unix()), Decision::Water);
        ctl.water(&mut relays, &db).await.unwrap();

        assert_eq!(
            ctl.decide(Some(35.0), now_unix()),
            Decision::Skip(SkipReason::Cooldown),
            "retry within the hour must be cooldown-suppressed"
        );
    }
}
