//! TOML config file loading and validation. All tunables default to the
//! values the original greenhouse deployment ran with, so a missing config
//! file still yields a working setup.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::warn;

use crate::sensor::BusMode;

// ---------------------------------------------------------------------------
// Config structure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// sqlx connection string, e.g. "sqlite:sensors.db?mode=rwc".
    pub db_url: String,
    /// JSON file holding the dry/wet voltage calibration.
    pub calibration_file: String,
    /// Plain-text liveness marker consumed by external supervisors.
    pub status_file: String,
    /// Single-timestamp file recording the last successful watering.
    pub watering_file: String,
    /// Directory swept for stale camera snapshots.
    pub snapshots_dir: String,

    /// Seconds between acquisition cycles.
    pub poll_interval_sec: u64,
    /// Soil moisture below this percentage triggers watering.
    pub watering_threshold_pct: f64,
    /// Seconds the pump stays energized per watering.
    pub watering_duration_sec: u64,
    /// Minimum seconds between waterings.
    pub watering_cooldown_sec: u64,
    /// Snapshots older than this many months are pruned.
    pub snapshot_retention_months: u64,

    /// Whether the soil ADC reuses a long-lived bus handle or re-acquires
    /// the bus on every read.
    pub bus_mode: BusMode,
    /// BCM pin driving the irrigation pump relay (IN2).
    pub pump_gpio_pin: u8,
    /// BCM pin driving the auxiliary relay (IN1).
    pub aux_gpio_pin: u8,
    /// BCM pin the DHT22 data line is wired to.
    pub dht_gpio_pin: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: "sqlite:sensors.db?mode=rwc".to_string(),
            calibration_file: "soil_calibration.json".to_string(),
            status_file: "logger_status.txt".to_string(),
            watering_file: "last_watering.txt".to_string(),
            snapshots_dir: "logs".to_string(),
            poll_interval_sec: 2400,
            watering_threshold_pct: 40.0,
            watering_duration_sec: 10,
            watering_cooldown_sec: 3600,
            snapshot_retention_months: 3,
            bus_mode: BusMode::Shared,
            pump_gpio_pin: 16,
            aux_gpio_pin: 12,
            dht_gpio_pin: 27,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.db_url.trim().is_empty() {
            errors.push("db_url is empty".to_string());
        }
        if self.calibration_file.trim().is_empty() {
            errors.push("calibration_file is empty".to_string());
        }
        if self.status_file.trim().is_empty() {
            errors.push("status_file is empty".to_string());
        }
        if self.watering_file.trim().is_empty() {
            errors.push("watering_file is empty".to_string());
        }

        if self.poll_interval_sec == 0 {
            errors.push("poll_interval_sec must be positive".to_string());
        }
        if !(0.0..=100.0).contains(&self.watering_threshold_pct) {
            errors.push(format!(
                "watering_threshold_pct {} out of range [0.0, 100.0]",
                self.watering_threshold_pct
            ));
        }
        if self.watering_duration_sec == 0 {
            errors.push("watering_duration_sec must be positive".to_string());
        }
        if self.snapshot_retention_months == 0 {
            errors.push("snapshot_retention_months must be positive".to_string());
        }

        let mut seen_pins: HashSet<u8> = HashSet::new();
        for (name, pin) in [
            ("pump_gpio_pin", self.pump_gpio_pin),
            ("aux_gpio_pin", self.aux_gpio_pin),
            ("dht_gpio_pin", self.dht_gpio_pin),
        ] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!("{name} {pin} is already assigned to another role"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// built-in defaults with a warning; a present-but-broken file is an error.
pub fn load(path: &str) -> Result<Config> {
    let config = match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path, "config file not found — using defaults");
            Config::default()
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
