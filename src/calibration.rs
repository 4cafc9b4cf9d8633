//! Voltage calibration for the capacitive soil probe: a JSON file with the
//! dry and wet reference voltages, plus the pure voltage-to-percent
//! conversion built on it.
//!
//! Loading never fails the caller: a missing, corrupt, or legacy raw-count
//! file falls back to the documented default limits with a warning. Legacy
//! `{"dry": <raw>, "wet": <raw>}` files predate voltage calibration and are
//! not convertible, so they are discarded rather than misinterpreted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Default dry reference in volts, used when no calibration file exists.
pub const DEFAULT_DRY_V: f64 = 1.60;
/// Default wet reference in volts.
pub const DEFAULT_WET_V: f64 = 0.20;

/// Which calibration bound a capture operation updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    Dry,
    Wet,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub dry_v: f64,
    pub wet_v: f64,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            dry_v: DEFAULT_DRY_V,
            wet_v: DEFAULT_WET_V,
        }
    }
}

impl CalibrationProfile {
    /// Load the profile from `path`, falling back to defaults on any problem.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "calibration file not found — using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), "failed to read calibration file: {e} — using defaults");
                return Self::default();
            }
        };

        let obj: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), "corrupt calibration file: {e} — using defaults");
                return Self::default();
            }
        };

        match (obj.get("dry_v").and_then(|v| v.as_f64()), obj.get("wet_v").and_then(|v| v.as_f64()))
        {
            (Some(dry_v), Some(wet_v)) => Self { dry_v, wet_v },
            _ => {
                if obj.get("dry").is_some() && obj.get("wet").is_some() {
                    warn!(
                        path = %path.display(),
                        "found legacy raw-count calibration — using default voltage limits"
                    );
                } else {
                    warn!(path = %path.display(), "calibration file missing voltage fields — using defaults");
                }
                Self::default()
            }
        }
    }

    /// Persist the profile, overwriting any previous file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self).context("serializing calibration profile")?;
        std::fs::write(path, json)
            .with_context(|| format!("writing calibration file {}", path.display()))?;
        Ok(())
    }

    /// Calibration files may be stored inverted; swap the bounds before use.
    pub fn normalized(self) -> Self {
        if self.dry_v < self.wet_v {
            Self {
                dry_v: self.wet_v,
                wet_v: self.dry_v,
            }
        } else {
            self
        }
    }

    /// Convert a probe voltage to a moisture percentage in [0, 100].
    ///
    /// An absent voltage or a degenerate calibration span yields 0. Between
    /// the bounds the conversion is linear, clamped, and rounded to three
    /// decimals. Dry voltage is high, wet voltage is low, so the result is
    /// non-increasing in voltage.
    pub fn percent_from_voltage(&self, voltage: Option<f64>) -> f64 {
        let p = self.normalized();
        let span = p.dry_v - p.wet_v;
        if span <= 0.0 {
            return 0.0;
        }
        let v = match voltage {
            Some(v) => v,
            None => return 0.0,
        };

        let percent = if v >= p.dry_v {
            0.0
        } else if v <= p.wet_v {
            100.0
        } else {
            (p.dry_v - v) * 100.0 / span
        };

        (percent.clamp(0.0, 100.0) * 1000.0).round() / 1000.0
    }
}

/// Operator calibration: record a live probe voltage as the dry or wet
/// reference and persist the updated profile. Never called by the
/// acquisition loop.
pub fn capture(path: &Path, reference: Reference, voltage: f64) -> Result<CalibrationProfile> {
    let mut profile = CalibrationProfile::load(path);
    match reference {
        Reference::Dry => profile.dry_v = voltage,
        Reference::Wet => profile.wet_v = voltage,
    }
    profile.save(path)?;
    tracing::info!(?reference, voltage, "calibration reference captured");
    Ok(profile)
}

// ===========================================================================
// Tests
// ===========================================================================
