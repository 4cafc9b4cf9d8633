//! Relay control for the irrigation pump and the auxiliary output.
//!
//! The board is low-trigger: electrically LOW energizes a relay. That
//! inversion stays inside this module; callers only see logical ON/OFF.
//! The `hardware` feature gates the real rppal driver; without it, a mock
//! board tracks state in memory.

use tracing::{debug, error, info};

#[cfg(feature = "hardware")]
use anyhow::Context;
use anyhow::Result;
#[cfg(feature = "hardware")]
use rppal::gpio::{Gpio, OutputPin};

use crate::config::Config;
use crate::db::Db;

// ---------------------------------------------------------------------------
// Actuator addressing
// ---------------------------------------------------------------------------

/// Fixed set of actuators; no stringly-typed relay lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relay {
    /// The watering pump, wired to the board's IN2 input.
    Irrigation,
    /// Spare output on IN1 (grow light, ventilation, ...).
    Auxiliary,
}

impl Relay {
    pub const ALL: [Relay; 2] = [Relay::Irrigation, Relay::Auxiliary];

    /// Name recorded in the relay audit log. The numbering follows the
    /// board's input labels, which the historical records already use.
    pub fn name(self) -> &'static str {
        match self {
            Relay::Irrigation => "RELAY2",
            Relay::Auxiliary => "RELAY1",
        }
    }
}

// ---------------------------------------------------------------------------
// Real relay board (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "hardware")]
pub struct RelayBoard {
    irrigation: OutputPin,
    auxiliary: OutputPin,
}

#[cfg(feature = "hardware")]
impl RelayBoard {
    pub fn new(cfg: &Config) -> Result<Self> {
        let gpio = Gpio::new().context("opening GPIO for relay outputs")?;
        // into_output_high = de-energized for a low-trigger board.
        let irrigation = gpio
            .get(cfg.pump_gpio_pin)
            .with_context(|| format!("claiming pump relay pin {}", cfg.pump_gpio_pin))?
            .into_output_high();
        let auxiliary = gpio
            .get(cfg.aux_gpio_pin)
            .with_context(|| format!("claiming auxiliary relay pin {}", cfg.aux_gpio_pin))?
            .into_output_high();
        Ok(Self {
            irrigation,
            auxiliary,
        })
    }

    fn pin_mut(&mut self, relay: Relay) -> &mut OutputPin {
        match relay {
            Relay::Irrigation => &mut self.irrigation,
            Relay::Auxiliary => &mut self.auxiliary,
        }
    }

    /// Drive a relay to the requested logical state. Returns `true` only if
    /// the output actually flipped; repeats are no-ops.
    pub fn set(&mut self, relay: Relay, on: bool) -> bool {
        let pin = self.pin_mut(relay);
        if pin.is_set_low() == on {
            return false;
        }
        if on {
            pin.set_low();
        } else {
            pin.set_high();
        }
        debug!(relay = relay.name(), state = if on { "ON" } else { "OFF" }, "relay set");
        true
    }

    /// Read the state back from the pin register, not a cached flag.
    pub fn get(&self, relay: Relay) -> bool {
        match relay {
            Relay::Irrigation => self.irrigation.is_set_low(),
            Relay::Auxiliary => self.auxiliary.is_set_low(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development — no hardware)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "hardware"))]
pub struct RelayBoard {
    irrigation_on: bool,
    auxiliary_on: bool,
}

#[cfg(not(feature = "hardware"))]
impl RelayBoard {
    pub fn new(cfg: &Config) -> Result<Self> {
        debug!(
            pump_pin = cfg.pump_gpio_pin,
            aux_pin = cfg.aux_gpio_pin,
            "[mock-gpio] relay board initialised (no hardware)"
        );
        Ok(Self {
            irrigation_on: false,
            auxiliary_on: false,
        })
    }

    pub fn set(&mut self, relay: Relay, on: bool) -> bool {
        let slot = match relay {
            Relay::Irrigation => &mut self.irrigation_on,
            Relay::Auxiliary => &mut self.auxiliary_on,
        };
        if *slot == on {
            return false;
        }
        *slot = on;
        debug!(
            relay = relay.name(),
            state = if on { "ON" } else { "OFF" },
            "[mock-gpio] relay set"
        );
        true
    }

    pub fn get(&self, relay: Relay) -> bool {
        match relay {
            Relay::Irrigation => self.irrigation_on,
            Relay::Auxiliary => self.auxiliary_on,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared behaviour (both boards expose the same set/get surface)
// ---------------------------------------------------------------------------

impl RelayBoard {
    /// Force both actuators to the safe OFF state. Runs at startup before
    /// any decision logic; startup writes are not audited.
    pub fn init(&mut self) {
        for relay in Relay::ALL {
            self.set(relay, false);
        }
        info!("relays initialised to safe state");
    }

    /// Set a relay and append one audit record per actual transition.
    /// No-op repeats produce no audit entry. Audit-write failures are
    /// logged, never allowed to block actuation.
    pub async fn set_logged(&mut self, db: &Db, relay: Relay, on: bool, source: &str) -> bool {
        let flipped = self.set(relay, on);
        if flipped {
            let action = if on { "ON" } else { "OFF" };
            if let Err(e) = db.insert_relay_event(relay.name(), action, source).await {
                error!(relay = relay.name(), action, "relay audit write failed: {e}");
            }
        }
        flipped
    }

    /// De-energize everything, auditing any transition that results.
    pub async fn all_off_logged(&mut self, db: &Db, source: &str) {
        for relay in Relay::ALL {
            self.set_logged(db, relay, false, source).await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "hardware")))]
mod tests {
    use super::*;

    fn board() -> RelayBoard {
        RelayBoard::new(&Config::default()).unwrap()
    }

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.init_schema().await.unwrap();
        db
    }

    // -- set / get ---------------------------------------------------------

    #[test]
    fn new_board_is_all_off() {
        let b = board();
        assert!(!b.get(Relay::Irrigation));
        assert!(!b.get(Relay::Auxiliary));
    }

    #[test]
    fn set_on_then_off() {
        let mut b = board();
        assert!(b.set(Relay::Irrigation, true));
        assert!(b.get(Relay::Irrigation));
        assert!(b.set(Relay::Irrigation, false));
        assert!(!b.get(Relay::Irrigation));
    }

    #[test]
    fn repeated_set_is_noop() {
        let mut b = board();
        assert!(b.set(Relay::Irrigation, true));
        assert!(!b.set(Relay::Irrigation, true), "repeat must not flip");
        assert!(b.get(Relay::Irrigation));
    }

    #[test]
    fn relays_are_independent() {
        let mut b = board();
        b.set(Relay::Irrigation, true);
        assert!(!b.get(Relay::Auxiliary));
    }

    #[test]
    fn init_forces_off() {
        let mut b = board();
        b.set(Relay::Irrigation, true);
        b.set(Relay::Auxiliary, true);
        b.init();
        assert!(!b.get(Relay::Irrigation));
        assert!(!b.get(Relay::Auxiliary));
    }

    #[test]
    fn audit_names_follow_board_labels() {
        assert_eq!(Relay::Irrigation.name(), "RELAY2");
        assert_eq!(Relay::Auxiliary.name(), "RELAY1");
    }

    // -- audit trail -------------------------------------------------------

    #[tokio::test]
    async fn on_on_off_records_exactly_two_transitions() {
        let db = test_db().await;
        let mut b = board();

        b.set_logged(&db, Relay::Irrigation, true, "manual").await;
        b.set_logged(&db, Relay::Irrigation, true, "manual").await;
        b.set_logged(&db, Relay::Irrigation, false, "manual").await;

        let events = db.recent_relay_events(10).await.unwrap();
        assert_eq!(events.len(), 2, "no-op repeat must not be audited");
        assert_eq!(events[0].action, "OFF"); // newest first
        assert_eq!(events[1].action, "ON");
        assert!(events.iter().all(|e| e.relay_name == "RELAY2"));
        assert!(events.iter().all(|e| e.source == "manual"));
    }

    #[tokio::test]
    async fn all_off_logged_audits_only_energized_relays() {
        let db = test_db().await;
        let mut b = board();
        b.set(Relay::Irrigation, true);

        b.all_off_logged(&db, "automatic").await;

        let events = db.recent_relay_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].relay_name, "RELAY2");
        assert_eq!(events[0].action, "OFF");
        assert_eq!(events[0].source, "automatic");
    }
}
