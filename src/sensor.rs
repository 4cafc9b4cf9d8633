//! Per-sensor acquisition: ADS1115 soil moisture ADC, DHT22 air
//! temperature/humidity, DS18B20 soil temperature probe, and BH1750 ambient
//! light.
//!
//! Every read returns `Result<_, SensorError>`; the scheduler maps failures
//! to absent fields so one dead sensor never aborts a cycle. The `hardware`
//! feature gates the real rppal drivers; without it, mock drivers synthesize
//! plausible values so the loop runs off-target.

use serde::Deserialize;
use thiserror::Error;

#[cfg(feature = "hardware")]
use anyhow::Context;
#[cfg(feature = "hardware")]
use rppal::gpio::{Gpio, IoPin, Mode, PullUpDown};
#[cfg(feature = "hardware")]
use rppal::i2c::I2c;
#[cfg(feature = "hardware")]
use std::path::PathBuf;
#[cfg(feature = "hardware")]
use std::time::{Duration, Instant};

use crate::config::Config;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("bus error: {0}")]
    Bus(String),
    #[error("sensor did not respond in time")]
    Timeout,
    #[error("checksum mismatch")]
    Checksum,
    #[error("malformed sensor output: {0}")]
    Format(String),
    #[error("sensor not present")]
    NotPresent,
}

// ---------------------------------------------------------------------------
// Bus access mode
// ---------------------------------------------------------------------------

/// `Shared` reuses one bus handle for the process lifetime (faster, assumes
/// startup initialization succeeded). `Fresh` re-acquires the bus on every
/// read, which recovers from a locked-up bus at the cost of latency. The two
/// are mutually exclusive access patterns on one physical bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusMode {
    Shared,
    Fresh,
}

// ---------------------------------------------------------------------------
// ADS1115 (soil moisture ADC)
// ---------------------------------------------------------------------------
//
// Config register layout (MSB first):
//   [15]    OS       — write 1 to start single-shot conversion
//   [14:12] MUX      — input multiplexer (channel selection)
//   [11:9]  PGA      — programmable gain amplifier
//   [8]     MODE     — 0 = continuous, 1 = single-shot
//   [7:5]   DR       — data rate
//   [4:0]   comparator fields — 0b00011 disables the comparator

/// I2C address with ADDR strapped to GND.
#[cfg(feature = "hardware")]
const ADS1115_ADDR: u16 = 0x48;
#[cfg(feature = "hardware")]
const REG_CONVERSION: u8 = 0x00;
#[cfg(feature = "hardware")]
const REG_CONFIG: u8 = 0x01;

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot), DR=100 (128 SPS),
/// comparator off.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;
/// Single-ended read on AIN0 (MUX=100), the soil probe channel.
const ADS_CONFIG_AIN0: u16 = CONFIG_BASE | (0b100 << 12);

/// Full-scale range at PGA ±4.096 V; one LSB is 125 µV.
const ADS1115_FSR: f64 = 4.096;

/// Conversion time at 128 SPS is ~7.8 ms; wait 9 ms for margin.
#[cfg(feature = "hardware")]
const CONVERSION_WAIT: Duration = Duration::from_millis(9);
#[cfg(feature = "hardware")]
const OS_READY_BIT: u16 = 1 << 15;

/// Delay between the discarded and the kept sample. The first conversion
/// after reconfiguring can return a stale conversion-register value.
#[cfg(feature = "hardware")]
const SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Scale a raw single-ended ADS1115 count to volts.
pub fn voltage_from_raw(raw: i16) -> f64 {
    raw as f64 * ADS1115_FSR / 32768.0
}

/// Turn a conversion-register sample into the (count, voltage) pair the
/// logger stores. Single-ended reads are non-negative; bus noise can push
/// a sample a few counts below zero, and the clamp must apply to both
/// halves of the pair so the stored count and voltage describe the same
/// sample.
pub fn moisture_sample(raw: i16) -> (i32, f64) {
    let clamped = raw.clamp(0, i16::MAX);
    (clamped as i32, voltage_from_raw(clamped))
}

// ---------------------------------------------------------------------------
// BH1750 (ambient light)
// ---------------------------------------------------------------------------

#[cfg(feature = "hardware")]
const BH1750_ADDR: u16 = 0x23;
/// Continuous high-resolution mode (1 lx, 120 ms measurement).
#[cfg(feature = "hardware")]
const BH1750_MODE: u8 = 0x10;
#[cfg(feature = "hardware")]
const BH1750_WAIT: Duration = Duration::from_millis(200);

/// Convert the BH1750's big-endian count to lux (datasheet divisor 1.2),
/// rounded to two decimals.
pub fn lux_from_bytes(data: [u8; 2]) -> f64 {
    let count = u16::from_be_bytes(data) as f64;
    (count / 1.2 * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// DS18B20 (soil temperature, 1-Wire sysfs transcript)
// ---------------------------------------------------------------------------

/// Parse a two-line `w1_slave` transcript.
///
/// Line 1 must end in `YES` (the kernel's CRC verdict) before line 2's
/// `t=<millidegrees>` field is trusted. Any deviation is an error the caller
/// records as an absent reading.
pub fn parse_w1_transcript(transcript: &str) -> Result<f64, SensorError> {
    let mut lines = transcript.lines();
    let crc_line = lines
        .next()
        .ok_or_else(|| SensorError::Format("empty transcript".to_string()))?;
    if !crc_line.trim_end().ends_with("YES") {
        return Err(SensorError::Checksum);
    }
    let data_line = lines
        .next()
        .ok_or_else(|| SensorError::Format("missing data line".to_string()))?;
    let idx = data_line
        .find("t=")
        .ok_or_else(|| SensorError::Format("no t= field".to_string()))?;
    let millidegrees: f64 = data_line[idx + 2..]
        .trim()
        .parse()
        .map_err(|_| SensorError::Format("unparseable temperature".to_string()))?;
    Ok(millidegrees / 1000.0)
}

// ---------------------------------------------------------------------------
// DHT22 (air temperature/humidity)
// ---------------------------------------------------------------------------

/// Decode a 40-bit DHT22 frame: 16-bit humidity, 16-bit temperature (sign
/// in the top bit), both in tenths, and a one-byte additive checksum.
pub fn decode_dht22_frame(data: [u8; 5]) -> Result<(f64, f64), SensorError> {
    let sum = data[0]
        .wrapping_add(data[1])
        .wrapping_add(data[2])
        .wrapping_add(data[3]);
    if sum != data[4] {
        return Err(SensorError::Checksum);
    }

    let humidity = u16::from_be_bytes([data[0], data[1]]) as f64 / 10.0;
    let magnitude = u16::from_be_bytes([data[2] & 0x7f, data[3]]) as f64 / 10.0;
    let temperature = if data[2] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    };

    if !(0.0..=100.0).contains(&humidity) {
        return Err(SensorError::Format(format!("humidity {humidity} out of range")));
    }
    Ok((temperature, humidity))
}

/// Retry budget matching the driver the deployment originally ran with.
#[cfg(feature = "hardware")]
const DHT_ATTEMPTS: u32 = 15;
#[cfg(feature = "hardware")]
const DHT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[cfg(feature = "hardware")]
fn wait_for_level(pin: &IoPin, high: bool, timeout: Duration) -> Result<Duration, SensorError> {
    let start = Instant::now();
    while pin.is_high() != high {
        if start.elapsed() > timeout {
            return Err(SensorError::Timeout);
        }
    }
    Ok(start.elapsed())
}

/// One bit-banged DHT22 transaction. Timing-sensitive; callers retry.
#[cfg(feature = "hardware")]
fn dht22_sample(gpio: &Gpio, pin_num: u8) -> Result<(f64, f64), SensorError> {
    let mut pin = gpio
        .get(pin_num)
        .map_err(|e| SensorError::Bus(e.to_string()))?
        .into_io(Mode::Output);

    // Host start signal: hold the line low for at least 1 ms, then release.
    pin.set_low();
    std::thread::sleep(Duration::from_millis(2));
    pin.set_mode(Mode::Input);
    pin.set_pullupdown(PullUpDown::Up);

    let bit_timeout = Duration::from_millis(1);

    // Sensor response preamble: ~80 µs low, ~80 µs high.
    wait_for_level(&pin, false, bit_timeout)?;
    wait_for_level(&pin, true, bit_timeout)?;
    wait_for_level(&pin, false, bit_timeout)?;

    // 40 data bits: each a ~50 µs low separator, then a high pulse whose
    // length encodes the bit (~27 µs = 0, ~70 µs = 1).
    let mut data = [0u8; 5];
    for i in 0..40 {
        wait_for_level(&pin, true, bit_timeout)?;
        let high = wait_for_level(&pin, false, bit_timeout)?;
        if high > Duration::from_micros(48) {
            data[i / 8] |= 1 << (7 - i % 8);
        }
    }

    decode_dht22_frame(data)
}

// ---------------------------------------------------------------------------
// Sensor context — real hardware
// ---------------------------------------------------------------------------

/// Holds the process-scoped hardware handles. Created once after the
/// instance lock is acquired and passed by reference to the acquisition
/// loop; there is no ambient global hardware state.
#[cfg(feature = "hardware")]
pub struct SensorContext {
    mode: BusMode,
    dht_pin: u8,
    gpio: Gpio,
    /// Long-lived bus handle in `Shared` mode; `Fresh` mode opens per read.
    shared_i2c: Option<I2c>,
    w1_device: Option<PathBuf>,
}

#[cfg(feature = "hardware")]
impl SensorContext {
    /// Open the process-scoped hardware resources. A failure here is fatal:
    /// the control loop must not start on a half-initialized bus.
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let shared_i2c = match cfg.bus_mode {
            BusMode::Shared => Some(I2c::new().context("opening shared I2C bus")?),
            BusMode::Fresh => None,
        };
        let gpio = Gpio::new().context("opening GPIO for the DHT22 line")?;

        let w1_device = find_w1_device();
        if w1_device.is_none() {
            tracing::warn!("DS18B20 device not found under /sys/bus/w1/devices");
        }

        Ok(Self {
            mode: cfg.bus_mode,
            dht_pin: cfg.dht_gpio_pin,
            gpio,
            shared_i2c,
            w1_device,
        })
    }

    fn with_bus<T>(
        &mut self,
        f: impl FnOnce(&mut I2c) -> Result<T, SensorError>,
    ) -> Result<T, SensorError> {
        match self.mode {
            BusMode::Shared => {
                let i2c = self.shared_i2c.as_mut().ok_or(SensorError::NotPresent)?;
                f(i2c)
            }
            BusMode::Fresh => {
                let mut i2c = I2c::new().map_err(|e| SensorError::Bus(e.to_string()))?;
                f(&mut i2c)
            }
        }
    }

    /// Double-sampled soil moisture read: the first conversion is discarded
    /// and a second taken after a short settle delay, so a stale conversion
    /// register never reaches the calibration math.
    pub fn read_moisture_raw(&mut self) -> Result<(i32, f64), SensorError> {
        self.with_bus(|i2c| {
            let _ = ads_convert(i2c)?;
            std::thread::sleep(SETTLE_DELAY);
            let raw = ads_convert(i2c)?;
            Ok(moisture_sample(raw))
        })
    }

    pub fn read_air_temp_humidity(&mut self) -> Result<(f64, f64), SensorError> {
        let mut last = SensorError::Timeout;
        for attempt in 1..=DHT_ATTEMPTS {
            match dht22_sample(&self.gpio, self.dht_pin) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    tracing::debug!(attempt, "dht22 read failed: {e}");
                    last = e;
                }
            }
            std::thread::sleep(DHT_RETRY_DELAY);
        }
        Err(last)
    }

    pub fn read_soil_temperature(&self) -> Result<f64, SensorError> {
        let device = self.w1_device.as_ref().ok_or(SensorError::NotPresent)?;
        let transcript = std::fs::read_to_string(device)
            .map_err(|e| SensorError::Bus(e.to_string()))?;
        parse_w1_transcript(&transcript)
    }

    pub fn read_illuminance(&mut self) -> Result<f64, SensorError> {
        self.with_bus(|i2c| {
            i2c.set_slave_address(BH1750_ADDR)
                .map_err(|e| SensorError::Bus(e.to_string()))?;
            i2c.write(&[BH1750_MODE])
                .map_err(|e| SensorError::Bus(e.to_string()))?;
            std::thread::sleep(BH1750_WAIT);
            let mut buf = [0u8; 2];
            i2c.read(&mut buf)
                .map_err(|e| SensorError::Bus(e.to_string()))?;
            Ok(lux_from_bytes(buf))
        })
    }
}

/// One single-shot AIN0 conversion: start, wait, confirm the OS flag, read.
#[cfg(feature = "hardware")]
fn ads_convert(i2c: &mut I2c) -> Result<i16, SensorError> {
    i2c.set_slave_address(ADS1115_ADDR)
        .map_err(|e| SensorError::Bus(e.to_string()))?;
    i2c.block_write(REG_CONFIG, &ADS_CONFIG_AIN0.to_be_bytes())
        .map_err(|e| SensorError::Bus(e.to_string()))?;

    std::thread::sleep(CONVERSION_WAIT);
    for _ in 0..3 {
        let mut buf = [0u8; 2];
        i2c.block_read(REG_CONFIG, &mut buf)
            .map_err(|e| SensorError::Bus(e.to_string()))?;
        if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    let mut buf = [0u8; 2];
    i2c.block_read(REG_CONVERSION, &mut buf)
        .map_err(|e| SensorError::Bus(e.to_string()))?;
    Ok(i16::from_be_bytes(buf))
}

/// Locate the first DS18B20 (family code 28) registered by the w1 kernel
/// drivers.
#[cfg(feature = "hardware")]
fn find_w1_device() -> Option<PathBuf> {
    let entries = std::fs::read_dir("/sys/bus/w1/devices").ok()?;
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with("28-") {
            return Some(entry.path().join("w1_slave"));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Sensor context — mock (development, no hardware)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "hardware"))]
pub struct SensorContext {
    mode: BusMode,
}

#[cfg(not(feature = "hardware"))]
impl SensorContext {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        tracing::info!(mode = ?cfg.bus_mode, "[mock] sensor context initialised (no hardware)");
        Ok(Self { mode: cfg.bus_mode })
    }

    pub fn read_moisture_raw(&mut self) -> Result<(i32, f64), SensorError> {
        #[cfg(feature = "sim")]
        {
            // Raw counts spanning roughly the default 0.20–1.60 V window.
            let raw = fastrand::i16(1600..12800);
            tracing::debug!(mode = ?self.mode, raw, "[mock] ads1115 sample");
            Ok(moisture_sample(raw))
        }
        #[cfg(not(feature = "sim"))]
        {
            Err(SensorError::NotPresent)
        }
    }

    pub fn read_air_temp_humidity(&mut self) -> Result<(f64, f64), SensorError> {
        #[cfg(feature = "sim")]
        {
            Ok((15.0 + fastrand::f64() * 15.0, 30.0 + fastrand::f64() * 60.0))
        }
        #[cfg(not(feature = "sim"))]
        {
            Err(SensorError::NotPresent)
        }
    }

    pub fn read_soil_temperature(&self) -> Result<f64, SensorError> {
        #[cfg(feature = "sim")]
        {
            Ok(10.0 + fastrand::f64() * 15.0)
        }
        #[cfg(not(feature = "sim"))]
        {
            Err(SensorError::NotPresent)
        }
    }

    pub fn read_illuminance(&mut self) -> Result<f64, SensorError> {
        #[cfg(feature = "sim")]
        {
            let lux = fastrand::f64() * 20_000.0;
            Ok((lux * 100.0).round() / 100.0)
        }
        #[cfg(not(feature = "sim"))]
        {
            Err(SensorError::NotPresent)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- ADS1115 config register ------------------------------------------

    #[test]
    fn ads_config_matches_datasheet_for_ain0() {
        // OS=1, MUX=100 (AIN0/GND), PGA=±4.096 V, single-shot, 128 SPS.
        assert_eq!(ADS_CONFIG_AIN0, 0xC383, "got {ADS_CONFIG_AIN0:#06x}");
    }

    #[test]
    fn ads_config_base_is_single_shot() {
        assert_eq!((CONFIG_BASE >> 8) & 1, 1, "MODE should be single-shot");
    }

    #[test]
    fn ads_config_base_pga_is_4v096() {
        assert_eq!((CONFIG_BASE >> 9) & 0b111, 0b001);
    }

    // -- Voltage scaling ---------------------------------------------------

    #[test]
    fn voltage_full_scale() {
        assert!((voltage_from_raw(32767) - 4.096).abs() < 0.001);
    }

    #[test]
    fn voltage_zero() {
        assert_eq!(voltage_from_raw(0), 0.0);
    }

    #[test]
    fn voltage_dry_reference_count() {
        // 12800 counts ≈ 1.60 V, the default dry reference.
        assert!((voltage_from_raw(12800) - 1.60).abs() < 0.001);
    }

    #[test]
    fn moisture_sample_passes_valid_count_through() {
        let (raw, v) = moisture_sample(12800);
        assert_eq!(raw, 12800);
        assert!((v - 1.60).abs() < 0.001);
    }

    #[test]
    fn moisture_sample_clamps_count_and_voltage_together() {
        // negative bus noise must not yield raw = 0 with a negative voltage
        let (raw, v) = moisture_sample(-12);
        assert_eq!(raw, 0);
        assert_eq!(v, 0.0);
    }

    // -- BH1750 conversion -------------------------------------------------

    #[test]
    fn lux_zero_count() {
        assert_eq!(lux_from_bytes([0x00, 0x00]), 0.0);
    }

    #[test]
    fn lux_big_endian_order() {
        // 0x0100 = 256 counts → 256 / 1.2 = 213.33 lx
        assert_eq!(lux_from_bytes([0x01, 0x00]), 213.33);
        // byte-swapped input must give a different answer
        assert_eq!(lux_from_bytes([0x00, 0x01]), 0.83);
    }

    #[test]
    fn lux_full_scale() {
        assert_eq!(lux_from_bytes([0xff, 0xff]), 54612.5);
    }

    // -- DS18B20 transcript parsing ---------------------------------------

    const GOOD_TRANSCRIPT: &str =
        "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n72 01 4b 46 7f ff 0e 10 57 t=23125\n";

    #[test]
    fn w1_valid_transcript() {
        assert_eq!(parse_w1_transcript(GOOD_TRANSCRIPT).unwrap(), 23.125);
    }

    #[test]
    fn w1_negative_temperature() {
        let t = "ff fe 4b 46 7f ff 0e 10 a1 : crc=a1 YES\nff fe 4b 46 7f ff 0e 10 a1 t=-1250\n";
        assert_eq!(parse_w1_transcript(t).unwrap(), -1.25);
    }

    #[test]
    fn w1_crc_failure_rejected() {
        let t = "72 01 4b 46 7f ff 0e 10 57 : crc=57 NO\n72 01 4b 46 7f ff 0e 10 57 t=23125\n";
        assert!(matches!(parse_w1_transcript(t), Err(SensorError::Checksum)));
    }

    #[test]
    fn w1_missing_data_line_rejected() {
        let t = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n";
        assert!(matches!(parse_w1_transcript(t), Err(SensorError::Format(_))));
    }

    #[test]
    fn w1_missing_t_field_rejected() {
        let t = "crc=57 YES\nno temperature here\n";
        assert!(matches!(parse_w1_transcript(t), Err(SensorError::Format(_))));
    }

    #[test]
    fn w1_garbage_temperature_rejected() {
        let t = "crc=57 YES\nt=abc\n";
        assert!(matches!(parse_w1_transcript(t), Err(SensorError::Format(_))));
    }

    #[test]
    fn w1_empty_transcript_rejected() {
        assert!(matches!(parse_w1_transcript(""), Err(SensorError::Format(_))));
    }

    // -- DHT22 frame decoding ----------------------------------------------

    #[test]
    fn dht_valid_frame() {
        // humidity 65.2 %, temperature 24.7 °C
        let data = [0x02, 0x8c, 0x00, 0xf7, 0x02u8
            .wrapping_add(0x8c)
            .wrapping_add(0x00)
            .wrapping_add(0xf7)];
        let (t, h) = decode_dht22_frame(data).unwrap();
        assert_eq!(h, 65.2);
        assert_eq!(t, 24.7);
    }

    #[test]
    fn dht_negative_temperature() {
        // sign bit set in byte 2: -10.0 °C, humidity 50.0 %
        let data = [0x01, 0xf4, 0x80, 0x64, 0x01u8
            .wrapping_add(0xf4)
            .wrapping_add(0x80)
            .wrapping_add(0x64)];
        let (t, h) = decode_dht22_frame(data).unwrap();
        assert_eq!(h, 50.0);
        assert_eq!(t, -10.0);
    }

    #[test]
    fn dht_checksum_mismatch_rejected() {
        let data = [0x02, 0x8c, 0x00, 0xf7, 0x00];
        assert!(matches!(decode_dht22_frame(data), Err(SensorError::Checksum)));
    }

    #[test]
    fn dht_implausible_humidity_rejected() {
        // humidity 6553.5 % with a valid checksum
        let data = [0xff, 0xff, 0x00, 0x00, 0xffu8.wrapping_add(0xff)];
        assert!(matches!(decode_dht22_frame(data), Err(SensorError::Format(_))));
    }

    // -- Mock context ------------------------------------------------------

    #[cfg(all(not(feature = "hardware"), feature = "sim"))]
    #[test]
    fn mock_moisture_read_is_in_calibration_window() {
        let cfg = Config::default();
        let mut ctx = SensorContext::new(&cfg).unwrap();
        let (raw, voltage) = ctx.read_moisture_raw().unwrap();
        assert!((0..=32767).contains(&raw));
        assert!((0.0..=4.096).contains(&voltage));
    }

    #[cfg(all(not(feature = "hardware"), feature = "sim"))]
    #[test]
    fn mock_air_reading_is_plausible() {
        let cfg = Config::default();
        let mut ctx = SensorContext::new(&cfg).unwrap();
        let (t, h) = ctx.read_air_temp_humidity().unwrap();
        assert!((15.0..=30.0).contains(&t));
        assert!((30.0..=90.0).contains(&h));
    }
}
