//! Append-only SQLite persistence for sensor readings and relay transition
//! events. The schema is created idempotently at startup and older databases
//! are upgraded in place by backfilling the columns later deployments added.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

const RELAY_TS_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One acquisition cycle's result. Every field is independently optional:
/// a missing value records a sensor failure, not a cycle failure. Immutable
/// once persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReading {
    pub timestamp: String,
    pub air_temp: Option<f64>,
    pub air_humidity: Option<f64>,
    pub soil_temp: Option<f64>,
    pub soil_raw: Option<i64>,
    pub soil_voltage: Option<f64>,
    pub soil_percent: Option<f64>,
    pub lux: Option<f64>,
    pub stable: bool,
}

/// One row of the relay audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub timestamp: String,
    pub relay_name: String,
    pub action: String,
    pub source: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:sensors.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Create the tables if needed and backfill columns that predate them.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT,
                dht22_air_temp REAL,
                dht22_humidity REAL,
                ds18b20_soil_temp REAL,
                soil_raw REAL,
                soil_voltage REAL,
                soil_percent REAL,
                lux REAL,
                stable INTEGER DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating logs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                relay_name TEXT,
                action TEXT,
                source TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating relay_log table")?;

        // Databases from before the light sensor and stability flag existed
        // lack these columns; add them in place.
        let cols: Vec<String> = sqlx::query("PRAGMA table_info(logs)")
            .fetch_all(&self.pool)
            .await
            .context("reading logs table info")?
            .iter()
            .map(|r| r.get::<String, _>(1))
            .collect();

        if !cols.iter().any(|c| c == "lux") {
            tracing::info!("adding missing 'lux' column to logs");
            sqlx::query("ALTER TABLE logs ADD COLUMN lux REAL")
                .execute(&self.pool)
                .await
                .context("adding lux column")?;
        }
        if !cols.iter().any(|c| c == "stable") {
            tracing::info!("adding missing 'stable' column to logs");
            sqlx::query("ALTER TABLE logs ADD COLUMN stable INTEGER DEFAULT 1")
                .execute(&self.pool)
                .await
                .context("adding stable column")?;
        }

        Ok(())
    }

    // ----------------------------
    // Sensor readings
    // ----------------------------

    pub async fn insert_reading(&self, r: &SensorReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO logs (timestamp, dht22_air_temp, dht22_humidity,
                              ds18b20_soil_temp, soil_raw, soil_voltage,
                              soil_percent, lux, stable)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.timestamp)
        .bind(r.air_temp)
        .bind(r.air_humidity)
        .bind(r.soil_temp)
        .bind(r.soil_raw)
        .bind(r.soil_voltage)
        .bind(r.soil_percent)
        .bind(r.lux)
        .bind(i64::from(r.stable))
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    /// The most recent `limit` readings, oldest first. This is the read
    /// surface the dashboard consumes.
    pub async fn last_logs(&self, limit: i64) -> Result<Vec<SensorReading>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, dht22_air_temp, dht22_humidity, ds18b20_soil_temp,
                   soil_raw, soil_voltage, soil_percent, lux, stable
            FROM logs
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("last_logs failed")?;

        let mut readings = rows
            .iter()
            .map(reading_from_row)
            .collect::<Result<Vec<_>>>()?;
        readings.reverse();
        Ok(readings)
    }

    // ----------------------------
    // Relay audit trail
    // ----------------------------

    pub async fn insert_relay_event(
        &self,
        relay_name: &str,
        action: &str,
        source: &str,
    ) -> Result<()> {
        let ts = now_local()
            .format(RELAY_TS_FORMAT)
            .unwrap_or_default();
        sqlx::query(
            "INSERT INTO relay_log (timestamp, relay_name, action, source) VALUES (?, ?, ?, ?)",
        )
        .bind(ts)
        .bind(relay_name)
        .bind(action)
        .bind(source)
        .execute(&self.pool)
        .await
        .context("insert_relay_event failed")?;
        Ok(())
    }

    /// The most recent `limit` relay transitions, newest first.
    pub async fn recent_relay_events(&self, limit: i64) -> Result<Vec<RelayEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, relay_name, action, source
            FROM relay_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_relay_events failed")?;

        rows.iter()
            .map(|r| {
                Ok(RelayEvent {
                    timestamp: r.try_get("timestamp")?,
                    relay_name: r.try_get("relay_name")?,
                    action: r.try_get("action")?,
                    source: r.try_get("source")?,
                })
            })
            .collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn reading_from_row(r: &SqliteRow) -> Result<SensorReading> {
    Ok(SensorReading {
        timestamp: r.try_get("timestamp")?,
        air_temp: r.try_get("dht22_air_temp")?,
        air_humidity: r.try_get("dht22_humidity")?,
        soil_temp: r.try_get("ds18b20_soil_temp")?,
        // soil_raw lives in a REAL-affinity column for historical reasons.
        soil_raw: r
            .try_get::<Option<f64>, _>("soil_raw")?
            .map(|v| v as i64),
        soil_voltage: r.try_get("soil_voltage")?,
        soil_percent: r.try_get("soil_percent")?,
        lux: r.try_get("lux")?,
        stable: r.try_get::<i64, _>("stable")? != 0,
    })
}

pub(crate) fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

// ===========================================================================
// Tests
// ===========================================================================
