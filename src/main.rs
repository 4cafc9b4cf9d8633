mod calibration;
mod config;
mod db;
mod irrigation;
mod relay;
mod scheduler;
mod sensor;
mod supervisor;

use anyhow::{bail, Result};
use std::env;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use db::Db;
use relay::RelayBoard;
use sensor::SensorContext;
use supervisor::{Status, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "soil-logger.toml".to_string());
    let cfg = config::load(&config_path)?;

    let supervisor = Supervisor::new(&cfg.status_file);

    match env::args().nth(1).as_deref() {
        None => {}
        Some("stop") => return supervisor.stop(),
        Some("status") => {
            match supervisor.status() {
                Status::Running { pid, since } => println!("running since {since} (PID: {pid})"),
                Status::Crashed { pid, since } => {
                    println!("crashed: marker from {since} names dead PID {pid}")
                }
                Status::NotRunning => println!("not running"),
            }
            return Ok(());
        }
        Some(other) => bail!("unknown command {other:?} (expected: stop, status)"),
    }

    // Single-instance lock comes before any hardware or database access:
    // a second logger must leave a running one's pins and pool alone.
    supervisor.acquire()?;

    let db = Db::connect(&cfg.db_url).await?;
    db.init_schema().await?;

    let mut sensors = SensorContext::new(&cfg)?;
    let mut relays = RelayBoard::new(&cfg)?;
    relays.init();

    let result = tokio::select! {
        r = scheduler::run(&cfg, &db, &mut sensors, &mut relays, &supervisor) => r,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!("acquisition loop failed: {e:#}");
    }

    // Fail-safe teardown in dependency order: pump off, pool closed,
    // marker released.
    relays.all_off_logged(&db, "automatic").await;
    db.close().await;
    supervisor.release()?;
    info!("logger stopped");

    result
}
