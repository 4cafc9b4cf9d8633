//! Single-instance supervision via a plain-text status marker.
//!
//! The marker file is the shared contract between the logger, the stop
//! command, and anything that just wants to know whether the logger is up.
//! Its body is one line:
//!
//! - `DD.MM.YYYY. u HH:MM:SS (PID: <pid>)` — a logger started then, with
//!   that PID; refreshed every acquisition cycle as a heartbeat
//! - `-.-`     — a logger exited cleanly
//! - `STOPPED` — a logger was stopped externally
//!
//! A marker naming a dead PID is a crash leftover; a new instance takes
//! over after a warning. Writes are temp-file-then-rename so a reader can
//! never observe a torn marker.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System};
use thiserror::Error;
use time::format_description::FormatItem;
use time::macros::format_description;
use tracing::{info, warn};

use crate::db::now_local;

const MARKER_TS_FORMAT: &[FormatItem<'static>] =
    format_description!("[day].[month].[year]. u [hour]:[minute]:[second]");

const MARKER_CLEAN_EXIT: &str = "-.-";
const MARKER_STOPPED: &str = "STOPPED";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("another logger instance is already running (PID: {pid})")]
    AlreadyRunning { pid: u32 },
}

/// What the marker file says, before any liveness judgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// No file, or an unrecognized body.
    Absent,
    /// Clean shutdown (`-.-`) or external stop (`STOPPED`).
    NotRunning,
    /// A start record with the owning PID and its start timestamp.
    Started { pid: u32, since: String },
}

/// The marker combined with an actual process-table check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    NotRunning,
    Running { pid: u32, since: String },
    /// The marker names a PID that no longer exists.
    Crashed { pid: u32, since: String },
}

pub struct Supervisor {
    status_file: PathBuf,
}

impl Supervisor {
    pub fn new(status_file: impl Into<PathBuf>) -> Self {
        Self {
            status_file: status_file.into(),
        }
    }

    /// Claim the single-instance lock for this process.
    ///
    /// Fails only when the marker names a live process other than us. A
    /// stale marker (dead PID) is taken over with a warning.
    pub fn acquire(&self) -> Result<()> {
        if let Marker::Started { pid, since } = self.read_marker() {
            if pid != std::process::id() && pid_alive(pid) {
                return Err(SupervisorError::AlreadyRunning { pid }.into());
            }
            if !pid_alive(pid) {
                warn!(
                    stale_pid = pid,
                    since, "stale status marker from a crashed instance — taking over"
                );
            }
        }
        self.write_started()?;
        info!(pid = std::process::id(), "logger instance registered");
        Ok(())
    }

    /// Heartbeat: rewrite the start record with the current time. Called
    /// once per acquisition cycle so the marker timestamp doubles as a
    /// liveness indicator.
    pub fn refresh(&self) -> Result<()> {
        self.write_started()
    }

    /// Record a clean shutdown.
    pub fn release(&self) -> Result<()> {
        self.write_marker(MARKER_CLEAN_EXIT)
    }

    /// The marker cross-checked against the process table.
    pub fn status(&self) -> Status {
        match self.read_marker() {
            Marker::Absent | Marker::NotRunning => Status::NotRunning,
            Marker::Started { pid, since } => {
                if pid_alive(pid) {
                    Status::Running { pid, since }
                } else {
                    Status::Crashed { pid, since }
                }
            }
        }
    }

    /// Stop a running instance from the outside: SIGTERM the recorded PID
    /// (hard kill if the platform has no TERM) and mark the file STOPPED.
    /// Idempotent; stopping an already-stopped logger just normalizes the
    /// marker.
    pub fn stop(&self) -> Result<()> {
        match self.read_marker() {
            Marker::Started { pid, since } if pid_alive(pid) => {
                info!(pid, since, "stopping logger instance");
                let mut sys = System::new();
                sys.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
                    ProcessRefreshKind::new(),
                );
                if let Some(proc_) = sys.process(Pid::from_u32(pid)) {
                    match proc_.kill_with(Signal::Term) {
                        Some(true) => info!(pid, "sent SIGTERM"),
                        Some(false) => warn!(pid, "failed to signal process"),
                        None => {
                            // platform without TERM support
                            if proc_.kill() {
                                info!(pid, "killed process");
                            } else {
                                warn!(pid, "failed to kill process");
                            }
                        }
                    }
                }
            }
            Marker::Started { pid, .. } => {
                warn!(pid, "marker names a dead process — nothing to stop");
            }
            Marker::Absent | Marker::NotRunning => {
                info!("no running logger instance");
            }
        }
        self.write_marker(MARKER_STOPPED)
    }

    // ----------------------------
    // Marker file I/O
    // ----------------------------

    fn read_marker(&self) -> Marker {
        let contents = match std::fs::read_to_string(&self.status_file) {
            Ok(c) => c,
            Err(_) => return Marker::Absent,
        };
        parse_marker(contents.trim())
    }

    fn write_started(&self) -> Result<()> {
        let ts = now_local().format(MARKER_TS_FORMAT).unwrap_or_default();
        self.write_marker(&format!("{ts} (PID: {})", std::process::id()))
    }

    fn write_marker(&self, body: &str) -> Result<()> {
        atomic_write(&self.status_file, body)
            .with_context(|| format!("writing status marker {}", self.status_file.display()))
    }
}

/// Parse a marker body. Anything that is not a clean-exit token or a
/// well-formed start record counts as absent.
pub fn parse_marker(body: &str) -> Marker {
    if body.is_empty() {
        return Marker::Absent;
    }
    if body == MARKER_CLEAN_EXIT || body == MARKER_STOPPED {
        return Marker::NotRunning;
    }
    let (since, tail) = match body.split_once(" (PID: ") {
        Some(parts) => parts,
        None => return Marker::Absent,
    };
    let pid = match tail.strip_suffix(')').and_then(|p| p.parse::<u32>().ok()) {
        Some(pid) => pid,
        None => return Marker::Absent,
    };
    Marker::Started {
        pid,
        since: since.to_string(),
    }
}

fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
        ProcessRefreshKind::new(),
    );
    sys.process(Pid::from_u32(pid)).is_some()
}

/// Write via a sibling temp file and rename so readers never see a torn
/// marker.
fn atomic_write(path: &Path, body: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn supervisor(dir: &TempDir) -> Supervisor {
        Supervisor::new(dir.path().join("logger_status.txt"))
    }

    // -- parsing -----------------------------------------------------------

    #[test]
    fn parse_clean_exit_tokens() {
        assert_eq!(parse_marker("-.-"), Marker::NotRunning);
        assert_eq!(parse_marker("STOPPED"), Marker::NotRunning);
    }

    #[test]
    fn parse_start_record() {
        assert_eq!(
            parse_marker("25.08.2026. u 14:02:11"),
            Marker::Absent,
            "no PID suffix"
        );
        assert_eq!(
            parse_marker("25.08.2026. u 14:02:11 (PID: 4242)"),
            Marker::Started {
                pid: 4242,
                since: "25.08.2026. u 14:02:11".to_string()
            }
        );
    }

    #[test]
    fn parse_garbage_is_absent() {
        assert_eq!(parse_marker(""), Marker::Absent);
        assert_eq!(parse_marker("hello"), Marker::Absent);
        assert_eq!(parse_marker("x (PID: not-a-pid)"), Marker::Absent);
        assert_eq!(parse_marker("x (PID: 12"), Marker::Absent);
    }

    // -- lifecycle ---------------------------------------------------------

    #[test]
    fn acquire_writes_own_pid() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.acquire().unwrap();

        match sup.read_marker() {
            Marker::Started { pid, since } => {
                assert_eq!(pid, std::process::id());
                assert!(since.contains(" u "), "unexpected timestamp shape: {since}");
            }
            other => panic!("expected start record, got {other:?}"),
        }
        assert!(matches!(sup.status(), Status::Running { .. }));
    }

    #[test]
    fn acquire_rejects_live_foreign_pid() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        // PID 1 exists on any Linux host and is never us.
        let marker_path = dir.path().join("logger_status.txt");
        let foreign = "25.08.2026. u 14:02:11 (PID: 1)";
        std::fs::write(&marker_path, foreign).unwrap();

        let err = sup.acquire().unwrap_err();
        assert!(err.to_string().contains("already running"));

        // the running instance's marker must survive the rejected start
        let body = std::fs::read_to_string(&marker_path).unwrap();
        assert_eq!(body, foreign, "rejected start overwrote the marker");
    }

    #[test]
    fn acquire_takes_over_stale_marker() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        // PID numbers near u32::MAX are far above any real pid_max.
        std::fs::write(
            dir.path().join("logger_status.txt"),
            "25.08.2026. u 14:02:11 (PID: 4294900000)",
        )
        .unwrap();

        sup.acquire().unwrap();
        assert!(matches!(sup.status(), Status::Running { .. }));
    }

    #[test]
    fn release_marks_clean_exit() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.acquire().unwrap();
        sup.release().unwrap();

        let body = std::fs::read_to_string(dir.path().join("logger_status.txt")).unwrap();
        assert_eq!(body, "-.-");
        assert_eq!(sup.status(), Status::NotRunning);
    }

    #[test]
    fn refresh_rewrites_start_record() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.acquire().unwrap();
        sup.refresh().unwrap();
        assert!(matches!(
            sup.read_marker(),
            Marker::Started { pid, .. } if pid == std::process::id()
        ));
    }

    #[test]
    fn status_reports_crash_for_dead_pid() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        std::fs::write(
            dir.path().join("logger_status.txt"),
            "25.08.2026. u 14:02:11 (PID: 4294900000)",
        )
        .unwrap();

        assert!(matches!(sup.status(), Status::Crashed { pid: 4294900000, .. }));
    }

    #[test]
    fn stop_without_running_instance_normalizes_marker() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.stop().unwrap();

        let body = std::fs::read_to_string(dir.path().join("logger_status.txt")).unwrap();
        assert_eq!(body, "STOPPED");
        assert_eq!(sup.status(), Status::NotRunning);

        // second stop is a no-op
        sup.stop().unwrap();
        assert_eq!(sup.status(), Status::NotRunning);
    }
}
