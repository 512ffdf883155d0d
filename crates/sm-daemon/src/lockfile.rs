//! Single-instance guard.
//!
//! One daemon per user: `~/.splitmind/daemon.lock` holds a single line,
//! `<pid> <host> <api_port> <version>`, written with `O_CREAT | O_EXCL`
//! so racing daemons get exactly one winner. CLIs read the same line to
//! find the control plane. The winner holds an [`InstanceLock`] whose
//! drop deletes the file; a line left behind by a crashed daemon (pid no
//! longer alive) is cleaned up on the next probe.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another daemon is running (pid={pid}, api={url})")]
    Held { pid: u32, url: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// RunningDaemon
// ---------------------------------------------------------------------------

/// What the lock line says about the daemon that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningDaemon {
    pub pid: u32,
    pub host: String,
    pub api_port: u16,
    pub version: String,
}

impl RunningDaemon {
    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.host, self.api_port)
    }

    fn to_line(&self) -> String {
        format!("{} {} {} {}", self.pid, self.host, self.api_port, self.version)
    }

    fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let pid = parts.next()?.parse().ok()?;
        let host = parts.next()?.to_string();
        let api_port = parts.next()?.parse().ok()?;
        let version = parts.next().unwrap_or("unknown").to_string();
        Some(Self {
            pid,
            host,
            api_port,
            version,
        })
    }
}

// ---------------------------------------------------------------------------
// Probe / acquire
// ---------------------------------------------------------------------------

pub fn default_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".splitmind").join("daemon.lock")
}

/// Is a daemon running? Reads the lock line and checks its pid; a line
/// whose writer is dead (or that does not parse) is removed on the spot.
pub fn probe() -> Option<RunningDaemon> {
    probe_at(&default_path())
}

pub fn probe_at(path: &Path) -> Option<RunningDaemon> {
    let line = std::fs::read_to_string(path).ok()?;
    match RunningDaemon::parse_line(line.trim()) {
        Some(running) if pid_alive(running.pid) => Some(running),
        Some(running) => {
            info!(pid = running.pid, "removing lock of dead daemon");
            let _ = std::fs::remove_file(path);
            None
        }
        None => {
            warn!(path = %path.display(), "unreadable lock line, removing");
            let _ = std::fs::remove_file(path);
            None
        }
    }
}

/// Claim the single-instance lock for this process.
pub fn acquire(host: &str, api_port: u16) -> Result<InstanceLock, LockError> {
    acquire_at(default_path(), host, api_port)
}

pub fn acquire_at(path: PathBuf, host: &str, api_port: u16) -> Result<InstanceLock, LockError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let me = RunningDaemon {
        pid: std::process::id(),
        host: host.to_string(),
        api_port,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    // Second pass exists only to retake a lock that probe just swept.
    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", me.to_line())?;
                file.sync_all()?;
                return Ok(InstanceLock {
                    path,
                    pid: me.pid,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Some(running) = probe_at(&path) {
                    return Err(LockError::Held {
                        pid: running.pid,
                        url: running.api_url(),
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(LockError::Io(std::io::Error::other(
        "lock keeps reappearing during stale cleanup",
    )))
}

// ---------------------------------------------------------------------------
// InstanceLock
// ---------------------------------------------------------------------------

/// Ownership of the lock for this process's lifetime. Dropping it
/// deletes the file, but only while the line still names our pid, so a
/// replacement daemon's lock is never clobbered.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|line| RunningDaemon::parse_line(line.trim()))
            .map(|running| running.pid == self.pid)
            .unwrap_or(false);
        if ours {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 checks existence without delivering anything.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_line_round_trips() {
        let me = RunningDaemon {
            pid: 4321,
            host: "127.0.0.1".into(),
            api_port: 9000,
            version: "0.1.0".into(),
        };
        let parsed = RunningDaemon::parse_line(&me.to_line()).unwrap();
        assert_eq!(parsed, me);
        assert_eq!(parsed.api_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn garbage_lines_do_not_parse() {
        assert!(RunningDaemon::parse_line("").is_none());
        assert!(RunningDaemon::parse_line("not-a-pid 127.0.0.1 80 x").is_none());
        assert!(RunningDaemon::parse_line("12 127.0.0.1 not-a-port x").is_none());
    }

    #[test]
    fn acquire_then_probe_sees_this_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lock");

        let lock = acquire_at(path.clone(), "127.0.0.1", 7777).unwrap();
        let running = probe_at(&path).expect("our own lock should probe as live");
        assert_eq!(running.pid, std::process::id());
        assert_eq!(running.api_port, 7777);

        // Second claimant loses while we hold the lock.
        match acquire_at(path.clone(), "127.0.0.1", 8888) {
            Err(LockError::Held { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected Held, got {other:?}"),
        }

        drop(lock);
        assert!(!path.exists(), "drop releases the lock file");
    }

    #[test]
    fn stale_lock_of_dead_pid_is_retaken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lock");
        std::fs::write(&path, "3999999 127.0.0.1 1234 0.0.1\n").unwrap();

        assert!(probe_at(&path).is_none(), "dead pid probes as absent");
        // probe removed the file; a fresh write-then-acquire also works.
        std::fs::write(&path, "3999999 127.0.0.1 1234 0.0.1\n").unwrap();
        let lock = acquire_at(path.clone(), "127.0.0.1", 4567).unwrap();
        let running = probe_at(&path).unwrap();
        assert_eq!(running.pid, std::process::id());
        drop(lock);
    }

    #[test]
    fn drop_leaves_a_successors_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lock");

        let lock = acquire_at(path.clone(), "127.0.0.1", 1000).unwrap();
        // A replacement daemon overwrote the line while we were exiting.
        std::fs::write(&path, "99999 127.0.0.1 2000 0.2.0\n").unwrap();
        drop(lock);
        assert!(path.exists(), "someone else's lock survives our drop");
    }

    #[test]
    fn current_pid_probes_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(3_999_999));
    }
}
