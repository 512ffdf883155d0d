//! Completion-marker detection.
//!
//! Agents signal the end of a session by dropping a file named
//! `<session_name>.status` into a well-known directory. The first line is
//! either `COMPLETED` or `FAILED:<reason>`. Detection prefers filesystem
//! change notification and falls back to the caller's poll cadence; the
//! scan itself is cheap enough to run on every tick.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, Sender};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Completed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub session_name: String,
    pub outcome: CompletionOutcome,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watch error: {0}")]
    Watch(String),
}

pub type Result<T> = std::result::Result<T, CompletionError>;

/// Parse the first line of a marker file.
pub fn parse_marker(content: &str) -> Option<CompletionOutcome> {
    let first = content.lines().next()?.trim();
    if first == "COMPLETED" {
        return Some(CompletionOutcome::Completed);
    }
    if let Some(reason) = first.strip_prefix("FAILED:") {
        return Some(CompletionOutcome::Failed {
            reason: reason.trim().to_string(),
        });
    }
    if first == "FAILED" {
        return Some(CompletionOutcome::Failed {
            reason: String::new(),
        });
    }
    None
}

// ---------------------------------------------------------------------------
// CompletionDetector
// ---------------------------------------------------------------------------

/// Watches the status drop-directory for completion markers.
pub struct CompletionDetector {
    status_dir: PathBuf,
    /// Kept alive for the lifetime of the detector; its events only wake
    /// the loop early, the scan is authoritative.
    _watcher: Option<RecommendedWatcher>,
    rx: Option<Receiver<()>>,
}

impl CompletionDetector {
    /// Create the detector, establishing the drop-directory and an FS
    /// watch on it when the platform supports one.
    pub fn new(status_dir: impl Into<PathBuf>) -> Result<Self> {
        let status_dir = status_dir.into();
        std::fs::create_dir_all(&status_dir)?;

        let (tx, rx): (Sender<()>, Receiver<()>) = crossbeam_channel::unbounded();
        let watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        }) {
            Ok(mut w) => match w.watch(&status_dir, RecursiveMode::NonRecursive) {
                Ok(()) => Some(w),
                Err(e) => {
                    warn!(error = %e, dir = %status_dir.display(), "fs watch unavailable, relying on polling");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "fs watcher could not be created, relying on polling");
                None
            }
        };

        Ok(Self {
            status_dir,
            rx: watcher.as_ref().map(|_| rx),
            _watcher: watcher,
        })
    }

    pub fn status_dir(&self) -> &Path {
        &self.status_dir
    }

    /// True when notification-driven wakeups are available.
    pub fn has_notification(&self) -> bool {
        self.rx.is_some()
    }

    /// Drain pending change notifications, returning whether any arrived.
    pub fn drain_notifications(&self) -> bool {
        match &self.rx {
            Some(rx) => {
                let mut any = false;
                while rx.try_recv().is_ok() {
                    any = true;
                }
                any
            }
            None => false,
        }
    }

    /// Scan the drop-directory and parse every well-formed marker.
    pub fn scan(&self) -> Vec<CompletionSignal> {
        let mut signals = Vec::new();
        let entries = match std::fs::read_dir(&self.status_dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "status dir unreadable");
                return signals;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("status") {
                continue;
            }
            let Some(session_name) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s.to_string())
            else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(content) => match parse_marker(&content) {
                    Some(outcome) => {
                        debug!(session = %session_name, ?outcome, "completion marker found");
                        signals.push(CompletionSignal {
                            session_name,
                            outcome,
                        });
                    }
                    None => {
                        // Probably a partial write; picked up on the next scan.
                        debug!(path = %path.display(), "marker has no recognizable sentinel yet");
                    }
                },
                Err(e) => warn!(path = %path.display(), error = %e, "marker unreadable"),
            }
        }
        signals
    }

    /// Remove a processed marker.
    pub fn consume(&self, session_name: &str) -> Result<()> {
        let path = self.marker_path(session_name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Delete markers older than `ttl` that belong to no known session.
    /// Returns the sessions whose markers were swept.
    pub fn sweep_orphans(&self, ttl: Duration, known_sessions: &[String]) -> Vec<String> {
        let cutoff = SystemTime::now()
            .checked_sub(ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut swept = Vec::new();

        let Ok(entries) = std::fs::read_dir(&self.status_dir) else {
            return swept;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("status") {
                continue;
            }
            let Some(session) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if known_sessions.iter().any(|s| s == session) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if modified < cutoff {
                if std::fs::remove_file(&path).is_ok() {
                    warn!(session, "swept orphan completion marker");
                    swept.push(session.to_string());
                }
            }
        }
        swept
    }

    pub fn marker_path(&self, session_name: &str) -> PathBuf {
        self.status_dir.join(format!("{session_name}.status"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_marker_recognizes_sentinels() {
        assert_eq!(parse_marker("COMPLETED\n"), Some(CompletionOutcome::Completed));
        assert_eq!(
            parse_marker("FAILED: tests broke\nextra"),
            Some(CompletionOutcome::Failed {
                reason: "tests broke".to_string()
            })
        );
        assert_eq!(
            parse_marker("FAILED"),
            Some(CompletionOutcome::Failed {
                reason: String::new()
            })
        );
        assert_eq!(parse_marker("WORKING\n"), None);
        assert_eq!(parse_marker(""), None);
    }

    #[test]
    fn scan_finds_markers_and_consume_removes_them() {
        let dir = tempfile::tempdir().unwrap();
        let detector = CompletionDetector::new(dir.path()).unwrap();

        std::fs::write(dir.path().join("s1.status"), "COMPLETED\n").unwrap();
        std::fs::write(dir.path().join("s2.status"), "FAILED:oom\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut signals = detector.scan();
        signals.sort_by(|a, b| a.session_name.cmp(&b.session_name));
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].session_name, "s1");
        assert_eq!(signals[0].outcome, CompletionOutcome::Completed);
        assert_eq!(
            signals[1].outcome,
            CompletionOutcome::Failed {
                reason: "oom".to_string()
            }
        );

        detector.consume("s1").unwrap();
        assert_eq!(detector.scan().len(), 1);
        // Consuming twice is fine.
        detector.consume("s1").unwrap();
    }

    #[test]
    fn malformed_markers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let detector = CompletionDetector::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("s1.status"), "").unwrap();
        assert!(detector.scan().is_empty());
    }

    #[test]
    fn sweep_removes_only_old_unknown_markers() {
        let dir = tempfile::tempdir().unwrap();
        let detector = CompletionDetector::new(dir.path()).unwrap();

        std::fs::write(dir.path().join("dead.status"), "COMPLETED\n").unwrap();
        std::fs::write(dir.path().join("live.status"), "COMPLETED\n").unwrap();

        // Zero TTL makes both candidates "old"; only the unknown one goes.
        let swept = detector.sweep_orphans(Duration::ZERO, &["live".to_string()]);
        assert_eq!(swept, vec!["dead"]);
        assert!(dir.path().join("live.status").exists());
        assert!(!dir.path().join("dead.status").exists());

        // A long TTL protects fresh markers entirely.
        std::fs::write(dir.path().join("fresh.status"), "COMPLETED\n").unwrap();
        let swept = detector.sweep_orphans(Duration::from_secs(3600), &[]);
        assert!(swept.is_empty());
    }

    #[test]
    fn notifications_arrive_for_new_markers() {
        let dir = tempfile::tempdir().unwrap();
        let detector = CompletionDetector::new(dir.path()).unwrap();
        if !detector.has_notification() {
            return; // platform without inotify support; polling covers it
        }
        std::fs::write(dir.path().join("s1.status"), "COMPLETED\n").unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(detector.drain_notifications());
    }
}
