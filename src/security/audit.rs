//! Append-only, hash-chained audit log for gate decisions.
//!
//! One JSON object per line (JSONL), stored in the state directory outside
//! the approved root. Each entry carries the SHA-256 of the previous line,
//! forming a tamper-evident chain.
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | ISO 8601 timestamp |
//! | `user` | Identity the decision was made for |
//! | `kind` | What happened: `auth_failure`, `rate_limited`, etc. |
//! | `detail` | Which rule fired, which limit was hit, and why |
//! | `prev_entry_sha256` | SHA-256 of the previous JSONL line (chain link) |
//!
//! Appends are serialized behind a mutex, so events for a single user land
//! in the order their decisions were made. The first entry uses 64 zeros as
//! `prev_entry_sha256`; a broken link means the log file was tampered with.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The hash used for the first entry in the chain (no predecessor).
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One gate decision, recorded at the moment the decision was made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// ISO 8601 timestamp of the decision.
    pub ts: String,
    /// Identity the decision applies to.
    pub user: String,
    /// What kind of decision occurred.
    pub kind: AuditKind,
    /// Specific cause: rule name, limit, or confirmation outcome.
    pub detail: String,
    /// SHA-256 of the previous JSONL line (chain link, hex-encoded).
    pub prev_entry_sha256: String,
}

/// Decision kinds recorded in the audit log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Identity authenticated (whitelist or token).
    AuthSuccess,
    /// Authentication rejected. The detail records the real cause, which
    /// is never surfaced to the caller.
    AuthFailure,
    /// Token bucket exhausted or spend cap reached.
    RateLimited,
    /// A dangerous-pattern rule blocked the request.
    ValidationBlocked,
    /// An action was denied, including rejected or timed-out confirmations.
    PermissionDenied,
    /// A pending confirmation was approved by the user.
    PermissionConfirmed,
    /// A file operation inside the approved root was allowed or gated.
    FileAccess,
    /// Previous audit entry corrupted, new chain segment started.
    ChainRecovery,
}

/// Handle to the append-only audit file.
///
/// Cheap to share via `Arc`; all writers funnel through one mutex so the
/// chain is never forked by concurrent appends.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Open (or create) the audit log at `path`.
    ///
    /// Parent directories are created if missing. The file itself is only
    /// created on the first append.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create audit directory {}", parent.display()))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Append a new entry, linking it to the previous line's hash.
    ///
    /// If the last line is corrupted (not valid JSON), a `ChainRecovery`
    /// entry is inserted first to record the break point.
    pub fn append(&self, user: &str, kind: AuditKind, detail: impl Into<String>) -> Result<()> {
        let _guard = self.write_lock.lock().expect("audit lock poisoned");

        let prev_hash = if self.path.exists() {
            let content = fs::read_to_string(&self.path).context("Failed to read audit log")?;
            match content.lines().last() {
                Some(last_line) if !last_line.is_empty() => {
                    if serde_json::from_str::<AuditEvent>(last_line).is_ok() {
                        sha256_hex(last_line.as_bytes())
                    } else {
                        let raw_hash = sha256_hex(last_line.as_bytes());
                        let recovery = AuditEvent {
                            ts: chrono::Utc::now().to_rfc3339(),
                            user: String::new(),
                            kind: AuditKind::ChainRecovery,
                            detail: format!(
                                "Previous entry corrupted ({} bytes), new chain segment",
                                last_line.len()
                            ),
                            prev_entry_sha256: raw_hash,
                        };
                        let recovery_json = serde_json::to_string(&recovery)
                            .context("Failed to serialize recovery entry")?;
                        append_line(&self.path, &recovery_json)?;
                        sha256_hex(recovery_json.as_bytes())
                    }
                }
                _ => GENESIS_HASH.to_string(),
            }
        } else {
            GENESIS_HASH.to_string()
        };

        let entry = AuditEvent {
            ts: chrono::Utc::now().to_rfc3339(),
            user: user.to_string(),
            kind,
            detail: detail.into(),
            prev_entry_sha256: prev_hash,
        };

        let json = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
        append_line(&self.path, &json)?;

        Ok(())
    }

    /// Read and parse all entries.
    ///
    /// Corrupted lines are skipped (not fatal). Returns an empty vector if
    /// the log file does not exist.
    pub fn read_events(&self) -> Result<Vec<AuditEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).context("Failed to read audit log")?;
        let mut entries = Vec::new();

        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<AuditEvent>(line) {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Verify the integrity of the hash chain.
    ///
    /// Returns the indices where the chain is broken; an empty result
    /// means the chain is intact. Corrupted (non-JSON) lines are reported
    /// as broken and skipped.
    pub fn verify_chain(&self) -> Result<Vec<usize>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).context("Failed to read audit log")?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

        if lines.is_empty() {
            return Ok(Vec::new());
        }

        let parsed: Vec<Option<AuditEvent>> = lines
            .iter()
            .map(|line| serde_json::from_str(line).ok())
            .collect();

        let mut broken = Vec::new();

        match &parsed[0] {
            Some(first) if first.prev_entry_sha256 == GENESIS_HASH => {}
            _ => broken.push(0),
        }

        for i in 1..lines.len() {
            let Some(entry) = &parsed[i] else {
                broken.push(i);
                continue;
            };
            let expected_hash = sha256_hex(lines[i - 1].as_bytes());
            if entry.prev_entry_sha256 != expected_hash {
                broken.push(i);
            }
        }

        Ok(broken)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append a single line to a file.
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open audit log")?;
    writeln!(file, "{}", line).context("Failed to write audit entry")?;
    Ok(())
}

/// Compute hex-encoded SHA-256.
fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_log(dir: &Path) -> AuditLog {
        AuditLog::open(dir.join("audit.jsonl")).unwrap()
    }

    #[test]
    fn audit_chain_integrity() {
        let tmp = tempfile::tempdir().unwrap();
        let log = open_log(tmp.path());

        for i in 0..5 {
            log.append("user-1", AuditKind::ValidationBlocked, format!("rule {}", i))
                .unwrap();
        }

        let entries = log.read_events().unwrap();
        assert_eq!(entries.len(), 5);

        let broken = log.verify_chain().unwrap();
        assert!(broken.is_empty(), "Chain should be intact: {:?}", broken);
    }

    #[test]
    fn first_entry_uses_genesis_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let log = open_log(tmp.path());
        log.append("user-1", AuditKind::AuthSuccess, "whitelist")
            .unwrap();

        let entries = log.read_events().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].prev_entry_sha256, GENESIS_HASH);
        assert_eq!(entries[0].kind, AuditKind::AuthSuccess);
    }

    #[test]
    fn per_user_events_in_append_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log = open_log(tmp.path());

        log.append("alice", AuditKind::AuthSuccess, "whitelist")
            .unwrap();
        log.append("bob", AuditKind::AuthFailure, "hash mismatch")
            .unwrap();
        log.append("alice", AuditKind::RateLimited, "retry in 1.0s")
            .unwrap();

        let alice: Vec<_> = log
            .read_events()
            .unwrap()
            .into_iter()
            .filter(|e| e.user == "alice")
            .collect();
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].kind, AuditKind::AuthSuccess);
        assert_eq!(alice[1].kind, AuditKind::RateLimited);
    }

    #[test]
    fn broken_chain_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let log = open_log(tmp.path());

        for i in 0..3 {
            log.append("user-1", AuditKind::PermissionDenied, format!("reason {}", i))
                .unwrap();
        }

        // Tamper with the middle line
        let content = fs::read_to_string(log.path()).unwrap();
        let mut lines: Vec<&str> = content.lines().collect();
        let tampered = lines[1].replace("reason 1", "rewritten");
        lines[1] = &tampered;
        fs::write(log.path(), lines.join("\n") + "\n").unwrap();

        let broken = log.verify_chain().unwrap();
        assert!(!broken.is_empty(), "Should detect broken chain");
        assert!(broken.contains(&2), "Entry 2 should have broken link");
    }

    #[test]
    fn empty_log_no_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let log = open_log(tmp.path());

        assert!(log.read_events().unwrap().is_empty());
        assert!(log.verify_chain().unwrap().is_empty());
    }

    #[test]
    fn kinds_serialize_snake_case() {
        let entry = AuditEvent {
            ts: "2026-08-01T10:00:00Z".to_string(),
            user: "42".to_string(),
            kind: AuditKind::ValidationBlocked,
            detail: "rm -rf".to_string(),
            prev_entry_sha256: GENESIS_HASH.to_string(),
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"validation_blocked\""));
    }

    #[test]
    fn chain_recovery_on_corrupted_line() {
        let tmp = tempfile::tempdir().unwrap();
        let log = open_log(tmp.path());

        log.append("user-1", AuditKind::AuthSuccess, "token")
            .unwrap();

        // Corrupt the tail
        let mut content = fs::read_to_string(log.path()).unwrap();
        content.push_str("this is not json\n");
        fs::write(log.path(), &content).unwrap();

        log.append("user-1", AuditKind::AuthSuccess, "token")
            .unwrap();

        let entries = log.read_events().unwrap();
        // AuthSuccess, ChainRecovery, AuthSuccess (corrupted line skipped)
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].kind, AuditKind::ChainRecovery);
        assert!(entries[1].detail.contains("corrupted"));
    }
}
