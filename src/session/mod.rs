//! Session types and snapshot persistence.

mod registry;

pub use registry::{SessionHandle, SessionRegistry};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    /// Past the idle timeout but not yet swept.
    Idle,
    Expired,
    Closed,
}

/// One user's session record. Owned by the registry; mutated only through
/// registry operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: SessionState,
}

impl Session {
    pub(crate) fn new(user: &str, idle_timeout: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user: user.to_string(),
            created_at: now,
            last_active_at: now,
            expires_at: deadline(now, idle_timeout),
            state: SessionState::Active,
        }
    }

    pub(crate) fn touch(&mut self, idle_timeout: Duration) {
        let now = Utc::now();
        self.last_active_at = now;
        self.expires_at = deadline(now, idle_timeout);
    }

    /// Whether the idle timeout has elapsed for a still-open session.
    pub fn is_idle_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == SessionState::Active && now > self.expires_at
    }

    /// State as an observer would see it right now: an Active session
    /// past its idle deadline reads as Idle until the sweep expires it.
    pub fn effective_state(&self, now: DateTime<Utc>) -> SessionState {
        if self.is_idle_expired(now) {
            SessionState::Idle
        } else {
            self.state
        }
    }
}

/// Saturating deadline: an absurdly large idle timeout pins the expiry
/// at the far future instead of overflowing.
fn deadline(now: DateTime<Utc>, idle_timeout: Duration) -> DateTime<Utc> {
    now.checked_add_signed(idle_timeout)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Durable snapshot of the session table, for restart continuity.
///
/// Written as a map keyed by user identity with an atomic write (unique
/// temp file + rename), so a crash mid-save never leaves a torn file.
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("sessions.json"),
        }
    }

    pub fn save(&self, sessions: &[Session]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entries: HashMap<&str, &Session> =
            sessions.iter().map(|s| (s.user.as_str(), s)).collect();
        let content = serde_json::to_string_pretty(&entries)?;

        let tmp_path = self.path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            Uuid::new_v4().as_simple()
        ));
        fs::write(&tmp_path, &content)?;
        fs::rename(&tmp_path, &self.path)?;

        debug!("Saved {} session snapshots to {:?}", sessions.len(), self.path);
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<Session>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        let entries: HashMap<String, Session> =
            serde_json::from_str(&content).unwrap_or_default();
        Ok(entries.into_values().collect())
    }
}
