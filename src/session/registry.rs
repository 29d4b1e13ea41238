//! Concurrency-safe session registry.
//!
//! One live session per user identity, held in a concurrent map with
//! per-entry locks so unrelated users never contend. Each session owns a
//! cancellation token: closing or expiring the session cancels any
//! in-flight action within a bounded delay, not just at its next natural
//! checkpoint.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::security::audit::AuditLog;
use crate::security::patterns::PatternSet;
use crate::security::pipeline::{ConfirmationBroker, PermissionPipeline};
use crate::session::{Session, SessionState, SessionStore};

/// A live session: the record, its cancellation token, and its own
/// permission pipeline.
#[derive(Debug)]
pub struct SessionHandle {
    session: RwLock<Session>,
    cancel: CancellationToken,
    pipeline: PermissionPipeline,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.session.read().expect("session lock poisoned").id
    }

    pub fn user(&self) -> String {
        self.session
            .read()
            .expect("session lock poisoned")
            .user
            .clone()
    }

    /// Point-in-time copy of the record, with the effective state (an
    /// Active session past its idle deadline reads as Idle).
    pub fn snapshot(&self) -> Session {
        let mut session = self
            .session
            .read()
            .expect("session lock poisoned")
            .clone();
        session.state = session.effective_state(Utc::now());
        session
    }

    /// Token in-flight actions should select on. Cancelled when the
    /// session closes or expires.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pipeline(&self) -> &PermissionPipeline {
        &self.pipeline
    }
}

pub struct SessionRegistry {
    entries: DashMap<String, Arc<SessionHandle>>,
    by_id: DashMap<Uuid, String>,
    idle_timeout: chrono::Duration,
    store: SessionStore,
    patterns: Arc<PatternSet>,
    audit: Arc<AuditLog>,
    broker: Arc<ConfirmationBroker>,
    approved_root: PathBuf,
    config: GatewayConfig,
}

impl SessionRegistry {
    pub fn new(
        config: GatewayConfig,
        approved_root: PathBuf,
        patterns: Arc<PatternSet>,
        audit: Arc<AuditLog>,
        broker: Arc<ConfirmationBroker>,
    ) -> Self {
        let idle_timeout = chrono::Duration::from_std(config.idle_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let store = SessionStore::new(&config.state_dir);

        Self {
            entries: DashMap::new(),
            by_id: DashMap::new(),
            idle_timeout,
            store,
            patterns,
            audit,
            broker,
            approved_root,
            config,
        }
    }

    /// Return the user's live session, creating one if none exists.
    ///
    /// Atomic per identity: concurrent callers for the same user all
    /// receive the same handle. A session past its idle deadline is
    /// retired here (lazy expiry) and replaced with a fresh one.
    pub fn get_or_create(&self, user: &str) -> Arc<SessionHandle> {
        let now = Utc::now();
        let mut changed = false;

        let handle = match self.entries.entry(user.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stale = occupied
                    .get()
                    .session
                    .read()
                    .expect("session lock poisoned")
                    .is_idle_expired(now);

                if stale {
                    let old = occupied.get().clone();
                    self.retire(&old, SessionState::Expired);
                    self.by_id.remove(&old.id());

                    let fresh = self.new_handle(user);
                    self.by_id.insert(fresh.id(), user.to_string());
                    occupied.insert(fresh.clone());
                    changed = true;
                    fresh
                } else {
                    occupied.get().clone()
                }
            }
            Entry::Vacant(vacant) => {
                let fresh = self.new_handle(user);
                self.by_id.insert(fresh.id(), user.to_string());
                vacant.insert(fresh.clone());
                changed = true;
                fresh
            }
        };

        if changed {
            self.persist();
        }
        handle
    }

    /// Session lookup by user, without creating one.
    pub fn get(&self, user: &str) -> Option<Arc<SessionHandle>> {
        self.entries.get(user).map(|e| e.value().clone())
    }

    /// Reset the session's activity clock.
    pub fn touch(&self, session_id: Uuid) -> Result<(), GatewayError> {
        let user = self
            .by_id
            .get(&session_id)
            .map(|e| e.value().clone())
            .ok_or(GatewayError::SessionNotFound(session_id))?;

        let handle = self
            .entries
            .get(&user)
            .map(|e| e.value().clone())
            .ok_or(GatewayError::SessionNotFound(session_id))?;

        let mut session = handle.session.write().expect("session lock poisoned");
        if session.id != session_id {
            return Err(GatewayError::SessionNotFound(session_id));
        }
        session.touch(self.idle_timeout);
        Ok(())
    }

    /// Close a session, cancelling any in-flight action immediately.
    ///
    /// Unknown ids are an error, never silently ignored.
    pub fn close(&self, session_id: Uuid) -> Result<Session, GatewayError> {
        let Some((_, user)) = self.by_id.remove(&session_id) else {
            return Err(GatewayError::SessionNotFound(session_id));
        };

        let Some((_, handle)) = self
            .entries
            .remove_if(&user, |_, handle| handle.id() == session_id)
        else {
            return Err(GatewayError::SessionNotFound(session_id));
        };

        self.retire(&handle, SessionState::Closed);
        self.persist();

        info!("Closed session {} for {}", session_id, user);
        Ok(handle.session.read().expect("session lock poisoned").clone())
    }

    /// Expire every session past its idle deadline and return the retired
    /// records. Safe to call from a periodic task or opportunistically.
    pub fn sweep_expired(&self) -> Vec<Session> {
        let now = Utc::now();

        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .session
                    .read()
                    .expect("session lock poisoned")
                    .is_idle_expired(now)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut retired = Vec::new();
        for user in candidates {
            let removed = self.entries.remove_if(&user, |_, handle| {
                handle
                    .session
                    .read()
                    .expect("session lock poisoned")
                    .is_idle_expired(now)
            });

            if let Some((_, handle)) = removed {
                self.by_id.remove(&handle.id());
                self.retire(&handle, SessionState::Expired);
                retired.push(handle.session.read().expect("session lock poisoned").clone());
            }
        }

        if !retired.is_empty() {
            debug!("Swept {} expired sessions", retired.len());
            self.persist();
        }
        retired
    }

    /// Re-register sessions persisted by a previous process. Only records
    /// still within their idle deadline come back; each gets a fresh
    /// cancellation token and pipeline.
    pub fn restore(&self, snapshots: Vec<Session>) {
        let now = Utc::now();
        let mut restored = 0;
        for session in snapshots {
            if session.state != SessionState::Active || session.is_idle_expired(now) {
                continue;
            }
            let user = session.user.clone();
            let id = session.id;
            let handle = Arc::new(SessionHandle {
                session: RwLock::new(session),
                cancel: CancellationToken::new(),
                pipeline: self.make_pipeline(),
            });
            self.by_id.insert(id, user.clone());
            self.entries.insert(user, handle);
            restored += 1;
        }
        if restored > 0 {
            info!("Restored {} sessions from snapshot", restored);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn new_handle(&self, user: &str) -> Arc<SessionHandle> {
        Arc::new(SessionHandle {
            session: RwLock::new(Session::new(user, self.idle_timeout)),
            cancel: CancellationToken::new(),
            pipeline: self.make_pipeline(),
        })
    }

    fn make_pipeline(&self) -> PermissionPipeline {
        PermissionPipeline::new(
            self.patterns.clone(),
            self.audit.clone(),
            self.broker.clone(),
            self.approved_root.clone(),
            &self.config.pipeline,
        )
    }

    /// Mark a handle's record with its terminal state and cancel its
    /// in-flight work. Idle-expired sessions pass through Idle on the way
    /// to Expired; no state is revisited afterwards.
    fn retire(&self, handle: &SessionHandle, terminal: SessionState) {
        {
            let mut session = handle.session.write().expect("session lock poisoned");
            if terminal == SessionState::Expired {
                session.state = SessionState::Idle;
            }
            session.state = terminal;
        }
        handle.cancel.cancel();
    }

    fn persist(&self) {
        let sessions: Vec<Session> = self
            .entries
            .iter()
            .map(|entry| {
                entry
                    .value()
                    .session
                    .read()
                    .expect("session lock poisoned")
                    .clone()
            })
            .collect();

        if let Err(e) = self.store.save(&sessions) {
            warn!("Failed to persist session snapshots: {}", e);
        }
    }
}
