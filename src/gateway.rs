//! Gateway facade wiring the inbound control flow.
//!
//! Every inbound message passes `authenticate → check_and_consume →
//! get_or_create`; each downstream action the agent proposes then goes
//! through the session's own permission pipeline. Construction is the
//! single fatal point: a rule set or store that fails to load means the
//! process must not serve requests at all.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::security::audit::AuditLog;
use crate::security::auth::{AuthGate, ensure_salt_key, read_salt_key};
use crate::security::patterns::PatternSet;
use crate::security::pipeline::{ConfirmationBroker, ConfirmationRequest};
use crate::security::rate_limiter::RateLimiter;
use crate::session::{SessionHandle, SessionRegistry, SessionStore};

pub struct Gateway {
    audit: Arc<AuditLog>,
    patterns: Arc<PatternSet>,
    auth: AuthGate,
    rate: RateLimiter,
    registry: SessionRegistry,
    broker: Arc<ConfirmationBroker>,
}

impl Gateway {
    /// Build the gateway from validated configuration.
    ///
    /// Returns the gateway and the confirmation-request receiver, which
    /// the transport collaborator owns. Any failure here — invalid
    /// config, unloadable rule set, unreachable state directory — is
    /// fatal to startup.
    pub fn new(config: GatewayConfig) -> Result<(Self, mpsc::UnboundedReceiver<ConfirmationRequest>)> {
        config.validate()?;

        let state_dir = expand_path(&config.state_dir);
        fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state dir {}", state_dir.display()))?;
        let approved_root = expand_path(&config.approved_root_path);
        fs::create_dir_all(&approved_root).with_context(|| {
            format!("Failed to create approved root {}", approved_root.display())
        })?;

        ensure_salt_key(&state_dir)?;
        let salt_key = read_salt_key(&state_dir)?;

        let audit = Arc::new(AuditLog::open(state_dir.join("coderelay.audit.jsonl"))?);
        let patterns = Arc::new(PatternSet::builtin(&config.patterns.set_version)?);
        let auth = AuthGate::new(&config.auth, salt_key, audit.clone())?;
        let rate = RateLimiter::new(&config.rate, audit.clone());
        let (broker, requests) = ConfirmationBroker::new();

        let mut resolved_config = config;
        resolved_config.state_dir = state_dir.clone();
        resolved_config.approved_root_path = approved_root.clone();

        let registry = SessionRegistry::new(
            resolved_config,
            approved_root,
            patterns.clone(),
            audit.clone(),
            broker.clone(),
        );
        registry.restore(SessionStore::new(&state_dir).load()?);

        info!(
            "Gateway up: {} dangerous patterns (set {}), audit at {}",
            patterns.len(),
            patterns.version(),
            audit.path().display()
        );

        Ok((
            Self {
                audit,
                patterns,
                auth,
                rate,
                registry,
                broker,
            },
            requests,
        ))
    }

    /// Admit one inbound message: authenticate, charge the rate bucket,
    /// and return the user's session.
    ///
    /// `cost` is supplied by the backend integration (e.g. estimated
    /// token cost). Errors are terminal for this request and already
    /// audited.
    pub fn handle_inbound(
        &self,
        identity: &str,
        credential: Option<&str>,
        cost: f64,
    ) -> Result<Arc<SessionHandle>, GatewayError> {
        self.auth.authenticate(identity, credential)?;
        self.rate.check_and_consume(identity, cost)?;

        let handle = self.registry.get_or_create(identity);
        if let Err(e) = self.registry.touch(handle.id()) {
            // The session can only vanish in a close/sweep race; the
            // caller still holds a valid handle for this request.
            warn!("Could not touch session {}: {}", handle.id(), e);
        }
        Ok(handle)
    }

    /// Deliver a user's confirmation reply, correlated by request id.
    /// Returns `false` when the request already resolved or timed out.
    pub fn resolve_confirmation(&self, request_id: Uuid, approved: bool) -> bool {
        self.broker.resolve(request_id, approved)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::audit::AuditKind;
    use crate::security::pipeline::{ActionDescriptor, ActionKind, Verdict};

    fn test_config(dir: &Path) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.state_dir = dir.join("state");
        config.approved_root_path = dir.join("root");
        config.auth.whitelist = vec!["42".to_string()];
        config
    }

    #[test]
    fn construction_wires_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let (gateway, _requests) = Gateway::new(test_config(tmp.path())).unwrap();

        assert!(!gateway.patterns().is_empty());
        assert!(gateway.registry().is_empty());
    }

    #[test]
    fn invalid_config_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.rate.refill_rate = 0.0;
        assert!(Gateway::new(config).is_err());
    }

    #[test]
    fn inbound_flow_authenticates_charges_and_creates() {
        let tmp = tempfile::tempdir().unwrap();
        let (gateway, _requests) = Gateway::new(test_config(tmp.path())).unwrap();

        let handle = gateway.handle_inbound("42", None, 1.0).unwrap();
        assert_eq!(handle.user(), "42");
        assert_eq!(gateway.rate_limiter().cumulative_cost("42"), Some(1.0));

        // Same identity keeps the same session
        let again = gateway.handle_inbound("42", None, 1.0).unwrap();
        assert_eq!(again.id(), handle.id());

        let events = gateway.audit().read_events().unwrap();
        assert!(events.iter().any(|e| e.kind == AuditKind::AuthSuccess));
    }

    #[test]
    fn unknown_identity_is_rejected_and_audited() {
        let tmp = tempfile::tempdir().unwrap();
        let (gateway, _requests) = Gateway::new(test_config(tmp.path())).unwrap();

        let err = gateway.handle_inbound("999", None, 1.0).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCredential));

        let events = gateway.audit().read_events().unwrap();
        assert!(events.iter().any(|e| e.kind == AuditKind::AuthFailure));
    }

    #[test]
    fn rate_limit_applies_after_auth() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.rate.bucket_capacity = 2.0;
        config.rate.refill_rate = 0.001;
        let (gateway, _requests) = Gateway::new(config).unwrap();

        gateway.handle_inbound("42", None, 1.0).unwrap();
        gateway.handle_inbound("42", None, 1.0).unwrap();

        match gateway.handle_inbound("42", None, 1.0) {
            Err(GatewayError::RateLimited {
                retry_after: Some(_),
            }) => {}
            other => panic!("expected RateLimited, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn confirmation_replies_route_through_gateway() {
        let tmp = tempfile::tempdir().unwrap();
        let (gateway, mut requests) = Gateway::new(test_config(tmp.path())).unwrap();

        let handle = gateway.handle_inbound("42", None, 1.0).unwrap();
        let decision = handle.pipeline().evaluate(&ActionDescriptor {
            user: "42".to_string(),
            kind: ActionKind::ShellCommand,
            target: "git reset --hard".to_string(),
        });

        let Verdict::RequireConfirmation { request_id } = decision.verdict else {
            panic!("expected confirmation");
        };

        let request = requests.recv().await.unwrap();
        assert_eq!(request.request_id, request_id);

        assert!(gateway.resolve_confirmation(request_id, true));
        let final_decision = handle.pipeline().await_decision(request_id).await;
        assert_eq!(final_decision.verdict, Verdict::Allow);
    }

    #[test]
    fn sessions_resume_across_gateway_restarts() {
        let tmp = tempfile::tempdir().unwrap();

        let (first, _rx) = Gateway::new(test_config(tmp.path())).unwrap();
        let id = first.handle_inbound("42", None, 1.0).unwrap().id();
        drop(first);

        let (second, _rx) = Gateway::new(test_config(tmp.path())).unwrap();
        let resumed = second.handle_inbound("42", None, 1.0).unwrap();
        assert_eq!(resumed.id(), id);
    }
}
