//! Pre-execution permission pipeline.
//!
//! Every tool, file, or shell-adjacent action the agent proposes passes
//! through [`PermissionPipeline::evaluate`] immediately before execution.
//! An evaluated action moves through a small state machine:
//!
//! ```text
//! Proposed ──► Allowed
//!          ──► Denied
//!          ──► PendingConfirmation ──► Confirmed ──► Allowed
//!                                  ──► Rejected  ──► Denied
//! ```
//!
//! Deny rules are never downgraded to confirmation. A pending
//! confirmation that receives no reply within the configured timeout
//! resolves to Rejected — never to Allowed.
//!
//! Confirmation is plain message passing: the pipeline publishes a
//! [`ConfirmationRequest`] on a channel consumed by the transport layer
//! and resumes only when [`ConfirmationBroker::resolve`] is called with
//! the matching request id. No transport types leak into this module.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::security::audit::{AuditKind, AuditLog};
use crate::security::patterns::{
    PatternAction, PatternSet, Surface, Validation, Violation, resolve_in_root,
};

/// What kind of action the agent wants to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    ShellCommand,
    FileWrite,
    FileRead,
    NetworkFetch,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::ShellCommand => "shell_command",
            ActionKind::FileWrite => "file_write",
            ActionKind::FileRead => "file_read",
            ActionKind::NetworkFetch => "network_fetch",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed action, described by the model-integration layer.
#[derive(Debug, Clone)]
pub struct ActionDescriptor {
    pub user: String,
    pub kind: ActionKind,
    /// Command text, file path, or URL — whatever the kind implies.
    pub target: String,
}

/// Final or intermediate outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    RequireConfirmation { request_id: Uuid },
}

/// Result of one pipeline evaluation. Ephemeral: produced and consumed
/// per request, persisted only through the audit trail.
#[derive(Debug, Clone)]
pub struct PermissionDecision {
    pub verdict: Verdict,
    pub reason: String,
    pub matched_pattern: Option<String>,
}

impl PermissionDecision {
    fn allow(reason: &str) -> Self {
        Self {
            verdict: Verdict::Allow,
            reason: reason.to_string(),
            matched_pattern: None,
        }
    }

    fn deny(reason: String, matched_pattern: Option<String>) -> Self {
        Self {
            verdict: Verdict::Deny,
            reason,
            matched_pattern,
        }
    }

    /// Collapse to a result for callers that treat anything but `Allow`
    /// as terminal. `RequireConfirmation` maps to `PermissionDenied`
    /// here: an action must not execute before its confirmation resolves.
    pub fn into_result(self) -> Result<(), crate::error::GatewayError> {
        match self.verdict {
            Verdict::Allow => Ok(()),
            _ => Err(crate::error::GatewayError::PermissionDenied {
                reason: self.reason,
            }),
        }
    }
}

/// A confirmation request surfaced to the transport collaborator.
#[derive(Debug)]
pub struct ConfirmationRequest {
    pub request_id: Uuid,
    pub user: String,
    pub action: ActionDescriptor,
    pub reason: String,
}

/// Correlates confirmation requests with their replies.
///
/// One broker serves the whole gateway; the transport layer consumes the
/// request receiver and calls [`resolve`](Self::resolve) when the user
/// answers.
#[derive(Debug)]
pub struct ConfirmationBroker {
    tx: mpsc::UnboundedSender<ConfirmationRequest>,
    pending: DashMap<Uuid, oneshot::Sender<bool>>,
}

impl ConfirmationBroker {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ConfirmationRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                pending: DashMap::new(),
            }),
            rx,
        )
    }

    /// Register a pending request and publish it. Returns the receiver
    /// the evaluating task will wait on.
    fn begin(&self, request: ConfirmationRequest) -> oneshot::Receiver<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request_id = request.request_id;
        self.pending.insert(request_id, reply_tx);

        // If the transport side is gone the request is never answered and
        // the timeout rejects it. Fail closed either way.
        if self.tx.send(request).is_err() {
            warn!(
                "No confirmation consumer; request {} will time out",
                request_id
            );
        }

        reply_rx
    }

    /// Deliver the user's reply. Returns `false` when the request is
    /// unknown — already resolved, timed out, or never issued.
    pub fn resolve(&self, request_id: Uuid, approved: bool) -> bool {
        match self.pending.remove(&request_id) {
            Some((_, sender)) => sender.send(approved).is_ok(),
            None => {
                debug!("Reply for unknown confirmation request {}", request_id);
                false
            }
        }
    }

    fn abandon(&self, request_id: Uuid) {
        self.pending.remove(&request_id);
    }
}

#[derive(Debug)]
struct PendingConfirmation {
    reply_rx: oneshot::Receiver<bool>,
    action: ActionDescriptor,
}

/// Per-session permission pipeline.
///
/// Shares the pattern set, audit log, and broker with the rest of the
/// gateway; the approved-write set is this session's own state.
#[derive(Debug)]
pub struct PermissionPipeline {
    patterns: Arc<PatternSet>,
    audit: Arc<AuditLog>,
    broker: Arc<ConfirmationBroker>,
    approved_root: PathBuf,
    require_approval: HashSet<String>,
    confirmation_timeout: Duration,
    waiting: DashMap<Uuid, PendingConfirmation>,
    approved_writes: Mutex<HashSet<PathBuf>>,
}

impl PermissionPipeline {
    pub fn new(
        patterns: Arc<PatternSet>,
        audit: Arc<AuditLog>,
        broker: Arc<ConfirmationBroker>,
        approved_root: PathBuf,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            patterns,
            audit,
            broker,
            approved_root,
            require_approval: config.require_approval.iter().cloned().collect(),
            confirmation_timeout: Duration::from_secs(config.confirmation_timeout_secs),
            waiting: DashMap::new(),
            approved_writes: Mutex::new(HashSet::new()),
        }
    }

    /// Evaluate a proposed action.
    ///
    /// The caller must not execute the action on any verdict other than
    /// `Allow` (directly, or returned from [`await_decision`](Self::await_decision)
    /// after a confirmation).
    pub fn evaluate(&self, action: &ActionDescriptor) -> PermissionDecision {
        match action.kind {
            ActionKind::ShellCommand => self.evaluate_command(action),
            ActionKind::NetworkFetch => self.evaluate_fetch(action),
            ActionKind::FileWrite => self.evaluate_write(action),
            ActionKind::FileRead => self.evaluate_read(action),
        }
    }

    fn evaluate_command(&self, action: &ActionDescriptor) -> PermissionDecision {
        match self.patterns.validate(&action.target) {
            Validation::Violation(v) if v.action == PatternAction::Deny => {
                self.deny_validation(action, &v)
            }
            Validation::Violation(v) => self.request_confirmation(
                action,
                format!("{} requires confirmation", v.description),
                Some(v.pattern.clone()),
                AuditKind::ValidationBlocked,
            ),
            Validation::Clean => {
                if self.patterns.is_safe_command(&action.target) {
                    return PermissionDecision::allow("read-only command");
                }
                if self.require_approval.contains(ActionKind::ShellCommand.as_str()) {
                    return self.request_confirmation(
                        action,
                        "shell commands require approval".to_string(),
                        None,
                        AuditKind::ValidationBlocked,
                    );
                }
                PermissionDecision::allow("no rule matched")
            }
        }
    }

    fn evaluate_fetch(&self, action: &ActionDescriptor) -> PermissionDecision {
        match self.patterns.validate_scoped(&action.target, Surface::Url) {
            Validation::Violation(v) if v.action == PatternAction::Deny => {
                self.deny_validation(action, &v)
            }
            Validation::Violation(v) => self.request_confirmation(
                action,
                format!("{} requires confirmation", v.description),
                Some(v.pattern.clone()),
                AuditKind::ValidationBlocked,
            ),
            Validation::Clean => PermissionDecision::allow("no rule matched"),
        }
    }

    fn evaluate_write(&self, action: &ActionDescriptor) -> PermissionDecision {
        match self.patterns.validate_path(&action.target, &self.approved_root) {
            Validation::Violation(v) => self.deny_validation(action, &v),
            Validation::Clean => {
                let resolved = match resolve_in_root(&action.target, &self.approved_root) {
                    Some(p) => p,
                    None => {
                        return self.deny_validation(
                            action,
                            &containment_failure(),
                        );
                    }
                };

                let already_approved = self
                    .approved_writes
                    .lock()
                    .expect("approved-writes lock poisoned")
                    .contains(&resolved);

                if already_approved {
                    self.audit_event(action, AuditKind::FileAccess, "write (previously approved)");
                    return PermissionDecision::allow("previously approved write target");
                }

                if self.require_approval.contains(ActionKind::FileWrite.as_str()) {
                    return self.request_confirmation(
                        action,
                        format!("first write to {}", resolved.display()),
                        None,
                        AuditKind::FileAccess,
                    );
                }

                self.audit_event(action, AuditKind::FileAccess, "write");
                PermissionDecision::allow("write inside approved root")
            }
        }
    }

    fn evaluate_read(&self, action: &ActionDescriptor) -> PermissionDecision {
        match self.patterns.validate_path(&action.target, &self.approved_root) {
            Validation::Violation(v) => self.deny_validation(action, &v),
            Validation::Clean => {
                self.audit_event(action, AuditKind::FileAccess, "read");
                PermissionDecision::allow("read inside approved root")
            }
        }
    }

    /// Wait for the user's reply to a pending confirmation.
    ///
    /// Resolves to an `Allow` decision only on an explicit approval. A
    /// rejection, a missing reply within the timeout, or an unknown
    /// request id all resolve to `Deny`.
    pub async fn await_decision(&self, request_id: Uuid) -> PermissionDecision {
        let Some((_, pending)) = self.waiting.remove(&request_id) else {
            return PermissionDecision::deny(
                "unknown or already-resolved confirmation request".to_string(),
                None,
            );
        };

        let action = pending.action;
        match tokio::time::timeout(self.confirmation_timeout, pending.reply_rx).await {
            Ok(Ok(true)) => {
                if action.kind == ActionKind::FileWrite
                    && let Some(resolved) = resolve_in_root(&action.target, &self.approved_root)
                {
                    self.approved_writes
                        .lock()
                        .expect("approved-writes lock poisoned")
                        .insert(resolved);
                }
                self.audit_event(&action, AuditKind::PermissionConfirmed, "approved by user");
                PermissionDecision::allow("approved by user")
            }
            Ok(Ok(false)) => {
                self.audit_event(&action, AuditKind::PermissionDenied, "rejected by user");
                PermissionDecision::deny("rejected by user".to_string(), None)
            }
            Ok(Err(_)) | Err(_) => {
                self.broker.abandon(request_id);
                self.audit_event(
                    &action,
                    AuditKind::PermissionDenied,
                    "confirmation timed out, action rejected",
                );
                PermissionDecision::deny(
                    format!(
                        "{} (no reply within {}s)",
                        crate::error::GatewayError::ConfirmationTimeout,
                        self.confirmation_timeout.as_secs()
                    ),
                    None,
                )
            }
        }
    }

    /// Number of confirmations currently awaiting a reply.
    pub fn pending_confirmations(&self) -> usize {
        self.waiting.len()
    }

    fn deny_validation(&self, action: &ActionDescriptor, violation: &Violation) -> PermissionDecision {
        self.audit_event(
            action,
            AuditKind::ValidationBlocked,
            &format!("{} (rule: {})", violation.description, violation.pattern),
        );
        PermissionDecision::deny(
            format!(
                "{}. This operation is not allowed for security reasons.",
                violation.description
            ),
            Some(violation.pattern.clone()),
        )
    }

    fn request_confirmation(
        &self,
        action: &ActionDescriptor,
        reason: String,
        matched_pattern: Option<String>,
        audit_kind: AuditKind,
    ) -> PermissionDecision {
        let request_id = Uuid::new_v4();
        let reply_rx = self.broker.begin(ConfirmationRequest {
            request_id,
            user: action.user.clone(),
            action: action.clone(),
            reason: reason.clone(),
        });
        self.waiting.insert(
            request_id,
            PendingConfirmation {
                reply_rx,
                action: action.clone(),
            },
        );

        self.audit_event(
            action,
            audit_kind,
            &format!("awaiting confirmation: {}", reason),
        );

        PermissionDecision {
            verdict: Verdict::RequireConfirmation { request_id },
            reason,
            matched_pattern,
        }
    }

    fn audit_event(&self, action: &ActionDescriptor, kind: AuditKind, detail: &str) {
        if let Err(e) = self.audit.append(
            &action.user,
            kind,
            format!("{} `{}`: {}", action.kind, truncate(&action.target, 80), detail),
        ) {
            warn!("Failed to audit permission decision: {}", e);
        }
    }
}

fn containment_failure() -> Violation {
    Violation {
        pattern: "path-containment".to_string(),
        category: crate::security::patterns::Category::PathTraversal,
        description: "resolved path escapes the approved root".to_string(),
        action: PatternAction::Deny,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
