//! Gateway error taxonomy.
//!
//! Every variant that reaches an end user carries a specific, actionable
//! message — which rule fired, or which limit was hit and when it resets.
//! The one deliberate exception is authentication: the public surface
//! never distinguishes "unknown identity" from "wrong token".

use std::time::Duration;

use thiserror::Error;

use crate::security::patterns::Category;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Unknown identity, wrong token, or expired token — deliberately
    /// indistinguishable to the caller. The audit log records the cause.
    #[error("authentication failed: invalid credential")]
    InvalidCredential,

    /// A stored credential is past its expiry. Surfaced only through
    /// credential inspection paths, never from `authenticate`.
    #[error("credential expired; request a new access token")]
    Expired,

    /// Token bucket exhausted or the per-user spend cap was reached.
    /// `retry_after` is `None` for the spend cap, which only an external
    /// reset clears.
    #[error("{}", rate_limited_message(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// A dangerous-pattern rule matched the request text.
    #[error("request blocked by security rule `{pattern}` ({category})")]
    Validation { category: Category, pattern: String },

    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("no session with id {0}")]
    SessionNotFound(uuid::Uuid),

    /// A pending confirmation expired without a reply. Fail closed: the
    /// gated action was rejected.
    #[error("confirmation request timed out; the action was not executed")]
    ConfirmationTimeout,
}

/// A validation violation always escalates to an error, never silently
/// downgraded.
impl From<crate::security::patterns::Violation> for GatewayError {
    fn from(violation: crate::security::patterns::Violation) -> Self {
        GatewayError::Validation {
            category: violation.category,
            pattern: violation.pattern,
        }
    }
}

fn rate_limited_message(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!("rate limited; retry in {:.1}s", d.as_secs_f64()),
        None => "usage limit reached for this account; ask the operator to reset it".to_string(),
    }
}
