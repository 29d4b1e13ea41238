//! coderelay — security gateway and session core for a remote coding
//! agent exposed through a chat interface.
//!
//! Untrusted end users reach an LLM-driven coding agent through chat;
//! every inbound message can trigger file access, shell-adjacent tool
//! calls, and paid backend inference. This crate gates all of it:
//!
//! - Authentication and session issuance (whitelist or hashed tokens)
//! - Token-bucket rate limiting with a hard per-user spend cap
//! - Dangerous-pattern validation of commands, paths, and URLs
//! - A pre-execution permission pipeline with allow/deny/confirm outcomes
//! - An append-only, hash-chained audit log
//! - A per-user session registry with idle expiry and cooperative
//!   cancellation
//!
//! The chat transport and the model backend are collaborators, not part
//! of this crate: they call [`Gateway::handle_inbound`] per message and
//! the session pipeline's `evaluate` per proposed action.

pub mod config;
pub mod error;
pub mod gateway;
pub mod security;
pub mod session;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::Gateway;

/// Install the process-wide tracing subscriber (env-filtered, compact).
///
/// Call once from the embedding binary; repeated calls are ignored so
/// tests and hosts that already installed one keep theirs.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
