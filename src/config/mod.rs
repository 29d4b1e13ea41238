//! Gateway configuration.
//!
//! All components receive their configuration as explicitly constructed
//! values at construction time — nothing reads ambient global state. The
//! recognized options map 1:1 onto the deployment's TOML file:
//!
//! ```toml
//! approved_root_path = "~/projects"
//! state_dir = "~/.coderelay"
//!
//! [auth]
//! whitelist = ["493817265"]
//!
//! [[auth.tokens]]
//! identity = "91442210"
//! token_hmac = "ab12..."
//!
//! [rate]
//! bucket_capacity = 20.0
//! refill_rate = 0.5
//! per_user_cost_limit = 500.0
//!
//! [session]
//! idle_timeout_secs = 1800
//!
//! [pipeline]
//! confirmation_timeout_secs = 60
//! require_approval = ["file_write"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Root directory the agent is allowed to touch. Every path the agent
    /// proposes is resolved and checked for containment under this root.
    #[serde(default = "default_approved_root")]
    pub approved_root_path: PathBuf,

    /// State directory holding the salt key, audit log, and session
    /// snapshots. Kept outside the approved root so the agent's own file
    /// operations can never reach it.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate: RateConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub patterns: PatternConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Identities accepted without a credential.
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Token-authenticated identities. Tokens are stored as salted
    /// HMAC-SHA256 digests, never in the clear.
    #[serde(default)]
    pub tokens: Vec<TokenCredential>,
}

/// A stored token credential. `token_hmac` is the hex HMAC-SHA256 of the
/// raw token under the gateway's salt key (see `security::auth`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCredential {
    pub identity: String,
    pub token_hmac: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Maximum instantaneous burst, in request-cost units.
    #[serde(default = "default_bucket_capacity")]
    pub bucket_capacity: f64,

    /// Tokens restored per second.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// Hard per-user spend cap. Once cumulative cost reaches this, every
    /// request is rejected until an external reset.
    #[serde(default = "default_cost_limit")]
    pub per_user_cost_limit: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: default_bucket_capacity(),
            refill_rate: default_refill_rate(),
            per_user_cost_limit: default_cost_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds of inactivity before a session expires.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Seconds a pending confirmation may wait for a reply before it is
    /// rejected.
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_secs: u64,

    /// Action kinds that require user approval before execution,
    /// e.g. ["file_write", "shell_command"].
    #[serde(default = "default_require_approval")]
    pub require_approval: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: default_confirmation_timeout(),
            require_approval: default_require_approval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Version tag of the dangerous-pattern set. Recorded in traces so
    /// audit reviews can tell which rule set was live.
    #[serde(default = "default_pattern_set_version")]
    pub set_version: String,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            set_version: default_pattern_set_version(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            approved_root_path: default_approved_root(),
            state_dir: default_state_dir(),
            auth: AuthConfig::default(),
            rate: RateConfig::default(),
            session: SessionConfig::default(),
            pipeline: PipelineConfig::default(),
            patterns: PatternConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: GatewayConfig =
            toml::from_str(&content).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that cannot be expressed in serde defaults.
    ///
    /// An identity listed both in the whitelist and the token table is a
    /// configuration error: the two flows would disagree on whether a
    /// credential is required, so the conflict is rejected at load time.
    pub fn validate(&self) -> Result<()> {
        if self.rate.bucket_capacity <= 0.0 {
            anyhow::bail!("rate.bucket_capacity must be positive");
        }
        if self.rate.refill_rate <= 0.0 {
            anyhow::bail!("rate.refill_rate must be positive");
        }
        if self.rate.per_user_cost_limit <= 0.0 {
            anyhow::bail!("rate.per_user_cost_limit must be positive");
        }

        for token in &self.auth.tokens {
            if self.auth.whitelist.contains(&token.identity) {
                anyhow::bail!(
                    "identity {} appears in both the whitelist and the token table",
                    token.identity
                );
            }
        }

        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.confirmation_timeout_secs)
    }
}

fn default_approved_root() -> PathBuf {
    PathBuf::from("~/coderelay-workspace")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("~/.coderelay")
}

fn default_bucket_capacity() -> f64 {
    20.0
}

fn default_refill_rate() -> f64 {
    0.5
}

fn default_cost_limit() -> f64 {
    500.0
}

fn default_idle_timeout() -> u64 {
    1800
}

fn default_confirmation_timeout() -> u64 {
    60
}

fn default_require_approval() -> Vec<String> {
    vec!["file_write".to_string()]
}

fn default_pattern_set_version() -> String {
    "1".to_string()
}
