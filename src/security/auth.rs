//! Identity authentication: whitelist and hashed-token flows.
//!
//! Tokens are never stored in the clear. A gateway-local 32-byte salt key
//! (generated on first run, 0600 on Unix, kept in the state directory
//! outside the approved root) keys an HMAC-SHA256 over the raw token;
//! only the hex digest is kept in configuration.
//!
//! Failure responses are deliberately uniform: unknown identity, wrong
//! token, and expired token all surface as `InvalidCredential`, and an
//! unknown identity still pays for a digest comparison so timing does not
//! differ. The audit log records the real cause for operators.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngExt;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::{AuthConfig, TokenCredential};
use crate::error::GatewayError;
use crate::security::audit::{AuditKind, AuditLog};

type HmacSha256 = Hmac<Sha256>;

const SALT_KEY_FILENAME: &str = "coderelay.salt.key";
const SALT_KEY_LEN: usize = 32;

/// Digest compared against when an identity has no stored token, so the
/// unknown-identity path performs the same work as the known one.
const DUMMY_DIGEST: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Authenticates inbound identities against the whitelist and token table.
#[derive(Debug)]
pub struct AuthGate {
    whitelist: HashSet<String>,
    tokens: HashMap<String, TokenCredential>,
    salt_key: [u8; SALT_KEY_LEN],
    audit: Arc<AuditLog>,
}

impl AuthGate {
    /// Build the gate from validated configuration.
    ///
    /// An identity present in both the whitelist and the token table is a
    /// configuration error (the flows would disagree on whether a
    /// credential is required), rejected here as well as in
    /// `GatewayConfig::validate`.
    pub fn new(config: &AuthConfig, salt_key: [u8; SALT_KEY_LEN], audit: Arc<AuditLog>) -> Result<Self> {
        let whitelist: HashSet<String> = config.whitelist.iter().cloned().collect();
        let mut tokens = HashMap::new();

        for credential in &config.tokens {
            if whitelist.contains(&credential.identity) {
                anyhow::bail!(
                    "identity {} appears in both the whitelist and the token table",
                    credential.identity
                );
            }
            tokens.insert(credential.identity.clone(), credential.clone());
        }

        debug!(
            "AuthGate loaded: {} whitelisted, {} token identities",
            whitelist.len(),
            tokens.len()
        );

        Ok(Self {
            whitelist,
            tokens,
            salt_key,
            audit,
        })
    }

    /// Authenticate an inbound identity.
    ///
    /// Whitelisted identities need no credential. Token identities must
    /// present the raw token, which is hashed and compared in constant
    /// time against the stored digest. Both outcomes are audited.
    pub fn authenticate(
        &self,
        identity: &str,
        credential: Option<&str>,
    ) -> Result<(), GatewayError> {
        if identity.is_empty() {
            self.audit_failure(identity, "empty identity");
            return Err(GatewayError::InvalidCredential);
        }

        if self.whitelist.contains(identity) {
            self.audit_success(identity, "whitelist");
            return Ok(());
        }

        let Some(raw_token) = credential else {
            // Burn a comparison anyway before rejecting.
            let _ = constant_time_eq(DUMMY_DIGEST, DUMMY_DIGEST);
            self.audit_failure(identity, "no credential presented");
            return Err(GatewayError::InvalidCredential);
        };

        let presented = self.token_hmac(raw_token);

        match self.tokens.get(identity) {
            Some(stored) => {
                if !constant_time_eq(&presented, &stored.token_hmac) {
                    self.audit_failure(identity, "token digest mismatch");
                    return Err(GatewayError::InvalidCredential);
                }
                if let Some(expires_at) = stored.expires_at
                    && expires_at <= Utc::now()
                {
                    self.audit_failure(identity, "token expired");
                    return Err(GatewayError::InvalidCredential);
                }
                self.audit_success(identity, "token");
                Ok(())
            }
            None => {
                let _ = constant_time_eq(&presented, DUMMY_DIGEST);
                self.audit_failure(identity, "unknown identity");
                Err(GatewayError::InvalidCredential)
            }
        }
    }

    /// Inspect a stored credential's validity without authenticating.
    ///
    /// For operator tooling that already holds a proven identity, so an
    /// expired token is reported as such — unlike `authenticate`, which
    /// keeps failure causes uniform.
    pub fn credential_state(&self, identity: &str) -> Result<(), GatewayError> {
        if self.whitelist.contains(identity) {
            return Ok(());
        }
        match self.tokens.get(identity) {
            Some(stored) => {
                if let Some(expires_at) = stored.expires_at
                    && expires_at <= Utc::now()
                {
                    Err(GatewayError::Expired)
                } else {
                    Ok(())
                }
            }
            None => Err(GatewayError::InvalidCredential),
        }
    }

    /// Compute the hex HMAC-SHA256 digest of a raw token under the salt
    /// key. Used both for verification and for provisioning new entries.
    pub fn token_hmac(&self, raw_token: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.salt_key)
            .expect("HMAC accepts any key length");
        mac.update(raw_token.as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }

    fn audit_success(&self, identity: &str, method: &str) {
        if let Err(e) = self
            .audit
            .append(identity, AuditKind::AuthSuccess, method)
        {
            warn!("Failed to audit auth success: {}", e);
        }
    }

    fn audit_failure(&self, identity: &str, cause: &str) {
        if let Err(e) = self.audit.append(identity, AuditKind::AuthFailure, cause) {
            warn!("Failed to audit auth failure: {}", e);
        }
    }
}

/// Ensure a salt key exists in the state directory.
///
/// Generates 32 random bytes from the OS CSPRNG on first run and writes
/// them with 0600 permissions (Unix). A no-op if the key already exists.
pub fn ensure_salt_key(state_dir: &Path) -> Result<()> {
    let key_path = state_dir.join(SALT_KEY_FILENAME);
    if key_path.exists() {
        return Ok(());
    }

    let mut key = [0u8; SALT_KEY_LEN];
    rand::rng().fill(&mut key);

    fs::write(&key_path, key).context("Failed to write salt key")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set salt key permissions")?;
    }

    tracing::info!("Generated salt key at {}", key_path.display());
    Ok(())
}

/// Read the salt key from the state directory.
pub fn read_salt_key(state_dir: &Path) -> Result<[u8; SALT_KEY_LEN]> {
    let key_path = state_dir.join(SALT_KEY_FILENAME);
    let bytes = fs::read(&key_path).context("Failed to read salt key")?;

    if bytes.len() != SALT_KEY_LEN {
        anyhow::bail!(
            "Salt key has unexpected length {} (expected {})",
            bytes.len(),
            SALT_KEY_LEN
        );
    }

    let mut key = [0u8; SALT_KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Generate a fresh access token for provisioning (32 random bytes, hex).
///
/// The caller hashes it with [`AuthGate::token_hmac`] and stores only the
/// digest; the raw token is handed to the user once.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex_encode(&bytes)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    // Digests are fixed-length hex, so comparing lengths leaks nothing.
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Hex-encode a byte slice.
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
