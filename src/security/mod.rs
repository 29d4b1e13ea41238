//! # Security core
//!
//! Everything between an authenticated identity and an executed action
//! lives here. The modules layer as follows, leaves first:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     gateway.rs (facade)                         │
//! │        authenticate → check_and_consume → get_or_create        │
//! ├──────────────┬──────────────┬──────────────┬───────────────────┤
//! │  auth.rs     │ rate_limiter │ pipeline.rs  │ patterns.rs       │
//! │  Whitelist + │ Token bucket │ Pre-exec     │ Compiled rule     │
//! │  HMAC tokens │ + spend cap  │ hooks +      │ set + path        │
//! │              │              │ confirmation │ containment       │
//! ├──────────────┴──────────────┴──────────────┴───────────────────┤
//! │  audit.rs — append-only, hash-chained JSONL decision log       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Model
//!
//! 1. **Fail closed**: ambiguous paths, unanswered confirmations, and
//!    unresolvable roots all deny. The gateway refuses to start with an
//!    unloaded rule set.
//!
//! 2. **No enumeration**: authentication failures are uniform to the
//!    caller; the audit log keeps the real causes for operators.
//!
//! 3. **Per-user isolation**: rate buckets and sessions live in
//!    per-entry-locked maps. One user's burst, confirmation wait, or
//!    cancellation never blocks another user.
//!
//! 4. **Everything audited**: every deny, rate limit, confirmation
//!    outcome, and file access appends one chained, tamper-evident
//!    audit event, in per-user causal order.

pub mod audit;
pub mod auth;
pub mod patterns;
pub mod pipeline;
pub mod rate_limiter;
