//! # Forumguard (abuse control and caching for forum backends)
//!
//! `forumguard` protects the registration, authentication and hot read paths of a
//! forum backend. Everything stateful lives in a shared key-value store; when that
//! store is unreachable each feature degrades on its own terms.
//!
//! ## Failure policy
//!
//! - **Rate limits, quotas, bans:** fail open. A broken backend never locks users out.
//! - **One-time secrets, OAuth state, revocation:** served from a process-local
//!   [`kv::MemoryStore`]. Correct on a single instance, not shared across instances.
//! - **Cache:** any failure is a miss.
//!
//! ## Building blocks
//!
//! - [`token::TokenService`] issues and verifies HS256 bearer tokens.
//! - [`secret::SecretStore`] stores one-time secrets with atomic verify-and-consume.
//! - [`revocation::RevocationRegistry`] remembers logged-out tokens until they expire.
//! - [`guard::AbuseGuard`] implements cooldowns, daily quotas, failure counting and bans.
//! - [`cache::ResponseCache`] is a read-through cache with prefix invalidation.
//! - [`identity::resolve_client_ip`] picks the client address out of proxy headers.

pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod guard;
pub mod identity;
pub mod kv;
pub mod revocation;
pub mod secret;
pub mod tasks;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
