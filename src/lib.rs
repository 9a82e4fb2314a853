//! Yodel - SIP proxy authentication and admission-control core
//!
//! A cluster-friendly SIP proxy core: stateless digest challenges keyed
//! off a shared secret, an admission policy machine over pluggable user
//! database oracles, a request routing decision engine, and the presence
//! event package (PUBLISH/NOTIFY) on the same authentication substrate.
//!
//! Message parsing, DNS and the full forwarding engine are collaborators
//! behind interfaces, not part of this crate's job.

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
