//! PIDF document store
//!
//! Write paths are serialized per user: a refresh must observe a consistent
//! answer to "does this entity tag exist". The in-memory implementation gets
//! that from a single write lock over the whole map; readers see complete
//! prior states only.

use super::PresenceRecord;
use crate::domain::shared::clock::Clock;
use crate::domain::shared::value_objects::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Content types this store can parse and serve
pub const SUPPORTED_CONTENT_TYPES: [&str; 2] =
    ["application/pidf+xml", "application/xpidf+xml"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PidfStoreError {
    #[error("content type not supported by this store")]
    UnsupportedContentType,

    #[error("content type not recognized")]
    UnknownContentType,

    #[error("body is not a well-formed presence document: {0}")]
    BadXml(String),

    #[error("no publication with that entity tag")]
    NoSuchEtag,
}

/// A stored document ready to be put in a NOTIFY body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceDocument {
    pub content_type: String,
    pub body: String,
}

/// Presence document store oracle
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PidfStore: Send + Sync {
    /// Store a new publication under a fresh entity tag
    async fn set(
        &self,
        user: &UserId,
        etag: &str,
        expires_at: DateTime<Utc>,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), PidfStoreError>;

    /// Rotate the entity tag of an existing publication and extend its expiry
    async fn refresh(
        &self,
        user: &UserId,
        old_etag: &str,
        new_etag: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), PidfStoreError>;

    /// Whether a live publication exists for `(user, etag)`
    async fn exists(&self, user: &UserId, etag: &str) -> bool;

    /// Drop a publication
    async fn remove(&self, user: &UserId, etag: &str) -> Result<(), PidfStoreError>;

    /// Latest live document for the user, restricted to the accepted types
    ///
    /// An empty accept list means any supported type.
    async fn get_xml(&self, user: &UserId, accept: &[String]) -> Option<PresenceDocument>;

    /// Content types this store accepts, in preference order
    fn supported_types(&self) -> Vec<String>;
}

/// In-memory PIDF store
pub struct InMemoryPidfStore {
    records: RwLock<HashMap<UserId, HashMap<String, PresenceRecord>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryPidfStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn validate_content_type(content_type: &str) -> Result<(), PidfStoreError> {
        if !content_type.contains('/') {
            return Err(PidfStoreError::UnknownContentType);
        }
        let normalized = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim()
            .to_lowercase();
        if SUPPORTED_CONTENT_TYPES.contains(&normalized.as_str()) {
            Ok(())
        } else {
            Err(PidfStoreError::UnsupportedContentType)
        }
    }

    // Structural check only; a full XML parse is the consumer's business
    fn validate_body(body: &[u8]) -> Result<(), PidfStoreError> {
        let text = std::str::from_utf8(body)
            .map_err(|_| PidfStoreError::BadXml("body is not valid UTF-8".to_string()))?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(PidfStoreError::BadXml("empty body".to_string()));
        }
        if !trimmed.starts_with('<') || !trimmed.ends_with('>') {
            return Err(PidfStoreError::BadXml("body is not XML".to_string()));
        }
        if !trimmed.contains("presence") {
            return Err(PidfStoreError::BadXml(
                "missing presence root element".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PidfStore for InMemoryPidfStore {
    async fn set(
        &self,
        user: &UserId,
        etag: &str,
        expires_at: DateTime<Utc>,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), PidfStoreError> {
        Self::validate_content_type(content_type)?;
        Self::validate_body(body)?;

        let mut records = self.records.write().await;
        let now = self.clock.now();
        let per_user = records.entry(user.clone()).or_default();
        per_user.retain(|_, r| !r.is_expired(now));
        per_user.insert(
            etag.to_string(),
            PresenceRecord {
                user: user.clone(),
                etag: etag.to_string(),
                expires_at,
                content_type: content_type.to_string(),
                body: body.to_vec(),
            },
        );
        debug!("Stored publication for {} under etag {}", user, etag);
        Ok(())
    }

    async fn refresh(
        &self,
        user: &UserId,
        old_etag: &str,
        new_etag: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), PidfStoreError> {
        let mut records = self.records.write().await;
        let now = self.clock.now();
        let per_user = records.get_mut(user).ok_or(PidfStoreError::NoSuchEtag)?;
        per_user.retain(|_, r| !r.is_expired(now));

        let mut record = per_user
            .remove(old_etag)
            .ok_or(PidfStoreError::NoSuchEtag)?;
        record.etag = new_etag.to_string();
        record.expires_at = expires_at;
        per_user.insert(new_etag.to_string(), record);
        debug!(
            "Refreshed publication for {}: {} -> {}",
            user, old_etag, new_etag
        );
        Ok(())
    }

    async fn exists(&self, user: &UserId, etag: &str) -> bool {
        let records = self.records.read().await;
        let now = self.clock.now();
        records
            .get(user)
            .and_then(|per_user| per_user.get(etag))
            .map(|r| !r.is_expired(now))
            .unwrap_or(false)
    }

    async fn remove(&self, user: &UserId, etag: &str) -> Result<(), PidfStoreError> {
        let mut records = self.records.write().await;
        let per_user = records.get_mut(user).ok_or(PidfStoreError::NoSuchEtag)?;
        per_user.remove(etag).ok_or(PidfStoreError::NoSuchEtag)?;
        debug!("Removed publication for {} with etag {}", user, etag);
        Ok(())
    }

    async fn get_xml(&self, user: &UserId, accept: &[String]) -> Option<PresenceDocument> {
        let records = self.records.read().await;
        let now = self.clock.now();
        records
            .get(user)?
            .values()
            .filter(|r| !r.is_expired(now))
            .filter(|r| {
                accept.is_empty()
                    || accept
                        .iter()
                        .any(|a| a.eq_ignore_ascii_case(&r.content_type))
            })
            .max_by_key(|r| r.expires_at)
            .and_then(|r| {
                Some(PresenceDocument {
                    content_type: r.content_type.clone(),
                    body: String::from_utf8(r.body.clone()).ok()?,
                })
            })
    }

    fn supported_types(&self) -> Vec<String> {
        SUPPORTED_CONTENT_TYPES
            .iter()
            .map(|t| t.to_string())
            .collect()
    }
}
