//! Location service - contact bindings per canonical user
//!
//! The admission controller decides who may bind what; this store only
//! keeps the bindings, clamps expiry intervals and garbage-collects
//! expired entries on read.

use crate::domain::shared::clock::Clock;
use crate::domain::shared::value_objects::UserId;
use crate::domain::user::directory::address_key_str;
use chrono::{DateTime, Duration, Utc};
use rsip::Uri;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Registration binding
#[derive(Debug, Clone)]
pub struct Binding {
    /// Contact URI
    pub contact: String,
    /// Expiration time
    pub expires_at: DateTime<Utc>,
}

impl Binding {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// In-memory location store
pub struct Registrar {
    bindings: RwLock<HashMap<UserId, Vec<Binding>>>,
    /// Default expiration time (seconds)
    default_expires: u32,
    /// Maximum expiration time (seconds)
    max_expires: u32,
    /// Minimum expiration time (seconds)
    min_expires: u32,
    clock: Arc<dyn Clock>,
}

impl Registrar {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            default_expires: 3600, // 1 hour
            max_expires: 7200,     // 2 hours
            min_expires: 60,       // 1 minute
            clock,
        }
    }

    /// Get effective expiration time
    fn effective_expires(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(0) => 0, // Unregister
            Some(expires) if expires < self.min_expires => self.min_expires,
            Some(expires) if expires > self.max_expires => self.max_expires,
            Some(expires) => expires,
            None => self.default_expires,
        }
    }

    /// Apply a REGISTER's contacts for a user
    ///
    /// Zero expiry removes the named contacts. Returns the bindings that
    /// remain active, with their remaining lifetime in seconds.
    pub async fn bind(
        &self,
        user: &UserId,
        contacts: &[String],
        requested_expires: Option<u32>,
    ) -> Vec<(String, u32)> {
        let expires = self.effective_expires(requested_expires);
        let now = self.clock.now();
        let mut bindings = self.bindings.write().await;

        let remaining: Vec<(String, u32)> = {
            let entry = bindings.entry(user.clone()).or_default();
            entry.retain(|b| !b.is_expired(now));

            for contact in contacts {
                // Replace an existing binding for the same contact
                entry.retain(|b| b.contact != *contact);

                if expires == 0 {
                    info!("Unregistering {} at {}", user, contact);
                    continue;
                }

                entry.push(Binding {
                    contact: contact.clone(),
                    expires_at: now + Duration::seconds(i64::from(expires)),
                });
                info!("Registered {} at {} (expires in {}s)", user, contact, expires);
            }

            entry
                .iter()
                .map(|b| {
                    let left = (b.expires_at - now).num_seconds().max(0) as u32;
                    (b.contact.clone(), left)
                })
                .collect()
        };

        if remaining.is_empty() {
            bindings.remove(user);
        }
        remaining
    }

    /// Active bindings for a user
    pub async fn bindings_for(&self, user: &UserId) -> Option<Vec<Binding>> {
        let now = self.clock.now();
        let mut bindings = self.bindings.write().await;

        if let Some(entry) = bindings.get_mut(user) {
            entry.retain(|b| !b.is_expired(now));
            if entry.is_empty() {
                bindings.remove(user);
                return None;
            }
            return Some(entry.clone());
        }

        None
    }

    pub async fn is_registered(&self, user: &UserId) -> bool {
        self.bindings_for(user).await.is_some()
    }

    /// The user currently registered at the given contact, if any
    pub async fn user_with_contact(&self, contact: &Uri) -> Option<UserId> {
        let key = address_key_str(&contact.to_string());
        let now = self.clock.now();
        let bindings = self.bindings.read().await;
        for (user, entry) in bindings.iter() {
            if entry
                .iter()
                .any(|b| !b.is_expired(now) && address_key_str(&b.contact) == key)
            {
                debug!("Contact {} belongs to {}", contact, user);
                return Some(user.clone());
            }
        }
        None
    }
}
