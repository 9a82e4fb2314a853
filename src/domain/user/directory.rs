//! User database oracle
//!
//! The proxy core never talks to a concrete user store; it goes through
//! this trait. The in-memory implementation backs the binary and the
//! integration tests, real deployments plug in their own directory.

use crate::domain::shared::value_objects::{NumberClass, UserId};
use async_trait::async_trait;
use rsip::Uri;
use std::collections::HashMap;

/// User database oracle interface
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Map a username as received from a UA to a canonical user id
    async fn canonify(&self, username: &str) -> Option<UserId>;

    /// Plain-text password for a canonical user
    async fn password_for(&self, user: &UserId) -> Option<String>;

    /// All users owning the given address, `None` when nobody does
    async fn users_for_url(&self, url: &Uri) -> Option<Vec<UserId>>;

    /// The primary user owning the given address, if any
    async fn user_with_address(&self, url: &Uri) -> Option<UserId>;

    /// PSTN destination classes the user is allowed to call
    async fn classes_for_user(&self, user: &UserId) -> Option<Vec<NumberClass>>;
}

/// Reduce a URI to a comparable `user@host` key
///
/// Ports and URI parameters do not take part in address ownership.
pub fn address_key(url: &Uri) -> String {
    let user = url
        .auth
        .as_ref()
        .map(|a| a.user.to_lowercase())
        .unwrap_or_default();
    let host = url.host_with_port.host.to_string().to_lowercase();
    format!("{}@{}", user, host)
}

/// Reduce an address string (e.g. "sip:alice@example.org") to the same key
pub fn address_key_str(address: &str) -> String {
    let stripped = address
        .trim()
        .trim_start_matches("sips:")
        .trim_start_matches("sip:");
    let stripped = stripped.split(';').next().unwrap_or(stripped);
    match stripped.split_once('@') {
        Some((user, host)) => {
            let host = host.split(':').next().unwrap_or(host);
            format!("{}@{}", user.to_lowercase(), host.to_lowercase())
        }
        None => {
            let host = stripped.split(':').next().unwrap_or(stripped);
            format!("@{}", host.to_lowercase())
        }
    }
}

struct UserEntry {
    user: UserId,
    password: String,
    addresses: Vec<String>,
    classes: Vec<NumberClass>,
}

/// In-memory user directory
pub struct InMemoryUserDirectory {
    entries: HashMap<String, UserEntry>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Add a user with the addresses they own and the classes they may call
    pub fn add_user(
        &mut self,
        username: &str,
        password: &str,
        addresses: Vec<String>,
        classes: Vec<NumberClass>,
    ) {
        self.entries.insert(
            username.to_string(),
            UserEntry {
                user: UserId::from(username),
                password: password.to_string(),
                addresses: addresses.iter().map(|a| address_key_str(a)).collect(),
                classes,
            },
        );
    }
}

impl Default for InMemoryUserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn canonify(&self, username: &str) -> Option<UserId> {
        if let Some(entry) = self.entries.get(username) {
            return Some(entry.user.clone());
        }
        // UAs sometimes send user@realm as the digest username
        let (bare, _) = username.split_once('@')?;
        self.entries.get(bare).map(|e| e.user.clone())
    }

    async fn password_for(&self, user: &UserId) -> Option<String> {
        self.entries.get(user.as_str()).map(|e| e.password.clone())
    }

    async fn users_for_url(&self, url: &Uri) -> Option<Vec<UserId>> {
        let key = address_key(url);
        let owners: Vec<UserId> = self
            .entries
            .values()
            .filter(|e| e.addresses.contains(&key))
            .map(|e| e.user.clone())
            .collect();
        if owners.is_empty() {
            None
        } else {
            Some(owners)
        }
    }

    async fn user_with_address(&self, url: &Uri) -> Option<UserId> {
        self.users_for_url(url).await?.into_iter().next()
    }

    async fn classes_for_user(&self, user: &UserId) -> Option<Vec<NumberClass>> {
        self.entries
            .get(user.as_str())
            .map(|e| e.classes.clone())
    }
}
