//! Shared value objects used across the proxy core

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical user identifier
///
/// Minted by the user directory's canonicalization oracle; everything after
/// authentication (address ownership, class allow-lists, presence state,
/// registrar bindings) is keyed on this, never on the username a UA sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Destination number class
///
/// Assigned to a dialled number by the first matching rule in the configured
/// class list; per-user allow-lists are expressed in the same terms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumberClass {
    Internal,
    National,
    International,
    Mobile,
    Premium,
    Unknown,
    Other(String),
}

impl NumberClass {
    pub fn as_str(&self) -> &str {
        match self {
            NumberClass::Internal => "internal",
            NumberClass::National => "national",
            NumberClass::International => "international",
            NumberClass::Mobile => "mobile",
            NumberClass::Premium => "premium",
            NumberClass::Unknown => "unknown",
            NumberClass::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "internal" => NumberClass::Internal,
            "national" => NumberClass::National,
            "international" => NumberClass::International,
            "mobile" => NumberClass::Mobile,
            "premium" => NumberClass::Premium,
            "unknown" => NumberClass::Unknown,
            _ => NumberClass::Other(name.to_string()),
        }
    }
}

impl fmt::Display for NumberClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
