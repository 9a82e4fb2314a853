//! Configuration management
//!
//! Settings are resolved once at startup into an immutable `Config` value;
//! components receive the pieces they need and never re-read configuration
//! at request time.

use crate::domain::shared::error::DomainError;
use config::{Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub auth: AuthConfig,
    pub presence: PresenceConfig,
    pub users: Vec<StaticUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// Domains this proxy is authoritative for
    pub domains: Vec<String>,
    pub record_route: bool,
    /// Country code for rewriting nationally dialled numbers to E.164
    pub e164_country_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Authentication realm presented in challenges (may be empty)
    pub realm: String,
    /// Shared secret all cluster members mint nonces from; required
    pub secret: String,
    /// Shared secret for the peer-proxy trust channel
    pub peer_secret: Option<String>,
    /// Destination classes that may be called without authentication
    pub unauth_classes: Vec<String>,
    pub always_verify_homedomain_user: bool,
    /// Ordered destination classification rules; first match wins
    pub classes: Vec<ClassRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassRule {
    pub pattern: String,
    pub class: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Seconds; PUBLISH Expires below this draws 423 Interval Too Brief
    pub min_publish: u32,
    pub max_publish: u32,
    pub default_publish: u32,
}

/// A user provisioned directly in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticUser {
    pub username: String,
    pub password: String,
    /// Addresses this user owns, e.g. "sip:alice@example.org"
    pub addresses: Vec<String>,
    /// Destination classes this user may call
    pub classes: Vec<String>,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 5060,
            domains: vec!["localhost".to_string()],
            record_route: false,
            e164_country_code: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            realm: String::new(),
            secret: String::new(),
            peer_secret: None,
            unauth_classes: Vec::new(),
            always_verify_homedomain_user: true,
            classes: Vec::new(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            min_publish: 60,
            max_publish: 3600,
            default_publish: 3600,
        }
    }
}

impl Default for StaticUser {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            addresses: Vec::new(),
            classes: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file plus YODEL_* env overrides
    pub fn load(path: Option<&str>) -> Result<Self, DomainError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(Environment::with_prefix("YODEL").separator("__"));

        let settings = builder
            .build()
            .map_err(|e| DomainError::Configuration(e.to_string()))?;
        let config: Config = settings
            .try_deserialize()
            .map_err(|e| DomainError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.auth.secret.is_empty() {
            return Err(DomainError::Configuration(
                "auth.secret must be set".to_string(),
            ));
        }
        if self.presence.min_publish > self.presence.max_publish {
            return Err(DomainError::Configuration(
                "presence.min_publish exceeds presence.max_publish".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_homedomain(&self, host: &str) -> bool {
        self.sip
            .domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(host))
    }
}
