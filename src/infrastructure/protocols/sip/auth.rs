//! Credentials verification
//!
//! Three header channels share one verification kernel: Authorization for
//! registration, Proxy-Authorization for calls, and X-Yxa-Peer-Auth for the
//! private trust channel between cooperating proxies. Outcomes are verdicts,
//! never errors; the single fatal parse error is a credentials header
//! without an opaque field.

use super::digest::{compute_response, decode_opaque, DigestEngine};
use super::message::{SipError, SipRequest};
use crate::domain::shared::clock::Clock;
use crate::domain::shared::value_objects::UserId;
use crate::domain::user::UserDirectory;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum age in seconds of a nonce's embedded mint time
pub const NONCE_FRESHNESS_WINDOW_SECS: i64 = 30;

/// Outcome of credentials verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    /// Credentials valid and fresh
    Authenticated(UserId),
    /// Arithmetic checks out but the nonce has aged out
    Stale(UserId),
    /// Authenticated through the peer-proxy shared secret
    PeerAuthenticated(UserId),
    /// No header, wrong response, unknown user or future timestamp
    Rejected,
}

/// Which credentials header a verification reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthHeaderKind {
    Register,
    Proxy,
    Peer,
}

impl AuthHeaderKind {
    pub fn header_name(&self) -> &'static str {
        match self {
            AuthHeaderKind::Register => "Authorization",
            AuthHeaderKind::Proxy => "Proxy-Authorization",
            AuthHeaderKind::Peer => "X-Yxa-Peer-Auth",
        }
    }
}

/// A decoded Digest credentials header
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    params: HashMap<String, String>,
}

impl DigestCredentials {
    /// Parse a credentials header value
    ///
    /// Only the Digest scheme is handled. GSSAPI is rejected outright at
    /// scheme detection; its body is never inspected.
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let trimmed = value.trim();
        let (scheme, rest) = trimmed
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipError::MalformedAuth("credentials without parameters".to_string()))?;

        if scheme.eq_ignore_ascii_case("gssapi") {
            return Err(SipError::MalformedAuth(
                "GSSAPI authentication is not supported".to_string(),
            ));
        }
        if !scheme.eq_ignore_ascii_case("digest") {
            return Err(SipError::MalformedAuth(format!(
                "unsupported authentication scheme {}",
                scheme
            )));
        }

        let mut params = HashMap::new();
        for part in rest.split(',') {
            let part = part.trim();
            if let Some(eq_pos) = part.find('=') {
                let key = part[..eq_pos].trim().to_lowercase();
                let value_part = part[eq_pos + 1..].trim();

                // Handle quoted values
                let value = if value_part.starts_with('"')
                    && value_part.ends_with('"')
                    && value_part.len() > 1
                {
                    value_part[1..value_part.len() - 1].to_string()
                } else {
                    value_part.to_string()
                };

                params.insert(key, value);
            }
        }

        Ok(Self { params })
    }

    fn get(&self, key: &str) -> &str {
        self.params.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn username(&self) -> &str {
        self.get("username")
    }

    pub fn realm(&self) -> &str {
        self.get("realm")
    }

    pub fn uri(&self) -> &str {
        self.get("uri")
    }

    pub fn response(&self) -> &str {
        self.get("response")
    }

    pub fn nonce(&self) -> &str {
        self.get("nonce")
    }

    pub fn opaque(&self) -> Option<&str> {
        self.params.get("opaque").map(String::as_str)
    }
}

/// Verifies credentials headers against the shared-secret challenge scheme
pub struct CredentialsVerifier {
    engine: Arc<DigestEngine>,
    directory: Arc<dyn UserDirectory>,
    peer_secret: Option<String>,
    clock: Arc<dyn Clock>,
}

impl CredentialsVerifier {
    pub fn new(
        engine: Arc<DigestEngine>,
        directory: Arc<dyn UserDirectory>,
        peer_secret: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            directory,
            peer_secret,
            clock,
        }
    }

    /// Verify the credentials header of the given kind on a request
    ///
    /// An absent header is `Rejected`; more than one header of the same
    /// kind is malformed.
    pub async fn verify(
        &self,
        request: &SipRequest,
        kind: AuthHeaderKind,
        method: &str,
    ) -> Result<AuthVerdict, SipError> {
        let values = request.header_values(kind.header_name());
        if values.len() > 1 {
            return Err(SipError::MalformedAuth(format!(
                "more than one {} header",
                kind.header_name()
            )));
        }
        let Some(value) = values.first() else {
            debug!("No {} header present", kind.header_name());
            return Ok(AuthVerdict::Rejected);
        };

        let credentials = DigestCredentials::parse(value)?;
        self.verify_credentials(&credentials, kind, method).await
    }

    /// The PSTN composite: peer credentials first, falling through to
    /// Proxy-Authorization only when the peer header is absent entirely
    pub async fn verify_pstn(
        &self,
        request: &SipRequest,
        method: &str,
    ) -> Result<AuthVerdict, SipError> {
        if request.header_values(AuthHeaderKind::Peer.header_name()).is_empty() {
            return self.verify(request, AuthHeaderKind::Proxy, method).await;
        }
        self.verify(request, AuthHeaderKind::Peer, method).await
    }

    /// The shared verification kernel
    pub async fn verify_credentials(
        &self,
        credentials: &DigestCredentials,
        kind: AuthHeaderKind,
        method: &str,
    ) -> Result<AuthVerdict, SipError> {
        let Some(opaque) = credentials.opaque() else {
            return Err(SipError::MalformedAuth(
                "Authorization should contain opaque".to_string(),
            ));
        };

        let username = credentials.username();
        let (user, password, realm) = match kind {
            AuthHeaderKind::Peer => {
                let Some(secret) = self.peer_secret.clone() else {
                    debug!("Peer credentials offered but no peer secret is configured");
                    return Ok(AuthVerdict::Rejected);
                };
                // The peer names its own realm
                (
                    UserId::from(username),
                    Some(secret),
                    credentials.realm().to_string(),
                )
            }
            _ => {
                let user = self
                    .directory
                    .canonify(username)
                    .await
                    .unwrap_or_else(|| UserId::from(username));
                let password = self.directory.password_for(&user).await;
                (user, password, self.engine.realm().to_string())
            }
        };

        let nonce_expected = self.engine.make_nonce(opaque);
        // The client hashed with the username it sent, not our canonical id
        let response_expected = compute_response(
            &nonce_expected,
            method,
            credentials.uri(),
            username,
            password.as_deref(),
            &realm,
        );

        let Some(response_expected) = response_expected else {
            info!("No password found for user {}", user);
            return Ok(AuthVerdict::Rejected);
        };

        if credentials.response() != response_expected {
            debug!("Wrong digest response for user {}", user);
            return Ok(AuthVerdict::Rejected);
        }

        if credentials.nonce() != nonce_expected {
            debug!("Nonce does not match opaque for user {}", user);
            return Ok(AuthVerdict::Rejected);
        }

        let Some(minted_at) = decode_opaque(opaque) else {
            debug!("Opaque field does not decode to a timestamp");
            return Ok(AuthVerdict::Rejected);
        };

        let now = self.clock.unix_seconds();
        if minted_at < now - NONCE_FRESHNESS_WINDOW_SECS {
            debug!("Credentials for {} have aged out, demanding a fresh nonce", user);
            return Ok(AuthVerdict::Stale(user));
        }
        if minted_at > now {
            warn!("Credentials for {} are from the future, rejecting", user);
            return Ok(AuthVerdict::Rejected);
        }

        Ok(match kind {
            AuthHeaderKind::Peer => AuthVerdict::PeerAuthenticated(user),
            _ => AuthVerdict::Authenticated(user),
        })
    }
}
