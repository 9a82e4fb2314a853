//! Stateless digest arithmetic (RFC 2617, MD5, no qop)
//!
//! Challenges carry no per-request state: the opaque field is the mint time
//! in hex and the nonce is derived from it with the cluster-wide shared
//! secret, so any proxy in the cluster can validate a challenge minted by
//! any other.

use crate::domain::shared::clock::Clock;
use std::sync::Arc;

/// A challenge as sent in WWW-Authenticate / Proxy-Authenticate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: String,
}

/// Lowercase hex MD5 of the input
pub fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Decode an eight-digit hex opaque back to its mint time
pub fn decode_opaque(opaque: &str) -> Option<i64> {
    if opaque.len() != 8 {
        return None;
    }
    u32::from_str_radix(opaque, 16).ok().map(i64::from)
}

/// RFC 2617 response over known credentials
pub fn digest_response(
    nonce: &str,
    method: &str,
    uri: &str,
    user: &str,
    password: &str,
    realm: &str,
) -> String {
    let a1 = md5_hex(&format!("{}:{}:{}", user, realm, password));
    let a2 = md5_hex(&format!("{}:{}", method, uri));
    md5_hex(&format!("{}:{}:{}", a1, nonce, a2))
}

/// RFC 2617 response computation; `None` password propagates to `None`
pub fn compute_response(
    nonce: &str,
    method: &str,
    uri: &str,
    user: &str,
    password: Option<&str>,
    realm: &str,
) -> Option<String> {
    Some(digest_response(nonce, method, uri, user, password?, realm))
}

/// Format a credentials header value
///
/// `algorithm` goes unquoted, everything else double-quoted. Values were
/// validated upstream, so no quote escaping happens here.
#[allow(clippy::too_many_arguments)]
pub fn format_auth_header(
    scheme: &str,
    user: &str,
    realm: &str,
    uri: &str,
    response: &str,
    nonce: &str,
    opaque: &str,
    algorithm: &str,
) -> String {
    format!(
        "{} username=\"{}\", realm=\"{}\", uri=\"{}\", response=\"{}\", nonce=\"{}\", opaque=\"{}\", algorithm={}",
        scheme, user, realm, uri, response, nonce, opaque, algorithm
    )
}

/// Format a challenge as a WWW-Authenticate / Proxy-Authenticate value
pub fn format_challenge_header(challenge: &Challenge, stale: bool) -> String {
    let mut value = format!(
        "Digest realm=\"{}\", nonce=\"{}\", opaque=\"{}\", algorithm=md5",
        challenge.realm, challenge.nonce, challenge.opaque
    );
    if stale {
        value.push_str(", stale=true");
    }
    value
}

/// Mints and reconstructs challenges from the shared secret
pub struct DigestEngine {
    realm: String,
    secret: String,
    clock: Arc<dyn Clock>,
}

impl DigestEngine {
    pub fn new(realm: impl Into<String>, secret: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            realm: realm.into(),
            secret: secret.into(),
            clock,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Nonce belonging to the given opaque under the configured secret
    pub fn make_nonce(&self, opaque: &str) -> String {
        md5_hex(&format!("{}:{}", opaque, self.secret))
    }

    /// Mint a challenge from the current wall clock
    pub fn new_challenge(&self) -> Challenge {
        let seconds = self.clock.unix_seconds() as u32;
        let opaque = hex::encode(seconds.to_be_bytes());
        Challenge {
            realm: self.realm.clone(),
            nonce: self.make_nonce(&opaque),
            opaque,
        }
    }
}
