//! Shared helpers for the integration tests

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use yodel::domain::shared::clock::Clock;
use yodel::infrastructure::protocols::sip::SipRequest;

/// Clock pinned to one instant so nonce freshness is deterministic
pub struct TestClock(pub DateTime<Utc>);

impl TestClock {
    pub fn at_unix(secs: i64) -> Self {
        Self(Utc.timestamp_opt(secs, 0).unwrap())
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Build a parseable request with the usual dialog headers
///
/// `To` mirrors `from`, matching REGISTER semantics.
pub fn build_request(
    method: &str,
    uri: &str,
    from: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> SipRequest {
    let mut msg = format!("{} {} SIP/2.0\r\n", method, uri);
    msg.push_str("Via: SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bK776asdhds\r\n");
    msg.push_str(&format!("From: <{}>;tag=1928301774\r\n", from));
    msg.push_str(&format!("To: <{}>\r\n", from));
    msg.push_str("Call-ID: a84b4c76e66710@pc33.example.org\r\n");
    msg.push_str(&format!("CSeq: 314159 {}\r\n", method));
    if !extra_headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("Max-Forwards"))
    {
        msg.push_str("Max-Forwards: 70\r\n");
    }
    for (name, value) in extra_headers {
        msg.push_str(&format!("{}: {}\r\n", name, value));
    }
    msg.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    let mut bytes = msg.into_bytes();
    bytes.extend_from_slice(body);
    SipRequest::parse(&bytes).expect("test request must parse")
}

/// Pull one parameter out of a Digest challenge header value
pub fn challenge_param(header: &str, name: &str) -> String {
    let marker = format!("{}=", name);
    let start = header
        .find(&marker)
        .unwrap_or_else(|| panic!("no {} in {}", name, header))
        + marker.len();
    let rest = &header[start..];
    if let Some(quoted) = rest.strip_prefix('"') {
        quoted
            .split('"')
            .next()
            .expect("unterminated quoted parameter")
            .to_string()
    } else {
        rest.split([',', ' ']).next().unwrap_or(rest).to_string()
    }
}
