//! SIP message types and parsing

use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

use crate::domain::shared::error::DomainError;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Malformed credentials: {0}")]
    MalformedAuth(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SipError {
    /// Response code this error degrades to when it reaches the wire
    pub fn status_code(&self) -> u16 {
        match self {
            SipError::ParseError(_) | SipError::InvalidMessage(_) | SipError::MalformedAuth(_) => {
                400
            }
            SipError::TransportError(_) | SipError::Internal(_) => 500,
        }
    }
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

impl From<DomainError> for SipError {
    fn from(err: DomainError) -> Self {
        SipError::Internal(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Info => Some(SipMethod::Info),
            Method::Update => Some(SipMethod::Update),
            Method::Subscribe => Some(SipMethod::Subscribe),
            Method::Notify => Some(SipMethod::Notify),
            Method::Refer => Some(SipMethod::Refer),
            Method::Message => Some(SipMethod::Message),
            Method::Publish => Some(SipMethod::Publish),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// rsip headers sometimes render with their label; cut it off when present
fn strip_header_label(raw: &str, name: &str) -> String {
    let trimmed = raw.trim();
    if let Some(head) = trimmed.get(..name.len()) {
        if head.eq_ignore_ascii_case(name) {
            if let Some(rest) = trimmed[name.len()..].trim_start().strip_prefix(':') {
                return rest.trim().to_string();
            }
        }
    }
    trimmed.to_string()
}

// Wire name of a typed header variant; extension headers live in Other
fn header_label(header: &Header) -> Option<&'static str> {
    Some(match header {
        Header::Accept(_) => "Accept",
        Header::Authorization(_) => "Authorization",
        Header::CallId(_) => "Call-ID",
        Header::Contact(_) => "Contact",
        Header::ContentLength(_) => "Content-Length",
        Header::ContentType(_) => "Content-Type",
        Header::CSeq(_) => "CSeq",
        Header::Event(_) => "Event",
        Header::Expires(_) => "Expires",
        Header::From(_) => "From",
        Header::MaxForwards(_) => "Max-Forwards",
        Header::MinExpires(_) => "Min-Expires",
        Header::ProxyAuthenticate(_) => "Proxy-Authenticate",
        Header::ProxyAuthorization(_) => "Proxy-Authorization",
        Header::RecordRoute(_) => "Record-Route",
        Header::Route(_) => "Route",
        Header::To(_) => "To",
        Header::Via(_) => "Via",
        Header::WwwAuthenticate(_) => "WWW-Authenticate",
        _ => return None,
    })
}

fn header_value_named(header: &Header, name: &str) -> Option<String> {
    if let Header::Other(label, value) = header {
        if label.eq_ignore_ascii_case(name) {
            return Some(value.trim().to_string());
        }
        return None;
    }
    let label = header_label(header)?;
    if !label.eq_ignore_ascii_case(name) {
        return None;
    }
    Some(strip_header_label(&header.to_string(), label))
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn call_id(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::CallId(cid) => Some(strip_header_label(&cid.to_string(), "Call-ID")),
            _ => None,
        })
    }

    /// All values carried under the named header, label stripped
    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.inner
            .headers
            .iter()
            .filter_map(|h| header_value_named(h, name))
            .collect()
    }

    /// First value of the named header, if any
    pub fn header_value(&self, name: &str) -> Option<String> {
        self.header_values(name).into_iter().next()
    }

    pub fn from_uri(&self) -> Option<Uri> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::From(from) => from.uri().ok(),
            _ => None,
        })
    }

    pub fn to_uri(&self) -> Option<Uri> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::To(to) => to.uri().ok(),
            _ => None,
        })
    }

    /// Contact URIs as they appeared in the request
    pub fn contact_uris(&self) -> Vec<String> {
        self.inner
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::Contact(contact) => contact.uri().ok().map(|u| u.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn expires(&self) -> Option<u32> {
        self.header_value("Expires")?.parse().ok()
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.header_value("Max-Forwards")?.parse().ok()
    }

    pub fn content_types(&self) -> Vec<String> {
        self.header_values("Content-Type")
    }

    /// Event package named by the Event header
    pub fn event_package(&self) -> Option<String> {
        let value = self.header_value("Event")?;
        Some(
            value
                .split(';')
                .next()
                .unwrap_or(&value)
                .trim()
                .to_string(),
        )
    }

    /// SIP-If-Match entity tags; commas separate multiple tags in one header
    pub fn sip_if_match(&self) -> Vec<String> {
        self.header_values("SIP-If-Match")
            .iter()
            .flat_map(|v| v.split(','))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// Accepted content types; commas separate multiple types in one header
    pub fn accept_types(&self) -> Vec<String> {
        self.header_values("Accept")
            .iter()
            .flat_map(|v| v.split(','))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    }

    pub fn has_route(&self) -> bool {
        !self.header_values("Route").is_empty()
    }

    /// Drop any Record-Route headers accumulated upstream
    pub fn strip_record_route(&mut self) {
        let kept: Vec<Header> = self
            .inner
            .headers
            .iter()
            .filter(|h| !matches!(h, Header::RecordRoute(_)))
            .cloned()
            .collect();
        self.inner.headers = Headers::from(kept);
    }

    /// Put a Route header in front of any existing ones
    pub fn prepend_route(&mut self, route: &str) {
        let mut headers: Vec<Header> = vec![Header::Route(route.to_string().into())];
        headers.extend(self.inner.headers.iter().cloned());
        self.inner.headers = Headers::from(headers);
    }

    pub fn push_header(&mut self, header: Header) {
        self.inner.headers.push(header);
    }

    /// Replace the Max-Forwards header
    pub fn set_max_forwards(&mut self, value: u32) {
        let mut kept: Vec<Header> = self
            .inner
            .headers
            .iter()
            .filter(|h| !matches!(h, Header::MaxForwards(_)))
            .cloned()
            .collect();
        kept.push(Header::MaxForwards(value.to_string().into()));
        self.inner.headers = Headers::from(kept);
    }

    /// Set an extension header, replacing any previous value
    pub fn set_extension_header(&mut self, name: &str, value: &str) {
        let mut kept: Vec<Header> = self
            .inner
            .headers
            .iter()
            .filter(|h| match h {
                Header::Other(n, _) => !n.eq_ignore_ascii_case(name),
                _ => true,
            })
            .cloned()
            .collect();
        kept.push(Header::Other(name.to_string(), value.to_string()));
        self.inner.headers = Headers::from(kept);
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    /// First value of the named header, label stripped
    pub fn header_value(&self, name: &str) -> Option<String> {
        self.inner
            .headers
            .iter()
            .find_map(|h| header_value_named(h, name))
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // Try parsing as request first
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::test_messages::build_request;

    #[test]
    fn test_parse_register() {
        let request = build_request(
            "REGISTER",
            "sip:example.org",
            "sip:alice@example.org",
            &[("Contact", "<sip:alice@192.0.2.10:5060>"), ("Expires", "600")],
            b"",
        );

        assert_eq!(request.method(), Some(SipMethod::Register));
        assert_eq!(request.expires(), Some(600));
        assert_eq!(request.contact_uris().len(), 1);
        assert!(!request.has_route());
    }

    #[test]
    fn test_header_values_extension_headers() {
        let request = build_request(
            "PUBLISH",
            "sip:alice@example.org",
            "sip:alice@example.org",
            &[
                ("Event", "presence"),
                ("SIP-If-Match", "etag-1"),
                ("Content-Type", "application/pidf+xml"),
            ],
            b"<presence/>",
        );

        assert_eq!(request.event_package(), Some("presence".to_string()));
        assert_eq!(request.sip_if_match(), vec!["etag-1".to_string()]);
        assert_eq!(
            request.content_types(),
            vec!["application/pidf+xml".to_string()]
        );
    }

    #[test]
    fn test_strip_record_route() {
        let mut request = build_request(
            "REGISTER",
            "sip:example.org",
            "sip:alice@example.org",
            &[("Record-Route", "<sip:p1.example.org;lr>")],
            b"",
        );

        assert!(!request.header_values("Record-Route").is_empty());
        request.strip_record_route();
        assert!(request.header_values("Record-Route").is_empty());
    }

    #[test]
    fn test_prepend_route() {
        let mut request = build_request(
            "INVITE",
            "sip:bob@example.org",
            "sip:alice@example.org",
            &[],
            b"",
        );
        request.prepend_route("<sip:gw.example.org:5070;lr>");
        assert_eq!(
            request.header_value("Route"),
            Some("<sip:gw.example.org:5070;lr>".to_string())
        );
        assert!(request.has_route());
    }

    #[test]
    fn test_set_extension_header_replaces() {
        let mut request = build_request(
            "INVITE",
            "sip:bob@example.org",
            "sip:alice@example.org",
            &[],
            b"",
        );
        request.set_extension_header("X-Yxa-Peer-Auth", "first");
        request.set_extension_header("X-Yxa-Peer-Auth", "second");
        assert_eq!(request.header_values("X-Yxa-Peer-Auth").len(), 1);
        assert_eq!(
            request.header_value("X-Yxa-Peer-Auth"),
            Some("second".to_string())
        );
    }
}
