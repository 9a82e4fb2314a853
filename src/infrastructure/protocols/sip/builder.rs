//! SIP response construction
//!
//! Every response this proxy sends is generated locally (it forwards
//! requests, never responses), so building one always starts from the
//! request being answered: the dialog identification is mirrored back,
//! then whatever the decision layer adds (challenges, entity tags,
//! Contact bindings) follows.

use super::message::{SipError, SipRequest, SipResponse};
use rsip::{Header, Headers, Response, StatusCode, Version};

// Headers that tie a response to the transaction and dialog of the
// request it answers
fn is_dialog_header(header: &Header) -> bool {
    matches!(
        header,
        Header::Via(_) | Header::From(_) | Header::To(_) | Header::CallId(_) | Header::CSeq(_)
    )
}

/// Build a locally generated response to a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// Convenience for extension headers
    pub fn raw_header(self, name: &str, value: &str) -> Self {
        self.header(Header::Other(name.to_string(), value.to_string()))
    }

    /// Finish the response against the request it answers
    ///
    /// Dialog identification comes first, in the order UAs expect it,
    /// then the decision layer's headers, then Content-Length computed
    /// from the body.
    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers: Vec<Header> = request
            .headers()
            .iter()
            .filter(|h| is_dialog_header(h))
            .cloned()
            .collect();
        headers.extend(self.headers);
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::test_messages::build_request;

    #[test]
    fn test_build_copies_dialog_headers() {
        let request = build_request(
            "OPTIONS",
            "sip:example.org",
            "sip:alice@example.org",
            &[],
            b"",
        );
        let response = ResponseBuilder::ok().build_for_request(&request).unwrap();

        assert_eq!(response.status_code(), 200);
        assert!(response.header_value("Via").is_some());
        assert!(response.header_value("Call-ID").is_some());
        assert_eq!(response.header_value("Content-Length"), Some("0".to_string()));
    }

    #[test]
    fn test_request_noise_is_not_mirrored() {
        // only dialog identification survives into the response
        let request = build_request(
            "OPTIONS",
            "sip:example.org",
            "sip:alice@example.org",
            &[("Route", "<sip:p1.example.org;lr>")],
            b"",
        );
        let response = ResponseBuilder::ok().build_for_request(&request).unwrap();

        assert!(response.header_value("Route").is_none());
        assert!(response.header_value("Max-Forwards").is_none());
    }

    #[test]
    fn test_body_sets_content_length() {
        let request = build_request(
            "SUBSCRIBE",
            "sip:alice@example.org",
            "sip:watcher@example.org",
            &[],
            b"",
        );
        let response = ResponseBuilder::ok()
            .body(b"<presence/>".to_vec())
            .build_for_request(&request)
            .unwrap();

        assert_eq!(
            response.header_value("Content-Length"),
            Some("11".to_string())
        );
        assert_eq!(response.body(), b"<presence/>");
    }

    #[test]
    fn test_raw_header_and_body() {
        let request = build_request(
            "PUBLISH",
            "sip:alice@example.org",
            "sip:alice@example.org",
            &[],
            b"",
        );
        let response = ResponseBuilder::new(423)
            .raw_header("Min-Expires", "60")
            .build_for_request(&request)
            .unwrap();

        assert_eq!(response.status_code(), 423);
        assert_eq!(response.header_value("Min-Expires"), Some("60".to_string()));
    }
}
