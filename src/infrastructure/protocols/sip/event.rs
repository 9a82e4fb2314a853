//! Event server dispatch
//!
//! Front door for the event-package methods. Resolves authentication with
//! the shared verifier, answers its own challenges, then hands the
//! authenticated user to the presence processor. Only the presence
//! package exists in this revision.

use super::auth::{AuthHeaderKind, AuthVerdict, CredentialsVerifier};
use super::builder::ResponseBuilder;
use super::digest::{format_challenge_header, DigestEngine};
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use super::presence_handler::{PresenceProcessor, SubscribeAuth};
use crate::domain::presence::Presentity;
use crate::domain::user::UserDirectory;
use rsip::Header;
use std::sync::Arc;
use tracing::{debug, info};

const PRESENCE_PACKAGE: &str = "presence";

/// Dispatches PUBLISH / SUBSCRIBE / NOTIFY for the presence package
pub struct EventServer {
    verifier: Arc<CredentialsVerifier>,
    digest: Arc<DigestEngine>,
    processor: Arc<PresenceProcessor>,
    directory: Arc<dyn UserDirectory>,
}

impl EventServer {
    pub fn new(
        verifier: Arc<CredentialsVerifier>,
        digest: Arc<DigestEngine>,
        processor: Arc<PresenceProcessor>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            verifier,
            digest,
            processor,
            directory,
        }
    }

    fn challenge(&self, request: &SipRequest, stale: bool) -> Result<SipResponse, SipError> {
        let challenge = self.digest.new_challenge();
        ResponseBuilder::new(401)
            .raw_header(
                "WWW-Authenticate",
                &format_challenge_header(&challenge, stale),
            )
            .build_for_request(request)
    }

    async fn handle_subscribe(&self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let uri = request.uri().clone();
        let presentity = match self.directory.users_for_url(&uri).await {
            Some(users) => Presentity::Users(users),
            None => Presentity::Address(uri.to_string()),
        };

        let accept = request.accept_types();
        let admission = self
            .processor
            .subscribe_admission(true, &presentity, &accept);
        match admission {
            SubscribeAuth::NeedAuth => self.challenge(request, false),
            SubscribeAuth::UnsupportedAccept => ResponseBuilder::new(406)
                .raw_header("Accept", &self.processor.supported_list())
                .build_for_request(request),
            SubscribeAuth::Active | SubscribeAuth::Pending => {
                let code = if admission == SubscribeAuth::Active {
                    200
                } else {
                    202
                };
                let expires = match self.processor.clamp_expires(request.expires()) {
                    Ok(expires) => expires,
                    Err(min) => {
                        return ResponseBuilder::new(423)
                            .raw_header("Min-Expires", &min.to_string())
                            .build_for_request(request)
                    }
                };
                info!(
                    "SUBSCRIBE to {:?} admitted with {} (expires {})",
                    presentity, code, expires
                );
                ResponseBuilder::new(code)
                    .header(Header::Expires(expires.to_string().into()))
                    .build_for_request(request)
            }
        }
    }

    async fn handle_notify(&self, request: &SipRequest) -> Result<SipResponse, SipError> {
        // The notifying side owns the state; resolve the presentity from From
        let Some(from) = request.from_uri() else {
            return ResponseBuilder::new(400).build_for_request(request);
        };
        let Some(presentity) = self.directory.user_with_address(&from).await else {
            debug!("NOTIFY about unknown presentity {}", from);
            return ResponseBuilder::new(404).build_for_request(request);
        };
        self.processor.handle_notify(request, &presentity).await
    }

    /// Whether a method belongs to the event-package surface
    pub fn can_handle(method: SipMethod) -> bool {
        matches!(
            method,
            SipMethod::Publish | SipMethod::Subscribe | SipMethod::Notify
        )
    }

    /// Handle one event-package request, always ending in a local response
    pub async fn handle_request(&self, request: SipRequest) -> Result<SipResponse, SipError> {
        let Some(method) = request.method() else {
            return ResponseBuilder::new(501).build_for_request(&request);
        };
        if !Self::can_handle(method) {
            return ResponseBuilder::new(501).build_for_request(&request);
        }

        // Only the presence package is implemented
        if let Some(package) = request.event_package() {
            if !package.eq_ignore_ascii_case(PRESENCE_PACKAGE) {
                debug!("Unknown event package {}", package);
                return ResponseBuilder::new(489).build_for_request(&request);
            }
        }

        let user = match self
            .verifier
            .verify(&request, AuthHeaderKind::Register, method.as_str())
            .await?
        {
            AuthVerdict::Authenticated(user) | AuthVerdict::PeerAuthenticated(user) => user,
            AuthVerdict::Stale(user) => {
                debug!("Stale event credentials from {}", user);
                return self.challenge(&request, true);
            }
            AuthVerdict::Rejected => {
                debug!("Event request without valid credentials");
                return self.challenge(&request, false);
            }
        };

        match method {
            SipMethod::Publish => self.processor.handle_publish(&request, &user).await,
            SipMethod::Subscribe => self.handle_subscribe(&request).await,
            SipMethod::Notify => self.handle_notify(&request).await,
            _ => ResponseBuilder::new(501).build_for_request(&request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::presence::InMemoryPidfStore;
    use crate::domain::shared::clock::FixedClock;
    use crate::domain::shared::value_objects::UserId;
    use crate::domain::user::directory::MockUserDirectory;
    use crate::infrastructure::protocols::sip::digest::{compute_response, format_auth_header};
    use crate::infrastructure::protocols::sip::etag::EtagGenerator;
    use crate::infrastructure::protocols::sip::presence_handler::PublishLimits;
    use crate::infrastructure::protocols::sip::test_messages::build_request;

    const SECRET: &str = "toomanysecrets";
    const REALM: &str = "example.org";
    const NOW: i64 = 11_000_000;
    const OPAQUE: &str = "00a7d8c0";

    const PIDF: &[u8] = br#"<?xml version="1.0"?>
<presence xmlns="urn:ietf:params:xml:ns:pidf" entity="sip:ft@example.org">
  <tuple id="t1"><status><basic>open</basic></status></tuple>
</presence>"#;

    fn server() -> EventServer {
        let clock = Arc::new(FixedClock::at_unix(NOW));
        let digest = Arc::new(DigestEngine::new(REALM, SECRET, clock.clone()));

        let mut mock = MockUserDirectory::new();
        mock.expect_canonify().returning(|username| match username {
            "ft.test" => Some(UserId::from("ft.test")),
            _ => None,
        });
        mock.expect_password_for().returning(|user| {
            if user.as_str() == "ft.test" {
                Some("foo".to_string())
            } else {
                None
            }
        });
        mock.expect_users_for_url().returning(|url| {
            if url.to_string().contains("ft@example.org") {
                Some(vec![UserId::from("ft.test")])
            } else {
                None
            }
        });
        mock.expect_user_with_address().returning(|url| {
            if url.to_string().contains("ft@example.org") {
                Some(UserId::from("ft.test"))
            } else {
                None
            }
        });
        let directory: Arc<dyn UserDirectory> = Arc::new(mock);

        let verifier = Arc::new(CredentialsVerifier::new(
            digest.clone(),
            directory.clone(),
            None,
            clock.clone(),
        ));
        let store = Arc::new(InMemoryPidfStore::new(clock.clone()));
        let processor = Arc::new(PresenceProcessor::new(
            store,
            EtagGenerator::new("proxy.example.org", clock.clone()),
            PublishLimits {
                min: 60,
                max: 3600,
                default: 3600,
            },
            clock,
        ));
        EventServer::new(verifier, digest, processor, directory)
    }

    fn auth_value(method: &str, uri: &str) -> String {
        let clock = Arc::new(FixedClock::at_unix(NOW));
        let engine = DigestEngine::new(REALM, SECRET, clock);
        let nonce = engine.make_nonce(OPAQUE);
        let response =
            compute_response(&nonce, method, uri, "ft.test", Some("foo"), REALM).unwrap();
        format_auth_header(
            "Digest", "ft.test", REALM, uri, &response, &nonce, OPAQUE, "md5",
        )
    }

    #[tokio::test]
    async fn test_publish_without_credentials_is_challenged() {
        let server = server();
        let request = build_request(
            "PUBLISH",
            "sip:ft@example.org",
            "sip:ft@example.org",
            &[("Event", "presence"), ("Content-Type", "application/pidf+xml")],
            PIDF,
        );

        let response = server.handle_request(request).await.unwrap();
        assert_eq!(response.status_code(), 401);
        assert!(response.header_value("WWW-Authenticate").is_some());
    }

    #[tokio::test]
    async fn test_publish_with_credentials_is_stored() {
        let server = server();
        let auth = auth_value("PUBLISH", "sip:ft@example.org");
        let request = build_request(
            "PUBLISH",
            "sip:ft@example.org",
            "sip:ft@example.org",
            &[
                ("Authorization", &auth),
                ("Event", "presence"),
                ("Content-Type", "application/pidf+xml"),
            ],
            PIDF,
        );

        let response = server.handle_request(request).await.unwrap();
        assert_eq!(response.status_code(), 200);
        assert!(response.header_value("SIP-ETag").is_some());
    }

    #[tokio::test]
    async fn test_unknown_event_package_is_489() {
        let server = server();
        let auth = auth_value("PUBLISH", "sip:ft@example.org");
        let request = build_request(
            "PUBLISH",
            "sip:ft@example.org",
            "sip:ft@example.org",
            &[
                ("Authorization", &auth),
                ("Event", "message-summary"),
                ("Content-Type", "application/pidf+xml"),
            ],
            PIDF,
        );

        let response = server.handle_request(request).await.unwrap();
        assert_eq!(response.status_code(), 489);
    }

    #[tokio::test]
    async fn test_subscribe_to_known_user_is_active() {
        let server = server();
        let auth = auth_value("SUBSCRIBE", "sip:ft@example.org");
        let request = build_request(
            "SUBSCRIBE",
            "sip:ft@example.org",
            "sip:ft@example.org",
            &[
                ("Authorization", &auth),
                ("Event", "presence"),
                ("Expires", "1800"),
            ],
            b"",
        );

        let response = server.handle_request(request).await.unwrap();
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.header_value("Expires"), Some("1800".to_string()));
    }

    #[tokio::test]
    async fn test_subscribe_to_address_form_is_pending() {
        let server = server();
        let auth = auth_value("SUBSCRIBE", "sip:stranger@example.org");
        let request = build_request(
            "SUBSCRIBE",
            "sip:stranger@example.org",
            "sip:ft@example.org",
            &[("Authorization", &auth), ("Event", "presence")],
            b"",
        );

        let response = server.handle_request(request).await.unwrap();
        assert_eq!(response.status_code(), 202);
    }

    #[tokio::test]
    async fn test_subscribe_with_bad_accept_is_406() {
        let server = server();
        let auth = auth_value("SUBSCRIBE", "sip:ft@example.org");
        let request = build_request(
            "SUBSCRIBE",
            "sip:ft@example.org",
            "sip:ft@example.org",
            &[
                ("Authorization", &auth),
                ("Event", "presence"),
                ("Accept", "application/json"),
            ],
            b"",
        );

        let response = server.handle_request(request).await.unwrap();
        assert_eq!(response.status_code(), 406);
        assert!(response
            .header_value("Accept")
            .unwrap()
            .contains("pidf+xml"));
    }

    #[tokio::test]
    async fn test_notify_from_known_presentity_is_stored() {
        let server = server();
        let auth = auth_value("NOTIFY", "sip:sub@example.org");
        let request = build_request(
            "NOTIFY",
            "sip:sub@example.org",
            "sip:ft@example.org",
            &[
                ("Authorization", &auth),
                ("Event", "presence"),
                ("Content-Type", "application/pidf+xml"),
            ],
            PIDF,
        );

        let response = server.handle_request(request).await.unwrap();
        assert_eq!(response.status_code(), 200);
    }
}
