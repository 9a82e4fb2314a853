//! Request routing decision engine
//!
//! One pass over a parsed request ends in exactly one of a closed set of
//! outcomes: answer locally, hand the request to the forwarding engine, or
//! challenge. Requests asserting a homedomain identity go through the
//! admission controller first.

use super::admission::{AdmissionController, PstnAuth, RegisterAuth};
use super::auth::{AuthHeaderKind, AuthVerdict, CredentialsVerifier};
use super::builder::ResponseBuilder;
use super::digest::{format_challenge_header, DigestEngine};
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use super::policy::{AddressPolicy, ClassRules, DenyReason};
use super::registrar::Registrar;
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::UserId;
use async_trait::async_trait;
use rsip::{Header, Uri};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a request ends up
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDecision {
    /// The request is addressed to this proxy itself
    Me,
    /// Send to a location we looked up, stay in the transaction
    Proxy(Uri),
    /// Hand off toward a foreign destination
    Relay(Uri),
    /// Tell the sender to go elsewhere
    Redirect(Uri),
    /// Route via a named next hop, keeping the original request URI
    Forward { host: String, port: u16 },
    /// Answer with a specific status
    Response { code: u16, reason: String },
    /// Internal failure
    Error(u16),
    /// No lookup produced anything
    NotFound,
}

/// What the location database knows about a user URI
#[derive(Debug, Clone, PartialEq)]
pub enum UserLocation {
    /// User known and registered somewhere
    Located(RoutingDecision),
    /// User known but nothing is registered
    NoRegistration,
    /// Not a user of ours
    NoSuchUser,
}

/// Location and dial-plan lookup oracle
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocationLookup: Send + Sync {
    /// Registered location of a homedomain user URI
    async fn lookup_user(&self, uri: &Uri) -> Result<UserLocation, DomainError>;

    /// Dial-plan entry for a homedomain URI that is not a user
    async fn lookup_homedomain_url(&self, uri: &Uri)
        -> Result<Option<RoutingDecision>, DomainError>;

    /// Last-resort telephone number interpretation of a user part
    async fn lookup_potn(&self, number: &str) -> Result<Option<RoutingDecision>, DomainError>;

    /// Dial-plan entry for a remote URI
    async fn lookup_remote_url(&self, uri: &Uri) -> Result<Option<RoutingDecision>, DomainError>;

    /// Catch-all destination when every lookup came up empty
    async fn lookup_default(&self, uri: &Uri) -> Result<Option<RoutingDecision>, DomainError>;

    /// The user currently registered at the given contact, if any
    async fn user_with_contact(&self, uri: &Uri) -> Result<Option<UserId>, DomainError>;
}

/// Default lookup wiring: the in-memory registrar plus the user directory
pub struct DefaultLocations {
    registrar: Arc<Registrar>,
    directory: Arc<dyn crate::domain::user::UserDirectory>,
}

impl DefaultLocations {
    pub fn new(
        registrar: Arc<Registrar>,
        directory: Arc<dyn crate::domain::user::UserDirectory>,
    ) -> Self {
        Self {
            registrar,
            directory,
        }
    }
}

#[async_trait]
impl LocationLookup for DefaultLocations {
    async fn lookup_user(&self, uri: &Uri) -> Result<UserLocation, DomainError> {
        let Some(owners) = self.directory.users_for_url(uri).await else {
            return Ok(UserLocation::NoSuchUser);
        };
        let Some(user) = owners.into_iter().next() else {
            return Ok(UserLocation::NoSuchUser);
        };
        let Some(bindings) = self.registrar.bindings_for(&user).await else {
            return Ok(UserLocation::NoRegistration);
        };
        for binding in bindings {
            if let Ok(contact) = Uri::try_from(binding.contact.as_str()) {
                return Ok(UserLocation::Located(RoutingDecision::Proxy(contact)));
            }
        }
        Ok(UserLocation::NoRegistration)
    }

    async fn lookup_homedomain_url(
        &self,
        _uri: &Uri,
    ) -> Result<Option<RoutingDecision>, DomainError> {
        Ok(None)
    }

    async fn lookup_potn(&self, _number: &str) -> Result<Option<RoutingDecision>, DomainError> {
        Ok(None)
    }

    async fn lookup_remote_url(&self, _uri: &Uri) -> Result<Option<RoutingDecision>, DomainError> {
        Ok(None)
    }

    async fn lookup_default(&self, _uri: &Uri) -> Result<Option<RoutingDecision>, DomainError> {
        Ok(None)
    }

    async fn user_with_contact(&self, uri: &Uri) -> Result<Option<UserId>, DomainError> {
        Ok(self.registrar.user_with_contact(uri).await)
    }
}

/// Forwarding instruction handed to the transport / forwarding engine
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchTarget {
    Proxy(Uri),
    Relay(Uri),
    /// Stateless pass-through to the request URI (ACK)
    Stateless,
}

/// The single outcome of routing one request
#[derive(Debug)]
pub enum RoutingAction {
    Respond(SipResponse),
    Dispatch {
        target: DispatchTarget,
        request: SipRequest,
    },
}

/// Engine configuration, resolved once at startup
#[derive(Debug, Clone)]
pub struct RoutingEngineConfig {
    pub homedomains: Vec<String>,
    pub record_route: bool,
    /// Host this proxy names itself as in Record-Route
    pub local_host: String,
    pub always_verify_homedomain_user: bool,
    pub peer_secret: Option<String>,
}

struct Resolution {
    decision: RoutingDecision,
    /// Set when the decision came out of the telephone number fallback;
    /// such destinations pass PSTN admission before anything leaves
    potn_number: Option<String>,
}

/// Routing decision engine
pub struct RoutingEngine {
    config: RoutingEngineConfig,
    digest: Arc<DigestEngine>,
    verifier: Arc<CredentialsVerifier>,
    admission: Arc<AdmissionController>,
    policy: AddressPolicy,
    locations: Arc<dyn LocationLookup>,
    registrar: Arc<Registrar>,
    class_rules: Arc<ClassRules>,
}

impl RoutingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RoutingEngineConfig,
        digest: Arc<DigestEngine>,
        verifier: Arc<CredentialsVerifier>,
        admission: Arc<AdmissionController>,
        policy: AddressPolicy,
        locations: Arc<dyn LocationLookup>,
        registrar: Arc<Registrar>,
        class_rules: Arc<ClassRules>,
    ) -> Self {
        Self {
            config,
            digest,
            verifier,
            admission,
            policy,
            locations,
            registrar,
            class_rules,
        }
    }

    fn is_homedomain(&self, host: &str) -> bool {
        self.config
            .homedomains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(host))
    }

    fn is_homedomain_uri(&self, uri: &Uri) -> bool {
        self.is_homedomain(&uri.host_with_port.host.to_string())
    }

    /// Route one request to its single outcome
    pub async fn handle(&self, request: SipRequest) -> Result<RoutingAction, SipError> {
        let Some(method) = request.method() else {
            warn!("Request with unsupported method");
            return self.respond(&request, 501);
        };

        match method {
            SipMethod::Register if self.is_homedomain_uri(request.uri()) => {
                self.handle_register(request).await
            }
            SipMethod::Ack => {
                // No transaction state for ACK, pass it along as-is
                debug!("Forwarding ACK statelessly");
                Ok(RoutingAction::Dispatch {
                    target: DispatchTarget::Stateless,
                    request,
                })
            }
            _ => self.handle_generic(request, method).await,
        }
    }

    async fn handle_register(&self, mut request: SipRequest) -> Result<RoutingAction, SipError> {
        request.strip_record_route();

        let to_url = request
            .to_uri()
            .ok_or_else(|| SipError::InvalidMessage("REGISTER without To".to_string()))?;

        match self.admission.can_register(&request, &to_url).await? {
            RegisterAuth::Allowed { user } => {
                let contacts = request.contact_uris();
                let requested = request.expires();
                let active = self.registrar.bind(&user, &contacts, requested).await;

                let mut builder = ResponseBuilder::ok();
                for (contact, expires) in &active {
                    builder = builder.header(Header::Contact(
                        format!("<{}>;expires={}", contact, expires).into(),
                    ));
                }
                info!("REGISTER ok for {} ({} bindings)", user, active.len());
                Ok(RoutingAction::Respond(builder.build_for_request(&request)?))
            }
            RegisterAuth::Stale { user } => {
                debug!("REGISTER from {} with stale nonce", user);
                self.challenge(&request, false, true)
            }
            RegisterAuth::Forbidden {
                user,
                reason: DenyReason::Eperm,
            } => {
                info!("REGISTER: {} does not own {}", user, to_url);
                self.respond(&request, 403)
            }
            RegisterAuth::Forbidden {
                user,
                reason: DenyReason::NoMatch,
            } => {
                info!("REGISTER: nobody owns {} (user {})", to_url, user);
                self.respond(&request, 404)
            }
            RegisterAuth::Unauthenticated => {
                if request.header_values("Authorization").is_empty() {
                    debug!("REGISTER without credentials, challenging");
                } else {
                    info!("REGISTER with invalid credentials, challenging");
                }
                self.challenge(&request, false, false)
            }
        }
    }

    async fn handle_generic(
        &self,
        request: SipRequest,
        method: SipMethod,
    ) -> Result<RoutingAction, SipError> {
        // CANCEL targets an existing transaction; it cannot carry
        // credentials the original request did not
        let mut caller_authenticated = false;
        if method != SipMethod::Cancel && self.config.always_verify_homedomain_user {
            if let Some(from) = request.from_uri() {
                if self.is_homedomain_uri(&from) {
                    match self
                        .verifier
                        .verify(&request, AuthHeaderKind::Proxy, method.as_str())
                        .await?
                    {
                        AuthVerdict::Authenticated(user) => {
                            if !self.policy.can_use_address(&user, &from).await.is_allowed() {
                                info!("{} may not use From address {}", user, from);
                                return self.respond(&request, 403);
                            }
                            caller_authenticated = true;
                        }
                        AuthVerdict::Stale(user) => {
                            debug!("Stale proxy credentials from {}", user);
                            return self.challenge(&request, true, true);
                        }
                        _ => {
                            debug!("Homedomain From {} without valid credentials", from);
                            return self.challenge(&request, true, false);
                        }
                    }
                }
            }
        }

        let resolution = self.resolve_destination(&request, method).await?;
        self.apply_decision(request, method, resolution, caller_authenticated)
            .await
    }

    async fn resolve_destination(
        &self,
        request: &SipRequest,
        method: SipMethod,
    ) -> Result<Resolution, SipError> {
        let uri = request.uri().clone();
        if self.is_homedomain_uri(&uri) {
            self.route_homedomain(request, method, uri, false).await
        } else {
            self.route_remote(&uri).await
        }
    }

    /// True when the request is addressed to the proxy itself
    fn is_request_to_me(&self, method: SipMethod, uri: &Uri, request: &SipRequest) -> bool {
        let has_user = uri
            .auth
            .as_ref()
            .map(|a| !a.user.is_empty())
            .unwrap_or(false);
        if !has_user {
            return true;
        }
        if method == SipMethod::Options {
            let max_forwards = request.max_forwards().unwrap_or(70).min(255);
            if max_forwards.saturating_sub(1) < 1 {
                debug!("OPTIONS with exhausted Max-Forwards is for us");
                return true;
            }
        }
        false
    }

    // Boxed for the one permitted level of recursion through the
    // homedomain dial plan
    fn route_homedomain<'a>(
        &'a self,
        request: &'a SipRequest,
        method: SipMethod,
        uri: Uri,
        recursing: bool,
    ) -> Pin<Box<dyn Future<Output = Result<Resolution, SipError>> + Send + 'a>> {
        Box::pin(async move {
            if self.is_request_to_me(method, &uri, request) {
                return Ok(Resolution {
                    decision: RoutingDecision::Me,
                    potn_number: None,
                });
            }

            match self.locations.lookup_user(&uri).await? {
                UserLocation::Located(decision) => Ok(Resolution {
                    decision,
                    potn_number: None,
                }),
                UserLocation::NoRegistration => Ok(Resolution {
                    decision: RoutingDecision::Response {
                        code: 480,
                        reason: "Users location currently unknown".to_string(),
                    },
                    potn_number: None,
                }),
                UserLocation::NoSuchUser => {
                    if let Some(decision) = self.locations.lookup_homedomain_url(&uri).await? {
                        // Follow one homedomain indirection, then stop; a
                        // dial plan pointing at itself must not loop us
                        if !recursing {
                            if let RoutingDecision::Proxy(new_uri) = &decision {
                                if self.is_homedomain_uri(new_uri) && *new_uri != uri {
                                    debug!("Homedomain dial plan points at {}, following", new_uri);
                                    return self
                                        .route_homedomain(request, method, new_uri.clone(), true)
                                        .await;
                                }
                            }
                        }
                        return Ok(Resolution {
                            decision,
                            potn_number: None,
                        });
                    }

                    // Last resort: read the user part as a telephone number
                    if let Some(number) = uri.auth.as_ref().map(|a| a.user.clone()) {
                        if let Some(decision) = self.locations.lookup_potn(&number).await? {
                            return Ok(Resolution {
                                decision,
                                potn_number: Some(number),
                            });
                        }
                    }

                    if let Some(decision) = self.locations.lookup_default(&uri).await? {
                        return Ok(Resolution {
                            decision,
                            potn_number: None,
                        });
                    }

                    Ok(Resolution {
                        decision: RoutingDecision::NotFound,
                        potn_number: None,
                    })
                }
            }
        })
    }

    async fn route_remote(&self, uri: &Uri) -> Result<Resolution, SipError> {
        if let Some(decision) = self.locations.lookup_remote_url(uri).await? {
            return Ok(Resolution {
                decision,
                potn_number: None,
            });
        }

        // A UA of ours registered at exactly that contact gets the request
        // directly, anyone else is a relay hop away
        let decision = if self.locations.user_with_contact(uri).await?.is_some() {
            RoutingDecision::Proxy(uri.clone())
        } else {
            RoutingDecision::Relay(uri.clone())
        };
        Ok(Resolution {
            decision,
            potn_number: None,
        })
    }

    async fn apply_decision(
        &self,
        mut request: SipRequest,
        method: SipMethod,
        resolution: Resolution,
        caller_authenticated: bool,
    ) -> Result<RoutingAction, SipError> {
        let mut relay_authorized = caller_authenticated;

        // Telephone destinations pass PSTN admission before anything leaves
        if let Some(number) = &resolution.potn_number {
            let from = request
                .from_uri()
                .ok_or_else(|| SipError::InvalidMessage("request without From".to_string()))?;
            match self
                .admission
                .pstn_call_check_auth(
                    &request,
                    method.as_str(),
                    &from,
                    Some(number),
                    &self.class_rules,
                )
                .await?
            {
                PstnAuth::Allowed { user, class } => {
                    debug!("PSTN call to class {} admitted", class);
                    if let (Some(user), Some(secret)) = (&user, &self.config.peer_secret) {
                        // Vouch for the caller toward the next proxy
                        let uri = request.uri().to_string();
                        self.admission.add_peer_auth(
                            &mut request,
                            method.as_str(),
                            &uri,
                            user,
                            secret,
                        );
                    }
                    relay_authorized = true;
                }
                PstnAuth::Stale { user, .. } => {
                    debug!("PSTN caller {} has stale credentials", user);
                    return self.challenge(&request, true, true);
                }
                PstnAuth::Denied { user: Some(user), class } => {
                    info!("PSTN call to class {} denied for {}", class, user);
                    return self.respond(&request, 403);
                }
                PstnAuth::Denied { user: None, .. } => {
                    return self.challenge(&request, true, false);
                }
            }
        }

        match resolution.decision {
            RoutingDecision::Me => match method {
                SipMethod::Options => self.respond(&request, 200),
                _ => {
                    // We hold no dialog state to match this against
                    self.respond(&request, 481)
                }
            },
            RoutingDecision::Proxy(uri) => match self.prepare_forward(&mut request) {
                Err(code) => self.respond(&request, code),
                Ok(()) => Ok(RoutingAction::Dispatch {
                    target: DispatchTarget::Proxy(uri),
                    request,
                }),
            },
            RoutingDecision::Relay(uri) => {
                if !relay_authorized && !matches!(method, SipMethod::Cancel | SipMethod::Bye) {
                    match self
                        .verifier
                        .verify(&request, AuthHeaderKind::Proxy, method.as_str())
                        .await?
                    {
                        AuthVerdict::Authenticated(_) => {}
                        AuthVerdict::Stale(_) => return self.challenge(&request, true, true),
                        _ => return self.challenge(&request, true, false),
                    }
                }
                match self.prepare_forward(&mut request) {
                    Err(code) => self.respond(&request, code),
                    Ok(()) => Ok(RoutingAction::Dispatch {
                        target: DispatchTarget::Relay(uri),
                        request,
                    }),
                }
            }
            RoutingDecision::Redirect(uri) => {
                let response = ResponseBuilder::new(302)
                    .header(Header::Contact(format!("<{}>", uri).into()))
                    .build_for_request(&request)?;
                Ok(RoutingAction::Respond(response))
            }
            RoutingDecision::Forward { host, port } => {
                // Route via the named hop, keep the original request URI
                request.prepend_route(&format!("<sip:{}:{};lr>", host, port));
                let uri = request.uri().clone();
                match self.prepare_forward(&mut request) {
                    Err(code) => self.respond(&request, code),
                    Ok(()) => Ok(RoutingAction::Dispatch {
                        target: DispatchTarget::Proxy(uri),
                        request,
                    }),
                }
            }
            RoutingDecision::Response { code, reason } => {
                info!("Answering {} {}", code, reason);
                self.respond(&request, code)
            }
            RoutingDecision::Error(code) => self.respond(&request, code),
            RoutingDecision::NotFound => self.respond(&request, 404),
        }
    }

    /// Decrement Max-Forwards and stamp Record-Route; `Err` carries the
    /// response code that stops the request instead
    fn prepare_forward(&self, request: &mut SipRequest) -> Result<(), u16> {
        let max_forwards = request.max_forwards().unwrap_or(70).min(255);
        let decremented = max_forwards.saturating_sub(1);
        if decremented == 0 {
            debug!("Max-Forwards exhausted");
            return Err(483);
        }
        request.set_max_forwards(decremented);

        if self.config.record_route {
            let mut headers: Vec<Header> = vec![Header::RecordRoute(
                format!("<sip:{};lr>", self.config.local_host).into(),
            )];
            headers.extend(request.inner.headers.iter().cloned());
            request.inner.headers = rsip::Headers::from(headers);
        }
        Ok(())
    }

    fn respond(&self, request: &SipRequest, code: u16) -> Result<RoutingAction, SipError> {
        Ok(RoutingAction::Respond(
            ResponseBuilder::new(code).build_for_request(request)?,
        ))
    }

    fn challenge(
        &self,
        request: &SipRequest,
        proxy: bool,
        stale: bool,
    ) -> Result<RoutingAction, SipError> {
        let challenge = self.digest.new_challenge();
        let value = format_challenge_header(&challenge, stale);
        let (code, header) = if proxy {
            (407, "Proxy-Authenticate")
        } else {
            (401, "WWW-Authenticate")
        };
        Ok(RoutingAction::Respond(
            ResponseBuilder::new(code)
                .raw_header(header, &value)
                .build_for_request(request)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassRule;
    use crate::domain::shared::clock::FixedClock;
    use crate::domain::shared::value_objects::NumberClass;
    use crate::domain::user::directory::MockUserDirectory;
    use crate::domain::user::UserDirectory;
    use crate::infrastructure::protocols::sip::digest::{compute_response, format_auth_header};
    use crate::infrastructure::protocols::sip::policy::IdentityRewriter;
    use crate::infrastructure::protocols::sip::test_messages::build_request;

    const SECRET: &str = "toomanysecrets";
    const REALM: &str = "example.org";
    const NOW: i64 = 11_000_000;
    const OPAQUE: &str = "00a7d8c0";

    fn mock_directory() -> Arc<dyn UserDirectory> {
        let mut mock = MockUserDirectory::new();
        mock.expect_canonify().returning(|username| match username {
            "ft.test" => Some(UserId::from("ft.test")),
            "other.user" => Some(UserId::from("other.user")),
            _ => None,
        });
        mock.expect_password_for().returning(|user| match user.as_str() {
            "ft.test" => Some("foo".to_string()),
            "other.user" => Some("bar".to_string()),
            _ => None,
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
        mock.expect_classes_for_user().returning(|user| {
            if user.as_str() == "ft.test" {
                Some(vec![NumberClass::National])
            } else {
                None
            }
        });
        Arc::new(mock)
    }

    fn engine_with(locations: MockLocationLookup) -> (RoutingEngine, Arc<Registrar>) {
        engine_at(NOW, locations)
    }

    fn engine_at(now: i64, locations: MockLocationLookup) -> (RoutingEngine, Arc<Registrar>) {
        let clock = Arc::new(FixedClock::at_unix(now));
        let digest = Arc::new(DigestEngine::new(REALM, SECRET, clock.clone()));
        let directory = mock_directory();
        let verifier = Arc::new(CredentialsVerifier::new(
            digest.clone(),
            directory.clone(),
            Some("peerpass".to_string()),
            clock.clone(),
        ));
        let registrar = Arc::new(Registrar::new(clock));
        let class_rules = Arc::new(
            ClassRules::compile(&[ClassRule {
                pattern: "^08".to_string(),
                class: "national".to_string(),
            }])
            .unwrap(),
        );
        let admission = Arc::new(AdmissionController::new(
            verifier.clone(),
            AddressPolicy::new(directory.clone()),
            directory.clone(),
            digest.clone(),
            Arc::new(IdentityRewriter),
            vec![],
        ));
        let engine = RoutingEngine::new(
            RoutingEngineConfig {
                homedomains: vec!["example.org".to_string()],
                record_route: false,
                local_host: "proxy.example.org".to_string(),
                always_verify_homedomain_user: true,
                peer_secret: Some("peerpass".to_string()),
            },
            digest,
            verifier,
            admission,
            AddressPolicy::new(directory.clone()),
            Arc::new(locations),
            registrar.clone(),
            class_rules,
        );
        (engine, registrar)
    }

    fn auth_value(
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
    ) -> String {
        let clock = Arc::new(FixedClock::at_unix(NOW));
        let engine = DigestEngine::new(REALM, SECRET, clock);
        let nonce = engine.make_nonce(OPAQUE);
        let response =
            compute_response(&nonce, method, uri, username, Some(password), REALM).unwrap();
        format_auth_header(
            "Digest", username, REALM, uri, &response, &nonce, OPAQUE, "md5",
        )
    }

    fn respond_code(action: RoutingAction) -> u16 {
        match action {
            RoutingAction::Respond(response) => response.status_code(),
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_options_without_user_part_is_for_me() {
        let (engine, _) = engine_with(MockLocationLookup::new());
        let request = build_request(
            "OPTIONS",
            "sip:example.org",
            "sip:visitor@elsewhere.test",
            &[],
            b"",
        );
        assert_eq!(respond_code(engine.handle(request).await.unwrap()), 200);
    }

    #[tokio::test]
    async fn test_invite_to_me_has_no_dialog() {
        let (engine, _) = engine_with(MockLocationLookup::new());
        let request = build_request(
            "INVITE",
            "sip:example.org",
            "sip:visitor@elsewhere.test",
            &[],
            b"",
        );
        assert_eq!(respond_code(engine.handle(request).await.unwrap()), 481);
    }

    #[tokio::test]
    async fn test_options_with_exhausted_max_forwards_is_for_me() {
        let (engine, _) = engine_with(MockLocationLookup::new());
        let request = build_request(
            "OPTIONS",
            "sip:op@example.org",
            "sip:visitor@elsewhere.test",
            &[("Max-Forwards", "1")],
            b"",
        );
        assert_eq!(respond_code(engine.handle(request).await.unwrap()), 200);
    }

    #[tokio::test]
    async fn test_nothing_found_is_404() {
        let mut locations = MockLocationLookup::new();
        locations
            .expect_lookup_user()
            .returning(|_| Ok(UserLocation::NoSuchUser));
        locations
            .expect_lookup_homedomain_url()
            .returning(|_| Ok(None));
        locations.expect_lookup_potn().returning(|_| Ok(None));
        locations.expect_lookup_default().returning(|_| Ok(None));

        let (engine, _) = engine_with(locations);
        let request = build_request(
            "INVITE",
            "sip:ghost@example.org",
            "sip:visitor@elsewhere.test",
            &[],
            b"",
        );
        assert_eq!(respond_code(engine.handle(request).await.unwrap()), 404);
    }

    #[tokio::test]
    async fn test_register_without_credentials_gets_challenged() {
        let (engine, _) = engine_with(MockLocationLookup::new());
        let request = build_request(
            "REGISTER",
            "sip:example.org",
            "sip:ft@example.org",
            &[],
            b"",
        );

        let action = engine.handle(request).await.unwrap();
        let RoutingAction::Respond(response) = action else {
            panic!("expected a response");
        };
        assert_eq!(response.status_code(), 401);
        let challenge = response.header_value("WWW-Authenticate").unwrap();
        assert!(challenge.contains("realm=\"example.org\""));
        assert!(challenge.contains("opaque="));
        assert!(!challenge.contains("stale=true"));
    }

    #[tokio::test]
    async fn test_register_binds_and_answers_200() {
        let (engine, registrar) = engine_with(MockLocationLookup::new());
        let auth = auth_value("ft.test", "foo", "REGISTER", "sip:example.org");
        let request = build_request(
            "REGISTER",
            "sip:example.org",
            "sip:ft@example.org",
            &[
                ("Authorization", &auth),
                ("Contact", "<sip:ft@192.0.2.10:5060>"),
                ("Expires", "600"),
            ],
            b"",
        );

        let action = engine.handle(request).await.unwrap();
        let RoutingAction::Respond(response) = action else {
            panic!("expected a response");
        };
        assert_eq!(response.status_code(), 200);
        let contact = response.header_value("Contact").unwrap();
        assert!(contact.contains("expires=600"));

        let bindings = registrar
            .bindings_for(&UserId::from("ft.test"))
            .await
            .unwrap();
        assert_eq!(bindings.len(), 1);
    }

    #[tokio::test]
    async fn test_register_with_stale_nonce() {
        let (engine, _) = engine_at(NOW + 31, MockLocationLookup::new());
        let auth = auth_value("ft.test", "foo", "REGISTER", "sip:example.org");
        let request = build_request(
            "REGISTER",
            "sip:example.org",
            "sip:ft@example.org",
            &[("Authorization", &auth)],
            b"",
        );

        let action = engine.handle(request).await.unwrap();
        let RoutingAction::Respond(response) = action else {
            panic!("expected a response");
        };
        assert_eq!(response.status_code(), 401);
        assert!(response
            .header_value("WWW-Authenticate")
            .unwrap()
            .contains("stale=true"));
    }

    #[tokio::test]
    async fn test_register_unowned_address_is_404() {
        let (engine, _) = engine_with(MockLocationLookup::new());
        let auth = auth_value("ft.test", "foo", "REGISTER", "sip:example.org");
        let request = build_request(
            "REGISTER",
            "sip:example.org",
            "sip:ghost@example.org",
            &[("Authorization", &auth)],
            b"",
        );
        // nobody owns ghost at all
        assert_eq!(respond_code(engine.handle(request).await.unwrap()), 404);
    }

    #[tokio::test]
    async fn test_register_someone_elses_address_is_403() {
        let (engine, _) = engine_with(MockLocationLookup::new());
        let auth = auth_value("other.user", "bar", "REGISTER", "sip:example.org");
        let request = build_request(
            "REGISTER",
            "sip:example.org",
            "sip:ft@example.org",
            &[("Authorization", &auth)],
            b"",
        );
        // ft@example.org belongs to ft.test, not to other.user
        assert_eq!(respond_code(engine.handle(request).await.unwrap()), 403);
    }

    #[tokio::test]
    async fn test_homedomain_from_needs_proxy_credentials() {
        let (engine, _) = engine_with(MockLocationLookup::new());
        let request = build_request(
            "INVITE",
            "sip:bob@elsewhere.test",
            "sip:ft@example.org",
            &[],
            b"",
        );

        let action = engine.handle(request).await.unwrap();
        let RoutingAction::Respond(response) = action else {
            panic!("expected a response");
        };
        assert_eq!(response.status_code(), 407);
        assert!(response.header_value("Proxy-Authenticate").is_some());
    }

    #[tokio::test]
    async fn test_located_user_is_proxied() {
        let mut locations = MockLocationLookup::new();
        locations.expect_lookup_user().returning(|_| {
            Ok(UserLocation::Located(RoutingDecision::Proxy(
                Uri::try_from("sip:ft@192.0.2.10:5060").unwrap(),
            )))
        });
        let (engine, _) = engine_with(locations);

        let request = build_request(
            "INVITE",
            "sip:ft@example.org",
            "sip:visitor@elsewhere.test",
            &[],
            b"",
        );
        let action = engine.handle(request).await.unwrap();
        match action {
            RoutingAction::Dispatch {
                target: DispatchTarget::Proxy(uri),
                request,
            } => {
                assert!(uri.to_string().contains("192.0.2.10"));
                // Max-Forwards was decremented on the way out
                assert_eq!(request.max_forwards(), Some(69));
            }
            other => panic!("expected proxy dispatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_known_user_without_registration_is_480() {
        let mut locations = MockLocationLookup::new();
        locations
            .expect_lookup_user()
            .returning(|_| Ok(UserLocation::NoRegistration));
        let (engine, _) = engine_with(locations);

        let request = build_request(
            "INVITE",
            "sip:ft@example.org",
            "sip:visitor@elsewhere.test",
            &[],
            b"",
        );
        assert_eq!(respond_code(engine.handle(request).await.unwrap()), 480);
    }

    #[tokio::test]
    async fn test_potn_fallback_without_credentials_is_challenged() {
        let mut locations = MockLocationLookup::new();
        locations
            .expect_lookup_user()
            .returning(|_| Ok(UserLocation::NoSuchUser));
        locations
            .expect_lookup_homedomain_url()
            .returning(|_| Ok(None));
        locations.expect_lookup_potn().returning(|_| {
            Ok(Some(RoutingDecision::Relay(
                Uri::try_from("sip:08123456@gw.example.net").unwrap(),
            )))
        });
        let (engine, _) = engine_with(locations);

        let request = build_request(
            "INVITE",
            "sip:08123456@example.org",
            "sip:visitor@elsewhere.test",
            &[],
            b"",
        );
        let action = engine.handle(request).await.unwrap();
        let RoutingAction::Respond(response) = action else {
            panic!("expected a response");
        };
        assert_eq!(response.status_code(), 407);
    }

    #[tokio::test]
    async fn test_potn_fallback_admitted_and_vouched_for() {
        let mut locations = MockLocationLookup::new();
        locations
            .expect_lookup_user()
            .returning(|_| Ok(UserLocation::NoSuchUser));
        locations
            .expect_lookup_homedomain_url()
            .returning(|_| Ok(None));
        locations.expect_lookup_potn().returning(|_| {
            Ok(Some(RoutingDecision::Relay(
                Uri::try_from("sip:08123456@gw.example.net").unwrap(),
            )))
        });
        let (engine, _) = engine_with(locations);

        let auth = auth_value("ft.test", "foo", "INVITE", "sip:ft@example.org");
        let request = build_request(
            "INVITE",
            "sip:08123456@example.org",
            "sip:ft@example.org",
            &[("Proxy-Authorization", &auth)],
            b"",
        );
        let action = engine.handle(request).await.unwrap();
        match action {
            RoutingAction::Dispatch {
                target: DispatchTarget::Relay(_),
                request,
            } => {
                // the peer trust header went on for the next hop
                assert!(request.header_value("X-Yxa-Peer-Auth").is_some());
            }
            other => panic!("expected relay dispatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_relay_needs_credentials_but_bye_does_not() {
        let mut locations = MockLocationLookup::new();
        locations.expect_lookup_remote_url().returning(|_| Ok(None));
        locations.expect_user_with_contact().returning(|_| Ok(None));
        let (engine, _) = engine_with(locations);

        let invite = build_request(
            "INVITE",
            "sip:bob@elsewhere.test",
            "sip:visitor@elsewhere.test",
            &[],
            b"",
        );
        assert_eq!(respond_code(engine.handle(invite).await.unwrap()), 407);

        let bye = build_request(
            "BYE",
            "sip:bob@elsewhere.test",
            "sip:visitor@elsewhere.test",
            &[],
            b"",
        );
        let action = engine.handle(bye).await.unwrap();
        assert!(matches!(
            action,
            RoutingAction::Dispatch {
                target: DispatchTarget::Relay(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_remote_contact_of_registered_user_is_proxied() {
        let mut locations = MockLocationLookup::new();
        locations.expect_lookup_remote_url().returning(|_| Ok(None));
        locations
            .expect_user_with_contact()
            .returning(|_| Ok(Some(UserId::from("ft.test"))));
        let (engine, _) = engine_with(locations);

        let request = build_request(
            "INVITE",
            "sip:ft@198.51.100.7:5060",
            "sip:visitor@elsewhere.test",
            &[],
            b"",
        );
        let action = engine.handle(request).await.unwrap();
        assert!(matches!(
            action,
            RoutingAction::Dispatch {
                target: DispatchTarget::Proxy(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_homedomain_dialplan_recurses_at_most_once() {
        let mut locations = MockLocationLookup::new();
        locations
            .expect_lookup_user()
            .returning(|_| Ok(UserLocation::NoSuchUser));
        locations.expect_lookup_homedomain_url().returning(|uri| {
            let rendered = uri.to_string();
            if rendered.contains("alias@") {
                // second hop points onward; must not be followed again
                Ok(Some(RoutingDecision::Proxy(
                    Uri::try_from("sip:final@example.org").unwrap(),
                )))
            } else {
                Ok(Some(RoutingDecision::Proxy(
                    Uri::try_from("sip:alias@example.org").unwrap(),
                )))
            }
        });
        let (engine, _) = engine_with(locations);

        let request = build_request(
            "INVITE",
            "sip:start@example.org",
            "sip:visitor@elsewhere.test",
            &[],
            b"",
        );
        let action = engine.handle(request).await.unwrap();
        match action {
            RoutingAction::Dispatch {
                target: DispatchTarget::Proxy(uri),
                ..
            } => assert!(uri.to_string().contains("final@")),
            other => panic!("expected proxy dispatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_redirect_decision_becomes_302() {
        let mut locations = MockLocationLookup::new();
        locations
            .expect_lookup_user()
            .returning(|_| Ok(UserLocation::NoSuchUser));
        locations.expect_lookup_homedomain_url().returning(|_| {
            Ok(Some(RoutingDecision::Redirect(
                Uri::try_from("sip:ft@pool.example.org").unwrap(),
            )))
        });
        let (engine, _) = engine_with(locations);

        let request = build_request(
            "INVITE",
            "sip:ft2@example.org",
            "sip:visitor@elsewhere.test",
            &[],
            b"",
        );
        let action = engine.handle(request).await.unwrap();
        let RoutingAction::Respond(response) = action else {
            panic!("expected a response");
        };
        assert_eq!(response.status_code(), 302);
        assert!(response
            .header_value("Contact")
            .unwrap()
            .contains("pool.example.org"));
    }

    #[tokio::test]
    async fn test_forward_decision_prepends_route() {
        let mut locations = MockLocationLookup::new();
        locations
            .expect_lookup_user()
            .returning(|_| Ok(UserLocation::NoSuchUser));
        locations.expect_lookup_homedomain_url().returning(|_| {
            Ok(Some(RoutingDecision::Forward {
                host: "sbc.example.org".to_string(),
                port: 5070,
            }))
        });
        let (engine, _) = engine_with(locations);

        let request = build_request(
            "INVITE",
            "sip:ft3@example.org",
            "sip:visitor@elsewhere.test",
            &[],
            b"",
        );
        let action = engine.handle(request).await.unwrap();
        match action {
            RoutingAction::Dispatch {
                target: DispatchTarget::Proxy(uri),
                request,
            } => {
                // original request URI is kept, hop goes into Route
                assert!(uri.to_string().contains("ft3@example.org"));
                let route = request.header_value("Route").unwrap();
                assert!(route.contains("sbc.example.org:5070"));
                assert!(route.contains("lr"));
            }
            other => panic!("expected proxy dispatch, got {:?}", other),
        }
    }
}
