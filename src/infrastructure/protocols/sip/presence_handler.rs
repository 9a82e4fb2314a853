//! Presence event state processor (RFC 3903, RFC 3856)
//!
//! PUBLISH creates or conditionally refreshes presence state, NOTIFY is
//! absorbed as a fresh publication, and SUBSCRIBE admission plus NOTIFY
//! body synthesis live here too. Authentication has already happened by
//! the time this code runs; the event server hands us the user.

use super::builder::ResponseBuilder;
use super::etag::EtagGenerator;
use super::message::{SipError, SipRequest, SipResponse};
use crate::config::PresenceConfig;
use crate::domain::presence::{PidfStore, PidfStoreError, Presentity, PresenceDocument};
use crate::domain::shared::clock::Clock;
use crate::domain::shared::value_objects::UserId;
use chrono::Duration;
use rsip::Header;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Publication expiry bounds, resolved from configuration
#[derive(Debug, Clone)]
pub struct PublishLimits {
    pub min: u32,
    pub max: u32,
    pub default: u32,
}

impl From<&PresenceConfig> for PublishLimits {
    fn from(config: &PresenceConfig) -> Self {
        Self {
            min: config.min_publish,
            max: config.max_publish,
            default: config.default_publish,
        }
    }
}

/// SUBSCRIBE admission outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeAuth {
    /// No valid credentials; challenge the subscriber
    NeedAuth,
    /// Subscription is active right away (200)
    Active,
    /// Address-form presentity awaits promotion (202)
    Pending,
    /// No acceptable document type (406)
    UnsupportedAccept,
}

/// PUBLISH/NOTIFY event state machine for the presence package
pub struct PresenceProcessor {
    store: Arc<dyn PidfStore>,
    etags: EtagGenerator,
    limits: PublishLimits,
    clock: Arc<dyn Clock>,
}

impl PresenceProcessor {
    pub fn new(
        store: Arc<dyn PidfStore>,
        etags: EtagGenerator,
        limits: PublishLimits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            etags,
            limits,
            clock,
        }
    }

    /// Clamp a requested expiry to the configured bounds
    ///
    /// `Err` carries the minimum to advertise in a 423. Zero passes
    /// through: it means removal, not a short-lived publication.
    pub fn clamp_expires(&self, requested: Option<u32>) -> Result<u32, u32> {
        match requested {
            None => Ok(self.limits.default),
            Some(0) => Ok(0),
            Some(e) if e < self.limits.min => Err(self.limits.min),
            Some(e) => Ok(e.min(self.limits.max)),
        }
    }

    /// Handle PUBLISH for an authenticated user
    pub async fn handle_publish(
        &self,
        request: &SipRequest,
        user: &UserId,
    ) -> Result<SipResponse, SipError> {
        let if_match = request.sip_if_match();
        if if_match.len() > 1 {
            debug!("PUBLISH from {} with multiple SIP-If-Match values", user);
            return self.respond(request, 400);
        }

        let expires = match self.clamp_expires(request.expires()) {
            Ok(expires) => expires,
            Err(min) => {
                return Ok(ResponseBuilder::new(423)
                    .raw_header("Min-Expires", &min.to_string())
                    .build_for_request(request)?)
            }
        };

        match if_match.first() {
            Some(etag) => self.refresh(request, user, etag, expires).await,
            None => self.create(request, user, expires).await,
        }
    }

    /// Conditional refresh: the body stays, the tag rotates
    async fn refresh(
        &self,
        request: &SipRequest,
        user: &UserId,
        etag: &str,
        expires: u32,
    ) -> Result<SipResponse, SipError> {
        // RFC 3903: a refresh must not carry a body
        if !request.body().is_empty() {
            debug!("PUBLISH refresh from {} with a body", user);
            return self.respond(request, 400);
        }

        if !self.store.exists(user, etag).await {
            debug!("PUBLISH refresh from {} with unknown etag {}", user, etag);
            return self.respond(request, 412);
        }

        if expires == 0 {
            match self.store.remove(user, etag).await {
                Ok(()) => {
                    info!("Publication {} of {} removed", etag, user);
                    Ok(ResponseBuilder::ok()
                        .header(Header::Expires("0".into()))
                        .build_for_request(request)?)
                }
                Err(_) => self.respond(request, 412),
            }
        } else {
            let new_etag = self.etags.generate();
            let expires_at = self.clock.now() + Duration::seconds(i64::from(expires));
            match self.store.refresh(user, etag, &new_etag, expires_at).await {
                Ok(()) => Ok(ResponseBuilder::ok()
                    .raw_header("SIP-ETag", &new_etag)
                    .header(Header::Expires(expires.to_string().into()))
                    .build_for_request(request)?),
                Err(PidfStoreError::NoSuchEtag) => self.respond(request, 412),
                Err(err) => {
                    warn!("Presence store refused a refresh: {}", err);
                    self.respond(request, 500)
                }
            }
        }
    }

    /// Initial publication under a fresh tag
    async fn create(
        &self,
        request: &SipRequest,
        user: &UserId,
        expires: u32,
    ) -> Result<SipResponse, SipError> {
        let content_types = request.content_types();
        if content_types.len() != 1 {
            debug!(
                "PUBLISH from {} with {} Content-Type headers",
                user,
                content_types.len()
            );
            return self.respond(request, 400);
        }

        let etag = self.etags.generate();
        let expires_at = self.clock.now() + Duration::seconds(i64::from(expires));
        match self
            .store
            .set(user, &etag, expires_at, &content_types[0], request.body())
            .await
        {
            Ok(()) => {
                info!("Publication {} of {} stored", etag, user);
                Ok(ResponseBuilder::ok()
                    .raw_header("SIP-ETag", &etag)
                    .header(Header::Expires(expires.to_string().into()))
                    .build_for_request(request)?)
            }
            Err(PidfStoreError::UnsupportedContentType) => Ok(ResponseBuilder::new(406)
                .raw_header("Accept", &self.supported_list())
                .build_for_request(request)?),
            Err(PidfStoreError::UnknownContentType) => self.respond(request, 406),
            Err(PidfStoreError::BadXml(reason)) => {
                debug!("PUBLISH from {} with a bad body: {}", user, reason);
                Ok(ResponseBuilder::new(400)
                    .raw_header("Accept", &self.supported_list())
                    .build_for_request(request)?)
            }
            Err(err) => {
                warn!("Presence store refused a publication: {}", err);
                self.respond(request, 500)
            }
        }
    }

    /// Absorb a NOTIFY as a fresh publication for the presentity
    pub async fn handle_notify(
        &self,
        request: &SipRequest,
        presentity: &UserId,
    ) -> Result<SipResponse, SipError> {
        let expires = match self.clamp_expires(request.expires()) {
            Ok(expires) => expires,
            Err(min) => {
                return Ok(ResponseBuilder::new(423)
                    .raw_header("Min-Expires", &min.to_string())
                    .build_for_request(request)?)
            }
        };
        self.create(request, presentity, expires).await
    }

    /// Admission for a presence subscription
    pub fn subscribe_admission(
        &self,
        authenticated: bool,
        presentity: &Presentity,
        accept: &[String],
    ) -> SubscribeAuth {
        if !authenticated {
            return SubscribeAuth::NeedAuth;
        }

        if !accept.is_empty() {
            let supported = self.store.supported_types();
            let compatible = accept
                .iter()
                .any(|a| supported.iter().any(|s| s.eq_ignore_ascii_case(a)));
            if !compatible {
                return SubscribeAuth::UnsupportedAccept;
            }
        }

        match presentity {
            Presentity::Users(_) => SubscribeAuth::Active,
            Presentity::Address(_) => SubscribeAuth::Pending,
        }
    }

    /// Synthesize the document for an outgoing NOTIFY
    ///
    /// A single user gets their latest published state, or a fake offline
    /// document when nothing is published. Address-form presentities get
    /// fake offline. Multi-user presentities produce no body.
    pub async fn notify_body(
        &self,
        presentity: &Presentity,
        accept: &[String],
    ) -> Option<PresenceDocument> {
        match presentity {
            Presentity::Users(users) if users.len() == 1 => {
                match self.store.get_xml(&users[0], accept).await {
                    Some(doc) => Some(doc),
                    None => Some(fake_offline_pidf(users[0].as_str())),
                }
            }
            Presentity::Users(_) => None,
            Presentity::Address(address) => Some(fake_offline_pidf(address)),
        }
    }

    pub fn supported_list(&self) -> String {
        self.store.supported_types().join(", ")
    }

    fn respond(&self, request: &SipRequest, code: u16) -> Result<SipResponse, SipError> {
        Ok(ResponseBuilder::new(code).build_for_request(request)?)
    }
}

/// A minimal closed-status PIDF document for an entity we know nothing about
pub fn fake_offline_pidf(entity: &str) -> PresenceDocument {
    let entity = if entity.starts_with("sip:") || entity.starts_with("sips:") || entity.starts_with("pres:") {
        entity.to_string()
    } else {
        format!("pres:{}", entity)
    };
    PresenceDocument {
        content_type: "application/pidf+xml".to_string(),
        body: format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <presence xmlns=\"urn:ietf:params:xml:ns:pidf\" entity=\"{}\">\n\
             <tuple id=\"offline\"><status><basic>closed</basic></status></tuple>\n\
             </presence>\n",
            entity
        ),
    }
}
