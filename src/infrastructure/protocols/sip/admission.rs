//! Admission control
//!
//! Composes credential verdicts with address ownership and destination
//! class policy into the request-level decisions the routing engine acts
//! on: may this user register this address, may this call leave for the
//! PSTN, and the outgoing side of the peer-proxy trust channel.

use super::auth::{AuthHeaderKind, AuthVerdict, CredentialsVerifier};
use super::digest::{digest_response, format_auth_header, DigestEngine};
use super::message::{SipError, SipRequest};
use super::policy::{AddressCheck, AddressPolicy, ClassRules, DenyReason, NumberRewriter};
use crate::domain::shared::value_objects::{NumberClass, UserId};
use crate::domain::user::UserDirectory;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of a registration admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterAuth {
    /// Authenticated and the user owns the address being bound
    Allowed { user: UserId },
    /// Authenticated but the address belongs elsewhere, or to nobody
    Forbidden { user: UserId, reason: DenyReason },
    /// Arithmetic fine, nonce aged out; challenge again with stale=true
    Stale { user: UserId },
    /// No or invalid credentials
    Unauthenticated,
}

/// Outcome of a PSTN admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PstnAuth {
    Allowed {
        user: Option<UserId>,
        class: NumberClass,
    },
    Denied {
        user: Option<UserId>,
        class: NumberClass,
    },
    Stale {
        user: UserId,
        class: NumberClass,
    },
}

/// Combines verdicts and policy into per-request admission decisions
pub struct AdmissionController {
    verifier: Arc<CredentialsVerifier>,
    policy: AddressPolicy,
    directory: Arc<dyn UserDirectory>,
    engine: Arc<DigestEngine>,
    rewriter: Arc<dyn NumberRewriter>,
    unauth_classes: Vec<NumberClass>,
}

impl AdmissionController {
    pub fn new(
        verifier: Arc<CredentialsVerifier>,
        policy: AddressPolicy,
        directory: Arc<dyn UserDirectory>,
        engine: Arc<DigestEngine>,
        rewriter: Arc<dyn NumberRewriter>,
        unauth_classes: Vec<NumberClass>,
    ) -> Self {
        Self {
            verifier,
            policy,
            directory,
            engine,
            rewriter,
            unauth_classes,
        }
    }

    /// Registration admission
    ///
    /// Ownership is checked against To, not From: registering on behalf of
    /// a third party is fine as long as the registering user owns the
    /// address being bound.
    pub async fn can_register(
        &self,
        request: &SipRequest,
        to_url: &rsip::Uri,
    ) -> Result<RegisterAuth, SipError> {
        match self
            .verifier
            .verify(request, AuthHeaderKind::Register, "REGISTER")
            .await?
        {
            AuthVerdict::Authenticated(user) => {
                match self.policy.can_use_address(&user, to_url).await {
                    AddressCheck::Allowed => Ok(RegisterAuth::Allowed { user }),
                    AddressCheck::Denied(reason) => {
                        info!("{} may not register {}: {:?}", user, to_url, reason);
                        Ok(RegisterAuth::Forbidden { user, reason })
                    }
                }
            }
            AuthVerdict::Stale(user) => Ok(RegisterAuth::Stale { user }),
            _ => Ok(RegisterAuth::Unauthenticated),
        }
    }

    /// PSTN call admission
    pub async fn pstn_call_check_auth(
        &self,
        request: &SipRequest,
        method: &str,
        from_url: &rsip::Uri,
        to_number: Option<&str>,
        rules: &ClassRules,
    ) -> Result<PstnAuth, SipError> {
        // Normalize to E.164; on rewrite failure the input stands
        let number = to_number.map(|n| {
            self.rewriter
                .rewrite_to_e164(n)
                .unwrap_or_else(|_| n.to_string())
        });
        let class = rules.classify(number.as_deref());

        if self.unauth_classes.contains(&class) {
            // Destination needs no authentication, but a local user must
            // still own the From address they assert
            if let Some(user) = self.directory.user_with_address(from_url).await {
                let allowed = self
                    .policy
                    .can_use_address(&user, from_url)
                    .await
                    .is_allowed();
                return Ok(if allowed {
                    PstnAuth::Allowed {
                        user: Some(user),
                        class,
                    }
                } else {
                    PstnAuth::Denied {
                        user: Some(user),
                        class,
                    }
                });
            }
            debug!(
                "Unauthenticated destination class {} for foreign caller",
                class
            );
            return Ok(PstnAuth::Allowed { user: None, class });
        }

        match self.verifier.verify_pstn(request, method).await? {
            AuthVerdict::Rejected => Ok(PstnAuth::Denied { user: None, class }),
            AuthVerdict::Stale(user) => Ok(PstnAuth::Stale { user, class }),
            AuthVerdict::PeerAuthenticated(user) => {
                // Address ownership is the upstream proxy's problem;
                // only the destination class is ours
                let allowed = self
                    .policy
                    .is_allowed_pstn_dst(&user, number.as_deref(), request, &class)
                    .await;
                Ok(if allowed {
                    PstnAuth::Allowed {
                        user: Some(user),
                        class,
                    }
                } else {
                    PstnAuth::Denied {
                        user: Some(user),
                        class,
                    }
                })
            }
            AuthVerdict::Authenticated(user) => {
                let owns_from = self
                    .policy
                    .can_use_address(&user, from_url)
                    .await
                    .is_allowed();
                let dst_allowed = self
                    .policy
                    .is_allowed_pstn_dst(&user, number.as_deref(), request, &class)
                    .await;
                Ok(if owns_from && dst_allowed {
                    PstnAuth::Allowed {
                        user: Some(user),
                        class,
                    }
                } else {
                    info!(
                        "PSTN call denied for {}: owns_from={} class_allowed={}",
                        user, owns_from, dst_allowed
                    );
                    PstnAuth::Denied {
                        user: Some(user),
                        class,
                    }
                })
            }
        }
    }

    /// Vouch for a request we forward to a peer proxy
    ///
    /// Mints a fresh challenge off the local clock, answers it ourselves
    /// with the peer secret and plants the result on the outgoing request.
    pub fn add_peer_auth(
        &self,
        request: &mut SipRequest,
        method: &str,
        uri: &str,
        user: &UserId,
        secret: &str,
    ) {
        let challenge = self.engine.new_challenge();
        let response = digest_response(
            &challenge.nonce,
            method,
            uri,
            user.as_str(),
            secret,
            &challenge.realm,
        );
        let value = format_auth_header(
            "Digest",
            user.as_str(),
            &challenge.realm,
            uri,
            &response,
            &challenge.nonce,
            &challenge.opaque,
            "md5",
        );
        request.set_extension_header(AuthHeaderKind::Peer.header_name(), &value);
    }
}
