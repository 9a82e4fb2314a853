//! SIP proxy core
//!
//! Request handling is layered the same way requests flow:
//!
//! ```text
//! transport (UDP) -> server dispatch -> routing engine ----> forwarding
//!                                    \-> event server        decisions
//!                                         |
//!                    admission controller +-- presence processor
//!                     |          |
//!            credentials      address & class
//!             verifier          policy
//!                 |
//!            digest engine
//! ```
//!
//! The digest engine, verifier, policy and admission layers are pure
//! decision code over oracle interfaces; the registrar and the presence
//! store are the only shared mutable state.

pub mod admission;
pub mod auth;
pub mod builder;
pub mod digest;
pub mod etag;
pub mod event;
pub mod message;
pub mod policy;
pub mod presence_handler;
pub mod registrar;
pub mod routing;
pub mod server;
pub mod transport;

pub use admission::{AdmissionController, PstnAuth, RegisterAuth};
pub use auth::{AuthHeaderKind, AuthVerdict, CredentialsVerifier, DigestCredentials};
pub use builder::ResponseBuilder;
pub use digest::{Challenge, DigestEngine};
pub use etag::EtagGenerator;
pub use event::EventServer;
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use policy::{AddressCheck, AddressPolicy, ClassRules, DenyReason, NumberRewriter};
pub use presence_handler::{PresenceProcessor, PublishLimits, SubscribeAuth};
pub use registrar::Registrar;
pub use routing::{
    DefaultLocations, DispatchTarget, LocationLookup, RoutingAction, RoutingDecision,
    RoutingEngine, RoutingEngineConfig, UserLocation,
};
pub use server::{ProxyServer, ProxyServerConfig};
pub use transport::UdpTransport;
