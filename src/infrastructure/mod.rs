//! Infrastructure layer - technical implementations
//!
//! This layer contains the SIP protocol machinery: message handling,
//! authentication, admission control, routing and the presence event
//! processor, plus the UDP front end.

pub mod protocols;
