//! SIP server - wires the transports to the decision engines
//!
//! One task per incoming request. Event-package methods go to the event
//! server, everything else to the routing engine; forwarding decisions go
//! back out over UDP when the target is a literal address.

use super::builder::ResponseBuilder;
use super::event::EventServer;
use super::message::{SipError, SipMessage, SipRequest};
use super::routing::{DispatchTarget, RoutingAction, RoutingEngine};
use super::transport::{literal_target, IncomingMessage, UdpTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

/// SIP server configuration
#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    pub udp_bind: SocketAddr,
}

/// The proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    transport: Option<UdpTransport>,
    routing: Arc<RoutingEngine>,
    events: Arc<EventServer>,
}

impl ProxyServer {
    pub fn new(
        config: ProxyServerConfig,
        routing: Arc<RoutingEngine>,
        events: Arc<EventServer>,
    ) -> Self {
        Self {
            transport: Some(UdpTransport::new(config.udp_bind)),
            config,
            routing,
            events,
        }
    }

    pub async fn start(&mut self) -> Result<(), SipError> {
        info!("Starting SIP proxy on {}", self.config.udp_bind);

        let Some(transport) = &mut self.transport else {
            return Err(SipError::Internal("server already started".to_string()));
        };
        transport.start().await?;
        let socket = transport
            .socket
            .clone()
            .ok_or_else(|| SipError::TransportError("UDP socket missing".to_string()))?;

        let mut rx = std::mem::replace(transport.receiver(), tokio::sync::mpsc::channel(1).1);
        let routing = self.routing.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            while let Some(incoming) = rx.recv().await {
                let routing = routing.clone();
                let events = events.clone();
                let socket = socket.clone();
                tokio::spawn(async move {
                    if let Err(e) = process_message(incoming, routing, events, socket).await {
                        error!("Error processing message: {}", e);
                    }
                });
            }
        });

        Ok(())
    }
}

async fn process_message(
    incoming: IncomingMessage,
    routing: Arc<RoutingEngine>,
    events: Arc<EventServer>,
    socket: Arc<UdpSocket>,
) -> Result<(), SipError> {
    let request = match incoming.message {
        SipMessage::Request(request) => request,
        SipMessage::Response(response) => {
            // We keep no client transactions; responses pass us by
            debug!(
                "Ignoring response {} from {}",
                response.status_code(),
                incoming.source
            );
            return Ok(());
        }
    };

    let result = dispatch(&request, routing, events).await;
    let action = match result {
        Ok(action) => action,
        Err(e) => {
            // Degrade to the taxonomy's response code (400 or 500)
            warn!("Request handling failed: {}", e);
            RoutingAction::Respond(
                ResponseBuilder::new(e.status_code()).build_for_request(&request)?,
            )
        }
    };

    match action {
        RoutingAction::Respond(response) => {
            UdpTransport::send(&socket, response.to_bytes(), incoming.source).await
        }
        RoutingAction::Dispatch { target, request } => {
            forward(&socket, target, request).await
        }
    }
}

async fn dispatch(
    request: &SipRequest,
    routing: Arc<RoutingEngine>,
    events: Arc<EventServer>,
) -> Result<RoutingAction, SipError> {
    if let Some(method) = request.method() {
        if EventServer::can_handle(method) {
            let response = events.handle_request(request.clone()).await?;
            return Ok(RoutingAction::Respond(response));
        }
    }
    routing.handle(request.clone()).await
}

/// Send a forwarded request toward its target
///
/// Stands in for a full forwarding engine: targets must resolve to
/// literal addresses because this proxy does no DNS.
async fn forward(
    socket: &UdpSocket,
    target: DispatchTarget,
    request: SipRequest,
) -> Result<(), SipError> {
    let uri = match &target {
        DispatchTarget::Proxy(uri) | DispatchTarget::Relay(uri) => uri.clone(),
        DispatchTarget::Stateless => request.uri().clone(),
    };

    let Some(destination) = literal_target(&uri) else {
        warn!("Cannot forward to {} without DNS, dropping", uri);
        return Err(SipError::TransportError(format!(
            "no literal target in {}",
            uri
        )));
    };

    debug!("Forwarding {:?} to {}", request.method(), destination);
    UdpTransport::send(socket, request.to_bytes(), destination).await
}
