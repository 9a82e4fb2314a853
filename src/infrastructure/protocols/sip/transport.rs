//! SIP transport layer - UDP front end
//!
//! The proxy core is transport-agnostic; this is the thin UDP edge that
//! feeds it datagrams and carries its answers and forwarded requests back
//! out. No DNS happens here: a forwarding target must be a literal
//! address or carry a numeric host.

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// UDP transport
pub struct UdpTransport {
    bind_addr: SocketAddr,
    pub socket: Option<Arc<UdpSocket>>,
    tx: mpsc::Sender<IncomingMessage>,
    rx: mpsc::Receiver<IncomingMessage>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            bind_addr,
            socket: None,
            tx,
            rx,
        }
    }

    pub async fn start(&mut self) -> Result<(), SipError> {
        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(e.to_string()))?;
        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        let tx = self.tx.clone();
        tokio::spawn(Self::receive_loop(socket, tx));
        Ok(())
    }

    pub fn receiver(&mut self) -> &mut mpsc::Receiver<IncomingMessage> {
        &mut self.rx
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage { message, source };
                            if let Err(e) = tx.send(incoming).await {
                                error!("Failed to hand incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }

    /// Send raw bytes to a destination
    pub async fn send(
        socket: &UdpSocket,
        data: Bytes,
        destination: SocketAddr,
    ) -> Result<(), SipError> {
        socket
            .send_to(&data, destination)
            .await
            .map_err(|e| SipError::TransportError(e.to_string()))?;
        Ok(())
    }
}

/// Resolve a URI into a literal socket address, without DNS
pub fn literal_target(uri: &rsip::Uri) -> Option<SocketAddr> {
    let host = uri.host_with_port.host.to_string();
    let ip: IpAddr = host.parse().ok()?;
    let port = uri
        .host_with_port
        .port
        .as_ref()
        .map(|p| p.to_string().parse().unwrap_or(5060))
        .unwrap_or(5060);
    Some(SocketAddr::new(ip, port))
}
