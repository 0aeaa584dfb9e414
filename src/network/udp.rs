//! UDP socket setup and the closable endpoint shared by both transport roles

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::config::NetworkConfig;
use crate::error::NetworkError;

/// Create a non-blocking UDP socket bound to `addr`.
///
/// Address reuse is left off so binding a port another process holds fails
/// instead of silently sharing it.
pub fn create_socket(addr: SocketAddr, config: &NetworkConfig) -> Result<std::net::UdpSocket, NetworkError> {
    let bind_err = |e: std::io::Error| NetworkError::BindFailed {
        addr,
        reason: e.to_string(),
    };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;

    if let Err(e) = socket.set_recv_buffer_size(config.socket_buffer_size) {
        tracing::warn!("Could not set receive buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(config.socket_buffer_size) {
        tracing::warn!("Could not set send buffer size: {}", e);
    }

    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;

    Ok(socket.into())
}

/// Operations common to the originator and relay transports
pub trait Transport {
    /// Close the socket side. Idempotent; wakes any pending receive.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn local_addr(&self) -> Result<SocketAddr, NetworkError>;
}

/// Tokio socket plus a close signal that receives race against
pub(crate) struct Endpoint {
    socket: UdpSocket,
    closed: watch::Sender<bool>,
    max_datagram: usize,
}

impl Endpoint {
    pub(crate) fn new(socket: std::net::UdpSocket, max_datagram: usize) -> Result<Self, NetworkError> {
        let socket = UdpSocket::from_std(socket).map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            socket,
            closed,
            max_datagram,
        })
    }

    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub(crate) fn max_datagram(&self) -> usize {
        self.max_datagram
    }

    /// Wait for one datagram, or until the endpoint is closed.
    ///
    /// An oversized datagram is read into `max_datagram + 1` bytes, so the
    /// length carried by `PacketTooLarge` is only a lower bound on its size.
    pub(crate) async fn recv_from(&self) -> Result<(Bytes, SocketAddr), NetworkError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(NetworkError::Closed);
        }

        // One spare byte detects datagrams the OS would otherwise truncate
        let mut buf = vec![0u8; self.max_datagram + 1];

        let received = tokio::select! {
            biased;
            _ = async {
                let _ = closed.wait_for(|c| *c).await;
            } => return Err(NetworkError::Closed),
            result = self.socket.recv_from(&mut buf) => result,
        };

        match received {
            Ok((len, from)) if len > self.max_datagram => {
                tracing::debug!("Oversized datagram ({} bytes) from {}", len, from);
                Err(NetworkError::PacketTooLarge(len))
            }
            Ok((len, from)) => {
                buf.truncate(len);
                Ok((Bytes::from(buf), from))
            }
            Err(e) => Err(NetworkError::ReceiveFailed(e.to_string())),
        }
    }

    pub(crate) fn check_outgoing(&self, payload: &[u8]) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        if payload.len() > self.max_datagram {
            return Err(NetworkError::PacketTooLarge(payload.len()));
        }
        Ok(())
    }

    pub(crate) fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))
    }
}
