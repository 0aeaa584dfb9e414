//! Client-side transport with one fixed remote peer

use bytes::Bytes;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::udp::{create_socket, Endpoint, Transport};

/// UDP socket connected to a single host
pub struct OriginatorTransport {
    endpoint: Endpoint,
    remote: SocketAddr,
}

impl OriginatorTransport {
    /// Bind an ephemeral local port and connect it to `remote`
    pub async fn connect(remote: SocketAddr, config: &NetworkConfig) -> Result<Self, NetworkError> {
        let local = if remote.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };

        let endpoint = Endpoint::new(create_socket(local, config)?, config.max_datagram_size)?;
        endpoint
            .socket()
            .connect(remote)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", remote, e)))?;

        tracing::info!("Connected to {}", remote);
        Ok(Self { endpoint, remote })
    }

    /// Send one datagram to the remote. Empty payloads are skipped.
    pub async fn send(&self, payload: &[u8]) -> Result<(), NetworkError> {
        if payload.is_empty() {
            return Ok(());
        }
        self.endpoint.check_outgoing(payload)?;

        let sent = self
            .endpoint
            .socket()
            .send(payload)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        if sent != payload.len() {
            return Err(NetworkError::SendFailed(format!(
                "short send: {} of {} bytes",
                sent,
                payload.len()
            )));
        }
        Ok(())
    }

    /// Wait for the next datagram from the remote.
    ///
    /// Returns an empty buffer when the transport is closed or the receive
    /// fails; this never errors.
    pub async fn receive(&self) -> Bytes {
        match self.endpoint.recv_from().await {
            Ok((payload, _)) => payload,
            Err(NetworkError::Closed) => Bytes::new(),
            Err(e) => {
                tracing::debug!("Receive from {} failed: {}", self.remote, e);
                Bytes::new()
            }
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn max_datagram_size(&self) -> usize {
        self.endpoint.max_datagram()
    }
}

impl Transport for OriginatorTransport {
    fn close(&self) {
        if self.endpoint.close() {
            tracing::debug!("Closed transport to {}", self.remote);
        }
    }

    fn is_closed(&self) -> bool {
        self.endpoint.is_closed()
    }

    fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.endpoint.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    async fn host_socket() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn test_payload_arrives_intact() {
        let (host, host_addr) = host_socket().await;
        let client = OriginatorTransport::connect(host_addr, &NetworkConfig::default())
            .await
            .unwrap();

        let mut buf = vec![0u8; 9000];
        for len in [2usize, 640, 8192] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
            client.send(&payload).await.unwrap();

            let (n, from) = host.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &payload[..]);
            assert_eq!(from.port(), client.local_addr().unwrap().port());

            host.send_to(&payload, from).await.unwrap();
            assert_eq!(client.receive().await, Bytes::from(payload));
        }
    }

    #[tokio::test]
    async fn test_empty_and_oversized_sends() {
        let (host, host_addr) = host_socket().await;
        let client = OriginatorTransport::connect(host_addr, &NetworkConfig::default())
            .await
            .unwrap();

        client.send(&[]).await.unwrap();
        assert!(matches!(
            client.send(&vec![0u8; 8194]).await,
            Err(NetworkError::PacketTooLarge(8194))
        ));

        let mut buf = [0u8; 16];
        let nothing = tokio::time::timeout(Duration::from_millis(100), host.recv_from(&mut buf)).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_close_unblocks_receive() {
        let (_host, host_addr) = host_socket().await;
        let client = Arc::new(
            OriginatorTransport::connect(host_addr, &NetworkConfig::default())
                .await
                .unwrap(),
        );

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close();
        client.close();

        let received = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty());
        assert!(client.is_closed());
        assert!(matches!(client.send(&[0, 0]).await, Err(NetworkError::Closed)));
    }
}
