//! Host-side transport: accepts from anyone, rebroadcasts to known peers

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::peers::{PeerAddress, PeerSet};
use crate::network::udp::{create_socket, Endpoint, Transport};

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    /// 1 if the excluded sender was in the snapshot, else 0
    pub excluded: usize,
}

/// UDP socket bound to the well-known port, tracking every sender it hears
pub struct RelayTransport {
    endpoint: Endpoint,
    peers: Arc<PeerSet>,
}

impl RelayTransport {
    pub async fn bind(addr: SocketAddr, config: &NetworkConfig, peers: Arc<PeerSet>) -> Result<Self, NetworkError> {
        let endpoint = Endpoint::new(create_socket(addr, config)?, config.max_datagram_size)?;
        tracing::info!("Relay listening on {}", endpoint.local_addr()?);
        Ok(Self { endpoint, peers })
    }

    /// Wait for the next datagram from any sender and remember the sender.
    ///
    /// Returns `None` when the transport is closed or the receive fails.
    pub async fn receive(&self) -> Option<(Bytes, PeerAddress)> {
        match self.endpoint.recv_from().await {
            Ok((payload, from)) => {
                let peer = PeerAddress::from(from);
                if self.peers.observe(peer) {
                    tracing::info!("New peer connected: {} (total: {})", peer, self.peers.len());
                }
                Some((payload, peer))
            }
            Err(NetworkError::Closed) => None,
            Err(e) => {
                tracing::debug!("Relay receive failed: {}", e);
                None
            }
        }
    }

    /// Send `payload` to every known peer except `exclude`.
    ///
    /// Each peer is attempted independently; a failure is logged and counted
    /// without affecting delivery to the rest.
    pub async fn broadcast(&self, payload: &[u8], exclude: Option<PeerAddress>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        if let Err(e) = self.endpoint.check_outgoing(payload) {
            if !matches!(e, NetworkError::Closed) {
                tracing::warn!("Broadcast skipped: {}", e);
            }
            return report;
        }

        for peer in self.peers.snapshot() {
            if Some(peer) == exclude {
                report.excluded += 1;
                continue;
            }
            match self.endpoint.socket().send_to(payload, peer.socket_addr()).await {
                Ok(_) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!("Broadcast to {} failed: {}", peer, e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl Transport for RelayTransport {
    fn close(&self) {
        if self.endpoint.close() {
            tracing::info!("Relay stopped");
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
    use std::time::Duration;
    use tokio::net::UdpSocket;

    async fn relay() -> (RelayTransport, SocketAddr) {
        let relay = RelayTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            &NetworkConfig::default(),
            Arc::new(PeerSet::new()),
        )
        .await
        .unwrap();
        let addr = relay.local_addr().unwrap();
        (relay, addr)
    }

    async fn peer_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn recv_within(socket: &UdpSocket, ms: u64) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 9000];
        match tokio::time::timeout(Duration::from_millis(ms), socket.recv(&mut buf)).await {
            Ok(Ok(n)) => Some(buf[..n].to_vec()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_repeated_sender_is_one_peer() {
        let (relay, addr) = relay().await;
        let a = peer_socket().await;

        for _ in 0..5 {
            a.send_to(&[1, 2], addr).await.unwrap();
            let (payload, from) = relay.receive().await.unwrap();
            assert_eq!(&payload[..], &[1, 2]);
            assert_eq!(from.socket_addr(), a.local_addr().unwrap());
        }
        assert_eq!(relay.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let (relay, addr) = relay().await;
        let a = peer_socket().await;
        let b = peer_socket().await;

        b.send_to(&[0, 0], addr).await.unwrap();
        relay.receive().await.unwrap();
        a.send_to(&[9, 9, 9, 9], addr).await.unwrap();
        let (payload, sender) = relay.receive().await.unwrap();

        let report = relay.broadcast(&payload, Some(sender)).await;
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0, excluded: 1 });
        assert_eq!(recv_within(&b, 500).await, Some(vec![9, 9, 9, 9]));
        assert_eq!(recv_within(&a, 150).await, None);
    }

    #[tokio::test]
    async fn test_failing_peer_does_not_block_others() {
        let (relay, _) = relay().await;
        let b = peer_socket().await;
        let c = peer_socket().await;

        // An IPv6 destination cannot be reached from this IPv4 socket
        relay.peers().observe(PeerAddress::from("[::1]:7000".parse::<SocketAddr>().unwrap()));
        relay.peers().observe(b.local_addr().unwrap().into());
        relay.peers().observe(c.local_addr().unwrap().into());

        let report = relay.broadcast(&[4, 2], None).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 2);
        assert_eq!(recv_within(&b, 500).await, Some(vec![4, 2]));
        assert_eq!(recv_within(&c, 500).await, Some(vec![4, 2]));
    }

    #[tokio::test]
    async fn test_close_unblocks_receive_and_stops_broadcast() {
        let (relay, _) = relay().await;
        let relay = Arc::new(relay);
        let b = peer_socket().await;
        relay.peers().observe(b.local_addr().unwrap().into());

        let pending = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        relay.close();

        let result = tokio::time::timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert!(result.is_none());
        assert_eq!(relay.broadcast(&[1, 1], None).await, BroadcastReport::default());
        assert_eq!(recv_within(&b, 100).await, None);
    }
}
