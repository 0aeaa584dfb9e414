//! Network subsystem for UDP voice transport

pub mod originator;
pub mod peers;
pub mod relay;
pub mod udp;

pub use originator::OriginatorTransport;
pub use peers::{PeerAddress, PeerSet};
pub use relay::{BroadcastReport, RelayTransport};
pub use udp::{create_socket, Transport};
