//! Mode controller: at most one session at a time

use parking_lot::RwLock;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::audio::{route_event_channel, AudioBackend, AudioDevice, DeviceEvent, PlaybackStats, RouteChangeTrigger};
use crate::config::AppConfig;
use crate::error::{Result, SessionError};
use crate::network::PeerSet;
use crate::session::{LinkSession, RelaySession, SessionMode};

/// Pending route-change events beyond this are coalesced
const ROUTE_EVENT_CAPACITY: usize = 4;

/// Requested role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Host,
    Client,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Host => f.write_str("host"),
            Mode::Client => f.write_str("client"),
        }
    }
}

enum ActiveSession {
    Relaying(RelaySession),
    Linked(LinkSession),
}

impl ActiveSession {
    fn mode(&self) -> SessionMode {
        match self {
            ActiveSession::Relaying(_) => SessionMode::Relaying,
            ActiveSession::Linked(_) => SessionMode::Linked,
        }
    }

    fn device(&self) -> Option<Arc<AudioDevice>> {
        match self {
            ActiveSession::Relaying(session) => session.device(),
            ActiveSession::Linked(session) => session.device(),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ActiveSession::Relaying(session) => session.local_addr(),
            ActiveSession::Linked(session) => session.local_addr(),
        }
    }

    async fn stop(&self) {
        match self {
            ActiveSession::Relaying(session) => session.stop().await,
            ActiveSession::Linked(session) => session.stop().await,
        }
    }
}

struct Active {
    session: ActiveSession,
    route_watch: Option<JoinHandle<()>>,
}

/// Snapshot readable without waiting on start/stop
#[derive(Default)]
struct Status {
    mode: SessionMode,
    peers: Option<Arc<PeerSet>>,
    local_addr: Option<SocketAddr>,
    device: Option<Arc<AudioDevice>>,
}

/// Starts and stops the host or client session and routes device events to it
pub struct SessionController {
    backend: Arc<dyn AudioBackend>,
    config: AppConfig,
    active: Mutex<Option<Active>>,
    status: RwLock<Status>,
    trigger: RouteChangeTrigger,
    events: Arc<Mutex<mpsc::Receiver<DeviceEvent>>>,
}

impl SessionController {
    pub fn new(backend: Arc<dyn AudioBackend>, config: AppConfig) -> Self {
        let (trigger, events) = route_event_channel(ROUTE_EVENT_CAPACITY);
        Self {
            backend,
            config,
            active: Mutex::new(None),
            status: RwLock::new(Status::default()),
            trigger,
            events: Arc::new(Mutex::new(events)),
        }
    }

    /// Start a session in `mode`.
    ///
    /// Client mode needs `address`, either `host`, `host:port` or an IP
    /// literal; the configured port is used when none is given. Host mode
    /// ignores it. Fails if a session is already running.
    pub async fn start(&self, mode: Mode, address: Option<&str>) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            let running = current.session.mode();
            tracing::warn!("Refusing to start {} mode while {}", mode, running);
            return Err(SessionError::AlreadyRunning(running).into());
        }

        // Changes queued while idle are reflected by the route chosen at open
        {
            let mut events = self.events.lock().await;
            while events.try_recv().is_ok() {}
        }

        let session = match mode {
            Mode::Host => {
                if let Some(address) = address {
                    tracing::debug!("Host mode ignores address {}", address);
                }
                let session = RelaySession::new(self.backend.clone(), self.config.clone());
                session.start().await?;
                ActiveSession::Relaying(session)
            }
            Mode::Client => {
                let address = address
                    .map(str::trim)
                    .filter(|address| !address.is_empty())
                    .ok_or(SessionError::MissingAddress)?;
                let remote = resolve_host(address, self.config.network.udp_port).await?;
                let session = LinkSession::new(self.backend.clone(), self.config.clone(), remote);
                session.start().await?;
                ActiveSession::Linked(session)
            }
        };

        let device = session.device();
        let route_watch = device.clone().map(|device| self.spawn_route_watch(device));
        {
            let mut status = self.status.write();
            status.device = device;
            status.mode = session.mode();
            status.local_addr = session.local_addr();
            status.peers = match &session {
                ActiveSession::Relaying(relay) => Some(relay.peers()),
                ActiveSession::Linked(_) => None,
            };
        }
        tracing::info!("Started {} session", session.mode());

        *active = Some(Active { session, route_watch });
        Ok(())
    }

    /// Stop the running session, if any, and wait for it to release its
    /// resources. A no-op when idle.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        let Some(Active { session, route_watch }) = active.take() else {
            tracing::debug!("Stop requested with no session running");
            return;
        };

        if let Some(watch) = route_watch {
            watch.abort();
            let _ = watch.await;
        }
        session.stop().await;

        *self.status.write() = Status::default();
        tracing::info!("Stopped {} session", session.mode());
    }

    /// Number of peers known to the host session; 0 in any other mode.
    /// Never waits on a start or stop in progress.
    pub fn current_peer_count(&self) -> usize {
        self.status.read().peers.as_ref().map_or(0, |peers| peers.len())
    }

    pub fn mode(&self) -> SessionMode {
        self.status.read().mode
    }

    /// Socket address of the running session's transport
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.status.read().local_addr
    }

    /// Playback buffer health of the running session's device
    pub fn playback_stats(&self) -> Option<PlaybackStats> {
        self.status.read().device.as_ref().and_then(|device| device.playback_stats())
    }

    /// Handle for reporting audio routing changes
    pub fn route_trigger(&self) -> RouteChangeTrigger {
        self.trigger.clone()
    }

    /// Restart the device on every routing change until aborted
    fn spawn_route_watch(&self, device: Arc<AudioDevice>) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut events = events.lock().await;
            while let Some(event) = events.recv().await {
                match event {
                    DeviceEvent::RoutingChanged => {
                        tracing::info!("Audio routing changed, restarting device");
                        let device = device.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || device.restart()).await {
                            tracing::error!("Device restart panicked: {}", e);
                        }
                    }
                }
            }
        })
    }
}

/// Resolve a user-supplied host to a socket address
async fn resolve_host(address: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let invalid = |reason: String| {
        tracing::warn!("Cannot resolve '{}': {}", address, reason);
        SessionError::InvalidAddress(address.to_string())
    };

    let has_port = matches!(address.rsplit_once(':'), Some((_, port)) if port.parse::<u16>().is_ok());
    let resolved = if has_port {
        tokio::net::lookup_host(address).await.map(|it| it.collect::<Vec<_>>())
    } else {
        tokio::net::lookup_host((address, default_port))
            .await
            .map(|it| it.collect::<Vec<_>>())
    };

    let mut candidates = resolved.map_err(|e| invalid(e.to_string()))?;
    // Prefer IPv4, LAN hosts rarely listen on v6
    candidates.sort_by_key(|addr| !addr.is_ipv4());
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| invalid("no addresses".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFrame, DeviceRoute, MemoryBackend};
    use crate::error::Error;
    use crate::session::SessionState;
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};
    use tokio::net::UdpSocket;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.network.bind_address = Ipv4Addr::LOCALHOST.into();
        config.network.udp_port = 0;
        config.audio.warmup_ms = 10;
        config
    }

    fn controller(backend: &MemoryBackend) -> SessionController {
        SessionController::new(Arc::new(backend.clone()), test_config())
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_idle_controller() {
        let controller = controller(&MemoryBackend::new());
        assert_eq!(controller.mode(), SessionMode::None);
        assert_eq!(controller.current_peer_count(), 0);
        assert!(controller.local_addr().is_none());
        controller.stop().await;
        assert_eq!(controller.mode(), SessionMode::None);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let backend = MemoryBackend::new();
        let controller = controller(&backend);
        controller.start(Mode::Host, None).await.unwrap();
        assert_eq!(controller.mode(), SessionMode::Relaying);

        let again = controller.start(Mode::Client, Some("127.0.0.1")).await;
        assert!(matches!(
            again,
            Err(Error::Session(SessionError::AlreadyRunning(SessionMode::Relaying)))
        ));
        assert_eq!(controller.mode(), SessionMode::Relaying);
        assert_eq!(backend.open_count(), 1);

        controller.stop().await;
        assert_eq!(controller.mode(), SessionMode::None);
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_client_requires_valid_address() {
        let controller = controller(&MemoryBackend::new());
        assert!(matches!(
            controller.start(Mode::Client, None).await,
            Err(Error::Session(SessionError::MissingAddress))
        ));
        assert!(matches!(
            controller.start(Mode::Client, Some("  ")).await,
            Err(Error::Session(SessionError::MissingAddress))
        ));
        assert!(matches!(
            controller.start(Mode::Client, Some("not a host name!")).await,
            Err(Error::Session(SessionError::InvalidAddress(_)))
        ));
        assert_eq!(controller.mode(), SessionMode::None);
    }

    #[tokio::test]
    async fn test_resolve_uses_default_port() {
        assert_eq!(
            resolve_host("192.168.1.20", 5000).await.unwrap(),
            "192.168.1.20:5000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_host("10.0.0.2:6000", 5000).await.unwrap(),
            "10.0.0.2:6000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(resolve_host("localhost", 5000).await.unwrap().port(), 5000);
    }

    #[tokio::test]
    async fn test_failed_start_leaves_controller_idle() {
        let backend = MemoryBackend::new();
        backend.fail_next_opens(1);
        let controller = controller(&backend);

        assert!(matches!(controller.start(Mode::Host, None).await, Err(Error::Audio(_))));
        assert_eq!(controller.mode(), SessionMode::None);

        controller.start(Mode::Host, None).await.unwrap();
        assert_eq!(controller.mode(), SessionMode::Relaying);
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_host_and_client_talk_through_relay() {
        let host_audio = MemoryBackend::new();
        let host = controller(&host_audio);
        host.start(Mode::Host, None).await.unwrap();
        let host_addr = host.local_addr().unwrap();

        let client_audio = MemoryBackend::new();
        let client = controller(&client_audio);
        client.start(Mode::Client, Some(&host_addr.to_string())).await.unwrap();
        assert_eq!(client.mode(), SessionMode::Linked);
        assert_eq!(client.current_peer_count(), 0);

        let spoken = AudioFrame::from_samples(&[11i16; 320]);
        assert!(client_audio.push_capture(spoken.clone()));
        assert!(eventually(|| host.current_peer_count() == 1).await);
        assert!(eventually(|| host_audio.played().contains(&spoken)).await);

        let answer = AudioFrame::from_samples(&[-11i16; 320]);
        assert!(host_audio.push_capture(answer.clone()));
        assert!(eventually(|| client_audio.played().contains(&answer)).await);

        client.stop().await;
        host.stop().await;
        assert_eq!(host.current_peer_count(), 0);
    }

    #[tokio::test]
    async fn test_route_change_restarts_device_and_keeps_peers() {
        let backend = MemoryBackend::new();
        let controller = controller(&backend);
        controller.start(Mode::Host, None).await.unwrap();
        let addr = controller.local_addr().unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&[0, 0], addr).await.unwrap();
        assert!(eventually(|| controller.current_peer_count() == 1).await);
        assert_eq!(backend.forced_route(), Some(DeviceRoute::BuiltinEarpiece));

        backend.set_routes(vec![DeviceRoute::BuiltinSpeaker, DeviceRoute::WiredHeadset]);
        controller.route_trigger().notify();

        assert!(eventually(|| backend.open_count() == 2).await);
        assert_eq!(backend.forced_route(), Some(DeviceRoute::WiredHeadset));
        assert_eq!(controller.current_peer_count(), 1);
        assert_eq!(controller.mode(), SessionMode::Relaying);

        controller.stop().await;
        assert!(!backend.has_open_stream());
    }

    #[tokio::test]
    async fn test_route_change_right_after_start_is_honoured() {
        let backend = MemoryBackend::new();
        let controller = controller(&backend);
        controller.start(Mode::Host, None).await.unwrap();

        // No await between start returning and the notification
        backend.set_routes(vec![DeviceRoute::WiredHeadset]);
        controller.route_trigger().notify();

        assert!(eventually(|| backend.open_count() == 2).await);
        assert_eq!(backend.forced_route(), Some(DeviceRoute::WiredHeadset));
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_changes_while_idle_are_discarded() {
        let backend = MemoryBackend::new();
        let controller = controller(&backend);
        controller.route_trigger().notify();

        controller.start(Mode::Host, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.open_count(), 1);
        controller.stop().await;
    }

    #[tokio::test]
    async fn test_playback_stats_only_while_running() {
        let backend = MemoryBackend::new();
        let controller = controller(&backend);
        assert!(controller.playback_stats().is_none());

        controller.start(Mode::Host, None).await.unwrap();
        assert_eq!(controller.playback_stats(), Some(PlaybackStats::default()));

        controller.stop().await;
        assert!(controller.playback_stats().is_none());
    }

    #[tokio::test]
    async fn test_stop_is_bounded_mid_receive() {
        let backend = MemoryBackend::new();
        let controller = controller(&backend);
        controller.start(Mode::Client, Some("127.0.0.1:9")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let begun = Instant::now();
        controller.stop().await;
        assert!(begun.elapsed() < Duration::from_secs(1));
        assert_eq!(controller.mode(), SessionMode::None);
        assert!(!backend.has_open_stream());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let backend = MemoryBackend::new();
        let controller = controller(&backend);

        controller.start(Mode::Host, None).await.unwrap();
        controller.stop().await;
        controller.start(Mode::Host, None).await.unwrap();
        assert_eq!(controller.mode(), SessionMode::Relaying);
        controller.stop().await;
        assert_eq!(backend.open_count(), 2);
    }

    #[test]
    fn test_session_state_is_exposed() {
        let session = RelaySession::new(Arc::new(MemoryBackend::new()), test_config());
        assert_eq!(session.state(), SessionState::Idle);
    }
}
