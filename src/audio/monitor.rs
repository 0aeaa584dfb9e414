//! Routing-change events
//!
//! Platform glue reports "the audio routing changed" through a
//! [`RouteChangeTrigger`]. [`RouteMonitor`] is a portable source of those
//! events: it polls the backend's route list and fires when it changes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::audio::backend::AudioBackend;
use crate::audio::route::DeviceRoute;

/// Device notification delivered to the session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Headset plugged/unplugged, SCO link up/down, or similar
    RoutingChanged,
}

/// Cloneable zero-argument "routing changed" trigger
#[derive(Clone, Debug)]
pub struct RouteChangeTrigger {
    tx: mpsc::Sender<DeviceEvent>,
}

impl RouteChangeTrigger {
    /// Report a routing change. Bursts coalesce when the queue is full.
    pub fn notify(&self) {
        match self.tx.try_send(DeviceEvent::RoutingChanged) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::trace!("Route change already pending"),
            Err(TrySendError::Closed(_)) => tracing::debug!("Route change dropped, no listener"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bounded event channel feeding the controller
pub fn route_event_channel(capacity: usize) -> (RouteChangeTrigger, mpsc::Receiver<DeviceEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RouteChangeTrigger { tx }, rx)
}

/// Polls available routes and fires the trigger when they change
pub struct RouteMonitor {
    backend: Arc<dyn AudioBackend>,
    trigger: RouteChangeTrigger,
    interval: Duration,
    last: Vec<DeviceRoute>,
}

impl RouteMonitor {
    pub fn new(backend: Arc<dyn AudioBackend>, trigger: RouteChangeTrigger, interval: Duration) -> Self {
        let last = sorted(backend.available_routes());
        Self {
            backend,
            trigger,
            interval,
            last,
        }
    }

    /// Compare the current route list with the last one seen. Returns true
    /// (and fires the trigger) if it changed.
    pub fn poll_once(&mut self) -> bool {
        let current = sorted(self.backend.available_routes());
        if current == self.last {
            return false;
        }
        tracing::info!("Audio routes changed: {:?} -> {:?}", self.last, current);
        self.last = current;
        self.trigger.notify();
        true
    }

    /// Run until the controller side of the trigger goes away
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut monitor = self;
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if monitor.trigger.is_closed() {
                    break;
                }
                // Device enumeration can block on some hosts
                monitor = match tokio::task::spawn_blocking(move || {
                    monitor.poll_once();
                    monitor
                })
                .await
                {
                    Ok(monitor) => monitor,
                    Err(e) => {
                        tracing::error!("Route monitor stopped: {}", e);
                        break;
                    }
                };
            }
        })
    }
}

fn sorted(mut routes: Vec<DeviceRoute>) -> Vec<DeviceRoute> {
    routes.sort();
    routes.dedup();
    routes
}
