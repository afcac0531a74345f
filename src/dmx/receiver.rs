//! DMX frame receiver
//!
//! Feeds transport frames into a `ChannelGroup` and notifies a single
//! registered callback when a frame changed something the orchestrator acts
//! on. Link availability comes from the transport and is tracked separately
//! from value activity: a console can hold steady values while still
//! transmitting.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::{ACTIVITY_WINDOW, INTERFACE_POLL, JOIN_TIMEOUT};
use crate::dmx::channel::ChannelGroup;
use crate::error::NetworkError;
use crate::network::interfaces::{physical_ipv4_addrs, InterfaceMonitor};
use crate::network::transport::{FrameTransport, TransportEvent};

/// Callback invoked with a snapshot of the group after a relevant change
pub type UpdateCallback = Arc<dyn Fn(&ChannelGroup) + Send + Sync>;

type InterfaceSnapshot = Arc<dyn Fn() -> BTreeSet<Ipv4Addr> + Send + Sync>;

/// State shared with the transport's delivery thread
struct Shared {
    universe: u16,
    group: Mutex<ChannelGroup>,
    callback: RwLock<Option<UpdateCallback>>,
    available: AtomicBool,
    last_change: Mutex<Option<Instant>>,
}

impl Shared {
    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Frame { universe, data } if universe == self.universe => {
                let snapshot = {
                    let mut group = self.group.lock();
                    group.update(&data);
                    if !group.has_relevant_change() {
                        return;
                    }
                    *self.last_change.lock() = Some(Instant::now());
                    group.clone()
                };

                let callback = self.callback.read().clone();
                if let Some(callback) = callback {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(&snapshot))).is_err() {
                        tracing::error!("DMX: update callback panicked");
                    }
                }
            }
            TransportEvent::Availability { universe, available } if universe == self.universe => {
                let was = self.available.swap(available, Ordering::SeqCst);
                if available && !was {
                    tracing::info!("sACN universe {} available", universe);
                } else if !available && was {
                    tracing::warn!("sACN universe {} timed out", universe);
                }
            }
            _ => {}
        }
    }
}

/// Receives DMX for one universe and decodes it at a base address
pub struct FrameReceiver {
    shared: Arc<Shared>,
    transport: Arc<dyn FrameTransport>,
    interfaces: InterfaceSnapshot,
    interface_poll: Duration,
    monitor: Mutex<Option<InterfaceMonitor>>,
    started: AtomicBool,
}

impl FrameReceiver {
    pub fn new(transport: Arc<dyn FrameTransport>, universe: u16, address: u16) -> Self {
        Self {
            shared: Arc::new(Shared {
                universe,
                group: Mutex::new(ChannelGroup::new(address)),
                callback: RwLock::new(None),
                available: AtomicBool::new(false),
                last_change: Mutex::new(None),
            }),
            transport,
            interfaces: Arc::new(physical_ipv4_addrs),
            interface_poll: INTERFACE_POLL,
            monitor: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Replace the interface address source used by the monitor
    pub fn with_interface_source<F>(mut self, poll: Duration, snapshot: F) -> Self
    where
        F: Fn() -> BTreeSet<Ipv4Addr> + Send + Sync + 'static,
    {
        self.interfaces = Arc::new(snapshot);
        self.interface_poll = poll;
        self
    }

    pub fn universe(&self) -> u16 {
        self.shared.universe
    }

    /// Register the update callback, replacing any previous one
    pub fn on_update<F>(&self, callback: F)
    where
        F: Fn(&ChannelGroup) + Send + Sync + 'static,
    {
        *self.shared.callback.write() = Some(Arc::new(callback));
    }

    /// Start the transport, join the universe's multicast group and begin
    /// watching network interfaces.
    pub fn start(&self) -> Result<(), NetworkError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = self.shared.clone();
        let started = self
            .transport
            .start(Arc::new(move |event| shared.handle_event(event)))
            .and_then(|()| self.transport.join_multicast(self.shared.universe));
        if let Err(e) = started {
            self.started.store(false, Ordering::SeqCst);
            self.transport.stop();
            return Err(e);
        }

        let transport = self.transport.clone();
        let universe = self.shared.universe;
        let interfaces = self.interfaces.clone();
        match InterfaceMonitor::start(
            self.interface_poll,
            move || interfaces(),
            move |_change| rejoin_multicast(transport.as_ref(), universe),
        ) {
            Ok(monitor) => *self.monitor.lock() = Some(monitor),
            Err(e) => tracing::warn!("Failed to start interface monitor: {}", e),
        }

        tracing::info!("sACN receiver started on universe {}", universe);
        Ok(())
    }

    /// Stop the monitor, leave multicast and stop the transport. Idempotent.
    pub fn stop(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop(JOIN_TIMEOUT);
        }
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.transport.leave_multicast(self.shared.universe) {
            tracing::debug!("sACN: leave on stop failed: {}", e);
        }
        self.transport.stop();
        self.shared.available.store(false, Ordering::SeqCst);
        tracing::info!("sACN receiver stopped");
    }

    /// Packets are arriving on our universe (transport-level availability)
    pub fn is_receiving(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    /// A relevant value changed within the activity window
    pub fn is_active(&self) -> bool {
        self.shared
            .last_change
            .lock()
            .map_or(false, |t| t.elapsed() < ACTIVITY_WINDOW)
    }

    /// At least one frame has been decoded
    pub fn has_received(&self) -> bool {
        self.shared.group.lock().has_received()
    }

    /// Snapshot of the channel group
    pub fn channels(&self) -> ChannelGroup {
        self.shared.group.lock().clone()
    }

    /// Feed an event as if it came from the transport
    pub fn handle_event(&self, event: TransportEvent) {
        self.shared.handle_event(event);
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn rejoin_multicast(transport: &dyn FrameTransport, universe: u16) {
    if let Err(e) = transport.leave_multicast(universe) {
        tracing::debug!("sACN: leave before rejoin failed: {}", e);
    }
    match transport.join_multicast(universe) {
        Ok(()) => tracing::info!("sACN: multicast rejoined on universe {}", universe),
        Err(e) => tracing::warn!("sACN: rejoin failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::frame_at;
    use crate::mock::ManualTransport;
    use std::sync::atomic::AtomicUsize;

    fn receiver(transport: &Arc<ManualTransport>) -> FrameReceiver {
        FrameReceiver::new(transport.clone(), 1, 10)
            .with_interface_source(Duration::from_secs(60), BTreeSet::new)
    }

    #[test]
    fn test_start_joins_multicast() {
        let transport = ManualTransport::new();
        let rx = receiver(&transport);
        rx.start().unwrap();
        rx.start().unwrap();
        assert_eq!(transport.joins(), vec![1]);
        rx.stop();
    }

    #[test]
    fn test_callback_only_on_relevant_change() {
        let transport = ManualTransport::new();
        let rx = receiver(&transport);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        rx.on_update(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        rx.start().unwrap();

        let frame = frame_at(10, &[1, 0, 0, 255, 255]);
        transport.send_frame(1, frame);
        transport.send_frame(1, frame);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rx.is_active());

        transport.send_frame(1, frame_at(10, &[1, 0, 0, 128, 255]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ignores_other_universes() {
        let transport = ManualTransport::new();
        let rx = receiver(&transport);
        rx.start().unwrap();
        transport.send_frame(2, frame_at(10, &[5]));
        transport.set_available(2, true);
        assert!(!rx.has_received());
        assert!(!rx.is_receiving());
    }

    #[test]
    fn test_availability_tracks_transport() {
        let transport = ManualTransport::new();
        let rx = receiver(&transport);
        rx.start().unwrap();
        assert!(!rx.is_receiving());
        transport.set_available(1, true);
        assert!(rx.is_receiving());
        transport.set_available(1, false);
        assert!(!rx.is_receiving());
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let transport = ManualTransport::new();
        let rx = receiver(&transport);
        rx.on_update(|_| panic!("boom"));
        rx.start().unwrap();
        transport.send_frame(1, frame_at(10, &[3]));
        assert_eq!(rx.channels().file_index(), 3);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let transport = ManualTransport::new();
        let rx = receiver(&transport);
        rx.stop();
        rx.start().unwrap();
        rx.stop();
        rx.stop();
        assert_eq!(transport.leaves(), vec![1]);
        assert_eq!(transport.stop_count(), 1);
    }

    #[test]
    fn test_rejoins_on_interface_change() {
        let transport = ManualTransport::new();
        let addrs = Arc::new(Mutex::new(BTreeSet::from([Ipv4Addr::new(10, 0, 0, 5)])));
        let source = addrs.clone();
        let rx = FrameReceiver::new(transport.clone(), 1, 1)
            .with_interface_source(Duration::from_millis(10), move || source.lock().clone());
        rx.start().unwrap();

        addrs.lock().insert(Ipv4Addr::new(192, 168, 0, 5));
        let deadline = Instant::now() + Duration::from_secs(2);
        while transport.joins().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(transport.joins(), vec![1, 1]);
        assert_eq!(transport.leaves(), vec![1]);
        rx.stop();
    }
}
