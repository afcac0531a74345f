//! Control-frame transport
//!
//! `FrameTransport` is the seam between the DMX layer and the wire. The
//! production implementation receives sACN over a multicast UDP socket and
//! derives per-universe availability from packet arrival, independent of
//! whether any slot value changed.

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::{JOIN_TIMEOUT, NETWORK_DATA_LOSS_TIMEOUT, RECEIVE_POLL, SACN_PORT};
use crate::dmx::DmxFrame;
use crate::error::NetworkError;
use crate::network::interfaces::multicast_capable_addrs;
use crate::network::sacn::{multicast_group, SacnPacket};
use crate::util::Worker;

/// Largest E1.31 data packet
const MAX_PACKET_SIZE: usize = 638;

/// Event delivered on the transport's receive thread
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Level data for a universe
    Frame { universe: u16, data: Box<DmxFrame> },
    /// Universe started or stopped arriving
    Availability { universe: u16, available: bool },
}

/// Handler invoked for every transport event
pub type EventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Source of control frames
pub trait FrameTransport: Send + Sync {
    /// Begin delivering events to `handler`
    fn start(&self, handler: EventHandler) -> Result<(), NetworkError>;

    /// Join the multicast group of a universe
    fn join_multicast(&self, universe: u16) -> Result<(), NetworkError>;

    /// Leave the multicast group of a universe
    fn leave_multicast(&self, universe: u16) -> Result<(), NetworkError>;

    /// Stop delivering events. Must be idempotent.
    fn stop(&self);
}

/// Receive statistics
#[derive(Debug, Default)]
pub struct TransportStats {
    pub packets_received: AtomicU64,
    pub invalid_packets: AtomicU64,
    pub frames_delivered: AtomicU64,
}

/// Snapshot of `TransportStats`
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStatsSnapshot {
    pub packets_received: u64,
    pub invalid_packets: u64,
    pub frames_delivered: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            invalid_packets: self.invalid_packets.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
        }
    }
}

/// Tracks when each universe was last heard from
#[derive(Debug, Default)]
pub struct AvailabilityTracker {
    last_seen: HashMap<u16, Instant>,
    timeout: Duration,
}

impl AvailabilityTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_seen: HashMap::new(),
            timeout,
        }
    }

    /// Record a packet. Returns true if the universe just became available.
    pub fn seen(&mut self, universe: u16, now: Instant) -> bool {
        self.last_seen.insert(universe, now).is_none()
    }

    /// Forget a universe. Returns true if it was available.
    pub fn terminate(&mut self, universe: u16) -> bool {
        self.last_seen.remove(&universe).is_some()
    }

    /// Remove universes silent for longer than the timeout
    pub fn expire(&mut self, now: Instant) -> Vec<u16> {
        let timeout = self.timeout;
        let expired: Vec<u16> = self
            .last_seen
            .iter()
            .filter(|(_, &seen)| now.duration_since(seen) > timeout)
            .map(|(&u, _)| u)
            .collect();
        for universe in &expired {
            self.last_seen.remove(universe);
        }
        expired
    }
}

/// sACN receiver on a multicast UDP socket
pub struct SacnTransport {
    port: u16,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    /// Interfaces each universe's group was joined on
    memberships: Mutex<HashMap<u16, Vec<Ipv4Addr>>>,
    worker: Mutex<Option<Worker>>,
    stats: Arc<TransportStats>,
}

impl SacnTransport {
    pub fn new() -> Self {
        Self::with_port(SACN_PORT)
    }

    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            socket: Mutex::new(None),
            memberships: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
            stats: Arc::new(TransportStats::default()),
        }
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    fn bind(&self) -> Result<UdpSocket, NetworkError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket
            .set_reuse_port(true)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        socket
            .bind(&addr.into())
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

        let socket: UdpSocket = socket.into();
        socket
            .set_read_timeout(Some(RECEIVE_POLL))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        Ok(socket)
    }
}

impl Default for SacnTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn deliver(handler: &EventHandler, event: TransportEvent) {
    if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        tracing::error!("sACN: event handler panicked");
    }
}

fn receive_loop(
    socket: Arc<UdpSocket>,
    handler: EventHandler,
    stats: Arc<TransportStats>,
    stop: crate::util::StopSignal,
) {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let mut tracker = AvailabilityTracker::new(NETWORK_DATA_LOSS_TIMEOUT);

    while !stop.is_set() {
        match socket.recv_from(&mut buf) {
            Ok((len, _from)) => {
                stats.packets_received.fetch_add(1, Ordering::Relaxed);
                match SacnPacket::parse(&buf[..len]) {
                    Ok(packet) => {
                        let universe = packet.universe;
                        if packet.is_terminated() {
                            if tracker.terminate(universe) {
                                deliver(&handler, TransportEvent::Availability { universe, available: false });
                            }
                            continue;
                        }
                        if tracker.seen(universe, Instant::now()) {
                            deliver(&handler, TransportEvent::Availability { universe, available: true });
                        }
                        if packet.is_live_dmx() {
                            stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                            deliver(&handler, TransportEvent::Frame { universe, data: packet.data });
                        }
                    }
                    Err(e) => {
                        stats.invalid_packets.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("sACN: dropped packet: {}", e);
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                tracing::warn!("sACN: receive failed: {}", e);
                if stop.wait(RECEIVE_POLL) {
                    break;
                }
            }
        }

        for universe in tracker.expire(Instant::now()) {
            deliver(&handler, TransportEvent::Availability { universe, available: false });
        }
    }
}

impl FrameTransport for SacnTransport {
    fn start(&self, handler: EventHandler) -> Result<(), NetworkError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let socket = Arc::new(self.bind()?);
        *self.socket.lock() = Some(socket.clone());

        let stats = self.stats.clone();
        let spawned = Worker::spawn("sacn-recv", move |stop| {
            receive_loop(socket, handler, stats, stop)
        })
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        *worker = Some(spawned);
        tracing::info!("sACN socket listening on port {}", self.port);
        Ok(())
    }

    fn join_multicast(&self, universe: u16) -> Result<(), NetworkError> {
        let socket = self.socket.lock().clone().ok_or(NetworkError::NotStarted)?;
        let group = multicast_group(universe);

        let mut interfaces = multicast_capable_addrs();
        if interfaces.is_empty() {
            interfaces.push(Ipv4Addr::UNSPECIFIED);
        }

        let mut joined = Vec::new();
        let mut last_error = None;
        for iface in interfaces {
            match socket.join_multicast_v4(&group, &iface) {
                Ok(()) => joined.push(iface),
                Err(e) if e.kind() == ErrorKind::AddrInUse => joined.push(iface),
                Err(e) => {
                    tracing::debug!("sACN: join {} on {} failed: {}", group, iface, e);
                    last_error = Some(e);
                }
            }
        }

        if joined.is_empty() {
            return Err(NetworkError::JoinFailed {
                universe,
                reason: last_error.map_or_else(|| "no interfaces".to_string(), |e| e.to_string()),
            });
        }

        tracing::debug!("sACN: joined {} on {:?}", group, joined);
        self.memberships.lock().insert(universe, joined);
        Ok(())
    }

    fn leave_multicast(&self, universe: u16) -> Result<(), NetworkError> {
        let socket = self.socket.lock().clone().ok_or(NetworkError::NotStarted)?;
        let group = multicast_group(universe);
        let interfaces = self.memberships.lock().remove(&universe).unwrap_or_default();
        for iface in interfaces {
            // The interface may already be gone
            if let Err(e) = socket.leave_multicast_v4(&group, &iface) {
                tracing::debug!("sACN: leave {} on {} failed: {}", group, iface, e);
            }
        }
        Ok(())
    }

    fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop(JOIN_TIMEOUT);
        }
        let universes: Vec<u16> = self.memberships.lock().keys().copied().collect();
        for universe in universes {
            let _ = self.leave_multicast(universe);
        }
        *self.socket.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_edges() {
        let mut tracker = AvailabilityTracker::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(tracker.seen(1, t0));
        assert!(!tracker.seen(1, t0 + Duration::from_millis(50)));
        assert!(tracker.expire(t0 + Duration::from_millis(100)).is_empty());
        assert_eq!(tracker.expire(t0 + Duration::from_millis(200)), vec![1]);
        assert!(tracker.seen(1, t0 + Duration::from_millis(300)));
    }

    #[test]
    fn test_terminate_only_reports_known_universe() {
        let mut tracker = AvailabilityTracker::new(Duration::from_secs(1));
        assert!(!tracker.terminate(3));
        tracker.seen(3, Instant::now());
        assert!(tracker.terminate(3));
    }

    #[test]
    fn test_join_before_start_fails() {
        let transport = SacnTransport::with_port(0);
        assert!(matches!(
            transport.join_multicast(1),
            Err(NetworkError::NotStarted)
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let transport = SacnTransport::with_port(0);
        transport.stop();
        transport.stop();
    }
}
