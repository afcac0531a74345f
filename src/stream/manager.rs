//! Stream discovery and the single receive session
//!
//! `StreamManager` is constructed once by the server and shared with the
//! components that need it. Without a runtime every operation is a no-op
//! and `is_available()` is false.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::{JOIN_TIMEOUT, PROBE_TIMEOUT};
use crate::stream::sdk::{AudioFrame, Bandwidth, Capture, StreamReceiver, StreamSdk, VideoFrame};
use crate::stream::source::{SourceRegistry, StreamSource};
use crate::util::{StopSignal, Worker};

/// Name other devices see for our receive connection
pub const RECEIVER_NAME: &str = "Pi-Medienserver";
/// Name used by background resolution probes
pub const PROBE_RECEIVER_NAME: &str = "Pi-Medienserver-Probe";
/// Asks the sender for hardware-accelerated encoding
pub const HWACCEL_HINT: &str = "<ndi_hwaccel enabled=\"true\"/>";

const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);
const CAPTURE_TIMEOUT: Duration = Duration::from_millis(100);
const PROBE_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);
/// Upper bound on waiting for pending receiver destroys at shutdown
const DESTROY_WAIT: Duration = Duration::from_secs(30);

pub type FrameCallback = Arc<dyn Fn(VideoFrame) + Send + Sync>;
pub type AudioCallback = Arc<dyn Fn(AudioFrame) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks for one receive session, all invoked on the receive thread
#[derive(Clone, Default)]
pub struct StreamCallbacks {
    pub on_frame: Option<FrameCallback>,
    pub on_audio: Option<AudioCallback>,
    pub on_disconnect: Option<DisconnectCallback>,
}

struct Session {
    source: String,
    worker: Worker,
}

type Destroyers = Arc<Mutex<Vec<JoinHandle<()>>>>;

pub struct StreamManager {
    sdk: Option<Arc<dyn StreamSdk>>,
    registry: Arc<Mutex<SourceRegistry>>,
    bandwidth: Mutex<Bandwidth>,
    session: Arc<Mutex<Option<Session>>>,
    discovery: Mutex<Option<Worker>>,
    destroyers: Destroyers,
}

impl StreamManager {
    pub fn new(sdk: Option<Arc<dyn StreamSdk>>, bandwidth: Bandwidth) -> Self {
        if sdk.is_none() {
            tracing::info!("Stream runtime not available, stream playback disabled");
        }
        Self {
            sdk,
            registry: Arc::new(Mutex::new(SourceRegistry::new())),
            bandwidth: Mutex::new(bandwidth),
            session: Arc::new(Mutex::new(None)),
            discovery: Mutex::new(None),
            destroyers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Manager with no runtime
    pub fn unavailable() -> Self {
        Self::new(None, Bandwidth::default())
    }

    pub fn is_available(&self) -> bool {
        self.sdk.is_some()
    }

    pub fn bandwidth(&self) -> Bandwidth {
        *self.bandwidth.lock()
    }

    /// Takes effect on the next connection
    pub fn set_bandwidth(&self, bandwidth: Bandwidth) {
        let mut current = self.bandwidth.lock();
        if *current != bandwidth {
            *current = bandwidth;
            tracing::info!("Stream bandwidth set to '{}'", bandwidth);
        }
    }

    /// Start the background discovery loop
    pub fn start_discovery(&self) -> std::io::Result<()> {
        let Some(sdk) = self.sdk.clone() else {
            return Ok(());
        };
        let mut discovery = self.discovery.lock();
        if discovery.is_some() {
            return Ok(());
        }
        let registry = self.registry.clone();
        let session = self.session.clone();
        let destroyers = self.destroyers.clone();

        *discovery = Some(Worker::spawn("stream-discovery", move |stop| {
            discovery_loop(sdk, registry, session, destroyers, stop)
        })?);
        tracing::info!("Stream discovery started");
        Ok(())
    }

    pub fn stop_discovery(&self) {
        if let Some(worker) = self.discovery.lock().take() {
            worker.stop(PROBE_TIMEOUT + JOIN_TIMEOUT);
        }
    }

    /// Run one discovery pass now and return the visible names
    pub fn discover(&self, timeout: Duration) -> Vec<String> {
        let Some(sdk) = &self.sdk else {
            return Vec::new();
        };
        match sdk.find_sources(timeout) {
            Ok(names) => {
                let added = self.registry.lock().replace_names(&names);
                for name in &added {
                    tracing::info!("Stream source found: {}", name);
                }
                names
            }
            Err(e) => {
                tracing::warn!("Stream discovery failed: {}", e);
                Vec::new()
            }
        }
    }

    pub fn sources(&self) -> Vec<StreamSource> {
        self.registry.lock().list()
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.registry.lock().contains(name)
    }

    /// Cached resolution of `name`
    pub fn resolution(&self, name: &str) -> Option<(u32, u32)> {
        self.registry.lock().resolution(name)
    }

    pub fn update_resolution(&self, name: &str, width: u32, height: u32) {
        self.registry.lock().update_resolution(name, width, height);
    }

    /// Connect to `source` and start delivering frames to `callbacks`.
    /// Any previous session is stopped first.
    pub fn start_receiving(&self, source: &str, callbacks: StreamCallbacks) -> bool {
        let Some(sdk) = &self.sdk else {
            tracing::warn!("Stream runtime not available");
            return false;
        };

        let mut session = self.session.lock();
        if let Some(old) = session.take() {
            old.worker.stop(JOIN_TIMEOUT);
        }

        let bandwidth = self.bandwidth();
        let mut receiver = match sdk.connect(source, bandwidth, RECEIVER_NAME) {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::error!("Failed to connect to '{}': {}", source, e);
                return false;
            }
        };
        receiver.set_tally(true, true);
        receiver.send_metadata(HWACCEL_HINT);
        tracing::info!("Connecting to '{}' (bandwidth {})...", source, bandwidth);

        let name = source.to_string();
        let registry = self.registry.clone();
        let destroyers = self.destroyers.clone();
        let worker = Worker::spawn("stream-receive", move |stop| {
            let receiver = receive_loop(receiver, &name, callbacks, &registry, &stop);
            destroy_in_background(receiver, &destroyers);
        });

        match worker {
            Ok(worker) => {
                *session = Some(Session {
                    source: source.to_string(),
                    worker,
                });
                true
            }
            Err(e) => {
                tracing::error!("Failed to spawn receive thread: {}", e);
                false
            }
        }
    }

    /// Stop the current session. The receiver is destroyed off-thread.
    pub fn stop_receiving(&self) {
        if let Some(old) = self.session.lock().take() {
            tracing::debug!("Stopping stream receive from '{}'", old.source);
            old.worker.stop(JOIN_TIMEOUT);
        }
    }

    pub fn is_receiving(&self) -> bool {
        session_active(&self.session)
    }

    pub fn current_source(&self) -> Option<String> {
        self.session
            .lock()
            .as_ref()
            .filter(|s| !s.worker.is_finished())
            .map(|s| s.source.clone())
    }

    /// Stop everything and wait for pending receiver destroys
    pub fn shutdown(&self) {
        self.stop_receiving();
        self.stop_discovery();

        let pending: Vec<_> = self.destroyers.lock().drain(..).collect();
        let deadline = Instant::now() + DESTROY_WAIT;
        for handle in pending {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::warn!("Stream receiver destroy still pending at shutdown");
            }
        }
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.stop_receiving();
        self.stop_discovery();
    }
}

fn session_active(session: &Mutex<Option<Session>>) -> bool {
    session
        .lock()
        .as_ref()
        .is_some_and(|s| !s.worker.is_finished())
}

fn deliver(what: &str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!("Stream {} callback panicked", what);
    }
}

fn receive_loop(
    receiver: Box<dyn StreamReceiver>,
    source: &str,
    callbacks: StreamCallbacks,
    registry: &Mutex<SourceRegistry>,
    stop: &StopSignal,
) -> Box<dyn StreamReceiver> {
    let mut receiver = receiver;
    let mut frames: u64 = 0;
    let mut audio_frames: u64 = 0;
    let mut dimensions = (0, 0);

    while !stop.is_set() {
        match receiver.capture(CAPTURE_TIMEOUT) {
            Capture::Video(frame) => {
                frames += 1;
                if frame.dimensions() != dimensions {
                    dimensions = frame.dimensions();
                    tracing::info!("Receiving video: {}x{}", frame.width, frame.height);
                    registry
                        .lock()
                        .update_resolution(source, frame.width, frame.height);
                } else if frames % 150 == 0 {
                    tracing::debug!("Stream frames received: {}", frames);
                }
                if let Some(on_frame) = &callbacks.on_frame {
                    deliver("frame", || on_frame(frame));
                }
            }
            Capture::Audio(frame) => {
                audio_frames += 1;
                if audio_frames == 1 {
                    tracing::info!(
                        "Receiving audio: {}Hz {}ch",
                        frame.sample_rate,
                        frame.channels
                    );
                }
                if let Some(on_audio) = &callbacks.on_audio {
                    deliver("audio", || on_audio(frame));
                }
            }
            Capture::Error => {
                tracing::warn!("Stream connection to '{}' lost", source);
                if let Some(on_disconnect) = &callbacks.on_disconnect {
                    deliver("disconnect", || on_disconnect());
                }
                break;
            }
            Capture::SourceChange => tracing::info!("Stream source changed"),
            Capture::StatusChange => tracing::debug!("Stream status change"),
            Capture::Metadata(text) => tracing::debug!("Stream metadata: {}", text),
            Capture::None => {}
        }
    }

    tracing::debug!("Receiver stopped (received {} frames)", frames);
    receiver
}

/// Hands a receiver to a short-lived thread. The native destroy can block
/// for many seconds while buffers drain.
fn destroy_in_background(receiver: Box<dyn StreamReceiver>, destroyers: &Destroyers) {
    let spawned = thread::Builder::new()
        .name("stream-destroy".into())
        .spawn(move || {
            drop(receiver);
            tracing::debug!("Stream receiver destroyed");
        });
    match spawned {
        Ok(handle) => {
            let mut pending = destroyers.lock();
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }
        Err(e) => tracing::error!("Failed to spawn destroy thread: {}", e),
    }
}

fn discovery_loop(
    sdk: Arc<dyn StreamSdk>,
    registry: Arc<Mutex<SourceRegistry>>,
    session: Arc<Mutex<Option<Session>>>,
    destroyers: Destroyers,
    stop: StopSignal,
) {
    let mut prober: Option<Worker> = None;
    loop {
        match sdk.find_sources(DISCOVERY_INTERVAL) {
            Ok(names) => {
                let added = registry.lock().replace_names(&names);
                for name in &added {
                    tracing::info!("Stream source found: {}", name);
                }
            }
            Err(e) => tracing::warn!("Stream discovery failed: {}", e),
        }

        let idle = prober.as_ref().map_or(true, Worker::is_finished);
        if idle && !session_active(&session) && !registry.lock().unprobed().is_empty() {
            let (sdk, registry, session, destroyers) =
                (sdk.clone(), registry.clone(), session.clone(), destroyers.clone());
            match Worker::spawn("stream-probe", move |stop| {
                probe_sources(&*sdk, &registry, &session, &destroyers, &stop)
            }) {
                Ok(worker) => prober = Some(worker),
                Err(e) => tracing::error!("Failed to spawn probe thread: {}", e),
            }
        }

        if stop.wait(DISCOVERY_INTERVAL) {
            break;
        }
    }
    if let Some(worker) = prober {
        worker.stop(PROBE_TIMEOUT);
    }
}

/// Learn the resolution of every unprobed source, one at a time
fn probe_sources(
    sdk: &dyn StreamSdk,
    registry: &Mutex<SourceRegistry>,
    session: &Mutex<Option<Session>>,
    destroyers: &Destroyers,
    stop: &StopSignal,
) {
    let pending = registry.lock().unprobed();
    for name in pending {
        if stop.is_set() || session_active(session) {
            return;
        }
        match probe_one(sdk, &name, destroyers, stop) {
            Some((width, height)) => {
                tracing::info!("Probed '{}': {}x{}", name, width, height);
                registry.lock().update_resolution(&name, width, height);
            }
            None => {
                tracing::warn!("Probe timeout for '{}'", name);
                registry.lock().mark_probed(&name);
            }
        }
    }
}

fn probe_one(
    sdk: &dyn StreamSdk,
    name: &str,
    destroyers: &Destroyers,
    stop: &StopSignal,
) -> Option<(u32, u32)> {
    let mut receiver = match sdk.connect(name, Bandwidth::Lowest, PROBE_RECEIVER_NAME) {
        Ok(receiver) => receiver,
        Err(e) => {
            tracing::debug!("Probe connect to '{}' failed: {}", name, e);
            return None;
        }
    };
    let deadline = Instant::now() + PROBE_TIMEOUT;
    let mut found = None;
    while found.is_none() && Instant::now() < deadline && !stop.is_set() {
        match receiver.capture(PROBE_CAPTURE_TIMEOUT) {
            Capture::Video(frame) => found = Some(frame.dimensions()),
            Capture::Error => break,
            _ => {}
        }
    }
    destroy_in_background(receiver, destroyers);
    found
}
