//! Stream session supervision
//!
//! `StreamReconnectManager` owns the desired source. Every `play`/`stop`
//! bumps a generation counter; callbacks, health checks and reconnect loops
//! carry the generation they were started with and go quiet once it is
//! stale, so an old intent can never complete a connection after a newer
//! one has been issued.
//!
//! ```text
//!   Idle ──play──► Connecting ──first frame──► Playing
//!     ▲                │ fail                     │ error / no frames / consumer exit
//!     │                ▼                          ▼
//!     └──stop──── Reconnecting ◄─────────────────┘
//!                  (poll discovery, reconnect when source reappears)
//! ```

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::constants::{PROBE_TIMEOUT, RECONNECT_POLL, STREAM_FRAME_TIMEOUT, STREAM_HEALTH_INTERVAL};
use crate::stream::manager::{StreamCallbacks, StreamManager};
use crate::stream::pipeline::{ConsumerFactory, Pipeline};
use crate::stream::sdk::VideoFrame;
use crate::util::Worker;

pub const LOST_NOTICE: &str = "Stream lost, reconnecting...";
pub const RECONNECTED_NOTICE: &str = "Stream reconnected";

/// On-screen notice hook
pub type NoticeFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Playing,
    Reconnecting,
}

/// Timing knobs, defaults from `constants`
#[derive(Debug, Clone, Copy)]
pub struct ReconnectTiming {
    pub poll: Duration,
    pub probe_timeout: Duration,
    pub frame_timeout: Duration,
    pub health_interval: Duration,
}

impl Default for ReconnectTiming {
    fn default() -> Self {
        Self {
            poll: RECONNECT_POLL,
            probe_timeout: PROBE_TIMEOUT,
            frame_timeout: STREAM_FRAME_TIMEOUT,
            health_interval: STREAM_HEALTH_INTERVAL,
        }
    }
}

struct State {
    desired: Option<String>,
    phase: Phase,
    generation: u64,
}

/// Running reconnect loop. `exiting` is set under `connect_lock` once the
/// loop has connected, so a loss after that point starts a fresh loop.
struct ReconnectLoop {
    worker: Worker,
    exiting: Arc<AtomicBool>,
}

impl ReconnectLoop {
    fn is_running(&self) -> bool {
        !self.exiting.load(Ordering::SeqCst) && !self.worker.is_finished()
    }
}

struct Shared {
    manager: Arc<StreamManager>,
    consumers: Arc<dyn ConsumerFactory>,
    notice: Option<NoticeFn>,
    timing: ReconnectTiming,
    state: Mutex<State>,
    /// Serializes connect and teardown
    connect_lock: Mutex<()>,
    pipeline: Mutex<Option<Pipeline>>,
    last_frame: Mutex<Option<Instant>>,
    probe: Mutex<Option<Sender<(u32, u32)>>>,
    reconnect: Mutex<Option<ReconnectLoop>>,
    health: Mutex<Option<Worker>>,
}

pub struct StreamReconnectManager {
    shared: Arc<Shared>,
}

impl StreamReconnectManager {
    pub fn new(
        manager: Arc<StreamManager>,
        consumers: Arc<dyn ConsumerFactory>,
        notice: Option<NoticeFn>,
    ) -> Self {
        Self::with_timing(manager, consumers, notice, ReconnectTiming::default())
    }

    pub fn with_timing(
        manager: Arc<StreamManager>,
        consumers: Arc<dyn ConsumerFactory>,
        notice: Option<NoticeFn>,
        timing: ReconnectTiming,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                manager,
                consumers,
                notice,
                timing,
                state: Mutex::new(State {
                    desired: None,
                    phase: Phase::Idle,
                    generation: 0,
                }),
                connect_lock: Mutex::new(()),
                pipeline: Mutex::new(None),
                last_frame: Mutex::new(None),
                probe: Mutex::new(None),
                reconnect: Mutex::new(None),
                health: Mutex::new(None),
            }),
        }
    }

    /// Make `source` the desired stream and connect to it.
    ///
    /// Returns true once frames are flowing. On failure a reconnect loop
    /// keeps trying until the source reappears or the intent changes.
    pub fn play(&self, source: &str) -> bool {
        if !self.shared.manager.is_available() {
            tracing::warn!("Stream playback unavailable, ignoring '{}'", source);
            return false;
        }
        let generation = self.shared.begin(Some(source.to_string()), Phase::Connecting);
        self.shared.run_play(generation, source)
    }

    /// Record `source` as desired now and connect on a helper thread.
    ///
    /// Returns false without doing anything if `source` is already the
    /// desired source, so repeated requests never start duplicate connects.
    pub fn play_async(&self, source: &str) -> bool {
        if !self.shared.manager.is_available() {
            tracing::warn!("Stream playback unavailable, ignoring '{}'", source);
            return false;
        }
        let Some(generation) = self.shared.begin_if_new(source) else {
            tracing::debug!("Stream '{}' already requested", source);
            return false;
        };

        let shared = self.shared.clone();
        let name = source.to_string();
        let spawned = thread::Builder::new()
            .name("stream-connect".into())
            .spawn(move || {
                shared.run_play(generation, &name);
            });
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn stream connect thread: {}", e);
            self.shared.set_phase(generation, Phase::Idle);
            return false;
        }
        true
    }

    /// Drop the desired source and tear everything down
    pub fn stop(&self) {
        let shared = &self.shared;
        let was_active = shared.state.lock().desired.is_some();
        shared.begin(None, Phase::Idle);
        let _guard = shared.connect_lock.lock();
        shared.cancel_workers();
        shared.teardown();
        if was_active {
            tracing::info!("Stream stopped");
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    pub fn desired_source(&self) -> Option<String> {
        self.shared.state.lock().desired.clone()
    }

    /// True while a source is desired, connected or not
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().desired.is_some()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared
            .reconnect
            .lock()
            .as_ref()
            .is_some_and(ReconnectLoop::is_running)
    }

    pub fn is_available(&self) -> bool {
        self.shared.manager.is_available()
    }
}

impl Drop for StreamReconnectManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    /// Record a new intent. Work belonging to older intents notices the
    /// generation change and stops on its own.
    fn begin(&self, desired: Option<String>, phase: Phase) -> u64 {
        let mut state = self.state.lock();
        state.generation += 1;
        state.desired = desired;
        state.phase = phase;
        state.generation
    }

    fn begin_if_new(&self, source: &str) -> Option<u64> {
        let mut state = self.state.lock();
        if state.desired.as_deref() == Some(source) && state.phase != Phase::Idle {
            return None;
        }
        state.generation += 1;
        state.desired = Some(source.to_string());
        state.phase = Phase::Connecting;
        Some(state.generation)
    }

    /// Signal the reconnect and health workers without waiting. A reconnect
    /// loop may be blocked on `connect_lock`, held by our caller.
    fn cancel_workers(&self) {
        let reconnect = self.reconnect.lock().take();
        let health = self.health.lock().take();
        if let Some(running) = reconnect {
            running.worker.signal();
        }
        if let Some(worker) = health {
            worker.signal();
        }
    }

    fn run_play(self: &Arc<Self>, generation: u64, source: &str) -> bool {
        let connected = {
            let _guard = self.connect_lock.lock();
            if !self.is_current(generation) {
                return false;
            }
            tracing::info!("Stream play: '{}'", source);
            self.cancel_workers();
            self.teardown();
            self.connect(generation, source)
        };
        if !connected && self.is_current(generation) {
            self.enter_reconnecting(generation);
        }
        connected
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    fn set_phase(&self, generation: u64, phase: Phase) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.phase = phase;
        true
    }

    /// Caller holds `connect_lock`
    fn teardown(&self) {
        self.manager.stop_receiving();
        *self.probe.lock() = None;
        if let Some(pipeline) = self.pipeline.lock().take() {
            pipeline.stop();
        }
        *self.last_frame.lock() = None;
    }

    /// Caller holds `connect_lock`
    fn connect(self: &Arc<Self>, generation: u64, source: &str) -> bool {
        if !self.is_current(generation) {
            return false;
        }

        let known = self.manager.resolution(source);
        let first_frame = match known {
            Some(_) => None,
            None => {
                let (tx, rx) = bounded(1);
                *self.probe.lock() = Some(tx);
                Some(rx)
            }
        };

        if let Some((width, height)) = known {
            if !self.install_pipeline(width, height) {
                return false;
            }
        }

        let on_frame = {
            let shared = Arc::downgrade(self);
            Arc::new(move |frame: VideoFrame| {
                if let Some(shared) = shared.upgrade() {
                    shared.deliver(generation, frame);
                }
            })
        };
        let on_disconnect = {
            let shared = Arc::downgrade(self);
            Arc::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.on_lost(generation, "connection lost");
                }
            })
        };
        let callbacks = StreamCallbacks {
            on_frame: Some(on_frame),
            on_audio: None,
            on_disconnect: Some(on_disconnect),
        };
        if !self.manager.start_receiving(source, callbacks) {
            self.teardown();
            return false;
        }

        // Unknown size: keep the connection and wait for the first frame
        if let Some(rx) = first_frame {
            let deadline = Instant::now() + self.timing.probe_timeout;
            let dimensions = loop {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(dimensions) => break Some(dimensions),
                    Err(RecvTimeoutError::Disconnected) => break None,
                    Err(RecvTimeoutError::Timeout) => {
                        if !self.is_current(generation) || Instant::now() >= deadline {
                            break None;
                        }
                    }
                }
            };
            *self.probe.lock() = None;

            let Some((width, height)) = dimensions else {
                tracing::warn!("No frames from '{}' within {:?}", source, self.timing.probe_timeout);
                self.teardown();
                return false;
            };
            tracing::info!("Probed '{}': {}x{}", source, width, height);
            self.manager.update_resolution(source, width, height);
            if !self.install_pipeline(width, height) {
                self.teardown();
                return false;
            }
        }

        *self.last_frame.lock() = Some(Instant::now());
        if !self.set_phase(generation, Phase::Playing) {
            tracing::debug!("Connection to '{}' superseded", source);
            self.teardown();
            return false;
        }
        self.start_health(generation);
        tracing::info!("Stream '{}' playing", source);
        true
    }

    fn install_pipeline(&self, width: u32, height: u32) -> bool {
        match Pipeline::start(&*self.consumers, width, height) {
            Ok(pipeline) => {
                if let Some(old) = self.pipeline.lock().replace(pipeline) {
                    old.stop();
                }
                true
            }
            Err(e) => {
                tracing::error!("Failed to start stream pipeline: {}", e);
                false
            }
        }
    }

    /// Frame from the receive thread
    fn deliver(&self, generation: u64, frame: VideoFrame) {
        if !self.is_current(generation) {
            return;
        }
        *self.last_frame.lock() = Some(Instant::now());
        if let Some(tx) = self.probe.lock().as_ref() {
            let _ = tx.try_send(frame.dimensions());
        }

        let mut pipeline = self.pipeline.lock();
        let Some(current) = pipeline.as_ref() else {
            return;
        };
        if current.dimensions() == frame.dimensions() {
            current.push(frame);
            return;
        }

        let (width, height) = frame.dimensions();
        tracing::info!(
            "Stream resolution changed {:?} -> {}x{}, restarting pipeline",
            current.dimensions(),
            width,
            height
        );
        // Joining the old writer here would stall capture
        if let Some(old) = pipeline.take() {
            old.stop_in_background();
        }
        match Pipeline::start(&*self.consumers, width, height) {
            Ok(restarted) => {
                restarted.push(frame);
                *pipeline = Some(restarted);
            }
            // Health check sees the missing pipeline
            Err(e) => tracing::error!("Failed to restart stream pipeline: {}", e),
        }
    }

    fn start_health(self: &Arc<Self>, generation: u64) {
        let shared = Arc::downgrade(self);
        let interval = self.timing.health_interval;
        let frame_timeout = self.timing.frame_timeout;
        let worker = Worker::spawn("stream-health", move |stop| {
            while !stop.wait(interval) {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if !shared.is_current(generation) {
                    break;
                }
                let stale = shared
                    .last_frame
                    .lock()
                    .map_or(true, |t| t.elapsed() > frame_timeout);
                let consumer_ok = shared
                    .pipeline
                    .lock()
                    .as_ref()
                    .is_some_and(Pipeline::is_healthy);
                if stale {
                    shared.on_lost(generation, "no frames");
                    break;
                }
                if !consumer_ok {
                    shared.on_lost(generation, "consumer exited");
                    break;
                }
            }
        });
        match worker {
            Ok(worker) => *self.health.lock() = Some(worker),
            Err(e) => tracing::error!("Failed to spawn stream health thread: {}", e),
        }
    }

    /// Disconnect path, reachable from the receive and health threads
    fn on_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.phase != Phase::Playing {
                return;
            }
            state.phase = Phase::Reconnecting;
        }
        tracing::warn!("Stream lost ({}), reconnecting", reason);

        // Teardown joins the threads that may be calling us
        let shared = self.clone();
        let spawned = thread::Builder::new()
            .name("stream-teardown".into())
            .spawn(move || {
                {
                    let _guard = shared.connect_lock.lock();
                    if !shared.is_current(generation) {
                        return;
                    }
                    shared.teardown();
                }
                shared.show_notice(LOST_NOTICE);
                shared.enter_reconnecting(generation);
            });
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn stream teardown thread: {}", e);
        }
    }

    fn show_notice(&self, text: &str) {
        if let Some(notice) = &self.notice {
            notice(text);
        }
    }

    /// Start the reconnect loop unless one is already running
    fn enter_reconnecting(self: &Arc<Self>, generation: u64) {
        let source = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.phase = Phase::Reconnecting;
            match state.desired.clone() {
                Some(source) => source,
                None => return,
            }
        };

        let mut slot = self.reconnect.lock();
        if slot.as_ref().is_some_and(ReconnectLoop::is_running) {
            return;
        }
        let shared = Arc::downgrade(self);
        let poll = self.timing.poll;
        let exiting = Arc::new(AtomicBool::new(false));
        let done = exiting.clone();
        let worker = Worker::spawn("stream-reconnect", move |stop| {
            tracing::info!("Reconnect loop started for '{}'", source);
            while !stop.wait(poll) {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if !shared.is_current(generation) {
                    tracing::debug!("Reconnect for '{}' superseded", source);
                    break;
                }
                let visible = shared.manager.discover(Duration::from_millis(500));
                if !visible.iter().any(|name| name == &source) {
                    continue;
                }

                tracing::info!("Source '{}' visible again, reconnecting", source);
                let connected = {
                    let _guard = shared.connect_lock.lock();
                    let connected = shared.is_current(generation) && shared.connect(generation, &source);
                    if connected {
                        done.store(true, Ordering::SeqCst);
                    }
                    connected
                };
                if connected {
                    shared.show_notice(RECONNECTED_NOTICE);
                    break;
                }
                if !shared.set_phase(generation, Phase::Reconnecting) {
                    break;
                }
            }
        });
        match worker {
            Ok(worker) => {
                if let Some(previous) = slot.replace(ReconnectLoop { worker, exiting }) {
                    previous.worker.signal();
                }
            }
            Err(e) => tracing::error!("Failed to spawn reconnect thread: {}", e),
        }
    }
}
