//! In-memory stand-ins for the external collaborators
//!
//! Used by the unit tests and the integration tests under `tests/`: a
//! transport driven by hand, a recording playback engine, a scriptable
//! stream runtime and a recording frame consumer.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::constants::UNIVERSE_SIZE;
use crate::dmx::DmxFrame;
use crate::error::{NetworkError, PlayerError, StreamError};
use crate::network::transport::{EventHandler, FrameTransport, TransportEvent};
use crate::player::engine::{EngineFactory, EngineProperty, PlaybackEngine};
use crate::stream::pipeline::{ConsumerFactory, FrameConsumer};
use crate::stream::sdk::{Bandwidth, Capture, StreamReceiver, StreamSdk, VideoFrame};

/// A universe with `values` starting at 1-based `address`, zero elsewhere
pub fn frame_at(address: u16, values: &[u8]) -> DmxFrame {
    let mut frame = [0u8; UNIVERSE_SIZE];
    let start = usize::from(address.max(1)) - 1;
    let end = (start + values.len()).min(UNIVERSE_SIZE);
    frame[start..end].copy_from_slice(&values[..end - start]);
    frame
}

// ----- Transport -----

/// Transport whose events are injected by the test
#[derive(Default)]
pub struct ManualTransport {
    handler: RwLock<Option<EventHandler>>,
    joins: Mutex<Vec<u16>>,
    leaves: Mutex<Vec<u16>>,
    stops: AtomicUsize,
}

impl ManualTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn emit(&self, event: TransportEvent) {
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    /// Deliver a frame synchronously on the calling thread
    pub fn send_frame(&self, universe: u16, frame: DmxFrame) {
        self.emit(TransportEvent::Frame {
            universe,
            data: Box::new(frame),
        });
    }

    pub fn set_available(&self, universe: u16, available: bool) {
        self.emit(TransportEvent::Availability { universe, available });
    }

    pub fn joins(&self) -> Vec<u16> {
        self.joins.lock().clone()
    }

    pub fn leaves(&self) -> Vec<u16> {
        self.leaves.lock().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl FrameTransport for ManualTransport {
    fn start(&self, handler: EventHandler) -> Result<(), NetworkError> {
        *self.handler.write() = Some(handler);
        Ok(())
    }

    fn join_multicast(&self, universe: u16) -> Result<(), NetworkError> {
        self.joins.lock().push(universe);
        Ok(())
    }

    fn leave_multicast(&self, universe: u16) -> Result<(), NetworkError> {
        self.leaves.lock().push(universe);
        Ok(())
    }

    fn stop(&self) {
        self.handler.write().take();
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ----- Playback engine -----

/// One successful engine call
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Play { location: String, looping: bool },
    Stop,
    Set(EngineProperty),
    Message(String),
}

#[derive(Default)]
struct EngineLog {
    calls: Mutex<Vec<EngineCall>>,
    fail_next: Mutex<usize>,
    fail_create: AtomicBool,
    created: AtomicUsize,
}

/// Engine factory whose engines append to a shared call log
#[derive(Clone, Default)]
pub struct RecordingFactory {
    log: Arc<EngineLog>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful calls across every engine created so far
    pub fn calls(&self) -> Vec<EngineCall> {
        self.log.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.log.calls.lock().clear();
    }

    /// Make the next `n` engine operations fail
    pub fn fail_next(&self, n: usize) {
        *self.log.fail_next.lock() = n;
    }

    pub fn fail_create(&self, fail: bool) {
        self.log.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Engines created so far
    pub fn created(&self) -> usize {
        self.log.created.load(Ordering::SeqCst)
    }
}

impl EngineFactory for RecordingFactory {
    fn create(&self) -> Result<Box<dyn PlaybackEngine>, PlayerError> {
        if self.log.fail_create.load(Ordering::SeqCst) {
            return Err(PlayerError::SpawnFailed("injected failure".into()));
        }
        self.log.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingEngine {
            log: self.log.clone(),
            alive: true,
        }))
    }
}

pub struct RecordingEngine {
    log: Arc<EngineLog>,
    alive: bool,
}

impl RecordingEngine {
    fn record(&mut self, call: EngineCall) -> Result<(), PlayerError> {
        {
            let mut fail_next = self.log.fail_next.lock();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(PlayerError::Ipc("injected failure".into()));
            }
        }
        self.log.calls.lock().push(call);
        Ok(())
    }
}

impl PlaybackEngine for RecordingEngine {
    fn play(&mut self, location: &str, looping: bool) -> Result<(), PlayerError> {
        self.record(EngineCall::Play {
            location: location.to_string(),
            looping,
        })
    }

    fn stop(&mut self) -> Result<(), PlayerError> {
        self.record(EngineCall::Stop)
    }

    fn set_property(&mut self, property: EngineProperty) -> Result<(), PlayerError> {
        self.record(EngineCall::Set(property))
    }

    fn show_message(&mut self, text: &str, _duration: Duration) -> Result<(), PlayerError> {
        self.record(EngineCall::Message(text.to_string()))
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    fn shutdown(&mut self) {
        self.alive = false;
    }
}

// ----- Stream runtime -----

/// Arguments of one `connect` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRecord {
    pub source: String,
    pub bandwidth: Bandwidth,
    pub receiver_name: String,
}

#[derive(Debug, Clone, Copy)]
enum SourceMode {
    Live(u32, u32),
    Silent,
}

#[derive(Default)]
struct StreamState {
    sources: BTreeMap<String, SourceMode>,
    connects: Vec<ConnectRecord>,
    disconnects: HashMap<String, u64>,
    metadata: Vec<String>,
    tally: bool,
    fail_connects: bool,
}

/// Scriptable stream runtime. Live sources produce a frame every few
/// milliseconds; silent sources produce nothing.
#[derive(Default)]
pub struct FakeStreamSdk {
    state: Arc<Mutex<StreamState>>,
    destroyed: Arc<AtomicUsize>,
}

impl FakeStreamSdk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `name` discoverable and streaming at the given size
    pub fn set_live(&self, name: &str, width: u32, height: u32) {
        self.state
            .lock()
            .sources
            .insert(name.to_string(), SourceMode::Live(width, height));
    }

    /// Discoverable but sending nothing
    pub fn add_source(&self, name: &str) {
        self.state
            .lock()
            .sources
            .insert(name.to_string(), SourceMode::Silent);
    }

    pub fn set_silent(&self, name: &str) {
        self.add_source(name);
    }

    /// No longer discoverable; existing receivers go quiet
    pub fn remove_source(&self, name: &str) {
        self.state.lock().sources.remove(name);
    }

    /// Every open receiver of `name` reports a connection error once
    pub fn disconnect(&self, name: &str) {
        *self
            .state
            .lock()
            .disconnects
            .entry(name.to_string())
            .or_default() += 1;
    }

    pub fn fail_connects(&self, fail: bool) {
        self.state.lock().fail_connects = fail;
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.state.lock().connects.clone()
    }

    pub fn metadata_sent(&self) -> Vec<String> {
        self.state.lock().metadata.clone()
    }

    pub fn tally_set(&self) -> bool {
        self.state.lock().tally
    }

    /// Receivers dropped so far
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl StreamSdk for FakeStreamSdk {
    fn find_sources(&self, timeout: Duration) -> Result<Vec<String>, StreamError> {
        thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(self.state.lock().sources.keys().cloned().collect())
    }

    fn connect(
        &self,
        source: &str,
        bandwidth: Bandwidth,
        receiver_name: &str,
    ) -> Result<Box<dyn StreamReceiver>, StreamError> {
        let mut state = self.state.lock();
        if state.fail_connects {
            return Err(StreamError::ReceiverCreate(source.to_string()));
        }
        state.connects.push(ConnectRecord {
            source: source.to_string(),
            bandwidth,
            receiver_name: receiver_name.to_string(),
        });
        let seen_disconnects = state.disconnects.get(source).copied().unwrap_or(0);
        Ok(Box::new(FakeReceiver {
            source: source.to_string(),
            state: self.state.clone(),
            destroyed: self.destroyed.clone(),
            seen_disconnects,
        }))
    }
}

struct FakeReceiver {
    source: String,
    state: Arc<Mutex<StreamState>>,
    destroyed: Arc<AtomicUsize>,
    seen_disconnects: u64,
}

impl StreamReceiver for FakeReceiver {
    fn capture(&mut self, timeout: Duration) -> Capture {
        let mode = {
            let state = self.state.lock();
            let disconnects = state.disconnects.get(&self.source).copied().unwrap_or(0);
            if disconnects > self.seen_disconnects {
                self.seen_disconnects = disconnects;
                return Capture::Error;
            }
            state.sources.get(&self.source).copied()
        };
        match mode {
            Some(SourceMode::Live(width, height)) => {
                thread::sleep(timeout.min(Duration::from_millis(10)));
                let data = vec![0u8; (width * height * 4) as usize];
                Capture::Video(VideoFrame::new(width, height, data))
            }
            Some(SourceMode::Silent) | None => {
                thread::sleep(timeout.min(Duration::from_millis(50)));
                Capture::None
            }
        }
    }

    fn set_tally(&mut self, on_program: bool, on_preview: bool) {
        self.state.lock().tally = on_program && on_preview;
    }

    fn send_metadata(&mut self, xml: &str) {
        self.state.lock().metadata.push(xml.to_string());
    }
}

impl Drop for FakeReceiver {
    fn drop(&mut self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

// ----- Frame consumer -----

#[derive(Default)]
struct ConsumerLog {
    spawned: Mutex<Vec<(u32, u32)>>,
    written: AtomicUsize,
    alive: Mutex<Vec<Arc<AtomicBool>>>,
    fail_spawns: AtomicBool,
}

/// Consumer factory that counts frames instead of running a process
#[derive(Clone, Default)]
pub struct RecordingConsumerFactory {
    log: Arc<ConsumerLog>,
}

impl RecordingConsumerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame sizes of every consumer started so far
    pub fn spawned(&self) -> Vec<(u32, u32)> {
        self.log.spawned.lock().clone()
    }

    pub fn frames_written(&self) -> usize {
        self.log.written.load(Ordering::SeqCst)
    }

    /// Make every consumer started so far exit
    pub fn kill_all(&self) {
        for alive in self.log.alive.lock().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.log.fail_spawns.store(fail, Ordering::SeqCst);
    }
}

impl ConsumerFactory for RecordingConsumerFactory {
    fn spawn(&self, width: u32, height: u32) -> Result<Box<dyn FrameConsumer>, StreamError> {
        if self.log.fail_spawns.load(Ordering::SeqCst) {
            return Err(StreamError::Consumer("injected failure".into()));
        }
        self.log.spawned.lock().push((width, height));
        let alive = Arc::new(AtomicBool::new(true));
        self.log.alive.lock().push(alive.clone());
        Ok(Box::new(RecordingConsumer {
            log: self.log.clone(),
            alive,
        }))
    }
}

struct RecordingConsumer {
    log: Arc<ConsumerLog>,
    alive: Arc<AtomicBool>,
}

impl FrameConsumer for RecordingConsumer {
    fn write_frame(&mut self, _frame: &VideoFrame) -> Result<(), StreamError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(StreamError::Consumer("broken pipe".into()));
        }
        self.log.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}
