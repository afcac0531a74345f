//! Stream frame hand-off
//!
//! Frames from the receive thread go into a small drop-oldest queue; a
//! writer thread pops them and writes raw BGRA into a consumer process.
//! The receive thread never blocks on a slow consumer.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::{FRAME_QUEUE_CAPACITY, FRAME_QUEUE_POLL, JOIN_TIMEOUT};
use crate::error::StreamError;
use crate::stream::sdk::VideoFrame;
use crate::util::Worker;

/// Bounded frame queue that discards the oldest frame when full
pub struct FrameQueue {
    tx: Sender<VideoFrame>,
    rx: Receiver<VideoFrame>,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. Returns true if an older frame was dropped.
    pub fn push(&self, frame: VideoFrame) -> bool {
        let mut frame = frame;
        let mut dropped = false;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return dropped,
                Err(TrySendError::Full(rejected)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        dropped = true;
                    }
                    frame = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return dropped,
            }
        }
    }

    /// Wait up to `timeout` for the next frame
    pub fn pop(&self, timeout: Duration) -> Option<VideoFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Frames discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Forcibly ends a consumer from outside the writer thread
pub type AbortHandle = Arc<dyn Fn() + Send + Sync>;

/// Downstream sink for raw frames
pub trait FrameConsumer: Send {
    fn write_frame(&mut self, frame: &VideoFrame) -> Result<(), StreamError>;

    /// False once the consumer has exited
    fn is_alive(&mut self) -> bool;

    fn close(&mut self) {}

    /// Handle that unblocks a `write_frame` stuck on a stalled consumer
    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }
}

/// Starts a consumer for a given frame size
pub trait ConsumerFactory: Send + Sync {
    fn spawn(&self, width: u32, height: u32) -> Result<Box<dyn FrameConsumer>, StreamError>;
}

/// Consumer process reading raw frames on stdin
pub struct ProcessConsumer {
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
}

fn kill_child(child: &Mutex<Child>) {
    let mut child = child.lock();
    let _ = child.kill();
    let _ = child.wait();
}

impl FrameConsumer for ProcessConsumer {
    fn write_frame(&mut self, frame: &VideoFrame) -> Result<(), StreamError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| StreamError::Consumer("stdin closed".into()))?;
        stdin
            .write_all(&frame.data)
            .map_err(|e| StreamError::Consumer(e.to_string()))
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let child = self.child.clone();
        Some(Arc::new(move || kill_child(&child)))
    }

    fn close(&mut self) {
        // EOF lets the consumer exit on its own
        self.stdin.take();
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            if !self.is_alive() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        kill_child(&self.child);
    }
}

impl Drop for ProcessConsumer {
    fn drop(&mut self) {
        if self.is_alive() {
            kill_child(&self.child);
        }
    }
}

/// Spawns the configured command with `{width}` and `{height}` substituted
#[derive(Debug, Clone)]
pub struct ProcessConsumerFactory {
    command: Vec<String>,
}

impl ProcessConsumerFactory {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Program and arguments for one frame size
    pub fn command_line(&self, width: u32, height: u32) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{width}", &width.to_string())
                    .replace("{height}", &height.to_string())
            })
            .collect()
    }
}

impl ConsumerFactory for ProcessConsumerFactory {
    fn spawn(&self, width: u32, height: u32) -> Result<Box<dyn FrameConsumer>, StreamError> {
        let argv = self.command_line(width, height);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| StreamError::Consumer("empty consumer command".into()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| StreamError::Consumer(format!("{}: {}", program, e)))?;
        let stdin = child.stdin.take();
        tracing::info!("Stream consumer started for {}x{} (pid {})", width, height, child.id());
        Ok(Box::new(ProcessConsumer {
            child: Arc::new(Mutex::new(child)),
            stdin,
        }))
    }
}

/// One consumer plus the writer thread feeding it
pub struct Pipeline {
    queue: Arc<FrameQueue>,
    dimensions: (u32, u32),
    healthy: Arc<AtomicBool>,
    written: Arc<AtomicU64>,
    writer: Option<Worker>,
    abort: Option<AbortHandle>,
}

impl Pipeline {
    pub fn start(factory: &dyn ConsumerFactory, width: u32, height: u32) -> Result<Self, StreamError> {
        let mut consumer = factory.spawn(width, height)?;
        let abort = consumer.abort_handle();
        let queue = Arc::new(FrameQueue::new(FRAME_QUEUE_CAPACITY));
        let healthy = Arc::new(AtomicBool::new(true));
        let written = Arc::new(AtomicU64::new(0));

        let (q, ok, count) = (queue.clone(), healthy.clone(), written.clone());
        let writer = Worker::spawn("stream-writer", move |stop| {
            while !stop.is_set() {
                match q.pop(FRAME_QUEUE_POLL) {
                    Some(frame) if frame.dimensions() != (width, height) => {
                        tracing::debug!("Writer: skipping {:?} frame", frame.dimensions());
                    }
                    Some(frame) => {
                        if let Err(e) = consumer.write_frame(&frame) {
                            tracing::warn!("Stream consumer write failed: {}", e);
                            ok.store(false, Ordering::SeqCst);
                            break;
                        }
                        count.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        if !consumer.is_alive() {
                            tracing::warn!("Stream consumer exited");
                            ok.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }
            consumer.close();
        })?;

        Ok(Self {
            queue,
            dimensions: (width, height),
            healthy,
            written,
            writer: Some(writer),
            abort,
        })
    }

    /// Queue a frame for the consumer
    pub fn push(&self, frame: VideoFrame) {
        if self.queue.push(frame) {
            tracing::trace!("Stream frame dropped, consumer behind");
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    /// False once the consumer has failed or the writer has exited
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
            && self.writer.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn frames_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn stop(self) {
        self.stop_within(JOIN_TIMEOUT);
    }

    /// Stop the writer, killing the consumer if the writer is stuck in a
    /// write past `timeout`.
    pub fn stop_within(mut self, timeout: Duration) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        if !writer.stop(timeout) {
            if let Some(abort) = &self.abort {
                tracing::warn!("Stream consumer not draining, killing it");
                abort();
            }
        }
    }

    /// Stop on a helper thread so the caller never waits on the consumer
    pub fn stop_in_background(self) {
        let spawned = std::thread::Builder::new()
            .name("stream-writer-stop".into())
            .spawn(move || self.stop());
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn pipeline stop thread: {}", e);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.signal();
        }
    }
}
