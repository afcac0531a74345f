//! Background worker threads with cooperative shutdown
//!
//! Every long-running loop in the server owns a stop channel and waits on it
//! with `recv_timeout`, so a stop request interrupts the wait immediately.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::cell::Cell;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Named background thread that can be asked to stop.
pub struct Worker {
    name: String,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker. The closure receives the stop channel.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> std::io::Result<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                f(StopSignal {
                    rx: stop_rx,
                    stopped: Cell::new(false),
                })
            })?;

        Ok(Self {
            name,
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop without waiting for it
    pub fn signal(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Check if the worker thread has returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signal and wait up to `timeout` for the thread to exit.
    ///
    /// Returns false if the thread was still running at the deadline; it is
    /// then detached. Calling this from the worker's own thread only signals.
    pub fn stop(mut self, timeout: Duration) -> bool {
        self.signal();
        let Some(handle) = self.handle.take() else {
            return true;
        };
        if handle.thread().id() == thread::current().id() {
            return true;
        }
        join_with_timeout(handle, timeout, &self.name)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Receiving side of a worker's stop channel
pub struct StopSignal {
    rx: Receiver<()>,
    /// Latched once the stop message has been consumed
    stopped: Cell<bool>,
}

impl StopSignal {
    /// Sleep for `interval`. Returns true if the worker should exit.
    pub fn wait(&self, interval: Duration) -> bool {
        if self.stopped.get() {
            return true;
        }
        match self.rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.stopped.set(true);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Non-blocking check
    pub fn is_set(&self) -> bool {
        self.wait(Duration::ZERO)
    }
}

/// Join a thread, giving up after `timeout`
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!("Thread '{}' did not stop within {:?}", name, timeout);
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        tracing::error!("Thread '{}' panicked", name);
    }
    true
}
