//! DMX signal-loss supervision
//!
//! Polls the receiver's link state and applies the configured fail mode on
//! the lost edge. On the restored edge the full channel state is reapplied,
//! since commands issued while the link was down (stop included) may have
//! been dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::config::FailMode;
use crate::constants::{LOST_NOTICE_DURATION, RESTORED_NOTICE_DURATION};
use crate::dmx::channel::ChannelGroup;
use crate::dmx::receiver::FrameReceiver;
use crate::util::Worker;

pub const LOST_NOTICE: &str = "DMX Signal Lost";
pub const RESTORED_NOTICE: &str = "DMX Signal Restored";

/// Link state the watchdog observes
pub trait SignalSource: Send + Sync {
    fn is_receiving(&self) -> bool;
    fn has_received(&self) -> bool;
    fn channels(&self) -> ChannelGroup;
}

impl SignalSource for FrameReceiver {
    fn is_receiving(&self) -> bool {
        FrameReceiver::is_receiving(self)
    }

    fn has_received(&self) -> bool {
        FrameReceiver::has_received(self)
    }

    fn channels(&self) -> ChannelGroup {
        FrameReceiver::channels(self)
    }
}

/// Playback-side reactions to signal loss and recovery
pub trait FailsafeActions: Send + Sync {
    /// Stop all output immediately
    fn blackout(&self);

    /// Display an on-screen notice
    fn show_notice(&self, text: &str, duration: Duration);

    /// Push the complete state derived from `channels`
    fn reapply(&self, channels: &ChannelGroup);
}

/// Result of one watchdog poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Lost,
    StillLost,
    Restored,
}

pub struct SignalWatchdog {
    source: Arc<dyn SignalSource>,
    actions: Arc<dyn FailsafeActions>,
    fail_mode: FailMode,
    show_notices: bool,
    was_receiving: bool,
    fail_applied: bool,
}

impl SignalWatchdog {
    pub fn new(
        source: Arc<dyn SignalSource>,
        actions: Arc<dyn FailsafeActions>,
        fail_mode: FailMode,
        show_notices: bool,
    ) -> Self {
        Self {
            source,
            actions,
            fail_mode,
            show_notices,
            was_receiving: false,
            fail_applied: false,
        }
    }

    /// True while the fail mode is in effect
    pub fn is_failed(&self) -> bool {
        self.fail_applied
    }

    /// Observe the link once and act on any edge
    pub fn tick(&mut self) -> Transition {
        let receiving = self.source.is_receiving();

        let transition = if self.was_receiving && !receiving && self.source.has_received() {
            self.apply_fail_mode();
            Transition::Lost
        } else if !receiving && self.fail_applied {
            if self.show_notices {
                self.actions.show_notice(LOST_NOTICE, LOST_NOTICE_DURATION);
            }
            Transition::StillLost
        } else if receiving && self.fail_applied {
            self.fail_applied = false;
            tracing::info!("DMX signal restored");
            if self.show_notices {
                self.actions.show_notice(RESTORED_NOTICE, RESTORED_NOTICE_DURATION);
            }
            self.actions.reapply(&self.source.channels());
            Transition::Restored
        } else {
            Transition::None
        };

        self.was_receiving = receiving;
        transition
    }

    fn apply_fail_mode(&mut self) {
        tracing::warn!("DMX signal lost, applying fail mode: {}", self.fail_mode);
        self.fail_applied = true;

        if self.fail_mode == FailMode::Blackout {
            self.actions.blackout();
        }
        if self.show_notices {
            self.actions.show_notice(LOST_NOTICE, LOST_NOTICE_DURATION);
        }
    }

    /// Poll on a background thread. `heartbeat` runs before every poll.
    pub fn spawn<H>(mut self, interval: Duration, heartbeat: H) -> std::io::Result<Worker>
    where
        H: Fn() + Send + 'static,
    {
        Worker::spawn("dmx-watchdog", move |stop| loop {
            heartbeat();
            if panic::catch_unwind(AssertUnwindSafe(|| self.tick())).is_err() {
                tracing::error!("Watchdog: poll panicked");
            }
            if stop.wait(interval) {
                break;
            }
        })
    }
}
