//! Process-level wiring
//!
//! Builds every component from an [`AppConfig`], starts them in dependency
//! order and tears them down in reverse.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::constants::{JOIN_TIMEOUT, WATCHDOG_INTERVAL};
use crate::dmx::{FrameReceiver, SignalWatchdog};
use crate::error::Result;
use crate::media::MediaResolver;
use crate::network::FrameTransport;
use crate::orchestrator::PlaybackOrchestrator;
use crate::player::{EngineFactory, Player};
use crate::stream::{ConsumerFactory, NoticeFn, StreamManager, StreamReconnectManager, StreamSdk};
use crate::systemd::SystemdNotifier;
use crate::util::Worker;

/// On-screen time of stream reconnect notices
const STREAM_NOTICE_DURATION: Duration = Duration::from_secs(3);

pub struct Server {
    config: AppConfig,
    receiver: Arc<FrameReceiver>,
    player: Arc<Player>,
    manager: Arc<StreamManager>,
    streams: Arc<StreamReconnectManager>,
    orchestrator: Arc<PlaybackOrchestrator>,
    notifier: Option<Arc<SystemdNotifier>>,
    watchdog_interval: Duration,
    watchdog: Mutex<Option<Worker>>,
}

impl Server {
    /// Production wiring: sACN socket, mpv, NDI runtime if installed
    #[cfg(unix)]
    pub fn new(config: AppConfig) -> Self {
        use crate::network::SacnTransport;
        use crate::player::MpvFactory;
        use crate::stream::{load_sdk, ProcessConsumerFactory};

        let transport = Arc::new(SacnTransport::new());
        let engines = Arc::new(MpvFactory::new(config.player.clone()));
        let sdk = load_sdk(config.stream.enabled, config.stream.library_path.as_deref());
        let consumers = Arc::new(ProcessConsumerFactory::new(config.stream.consumer.clone()));

        Self::with_components(config, transport, engines, sdk, consumers)
            .with_notifier(SystemdNotifier::from_env())
    }

    pub fn with_components(
        config: AppConfig,
        transport: Arc<dyn FrameTransport>,
        engines: Arc<dyn EngineFactory>,
        sdk: Option<Arc<dyn StreamSdk>>,
        consumers: Arc<dyn ConsumerFactory>,
    ) -> Self {
        let receiver = Arc::new(FrameReceiver::new(
            transport,
            config.dmx.universe,
            config.dmx.address,
        ));
        let player = Arc::new(Player::new(engines));
        let manager = Arc::new(StreamManager::new(sdk, config.stream.bandwidth));

        let notice: Option<NoticeFn> = config.stream.notify.then(|| {
            let player = player.clone();
            Arc::new(move |text: &str| player.show_message(text, STREAM_NOTICE_DURATION)) as NoticeFn
        });
        let streams = Arc::new(StreamReconnectManager::new(manager.clone(), consumers, notice));

        let orchestrator = Arc::new(PlaybackOrchestrator::new(
            player.clone(),
            MediaResolver::new(config.dmx.media_path.clone()),
            streams.clone(),
            config.dmx.fail_mode,
        ));

        Self {
            config,
            receiver,
            player,
            manager,
            streams,
            orchestrator,
            notifier: None,
            watchdog_interval: WATCHDOG_INTERVAL,
            watchdog: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Option<SystemdNotifier>) -> Self {
        self.notifier = notifier.map(Arc::new);
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Start discovery, reception and the watchdog, then report ready
    pub fn start(&self) -> Result<()> {
        tracing::info!(
            "Starting media server: DMX {}, media '{}', fail mode {}",
            self.config.dmx_label(),
            self.config.dmx.media_path.display(),
            self.config.dmx.fail_mode
        );

        if self.manager.is_available() {
            if let Err(e) = self.manager.start_discovery() {
                tracing::warn!("Stream discovery not started: {}", e);
            }
        } else {
            tracing::info!("Network streams unavailable");
        }

        let orchestrator = self.orchestrator.clone();
        self.receiver
            .on_update(move |group| orchestrator.handle_update(group));
        self.receiver.start()?;

        let watchdog = SignalWatchdog::new(
            self.receiver.clone(),
            self.orchestrator.clone(),
            self.config.dmx.fail_mode,
            self.config.dmx.fail_osd,
        );
        let notifier = self.notifier.clone();
        let worker = watchdog.spawn(self.watchdog_interval, move || {
            if let Some(notifier) = &notifier {
                notifier.watchdog();
            }
        })?;
        *self.watchdog.lock() = Some(worker);

        if let Some(notifier) = &self.notifier {
            notifier.status(&format!("Listening on {}", self.config.dmx_label()));
            notifier.ready();
        }
        tracing::info!("Media server running");
        Ok(())
    }

    /// Reverse of [`start`](Self::start). Idempotent.
    pub fn stop(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.stopping();
        }
        if let Some(worker) = self.watchdog.lock().take() {
            worker.stop(JOIN_TIMEOUT);
        }
        self.receiver.stop();
        self.streams.stop();
        self.manager.shutdown();
        self.player.shutdown();
        tracing::info!("Media server stopped");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn receiver(&self) -> &Arc<FrameReceiver> {
        &self.receiver
    }

    pub fn player(&self) -> &Arc<Player> {
        &self.player
    }

    pub fn streams(&self) -> &Arc<StreamReconnectManager> {
        &self.streams
    }

    pub fn orchestrator(&self) -> &Arc<PlaybackOrchestrator> {
        &self.orchestrator
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(worker) = self.watchdog.get_mut().take() {
            worker.signal();
        }
    }
}
