//! DMX → playback translation
//!
//! Runs on the transport's delivery thread, one update at a time. Stream
//! connects run on a helper thread so frame delivery never waits on the
//! network.

use std::sync::Arc;
use std::time::Duration;

use crate::config::FailMode;
use crate::dmx::{ChannelGroup, FailsafeActions, PlayMode};
use crate::media::{MediaResolver, MediaTarget};
use crate::player::Player;
use crate::stream::StreamReconnectManager;

pub struct PlaybackOrchestrator {
    player: Arc<Player>,
    resolver: MediaResolver,
    streams: Arc<StreamReconnectManager>,
    fail_mode: FailMode,
}

impl PlaybackOrchestrator {
    pub fn new(
        player: Arc<Player>,
        resolver: MediaResolver,
        streams: Arc<StreamReconnectManager>,
        fail_mode: FailMode,
    ) -> Self {
        Self {
            player,
            resolver,
            streams,
            fail_mode,
        }
    }

    pub fn player(&self) -> &Arc<Player> {
        &self.player
    }

    pub fn streams(&self) -> &Arc<StreamReconnectManager> {
        &self.streams
    }

    /// Apply one relevant DMX change
    pub fn handle_update(&self, group: &ChannelGroup) {
        self.player.set_volume(i32::from(group.volume()));
        self.player.set_brightness(i32::from(group.brightness()));

        if group.video_effects_changed() {
            self.apply_effects(group);
        }

        if group.playmode_changed() {
            match group.play_mode() {
                PlayMode::Pause => self.player.set_paused(true),
                mode => {
                    self.player.set_paused(false);
                    self.player.set_loop(mode == PlayMode::Loop);
                }
            }
        }

        if group.file_changed() {
            self.select(group, false);
        }
    }

    /// All eight effect parameters together
    fn apply_effects(&self, group: &ChannelGroup) {
        self.player.set_contrast(group.contrast());
        self.player.set_saturation(group.saturation());
        self.player.set_gamma(group.gamma());
        self.player.set_speed(group.speed());
        self.player.set_rotation(group.rotation());
        self.player.set_zoom(group.zoom());
        self.player.set_pan_x(group.pan_x());
        self.player.set_pan_y(group.pan_y());
    }

    /// Act on the file/folder selection. With `only_if_different` a target
    /// that is already loaded is left alone.
    fn select(&self, group: &ChannelGroup, only_if_different: bool) {
        let file = usize::from(group.file_index());
        let folder = usize::from(group.folder_index());

        if file == 0 {
            if self.streams.is_active() && self.fail_mode == FailMode::Hold {
                tracing::info!("Ignoring stop while stream is held");
                return;
            }
            if only_if_different && !self.player.is_playing() && !self.streams.is_active() {
                return;
            }
            tracing::info!("DMX: stop");
            self.stop_all();
            return;
        }

        match self.resolver.resolve(folder, file) {
            None => {
                tracing::warn!("No media for folder {}, file {}", folder, file);
                self.stop_all();
            }
            Some(MediaTarget::Stream(source)) => self.dispatch_stream(source),
            Some(target) => {
                let location = target.location();
                if only_if_different && self.player.current_path().as_deref() == Some(&location) {
                    return;
                }
                if self.streams.is_active() {
                    self.streams.stop();
                }
                self.player.set_stream_active(false);
                tracing::info!("DMX: play '{}' (folder {}, file {})", location, folder, file);
                self.player.play(&location, group.loop_enabled());
            }
        }
    }

    /// Connect to a stream source without blocking the caller
    fn dispatch_stream(&self, source: String) {
        if self.streams.desired_source().as_deref() == Some(&source) {
            tracing::debug!("Stream '{}' already selected", source);
            return;
        }
        self.player.stop();
        self.player.set_stream_active(true);
        tracing::info!("DMX: stream '{}'", source);
        if !self.streams.play_async(&source) && !self.streams.is_active() {
            self.player.set_stream_active(false);
        }
    }

    /// Stop file and stream output
    pub fn stop_all(&self) {
        if self.streams.is_active() {
            self.streams.stop();
        }
        self.player.set_stream_active(false);
        self.player.stop();
    }
}

impl FailsafeActions for PlaybackOrchestrator {
    fn blackout(&self) {
        tracing::warn!("Blackout: stopping playback");
        self.stop_all();
    }

    fn show_notice(&self, text: &str, duration: Duration) {
        self.player.show_message(text, duration);
    }

    fn reapply(&self, channels: &ChannelGroup) {
        if !channels.has_received() {
            return;
        }
        tracing::info!("Reapplying DMX state");
        self.select(channels, true);
        self.player.apply_state(&channels.player_state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmx::offsets;
    use crate::mock::{frame_at, EngineCall, FakeStreamSdk, RecordingConsumerFactory, RecordingFactory};
    use crate::player::EngineProperty;
    use crate::stream::{Bandwidth, Phase, ReconnectTiming, StreamManager};
    use std::fs;
    use std::path::Path;
    use std::thread;
    use std::time::Instant;
    use tempfile::TempDir;

    const NEUTRAL: [u8; 13] = [0, 0, 0, 255, 255, 128, 128, 128, 128, 0, 128, 128, 128];

    struct Fixture {
        _media: TempDir,
        root: std::path::PathBuf,
        engines: RecordingFactory,
        sdk: Arc<FakeStreamSdk>,
        group: ChannelGroup,
        orchestrator: PlaybackOrchestrator,
    }

    fn media_tree(root: &Path) {
        for (folder, files) in [
            ("0_intro", vec!["clip1.mp4", "clip2.mp4"]),
            ("1_live", vec!["camera.ndi", "empty.txt", "web.txt"]),
        ] {
            let dir = root.join(folder);
            fs::create_dir(&dir).unwrap();
            for file in files {
                fs::write(dir.join(file), "").unwrap();
            }
        }
        fs::write(root.join("1_live/camera.ndi"), "ndi://STUDIO (Cam 1)\n").unwrap();
        fs::write(root.join("1_live/web.txt"), "https://example.com/live.m3u8\n").unwrap();
    }

    fn fixture(fail_mode: FailMode) -> Fixture {
        let media = TempDir::new().unwrap();
        let root = media.path().to_path_buf();
        media_tree(&root);

        let engines = RecordingFactory::new();
        let player = Arc::new(Player::new(Arc::new(engines.clone())));
        let sdk = FakeStreamSdk::new();
        let manager = Arc::new(StreamManager::new(Some(sdk.clone()), Bandwidth::Lowest));
        let timing = ReconnectTiming {
            poll: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(500),
            frame_timeout: Duration::from_secs(5),
            health_interval: Duration::from_millis(50),
        };
        let streams = Arc::new(StreamReconnectManager::with_timing(
            manager,
            Arc::new(RecordingConsumerFactory::new()),
            None,
            timing,
        ));
        let orchestrator =
            PlaybackOrchestrator::new(player, MediaResolver::new(&root), streams, fail_mode);
        Fixture {
            _media: media,
            root,
            engines,
            sdk,
            group: ChannelGroup::new(1),
            orchestrator,
        }
    }

    impl Fixture {
        fn feed(&mut self, values: &[u8]) {
            self.group.update(&frame_at(1, values));
            if self.group.has_relevant_change() {
                self.orchestrator.handle_update(&self.group);
            }
        }

        fn playback_calls(&self) -> Vec<EngineCall> {
            self.engines
                .calls()
                .into_iter()
                .filter(|c| !matches!(c, EngineCall::Set(_)))
                .collect()
        }
    }

    fn with(pairs: &[(usize, u8)]) -> [u8; 13] {
        let mut values = NEUTRAL;
        for &(offset, value) in pairs {
            values[offset] = value;
        }
        values
    }

    fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        f()
    }

    #[test]
    fn test_selects_and_stops() {
        let mut f = fixture(FailMode::Hold);
        f.feed(&NEUTRAL);
        f.feed(&with(&[(offsets::FILE, 2)]));
        f.feed(&with(&[(offsets::FILE, 0)]));

        let clip2 = f.root.join("0_intro/clip2.mp4").display().to_string();
        assert_eq!(
            f.playback_calls(),
            vec![
                EngineCall::Stop,
                EngineCall::Play {
                    location: clip2,
                    looping: false
                },
                EngineCall::Stop,
            ]
        );
    }

    #[test]
    fn test_out_of_range_stops() {
        let mut f = fixture(FailMode::Hold);
        f.feed(&with(&[(offsets::FILE, 1)]));
        f.feed(&with(&[(offsets::FILE, 99)]));
        assert_eq!(f.playback_calls().last(), Some(&EngineCall::Stop));
        assert!(!f.orchestrator.player().is_playing());
    }

    #[test]
    fn test_loop_mode_passed_to_play() {
        let mut f = fixture(FailMode::Hold);
        f.feed(&with(&[(offsets::FILE, 1), (offsets::PLAYMODE, 200)]));
        assert!(f.playback_calls().contains(&EngineCall::Play {
            location: f.root.join("0_intro/clip1.mp4").display().to_string(),
            looping: true
        }));
    }

    #[test]
    fn test_pause_then_loop_without_play() {
        let mut f = fixture(FailMode::Hold);
        f.feed(&with(&[(offsets::FILE, 1)]));
        f.feed(&with(&[(offsets::FILE, 1), (offsets::PLAYMODE, 100)]));
        assert!(f.orchestrator.player().state().paused);

        f.feed(&with(&[(offsets::FILE, 1), (offsets::PLAYMODE, 255)]));
        let state = f.orchestrator.player().state();
        assert!(!state.paused);
        assert!(state.looping);
    }

    #[test]
    fn test_effects_pushed_together() {
        let mut f = fixture(FailMode::Hold);
        f.feed(&NEUTRAL);
        f.engines.clear();
        f.feed(&with(&[(offsets::CONTRAST, 255), (offsets::ZOOM, 255)]));
        let sets: Vec<_> = f
            .engines
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Set(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(sets, vec![EngineProperty::Contrast(100), EngineProperty::Zoom(2.0)]);
    }

    #[test]
    fn test_url_pointer_plays_url() {
        let mut f = fixture(FailMode::Hold);
        f.feed(&with(&[(offsets::FOLDER, 1), (offsets::FILE, 3)]));
        assert_eq!(
            f.orchestrator.player().current_path().as_deref(),
            Some("https://example.com/live.m3u8")
        );

        // Empty pointer resolves to nothing
        f.feed(&with(&[(offsets::FOLDER, 1), (offsets::FILE, 2)]));
        assert_eq!(f.orchestrator.player().current_path(), None);
    }

    #[test]
    fn test_stream_pointer_dispatches() {
        let mut f = fixture(FailMode::Hold);
        f.sdk.set_live("STUDIO (Cam 1)", 4, 2);
        f.feed(&with(&[(offsets::FOLDER, 1), (offsets::FILE, 1)]));

        let streams = f.orchestrator.streams().clone();
        assert!(wait_until(Duration::from_secs(2), || streams.phase() == Phase::Playing));
        assert_eq!(streams.desired_source().as_deref(), Some("STUDIO (Cam 1)"));
        assert!(f.orchestrator.player().is_stream_active());
    }

    #[test]
    fn test_hold_ignores_stop_during_stream() {
        let mut f = fixture(FailMode::Hold);
        f.sdk.set_live("STUDIO (Cam 1)", 4, 2);
        f.feed(&with(&[(offsets::FOLDER, 1), (offsets::FILE, 1)]));
        f.feed(&with(&[(offsets::FOLDER, 1), (offsets::FILE, 0)]));

        let streams = f.orchestrator.streams().clone();
        assert!(wait_until(Duration::from_secs(2), || streams.phase() == Phase::Playing));
        assert!(streams.is_active());
    }

    #[test]
    fn test_blackout_mode_stops_stream() {
        let mut f = fixture(FailMode::Blackout);
        f.sdk.set_live("STUDIO (Cam 1)", 4, 2);
        f.feed(&with(&[(offsets::FOLDER, 1), (offsets::FILE, 1)]));
        let streams = f.orchestrator.streams().clone();
        assert!(wait_until(Duration::from_secs(2), || streams.phase() == Phase::Playing));

        f.feed(&with(&[(offsets::FOLDER, 1), (offsets::FILE, 0)]));
        assert!(!streams.is_active());
        assert!(!f.orchestrator.player().is_stream_active());
    }

    #[test]
    fn test_file_selection_replaces_stream() {
        let mut f = fixture(FailMode::Hold);
        f.sdk.set_live("STUDIO (Cam 1)", 4, 2);
        f.feed(&with(&[(offsets::FOLDER, 1), (offsets::FILE, 1)]));
        let streams = f.orchestrator.streams().clone();
        assert!(wait_until(Duration::from_secs(2), || streams.phase() == Phase::Playing));

        f.feed(&with(&[(offsets::FOLDER, 0), (offsets::FILE, 1)]));
        assert!(!streams.is_active());
        assert!(f.orchestrator.player().is_playing());
    }

    #[test]
    fn test_reapply_after_blackout_resumes_file() {
        let mut f = fixture(FailMode::Blackout);
        f.feed(&with(&[(offsets::FILE, 1)]));
        f.orchestrator.blackout();
        assert!(!f.orchestrator.player().is_playing());

        f.engines.clear();
        f.orchestrator.reapply(&f.group);
        let calls = f.engines.calls();
        assert!(calls.contains(&EngineCall::Play {
            location: f.root.join("0_intro/clip1.mp4").display().to_string(),
            looping: false
        }));
        assert_eq!(calls.iter().filter(|c| matches!(c, EngineCall::Set(_))).count(), 13);
    }

    #[test]
    fn test_reapply_keeps_running_file() {
        let mut f = fixture(FailMode::Hold);
        f.feed(&with(&[(offsets::FILE, 1)]));
        f.engines.clear();
        f.orchestrator.reapply(&f.group);
        assert!(f
            .engines
            .calls()
            .iter()
            .all(|c| matches!(c, EngineCall::Set(_))));
    }
}
