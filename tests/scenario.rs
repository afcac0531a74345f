//! End-to-end behavior through the public wiring: control frames in,
//! engine calls out.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pi_mediaserver::config::{AppConfig, FailMode};
use pi_mediaserver::dmx::watchdog::{LOST_NOTICE, RESTORED_NOTICE};
use pi_mediaserver::mock::{frame_at, EngineCall, ManualTransport, RecordingConsumerFactory, RecordingFactory};
use pi_mediaserver::player::EngineProperty;
use pi_mediaserver::server::Server;
use tempfile::TempDir;

const UNIVERSE: u16 = 7;
const ADDRESS: u16 = 100;

/// file, folder, playmode, volume, brightness, then neutral effects
fn channels(file: u8, folder: u8) -> [u8; 13] {
    [file, folder, 0, 255, 255, 128, 128, 128, 128, 0, 128, 128, 128]
}

struct Harness {
    media: TempDir,
    server: Server,
    transport: Arc<ManualTransport>,
    engines: RecordingFactory,
}

impl Harness {
    fn new(fail_mode: FailMode) -> Self {
        let media = TempDir::new().unwrap();
        for folder in ["00_empty", "01_loops", "02_show"] {
            fs::create_dir(media.path().join(folder)).unwrap();
        }
        for n in 1..=6 {
            fs::write(media.path().join(format!("02_show/clip{}.mp4", n)), "").unwrap();
        }
        fs::write(media.path().join("01_loops/loop.mp4"), "").unwrap();

        let mut config = AppConfig::default();
        config.dmx.media_path = media.path().to_path_buf();
        config.dmx.universe = UNIVERSE;
        config.dmx.address = ADDRESS;
        config.dmx.fail_mode = fail_mode;
        config.dmx.fail_osd = true;

        let transport = ManualTransport::new();
        let engines = RecordingFactory::new();
        let server = Server::with_components(
            config,
            transport.clone(),
            Arc::new(engines.clone()),
            None,
            Arc::new(RecordingConsumerFactory::new()),
        )
        .with_watchdog_interval(Duration::from_millis(20));
        server.start().unwrap();

        Self {
            media,
            server,
            transport,
            engines,
        }
    }

    fn send(&self, values: &[u8]) {
        self.transport.send_frame(UNIVERSE, frame_at(ADDRESS, values));
    }

    fn wait_for<F: Fn(&[EngineCall]) -> bool>(&self, condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition(&self.engines.calls()) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.stop();
    }
}

fn non_property_calls(calls: &[EngineCall]) -> Vec<EngineCall> {
    calls
        .iter()
        .filter(|c| !matches!(c, EngineCall::Set(_)))
        .cloned()
        .collect()
}

#[test]
fn select_then_stop() {
    let h = Harness::new(FailMode::Hold);

    h.send(&channels(0, 0));
    h.send(&channels(5, 2));
    h.send(&channels(0, 2));

    let calls = h.engines.calls();
    let clip5 = h.media.path().join("02_show/clip5.mp4");
    assert_eq!(
        non_property_calls(&calls),
        vec![
            EngineCall::Stop,
            EngineCall::Play {
                location: clip5.display().to_string(),
                looping: false,
            },
            EngineCall::Stop,
        ]
    );

    // Neutral effects match the player defaults: nothing but the unpause
    // before play reaches the engine.
    let sets: Vec<_> = calls.iter().filter(|c| matches!(c, EngineCall::Set(_))).collect();
    assert_eq!(sets.len(), 1);
    assert!(!h.server.player().is_playing());
}

#[test]
fn steady_frames_are_ignored() {
    let h = Harness::new(FailMode::Hold);
    h.send(&channels(1, 1));
    let before = h.engines.calls().len();
    for _ in 0..20 {
        h.send(&channels(1, 1));
    }
    assert_eq!(h.engines.calls().len(), before);
}

#[test]
fn other_universes_are_ignored() {
    let h = Harness::new(FailMode::Hold);
    h.transport.send_frame(UNIVERSE + 1, frame_at(ADDRESS, &channels(1, 1)));
    assert!(h.engines.calls().is_empty());
}

#[test]
fn hold_keeps_playing_and_notifies_on_loss() {
    let h = Harness::new(FailMode::Hold);
    h.transport.set_available(UNIVERSE, true);
    h.send(&channels(1, 1));
    // let the watchdog observe the live link
    thread::sleep(Duration::from_millis(100));

    h.transport.set_available(UNIVERSE, false);
    assert!(h.wait_for(|calls| calls.contains(&EngineCall::Message(LOST_NOTICE.into()))));
    assert!(h.server.player().is_playing());

    let stops = h.engines.calls().iter().filter(|c| **c == EngineCall::Stop).count();
    assert_eq!(stops, 0);
}

#[test]
fn blackout_stops_and_restore_reapplies() {
    let h = Harness::new(FailMode::Blackout);
    h.transport.set_available(UNIVERSE, true);
    h.send(&channels(1, 1));
    thread::sleep(Duration::from_millis(100));

    h.transport.set_available(UNIVERSE, false);
    assert!(h.wait_for(|calls| calls.contains(&EngineCall::Stop)));
    assert!(!h.server.player().is_playing());
    // further polls while the link stays down do not stop again
    thread::sleep(Duration::from_millis(100));
    let stops = h.engines.calls().iter().filter(|c| **c == EngineCall::Stop).count();
    assert_eq!(stops, 1);

    h.engines.clear();
    h.transport.set_available(UNIVERSE, true);
    assert!(h.wait_for(|calls| calls.contains(&EngineCall::Message(RESTORED_NOTICE.into()))));
    assert!(h.wait_for(|calls| calls.iter().any(|c| matches!(c, EngineCall::Play { .. }))));
    assert!(h.server.player().is_playing());

    thread::sleep(Duration::from_millis(100));
    let volume_sets = h
        .engines
        .calls()
        .iter()
        .filter(|c| matches!(c, EngineCall::Set(EngineProperty::Volume(_))))
        .count();
    assert_eq!(volume_sets, 1);
}
