//! Typed player controller
//!
//! Every setter clamps its input, compares it with the cached value and only
//! forwards real changes to the engine. After `MAX_ENGINE_ERRORS` consecutive
//! engine failures the engine is recreated and the cached state replayed,
//! unless a stream session currently owns the output.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::MAX_ENGINE_ERRORS;
use crate::dmx::{PlayerState, Rotation};
use crate::error::PlayerError;
use crate::player::engine::{EngineFactory, EngineProperty, PlaybackEngine};

/// DMX volume (0-255) to engine percent
pub fn volume_percent(volume: u8) -> u8 {
    (f64::from(volume) * 100.0 / 255.0).round() as u8
}

/// DMX brightness (0-255) to engine brightness (-100..=0)
pub fn brightness_offset(brightness: u8) -> i32 {
    (f64::from(brightness) * 100.0 / 255.0).round() as i32 - 100
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

struct Inner {
    engine: Option<Box<dyn PlaybackEngine>>,
    state: PlayerState,
    current: Option<String>,
    consecutive_errors: u32,
}

/// Playback controller owning the engine handle
pub struct Player {
    factory: Arc<dyn EngineFactory>,
    inner: Mutex<Inner>,
    stream_active: AtomicBool,
}

impl Player {
    /// Create the controller and its first engine. A failed first engine is
    /// retried on the next command.
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        let engine = match factory.create() {
            Ok(engine) => Some(engine),
            Err(e) => {
                tracing::error!("Failed to start playback engine: {}", e);
                None
            }
        };
        Self {
            factory,
            inner: Mutex::new(Inner {
                engine,
                state: PlayerState::default(),
                current: None,
                consecutive_errors: 0,
            }),
            stream_active: AtomicBool::new(false),
        }
    }

    // ----- Engine access -----

    /// Run one engine operation with error counting and recovery
    fn send<F>(&self, inner: &mut Inner, what: &str, op: F) -> bool
    where
        F: FnOnce(&mut dyn PlaybackEngine) -> Result<(), PlayerError>,
    {
        if inner.engine.is_none() && !self.stream_active.load(Ordering::SeqCst) {
            self.recover(inner);
        }
        let Some(engine) = inner.engine.as_mut() else {
            tracing::debug!("Player: no engine for {}", what);
            return false;
        };

        match op(engine.as_mut()) {
            Ok(()) => {
                inner.consecutive_errors = 0;
                true
            }
            Err(e) => {
                inner.consecutive_errors += 1;
                tracing::warn!(
                    "Player: {} failed ({}/{}): {}",
                    what,
                    inner.consecutive_errors,
                    MAX_ENGINE_ERRORS,
                    e
                );
                if inner.consecutive_errors >= MAX_ENGINE_ERRORS {
                    if self.stream_active.load(Ordering::SeqCst) {
                        tracing::debug!("Player: recovery suppressed while a stream is active");
                    } else {
                        self.recover(inner);
                    }
                }
                false
            }
        }
    }

    /// Recreate the engine and replay all cached state into it
    fn recover(&self, inner: &mut Inner) {
        if let Some(mut old) = inner.engine.take() {
            tracing::warn!("Player: recreating playback engine");
            old.shutdown();
        }
        inner.consecutive_errors = 0;

        let mut engine = match self.factory.create() {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!("Player: engine recreation failed: {}", e);
                return;
            }
        };

        for property in properties(&inner.state) {
            if let Err(e) = engine.set_property(property) {
                tracing::warn!("Player: replay of {} failed: {}", property.name(), e);
            }
        }
        if let Some(location) = &inner.current {
            if let Err(e) = engine.play(location, inner.state.looping) {
                tracing::warn!("Player: replay of '{}' failed: {}", location, e);
            } else if inner.state.paused {
                if let Err(e) = engine.set_property(EngineProperty::Paused(true)) {
                    tracing::warn!("Player: replay of pause failed: {}", e);
                }
            }
        }
        inner.engine = Some(engine);
        tracing::info!("Player: engine recovered");
    }

    fn set_if_changed<T, G>(&self, value: T, get: G, property: EngineProperty)
    where
        T: PartialEq + Copy,
        G: FnOnce(&mut PlayerState) -> &mut T,
    {
        let mut inner = self.inner.lock();
        let slot = get(&mut inner.state);
        if *slot == value {
            return;
        }
        *slot = value;
        self.send(&mut inner, property.name(), |engine| engine.set_property(property));
    }

    // ----- Continuous controls -----

    /// Volume on the DMX scale, clamped to 0-255
    pub fn set_volume(&self, value: i32) {
        let volume = value.clamp(0, 255) as u8;
        self.set_if_changed(
            volume,
            |s| &mut s.volume,
            EngineProperty::Volume(volume_percent(volume)),
        );
    }

    /// Brightness on the DMX scale, clamped to 0-255
    pub fn set_brightness(&self, value: i32) {
        let brightness = value.clamp(0, 255) as u8;
        self.set_if_changed(
            brightness,
            |s| &mut s.brightness,
            EngineProperty::Brightness(brightness_offset(brightness)),
        );
    }

    pub fn set_contrast(&self, value: i32) {
        let value = value.clamp(-100, 100);
        self.set_if_changed(value, |s| &mut s.contrast, EngineProperty::Contrast(value));
    }

    pub fn set_saturation(&self, value: i32) {
        let value = value.clamp(-100, 100);
        self.set_if_changed(value, |s| &mut s.saturation, EngineProperty::Saturation(value));
    }

    pub fn set_gamma(&self, value: i32) {
        let value = value.clamp(-100, 100);
        self.set_if_changed(value, |s| &mut s.gamma, EngineProperty::Gamma(value));
    }

    pub fn set_speed(&self, value: f64) {
        let value = round2(value).clamp(0.25, 4.0);
        self.set_if_changed(value, |s| &mut s.speed, EngineProperty::Speed(value));
    }

    pub fn set_rotation(&self, rotation: Rotation) {
        self.set_if_changed(
            rotation,
            |s| &mut s.rotation,
            EngineProperty::Rotation(rotation.degrees()),
        );
    }

    /// Rotation in degrees, snapped to the nearest quarter turn
    pub fn set_rotation_degrees(&self, degrees: i32) {
        self.set_rotation(Rotation::nearest(degrees));
    }

    /// Zoom factor, clamped to 0.1-2.0
    pub fn set_zoom(&self, value: f64) {
        let value = round2(value).clamp(0.1, 2.0);
        self.set_if_changed(value, |s| &mut s.zoom, EngineProperty::Zoom(value));
    }

    pub fn set_pan_x(&self, value: f64) {
        let value = round2(value).clamp(-1.0, 1.0);
        self.set_if_changed(value, |s| &mut s.pan_x, EngineProperty::PanX(value));
    }

    pub fn set_pan_y(&self, value: f64) {
        let value = round2(value).clamp(-1.0, 1.0);
        self.set_if_changed(value, |s| &mut s.pan_y, EngineProperty::PanY(value));
    }

    pub fn set_paused(&self, paused: bool) {
        let before = self.inner.lock().state.paused;
        self.set_if_changed(paused, |s| &mut s.paused, EngineProperty::Paused(paused));
        if before != paused {
            tracing::info!("Playback {}", if paused { "paused" } else { "resumed" });
        }
    }

    pub fn set_loop(&self, looping: bool) {
        self.set_if_changed(looping, |s| &mut s.looping, EngineProperty::Loop(looping));
    }

    /// Push a complete state in one locked sequence, bypassing the
    /// unchanged-value check.
    pub fn apply_state(&self, state: &PlayerState) {
        let mut inner = self.inner.lock();
        let mut clamped = *state;
        clamped.contrast = clamped.contrast.clamp(-100, 100);
        clamped.saturation = clamped.saturation.clamp(-100, 100);
        clamped.gamma = clamped.gamma.clamp(-100, 100);
        clamped.speed = round2(clamped.speed).clamp(0.25, 4.0);
        clamped.zoom = round2(clamped.zoom).clamp(0.1, 2.0);
        clamped.pan_x = round2(clamped.pan_x).clamp(-1.0, 1.0);
        clamped.pan_y = round2(clamped.pan_y).clamp(-1.0, 1.0);
        inner.state = clamped;

        for property in properties(&clamped) {
            self.send(&mut inner, property.name(), |engine| engine.set_property(property));
        }
    }

    // ----- Playback -----

    /// Start playing a file path or URL
    pub fn play(&self, location: &str, looping: bool) {
        let mut inner = self.inner.lock();
        inner.state.looping = looping;
        inner.state.paused = false;
        inner.current = Some(location.to_string());
        self.send(&mut inner, "play", |engine| {
            engine.set_property(EngineProperty::Paused(false))?;
            engine.play(location, looping)
        });
        tracing::info!("Playing '{}' | loop={}", location, if looping { "on" } else { "off" });
    }

    /// Stop playback. The engine stays alive and idle.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        let was_playing = inner.current.take().is_some();
        inner.state.paused = false;
        self.send(&mut inner, "stop", |engine| engine.stop());
        if was_playing {
            tracing::info!("Playback stopped");
        }
    }

    pub fn show_message(&self, text: &str, duration: Duration) {
        let mut inner = self.inner.lock();
        self.send(&mut inner, "show_message", |engine| engine.show_message(text, duration));
    }

    // ----- Introspection -----

    /// Location currently loaded, if any
    pub fn current_path(&self) -> Option<String> {
        self.inner.lock().current.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().current.is_some()
    }

    /// Cached control state
    pub fn state(&self) -> PlayerState {
        self.inner.lock().state
    }

    /// Mark a stream session as owning the output
    pub fn set_stream_active(&self, active: bool) {
        self.stream_active.store(active, Ordering::SeqCst);
    }

    pub fn is_stream_active(&self) -> bool {
        self.stream_active.load(Ordering::SeqCst)
    }

    /// Terminate the engine
    pub fn shutdown(&self) {
        if let Some(mut engine) = self.inner.lock().engine.take() {
            engine.shutdown();
        }
        tracing::info!("Player shut down");
    }
}

/// Engine writes for a full state
fn properties(state: &PlayerState) -> [EngineProperty; 12] {
    [
        EngineProperty::Volume(volume_percent(state.volume)),
        EngineProperty::Brightness(brightness_offset(state.brightness)),
        EngineProperty::Contrast(state.contrast),
        EngineProperty::Saturation(state.saturation),
        EngineProperty::Gamma(state.gamma),
        EngineProperty::Speed(state.speed),
        EngineProperty::Rotation(state.rotation.degrees()),
        EngineProperty::Zoom(state.zoom),
        EngineProperty::PanX(state.pan_x),
        EngineProperty::PanY(state.pan_y),
        EngineProperty::Paused(state.paused),
        EngineProperty::Loop(state.looping),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{EngineCall, RecordingFactory};

    fn player() -> (Player, RecordingFactory) {
        let factory = RecordingFactory::new();
        (Player::new(Arc::new(factory.clone())), factory)
    }

    #[test]
    fn test_mappings() {
        assert_eq!(volume_percent(0), 0);
        assert_eq!(volume_percent(255), 100);
        assert_eq!(volume_percent(128), 50);
        assert_eq!(brightness_offset(0), -100);
        assert_eq!(brightness_offset(255), 0);
    }

    #[test]
    fn test_unchanged_values_are_not_forwarded() {
        let (player, factory) = player();
        player.set_volume(255);
        player.set_contrast(0);
        assert!(factory.calls().is_empty());

        player.set_volume(128);
        player.set_volume(128);
        assert_eq!(
            factory.calls(),
            vec![EngineCall::Set(EngineProperty::Volume(50))]
        );
    }

    #[test]
    fn test_setters_clamp() {
        let (player, factory) = player();
        player.set_contrast(500);
        player.set_speed(10.0);
        player.set_pan_x(-3.0);
        player.set_volume(-20);
        let state = player.state();
        assert_eq!(state.contrast, 100);
        assert_eq!(state.speed, 4.0);
        assert_eq!(state.pan_x, -1.0);
        assert_eq!(state.volume, 0);
        assert_eq!(factory.calls().len(), 4);
    }

    #[test]
    fn test_rotation_snaps() {
        let (player, factory) = player();
        player.set_rotation_degrees(100);
        player.set_rotation_degrees(80);
        assert_eq!(player.state().rotation, Rotation::Deg90);
        assert_eq!(
            factory.calls(),
            vec![EngineCall::Set(EngineProperty::Rotation(90))]
        );
    }

    #[test]
    fn test_play_and_stop_always_forward() {
        let (player, factory) = player();
        player.stop();
        player.play("/media/a.mp4", true);
        assert_eq!(player.current_path().as_deref(), Some("/media/a.mp4"));
        assert!(player.state().looping);
        player.stop();
        assert!(!player.is_playing());

        let calls: Vec<_> = factory
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, EngineCall::Set(_)))
            .collect();
        assert_eq!(
            calls,
            vec![
                EngineCall::Stop,
                EngineCall::Play {
                    location: "/media/a.mp4".into(),
                    looping: true
                },
                EngineCall::Stop,
            ]
        );
    }

    #[test]
    fn test_apply_state_forwards_everything() {
        let (player, factory) = player();
        player.apply_state(&PlayerState::default());
        assert_eq!(factory.calls().len(), 12);
    }

    #[test]
    fn test_recovery_after_repeated_failures() {
        let (player, factory) = player();
        player.play("/media/a.mp4", false);
        player.set_volume(100);
        factory.fail_next(MAX_ENGINE_ERRORS as usize);
        player.set_contrast(10);
        player.set_contrast(20);
        assert_eq!(factory.created(), 1);
        player.set_contrast(30);
        assert_eq!(factory.created(), 2);

        // Replayed into the new engine
        let calls = factory.calls();
        assert!(calls.contains(&EngineCall::Set(EngineProperty::Volume(volume_percent(100)))));
        assert_eq!(
            calls.last(),
            Some(&EngineCall::Play {
                location: "/media/a.mp4".into(),
                looping: false
            })
        );
        assert_eq!(player.state().contrast, 30);
    }

    #[test]
    fn test_recovery_replays_pause_after_play() {
        let (player, factory) = player();
        player.play("/media/a.mp4", true);
        player.set_paused(true);
        factory.clear();
        factory.fail_next(MAX_ENGINE_ERRORS as usize);
        for v in 1..=MAX_ENGINE_ERRORS as i32 {
            player.set_gamma(v);
        }
        assert_eq!(factory.created(), 2);

        let calls = factory.calls();
        let play = calls
            .iter()
            .position(|c| matches!(c, EngineCall::Play { .. }))
            .unwrap();
        assert_eq!(calls[play + 1], EngineCall::Set(EngineProperty::Paused(true)));
        assert_eq!(calls.len(), play + 2);
        assert!(player.state().paused);
    }

    #[test]
    fn test_recovery_suppressed_during_stream() {
        let (player, factory) = player();
        player.set_stream_active(true);
        factory.fail_next(10);
        for v in 1..=5 {
            player.set_gamma(v);
        }
        assert_eq!(factory.created(), 1);
    }

    #[test]
    fn test_success_resets_error_count() {
        let (player, factory) = player();
        factory.fail_next(2);
        player.set_gamma(1);
        player.set_gamma(2);
        player.set_gamma(3);
        factory.fail_next(2);
        player.set_gamma(4);
        player.set_gamma(5);
        assert_eq!(factory.created(), 1);
    }
}
