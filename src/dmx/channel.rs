//! DMX channel decoding and change detection
//!
//! Channel layout (13 channels starting at the configured address):
//!
//! | Offset | Function      | Mapping                                           |
//! |--------|---------------|---------------------------------------------------|
//! | 0      | File select   | 0 = stop, 1-255 = file index                      |
//! | 1      | Folder select | 0-255 = folder index                              |
//! | 2      | Play mode     | 0-84 play once, 85-169 pause, 170-255 loop        |
//! | 3      | Volume        | 0 = mute, 255 = full                              |
//! | 4      | Brightness    | 0 = black, 255 = normal                           |
//! | 5      | Contrast      | 0 = -100, 128 = 0, 255 = +100                     |
//! | 6      | Saturation    | as contrast                                       |
//! | 7      | Gamma         | as contrast                                       |
//! | 8      | Speed         | 0 = 0.25x, 128 = 1.0x, 255 = 4.0x                 |
//! | 9      | Rotation      | 0-63 = 0°, 64-127 = 90°, 128-191 = 180°, 192+ 270°|
//! | 10     | Zoom          | 0 = 0.1x, 128 = 1.0x, 255 = 2.0x                  |
//! | 11     | Pan X         | 0 = -1.0, 128 = 0, 255 = +1.0                     |
//! | 12     | Pan Y         | as pan X                                          |

use serde::{Deserialize, Serialize};

use crate::constants::{NUM_CHANNELS, UNIVERSE_SIZE};

/// One full DMX universe
pub type DmxFrame = [u8; UNIVERSE_SIZE];

/// Channel offsets relative to the base address
pub mod offsets {
    pub const FILE: usize = 0;
    pub const FOLDER: usize = 1;
    pub const PLAYMODE: usize = 2;
    pub const VOLUME: usize = 3;
    pub const BRIGHTNESS: usize = 4;
    pub const CONTRAST: usize = 5;
    pub const SATURATION: usize = 6;
    pub const GAMMA: usize = 7;
    pub const SPEED: usize = 8;
    pub const ROTATION: usize = 9;
    pub const ZOOM: usize = 10;
    pub const PAN_X: usize = 11;
    pub const PAN_Y: usize = 12;

    /// Channels that are applied together as one video-effects group
    pub const VIDEO_EFFECTS: [usize; 8] =
        [CONTRAST, SATURATION, GAMMA, SPEED, ROTATION, ZOOM, PAN_X, PAN_Y];
}

/// First raw value of the pause range
pub const PAUSE_THRESHOLD: u8 = 85;
/// First raw value of the loop range
pub const LOOP_THRESHOLD: u8 = 170;

/// Rotation bucket thresholds
pub const ROTATION_90: u8 = 64;
pub const ROTATION_180: u8 = 128;
pub const ROTATION_270: u8 = 192;

/// A single DMX channel that tracks value changes.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Zero-based slot in the frame
    slot: usize,
    /// Last received value; `None` until the first frame
    value: Option<u8>,
    changed: bool,
}

impl Channel {
    /// Create a channel for a 1-based DMX address
    pub fn new(address: u16) -> Self {
        Self {
            slot: usize::from(address.max(1)) - 1,
            value: None,
            changed: false,
        }
    }

    /// Read this channel's slot. `changed` reflects only this call.
    pub fn update(&mut self, frame: &DmxFrame) {
        let new_value = frame.get(self.slot).copied().unwrap_or(0);
        self.changed = self.value != Some(new_value);
        self.value = Some(new_value);
    }

    /// Current value, 0 before the first frame
    pub fn value(&self) -> u8 {
        self.value.unwrap_or(0)
    }

    /// Raw value including the "never received" state
    pub fn raw(&self) -> Option<u8> {
        self.value
    }

    /// True if the value changed in the last update
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Zero-based slot in the frame
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Three-state play mode on the playmode channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayMode {
    Play,
    Pause,
    Loop,
}

impl PlayMode {
    pub fn from_raw(value: u8) -> Self {
        if value >= LOOP_THRESHOLD {
            PlayMode::Loop
        } else if value >= PAUSE_THRESHOLD {
            PlayMode::Pause
        } else {
            PlayMode::Play
        }
    }
}

/// Video rotation snapped to quarter turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_raw(value: u8) -> Self {
        if value >= ROTATION_270 {
            Rotation::Deg270
        } else if value >= ROTATION_180 {
            Rotation::Deg180
        } else if value >= ROTATION_90 {
            Rotation::Deg90
        } else {
            Rotation::Deg0
        }
    }

    /// Snap an arbitrary angle to the nearest quarter turn
    pub fn nearest(degrees: i32) -> Self {
        match ((degrees.rem_euclid(360) + 45) / 90) % 4 {
            1 => Rotation::Deg90,
            2 => Rotation::Deg180,
            3 => Rotation::Deg270,
            _ => Rotation::Deg0,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

/// Snapshot of every continuous control value, pushed to the player in one call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    /// Volume on the DMX scale (0-255)
    pub volume: u8,
    /// Brightness on the DMX scale (0 = black, 255 = normal)
    pub brightness: u8,
    pub contrast: i32,
    pub saturation: i32,
    pub gamma: i32,
    pub speed: f64,
    pub rotation: Rotation,
    /// Zoom factor (1.0 = unscaled)
    pub zoom: f64,
    pub pan_x: f64,
    pub pan_y: f64,
    pub paused: bool,
    pub looping: bool,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            volume: 255,
            brightness: 255,
            contrast: 0,
            saturation: 0,
            gamma: 0,
            speed: 1.0,
            rotation: Rotation::Deg0,
            zoom: 1.0,
            pan_x: 0.0,
            pan_y: 0.0,
            paused: false,
            looping: false,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Map 0-255 to -100..=100 with 128 at zero
pub fn bipolar_percent(raw: u8) -> i32 {
    (f64::from(raw) * 200.0 / 255.0 - 100.0).round() as i32
}

/// Map 0-255 to -1.0..=1.0 with 128 at zero
pub fn bipolar_unit(raw: u8) -> f64 {
    round2(f64::from(raw) * 2.0 / 255.0 - 1.0)
}

/// Two linear segments meeting at raw 128
fn piecewise(raw: u8, low: f64, mid: f64, high: f64) -> f64 {
    let raw = f64::from(raw);
    if raw <= 128.0 {
        round2(low + raw * (mid - low) / 128.0)
    } else {
        round2(mid + (raw - 128.0) * (high - mid) / 127.0)
    }
}

/// Playback speed: 0 → 0.25x, 128 → 1.0x, 255 → 4.0x
pub fn speed_from_raw(raw: u8) -> f64 {
    piecewise(raw, 0.25, 1.0, 4.0)
}

/// Zoom factor: 0 → 0.1x, 128 → 1.0x, 255 → 2.0x
pub fn zoom_from_raw(raw: u8) -> f64 {
    piecewise(raw, 0.1, 1.0, 2.0)
}

/// Ordered group of channels anchored at a base address.
///
/// Re-anchoring is not supported; build a new group for a new address.
#[derive(Debug, Clone)]
pub struct ChannelGroup {
    address: u16,
    channels: Vec<Channel>,
}

impl ChannelGroup {
    /// Create a group starting at `address` (1-512)
    pub fn new(address: u16) -> Self {
        let address = address.clamp(1, UNIVERSE_SIZE as u16);
        let channels = (0..NUM_CHANNELS as u16)
            .map(|i| Channel::new(address + i))
            .collect();
        Self { address, channels }
    }

    /// Base address (1-based)
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Update every channel from a frame
    pub fn update(&mut self, frame: &DmxFrame) {
        for channel in &mut self.channels {
            channel.update(frame);
        }
    }

    /// Current value of the channel at `offset`
    pub fn get(&self, offset: usize) -> u8 {
        self.channels[offset].value()
    }

    /// Check if the channel at `offset` changed in the last update
    pub fn changed(&self, offset: usize) -> bool {
        self.channels[offset].changed()
    }

    /// True once at least one frame has been decoded
    pub fn has_received(&self) -> bool {
        self.channels[offsets::FILE].raw().is_some()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    // ----- Change flags -----

    /// File or folder channel changed
    pub fn file_changed(&self) -> bool {
        self.changed(offsets::FILE) || self.changed(offsets::FOLDER)
    }

    pub fn playmode_changed(&self) -> bool {
        self.changed(offsets::PLAYMODE)
    }

    pub fn volume_changed(&self) -> bool {
        self.changed(offsets::VOLUME)
    }

    pub fn brightness_changed(&self) -> bool {
        self.changed(offsets::BRIGHTNESS)
    }

    /// Any of the eight video-effect channels changed
    pub fn video_effects_changed(&self) -> bool {
        offsets::VIDEO_EFFECTS.iter().any(|&o| self.changed(o))
    }

    /// Something the orchestrator acts on changed
    pub fn has_relevant_change(&self) -> bool {
        self.file_changed()
            || self.volume_changed()
            || self.playmode_changed()
            || self.brightness_changed()
            || self.video_effects_changed()
    }

    // ----- Derived values -----

    /// File index, 0 = stop
    pub fn file_index(&self) -> u8 {
        self.get(offsets::FILE)
    }

    pub fn folder_index(&self) -> u8 {
        self.get(offsets::FOLDER)
    }

    pub fn play_mode(&self) -> PlayMode {
        PlayMode::from_raw(self.get(offsets::PLAYMODE))
    }

    pub fn loop_enabled(&self) -> bool {
        self.play_mode() == PlayMode::Loop
    }

    pub fn pause_enabled(&self) -> bool {
        self.play_mode() == PlayMode::Pause
    }

    pub fn volume(&self) -> u8 {
        self.get(offsets::VOLUME)
    }

    pub fn brightness(&self) -> u8 {
        self.get(offsets::BRIGHTNESS)
    }

    pub fn contrast(&self) -> i32 {
        bipolar_percent(self.get(offsets::CONTRAST))
    }

    pub fn saturation(&self) -> i32 {
        bipolar_percent(self.get(offsets::SATURATION))
    }

    pub fn gamma(&self) -> i32 {
        bipolar_percent(self.get(offsets::GAMMA))
    }

    pub fn speed(&self) -> f64 {
        speed_from_raw(self.get(offsets::SPEED))
    }

    pub fn rotation(&self) -> Rotation {
        Rotation::from_raw(self.get(offsets::ROTATION))
    }

    pub fn zoom(&self) -> f64 {
        zoom_from_raw(self.get(offsets::ZOOM))
    }

    pub fn pan_x(&self) -> f64 {
        bipolar_unit(self.get(offsets::PAN_X))
    }

    pub fn pan_y(&self) -> f64 {
        bipolar_unit(self.get(offsets::PAN_Y))
    }

    /// Full control snapshot derived from the current values
    pub fn player_state(&self) -> PlayerState {
        let mode = self.play_mode();
        PlayerState {
            volume: self.volume(),
            brightness: self.brightness(),
            contrast: self.contrast(),
            saturation: self.saturation(),
            gamma: self.gamma(),
            speed: self.speed(),
            rotation: self.rotation(),
            zoom: self.zoom(),
            pan_x: self.pan_x(),
            pan_y: self.pan_y(),
            paused: mode == PlayMode::Pause,
            looping: mode == PlayMode::Loop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::frame_at;
    use proptest::prelude::*;

    const NEUTRAL: [u8; 13] = [1, 0, 0, 200, 255, 128, 128, 128, 128, 0, 128, 128, 128];

    fn with(offset: usize, value: u8) -> [u8; 13] {
        let mut values = NEUTRAL;
        values[offset] = value;
        values
    }

    fn group_with(offset: usize, value: u8) -> ChannelGroup {
        let mut group = ChannelGroup::new(1);
        group.update(&frame_at(1, &with(offset, value)));
        group
    }

    #[test]
    fn test_channel_initial_state() {
        let channel = Channel::new(1);
        assert_eq!(channel.raw(), None);
        assert!(!channel.changed());
    }

    #[test]
    fn test_first_frame_marks_every_channel_changed() {
        let mut group = ChannelGroup::new(1);
        group.update(&[0u8; UNIVERSE_SIZE]);
        assert!(group.channels().iter().all(Channel::changed));
        assert!(group.has_received());
    }

    #[test]
    fn test_update_is_idempotent() {
        let mut group = ChannelGroup::new(1);
        let frame = frame_at(1, &NEUTRAL);
        group.update(&frame);
        let first = group.player_state();
        group.update(&frame);
        assert!(group.channels().iter().all(|c| !c.changed()));
        assert_eq!(group.player_state(), first);
        assert!(!group.has_relevant_change());
    }

    #[test]
    fn test_changed_is_not_cumulative() {
        let mut group = ChannelGroup::new(1);
        group.update(&frame_at(1, &NEUTRAL));
        group.update(&frame_at(1, &with(offsets::VOLUME, 10)));
        assert!(group.volume_changed());
        group.update(&frame_at(1, &with(offsets::VOLUME, 10)));
        assert!(!group.volume_changed());
    }

    #[test]
    fn test_address_offset() {
        let mut group = ChannelGroup::new(5);
        let frame = frame_at(5, &[42, 3, 200, 180, 128, 128, 128, 128, 128, 0, 128, 128, 128]);
        group.update(&frame);
        assert_eq!(group.file_index(), 42);
        assert_eq!(group.folder_index(), 3);
        assert!(group.loop_enabled());
        assert_eq!(group.volume(), 180);
        assert_eq!(group.brightness(), 128);
    }

    #[test]
    fn test_slots_past_frame_end_read_zero() {
        let mut group = ChannelGroup::new(510);
        let mut frame = [0u8; UNIVERSE_SIZE];
        frame[509] = 7;
        group.update(&frame);
        assert_eq!(group.file_index(), 7);
        assert_eq!(group.get(offsets::PAN_Y), 0);
    }

    #[test]
    fn test_playmode_boundaries() {
        assert_eq!(group_with(offsets::PLAYMODE, 0).play_mode(), PlayMode::Play);
        assert_eq!(group_with(offsets::PLAYMODE, 84).play_mode(), PlayMode::Play);
        assert_eq!(group_with(offsets::PLAYMODE, 85).play_mode(), PlayMode::Pause);
        assert_eq!(group_with(offsets::PLAYMODE, 169).play_mode(), PlayMode::Pause);
        assert_eq!(group_with(offsets::PLAYMODE, 170).play_mode(), PlayMode::Loop);
        assert_eq!(group_with(offsets::PLAYMODE, 255).play_mode(), PlayMode::Loop);
    }

    #[test]
    fn test_bipolar_percent_mapping() {
        assert_eq!(group_with(offsets::CONTRAST, 0).contrast(), -100);
        assert_eq!(group_with(offsets::CONTRAST, 128).contrast(), 0);
        assert_eq!(group_with(offsets::CONTRAST, 255).contrast(), 100);
        assert_eq!(group_with(offsets::SATURATION, 0).saturation(), -100);
        assert_eq!(group_with(offsets::GAMMA, 255).gamma(), 100);
    }

    #[test]
    fn test_speed_mapping() {
        assert_eq!(speed_from_raw(0), 0.25);
        assert_eq!(speed_from_raw(64), 0.63);
        assert_eq!(speed_from_raw(128), 1.0);
        assert_eq!(speed_from_raw(255), 4.0);
    }

    #[test]
    fn test_rotation_buckets() {
        assert_eq!(Rotation::from_raw(0), Rotation::Deg0);
        assert_eq!(Rotation::from_raw(63), Rotation::Deg0);
        assert_eq!(Rotation::from_raw(64), Rotation::Deg90);
        assert_eq!(Rotation::from_raw(127), Rotation::Deg90);
        assert_eq!(Rotation::from_raw(128), Rotation::Deg180);
        assert_eq!(Rotation::from_raw(191), Rotation::Deg180);
        assert_eq!(Rotation::from_raw(192), Rotation::Deg270);
        assert_eq!(Rotation::from_raw(255).degrees(), 270);
    }

    #[test]
    fn test_rotation_nearest() {
        assert_eq!(Rotation::nearest(10), Rotation::Deg0);
        assert_eq!(Rotation::nearest(100), Rotation::Deg90);
        assert_eq!(Rotation::nearest(-90), Rotation::Deg270);
        assert_eq!(Rotation::nearest(350), Rotation::Deg0);
    }

    #[test]
    fn test_zoom_and_pan_mapping() {
        assert_eq!(zoom_from_raw(0), 0.1);
        assert_eq!(zoom_from_raw(128), 1.0);
        assert_eq!(zoom_from_raw(255), 2.0);
        assert_eq!(bipolar_unit(0), -1.0);
        assert_eq!(bipolar_unit(128), 0.0);
        assert_eq!(bipolar_unit(255), 1.0);
    }

    #[test]
    fn test_change_flags_are_separate() {
        let mut group = ChannelGroup::new(1);
        group.update(&frame_at(1, &NEUTRAL));

        group.update(&frame_at(1, &with(offsets::ZOOM, 10)));
        assert!(group.video_effects_changed());
        assert!(!group.file_changed());
        assert!(!group.playmode_changed());

        group.update(&frame_at(1, &with(offsets::FOLDER, 2)));
        assert!(group.file_changed());
        assert!(!group.video_effects_changed());

        group.update(&frame_at(1, &[1, 2, 100, 200, 255, 128, 128, 128, 128, 0, 128, 128, 128]));
        assert!(group.playmode_changed());
        assert!(!group.file_changed());
        assert!(!group.video_effects_changed());
    }

    #[test]
    fn test_volume_and_brightness_not_video_effects() {
        let mut group = ChannelGroup::new(1);
        group.update(&frame_at(1, &NEUTRAL));
        group.update(&frame_at(1, &with(offsets::BRIGHTNESS, 0)));
        assert!(group.brightness_changed());
        assert!(!group.video_effects_changed());
        assert!(group.has_relevant_change());
    }

    #[test]
    fn test_player_state_snapshot() {
        let mut group = ChannelGroup::new(1);
        group.update(&frame_at(1, &[3, 1, 100, 255, 0, 0, 255, 128, 255, 200, 128, 0, 255]));
        let state = group.player_state();
        assert_eq!(state.volume, 255);
        assert_eq!(state.brightness, 0);
        assert_eq!(state.contrast, -100);
        assert_eq!(state.saturation, 100);
        assert_eq!(state.gamma, 0);
        assert_eq!(state.speed, 4.0);
        assert_eq!(state.rotation, Rotation::Deg270);
        assert_eq!(state.zoom, 1.0);
        assert_eq!(state.pan_x, -1.0);
        assert_eq!(state.pan_y, 1.0);
        assert!(state.paused);
        assert!(!state.looping);
    }

    proptest! {
        #[test]
        fn prop_group_reads_its_window(
            address in 1u16..=500,
            frame in proptest::collection::vec(any::<u8>(), UNIVERSE_SIZE),
        ) {
            let mut data = [0u8; UNIVERSE_SIZE];
            data.copy_from_slice(&frame);
            let mut group = ChannelGroup::new(address);
            group.update(&data);
            let start = usize::from(address) - 1;
            for offset in 0..NUM_CHANNELS {
                prop_assert_eq!(group.get(offset), data[start + offset]);
            }
        }

        #[test]
        fn prop_second_identical_update_changes_nothing(
            address in 1u16..=500,
            frame in proptest::collection::vec(any::<u8>(), UNIVERSE_SIZE),
        ) {
            let mut data = [0u8; UNIVERSE_SIZE];
            data.copy_from_slice(&frame);
            let mut group = ChannelGroup::new(address);
            group.update(&data);
            let state = group.player_state();
            group.update(&data);
            prop_assert!(!group.has_relevant_change());
            prop_assert_eq!(group.player_state(), state);
        }
    }
}
