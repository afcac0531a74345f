//! Network video runtime capability
//!
//! The native runtime is consumed through two traits: `StreamSdk` for
//! discovery and receiver creation, `StreamReceiver` for capturing from one
//! connection. Dropping a receiver destroys it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::StreamError;

/// Receive bandwidth tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Bandwidth {
    /// Reduced-quality proxy stream, suitable for WiFi
    #[default]
    Lowest,
    /// Full quality
    Highest,
}

impl Bandwidth {
    /// Parse a tier name; anything unknown is `Lowest`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "highest" => Self::Highest,
            "lowest" => Self::Lowest,
            other => {
                tracing::warn!("Invalid bandwidth '{}', using 'lowest'", other);
                Self::Lowest
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lowest => "lowest",
            Self::Highest => "highest",
        }
    }
}

impl From<String> for Bandwidth {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Bandwidth> for String {
    fn from(bandwidth: Bandwidth) -> Self {
        bandwidth.as_str().to_string()
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tightly packed BGRA video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            data: data.into(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Interleaved signed 16-bit PCM
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u32,
    pub data: Bytes,
}

/// Outcome of one capture call
#[derive(Debug, Clone)]
pub enum Capture {
    /// Timed out without a frame
    None,
    Video(VideoFrame),
    Audio(AudioFrame),
    Metadata(String),
    StatusChange,
    SourceChange,
    /// Connection lost
    Error,
}

/// One connection to a source
pub trait StreamReceiver: Send {
    /// Wait up to `timeout` for the next frame. Frame memory is owned by
    /// the returned value.
    fn capture(&mut self, timeout: Duration) -> Capture;

    /// Tell the sender we are on program/preview
    fn set_tally(&mut self, _on_program: bool, _on_preview: bool) {}

    /// Send an XML metadata element to the sender
    fn send_metadata(&mut self, _xml: &str) {}
}

/// Discovery and receiver creation
pub trait StreamSdk: Send + Sync {
    /// Names of currently visible sources
    fn find_sources(&self, timeout: Duration) -> Result<Vec<String>, StreamError>;

    fn connect(
        &self,
        source: &str,
        bandwidth: Bandwidth,
        receiver_name: &str,
    ) -> Result<Box<dyn StreamReceiver>, StreamError>;
}

/// Largest frame height accepted from the runtime
pub const MAX_FRAME_HEIGHT: u32 = 8192;

/// Copy `height` rows of `width` BGRA pixels out of a strided buffer.
/// Returns `None` for nonsensical geometry.
pub fn pack_rows(src: &[u8], width: u32, height: u32, stride: usize) -> Option<Vec<u8>> {
    let row_bytes = width as usize * 4;
    if row_bytes == 0 || height == 0 || height > MAX_FRAME_HEIGHT || stride < row_bytes {
        return None;
    }
    let rows = height as usize;
    if src.len() < stride * (rows - 1) + row_bytes {
        return None;
    }
    if stride == row_bytes {
        return Some(src[..row_bytes * rows].to_vec());
    }
    let mut out = Vec::with_capacity(row_bytes * rows);
    for row in src.chunks(stride).take(rows) {
        out.extend_from_slice(&row[..row_bytes]);
    }
    Some(out)
}

/// Planar 32-bit float audio to interleaved s16le
pub fn interleave_to_s16(planar: &[f32], channels: usize, samples: usize, stride: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(channels * samples * 2);
    for i in 0..samples {
        for ch in 0..channels {
            let sample = planar.get(ch * stride + i).copied().unwrap_or(0.0);
            let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bandwidth_parse() {
        assert_eq!(Bandwidth::parse("highest"), Bandwidth::Highest);
        assert_eq!(Bandwidth::parse(" LOWEST "), Bandwidth::Lowest);
        assert_eq!(Bandwidth::parse("medium"), Bandwidth::Lowest);
        assert_eq!(Bandwidth::Highest.to_string(), "highest");
    }

    #[test]
    fn test_pack_rows_strips_padding() {
        // 1x2 frame, 4 bytes per row plus 4 bytes of padding
        let src = [1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8, 0, 0, 0, 0];
        assert_eq!(pack_rows(&src, 1, 2, 8), Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        // Last row may omit its padding
        assert_eq!(pack_rows(&src[..12], 1, 2, 8), Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn test_pack_rows_fast_path() {
        let src: Vec<u8> = (0..16).collect();
        assert_eq!(pack_rows(&src, 2, 2, 8), Some(src.clone()));
    }

    #[test]
    fn test_pack_rows_rejects_bad_geometry() {
        assert_eq!(pack_rows(&[0; 16], 0, 2, 8), None);
        assert_eq!(pack_rows(&[0; 16], 4, 2, 8), None);
        assert_eq!(pack_rows(&[0; 4], 1, 2, 4), None);
        assert_eq!(pack_rows(&[0; 16], 1, MAX_FRAME_HEIGHT + 1, 4), None);
    }

    #[test]
    fn test_interleave() {
        let planar = [1.0, 0.0, -1.0, 0.5];
        let out = interleave_to_s16(&planar, 2, 2, 2);
        let samples: Vec<i16> = out
            .chunks(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![i16::MAX, -i16::MAX, 0, i16::MAX / 2]);
    }
}
