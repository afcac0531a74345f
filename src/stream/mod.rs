//! Network video streams
//!
//! Pointer files can name a network video source instead of a media file.
//! The native runtime is loaded at startup when present; without it the
//! whole subsystem reports itself unavailable and does nothing.

pub mod manager;
#[cfg(feature = "ndi")]
pub mod ndi;
pub mod pipeline;
pub mod reconnect;
pub mod sdk;
pub mod source;

pub use manager::{StreamCallbacks, StreamManager};
pub use pipeline::{ConsumerFactory, FrameConsumer, FrameQueue, Pipeline, ProcessConsumerFactory};
pub use reconnect::{NoticeFn, Phase, ReconnectTiming, StreamReconnectManager};
pub use sdk::{AudioFrame, Bandwidth, Capture, StreamReceiver, StreamSdk, VideoFrame};
pub use source::{SourceRegistry, StreamSource};

use std::path::Path;
use std::sync::Arc;

/// Load the native runtime if it is installed and enabled
pub fn load_sdk(enabled: bool, library_path: Option<&Path>) -> Option<Arc<dyn StreamSdk>> {
    if !enabled {
        tracing::info!("Stream support disabled in config");
        return None;
    }
    #[cfg(feature = "ndi")]
    {
        match ndi::NdiSdk::load(library_path) {
            Ok(sdk) => Some(Arc::new(sdk)),
            Err(e) => {
                tracing::info!("NDI runtime not loaded: {}", e);
                None
            }
        }
    }
    #[cfg(not(feature = "ndi"))]
    {
        let _ = library_path;
        tracing::info!("Built without NDI support");
        None
    }
}
