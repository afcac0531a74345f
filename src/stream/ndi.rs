//! NDI runtime adapter
//!
//! Loads `libndi` at runtime with libloading. Every frame returned by a
//! capture call is released through a guard, so the runtime's buffers are
//! freed on every path out of `capture`.

use libloading::Library;
use parking_lot::Mutex;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StreamError;
use crate::stream::sdk::{
    interleave_to_s16, pack_rows, AudioFrame, Bandwidth, Capture, StreamReceiver, StreamSdk,
    VideoFrame,
};

/// Locations searched when no explicit path is configured
pub const LIBRARY_PATHS: [&str; 4] = [
    "/usr/local/lib/libndi.so.6",
    "/usr/local/lib/libndi.so",
    "/usr/lib/libndi.so.6",
    "/usr/lib/libndi.so",
];

const COLOR_FORMAT_BGRX_BGRA: c_int = 0;
const BANDWIDTH_LOWEST: c_int = 0;
const BANDWIDTH_HIGHEST: c_int = 100;

const FRAME_TYPE_NONE: c_int = 0;
const FRAME_TYPE_VIDEO: c_int = 1;
const FRAME_TYPE_AUDIO: c_int = 2;
const FRAME_TYPE_METADATA: c_int = 3;
const FRAME_TYPE_ERROR: c_int = 4;
const FRAME_TYPE_STATUS_CHANGE: c_int = 100;
const FRAME_TYPE_SOURCE_CHANGE: c_int = 101;

#[repr(C)]
struct Source {
    p_ndi_name: *const c_char,
    p_url_address: *const c_char,
}

#[repr(C)]
struct FindCreate {
    show_local_sources: bool,
    p_groups: *const c_char,
    p_extra_ips: *const c_char,
}

#[repr(C)]
struct RecvCreateV3 {
    source_to_connect_to: Source,
    color_format: c_int,
    bandwidth: c_int,
    allow_video_fields: bool,
    p_ndi_recv_name: *const c_char,
}

#[repr(C)]
struct VideoFrameV2 {
    xres: c_int,
    yres: c_int,
    four_cc: c_int,
    frame_rate_n: c_int,
    frame_rate_d: c_int,
    picture_aspect_ratio: f32,
    frame_format_type: c_int,
    timecode: i64,
    p_data: *mut u8,
    line_stride_in_bytes: c_int,
    p_metadata: *const c_char,
    timestamp: i64,
}

#[repr(C)]
struct AudioFrameV3 {
    sample_rate: c_int,
    no_channels: c_int,
    no_samples: c_int,
    timecode: i64,
    four_cc: c_int,
    p_data: *mut u8,
    channel_stride_in_bytes: c_int,
    p_metadata: *const c_char,
    timestamp: i64,
}

#[repr(C)]
struct MetadataFrame {
    length: c_int,
    timecode: i64,
    p_data: *mut c_char,
}

#[repr(C)]
struct Tally {
    on_program: bool,
    on_preview: bool,
}

type InitializeFn = unsafe extern "C" fn() -> bool;
type DestroyFn = unsafe extern "C" fn();
type FindCreateFn = unsafe extern "C" fn(*const FindCreate) -> *mut c_void;
type FindDestroyFn = unsafe extern "C" fn(*mut c_void);
type FindWaitFn = unsafe extern "C" fn(*mut c_void, u32) -> bool;
type FindSourcesFn = unsafe extern "C" fn(*mut c_void, *mut u32) -> *const Source;
type RecvCreateFn = unsafe extern "C" fn(*const RecvCreateV3) -> *mut c_void;
type RecvDestroyFn = unsafe extern "C" fn(*mut c_void);
type RecvCaptureFn = unsafe extern "C" fn(
    *mut c_void,
    *mut VideoFrameV2,
    *mut AudioFrameV3,
    *mut MetadataFrame,
    u32,
) -> c_int;
type FreeVideoFn = unsafe extern "C" fn(*mut c_void, *const VideoFrameV2);
type FreeAudioFn = unsafe extern "C" fn(*mut c_void, *const AudioFrameV3);
type FreeMetadataFn = unsafe extern "C" fn(*mut c_void, *const MetadataFrame);
type SetTallyFn = unsafe extern "C" fn(*mut c_void, *const Tally) -> bool;
type SendMetadataFn = unsafe extern "C" fn(*mut c_void, *const MetadataFrame) -> bool;

/// Resolved entry points. Shared by the SDK handle and every receiver; the
/// runtime is torn down when the last reference goes away.
struct Api {
    destroy: DestroyFn,
    find_create: FindCreateFn,
    find_destroy: FindDestroyFn,
    find_wait: FindWaitFn,
    find_sources: FindSourcesFn,
    recv_create: RecvCreateFn,
    recv_destroy: RecvDestroyFn,
    recv_capture: RecvCaptureFn,
    free_video: FreeVideoFn,
    free_audio: FreeAudioFn,
    free_metadata: FreeMetadataFn,
    set_tally: SetTallyFn,
    send_metadata: SendMetadataFn,
    // Keeps the function pointers above valid
    _lib: Library,
}

impl Api {
    fn load(path: &Path) -> Result<Self, StreamError> {
        let err = |e: libloading::Error| StreamError::LibraryLoad(format!("{}: {}", path.display(), e));
        unsafe {
            let lib = Library::new(path).map_err(err)?;
            let initialize: InitializeFn = *lib.get(b"NDIlib_initialize\0").map_err(err)?;
            let api = Self {
                destroy: *lib.get(b"NDIlib_destroy\0").map_err(err)?,
                find_create: *lib.get(b"NDIlib_find_create_v2\0").map_err(err)?,
                find_destroy: *lib.get(b"NDIlib_find_destroy\0").map_err(err)?,
                find_wait: *lib.get(b"NDIlib_find_wait_for_sources\0").map_err(err)?,
                find_sources: *lib.get(b"NDIlib_find_get_current_sources\0").map_err(err)?,
                recv_create: *lib.get(b"NDIlib_recv_create_v3\0").map_err(err)?,
                recv_destroy: *lib.get(b"NDIlib_recv_destroy\0").map_err(err)?,
                recv_capture: *lib.get(b"NDIlib_recv_capture_v3\0").map_err(err)?,
                free_video: *lib.get(b"NDIlib_recv_free_video_v2\0").map_err(err)?,
                free_audio: *lib.get(b"NDIlib_recv_free_audio_v3\0").map_err(err)?,
                free_metadata: *lib.get(b"NDIlib_recv_free_metadata\0").map_err(err)?,
                set_tally: *lib.get(b"NDIlib_recv_set_tally\0").map_err(err)?,
                send_metadata: *lib.get(b"NDIlib_recv_send_metadata\0").map_err(err)?,
                _lib: lib,
            };
            if !initialize() {
                return Err(StreamError::InitFailed);
            }
            Ok(api)
        }
    }
}

impl Drop for Api {
    fn drop(&mut self) {
        unsafe { (self.destroy)() };
        tracing::info!("NDI shutdown");
    }
}

/// Finder instance handle
struct Finder(*mut c_void);

// The runtime's finder may be used from any thread; access is serialized by
// the mutex in `NdiSdk`.
unsafe impl Send for Finder {}

/// Loaded NDI runtime
pub struct NdiSdk {
    api: Arc<Api>,
    finder: Mutex<Option<Finder>>,
}

// Api holds only function pointers and the library handle
unsafe impl Send for Api {}
unsafe impl Sync for Api {}

impl NdiSdk {
    /// Load the runtime from `explicit` or the standard locations
    pub fn load(explicit: Option<&Path>) -> Result<Self, StreamError> {
        let candidates: Vec<PathBuf> = match explicit {
            Some(path) => vec![path.to_path_buf()],
            None => LIBRARY_PATHS.iter().map(PathBuf::from).collect(),
        };

        let mut last_error = StreamError::Unavailable;
        for path in candidates.iter().filter(|p| p.exists()) {
            match Api::load(path) {
                Ok(api) => {
                    tracing::info!("NDI runtime loaded from {}", path.display());
                    return Ok(Self {
                        api: Arc::new(api),
                        finder: Mutex::new(None),
                    });
                }
                Err(e) => {
                    tracing::debug!("NDI load failed: {}", e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

impl StreamSdk for NdiSdk {
    fn find_sources(&self, timeout: Duration) -> Result<Vec<String>, StreamError> {
        let mut finder = self.finder.lock();
        if finder.is_none() {
            let settings = FindCreate {
                show_local_sources: true,
                p_groups: ptr::null(),
                p_extra_ips: ptr::null(),
            };
            let handle = unsafe { (self.api.find_create)(&settings) };
            if handle.is_null() {
                return Err(StreamError::Discovery("failed to create finder".into()));
            }
            *finder = Some(Finder(handle));
        }
        let Some(Finder(handle)) = finder.as_ref() else {
            return Err(StreamError::Discovery("finder unavailable".into()));
        };

        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let mut count: u32 = 0;
        let names = unsafe {
            (self.api.find_wait)(*handle, timeout_ms);
            let sources = (self.api.find_sources)(*handle, &mut count);
            if sources.is_null() {
                return Ok(Vec::new());
            }
            std::slice::from_raw_parts(sources, count as usize)
                .iter()
                .filter(|s| !s.p_ndi_name.is_null())
                .map(|s| CStr::from_ptr(s.p_ndi_name).to_string_lossy().into_owned())
                .collect()
        };
        Ok(names)
    }

    fn connect(
        &self,
        source: &str,
        bandwidth: Bandwidth,
        receiver_name: &str,
    ) -> Result<Box<dyn StreamReceiver>, StreamError> {
        let source_name =
            CString::new(source).map_err(|_| StreamError::InvalidSource(source.to_string()))?;
        let recv_name = CString::new(receiver_name)
            .map_err(|_| StreamError::InvalidSource(receiver_name.to_string()))?;

        let settings = RecvCreateV3 {
            source_to_connect_to: Source {
                p_ndi_name: source_name.as_ptr(),
                p_url_address: ptr::null(),
            },
            color_format: COLOR_FORMAT_BGRX_BGRA,
            bandwidth: match bandwidth {
                Bandwidth::Lowest => BANDWIDTH_LOWEST,
                Bandwidth::Highest => BANDWIDTH_HIGHEST,
            },
            allow_video_fields: true,
            p_ndi_recv_name: recv_name.as_ptr(),
        };

        let instance = unsafe { (self.api.recv_create)(&settings) };
        if instance.is_null() {
            return Err(StreamError::ReceiverCreate(source.to_string()));
        }
        Ok(Box::new(NdiReceiver {
            api: self.api.clone(),
            instance,
        }))
    }
}

impl Drop for NdiSdk {
    fn drop(&mut self) {
        if let Some(Finder(handle)) = self.finder.lock().take() {
            unsafe { (self.api.find_destroy)(handle) };
        }
    }
}

pub struct NdiReceiver {
    api: Arc<Api>,
    instance: *mut c_void,
}

// A receiver instance is only touched by the thread that owns it
unsafe impl Send for NdiReceiver {}

struct VideoGuard<'a> {
    api: &'a Api,
    instance: *mut c_void,
    frame: &'a VideoFrameV2,
}

impl Drop for VideoGuard<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.free_video)(self.instance, self.frame) };
    }
}

struct AudioGuard<'a> {
    api: &'a Api,
    instance: *mut c_void,
    frame: &'a AudioFrameV3,
}

impl Drop for AudioGuard<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.free_audio)(self.instance, self.frame) };
    }
}

struct MetadataGuard<'a> {
    api: &'a Api,
    instance: *mut c_void,
    frame: &'a MetadataFrame,
}

impl Drop for MetadataGuard<'_> {
    fn drop(&mut self) {
        if !self.frame.p_data.is_null() {
            unsafe { (self.api.free_metadata)(self.instance, self.frame) };
        }
    }
}

impl NdiReceiver {
    fn read_video(&self, frame: &VideoFrameV2) -> Capture {
        let _guard = VideoGuard {
            api: &self.api,
            instance: self.instance,
            frame,
        };
        if frame.p_data.is_null() || frame.xres <= 0 || frame.yres <= 0 || frame.line_stride_in_bytes <= 0 {
            tracing::warn!(
                "NDI frame: bad dimensions {}x{} stride={}",
                frame.xres,
                frame.yres,
                frame.line_stride_in_bytes
            );
            return Capture::None;
        }
        let (width, height) = (frame.xres as u32, frame.yres as u32);
        let stride = frame.line_stride_in_bytes as usize;
        let src = unsafe { std::slice::from_raw_parts(frame.p_data, stride * height as usize) };
        match pack_rows(src, width, height, stride) {
            Some(data) => Capture::Video(VideoFrame::new(width, height, data)),
            None => Capture::None,
        }
    }

    fn read_audio(&self, frame: &AudioFrameV3) -> Capture {
        let _guard = AudioGuard {
            api: &self.api,
            instance: self.instance,
            frame,
        };
        if frame.p_data.is_null() || frame.no_samples <= 0 || frame.no_channels <= 0 {
            return Capture::None;
        }
        let channels = frame.no_channels as usize;
        let samples = frame.no_samples as usize;
        let stride = (frame.channel_stride_in_bytes.max(0) as usize) / 4;
        let planar = unsafe {
            std::slice::from_raw_parts(frame.p_data as *const f32, stride * (channels - 1) + samples)
        };
        Capture::Audio(AudioFrame {
            sample_rate: frame.sample_rate.max(0) as u32,
            channels: channels as u32,
            data: interleave_to_s16(planar, channels, samples, stride).into(),
        })
    }

    fn read_metadata(&self, frame: &MetadataFrame) -> Capture {
        let _guard = MetadataGuard {
            api: &self.api,
            instance: self.instance,
            frame,
        };
        if frame.p_data.is_null() {
            return Capture::None;
        }
        let text = unsafe { CStr::from_ptr(frame.p_data) }
            .to_string_lossy()
            .into_owned();
        Capture::Metadata(text)
    }
}

impl StreamReceiver for NdiReceiver {
    fn capture(&mut self, timeout: Duration) -> Capture {
        let mut video: VideoFrameV2 = unsafe { std::mem::zeroed() };
        let mut audio: AudioFrameV3 = unsafe { std::mem::zeroed() };
        let mut metadata: MetadataFrame = unsafe { std::mem::zeroed() };
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);

        let frame_type = unsafe {
            (self.api.recv_capture)(self.instance, &mut video, &mut audio, &mut metadata, timeout_ms)
        };

        match frame_type {
            FRAME_TYPE_NONE => Capture::None,
            FRAME_TYPE_VIDEO => self.read_video(&video),
            FRAME_TYPE_AUDIO => self.read_audio(&audio),
            FRAME_TYPE_METADATA => self.read_metadata(&metadata),
            FRAME_TYPE_ERROR => Capture::Error,
            FRAME_TYPE_STATUS_CHANGE => Capture::StatusChange,
            FRAME_TYPE_SOURCE_CHANGE => Capture::SourceChange,
            other => {
                tracing::warn!("NDI unknown frame type: {}", other);
                Capture::None
            }
        }
    }

    fn set_tally(&mut self, on_program: bool, on_preview: bool) {
        let tally = Tally {
            on_program,
            on_preview,
        };
        unsafe { (self.api.set_tally)(self.instance, &tally) };
    }

    fn send_metadata(&mut self, xml: &str) {
        let Ok(text) = CString::new(xml) else {
            return;
        };
        let frame = MetadataFrame {
            length: 0,
            timecode: i64::MAX,
            p_data: text.as_ptr() as *mut c_char,
        };
        unsafe { (self.api.send_metadata)(self.instance, &frame) };
    }
}

impl Drop for NdiReceiver {
    fn drop(&mut self) {
        unsafe { (self.api.recv_destroy)(self.instance) };
    }
}
