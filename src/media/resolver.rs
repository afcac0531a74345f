//! Media resolution
//!
//! `(folder, file)` indices select an entry under the media root: folders
//! are the sorted subdirectories, files the sorted entries inside the
//! selected folder (1-based). Pointer files redirect playback:
//!
//! - `.txt`: first non-blank line is a URL for the playback engine
//! - `.ndi`: first non-blank line is a stream source name, optionally
//!   prefixed with `ndi://`
//!
//! Pointer files are followed one level only.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Extension of URL pointer files
pub const URL_POINTER_EXT: &str = "txt";
/// Extension of stream pointer files
pub const STREAM_POINTER_EXT: &str = "ndi";
/// URI scheme accepted in stream pointer files
pub const STREAM_SCHEME: &str = "ndi://";

/// Something playable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaTarget {
    /// Local media file
    File(PathBuf),
    /// URL read from a pointer file
    Url(String),
    /// Network video source name
    Stream(String),
}

impl MediaTarget {
    /// Location string handed to the playback engine
    pub fn location(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Url(url) => url.clone(),
            Self::Stream(name) => format!("{}{}", STREAM_SCHEME, name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaResolver {
    root: PathBuf,
}

impl MediaResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve indices to a concrete entry without following pointers.
    /// `file_index` is 1-based; 0 never resolves.
    pub fn resolve_path(&self, folder_index: usize, file_index: usize) -> Option<PathBuf> {
        if file_index == 0 {
            return None;
        }

        let folders = match sorted_entries(&self.root, true) {
            Ok(folders) => folders,
            Err(e) => {
                tracing::warn!("Media directory '{}' unreadable: {}", self.root.display(), e);
                return None;
            }
        };
        let Some(folder) = folders.get(folder_index) else {
            tracing::info!(
                "Folder index {} out of range (have {} folders)",
                folder_index,
                folders.len()
            );
            return None;
        };

        let files = match sorted_entries(folder, false) {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!("Folder '{}' unreadable: {}", folder.display(), e);
                return None;
            }
        };
        let file = files.get(file_index - 1).cloned();
        if file.is_none() {
            tracing::info!(
                "File index {} out of range (have {} files in '{}')",
                file_index,
                files.len(),
                folder.display()
            );
        }
        file
    }

    /// Resolve indices to a playable target, following one pointer level
    pub fn resolve(&self, folder_index: usize, file_index: usize) -> Option<MediaTarget> {
        let path = self.resolve_path(folder_index, file_index)?;
        resolve_pointer(path)
    }
}

/// Classify a resolved entry by extension
pub fn resolve_pointer(path: PathBuf) -> Option<MediaTarget> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some(URL_POINTER_EXT) => read_url_file(&path).map(MediaTarget::Url),
        Some(STREAM_POINTER_EXT) => read_stream_file(&path).map(MediaTarget::Stream),
        _ => Some(MediaTarget::File(path)),
    }
}

/// Directory entries sorted by name; `dirs` selects directories or files
fn sorted_entries(dir: &Path, dirs: bool) -> io::Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() == dirs)
        .collect();
    entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(entries)
}

fn first_line(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string),
        Err(e) => {
            tracing::warn!("Cannot read pointer file '{}': {}", path.display(), e);
            None
        }
    }
}

/// URL from a `.txt` pointer file
pub fn read_url_file(path: &Path) -> Option<String> {
    let url = first_line(path);
    match &url {
        Some(url) => tracing::info!("Resolved URL from '{}': {}", path.display(), url),
        None => tracing::info!("URL file is empty: {}", path.display()),
    }
    url
}

/// Stream source name from a `.ndi` pointer file
pub fn read_stream_file(path: &Path) -> Option<String> {
    let line = first_line(path)?;
    let name = strip_stream_scheme(&line).trim().to_string();
    if name.is_empty() {
        tracing::info!("Stream file is empty: {}", path.display());
        return None;
    }
    tracing::info!("Resolved stream source from '{}': {}", path.display(), name);
    Some(name)
}

/// Strip a leading `ndi://` (case-insensitive)
pub fn strip_stream_scheme(value: &str) -> &str {
    let prefix_len = STREAM_SCHEME.len();
    match value.get(..prefix_len) {
        Some(prefix) if prefix.eq_ignore_ascii_case(STREAM_SCHEME) => &value[prefix_len..],
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn media_tree() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let intro = dir.path().join("0_intro");
        fs::create_dir(&intro).unwrap();
        fs::create_dir(dir.path().join("1_main")).unwrap();
        fs::write(intro.join("clip2.mp4"), b"").unwrap();
        fs::write(intro.join("clip1.mp4"), b"").unwrap();
        dir
    }

    #[test]
    fn test_resolution_law() {
        let dir = media_tree();
        let resolver = MediaResolver::new(dir.path());
        assert_eq!(
            resolver.resolve_path(0, 1),
            Some(dir.path().join("0_intro").join("clip1.mp4"))
        );
        assert_eq!(
            resolver.resolve_path(0, 2),
            Some(dir.path().join("0_intro").join("clip2.mp4"))
        );
        assert_eq!(resolver.resolve_path(0, 99), None);
        assert_eq!(resolver.resolve_path(99, 1), None);
        assert_eq!(resolver.resolve_path(1, 1), None);
        assert_eq!(resolver.resolve_path(0, 0), None);
    }

    #[test]
    fn test_stray_files_are_not_folders() {
        let dir = media_tree();
        fs::write(dir.path().join("00_readme.md"), b"hi").unwrap();
        let resolver = MediaResolver::new(dir.path());
        assert_eq!(
            resolver.resolve(0, 1),
            Some(MediaTarget::File(dir.path().join("0_intro").join("clip1.mp4")))
        );
    }

    #[test]
    fn test_missing_root() {
        let resolver = MediaResolver::new("/nonexistent/media/root");
        assert_eq!(resolver.resolve(0, 1), None);
    }

    #[test]
    fn test_url_pointer() {
        let dir = media_tree();
        let live = dir.path().join("0_intro").join("live.txt");
        fs::write(&live, "https://example.com/live.m3u8\n").unwrap();
        let resolver = MediaResolver::new(dir.path());
        assert_eq!(
            resolver.resolve(0, 3),
            Some(MediaTarget::Url("https://example.com/live.m3u8".into()))
        );
    }

    #[test]
    fn test_empty_url_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.txt");
        fs::write(&empty, "").unwrap();
        assert_eq!(read_url_file(&empty), None);
        fs::write(&empty, "\n   \n").unwrap();
        assert_eq!(read_url_file(&empty), None);
    }

    #[test]
    fn test_url_pointer_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("u.TXT");
        fs::write(&file, "\n  rtsp://cam/1  \nignored\n").unwrap();
        assert_eq!(
            resolve_pointer(file),
            Some(MediaTarget::Url("rtsp://cam/1".into()))
        );
    }

    #[test]
    fn test_stream_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cam.ndi");
        fs::write(&file, "NDI://STUDIO-PC (OBS)\n").unwrap();
        assert_eq!(
            resolve_pointer(file.clone()),
            Some(MediaTarget::Stream("STUDIO-PC (OBS)".into()))
        );
        fs::write(&file, "STUDIO-PC (OBS)").unwrap();
        assert_eq!(read_stream_file(&file), Some("STUDIO-PC (OBS)".into()));
        fs::write(&file, "ndi://").unwrap();
        assert_eq!(read_stream_file(&file), None);
    }

    #[test]
    fn test_pointer_is_not_followed_twice() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("chain.txt");
        fs::write(&file, "other.txt").unwrap();
        assert_eq!(
            resolve_pointer(file),
            Some(MediaTarget::Url("other.txt".into()))
        );
    }

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_stream_scheme("ndi://A"), "A");
        assert_eq!(strip_stream_scheme("Ndi://A"), "A");
        assert_eq!(strip_stream_scheme("A"), "A");
        assert_eq!(strip_stream_scheme("nd"), "nd");
    }
}
