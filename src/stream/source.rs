//! Discovered stream sources

use std::collections::BTreeMap;

/// A discovered network video source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Resolution has been learned, or probing gave up
    pub probed: bool,
}

impl StreamSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            width: 0,
            height: 0,
            probed: false,
        }
    }

    /// Known resolution, if any
    pub fn resolution(&self) -> Option<(u32, u32)> {
        (self.width > 0 && self.height > 0).then_some((self.width, self.height))
    }
}

/// Sources from the latest discovery pass, keyed by name
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, StreamSource>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set of known names. Existing entries keep their probed
    /// resolution; vanished names are removed. Returns the newly added names.
    pub fn replace_names(&mut self, names: &[String]) -> Vec<String> {
        self.sources.retain(|name, _| names.contains(name));
        let mut added = Vec::new();
        for name in names {
            if !self.sources.contains_key(name) {
                self.sources.insert(name.clone(), StreamSource::new(name.clone()));
                added.push(name.clone());
            }
        }
        added
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&StreamSource> {
        self.sources.get(name)
    }

    pub fn resolution(&self, name: &str) -> Option<(u32, u32)> {
        self.sources.get(name).and_then(StreamSource::resolution)
    }

    /// Record a learned resolution. Unknown names are added.
    pub fn update_resolution(&mut self, name: &str, width: u32, height: u32) {
        let source = self
            .sources
            .entry(name.to_string())
            .or_insert_with(|| StreamSource::new(name));
        source.width = width;
        source.height = height;
        source.probed = true;
    }

    /// Give up on probing `name` until it is rediscovered
    pub fn mark_probed(&mut self, name: &str) {
        if let Some(source) = self.sources.get_mut(name) {
            source.probed = true;
        }
    }

    /// Names still waiting for a probe
    pub fn unprobed(&self) -> Vec<String> {
        self.sources
            .values()
            .filter(|s| !s.probed)
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn list(&self) -> Vec<StreamSource> {
        self.sources.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
