//! Content store: resolves a clip's content reference to decoded data

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cadence_core::{CadenceError, ContentRef, Result};
use thiserror::Error;
use tracing::{debug, warn};

use crate::lock;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("WAV file is empty: {0}")]
    Empty(PathBuf),
}

/// Decoded audio, interleaved
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl SampleBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Length in frames
    pub fn frames(&self) -> u64 {
        self.samples.len() as u64 / self.channels as u64
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// A single MIDI note event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiNote {
    /// MIDI note number (0-127, 60 = middle C)
    pub pitch: u8,
    /// Velocity (0-127)
    pub velocity: u8,
    /// Start position in ticks (PPQ-based)
    pub start_tick: u64,
    /// Duration in ticks
    pub duration_ticks: u64,
}

impl MidiNote {
    pub fn new(pitch: u8, velocity: u8, start_tick: u64, duration_ticks: u64) -> Self {
        Self {
            pitch,
            velocity,
            start_tick,
            duration_ticks,
        }
    }

    /// End tick (start + duration)
    pub fn end_tick(&self) -> u64 {
        self.start_tick + self.duration_ticks
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentData {
    Audio(SampleBuffer),
    Midi {
        /// Notes sorted by start_tick
        notes: Vec<MidiNote>,
        /// Pulses per quarter note
        ppq: u16,
    },
}

pub trait ContentStore: Send + Sync {
    /// Failure is reported per voice; the scheduler skips that voice only
    fn resolve(&self, content: &ContentRef) -> Result<Arc<ContentData>>;
}

fn unavailable(content: &ContentRef) -> CadenceError {
    CadenceError::ResourceUnavailable(format!("content {content}"))
}

/// Content registered up front
#[derive(Default)]
pub struct MemoryContentStore {
    items: Mutex<HashMap<ContentRef, Arc<ContentData>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, content: ContentRef, data: ContentData) {
        lock(&self.items).insert(content, Arc::new(data));
    }

    pub fn remove(&self, content: &ContentRef) -> Option<Arc<ContentData>> {
        lock(&self.items).remove(content)
    }
}

impl ContentStore for MemoryContentStore {
    fn resolve(&self, content: &ContentRef) -> Result<Arc<ContentData>> {
        lock(&self.items)
            .get(content)
            .cloned()
            .ok_or_else(|| unavailable(content))
    }
}

/// Resolves content refs as WAV paths below a root directory, decoding each
/// file once.
pub struct WavContentStore {
    root: PathBuf,
    cache: Mutex<HashMap<ContentRef, Arc<ContentData>>>,
}

impl WavContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Decode a WAV file to f32 samples, keeping the channel layout
    pub fn read_wav(path: &Path) -> std::result::Result<SampleBuffer, ContentError> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let max_val = (1_i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / max_val))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        if samples.is_empty() {
            return Err(ContentError::Empty(path.to_path_buf()));
        }
        Ok(SampleBuffer::new(samples, spec.sample_rate, spec.channels))
    }

    fn path_for(&self, content: &ContentRef) -> PathBuf {
        self.root.join(content.as_str())
    }
}

impl ContentStore for WavContentStore {
    fn resolve(&self, content: &ContentRef) -> Result<Arc<ContentData>> {
        if let Some(data) = lock(&self.cache).get(content) {
            return Ok(data.clone());
        }

        let path = self.path_for(content);
        let buffer = Self::read_wav(&path).map_err(|e| {
            warn!("Failed to load {}: {e}", path.display());
            unavailable(content)
        })?;
        debug!(
            "Loaded {} ({} frames, {} ch)",
            path.display(),
            buffer.frames(),
            buffer.channels
        );

        let data = Arc::new(ContentData::Audio(buffer));
        lock(&self.cache).insert(content.clone(), data.clone());
        Ok(data)
    }
}
