//! Audio-graph destinations and the track registry that resolves them

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cadence_core::{ClipId, ContentRef, Result, TrackId};
use tracing::debug;

use crate::content::ContentData;
use crate::lock;

/// Opaque id of a voice inside a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceHandle(pub u64);

/// Everything a sink needs to start one voice
#[derive(Debug, Clone)]
pub struct StartVoice {
    pub clip_id: ClipId,
    pub track_id: TrackId,
    pub content_ref: Option<ContentRef>,
    pub content: Option<Arc<ContentData>>,
    /// Clock time in sample frames
    pub start_sample: u64,
    /// Semitone offset
    pub pitch: i8,
    pub looping: bool,
}

/// Per-track destination for scheduled sound.
///
/// Both calls are fire-and-forget: the sink queues the command for the given
/// time. `stop_voice` must tolerate repeated stops of the same handle.
pub trait AudioSink: Send + Sync {
    fn start_voice(&self, request: &StartVoice) -> Result<VoiceHandle>;
    fn stop_voice(&self, handle: VoiceHandle, stop_sample: u64);
}

/// Resolves a track to its destination. No sink means the track has no output.
pub trait TrackRegistry: Send + Sync {
    fn sink(&self, track_id: &TrackId) -> Option<Arc<dyn AudioSink>>;
}

/// Thread-safe track -> sink map
#[derive(Default)]
pub struct SinkRegistry {
    sinks: Mutex<HashMap<TrackId, Arc<dyn AudioSink>>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, track_id: TrackId, sink: Arc<dyn AudioSink>) {
        lock(&self.sinks).insert(track_id, sink);
    }

    pub fn unregister(&self, track_id: &TrackId) -> Option<Arc<dyn AudioSink>> {
        lock(&self.sinks).remove(track_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.sinks).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sinks).is_empty()
    }
}

impl TrackRegistry for SinkRegistry {
    fn sink(&self, track_id: &TrackId) -> Option<Arc<dyn AudioSink>> {
        lock(&self.sinks).get(track_id).cloned()
    }
}

/// A command as received by a `LogSink`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCommand {
    Start {
        handle: VoiceHandle,
        clip_id: ClipId,
        start_sample: u64,
        pitch: i8,
        looping: bool,
    },
    Stop {
        handle: VoiceHandle,
        stop_sample: u64,
    },
}

/// Commands a `LogSink` remembers unless told otherwise
pub const DEFAULT_HISTORY: usize = 4096;

/// Sink that renders nothing: it logs every command, counts them and keeps
/// the most recent ones
pub struct LogSink {
    name: String,
    next_handle: AtomicU64,
    history: usize,
    commands: Mutex<VecDeque<SinkCommand>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_history(name, DEFAULT_HISTORY)
    }

    /// Keep at most `history` commands; zero keeps only the counters
    pub fn with_history(name: impl Into<String>, history: usize) -> Self {
        Self {
            name: name.into(),
            next_handle: AtomicU64::new(1),
            history,
            commands: Mutex::new(VecDeque::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    fn record(&self, command: SinkCommand) {
        if self.history == 0 {
            return;
        }
        let mut commands = lock(&self.commands);
        if commands.len() == self.history {
            commands.pop_front();
        }
        commands.push_back(command);
    }

    /// Retained commands, oldest first
    pub fn commands(&self) -> Vec<SinkCommand> {
        lock(&self.commands).iter().cloned().collect()
    }

    /// Start commands for one clip, as (start_sample, pitch)
    pub fn starts_for(&self, clip: ClipId) -> Vec<(u64, i8)> {
        lock(&self.commands)
            .iter()
            .filter_map(|c| match c {
                SinkCommand::Start { clip_id, start_sample, pitch, .. } if *clip_id == clip => {
                    Some((*start_sample, *pitch))
                }
                _ => None,
            })
            .collect()
    }

    /// Starts received over the sink's lifetime
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        lock(&self.commands).clear();
        self.starts.store(0, Ordering::Relaxed);
        self.stops.store(0, Ordering::Relaxed);
    }
}

impl AudioSink for LogSink {
    fn start_voice(&self, request: &StartVoice) -> Result<VoiceHandle> {
        let handle = VoiceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!(
            sink = %self.name,
            clip = %request.clip_id,
            at = request.start_sample,
            pitch = request.pitch,
            looping = request.looping,
            "start voice {}",
            handle.0
        );
        self.starts.fetch_add(1, Ordering::Relaxed);
        self.record(SinkCommand::Start {
            handle,
            clip_id: request.clip_id,
            start_sample: request.start_sample,
            pitch: request.pitch,
            looping: request.looping,
        });
        Ok(handle)
    }

    fn stop_voice(&self, handle: VoiceHandle, stop_sample: u64) {
        debug!(sink = %self.name, at = stop_sample, "stop voice {}", handle.0);
        self.stops.fetch_add(1, Ordering::Relaxed);
        self.record(SinkCommand::Stop { handle, stop_sample });
    }
}
