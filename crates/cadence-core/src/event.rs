//! Typed change notifications, one payload kind per topic

use serde::{Deserialize, Serialize};

use crate::clip::{ArrangementClip, ClipId, PatternClip, PatternId, TrackId};
use crate::timeline::PlaybackMode;
use crate::transport::TransportSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Transport,
    PatternClips,
    ArrangementClips,
    Voices,
    Metronome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatternClipsChanged {
    PatternCreated(PatternId),
    PatternRenamed(PatternId),
    PatternDeleted { pattern: PatternId, detached: Vec<ClipId> },
    ActivePatternChanged(Option<PatternId>),
    ClipCreated { clip: PatternClip, replaced: Option<ClipId> },
    ClipUpdated(PatternClip),
    ClipDeleted(ClipId),
    PlaybackModeChanged(PlaybackMode),
    /// The whole model was swapped (project load)
    Reloaded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrangementClipsChanged {
    Added(ArrangementClip),
    Moved(ArrangementClip),
    Resized(ArrangementClip),
    Updated(ArrangementClip),
    Deleted(ClipId),
    Reloaded,
}

/// Emitted by the scheduler together with the command it dispatched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoiceEvent {
    Started {
        clip_id: ClipId,
        track_id: TrackId,
        start_sample: u64,
    },
    Stopped {
        clip_id: ClipId,
        track_id: TrackId,
        stop_sample: u64,
    },
}

impl VoiceEvent {
    pub fn clip_id(&self) -> ClipId {
        match self {
            Self::Started { clip_id, .. } | Self::Stopped { clip_id, .. } => *clip_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetronomeTick {
    pub bar: u32,
    /// Beat within the bar, 0-indexed
    pub beat: u32,
    pub at_sample: u64,
    pub downbeat: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Transport(TransportSnapshot),
    PatternClips(PatternClipsChanged),
    ArrangementClips(ArrangementClipsChanged),
    Voice(VoiceEvent),
    Metronome(MetronomeTick),
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Transport(_) => Topic::Transport,
            Self::PatternClips(_) => Topic::PatternClips,
            Self::ArrangementClips(_) => Topic::ArrangementClips,
            Self::Voice(_) => Topic::Voices,
            Self::Metronome(_) => Topic::Metronome,
        }
    }
}
