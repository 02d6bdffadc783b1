//! cadence-core: Domain types for the cadence playback core

pub mod arrangement;
pub mod clip;
mod error;
pub mod event;
pub mod pattern;
pub mod timeline;
mod transport;

pub use arrangement::ArrangementStore;
pub use clip::{
    ArrangementClip, ClipFlags, ClipId, ClipUpdate, ContentRef, PatternClip, PatternId, TrackId,
    MAX_PITCH, MIN_CLIP_BEATS, MIN_PITCH,
};
pub use error::{CadenceError, Result};
pub use event::{
    ArrangementClipsChanged, Event, MetronomeTick, PatternClipsChanged, Topic, VoiceEvent,
};
pub use pattern::{Pattern, PatternStore};
pub use timeline::{AnyClip, CreatedClip, PlaybackMode, TimelineModel};
pub use transport::{Position, TimeSignature, Transport, TransportSnapshot, TransportState, MAX_TEMPO, MIN_TEMPO};
