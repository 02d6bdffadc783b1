//! Session and arrangement clip representations

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

/// Shortest clip length, in beats
pub const MIN_CLIP_BEATS: f64 = 1.0 / 16.0;
pub const MIN_PITCH: i32 = -12;
pub const MAX_PITCH: i32 = 12;
/// Pattern clip length when none is given: one bar of 4/4
pub const DEFAULT_CLIP_BEATS: f64 = 4.0;

/// Unique identifier for clips, shared by pattern and arrangement clips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClipId(pub u64);

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clip-{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Track identifier, owned by the external track registry
    TrackId
);
string_id!(PatternId);
string_id!(
    /// Key into the external content store (audio file, MIDI payload)
    ContentRef
);

/// Playback flags of a pattern clip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipFlags {
    #[serde(rename = "loop")]
    pub loop_enabled: bool,
    /// Sustain until released instead of stopping after the clip length
    pub hold: bool,
    /// Snap launches to the next bar
    pub quantize: bool,
    pub warp: bool,
}

impl Default for ClipFlags {
    fn default() -> Self {
        Self {
            loop_enabled: false,
            hold: false,
            quantize: true,
            warp: false,
        }
    }
}

/// A clip bound to one (track, pattern) slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternClip {
    pub id: ClipId,
    pub track_id: TrackId,
    pub pattern_id: PatternId,
    pub name: String,
    pub content: Option<ContentRef>,
    pub flags: ClipFlags,
    /// Semitone offset in `[MIN_PITCH, MAX_PITCH]`
    pub pitch: i8,
    pub length_beats: f64,
}

impl PatternClip {
    pub fn new(id: ClipId, track_id: TrackId, pattern_id: PatternId, name: impl Into<String>) -> Self {
        Self {
            id,
            track_id,
            pattern_id,
            name: name.into(),
            content: None,
            flags: ClipFlags::default(),
            pitch: 0,
            length_beats: DEFAULT_CLIP_BEATS,
        }
    }
}

/// A clip placed at an absolute beat position on the master timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrangementClip {
    pub id: ClipId,
    pub track_id: TrackId,
    pub name: String,
    pub content: Option<ContentRef>,
    /// Start, in beats (>= 0)
    pub position: f64,
    /// Length, in beats (> 0)
    pub duration: f64,
    /// Bumped on create/move/resize; highest wins among overlapping clips
    pub revision: u64,
}

impl ArrangementClip {
    /// End position in beats
    pub fn end(&self) -> f64 {
        self.position + self.duration
    }

    pub fn covers(&self, beat: f64) -> bool {
        beat >= self.position && beat < self.end()
    }
}

/// Clamp a requested length into the valid range. Non-finite input is rejected.
pub fn clamp_duration(beats: f64) -> Result<f64> {
    if !beats.is_finite() {
        return Err(CadenceError::invalid(format!("duration {beats}")));
    }
    Ok(beats.max(MIN_CLIP_BEATS))
}

/// Reject negative or non-finite positions
pub fn check_position(beats: f64) -> Result<f64> {
    if !beats.is_finite() || beats < 0.0 {
        return Err(CadenceError::invalid(format!("position {beats}")));
    }
    Ok(beats)
}

pub fn clamp_pitch(semitones: i32) -> i8 {
    semitones.clamp(MIN_PITCH, MAX_PITCH) as i8
}

/// One field change of a clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClipUpdate {
    Name(String),
    Content(Option<ContentRef>),
    Loop(bool),
    Hold(bool),
    Quantize(bool),
    Warp(bool),
    /// Semitones, clamped into `[MIN_PITCH, MAX_PITCH]`
    Pitch(i32),
    /// Pattern clip length in beats
    Length(f64),
}

impl ClipUpdate {
    /// Whether the update also makes sense for arrangement clips
    pub fn applies_to_arrangement(&self) -> bool {
        matches!(self, Self::Name(_) | Self::Content(_))
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Length(beats) => clamp_duration(*beats).map(|_| ()),
            _ => Ok(()),
        }
    }

    pub fn apply_to_pattern_clip(&self, clip: &mut PatternClip) {
        match self {
            Self::Name(name) => clip.name = name.clone(),
            Self::Content(content) => clip.content = content.clone(),
            Self::Loop(on) => clip.flags.loop_enabled = *on,
            Self::Hold(on) => clip.flags.hold = *on,
            Self::Quantize(on) => clip.flags.quantize = *on,
            Self::Warp(on) => clip.flags.warp = *on,
            Self::Pitch(semitones) => clip.pitch = clamp_pitch(*semitones),
            Self::Length(beats) => {
                if let Ok(beats) = clamp_duration(*beats) {
                    clip.length_beats = beats;
                }
            }
        }
    }

    pub fn apply_to_arrangement_clip(&self, clip: &mut ArrangementClip) {
        match self {
            Self::Name(name) => clip.name = name.clone(),
            Self::Content(content) => clip.content = content.clone(),
            _ => {}
        }
    }
}
