//! Transport state and controls
//!
//! The transport never reads a clock itself. Every call that depends on
//! wall time takes `now`, the current clock reading in sample frames.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

pub const MIN_TEMPO: f64 = 20.0;
pub const MAX_TEMPO: f64 = 999.0;

/// Transport playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub beats_per_bar: u32,
    pub beat_unit: u32,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self { beats_per_bar: 4, beat_unit: 4 }
    }
}

impl TimeSignature {
    pub fn new(beats_per_bar: u32, beat_unit: u32) -> Result<Self> {
        if beats_per_bar == 0 || beat_unit == 0 {
            return Err(CadenceError::invalid(format!(
                "time signature {beats_per_bar}/{beat_unit}"
            )));
        }
        Ok(Self { beats_per_bar, beat_unit })
    }
}

/// Musical position: bar and beat within the bar (both 0-indexed)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub bar: u32,
    /// Always in `[0, beats_per_bar)`
    pub beat: f64,
}

impl Position {
    /// Split an absolute beat count into bar + beat
    pub fn from_beats(total_beats: f64, signature: TimeSignature) -> Self {
        let bpb = signature.beats_per_bar as f64;
        let total = total_beats.max(0.0);
        let mut bar = (total / bpb).floor();
        let mut beat = total - bar * bpb;
        if beat >= bpb {
            bar += 1.0;
            beat = 0.0;
        }
        Self { bar: bar as u32, beat }
    }

    pub fn to_beats(self, signature: TimeSignature) -> f64 {
        self.bar as f64 * signature.beats_per_bar as f64 + self.beat
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:.3}", self.bar + 1, self.beat + 1.0)
    }
}

/// Immutable view of the transport handed to observers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportSnapshot {
    pub state: TransportState,
    pub tempo: f64,
    pub time_signature: TimeSignature,
    pub position: Position,
    pub is_playing: bool,
    pub is_recording: bool,
    pub record_armed: bool,
    pub metronome_enabled: bool,
}

/// The musical clock and play/pause/stop state machine.
///
/// Position is kept as an anchor: the beat that was current at
/// `anchor_sample`. While playing, the current beat is extrapolated from the
/// anchor at the current tempo, so a tempo change only has to re-anchor.
#[derive(Debug, Clone)]
pub struct Transport {
    state: TransportState,
    bpm: f64,
    time_signature: TimeSignature,
    sample_rate: u32,
    anchor_beat: f64,
    anchor_sample: u64,
    record_armed: bool,
    metronome_enabled: bool,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            state: TransportState::Stopped,
            bpm: 120.0,
            time_signature: TimeSignature::default(),
            sample_rate: 48000,
            anchor_beat: 0.0,
            anchor_sample: 0,
            record_armed: false,
            metronome_enabled: false,
        }
    }
}

impl Transport {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            ..Default::default()
        }
    }

    /// Start or resume. Returns false if already playing.
    pub fn play(&mut self, now: u64) -> bool {
        if self.state == TransportState::Playing {
            return false;
        }
        self.anchor_sample = now;
        self.state = TransportState::Playing;
        true
    }

    /// Halt advancement, keeping the position. Returns false if not playing.
    pub fn pause(&mut self, now: u64) -> bool {
        if self.state != TransportState::Playing {
            return false;
        }
        self.anchor_beat = self.beat_at(now);
        self.anchor_sample = now;
        self.state = TransportState::Paused;
        true
    }

    pub fn stop(&mut self) {
        self.state = TransportState::Stopped;
        self.anchor_beat = 0.0;
        self.record_armed = false;
    }

    pub fn toggle_play(&mut self, now: u64) {
        if self.is_playing() {
            self.pause(now);
        } else {
            self.play(now);
        }
    }

    /// Flip the record arm. Recording is only active while playing.
    pub fn toggle_record(&mut self) -> bool {
        self.record_armed = !self.record_armed;
        self.record_armed
    }

    pub fn toggle_metronome(&mut self) -> bool {
        self.metronome_enabled = !self.metronome_enabled;
        self.metronome_enabled
    }

    /// Change tempo without moving the musical position.
    ///
    /// Out-of-range values are clamped into `[MIN_TEMPO, MAX_TEMPO]`; returns
    /// the tempo that took effect.
    pub fn set_tempo(&mut self, bpm: f64, now: u64) -> Result<f64> {
        if !bpm.is_finite() {
            return Err(CadenceError::invalid(format!("tempo {bpm}")));
        }
        self.tick(now);
        self.bpm = bpm.clamp(MIN_TEMPO, MAX_TEMPO);
        Ok(self.bpm)
    }

    pub fn set_time_signature(&mut self, beats_per_bar: u32, beat_unit: u32) -> Result<()> {
        self.time_signature = TimeSignature::new(beats_per_bar, beat_unit)?;
        Ok(())
    }

    /// Seek. Beat overflow carries into the bar; negative totals clamp to zero.
    pub fn set_position(&mut self, bar: u32, beat: f64, now: u64) -> Result<Position> {
        if !beat.is_finite() {
            return Err(CadenceError::invalid(format!("beat {beat}")));
        }
        let total = bar as f64 * self.time_signature.beats_per_bar as f64 + beat;
        self.anchor_beat = total.max(0.0);
        self.anchor_sample = now;
        Ok(self.position(now))
    }

    /// Re-anchor at `now`, folding elapsed time into the stored position
    pub fn tick(&mut self, now: u64) {
        if self.is_playing() {
            self.anchor_beat = self.beat_at(now);
            self.anchor_sample = now;
        }
    }

    /// Absolute beat position at clock time `now`
    pub fn beat_at(&self, now: u64) -> f64 {
        if !self.is_playing() {
            return self.anchor_beat;
        }
        let elapsed = now.saturating_sub(self.anchor_sample) as f64;
        self.anchor_beat + elapsed / self.samples_per_beat()
    }

    /// Clock time at which `beat` sounds, extrapolated at the current tempo
    pub fn sample_at_beat(&self, beat: f64) -> u64 {
        let offset = (beat - self.anchor_beat) * self.samples_per_beat();
        (self.anchor_sample as f64 + offset).max(0.0).round() as u64
    }

    /// Convert a beat length into a sample length at the current tempo
    pub fn beats_to_samples(&self, beats: f64) -> u64 {
        (beats * self.samples_per_beat()).max(0.0).round() as u64
    }

    /// Samples per beat at current tempo
    pub fn samples_per_beat(&self) -> f64 {
        self.sample_rate as f64 * 60.0 / self.bpm
    }

    /// First bar boundary at or after `beat`
    pub fn next_bar_at_or_after(&self, beat: f64) -> f64 {
        let bpb = self.time_signature.beats_per_bar as f64;
        let bars = beat.max(0.0) / bpb;
        // Tolerate float noise right on a boundary
        let nearest = bars.round();
        if (bars - nearest).abs() < 1e-9 {
            return nearest * bpb;
        }
        bars.ceil() * bpb
    }

    pub fn position(&self, now: u64) -> Position {
        Position::from_beats(self.beat_at(now), self.time_signature)
    }

    pub fn snapshot(&self, now: u64) -> TransportSnapshot {
        TransportSnapshot {
            state: self.state,
            tempo: self.bpm,
            time_signature: self.time_signature,
            position: self.position(now),
            is_playing: self.is_playing(),
            is_recording: self.is_recording(),
            record_armed: self.record_armed,
            metronome_enabled: self.metronome_enabled,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == TransportState::Playing
    }

    pub fn is_recording(&self) -> bool {
        self.record_armed && self.is_playing()
    }

    pub fn record_armed(&self) -> bool {
        self.record_armed
    }

    pub fn metronome_enabled(&self) -> bool {
        self.metronome_enabled
    }

    pub fn tempo(&self) -> f64 {
        self.bpm
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
