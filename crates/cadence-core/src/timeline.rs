//! Timeline model: session patterns and the arrangement under one id space

use serde::{Deserialize, Serialize};

use crate::arrangement::ArrangementStore;
use crate::clip::{ArrangementClip, ClipId, ClipUpdate, ContentRef, PatternClip, PatternId, TrackId};
use crate::error::{CadenceError, Result};
use crate::pattern::{Pattern, PatternStore};

/// Which clip representation drives playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackMode {
    /// Launch the clips of the active pattern
    #[default]
    Pattern,
    /// Play arrangement clips from their absolute positions
    Arrangement,
}

/// A clip of either kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnyClip {
    Pattern(PatternClip),
    Arrangement(ArrangementClip),
}

impl AnyClip {
    pub fn id(&self) -> ClipId {
        match self {
            Self::Pattern(c) => c.id,
            Self::Arrangement(c) => c.id,
        }
    }

    pub fn track_id(&self) -> &TrackId {
        match self {
            Self::Pattern(c) => &c.track_id,
            Self::Arrangement(c) => &c.track_id,
        }
    }
}

/// Result of `create_clip`
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedClip {
    pub clip: PatternClip,
    /// Previous occupant of the same (track, pattern) slot
    pub replaced: Option<PatternClip>,
}

/// Owns every pattern, pattern clip and arrangement clip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineModel {
    patterns: PatternStore,
    arrangement: ArrangementStore,
    active_pattern: Option<PatternId>,
    mode: PlaybackMode,
    next_clip_id: u64,
}

impl Default for TimelineModel {
    fn default() -> Self {
        Self {
            patterns: PatternStore::new(),
            arrangement: ArrangementStore::new(),
            active_pattern: None,
            mode: PlaybackMode::Pattern,
            next_clip_id: 1,
        }
    }
}

impl TimelineModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_clip_id(&mut self) -> ClipId {
        let id = ClipId(self.next_clip_id);
        self.next_clip_id += 1;
        id
    }

    /// Create (or rename) a pattern. The first pattern becomes active.
    pub fn create_pattern(&mut self, id: PatternId, name: impl Into<String>) -> &Pattern {
        if self.active_pattern.is_none() {
            self.active_pattern = Some(id.clone());
        }
        self.patterns.create_pattern(id, name)
    }

    pub fn rename_pattern(&mut self, id: &PatternId, name: impl Into<String>) -> Result<&Pattern> {
        self.patterns.rename_pattern(id, name)
    }

    /// Delete a pattern; returns the ids of the clips it detached
    pub fn delete_pattern(&mut self, id: &PatternId) -> Option<Vec<ClipId>> {
        let (_, detached) = self.patterns.delete_pattern(id)?;
        if self.active_pattern.as_ref() == Some(id) {
            self.active_pattern = self.patterns.patterns().first().map(|p| p.id.clone());
        }
        Some(detached)
    }

    pub fn get_patterns(&self) -> &[Pattern] {
        self.patterns.patterns()
    }

    pub fn pattern(&self, id: &PatternId) -> Option<&Pattern> {
        self.patterns.pattern(id)
    }

    pub fn active_pattern(&self) -> Option<&PatternId> {
        self.active_pattern.as_ref()
    }

    pub fn set_active_pattern(&mut self, id: &PatternId) -> Result<()> {
        if self.patterns.pattern(id).is_none() {
            return Err(CadenceError::not_found("pattern", id));
        }
        self.active_pattern = Some(id.clone());
        Ok(())
    }

    pub fn playback_mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn set_playback_mode(&mut self, mode: PlaybackMode) {
        self.mode = mode;
    }

    /// Create the clip for a (track, pattern) slot, replacing any previous one
    pub fn create_clip(
        &mut self,
        track_id: TrackId,
        pattern_id: PatternId,
        name: impl Into<String>,
    ) -> Result<CreatedClip> {
        if self.patterns.pattern(&pattern_id).is_none() {
            return Err(CadenceError::not_found("pattern", &pattern_id));
        }
        let id = self.alloc_clip_id();
        let clip = PatternClip::new(id, track_id, pattern_id, name);
        let replaced = self.patterns.insert_clip(clip.clone())?;
        Ok(CreatedClip { clip, replaced })
    }

    pub fn get_clip_for_track_in_pattern(&self, track_id: &TrackId, pattern_id: &PatternId) -> Option<&PatternClip> {
        self.patterns.clip_for_track_in_pattern(track_id, pattern_id)
    }

    pub fn pattern_clip(&self, id: ClipId) -> Option<&PatternClip> {
        self.patterns.clip(id)
    }

    /// Attached clips of a pattern in slot order
    pub fn clips_in_pattern(&self, pattern_id: &PatternId) -> Vec<&PatternClip> {
        self.patterns.clips_in_pattern(pattern_id)
    }

    pub fn pattern_clips(&self) -> Vec<&PatternClip> {
        self.patterns.clips()
    }

    pub fn is_attached(&self, id: ClipId) -> bool {
        self.patterns.is_attached(id)
    }

    pub fn add_clip_to_arrangement(
        &mut self,
        track_id: TrackId,
        position: f64,
        duration: f64,
        content: Option<ContentRef>,
    ) -> Result<ArrangementClip> {
        // Validate before consuming an id
        crate::clip::check_position(position)?;
        crate::clip::clamp_duration(duration)?;
        let id = self.alloc_clip_id();
        self.arrangement
            .add(id, track_id, position, duration, content)
            .cloned()
    }

    pub fn move_clip(&mut self, id: ClipId, position: f64) -> Result<ArrangementClip> {
        self.arrangement.move_clip(id, position).cloned()
    }

    pub fn resize_clip(&mut self, id: ClipId, duration: f64) -> Result<ArrangementClip> {
        self.arrangement.resize_clip(id, duration).cloned()
    }

    pub fn get_clips_for_track(&self, track_id: &TrackId) -> Vec<&ArrangementClip> {
        self.arrangement.clips_for_track(track_id)
    }

    pub fn get_arrangement_clips(&self) -> Vec<&ArrangementClip> {
        self.arrangement.clips()
    }

    pub fn arrangement_clip(&self, id: ClipId) -> Option<&ArrangementClip> {
        self.arrangement.clip(id)
    }

    /// The arrangement clip owning a track at `beat`, by last write wins.
    /// This is a model query: a scheduler starts a clip only at its own start.
    pub fn clip_at(&self, track_id: &TrackId, beat: f64) -> Option<&ArrangementClip> {
        self.arrangement.clip_at(track_id, beat)
    }

    pub fn arrangement_clips_starting_in(&self, from: f64, to: f64) -> Vec<&ArrangementClip> {
        self.arrangement.clips_starting_in(from, to)
    }

    pub fn clip(&self, id: ClipId) -> Option<AnyClip> {
        if let Some(clip) = self.patterns.clip(id) {
            return Some(AnyClip::Pattern(clip.clone()));
        }
        self.arrangement.clip(id).cloned().map(AnyClip::Arrangement)
    }

    pub fn delete_clip(&mut self, id: ClipId) -> Option<AnyClip> {
        if let Some(clip) = self.patterns.remove_clip(id) {
            return Some(AnyClip::Pattern(clip));
        }
        self.arrangement.remove(id).map(AnyClip::Arrangement)
    }

    pub fn update_clip(&mut self, id: ClipId, updates: &[ClipUpdate]) -> Result<AnyClip> {
        if self.patterns.contains(id) {
            return self
                .patterns
                .update_clip(id, updates)
                .cloned()
                .map(AnyClip::Pattern);
        }
        if self.arrangement.contains(id) {
            return self
                .arrangement
                .update_clip(id, updates)
                .cloned()
                .map(AnyClip::Arrangement);
        }
        Err(CadenceError::not_found("clip", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> TimelineModel {
        let mut model = TimelineModel::new();
        model.create_pattern("p1".into(), "Intro");
        model
    }

    #[test]
    fn test_first_pattern_is_active() {
        let mut model = model();
        model.create_pattern("p2".into(), "Verse");
        assert_eq!(model.active_pattern(), Some(&PatternId::from("p1")));

        model.delete_pattern(&"p1".into());
        assert_eq!(model.active_pattern(), Some(&PatternId::from("p2")));
    }

    #[test]
    fn test_create_clip_replaces_slot() {
        let mut model = model();
        let first = model.create_clip("t1".into(), "p1".into(), "Kick").unwrap();
        let second = model.create_clip("t1".into(), "p1".into(), "Kick 2").unwrap();

        assert_eq!(second.replaced.map(|c| c.id), Some(first.clip.id));
        let slot = model.get_clip_for_track_in_pattern(&"t1".into(), &"p1".into()).unwrap();
        assert_eq!(slot.id, second.clip.id);
        assert_eq!(slot.name, "Kick 2");
        assert_eq!(model.pattern_clips().len(), 1);
    }

    #[test]
    fn test_create_clip_unknown_pattern() {
        let mut model = model();
        assert!(model.create_clip("t1".into(), "p9".into(), "Kick").is_err());
        assert!(model.pattern_clips().is_empty());
    }

    #[test]
    fn test_move_scenario() {
        let mut model = model();
        let clip = model.add_clip_to_arrangement("t1".into(), 4.0, 2.0, None).unwrap();
        model.move_clip(clip.id, 8.0).unwrap();

        let clips = model.get_clips_for_track(&"t1".into());
        assert_eq!(clips.len(), 1);
        assert_eq!((clips[0].position, clips[0].duration), (8.0, 2.0));
    }

    #[test]
    fn test_overlap_scenario() {
        let mut model = model();
        model.add_clip_to_arrangement("t1".into(), 0.0, 4.0, None).unwrap();
        let second = model.add_clip_to_arrangement("t1".into(), 2.0, 4.0, None).unwrap();
        assert_eq!(model.clip_at(&"t1".into(), 3.0).unwrap().id, second.id);
    }

    #[test]
    fn test_ids_shared_across_kinds() {
        let mut model = model();
        let pattern_clip = model.create_clip("t1".into(), "p1".into(), "Kick").unwrap().clip;
        let arrangement_clip = model.add_clip_to_arrangement("t1".into(), 0.0, 1.0, None).unwrap();
        assert_ne!(pattern_clip.id, arrangement_clip.id);

        assert!(matches!(model.delete_clip(arrangement_clip.id), Some(AnyClip::Arrangement(_))));
        assert!(matches!(model.delete_clip(pattern_clip.id), Some(AnyClip::Pattern(_))));
        assert!(model.delete_clip(pattern_clip.id).is_none());
    }

    #[test]
    fn test_update_unknown_clip() {
        let mut model = model();
        let err = model.update_clip(ClipId(42), &[ClipUpdate::Hold(true)]).unwrap_err();
        assert!(matches!(err, CadenceError::NotFound { .. }));
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut model = model();
        model.create_pattern("p2".into(), "Chorus");
        let kick = model.create_clip("t1".into(), "p1".into(), "Kick").unwrap().clip;
        model
            .update_clip(
                kick.id,
                &[
                    ClipUpdate::Loop(true),
                    ClipUpdate::Pitch(-3),
                    ClipUpdate::Content(Some("kick.wav".into())),
                ],
            )
            .unwrap();
        model.create_clip("t2".into(), "p2".into(), "Pad").unwrap();
        model.create_clip("t3".into(), "p2".into(), "Lead").unwrap();
        let clip = model
            .add_clip_to_arrangement("t1".into(), 4.0, 2.0, Some("vox.wav".into()))
            .unwrap();
        model.resize_clip(clip.id, 3.0).unwrap();
        model.set_playback_mode(PlaybackMode::Arrangement);

        let json = serde_json::to_string(&model).unwrap();
        let restored: TimelineModel = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.get_patterns(), model.get_patterns());
        assert_eq!(restored.pattern_clips(), model.pattern_clips());
        assert_eq!(restored.get_arrangement_clips(), model.get_arrangement_clips());
        assert_eq!(restored.active_pattern(), model.active_pattern());
        assert_eq!(restored.playback_mode(), PlaybackMode::Arrangement);
        assert_eq!(
            restored.get_clip_for_track_in_pattern(&"t2".into(), &"p2".into()).map(|c| &c.name),
            Some(&"Pad".to_string())
        );

        // Id allocation continues where it left off
        let mut restored = restored;
        let next = restored.add_clip_to_arrangement("t1".into(), 0.0, 1.0, None).unwrap();
        assert!(model.clip(next.id).is_none());
    }
}
