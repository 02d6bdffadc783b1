//! Patterns and their session clips

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::clip::{ClipId, ClipUpdate, PatternClip, PatternId, TrackId};
use crate::error::{CadenceError, Result};

/// Named grouping of session clips, at most one per track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub name: String,
    /// Slot list in insertion order
    pub clips: Vec<ClipId>,
}

impl Pattern {
    pub fn new(id: PatternId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            clips: Vec::new(),
        }
    }
}

/// Persisted form of the store; the slot index is derived
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PatternStoreData {
    patterns: Vec<Pattern>,
    clips: Vec<PatternClip>,
}

/// Owns patterns and pattern clips.
///
/// A clip whose pattern was deleted stays in the store, detached: it is no
/// longer in any slot list and is never launched, but can still be looked up
/// or deleted by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "PatternStoreData", into = "PatternStoreData")]
pub struct PatternStore {
    patterns: Vec<Pattern>,
    clips: HashMap<ClipId, PatternClip>,
    slots: HashMap<(TrackId, PatternId), ClipId>,
}

impl From<PatternStoreData> for PatternStore {
    fn from(data: PatternStoreData) -> Self {
        let mut store = Self {
            patterns: data.patterns,
            clips: data.clips.into_iter().map(|c| (c.id, c)).collect(),
            slots: HashMap::new(),
        };
        store.rebuild_slots();
        store
    }
}

impl From<PatternStore> for PatternStoreData {
    fn from(store: PatternStore) -> Self {
        let mut clips: Vec<PatternClip> = store.clips.into_values().collect();
        clips.sort_by_key(|c| c.id);
        Self {
            patterns: store.patterns,
            clips,
        }
    }
}

impl PatternStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rebuild_slots(&mut self) {
        self.slots.clear();
        for pattern in &self.patterns {
            for id in &pattern.clips {
                if let Some(clip) = self.clips.get(id) {
                    self.slots
                        .insert((clip.track_id.clone(), pattern.id.clone()), *id);
                }
            }
        }
    }

    /// Create a pattern, or rename it if the id already exists
    pub fn create_pattern(&mut self, id: PatternId, name: impl Into<String>) -> &Pattern {
        let name = name.into();
        let idx = match self.patterns.iter().position(|p| p.id == id) {
            Some(idx) => {
                self.patterns[idx].name = name;
                idx
            }
            None => {
                self.patterns.push(Pattern::new(id, name));
                self.patterns.len() - 1
            }
        };
        &self.patterns[idx]
    }

    pub fn rename_pattern(&mut self, id: &PatternId, name: impl Into<String>) -> Result<&Pattern> {
        let pattern = self
            .pattern_mut(id)
            .ok_or_else(|| CadenceError::not_found("pattern", id))?;
        pattern.name = name.into();
        Ok(pattern)
    }

    /// Remove a pattern, detaching its clips. Returns the detached clip ids.
    pub fn delete_pattern(&mut self, id: &PatternId) -> Option<(Pattern, Vec<ClipId>)> {
        let idx = self.patterns.iter().position(|p| &p.id == id)?;
        let pattern = self.patterns.remove(idx);
        self.slots.retain(|(_, pattern_id), _| pattern_id != id);
        let detached = pattern.clips.clone();
        Some((pattern, detached))
    }

    pub fn pattern(&self, id: &PatternId) -> Option<&Pattern> {
        self.patterns.iter().find(|p| &p.id == id)
    }

    fn pattern_mut(&mut self, id: &PatternId) -> Option<&mut Pattern> {
        self.patterns.iter_mut().find(|p| &p.id == id)
    }

    /// Patterns in creation order
    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// Put a clip into its (track, pattern) slot, replacing any previous
    /// occupant in place. Returns the replaced clip.
    pub fn insert_clip(&mut self, clip: PatternClip) -> Result<Option<PatternClip>> {
        let key = (clip.track_id.clone(), clip.pattern_id.clone());
        let previous = self.slots.get(&key).copied();
        let pattern = self
            .patterns
            .iter_mut()
            .find(|p| p.id == clip.pattern_id)
            .ok_or_else(|| CadenceError::not_found("pattern", &clip.pattern_id))?;

        match previous.and_then(|old| pattern.clips.iter().position(|id| *id == old)) {
            Some(idx) => pattern.clips[idx] = clip.id,
            None => pattern.clips.push(clip.id),
        }

        let replaced = previous.and_then(|old| self.clips.remove(&old));
        self.slots.insert(key, clip.id);
        self.clips.insert(clip.id, clip);
        Ok(replaced)
    }

    pub fn remove_clip(&mut self, id: ClipId) -> Option<PatternClip> {
        let clip = self.clips.remove(&id)?;
        let key = (clip.track_id.clone(), clip.pattern_id.clone());
        if self.slots.get(&key) == Some(&id) {
            self.slots.remove(&key);
        }
        if let Some(pattern) = self.pattern_mut(&clip.pattern_id) {
            pattern.clips.retain(|c| *c != id);
        }
        Some(clip)
    }

    /// Apply a batch of updates. Either all apply or, on a validation
    /// failure, none do.
    pub fn update_clip(&mut self, id: ClipId, updates: &[ClipUpdate]) -> Result<&PatternClip> {
        for update in updates {
            update.validate()?;
        }
        let clip = self
            .clips
            .get_mut(&id)
            .ok_or_else(|| CadenceError::not_found("clip", id))?;
        for update in updates {
            update.apply_to_pattern_clip(clip);
        }
        Ok(clip)
    }

    pub fn clip(&self, id: ClipId) -> Option<&PatternClip> {
        self.clips.get(&id)
    }

    pub fn contains(&self, id: ClipId) -> bool {
        self.clips.contains_key(&id)
    }

    /// Whether the clip currently occupies a slot of a live pattern
    pub fn is_attached(&self, id: ClipId) -> bool {
        self.clips
            .get(&id)
            .is_some_and(|c| self.slots.get(&(c.track_id.clone(), c.pattern_id.clone())) == Some(&id))
    }

    pub fn clip_for_track_in_pattern(&self, track_id: &TrackId, pattern_id: &PatternId) -> Option<&PatternClip> {
        let id = self.slots.get(&(track_id.clone(), pattern_id.clone()))?;
        self.clips.get(id)
    }

    /// Clips of a pattern in slot order
    pub fn clips_in_pattern(&self, pattern_id: &PatternId) -> Vec<&PatternClip> {
        self.pattern(pattern_id)
            .map(|p| p.clips.iter().filter_map(|id| self.clips.get(id)).collect())
            .unwrap_or_default()
    }

    /// All clips, ordered by id
    pub fn clips(&self) -> Vec<&PatternClip> {
        let mut clips: Vec<&PatternClip> = self.clips.values().collect();
        clips.sort_by_key(|c| c.id);
        clips
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_pattern() -> PatternStore {
        let mut store = PatternStore::new();
        store.create_pattern("p1".into(), "Verse");
        store
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut store = store_with_pattern();
        let clip = PatternClip::new(ClipId(1), "t1".into(), "p1".into(), "Kick");
        assert!(store.insert_clip(clip).unwrap().is_none());

        let found = store.clip_for_track_in_pattern(&"t1".into(), &"p1".into()).unwrap();
        assert_eq!(found.id, ClipId(1));
        assert!(store.clip_for_track_in_pattern(&"t2".into(), &"p1".into()).is_none());
    }

    #[test]
    fn test_insert_replaces_slot_in_place() {
        let mut store = store_with_pattern();
        store.insert_clip(PatternClip::new(ClipId(1), "t1".into(), "p1".into(), "Kick")).unwrap();
        store.insert_clip(PatternClip::new(ClipId(2), "t2".into(), "p1".into(), "Snare")).unwrap();

        let replaced = store
            .insert_clip(PatternClip::new(ClipId(3), "t1".into(), "p1".into(), "Kick 2"))
            .unwrap();
        assert_eq!(replaced.map(|c| c.id), Some(ClipId(1)));
        assert_eq!(store.len(), 2);
        assert_eq!(store.pattern(&"p1".into()).unwrap().clips, vec![ClipId(3), ClipId(2)]);
    }

    #[test]
    fn test_insert_into_unknown_pattern() {
        let mut store = PatternStore::new();
        let err = store
            .insert_clip(PatternClip::new(ClipId(1), "t1".into(), "nope".into(), "Kick"))
            .unwrap_err();
        assert!(matches!(err, CadenceError::NotFound { kind: "pattern", .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_pattern_detaches_clips() {
        let mut store = store_with_pattern();
        store.insert_clip(PatternClip::new(ClipId(1), "t1".into(), "p1".into(), "Kick")).unwrap();

        let (_, detached) = store.delete_pattern(&"p1".into()).unwrap();
        assert_eq!(detached, vec![ClipId(1)]);
        assert!(store.clip(ClipId(1)).is_some());
        assert!(!store.is_attached(ClipId(1)));

        // Recreating the pattern does not rebind the detached clip
        store.create_pattern("p1".into(), "Verse");
        assert!(store.clip_for_track_in_pattern(&"t1".into(), &"p1".into()).is_none());
    }

    #[test]
    fn test_update_is_all_or_nothing() {
        let mut store = store_with_pattern();
        store.insert_clip(PatternClip::new(ClipId(1), "t1".into(), "p1".into(), "Kick")).unwrap();

        let result = store.update_clip(
            ClipId(1),
            &[ClipUpdate::Name("Renamed".into()), ClipUpdate::Length(f64::NAN)],
        );
        assert!(result.is_err());
        assert_eq!(store.clip(ClipId(1)).unwrap().name, "Kick");

        let clip = store
            .update_clip(ClipId(1), &[ClipUpdate::Loop(true), ClipUpdate::Pitch(-20)])
            .unwrap();
        assert!(clip.flags.loop_enabled);
        assert_eq!(clip.pitch, -12);
    }

    #[test]
    fn test_create_pattern_renames_existing() {
        let mut store = store_with_pattern();
        store.create_pattern("p1".into(), "Chorus");
        assert_eq!(store.patterns().len(), 1);
        assert_eq!(store.patterns()[0].name, "Chorus");
    }
}
