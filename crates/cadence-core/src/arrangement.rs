//! Clips placed at absolute positions on the master timeline

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::clip::{check_position, clamp_duration, ArrangementClip, ClipId, ClipUpdate, ContentRef, TrackId};
use crate::error::{CadenceError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ArrangementStoreData {
    clips: Vec<ArrangementClip>,
    next_revision: u64,
}

/// Owns arrangement clips.
///
/// Clips on one track may overlap. Only one is eligible at any instant: the
/// covering clip with the highest revision, i.e. the one most recently
/// created, moved or resized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "ArrangementStoreData", into = "ArrangementStoreData")]
pub struct ArrangementStore {
    clips: HashMap<ClipId, ArrangementClip>,
    next_revision: u64,
}

impl From<ArrangementStoreData> for ArrangementStore {
    fn from(data: ArrangementStoreData) -> Self {
        Self {
            clips: data.clips.into_iter().map(|c| (c.id, c)).collect(),
            next_revision: data.next_revision,
        }
    }
}

impl From<ArrangementStore> for ArrangementStoreData {
    fn from(store: ArrangementStore) -> Self {
        let mut clips: Vec<ArrangementClip> = store.clips.into_values().collect();
        clips.sort_by_key(|c| c.id);
        Self {
            clips,
            next_revision: store.next_revision,
        }
    }
}

impl ArrangementStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_revision(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }

    pub fn add(
        &mut self,
        id: ClipId,
        track_id: TrackId,
        position: f64,
        duration: f64,
        content: Option<ContentRef>,
    ) -> Result<&ArrangementClip> {
        let position = check_position(position)?;
        let duration = clamp_duration(duration)?;
        let revision = self.bump_revision();
        let clip = ArrangementClip {
            id,
            track_id,
            name: String::new(),
            content,
            position,
            duration,
            revision,
        };
        self.clips.insert(id, clip);
        Ok(&self.clips[&id])
    }

    /// Change the start position; the duration is kept
    pub fn move_clip(&mut self, id: ClipId, position: f64) -> Result<&ArrangementClip> {
        let position = check_position(position)?;
        if !self.clips.contains_key(&id) {
            return Err(CadenceError::not_found("clip", id));
        }
        let revision = self.bump_revision();
        let clip = self
            .clips
            .get_mut(&id)
            .ok_or_else(|| CadenceError::not_found("clip", id))?;
        clip.position = position;
        clip.revision = revision;
        Ok(clip)
    }

    pub fn resize_clip(&mut self, id: ClipId, duration: f64) -> Result<&ArrangementClip> {
        let duration = clamp_duration(duration)?;
        if !self.clips.contains_key(&id) {
            return Err(CadenceError::not_found("clip", id));
        }
        let revision = self.bump_revision();
        let clip = self
            .clips
            .get_mut(&id)
            .ok_or_else(|| CadenceError::not_found("clip", id))?;
        clip.duration = duration;
        clip.revision = revision;
        Ok(clip)
    }

    pub fn update_clip(&mut self, id: ClipId, updates: &[ClipUpdate]) -> Result<&ArrangementClip> {
        if let Some(update) = updates.iter().find(|u| !u.applies_to_arrangement()) {
            return Err(CadenceError::invalid(format!(
                "{update:?} does not apply to arrangement clips"
            )));
        }
        let clip = self
            .clips
            .get_mut(&id)
            .ok_or_else(|| CadenceError::not_found("clip", id))?;
        for update in updates {
            update.apply_to_arrangement_clip(clip);
        }
        Ok(clip)
    }

    pub fn remove(&mut self, id: ClipId) -> Option<ArrangementClip> {
        self.clips.remove(&id)
    }

    pub fn clip(&self, id: ClipId) -> Option<&ArrangementClip> {
        self.clips.get(&id)
    }

    pub fn contains(&self, id: ClipId) -> bool {
        self.clips.contains_key(&id)
    }

    /// Clips on one track ordered by position
    pub fn clips_for_track(&self, track_id: &TrackId) -> Vec<&ArrangementClip> {
        let mut clips: Vec<&ArrangementClip> = self
            .clips
            .values()
            .filter(|c| &c.track_id == track_id)
            .collect();
        clips.sort_by(|a, b| a.position.total_cmp(&b.position).then(a.id.cmp(&b.id)));
        clips
    }

    /// All clips ordered by track, then position
    pub fn clips(&self) -> Vec<&ArrangementClip> {
        let mut clips: Vec<&ArrangementClip> = self.clips.values().collect();
        clips.sort_by(|a, b| {
            a.track_id
                .cmp(&b.track_id)
                .then(a.position.total_cmp(&b.position))
                .then(a.id.cmp(&b.id))
        });
        clips
    }

    /// The covering clip with the highest revision on `track_id` at `beat`
    pub fn clip_at(&self, track_id: &TrackId, beat: f64) -> Option<&ArrangementClip> {
        self.clips
            .values()
            .filter(|c| &c.track_id == track_id && c.covers(beat))
            .max_by_key(|c| c.revision)
    }

    /// Clips whose start lies in `[from, to)`, ordered by position
    pub fn clips_starting_in(&self, from: f64, to: f64) -> Vec<&ArrangementClip> {
        let mut clips: Vec<&ArrangementClip> = self
            .clips
            .values()
            .filter(|c| c.position >= from && c.position < to)
            .collect();
        clips.sort_by(|a, b| a.position.total_cmp(&b.position).then(a.id.cmp(&b.id)));
        clips
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }
}
