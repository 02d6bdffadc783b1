//! Playback engine: the context object owning transport, timeline and
//! scheduler, plus the periodic scheduling worker

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use cadence_core::{
    AnyClip, ArrangementClip, ArrangementClipsChanged, CadenceError, ClipId, ClipUpdate, ContentRef, Event,
    PatternClip, PatternClipsChanged, PatternId, Pattern, PlaybackMode, Position, Result, TimelineModel, Topic,
    TrackId, Transport, TransportSnapshot,
};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::{NotificationBus, Subscription};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::content::ContentStore;
use crate::lock;
use crate::scheduler::{ClipScheduler, VoiceEntry};
use crate::sink::TrackRegistry;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine already running")]
    AlreadyRunning,
    #[error("Engine not running")]
    NotRunning,
    #[error("Worker thread error: {0}")]
    Worker(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] CadenceError),
}

/// Engine state shared between callers and the scheduling worker.
///
/// Locks are always taken in the order transport, timeline, scheduler.
pub struct EngineState {
    pub transport: Mutex<Transport>,
    pub timeline: Mutex<TimelineModel>,
    pub scheduler: Mutex<ClipScheduler>,
    pub bus: NotificationBus,
    clock: Arc<dyn Clock>,
}

impl EngineState {
    /// Run `f` with every lock held and the clock read under them
    fn with_all<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Transport, &mut TimelineModel, &mut ClipScheduler, u64) -> R,
    {
        let mut transport = lock(&self.transport);
        let mut timeline = lock(&self.timeline);
        let mut scheduler = lock(&self.scheduler);
        let now = self.clock.now();
        f(&mut transport, &mut timeline, &mut scheduler, now)
    }

    /// One scheduling pass at the current clock time
    pub fn process(&self) {
        self.with_all(|transport, timeline, scheduler, now| {
            transport.tick(now);
            scheduler.process(transport, timeline, now);
        });
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    fn publish_transport(&self, transport: &Transport, now: u64) -> TransportSnapshot {
        let snapshot = transport.snapshot(now);
        self.bus.publish(Event::Transport(snapshot));
        snapshot
    }

    fn publish_patterns(&self, change: PatternClipsChanged) {
        self.bus.publish(Event::PatternClips(change));
    }

    fn publish_arrangement(&self, change: ArrangementClipsChanged) {
        self.bus.publish(Event::ArrangementClips(change));
    }
}

/// Queue the active pattern's clips for launch
fn launch_active_pattern(timeline: &TimelineModel, scheduler: &mut ClipScheduler, at_beat: Option<f64>) {
    if timeline.playback_mode() != PlaybackMode::Pattern {
        return;
    }
    let Some(pattern) = timeline.active_pattern() else {
        return;
    };
    for clip in timeline.clips_in_pattern(pattern) {
        scheduler.launch(clip.id, at_beat);
    }
}

/// Start the transport and launch the active pattern; no-op while playing
fn start_playback(transport: &mut Transport, timeline: &TimelineModel, scheduler: &mut ClipScheduler, now: u64) {
    if transport.play(now) {
        info!(position = %transport.position(now), "Transport playing");
        launch_active_pattern(timeline, scheduler, None);
        scheduler.process(transport, timeline, now);
    }
}

fn pause_playback(transport: &mut Transport, scheduler: &mut ClipScheduler, now: u64) {
    if transport.pause(now) {
        scheduler.flush(now);
        info!(position = %transport.position(now), "Transport paused");
    }
}

struct SchedulerWorker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Single owner of the playback core
pub struct PlaybackEngine {
    state: Arc<EngineState>,
    worker: Option<SchedulerWorker>,
    config: EngineConfig,
}

impl PlaybackEngine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        tracks: Arc<dyn TrackRegistry>,
        content: Arc<dyn ContentStore>,
    ) -> Self {
        let bus = NotificationBus::new();
        let mut transport = Transport::new(clock.sample_rate());
        if let Err(e) = transport.set_tempo(config.tempo, clock.now()) {
            warn!("Ignoring configured tempo: {e}");
        }
        if let Err(e) = transport.set_time_signature(config.beats_per_bar, config.beat_unit) {
            warn!("Ignoring configured time signature: {e}");
        }
        let lookahead = clock.samples_from_millis(config.lookahead_millis());
        let scheduler = ClipScheduler::new(lookahead, tracks, content, bus.clone());

        Self {
            state: Arc::new(EngineState {
                transport: Mutex::new(transport),
                timeline: Mutex::new(TimelineModel::new()),
                scheduler: Mutex::new(scheduler),
                bus,
                clock,
            }),
            worker: None,
            config,
        }
    }

    /// Shared state, for callers that run their own scheduling loop
    pub fn state(&self) -> Arc<EngineState> {
        self.state.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.state.bus
    }

    /// Start the periodic scheduling worker
    pub fn start(&mut self) -> std::result::Result<(), EngineError> {
        if self.worker.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let state = self.state.clone();
        let interval = self.config.poll_interval();

        let handle = thread::Builder::new()
            .name("cadence-scheduler".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => state.process(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        self.worker = Some(SchedulerWorker { stop_tx, handle });
        info!(interval_ms = interval.as_millis() as u64, "Scheduler started");
        Ok(())
    }

    /// Stop the scheduling worker
    pub fn stop_worker(&mut self) -> std::result::Result<(), EngineError> {
        let worker = self.worker.take().ok_or(EngineError::NotRunning)?;
        let _ = worker.stop_tx.send(());
        if worker.handle.join().is_err() {
            warn!("Scheduler thread panicked");
        }
        info!("Scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Run one scheduling pass now
    pub fn process(&self) {
        self.state.process();
    }

    pub fn play(&self) -> TransportSnapshot {
        let state = &self.state;
        state.with_all(|transport, timeline, scheduler, now| {
            start_playback(transport, timeline, scheduler, now);
            state.publish_transport(transport, now)
        })
    }

    /// Pause, stopping every voice before the transport notification
    pub fn pause(&self) -> TransportSnapshot {
        let state = &self.state;
        state.with_all(|transport, _, scheduler, now| {
            pause_playback(transport, scheduler, now);
            state.publish_transport(transport, now)
        })
    }

    /// Stop and rewind, stopping every voice before the transport notification
    pub fn stop(&self) -> TransportSnapshot {
        let state = &self.state;
        state.with_all(|transport, _, scheduler, now| {
            scheduler.flush(now);
            transport.stop();
            info!("Transport stopped");
            state.publish_transport(transport, now)
        })
    }

    pub fn toggle_play(&self) -> TransportSnapshot {
        let state = &self.state;
        state.with_all(|transport, timeline, scheduler, now| {
            if transport.is_playing() {
                pause_playback(transport, scheduler, now);
            } else {
                start_playback(transport, timeline, scheduler, now);
            }
            state.publish_transport(transport, now)
        })
    }

    /// Flip the record arm; returns whether it is now armed
    pub fn toggle_record(&self) -> bool {
        let state = &self.state;
        state.with_all(|transport, _, _, now| {
            let armed = transport.toggle_record();
            info!(armed, "Record arm toggled");
            state.publish_transport(transport, now);
            armed
        })
    }

    /// Returns the tempo that took effect after clamping
    pub fn set_tempo(&self, bpm: f64) -> Result<f64> {
        let state = &self.state;
        state.with_all(|transport, _, _, now| {
            let bpm = transport.set_tempo(bpm, now)?;
            info!(bpm, "Tempo changed");
            state.publish_transport(transport, now);
            Ok(bpm)
        })
    }

    pub fn set_time_signature(&self, beats_per_bar: u32, beat_unit: u32) -> Result<()> {
        let state = &self.state;
        state.with_all(|transport, _, _, now| {
            transport.tick(now);
            transport.set_time_signature(beats_per_bar, beat_unit)?;
            state.publish_transport(transport, now);
            Ok(())
        })
    }

    /// Seek. While playing, voices are flushed and in pattern mode the clips
    /// that were playing are relaunched from the new position.
    pub fn set_position(&self, bar: u32, beat: f64) -> Result<Position> {
        let state = &self.state;
        state.with_all(|transport, timeline, scheduler, now| {
            let position = transport.set_position(bar, beat, now)?;
            if transport.is_playing() {
                let affected = scheduler.flush(now);
                if timeline.playback_mode() == PlaybackMode::Pattern {
                    for clip_id in affected.into_iter().filter(|id| timeline.is_attached(*id)) {
                        scheduler.launch(clip_id, None);
                    }
                }
                scheduler.process(transport, timeline, now);
            }
            info!(%position, "Seek");
            state.publish_transport(transport, now);
            Ok(position)
        })
    }

    pub fn toggle_metronome(&self) -> bool {
        let state = &self.state;
        state.with_all(|transport, _, _, now| {
            let enabled = transport.toggle_metronome();
            state.publish_transport(transport, now);
            enabled
        })
    }

    pub fn get_state(&self) -> TransportSnapshot {
        let transport = lock(&self.state.transport);
        transport.snapshot(self.state.now())
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.state.bus.subscribe(topic)
    }

    pub fn subscribe_transport(&self) -> Subscription {
        self.subscribe(Topic::Transport)
    }

    pub fn subscribe_pattern_clips(&self) -> Subscription {
        self.subscribe(Topic::PatternClips)
    }

    pub fn subscribe_arrangement_clips(&self) -> Subscription {
        self.subscribe(Topic::ArrangementClips)
    }

    /// Playing-state changes of one clip
    pub fn subscribe_clip(&self, clip_id: ClipId) -> Subscription {
        self.state.bus.subscribe_clip(clip_id)
    }

    pub fn create_pattern(&self, id: impl Into<PatternId>, name: impl Into<String>) -> Pattern {
        let id = id.into();
        let mut timeline = lock(&self.state.timeline);
        let pattern = timeline.create_pattern(id.clone(), name).clone();
        self.state.publish_patterns(PatternClipsChanged::PatternCreated(id));
        pattern
    }

    pub fn rename_pattern(&self, id: &PatternId, name: impl Into<String>) -> Result<Pattern> {
        let mut timeline = lock(&self.state.timeline);
        let pattern = timeline.rename_pattern(id, name)?.clone();
        self.state.publish_patterns(PatternClipsChanged::PatternRenamed(id.clone()));
        Ok(pattern)
    }

    /// Delete a pattern, stopping and detaching its clips. Unknown ids are a
    /// no-op and return `None`.
    pub fn delete_pattern(&self, id: &PatternId) -> Option<Vec<ClipId>> {
        let state = &self.state;
        state.with_all(|_, timeline, scheduler, now| {
            let detached = timeline.delete_pattern(id)?;
            for clip_id in &detached {
                scheduler.forget_clip(*clip_id, now);
            }
            state.publish_patterns(PatternClipsChanged::PatternDeleted {
                pattern: id.clone(),
                detached: detached.clone(),
            });
            Some(detached)
        })
    }

    pub fn get_patterns(&self) -> Vec<Pattern> {
        lock(&self.state.timeline).get_patterns().to_vec()
    }

    pub fn active_pattern(&self) -> Option<PatternId> {
        lock(&self.state.timeline).active_pattern().cloned()
    }

    /// Make a pattern active. While playing in pattern mode, the previous
    /// pattern's clips stop at the next bar where the new ones start.
    pub fn launch_pattern(&self, id: &PatternId) -> Result<()> {
        let state = &self.state;
        state.with_all(|transport, timeline, scheduler, now| {
            timeline.set_active_pattern(id)?;
            if transport.is_playing() && timeline.playback_mode() == PlaybackMode::Pattern {
                transport.tick(now);
                let boundary = transport.next_bar_at_or_after(transport.beat_at(now));
                for voice in scheduler.voices(now) {
                    let outgoing = timeline
                        .pattern_clip(voice.clip_id)
                        .is_some_and(|c| &c.pattern_id != id);
                    if outgoing {
                        scheduler.stop_clip_at(voice.clip_id, boundary);
                    }
                }
                launch_active_pattern(timeline, scheduler, Some(boundary));
                scheduler.process(transport, timeline, now);
            }
            info!(pattern = %id, "Pattern launched");
            state.publish_patterns(PatternClipsChanged::ActivePatternChanged(Some(id.clone())));
            Ok(())
        })
    }

    pub fn playback_mode(&self) -> PlaybackMode {
        lock(&self.state.timeline).playback_mode()
    }

    /// Switch between pattern and arrangement playback; voices of the old
    /// mode are stopped. Setting the current mode only republishes it.
    pub fn set_playback_mode(&self, mode: PlaybackMode) {
        let state = &self.state;
        state.with_all(|transport, timeline, scheduler, now| {
            if timeline.playback_mode() != mode {
                timeline.set_playback_mode(mode);
                if transport.is_playing() {
                    scheduler.flush(now);
                    launch_active_pattern(timeline, scheduler, None);
                    scheduler.process(transport, timeline, now);
                }
                info!(?mode, "Playback mode changed");
            }
            state.publish_patterns(PatternClipsChanged::PlaybackModeChanged(mode));
        });
    }

    /// Create the clip for a (track, pattern) slot. A previous occupant is
    /// replaced and its voice stopped.
    pub fn create_clip(
        &self,
        track_id: impl Into<TrackId>,
        pattern_id: impl Into<PatternId>,
        name: impl Into<String>,
    ) -> Result<PatternClip> {
        let (track_id, pattern_id) = (track_id.into(), pattern_id.into());
        let state = &self.state;
        state.with_all(|_, timeline, scheduler, now| {
            let created = timeline.create_clip(track_id, pattern_id, name)?;
            let replaced = created.replaced.map(|old| old.id);
            if let Some(old) = replaced {
                scheduler.forget_clip(old, now);
            }
            state.publish_patterns(PatternClipsChanged::ClipCreated {
                clip: created.clip.clone(),
                replaced,
            });
            Ok(created.clip)
        })
    }

    pub fn get_clip_for_track_in_pattern(&self, track_id: &TrackId, pattern_id: &PatternId) -> Option<PatternClip> {
        lock(&self.state.timeline)
            .get_clip_for_track_in_pattern(track_id, pattern_id)
            .cloned()
    }

    pub fn get_pattern_clips(&self) -> Vec<PatternClip> {
        lock(&self.state.timeline).pattern_clips().into_iter().cloned().collect()
    }

    pub fn add_clip_to_arrangement(
        &self,
        track_id: impl Into<TrackId>,
        position: f64,
        duration: f64,
        content: Option<ContentRef>,
    ) -> Result<ArrangementClip> {
        let track_id = track_id.into();
        let state = &self.state;
        state.with_all(|transport, timeline, scheduler, now| {
            let clip = timeline.add_clip_to_arrangement(track_id, position, duration, content)?;
            scheduler.reschedule_clip(clip.id, transport, now);
            state.publish_arrangement(ArrangementClipsChanged::Added(clip.clone()));
            Ok(clip)
        })
    }

    /// Move a clip; a live voice is cut and the clip rescheduled
    pub fn move_clip(&self, id: ClipId, position: f64) -> Result<ArrangementClip> {
        let state = &self.state;
        state.with_all(|transport, timeline, scheduler, now| {
            let clip = timeline.move_clip(id, position)?;
            scheduler.reschedule_clip(id, transport, now);
            state.publish_arrangement(ArrangementClipsChanged::Moved(clip.clone()));
            Ok(clip)
        })
    }

    pub fn resize_clip(&self, id: ClipId, duration: f64) -> Result<ArrangementClip> {
        let state = &self.state;
        state.with_all(|transport, timeline, scheduler, now| {
            let clip = timeline.resize_clip(id, duration)?;
            scheduler.clip_resized(id, clip.end(), transport, now);
            state.publish_arrangement(ArrangementClipsChanged::Resized(clip.clone()));
            Ok(clip)
        })
    }

    /// Arrangement clips of a track ordered by position
    pub fn get_clips_for_track(&self, track_id: &TrackId) -> Vec<ArrangementClip> {
        lock(&self.state.timeline)
            .get_clips_for_track(track_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn get_arrangement_clips(&self) -> Vec<ArrangementClip> {
        lock(&self.state.timeline)
            .get_arrangement_clips()
            .into_iter()
            .cloned()
            .collect()
    }

    /// The arrangement clip that owns a track at `beat` under last write
    /// wins. Playback picks a clip up only at its own start, so a clip that
    /// takes over a track midway through stays silent.
    pub fn clip_at(&self, track_id: &TrackId, beat: f64) -> Option<ArrangementClip> {
        lock(&self.state.timeline).clip_at(track_id, beat).cloned()
    }

    pub fn clip(&self, id: ClipId) -> Option<AnyClip> {
        lock(&self.state.timeline).clip(id)
    }

    /// Delete a clip of either kind, cancelling its voice. Unknown ids are a
    /// no-op and return `None`.
    pub fn delete_clip(&self, id: ClipId) -> Option<AnyClip> {
        let state = &self.state;
        state.with_all(|transport, timeline, scheduler, now| {
            let clip = timeline.delete_clip(id)?;
            match &clip {
                AnyClip::Pattern(_) => {
                    scheduler.forget_clip(id, now);
                    state.publish_patterns(PatternClipsChanged::ClipDeleted(id));
                }
                AnyClip::Arrangement(_) => {
                    scheduler.reschedule_clip(id, transport, now);
                    state.publish_arrangement(ArrangementClipsChanged::Deleted(id));
                }
            }
            Some(clip)
        })
    }

    /// Apply a batch of updates; all or nothing
    pub fn update_clip(&self, id: ClipId, updates: &[ClipUpdate]) -> Result<AnyClip> {
        let mut timeline = lock(&self.state.timeline);
        let clip = timeline.update_clip(id, updates)?;
        match &clip {
            AnyClip::Pattern(c) => self.state.publish_patterns(PatternClipsChanged::ClipUpdated(c.clone())),
            AnyClip::Arrangement(c) => self
                .state
                .publish_arrangement(ArrangementClipsChanged::Updated(c.clone())),
        }
        Ok(clip)
    }

    /// Launch a pattern clip, quantized per its flags. While stopped the
    /// launch waits for the next `play`.
    pub fn launch_clip(&self, id: ClipId) -> Result<()> {
        self.state.with_all(|transport, timeline, scheduler, now| {
            match timeline.clip(id) {
                Some(AnyClip::Pattern(_)) => {}
                Some(AnyClip::Arrangement(_)) => {
                    return Err(CadenceError::invalid(format!("{id} is an arrangement clip")));
                }
                None => return Err(CadenceError::not_found("clip", id)),
            }
            if !timeline.is_attached(id) {
                return Err(CadenceError::not_found("pattern for clip", id));
            }
            scheduler.launch(id, None);
            if transport.is_playing() {
                transport.tick(now);
                scheduler.process(transport, timeline, now);
            }
            Ok(())
        })
    }

    /// Stop a clip immediately. Returns false if nothing was playing or queued.
    pub fn stop_clip(&self, id: ClipId) -> bool {
        self.state.with_all(|_, _, scheduler, now| scheduler.stop_clip(id, now))
    }

    /// Release a held clip
    pub fn release_clip(&self, id: ClipId) -> bool {
        self.state.with_all(|_, _, scheduler, now| scheduler.release_clip(id, now))
    }

    pub fn is_playing(&self, id: ClipId) -> bool {
        let scheduler = lock(&self.state.scheduler);
        scheduler.is_playing(id, self.state.now())
    }

    pub fn voices(&self) -> Vec<VoiceEntry> {
        let scheduler = lock(&self.state.scheduler);
        scheduler.voices(self.state.now())
    }

    /// Swap in a loaded timeline, stopping every voice
    pub fn replace_timeline(&self, model: TimelineModel) {
        let state = &self.state;
        state.with_all(|transport, timeline, scheduler, now| {
            scheduler.flush(now);
            *timeline = model;
            if transport.is_playing() {
                launch_active_pattern(timeline, scheduler, None);
                scheduler.process(transport, timeline, now);
            }
            info!(
                patterns = timeline.get_patterns().len(),
                arrangement_clips = timeline.get_arrangement_clips().len(),
                "Timeline replaced"
            );
            state.publish_patterns(PatternClipsChanged::Reloaded);
            state.publish_arrangement(ArrangementClipsChanged::Reloaded);
        });
    }

    /// Clone of the timeline, for persistence
    pub fn timeline_snapshot(&self) -> TimelineModel {
        lock(&self.state.timeline).clone()
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.stop_worker();
        }
    }
}
