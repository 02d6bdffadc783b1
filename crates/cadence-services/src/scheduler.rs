//! Lookahead clip scheduler
//!
//! Each pass looks `lookahead` samples past the current clock time, turns
//! the musical positions falling inside that window into clock times, and
//! dispatches start/stop commands to the track sinks ahead of time. Passes
//! run at a coarse interval; as long as the interval is shorter than the
//! lookahead, no command is dispatched late.
//!
//! Work that is not yet due lives in the planned queue, in beats, so tempo
//! changes move it along. Cancelling a planned command is removal; cancelling
//! a dispatched one takes a counter `stop_voice`.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_core::{
    ClipId, Event, MetronomeTick, PlaybackMode, TimelineModel, TrackId, Transport, VoiceEvent,
};
use tracing::{debug, trace, warn};

use crate::bus::NotificationBus;
use crate::content::ContentStore;
use crate::sink::{AudioSink, StartVoice, TrackRegistry, VoiceHandle};

/// Public view of one live voice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceEntry {
    pub clip_id: ClipId,
    pub track_id: TrackId,
    pub start_sample: u64,
    /// `None` while the voice has no stop dispatched (looping or held)
    pub stop_sample: Option<u64>,
    pub looping: bool,
}

struct LiveVoice {
    entry: VoiceEntry,
    handle: VoiceHandle,
    sink: Arc<dyn AudioSink>,
    hold: bool,
    arrangement: bool,
}

impl LiveVoice {
    fn is_live(&self, now: u64) -> bool {
        self.entry.stop_sample.is_none_or(|s| s > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    /// `cycle` marks the re-entry of a looping clip
    Start { cycle: bool },
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Planned {
    clip_id: ClipId,
    at_beat: f64,
    action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Launch {
    clip_id: ClipId,
    /// Nominal start; `None` means "now"
    at_beat: Option<f64>,
}

/// What a start dispatch needs to know about a clip
struct Playable {
    track_id: TrackId,
    content: Option<cadence_core::ContentRef>,
    pitch: i8,
    length_beats: f64,
    looping: bool,
    hold: bool,
    arrangement: bool,
}

pub struct ClipScheduler {
    lookahead: u64,
    tracks: Arc<dyn TrackRegistry>,
    content: Arc<dyn ContentStore>,
    bus: NotificationBus,
    voices: HashMap<ClipId, LiveVoice>,
    planned: Vec<Planned>,
    pending: Vec<Launch>,
    /// Arrangement clips already planned, with the start they were planned at
    arranged: HashMap<ClipId, f64>,
    /// Beat up to which arrangement clips have been scanned
    clip_horizon: Option<f64>,
    /// Beat up to which metronome ticks have been emitted
    tick_horizon: Option<f64>,
}

impl ClipScheduler {
    pub fn new(
        lookahead: u64,
        tracks: Arc<dyn TrackRegistry>,
        content: Arc<dyn ContentStore>,
        bus: NotificationBus,
    ) -> Self {
        Self {
            lookahead: lookahead.max(1),
            tracks,
            content,
            bus,
            voices: HashMap::new(),
            planned: Vec::new(),
            pending: Vec::new(),
            arranged: HashMap::new(),
            clip_horizon: None,
            tick_horizon: None,
        }
    }

    pub fn lookahead(&self) -> u64 {
        self.lookahead
    }

    /// True iff a non-expired voice exists for the clip
    pub fn is_playing(&self, clip_id: ClipId, now: u64) -> bool {
        self.voices.get(&clip_id).is_some_and(|v| v.is_live(now))
    }

    /// Live voices ordered by start time
    pub fn voices(&self, now: u64) -> Vec<VoiceEntry> {
        let mut voices: Vec<VoiceEntry> = self
            .voices
            .values()
            .filter(|v| v.is_live(now))
            .map(|v| v.entry.clone())
            .collect();
        voices.sort_by_key(|v| (v.start_sample, v.clip_id));
        voices
    }

    /// Whether the clip has a launch or command waiting
    pub fn is_queued(&self, clip_id: ClipId) -> bool {
        self.pending.iter().any(|l| l.clip_id == clip_id)
            || self.planned.iter().any(|p| p.clip_id == clip_id)
    }

    /// Request a launch. Quantized clips snap to the next bar at or after
    /// `at_beat` (or the current position). A pending launch for the same
    /// clip is replaced.
    pub fn launch(&mut self, clip_id: ClipId, at_beat: Option<f64>) {
        self.pending.retain(|l| l.clip_id != clip_id);
        self.pending.push(Launch { clip_id, at_beat });
    }

    /// Stop a clip now, cancelling anything queued for it.
    /// Returns true if something was playing or queued.
    pub fn stop_clip(&mut self, clip_id: ClipId, now: u64) -> bool {
        let queued = self.cancel_queued(clip_id);
        let Some(voice) = self.voices.remove(&clip_id) else {
            return queued;
        };
        if voice.is_live(now) {
            self.stop_voice(&voice, now);
        }
        true
    }

    /// Stop a clip at a musical position (e.g. the next bar). Queued starts
    /// and loop cycles are dropped; an earlier planned stop is kept.
    pub fn stop_clip_at(&mut self, clip_id: ClipId, at_beat: f64) {
        self.pending.retain(|l| l.clip_id != clip_id);
        self.planned.retain(|p| p.clip_id != clip_id || p.action == Action::Stop);
        if !self.voices.contains_key(&clip_id) {
            return;
        }
        let stops_earlier = self
            .planned
            .iter()
            .any(|p| p.clip_id == clip_id && p.at_beat <= at_beat);
        if stops_earlier {
            return;
        }
        self.planned.retain(|p| p.clip_id != clip_id);
        self.planned.push(Planned {
            clip_id,
            at_beat,
            action: Action::Stop,
        });
    }

    /// Release a held voice. No-op for voices that are not held.
    pub fn release_clip(&mut self, clip_id: ClipId, now: u64) -> bool {
        if !self.voices.get(&clip_id).is_some_and(|v| v.hold && v.is_live(now)) {
            return false;
        }
        self.stop_clip(clip_id, now)
    }

    /// Forget a clip entirely (deleted from the timeline)
    pub fn forget_clip(&mut self, clip_id: ClipId, now: u64) -> bool {
        self.arranged.remove(&clip_id);
        self.stop_clip(clip_id, now)
    }

    /// An arrangement clip moved, appeared or was deleted: cut its voice and
    /// rescan the window from the current position, so a clip it was
    /// shadowing can take its place.
    pub fn reschedule_clip(&mut self, clip_id: ClipId, transport: &Transport, now: u64) {
        self.forget_clip(clip_id, now);
        self.rewind(transport.beat_at(now));
    }

    /// An arrangement clip changed length: move its planned stop
    pub fn clip_resized(&mut self, clip_id: ClipId, end_beat: f64, transport: &Transport, now: u64) {
        for planned in &mut self.planned {
            if planned.clip_id == clip_id && planned.action == Action::Stop {
                planned.at_beat = end_beat;
            }
        }
        self.rewind(transport.beat_at(now));
    }

    fn rewind(&mut self, beat: f64) {
        if let Some(horizon) = self.clip_horizon {
            self.clip_horizon = Some(horizon.min(beat));
        }
    }

    /// Stop every voice now and drop all queued work. Returns the clips that
    /// were playing or queued.
    pub fn flush(&mut self, now: u64) -> Vec<ClipId> {
        let mut affected: Vec<ClipId> = self
            .pending
            .iter()
            .map(|l| l.clip_id)
            .chain(self.planned.iter().map(|p| p.clip_id))
            .collect();

        let mut voices: Vec<LiveVoice> = self.voices.drain().map(|(_, v)| v).collect();
        voices.sort_by_key(|v| (v.entry.start_sample, v.entry.clip_id));
        for voice in &voices {
            if voice.is_live(now) {
                self.stop_voice(voice, now);
                affected.push(voice.entry.clip_id);
            }
        }

        self.pending.clear();
        self.planned.clear();
        self.arranged.clear();
        self.clip_horizon = None;
        self.tick_horizon = None;

        affected.sort();
        affected.dedup();
        if !affected.is_empty() {
            debug!("Flushed {} clips", affected.len());
        }
        affected
    }

    fn cancel_queued(&mut self, clip_id: ClipId) -> bool {
        let before = self.pending.len() + self.planned.len();
        self.pending.retain(|l| l.clip_id != clip_id);
        self.planned.retain(|p| p.clip_id != clip_id);
        before != self.pending.len() + self.planned.len()
    }

    fn stop_voice(&self, voice: &LiveVoice, at: u64) {
        voice.sink.stop_voice(voice.handle, at);
        self.bus.publish(Event::Voice(VoiceEvent::Stopped {
            clip_id: voice.entry.clip_id,
            track_id: voice.entry.track_id.clone(),
            stop_sample: at,
        }));
    }

    /// One scheduling pass
    pub fn process(&mut self, transport: &Transport, timeline: &TimelineModel, now: u64) {
        if !transport.is_playing() {
            return;
        }
        self.voices.retain(|_, v| v.is_live(now));

        let now_beat = transport.beat_at(now);
        let window_end = now + self.lookahead;
        let end_beat = transport.beat_at(window_end);

        if transport.metronome_enabled() {
            self.emit_ticks(transport, now, now_beat, end_beat);
        } else {
            self.tick_horizon = None;
        }

        if timeline.playback_mode() == PlaybackMode::Arrangement {
            self.scan_arrangement(timeline, now_beat, end_beat);
        }
        self.resolve_launches(transport, timeline, now_beat);

        while let Some(idx) = self.next_due(transport, window_end) {
            let planned = self.planned.swap_remove(idx);
            match planned.action {
                Action::Start { cycle } => self.dispatch_start(planned, cycle, transport, timeline, now),
                Action::Stop => self.dispatch_stop(planned, transport, now),
            }
        }
    }

    fn emit_ticks(&mut self, transport: &Transport, now: u64, now_beat: f64, end_beat: f64) {
        let from = self.tick_horizon.unwrap_or(now_beat);
        let bpb = transport.time_signature().beats_per_bar as u64;
        let mut beat = from.ceil();
        while beat < end_beat {
            let index = beat as u64;
            let tick = MetronomeTick {
                bar: (index / bpb) as u32,
                beat: (index % bpb) as u32,
                at_sample: transport.sample_at_beat(beat).max(now),
                downbeat: index % bpb == 0,
            };
            self.bus.publish(Event::Metronome(tick));
            beat += 1.0;
        }
        self.tick_horizon = Some(end_beat.max(from));
    }

    fn scan_arrangement(&mut self, timeline: &TimelineModel, now_beat: f64, end_beat: f64) {
        let from = self.clip_horizon.unwrap_or(now_beat);
        if end_beat <= from {
            return;
        }
        for clip in timeline.arrangement_clips_starting_in(from, end_beat) {
            if self.arranged.get(&clip.id) == Some(&clip.position) {
                continue;
            }
            // Only the eligible clip at its own start plays
            let eligible = timeline
                .clip_at(&clip.track_id, clip.position)
                .is_some_and(|c| c.id == clip.id);
            if !eligible {
                trace!("{} shadowed at beat {}", clip.id, clip.position);
                continue;
            }
            self.arranged.insert(clip.id, clip.position);
            self.planned.push(Planned {
                clip_id: clip.id,
                at_beat: clip.position,
                action: Action::Start { cycle: false },
            });
        }
        self.clip_horizon = Some(end_beat);
    }

    fn resolve_launches(&mut self, transport: &Transport, timeline: &TimelineModel, now_beat: f64) {
        for launch in std::mem::take(&mut self.pending) {
            let Some(clip) = timeline.pattern_clip(launch.clip_id) else {
                continue;
            };
            if !timeline.is_attached(clip.id) {
                continue;
            }
            let nominal = launch.at_beat.unwrap_or(now_beat).max(now_beat);
            let at_beat = if clip.flags.quantize {
                transport.next_bar_at_or_after(nominal)
            } else {
                nominal
            };
            // A new launch supersedes whatever was queued for the clip
            self.planned.retain(|p| p.clip_id != clip.id);
            self.planned.push(Planned {
                clip_id: clip.id,
                at_beat,
                action: Action::Start { cycle: false },
            });
        }
    }

    /// Earliest planned command due before `window_end`; stops sort before
    /// starts at the same instant.
    fn next_due(&self, transport: &Transport, window_end: u64) -> Option<usize> {
        self.planned
            .iter()
            .enumerate()
            .map(|(idx, p)| (idx, transport.sample_at_beat(p.at_beat), matches!(p.action, Action::Start { .. })))
            .filter(|(_, at, _)| *at < window_end)
            .min_by_key(|(_, at, is_start)| (*at, *is_start))
            .map(|(idx, _, _)| idx)
    }

    fn playable(&self, timeline: &TimelineModel, clip_id: ClipId, at_beat: f64) -> Option<Playable> {
        if let Some(clip) = timeline.pattern_clip(clip_id) {
            if !timeline.is_attached(clip_id) {
                return None;
            }
            return Some(Playable {
                track_id: clip.track_id.clone(),
                content: clip.content.clone(),
                pitch: clip.pitch,
                length_beats: clip.length_beats,
                looping: clip.flags.loop_enabled,
                hold: clip.flags.hold,
                arrangement: false,
            });
        }
        let clip = timeline.arrangement_clip(clip_id)?;
        // Moved since it was planned
        if clip.position != at_beat {
            return None;
        }
        Some(Playable {
            track_id: clip.track_id.clone(),
            content: clip.content.clone(),
            pitch: 0,
            length_beats: clip.duration,
            looping: false,
            hold: false,
            arrangement: true,
        })
    }

    fn dispatch_start(
        &mut self,
        planned: Planned,
        cycle: bool,
        transport: &Transport,
        timeline: &TimelineModel,
        now: u64,
    ) {
        let Some(clip) = self.playable(timeline, planned.clip_id, planned.at_beat) else {
            trace!("{} no longer playable", planned.clip_id);
            return;
        };

        // Looping was switched off since the last cycle
        if cycle && !clip.looping {
            if self.voices.contains_key(&planned.clip_id) {
                self.dispatch_stop(
                    Planned { action: Action::Stop, ..planned },
                    transport,
                    now,
                );
            }
            return;
        }

        let start_sample = transport.sample_at_beat(planned.at_beat).max(now);
        let next_beat = planned.at_beat + clip.length_beats;
        // Loops keep cycling through transient failures
        let retry_cycle = clip.looping && !clip.hold;

        let Some(sink) = self.tracks.sink(&clip.track_id) else {
            trace!("Track '{}' has no output, skipping {}", clip.track_id, planned.clip_id);
            if retry_cycle {
                self.plan_cycle(planned.clip_id, next_beat);
            }
            return;
        };

        let content = match &clip.content {
            Some(content_ref) => match self.content.resolve(content_ref) {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!("Dropping voice for {}: {e}", planned.clip_id);
                    if retry_cycle {
                        self.plan_cycle(planned.clip_id, next_beat);
                    }
                    return;
                }
            },
            None => None,
        };

        let request = StartVoice {
            clip_id: planned.clip_id,
            track_id: clip.track_id.clone(),
            content_ref: clip.content.clone(),
            content,
            start_sample,
            pitch: clip.pitch,
            looping: clip.looping,
        };
        let handle = match sink.start_voice(&request) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Sink rejected {}: {e}", planned.clip_id);
                if retry_cycle {
                    self.plan_cycle(planned.clip_id, next_beat);
                }
                return;
            }
        };
        debug!(
            clip = %planned.clip_id,
            track = %clip.track_id,
            at = start_sample,
            beat = planned.at_beat,
            "Dispatched start"
        );

        // Retrigger replaces the previous voice at the new start
        if let Some(previous) = self.voices.remove(&planned.clip_id) {
            previous.sink.stop_voice(previous.handle, start_sample);
        }
        // One arrangement voice per track
        if clip.arrangement {
            let displaced: Vec<ClipId> = self
                .voices
                .values()
                .filter(|v| v.arrangement && v.entry.track_id == clip.track_id && v.is_live(start_sample))
                .map(|v| v.entry.clip_id)
                .collect();
            for clip_id in displaced {
                self.cancel_queued(clip_id);
                if let Some(voice) = self.voices.remove(&clip_id) {
                    self.stop_voice(&voice, start_sample);
                }
            }
        }

        let entry = VoiceEntry {
            clip_id: planned.clip_id,
            track_id: clip.track_id.clone(),
            start_sample,
            stop_sample: None,
            looping: clip.looping,
        };
        self.voices.insert(
            planned.clip_id,
            LiveVoice {
                entry,
                handle,
                sink,
                hold: clip.hold,
                arrangement: clip.arrangement,
            },
        );
        self.bus.publish(Event::Voice(VoiceEvent::Started {
            clip_id: planned.clip_id,
            track_id: clip.track_id,
            start_sample,
        }));

        if clip.hold {
            return;
        }
        if clip.looping {
            self.plan_cycle(planned.clip_id, next_beat);
        } else {
            self.planned.push(Planned {
                clip_id: planned.clip_id,
                at_beat: next_beat,
                action: Action::Stop,
            });
        }
    }

    fn plan_cycle(&mut self, clip_id: ClipId, at_beat: f64) {
        self.planned.push(Planned {
            clip_id,
            at_beat,
            action: Action::Start { cycle: true },
        });
    }

    fn dispatch_stop(&mut self, planned: Planned, transport: &Transport, now: u64) {
        let stop_sample = transport.sample_at_beat(planned.at_beat).max(now);
        let Some(voice) = self.voices.get_mut(&planned.clip_id) else {
            return;
        };
        if voice.entry.stop_sample.is_some_and(|s| s <= stop_sample) {
            return;
        }
        voice.entry.stop_sample = Some(stop_sample);
        voice.sink.stop_voice(voice.handle, stop_sample);
        debug!(clip = %planned.clip_id, at = stop_sample, "Dispatched stop");
        let event = VoiceEvent::Stopped {
            clip_id: planned.clip_id,
            track_id: voice.entry.track_id.clone(),
            stop_sample,
        };
        self.bus.publish(Event::Voice(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ContentData, MemoryContentStore, SampleBuffer};
    use crate::sink::{LogSink, SinkCommand, SinkRegistry};
    use cadence_core::{ClipUpdate, Result, Topic};

    const SR: u32 = 48000;
    /// 200 ms
    const LOOKAHEAD: u64 = 9600;
    /// One beat at 120 BPM
    const BEAT: u64 = 24000;

    struct Rig {
        scheduler: ClipScheduler,
        transport: Transport,
        timeline: TimelineModel,
        sink: Arc<LogSink>,
        registry: Arc<SinkRegistry>,
        content: Arc<MemoryContentStore>,
        bus: NotificationBus,
    }

    impl Rig {
        fn new() -> Self {
            let registry = Arc::new(SinkRegistry::new());
            let sink = Arc::new(LogSink::new("t1"));
            registry.register("t1".into(), sink.clone());
            let content = Arc::new(MemoryContentStore::new());
            let bus = NotificationBus::new();
            let scheduler = ClipScheduler::new(LOOKAHEAD, registry.clone(), content.clone(), bus.clone());
            let mut timeline = TimelineModel::new();
            timeline.create_pattern("p1".into(), "Main");
            Self {
                scheduler,
                transport: Transport::new(SR),
                timeline,
                sink,
                registry,
                content,
                bus,
            }
        }

        fn pattern_clip(&mut self, track: &str, updates: &[ClipUpdate]) -> ClipId {
            let id = self.timeline.create_clip(track.into(), "p1".into(), "clip").unwrap().clip.id;
            self.timeline.update_clip(id, updates).unwrap();
            id
        }

        /// Run passes every 25 ms from `from` up to `to`
        fn run(&mut self, from: u64, to: u64) {
            let mut now = from;
            while now <= to {
                self.transport.tick(now);
                self.scheduler.process(&self.transport, &self.timeline, now);
                now += 1200;
            }
        }
    }

    #[test]
    fn test_quantized_launch_waits_for_bar() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t1", &[]);
        rig.transport.play(0);
        rig.transport.set_position(0, 1.0, 0).unwrap();

        rig.scheduler.launch(clip, None);
        rig.run(0, BEAT);
        // Next bar is beat 4, three beats away
        assert_eq!(rig.sink.start_count(), 0);
        assert!(!rig.scheduler.is_playing(clip, BEAT));
        assert!(rig.scheduler.is_queued(clip));

        rig.run(BEAT, 3 * BEAT);
        assert_eq!(rig.sink.starts_for(clip), vec![(3 * BEAT, 0)]);
        assert!(rig.scheduler.is_playing(clip, 3 * BEAT));
    }

    #[test]
    fn test_unquantized_launch_starts_now() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t1", &[ClipUpdate::Quantize(false), ClipUpdate::Pitch(5)]);
        rig.transport.play(0);
        rig.run(0, 12000);

        rig.scheduler.launch(clip, None);
        rig.run(12000, 12000);
        assert_eq!(rig.sink.starts_for(clip), vec![(12000, 5)]);
    }

    #[test]
    fn test_one_shot_stops_after_length() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t1", &[ClipUpdate::Length(2.0)]);
        rig.transport.play(0);
        rig.scheduler.launch(clip, None);
        rig.run(0, 4 * BEAT);

        let commands = rig.sink.commands();
        assert!(matches!(commands[0], SinkCommand::Start { start_sample: 0, .. }));
        assert!(matches!(commands[1], SinkCommand::Stop { stop_sample, .. } if stop_sample == 2 * BEAT));
        assert_eq!(commands.len(), 2);
        assert!(!rig.scheduler.is_playing(clip, 2 * BEAT));
    }

    #[test]
    fn test_loop_restarts_each_cycle() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t1", &[ClipUpdate::Loop(true), ClipUpdate::Length(1.0)]);
        rig.transport.play(0);
        rig.scheduler.launch(clip, None);
        rig.run(0, 3 * BEAT);

        let starts: Vec<u64> = rig.sink.starts_for(clip).into_iter().map(|(at, _)| at).collect();
        assert_eq!(starts, vec![0, BEAT, 2 * BEAT, 3 * BEAT]);
        // Every restart stops the previous cycle at the new start
        assert_eq!(rig.sink.stop_count(), 3);
        assert!(rig.scheduler.is_playing(clip, 3 * BEAT));
    }

    #[test]
    fn test_stop_clip_mid_loop() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t1", &[ClipUpdate::Loop(true)]);
        let voices = rig.bus.subscribe_clip(clip);
        rig.transport.play(0);
        rig.scheduler.launch(clip, None);
        rig.run(0, 2 * BEAT);
        assert!(rig.scheduler.is_playing(clip, 2 * BEAT));

        assert!(rig.scheduler.stop_clip(clip, 2 * BEAT));
        assert!(!rig.scheduler.is_playing(clip, 2 * BEAT));
        let starts = rig.sink.start_count();

        rig.run(2 * BEAT, 20 * BEAT);
        assert_eq!(rig.sink.start_count(), starts);

        let events = voices.drain();
        assert!(matches!(events.last(), Some(Event::Voice(VoiceEvent::Stopped { stop_sample, .. })) if *stop_sample == 2 * BEAT));
    }

    #[test]
    fn test_loop_turned_off_stops_at_cycle_end() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t1", &[ClipUpdate::Loop(true), ClipUpdate::Length(2.0)]);
        rig.transport.play(0);
        rig.scheduler.launch(clip, None);
        rig.run(0, BEAT);

        rig.timeline.update_clip(clip, &[ClipUpdate::Loop(false)]).unwrap();
        rig.run(BEAT, 6 * BEAT);
        assert_eq!(rig.sink.start_count(), 1);
        assert!(!rig.scheduler.is_playing(clip, 6 * BEAT));
    }

    #[test]
    fn test_hold_sustains_until_release() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t1", &[ClipUpdate::Hold(true), ClipUpdate::Length(1.0)]);
        rig.transport.play(0);
        rig.scheduler.launch(clip, None);
        rig.run(0, 8 * BEAT);
        assert!(rig.scheduler.is_playing(clip, 8 * BEAT));
        assert_eq!(rig.sink.stop_count(), 0);

        assert!(rig.scheduler.release_clip(clip, 8 * BEAT));
        assert!(!rig.scheduler.is_playing(clip, 8 * BEAT));
        assert_eq!(rig.sink.stop_count(), 1);
    }

    #[test]
    fn test_release_ignores_unheld_voice() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t1", &[ClipUpdate::Loop(true)]);
        rig.transport.play(0);
        rig.scheduler.launch(clip, None);
        rig.run(0, 0);
        assert!(!rig.scheduler.release_clip(clip, 100));
        assert!(rig.scheduler.is_playing(clip, 100));
    }

    #[test]
    fn test_retrigger_replaces_voice() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t1", &[ClipUpdate::Hold(true), ClipUpdate::Quantize(false)]);
        rig.transport.play(0);
        rig.scheduler.launch(clip, None);
        rig.run(0, 0);
        rig.scheduler.launch(clip, None);
        rig.run(BEAT, BEAT);

        let commands = rig.sink.commands();
        assert_eq!(commands.len(), 3);
        let SinkCommand::Start { handle: first, .. } = commands[0] else { panic!() };
        assert!(matches!(commands[1], SinkCommand::Start { start_sample, .. } if start_sample == BEAT));
        assert_eq!(commands[2], SinkCommand::Stop { handle: first, stop_sample: BEAT });
        assert_eq!(rig.scheduler.voices(BEAT).len(), 1);
    }

    #[test]
    fn test_missing_sink_skips_track_only() {
        let mut rig = Rig::new();
        let orphan = rig.pattern_clip("t2", &[]);
        let clip = rig.pattern_clip("t1", &[]);
        rig.transport.play(0);
        rig.scheduler.launch(orphan, None);
        rig.scheduler.launch(clip, None);
        rig.run(0, 0);

        assert_eq!(rig.sink.start_count(), 1);
        assert!(rig.scheduler.is_playing(clip, 0));
        assert!(!rig.scheduler.is_playing(orphan, 0));
    }

    #[test]
    fn test_missing_sink_resolves_for_looping_clip() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t2", &[ClipUpdate::Loop(true), ClipUpdate::Length(1.0)]);
        rig.transport.play(0);
        rig.scheduler.launch(clip, None);
        rig.run(0, BEAT / 2);

        let late = Arc::new(LogSink::new("t2"));
        rig.registry.register("t2".into(), late.clone());
        rig.run(BEAT / 2, BEAT);
        assert_eq!(late.starts_for(clip), vec![(BEAT, 0)]);
    }

    #[test]
    fn test_unresolved_content_drops_single_voice() {
        let mut rig = Rig::new();
        let missing = rig.pattern_clip("t1", &[ClipUpdate::Content(Some("missing".into()))]);
        rig.content.insert("kick".into(), ContentData::Audio(SampleBuffer::new(vec![0.0; 64], SR, 1)));
        rig.timeline.create_pattern("p2".into(), "Other");
        let found = rig.timeline.create_clip("t1".into(), "p2".into(), "kick").unwrap().clip.id;
        rig.timeline
            .update_clip(found, &[ClipUpdate::Content(Some("kick".into()))])
            .unwrap();

        rig.transport.play(0);
        rig.scheduler.launch(missing, None);
        rig.scheduler.launch(found, None);
        rig.run(0, 0);

        assert!(rig.sink.starts_for(missing).is_empty());
        assert_eq!(rig.sink.starts_for(found).len(), 1);
    }

    struct RejectingSink;

    impl AudioSink for RejectingSink {
        fn start_voice(&self, _request: &StartVoice) -> Result<VoiceHandle> {
            Err(cadence_core::CadenceError::ResourceUnavailable("no voices left".into()))
        }

        fn stop_voice(&self, _handle: VoiceHandle, _stop_sample: u64) {}
    }

    #[test]
    fn test_rejected_start_is_not_fatal() {
        let mut rig = Rig::new();
        rig.registry.register("t9".into(), Arc::new(RejectingSink));
        let rejected = rig.pattern_clip("t9", &[]);
        let clip = rig.pattern_clip("t1", &[]);
        rig.transport.play(0);
        rig.scheduler.launch(rejected, None);
        rig.scheduler.launch(clip, None);
        rig.run(0, 0);

        assert!(!rig.scheduler.is_playing(rejected, 0));
        assert!(rig.scheduler.is_playing(clip, 0));
    }

    #[test]
    fn test_flush_stops_everything() {
        let mut rig = Rig::new();
        let a = rig.pattern_clip("t1", &[ClipUpdate::Loop(true)]);
        rig.transport.play(0);
        rig.scheduler.launch(a, None);
        rig.run(0, BEAT);

        let affected = rig.scheduler.flush(BEAT);
        assert_eq!(affected, vec![a]);
        assert!(!rig.scheduler.is_playing(a, BEAT));
        assert!(!rig.scheduler.is_queued(a));
        assert!(matches!(rig.sink.commands().last(), Some(SinkCommand::Stop { stop_sample, .. }) if *stop_sample == BEAT));
    }

    #[test]
    fn test_arrangement_clip_scheduled_in_window() {
        let mut rig = Rig::new();
        rig.timeline.set_playback_mode(PlaybackMode::Arrangement);
        let clip = rig.timeline.add_clip_to_arrangement("t1".into(), 2.0, 1.0, None).unwrap();
        rig.transport.play(0);

        rig.run(0, BEAT);
        assert!(rig.sink.starts_for(clip.id).is_empty());

        rig.run(BEAT, 4 * BEAT);
        assert_eq!(rig.sink.starts_for(clip.id), vec![(2 * BEAT, 0)]);
        assert!(rig.sink.commands().contains(&SinkCommand::Stop {
            handle: VoiceHandle(1),
            stop_sample: 3 * BEAT
        }));
    }

    #[test]
    fn test_arrangement_overlap_last_write_wins() {
        let mut rig = Rig::new();
        rig.timeline.set_playback_mode(PlaybackMode::Arrangement);
        let first = rig.timeline.add_clip_to_arrangement("t1".into(), 0.0, 4.0, None).unwrap();
        let second = rig.timeline.add_clip_to_arrangement("t1".into(), 2.0, 4.0, None).unwrap();
        rig.transport.play(0);
        rig.run(0, 3 * BEAT);

        assert!(!rig.scheduler.is_playing(first.id, 3 * BEAT));
        assert!(rig.scheduler.is_playing(second.id, 3 * BEAT));
        // The earlier clip was cut where the newer one starts
        assert!(rig.sink.commands().contains(&SinkCommand::Stop {
            handle: VoiceHandle(1),
            stop_sample: 2 * BEAT
        }));
    }

    #[test]
    fn test_moved_clip_is_rescheduled() {
        let mut rig = Rig::new();
        rig.timeline.set_playback_mode(PlaybackMode::Arrangement);
        let clip = rig.timeline.add_clip_to_arrangement("t1".into(), 0.25, 8.0, None).unwrap();
        rig.transport.play(0);
        rig.run(0, BEAT);
        assert!(rig.scheduler.is_playing(clip.id, BEAT));

        rig.timeline.move_clip(clip.id, 2.0).unwrap();
        rig.scheduler.reschedule_clip(clip.id, &rig.transport, BEAT);
        assert!(!rig.scheduler.is_playing(clip.id, BEAT));

        rig.run(BEAT, 3 * BEAT);
        assert_eq!(rig.sink.starts_for(clip.id), vec![(BEAT / 4, 0), (2 * BEAT, 0)]);
    }

    #[test]
    fn test_resize_moves_planned_stop() {
        let mut rig = Rig::new();
        rig.timeline.set_playback_mode(PlaybackMode::Arrangement);
        let clip = rig.timeline.add_clip_to_arrangement("t1".into(), 0.0, 2.0, None).unwrap();
        rig.transport.play(0);
        rig.run(0, 0);

        let resized = rig.timeline.resize_clip(clip.id, 3.0).unwrap();
        rig.scheduler.clip_resized(clip.id, resized.end(), &rig.transport, 0);
        rig.run(0, 4 * BEAT);
        assert!(rig.sink.commands().contains(&SinkCommand::Stop {
            handle: VoiceHandle(1),
            stop_sample: 3 * BEAT
        }));
        assert_eq!(rig.sink.starts_for(clip.id).len(), 1);
    }

    #[test]
    fn test_tempo_change_moves_planned_commands() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t1", &[ClipUpdate::Loop(true), ClipUpdate::Length(4.0)]);
        rig.transport.play(0);
        rig.scheduler.launch(clip, None);
        rig.run(0, BEAT);

        // Half speed from one beat in: beat 4 now lands 3 slow beats later
        rig.transport.set_tempo(60.0, BEAT).unwrap();
        rig.run(BEAT, BEAT + 7 * BEAT);
        let starts: Vec<u64> = rig.sink.starts_for(clip).into_iter().map(|(at, _)| at).collect();
        assert_eq!(starts, vec![0, BEAT + 6 * BEAT]);
    }

    #[test]
    fn test_metronome_ticks_once_per_beat() {
        let mut rig = Rig::new();
        let ticks = rig.bus.subscribe(Topic::Metronome);
        rig.transport.toggle_metronome();
        rig.transport.play(0);
        rig.run(0, 5 * BEAT);

        let ticks: Vec<MetronomeTick> = ticks
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                Event::Metronome(t) => Some(t),
                _ => None,
            })
            .collect();
        let samples: Vec<u64> = ticks.iter().map(|t| t.at_sample).collect();
        assert_eq!(samples, (0..6).map(|b| b * BEAT).collect::<Vec<_>>());
        assert!(ticks[0].downbeat);
        assert!(ticks[4].downbeat);
        assert_eq!((ticks[5].bar, ticks[5].beat), (1, 1));
    }

    #[test]
    fn test_starts_ordered_within_pass() {
        let mut rig = Rig::new();
        rig.timeline.set_playback_mode(PlaybackMode::Arrangement);
        let late = rig.timeline.add_clip_to_arrangement("t1".into(), 0.3, 1.0, None).unwrap();
        let early = rig.timeline.add_clip_to_arrangement("t1".into(), 0.1, 0.1, None).unwrap();
        rig.transport.play(0);
        rig.scheduler.process(&rig.transport, &rig.timeline, 0);

        let starts: Vec<ClipId> = rig
            .sink
            .commands()
            .iter()
            .filter_map(|c| match c {
                SinkCommand::Start { clip_id, .. } => Some(*clip_id),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![early.id, late.id]);
    }

    #[test]
    fn test_stop_at_bar_keeps_earlier_stop() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t1", &[ClipUpdate::Length(1.0)]);
        rig.transport.play(0);
        rig.scheduler.launch(clip, None);
        rig.run(0, BEAT / 4);

        // Asked to stop at the next bar, but the clip ends on beat 1
        rig.scheduler.stop_clip_at(clip, 4.0);
        rig.run(BEAT / 4, 5 * BEAT);
        let commands = rig.sink.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1], SinkCommand::Stop { handle: VoiceHandle(1), stop_sample: BEAT });
    }

    #[test]
    fn test_stop_at_bar_cancels_loop_cycles() {
        let mut rig = Rig::new();
        let clip = rig.pattern_clip("t1", &[ClipUpdate::Loop(true), ClipUpdate::Length(1.0)]);
        rig.transport.play(0);
        rig.scheduler.launch(clip, None);
        rig.run(0, BEAT / 4);

        rig.scheduler.stop_clip_at(clip, 2.0);
        rig.run(BEAT / 4, 6 * BEAT);
        assert_eq!(rig.sink.starts_for(clip), vec![(0, 0)]);
        assert_eq!(
            rig.sink.commands()[1..],
            [SinkCommand::Stop { handle: VoiceHandle(1), stop_sample: 2 * BEAT }]
        );
        assert!(!rig.scheduler.is_playing(clip, 2 * BEAT));
    }

    #[test]
    fn test_late_pass_dispatches_overdue_at_now() {
        let mut rig = Rig::new();
        let looped = rig.pattern_clip("t1", &[ClipUpdate::Loop(true), ClipUpdate::Length(1.0)]);
        rig.timeline.create_pattern("p2".into(), "Other");
        let shot = rig.timeline.create_clip("t1".into(), "p2".into(), "shot").unwrap().clip.id;
        rig.timeline.update_clip(shot, &[ClipUpdate::Length(1.5)]).unwrap();
        rig.transport.play(0);
        rig.scheduler.launch(looped, None);
        rig.scheduler.launch(shot, None);
        rig.run(0, 0);
        let early = rig.sink.commands().len();
        assert_eq!(early, 2);
        let shot_handle = rig
            .sink
            .commands()
            .iter()
            .find_map(|c| match c {
                SinkCommand::Start { handle, clip_id, .. } if *clip_id == shot => Some(*handle),
                _ => None,
            })
            .unwrap();

        // No pass for over three beats
        let late = 3 * BEAT + BEAT / 4;
        rig.run(late, late);

        let overdue = rig.sink.commands()[early..].to_vec();
        assert!(overdue.iter().all(|c| match c {
            SinkCommand::Start { start_sample, .. } => *start_sample == late,
            SinkCommand::Stop { stop_sample, .. } => *stop_sample == late,
        }));
        assert_eq!(rig.sink.starts_for(looped), vec![(0, 0), (late, 0), (late, 0), (late, 0)]);

        // The one-shot ended on beat 1.5, between the cycles of beats 1 and 2
        let cycle_starts: Vec<usize> = overdue
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, SinkCommand::Start { .. }))
            .map(|(idx, _)| idx)
            .collect();
        let shot_stops: Vec<usize> = overdue
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, SinkCommand::Stop { handle, .. } if *handle == shot_handle))
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(shot_stops.len(), 1);
        assert!(cycle_starts[0] < shot_stops[0] && shot_stops[0] < cycle_starts[1]);
        assert!(!rig.scheduler.is_playing(shot, late));
        assert!(rig.scheduler.is_playing(looped, late));

        // Back on time from the next cycle
        rig.run(late, 4 * BEAT);
        assert_eq!(rig.sink.starts_for(looped).last(), Some(&(4 * BEAT, 0)));
    }

    #[test]
    fn test_shadowed_clip_waits_for_own_start() {
        let mut rig = Rig::new();
        rig.timeline.set_playback_mode(PlaybackMode::Arrangement);
        let older = rig.timeline.add_clip_to_arrangement("t1".into(), 2.0, 4.0, None).unwrap();
        let newer = rig.timeline.add_clip_to_arrangement("t1".into(), 0.0, 4.0, None).unwrap();
        rig.transport.play(0);
        rig.run(0, 5 * BEAT);

        // The model hands beat 5 to the older clip, but it was shadowed at beat 2
        assert_eq!(rig.timeline.clip_at(&"t1".into(), 5.0).map(|c| c.id), Some(older.id));
        assert!(!rig.scheduler.is_playing(older.id, 5 * BEAT));
        assert_eq!(rig.sink.starts_for(newer.id), vec![(0, 0)]);
        assert!(rig.sink.starts_for(older.id).is_empty());
    }
}
