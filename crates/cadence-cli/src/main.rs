//! cadence: headless playback runner
//!
//! Usage: `cadence [SECONDS] [WAV...]`

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use cadence_core::{ClipUpdate, ContentRef, Event, Topic, TrackId, VoiceEvent};
use cadence_services::{
    load_config, ContentData, ContentStore, LogSink, MemoryContentStore, MidiNote, PlaybackEngine, SinkRegistry,
    SystemClock, WavContentStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_SECONDS: f64 = 4.0;

struct Args {
    seconds: f64,
    wavs: Vec<PathBuf>,
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let (seconds, rest) = match args.split_first() {
        Some((first, rest)) => match first.parse::<f64>() {
            Ok(seconds) => (seconds, rest),
            Err(_) => (DEFAULT_SECONDS, args),
        },
        None => (DEFAULT_SECONDS, args),
    };
    if !seconds.is_finite() || seconds <= 0.0 {
        bail!("SECONDS must be positive, got {seconds}");
    }
    Ok(Args {
        seconds,
        wavs: rest.iter().map(PathBuf::from).collect(),
    })
}

/// One track of the demo session
struct TrackSetup {
    track_id: TrackId,
    name: String,
    content: ContentRef,
    length_beats: f64,
}

/// A one-bar four-on-the-floor click
fn click_pattern() -> ContentData {
    let ppq = 480;
    let notes = (0..4)
        .map(|beat| MidiNote::new(if beat == 0 { 76 } else { 77 }, 100, beat * ppq as u64, 60))
        .collect();
    ContentData::Midi { notes, ppq }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("cadence=debug".parse()?))
        .init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&raw)?;
    let config = load_config();
    tracing::info!(?config, "Starting cadence");

    let beats_per_second = config.tempo / 60.0;
    let mut setups = Vec::new();
    let content: Arc<dyn ContentStore> = if args.wavs.is_empty() {
        let store = MemoryContentStore::new();
        store.insert("click".into(), click_pattern());
        setups.push(TrackSetup {
            track_id: "t1".into(),
            name: "Click".into(),
            content: "click".into(),
            length_beats: config.beats_per_bar as f64,
        });
        Arc::new(store)
    } else {
        let store = WavContentStore::new(".");
        for (idx, path) in args.wavs.iter().enumerate() {
            let content = ContentRef::from(path.to_string_lossy().into_owned());
            let data = store
                .resolve(&content)
                .with_context(|| format!("loading {}", path.display()))?;
            let length_beats = match &*data {
                ContentData::Audio(buffer) => buffer.duration_secs() * beats_per_second,
                ContentData::Midi { .. } => config.beats_per_bar as f64,
            };
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("Track {}", idx + 1));
            setups.push(TrackSetup {
                track_id: format!("t{}", idx + 1).into(),
                name,
                content,
                length_beats,
            });
        }
        Arc::new(store)
    };

    let registry = Arc::new(SinkRegistry::new());
    let mut sinks = Vec::new();
    for setup in &setups {
        let sink = Arc::new(LogSink::with_history(setup.name.clone(), 0));
        registry.register(setup.track_id.clone(), sink.clone());
        sinks.push(sink);
    }

    let clock = Arc::new(SystemClock::new(config.sample_rate()));
    let mut engine = PlaybackEngine::new(config, clock, registry, content);
    engine.create_pattern("p1", "Main");
    for setup in &setups {
        let clip = engine.create_clip(setup.track_id.clone(), "p1", setup.name.clone())?;
        engine.update_clip(
            clip.id,
            &[
                ClipUpdate::Content(Some(setup.content.clone())),
                ClipUpdate::Loop(true),
                ClipUpdate::Length(setup.length_beats),
            ],
        )?;
    }

    let voices = engine.subscribe(Topic::Voices);
    engine.start()?;
    engine.play();
    thread::sleep(Duration::from_secs_f64(args.seconds));
    let state = engine.stop();
    engine.stop_worker()?;

    let (started, stopped) = voices
        .try_iter()
        .fold((0, 0), |(started, stopped), event| match event {
            Event::Voice(VoiceEvent::Started { .. }) => (started + 1, stopped),
            Event::Voice(VoiceEvent::Stopped { .. }) => (started, stopped + 1),
            _ => (started, stopped),
        });

    println!("Played {:.1}s at {} BPM ({:?})", args.seconds, state.tempo, state.state);
    for (setup, sink) in setups.iter().zip(&sinks) {
        println!(
            "  {:<12} {:>3} starts {:>3} stops",
            setup.name,
            sink.start_count(),
            sink.stop_count()
        );
    }
    println!("  voice events: {started} started, {stopped} stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_seconds_and_files() {
        let parsed = parse_args(&args(&["2.5", "kick.wav", "snare.wav"])).unwrap();
        assert_eq!(parsed.seconds, 2.5);
        assert_eq!(parsed.wavs.len(), 2);
    }

    #[test]
    fn test_parse_files_only() {
        let parsed = parse_args(&args(&["kick.wav"])).unwrap();
        assert_eq!(parsed.seconds, DEFAULT_SECONDS);
        assert_eq!(parsed.wavs, vec![PathBuf::from("kick.wav")]);
    }

    #[test]
    fn test_parse_rejects_non_positive_duration() {
        assert!(parse_args(&args(&["0"])).is_err());
        assert!(parse_args(&args(&[])).is_ok());
    }

    #[test]
    fn test_click_pattern_is_one_bar() {
        let ContentData::Midi { notes, ppq } = click_pattern() else {
            panic!("expected midi");
        };
        assert_eq!(notes.len(), 4);
        assert_eq!(notes[3].start_tick, 3 * ppq as u64);
    }
}
