//! cadence-services: Playback engine, scheduler, and service layer

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod bus;
pub mod clock;
pub mod config;
pub mod content;
pub mod engine;
pub mod scheduler;
pub mod sink;

pub use bus::{NotificationBus, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{config_path, load_config, save_config, ConfigError, EngineConfig};
pub use content::{ContentData, ContentError, ContentStore, MemoryContentStore, MidiNote, SampleBuffer, WavContentStore};
pub use engine::{EngineError, EngineState, PlaybackEngine};
pub use scheduler::{ClipScheduler, VoiceEntry};
pub use sink::{AudioSink, LogSink, SinkCommand, SinkRegistry, StartVoice, TrackRegistry, VoiceHandle};

/// Lock a mutex, recovering the guard if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
