//! OPL3 (YMF262) Instrument Preview Core
//!
//! The real-time synthesis core of an FM instrument bank editor. An edited
//! [`Instrument`] is compiled into chip register writes, test notes and chords
//! are scheduled onto chip channels, and a background generation task keeps a
//! bounded buffer of stereo PCM frames topped up for the audio device.
//!
//! # Features
//! - Two interchangeable chip backends behind [`OplBackend`]:
//!   a bit-exact integer model at the native 49716 Hz rate and a fast
//!   floating-point approximation that runs at any PCM rate
//! - 2-op, true 4-op and pseudo-4-op (double voice) patch compilation
//! - Single notes, six chord shapes and fixed-pitch percussion preview
//! - Linear sample-rate conversion for native-rate backends
//! - Offline rendering (WAV export) and streaming playback
//!
//! # Crate feature flags
//! - `streaming` (opt-in): Real-time audio output (enables optional `rodio` dep)
//!
//! # Quick start
//! ## Offline rendering
//! ```no_run
//! use opl3_preview::{BackendKind, Instrument, PreviewCommand, PreviewConfig, PreviewSynth};
//! let mut synth = PreviewSynth::new(&PreviewConfig::default()).unwrap();
//! synth.apply(PreviewCommand::SetInstrument(Instrument::new("Organ"))).unwrap();
//! synth.apply(PreviewCommand::NoteOn(opl3_preview::NoteRequest::Note(60))).unwrap();
//! let mut frames = vec![[0i16; 2]; 44_100];
//! synth.render(&mut frames);
//! # let _ = BackendKind::Accurate;
//! ```
//!
//! ## Background generation
//! ```no_run
//! use opl3_preview::{Instrument, NoteRequest, PreviewConfig, PreviewEngine};
//! let engine = PreviewEngine::start(PreviewConfig::default()).unwrap();
//! engine.set_instrument(Instrument::new("Bass"));
//! engine.note_on(NoteRequest::Note(48));
//! // a device (or any consumer) reads frames from engine.buffer()
//! engine.stop();
//! ```

#![warn(missing_docs)]

pub mod backend; // Chip Backend Interface
pub mod config; // Preview configuration
pub mod instrument; // Instrument data model
pub mod opl3; // Register Model + accurate chip
pub mod patch; // Patch Compiler
pub mod preview; // Synchronous preview core
pub mod scheduler; // Voice/Note Scheduler
pub mod softsynth; // Fast approximating backend
pub mod streaming; // Generation pipeline

/// Error types for preview core operations
#[derive(thiserror::Error, Debug)]
pub enum Opl3Error {
    /// A chip backend could not be initialized
    #[error("Backend '{backend}' failed to initialize: {reason}")]
    BackendInit {
        /// Backend that failed
        backend: String,
        /// Cause of the failure
        reason: String,
    },

    /// Audio device error
    #[error("Audio device error: {0}")]
    AudioDeviceError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// IO error from filesystem or device
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON document
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for Opl3Error {
    /// Converts a String into `Opl3Error::Other`.
    ///
    /// Prefer the specific variants (`ConfigError`, `AudioDeviceError`,
    /// `BackendInit`) where the failure category is known.
    fn from(msg: String) -> Self {
        Opl3Error::Other(msg)
    }
}

impl From<&str> for Opl3Error {
    fn from(msg: &str) -> Self {
        Opl3Error::Other(msg.to_string())
    }
}

/// Result type for preview core operations
pub type Result<T> = std::result::Result<T, Opl3Error>;

// Public API exports
pub use backend::{BackendKind, ChipType, OplBackend};
pub use config::PreviewConfig;
pub use instrument::{Connection, Instrument, Operator, OperatorSlot};
pub use opl3::registers::{ChipMode, RegisterWrite};
pub use opl3::Opl3;
pub use patch::{PatchCompiler, VoiceSlot};
pub use preview::{PreviewCommand, PreviewSynth};
pub use scheduler::{ChordShape, NoteRequest, NoteScheduler, VoiceState};
pub use softsynth::SoftOpl;
#[cfg(feature = "streaming")]
pub use streaming::AudioDevice;
pub use streaming::{
    DeviceStatus, LinearResampler, PlaybackStats, PreviewEngine, RingBuffer, StreamConfig,
};
