//! segno follows a musical performance through its score in real time.
//!
//! Given a score (a MIDI file) and a performance (an audio stream), the
//! library continuously estimates which position in the score the performer
//! is currently playing, and reports it either as a stream of score
//! timestamps or as MIREX-format alignment lines.
//!
//! The pipeline has four stages running on their own threads, connected by
//! bounded channels: a slicer cutting the performance into overlapping
//! frames, a feature extractor turning each frame into a semitone
//! spectrum, an online-time-warping follower ([Oltw](dtw::oltw::Oltw))
//! aligning the performance features against the precomputed score
//! features, and a [backend] turning alignment pairs into output lines.
//!
//! Most users should build a [Config], [sanitize](Config::sanitize) it and
//! hand it to [runner::run]; the individual stages are exported for anyone
//! who wants to assemble their own pipeline.
pub mod backend;
pub mod config;
mod cqt;
mod decoder;
pub mod dtw;
mod preprocessor;
pub mod runner;
pub mod score;
mod utils;

use thiserror::Error;

pub use config::Config;
pub use score::NoteInfo;

/// Sample rate (Hz) used to synthesise the score and decode the
/// performance when the configuration does not override it.
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// One time step of spectral content: a vector with one value per
/// semitone between the configured frequency bounds, L1-normalised.
pub type ExtractedFeature = ndarray::Array1<f64>;

#[derive(Error, Debug, PartialEq)]
/// Umbrella error type for everything that can go wrong while following.
pub enum SegnoError {
    /// An option failed validation, or a configured file does not exist.
    #[error("Invalid configuration – {0}")]
    ConfigError(String),
    /// The performance or synthesised score audio could not be decoded.
    #[error("Error happened while decoding audio – {0}")]
    DecodingError(String),
    /// The score MIDI file could not be read or makes no sense.
    #[error("Error happened while reading the score MIDI – {0}")]
    MidiError(String),
    /// Feature extraction failed.
    #[error("Error happened while extracting features – {0}")]
    AnalysisError(String),
    /// The follower hit an impossible state.
    #[error("Error happened while following the performance – {0}")]
    FollowerError(String),
    /// The backend could not start or lost its input.
    #[error("Error happened while emitting results – {0}")]
    BackendError(String),
    /// An output sink could not be opened.
    #[error("Error happened with the output sink – {0}")]
    SinkError(String),
}

/// segno's [Result] alias.
pub type SegnoResult<T> = Result<T, SegnoError>;
