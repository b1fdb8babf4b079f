//! Error taxonomy for the dialogue pipeline
//!
//! Every stage has its own error type; [`PipelineError`] wraps them and
//! remembers the stage (and turn, where one applies) at which a run failed.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::Stage;
use crate::transcript_parser::Role;

/// Startup errors: bad config file, unknown provider, missing credentials
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] Box<figment::Error>),

    #[error("unknown provider '{0}' (expected openai, elevenlabs, google or mock)")]
    UnknownProvider(String),

    #[error("provider '{0}' is selected but has no configuration section")]
    MissingSection(&'static str),

    #[error("no API key configured for provider '{0}'")]
    MissingCredential(&'static str),

    #[error("invalid {name} band: min {min} is greater than max {max}")]
    InvalidBand { name: &'static str, min: f64, max: f64 },

    #[error("overlap band must not be negative (min {0})")]
    NegativeOverlap(f64),

    #[error("overlap band max {0}s exceeds the 10s limit")]
    OverlapTooLong(f64),
}

/// Transcript errors, raised before any synthesis call is made
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("transcript contains no <Person1>/<Person2> dialogue turns")]
    NoTurns,
}

/// Decoding and encoding failures for PCM audio
#[derive(Debug, Error)]
pub enum AudioError {
    #[error(transparent)]
    Wav(#[from] hound::Error),

    #[error("unsupported sample format: {bits}-bit {format}")]
    UnsupportedFormat { bits: u16, format: &'static str },

    #[error("audio contains no samples")]
    Empty,
}

/// A single remote synthesis call failed
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("{provider} request failed: {source}")]
    Request {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} returned an unexpected response: {message}")]
    Response { provider: String, message: String },

    #[error("{provider} returned empty audio")]
    EmptyAudio { provider: String },

    #[error("{provider} returned undecodable audio: {source}")]
    InvalidAudio {
        provider: String,
        #[source]
        source: AudioError,
    },

    #[error("synthesis timed out after {0:?}")]
    Timeout(Duration),

    #[error("TTS engine error: {0}")]
    Engine(String),
}

/// Failures while combining clips into the final track or writing it out
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("no clips to assemble")]
    NoClips,

    #[error("clip for turn {turn} ({role}) could not be decoded: {source}")]
    InvalidClip {
        turn: usize,
        role: Role,
        #[source]
        source: AudioError,
    },

    #[error("clip for turn {turn} ({role}) has format {found}, expected {expected}")]
    FormatMismatch {
        turn: usize,
        role: Role,
        expected: String,
        found: String,
    },

    #[error("overlap leaves negative silence ({requested_secs:.3}s) at turn {turn} ({role})")]
    NegativeSilence {
        turn: usize,
        role: Role,
        requested_secs: f64,
    },

    #[error("failed to encode output audio: {0}")]
    Encode(#[source] AudioError),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to export {}: {message}", path.display())]
    Export { path: PathBuf, message: String },
}

impl AssemblyError {
    /// Turn at which assembly failed, if the failure is tied to one clip
    pub fn turn(&self) -> Option<usize> {
        match self {
            AssemblyError::InvalidClip { turn, .. }
            | AssemblyError::FormatMismatch { turn, .. }
            | AssemblyError::NegativeSilence { turn, .. } => Some(*turn),
            _ => None,
        }
    }
}

/// Top-level error of a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("synthesis failed at turn {turn} ({role}): {source}")]
    Synthesis {
        turn: usize,
        role: Role,
        #[source]
        source: SynthesisError,
    },

    #[error("assembly failed: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("run cancelled during {0}")]
    Cancelled(Stage),
}

impl PipelineError {
    /// Stage the run was in when it failed
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Config(_) => Stage::Idle,
            PipelineError::Parse(_) => Stage::Segmenting,
            PipelineError::Synthesis { .. } => Stage::Synthesizing,
            PipelineError::Assembly(_) => Stage::Assembling,
            PipelineError::Cancelled(stage) => *stage,
        }
    }

    /// 1-based turn index the failure is attributed to, if any
    pub fn turn(&self) -> Option<usize> {
        match self {
            PipelineError::Synthesis { turn, .. } => Some(*turn),
            PipelineError::Assembly(e) => e.turn(),
            _ => None,
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Invalid(Box::new(e))
    }
}
