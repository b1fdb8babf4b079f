//! MoFA Dialogue - Turn a two-speaker transcript into a finished podcast track
//!
//! This crate provides:
//! - Markup sanitizing and turn segmentation of `<Person1>`/`<Person2>` transcripts
//! - Speech synthesis through OpenAI, ElevenLabs, Google Cloud TTS or a mock engine
//! - Sequential or overlapping two-track assembly, exported as WAV or MP3
//! - A cancellable pipeline driver with progress reporting

pub mod audio_mixer;
pub mod config;
pub mod error;
pub mod jitter;
pub mod markup;
pub mod pipeline;
pub mod providers;
pub mod transcript_parser;
pub mod tts_batch;

// Re-export commonly used transcript types
pub use markup::{sanitize, MarkupSanitizer};
pub use transcript_parser::{segment, DialogueLine, Role, Turn, TurnSegmenter};

// Re-export TTS types
pub use providers::{create_engine, ElevenlabsTtsEngine, GoogleTtsEngine, OpenaiTtsEngine};
pub use tts_batch::{
    BatchTtsSynthesizer, MockTtsEngine, SynthesizedAudio, SynthesizedClip, TtsEngine, TtsProgress,
    VoiceVariation,
};

// Re-export audio mixer types
pub use audio_mixer::{
    AssembledTrack, AssemblyMode, AssemblyWarning, AudioMixer, ExportFormat, ExportSettings,
    Mp3Bitrate, OverlayAssembler, PcmAudio,
};

pub use config::{AssemblySelection, Config, ProviderKind};
pub use error::{AssemblyError, ConfigError, ParseError, PipelineError, SynthesisError};
pub use jitter::{Band, Jitter};
pub use pipeline::{
    DialoguePipeline, PipelineProgress, PipelineReport, PipelineSettings, PipelineState, Stage,
};
