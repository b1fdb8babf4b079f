//! Pipeline Driver - transcript in, finished audio file out
//!
//! Runs sanitize → segment → synthesize → assemble → write for one transcript.
//! Synthesized clips are kept in a scratch directory that is removed when the
//! run ends, whether it succeeded or not.

use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::audio_mixer::{
    concatenate, AssembledTrack, AssemblyMode, AssemblyWarning, AudioMixer, ExportSettings,
    OverlayAssembler,
};
use crate::config::{AssemblySelection, Config, JitterConfig, ProviderKind};
use crate::error::{AssemblyError, ConfigError, ParseError, PipelineError};
use crate::jitter::{Band, Jitter};
use crate::markup::{MarkupSanitizer, DEFAULT_PRESERVED_TAGS};
use crate::providers::create_engine;
use crate::transcript_parser::{dialogue_lines, DialogueLine, TurnSegmenter};
use crate::tts_batch::{
    BatchTtsSynthesizer, ProgressCallback, SynthesizedClip, TtsEngine, TtsProgress,
};

// ============================================================================
// STATE
// ============================================================================

/// Processing stage, used to attribute failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Sanitizing,
    Segmenting,
    Synthesizing,
    Assembling,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Sanitizing => "sanitizing",
            Stage::Segmenting => "segmenting",
            Stage::Synthesizing => "synthesizing",
            Stage::Assembling => "assembling",
        };
        f.write_str(name)
    }
}

/// Observable state of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Sanitizing,
    Segmenting,
    /// `turn` is the 1-based index of the most recently synthesized turn
    Synthesizing { turn: usize, total: usize },
    Assembling,
    Done,
    Failed { stage: Stage },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed { .. })
    }
}

/// Event passed to the progress callback
#[derive(Debug, Clone)]
pub enum PipelineProgress {
    StateChanged(PipelineState),
    ClipSynthesized(TtsProgress),
}

pub type PipelineProgressCallback = Arc<dyn Fn(PipelineProgress) + Send + Sync>;

// ============================================================================
// SETTINGS & REPORT
// ============================================================================

/// Everything a run needs besides the engine
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub ending_message: String,
    pub preserved_tags: Vec<String>,
    pub assembly: AssemblySelection,
    pub max_concurrent_requests: usize,
    pub request_timeout: Duration,
    pub strict_overlap: bool,
    pub overlap: Band,
    /// Parent of the per-run scratch directory
    pub temp_audio_dir: PathBuf,
    pub export: ExportSettings,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ending_message: config.ending_message.clone(),
            preserved_tags: config.preserved_tags.clone(),
            assembly: config.assembly,
            max_concurrent_requests: config.max_concurrent_requests,
            request_timeout: config.request_timeout(),
            strict_overlap: config.strict_overlap,
            overlap: config.jitter.overlap,
            temp_audio_dir: config.temp_audio_dir.clone(),
            export: config.export_settings(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            ending_message: "Bye Bye!".to_string(),
            preserved_tags: DEFAULT_PRESERVED_TAGS.iter().map(|t| t.to_string()).collect(),
            assembly: AssemblySelection::Auto,
            max_concurrent_requests: 4,
            request_timeout: Duration::from_secs(60),
            strict_overlap: false,
            overlap: JitterConfig::default().overlap,
            temp_audio_dir: std::env::temp_dir(),
            export: ExportSettings::default(),
        }
    }
}

/// Summary of a successful run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Primary file first, then per-speaker tracks in overlay mode
    pub output_files: Vec<PathBuf>,
    pub mode: AssemblyMode,
    pub total_duration_secs: f64,
    pub turn_count: usize,
    pub clip_count: usize,
    pub warnings: Vec<AssemblyWarning>,
    pub duration_ms: u64,
}

// ============================================================================
// DIALOGUE PIPELINE
// ============================================================================

pub struct DialoguePipeline {
    engine: Arc<dyn TtsEngine>,
    settings: PipelineSettings,
    jitter: Arc<Jitter>,
    state: Arc<Mutex<PipelineState>>,
    progress: Option<PipelineProgressCallback>,
}

impl DialoguePipeline {
    pub fn new(engine: Arc<dyn TtsEngine>, settings: PipelineSettings, jitter: Arc<Jitter>) -> Self {
        Self {
            engine,
            settings,
            jitter,
            state: Arc::new(Mutex::new(PipelineState::Idle)),
            progress: None,
        }
    }

    /// Build the engine and settings from configuration
    ///
    /// `provider` overrides the configured provider.
    pub fn from_config(config: &Config, provider: Option<ProviderKind>) -> Result<Self, ConfigError> {
        let kind = match provider {
            Some(kind) => kind,
            None => config.provider_kind()?,
        };
        let jitter = Arc::new(Jitter::new(config.seed));
        let engine = create_engine(config, kind, Arc::clone(&jitter))?;
        Ok(Self::new(engine, PipelineSettings::from_config(config), jitter))
    }

    pub fn with_progress(mut self, callback: PipelineProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn state(&self) -> PipelineState {
        self.state.lock().clone()
    }

    /// Assembly mode this pipeline will use
    pub fn assembly_mode(&self) -> AssemblyMode {
        self.settings.assembly.resolve(self.engine.preferred_assembly())
    }

    pub async fn run(&self, transcript: &str, output: &Path) -> Result<PipelineReport, PipelineError> {
        self.run_with_cancellation(transcript, output, &CancellationToken::new())
            .await
    }

    /// Run the whole pipeline; a cancelled run writes no output
    pub async fn run_with_cancellation(
        &self,
        transcript: &str,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        let result = self.execute(transcript, output, cancel, started).await;

        match &result {
            Ok(report) => {
                self.set_state(PipelineState::Done);
                log::info!(
                    "Finished {:.1}s of audio in {} ms",
                    report.total_duration_secs,
                    report.duration_ms
                );
            }
            Err(e) => {
                self.set_state(PipelineState::Failed { stage: e.stage() });
                log::error!("Pipeline failed during {}: {}", e.stage(), e);
            }
        }
        result
    }

    async fn execute(
        &self,
        transcript: &str,
        output: &Path,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<PipelineReport, PipelineError> {
        self.set_state(PipelineState::Sanitizing);
        let sanitized = MarkupSanitizer::new(&self.settings.preserved_tags).sanitize(transcript);

        self.set_state(PipelineState::Segmenting);
        let turns = TurnSegmenter::new().segment(&sanitized, &self.settings.ending_message);
        if turns.is_empty() {
            return Err(ParseError::NoTurns.into());
        }
        let lines = dialogue_lines(&turns);
        let mode = self.assembly_mode();
        log::info!(
            "Segmented {} turns ({} lines), assembling as {}",
            turns.len(),
            lines.len(),
            mode
        );

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(Stage::Segmenting));
        }

        let scratch = self.scratch_dir().await?;
        self.set_state(PipelineState::Synthesizing {
            turn: 0,
            total: turns.len(),
        });

        let synthesizer = BatchTtsSynthesizer::new(
            Arc::clone(&self.engine),
            self.settings.max_concurrent_requests,
            self.settings.request_timeout,
        );

        let track = match mode {
            AssemblyMode::Sequential => {
                let callback = self.clip_callback(turns.len());
                let clips = synthesizer
                    .synthesize_all(lines, cancel, Some(&callback))
                    .await?;
                for clip in &clips {
                    write_scratch_clip(scratch.path(), clip).await?;
                }
                Self::check_cancelled(cancel)?;
                self.set_state(PipelineState::Assembling);
                concatenate(clips)?
            }
            AssemblyMode::Overlay => {
                let assembler = self
                    .synthesize_overlay(&synthesizer, lines, turns.len(), scratch.path(), cancel)
                    .await?;
                Self::check_cancelled(cancel)?;
                self.set_state(PipelineState::Assembling);
                assembler.finish()?
            }
        };

        let report_base = (track.duration_secs(), track.clip_count, track.warnings.clone());
        let output_files = self.export(track, output).await?;

        // Scratch clips are no longer needed
        drop(scratch);

        let (total_duration_secs, clip_count, warnings) = report_base;
        Ok(PipelineReport {
            output_files,
            mode,
            total_duration_secs,
            turn_count: turns.len(),
            clip_count,
            warnings,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Synthesize strictly in order, pushing each clip to the overlay tracks
    async fn synthesize_overlay(
        &self,
        synthesizer: &BatchTtsSynthesizer,
        lines: Vec<DialogueLine>,
        total_turns: usize,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> Result<OverlayAssembler, PipelineError> {
        let mut assembler = OverlayAssembler::new(self.settings.strict_overlap);
        let total_lines = lines.len();

        for (i, line) in lines.into_iter().enumerate() {
            let clip = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled(Stage::Synthesizing)),
                clip = synthesizer.synthesize_line(&line) => clip?,
            };
            write_scratch_clip(scratch, &clip).await?;

            let overlap = self.jitter.sample(self.settings.overlap);
            let step = assembler.push(&clip, overlap)?;
            log::debug!(
                "turn {} ({}): clip {:.2}s, overlap {:.2}s, silence {:.2}s",
                step.turn,
                step.role,
                step.clip_secs,
                step.overlap_secs,
                step.silence_secs
            );

            *self.state.lock() = PipelineState::Synthesizing {
                turn: line.turn,
                total: total_turns,
            };
            self.emit(PipelineProgress::ClipSynthesized(TtsProgress {
                completed: i + 1,
                total: total_lines,
                turn: line.turn,
                role: line.role,
                text_preview: crate::tts_batch::truncate_text(&line.text, 50),
                percentage: (i + 1) as f64 / total_lines as f64 * 100.0,
            }));
        }

        Ok(assembler)
    }

    /// Write the track on a blocking thread
    async fn export(&self, track: AssembledTrack, output: &Path) -> Result<Vec<PathBuf>, PipelineError> {
        let mixer = AudioMixer::new(self.settings.export.clone());
        let path = output.to_path_buf();

        let files = tokio::task::spawn_blocking(move || mixer.export(&track, &path))
            .await
            .map_err(|e| AssemblyError::Export {
                path: output.to_path_buf(),
                message: e.to_string(),
            })??;

        for file in &files {
            log::info!("Saved {}", file.display());
        }
        Ok(files)
    }

    async fn scratch_dir(&self) -> Result<tempfile::TempDir, PipelineError> {
        let parent = &self.settings.temp_audio_dir;
        let write_err = |source| AssemblyError::Write {
            path: parent.clone(),
            source,
        };

        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        let dir = tempfile::Builder::new()
            .prefix("mofa-dialogue-")
            .tempdir_in(parent)
            .map_err(write_err)?;
        log::debug!("Scratch directory: {}", dir.path().display());
        Ok(dir)
    }

    fn clip_callback(&self, total_turns: usize) -> ProgressCallback {
        let state = Arc::clone(&self.state);
        let progress = self.progress.clone();
        Arc::new(move |update: TtsProgress| {
            *state.lock() = PipelineState::Synthesizing {
                turn: update.turn,
                total: total_turns,
            };
            if let Some(progress) = &progress {
                progress(PipelineProgress::ClipSynthesized(update));
            }
        })
    }

    fn check_cancelled(cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(Stage::Synthesizing));
        }
        Ok(())
    }

    fn set_state(&self, state: PipelineState) {
        log::debug!("Pipeline state: {:?}", state);
        *self.state.lock() = state.clone();
        self.emit(PipelineProgress::StateChanged(state));
    }

    fn emit(&self, event: PipelineProgress) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }
}

async fn write_scratch_clip(dir: &Path, clip: &SynthesizedClip) -> Result<(), PipelineError> {
    let path = dir.join(clip.file_name());
    tokio::fs::write(&path, &clip.bytes)
        .await
        .map_err(|source| AssemblyError::Write { path, source })?;
    Ok(())
}
