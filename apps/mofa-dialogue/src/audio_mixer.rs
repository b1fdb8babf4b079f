//! Audio Mixing and Export - Combine synthesized clips into the final track
//!
//! This module provides:
//! - PCM decoding/encoding of WAV clips
//! - Sequential assembly (clips end-to-end in turn order)
//! - Overlay assembly (one track per speaker, timed silence, mixdown)
//! - Export as WAV or MP3, written atomically

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use crate::error::{AssemblyError, AudioError};
use crate::transcript_parser::Role;
use crate::tts_batch::SynthesizedClip;

// ============================================================================
// DATA MODELS
// ============================================================================

/// How clips are combined into the output track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyMode {
    /// Clips end-to-end, no gap
    Sequential,
    /// Two speaker tracks with simulated conversational overlap, mixed down
    Overlay,
}

impl fmt::Display for AssemblyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyMode::Sequential => f.write_str("sequential"),
            AssemblyMode::Overlay => f.write_str("overlay"),
        }
    }
}

/// Export format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// WAV format (uncompressed)
    #[default]
    Wav,
    /// MP3 format (compressed, requires ffmpeg)
    Mp3,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Wav => "wav",
            ExportFormat::Mp3 => "mp3",
        }
    }
}

/// MP3 bitrate options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mp3Bitrate {
    #[serde(rename = "128k")]
    Kbps128,
    #[default]
    #[serde(rename = "192k")]
    Kbps192,
    #[serde(rename = "256k")]
    Kbps256,
    #[serde(rename = "320k")]
    Kbps320,
}

impl Mp3Bitrate {
    /// Get bitrate value in kbps
    pub fn kbps(&self) -> u32 {
        match self {
            Mp3Bitrate::Kbps128 => 128,
            Mp3Bitrate::Kbps192 => 192,
            Mp3Bitrate::Kbps256 => 256,
            Mp3Bitrate::Kbps320 => 320,
        }
    }
}

/// ID3 tags written into MP3 exports
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub comment: Option<String>,
}

/// Output settings
#[derive(Debug, Clone, Default)]
pub struct ExportSettings {
    pub format: ExportFormat,
    pub mp3_bitrate: Mp3Bitrate,
    pub metadata: AudioMetadata,
}

// ============================================================================
// PCM AUDIO
// ============================================================================

/// Sample layout shared by every clip of a run (16-bit signed PCM)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSpec {
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// Frame count closest to `secs`
    pub fn frames_for(&self, secs: f64) -> usize {
        (secs * self.sample_rate as f64).round().max(0.0) as usize
    }

    pub fn secs_for(&self, frames: usize) -> f64 {
        frames as f64 / self.sample_rate as f64
    }

    fn wav_spec(&self) -> hound::WavSpec {
        hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        }
    }
}

impl fmt::Display for AudioSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz / {} ch", self.sample_rate, self.channels)
    }
}

/// Decoded interleaved 16-bit audio
#[derive(Debug, Clone, PartialEq)]
pub struct PcmAudio {
    spec: AudioSpec,
    samples: Vec<i16>,
}

impl PcmAudio {
    pub fn new(spec: AudioSpec, samples: Vec<i16>) -> Self {
        Self { spec, samples }
    }

    pub fn silence(spec: AudioSpec, frames: usize) -> Self {
        Self::new(spec, vec![0; frames * spec.channels as usize])
    }

    /// Wrap raw little-endian 16-bit PCM (as returned by `pcm` provider formats)
    pub fn from_pcm16_le(bytes: &[u8], spec: AudioSpec) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        Self::new(spec, samples)
    }

    /// Decode a WAV byte buffer (16-bit integer or 32-bit float)
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self, AudioError> {
        let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
        let wav = reader.spec();
        let spec = AudioSpec {
            sample_rate: wav.sample_rate,
            channels: wav.channels,
        };

        let samples = match (wav.sample_format, wav.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => {
                reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?
            }
            (hound::SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
                .collect::<Result<Vec<_>, _>>()?,
            (format, bits) => {
                return Err(AudioError::UnsupportedFormat {
                    bits,
                    format: match format {
                        hound::SampleFormat::Int => "int",
                        hound::SampleFormat::Float => "float",
                    },
                })
            }
        };

        Ok(Self::new(spec, samples))
    }

    /// Encode as a 16-bit PCM WAV byte buffer
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, AudioError> {
        let mut cursor = Cursor::new(Vec::with_capacity(44 + self.samples.len() * 2));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, self.spec.wav_spec())?;
            for &sample in &self.samples {
                writer.write_sample(sample)?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }

    pub fn spec(&self) -> AudioSpec {
        self.spec
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.spec.channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.spec.secs_for(self.frames())
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample-for-sample additive mix; the result is as long as the longer input
    pub fn overlay(&self, other: &PcmAudio) -> PcmAudio {
        let (long, short) = if self.samples.len() >= other.samples.len() {
            (&self.samples, &other.samples)
        } else {
            (&other.samples, &self.samples)
        };

        let mut mixed = long.clone();
        for (out, &s) in mixed.iter_mut().zip(short.iter()) {
            *out = out.saturating_add(s);
        }

        PcmAudio::new(self.spec, mixed)
    }
}

// ============================================================================
// ASSEMBLY RESULTS
// ============================================================================

/// Non-fatal issues found while assembling
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyWarning {
    /// Overlap would have required negative silence; zero was used instead
    ClampedSilence {
        turn: usize,
        role: Role,
        requested_secs: f64,
    },
}

impl fmt::Display for AssemblyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyWarning::ClampedSilence {
                turn,
                role,
                requested_secs,
            } => write!(
                f,
                "turn {} ({}): overlap requires {:.3}s of silence, clamped to 0",
                turn, role, requested_secs
            ),
        }
    }
}

/// Timing record of one overlay step
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStep {
    pub turn: usize,
    pub role: Role,
    pub clip_secs: f64,
    pub overlap_secs: f64,
    /// Silence appended to the other speaker's track
    pub silence_secs: f64,
    /// Track lengths after the step
    pub person1_secs: f64,
    pub person2_secs: f64,
}

/// Per-speaker tracks of an overlay assembly
#[derive(Debug, Clone, PartialEq)]
pub struct RoleTracks {
    pub person1: PcmAudio,
    pub person2: PcmAudio,
}

impl RoleTracks {
    pub fn get(&self, role: Role) -> &PcmAudio {
        match role {
            Role::Person1 => &self.person1,
            Role::Person2 => &self.person2,
        }
    }
}

/// Final output of the assembler
#[derive(Debug, Clone)]
pub struct AssembledTrack {
    pub mode: AssemblyMode,
    pub mixed: PcmAudio,
    /// Only present in overlay mode
    pub role_tracks: Option<RoleTracks>,
    pub steps: Vec<OverlayStep>,
    pub warnings: Vec<AssemblyWarning>,
    pub clip_count: usize,
}

impl AssembledTrack {
    pub fn duration_secs(&self) -> f64 {
        self.mixed.duration_secs()
    }
}

fn decode_clip(clip: &SynthesizedClip) -> Result<PcmAudio, AssemblyError> {
    PcmAudio::from_wav_bytes(&clip.bytes).map_err(|source| AssemblyError::InvalidClip {
        turn: clip.turn,
        role: clip.role,
        source,
    })
}

fn check_spec(
    expected: &mut Option<AudioSpec>,
    clip: &SynthesizedClip,
    found: AudioSpec,
) -> Result<AudioSpec, AssemblyError> {
    match *expected {
        None => {
            *expected = Some(found);
            Ok(found)
        }
        Some(spec) if spec == found => Ok(spec),
        Some(spec) => Err(AssemblyError::FormatMismatch {
            turn: clip.turn,
            role: clip.role,
            expected: spec.to_string(),
            found: found.to_string(),
        }),
    }
}

// ============================================================================
// SEQUENTIAL ASSEMBLY
// ============================================================================

/// Concatenate clips in turn order (Person1 before Person2 within a turn)
pub fn concatenate(mut clips: Vec<SynthesizedClip>) -> Result<AssembledTrack, AssemblyError> {
    if clips.is_empty() {
        return Err(AssemblyError::NoClips);
    }

    clips.sort_by_key(|clip| (clip.turn, clip.role));

    let mut spec = None;
    let mut samples = Vec::new();

    for clip in &clips {
        let audio = decode_clip(clip)?;
        check_spec(&mut spec, clip, audio.spec())?;
        samples.extend_from_slice(audio.samples());
    }

    let spec = spec.ok_or(AssemblyError::NoClips)?;
    let mixed = PcmAudio::new(spec, samples);

    log::info!(
        "Concatenated {} clips into {:.2}s track",
        clips.len(),
        mixed.duration_secs()
    );

    Ok(AssembledTrack {
        mode: AssemblyMode::Sequential,
        mixed,
        role_tracks: None,
        steps: Vec::new(),
        warnings: Vec::new(),
        clip_count: clips.len(),
    })
}

// ============================================================================
// OVERLAY ASSEMBLY
// ============================================================================

/// Builds the two speaker tracks clip by clip
///
/// After each step the speaking track is ahead of the other one by exactly the
/// step's overlap (unless silence had to be clamped). [`finish`](Self::finish)
/// pads the lagging track so both end together.
#[derive(Debug, Default)]
pub struct OverlayAssembler {
    strict: bool,
    spec: Option<AudioSpec>,
    person1: Vec<i16>,
    person2: Vec<i16>,
    steps: Vec<OverlayStep>,
    warnings: Vec<AssemblyWarning>,
}

impl OverlayAssembler {
    /// `strict` turns a negative silence requirement into an error instead of a warning
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            ..Default::default()
        }
    }

    /// Append the next clip in playback order
    pub fn push(
        &mut self,
        clip: &SynthesizedClip,
        overlap_secs: f64,
    ) -> Result<&OverlayStep, AssemblyError> {
        let audio = decode_clip(clip)?;
        let spec = check_spec(&mut self.spec, clip, audio.spec())?;
        let channels = spec.channels.max(1) as usize;
        let overlap_frames = spec.frames_for(overlap_secs);

        let (speaker, other) = match clip.role {
            Role::Person1 => (&mut self.person1, &mut self.person2),
            Role::Person2 => (&mut self.person2, &mut self.person1),
        };
        speaker.extend_from_slice(audio.samples());

        let speaker_frames = speaker.len() / channels;
        let other_frames = other.len() / channels;
        // An overlap can never reach back past the start of the speaker's track
        let overlap_frames = overlap_frames.min(speaker_frames);
        let requested = speaker_frames as i64 - overlap_frames as i64 - other_frames as i64;

        let silence_frames = if requested < 0 {
            let requested_secs = requested as f64 / spec.sample_rate as f64;
            if self.strict {
                return Err(AssemblyError::NegativeSilence {
                    turn: clip.turn,
                    role: clip.role,
                    requested_secs,
                });
            }
            let warning = AssemblyWarning::ClampedSilence {
                turn: clip.turn,
                role: clip.role,
                requested_secs,
            };
            log::warn!("{}", warning);
            self.warnings.push(warning);
            0
        } else {
            requested as usize
        };

        other.resize(other.len() + silence_frames * channels, 0);

        log::debug!(
            "Overlay turn {} ({}): clip {:.2}s, overlap {:.2}s, silence {:.2}s",
            clip.turn,
            clip.role,
            audio.duration_secs(),
            overlap_secs,
            spec.secs_for(silence_frames)
        );

        self.steps.push(OverlayStep {
            turn: clip.turn,
            role: clip.role,
            clip_secs: audio.duration_secs(),
            overlap_secs: spec.secs_for(overlap_frames),
            silence_secs: spec.secs_for(silence_frames),
            person1_secs: spec.secs_for(self.person1.len() / channels),
            person2_secs: spec.secs_for(self.person2.len() / channels),
        });

        Ok(&self.steps[self.steps.len() - 1])
    }

    pub fn steps(&self) -> &[OverlayStep] {
        &self.steps
    }

    /// Align both tracks and mix them down
    pub fn finish(mut self) -> Result<AssembledTrack, AssemblyError> {
        let spec = self.spec.ok_or(AssemblyError::NoClips)?;

        // Trailing silence: the last overlap reserved on the lagging track
        let len = self.person1.len().max(self.person2.len());
        self.person1.resize(len, 0);
        self.person2.resize(len, 0);

        let person1 = PcmAudio::new(spec, self.person1);
        let person2 = PcmAudio::new(spec, self.person2);
        let mixed = person1.overlay(&person2);

        log::info!(
            "Overlaid {} clips into {:.2}s track ({} clamped)",
            self.steps.len(),
            mixed.duration_secs(),
            self.warnings.len()
        );

        Ok(AssembledTrack {
            mode: AssemblyMode::Overlay,
            mixed,
            role_tracks: Some(RoleTracks { person1, person2 }),
            clip_count: self.steps.len(),
            steps: self.steps,
            warnings: self.warnings,
        })
    }
}

// ============================================================================
// EXPORT
// ============================================================================

/// Writes assembled tracks to disk
pub struct AudioMixer {
    settings: ExportSettings,
}

impl AudioMixer {
    pub fn new(settings: ExportSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    /// Primary output path, with the format extension added when missing
    pub fn primary_path(&self, output: &Path) -> PathBuf {
        if output.extension().is_some() {
            output.to_path_buf()
        } else {
            output.with_extension(self.settings.format.extension())
        }
    }

    /// Per-speaker file next to the primary output: `{stem}_{role}.{ext}`
    pub fn role_track_path(&self, output: &Path, role: Role) -> PathBuf {
        let primary = self.primary_path(output);
        let stem = primary
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let ext = primary
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.settings.format.extension().to_string());
        primary.with_file_name(format!("{}_{}.{}", stem, role.file_suffix(), ext))
    }

    /// Export the mixed track (and per-role tracks in overlay mode)
    ///
    /// Every file is staged next to its destination and only renamed into place
    /// once all of them were written. The primary file is renamed last, and files
    /// already in place are removed again if a later rename fails, so a failure
    /// leaves no finished output.
    pub fn export(
        &self,
        track: &AssembledTrack,
        output: &Path,
    ) -> Result<Vec<PathBuf>, AssemblyError> {
        let mut targets = vec![(self.primary_path(output), &track.mixed)];
        if let Some(tracks) = &track.role_tracks {
            for role in Role::ALL {
                targets.push((self.role_track_path(output, role), tracks.get(role)));
            }
        }

        let mut staged = Vec::with_capacity(targets.len());
        for (path, audio) in &targets {
            staged.push((path.clone(), self.stage(path, audio)?));
        }

        let mut placed: Vec<PathBuf> = Vec::with_capacity(staged.len());
        for (path, file) in staged.into_iter().rev() {
            if let Err(e) = file.persist(&path) {
                for done in &placed {
                    if let Err(remove_err) = std::fs::remove_file(done) {
                        log::warn!("Could not remove {}: {}", done.display(), remove_err);
                    }
                }
                return Err(AssemblyError::Write {
                    path,
                    source: e.error,
                });
            }
            placed.push(path);
        }

        placed.reverse();
        for path in &placed {
            log::info!("Audio saved to {}", path.display());
        }
        Ok(placed)
    }

    fn stage(
        &self,
        path: &Path,
        audio: &PcmAudio,
    ) -> Result<tempfile::NamedTempFile, AssemblyError> {
        let dir = parent_dir(path);
        std::fs::create_dir_all(dir).map_err(|source| AssemblyError::Write {
            path: dir.to_path_buf(),
            source,
        })?;

        let wav = audio.to_wav_bytes().map_err(AssemblyError::Encode)?;
        let write_err = |source| AssemblyError::Write {
            path: path.to_path_buf(),
            source,
        };

        match self.settings.format {
            ExportFormat::Wav => {
                let mut file = staging_file(dir, "wav").map_err(write_err)?;
                file.write_all(&wav).map_err(write_err)?;
                file.flush().map_err(write_err)?;
                Ok(file)
            }
            ExportFormat::Mp3 => {
                let mut source_wav = staging_file(dir, "wav").map_err(write_err)?;
                source_wav.write_all(&wav).map_err(write_err)?;
                source_wav.flush().map_err(write_err)?;

                let mp3 = staging_file(dir, "mp3").map_err(write_err)?;
                self.encode_mp3(source_wav.path(), mp3.path(), path)?;
                Ok(mp3)
            }
        }
    }

    /// Convert WAV to MP3 using ffmpeg (external tool) with ID3 tags
    fn encode_mp3(&self, wav: &Path, mp3: &Path, target: &Path) -> Result<(), AssemblyError> {
        let mut cmd = std::process::Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(wav)
            .arg("-codec:a")
            .arg("libmp3lame")
            .arg("-b:a")
            .arg(format!("{}k", self.settings.mp3_bitrate.kbps()));

        let metadata = &self.settings.metadata;
        if let Some(ref title) = metadata.title {
            cmd.arg("-metadata").arg(format!("title={}", title));
        }
        if let Some(ref artist) = metadata.artist {
            cmd.arg("-metadata").arg(format!("artist={}", artist));
        }
        if let Some(ref comment) = metadata.comment {
            cmd.arg("-metadata").arg(format!("comment={}", comment));
        }

        cmd.arg("-f").arg("mp3").arg(mp3);

        let output = cmd.output().map_err(|e| AssemblyError::Export {
            path: target.to_path_buf(),
            message: format!("ffmpeg could not be started: {}. Is ffmpeg installed?", e),
        })?;

        if !output.status.success() {
            return Err(AssemblyError::Export {
                path: target.to_path_buf(),
                message: format!(
                    "ffmpeg exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(())
    }
}

impl Default for AudioMixer {
    fn default() -> Self {
        Self::new(ExportSettings::default())
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn staging_file(dir: &Path, ext: &str) -> std::io::Result<tempfile::NamedTempFile> {
    tempfile::Builder::new()
        .prefix(".mofa-dialogue-")
        .suffix(&format!(".{}", ext))
        .tempfile_in(dir)
}

// ============================================================================
// TESTS
// ============================================================================
