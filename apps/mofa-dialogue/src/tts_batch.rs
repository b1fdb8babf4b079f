//! TTS Batch Synthesis - Dispatch dialogue lines to a speech backend
//!
//! This module provides:
//! - The [`TtsEngine`] capability every provider implements
//! - Bounded concurrent synthesis with results kept in playback order
//! - Per-call timeouts and cancellation
//! - A deterministic mock engine for offline runs and tests

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::audio_mixer::{AssemblyMode, AudioSpec, PcmAudio};
use crate::error::{PipelineError, SynthesisError};
use crate::pipeline::Stage;
use crate::transcript_parser::{DialogueLine, Role};

// ============================================================================
// DATA MODELS
// ============================================================================

/// Audio returned by a backend for one line
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    /// 16-bit PCM WAV bytes
    pub bytes: Vec<u8>,
    pub duration_secs: f64,
}

impl SynthesizedAudio {
    /// Encode decoded audio as a WAV result
    pub fn from_pcm(provider: &str, audio: &PcmAudio) -> Result<Self, SynthesisError> {
        if audio.is_empty() {
            return Err(SynthesisError::EmptyAudio {
                provider: provider.to_string(),
            });
        }
        let bytes = audio
            .to_wav_bytes()
            .map_err(|source| SynthesisError::InvalidAudio {
                provider: provider.to_string(),
                source,
            })?;
        Ok(Self {
            bytes,
            duration_secs: audio.duration_secs(),
        })
    }
}

/// One synthesized line, tagged with its position in the dialogue
#[derive(Debug, Clone)]
pub struct SynthesizedClip {
    pub turn: usize,
    pub role: Role,
    pub bytes: Vec<u8>,
    pub duration_secs: f64,
}

impl SynthesizedClip {
    pub fn new(turn: usize, role: Role, bytes: Vec<u8>, duration_secs: f64) -> Self {
        Self {
            turn,
            role,
            bytes,
            duration_secs,
        }
    }

    /// Scratch file name, unique per line
    pub fn file_name(&self) -> String {
        format!("{:04}_{}.wav", self.turn, self.role.file_suffix())
    }
}

/// Progress update during synthesis
#[derive(Debug, Clone)]
pub struct TtsProgress {
    /// Lines finished so far
    pub completed: usize,
    pub total: usize,
    pub turn: usize,
    pub role: Role,
    pub text_preview: String,
    /// Percentage complete (0-100)
    pub percentage: f64,
}

/// Per-request prosody variation, drawn before the call is dispatched
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VoiceVariation {
    /// Multiplies the configured speaking rate
    pub rate_factor: Option<f64>,
    /// Added to the configured pitch
    pub pitch_offset: Option<f64>,
}

/// Progress callback type
pub type ProgressCallback = Arc<dyn Fn(TtsProgress) + Send + Sync>;

// ============================================================================
// TRAIT DEFINITIONS
// ============================================================================

/// A speech-synthesis provider
///
/// Implementations make exactly one request per call; there are no retries.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Get engine name
    fn engine_name(&self) -> &str;

    /// Assembly mode used when the configuration does not force one
    fn preferred_assembly(&self) -> AssemblyMode {
        AssemblyMode::Sequential
    }

    /// Synthesize one line spoken by `role`
    async fn synthesize(&self, text: &str, role: Role) -> Result<SynthesizedAudio, SynthesisError>;

    /// Draw the randomness one request for `role` will use
    ///
    /// The batch synthesizer calls this in line order before dispatching, so a
    /// seeded run draws the same values however concurrent calls interleave.
    fn draw_variation(&self, _role: Role) -> VoiceVariation {
        VoiceVariation::default()
    }

    /// Synthesize with a variation from [`draw_variation`](Self::draw_variation)
    async fn synthesize_with(
        &self,
        text: &str,
        role: Role,
        _variation: VoiceVariation,
    ) -> Result<SynthesizedAudio, SynthesisError> {
        self.synthesize(text, role).await
    }
}

// ============================================================================
// BATCH TTS SYNTHESIZER
// ============================================================================

/// Dispatches lines to an engine with a per-call timeout
pub struct BatchTtsSynthesizer {
    engine: Arc<dyn TtsEngine>,
    max_concurrent_tasks: usize,
    timeout: Duration,
}

impl BatchTtsSynthesizer {
    pub fn new(engine: Arc<dyn TtsEngine>, max_concurrent_tasks: usize, timeout: Duration) -> Self {
        Self {
            engine,
            max_concurrent_tasks: max_concurrent_tasks.max(1),
            timeout,
        }
    }

    pub fn engine(&self) -> &Arc<dyn TtsEngine> {
        &self.engine
    }

    /// Synthesize a single line, attaching turn/role context to failures
    pub async fn synthesize_line(&self, line: &DialogueLine) -> Result<SynthesizedClip, PipelineError> {
        let variation = self.engine.draw_variation(line.role);
        Self::call_engine(self.engine.as_ref(), line, variation, self.timeout).await
    }

    /// Synthesize every line concurrently, returning clips in input order
    ///
    /// The first failure aborts all in-flight calls.
    pub async fn synthesize_all(
        &self,
        lines: Vec<DialogueLine>,
        cancel: &CancellationToken,
        progress: Option<&ProgressCallback>,
    ) -> Result<Vec<SynthesizedClip>, PipelineError> {
        let total = lines.len();
        let keys: Vec<(usize, Role)> = lines.iter().map(|l| (l.turn, l.role)).collect();
        let mut results: Vec<Option<SynthesizedClip>> = (0..total).map(|_| None).collect();
        let mut pending = lines.into_iter().enumerate();
        let mut join_set = JoinSet::new();
        let mut completed = 0;

        loop {
            // Keep at most `max_concurrent_tasks` calls in flight
            while join_set.len() < self.max_concurrent_tasks {
                let Some((slot, line)) = pending.next() else {
                    break;
                };
                let variation = self.engine.draw_variation(line.role);
                let engine = Arc::clone(&self.engine);
                let timeout = self.timeout;
                join_set.spawn(async move {
                    let result = Self::call_engine(engine.as_ref(), &line, variation, timeout).await;
                    (slot, line, result)
                });
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(PipelineError::Cancelled(Stage::Synthesizing));
                }
                next = join_set.join_next() => next,
            };

            match next {
                None => break,
                Some(Ok((slot, line, Ok(clip)))) => {
                    completed += 1;
                    if let Some(progress) = progress {
                        progress(TtsProgress {
                            completed,
                            total,
                            turn: line.turn,
                            role: line.role,
                            text_preview: truncate_text(&line.text, 50),
                            percentage: completed as f64 / total as f64 * 100.0,
                        });
                    }
                    results[slot] = Some(clip);
                }
                Some(Ok((_, _, Err(e)))) => {
                    join_set.abort_all();
                    return Err(e);
                }
                Some(Err(join_error)) => {
                    join_set.abort_all();
                    return Err(PipelineError::Synthesis {
                        turn: 0,
                        role: Role::Person1,
                        source: SynthesisError::Engine(format!("synthesis task failed: {}", join_error)),
                    });
                }
            }
        }

        results
            .into_iter()
            .zip(keys)
            .map(|(clip, (turn, role))| {
                clip.ok_or_else(|| PipelineError::Synthesis {
                    turn,
                    role,
                    source: SynthesisError::Engine("line was never synthesized".to_string()),
                })
            })
            .collect()
    }

    async fn call_engine(
        engine: &dyn TtsEngine,
        line: &DialogueLine,
        variation: VoiceVariation,
        timeout: Duration,
    ) -> Result<SynthesizedClip, PipelineError> {
        let context = |source| PipelineError::Synthesis {
            turn: line.turn,
            role: line.role,
            source,
        };

        let audio = match tokio::time::timeout(timeout, engine.synthesize_with(&line.text, line.role, variation)).await {
            Ok(result) => result.map_err(context)?,
            Err(_) => return Err(context(SynthesisError::Timeout(timeout))),
        };

        if audio.bytes.is_empty() {
            return Err(context(SynthesisError::EmptyAudio {
                provider: engine.engine_name().to_string(),
            }));
        }

        log::debug!(
            "{}: turn {} ({}) -> {:.2}s",
            engine.engine_name(),
            line.turn,
            line.role,
            audio.duration_secs
        );

        Ok(SynthesizedClip::new(
            line.turn,
            line.role,
            audio.bytes,
            audio.duration_secs,
        ))
    }
}

/// Truncate text to preview length
pub(crate) fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

// ============================================================================
// MOCK TTS ENGINE (for testing)
// ============================================================================

/// Mock TTS engine for testing without actual TTS
///
/// Produces a decaying sine tone whose length follows the word count
/// (150 words per minute, at least 0.5 seconds).
#[derive(Debug, Clone)]
pub struct MockTtsEngine {
    sample_rate: u32,
    assembly: AssemblyMode,
}

impl MockTtsEngine {
    pub fn new() -> Self {
        Self {
            sample_rate: 24_000,
            assembly: AssemblyMode::Sequential,
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Report `mode` as the preferred assembly
    pub fn with_assembly(mut self, mode: AssemblyMode) -> Self {
        self.assembly = mode;
        self
    }

    /// Estimated spoken duration of `text`
    pub fn estimate_duration(text: &str) -> f64 {
        let word_count = text.split_whitespace().count() as f64;
        (word_count / 150.0 * 60.0).max(0.5)
    }

    fn render(&self, text: &str, role: Role) -> PcmAudio {
        let spec = AudioSpec::mono(self.sample_rate);
        let num_samples = spec.frames_for(Self::estimate_duration(text));
        let frequency = match role {
            Role::Person1 => 220.0,
            Role::Person2 => 330.0,
        };
        let amplitude = 32767.0 * 0.3;

        let samples = (0..num_samples)
            .map(|i| {
                let t = i as f64 / self.sample_rate as f64;
                let decay = 1.0 - (i as f64 / num_samples as f64) * 0.5;
                (amplitude * decay * (2.0 * std::f64::consts::PI * frequency * t).sin()) as i16
            })
            .collect();

        PcmAudio::new(spec, samples)
    }
}

impl Default for MockTtsEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TtsEngine for MockTtsEngine {
    fn engine_name(&self) -> &str {
        "mock-tts"
    }

    fn preferred_assembly(&self) -> AssemblyMode {
        self.assembly
    }

    async fn synthesize(&self, text: &str, role: Role) -> Result<SynthesizedAudio, SynthesisError> {
        if text.trim().is_empty() {
            return Err(SynthesisError::Engine("Text is empty".to_string()));
        }

        let audio = self.render(text, role);
        log::debug!(
            "MockTtsEngine: synthesized {} chars as {} ({:.2}s)",
            text.len(),
            role,
            audio.duration_secs()
        );
        SynthesizedAudio::from_pcm(self.engine_name(), &audio)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jitter::{Band, Jitter};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps longer for earlier lines so completions arrive out of order
    struct ReversedLatencyEngine;

    #[async_trait]
    impl TtsEngine for ReversedLatencyEngine {
        fn engine_name(&self) -> &str {
            "reversed"
        }

        async fn synthesize(&self, text: &str, role: Role) -> Result<SynthesizedAudio, SynthesisError> {
            let n: u64 = text.parse().unwrap();
            tokio::time::sleep(Duration::from_millis(50 - n * 10)).await;
            let audio = PcmAudio::new(AudioSpec::mono(1000), vec![n as i16; 10]);
            let _ = role;
            SynthesizedAudio::from_pcm("reversed", &audio)
        }
    }

    /// Draws a rate factor per line and records what each call received
    struct VariedEngine {
        jitter: Jitter,
        received: Mutex<Vec<(u64, VoiceVariation)>>,
    }

    #[async_trait]
    impl TtsEngine for VariedEngine {
        fn engine_name(&self) -> &str {
            "varied"
        }

        async fn synthesize(&self, text: &str, role: Role) -> Result<SynthesizedAudio, SynthesisError> {
            self.synthesize_with(text, role, self.draw_variation(role)).await
        }

        fn draw_variation(&self, _role: Role) -> VoiceVariation {
            VoiceVariation {
                rate_factor: Some(self.jitter.sample(Band::new(0.95, 1.2))),
                pitch_offset: None,
            }
        }

        async fn synthesize_with(
            &self,
            text: &str,
            _role: Role,
            variation: VoiceVariation,
        ) -> Result<SynthesizedAudio, SynthesisError> {
            let n: u64 = text.parse().unwrap();
            tokio::time::sleep(Duration::from_millis(50 - n * 10)).await;
            self.received.lock().push((n, variation));
            let audio = PcmAudio::new(AudioSpec::mono(1000), vec![0; 10]);
            SynthesizedAudio::from_pcm("varied", &audio)
        }
    }

    struct FailingEngine {
        fail_on: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TtsEngine for FailingEngine {
        fn engine_name(&self) -> &str {
            "failing"
        }

        async fn synthesize(&self, text: &str, _role: Role) -> Result<SynthesizedAudio, SynthesisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text == self.fail_on {
                return Err(SynthesisError::Engine("boom".to_string()));
            }
            MockTtsEngine::new().with_sample_rate(1000).synthesize(text, Role::Person1).await
        }
    }

    struct SlowEngine;

    #[async_trait]
    impl TtsEngine for SlowEngine {
        fn engine_name(&self) -> &str {
            "slow"
        }

        async fn synthesize(&self, _text: &str, _role: Role) -> Result<SynthesizedAudio, SynthesisError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(SynthesisError::Engine("unreachable".to_string()))
        }
    }

    fn line(turn: usize, role: Role, text: &str) -> DialogueLine {
        DialogueLine {
            turn,
            role,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_estimated_duration() {
        let text = "This is a test sentence with ten words here okay.";
        // 10 words / (150 words / 60 seconds) = 4 seconds
        assert!((MockTtsEngine::estimate_duration(text) - 4.0).abs() < 1e-9);
        assert_eq!(MockTtsEngine::estimate_duration("Hi"), 0.5);
    }

    #[tokio::test]
    async fn test_mock_tts_engine() {
        let engine = MockTtsEngine::new().with_sample_rate(8000);
        let audio = engine.synthesize("Hello world", Role::Person2).await.unwrap();

        let decoded = PcmAudio::from_wav_bytes(&audio.bytes).unwrap();
        assert_eq!(decoded.spec(), AudioSpec::mono(8000));
        assert!((audio.duration_secs - 0.8).abs() < 1e-9);
        assert!(engine.synthesize("   ", Role::Person1).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_keeps_input_order() {
        let synthesizer = BatchTtsSynthesizer::new(Arc::new(ReversedLatencyEngine), 4, Duration::from_secs(5));
        let lines = vec![
            line(1, Role::Person1, "0"),
            line(1, Role::Person2, "1"),
            line(2, Role::Person1, "2"),
            line(2, Role::Person2, "3"),
        ];

        let progress_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&progress_calls);
        let progress: ProgressCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let clips = synthesizer
            .synthesize_all(lines, &CancellationToken::new(), Some(&progress))
            .await
            .unwrap();

        let keys: Vec<_> = clips.iter().map(|c| (c.turn, c.role)).collect();
        assert_eq!(
            keys,
            vec![
                (1, Role::Person1),
                (1, Role::Person2),
                (2, Role::Person1),
                (2, Role::Person2),
            ]
        );
        let first_samples: Vec<i16> = clips
            .iter()
            .map(|c| PcmAudio::from_wav_bytes(&c.bytes).unwrap().samples()[0])
            .collect();
        assert_eq!(first_samples, vec![0, 1, 2, 3]);
        assert_eq!(progress_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_variation_follows_line_order_for_seed() {
        let engine = Arc::new(VariedEngine {
            jitter: Jitter::seeded(9),
            received: Mutex::new(Vec::new()),
        });
        let synthesizer = BatchTtsSynthesizer::new(engine.clone(), 4, Duration::from_secs(5));
        let lines = (0..4)
            .map(|n| line(n as usize + 1, Role::Person1, &n.to_string()))
            .collect();

        synthesizer
            .synthesize_all(lines, &CancellationToken::new(), None)
            .await
            .unwrap();

        // Calls finished last-to-first, yet line n got the n-th draw
        let mut received = engine.received.lock().clone();
        assert_eq!(received.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![3, 2, 1, 0]);
        received.sort_by_key(|(n, _)| *n);

        let expected = Jitter::seeded(9);
        for (_, variation) in received {
            assert_eq!(variation.rate_factor, Some(expected.sample(Band::new(0.95, 1.2))));
            assert_eq!(variation.pitch_offset, None);
        }
    }

    #[tokio::test]
    async fn test_batch_failure_carries_turn_and_role() {
        let engine = Arc::new(FailingEngine {
            fail_on: "three",
            calls: AtomicUsize::new(0),
        });
        let synthesizer = BatchTtsSynthesizer::new(engine, 1, Duration::from_secs(5));
        let lines = vec![
            line(1, Role::Person1, "one"),
            line(2, Role::Person1, "two"),
            line(3, Role::Person2, "three"),
            line(4, Role::Person1, "four"),
        ];

        let err = synthesizer
            .synthesize_all(lines, &CancellationToken::new(), None)
            .await
            .unwrap_err();

        assert_eq!(err.turn(), Some(3));
        assert!(matches!(err, PipelineError::Synthesis { role: Role::Person2, .. }));
        assert!(err.to_string().contains("turn 3"));
    }

    #[tokio::test]
    async fn test_timeout_is_a_synthesis_error() {
        let synthesizer = BatchTtsSynthesizer::new(Arc::new(SlowEngine), 1, Duration::from_millis(20));
        let err = synthesizer
            .synthesize_line(&line(2, Role::Person2, "slow"))
            .await
            .unwrap_err();

        match err {
            PipelineError::Synthesis { turn, source, .. } => {
                assert_eq!(turn, 2);
                assert!(matches!(source, SynthesisError::Timeout(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_batch() {
        let synthesizer = BatchTtsSynthesizer::new(Arc::new(SlowEngine), 2, Duration::from_secs(120));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = synthesizer
            .synthesize_all(vec![line(1, Role::Person1, "x")], &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(Stage::Synthesizing)));
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn test_clip_file_names_are_unique_per_line() {
        let a = SynthesizedClip::new(3, Role::Person1, Vec::new(), 0.0);
        let b = SynthesizedClip::new(3, Role::Person2, Vec::new(), 0.0);
        assert_eq!(a.file_name(), "0003_person1.wav");
        assert_ne!(a.file_name(), b.file_name());
    }
}
