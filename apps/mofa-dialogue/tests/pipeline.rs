use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use mofa_dialogue::{
    AssemblyMode, AssemblySelection, Band, DialoguePipeline, Jitter, MockTtsEngine, PcmAudio,
    PipelineError, PipelineSettings, PipelineState, Role, Stage, SynthesisError,
    SynthesizedAudio, TtsEngine,
};

const FIVE_TURNS: &str = "\
<Person1>First question here</Person1><Person2>First answer</Person2>
<Person1>Second question</Person1><Person2>Second answer goes on a bit</Person2>
<Person1>Third question</Person1><Person2>Third answer</Person2>
<Person1>Fourth</Person1><Person2>Fourth answer</Person2>
<Person1>Fifth question</Person1><Person2>Fifth answer and goodbye</Person2>";

/// Delegates to the mock engine, counting calls and failing on a marker word
struct ScriptedEngine {
    inner: MockTtsEngine,
    fail_on: Option<&'static str>,
    cancel_after: Option<(usize, CancellationToken)>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    fn new(mode: AssemblyMode) -> Self {
        Self {
            inner: MockTtsEngine::new().with_sample_rate(1000).with_assembly(mode),
            fail_on: None,
            cancel_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TtsEngine for ScriptedEngine {
    fn engine_name(&self) -> &str {
        "scripted"
    }

    fn preferred_assembly(&self) -> AssemblyMode {
        self.inner.preferred_assembly()
    }

    async fn synthesize(&self, text: &str, role: Role) -> Result<SynthesizedAudio, SynthesisError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after {
            if call >= *after {
                token.cancel();
            }
        }
        if let Some(marker) = self.fail_on {
            if text.contains(marker) {
                return Err(SynthesisError::Status {
                    provider: "scripted".to_string(),
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
        }
        self.inner.synthesize(text, role).await
    }
}

fn settings(dir: &Path, max_concurrent_requests: usize) -> PipelineSettings {
    PipelineSettings {
        temp_audio_dir: dir.join("scratch"),
        max_concurrent_requests,
        request_timeout: Duration::from_secs(5),
        ..PipelineSettings::default()
    }
}

fn pipeline(engine: Arc<ScriptedEngine>, settings: PipelineSettings, seed: u64) -> DialoguePipeline {
    DialoguePipeline::new(engine, settings, Arc::new(Jitter::seeded(seed)))
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn failure_on_third_turn_reports_turn_and_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = ScriptedEngine::new(AssemblyMode::Sequential);
    engine.fail_on = Some("Third question");
    let engine = Arc::new(engine);
    let pipeline = pipeline(Arc::clone(&engine), settings(dir.path(), 1), 1);
    let output = dir.path().join("episode.wav");

    let err = pipeline.run(FIVE_TURNS, &output).await.unwrap_err();

    assert_eq!(err.turn(), Some(3));
    assert_eq!(err.stage(), Stage::Synthesizing);
    assert!(matches!(
        err,
        PipelineError::Synthesis {
            role: Role::Person1,
            source: SynthesisError::Status { status: 503, .. },
            ..
        }
    ));
    assert_eq!(
        pipeline.state(),
        PipelineState::Failed {
            stage: Stage::Synthesizing
        }
    );
    // Turns 1 and 2 plus the failing call; nothing after it
    assert_eq!(engine.calls(), 5);
    assert!(!output.exists());
    assert_eq!(files_in(dir.path()), vec!["scratch"]);
    assert!(files_in(&dir.path().join("scratch")).is_empty());
}

#[tokio::test]
async fn sequential_duration_is_exact_sum_of_clips() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(AssemblyMode::Sequential));
    let pipeline = pipeline(Arc::clone(&engine), settings(dir.path(), 3), 1);
    let output = dir.path().join("episode.wav");

    let report = pipeline.run(FIVE_TURNS, &output).await.unwrap();

    let lines = [
        "First question here",
        "First answer",
        "Second question",
        "Second answer goes on a bit",
        "Third question",
        "Third answer",
        "Fourth",
        "Fourth answer",
        "Fifth question",
        "Fifth answer and goodbye",
        "Bye Bye!",
    ];
    let expected: f64 = lines.iter().map(|l| MockTtsEngine::estimate_duration(l)).sum();

    assert_eq!(report.turn_count, 6);
    assert_eq!(report.clip_count, 11);
    assert_eq!(engine.calls(), 11);
    assert!((report.total_duration_secs - expected).abs() < 1e-6);

    let written = PcmAudio::from_wav_bytes(&std::fs::read(&output).unwrap()).unwrap();
    assert!((written.duration_secs() - expected).abs() < 1e-6);
}

#[tokio::test]
async fn overlay_writes_primary_and_role_tracks() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(AssemblyMode::Overlay));
    let pipeline = pipeline(engine, settings(dir.path(), 4), 9);
    let output = dir.path().join("episode.wav");

    let report = pipeline.run(FIVE_TURNS, &output).await.unwrap();

    assert_eq!(report.mode, AssemblyMode::Overlay);
    assert_eq!(
        files_in(dir.path()),
        vec![
            "episode.wav",
            "episode_person1.wav",
            "episode_person2.wav",
            "scratch"
        ]
    );

    let read = |name: &str| PcmAudio::from_wav_bytes(&std::fs::read(dir.path().join(name)).unwrap()).unwrap();
    let mixed = read("episode.wav");
    let person1 = read("episode_person1.wav");
    let person2 = read("episode_person2.wav");
    assert_eq!(person1.frames(), person2.frames());
    assert_eq!(mixed.frames(), person1.frames());
    assert!((mixed.duration_secs() - report.total_duration_secs).abs() < 1e-9);
}

#[tokio::test]
async fn overlay_output_is_reproducible_for_a_seed() {
    let dir = tempfile::tempdir().unwrap();
    let mut outputs = Vec::new();

    for run in 0..2 {
        let engine = Arc::new(ScriptedEngine::new(AssemblyMode::Overlay));
        let pipeline = pipeline(engine, settings(dir.path(), 1), 1234);
        let output = dir.path().join(format!("run{}.wav", run));
        pipeline.run(FIVE_TURNS, &output).await.unwrap();
        outputs.push(std::fs::read(&output).unwrap());
    }

    assert_eq!(outputs[0], outputs[1]);
}

#[tokio::test]
async fn forced_sequential_overrides_engine_preference() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(AssemblyMode::Overlay));
    let mut settings = settings(dir.path(), 2);
    settings.assembly = AssemblySelection::Sequential;
    let pipeline = pipeline(engine, settings, 1);

    let report = pipeline
        .run(FIVE_TURNS, &dir.path().join("episode.wav"))
        .await
        .unwrap();

    assert_eq!(report.mode, AssemblyMode::Sequential);
    assert_eq!(report.output_files.len(), 1);
}

#[tokio::test]
async fn cancelled_run_writes_nothing() {
    for mode in [AssemblyMode::Sequential, AssemblyMode::Overlay] {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut engine = ScriptedEngine::new(mode);
        engine.cancel_after = Some((2, cancel.clone()));
        let pipeline = pipeline(Arc::new(engine), settings(dir.path(), 1), 1);
        let output = dir.path().join("episode.wav");

        let err = pipeline
            .run_with_cancellation(FIVE_TURNS, &output, &cancel)
            .await
            .unwrap_err();

        assert!(
            matches!(err, PipelineError::Cancelled(Stage::Synthesizing)),
            "{mode}: {err}"
        );
        assert!(!output.exists());
        assert!(files_in(&dir.path().join("scratch")).is_empty());
    }
}

#[tokio::test]
async fn zero_turns_fails_before_any_synthesis() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(AssemblyMode::Sequential));
    let pipeline = pipeline(Arc::clone(&engine), settings(dir.path(), 2), 1);

    let err = pipeline
        .run("<Person1>Is anyone out there", &dir.path().join("episode.wav"))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Parse(_)));
    assert_eq!(err.stage(), Stage::Segmenting);
    assert_eq!(engine.calls(), 0);
    assert!(!dir.path().join("scratch").exists());
}

#[tokio::test]
async fn sanitizer_runs_before_segmentation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(AssemblyMode::Sequential));
    let pipeline = pipeline(Arc::clone(&engine), settings(dir.path(), 1), 1);

    // Unclosed speaker tags and stray markup are repaired before segmentation
    let report = pipeline
        .run(
            "<scratchpad>notes</scratchpad>\n<Person1>Hi <emphasis>there</emphasis>\n\n<Person2>Hello",
            &dir.path().join("episode.wav"),
        )
        .await
        .unwrap();

    assert_eq!(report.turn_count, 2);
    assert_eq!(engine.calls(), 3);
}

#[tokio::test]
async fn strict_overlap_rejects_negative_silence() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::new(AssemblyMode::Overlay));
    let mut settings = settings(dir.path(), 1);
    settings.strict_overlap = true;
    // Longer than any 0.5 s clip, so the second line cannot fit
    settings.overlap = Band::fixed(0.45);
    let pipeline = pipeline(engine, settings, 1);

    let err = pipeline
        .run(
            "<Person1>Hi</Person1><Person2>Yo</Person2>",
            &dir.path().join("episode.wav"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.stage(), Stage::Assembling);
    assert_eq!(err.turn(), Some(1));
    assert!(!dir.path().join("episode.wav").exists());
}
