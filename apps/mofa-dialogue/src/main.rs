//! mofa-dialogue - render a dialogue transcript to audio

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use mofa_dialogue::{
    AssemblySelection, Config, DialoguePipeline, PipelineProgress, PipelineState, ProviderKind,
};

/// Turn a <Person1>/<Person2> transcript into a podcast audio file
#[derive(Parser, Debug)]
#[command(name = "mofa-dialogue")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Transcript file
    #[arg(short, long)]
    input: PathBuf,

    /// Output audio file (extension added from the configured format if missing)
    #[arg(short, long)]
    output: PathBuf,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "MOFA_DIALOGUE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured provider (openai, elevenlabs, google, mock)
    #[arg(short, long)]
    provider: Option<String>,

    /// Override the assembly mode (auto, sequential, overlay)
    #[arg(short, long)]
    assembly: Option<AssemblySelection>,

    /// Seed for reproducible prosody jitter and overlap
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(assembly) = cli.assembly {
        config.assembly = assembly;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    let provider = cli
        .provider
        .as_deref()
        .map(str::parse::<ProviderKind>)
        .transpose()?;

    let transcript = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("Failed to read transcript {}", cli.input.display()))?;

    let pipeline = DialoguePipeline::from_config(&config, provider)?.with_progress(Arc::new(
        |event: PipelineProgress| match event {
            PipelineProgress::ClipSynthesized(p) => log::info!(
                "[{:>5.1}%] turn {} {}: {}",
                p.percentage,
                p.turn,
                p.role,
                p.text_preview
            ),
            PipelineProgress::StateChanged(state @ PipelineState::Assembling) => {
                log::info!("{:?}", state)
            }
            PipelineProgress::StateChanged(_) => {}
        },
    ));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    let report = pipeline
        .run_with_cancellation(&transcript, &cli.output, &cancel)
        .await?;

    for warning in &report.warnings {
        log::warn!("{}", warning);
    }
    for file in &report.output_files {
        println!("{}", file.display());
    }
    log::info!(
        "{} turns, {} clips, {:.1}s of audio ({})",
        report.turn_count,
        report.clip_count,
        report.total_duration_secs,
        report.mode
    );

    Ok(())
}
