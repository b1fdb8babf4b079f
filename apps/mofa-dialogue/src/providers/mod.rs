//! Remote speech-synthesis providers
//!
//! Every provider is requested to return 16-bit PCM so clips can be decoded
//! and mixed without a codec.

mod elevenlabs;
mod google;
mod openai;

pub use elevenlabs::ElevenlabsTtsEngine;
pub use google::{GoogleTtsEngine, VoiceProfile};
pub use openai::OpenaiTtsEngine;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client as HttpClient;

use crate::config::{Config, ProviderKind};
use crate::error::{ConfigError, SynthesisError};
use crate::jitter::Jitter;
use crate::tts_batch::{MockTtsEngine, TtsEngine};

/// Sample rate requested from every provider
pub const PROVIDER_SAMPLE_RATE: u32 = 24_000;

/// Create the engine for `kind` from its configuration section
///
/// `jitter` is shared with the overlay assembler so a single seed fixes the
/// whole run.
pub fn create_engine(
    config: &Config,
    kind: ProviderKind,
    jitter: Arc<Jitter>,
) -> Result<Arc<dyn TtsEngine>, ConfigError> {
    let timeout = config.request_timeout();

    let engine: Arc<dyn TtsEngine> = match kind {
        ProviderKind::Openai => {
            let section = config
                .openai
                .as_ref()
                .ok_or(ConfigError::MissingSection("openai"))?;
            Arc::new(OpenaiTtsEngine::new_with_timeout(section, timeout)?)
        }
        ProviderKind::Elevenlabs => {
            let section = config
                .elevenlabs
                .as_ref()
                .ok_or(ConfigError::MissingSection("elevenlabs"))?;
            Arc::new(ElevenlabsTtsEngine::new_with_timeout(section, timeout)?)
        }
        ProviderKind::Google => {
            let section = config
                .google
                .as_ref()
                .ok_or(ConfigError::MissingSection("google"))?;
            Arc::new(GoogleTtsEngine::new_with_timeout(
                section,
                config.jitter.clone(),
                jitter,
                timeout,
            )?)
        }
        ProviderKind::Mock => Arc::new(MockTtsEngine::new().with_sample_rate(PROVIDER_SAMPLE_RATE)),
    };

    log::info!("Using TTS engine: {}", engine.engine_name());
    Ok(engine)
}

pub(crate) fn http_client(timeout: Duration) -> HttpClient {
    HttpClient::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// Send a prepared request and return the body of a successful response
pub(crate) async fn send(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<Vec<u8>, SynthesisError> {
    let response = request.send().await.map_err(|source| SynthesisError::Request {
        provider: provider.to_string(),
        source,
    })?;

    let status = response.status();
    log::debug!("[{}] Got response with status: {}", provider, status);

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SynthesisError::Status {
            provider: provider.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response.bytes().await.map_err(|source| SynthesisError::Request {
        provider: provider.to_string(),
        source,
    })?;

    if bytes.is_empty() {
        return Err(SynthesisError::EmptyAudio {
            provider: provider.to_string(),
        });
    }

    Ok(bytes.to_vec())
}
