use async_trait::async_trait;
use reqwest::Client as HttpClient;
use std::time::Duration;

use super::{http_client, send, PROVIDER_SAMPLE_RATE};
use crate::audio_mixer::{AudioSpec, PcmAudio};
use crate::config::{resolve_api_key, OpenaiConfig, RoleVoices};
use crate::error::{ConfigError, SynthesisError};
use crate::transcript_parser::Role;
use crate::tts_batch::{SynthesizedAudio, TtsEngine};

/// OpenAI `/v1/audio/speech`
///
/// Requests raw `pcm` (24 kHz, 16-bit, mono) and wraps it into WAV.
#[derive(Debug)]
pub struct OpenaiTtsEngine {
    api_key: String,
    api_url: String,
    model: String,
    voices: RoleVoices<String>,
    client: HttpClient,
}

impl OpenaiTtsEngine {
    pub fn new(config: &OpenaiConfig) -> Result<Self, ConfigError> {
        Self::new_with_timeout(config, Duration::from_secs(60))
    }

    pub fn new_with_timeout(config: &OpenaiConfig, timeout: Duration) -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: resolve_api_key(&config.api_key, "openai")?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            voices: config.default_voices.clone(),
            client: http_client(timeout),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/audio/speech", self.api_url)
    }
}

#[async_trait]
impl TtsEngine for OpenaiTtsEngine {
    fn engine_name(&self) -> &str {
        "openai"
    }

    async fn synthesize(&self, text: &str, role: Role) -> Result<SynthesizedAudio, SynthesisError> {
        let voice = self.voices.get(role);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "response_format": "pcm",
        });

        let request = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body);

        let bytes = send(self.engine_name(), request).await?;
        let audio = PcmAudio::from_pcm16_le(&bytes, AudioSpec::mono(PROVIDER_SAMPLE_RATE));

        log::debug!(
            "OpenAI TTS: {} bytes of audio (voice={}, model={})",
            bytes.len(),
            voice,
            self.model
        );

        SynthesizedAudio::from_pcm(self.engine_name(), &audio)
    }
}
