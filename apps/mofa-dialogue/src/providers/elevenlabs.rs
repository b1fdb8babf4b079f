use async_trait::async_trait;
use reqwest::Client as HttpClient;
use std::time::Duration;

use super::{http_client, send, PROVIDER_SAMPLE_RATE};
use crate::audio_mixer::{AudioSpec, PcmAudio};
use crate::config::{resolve_api_key, ElevenlabsConfig, RoleVoices};
use crate::error::{ConfigError, SynthesisError};
use crate::transcript_parser::Role;
use crate::tts_batch::{SynthesizedAudio, TtsEngine};

/// ElevenLabs `/v1/text-to-speech/{voice_id}` with `pcm_24000` output
#[derive(Debug)]
pub struct ElevenlabsTtsEngine {
    api_key: String,
    api_url: String,
    model: String,
    voices: RoleVoices<String>,
    client: HttpClient,
}

impl ElevenlabsTtsEngine {
    pub fn new(config: &ElevenlabsConfig) -> Result<Self, ConfigError> {
        Self::new_with_timeout(config, Duration::from_secs(60))
    }

    pub fn new_with_timeout(config: &ElevenlabsConfig, timeout: Duration) -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: resolve_api_key(&config.api_key, "elevenlabs")?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            voices: config.default_voices.clone(),
            client: http_client(timeout),
        })
    }

    fn endpoint(&self, voice_id: &str) -> String {
        format!(
            "{}/v1/text-to-speech/{}?output_format=pcm_{}",
            self.api_url, voice_id, PROVIDER_SAMPLE_RATE
        )
    }
}

#[async_trait]
impl TtsEngine for ElevenlabsTtsEngine {
    fn engine_name(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str, role: Role) -> Result<SynthesizedAudio, SynthesisError> {
        let voice_id = self.voices.get(role);
        let body = serde_json::json!({
            "text": text,
            "model_id": self.model,
        });

        let request = self
            .client
            .post(self.endpoint(voice_id))
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/pcm")
            .json(&body);

        let bytes = send(self.engine_name(), request).await?;
        let audio = PcmAudio::from_pcm16_le(&bytes, AudioSpec::mono(PROVIDER_SAMPLE_RATE));
        SynthesizedAudio::from_pcm(self.engine_name(), &audio)
    }
}
