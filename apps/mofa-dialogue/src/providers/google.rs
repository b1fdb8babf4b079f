use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::{http_client, send, PROVIDER_SAMPLE_RATE};
use crate::audio_mixer::{AssemblyMode, AudioSpec, PcmAudio};
use crate::config::{resolve_api_key, GoogleConfig, GoogleVoiceConfig, JitterConfig, RoleVoices};
use crate::error::{ConfigError, SynthesisError};
use crate::jitter::Jitter;
use crate::transcript_parser::Role;
use crate::tts_batch::{SynthesizedAudio, TtsEngine, VoiceVariation};

/// Voice settings for one speaker, resolved once at load time
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceProfile {
    pub voice: String,
    pub language_code: String,
    pub rate: Option<f64>,
    pub pitch: Option<f64>,
    /// Send `input.text` instead of `input.ssml`
    pub uses_plain_text: bool,
}

impl VoiceProfile {
    pub fn resolve(config: &GoogleVoiceConfig, default_language: &str) -> Self {
        // Journey voices reject SSML
        let uses_plain_text = config
            .plain_text
            .unwrap_or_else(|| config.voice.contains("Journey"));

        Self {
            voice: config.voice.clone(),
            language_code: config
                .language_code
                .clone()
                .unwrap_or_else(|| default_language.to_string()),
            rate: config.rate,
            pitch: config.pitch,
            uses_plain_text,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    #[serde(default)]
    audio_content: String,
}

/// Google Cloud Text-to-Speech `/v1/text:synthesize` (LINEAR16)
///
/// Prefers overlay assembly. A configured non-zero rate or pitch receives a
/// random nudge per call.
pub struct GoogleTtsEngine {
    api_key: String,
    api_url: String,
    profiles: RoleVoices<VoiceProfile>,
    bands: JitterConfig,
    jitter: Arc<Jitter>,
    client: HttpClient,
}

impl GoogleTtsEngine {
    pub fn new_with_timeout(
        config: &GoogleConfig,
        bands: JitterConfig,
        jitter: Arc<Jitter>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let profiles = RoleVoices {
            person1: VoiceProfile::resolve(&config.default_voices.person1, &config.language_code),
            person2: VoiceProfile::resolve(&config.default_voices.person2, &config.language_code),
        };

        Ok(Self {
            api_key: resolve_api_key(&config.api_key, "google")?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            profiles,
            bands,
            jitter,
            client: http_client(timeout),
        })
    }

    pub fn profile(&self, role: Role) -> &VoiceProfile {
        self.profiles.get(role)
    }

    /// JSON request for one line; draws jitter for rate and pitch
    pub fn request_body(&self, text: &str, role: Role) -> serde_json::Value {
        self.request_body_with(text, role, self.draw_variation(role))
    }

    /// JSON request for one line using an already drawn variation
    pub fn request_body_with(
        &self,
        text: &str,
        role: Role,
        variation: VoiceVariation,
    ) -> serde_json::Value {
        let profile = self.profile(role);

        let input = if profile.uses_plain_text {
            serde_json::json!({ "text": text })
        } else {
            serde_json::json!({ "ssml": wrap_ssml(text) })
        };

        let mut audio_config = serde_json::json!({
            "audioEncoding": "LINEAR16",
            "sampleRateHertz": PROVIDER_SAMPLE_RATE,
        });
        if let Some(rate) = profile.rate {
            audio_config["speakingRate"] = (rate * variation.rate_factor.unwrap_or(1.0)).into();
        }
        if let Some(pitch) = profile.pitch {
            audio_config["pitch"] = (pitch + variation.pitch_offset.unwrap_or(0.0)).into();
        }

        serde_json::json!({
            "input": input,
            "voice": {
                "languageCode": profile.language_code,
                "name": profile.voice,
            },
            "audioConfig": audio_config,
        })
    }

    fn decode(&self, body: &[u8]) -> Result<PcmAudio, SynthesisError> {
        let provider = self.engine_name();
        let response: SynthesizeResponse =
            serde_json::from_slice(body).map_err(|e| SynthesisError::Response {
                provider: provider.to_string(),
                message: format!("failed to parse response: {}", e),
            })?;

        if response.audio_content.is_empty() {
            return Err(SynthesisError::EmptyAudio {
                provider: provider.to_string(),
            });
        }

        let bytes = STANDARD
            .decode(response.audio_content.as_bytes())
            .map_err(|e| SynthesisError::Response {
                provider: provider.to_string(),
                message: format!("audioContent is not valid base64: {}", e),
            })?;

        // LINEAR16 normally arrives with a WAV header; accept headerless PCM too
        if bytes.starts_with(b"RIFF") {
            PcmAudio::from_wav_bytes(&bytes).map_err(|source| SynthesisError::InvalidAudio {
                provider: provider.to_string(),
                source,
            })
        } else {
            Ok(PcmAudio::from_pcm16_le(&bytes, AudioSpec::mono(PROVIDER_SAMPLE_RATE)))
        }
    }
}

#[async_trait]
impl TtsEngine for GoogleTtsEngine {
    fn engine_name(&self) -> &str {
        "google"
    }

    fn preferred_assembly(&self) -> AssemblyMode {
        AssemblyMode::Overlay
    }

    async fn synthesize(&self, text: &str, role: Role) -> Result<SynthesizedAudio, SynthesisError> {
        self.synthesize_with(text, role, self.draw_variation(role)).await
    }

    /// Zero means "provider default" and is sent unchanged
    fn draw_variation(&self, role: Role) -> VoiceVariation {
        let profile = self.profile(role);
        let rate_factor = profile
            .rate
            .filter(|rate| *rate != 0.0)
            .map(|_| self.jitter.sample(self.bands.rate));
        let pitch_offset = profile
            .pitch
            .filter(|pitch| *pitch != 0.0)
            .map(|_| self.jitter.sample(self.bands.pitch));

        VoiceVariation {
            rate_factor,
            pitch_offset,
        }
    }

    async fn synthesize_with(
        &self,
        text: &str,
        role: Role,
        variation: VoiceVariation,
    ) -> Result<SynthesizedAudio, SynthesisError> {
        let body = self.request_body_with(text, role, variation);
        let request = self
            .client
            .post(format!("{}/v1/text:synthesize", self.api_url))
            .header("X-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body);

        let response = send(self.engine_name(), request).await?;
        let audio = self.decode(&response)?;
        SynthesizedAudio::from_pcm(self.engine_name(), &audio)
    }
}

fn wrap_ssml(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with("<speak") {
        trimmed.to_string()
    } else {
        format!("<speak>{}</speak>", trimmed)
    }
}
