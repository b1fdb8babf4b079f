use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::Deserialize;

use crate::audio_mixer::{AssemblyMode, AudioMetadata, ExportFormat, ExportSettings, Mp3Bitrate};
use crate::error::ConfigError;
use crate::jitter::Band;
use crate::markup::DEFAULT_PRESERVED_TAGS;
use crate::transcript_parser::Role;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "MOFA_DIALOGUE_CONFIG";

/// Config file used when neither the CLI nor the environment names one
pub const DEFAULT_CONFIG_FILE: &str = "mofa_dialogue.toml";

/// Main configuration structure for the dialogue pipeline.
///
/// Loaded from a TOML/YAML/JSON file and `MOFA_DIALOGUE_`-prefixed
/// environment variables (`__` separates nested keys, e.g.
/// `MOFA_DIALOGUE_OPENAI__API_KEY`).
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub audio_format: ExportFormat,
    #[serde(default)]
    pub mp3_bitrate: Mp3Bitrate,
    #[serde(default)]
    pub metadata: AudioMetadata,
    #[serde(default = "default_temp_audio_dir")]
    pub temp_audio_dir: PathBuf,
    #[serde(default = "default_ending_message")]
    pub ending_message: String,
    #[serde(default = "default_preserved_tags")]
    pub preserved_tags: Vec<String>,
    #[serde(default)]
    pub assembly: AssemblySelection,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Fixes every random draw (prosody jitter, overlap) when set
    pub seed: Option<u64>,
    /// Fail instead of clamping when overlap leaves negative silence
    #[serde(default)]
    pub strict_overlap: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub jitter: JitterConfig,
    pub openai: Option<OpenaiConfig>,
    pub elevenlabs: Option<ElevenlabsConfig>,
    pub google: Option<GoogleConfig>,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_temp_audio_dir() -> PathBuf {
    PathBuf::from("data/audio/tmp/")
}

fn default_ending_message() -> String {
    "Bye Bye!".to_string()
}

fn default_preserved_tags() -> Vec<String> {
    DEFAULT_PRESERVED_TAGS.iter().map(|t| t.to_string()).collect()
}

fn default_request_timeout() -> u64 { 60 }

fn default_max_concurrent_requests() -> usize { 4 }

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// SELECTIONS
// ============================================================================

/// Which backend synthesizes speech
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Openai,
    Elevenlabs,
    Google,
    /// Offline tone generator
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Elevenlabs => "elevenlabs",
            ProviderKind::Google => "google",
            ProviderKind::Mock => "mock",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::Openai),
            "elevenlabs" => Ok(ProviderKind::Elevenlabs),
            "google" => Ok(ProviderKind::Google),
            "mock" => Ok(ProviderKind::Mock),
            _ => Err(ConfigError::UnknownProvider(s.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assembly mode requested by the user; `Auto` defers to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblySelection {
    #[default]
    Auto,
    Sequential,
    Overlay,
}

impl AssemblySelection {
    pub fn resolve(self, preferred: AssemblyMode) -> AssemblyMode {
        match self {
            AssemblySelection::Auto => preferred,
            AssemblySelection::Sequential => AssemblyMode::Sequential,
            AssemblySelection::Overlay => AssemblyMode::Overlay,
        }
    }
}

impl FromStr for AssemblySelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(AssemblySelection::Auto),
            "sequential" => Ok(AssemblySelection::Sequential),
            "overlay" => Ok(AssemblySelection::Overlay),
            other => Err(format!("unknown assembly mode '{}'", other)),
        }
    }
}

/// One value per speaker; `question`/`answer` are accepted as aliases
#[derive(Clone, Debug, Deserialize)]
pub struct RoleVoices<T> {
    #[serde(alias = "question")]
    pub person1: T,
    #[serde(alias = "answer")]
    pub person2: T,
}

impl<T> RoleVoices<T> {
    pub fn get(&self, role: Role) -> &T {
        match role {
            Role::Person1 => &self.person1,
            Role::Person2 => &self.person2,
        }
    }
}

/// Random bands for prosody jitter and conversational overlap
#[derive(Clone, Debug, Deserialize)]
pub struct JitterConfig {
    /// Multiplier applied to a configured speaking rate
    #[serde(default = "default_rate_band")]
    pub rate: Band,
    /// Semitones added to a configured pitch
    #[serde(default = "default_pitch_band")]
    pub pitch: Band,
    /// Seconds of overlap between consecutive clips in overlay mode
    #[serde(default = "default_overlap_band")]
    pub overlap: Band,
}

fn default_rate_band() -> Band {
    Band::new(0.95, 1.2)
}

fn default_pitch_band() -> Band {
    Band::new(-2.0, 2.0)
}

fn default_overlap_band() -> Band {
    Band::new(0.2, 0.4)
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            rate: default_rate_band(),
            pitch: default_pitch_band(),
            overlap: default_overlap_band(),
        }
    }
}

/// Longest overlap a band may ask for, in seconds
pub const MAX_OVERLAP_SECS: f64 = 10.0;

impl JitterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate.validate("rate")?;
        self.pitch.validate("pitch")?;
        self.overlap.validate("overlap")?;
        if self.overlap.min < 0.0 {
            return Err(ConfigError::NegativeOverlap(self.overlap.min));
        }
        if self.overlap.max > MAX_OVERLAP_SECS {
            return Err(ConfigError::OverlapTooLong(self.overlap.max));
        }
        Ok(())
    }
}

// ============================================================================
// PROVIDER SECTIONS
// ============================================================================

#[derive(Clone, Debug, Deserialize)]
pub struct OpenaiConfig {
    /// Literal key or `env:VAR`
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_url")]
    pub api_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_openai_voices")]
    pub default_voices: RoleVoices<String>,
}

fn default_openai_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_openai_model() -> String {
    "tts-1-hd".to_string()
}

fn default_openai_voices() -> RoleVoices<String> {
    RoleVoices {
        person1: "echo".to_string(),
        person2: "shimmer".to_string(),
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ElevenlabsConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_elevenlabs_url")]
    pub api_url: String,
    #[serde(default = "default_elevenlabs_model")]
    pub model: String,
    /// Voice IDs
    #[serde(default = "default_elevenlabs_voices")]
    pub default_voices: RoleVoices<String>,
}

fn default_elevenlabs_url() -> String {
    "https://api.elevenlabs.io".to_string()
}

fn default_elevenlabs_model() -> String {
    "eleven_multilingual_v2".to_string()
}

fn default_elevenlabs_voices() -> RoleVoices<String> {
    // Premade "Chris" and "Jessica"
    RoleVoices {
        person1: "iP95p4xoKVk53GoZ742B".to_string(),
        person2: "cgSgspJ2msm6clMCkdW9".to_string(),
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GoogleConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_google_url")]
    pub api_url: String,
    #[serde(default = "default_language_code")]
    pub language_code: String,
    #[serde(default = "default_google_voices")]
    pub default_voices: RoleVoices<GoogleVoiceConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GoogleVoiceConfig {
    pub voice: String,
    /// Overrides the section-level language code
    pub language_code: Option<String>,
    pub rate: Option<f64>,
    pub pitch: Option<f64>,
    /// Force plain-text (`true`) or SSML (`false`) input for this voice
    pub plain_text: Option<bool>,
}

impl GoogleVoiceConfig {
    fn named(voice: &str) -> Self {
        Self {
            voice: voice.to_string(),
            language_code: None,
            rate: None,
            pitch: None,
            plain_text: None,
        }
    }
}

fn default_google_url() -> String {
    "https://texttospeech.googleapis.com".to_string()
}

fn default_language_code() -> String {
    "en-US".to_string()
}

fn default_google_voices() -> RoleVoices<GoogleVoiceConfig> {
    RoleVoices {
        person1: GoogleVoiceConfig::named("en-US-Journey-D"),
        person2: GoogleVoiceConfig::named("en-US-Journey-O"),
    }
}

// ============================================================================
// LOADING
// ============================================================================

impl Config {
    /// Load configuration.
    ///
    /// The file is `path` if given, else `MOFA_DIALOGUE_CONFIG`, else
    /// `mofa_dialogue.toml`. An explicitly named file must exist; the default
    /// file is optional. Supports TOML, YAML, and JSON based on extension.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var(CONFIG_PATH_ENV) {
                Ok(p) => (PathBuf::from(p), true),
                Err(_) => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
            },
        };

        let figment = if config_path.exists() {
            log::info!("Loading config from {}", config_path.display());
            match config_path.extension().and_then(|s| s.to_str()) {
                Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(&config_path)),
                Some("json") => Figment::new().merge(Json::file(&config_path)),
                _ => Figment::new().merge(Toml::file(&config_path)),
            }
        } else if explicit {
            return Err(ConfigError::NotFound(config_path));
        } else {
            log::debug!("No {} found, using defaults", config_path.display());
            Figment::new()
        };

        let config: Config = figment
            .merge(Env::prefixed("MOFA_DIALOGUE_").split("__"))
            .extract()?;
        config.validated()
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.provider_kind()?;
        self.jitter.validate()?;
        Ok(self)
    }

    pub fn provider_kind(&self) -> Result<ProviderKind, ConfigError> {
        self.provider.parse()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn export_settings(&self) -> ExportSettings {
        ExportSettings {
            format: self.audio_format,
            mp3_bitrate: self.mp3_bitrate,
            metadata: self.metadata.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            audio_format: ExportFormat::default(),
            mp3_bitrate: Mp3Bitrate::default(),
            metadata: AudioMetadata::default(),
            temp_audio_dir: default_temp_audio_dir(),
            ending_message: default_ending_message(),
            preserved_tags: default_preserved_tags(),
            assembly: AssemblySelection::default(),
            request_timeout_secs: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
            seed: None,
            strict_overlap: false,
            log_level: default_log_level(),
            jitter: JitterConfig::default(),
            openai: None,
            elevenlabs: None,
            google: None,
        }
    }
}

/// Helper to resolve environment variable references in configuration.
///
/// If value starts with "env:", looks up the environment variable.
/// Otherwise returns the value as-is.
///
/// # Example
/// * `"env:OPENAI_API_KEY"` -> Looks up OPENAI_API_KEY env var
/// * `"sk-..."` -> Returns the literal string
pub fn get_env_or_value(value: &str) -> String {
    if let Some(env_var) = value.strip_prefix("env:") {
        let result = std::env::var(env_var)
            .unwrap_or_else(|_| {
                log::warn!("Environment variable {} not found", env_var);
                String::new()
            })
            .trim()
            .to_string();

        if result.is_empty() {
            log::warn!("{} resolved to an empty string", env_var);
        } else {
            log::debug!("{} = {} (len={})", env_var, mask(&result), result.len());
        }
        result
    } else {
        value.trim().to_string()
    }
}

/// Resolve a credential, failing when it ends up empty
pub fn resolve_api_key(value: &str, provider: &'static str) -> Result<String, ConfigError> {
    let key = get_env_or_value(value);
    if key.is_empty() {
        return Err(ConfigError::MissingCredential(provider));
    }
    Ok(key)
}

fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "****".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.provider_kind().unwrap(), ProviderKind::Openai);
        assert_eq!(config.ending_message, "Bye Bye!");
        assert_eq!(config.preserved_tags, vec!["Person1", "Person2"]);
        assert_eq!(config.assembly, AssemblySelection::Auto);
        assert_eq!(config.jitter.overlap, Band::new(0.2, 0.4));
        assert_eq!(config.audio_format, ExportFormat::Wav);
        assert!(config.openai.is_none());
    }

    #[test]
    fn test_full_document() {
        let config = Config::from_toml_str(
            r#"
            provider = "google"
            audio_format = "mp3"
            mp3_bitrate = "320k"
            assembly = "sequential"
            seed = 42
            ending_message = "See you!"

            [metadata]
            title = "Episode 1"

            [jitter]
            overlap = { min = 0.1, max = 0.2 }

            [openai]
            api_key = "sk-test"
            model = "tts-1"

            [google]
            api_key = "g-key"
            language_code = "en-GB"

            [google.default_voices.question]
            voice = "en-GB-Neural2-B"
            rate = 1.1

            [google.default_voices.answer]
            voice = "en-GB-Journey-F"
            plain_text = false
            "#,
        )
        .unwrap();

        assert_eq!(config.provider_kind().unwrap(), ProviderKind::Google);
        assert_eq!(config.audio_format, ExportFormat::Mp3);
        assert_eq!(config.mp3_bitrate, Mp3Bitrate::Kbps320);
        assert_eq!(config.assembly, AssemblySelection::Sequential);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.metadata.title.as_deref(), Some("Episode 1"));
        assert_eq!(config.jitter.rate, Band::new(0.95, 1.2));
        assert_eq!(config.jitter.overlap, Band::new(0.1, 0.2));

        let openai = config.openai.unwrap();
        assert_eq!(openai.model, "tts-1");
        assert_eq!(openai.default_voices.get(Role::Person2), "shimmer");

        let google = config.google.unwrap();
        assert_eq!(google.default_voices.person1.voice, "en-GB-Neural2-B");
        assert_eq!(google.default_voices.person1.rate, Some(1.1));
        assert_eq!(google.default_voices.person2.plain_text, Some(false));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = Config::from_toml_str(r#"provider = "espeak""#).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider(p) if p == "espeak"));
    }

    #[test]
    fn test_rejects_inverted_band() {
        let err = Config::from_toml_str("[jitter]\nrate = { min = 1.5, max = 1.0 }").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBand { name: "rate", .. }));

        let err = Config::from_toml_str("[jitter]\noverlap = { min = -0.5, max = 0.1 }").unwrap_err();
        assert!(matches!(err, ConfigError::NegativeOverlap(_)));

        let err = Config::from_toml_str("[jitter]\noverlap = { min = 0.2, max = 1e300 }").unwrap_err();
        assert!(matches!(err, ConfigError::OverlapTooLong(_)));
    }

    #[test]
    fn test_rejects_bad_types() {
        assert!(matches!(
            Config::from_toml_str(r#"assembly = "sideways""#),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "provider = \"mock\"\nmax_concurrent_requests = 2").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.provider_kind().unwrap(), ProviderKind::Mock);
        assert_eq!(config.max_concurrent_requests, 2);
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"provider": "elevenlabs", "strict_overlap": true}}"#).unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.provider_kind().unwrap(), ProviderKind::Elevenlabs);
        assert!(config.strict_overlap);
    }

    #[test]
    fn test_bundled_sample_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("mofa_dialogue.toml");
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.provider_kind().unwrap(), ProviderKind::Openai);
        assert_eq!(config.openai.unwrap().api_key, "env:OPENAI_API_KEY");
        assert_eq!(
            config.google.unwrap().default_voices.person2.voice,
            "en-US-Journey-O"
        );
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_env_indirection() {
        std::env::set_var("MOFA_DIALOGUE_TEST_KEY", "  sk-from-env-1234  ");
        assert_eq!(get_env_or_value("env:MOFA_DIALOGUE_TEST_KEY"), "sk-from-env-1234");
        assert_eq!(get_env_or_value(" literal "), "literal");
        assert!(matches!(
            resolve_api_key("env:MOFA_DIALOGUE_TEST_UNSET_KEY", "openai"),
            Err(ConfigError::MissingCredential("openai"))
        ));
    }

    #[test]
    fn test_assembly_selection() {
        assert_eq!(
            AssemblySelection::Auto.resolve(AssemblyMode::Overlay),
            AssemblyMode::Overlay
        );
        assert_eq!(
            AssemblySelection::Sequential.resolve(AssemblyMode::Overlay),
            AssemblyMode::Sequential
        );
        assert_eq!("OVERLAY".parse::<AssemblySelection>(), Ok(AssemblySelection::Overlay));
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask("sk-1234567890"), "sk-1...7890");
        assert_eq!(mask("short"), "****");
    }
}
