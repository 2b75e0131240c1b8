//! TOML configuration file loading
//!
//! Supports `~/.config/duplex-voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct DuplexConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Speech recognition configuration
    #[serde(default)]
    pub recognition: RecognitionFileConfig,

    /// Text generation configuration
    #[serde(default)]
    pub generation: GenerationFileConfig,

    /// Speech synthesis configuration
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Session behavior
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Recognition reconnection policy
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub port: Option<u16>,
    pub static_dir: Option<String>,
}

/// Speech recognition configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecognitionFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub sample_rate: Option<u32>,
    pub locale: Option<String>,
    pub interim_results: Option<bool>,
    pub vocabulary: Option<Vec<String>>,
    pub vocabulary_boost: Option<f32>,
}

/// Text generation configuration
#[derive(Debug, Default, Deserialize)]
pub struct GenerationFileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens_desktop: Option<u32>,
    pub max_tokens_mobile: Option<u32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    /// "openai" or "elevenlabs"
    pub provider: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub cache_capacity: Option<usize>,
    pub max_cached_chars: Option<usize>,
    pub warmup_phrases: Option<Vec<String>>,
}

/// Session behavior
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    pub history_limit: Option<usize>,
    pub acceptance_threshold: Option<f32>,
    pub hangover_ms: Option<u64>,
    pub min_fragment_chars: Option<usize>,
    pub greeting: Option<String>,
    pub idle_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

/// Recognition reconnection policy
#[derive(Debug, Default, Deserialize)]
pub struct ReconnectFileConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openrouter: Option<String>,
    pub deepgram: Option<String>,
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `DuplexConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> DuplexConfigFile {
    config_file_path().map_or_else(DuplexConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Missing or unparsable files yield defaults; the failure is logged.
pub fn load_config_from(path: &Path) -> DuplexConfigFile {
    if !path.exists() {
        return DuplexConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                DuplexConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            DuplexConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/duplex-voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("duplex-voice").join("config.toml"))
}
