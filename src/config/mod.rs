//! Configuration management for the duplex voice gateway
//!
//! Defaults, overlaid by the TOML file, overlaid by environment variables.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::retry::RetryPolicy;
use file::DuplexConfigFile;

/// Default listen port
pub const DEFAULT_PORT: u16 = 3001;

/// Default generation engine
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// Greeting spoken when a conversation starts
const DEFAULT_GREETING: &str = "你好！我係你嘅AI助手，可以用廣東話同你傾偈。有咩可以幫到你？";

/// Spoken when a whole turn cannot proceed
const DEFAULT_APOLOGY: &str = "唔好意思，系統出咗啲問題，可唔可以再講一次？";

/// Phrases boosted during recognition
const DEFAULT_VOCABULARY: &[&str] = &[
    "你好", "喂", "早晨", "拜拜", "係咩", "點解", "唔該", "多謝", "唔好意思", "明白", "知道",
    "好嘅", "冇問題", "係啊", "唔係", "幫我", "想問", "可唔可以", "點樣", "邊度", "幾時",
];

/// Short replies synthesized into the cache at startup
const DEFAULT_WARMUP: &[&str] = &[
    "你好！", "有咩可以幫到你？", "明白晒！", "好嘅！", "冇問題！", "唔該！", "多謝！", "係呀。",
    "唔係喎。", "等陣。",
];

/// Gateway configuration
#[derive(Debug)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Speech recognition configuration
    pub recognition: RecognitionConfig,

    /// Text generation configuration
    pub generation: GenerationConfig,

    /// Speech synthesis configuration
    pub synthesis: SynthesisConfig,

    /// Session behavior
    pub session: SessionConfig,

    /// Recognition reconnection policy
    pub reconnect: RetryPolicy,

    /// API keys
    pub api_keys: ApiKeys,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Path to static files directory (web client)
    pub static_dir: Option<PathBuf>,
}

/// Recognition channel configuration
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    /// Streaming endpoint
    pub url: String,

    /// Recognition model
    pub model: String,

    /// PCM sample rate in Hz
    pub sample_rate: u32,

    /// Language/locale code
    pub locale: String,

    /// Emit interim results
    pub interim_results: bool,

    /// Domain phrases to bias recognition toward
    pub vocabulary: Vec<String>,

    /// Bias strength for `vocabulary`
    pub vocabulary_boost: f32,
}

/// Generation parameters
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// OpenAI-compatible API base URL
    pub base_url: String,

    /// Engine used when the client does not select one
    pub default_model: String,

    /// Sampling temperature
    pub temperature: f32,

    /// Output token limit on desktop clients
    pub max_tokens_desktop: u32,

    /// Output token limit on mobile clients
    pub max_tokens_mobile: u32,

    /// Presence penalty
    pub presence_penalty: f32,

    /// Frequency penalty
    pub frequency_penalty: f32,
}

/// Synthesis backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisProvider {
    OpenAi,
    ElevenLabs,
}

/// Synthesis configuration
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Backend
    pub provider: SynthesisProvider,

    /// Model identifier
    pub model: String,

    /// Voice identifier
    pub voice: String,

    /// Speed multiplier
    pub speed: f32,

    /// Maximum number of cached fragments
    pub cache_capacity: usize,

    /// Fragments longer than this (in chars) are never cached
    pub max_cached_chars: usize,

    /// Phrases synthesized at startup
    pub warmup_phrases: Vec<String>,
}

/// Session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Conversation history cap
    pub history_limit: usize,

    /// Final transcripts at or below this confidence are ignored
    pub acceptance_threshold: f32,

    /// Silence after a final transcript before speech-end
    pub hangover: Duration,

    /// Fragments must be longer than this many chars to be synthesized alone
    pub min_fragment_chars: usize,

    /// Greeting spoken at start
    pub greeting: String,

    /// In-band message when a turn fails
    pub apology: String,

    /// Sessions idle longer than this are evicted
    pub idle_timeout: Duration,

    /// How often the registry sweeps idle sessions
    pub sweep_interval: Duration,
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    /// `OpenRouter` key (generation)
    pub openrouter: Option<SecretString>,

    /// `Deepgram` key (recognition)
    pub deepgram: Option<SecretString>,

    /// `OpenAI` key (synthesis)
    pub openai: Option<SecretString>,

    /// `ElevenLabs` key (synthesis)
    pub elevenlabs: Option<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            static_dir: None,
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.deepgram.com/v1/listen".to_string(),
            model: "nova-2".to_string(),
            sample_rate: 16_000,
            locale: "zh-HK".to_string(),
            interim_results: true,
            vocabulary: DEFAULT_VOCABULARY.iter().map(ToString::to_string).collect(),
            vocabulary_boost: 30.0,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            temperature: 0.8,
            max_tokens_desktop: 150,
            max_tokens_mobile: 100,
            presence_penalty: 0.4,
            frequency_penalty: 0.4,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: SynthesisProvider::OpenAi,
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            speed: 1.0,
            cache_capacity: 256,
            max_cached_chars: 30,
            warmup_phrases: DEFAULT_WARMUP.iter().map(ToString::to_string).collect(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            acceptance_threshold: 0.5,
            hangover: Duration::from_millis(500),
            min_fragment_chars: 3,
            greeting: DEFAULT_GREETING.to_string(),
            apology: DEFAULT_APOLOGY.to_string(),
            idle_timeout: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(30 * 60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            recognition: RecognitionConfig::default(),
            generation: GenerationConfig::default(),
            synthesis: SynthesisConfig::default(),
            session: SessionConfig::default(),
            reconnect: RetryPolicy::default(),
            api_keys: ApiKeys::default(),
        }
    }
}

impl Config {
    /// Load configuration from the standard config file and environment
    #[must_use]
    pub fn load() -> Self {
        let mut config = Self::from_file(file::load_config_file());
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Build configuration from a parsed config file overlay
    #[must_use]
    pub fn from_file(file: DuplexConfigFile) -> Self {
        let mut config = Self::default();

        let server = file.server;
        if let Some(port) = server.port {
            config.server.port = port;
        }
        if let Some(dir) = server.static_dir {
            config.server.static_dir = Some(PathBuf::from(dir));
        }

        let rec = file.recognition;
        let r = &mut config.recognition;
        overlay(&mut r.url, rec.url);
        overlay(&mut r.model, rec.model);
        overlay(&mut r.sample_rate, rec.sample_rate);
        overlay(&mut r.locale, rec.locale);
        overlay(&mut r.interim_results, rec.interim_results);
        overlay(&mut r.vocabulary, rec.vocabulary);
        overlay(&mut r.vocabulary_boost, rec.vocabulary_boost);

        let generation = file.generation;
        let g = &mut config.generation;
        overlay(&mut g.base_url, generation.base_url);
        overlay(&mut g.default_model, generation.model);
        overlay(&mut g.temperature, generation.temperature);
        overlay(&mut g.max_tokens_desktop, generation.max_tokens_desktop);
        overlay(&mut g.max_tokens_mobile, generation.max_tokens_mobile);
        overlay(&mut g.presence_penalty, generation.presence_penalty);
        overlay(&mut g.frequency_penalty, generation.frequency_penalty);

        let synthesis = file.synthesis;
        let s = &mut config.synthesis;
        if let Some(provider) = synthesis.provider.as_deref() {
            match parse_provider(provider) {
                Some(p) => s.provider = p,
                None => tracing::warn!(provider, "unknown synthesis provider, keeping default"),
            }
        }
        overlay(&mut s.model, synthesis.model);
        overlay(&mut s.voice, synthesis.voice);
        overlay(&mut s.speed, synthesis.speed);
        overlay(&mut s.cache_capacity, synthesis.cache_capacity);
        overlay(&mut s.max_cached_chars, synthesis.max_cached_chars);
        overlay(&mut s.warmup_phrases, synthesis.warmup_phrases);

        let session = file.session;
        let c = &mut config.session;
        overlay(&mut c.history_limit, session.history_limit);
        overlay(&mut c.acceptance_threshold, session.acceptance_threshold);
        overlay(&mut c.hangover, session.hangover_ms.map(Duration::from_millis));
        overlay(&mut c.min_fragment_chars, session.min_fragment_chars);
        overlay(&mut c.greeting, session.greeting);
        overlay(&mut c.idle_timeout, session.idle_timeout_secs.map(Duration::from_secs));
        overlay(&mut c.sweep_interval, session.sweep_interval_secs.map(Duration::from_secs));

        let reconnect = file.reconnect;
        overlay(&mut config.reconnect.max_retries, reconnect.max_attempts);
        overlay(
            &mut config.reconnect.base_delay,
            reconnect.base_delay_ms.map(Duration::from_millis),
        );
        overlay(
            &mut config.reconnect.max_delay,
            reconnect.max_delay_ms.map(Duration::from_millis),
        );

        let keys = file.api_keys;
        config.api_keys = ApiKeys {
            openrouter: keys.openrouter.map(secret),
            deepgram: keys.deepgram.map(secret),
            openai: keys.openai.map(secret),
            elevenlabs: keys.elevenlabs.map(secret),
        };

        config
    }

    /// Overlay environment variables read through `var`
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(model) = var("OPENROUTER_MODEL") {
            self.generation.default_model = model;
        }
        if let Some(provider) = var("DUPLEX_TTS_PROVIDER").as_deref().and_then(parse_provider) {
            self.synthesis.provider = provider;
        }

        let keys = &mut self.api_keys;
        for (slot, name) in [
            (&mut keys.openrouter, "OPENROUTER_API_KEY"),
            (&mut keys.deepgram, "DEEPGRAM_API_KEY"),
            (&mut keys.openai, "OPENAI_API_KEY"),
            (&mut keys.elevenlabs, "ELEVENLABS_API_KEY"),
        ] {
            if let Some(value) = var(name).filter(|v| !v.is_empty()) {
                *slot = Some(secret(value));
            }
        }
    }
}

fn overlay<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn secret(value: String) -> SecretString {
    SecretString::new(value.into())
}

fn parse_provider(name: &str) -> Option<SynthesisProvider> {
    match name.to_ascii_lowercase().as_str() {
        "openai" => Some(SynthesisProvider::OpenAi),
        "elevenlabs" => Some(SynthesisProvider::ElevenLabs),
        _ => None,
    }
}
