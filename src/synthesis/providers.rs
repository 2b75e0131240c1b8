//! Hosted synthesis backends

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};

use super::{SpeechSynthesizer, VoiceSelector};
use crate::config::{ApiKeys, SynthesisConfig, SynthesisProvider};
use crate::{Error, Result};

const OPENAI_SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";
const ELEVENLABS_TTS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";

/// `OpenAI` speech endpoint
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl OpenAiSynthesizer {
    /// Create a new `OpenAI` synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: &str, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for synthesis".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::new(api_key.into()),
            model,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceSelector) -> Result<Bytes> {
        #[derive(serde::Serialize)]
        struct SpeechRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &voice.voice,
            speed: voice.speed,
            response_format: "mp3",
        };

        let response = self
            .client
            .post(OPENAI_SPEECH_URL)
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("OpenAI speech error {status}: {body}")));
        }

        Ok(response.bytes().await?)
    }
}

/// `ElevenLabs` text-to-speech endpoint
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl ElevenLabsSynthesizer {
    /// Create a new `ElevenLabs` synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(api_key: &str, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for synthesis".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::new(api_key.into()),
            model,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceSelector) -> Result<Bytes> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("{ELEVENLABS_TTS_URL}/{}", voice.voice);
        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("ElevenLabs error {status}: {body}")));
        }

        Ok(response.bytes().await?)
    }
}

/// Build the configured synthesis backend
///
/// # Errors
///
/// Returns error if the provider's API key is missing
pub fn from_config(
    config: &SynthesisConfig,
    keys: &ApiKeys,
) -> Result<std::sync::Arc<dyn SpeechSynthesizer>> {
    let key = |slot: &Option<SecretString>| {
        slot.as_ref()
            .map(|k| k.expose_secret().to_string())
            .unwrap_or_default()
    };

    Ok(match config.provider {
        SynthesisProvider::OpenAi => std::sync::Arc::new(OpenAiSynthesizer::new(
            &key(&keys.openai),
            config.model.clone(),
        )?),
        SynthesisProvider::ElevenLabs => std::sync::Arc::new(ElevenLabsSynthesizer::new(
            &key(&keys.elevenlabs),
            config.model.clone(),
        )?),
    })
}
