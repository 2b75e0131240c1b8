//! Deepgram live transcription over WebSocket

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

use super::{RecognitionBackend, RecognitionChannel, TranscriptEvent};
use crate::config::RecognitionConfig;
use crate::{Error, Result};

/// The service closes idle streams; keep it alive while audio is withheld
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
const KEEP_ALIVE: &str = r#"{"type":"KeepAlive"}"#;
const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

#[derive(Debug, Deserialize)]
struct LiveResponse {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    is_final: bool,
    channel: Option<LiveChannel>,
}

#[derive(Debug, Deserialize)]
struct LiveChannel {
    alternatives: Vec<LiveAlternative>,
}

#[derive(Debug, Deserialize)]
struct LiveAlternative {
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

/// Parse one text frame; `None` for metadata and other non-result frames
fn parse_frame(text: &str) -> Result<Option<TranscriptEvent>> {
    let response: LiveResponse = serde_json::from_str(text)?;
    if response.kind != "Results" {
        return Ok(None);
    }
    let Some(alt) = response
        .channel
        .and_then(|c| c.alternatives.into_iter().next())
    else {
        return Ok(None);
    };

    Ok(Some(TranscriptEvent {
        text: alt.transcript,
        is_final: response.is_final,
        confidence: alt.confidence.clamp(0.0, 1.0),
    }))
}

/// Deepgram streaming recognition backend
pub struct DeepgramRecognizer {
    config: RecognitionConfig,
    api_key: SecretString,
}

impl DeepgramRecognizer {
    /// Create a new Deepgram backend
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(config: RecognitionConfig, api_key: &str) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required for recognition".to_string()));
        }
        Ok(Self {
            config,
            api_key: SecretString::new(api_key.into()),
        })
    }

    /// Streaming endpoint with encoding, locale and vocabulary bias
    ///
    /// # Errors
    ///
    /// Returns error if the configured URL is invalid
    pub fn endpoint(&self) -> Result<url::Url> {
        let c = &self.config;
        let mut url = url::Url::parse(&c.url)
            .map_err(|e| Error::Config(format!("invalid recognition url {}: {e}", c.url)))?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("model", &c.model)
                .append_pair("encoding", "linear16")
                .append_pair("channels", "1")
                .append_pair("sample_rate", &c.sample_rate.to_string())
                .append_pair("language", &c.locale)
                .append_pair("interim_results", &c.interim_results.to_string())
                .append_pair("punctuate", "true");
            for phrase in &c.vocabulary {
                query.append_pair("keywords", &format!("{phrase}:{}", c.vocabulary_boost));
            }
        }

        Ok(url)
    }
}

#[async_trait]
impl RecognitionBackend for DeepgramRecognizer {
    async fn connect(&self) -> Result<RecognitionChannel> {
        let mut request = self.endpoint()?.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key.expose_secret()))
            .map_err(|e| Error::Config(format!("invalid Deepgram API key: {e}")))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut writer, mut reader) = ws.split();
        tracing::info!(locale = %self.config.locale, "recognition stream connected");

        let (audio, mut audio_rx) = mpsc::channel::<Bytes>(64);
        let (transcripts_tx, transcripts) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
            keep_alive.tick().await;

            loop {
                let frame = tokio::select! {
                    chunk = audio_rx.recv() => match chunk {
                        Some(chunk) => {
                            keep_alive.reset();
                            Message::Binary(chunk)
                        }
                        None => {
                            let _ = writer.send(Message::Text(CLOSE_STREAM.into())).await;
                            break;
                        }
                    },
                    _ = keep_alive.tick() => Message::Text(KEEP_ALIVE.into()),
                };

                if let Err(e) = writer.send(frame).await {
                    tracing::warn!(error = %e, "recognition write failed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => match parse_frame(&text) {
                        Ok(Some(event)) => Ok(event),
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::debug!(error = %e, "unparsable recognition frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(?frame, "recognition stream closed by server");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => Err(Error::from(e)),
                };

                let failed = event.is_err();
                if transcripts_tx.send(event).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(RecognitionChannel { audio, transcripts })
    }
}
