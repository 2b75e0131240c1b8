//! `OpenRouter` (OpenAI-compatible) chat completions over server-sent events

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{GenerationClient, GenerationRequest, TokenStream};
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

/// A parsed SSE `data:` payload
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Token(String),
    Done,
}

/// Splits a byte stream into SSE lines without breaking multi-byte characters
#[derive(Debug, Default)]
struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();

            if data == "[DONE]" {
                events.push(SseEvent::Done);
                continue;
            }

            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    if let Some(content) = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .filter(|c| !c.is_empty())
                    {
                        events.push(SseEvent::Token(content));
                    }
                }
                Err(e) => tracing::debug!(error = %e, "skipping unparsable stream chunk"),
            }
        }

        events
    }
}

/// `OpenRouter` chat completions client
pub struct OpenRouterClient {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl OpenRouterClient {
    /// Create a new client
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenRouter API key required for generation".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: SecretString::new(api_key.into()),
        })
    }
}

#[async_trait]
impl GenerationClient for OpenRouterClient {
    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream> {
        #[derive(serde::Serialize)]
        struct Body<'a> {
            #[serde(flatten)]
            request: &'a GenerationRequest,
            stream: bool,
        }

        tracing::debug!(model = %request.model, max_tokens = request.max_tokens, "starting generation");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(self.api_key.expose_secret())
            .header("X-Title", "duplex-voice")
            .json(&Body {
                request: &request,
                stream: true,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("generation error {status}: {body}")));
        }

        let state = (
            response.bytes_stream().boxed(),
            SseDecoder::default(),
            Vec::new(),
            false,
        );
        let tokens = futures::stream::unfold(
            state,
            |(mut bytes, mut decoder, mut ready, mut done)| async move {
                loop {
                    if !ready.is_empty() {
                        let token = ready.remove(0);
                        return Some((Ok(token), (bytes, decoder, ready, done)));
                    }
                    if done {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            for event in decoder.push(&chunk) {
                                match event {
                                    SseEvent::Token(token) => ready.push(token),
                                    SseEvent::Done => done = true,
                                }
                            }
                        }
                        Some(Err(e)) => {
                            done = true;
                            return Some((Err(Error::from(e)), (bytes, decoder, ready, done)));
                        }
                        None => done = true,
                    }
                }
            },
        );

        Ok(tokens.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tokens_and_done() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n",
        );
        assert_eq!(events, vec![SseEvent::Token("Hi".to_string()), SseEvent::Done]);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n";
        let bytes = line.as_bytes();
        // split inside the first CJK character
        let cut = line.find('你').unwrap() + 1;

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&bytes[..cut]).is_empty());
        assert_eq!(
            decoder.push(&bytes[cut..]),
            vec![SseEvent::Token("你好".to_string())]
        );
    }

    #[test]
    fn ignores_comments_and_empty_deltas() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(
            b": keep-alive\ndata: {\"choices\":[{\"delta\":{}}]}\ndata: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n",
        );
        assert!(events.is_empty());
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(OpenRouterClient::new("https://openrouter.ai/api/v1", "").is_err());
    }
}
