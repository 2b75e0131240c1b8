//! Streaming text generation

pub mod openrouter;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::Result;
use crate::config::GenerationConfig;
use crate::prompt::build_system_prompt;
use crate::session::{Capabilities, HistoryEntry};

/// Incremental text tokens; the stream ends on completion
pub type TokenStream = BoxStream<'static, Result<String>>;

/// One chat turn sent to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

/// A complete generation request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl GenerationRequest {
    /// Build a request for a session: system prompt, then history in order
    #[must_use]
    pub fn for_session<'a>(
        history: impl IntoIterator<Item = &'a HistoryEntry>,
        capabilities: &Capabilities,
        config: &GenerationConfig,
    ) -> Self {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: build_system_prompt(&capabilities.persona),
        }];
        messages.extend(history.into_iter().map(|entry| ChatMessage {
            role: entry.role.as_str(),
            content: entry.text.clone(),
        }));

        let max_tokens = capabilities.word_limit.unwrap_or(if capabilities.is_mobile {
            config.max_tokens_mobile
        } else {
            config.max_tokens_desktop
        });

        Self {
            model: capabilities
                .model
                .clone()
                .unwrap_or_else(|| config.default_model.clone()),
            messages,
            temperature: config.temperature,
            max_tokens,
            presence_penalty: config.presence_penalty,
            frequency_penalty: config.frequency_penalty,
        }
    }
}

/// A streaming generation engine
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Start generating; tokens arrive on the returned stream
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started
    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream>;
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::prompt::PersonaSelector;
    use crate::session::Role;

    fn entry(role: Role, text: &str) -> HistoryEntry {
        HistoryEntry {
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn request_starts_with_system_prompt() {
        let history = [entry(Role::Assistant, "你好！"), entry(Role::User, "早晨")];
        let request = GenerationRequest::for_session(
            &history,
            &Capabilities::default(),
            &GenerationConfig::default(),
        );

        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[0].role, "system");
        assert_eq!(request.messages[2].role, "user");
        assert_eq!(request.messages[2].content, "早晨");
        assert_eq!(request.model, "openai/gpt-4o-mini");
        assert_eq!(request.max_tokens, 150);
    }

    #[test]
    fn token_limit_priority() {
        let config = GenerationConfig::default();
        let mobile = Capabilities {
            is_mobile: true,
            ..Capabilities::default()
        };
        assert_eq!(GenerationRequest::for_session([], &mobile, &config).max_tokens, 100);

        let custom = Capabilities {
            is_mobile: true,
            word_limit: Some(60),
            model: Some("anthropic/claude-3-haiku".to_string()),
            persona: PersonaSelector::default(),
        };
        let request = GenerationRequest::for_session([], &custom, &config);
        assert_eq!(request.max_tokens, 60);
        assert_eq!(request.model, "anthropic/claude-3-haiku");
    }
}
