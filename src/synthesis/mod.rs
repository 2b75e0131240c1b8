//! Speech synthesis
//!
//! [`SynthesisClient`] fronts a hosted backend with a small cache of short,
//! frequently repeated fragments.

mod cache;
pub mod providers;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use cache::{CacheStats, SynthesisCache};

use crate::Result;
use crate::config::SynthesisConfig;

/// Voice and rate used for a fragment
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSelector {
    pub voice: String,
    pub speed: f32,
}

/// A synthesis backend: text in, encoded audio (MP3) out
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize one fragment
    ///
    /// # Errors
    ///
    /// Returns error if the backend call fails
    async fn synthesize(&self, text: &str, voice: &VoiceSelector) -> Result<Bytes>;
}

/// Cached synthesis client shared by every session
pub struct SynthesisClient {
    backend: Arc<dyn SpeechSynthesizer>,
    voice: VoiceSelector,
    cache: SynthesisCache,
}

impl SynthesisClient {
    /// Create a client over `backend` using the configured voice and cache bounds
    #[must_use]
    pub fn new(backend: Arc<dyn SpeechSynthesizer>, config: &SynthesisConfig) -> Self {
        Self {
            backend,
            voice: VoiceSelector {
                voice: config.voice.clone(),
                speed: config.speed,
            },
            cache: SynthesisCache::new(config.cache_capacity, config.max_cached_chars),
        }
    }

    /// Synthesize `text`, serving short fragments from the cache
    ///
    /// # Errors
    ///
    /// Returns error if the backend call fails
    pub async fn synthesize(&self, text: &str) -> Result<Bytes> {
        let cacheable = self.cache.admits(text);
        if cacheable && let Some(audio) = self.cache.get(text).await {
            tracing::debug!(text, "synthesis cache hit");
            return Ok(audio);
        }

        let audio = self.backend.synthesize(text, &self.voice).await?;
        if cacheable {
            self.cache.put(text, audio.clone()).await;
        }
        Ok(audio)
    }

    /// Pre-synthesize `phrases` into the cache; returns how many succeeded
    pub async fn warm_up(&self, phrases: &[String]) -> usize {
        let mut warmed = 0;
        for phrase in phrases {
            match self.synthesize(phrase).await {
                Ok(_) => warmed += 1,
                Err(e) => tracing::warn!(phrase, error = %e, "cache warm-up failed"),
            }
        }
        tracing::info!(warmed, total = phrases.len(), "synthesis cache warmed");
        warmed
    }

    /// Cache counters
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }
}
