//! Per-turn response pipeline
//!
//! Tokens stream from the generation engine into the [`SentenceSegmenter`];
//! each fragment is synthesized concurrently, and results pass through a
//! [`ReorderBuffer`] so they reach the client strictly in ordinal order.
//! Every release goes through the session's [`EpochGate`]; once the epoch
//! moves on, the run stops at its next step.

mod ordering;
mod segmenter;

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;

pub use ordering::ReorderBuffer;
pub use segmenter::{Segment, SentenceSegmenter};

use crate::Result;
use crate::generation::{GenerationClient, GenerationRequest};
use crate::protocol::{ServerMessage, encode_audio};
use crate::session::EpochGate;
use crate::synthesis::SynthesisClient;

/// How a pipeline run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Generation finished and every fragment was released or skipped
    Completed {
        /// Full response text
        text: String,
        /// Audio fragments delivered to the client
        delivered: u32,
    },
    /// The epoch advanced mid-run
    Cancelled,
    /// The generation stream failed
    Failed(String),
}

/// Runs one response per call; shared by all turns of a session
#[derive(Clone)]
pub struct ResponsePipeline {
    generator: Arc<dyn GenerationClient>,
    synthesis: Arc<SynthesisClient>,
    gate: Arc<EpochGate>,
    min_fragment_chars: usize,
}

async fn synthesize(synthesis: Arc<SynthesisClient>, segment: Segment) -> (Segment, Result<Bytes>) {
    let result = synthesis.synthesize(&segment.text).await;
    (segment, result)
}

impl ResponsePipeline {
    #[must_use]
    pub fn new(
        generator: Arc<dyn GenerationClient>,
        synthesis: Arc<SynthesisClient>,
        gate: Arc<EpochGate>,
        min_fragment_chars: usize,
    ) -> Self {
        Self {
            generator,
            synthesis,
            gate,
            min_fragment_chars,
        }
    }

    /// Generate, segment, synthesize and deliver one response under `epoch`
    pub async fn run(&self, epoch: u64, request: GenerationRequest) -> PipelineOutcome {
        let mut tokens = match self.generator.stream(request).await {
            Ok(tokens) => tokens,
            Err(e) => return PipelineOutcome::Failed(e.to_string()),
        };

        let mut segmenter = SentenceSegmenter::new(self.min_fragment_chars);
        let mut reorder = ReorderBuffer::new();
        let mut pending = FuturesUnordered::new();
        let mut full = String::new();
        let mut delivered = 0u32;
        let mut generating = true;

        loop {
            if self.gate.current() != epoch {
                tracing::debug!(epoch, "response run superseded");
                return PipelineOutcome::Cancelled;
            }

            tokio::select! {
                token = tokens.next(), if generating => match token {
                    Some(Ok(token)) => {
                        full.push_str(&token);
                        let thinking = ServerMessage::AiThinking {
                            chunk: token.clone(),
                            current: full.clone(),
                        };
                        if !self.gate.send_if_current(epoch, thinking) {
                            return PipelineOutcome::Cancelled;
                        }
                        for segment in segmenter.push(&token) {
                            tracing::debug!(ordinal = segment.ordinal, text = %segment.text, "fragment");
                            pending.push(synthesize(Arc::clone(&self.synthesis), segment));
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(epoch, error = %e, "generation stream failed");
                        return PipelineOutcome::Failed(e.to_string());
                    }
                    None => {
                        generating = false;
                        if let Some(segment) = segmenter.finish() {
                            tracing::debug!(ordinal = segment.ordinal, text = %segment.text, "final fragment");
                            pending.push(synthesize(Arc::clone(&self.synthesis), segment));
                        }
                        let complete = ServerMessage::AiResponseComplete {
                            text: full.trim().to_string(),
                        };
                        if !self.gate.send_if_current(epoch, complete) {
                            return PipelineOutcome::Cancelled;
                        }
                    }
                },
                Some((segment, result)) = pending.next(), if !pending.is_empty() => {
                    let ordinal = segment.ordinal;
                    let item = match result {
                        Ok(audio) => Some((segment.text, audio)),
                        Err(e) => {
                            tracing::warn!(ordinal, error = %e, "fragment synthesis failed, skipping");
                            None
                        }
                    };

                    for (ordinal, (text, audio)) in reorder.complete(ordinal, item) {
                        let chunk = ServerMessage::AiAudioChunk {
                            text,
                            audio: encode_audio(&audio),
                            ordinal,
                            is_first: delivered == 0,
                        };
                        if !self.gate.send_if_current(epoch, chunk) {
                            tracing::debug!(epoch, ordinal, "fragment discarded");
                            return PipelineOutcome::Cancelled;
                        }
                        delivered += 1;
                    }
                },
                else => break,
            }
        }

        tracing::info!(epoch, fragments = segmenter.emitted(), delivered, "response delivered");
        PipelineOutcome::Completed {
            text: full.trim().to_string(),
            delivered,
        }
    }
}
