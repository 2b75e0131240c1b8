//! Microphone chunk gating ahead of the recognition channel

use std::collections::VecDeque;

use bytes::Bytes;

/// Chunks held while waiting for `stt_ready`
pub const MAX_BUFFER_SIZE: usize = 50;

/// Decides which microphone chunks reach the server
///
/// Nothing is streamed until the agent's first playback has drained, so the
/// greeting cannot feed back into recognition. After that, chunks captured
/// before the server reports `stt_ready` wait in a bounded ring that drops
/// the oldest chunk on overflow and is flushed in order once ready.
#[derive(Debug, Default)]
pub struct IngestBuffer {
    pending: VecDeque<Bytes>,
    ready: bool,
    streaming: bool,
    dropped: u64,
}

impl IngestBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a chunk; returns the chunks to send now
    pub fn push(&mut self, chunk: Bytes) -> Vec<Bytes> {
        if !self.streaming {
            return Vec::new();
        }
        if self.ready {
            return vec![chunk];
        }

        self.pending.push_back(chunk);
        if self.pending.len() > MAX_BUFFER_SIZE {
            self.pending.pop_front();
            self.dropped += 1;
        }
        Vec::new()
    }

    /// Recognition is ready; returns everything buffered, oldest first
    pub fn mark_ready(&mut self) -> Vec<Bytes> {
        self.ready = true;
        if !self.pending.is_empty() {
            tracing::debug!(chunks = self.pending.len(), dropped = self.dropped, "flushing buffered audio");
        }
        self.pending.drain(..).collect()
    }

    /// Agent playback drained; the microphone may stream from now on
    pub fn allow_streaming(&mut self) {
        if !self.streaming {
            tracing::debug!("microphone streaming enabled");
        }
        self.streaming = true;
    }

    /// Forget readiness and buffered audio for a new conversation
    pub fn restart(&mut self) {
        self.pending.clear();
        self.ready = false;
        self.streaming = false;
        self.dropped = 0;
    }

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}
