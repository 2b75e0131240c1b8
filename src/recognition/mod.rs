//! Streaming speech recognition
//!
//! A [`RecognitionBackend`] opens raw channels to a recognition service; the
//! [`RecognitionAdapter`] wraps one channel with readiness, speech-start and
//! speech-end bookkeeping.

mod adapter;
pub mod deepgram;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use adapter::{EventSink, RecognitionAdapter};

use crate::Result;

/// Interim or final recognition result
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    /// In `[0, 1]`
    pub confidence: f32,
}

/// Event emitted by a [`RecognitionAdapter`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// The channel accepts audio
    Ready,
    Transcript(TranscriptEvent),
    /// First non-empty text after a quiet period
    SpeechStart,
    /// Hangover elapsed after a final transcript
    SpeechEnd { final_text: String },
    /// The channel failed and has stopped
    ///
    /// `recoverable` is `false` when reconnecting cannot help, such as a
    /// missing or rejected API key.
    Error { message: String, recoverable: bool },
}

/// An open recognition channel
pub struct RecognitionChannel {
    /// Raw PCM16LE mono audio, in ingestion order
    pub audio: mpsc::Sender<Bytes>,
    /// Results from the service; the channel closes when the stream ends
    pub transcripts: mpsc::Receiver<Result<TranscriptEvent>>,
}

/// Opens recognition channels
#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    /// Open a new streaming channel
    ///
    /// # Errors
    ///
    /// Returns error if the service cannot be reached
    async fn connect(&self) -> Result<RecognitionChannel>;
}
