//! Client ⇄ server wire protocol
//!
//! Every frame is a JSON text message tagged by `type`. Audio travels as
//! base64: PCM16LE mono upstream, encoded synthesis output downstream.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Message from the client to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Begin a conversation
    Start {
        /// Generation engine identifier
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        /// Client runs on a mobile device
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_mobile: Option<bool>,
        /// Custom personality text
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persona: Option<String>,
        /// Custom role/identity text
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        /// Maximum output tokens override
        #[serde(default, skip_serializing_if = "Option::is_none")]
        word_limit: Option<u32>,
    },
    /// Microphone audio chunk
    Audio { audio: String },
    /// End the conversation
    Stop,
    /// End the conversation and forget its history
    Reset,
    /// Client playback queue drained
    AiFinishedSpeaking,
    /// Client-side barge-in detected
    UserSpeaking,
    /// User muted after speaking
    UserFinishedSpeaking,
}

/// Message from the server to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted
    SessionStarted { session_id: String },
    /// Generation engine selection acknowledged
    ModelConfirmed { model: String },
    /// Greeting, delivered whole
    AiResponse { text: String, audio: String },
    /// Recognition channel ready for audio
    SttReady,
    /// Interim or final transcript
    Transcript {
        text: String,
        is_final: bool,
        confidence: f32,
    },
    /// User began speaking
    UserSpeechStart,
    /// User stopped speaking
    UserSpeechEnd { final_text: String },
    /// Partial generation text
    AiThinking { chunk: String, current: String },
    /// One synthesized fragment of the response
    AiAudioChunk {
        text: String,
        audio: String,
        ordinal: u32,
        is_first: bool,
    },
    /// Generation finished
    AiResponseComplete { text: String },
    /// Interruption: hard-stop local playback
    StopPlayback { reason: String },
    /// Conversation stopped
    Stopped,
    /// Conversation history cleared
    Reset,
    /// In-band failure notice
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl ServerMessage {
    /// Build an error message with no details
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            details: None,
        }
    }
}

/// Encode a binary payload for the wire
#[must_use]
pub fn encode_audio(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a binary payload from the wire
///
/// # Errors
///
/// Returns error if the payload is not valid base64
pub fn decode_audio(encoded: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(encoded)?)
}
