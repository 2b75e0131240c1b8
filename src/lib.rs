//! Duplex Voice - full-duplex spoken conversation gateway
//!
//! This library provides both halves of a spoken conversation with barge-in:
//! - A server that streams recognition, generation and synthesis per session
//! - A client runtime with local voice activity detection and ordered playback
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Client                           │
//! │  Microphone │ Barge-in VAD │ Ingest │ Playback Queue │
//! └────────────────────┬────────────────────────────────┘
//!                      │ WebSocket (JSON, base64 audio)
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Session Machine                      │
//! │  Turn state │ Epoch gate │ History │ Registry        │
//! └──────┬──────────────────┬───────────────────┬───────┘
//!        │                  │                   │
//! ┌──────▼──────┐   ┌───────▼────────┐   ┌──────▼──────┐
//! │ Recognition │   │   Generation   │   │  Synthesis  │
//! │  (Deepgram) │   │  (OpenRouter)  │   │ (TTS+cache) │
//! └─────────────┘   └────────────────┘   └─────────────┘
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod generation;
pub mod pipeline;
pub mod prompt;
pub mod protocol;
pub mod recognition;
pub mod retry;
pub mod session;
pub mod synthesis;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{SessionMachine, SessionRegistry};
