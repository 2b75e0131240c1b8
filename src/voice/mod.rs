//! Local audio devices for the client runtime
//!
//! Microphone capture and speaker playback of synthesized fragments.

mod capture;
mod playback;

pub use capture::{AudioCapture, FRAME_SAMPLES, SAMPLE_RATE, samples_to_wav};
pub use playback::{SpeakerPlayer, decode_mp3};
