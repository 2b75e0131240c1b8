//! Conversation client: microphone in, agent voice out
//!
//! [`TalkClient`] holds the client-side rules (playback ordering, local
//! barge-in, and gating of microphone audio) without touching any device or
//! socket. [`talk`] wires it to the microphone, the speakers and a server
//! connection.

mod barge_in;
mod ingest;
mod playback;

use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub use barge_in::{
    BargeInDetector, DeviceProfile, GREETING_SPEECH_THRESHOLD, SILENCE_THRESHOLD,
    SPEECH_THRESHOLD, VadDecision, frame_level, to_pcm16,
};
pub use ingest::{IngestBuffer, MAX_BUFFER_SIZE};
pub use playback::{ERROR_RETRY, FRAGMENT_GAP, Fragment, PlaybackQueue, Player, QueueStep};

use crate::protocol::{ClientMessage, ServerMessage, decode_audio, encode_audio};
use crate::voice::{AudioCapture, SpeakerPlayer};
use crate::{Error, Result};

/// Client-side conversation state, independent of any I/O
pub struct TalkClient<P> {
    queue: PlaybackQueue<P>,
    vad: BargeInDetector,
    ingest: IngestBuffer,
    model: Option<String>,
    gap: Option<(Duration, u64)>,
}

impl<P: Player> TalkClient<P> {
    #[must_use]
    pub fn new(player: P, profile: DeviceProfile) -> Self {
        Self {
            queue: PlaybackQueue::new(player),
            vad: BargeInDetector::new(profile),
            ingest: IngestBuffer::new(),
            model: None,
            gap: None,
        }
    }

    /// Ask the server for a specific generation engine
    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Message opening a conversation; resets readiness for the new session
    pub fn start_message(&mut self) -> ClientMessage {
        self.ingest.restart();
        ClientMessage::Start {
            model: self.model.clone(),
            is_mobile: Some(self.vad.profile().is_mobile()),
            persona: None,
            role: None,
            word_limit: None,
        }
    }

    /// React to a server message received at `now`
    pub fn on_server(&mut self, message: ServerMessage, now: Instant) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        match message {
            ServerMessage::SessionStarted { session_id } => {
                tracing::info!(session_id = %session_id, "connected");
            }
            ServerMessage::ModelConfirmed { model } => tracing::info!(model = %model, "model confirmed"),
            ServerMessage::SttReady => {
                out.extend(self.ingest.mark_ready().into_iter().map(audio_message));
            }
            ServerMessage::AiResponse { text, audio } => {
                tracing::info!(text = %text, "agent");
                match decode_audio(&audio) {
                    Ok(bytes) if !bytes.is_empty() => {
                        let step = self.queue.enqueue(Fragment {
                            text,
                            audio: Bytes::from(bytes),
                            greeting: true,
                        });
                        self.apply(step, now, &mut out);
                    }
                    // Nothing to play, so nothing to wait for
                    Ok(_) => self.ingest.allow_streaming(),
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable greeting audio");
                        self.ingest.allow_streaming();
                    }
                }
            }
            ServerMessage::AiAudioChunk {
                text,
                audio,
                ordinal,
                ..
            } => match decode_audio(&audio) {
                Ok(bytes) => {
                    let step = self.queue.enqueue(Fragment {
                        text,
                        audio: Bytes::from(bytes),
                        greeting: false,
                    });
                    self.apply(step, now, &mut out);
                }
                Err(e) => tracing::warn!(ordinal, error = %e, "undecodable fragment audio"),
            },
            ServerMessage::StopPlayback { reason } => {
                tracing::info!(reason = %reason, "playback stopped by server");
                self.hard_stop(&mut out);
            }
            ServerMessage::Transcript {
                text,
                is_final: true,
                confidence,
            } => tracing::info!(text = %text, confidence, "you"),
            ServerMessage::Transcript { text, .. } => tracing::debug!(text = %text, "hearing"),
            ServerMessage::UserSpeechStart => tracing::debug!("speech started"),
            ServerMessage::UserSpeechEnd { final_text } => {
                tracing::debug!(text = %final_text, "speech ended");
            }
            ServerMessage::AiThinking { current, .. } => tracing::trace!(current = %current, "thinking"),
            ServerMessage::AiResponseComplete { text } => tracing::info!(text = %text, "agent"),
            ServerMessage::Stopped => tracing::info!("conversation stopped"),
            ServerMessage::Reset => tracing::info!("conversation reset"),
            ServerMessage::Error { message, details } => {
                tracing::warn!(message = %message, details = ?details, "server error");
            }
        }
        out
    }

    /// Process one microphone frame captured at `now`
    pub fn on_frame(&mut self, samples: &[f32], now: Instant) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        if self.vad.is_muted() {
            return out;
        }

        if self.vad.observe(frame_level(samples), now) == VadDecision::BargeIn {
            tracing::info!("interrupting agent");
            out.push(ClientMessage::UserSpeaking);
            self.hard_stop(&mut out);
        }

        let chunk = Bytes::from(to_pcm16(samples));
        out.extend(self.ingest.push(chunk).into_iter().map(audio_message));
        out
    }

    /// The player finished fragment `id`
    pub fn on_fragment_end(&mut self, id: u64, now: Instant) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        let step = self.queue.on_fragment_end(id);
        self.apply(step, now, &mut out);
        out
    }

    /// A gap timer from [`Self::take_gap`] elapsed
    pub fn on_gap_elapsed(&mut self, ticket: u64, now: Instant) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        let step = self.queue.play_next(ticket);
        self.apply(step, now, &mut out);
        out
    }

    /// Flip the microphone mute
    pub fn toggle_mute(&mut self) -> Vec<ClientMessage> {
        let muted = !self.vad.is_muted();
        tracing::info!(muted, "microphone");
        if self.vad.set_muted(muted) {
            vec![ClientMessage::UserFinishedSpeaking]
        } else {
            Vec::new()
        }
    }

    /// Pending gap timer, if the queue asked for one
    pub const fn take_gap(&mut self) -> Option<(Duration, u64)> {
        self.gap.take()
    }

    #[must_use]
    pub const fn queue(&self) -> &PlaybackQueue<P> {
        &self.queue
    }

    #[must_use]
    pub const fn detector(&self) -> &BargeInDetector {
        &self.vad
    }

    #[must_use]
    pub const fn ingest(&self) -> &IngestBuffer {
        &self.ingest
    }

    fn apply(&mut self, step: QueueStep, now: Instant, out: &mut Vec<ClientMessage>) {
        match step {
            QueueStep::None => {}
            QueueStep::Started { greeting, .. } => self.vad.fragment_started(now, greeting),
            QueueStep::NextAfter { delay, ticket } => self.gap = Some((delay, ticket)),
            QueueStep::Drained => self.finished_speaking(out),
        }
    }

    fn hard_stop(&mut self, out: &mut Vec<ClientMessage>) {
        self.gap = None;
        if self.queue.hard_stop() {
            self.finished_speaking(out);
        } else {
            self.vad.playback_stopped();
        }
    }

    fn finished_speaking(&mut self, out: &mut Vec<ClientMessage>) {
        self.vad.playback_stopped();
        self.ingest.allow_streaming();
        out.push(ClientMessage::AiFinishedSpeaking);
    }
}

fn audio_message(chunk: Bytes) -> ClientMessage {
    ClientMessage::Audio {
        audio: encode_audio(&chunk),
    }
}

/// Talk to the server at `url` until Ctrl-C or disconnect
///
/// Pressing Enter toggles the microphone mute.
///
/// # Errors
///
/// Returns error if the audio devices or the connection fail
#[allow(clippy::future_not_send)]
pub async fn talk(url: &str, profile: DeviceProfile, model: Option<String>) -> Result<()> {
    let (socket, _) = tokio_tungstenite::connect_async(url).await?;
    let (mut sink, mut stream) = socket.split();
    tracing::info!(url, mobile = profile.is_mobile(), "connected to server");

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();

    let player = SpeakerPlayer::new(ended_tx)?;
    let mut capture = AudioCapture::new()?.with_frames(frames_tx);
    capture.start()?;

    let mut client = TalkClient::new(player, profile).with_model(model);
    send(&mut sink, &client.start_message()).await?;

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut gap: Option<(tokio::time::Instant, u64)> = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let deadline = gap.map_or_else(tokio::time::Instant::now, |(at, _)| at);
        let out = tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => client.on_server(message, Instant::now()),
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed server message");
                        Vec::new()
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("server closed the connection");
                    break;
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => return Err(e.into()),
            },
            Some(samples) = frames_rx.recv() => client.on_frame(&samples, Instant::now()),
            Some(id) = ended_rx.recv() => client.on_fragment_end(id, Instant::now()),
            () = tokio::time::sleep_until(deadline), if gap.is_some() => {
                match gap.take() {
                    Some((_, ticket)) => client.on_gap_elapsed(ticket, Instant::now()),
                    None => Vec::new(),
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(_)) => client.toggle_mute(),
                Ok(None) | Err(_) => {
                    stdin_open = false;
                    Vec::new()
                }
            },
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "failed to listen for ctrl-c");
                }
                send(&mut sink, &ClientMessage::Stop).await?;
                break;
            }
        };

        if let Some((delay, ticket)) = client.take_gap() {
            gap = Some((tokio::time::Instant::now() + delay, ticket));
        }
        for message in &out {
            send(&mut sink, message).await?;
        }
    }

    capture.stop();
    let _ = sink.close().await;
    Ok(())
}

async fn send<S>(sink: &mut S, message: &ClientMessage) -> Result<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message)?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(Error::from)
}
