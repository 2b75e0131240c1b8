//! Turn-taking state machine
//!
//! The machine is an actor: it owns the [`Session`] and is driven one
//! [`SessionEvent`] at a time. Network work (greeting synthesis, response
//! runs, reconnection delays) is spawned and reports back as further events,
//! so handling an event never waits on a network round-trip.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Capabilities, EpochGate, Role, Session, TurnState};
use crate::config::{GenerationConfig, SessionConfig};
use crate::generation::{GenerationClient, GenerationRequest};
use crate::pipeline::{PipelineOutcome, ResponsePipeline};
use crate::prompt::PersonaSelector;
use crate::protocol::{ClientMessage, ServerMessage, decode_audio, encode_audio};
use crate::recognition::{EventSink, RecognitionAdapter, RecognitionBackend, RecognitionEvent};
use crate::retry::{RetryPolicy, delay_for_attempt};
use crate::synthesis::SynthesisClient;
use crate::{Error, Result};

/// External collaborators and settings shared by all sessions
#[derive(Clone)]
pub struct Services {
    pub recognizer: Arc<dyn RecognitionBackend>,
    pub generator: Arc<dyn GenerationClient>,
    pub synthesis: Arc<SynthesisClient>,
    pub generation: GenerationConfig,
    pub session: SessionConfig,
    pub reconnect: RetryPolicy,
}

/// Input to a [`SessionMachine`]
#[derive(Debug)]
pub enum SessionEvent {
    /// Message from the client
    Client(ClientMessage),
    /// Greeting audio for conversation number `conversation`
    GreetingSynthesized {
        conversation: u64,
        result: Result<Bytes>,
    },
    /// Event from the recognition adapter opened as number `generation`
    Recognition {
        generation: u64,
        event: RecognitionEvent,
    },
    /// A response run stamped with `epoch` has ended
    PipelineFinished { epoch: u64, outcome: PipelineOutcome },
    /// Backoff elapsed; reopen recognition if adapter `generation` is still current
    Reconnect { generation: u64 },
    /// The connection closed
    Disconnected,
    /// The registry dropped the session for inactivity
    Evicted,
}

/// One conversation's state machine
pub struct SessionMachine {
    session: Session,
    services: Services,
    gate: Arc<EpochGate>,
    pipeline: ResponsePipeline,
    events: mpsc::UnboundedSender<SessionEvent>,
    recognizer: Option<RecognitionAdapter>,
    recognition_generation: u64,
    reconnect_attempts: u32,
    reconnect_pending: bool,
    recognition_disabled: bool,
    conversation: u64,
    active_run: Option<u64>,
    drained_at: Option<u64>,
}

impl SessionMachine {
    /// Create a machine that writes to `outbound` and posts its own follow-up
    /// work to `events`
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        services: Services,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let gate = Arc::new(EpochGate::new(outbound));
        let pipeline = ResponsePipeline::new(
            Arc::clone(&services.generator),
            Arc::clone(&services.synthesis),
            Arc::clone(&gate),
            services.session.min_fragment_chars,
        );

        Self {
            session: Session::new(id, services.session.history_limit),
            services,
            gate,
            pipeline,
            events,
            recognizer: None,
            recognition_generation: 0,
            reconnect_attempts: 0,
            reconnect_pending: false,
            recognition_disabled: false,
            conversation: 0,
            active_run: None,
            drained_at: None,
        }
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.session.state()
    }

    /// Current generation epoch
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.gate.current()
    }

    /// Whether a response run is in flight
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.active_run.is_some()
    }

    /// Process events until the session ends
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        tracing::info!(session_id = %self.session.id(), "session ended");
    }

    /// Apply one event; returns `false` once the session has ended
    pub fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Client(message) => {
                self.session.activity().touch();
                self.on_client(message);
            }
            SessionEvent::GreetingSynthesized {
                conversation,
                result,
            } => self.on_greeting(conversation, result),
            SessionEvent::Recognition { generation, event } => {
                if generation == self.recognition_generation {
                    self.on_recognition(event);
                }
            }
            SessionEvent::PipelineFinished { epoch, outcome } => self.on_pipeline_finished(epoch, outcome),
            SessionEvent::Reconnect { generation } => {
                if generation != self.recognition_generation {
                    return true;
                }
                self.reconnect_pending = false;
                if self.state() != TurnState::Idle {
                    tracing::info!(
                        session_id = %self.session.id(),
                        attempt = self.reconnect_attempts,
                        "reopening recognition"
                    );
                    self.open_recognition();
                }
            }
            SessionEvent::Disconnected => {
                self.shutdown();
                return false;
            }
            SessionEvent::Evicted => {
                tracing::info!(session_id = %self.session.id(), "closing idle session");
                self.shutdown();
                self.gate.send(ServerMessage::Error {
                    message: "session closed after inactivity".to_string(),
                    details: None,
                });
                return false;
            }
        }
        true
    }

    fn on_client(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Start {
                model,
                is_mobile,
                persona,
                role,
                word_limit,
            } => {
                if let Some(model) = &model {
                    self.gate.send(ServerMessage::ModelConfirmed {
                        model: model.clone(),
                    });
                }
                self.start(Capabilities {
                    is_mobile: is_mobile.unwrap_or(false),
                    model,
                    persona: PersonaSelector {
                        role,
                        personality: persona,
                    },
                    word_limit: word_limit.filter(|limit| *limit > 0),
                });
            }
            ClientMessage::Audio { audio } => self.on_audio(&audio),
            ClientMessage::Stop => self.stop(),
            ClientMessage::Reset => {
                self.stop();
                self.session.clear_history();
                self.gate.send(ServerMessage::Reset);
            }
            ClientMessage::AiFinishedSpeaking => match self.state() {
                TurnState::Speaking => self.session.transition(TurnState::Listening),
                TurnState::Processing => self.drained_at = Some(self.gate.delivered()),
                _ => {}
            },
            ClientMessage::UserSpeaking => {
                if self.state().is_responding() {
                    self.barge_in("interrupted");
                }
            }
            ClientMessage::UserFinishedSpeaking => {
                tracing::debug!(session_id = %self.session.id(), "user muted after speaking");
            }
        }
    }

    /// Begin a conversation: greet, then listen
    pub fn start(&mut self, capabilities: Capabilities) {
        if self.state() != TurnState::Idle {
            self.cancel_run();
            self.session.transition(TurnState::Idle);
        }

        tracing::info!(
            session_id = %self.session.id(),
            mobile = capabilities.is_mobile,
            model = ?capabilities.model,
            "starting conversation"
        );

        self.session.set_capabilities(capabilities);
        self.conversation += 1;
        self.reconnect_attempts = 0;
        self.recognition_disabled = false;
        self.session.transition(TurnState::Greeting);

        let greeting = self.services.session.greeting.clone();
        self.session.push_history(Role::Assistant, greeting.clone());

        let synthesis = Arc::clone(&self.services.synthesis);
        let events = self.events.clone();
        let conversation = self.conversation;
        tokio::spawn(async move {
            let result = synthesis.synthesize(&greeting).await;
            let _ = events.send(SessionEvent::GreetingSynthesized {
                conversation,
                result,
            });
        });

        self.ensure_recognition();
    }

    fn on_greeting(&mut self, conversation: u64, result: Result<Bytes>) {
        if conversation != self.conversation || self.state() != TurnState::Greeting {
            return;
        }

        let text = self.services.session.greeting.clone();
        match result {
            Ok(audio) => {
                self.gate.send(ServerMessage::AiResponse {
                    text,
                    audio: encode_audio(&audio),
                });
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session.id(), error = %e, "greeting synthesis failed");
                self.gate.send(ServerMessage::AiResponse {
                    text,
                    audio: String::new(),
                });
            }
        }
        self.session.transition(TurnState::Listening);
    }

    fn on_audio(&mut self, encoded: &str) {
        let chunk = match decode_audio(encoded) {
            Ok(chunk) => Bytes::from(chunk),
            Err(e) => {
                tracing::warn!(session_id = %self.session.id(), error = %e, "malformed audio chunk");
                self.gate.send(ServerMessage::Error {
                    message: "invalid audio payload".to_string(),
                    details: Some(e.to_string()),
                });
                return;
            }
        };

        if self.recognizer.is_none() {
            if self.state() == TurnState::Idle
                || self.reconnect_pending
                || self.recognition_disabled
            {
                tracing::debug!(session_id = %self.session.id(), "audio without recognition channel");
                return;
            }
            tracing::info!(session_id = %self.session.id(), "audio arrived, reopening recognition");
            self.reconnect_attempts = 0;
            self.open_recognition();
        }

        let Some(recognizer) = &self.recognizer else {
            return;
        };
        if let Err(Error::RecognitionClosed) = recognizer.send_audio(chunk.clone()) {
            tracing::warn!(session_id = %self.session.id(), "recognition stream closed, recreating");
            self.open_recognition();
            if let Some(recognizer) = &self.recognizer {
                let _ = recognizer.send_audio(chunk);
            }
        }
    }

    fn on_recognition(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Ready => {
                tracing::info!(session_id = %self.session.id(), "recognition ready");
                self.gate.send(ServerMessage::SttReady);
            }
            RecognitionEvent::SpeechStart => {
                if self.state().is_responding() {
                    self.barge_in("interrupted");
                }
                self.gate.send(ServerMessage::UserSpeechStart);
            }
            RecognitionEvent::Transcript(transcript) => {
                // a channel that delivers results has earned a fresh retry budget
                self.reconnect_attempts = 0;
                self.gate.send(ServerMessage::Transcript {
                    text: transcript.text.clone(),
                    is_final: transcript.is_final,
                    confidence: transcript.confidence,
                });
                if transcript.is_final
                    && transcript.confidence > self.services.session.acceptance_threshold
                    && !transcript.text.trim().is_empty()
                {
                    self.on_final_transcript(transcript.text.trim());
                }
            }
            RecognitionEvent::SpeechEnd { final_text } => {
                self.gate.send(ServerMessage::UserSpeechEnd { final_text });
            }
            RecognitionEvent::Error {
                message,
                recoverable,
            } => self.on_recognition_error(&message, recoverable),
        }
    }

    fn on_final_transcript(&mut self, text: &str) {
        if self.state() != TurnState::Listening || self.active_run.is_some() {
            tracing::debug!(
                session_id = %self.session.id(),
                state = ?self.state(),
                text,
                "final transcript dropped"
            );
            return;
        }

        tracing::info!(session_id = %self.session.id(), text, "user turn");
        self.session.push_history(Role::User, text);
        self.session.transition(TurnState::Processing);

        let epoch = self.gate.advance();
        self.active_run = Some(epoch);
        self.drained_at = None;

        let request = GenerationRequest::for_session(
            self.session.history(),
            self.session.capabilities(),
            &self.services.generation,
        );
        let pipeline = self.pipeline.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = pipeline.run(epoch, request).await;
            let _ = events.send(SessionEvent::PipelineFinished { epoch, outcome });
        });
    }

    fn on_pipeline_finished(&mut self, epoch: u64, outcome: PipelineOutcome) {
        if self.active_run != Some(epoch) {
            tracing::debug!(session_id = %self.session.id(), epoch, "stale run finished");
            return;
        }
        self.active_run = None;

        match outcome {
            PipelineOutcome::Completed { text, delivered } => {
                if !text.is_empty() {
                    self.session.push_history(Role::Assistant, text);
                }
                let drained = self.drained_at.take() == Some(self.gate.delivered());
                if delivered > 0 && !drained {
                    self.session.transition(TurnState::Speaking);
                } else {
                    self.session.transition(TurnState::Listening);
                }
            }
            PipelineOutcome::Cancelled => self.session.transition(TurnState::Listening),
            PipelineOutcome::Failed(details) => {
                tracing::warn!(session_id = %self.session.id(), error = %details, "response failed");
                self.gate.send(ServerMessage::Error {
                    message: self.services.session.apology.clone(),
                    details: Some(details),
                });
                self.session.transition(TurnState::Listening);
            }
        }
    }

    /// Cancel the response and hard-stop client playback
    fn barge_in(&mut self, reason: &str) {
        let epoch = self.gate.interrupt(reason);
        self.active_run = None;
        self.drained_at = None;
        tracing::info!(session_id = %self.session.id(), epoch, from = ?self.state(), "barge-in");
        self.session.transition(TurnState::Interrupted);
        self.session.transition(TurnState::Listening);
    }

    fn on_recognition_error(&mut self, message: &str, recoverable: bool) {
        tracing::warn!(session_id = %self.session.id(), error = message, recoverable, "recognition failed");
        if let Some(adapter) = self.recognizer.take() {
            adapter.teardown();
        }
        if self.state() == TurnState::Idle {
            return;
        }

        let policy = &self.services.reconnect;
        if !recoverable || !policy.allows(self.reconnect_attempts) {
            // a misconfigured backend stays off until the next start
            self.recognition_disabled = !recoverable;
            tracing::error!(
                session_id = %self.session.id(),
                attempts = self.reconnect_attempts,
                "recognition unavailable"
            );
            self.gate.send(ServerMessage::Error {
                message: "speech recognition unavailable".to_string(),
                details: Some(message.to_string()),
            });
            return;
        }

        let delay = delay_for_attempt(policy, self.reconnect_attempts);
        self.reconnect_attempts += 1;
        self.reconnect_pending = true;
        let generation = self.recognition_generation;
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::Reconnect { generation });
        });
    }

    /// Reuse a healthy recognition channel, or open a new one
    fn ensure_recognition(&mut self) {
        if let Some(adapter) = &self.recognizer
            && adapter.is_healthy()
        {
            adapter.reset();
            if adapter.is_ready() {
                self.gate.send(ServerMessage::SttReady);
            }
            return;
        }
        self.open_recognition();
    }

    fn open_recognition(&mut self) {
        if let Some(old) = self.recognizer.take() {
            old.teardown();
        }
        self.recognition_generation += 1;
        self.reconnect_pending = false;

        let generation = self.recognition_generation;
        let events = self.events.clone();
        let sink: EventSink = Arc::new(move |event| {
            let _ = events.send(SessionEvent::Recognition { generation, event });
        });

        self.recognizer = Some(RecognitionAdapter::open(
            Arc::clone(&self.services.recognizer),
            self.services.session.hangover,
            sink,
        ));
    }

    fn cancel_run(&mut self) {
        self.gate.advance();
        self.active_run = None;
        self.drained_at = None;
    }

    /// End the conversation, keeping history; idempotent
    pub fn stop(&mut self) {
        self.shutdown();
        self.gate.send(ServerMessage::Stopped);
    }

    fn shutdown(&mut self) {
        self.cancel_run();
        if let Some(adapter) = self.recognizer.take() {
            adapter.teardown();
        }
        // ignore late events from the closed adapter
        self.recognition_generation += 1;
        self.conversation += 1;
        if self.state() != TurnState::Idle {
            tracing::info!(
                session_id = %self.session.id(),
                messages = self.session.history().len(),
                "conversation stopped"
            );
        }
        self.session.transition(TurnState::Idle);
    }
}
