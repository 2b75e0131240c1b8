//! Shared test utilities: scripted backends and a session harness

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use duplex_voice::config::{GenerationConfig, SessionConfig, SynthesisConfig};
use duplex_voice::generation::{GenerationClient, GenerationRequest, TokenStream};
use duplex_voice::protocol::{ClientMessage, ServerMessage};
use duplex_voice::recognition::{RecognitionBackend, RecognitionChannel, TranscriptEvent};
use duplex_voice::retry::RetryPolicy;
use duplex_voice::session::{SessionEvent, SessionMachine, Services};
use duplex_voice::synthesis::{SpeechSynthesizer, SynthesisClient, VoiceSelector};
use duplex_voice::{Error, Result};

/// Delay between scripted generation tokens
pub const TOKEN_DELAY: Duration = Duration::from_millis(20);

/// Delay of every scripted synthesis call
pub const SYNTH_DELAY: Duration = Duration::from_millis(10);

/// Recognition backend whose transcripts are injected by the test
#[derive(Default)]
pub struct FakeRecognizer {
    transcripts: Mutex<Vec<mpsc::Sender<Result<TranscriptEvent>>>>,
    audio: Mutex<Vec<mpsc::Receiver<Bytes>>>,
    connects: AtomicUsize,
    refusals: AtomicUsize,
    misconfigured: AtomicBool,
}

impl FakeRecognizer {
    /// Deliver a result on the most recently opened channel
    pub fn say(&self, text: &str, is_final: bool, confidence: f32) {
        let channels = self.transcripts.lock().unwrap();
        let tx = channels.last().expect("no recognition channel open");
        tx.try_send(Ok(TranscriptEvent {
            text: text.to_string(),
            is_final,
            confidence,
        }))
        .expect("transcript channel full");
    }

    /// Fail the most recently opened channel, if it is still open
    pub fn fail(&self) {
        let channels = self.transcripts.lock().unwrap();
        let tx = channels.last().expect("no recognition channel open");
        let _ = tx.try_send(Err(Error::Recognition("socket reset".to_string())));
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Reject every connection attempt as if the API key were missing
    pub fn misconfigure(&self) {
        self.misconfigured.store(true, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Audio chunks received on the most recent channel so far
    pub fn received_audio(&self) -> Vec<Bytes> {
        let mut channels = self.audio.lock().unwrap();
        let Some(rx) = channels.last_mut() else {
            return Vec::new();
        };
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }
}

#[async_trait]
impl RecognitionBackend for FakeRecognizer {
    async fn connect(&self) -> Result<RecognitionChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.misconfigured.load(Ordering::SeqCst) {
            return Err(Error::Config("recognition API key required".to_string()));
        }
        if self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Recognition("connection refused".to_string()));
        }
        let (audio_tx, audio_rx) = mpsc::channel(256);
        let (transcripts_tx, transcripts_rx) = mpsc::channel(16);
        self.audio.lock().unwrap().push(audio_rx);
        self.transcripts.lock().unwrap().push(transcripts_tx);
        Ok(RecognitionChannel {
            audio: audio_tx,
            transcripts: transcripts_rx,
        })
    }
}

/// Generation engine replaying scripted responses, one per request
///
/// A token of `"!ERR"` fails the stream at that point.
#[derive(Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Vec<String>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new(responses: &[&[&str]]) -> Self {
        Self {
            responses: Mutex::new(
                responses
                    .iter()
                    .map(|tokens| tokens.iter().map(ToString::to_string).collect())
                    .collect(),
            ),
            requests: Mutex::default(),
        }
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationClient for ScriptedGenerator {
    async fn stream(&self, request: GenerationRequest) -> Result<TokenStream> {
        self.requests.lock().unwrap().push(request);
        let tokens = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Generation("no scripted response".to_string()))?;

        Ok(futures::stream::iter(tokens)
            .then(|token| async move {
                tokio::time::sleep(TOKEN_DELAY).await;
                if token == "!ERR" {
                    Err(Error::Generation("stream dropped".to_string()))
                } else {
                    Ok(token)
                }
            })
            .boxed())
    }
}

/// Synthesizer echoing the text as audio; text containing `FAIL` fails
#[derive(Default)]
pub struct FakeSynthesizer {
    calls: Mutex<Vec<String>>,
}

impl FakeSynthesizer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &VoiceSelector) -> Result<Bytes> {
        self.calls.lock().unwrap().push(text.to_string());
        tokio::time::sleep(SYNTH_DELAY).await;
        if text.contains("FAIL") {
            return Err(Error::Synthesis("voice unavailable".to_string()));
        }
        Ok(Bytes::from(text.as_bytes().to_vec()))
    }
}

/// Build services around the given fakes
pub fn services(
    recognizer: Arc<FakeRecognizer>,
    generator: Arc<ScriptedGenerator>,
    synthesizer: Arc<FakeSynthesizer>,
    session: SessionConfig,
) -> Services {
    Services {
        recognizer,
        generator,
        synthesis: Arc::new(SynthesisClient::new(synthesizer, &SynthesisConfig::default())),
        generation: GenerationConfig::default(),
        session,
        reconnect: RetryPolicy::default(),
    }
}

/// A session machine driven by hand, with every outbound message recorded
pub struct Harness {
    pub machine: SessionMachine,
    pub recognizer: Arc<FakeRecognizer>,
    pub generator: Arc<ScriptedGenerator>,
    pub synthesizer: Arc<FakeSynthesizer>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    outbound: mpsc::UnboundedReceiver<ServerMessage>,
    sent: Vec<ServerMessage>,
}

impl Harness {
    pub fn new(responses: &[&[&str]]) -> Self {
        Self::with_session(responses, SessionConfig::default())
    }

    pub fn with_session(responses: &[&[&str]], session: SessionConfig) -> Self {
        let recognizer = Arc::new(FakeRecognizer::default());
        let generator = Arc::new(ScriptedGenerator::new(responses));
        let synthesizer = Arc::new(FakeSynthesizer::default());

        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let machine = SessionMachine::new(
            "test-session",
            services(
                Arc::clone(&recognizer),
                Arc::clone(&generator),
                Arc::clone(&synthesizer),
                session,
            ),
            outbound_tx,
            events_tx,
        );

        Self {
            machine,
            recognizer,
            generator,
            synthesizer,
            events,
            outbound,
            sent: Vec::new(),
        }
    }

    /// Deliver a client message
    pub fn client(&mut self, message: ClientMessage) {
        self.machine.handle(SessionEvent::Client(message));
    }

    /// Start a desktop conversation with default selectors
    pub fn start(&mut self) {
        self.client(ClientMessage::Start {
            model: None,
            is_mobile: Some(false),
            persona: None,
            role: None,
            word_limit: None,
        });
    }

    /// Pump events and record output for `duration` of (virtual) time
    pub async fn run_for(&mut self, duration: Duration) {
        self.run_until(|_| false, duration).await;
    }

    /// Pump until an outbound message matches `pred` or `limit` passes
    pub async fn run_until(
        &mut self,
        pred: impl Fn(&ServerMessage) -> bool,
        limit: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            tokio::select! {
                biased;
                Some(message) = self.outbound.recv() => {
                    let hit = pred(&message);
                    self.sent.push(message);
                    if hit {
                        return true;
                    }
                }
                Some(event) = self.events.recv() => {
                    self.machine.handle(event);
                }
                () = tokio::time::sleep_until(deadline) => return false,
            }
        }
    }

    /// Everything sent to the client so far
    pub fn sent(&mut self) -> &[ServerMessage] {
        while let Ok(message) = self.outbound.try_recv() {
            self.sent.push(message);
        }
        &self.sent
    }

    /// Sent messages recorded from now on only
    pub fn clear_sent(&mut self) {
        self.sent();
        self.sent.clear();
    }

    /// Ordinals of delivered audio fragments, in delivery order
    pub fn delivered_ordinals(&mut self) -> Vec<u32> {
        self.sent()
            .iter()
            .filter_map(|m| match m {
                ServerMessage::AiAudioChunk { ordinal, .. } => Some(*ordinal),
                _ => None,
            })
            .collect()
    }

    pub fn count(&mut self, pred: impl Fn(&ServerMessage) -> bool) -> usize {
        self.sent().iter().filter(|m| pred(m)).count()
    }
}
