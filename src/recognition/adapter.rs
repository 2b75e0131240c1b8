use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{RecognitionBackend, RecognitionEvent, TranscriptEvent};
use crate::{Error, Result};

/// Audio chunks held while the channel is still connecting
const PENDING_CHUNKS: usize = 64;

/// Receives adapter events
pub type EventSink = Arc<dyn Fn(RecognitionEvent) + Send + Sync>;

/// "Is the user speaking" bookkeeping
#[derive(Debug, Default)]
struct SpeechTracker {
    speaking: bool,
    last_final: String,
    deadline: Option<Instant>,
}

impl SpeechTracker {
    /// Returns `true` if this result starts a new utterance
    fn observe(&mut self, event: &TranscriptEvent, hangover: Duration, now: Instant) -> bool {
        let has_text = !event.text.trim().is_empty();
        let started = has_text && !self.speaking;
        if started {
            self.speaking = true;
        }

        if event.is_final && self.speaking {
            self.last_final.clone_from(&event.text);
            self.deadline = Some(now + hangover);
        } else if has_text {
            // still talking
            self.deadline = None;
        }

        started
    }

    /// Close the utterance if the hangover has elapsed
    fn expire(&mut self, now: Instant) -> Option<String> {
        match self.deadline {
            Some(deadline) if deadline <= now && self.speaking => {
                self.speaking = false;
                self.deadline = None;
                Some(std::mem::take(&mut self.last_final))
            }
            _ => None,
        }
    }
}

/// One recognition channel plus speech-activity bookkeeping
///
/// Audio written before the channel is ready is held (up to a small bound)
/// and forwarded in order once it connects. Dropping the adapter tears the
/// channel down.
pub struct RecognitionAdapter {
    audio: mpsc::Sender<Bytes>,
    ready: watch::Receiver<bool>,
    tracker: Arc<Mutex<SpeechTracker>>,
    task: JoinHandle<()>,
}

impl RecognitionAdapter {
    /// Start connecting through `backend`; events are delivered to `sink`
    #[must_use]
    pub fn open(backend: Arc<dyn RecognitionBackend>, hangover: Duration, sink: EventSink) -> Self {
        let (audio, audio_rx) = mpsc::channel(PENDING_CHUNKS);
        let (ready_tx, ready) = watch::channel(false);
        let tracker = Arc::new(Mutex::new(SpeechTracker::default()));

        let task = tokio::spawn(pump(
            backend,
            audio_rx,
            ready_tx,
            Arc::clone(&tracker),
            hangover,
            sink,
        ));

        Self {
            audio,
            ready,
            tracker,
            task,
        }
    }

    /// Whether the channel currently accepts audio
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the channel is ready
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecognitionClosed`] if the channel stops first
    pub async fn ready(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|r| *r)
            .await
            .map(|_| ())
            .map_err(|_| Error::RecognitionClosed)
    }

    /// Queue an audio chunk
    ///
    /// # Errors
    ///
    /// Returns [`Error::RecognitionClosed`] if the channel has been torn down
    pub fn send_audio(&self, chunk: Bytes) -> Result<()> {
        match self.audio.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("recognition backlog full, dropping audio chunk");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::RecognitionClosed),
        }
    }

    /// Whether the underlying channel is still running
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        !self.task.is_finished() && !self.audio.is_closed()
    }

    /// Forget "user is speaking" state, keeping the channel open
    pub fn reset(&self) {
        *self.tracker.lock().unwrap_or_else(PoisonError::into_inner) = SpeechTracker::default();
        tracing::debug!("recognition state reset");
    }

    /// Close the channel
    pub fn teardown(self) {
        tracing::debug!("recognition channel torn down");
    }
}

impl Drop for RecognitionAdapter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pump(
    backend: Arc<dyn RecognitionBackend>,
    mut audio_rx: mpsc::Receiver<Bytes>,
    ready_tx: watch::Sender<bool>,
    tracker: Arc<Mutex<SpeechTracker>>,
    hangover: Duration,
    sink: EventSink,
) {
    let lock = || tracker.lock().unwrap_or_else(PoisonError::into_inner);

    let channel = match backend.connect().await {
        Ok(channel) => channel,
        Err(e) => {
            sink(failure(&e));
            return;
        }
    };
    let upstream = channel.audio;
    let mut transcripts = channel.transcripts;

    let _ = ready_tx.send(true);
    sink(RecognitionEvent::Ready);

    loop {
        let deadline = lock().deadline;
        let wake = deadline.unwrap_or_else(|| Instant::now() + hangover);

        tokio::select! {
            chunk = audio_rx.recv() => {
                let Some(chunk) = chunk else { break };
                if upstream.send(chunk).await.is_err() {
                    sink(failure(&Error::RecognitionClosed));
                    break;
                }
            }
            result = transcripts.recv() => match result {
                Some(Ok(event)) => {
                    let started = lock().observe(&event, hangover, Instant::now());
                    if started {
                        sink(RecognitionEvent::SpeechStart);
                    }
                    sink(RecognitionEvent::Transcript(event));
                }
                Some(Err(e)) => {
                    sink(failure(&e));
                    break;
                }
                None => {
                    sink(failure(&Error::Recognition("stream ended".to_string())));
                    break;
                }
            },
            () = tokio::time::sleep_until(wake), if deadline.is_some() => {
                let ended = lock().expire(Instant::now());
                if let Some(final_text) = ended {
                    sink(RecognitionEvent::SpeechEnd { final_text });
                }
            }
        }
    }

    let _ = ready_tx.send(false);
}

fn failure(error: &Error) -> RecognitionEvent {
    RecognitionEvent::Error {
        message: error.to_string(),
        recoverable: error.is_recoverable(),
    }
}
