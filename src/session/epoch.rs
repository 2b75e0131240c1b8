//! Generation epoch and the outbound gate it guards

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::protocol::ServerMessage;

#[derive(Debug, Default)]
struct GateState {
    epoch: u64,
    delivered: u64,
}

/// Per-session generation epoch plus the outbound message channel
///
/// Epoch-bound messages are sent under the same lock that advances the epoch,
/// so once [`EpochGate::interrupt`] returns no message stamped with an older
/// epoch can reach the client after its `stop_playback`.
#[derive(Debug)]
pub struct EpochGate {
    state: Mutex<GateState>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl EpochGate {
    #[must_use]
    pub fn new(outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            outbound,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current epoch
    #[must_use]
    pub fn current(&self) -> u64 {
        self.lock().epoch
    }

    /// Invalidate all outstanding work; returns the new epoch
    pub fn advance(&self) -> u64 {
        let mut state = self.lock();
        state.epoch += 1;
        state.epoch
    }

    /// Advance the epoch and tell the client to hard-stop playback, atomically
    pub fn interrupt(&self, reason: &str) -> u64 {
        let mut state = self.lock();
        state.epoch += 1;
        let _ = self.outbound.send(ServerMessage::StopPlayback {
            reason: reason.to_string(),
        });
        state.epoch
    }

    /// Send `message` only if `epoch` is still current
    ///
    /// Returns `false` when the message was discarded as stale or the
    /// connection is gone.
    pub fn send_if_current(&self, epoch: u64, message: ServerMessage) -> bool {
        let mut state = self.lock();
        if state.epoch != epoch {
            return false;
        }
        let is_audio = matches!(message, ServerMessage::AiAudioChunk { .. });
        if self.outbound.send(message).is_err() {
            return false;
        }
        if is_audio {
            state.delivered += 1;
        }
        true
    }

    /// Send a message that is not tied to any response run
    pub fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Audio fragments delivered over the session's lifetime
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }
}
