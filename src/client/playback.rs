//! Ordered playback of synthesized fragments
//!
//! The queue owns a single [`Player`]. Fragment completion arrives
//! asynchronously, so every started fragment gets a serial id and stale
//! completions or gap timers are ignored after a hard stop.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use crate::Result;

/// Pause between consecutive fragments
pub const FRAGMENT_GAP: Duration = Duration::from_millis(50);

/// Pause before moving on after a fragment fails to play
pub const ERROR_RETRY: Duration = Duration::from_millis(100);

/// Audio output driven by the queue
pub trait Player {
    /// Begin playing `audio`; completion is reported back with `id`
    ///
    /// # Errors
    ///
    /// Returns error if the fragment cannot be decoded or the device fails
    fn play(&mut self, id: u64, audio: &[u8]) -> Result<()>;

    /// Halt whatever is playing and release it; must be safe when idle
    fn stop(&mut self);
}

/// One fragment waiting to be heard
#[derive(Debug, Clone)]
pub struct Fragment {
    pub text: String,
    pub audio: Bytes,
    pub greeting: bool,
}

/// What the caller must do after a queue operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStep {
    /// Nothing changed
    None,
    /// A fragment began playing
    Started { id: u64, greeting: bool },
    /// Call [`PlaybackQueue::play_next`] with `ticket` after `delay`
    NextAfter { delay: Duration, ticket: u64 },
    /// The queue ran dry; the agent has finished speaking
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Idle,
    Playing(u64),
    Waiting(u64),
}

/// Pending fragments plus the active player
pub struct PlaybackQueue<P> {
    player: P,
    pending: VecDeque<Fragment>,
    slot: Slot,
    serial: u64,
}

impl<P: Player> PlaybackQueue<P> {
    #[must_use]
    pub const fn new(player: P) -> Self {
        Self {
            player,
            pending: VecDeque::new(),
            slot: Slot::Idle,
            serial: 0,
        }
    }

    /// Append a fragment, starting it at once if nothing is playing
    pub fn enqueue(&mut self, fragment: Fragment) -> QueueStep {
        if fragment.audio.is_empty() {
            tracing::warn!(text = %fragment.text, "skipping fragment with no audio");
            return QueueStep::None;
        }
        self.pending.push_back(fragment);
        if self.slot == Slot::Idle {
            self.start_next()
        } else {
            QueueStep::None
        }
    }

    /// The player finished fragment `id`
    pub fn on_fragment_end(&mut self, id: u64) -> QueueStep {
        if self.slot != Slot::Playing(id) {
            return QueueStep::None;
        }
        self.player.stop();
        if self.pending.is_empty() {
            self.slot = Slot::Idle;
            return QueueStep::Drained;
        }
        self.wait(FRAGMENT_GAP)
    }

    /// A gap timer handed out as `ticket` has elapsed
    pub fn play_next(&mut self, ticket: u64) -> QueueStep {
        if self.slot != Slot::Waiting(ticket) {
            return QueueStep::None;
        }
        self.start_next()
    }

    /// Drop everything and silence the player
    ///
    /// Returns `true` if anything was playing or queued.
    pub fn hard_stop(&mut self) -> bool {
        let active = self.slot != Slot::Idle || !self.pending.is_empty();
        self.pending.clear();
        self.player.stop();
        self.slot = Slot::Idle;
        self.serial += 1;
        if active {
            tracing::debug!("playback stopped");
        }
        active
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.slot != Slot::Idle
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub const fn player(&self) -> &P {
        &self.player
    }

    fn start_next(&mut self) -> QueueStep {
        let Some(fragment) = self.pending.pop_front() else {
            self.slot = Slot::Idle;
            return QueueStep::Drained;
        };

        self.serial += 1;
        let id = self.serial;
        match self.player.play(id, &fragment.audio) {
            Ok(()) => {
                tracing::debug!(id, text = %fragment.text, remaining = self.pending.len(), "playing fragment");
                self.slot = Slot::Playing(id);
                QueueStep::Started {
                    id,
                    greeting: fragment.greeting,
                }
            }
            Err(e) => {
                tracing::warn!(id, error = %e, "fragment playback failed");
                self.wait(ERROR_RETRY)
            }
        }
    }

    fn wait(&mut self, delay: Duration) -> QueueStep {
        self.serial += 1;
        self.slot = Slot::Waiting(self.serial);
        QueueStep::NextAfter {
            delay,
            ticket: self.serial,
        }
    }
}
