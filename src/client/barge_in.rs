//! Local voice activity detection for interrupting agent speech
//!
//! The detector only listens while the agent is audibly speaking and a
//! device-dependent grace period has passed since playback began. Echo of the
//! agent's own voice tends to arrive as a sharp spike early in a fragment, so
//! such spikes are ignored rather than treated as the user talking over it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Level above which a frame counts as speech during normal turns
pub const SPEECH_THRESHOLD: f32 = 0.04;

/// Speech threshold while the greeting plays
pub const GREETING_SPEECH_THRESHOLD: f32 = 0.06;

/// Level below which the user is considered silent again
pub const SILENCE_THRESHOLD: f32 = 0.008;

/// Frames in the trailing level average
const LEVEL_WINDOW: usize = 10;

/// A frame this many times above the trailing average is a spike
const SPIKE_FACTOR: f32 = 3.0;

/// Spikes this early in a fragment are treated as echo
const ECHO_WINDOW: Duration = Duration::from_millis(1000);

/// Device class, chosen once when the conversation starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    Mobile,
    #[default]
    Desktop,
}

impl DeviceProfile {
    /// Time after playback starts before the microphone is trusted
    #[must_use]
    pub const fn grace_period(self) -> Duration {
        match self {
            Self::Mobile => Duration::from_millis(1000),
            Self::Desktop => Duration::from_millis(300),
        }
    }

    #[must_use]
    pub const fn is_mobile(self) -> bool {
        matches!(self, Self::Mobile)
    }
}

/// Outcome of feeding one frame to the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// Nothing to do
    Quiet,
    /// Above threshold but classified as echo of agent audio
    Echo,
    /// Genuine user speech over the agent: stop playback and notify the server
    BargeIn,
    /// The user went silent after speaking
    Silence,
}

/// Classifies microphone frames while the agent speaks
#[derive(Debug)]
pub struct BargeInDetector {
    profile: DeviceProfile,
    levels: VecDeque<f32>,
    agent_speaking: bool,
    greeting: bool,
    enabled_at: Option<Instant>,
    fragment_started: Option<Instant>,
    user_speaking: bool,
    spoke_this_turn: bool,
    muted: bool,
}

impl BargeInDetector {
    #[must_use]
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            levels: VecDeque::with_capacity(LEVEL_WINDOW + 1),
            agent_speaking: false,
            greeting: false,
            enabled_at: None,
            fragment_started: None,
            user_speaking: false,
            spoke_this_turn: false,
            muted: false,
        }
    }

    #[must_use]
    pub const fn profile(&self) -> DeviceProfile {
        self.profile
    }

    /// A fragment began playing at `now`
    ///
    /// The first fragment of a speaking stretch arms the grace period; later
    /// fragments only reset the echo window.
    pub fn fragment_started(&mut self, now: Instant, greeting: bool) {
        if !self.agent_speaking {
            self.agent_speaking = true;
            self.greeting = greeting;
        }
        if self.enabled_at.is_none() {
            self.enabled_at = Some(now + self.profile.grace_period());
        }
        self.fragment_started = Some(now);
        self.levels.clear();
    }

    /// Agent playback drained or was stopped
    pub fn playback_stopped(&mut self) {
        self.agent_speaking = false;
        self.greeting = false;
        self.enabled_at = None;
        self.fragment_started = None;
        self.levels.clear();
    }

    /// Whether frames are currently checked for barge-in
    #[must_use]
    pub fn is_armed(&self, now: Instant) -> bool {
        self.agent_speaking && self.enabled_at.is_some_and(|at| now >= at)
    }

    #[must_use]
    pub const fn speech_threshold(&self) -> f32 {
        if self.greeting {
            GREETING_SPEECH_THRESHOLD
        } else {
            SPEECH_THRESHOLD
        }
    }

    #[must_use]
    pub const fn is_user_speaking(&self) -> bool {
        self.user_speaking
    }

    #[must_use]
    pub const fn is_muted(&self) -> bool {
        self.muted
    }

    /// Mute or unmute the microphone
    ///
    /// Returns `true` when muting right after genuine speech, which the
    /// caller reports to the server as the end of the user's turn.
    pub fn set_muted(&mut self, muted: bool) -> bool {
        let was_muted = std::mem::replace(&mut self.muted, muted);
        if !muted || was_muted {
            return false;
        }
        self.user_speaking = false;
        std::mem::take(&mut self.spoke_this_turn)
    }

    /// Classify one frame's level observed at `now`
    pub fn observe(&mut self, level: f32, now: Instant) -> VadDecision {
        if self.muted {
            return VadDecision::Quiet;
        }

        self.levels.push_back(level);
        if self.levels.len() > LEVEL_WINDOW {
            self.levels.pop_front();
        }

        if !self.is_armed(now) {
            // Turn-taking is the server's job while the agent is silent; only
            // note that the user spoke so a later mute can end the turn.
            if level > SPEECH_THRESHOLD {
                self.spoke_this_turn = true;
            }
            return self.settle(level);
        }

        if self.user_speaking || level <= self.speech_threshold() {
            return self.settle(level);
        }

        if self.is_echo(level, now) {
            tracing::debug!(level, "ignoring early spike as echo");
            return VadDecision::Echo;
        }

        tracing::debug!(level, "user speech over agent playback");
        self.user_speaking = true;
        self.spoke_this_turn = true;
        VadDecision::BargeIn
    }

    fn settle(&mut self, level: f32) -> VadDecision {
        if self.user_speaking && level < SILENCE_THRESHOLD {
            self.user_speaking = false;
            return VadDecision::Silence;
        }
        VadDecision::Quiet
    }

    #[allow(clippy::cast_precision_loss)]
    fn is_echo(&self, level: f32, now: Instant) -> bool {
        let average = self.levels.iter().sum::<f32>() / self.levels.len().max(1) as f32;
        let spike = level > average * SPIKE_FACTOR;
        let early = self
            .fragment_started
            .is_some_and(|start| now.saturating_duration_since(start) < ECHO_WINDOW);
        spike && early
    }
}

/// Mean absolute amplitude of a frame
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn frame_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
}

/// Convert float samples to little-endian 16-bit PCM bytes
#[must_use]
pub fn to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        #[allow(clippy::cast_possible_truncation)]
        let value = if s < 0.0 {
            (s * 32768.0) as i16
        } else {
            (s * 32767.0) as i16
        };
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}
