//! Voice-operated transmit gate.
//!
//! [`VoxGate`] is the clock-driven decision logic only: it is fed one frame at
//! a time together with the capture time and says what should happen to the
//! outgoing stream. Queueing and the network side live in the client's bridge.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::audio::AudioFrame;

fn default_open_threshold() -> f64 {
    0.05
}

fn default_close_threshold() -> f64 {
    0.03
}

fn default_hang_time_ms() -> u64 {
    10_000
}

fn default_pre_roll_frames() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VoxConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f64 },
    #[error("open threshold {open} is below close threshold {close}")]
    ThresholdOrder { open: f64, close: f64 },
}

/// VOX tuning. The open threshold must not be below the close threshold,
/// otherwise the gate would flap between states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxConfig {
    /// RMS level (0..=1) that opens the gate.
    #[serde(default = "default_open_threshold")]
    pub open_threshold: f64,
    /// RMS level (0..=1) that keeps an open gate open.
    #[serde(default = "default_close_threshold")]
    pub close_threshold: f64,
    /// Silence required before an open gate closes.
    #[serde(default = "default_hang_time_ms")]
    pub hang_time_ms: u64,
    /// Frames of history flushed ahead of the triggering frame. 10 frames is
    /// 200 ms.
    #[serde(default = "default_pre_roll_frames")]
    pub pre_roll_frames: usize,
}

impl Default for VoxConfig {
    fn default() -> Self {
        Self {
            open_threshold: default_open_threshold(),
            close_threshold: default_close_threshold(),
            hang_time_ms: default_hang_time_ms(),
            pre_roll_frames: default_pre_roll_frames(),
        }
    }
}

impl VoxConfig {
    pub fn validate(&self) -> Result<(), VoxConfigError> {
        for (name, value) in [
            ("open_threshold", self.open_threshold),
            ("close_threshold", self.close_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(VoxConfigError::OutOfRange { name, value });
            }
        }
        if self.open_threshold < self.close_threshold {
            return Err(VoxConfigError::ThresholdOrder {
                open: self.open_threshold,
                close: self.close_threshold,
            });
        }
        Ok(())
    }

    pub fn hang_time(&self) -> Duration {
        Duration::from_millis(self.hang_time_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxState {
    Listening,
    Transmitting,
}

/// What the caller must do with the frame it just fed in.
#[derive(Debug, PartialEq)]
pub enum VoxDecision {
    /// Gate closed; the frame went into the pre-roll history.
    Buffered,
    /// Gate just opened. Start a stream and queue these frames in order:
    /// the pre-roll history followed by the triggering frame.
    Opened(Vec<AudioFrame>),
    /// Gate open; queue this frame.
    Forward(AudioFrame),
    /// Hang time expired. Stop the stream and discard anything still queued.
    Closed,
}

pub struct VoxGate {
    config: VoxConfig,
    state: VoxState,
    pre_roll: VecDeque<AudioFrame>,
    last_sound: Option<Instant>,
}

impl VoxGate {
    pub fn new(config: VoxConfig) -> Result<Self, VoxConfigError> {
        config.validate()?;
        Ok(Self {
            pre_roll: VecDeque::with_capacity(config.pre_roll_frames + 1),
            config,
            state: VoxState::Listening,
            last_sound: None,
        })
    }

    pub fn state(&self) -> VoxState {
        self.state
    }

    pub fn config(&self) -> &VoxConfig {
        &self.config
    }

    pub fn pre_roll_len(&self) -> usize {
        self.pre_roll.len()
    }

    /// Feeds one captured frame observed at `now`.
    pub fn push(&mut self, frame: AudioFrame, now: Instant) -> VoxDecision {
        let rms = frame.rms();
        trace!(rms, "VOX level");

        match self.state {
            VoxState::Listening if rms > self.config.open_threshold => {
                info!(rms = format!("{:.4}", rms), "VOX opened");
                self.state = VoxState::Transmitting;
                self.last_sound = Some(now);
                let mut frames: Vec<AudioFrame> = self.pre_roll.drain(..).collect();
                frames.push(frame);
                VoxDecision::Opened(frames)
            }
            VoxState::Listening => {
                self.pre_roll.push_back(frame);
                while self.pre_roll.len() > self.config.pre_roll_frames {
                    self.pre_roll.pop_front();
                }
                VoxDecision::Buffered
            }
            VoxState::Transmitting => {
                if rms > self.config.close_threshold {
                    self.last_sound = Some(now);
                    return VoxDecision::Forward(frame);
                }
                let silent_for = self
                    .last_sound
                    .map(|last| now.saturating_duration_since(last))
                    .unwrap_or_default();
                if silent_for > self.config.hang_time() {
                    info!(silent_ms = silent_for.as_millis() as u64, "VOX closed (timeout)");
                    self.state = VoxState::Listening;
                    self.last_sound = None;
                    VoxDecision::Closed
                } else {
                    VoxDecision::Forward(frame)
                }
            }
        }
    }

    /// Returns to Listening and forgets all history.
    pub fn reset(&mut self) {
        self.state = VoxState::Listening;
        self.pre_roll.clear();
        self.last_sound = None;
    }
}
