use crate::config::FocusConfig;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

pub const FOCUSED_FALLBACK_MESSAGE: &str = "Focus: Stay on task!";
pub const DISTRACTED_FALLBACK_MESSAGE: &str = "Distracted: Return to your goal!";
pub const REMINDER_FALLBACK_MESSAGE: &str = "Still distracted! Try to refocus on your task.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionState {
    Focused,
    Distracted,
}

impl AttentionState {
    /// Binary judgement as exchanged with the inference service: 0 focused, 1 distracted.
    pub fn judgement(&self) -> u8 {
        match self {
            AttentionState::Focused => 0,
            AttentionState::Distracted => 1,
        }
    }

    pub fn fallback_message(&self) -> &'static str {
        match self {
            AttentionState::Focused => FOCUSED_FALLBACK_MESSAGE,
            AttentionState::Distracted => DISTRACTED_FALLBACK_MESSAGE,
        }
    }
}

impl fmt::Display for AttentionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttentionState::Focused => write!(f, "focused"),
            AttentionState::Distracted => write!(f, "distracted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusThresholds {
    /// Scores strictly above this count as a distracted signal.
    pub distraction_threshold: f64,
    pub acquire: u32,
    pub release: u32,
    pub reminder: u32,
}

impl Default for FocusThresholds {
    fn default() -> Self {
        Self::from(&FocusConfig::default())
    }
}

impl From<&FocusConfig> for FocusThresholds {
    fn from(config: &FocusConfig) -> Self {
        Self {
            distraction_threshold: config.distraction_threshold,
            acquire: config.acquire_threshold.max(1),
            release: config.release_threshold.max(1),
            reminder: config.reminder_threshold.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FocusState {
    /// `None` until the first result of the session arrives.
    pub current_state: Option<AttentionState>,
    pub consecutive_distracted_count: u32,
    pub consecutive_focused_count: u32,
    pub sustained_distraction_count: u32,
    pub thresholds: FocusThresholds,
}

impl FocusState {
    pub fn new(thresholds: FocusThresholds) -> Self {
        Self {
            current_state: None,
            consecutive_distracted_count: 0,
            consecutive_focused_count: 0,
            sustained_distraction_count: 0,
            thresholds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// First result of a session or a hysteresis transition.
    StateChange,
    /// Sustained distraction while already distracted.
    Reminder,
    /// Periodic restatement of the task.
    TaskReminder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationDraft {
    pub kind: NotificationKind,
    pub judgement: AttentionState,
    pub message: String,
}

/// Effects of applying one result.
#[derive(Debug, Clone, PartialEq)]
pub struct FocusUpdate {
    pub state: AttentionState,
    pub signal: AttentionState,
    pub score: f64,
    /// Message to display, never empty.
    pub message: String,
    pub transitioned: bool,
    pub notifications: Vec<NotificationDraft>,
}

/// Debounces noisy per-result scores into a stable focused/distracted state.
#[derive(Debug, Clone)]
pub struct FocusStateMachine {
    state: FocusState,
    last_good_message: Option<String>,
}

impl FocusStateMachine {
    pub fn new(thresholds: FocusThresholds) -> Self {
        Self {
            state: FocusState::new(thresholds),
            last_good_message: None,
        }
    }

    pub fn state(&self) -> &FocusState {
        &self.state
    }

    pub fn current(&self) -> Option<AttentionState> {
        self.state.current_state
    }

    pub fn reset(&mut self) {
        self.state = FocusState::new(self.state.thresholds);
        self.last_good_message = None;
    }

    pub fn signal_for(&self, score: f64) -> AttentionState {
        if score > self.state.thresholds.distraction_threshold {
            AttentionState::Distracted
        } else {
            AttentionState::Focused
        }
    }

    pub fn apply(&mut self, score: f64, message: &str) -> FocusUpdate {
        let signal = self.signal_for(score);
        let message = message.trim();
        let display_message = if message.is_empty() {
            signal.fallback_message().to_string()
        } else {
            self.last_good_message = Some(message.to_string());
            message.to_string()
        };

        match signal {
            AttentionState::Distracted => {
                self.state.consecutive_distracted_count += 1;
                self.state.consecutive_focused_count = 0;
            }
            AttentionState::Focused => {
                self.state.consecutive_focused_count += 1;
                self.state.consecutive_distracted_count = 0;
            }
        }

        let thresholds = self.state.thresholds;
        let (state, transitioned) = match self.state.current_state {
            None => {
                info!("initial attention state: {signal} (score {score:.2})");
                (signal, true)
            }
            Some(AttentionState::Focused)
                if self.state.consecutive_distracted_count >= thresholds.acquire =>
            {
                info!(
                    "attention state changed to distracted ({}/{})",
                    self.state.consecutive_distracted_count, thresholds.acquire
                );
                (AttentionState::Distracted, true)
            }
            Some(AttentionState::Distracted)
                if self.state.consecutive_focused_count >= thresholds.release =>
            {
                info!(
                    "attention state changed to focused ({}/{})",
                    self.state.consecutive_focused_count, thresholds.release
                );
                self.state.sustained_distraction_count = 1;
                (AttentionState::Focused, true)
            }
            Some(current) => (current, false),
        };
        self.state.current_state = Some(state);

        let mut notifications = Vec::new();
        if transitioned {
            notifications.push(NotificationDraft {
                kind: NotificationKind::StateChange,
                judgement: state,
                message: display_message.clone(),
            });
        }

        if state == AttentionState::Distracted && signal == AttentionState::Distracted {
            self.state.sustained_distraction_count += 1;
            if self.state.sustained_distraction_count >= thresholds.reminder {
                debug!(
                    "sustained distraction reached {}",
                    self.state.sustained_distraction_count
                );
                notifications.push(NotificationDraft {
                    kind: NotificationKind::Reminder,
                    judgement: AttentionState::Distracted,
                    message: self.reminder_message(message),
                });
                self.state.sustained_distraction_count = 0;
            }
        }

        FocusUpdate {
            state,
            signal,
            score,
            message: display_message,
            transitioned,
            notifications,
        }
    }

    fn reminder_message(&self, current: &str) -> String {
        if !current.is_empty() {
            return current.to_string();
        }
        self.last_good_message
            .clone()
            .unwrap_or_else(|| REMINDER_FALLBACK_MESSAGE.to_string())
    }
}
