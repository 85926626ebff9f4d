use crate::analysis::FeedbackKind;
use crate::focus::AttentionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const REFLECTION_LOG_FILE: &str = "_reflections.json";

/// What the monitor judged, paired with how the user rated that judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackCase {
    pub judgement: AttentionState,
    pub rating: FeedbackKind,
}

impl FeedbackCase {
    pub fn new(judgement: AttentionState, rating: FeedbackKind) -> Self {
        Self { judgement, rating }
    }

    /// Direction the next analyses should lean when this activity shows up again.
    pub fn policy_adjustment(&self) -> &'static str {
        match (self.judgement, self.rating) {
            (AttentionState::Focused, FeedbackKind::Good) => {
                "Output higher alignment (lower output score)"
            }
            (AttentionState::Focused, FeedbackKind::Bad) => {
                "Output low alignment (high output score)"
            }
            (AttentionState::Distracted, FeedbackKind::Good) => {
                "Output lower alignment (higher output score)"
            }
            (AttentionState::Distracted, FeedbackKind::Bad) => {
                "Output high alignment (low output score)"
            }
        }
    }
}

impl fmt::Display for FeedbackCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.judgement, self.rating.as_str())
    }
}

/// The service's reading of what the user was actually doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reflection {
    pub activity_description: String,
    pub intention_prediction: String,
}

impl Reflection {
    /// Pulls the reflection out of a feedback reply. The reflection may be the reply itself, an
    /// object under `reflection_response`, or JSON text (possibly wrapped in prose) under it.
    pub fn from_reply(reply: &Value) -> Option<Self> {
        if let Some(reflection) = Self::from_object(reply.as_object()?) {
            return Some(reflection);
        }
        match reply.get("reflection_response")? {
            Value::Object(map) => Self::from_object(map),
            Value::String(text) => Self::from_text(text),
            _ => None,
        }
    }

    fn from_text(text: &str) -> Option<Self> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        let value: Value = serde_json::from_str(text.get(start..=end)?).ok()?;
        Self::from_object(value.as_object()?)
    }

    fn from_object(map: &Map<String, Value>) -> Option<Self> {
        let field = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            activity_description: field("user_activity_description")?,
            intention_prediction: field("user_implicit_intention_prediction")?,
        })
    }

    pub fn learn(&self, case: FeedbackCase) -> LearnedFeedback {
        LearnedFeedback {
            intention: format!(
                "{} (Relevant activity: {})",
                self.intention_prediction, self.activity_description
            ),
            rule: format!(
                "{} when detecting activity - {}",
                case.policy_adjustment(),
                self.activity_description
            ),
        }
    }
}

/// One learned intention and one learned rule, appended to the session's prompt context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnedFeedback {
    pub intention: String,
    pub rule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub task_name: String,
    pub feedback_case: String,
    pub reflection: Value,
}

/// `<dir>/<task>_clarification.json`, keeping alphanumerics, spaces, `-` and `_`.
pub fn clarification_path(dir: &Path, task: &str) -> PathBuf {
    let clean: String = task
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    dir.join(format!("{}_clarification.json", clean.trim_end().replace(' ', "_")))
}

/// Reads the `augmented_intentions` saved for `task`. Missing or unreadable files yield nothing.
pub fn load_clarification_intentions(dir: &Path, task: &str) -> Vec<String> {
    let path = clarification_path(dir, task);
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    let value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(err) => {
            warn!("ignoring unreadable clarification file {}: {err}", path.display());
            return Vec::new();
        }
    };
    let intentions: Vec<String> = value
        .get("augmented_intentions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    debug!("loaded {} clarification intentions for {task:?}", intentions.len());
    intentions
}
