use crate::config::OperatingMode;
use crate::focus::{AttentionState, NotificationDraft, NotificationKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

/// Time-derived notification key. Ordering is chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NotificationId {
    millis: i64,
    seq: u32,
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seq == 0 {
            write!(f, "{}", self.millis)
        } else {
            write!(f, "{}-{}", self.millis, self.seq)
        }
    }
}

impl FromStr for NotificationId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let (millis, seq) = match value.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (value, "0"),
        };
        let millis = millis
            .parse::<i64>()
            .map_err(|_| format!("invalid notification id: {value}"))?;
        let seq = seq
            .parse::<u32>()
            .map_err(|_| format!("invalid notification id: {value}"))?;
        Ok(Self { millis, seq })
    }
}

/// Hands out strictly increasing ids even when two notifications share a millisecond.
#[derive(Debug, Clone, Default)]
pub struct NotificationIdGenerator {
    last: Option<NotificationId>,
}

impl NotificationIdGenerator {
    pub fn next(&mut self, now: DateTime<Utc>) -> NotificationId {
        let millis = now.timestamp_millis();
        let id = match self.last {
            Some(last) if last.millis >= millis => NotificationId {
                millis: last.millis,
                seq: last.seq + 1,
            },
            _ => NotificationId { millis, seq: 0 },
        };
        self.last = Some(id);
        id
    }
}

/// What the monitor knew when a notification was shown, kept for attributing feedback.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationContext {
    pub kind: NotificationKind,
    pub ai_judgement: AttentionState,
    pub response: Option<Value>,
    pub image_path: Option<PathBuf>,
    pub image_id: Option<String>,
    pub task_name: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NotificationContextStore {
    entries: BTreeMap<NotificationId, NotificationContext>,
    capacity: usize,
}

impl NotificationContextStore {
    pub fn new(mode: OperatingMode) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity: mode.context_capacity(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts `context` and trims the oldest entries so the cap holds after every call.
    pub fn store(&mut self, id: NotificationId, context: NotificationContext) -> usize {
        self.entries.insert(id, context);
        self.trim()
    }

    pub fn get(&self, id: &NotificationId) -> Option<&NotificationContext> {
        self.entries.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &NotificationId> {
        self.entries.keys()
    }

    /// Applies the capacity for `mode` and drops the oldest entries above it.
    pub fn evict_excess(&mut self, mode: OperatingMode) -> usize {
        self.capacity = mode.context_capacity();
        self.trim()
    }

    fn trim(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            if self.entries.pop_first().is_none() {
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            debug!(
                "evicted {evicted} notification contexts ({} retained)",
                self.entries.len()
            );
        }
        evicted
    }
}

/// A notification ready for the UI sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub judgement: AttentionState,
    pub task: String,
    pub message: String,
    pub feedback_enabled: bool,
}

/// Source material for a notification context, taken from the latest applied result.
#[derive(Debug, Clone, Default)]
pub struct ResultSnapshot {
    pub response: Option<Value>,
    pub image_path: Option<PathBuf>,
    pub image_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotificationCenter {
    mode: OperatingMode,
    ids: NotificationIdGenerator,
    store: NotificationContextStore,
}

impl NotificationCenter {
    pub fn new(mode: OperatingMode) -> Self {
        Self {
            mode,
            ids: NotificationIdGenerator::default(),
            store: NotificationContextStore::new(mode),
        }
    }

    pub fn store(&self) -> &NotificationContextStore {
        &self.store
    }

    pub fn emit(
        &mut self,
        draft: NotificationDraft,
        snapshot: &ResultSnapshot,
        task: &str,
        now: DateTime<Utc>,
    ) -> Notification {
        let id = self.ids.next(now);
        self.store.store(
            id,
            NotificationContext {
                kind: draft.kind,
                ai_judgement: draft.judgement,
                response: snapshot.response.clone(),
                image_path: snapshot.image_path.clone(),
                image_id: snapshot.image_id.clone(),
                task_name: task.to_string(),
                message: draft.message.clone(),
                created_at: now,
            },
        );

        Notification {
            id,
            kind: draft.kind,
            judgement: draft.judgement,
            task: task.to_string(),
            message: draft.message,
            feedback_enabled: self.mode.feedback_enabled(),
        }
    }

    pub fn context(&self, id: &NotificationId) -> Option<&NotificationContext> {
        self.store.get(id)
    }

    pub fn evict_excess(&mut self) -> usize {
        self.store.evict_excess(self.mode)
    }
}
