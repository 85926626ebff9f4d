use crate::frontmost::FrontmostApp;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::create_dir_all;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CAPTURE_METADATA_FILE: &str = "_metadata.json";
pub const RESULT_LOG_FILE: &str = "_llm_results.json";

/// A pretty-printed JSON array rewritten on every append.
///
/// A missing or unreadable file is treated as an empty array, so a corrupt log is replaced by a
/// fresh one on the next write.
#[derive(Debug, Clone)]
pub struct JsonArrayLog<T> {
    path: PathBuf,
    _entry: PhantomData<fn() -> T>,
}

impl<T> JsonArrayLog<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            _entry: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> Vec<T> {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        match serde_json::from_str(&text) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("ignoring corrupt log {}: {err}", self.path.display());
                Vec::new()
            }
        }
    }

    pub fn append(&self, entry: T) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent).with_context(|| {
                format!("failed to create log parent directory {}", parent.display())
            })?;
        }

        let mut entries = self.read_all();
        entries.push(entry);

        let text = serde_json::to_string_pretty(&entries)
            .with_context(|| format!("failed to encode log {}", self.path.display()))?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("failed to write log {}", self.path.display()))?;
        Ok(())
    }
}

/// One successful capture. Written once and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub timestamp: DateTime<Utc>,
    pub image_file: String,
    pub frontmost_app: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip)]
    pub file_path: PathBuf,
    #[serde(skip)]
    pub session_capture_dir: PathBuf,
}

impl CaptureRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        file_path: PathBuf,
        session_capture_dir: PathBuf,
        app: &FrontmostApp,
    ) -> Self {
        let image_file = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            timestamp,
            image_file,
            frontmost_app: app.name.clone(),
            url: app.url.clone(),
            file_path,
            session_capture_dir,
        }
    }

    pub fn app(&self) -> FrontmostApp {
        FrontmostApp::new(self.frontmost_app.clone(), self.url.clone())
    }
}

/// The per-session capture metadata log.
#[derive(Debug, Clone)]
pub struct CaptureLog {
    dir: PathBuf,
    log: JsonArrayLog<CaptureRecord>,
}

impl CaptureLog {
    pub fn new(session_capture_dir: impl AsRef<Path>) -> Self {
        let dir = session_capture_dir.as_ref().to_path_buf();
        let log = JsonArrayLog::new(dir.join(CAPTURE_METADATA_FILE));
        Self { dir, log }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&self, record: &CaptureRecord) -> Result<()> {
        self.log.append(record.clone())
    }

    pub fn records(&self) -> Vec<CaptureRecord> {
        self.log
            .read_all()
            .into_iter()
            .map(|mut record| {
                record.file_path = self.dir.join(&record.image_file);
                record.session_capture_dir = self.dir.clone();
                record
            })
            .collect()
    }

    /// Newest record whose image is still on disk; eviction may have removed older ones.
    pub fn latest(&self) -> Option<CaptureRecord> {
        self.records()
            .into_iter()
            .rev()
            .find(|record| record.file_path.is_file())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultLogEntry {
    pub timestamp: DateTime<Utc>,
    pub result: serde_json::Value,
}

pub type ResultLog = JsonArrayLog<ResultLogEntry>;
