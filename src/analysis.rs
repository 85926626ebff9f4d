use crate::config::OperatingMode;
use crate::frontmost::FrontmostApp;
use crate::session::DashboardPosition;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Everything one worker needs to ask the inference service about a capture.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub prompt: String,
    pub images: Vec<PathBuf>,
    pub image_num: u64,
    pub app_change: bool,
    pub session: SessionInfo,
    pub opacity: f64,
    pub dashboard_position: DashboardPosition,
    pub frontmost: Option<FrontmostApp>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub session_id: String,
    pub task_name: String,
    pub intention: String,
    pub device_name: String,
    pub app_mode: OperatingMode,
    pub notification: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrontmostPayload {
    pub app_name: String,
    pub url: Option<String>,
}

/// Body of `POST <endpoint>/analyze`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzePayload {
    pub prompt: String,
    pub image: String,
    pub image_file: String,
    pub image_num: u64,
    pub app_change: bool,
    pub session_info: SessionInfo,
    pub frontmost_app: Option<FrontmostPayload>,
    pub opacity: f64,
    pub dashboard_position: DashboardPosition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub file_name: String,
    pub data: String,
}

impl AnalysisRequest {
    pub fn payload(&self, image: &EncodedImage) -> AnalyzePayload {
        AnalyzePayload {
            prompt: self.prompt.clone(),
            image: image.data.clone(),
            image_file: image.file_name.clone(),
            image_num: self.image_num,
            app_change: self.app_change,
            session_info: self.session.clone(),
            frontmost_app: self.frontmost.as_ref().map(|app| FrontmostPayload {
                app_name: app.name.clone(),
                url: app.url.clone(),
            }),
            opacity: self.opacity,
            dashboard_position: self.dashboard_position,
        }
    }
}

/// Base64-encodes each readable image no larger than `max_bytes`. Oversized or unreadable
/// files are skipped, never fatal.
pub fn encode_images(paths: &[PathBuf], max_bytes: u64) -> Vec<EncodedImage> {
    let mut encoded = Vec::with_capacity(paths.len());
    for path in paths {
        match encode_image(path, max_bytes) {
            Ok(Some(image)) => encoded.push(image),
            Ok(None) => {}
            Err(err) => warn!("skipping unreadable image {}: {err:#}", path.display()),
        }
    }
    encoded
}

fn encode_image(path: &Path, max_bytes: u64) -> Result<Option<EncodedImage>> {
    let size = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if size > max_bytes {
        warn!(
            "skipping large image {} ({:.2} MB)",
            path.display(),
            crate::storage::bytes_to_mb(size)
        );
        return Ok(None);
    }

    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    debug!("encoded {file_name} ({:.1} KB)", size as f64 / 1024.0);
    Ok(Some(EncodedImage {
        file_name,
        data: general_purpose::STANDARD.encode(bytes),
    }))
}

/// One judgement from the inference service, normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    /// 0.0 is fully on task, 1.0 fully distracted.
    pub output_score: f64,
    pub reason: String,
    pub message: String,
    pub image_id: Option<String>,
    pub analyzed_images: Vec<PathBuf>,
    pub primary_analyzed_image: Option<PathBuf>,
    /// Response body plus the bookkeeping fields, as archived in the result log.
    pub raw: Value,
}

impl AnalysisResult {
    /// Never fails: missing or malformed fields fall back to safe defaults.
    pub fn from_response(mut raw: Value, images: &[PathBuf]) -> Self {
        let output_score = coerce_score(raw.get("output"));
        let reason = raw
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("No reason")
            .to_string();
        let message = raw
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let image_id = match raw.get("image_id") {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };
        let primary_analyzed_image = images.first().cloned();

        if let Value::Object(map) = &mut raw {
            map.insert(
                "analyzed_images".to_string(),
                json!(images.iter().map(|p| p.display().to_string()).collect::<Vec<_>>()),
            );
            map.insert("analyzed_image_count".to_string(), json!(images.len()));
            map.insert(
                "primary_analyzed_image".to_string(),
                json!(primary_analyzed_image.as_ref().map(|p| p.display().to_string())),
            );
        }

        Self {
            output_score,
            reason,
            message,
            image_id,
            analyzed_images: images.to_vec(),
            primary_analyzed_image,
            raw,
        }
    }
}

fn coerce_score(value: Option<&Value>) -> f64 {
    let score = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        _ => 0.0,
    };
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    Timeout,
    Status { status: u16, body: String },
    Transport(String),
    Malformed(String),
    NoImages,
    Cancelled,
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::Timeout => write!(f, "Server request timed out"),
            AnalysisError::Status { status, body } => {
                write!(f, "inference service returned {status}: {body}")
            }
            AnalysisError::Transport(message) => write!(f, "Request error: {message}"),
            AnalysisError::Malformed(message) => {
                write!(f, "malformed inference response: {message}")
            }
            AnalysisError::NoImages => write!(f, "No valid images to analyze"),
            AnalysisError::Cancelled => write!(f, "analysis cancelled"),
        }
    }
}

impl std::error::Error for AnalysisError {}

impl From<reqwest::Error> for AnalysisError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnalysisError::Timeout
        } else if err.is_decode() {
            AnalysisError::Malformed(err.to_string())
        } else {
            AnalysisError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Good,
    Bad,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Good => "good",
            FeedbackKind::Bad => "bad",
        }
    }
}

/// Body of `POST <endpoint>/feedback`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackRequest {
    pub user_id: String,
    pub session_id: String,
    pub image_id: Option<String>,
    pub rating: FeedbackKind,
    pub ai_judgement: u8,
    pub reflection_prompt: String,
    pub images: Vec<String>,
    pub session_info: SessionInfo,
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn analyze(&self, payload: &AnalyzePayload) -> Result<Value, AnalysisError>;

    /// Returns the service's reply, which carries the reflection used for learning.
    async fn submit_feedback(&self, feedback: &FeedbackRequest) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    client: Client,
    endpoint: String,
    request_timeout: Duration,
    feedback_timeout: Duration,
}

impl HttpInferenceClient {
    pub fn new(
        endpoint: impl Into<String>,
        request_timeout: Duration,
        feedback_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            request_timeout,
            feedback_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.endpoint)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn analyze(&self, payload: &AnalyzePayload) -> Result<Value, AnalysisError> {
        let response = self
            .client
            .post(self.url("analyze"))
            .timeout(self.request_timeout)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|err| AnalysisError::Malformed(format!("{err}: {body}")))?;
        if !value.is_object() {
            return Err(AnalysisError::Malformed(format!(
                "expected a JSON object, got {value}"
            )));
        }
        Ok(value)
    }

    async fn submit_feedback(&self, feedback: &FeedbackRequest) -> Result<Value> {
        let response = self
            .client
            .post(self.url("feedback"))
            .timeout(self.feedback_timeout)
            .json(feedback)
            .send()
            .await
            .context("failed to submit feedback")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("feedback endpoint error {status}: {body}");
        }

        let body = response
            .text()
            .await
            .context("failed to read feedback response")?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

/// Replays queued responses in order, then repeats `fallback`. Records every request.
#[derive(Debug)]
pub struct ScriptedInferenceClient {
    responses: Mutex<VecDeque<Result<Value, AnalysisError>>>,
    fallback: Value,
    feedback_reply: Value,
    delay: Duration,
    requests: Mutex<Vec<AnalyzePayload>>,
    feedback: Mutex<Vec<FeedbackRequest>>,
}

impl ScriptedInferenceClient {
    pub fn new(fallback: Value) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback,
            feedback_reply: Value::Null,
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            feedback: Mutex::new(Vec::new()),
        }
    }

    pub fn with_feedback_reply(mut self, reply: Value) -> Self {
        self.feedback_reply = reply;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_responses(
        self,
        responses: impl IntoIterator<Item = Result<Value, AnalysisError>>,
    ) -> Self {
        if let Ok(mut queue) = self.responses.lock() {
            queue.extend(responses);
        }
        self
    }

    pub fn requests(&self) -> Vec<AnalyzePayload> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn feedback(&self) -> Vec<FeedbackRequest> {
        self.feedback
            .lock()
            .map(|feedback| feedback.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInferenceClient {
    async fn analyze(&self, payload: &AnalyzePayload) -> Result<Value, AnalysisError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(payload.clone());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    async fn submit_feedback(&self, feedback: &FeedbackRequest) -> Result<Value> {
        if let Ok(mut recorded) = self.feedback.lock() {
            recorded.push(feedback.clone());
        }
        Ok(self.feedback_reply.clone())
    }
}
