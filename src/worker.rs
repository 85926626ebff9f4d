use crate::analysis::{AnalysisError, AnalysisRequest, AnalysisResult, InferenceClient, encode_images};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Completed(AnalysisResult),
    Failed(AnalysisError),
}

/// The single message a worker sends back to the monitor loop.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCompletion {
    pub id: WorkerId,
    pub outcome: WorkerOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Graceful,
    Aborted,
}

/// One-shot analysis of a single request.
pub struct AnalysisWorker {
    id: WorkerId,
    request: AnalysisRequest,
    client: Arc<dyn InferenceClient>,
    max_image_bytes: u64,
}

impl AnalysisWorker {
    pub fn new(
        id: WorkerId,
        request: AnalysisRequest,
        client: Arc<dyn InferenceClient>,
        max_image_bytes: u64,
    ) -> Self {
        Self {
            id,
            request,
            client,
            max_image_bytes,
        }
    }

    /// Runs the request to completion or until `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<AnalysisResult, AnalysisError> {
        let images = encode_images(&self.request.images, self.max_image_bytes);
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        let Some(primary) = images.first() else {
            return Err(AnalysisError::NoImages);
        };

        let payload = self.request.payload(primary);
        debug!(
            "{} requesting analysis of {} (image #{})",
            self.id, primary.file_name, self.request.image_num
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AnalysisError::Cancelled),
            response = self.client.analyze(&payload) => response?,
        };

        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        Ok(AnalysisResult::from_response(response, &self.request.images))
    }

    /// Spawns the worker onto the runtime. Exactly one [`WorkerCompletion`] is sent unless the
    /// worker is cancelled, in which case nothing is sent.
    pub fn spawn(self, completions: mpsc::UnboundedSender<WorkerCompletion>) -> TaskHandle {
        let id = self.id;
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            let outcome = match self.run(&token).await {
                Ok(result) => WorkerOutcome::Completed(result),
                Err(_) if token.is_cancelled() => {
                    debug!("{id} cancelled, dropping its outcome");
                    return;
                }
                Err(AnalysisError::Cancelled) => return,
                Err(err) => {
                    warn!("{id} analysis failed: {err}");
                    WorkerOutcome::Failed(err)
                }
            };
            let _ = completions.send(WorkerCompletion { id, outcome });
        });

        TaskHandle { id, cancel, join }
    }
}

/// Lifecycle handle for a spawned worker, owned by the pool.
#[derive(Debug)]
pub struct TaskHandle {
    id: WorkerId,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Awaits the task and logs a panic, if any.
    pub async fn join(self) {
        if let Err(err) = self.join.await
            && err.is_panic()
        {
            warn!("{} panicked: {err}", self.id);
        }
    }

    /// Cancels the task and waits up to `grace` for it to exit before aborting it.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownOutcome {
        self.cancel.cancel();
        match tokio::time::timeout(grace, &mut self.join).await {
            Ok(_) => ShutdownOutcome::Graceful,
            Err(_) => {
                warn!("{} did not stop within {grace:?}, aborting", self.id);
                self.join.abort();
                let _ = self.join.await;
                ShutdownOutcome::Aborted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AnalysisWorker, ShutdownOutcome, TaskHandle, WorkerCompletion, WorkerId, WorkerOutcome,
    };
    use crate::analysis::{AnalysisError, AnalysisRequest, ScriptedInferenceClient, SessionInfo};
    use crate::config::OperatingMode;
    use crate::session::DashboardPosition;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn request(images: Vec<PathBuf>) -> AnalysisRequest {
        AnalysisRequest {
            prompt: "prompt".to_string(),
            images,
            image_num: 3,
            app_change: true,
            session: SessionInfo {
                user_id: "user".to_string(),
                session_id: "20240704_093000".to_string(),
                task_name: "Write".to_string(),
                intention: "Write".to_string(),
                device_name: "mac".to_string(),
                app_mode: OperatingMode::Full,
                notification: false,
            },
            opacity: 1.0,
            dashboard_position: DashboardPosition::default(),
            frontmost: None,
        }
    }

    fn image(dir: &Path) -> PathBuf {
        let path = dir.join("capture.jpg");
        std::fs::write(&path, b"img").expect("image");
        path
    }

    #[tokio::test]
    async fn completed_worker_reports_result() {
        let temp = tempdir().expect("tempdir");
        let client = Arc::new(ScriptedInferenceClient::new(
            json!({"output": 0.8, "reason": "video", "message": "Back to it", "image_id": "id-1"}),
        ));
        let worker = AnalysisWorker::new(
            WorkerId(1),
            request(vec![image(temp.path())]),
            client.clone(),
            1024,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = worker.spawn(tx);

        let WorkerCompletion { id, outcome } = rx.recv().await.expect("completion");
        handle.join().await;
        assert_eq!(id, WorkerId(1));
        let WorkerOutcome::Completed(result) = outcome else {
            panic!("expected result, got {outcome:?}");
        };
        assert_eq!(result.output_score, 0.8);
        assert_eq!(result.image_id.as_deref(), Some("id-1"));

        let sent = client.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].image, "aW1n");
        assert_eq!(sent[0].image_num, 3);
        assert!(sent[0].app_change);
    }

    #[tokio::test]
    async fn missing_images_fail_without_request() {
        let temp = tempdir().expect("tempdir");
        let client = Arc::new(ScriptedInferenceClient::new(json!({"output": 0.0})));
        let worker = AnalysisWorker::new(
            WorkerId(2),
            request(vec![temp.path().join("evicted.jpg")]),
            client.clone(),
            1024,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.spawn(tx).join().await;

        let completion = rx.recv().await.expect("completion");
        assert_eq!(completion.outcome, WorkerOutcome::Failed(AnalysisError::NoImages));
        assert!(client.requests().is_empty());
    }

    #[tokio::test]
    async fn server_errors_are_reported() {
        let temp = tempdir().expect("tempdir");
        let client = Arc::new(
            ScriptedInferenceClient::new(json!({"output": 0.0}))
                .with_responses([Err(AnalysisError::Timeout)]),
        );
        let worker =
            AnalysisWorker::new(WorkerId(3), request(vec![image(temp.path())]), client, 1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.spawn(tx).join().await;

        let completion = rx.recv().await.expect("completion");
        assert_eq!(completion.outcome, WorkerOutcome::Failed(AnalysisError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_worker_stays_silent() {
        let temp = tempdir().expect("tempdir");
        let client = Arc::new(
            ScriptedInferenceClient::new(json!({"output": 0.0})).with_delay(Duration::from_secs(60)),
        );
        let worker =
            AnalysisWorker::new(WorkerId(4), request(vec![image(temp.path())]), client, 1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = worker.spawn(tx);
        tokio::task::yield_now().await;

        assert_eq!(
            handle.shutdown(Duration::from_secs(2)).await,
            ShutdownOutcome::Graceful
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn task_ignoring_cancellation_is_aborted_after_grace() {
        let handle = TaskHandle {
            id: WorkerId(5),
            cancel: CancellationToken::new(),
            join: tokio::spawn(std::future::pending::<()>()),
        };
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        assert_eq!(
            handle.shutdown(Duration::from_millis(500)).await,
            ShutdownOutcome::Aborted
        );
    }
}
