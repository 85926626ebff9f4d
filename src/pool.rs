use crate::analysis::{AnalysisRequest, InferenceClient};
use crate::capture_log::CaptureLog;
use crate::prompt::{PromptContext, build_analysis_prompt};
use crate::session::Session;
use crate::system_activity::ScreenLockStatus;
use crate::worker::{AnalysisWorker, ShutdownOutcome, TaskHandle, WorkerCompletion, WorkerId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_concurrency: usize,
    pub max_image_bytes: u64,
    pub stop_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    NotRunning,
    ScreenLocked,
    AtCapacity,
    NoCapture,
    Dispatched {
        id: WorkerId,
        image_num: u64,
        app_change: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopSummary {
    pub graceful: usize,
    pub aborted: usize,
}

/// Bounded set of in-flight analysis workers. Never queues: a tick at capacity is dropped.
pub struct AnalysisWorkerPool {
    client: Arc<dyn InferenceClient>,
    config: PoolConfig,
    active: BTreeMap<WorkerId, TaskHandle>,
    next_id: u64,
    running: bool,
    completions: mpsc::UnboundedSender<WorkerCompletion>,
}

impl AnalysisWorkerPool {
    /// Returns the pool and the receiver on which workers report completion.
    pub fn new(
        client: Arc<dyn InferenceClient>,
        config: PoolConfig,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerCompletion>) {
        let (completions, completion_rx) = mpsc::unbounded_channel();
        let pool = Self {
            client,
            config,
            active: BTreeMap::new(),
            next_id: 0,
            running: false,
            completions,
        };
        (pool, completion_rx)
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub async fn tick(&mut self, session: &mut Session, lock: ScreenLockStatus) -> DispatchOutcome {
        if !self.running {
            return DispatchOutcome::NotRunning;
        }
        if lock.is_locked() {
            debug!("screen is locked, skipping analysis");
            return DispatchOutcome::ScreenLocked;
        }

        self.reap_finished().await;

        if self.active.len() >= self.config.max_concurrency {
            debug!(
                "analysis pool at capacity ({}/{}), skipping tick",
                self.active.len(),
                self.config.max_concurrency
            );
            return DispatchOutcome::AtCapacity;
        }

        let Some(record) = CaptureLog::new(&session.capture_dir).latest() else {
            debug!("no capture available for analysis yet");
            return DispatchOutcome::NoCapture;
        };

        let app = record.app();
        let app_change = session.app_tracker.observe(&app);
        let image_num = session.next_image_number();
        let notification = session.take_notification_pending();

        let task = session.task_or_default().to_string();
        let prompt = build_analysis_prompt(
            &task,
            PromptContext {
                clarification: &session.clarification,
                reflection_intentions: &session.reflection_intentions,
                reflection_rules: &session.reflection_rules,
            },
            Some(&app),
        );

        let request = AnalysisRequest {
            prompt,
            images: vec![record.file_path.clone()],
            image_num,
            app_change,
            session: session.session_info(notification),
            opacity: session.opacity,
            dashboard_position: session.dashboard_position,
            frontmost: Some(app),
        };

        self.next_id += 1;
        let id = WorkerId(self.next_id);
        let worker = AnalysisWorker::new(
            id,
            request,
            Arc::clone(&self.client),
            self.config.max_image_bytes,
        );
        self.active.insert(id, worker.spawn(self.completions.clone()));
        debug!(
            "dispatched {id} for {} (image #{image_num}, {} active)",
            record.image_file,
            self.active.len()
        );

        DispatchOutcome::Dispatched {
            id,
            image_num,
            app_change,
        }
    }

    /// Drops a worker that has reported completion and waits for its task to exit.
    pub async fn release(&mut self, id: WorkerId) {
        if let Some(handle) = self.active.remove(&id) {
            handle.join().await;
        }
    }

    async fn reap_finished(&mut self) -> usize {
        let finished: Vec<WorkerId> = self
            .active
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in &finished {
            self.release(*id).await;
        }
        if !finished.is_empty() {
            debug!("reaped {} finished workers", finished.len());
        }
        finished.len()
    }

    /// Stops dispatching, then cancels every worker with a bounded grace period each.
    pub async fn stop(&mut self) -> StopSummary {
        self.running = false;

        let mut summary = StopSummary::default();
        let active = std::mem::take(&mut self.active);
        for handle in active.values() {
            handle.cancel();
        }
        for (_, handle) in active {
            match handle.shutdown(self.config.stop_grace).await {
                ShutdownOutcome::Graceful => summary.graceful += 1,
                ShutdownOutcome::Aborted => summary.aborted += 1,
            }
        }

        if summary.graceful + summary.aborted > 0 {
            info!(
                "analysis pool stopped ({} graceful, {} aborted)",
                summary.graceful, summary.aborted
            );
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::{AnalysisWorkerPool, DispatchOutcome, PoolConfig};
    use crate::analysis::ScriptedInferenceClient;
    use crate::capture_log::{CaptureLog, CaptureRecord};
    use crate::config::MonitorConfig;
    use crate::frontmost::FrontmostApp;
    use crate::session::Session;
    use crate::system_activity::ScreenLockStatus;
    use crate::worker::{WorkerId, WorkerOutcome};
    use chrono::{Local, Utc};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(max_concurrency: usize) -> PoolConfig {
        PoolConfig {
            max_concurrency,
            max_image_bytes: 1024,
            stop_grace: Duration::from_secs(2),
        }
    }

    fn session(root: &Path) -> Session {
        Session::start(
            &MonitorConfig::default(),
            root,
            Some("Write report".to_string()),
            Local::now(),
        )
    }

    fn record_capture(session: &Session, name: &str, app: &FrontmostApp) {
        std::fs::create_dir_all(&session.capture_dir).expect("capture dir");
        let path = session.capture_dir.join(name);
        std::fs::write(&path, b"img").expect("image");
        CaptureLog::new(&session.capture_dir)
            .append(&CaptureRecord::new(
                Utc::now(),
                path,
                session.capture_dir.clone(),
                app,
            ))
            .expect("metadata");
    }

    #[tokio::test]
    async fn skips_without_capture_or_when_locked_or_stopped() {
        let temp = tempdir().expect("tempdir");
        let mut session = session(temp.path());
        let client = Arc::new(ScriptedInferenceClient::new(json!({"output": 0.0})));
        let (mut pool, _rx) = AnalysisWorkerPool::new(client.clone(), config(4));

        assert_eq!(
            pool.tick(&mut session, ScreenLockStatus::Unlocked).await,
            DispatchOutcome::NotRunning
        );
        pool.start();
        assert_eq!(
            pool.tick(&mut session, ScreenLockStatus::Unlocked).await,
            DispatchOutcome::NoCapture
        );

        record_capture(&session, "a.jpg", &FrontmostApp::new("Code", None));
        assert_eq!(
            pool.tick(&mut session, ScreenLockStatus::Locked).await,
            DispatchOutcome::ScreenLocked
        );
        assert_eq!(session.image_sequence, 0);
        assert!(client.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_concurrency() {
        let temp = tempdir().expect("tempdir");
        let mut session = session(temp.path());
        record_capture(&session, "a.jpg", &FrontmostApp::new("Code", None));
        let client = Arc::new(
            ScriptedInferenceClient::new(json!({"output": 0.0})).with_delay(Duration::from_secs(60)),
        );
        let (mut pool, mut rx) = AnalysisWorkerPool::new(client.clone(), config(2));
        pool.start();

        let mut dispatched = 0;
        for _ in 0..5 {
            if matches!(
                pool.tick(&mut session, ScreenLockStatus::Unlocked).await,
                DispatchOutcome::Dispatched { .. }
            ) {
                dispatched += 1;
            }
            assert!(pool.active_count() <= 2);
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatched, 2);
        assert_eq!(client.requests().len(), 2);
        assert_eq!(session.image_sequence, 2);

        let summary = pool.stop().await;
        assert_eq!(summary.graceful, 2);
        assert_eq!(pool.active_count(), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(
            pool.tick(&mut session, ScreenLockStatus::Unlocked).await,
            DispatchOutcome::NotRunning
        );
    }

    #[tokio::test]
    async fn completion_is_reported_and_released() {
        let temp = tempdir().expect("tempdir");
        let mut session = session(temp.path());
        record_capture(&session, "a.jpg", &FrontmostApp::new("Code", None));
        let client = Arc::new(ScriptedInferenceClient::new(
            json!({"output": 0.4, "reason": "docs", "message": "Nice", "image_id": "i1"}),
        ));
        let (mut pool, mut rx) = AnalysisWorkerPool::new(client, config(1));
        pool.start();

        let outcome = pool.tick(&mut session, ScreenLockStatus::Unlocked).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                id: WorkerId(1),
                image_num: 1,
                app_change: false
            }
        );

        let completion = rx.recv().await.expect("completion");
        assert_eq!(completion.id, WorkerId(1));
        let WorkerOutcome::Completed(result) = completion.outcome else {
            panic!("expected a result");
        };
        assert_eq!(
            result.primary_analyzed_image,
            Some(session.capture_dir.join("a.jpg"))
        );

        pool.release(completion.id).await;
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn finished_workers_are_reaped_on_next_tick() {
        let temp = tempdir().expect("tempdir");
        let mut session = session(temp.path());
        record_capture(&session, "a.jpg", &FrontmostApp::new("Code", None));
        let client = Arc::new(ScriptedInferenceClient::new(json!({"output": 0.0})));
        let (mut pool, mut rx) = AnalysisWorkerPool::new(client, config(1));
        pool.start();

        pool.tick(&mut session, ScreenLockStatus::Unlocked).await;
        rx.recv().await.expect("completion");
        while pool.active.values().any(|handle| !handle.is_finished()) {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            pool.tick(&mut session, ScreenLockStatus::Unlocked).await,
            DispatchOutcome::Dispatched { image_num: 2, .. }
        ));
    }

    #[tokio::test]
    async fn request_carries_app_change_and_pending_notification() {
        let temp = tempdir().expect("tempdir");
        let mut session = session(temp.path());
        let client = Arc::new(ScriptedInferenceClient::new(json!({"output": 0.0})));
        let (mut pool, mut rx) = AnalysisWorkerPool::new(client.clone(), config(4));
        pool.start();

        record_capture(&session, "a.jpg", &FrontmostApp::new("Code", None));
        pool.tick(&mut session, ScreenLockStatus::Unlocked).await;
        rx.recv().await.expect("first completion");

        session.notification_pending = true;
        record_capture(
            &session,
            "b.jpg",
            &FrontmostApp::new("Safari", Some("https://youtube.com".to_string())),
        );
        pool.tick(&mut session, ScreenLockStatus::Unlocked).await;
        rx.recv().await.expect("second completion");

        let requests = client.requests();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].app_change);
        assert!(!requests[0].session_info.notification);
        assert!(requests[1].app_change);
        assert!(requests[1].session_info.notification);
        assert_eq!(requests[1].image_file, "b.jpg");
        assert_eq!(requests[1].image_num, 2);
        assert!(!session.notification_pending);
        let frontmost = requests[1].frontmost_app.as_ref().expect("frontmost");
        assert_eq!(frontmost.app_name, "Safari");
        assert!(requests[1].prompt.contains("Currently active application: Safari"));
    }
}
