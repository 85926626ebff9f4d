use crate::analysis::{
    AnalysisResult, FeedbackKind, FeedbackRequest, InferenceClient, encode_images,
};
use crate::capture::{CaptureLimits, CaptureOutcome, CaptureScheduler};
use crate::capture_log::{JsonArrayLog, RESULT_LOG_FILE, ResultLog, ResultLogEntry};
use crate::config::MonitorConfig;
use crate::focus::{
    AttentionState, FocusStateMachine, FocusThresholds, NotificationDraft, NotificationKind,
};
use crate::learning::{FeedbackCase, REFLECTION_LOG_FILE, Reflection, ReflectionLogEntry};
use crate::notification::{Notification, NotificationCenter, NotificationId, ResultSnapshot};
use crate::pool::{AnalysisWorkerPool, DispatchOutcome, PoolConfig};
use crate::prompt::build_reflection_prompt;
use crate::scheduler::{Scheduler, SessionLimit};
use crate::screenshot::CaptureProvider;
use crate::session::Session;
use crate::storage::{EvictionOutcome, StorageQuotaManager};
use crate::worker::{WorkerCompletion, WorkerId, WorkerOutcome};
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MAX_IDLE_WAIT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Stop,
    Feedback {
        id: NotificationId,
        kind: FeedbackKind,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Started {
        session_id: String,
        task: String,
        capture_dir: PathBuf,
    },
    Paused,
    Resumed,
    CaptureSaved {
        path: PathBuf,
    },
    CaptureSkipped {
        reason: String,
    },
    CaptureFailed {
        message: String,
    },
    StorageEvicted {
        deleted_files: usize,
        freed_bytes: u64,
        remaining_bytes: u64,
    },
    AnalysisDispatched {
        worker: WorkerId,
        image_num: u64,
        app_change: bool,
    },
    AnalysisFailed {
        worker: WorkerId,
        message: String,
    },
    StateUpdated {
        state: AttentionState,
        message: String,
        score: f64,
    },
    Notified(Notification),
    FeedbackSubmitted {
        id: NotificationId,
        kind: FeedbackKind,
    },
    FeedbackIgnored {
        id: NotificationId,
    },
    FeedbackLearned {
        id: NotificationId,
        intention: String,
        rule: String,
    },
    Stopped,
    Completed(MonitorSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub captures: u64,
    pub capture_skips: u64,
    pub capture_failures: u64,
    pub analyses_dispatched: u64,
    pub results_applied: u64,
    pub analysis_failures: u64,
    pub notifications: u64,
    pub feedback_sent: u64,
    pub feedback_learned: u64,
}

/// What came back from one feedback upload. `reply` is `None` when the upload failed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackReply {
    pub id: NotificationId,
    pub case: FeedbackCase,
    pub reply: Option<Value>,
}

/// Owns every piece of mutable session state. All mutation happens on the task that drives
/// [`Monitor::run`]; workers only talk back through the completion channel.
pub struct Monitor {
    config: MonitorConfig,
    session: Session,
    provider: Arc<dyn CaptureProvider>,
    client: Arc<dyn InferenceClient>,
    capture: CaptureScheduler,
    pool: AnalysisWorkerPool,
    completions: Option<mpsc::UnboundedReceiver<WorkerCompletion>>,
    focus: FocusStateMachine,
    notifications: NotificationCenter,
    result_log: ResultLog,
    reflection_log: JsonArrayLog<ReflectionLogEntry>,
    last_result: ResultSnapshot,
    feedback_tasks: JoinSet<FeedbackReply>,
    summary: MonitorSummary,
    stopped: bool,
    event_tx: Option<mpsc::UnboundedSender<MonitorEvent>>,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        session: Session,
        screenshots_root: &Path,
        provider: Arc<dyn CaptureProvider>,
        client: Arc<dyn InferenceClient>,
    ) -> Self {
        let quota = StorageQuotaManager::new(screenshots_root, config.capture.quota_check_interval);
        let capture = CaptureScheduler::new(
            Arc::clone(&provider),
            quota,
            CaptureLimits {
                storage_limit_bytes: config.capture.storage_limit_bytes,
                eviction_target_bytes: config.capture.eviction_target_bytes,
            },
        );
        let (pool, completions) = AnalysisWorkerPool::new(
            Arc::clone(&client),
            PoolConfig {
                max_concurrency: config.analysis.max_concurrency,
                max_image_bytes: config.analysis.max_image_bytes,
                stop_grace: config.analysis.stop_grace,
            },
        );

        Self {
            focus: FocusStateMachine::new(FocusThresholds::from(&config.focus)),
            notifications: NotificationCenter::new(session.mode),
            result_log: ResultLog::new(session.capture_dir.join(RESULT_LOG_FILE)),
            reflection_log: JsonArrayLog::new(session.capture_dir.join(REFLECTION_LOG_FILE)),
            config,
            session,
            provider,
            client,
            capture,
            pool,
            completions: Some(completions),
            last_result: ResultSnapshot::default(),
            feedback_tasks: JoinSet::new(),
            summary: MonitorSummary::default(),
            stopped: false,
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<MonitorEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn focus(&self) -> &FocusStateMachine {
        &self.focus
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn summary(&self) -> MonitorSummary {
        self.summary
    }

    pub fn active_workers(&self) -> usize {
        self.pool.active_count()
    }

    pub fn start(&mut self) {
        self.capture.start();
        self.pool.start();
        info!(
            "monitor session {} started for task {:?}",
            self.session.id,
            self.session.task_or_default()
        );
        self.send(MonitorEvent::Started {
            session_id: self.session.id.clone(),
            task: self.session.task_or_default().to_string(),
            capture_dir: self.session.capture_dir.clone(),
        });
    }

    pub async fn on_capture_tick(&mut self) {
        match self.capture.tick(&self.session).await {
            CaptureOutcome::NotRunning => {}
            CaptureOutcome::ScreenLocked => {
                self.summary.capture_skips += 1;
                self.send(MonitorEvent::CaptureSkipped {
                    reason: "screen locked".to_string(),
                });
            }
            CaptureOutcome::QuotaExceeded { eviction } => {
                self.summary.capture_skips += 1;
                self.send_eviction(eviction);
                self.send(MonitorEvent::CaptureSkipped {
                    reason: "storage limit exceeded".to_string(),
                });
            }
            CaptureOutcome::Saved { record, eviction } => {
                self.summary.captures += 1;
                if let Some(eviction) = eviction {
                    self.send_eviction(eviction);
                }
                self.send(MonitorEvent::CaptureSaved {
                    path: record.file_path,
                });
            }
            CaptureOutcome::Failed { message } => {
                self.summary.capture_failures += 1;
                self.send(MonitorEvent::CaptureFailed { message });
            }
        }
    }

    pub async fn on_analysis_tick(&mut self) {
        let lock = self.provider.screen_lock_status();
        if let DispatchOutcome::Dispatched {
            id,
            image_num,
            app_change,
        } = self.pool.tick(&mut self.session, lock).await
        {
            self.summary.analyses_dispatched += 1;
            self.send(MonitorEvent::AnalysisDispatched {
                worker: id,
                image_num,
                app_change,
            });
        }
    }

    pub async fn on_worker_completion(&mut self, completion: WorkerCompletion) {
        self.pool.release(completion.id).await;
        match completion.outcome {
            WorkerOutcome::Completed(result) => self.apply_result(&result),
            WorkerOutcome::Failed(err) => {
                if self.stopped {
                    return;
                }
                self.summary.analysis_failures += 1;
                self.send(MonitorEvent::AnalysisFailed {
                    worker: completion.id,
                    message: err.to_string(),
                });
            }
        }
    }

    /// Feeds one result through the state machine and emits the resulting UI update and
    /// notifications. Results that arrive after stop are dropped.
    pub fn apply_result(&mut self, result: &AnalysisResult) {
        if self.stopped {
            debug!("ignoring analysis result received after stop");
            return;
        }

        let update = self.focus.apply(result.output_score, &result.message);
        self.summary.results_applied += 1;
        self.last_result = ResultSnapshot {
            response: Some(result.raw.clone()),
            image_path: result.primary_analyzed_image.clone(),
            image_id: result.image_id.clone(),
        };

        if let Err(err) = self.result_log.append(ResultLogEntry {
            timestamp: Utc::now(),
            result: result.raw.clone(),
        }) {
            warn!("failed to append analysis result: {err:#}");
        }

        debug!(
            "score {:.2} -> {} ({})",
            update.score, update.state, update.message
        );
        self.send(MonitorEvent::StateUpdated {
            state: update.state,
            message: update.message,
            score: update.score,
        });

        for draft in update.notifications {
            if draft.kind == NotificationKind::Reminder
                && !self.session.mode.distraction_reminders()
            {
                debug!(
                    "sustained distraction reminder suppressed in {} mode",
                    self.session.mode.as_str()
                );
                continue;
            }
            self.notify(draft);
        }
    }

    /// Periodic task reminder; only active in reminder mode.
    pub fn on_reminder_tick(&mut self) {
        if self.stopped || !self.session.mode.periodic_reminders() {
            return;
        }
        self.notifications.evict_excess();
        let message = format!("Your intention is \"{}\"!", self.session.task_or_default());
        self.notify(NotificationDraft {
            kind: NotificationKind::TaskReminder,
            judgement: AttentionState::Focused,
            message,
        });
        self.notifications.evict_excess();
    }

    /// Resolves a good/bad rating against its stored context and submits it off the loop.
    pub fn on_feedback(&mut self, id: NotificationId, kind: FeedbackKind) {
        let Some(context) = self.notifications.context(&id).cloned() else {
            warn!("feedback for unknown or expired notification {id}");
            self.send(MonitorEvent::FeedbackIgnored { id });
            return;
        };

        let response = context
            .response
            .as_ref()
            .map(|value| value.to_string())
            .unwrap_or_default();
        let images = context
            .image_path
            .as_ref()
            .map(|path| {
                encode_images(
                    std::slice::from_ref(path),
                    self.config.analysis.max_image_bytes,
                )
            })
            .unwrap_or_default()
            .into_iter()
            .map(|image| image.data)
            .collect();

        let request = FeedbackRequest {
            user_id: self.session.user_id.clone(),
            session_id: self.session.id.clone(),
            image_id: context.image_id.clone(),
            rating: kind,
            ai_judgement: context.ai_judgement.judgement(),
            reflection_prompt: build_reflection_prompt(&context.task_name, &response, kind.as_str()),
            images,
            session_info: self.session.session_info(false),
        };

        let case = FeedbackCase::new(context.ai_judgement, kind);
        let client = Arc::clone(&self.client);
        self.feedback_tasks.spawn(async move {
            let reply = match client.submit_feedback(&request).await {
                Ok(reply) => {
                    info!("submitted {case} feedback for notification {id}");
                    Some(reply)
                }
                Err(err) => {
                    warn!("feedback submission for notification {id} failed: {err:#}");
                    None
                }
            };
            FeedbackReply { id, case, reply }
        });

        self.summary.feedback_sent += 1;
        self.notifications.evict_excess();
        self.send(MonitorEvent::FeedbackSubmitted { id, kind });
    }

    /// Waits for the next finished feedback upload. Returns `None` when none are pending.
    pub async fn next_feedback_reply(&mut self) -> Option<FeedbackReply> {
        while let Some(joined) = self.feedback_tasks.join_next().await {
            match joined {
                Ok(reply) => return Some(reply),
                Err(err) if err.is_panic() => warn!("feedback task panicked: {err}"),
                Err(_) => {}
            }
        }
        None
    }

    /// Turns the reflection in a feedback reply into a learned intention and rule for the
    /// following analysis prompts.
    pub fn apply_feedback_reply(&mut self, reply: FeedbackReply) {
        if self.stopped {
            return;
        }
        let Some(value) = reply.reply else {
            return;
        };
        let Some(reflection) = Reflection::from_reply(&value) else {
            debug!("feedback reply for {} carried no usable reflection", reply.id);
            return;
        };

        let learned = reflection.learn(reply.case);
        self.session.reflection_intentions.push(learned.intention.clone());
        self.session.reflection_rules.push(learned.rule.clone());
        self.summary.feedback_learned += 1;
        info!(
            "learned from {} feedback ({} intentions, {} rules)",
            reply.case,
            self.session.reflection_intentions.len(),
            self.session.reflection_rules.len()
        );

        if let Err(err) = self.reflection_log.append(ReflectionLogEntry {
            timestamp: Utc::now(),
            session_id: self.session.id.clone(),
            task_name: self.session.task_or_default().to_string(),
            feedback_case: reply.case.to_string(),
            reflection: value,
        }) {
            warn!("failed to append reflection: {err:#}");
        }

        self.send(MonitorEvent::FeedbackLearned {
            id: reply.id,
            intention: learned.intention,
            rule: learned.rule,
        });
    }

    /// Stops both schedulers, cancels in-flight workers and waits for pending feedback uploads.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.capture.stop();
        let workers = self.pool.stop().await;
        if workers.aborted > 0 {
            warn!(
                "{} analysis workers aborted at stop ({} exited cleanly)",
                workers.aborted, workers.graceful
            );
        }

        let drain = async {
            while self.feedback_tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.analysis.feedback_timeout, drain)
            .await
            .is_err()
        {
            warn!("abandoning feedback uploads still pending at stop");
            self.feedback_tasks.abort_all();
        }

        info!("monitor session {} stopped", self.session.id);
        self.send(MonitorEvent::Stopped);
    }

    pub async fn run(
        mut self,
        run_for: Option<Duration>,
        mut command_rx: Option<mpsc::UnboundedReceiver<ControlCommand>>,
    ) -> Result<MonitorSummary> {
        let mut capture_lane =
            Scheduler::new(self.config.capture.interval).map_err(anyhow::Error::msg)?;
        let mut analysis_lane =
            Scheduler::delayed(self.config.analysis.interval).map_err(anyhow::Error::msg)?;
        let mut reminder_lane =
            Scheduler::delayed(self.config.focus.periodic_reminder).map_err(anyhow::Error::msg)?;
        let reminders = self.session.mode.periodic_reminders();
        let limit = SessionLimit { run_for };
        let mut completions = self.completions.take();

        self.start();
        let start = Instant::now();
        let mut paused_at: Option<Instant> = None;

        loop {
            let elapsed = start.elapsed();
            if limit.is_finished(elapsed) {
                break;
            }

            // Each due lane runs at most once per pass, then the channels are always polled.
            if paused_at.is_none() {
                if capture_lane.is_due(start.elapsed()) {
                    self.on_capture_tick().await;
                    capture_lane.mark_run(start.elapsed());
                }
                if analysis_lane.is_due(start.elapsed()) {
                    self.on_analysis_tick().await;
                    analysis_lane.mark_run(start.elapsed());
                }
                if reminders && reminder_lane.is_due(start.elapsed()) {
                    self.on_reminder_tick();
                    reminder_lane.mark_run(start.elapsed());
                }
            }

            let elapsed = start.elapsed();
            let mut wait = MAX_IDLE_WAIT;
            if paused_at.is_none() {
                wait = wait
                    .min(capture_lane.time_until_due(elapsed))
                    .min(analysis_lane.time_until_due(elapsed));
                if reminders {
                    wait = wait.min(reminder_lane.time_until_due(elapsed));
                }
            }
            if let Some(remaining) = limit.remaining(elapsed) {
                wait = wait.min(remaining);
            }

            let wake = tokio::select! {
                Some(completion) = recv_or_pending(&mut completions) => Wake::Completion(completion),
                command = recv_or_pending(&mut command_rx) => Wake::Command(command),
                Some(reply) = self.next_feedback_reply(), if !self.feedback_tasks.is_empty() => {
                    Wake::Feedback(reply)
                }
                _ = tokio::time::sleep(wait) => Wake::Timer,
            };

            match wake {
                Wake::Timer => {}
                Wake::Completion(completion) => self.on_worker_completion(completion).await,
                Wake::Feedback(reply) => self.apply_feedback_reply(reply),
                Wake::Command(None) => command_rx = None,
                Wake::Command(Some(ControlCommand::Stop)) => break,
                Wake::Command(Some(ControlCommand::Pause)) => {
                    if paused_at.is_none() {
                        paused_at = Some(Instant::now());
                        info!("monitor paused");
                        self.send(MonitorEvent::Paused);
                    }
                }
                Wake::Command(Some(ControlCommand::Resume)) => {
                    if let Some(paused) = paused_at.take() {
                        let now = start.elapsed();
                        capture_lane.align_next_due(now);
                        analysis_lane.align_next_due(now);
                        reminder_lane.postpone(paused.elapsed());
                        info!("monitor resumed");
                        self.send(MonitorEvent::Resumed);
                    }
                }
                Wake::Command(Some(ControlCommand::Feedback { id, kind })) => {
                    self.on_feedback(id, kind)
                }
            }
        }

        self.stop().await;
        let summary = self.summary;
        self.send(MonitorEvent::Completed(summary));
        Ok(summary)
    }

    fn notify(&mut self, draft: NotificationDraft) {
        let task = self.session.task_or_default().to_string();
        let notification = self.notifications.emit(draft, &self.last_result, &task, Utc::now());
        self.session.notification_pending = true;
        self.summary.notifications += 1;
        info!(
            "notification {} ({:?}): {}",
            notification.id, notification.kind, notification.message
        );
        self.send(MonitorEvent::Notified(notification));
    }

    fn send_eviction(&self, eviction: EvictionOutcome) {
        if eviction.deleted_files > 0 {
            self.send(MonitorEvent::StorageEvicted {
                deleted_files: eviction.deleted_files,
                freed_bytes: eviction.freed_bytes,
                remaining_bytes: eviction.remaining_bytes,
            });
        }
    }

    fn send(&self, event: MonitorEvent) {
        send_event(&self.event_tx, event);
    }
}

enum Wake {
    Completion(WorkerCompletion),
    Command(Option<ControlCommand>),
    Feedback(FeedbackReply),
    Timer,
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn send_event(event_tx: &Option<mpsc::UnboundedSender<MonitorEvent>>, event: MonitorEvent) {
    if let Some(tx) = event_tx {
        let _ = tx.send(event);
    }
}
