use crate::capture_log::{CaptureLog, CaptureRecord};
use crate::frontmost::FrontmostApp;
use crate::screenshot::CaptureProvider;
use crate::session::Session;
use crate::storage::{EvictionOutcome, StorageQuotaManager};
use anyhow::{Context, Result};
use chrono::{Local, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    pub storage_limit_bytes: u64,
    pub eviction_target_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    NotRunning,
    ScreenLocked,
    /// Still over budget after eviction.
    QuotaExceeded { eviction: EvictionOutcome },
    Saved {
        record: CaptureRecord,
        eviction: Option<EvictionOutcome>,
    },
    Failed { message: String },
}

/// Periodic screen capture guarded by lock state and the storage quota.
pub struct CaptureScheduler {
    provider: Arc<dyn CaptureProvider>,
    quota: StorageQuotaManager,
    limits: CaptureLimits,
    running: bool,
}

impl CaptureScheduler {
    pub fn new(
        provider: Arc<dyn CaptureProvider>,
        quota: StorageQuotaManager,
        limits: CaptureLimits,
    ) -> Self {
        Self {
            provider,
            quota,
            limits,
            running: false,
        }
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// One capture tick. Never returns an error: failures come back as
    /// [`CaptureOutcome::Failed`] so the timer loop keeps going.
    pub async fn tick(&mut self, session: &Session) -> CaptureOutcome {
        if !self.running {
            return CaptureOutcome::NotRunning;
        }

        if self.provider.screen_lock_status().is_locked() {
            debug!("screen is locked, skipping capture");
            return CaptureOutcome::ScreenLocked;
        }

        let mut eviction = None;
        if !self.quota.is_under_budget(self.limits.storage_limit_bytes) {
            info!("capture storage limit exceeded, evicting old captures");
            let outcome = self.quota.evict_to_target(self.limits.eviction_target_bytes);
            self.quota.invalidate();
            if !self.quota.is_under_budget(self.limits.storage_limit_bytes) {
                warn!("capture storage still over limit after eviction, skipping capture");
                return CaptureOutcome::QuotaExceeded { eviction: outcome };
            }
            eviction = Some(outcome);
        }

        match self.capture_once(session).await {
            Ok(record) => CaptureOutcome::Saved { record, eviction },
            Err(err) => {
                warn!("capture failed: {err:#}");
                CaptureOutcome::Failed {
                    message: format!("{err:#}"),
                }
            }
        }
    }

    async fn capture_once(&self, session: &Session) -> Result<CaptureRecord> {
        let image = self
            .provider
            .capture_active_display()
            .await
            .context("screen capture failed")?;

        let app = match self.provider.frontmost_app().await {
            Ok(app) => app,
            Err(err) => {
                debug!("frontmost app lookup failed: {err:#}");
                FrontmostApp::unknown()
            }
        };

        std::fs::create_dir_all(&session.capture_dir).with_context(|| {
            format!(
                "failed to create capture directory {}",
                session.capture_dir.display()
            )
        })?;

        let path = self.image_path(session);
        std::fs::write(&path, &image)
            .with_context(|| format!("failed to write capture {}", path.display()))?;

        let record = CaptureRecord::new(Utc::now(), path, session.capture_dir.clone(), &app);
        if let Err(err) = CaptureLog::new(&session.capture_dir).append(&record) {
            warn!("failed to append capture metadata: {err:#}");
        }

        debug!(
            "captured {} ({} bytes, app {})",
            record.image_file,
            image.len(),
            record.frontmost_app
        );
        Ok(record)
    }

    fn image_path(&self, session: &Session) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        let extension = self.provider.file_extension();
        let mut path = session.capture_dir.join(format!("{stamp}.{extension}"));
        let mut suffix = 1;
        while path.exists() {
            path = session
                .capture_dir
                .join(format!("{stamp}-{suffix}.{extension}"));
            suffix += 1;
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::{CaptureLimits, CaptureOutcome, CaptureScheduler};
    use crate::capture_log::{CAPTURE_METADATA_FILE, CaptureLog};
    use crate::config::MonitorConfig;
    use crate::frontmost::FrontmostApp;
    use crate::screenshot::{CaptureProvider, MockCaptureProvider};
    use crate::session::Session;
    use crate::storage::StorageQuotaManager;
    use crate::system_activity::ScreenLockStatus;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use chrono::Local;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    const LIMITS: CaptureLimits = CaptureLimits {
        storage_limit_bytes: 1_000,
        eviction_target_bytes: 500,
    };

    fn session(root: &Path) -> Session {
        Session::start(
            &MonitorConfig::default(),
            root,
            Some("write tests".to_string()),
            Local::now(),
        )
    }

    fn scheduler(root: &Path, provider: impl CaptureProvider + 'static) -> CaptureScheduler {
        scheduler_with(root, provider, LIMITS)
    }

    fn scheduler_with(
        root: &Path,
        provider: impl CaptureProvider + 'static,
        limits: CaptureLimits,
    ) -> CaptureScheduler {
        let mut scheduler = CaptureScheduler::new(
            Arc::new(provider),
            StorageQuotaManager::new(root, Duration::from_secs(300)),
            limits,
        );
        scheduler.start();
        scheduler
    }

    fn image_count(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| crate::storage::is_image(&entry.path()))
                    .count()
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn saves_image_and_metadata_record() {
        let temp = tempdir().expect("tempdir");
        let session = session(temp.path());
        let mut scheduler = scheduler(
            temp.path(),
            MockCaptureProvider {
                app: FrontmostApp::new("Safari", Some("https://docs.rs".to_string())),
                ..MockCaptureProvider::default()
            },
        );

        let outcome = scheduler.tick(&session).await;
        let CaptureOutcome::Saved { record, eviction } = outcome else {
            panic!("expected a saved capture, got {outcome:?}");
        };
        assert!(eviction.is_none());
        assert!(record.file_path.is_file());
        assert_eq!(record.frontmost_app, "Safari");
        assert_eq!(std::fs::read(&record.file_path).expect("image"), b"mock-image");

        let latest = CaptureLog::new(&session.capture_dir)
            .latest()
            .expect("metadata record");
        assert_eq!(latest.image_file, record.image_file);
        assert_eq!(latest.url.as_deref(), Some("https://docs.rs"));
    }

    #[tokio::test]
    async fn locked_screen_never_creates_files() {
        let temp = tempdir().expect("tempdir");
        let session = session(temp.path());
        let mut scheduler = scheduler(
            temp.path(),
            MockCaptureProvider {
                lock_status: ScreenLockStatus::Locked,
                ..MockCaptureProvider::default()
            },
        );

        for _ in 0..3 {
            assert_eq!(scheduler.tick(&session).await, CaptureOutcome::ScreenLocked);
        }
        assert!(!session.capture_dir.exists());
    }

    #[tokio::test]
    async fn stopped_scheduler_is_noop() {
        let temp = tempdir().expect("tempdir");
        let session = session(temp.path());
        let mut scheduler = scheduler(temp.path(), MockCaptureProvider::default());
        scheduler.stop();

        assert_eq!(scheduler.tick(&session).await, CaptureOutcome::NotRunning);
        assert_eq!(image_count(&session.capture_dir), 0);
    }

    #[tokio::test]
    async fn tolerates_corrupt_metadata_log() {
        let temp = tempdir().expect("tempdir");
        let session = session(temp.path());
        std::fs::create_dir_all(&session.capture_dir).expect("capture dir");
        std::fs::write(session.capture_dir.join(CAPTURE_METADATA_FILE), "[{broken")
            .expect("corrupt metadata");

        let mut scheduler = scheduler(temp.path(), MockCaptureProvider::default());
        assert!(matches!(
            scheduler.tick(&session).await,
            CaptureOutcome::Saved { .. }
        ));
        assert_eq!(CaptureLog::new(&session.capture_dir).records().len(), 1);
    }

    #[tokio::test]
    async fn evicts_before_capturing_when_over_quota() {
        let temp = tempdir().expect("tempdir");
        let session = session(temp.path());
        let old_dir = temp.path().join("old_session");
        std::fs::create_dir_all(&old_dir).expect("old dir");
        std::fs::write(old_dir.join("a.jpg"), vec![0u8; 600]).expect("old image");
        std::fs::write(old_dir.join("b.jpg"), vec![0u8; 600]).expect("old image");

        let mut scheduler = scheduler(temp.path(), MockCaptureProvider::default());
        let outcome = scheduler.tick(&session).await;
        let CaptureOutcome::Saved { eviction, .. } = outcome else {
            panic!("expected a saved capture, got {outcome:?}");
        };
        let eviction = eviction.expect("eviction ran");
        assert_eq!(eviction.deleted_files, 2);
        assert_eq!(image_count(&session.capture_dir), 1);
    }

    #[tokio::test]
    async fn skips_capture_when_eviction_cannot_get_under_limit() {
        let temp = tempdir().expect("tempdir");
        let session = session(temp.path());
        let old_dir = temp.path().join("old_session");
        std::fs::create_dir_all(&old_dir).expect("old dir");
        std::fs::write(old_dir.join("a.jpg"), vec![0u8; 600]).expect("old image");
        std::fs::write(old_dir.join("b.jpg"), vec![0u8; 600]).expect("old image");

        // A target above the limit leaves the tree over budget.
        let mut scheduler = scheduler_with(
            temp.path(),
            MockCaptureProvider::default(),
            CaptureLimits {
                storage_limit_bytes: 1_000,
                eviction_target_bytes: 2_000,
            },
        );
        let outcome = scheduler.tick(&session).await;
        let CaptureOutcome::QuotaExceeded { eviction } = outcome else {
            panic!("expected quota exceeded, got {outcome:?}");
        };
        assert_eq!(eviction.deleted_files, 0);
        assert_eq!(eviction.remaining_bytes, 1_200);
        assert!(!session.capture_dir.exists());
        assert_eq!(image_count(&old_dir), 2);
        assert!(scheduler.is_running());
    }

    #[derive(Debug, Default)]
    struct FailingProvider;

    #[async_trait]
    impl CaptureProvider for FailingProvider {
        async fn capture_active_display(&self) -> Result<Vec<u8>> {
            Err(anyhow!("intentional capture failure"))
        }

        fn screen_lock_status(&self) -> ScreenLockStatus {
            ScreenLockStatus::NotSupported
        }

        async fn frontmost_app(&self) -> Result<FrontmostApp> {
            Err(anyhow!("no frontmost app"))
        }
    }

    #[tokio::test]
    async fn capture_failures_are_reported_not_raised() {
        let temp = tempdir().expect("tempdir");
        let session = session(temp.path());
        let mut scheduler = scheduler(temp.path(), FailingProvider);

        let outcome = scheduler.tick(&session).await;
        let CaptureOutcome::Failed { message } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(message.contains("intentional capture failure"));
        assert!(CaptureLog::new(&session.capture_dir).records().is_empty());
        assert!(scheduler.is_running());
    }
}
