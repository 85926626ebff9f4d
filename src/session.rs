use crate::analysis::SessionInfo;
use crate::config::{MonitorConfig, OperatingMode};
use crate::frontmost::AppChangeTracker;
use crate::learning::load_clarification_intentions;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const NO_TASK: &str = "No task specified";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardPosition {
    pub x: i32,
    pub y: i32,
}

/// State scoped to one focus session: created when a task is set, dropped on stop.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub task_name: Option<String>,
    pub user_id: String,
    pub device_name: String,
    pub mode: OperatingMode,
    pub capture_dir: PathBuf,
    pub image_sequence: u64,
    pub notification_pending: bool,
    pub opacity: f64,
    pub dashboard_position: DashboardPosition,
    pub clarification: Vec<String>,
    pub reflection_intentions: Vec<String>,
    pub reflection_rules: Vec<String>,
    pub app_tracker: AppChangeTracker,
}

impl Session {
    pub fn start(
        config: &MonitorConfig,
        screenshots_root: &Path,
        task_name: Option<String>,
        started_at: DateTime<Local>,
    ) -> Self {
        let id = started_at.format("%Y%m%d_%H%M%S").to_string();
        let task_name = task_name
            .map(|task| task.trim().to_string())
            .filter(|task| !task.is_empty());
        let capture_dir = match &task_name {
            Some(task) => screenshots_root.join(format!("{}_{id}", sanitize_dir_component(task))),
            None => screenshots_root.to_path_buf(),
        };

        Self {
            id,
            task_name,
            user_id: config.user_id.clone(),
            device_name: config.device_name.clone(),
            mode: config.mode,
            capture_dir,
            image_sequence: 0,
            notification_pending: false,
            opacity: 1.0,
            dashboard_position: DashboardPosition::default(),
            clarification: Vec::new(),
            reflection_intentions: Vec::new(),
            reflection_rules: Vec::new(),
            app_tracker: AppChangeTracker::new(),
        }
    }

    /// Loads the clarified intentions saved for this session's task, if any.
    pub fn with_clarification(mut self, dir: &Path) -> Self {
        if let Some(task) = &self.task_name {
            self.clarification = load_clarification_intentions(dir, task);
        }
        self
    }

    pub fn task_or_default(&self) -> &str {
        self.task_name.as_deref().unwrap_or(NO_TASK)
    }

    /// Advances and returns the per-session image counter; the first analyzed image is 1.
    pub fn next_image_number(&mut self) -> u64 {
        self.image_sequence += 1;
        self.image_sequence
    }

    pub fn session_info(&self, notification: bool) -> SessionInfo {
        let task = self.task_or_default().to_string();
        SessionInfo {
            user_id: self.user_id.clone(),
            session_id: self.id.clone(),
            task_name: task.clone(),
            intention: task,
            device_name: self.device_name.clone(),
            app_mode: self.mode,
            notification,
        }
    }

    /// Returns the pending-notification flag and clears it.
    pub fn take_notification_pending(&mut self) -> bool {
        std::mem::take(&mut self.notification_pending)
    }
}

fn sanitize_dir_component(task: &str) -> String {
    task.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{NO_TASK, Session};
    use crate::config::MonitorConfig;
    use chrono::{Local, TimeZone};
    use serde_json::json;
    use std::path::Path;
    use tempfile::tempdir;

    fn started() -> chrono::DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 7, 4, 9, 30, 0)
            .single()
            .expect("valid time")
    }

    #[test]
    fn task_session_gets_its_own_capture_dir() {
        let session = Session::start(
            &MonitorConfig::default(),
            Path::new("/tmp/shots"),
            Some("write report/draft".to_string()),
            started(),
        );
        assert_eq!(session.id, "20240704_093000");
        assert_eq!(
            session.capture_dir,
            Path::new("/tmp/shots").join("write report_draft_20240704_093000")
        );
        assert_eq!(session.image_sequence, 0);
    }

    #[test]
    fn session_without_task_uses_root() {
        let session = Session::start(
            &MonitorConfig::default(),
            Path::new("/tmp/shots"),
            Some("   ".to_string()),
            started(),
        );
        assert_eq!(session.capture_dir, Path::new("/tmp/shots"));
        assert_eq!(session.task_or_default(), NO_TASK);
    }

    #[test]
    fn counters_and_flags() {
        let mut session =
            Session::start(&MonitorConfig::default(), Path::new("/tmp"), None, started());
        assert_eq!(session.next_image_number(), 1);
        assert_eq!(session.next_image_number(), 2);

        session.notification_pending = true;
        assert!(session.take_notification_pending());
        assert!(!session.take_notification_pending());
    }

    #[test]
    fn clarification_is_loaded_for_the_task() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(
            temp.path().join("Write_report_clarification.json"),
            json!({"augmented_intentions": ["Editing the outline"]}).to_string(),
        )
        .expect("clarification file");

        let session = Session::start(
            &MonitorConfig::default(),
            Path::new("/tmp/shots"),
            Some("Write report".to_string()),
            started(),
        )
        .with_clarification(temp.path());
        assert_eq!(session.clarification, vec!["Editing the outline".to_string()]);

        let untasked =
            Session::start(&MonitorConfig::default(), Path::new("/tmp"), None, started())
                .with_clarification(temp.path());
        assert!(untasked.clarification.is_empty());
    }
}
