use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIB: u64 = 1024 * 1024;

/// Which feedback surface the monitor runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Notifications carry good/bad feedback buttons.
    #[default]
    Full,
    /// Informational notifications only.
    Basic,
    /// Informational notifications plus the periodic task reminder.
    Reminder,
}

impl OperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Full => "full",
            OperatingMode::Basic => "basic",
            OperatingMode::Reminder => "reminder",
        }
    }

    pub fn feedback_enabled(&self) -> bool {
        matches!(self, OperatingMode::Full)
    }

    /// How many notification contexts are retained for later feedback.
    pub fn context_capacity(&self) -> usize {
        match self {
            OperatingMode::Full => 10,
            OperatingMode::Basic | OperatingMode::Reminder => 3,
        }
    }

    /// Whether sustained distraction raises repeated reminders.
    pub fn distraction_reminders(&self) -> bool {
        matches!(self, OperatingMode::Full)
    }

    pub fn periodic_reminders(&self) -> bool {
        matches!(self, OperatingMode::Reminder)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub endpoint: String,
    pub user_id: String,
    pub device_name: String,
    pub mode: OperatingMode,
    pub capture: CaptureConfig,
    pub analysis: AnalysisConfig,
    pub focus: FocusConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
            user_id: "default_user".to_string(),
            device_name: "mac_os_device".to_string(),
            mode: OperatingMode::default(),
            capture: CaptureConfig::default(),
            analysis: AnalysisConfig::default(),
            focus: FocusConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    #[serde(deserialize_with = "human_duration")]
    pub interval: Duration,
    pub storage_limit_bytes: u64,
    pub eviction_target_bytes: u64,
    #[serde(deserialize_with = "human_duration")]
    pub quota_check_interval: Duration,
    pub file_extension: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            storage_limit_bytes: 3 * GIB,
            eviction_target_bytes: 5 * GIB / 2,
            quota_check_interval: Duration::from_secs(5 * 60),
            file_extension: "jpg".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    #[serde(deserialize_with = "human_duration")]
    pub interval: Duration,
    pub max_concurrency: usize,
    #[serde(deserialize_with = "human_duration")]
    pub request_timeout: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub feedback_timeout: Duration,
    pub max_image_bytes: u64,
    #[serde(deserialize_with = "human_duration")]
    pub stop_grace: Duration,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_concurrency: 4,
            request_timeout: Duration::from_secs(10),
            feedback_timeout: Duration::from_secs(30),
            max_image_bytes: 5 * MIB,
            stop_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    pub distraction_threshold: f64,
    pub acquire_threshold: u32,
    pub release_threshold: u32,
    pub reminder_threshold: u32,
    #[serde(deserialize_with = "human_duration")]
    pub periodic_reminder: Duration,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            distraction_threshold: 0.6,
            acquire_threshold: 2,
            release_threshold: 2,
            reminder_threshold: 15,
            periodic_reminder: Duration::from_secs(25 * 60),
        }
    }
}

fn human_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

impl MonitorConfig {
    /// Loads the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read monitor config {}", path.display()))?;

        let config: MonitorConfig = toml::from_str(&text).with_context(|| {
            format!(
                "failed to parse monitor config {} (expected TOML)",
                path.display()
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.analysis.max_concurrency == 0 {
            anyhow::bail!("analysis.max_concurrency must be at least 1");
        }
        if self.capture.eviction_target_bytes > self.capture.storage_limit_bytes {
            anyhow::bail!("capture.eviction_target_bytes must not exceed capture.storage_limit_bytes");
        }
        if !(0.0..=1.0).contains(&self.focus.distraction_threshold) {
            anyhow::bail!("focus.distraction_threshold must be within 0.0..=1.0");
        }
        Ok(())
    }
}

pub fn ensure_sample_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create config parent directory {}",
                parent.display()
            )
        })?;
    }

    let sample = r#"# Intention Monitor configuration (TOML)
#
# Every key is optional; omitted keys use the defaults shown here.

endpoint = "http://127.0.0.1:8080"
user_id = "default_user"
device_name = "mac_os_device"
# full | basic | reminder
mode = "full"

[capture]
interval = "2s"
storage_limit_bytes = 3221225472
eviction_target_bytes = 2684354560
quota_check_interval = "5m"
file_extension = "jpg"

[analysis]
interval = "2s"
max_concurrency = 4
request_timeout = "10s"
feedback_timeout = "30s"
max_image_bytes = 5242880
stop_grace = "2s"

[focus]
distraction_threshold = 0.6
acquire_threshold = 2
release_threshold = 2
reminder_threshold = 15
periodic_reminder = "25m"
"#;

    std::fs::write(path, sample)
        .with_context(|| format!("failed to write sample config {}", path.display()))?;
    Ok(())
}
