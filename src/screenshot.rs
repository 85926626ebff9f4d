use crate::frontmost::{FrontmostApp, truncate_url};
use crate::system_activity::{ScreenLockStatus, screen_lock_status};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Everything the monitor needs from the desktop session.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    /// Encoded image of the active display. The bytes are opaque to the monitor.
    async fn capture_active_display(&self) -> Result<Vec<u8>>;

    fn screen_lock_status(&self) -> ScreenLockStatus;

    async fn frontmost_app(&self) -> Result<FrontmostApp>;

    /// Extension used for files written from [`CaptureProvider::capture_active_display`].
    fn file_extension(&self) -> &str {
        "jpg"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MacOsCaptureProvider;

const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(10);
const FRONTMOST_TIMEOUT: Duration = Duration::from_secs(2);
const BROWSER_URL_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
impl CaptureProvider for MacOsCaptureProvider {
    async fn capture_active_display(&self) -> Result<Vec<u8>> {
        let scratch = std::env::temp_dir().join(format!(
            "intention-monitor-{}-{}.jpg",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        ));

        let mut command = Command::new("screencapture");
        command
            .arg("-x")
            .arg("-t")
            .arg("jpg")
            .arg(&scratch)
            .kill_on_drop(true);

        let status = timeout(SCREENSHOT_TIMEOUT, command.status())
            .await
            .map_err(|_| {
                anyhow!(
                    "screencapture timed out after {:.0}s, check Screen Recording permission",
                    SCREENSHOT_TIMEOUT.as_secs_f32()
                )
            })?
            .context("failed to execute screencapture")?;

        if !status.success() {
            bail!("screencapture exited with status {status}");
        }

        let bytes = tokio::fs::read(&scratch)
            .await
            .with_context(|| format!("failed to read screenshot {}", scratch.display()))?;
        let _ = tokio::fs::remove_file(&scratch).await;
        Ok(bytes)
    }

    fn screen_lock_status(&self) -> ScreenLockStatus {
        screen_lock_status()
    }

    async fn frontmost_app(&self) -> Result<FrontmostApp> {
        let name = within(
            FRONTMOST_TIMEOUT,
            "frontmost app query",
            run_osascript(
                r#"tell application "System Events" to get name of first process whose frontmost is true"#,
            ),
        )
        .await
        .context("failed to query frontmost app via AppleScript")?;

        let url = match browser_url_script(&name) {
            Some(script) => match timeout(BROWSER_URL_TIMEOUT, run_osascript(script)).await {
                Ok(Ok(url)) if !url.is_empty() => Some(truncate_url(&url)),
                Ok(Ok(_)) => None,
                Ok(Err(err)) => {
                    tracing::debug!("browser URL lookup failed for {name}: {err}");
                    None
                }
                Err(_) => None,
            },
            None => None,
        };

        Ok(FrontmostApp::new(name, url))
    }
}

fn browser_url_script(app_name: &str) -> Option<&'static str> {
    if app_name.contains("Chrome") {
        Some(r#"tell application "Google Chrome" to get URL of active tab of front window"#)
    } else if app_name.contains("Safari") {
        Some(r#"tell application "Safari" to get URL of current tab of front window"#)
    } else if app_name.contains("Firefox") {
        Some(
            r#"tell application "Firefox"
    tell front window
        get URL of current tab
    end tell
end tell"#,
        )
    } else if app_name.contains("Edge") {
        Some(r#"tell application "Microsoft Edge" to get URL of active tab of front window"#)
    } else if app_name.contains("Arc") {
        Some(r#"tell application "Arc" to get URL of active tab of front window"#)
    } else if app_name.contains("Whale") {
        Some(r#"tell application "Whale" to get URL of active tab of front window"#)
    } else {
        None
    }
}

/// Bounds a desktop query so a hung helper process cannot stall the capture tick.
async fn within<T>(
    limit: Duration,
    what: &str,
    query: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match timeout(limit, query).await {
        Ok(result) => result,
        Err(_) => bail!("{what} timed out after {limit:?}"),
    }
}

async fn run_osascript(script: &str) -> Result<String> {
    let output = Command::new("osascript")
        .arg("-e")
        .arg(script)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .context("failed to spawn osascript")?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(anyhow!(
            "osascript failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

#[derive(Debug, Clone)]
pub struct MockCaptureProvider {
    pub lock_status: ScreenLockStatus,
    pub app: FrontmostApp,
    pub image: Vec<u8>,
}

impl Default for MockCaptureProvider {
    fn default() -> Self {
        Self {
            lock_status: ScreenLockStatus::Unlocked,
            app: FrontmostApp::new("Code", None),
            image: b"mock-image".to_vec(),
        }
    }
}

#[async_trait]
impl CaptureProvider for MockCaptureProvider {
    async fn capture_active_display(&self) -> Result<Vec<u8>> {
        Ok(self.image.clone())
    }

    fn screen_lock_status(&self) -> ScreenLockStatus {
        self.lock_status
    }

    async fn frontmost_app(&self) -> Result<FrontmostApp> {
        Ok(self.app.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::{browser_url_script, within};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn hung_query_times_out() {
        let err = within(
            Duration::from_secs(2),
            "frontmost app query",
            std::future::pending::<anyhow::Result<String>>(),
        )
        .await
        .expect_err("pending query must time out");
        assert!(err.to_string().contains("frontmost app query timed out"));

        let name = within(Duration::from_secs(2), "frontmost app query", async {
            Ok("Code".to_string())
        })
        .await
        .expect("ready query");
        assert_eq!(name, "Code");
    }

    #[test]
    fn only_known_browsers_have_url_scripts() {
        assert!(browser_url_script("Google Chrome").is_some());
        assert!(browser_url_script("Safari").is_some());
        assert!(browser_url_script("Arc").is_some());
        assert!(browser_url_script("Terminal").is_none());
    }
}
