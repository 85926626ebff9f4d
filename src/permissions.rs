use std::fmt;
use std::process::Command;

/// macOS privacy permissions the monitor depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Needed for display captures.
    ScreenRecording,
    /// Needed for the frontmost-app and browser URL queries.
    Accessibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    NotSupported,
}

impl PermissionStatus {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionStatus::Granted | PermissionStatus::NotSupported)
    }
}

impl Permission {
    pub const ALL: [Permission; 2] = [Permission::ScreenRecording, Permission::Accessibility];

    pub fn status(&self) -> PermissionStatus {
        #[cfg(target_os = "macos")]
        {
            let granted = unsafe {
                match self {
                    Permission::ScreenRecording => CGPreflightScreenCaptureAccess(),
                    Permission::Accessibility => AXIsProcessTrusted(),
                }
            };
            if granted {
                PermissionStatus::Granted
            } else {
                PermissionStatus::Denied
            }
        }

        #[cfg(not(target_os = "macos"))]
        {
            PermissionStatus::NotSupported
        }
    }

    pub fn settings_url(&self) -> &'static str {
        match self {
            Permission::ScreenRecording => {
                "x-apple.systempreferences:com.apple.preference.security?Privacy_ScreenRecording"
            }
            Permission::Accessibility => {
                "x-apple.systempreferences:com.apple.preference.security?Privacy_Accessibility"
            }
        }
    }

    pub fn help_message(&self) -> String {
        format!(
            "Grant {self} permission: System Settings -> Privacy & Security -> {self}. \
             Enable it for the terminal running intention-monitor, then restart the session."
        )
    }

    pub fn open_settings(&self) -> std::io::Result<()> {
        if cfg!(not(target_os = "macos")) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("{self} permission is only managed on macOS"),
            ));
        }
        let status = Command::new("open").arg(self.settings_url()).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other("failed to launch System Settings"))
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::ScreenRecording => write!(f, "Screen Recording"),
            Permission::Accessibility => write!(f, "Accessibility"),
        }
    }
}

/// Permissions that still need the user's attention.
pub fn missing_permissions() -> Vec<Permission> {
    Permission::ALL
        .into_iter()
        .filter(|permission| !permission.status().is_granted())
        .collect()
}

#[cfg(target_os = "macos")]
#[link(name = "ApplicationServices", kind = "framework")]
unsafe extern "C" {
    fn CGPreflightScreenCaptureAccess() -> bool;
    fn AXIsProcessTrusted() -> bool;
}

#[cfg(test)]
mod tests {
    use super::Permission;

    #[test]
    fn help_names_the_settings_pane() {
        let help = Permission::Accessibility.help_message();
        assert!(help.contains("Privacy & Security -> Accessibility"));
        assert!(Permission::ScreenRecording.settings_url().ends_with("Privacy_ScreenRecording"));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn nothing_is_missing_off_macos() {
        assert!(super::missing_permissions().is_empty());
        assert!(Permission::ScreenRecording.open_settings().is_err());
    }
}
