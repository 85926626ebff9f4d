use serde::{Deserialize, Serialize};
use tracing::debug;

const MAX_URL_CHARS: usize = 100;

/// The foreground application at capture time, with the active tab URL for browsers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontmostApp {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl FrontmostApp {
    pub fn new(name: impl Into<String>, url: Option<String>) -> Self {
        Self {
            name: name.into(),
            url: url.filter(|u| !u.trim().is_empty()),
        }
    }

    pub fn unknown() -> Self {
        Self::new("Unknown", None)
    }

    pub fn domain(&self) -> Option<String> {
        self.url.as_deref().and_then(domain_of)
    }
}

/// Host portion of a URL without scheme or a leading `www.`, lowercased.
pub fn domain_of(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    let host = rest.split('/').next().unwrap_or(rest);
    let host = host.strip_prefix("www.").unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

/// Shortens very long browser URLs the way they are stored in the capture log.
pub fn truncate_url(url: &str) -> String {
    if url.chars().count() > MAX_URL_CHARS {
        let head: String = url.chars().take(MAX_URL_CHARS - 3).collect();
        format!("{head}...")
    } else {
        url.to_string()
    }
}

/// Remembers the app and domain seen on the previous analysis tick.
#[derive(Debug, Clone, Default)]
pub struct AppChangeTracker {
    previous_name: Option<String>,
    previous_domain: Option<String>,
}

impl AppChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Records `app` and reports whether its name or domain differs from the previous
    /// observation. The very first observation never counts as a change, and a domain change
    /// needs a previous domain to compare against.
    pub fn observe(&mut self, app: &FrontmostApp) -> bool {
        let domain = app.domain();

        let name_changed = self
            .previous_name
            .as_ref()
            .is_some_and(|previous| *previous != app.name);
        let domain_changed = self
            .previous_domain
            .as_ref()
            .is_some_and(|previous| Some(previous) != domain.as_ref());

        if name_changed {
            debug!(
                "frontmost app changed: {:?} -> {:?}",
                self.previous_name, app.name
            );
        }
        if domain_changed {
            debug!(
                "frontmost domain changed: {:?} -> {:?}",
                self.previous_domain, domain
            );
        }

        self.previous_name = Some(app.name.clone());
        self.previous_domain = domain;
        name_changed || domain_changed
    }
}

#[cfg(test)]
mod tests {
    use super::{AppChangeTracker, FrontmostApp, domain_of, truncate_url};

    #[test]
    fn extracts_domain() {
        assert_eq!(
            domain_of("https://www.GitHub.com/rust-lang/rust"),
            Some("github.com".to_string())
        );
        assert_eq!(domain_of("http://docs.rs"), Some("docs.rs".to_string()));
        assert_eq!(domain_of("localhost:3000/app"), Some("localhost:3000".to_string()));
        assert_eq!(domain_of("   "), None);
    }

    #[test]
    fn first_observation_is_not_a_change() {
        let mut tracker = AppChangeTracker::new();
        assert!(!tracker.observe(&FrontmostApp::new("Code", None)));
        assert!(!tracker.observe(&FrontmostApp::new("Code", None)));
    }

    #[test]
    fn name_change_is_flagged_once() {
        let mut tracker = AppChangeTracker::new();
        tracker.observe(&FrontmostApp::new("Code", None));
        assert!(tracker.observe(&FrontmostApp::new("Slack", None)));
        assert!(!tracker.observe(&FrontmostApp::new("Slack", None)));
    }

    #[test]
    fn domain_change_within_same_browser_is_flagged() {
        let mut tracker = AppChangeTracker::new();
        let docs = FrontmostApp::new("Safari", Some("https://docs.rs/tokio".to_string()));
        let docs_other_page =
            FrontmostApp::new("Safari", Some("https://docs.rs/serde".to_string()));
        let video = FrontmostApp::new("Safari", Some("https://www.youtube.com/".to_string()));

        tracker.observe(&docs);
        assert!(!tracker.observe(&docs_other_page));
        assert!(tracker.observe(&video));
    }

    #[test]
    fn losing_the_url_counts_as_domain_change() {
        let mut tracker = AppChangeTracker::new();
        tracker.observe(&FrontmostApp::new("Safari", Some("https://docs.rs".to_string())));
        assert!(tracker.observe(&FrontmostApp::new("Safari", None)));
    }

    #[test]
    fn gaining_a_url_in_same_app_is_not_a_change() {
        let mut tracker = AppChangeTracker::new();
        tracker.observe(&FrontmostApp::new("Safari", None));
        assert!(!tracker.observe(&FrontmostApp::new(
            "Safari",
            Some("https://docs.rs".to_string())
        )));
    }

    #[test]
    fn reset_forgets_previous_app() {
        let mut tracker = AppChangeTracker::new();
        tracker.observe(&FrontmostApp::new("Code", None));
        tracker.reset();
        assert!(!tracker.observe(&FrontmostApp::new("Slack", None)));
    }

    #[test]
    fn truncates_long_urls() {
        let long = format!("https://example.com/{}", "a".repeat(200));
        let truncated = truncate_url(&long);
        assert_eq!(truncated.chars().count(), 100);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_url("https://docs.rs"), "https://docs.rs");
    }
}
