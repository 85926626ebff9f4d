use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug, Clone, Copy)]
pub struct QuotaCheckCache {
    pub last_checked_at: Instant,
    pub last_result: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub deleted_files: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

#[derive(Debug, Clone)]
struct ImageFile {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

/// Tracks bytes used by captured images under `root` and evicts the oldest ones on demand.
#[derive(Debug)]
pub struct StorageQuotaManager {
    root: PathBuf,
    check_interval: Duration,
    cache: Option<QuotaCheckCache>,
}

impl StorageQuotaManager {
    pub fn new(root: impl Into<PathBuf>, check_interval: Duration) -> Self {
        Self {
            root: root.into(),
            check_interval,
            cache: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the cached answer while it is younger than the check interval, otherwise walks
    /// the tree again. Walk errors count as "under budget" so a bad directory never blocks capture.
    pub fn is_under_budget(&mut self, limit_bytes: u64) -> bool {
        let now = Instant::now();
        if let Some(cache) = self.cache
            && now.duration_since(cache.last_checked_at) < self.check_interval
        {
            return cache.last_result;
        }

        let result = match self.total_bytes() {
            Ok(total) => {
                debug!(
                    "capture storage usage {:.2} GB / {:.2} GB",
                    bytes_to_gb(total),
                    bytes_to_gb(limit_bytes)
                );
                total <= limit_bytes
            }
            Err(err) => {
                warn!("failed to measure capture storage under {}: {err}", self.root.display());
                true
            }
        };

        self.cache = Some(QuotaCheckCache {
            last_checked_at: now,
            last_result: result,
        });
        result
    }

    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    pub fn cached(&self) -> Option<QuotaCheckCache> {
        self.cache
    }

    pub fn total_bytes(&self) -> std::io::Result<u64> {
        Ok(self.image_files()?.iter().map(|file| file.size).sum())
    }

    /// Deletes the oldest images (by mtime) until the remaining total is at most `target_bytes`.
    /// A failed delete is logged and skipped.
    pub fn evict_to_target(&mut self, target_bytes: u64) -> EvictionOutcome {
        let mut files = match self.image_files() {
            Ok(files) => files,
            Err(err) => {
                warn!("failed to list captures under {}: {err}", self.root.display());
                self.invalidate();
                return EvictionOutcome::default();
            }
        };
        files.sort_by_key(|file| file.modified);

        let mut outcome = EvictionOutcome {
            remaining_bytes: files.iter().map(|file| file.size).sum(),
            ..EvictionOutcome::default()
        };

        for file in files {
            if outcome.remaining_bytes <= target_bytes {
                break;
            }
            match std::fs::remove_file(&file.path) {
                Ok(()) => {
                    outcome.remaining_bytes -= file.size;
                    outcome.freed_bytes += file.size;
                    outcome.deleted_files += 1;
                    debug!("evicted capture {}", file.path.display());
                }
                Err(err) => warn!("failed to evict capture {}: {err}", file.path.display()),
            }
        }

        info!(
            "eviction removed {} files ({:.1} MB freed, {:.2} GB remaining)",
            outcome.deleted_files,
            bytes_to_mb(outcome.freed_bytes),
            bytes_to_gb(outcome.remaining_bytes)
        );
        self.invalidate();
        outcome
    }

    fn image_files(&self) -> std::io::Result<Vec<ImageFile>> {
        let mut files = Vec::new();
        if self.root.exists() {
            collect_images(&self.root, &mut files)?;
        }
        Ok(files)
    }
}

fn collect_images(dir: &Path, files: &mut Vec<ImageFile>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };

        if metadata.is_dir() {
            collect_images(&path, files)?;
        } else if metadata.is_file() && is_image(&path) {
            files.push(ImageFile {
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: metadata.len(),
                path,
            });
        }
    }
    Ok(())
}

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    const MB: f64 = 1024.0 * 1024.0;
    (bytes as f64) / MB
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    (bytes as f64) / GB
}
