use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::fs;
use tracing::{info, warn};

use crate::browser::PageDriver;

/// Files written for one failure. Artifacts that could not be captured are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticBundle {
    pub path: PathBuf,
    pub reason: String,
    pub location: Option<String>,
    pub manifest: Vec<(PathBuf, bool)>,
    pub screenshot: Option<PathBuf>,
    pub markup: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DiagnosticCapture {
    root: PathBuf,
}

impl DiagnosticCapture {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshots page state after a terminal failure.
    ///
    /// Every artifact is written independently; a failed write is logged and
    /// skipped. Returns `None` only when the bundle directory itself cannot be
    /// created.
    pub async fn capture(
        &self,
        driver: Option<&dyn PageDriver>,
        reason: &str,
        media: &[PathBuf],
    ) -> Option<DiagnosticBundle> {
        let dir = match self.create_bundle_dir(Local::now(), reason).await {
            Ok(dir) => dir,
            Err(err) => {
                warn!(root = %self.root.display(), error = %err, "failed to create diagnostic bundle");
                return None;
            }
        };

        let location = match driver {
            Some(driver) => match driver.current_url().await {
                Ok(url) => Some(url),
                Err(err) => {
                    warn!(error = %err, "diagnostics: page location unavailable");
                    None
                }
            },
            None => None,
        };

        let meta = format!(
            "reason={reason}\nurl={}\ncaptured_at={}\n",
            location.as_deref().unwrap_or(""),
            Local::now().to_rfc3339()
        );
        write_artifact(&dir.join("meta.txt"), meta.as_bytes()).await;

        let manifest: Vec<(PathBuf, bool)> = media
            .iter()
            .map(|path| (path.clone(), path.exists()))
            .collect();
        let listing: String = manifest
            .iter()
            .map(|(path, exists)| format!("{}\texists={exists}\n", path.display()))
            .collect();
        write_artifact(&dir.join("files.txt"), listing.as_bytes()).await;

        let mut screenshot = None;
        let mut markup = None;
        if let Some(driver) = driver {
            match driver.screenshot().await {
                Ok(bytes) => {
                    let path = dir.join("page.png");
                    if write_artifact(&path, &bytes).await {
                        screenshot = Some(path);
                    }
                }
                Err(err) => warn!(error = %err, "diagnostics: screenshot failed"),
            }
            match driver.content().await {
                Ok(html) => {
                    let path = dir.join("page.html");
                    if write_artifact(&path, html.as_bytes()).await {
                        markup = Some(path);
                    }
                }
                Err(err) => warn!(error = %err, "diagnostics: markup dump failed"),
            }
        }

        info!(path = %dir.display(), reason, "diagnostic bundle captured");
        Some(DiagnosticBundle {
            path: dir,
            reason: reason.to_string(),
            location,
            manifest,
            screenshot,
            markup,
        })
    }

    async fn create_bundle_dir(&self, at: DateTime<Local>, reason: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.root).await?;
        let base = bundle_dir_name(at, reason);
        let mut suffix = 1;
        loop {
            let name = if suffix == 1 {
                base.clone()
            } else {
                format!("{base}_{suffix}")
            };
            let candidate = self.root.join(name);
            match fs::create_dir(&candidate).await {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
                Err(err) => return Err(err),
            }
        }
    }
}

/// `<YYYYmmdd_HHMMSS_mmm>_<reason>` with the reason reduced to a filesystem-safe tag.
pub fn bundle_dir_name(at: DateTime<Local>, reason: &str) -> String {
    let tag: String = reason
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();
    let tag = if tag.is_empty() { "failure".to_string() } else { tag };
    format!("{}_{tag}", at.format("%Y%m%d_%H%M%S_%3f"))
}

async fn write_artifact(path: &Path, bytes: &[u8]) -> bool {
    match fs::write(path, bytes).await {
        Ok(()) => true,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "diagnostics: failed to write artifact");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::ScriptedPage;
    use chrono::TimeZone;

    #[test]
    fn names_differ_by_timestamp_or_reason() {
        let at = Local.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let later = at + chrono::Duration::milliseconds(1);
        assert_eq!(bundle_dir_name(at, "publish_timeout"), "20260301_100000_000_publish_timeout");
        assert_ne!(bundle_dir_name(at, "a"), bundle_dir_name(later, "a"));
        assert_ne!(bundle_dir_name(at, "a"), bundle_dir_name(at, "b"));
        assert_eq!(bundle_dir_name(at, "不支持"), "20260301_100000_000____");
    }

    #[tokio::test]
    async fn writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("clip.mp4");
        std::fs::write(&media, b"x").unwrap();
        let missing = dir.path().join("gone.mp4");
        let page = ScriptedPage::new(ManualClock::new());
        page.set_url("https://creator.douyin.com/creator-micro/content/upload");

        let capture = DiagnosticCapture::new(dir.path().join("diag"));
        let bundle = capture
            .capture(Some(&page), "element_not_found", &[media.clone(), missing.clone()])
            .await
            .unwrap();

        let meta = std::fs::read_to_string(bundle.path.join("meta.txt")).unwrap();
        assert!(meta.contains("reason=element_not_found\n"));
        assert!(meta.contains("url=https://creator.douyin.com/creator-micro/content/upload\n"));
        let files = std::fs::read_to_string(bundle.path.join("files.txt")).unwrap();
        assert!(files.contains(&format!("{}\texists=true", media.display())));
        assert!(files.contains(&format!("{}\texists=false", missing.display())));
        assert!(bundle.screenshot.unwrap().exists());
        assert!(bundle.markup.unwrap().exists());
    }

    #[tokio::test]
    async fn screenshot_failure_does_not_abort_capture() {
        let dir = tempfile::tempdir().unwrap();
        let page = ScriptedPage::new(ManualClock::new());
        page.fail_screenshots();
        let capture = DiagnosticCapture::new(dir.path());
        let bundle = capture.capture(Some(&page), "timeout", &[]).await.unwrap();
        assert!(bundle.screenshot.is_none());
        assert!(bundle.markup.is_some());
        assert!(bundle.path.join("meta.txt").exists());
    }

    #[tokio::test]
    async fn same_instant_and_reason_get_distinct_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let capture = DiagnosticCapture::new(dir.path());
        let at = Local::now();
        let first = capture.create_bundle_dir(at, "same").await.unwrap();
        let second = capture.create_bundle_dir(at, "same").await.unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_same_2"));
    }
}
