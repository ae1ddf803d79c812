use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PublisherConfig;

use super::error::{BrowserError, BrowserResult};

/// Scratch user-data directory for one publishing run.
///
/// Login state never lives here; it is imported from the session store after
/// launch, so the directory can be thrown away once the run is over.
#[derive(Debug, Clone)]
pub struct BrowserProfile {
    id: String,
    path: PathBuf,
    created_at: DateTime<Utc>,
}

impl BrowserProfile {
    fn create(base_dir: &Path, label: &str) -> BrowserResult<Self> {
        let id = format!("{}-{}", sanitize_label(label), Uuid::new_v4());
        let path = base_dir.join(&id);
        std::fs::create_dir_all(&path)
            .map_err(|err| BrowserError::Profile(format!("failed to create profile dir: {err}")))?;
        Ok(Self {
            id,
            path,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn touch(&self) -> BrowserResult<()> {
        if self.path.exists() {
            let marker = self.path.join(".last_used");
            let mut file = fs::File::create(&marker).await.map_err(|err| {
                BrowserError::Profile(format!("failed to write profile marker: {err}"))
            })?;
            file.write_all(Utc::now().to_rfc3339().as_bytes())
                .await
                .map_err(|err| {
                    BrowserError::Profile(format!("failed to update profile marker: {err}"))
                })?;
        }
        Ok(())
    }

    pub async fn remove(&self) -> BrowserResult<()> {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                debug!(profile = %self.id, "removed scratch profile");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BrowserError::Profile(format!(
                "failed to remove profile {}: {err}",
                self.path.display()
            ))),
        }
    }
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Clone)]
pub struct ProfileManager {
    base_dir: PathBuf,
    ttl: Duration,
}

impl ProfileManager {
    pub fn new<P: AsRef<Path>>(base_dir: P, ttl: Duration) -> BrowserResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir).map_err(|err| {
            BrowserError::Profile(format!("failed to create profile base dir: {err}"))
        })?;
        Ok(Self { base_dir, ttl })
    }

    pub fn from_config(config: &PublisherConfig) -> BrowserResult<Self> {
        Self::new(config.profiles_dir(), config.timing.profile_ttl())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn allocate(&self, label: &str) -> BrowserResult<BrowserProfile> {
        BrowserProfile::create(&self.base_dir, label)
    }

    /// Removes profile directories left behind by crashed runs.
    pub fn cleanup_expired(&self) -> BrowserResult<usize> {
        let now = SystemTime::now();
        let entries = std::fs::read_dir(&self.base_dir).map_err(|err| {
            BrowserError::Profile(format!("failed to list profile directory: {err}"))
        })?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to read profile metadata");
                    continue;
                }
            };
            if let Ok(modified) = metadata.modified() {
                if now.duration_since(modified).unwrap_or(Duration::ZERO) > self.ttl {
                    match std::fs::remove_dir_all(&path) {
                        Ok(()) => removed += 1,
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "failed to remove expired profile")
                        }
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocate_names_profile_after_label() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProfileManager::new(dir.path(), Duration::from_secs(60)).unwrap();
        let profile = manager.allocate("douyin/main account").unwrap();
        assert!(profile.id().starts_with("douyin_main_account-"));
        assert!(profile.path().is_dir());
        profile.touch().await.unwrap();
        assert!(profile.path().join(".last_used").exists());
        profile.remove().await.unwrap();
        assert!(!profile.path().exists());
        profile.remove().await.unwrap();
    }

    #[test]
    fn cleanup_keeps_fresh_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProfileManager::new(dir.path(), Duration::from_secs(3600)).unwrap();
        let profile = manager.allocate("xiaohongshu-a").unwrap();
        assert_eq!(manager.cleanup_expired().unwrap(), 0);
        assert!(profile.path().exists());

        let zero_ttl = ProfileManager::new(dir.path(), Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(zero_ttl.cleanup_expired().unwrap(), 1);
        assert!(!profile.path().exists());
    }
}
