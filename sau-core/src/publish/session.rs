use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::browser::{ElementResolver, PageDriver, SelectorCandidate, StorageState};

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("no session artifact at {path}")]
    Missing { path: PathBuf },
    #[error("failed to access session artifact {path}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("session artifact {path} is corrupt: {source}")]
    Corrupt {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },
}

/// One JSON storage-state file per (platform, account).
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, platform: &str, account: &str) -> PathBuf {
        let account: String = account
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{platform}_{account}.json"))
    }

    pub async fn load(&self, platform: &str, account: &str) -> Result<StorageState, SessionStoreError> {
        let path = self.path_for(platform, account);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionStoreError::Missing { path });
            }
            Err(source) => return Err(SessionStoreError::Io { source, path }),
        };
        let state = serde_json::from_slice(&raw)
            .map_err(|source| SessionStoreError::Corrupt { source, path: path.clone() })?;
        debug!(path = %path.display(), "loaded session artifact");
        Ok(state)
    }

    /// Replaces the artifact via a temp file and rename so readers never see a partial write.
    pub async fn save(
        &self,
        platform: &str,
        account: &str,
        state: &StorageState,
    ) -> Result<PathBuf, SessionStoreError> {
        let path = self.path_for(platform, account);
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| SessionStoreError::Io { source, path: self.dir.clone() })?;
        let json = serde_json::to_vec_pretty(state)
            .map_err(|source| SessionStoreError::Corrupt { source, path: path.clone() })?;
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, &json)
            .await
            .map_err(|source| SessionStoreError::Io { source, path: tmp.clone() })?;
        if let Err(source) = fs::rename(&tmp, &path).await {
            if let Err(err) = fs::remove_file(&tmp).await {
                warn!(path = %tmp.display(), error = %err, "failed to remove temp session file");
            }
            return Err(SessionStoreError::Io { source, path });
        }
        info!(path = %path.display(), cookies = state.cookies.len(), "session artifact refreshed");
        Ok(path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Where a platform's authoring entry lives and what a login wall looks like.
#[derive(Debug, Clone)]
pub struct SessionProbe {
    pub entry_url: String,
    /// Fragment the location must still contain once navigation settles.
    pub authoring_fragment: String,
    pub login_markers: Vec<SelectorCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Valid,
    Invalid(String),
}

impl SessionStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, SessionStatus::Valid)
    }
}

/// Checks that an imported session still grants authoring access.
pub struct SessionValidator<'a> {
    resolver: &'a ElementResolver,
}

impl<'a> SessionValidator<'a> {
    pub fn new(resolver: &'a ElementResolver) -> Self {
        Self { resolver }
    }

    pub async fn validate(
        &self,
        driver: &dyn PageDriver,
        probe: &SessionProbe,
        timeout: Duration,
    ) -> SessionStatus {
        if let Err(err) = driver.goto(&probe.entry_url).await {
            return SessionStatus::Invalid(format!("could not open {}: {err}", probe.entry_url));
        }
        let fragment = probe.authoring_fragment.as_str();
        if let Err(err) = self
            .resolver
            .wait_for_url(driver, "authoring entry", timeout, |url| url.contains(fragment))
            .await
        {
            let location = driver.current_url().await.unwrap_or_default();
            debug!(error = %err, %location, "authoring entry not reached");
            return SessionStatus::Invalid(format!("redirected away from authoring entry to {location}"));
        }
        if let Some(marker) = self.resolver.first_visible(driver, &probe.login_markers).await {
            return SessionStatus::Invalid(format!("login prompt visible ({})", marker.target.locator));
        }
        SessionStatus::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{Locator, StoredCookie};
    use crate::clock::ManualClock;
    use crate::testing::{FakeElement, ScriptedPage};

    fn probe() -> SessionProbe {
        SessionProbe {
            entry_url: "https://creator.douyin.com/creator-micro/content/upload".into(),
            authoring_fragment: "/creator-micro/content/upload".into(),
            login_markers: vec![SelectorCandidate::text("手机号登录"), SelectorCandidate::text("扫码登录")],
        }
    }

    fn state() -> StorageState {
        StorageState {
            cookies: vec![StoredCookie {
                name: "sessionid".into(),
                value: "v".into(),
                domain: ".douyin.com".into(),
                path: "/".into(),
                expires: 1_900_000_000.0,
                http_only: true,
                secure: true,
            }],
            origins: vec![],
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        let err = store.load("douyin", "main").await.unwrap_err();
        assert!(matches!(err, SessionStoreError::Missing { .. }));

        let path = store.save("douyin", "main", &state()).await.unwrap();
        assert!(path.ends_with("douyin_main.json"));
        assert_eq!(store.load("douyin", "main").await.unwrap(), state());
        let leftovers = std::fs::read_dir(store.dir())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn corrupt_artifact_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        std::fs::write(store.path_for("xiaohongshu", "a/b"), b"{not json").unwrap();
        assert!(store.path_for("xiaohongshu", "a/b").ends_with("xiaohongshu_a_b.json"));
        let err = store.load("xiaohongshu", "a/b").await.unwrap_err();
        assert!(matches!(err, SessionStoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn valid_when_entry_reached_without_login_prompt() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.add(FakeElement::new("stale-login").matching(Locator::text("扫码登录")).hidden());
        let resolver = ElementResolver::new(clock.shared(), Duration::from_millis(200));
        let status = SessionValidator::new(&resolver)
            .validate(&page, &probe(), Duration::from_secs(5))
            .await;
        assert_eq!(status, SessionStatus::Valid);
    }

    #[tokio::test]
    async fn invalid_when_redirected_to_login() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.redirect("/content/upload", "https://creator.douyin.com/login");
        let resolver = ElementResolver::new(clock.shared(), Duration::from_millis(200));
        let status = SessionValidator::new(&resolver)
            .validate(&page, &probe(), Duration::from_secs(5))
            .await;
        assert!(matches!(status, SessionStatus::Invalid(reason) if reason.contains("/login")));
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn invalid_when_login_prompt_visible() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.add(FakeElement::new("phone-login").matching(Locator::text("手机号登录")));
        let resolver = ElementResolver::new(clock.shared(), Duration::from_millis(200));
        let status = SessionValidator::new(&resolver)
            .validate(&page, &probe(), Duration::from_secs(5))
            .await;
        assert!(!status.is_valid());
    }
}
