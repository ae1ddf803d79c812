use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PublisherConfig {
    pub chromium: ChromiumSection,
    pub flags: FlagsSection,
    pub user_agents: UserAgentSection,
    pub viewport: ViewportSection,
    pub paths: PathsSection,
    #[serde(default)]
    pub timing: TimingSection,
}

impl PublisherConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.sessions_dir)
    }

    pub fn diagnostics_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.diagnostics_dir)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.profiles_dir)
    }

    pub fn ledger_db(&self) -> PathBuf {
        self.resolve_path(&self.paths.ledger_db)
    }

    pub fn failure_log(&self) -> PathBuf {
        self.resolve_path(&self.paths.failure_log)
    }

    fn validate(self) -> Result<Self> {
        if self.timing.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "timing.poll_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.timing.publish_attempt_ms > self.timing.publish_budget_ms {
            return Err(ConfigError::Invalid {
                field: "timing.publish_attempt_ms",
                reason: format!(
                    "per-attempt timeout {}ms exceeds publish budget {}ms",
                    self.timing.publish_attempt_ms, self.timing.publish_budget_ms
                ),
            });
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: String,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagsSection {
    pub no_first_run: bool,
    pub disable_automation_controlled: bool,
    pub lang: Option<String>,
    pub accept_language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentSection {
    pub pool: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewportSection {
    pub resolutions: Vec<[u32; 2]>,
    pub jitter_pixels: u32,
    pub device_scale_factor: [f32; 2],
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub sessions_dir: String,
    pub diagnostics_dir: String,
    pub profiles_dir: String,
    pub ledger_db: String,
    pub failure_log: String,
}

/// Poll interval and per-phase budgets, all in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    pub poll_interval_ms: u64,
    /// Longest single probe inside a phase attempt before rejection signals are re-checked.
    pub attempt_slice_ms: u64,
    pub session_check_ms: u64,
    pub navigate_ms: u64,
    pub mode_select_ms: u64,
    pub media_injection_ms: u64,
    pub content_fill_ms: u64,
    pub schedule_ms: u64,
    pub publish_budget_ms: u64,
    pub publish_attempt_ms: u64,
    pub publish_action_ms: u64,
    pub verify_ms: u64,
    pub profile_ttl_hours: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            attempt_slice_ms: 1_000,
            session_check_ms: 5_000,
            navigate_ms: 15_000,
            mode_select_ms: 8_000,
            media_injection_ms: 300_000,
            content_fill_ms: 30_000,
            schedule_ms: 10_000,
            publish_budget_ms: 90_000,
            publish_attempt_ms: 3_000,
            publish_action_ms: 1_000,
            verify_ms: 5_000,
            profile_ttl_hours: 24,
        }
    }
}

impl TimingSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn attempt_slice(&self) -> Duration {
        Duration::from_millis(self.attempt_slice_ms)
    }

    pub fn session_check(&self) -> Duration {
        Duration::from_millis(self.session_check_ms)
    }

    pub fn publish_budget(&self) -> Duration {
        Duration::from_millis(self.publish_budget_ms)
    }

    pub fn publish_attempt(&self) -> Duration {
        Duration::from_millis(self.publish_attempt_ms)
    }

    pub fn publish_action(&self) -> Duration {
        Duration::from_millis(self.publish_action_ms)
    }

    pub fn profile_ttl(&self) -> Duration {
        Duration::from_secs(self.profile_ttl_hours * 60 * 60)
    }
}

pub fn load_publisher_config<P: AsRef<Path>>(path: P) -> Result<PublisherConfig> {
    let config: PublisherConfig = load_toml(path)?;
    config.validate()
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/publisher.toml");
        let config = load_publisher_config(path).expect("fixture config should parse");
        assert!(config.user_agents.pool.len() >= 2);
        assert_eq!(config.timing.poll_interval_ms, 200);
        assert_eq!(config.timing.publish_budget(), Duration::from_secs(90));
        assert!(config.sessions_dir().ends_with("sessions"));
    }

    #[test]
    fn timing_defaults_apply_when_section_missing() {
        let raw = r#"
[chromium]
executable_path = "/usr/bin/chromium"
headless = true
sandbox = false
disable_gpu = true

[flags]
no_first_run = true
disable_automation_controlled = true

[user_agents]
pool = ["ua-a"]

[viewport]
resolutions = [[1920, 1080]]
jitter_pixels = 0
device_scale_factor = [1.0, 1.0]

[paths]
base_dir = "/var/lib/sau"
sessions_dir = "sessions"
diagnostics_dir = "logs/diagnostics"
profiles_dir = "profiles"
ledger_db = "data/runs.sqlite"
failure_log = "logs/failures.jsonl"
"#;
        let config: PublisherConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.timing.publish_budget_ms, 90_000);
        assert_eq!(
            config.diagnostics_dir(),
            PathBuf::from("/var/lib/sau/logs/diagnostics")
        );
    }

    #[test]
    fn rejects_attempt_longer_than_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/publisher.toml");
        let mut raw = std::fs::read_to_string(fixture).unwrap();
        raw = raw.replace("publish_attempt_ms = 3000", "publish_attempt_ms = 120000");
        std::fs::write(&path, raw).unwrap();
        let err = load_publisher_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
