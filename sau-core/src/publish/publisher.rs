use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::{ElementResolver, PageDriver, PageSessionFactory, PublishMetrics, StorageState};
use crate::clock::SharedClock;
use crate::config::{PublisherConfig, TimingSection};
use crate::content::ContentItem;

use super::adapter::PlatformAdapter;
use super::diagnostics::DiagnosticCapture;
use super::error::{DiagnosticRef, PublishError};
use super::ledger::{RunLedger, RunRecord};
use super::machine::UploadStateMachine;
use super::phase::{format_trace, PhaseRecord};
use super::session::{SessionStatus, SessionStore, SessionStoreError, SessionValidator};

/// Summary of a verified publish.
#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub run_id: String,
    pub platform: String,
    pub account: String,
    pub trace: Vec<PhaseRecord>,
    pub metrics: PublishMetrics,
    pub publish_attempts: u32,
    pub duration_ms: u64,
    pub session_path: Option<PathBuf>,
}

#[derive(Default)]
struct RunState {
    trace: Vec<PhaseRecord>,
    metrics: PublishMetrics,
    publish_attempts: u32,
    session_path: Option<PathBuf>,
}

/// Runs one publish per call: intake validation, session load, browser
/// session, state machine, session refresh and ledger entry.
pub struct Publisher {
    timing: TimingSection,
    sessions: SessionStore,
    diagnostics: DiagnosticCapture,
    factory: Arc<dyn PageSessionFactory>,
    clock: SharedClock,
    ledger: Option<RunLedger>,
}

impl Publisher {
    pub fn new(
        timing: TimingSection,
        sessions: SessionStore,
        diagnostics: DiagnosticCapture,
        factory: Arc<dyn PageSessionFactory>,
        clock: SharedClock,
    ) -> Self {
        Self {
            timing,
            sessions,
            diagnostics,
            factory,
            clock,
            ledger: None,
        }
    }

    pub fn from_config(
        config: &PublisherConfig,
        factory: Arc<dyn PageSessionFactory>,
        clock: SharedClock,
    ) -> Self {
        Self::new(
            config.timing.clone(),
            SessionStore::new(config.sessions_dir()),
            DiagnosticCapture::new(config.diagnostics_dir()),
            factory,
            clock,
        )
    }

    pub fn with_ledger(mut self, ledger: RunLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn diagnostics(&self) -> &DiagnosticCapture {
        &self.diagnostics
    }

    pub async fn publish(
        &self,
        adapter: &dyn PlatformAdapter,
        account: &str,
        content: &ContentItem,
    ) -> Result<PublishReport, PublishError> {
        let run_id = Uuid::new_v4().to_string();
        let started = self.clock.now();
        let mut state = RunState::default();
        info!(
            run_id = %run_id,
            platform = adapter.name(),
            account,
            content_type = %content.content_type,
            files = content.media.len(),
            "publish run started"
        );

        let result = self.execute(adapter, account, content, &mut state).await;
        let duration = self.clock.now().saturating_duration_since(started);
        self.record_run(&run_id, adapter.name(), account, content, &state, duration, &result);

        result.map(|()| PublishReport {
            run_id,
            platform: adapter.name().to_string(),
            account: account.to_string(),
            trace: state.trace,
            metrics: state.metrics,
            publish_attempts: state.publish_attempts,
            duration_ms: duration.as_millis() as u64,
            session_path: state.session_path,
        })
    }

    /// Opens the authoring entry with the stored session and reports whether
    /// it still grants access. A valid session is written back refreshed.
    pub async fn check_session(
        &self,
        adapter: &dyn PlatformAdapter,
        account: &str,
    ) -> Result<SessionStatus, PublishError> {
        let platform = adapter.name();
        let storage = match self.sessions.load(platform, account).await {
            Ok(storage) => storage,
            Err(SessionStoreError::Missing { path }) => {
                return Ok(SessionStatus::Invalid(format!(
                    "no stored session at {}",
                    path.display()
                )))
            }
            Err(SessionStoreError::Corrupt { source, .. }) => {
                return Ok(SessionStatus::Invalid(format!("stored session is corrupt: {source}")))
            }
            Err(err) => return Err(err.into()),
        };

        let session = self.factory.open(&format!("{platform}-{account}")).await?;
        let outcome = self
            .probe_session(session.driver(), adapter, account, &storage)
            .await;
        if let Err(err) = session.close().await {
            warn!(platform, account, error = %err, "failed to close browser session");
        }
        outcome
    }

    async fn probe_session(
        &self,
        driver: &dyn PageDriver,
        adapter: &dyn PlatformAdapter,
        account: &str,
        storage: &StorageState,
    ) -> Result<SessionStatus, PublishError> {
        driver.import_storage(storage).await?;
        let resolver = ElementResolver::new(self.clock.clone(), self.timing.poll_interval());
        let status = SessionValidator::new(&resolver)
            .validate(driver, &adapter.session_probe(), self.timing.session_check())
            .await;
        if status.is_valid() {
            self.refresh_session(driver, adapter.name(), account).await;
        }
        info!(platform = adapter.name(), account, valid = status.is_valid(), "session checked");
        Ok(status)
    }

    async fn execute(
        &self,
        adapter: &dyn PlatformAdapter,
        account: &str,
        content: &ContentItem,
        state: &mut RunState,
    ) -> Result<(), PublishError> {
        let policy = adapter.media_policy(content.content_type);
        content.validate(&policy, Local::now().naive_local())?;

        let platform = adapter.name();
        let storage = match self.sessions.load(platform, account).await {
            Ok(storage) => storage,
            Err(err @ SessionStoreError::Missing { .. }) | Err(err @ SessionStoreError::Corrupt { .. }) => {
                let error = PublishError::SessionInvalid {
                    platform: platform.to_string(),
                    account: account.to_string(),
                    reason: err.to_string(),
                    diagnostics: DiagnosticRef::none(),
                };
                let bundle = self
                    .diagnostics
                    .capture(None, &error.reason_tag(), &content.media)
                    .await;
                return Err(error.with_diagnostics(bundle.map(|bundle| bundle.path)));
            }
            Err(err) => return Err(err.into()),
        };

        let session = self.factory.open(&format!("{platform}-{account}")).await?;
        let outcome = self
            .drive(session.driver(), adapter, account, content, &storage, state)
            .await;
        if let Err(err) = session.close().await {
            warn!(platform, account, error = %err, "failed to close browser session");
        }
        outcome
    }

    async fn drive(
        &self,
        driver: &dyn PageDriver,
        adapter: &dyn PlatformAdapter,
        account: &str,
        content: &ContentItem,
        storage: &StorageState,
        state: &mut RunState,
    ) -> Result<(), PublishError> {
        driver.import_storage(storage).await?;
        let resolver = ElementResolver::new(self.clock.clone(), self.timing.poll_interval());
        resolver.with_metrics(PublishMetrics::record_page_open);

        let mut machine =
            UploadStateMachine::new(adapter, &resolver, &self.diagnostics, &self.timing, account);
        let result = machine.run(driver, content).await;
        state.trace = machine.trace().to_vec();
        state.metrics = machine.metrics();
        state.publish_attempts = machine.publish_attempts();
        result?;

        state.session_path = self.refresh_session(driver, adapter.name(), account).await;
        Ok(())
    }

    /// The post is already live at this point, so a failed refresh is logged
    /// and the run still succeeds.
    async fn refresh_session(&self, driver: &dyn PageDriver, platform: &str, account: &str) -> Option<PathBuf> {
        let refreshed = match driver.export_storage().await {
            Ok(refreshed) => refreshed,
            Err(err) => {
                warn!(platform, account, error = %err, "failed to export refreshed session");
                return None;
            }
        };
        match self.sessions.save(platform, account, &refreshed).await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(platform, account, error = %err, "failed to persist refreshed session");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_run(
        &self,
        run_id: &str,
        platform: &str,
        account: &str,
        content: &ContentItem,
        state: &RunState,
        duration: Duration,
        result: &Result<(), PublishError>,
    ) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let error = result.as_ref().err();
        let record = RunRecord {
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            platform: platform.to_string(),
            account: account.to_string(),
            content_type: content.content_type.to_string(),
            title: content.title.clone(),
            success: error.is_none(),
            category: error.map(|err| err.category().to_string()),
            message: error.map(|err| err.to_string()),
            publish_attempts: state.publish_attempts,
            duration_ms: duration.as_millis() as i64,
            trace: format_trace(&state.trace),
            diagnostics: error.and_then(|err| err.diagnostics().map(|path| path.to_path_buf())),
        };
        if let Err(err) = ledger.record(&record) {
            warn!(run_id, error = %err, "failed to write run ledger entry");
        }
    }
}
