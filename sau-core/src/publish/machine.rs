//! Phase-driven publishing workflow shared by every platform.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::browser::{ElementError, ElementResolver, PageDriver, PublishMetrics};
use crate::config::TimingSection;
use crate::content::{ContentItem, ContentType, PublishTime};

use super::adapter::{PhaseContext, PhaseOutcome, PlatformAdapter, RejectionSignal};
use super::diagnostics::DiagnosticCapture;
use super::error::{DiagnosticRef, PublishError};
use super::phase::{Phase, PhaseRecord, PhaseResult, PhaseStatus};
use super::session::{SessionStatus, SessionValidator};

enum Operation<'c> {
    Navigate(ContentType),
    SelectMode(ContentType),
    Inject(&'c [PathBuf], ContentType),
    Fill { title: &'c str, body: &'c str },
    Schedule(NaiveDateTime),
    Verify,
}

pub struct UploadStateMachine<'a> {
    adapter: &'a dyn PlatformAdapter,
    resolver: &'a ElementResolver,
    diagnostics: &'a DiagnosticCapture,
    timing: &'a TimingSection,
    account: &'a str,
    state: Phase,
    trace: Vec<PhaseRecord>,
    publish_attempts: u32,
    title_filled: bool,
}

impl<'a> UploadStateMachine<'a> {
    pub fn new(
        adapter: &'a dyn PlatformAdapter,
        resolver: &'a ElementResolver,
        diagnostics: &'a DiagnosticCapture,
        timing: &'a TimingSection,
        account: &'a str,
    ) -> Self {
        Self {
            adapter,
            resolver,
            diagnostics,
            timing,
            account,
            state: Phase::Init,
            trace: Vec::new(),
            publish_attempts: 0,
            title_filled: false,
        }
    }

    pub fn state(&self) -> Phase {
        self.state
    }

    pub fn trace(&self) -> &[PhaseRecord] {
        &self.trace
    }

    pub fn publish_attempts(&self) -> u32 {
        self.publish_attempts
    }

    pub fn metrics(&self) -> PublishMetrics {
        self.resolver.metrics()
    }

    /// Drives every phase to `Done`. On failure the terminal state is
    /// `TimedOut` or `Rejected` and exactly one diagnostic bundle is captured.
    pub async fn run(&mut self, driver: &dyn PageDriver, content: &ContentItem) -> Result<(), PublishError> {
        self.state = Phase::Init;
        self.trace.clear();
        self.publish_attempts = 0;
        self.title_filled = false;

        match self.drive(driver, content).await {
            Ok(()) => {
                self.enter_terminal(Phase::Done, PhaseStatus::Completed);
                info!(
                    platform = self.adapter.name(),
                    account = self.account,
                    attempts = self.publish_attempts,
                    "publish verified"
                );
                Ok(())
            }
            Err(err) => {
                let terminal = match &err {
                    PublishError::ElementNotFound { .. } | PublishError::PublishTimeout { .. } => {
                        Phase::TimedOut
                    }
                    _ => Phase::Rejected,
                };
                let failed_in = self.state;
                self.enter_terminal(terminal, PhaseStatus::Failed);
                warn!(
                    platform = self.adapter.name(),
                    account = self.account,
                    phase = %failed_in,
                    terminal = %terminal,
                    error = %err,
                    "publish run failed"
                );
                let bundle = self
                    .diagnostics
                    .capture(Some(driver), &err.reason_tag(), &content.media)
                    .await;
                Err(err.with_diagnostics(bundle.map(|bundle| bundle.path)))
            }
        }
    }

    fn enter_terminal(&mut self, phase: Phase, status: PhaseStatus) {
        self.state = phase;
        self.trace.push(PhaseRecord {
            phase,
            status,
            attempts: 0,
            elapsed: Duration::ZERO,
        });
    }

    async fn drive(&mut self, driver: &dyn PageDriver, content: &ContentItem) -> Result<(), PublishError> {
        self.check_session(driver).await?;

        self.run_phase(
            driver,
            Phase::NavigateEntry,
            ms(self.timing.navigate_ms),
            Operation::Navigate(content.content_type),
        )
        .await?;

        if self.adapter.uses_default_composer(content.content_type) {
            self.skip(Phase::ModeSelect);
        } else {
            self.run_phase(
                driver,
                Phase::ModeSelect,
                ms(self.timing.mode_select_ms),
                Operation::SelectMode(content.content_type),
            )
            .await?;
        }

        self.run_phase(
            driver,
            Phase::MediaInjection,
            ms(self.timing.media_injection_ms),
            Operation::Inject(&content.media, content.content_type),
        )
        .await?;

        let title = content.truncated_title(self.adapter.title_limit());
        let body = content.note_text();
        self.run_phase(
            driver,
            Phase::ContentFill,
            ms(self.timing.content_fill_ms),
            Operation::Fill {
                title: &title,
                body: &body,
            },
        )
        .await?;

        match content.publish_time {
            PublishTime::Immediate => self.skip(Phase::ScheduleConfig),
            PublishTime::Scheduled(at) => {
                self.run_phase(
                    driver,
                    Phase::ScheduleConfig,
                    ms(self.timing.schedule_ms),
                    Operation::Schedule(at),
                )
                .await?
            }
        }

        self.confirm_publish(driver, !content.publish_time.is_immediate())
            .await?;

        self.run_phase(driver, Phase::Verified, ms(self.timing.verify_ms), Operation::Verify)
            .await
    }

    fn skip(&mut self, phase: Phase) {
        debug!(%phase, "phase skipped");
        self.trace.push(PhaseRecord::skipped(phase));
    }

    fn record(&mut self, phase: Phase, status: PhaseStatus, attempts: u32, started: Instant) {
        let elapsed = self.resolver.now().saturating_duration_since(started);
        match status {
            PhaseStatus::Completed => info!(
                %phase,
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                "phase completed"
            ),
            _ => warn!(
                %phase,
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                "phase failed"
            ),
        }
        self.trace.push(PhaseRecord {
            phase,
            status,
            attempts,
            elapsed,
        });
    }

    async fn check_session(&mut self, driver: &dyn PageDriver) -> Result<(), PublishError> {
        self.state = Phase::SessionCheck;
        let started = self.resolver.now();
        let probe = self.adapter.session_probe();
        let status = SessionValidator::new(self.resolver)
            .validate(driver, &probe, self.timing.session_check())
            .await;
        match status {
            SessionStatus::Valid => {
                self.record(Phase::SessionCheck, PhaseStatus::Completed, 1, started);
                Ok(())
            }
            SessionStatus::Invalid(reason) => {
                self.record(Phase::SessionCheck, PhaseStatus::Failed, 1, started);
                Err(PublishError::SessionInvalid {
                    platform: self.adapter.name().to_string(),
                    account: self.account.to_string(),
                    reason,
                    diagnostics: DiagnosticRef::none(),
                })
            }
        }
    }

    async fn visible_rejection(&self, driver: &dyn PageDriver, signals: &[RejectionSignal]) -> Option<String> {
        if signals.is_empty() {
            return None;
        }
        let candidates: Vec<_> = signals.iter().map(|signal| signal.candidate.clone()).collect();
        self.resolver
            .first_visible(driver, &candidates)
            .await
            .map(|handle| signals[handle.candidate].reason.clone())
    }

    async fn invoke(&mut self, ctx: &PhaseContext<'_>, operation: &Operation<'_>) -> PhaseOutcome {
        match operation {
            Operation::Navigate(content_type) => {
                self.adapter.navigate_to_composer(ctx, *content_type).await
            }
            Operation::SelectMode(content_type) => {
                self.adapter.select_content_mode(ctx, *content_type).await
            }
            Operation::Inject(files, content_type) => {
                self.adapter.inject_media(ctx, files, *content_type).await
            }
            Operation::Fill { title, body } => {
                if !self.title_filled {
                    match self.adapter.fill_title(ctx, title).await? {
                        PhaseResult::Success => self.title_filled = true,
                        other => return Ok(other),
                    }
                }
                self.adapter.fill_body(ctx, body).await
            }
            Operation::Schedule(at) => self.adapter.configure_schedule(ctx, *at).await,
            Operation::Verify => self.adapter.verify_published(ctx, ctx.step()).await,
        }
    }

    async fn run_phase(
        &mut self,
        driver: &dyn PageDriver,
        phase: Phase,
        budget: Duration,
        operation: Operation<'_>,
    ) -> Result<(), PublishError> {
        self.state = phase;
        let started = self.resolver.now();
        let deadline = started + budget;
        let signals = self.adapter.rejection_signals(phase);
        let mut attempts = 0;
        let mut last_reason = String::from("no attempt completed");
        let mut last_action_failure: Option<ElementError> = None;

        loop {
            if let Some(reason) = self.visible_rejection(driver, &signals).await {
                self.record(phase, PhaseStatus::Failed, attempts, started);
                return Err(PublishError::ContentRejected {
                    phase,
                    reason,
                    diagnostics: DiagnosticRef::none(),
                });
            }
            if attempts > 0 && self.resolver.now() >= deadline {
                self.record(phase, PhaseStatus::Failed, attempts, started);
                return Err(match last_action_failure {
                    Some(source) => PublishError::ElementActionFailed {
                        phase,
                        source,
                        diagnostics: DiagnosticRef::none(),
                    },
                    None => self.exhausted(phase, started, last_reason),
                });
            }

            attempts += 1;
            let ctx = PhaseContext::new(
                driver,
                self.resolver,
                self.timing,
                phase,
                deadline,
                self.timing.attempt_slice(),
            );
            match self.invoke(&ctx, &operation).await {
                Ok(PhaseResult::Success) => {
                    self.record(phase, PhaseStatus::Completed, attempts, started);
                    return Ok(());
                }
                Ok(PhaseResult::HardFailure(reason)) => {
                    self.record(phase, PhaseStatus::Failed, attempts, started);
                    return Err(PublishError::ContentRejected {
                        phase,
                        reason,
                        diagnostics: DiagnosticRef::none(),
                    });
                }
                Ok(PhaseResult::TimedOut(reason)) => {
                    self.record(phase, PhaseStatus::Failed, attempts, started);
                    return Err(self.exhausted(phase, started, reason));
                }
                Ok(PhaseResult::SoftFailure(reason)) => {
                    last_reason = reason;
                    last_action_failure = None;
                }
                Err(err) if err.is_retryable_action_failure() => {
                    last_reason = err.to_string();
                    last_action_failure = Some(err);
                }
                Err(err @ ElementError::ActionFailed { .. }) => {
                    self.record(phase, PhaseStatus::Failed, attempts, started);
                    return Err(PublishError::ElementActionFailed {
                        phase,
                        source: err,
                        diagnostics: DiagnosticRef::none(),
                    });
                }
                Err(err) => {
                    last_reason = err.to_string();
                    last_action_failure = None;
                }
            }

            debug!(%phase, attempts, reason = %last_reason, "phase not ready, retrying");
            self.resolver.with_metrics(PublishMetrics::record_phase_retry);
            self.pause(deadline).await;
        }
    }

    /// Repeats the confirm action until the success signal shows up or the
    /// publish budget runs out. Each attempt waits at most
    /// `publish_attempt_ms` for the signal.
    async fn confirm_publish(&mut self, driver: &dyn PageDriver, scheduled: bool) -> Result<(), PublishError> {
        let phase = Phase::PublishConfirm;
        self.state = phase;
        let started = self.resolver.now();
        let deadline = started + self.timing.publish_budget();
        let signals = self.adapter.rejection_signals(phase);
        let mut last_reason = String::from("no attempt completed");

        loop {
            if let Some(reason) = self.visible_rejection(driver, &signals).await {
                self.record(phase, PhaseStatus::Failed, self.publish_attempts, started);
                return Err(PublishError::ContentRejected {
                    phase,
                    reason,
                    diagnostics: DiagnosticRef::none(),
                });
            }
            if self.publish_attempts > 0 && self.resolver.now() >= deadline {
                self.record(phase, PhaseStatus::Failed, self.publish_attempts, started);
                return Err(self.exhausted(phase, started, last_reason));
            }

            self.publish_attempts += 1;
            self.resolver.with_metrics(PublishMetrics::record_publish_attempt);
            let ctx = PhaseContext::new(
                driver,
                self.resolver,
                self.timing,
                phase,
                deadline,
                self.timing.publish_action(),
            );
            let action_failure = match self.adapter.confirm_publish(&ctx, scheduled).await {
                Ok(PhaseResult::Success) => {
                    debug!(attempt = self.publish_attempts, scheduled, "publish action sent");
                    None
                }
                Ok(PhaseResult::HardFailure(reason)) => {
                    self.record(phase, PhaseStatus::Failed, self.publish_attempts, started);
                    return Err(PublishError::ContentRejected {
                        phase,
                        reason,
                        diagnostics: DiagnosticRef::none(),
                    });
                }
                Ok(PhaseResult::SoftFailure(reason)) | Ok(PhaseResult::TimedOut(reason)) => {
                    debug!(attempt = self.publish_attempts, %reason, "publish action not sent");
                    Some(reason)
                }
                Err(err) => {
                    debug!(attempt = self.publish_attempts, error = %err, "publish action failed");
                    Some(err.to_string())
                }
            };

            let wait = self.timing.publish_attempt().min(ctx.remaining());
            match self.adapter.verify_published(&ctx, wait).await {
                Ok(PhaseResult::Success) => {
                    self.record(phase, PhaseStatus::Completed, self.publish_attempts, started);
                    return Ok(());
                }
                Ok(PhaseResult::HardFailure(reason)) => {
                    self.record(phase, PhaseStatus::Failed, self.publish_attempts, started);
                    return Err(PublishError::ContentRejected {
                        phase,
                        reason,
                        diagnostics: DiagnosticRef::none(),
                    });
                }
                Ok(PhaseResult::SoftFailure(reason)) | Ok(PhaseResult::TimedOut(reason)) => {
                    last_reason = join_reasons(action_failure, reason)
                }
                Err(err) => last_reason = join_reasons(action_failure, err.to_string()),
            }
            self.resolver.with_metrics(PublishMetrics::record_phase_retry);
            if wait.is_zero() {
                self.pause(deadline).await;
            }
        }
    }

    async fn pause(&self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(self.resolver.now());
        if !remaining.is_zero() {
            self.resolver
                .clock()
                .sleep(self.resolver.poll_interval().min(remaining))
                .await;
        }
    }

    fn exhausted(&self, phase: Phase, started: Instant, detail: String) -> PublishError {
        match phase {
            Phase::PublishConfirm | Phase::Verified => PublishError::PublishTimeout {
                waited: self.resolver.now().saturating_duration_since(started),
                attempts: self.publish_attempts,
                detail,
                diagnostics: DiagnosticRef::none(),
            },
            _ => PublishError::ElementNotFound {
                phase,
                detail,
                diagnostics: DiagnosticRef::none(),
            },
        }
    }
}

fn join_reasons(action: Option<String>, verify: String) -> String {
    match action {
        Some(action) => format!("{action}; {verify}"),
        None => verify,
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}
