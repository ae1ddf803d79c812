use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::browser::{ElementError, ElementResolver, PageDriver, SelectorCandidate};
use crate::config::TimingSection;
use crate::content::{ContentType, MediaPolicy};

use super::phase::{Phase, PhaseResult};
use super::session::SessionProbe;

pub type PhaseOutcome = Result<PhaseResult, ElementError>;

/// Visible text or control that means the platform refused the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionSignal {
    pub candidate: SelectorCandidate,
    pub reason: String,
}

impl RejectionSignal {
    pub fn text(text: &str) -> Self {
        Self {
            candidate: SelectorCandidate::text(text),
            reason: text.to_string(),
        }
    }
}

/// What an adapter operation may use during one attempt of a phase.
pub struct PhaseContext<'a> {
    pub driver: &'a dyn PageDriver,
    pub resolver: &'a ElementResolver,
    pub timing: &'a TimingSection,
    pub phase: Phase,
    deadline: Instant,
    slice: Duration,
}

impl<'a> PhaseContext<'a> {
    pub fn new(
        driver: &'a dyn PageDriver,
        resolver: &'a ElementResolver,
        timing: &'a TimingSection,
        phase: Phase,
        deadline: Instant,
        slice: Duration,
    ) -> Self {
        Self {
            driver,
            resolver,
            timing,
            phase,
            deadline,
            slice,
        }
    }

    /// Time left in the phase budget.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(self.resolver.now())
    }

    /// Wait allowance for a single probe inside this attempt.
    pub fn step(&self) -> Duration {
        self.remaining().min(self.slice)
    }
}

/// Platform-specific implementation of every publishing phase.
///
/// Operations must tolerate being called again after a soft failure in the
/// same phase; adapters keep whatever progress markers they need for that.
#[async_trait(?Send)]
pub trait PlatformAdapter {
    fn name(&self) -> &'static str;
    fn media_policy(&self, content_type: ContentType) -> MediaPolicy;
    fn title_limit(&self) -> usize;
    fn session_probe(&self) -> SessionProbe;
    /// `true` when the composer opened by navigation already handles `content_type`.
    fn uses_default_composer(&self, content_type: ContentType) -> bool;
    /// Hard-rejection signals checked for visibility before every attempt of `phase`.
    fn rejection_signals(&self, phase: Phase) -> Vec<RejectionSignal>;

    async fn navigate_to_composer(&self, ctx: &PhaseContext<'_>, content_type: ContentType) -> PhaseOutcome;
    async fn select_content_mode(&self, ctx: &PhaseContext<'_>, content_type: ContentType) -> PhaseOutcome;
    async fn inject_media(
        &self,
        ctx: &PhaseContext<'_>,
        files: &[PathBuf],
        content_type: ContentType,
    ) -> PhaseOutcome;
    async fn fill_title(&self, ctx: &PhaseContext<'_>, title: &str) -> PhaseOutcome;
    /// `body_and_tags` may be empty; platform side flows still run.
    async fn fill_body(&self, ctx: &PhaseContext<'_>, body_and_tags: &str) -> PhaseOutcome;
    async fn configure_schedule(&self, ctx: &PhaseContext<'_>, at: NaiveDateTime) -> PhaseOutcome;
    async fn confirm_publish(&self, ctx: &PhaseContext<'_>, scheduled: bool) -> PhaseOutcome;
    /// Polls for the success signal for at most `timeout`.
    async fn verify_published(&self, ctx: &PhaseContext<'_>, timeout: Duration) -> PhaseOutcome;
}
