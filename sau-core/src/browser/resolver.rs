//! Bounded-time resolution of UI controls.
//!
//! A control is described by an ordered list of [`SelectorCandidate`]s. The
//! resolver polls the page at a fixed interval until one candidate yields a
//! usable match or the timeout elapses. Matches of a single candidate are
//! split by the candidate's [`Preference`] into a preferred group and a
//! fallback group; preferred matches are always tried first.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::clock::SharedClock;

use super::driver::{ElementTarget, Locator, PageDriver};
use super::error::{BrowserError, BrowserResult};
use super::metrics::PublishMetrics;

#[derive(Debug, Error)]
pub enum ElementError {
    #[error("{control}: no candidate matched within {waited:?}{}", detail_suffix(.last_probe_error))]
    NotFound {
        control: String,
        waited: Duration,
        last_probe_error: Option<String>,
    },
    #[error("{control}: found {target} but the action failed: {source}")]
    ActionFailed {
        control: String,
        target: String,
        /// Set when the caller asked for retries and the budget ran out.
        retryable: bool,
        #[source]
        source: BrowserError,
    },
    #[error("{control}: {source}")]
    Driver {
        control: String,
        #[source]
        source: BrowserError,
    },
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_ref()
        .map(|detail| format!(" (last probe error: {detail})"))
        .unwrap_or_default()
}

impl ElementError {
    pub fn driver(control: impl Into<String>, source: BrowserError) -> Self {
        ElementError::Driver {
            control: control.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ElementError::NotFound { .. })
    }

    /// An action failure that may clear up on a later attempt.
    pub fn is_retryable_action_failure(&self) -> bool {
        matches!(self, ElementError::ActionFailed { retryable: true, .. })
    }
}

/// Heuristic used to rank structurally equivalent matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preference {
    /// Attribute value contains the needle, compared case-insensitively.
    AttributeContains { name: String, needle: String },
    AttributeAbsent { name: String },
}

impl Preference {
    pub fn attribute_contains(name: impl Into<String>, needle: impl Into<String>) -> Self {
        Preference::AttributeContains {
            name: name.into(),
            needle: needle.into(),
        }
    }

    async fn matches(&self, driver: &dyn PageDriver, target: &ElementTarget) -> BrowserResult<bool> {
        match self {
            Preference::AttributeContains { name, needle } => Ok(driver
                .attribute(target, name)
                .await?
                .map(|value| value.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false)),
            Preference::AttributeAbsent { name } => {
                Ok(driver.attribute(target, name).await?.is_none())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorCandidate {
    pub locator: Locator,
    pub preference: Option<Preference>,
}

impl SelectorCandidate {
    pub fn new(locator: Locator) -> Self {
        Self {
            locator,
            preference: None,
        }
    }

    pub fn css(selector: impl Into<String>) -> Self {
        Self::new(Locator::css(selector))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Locator::text(text))
    }

    pub fn prefer(mut self, preference: Preference) -> Self {
        self.preference = Some(preference);
        self
    }
}

impl From<Locator> for SelectorCandidate {
    fn from(locator: Locator) -> Self {
        SelectorCandidate::new(locator)
    }
}

/// What to do when a control is found but acting on it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionRetry {
    /// Surface `ActionFailed` at once.
    FailFast,
    /// Remember the failure and move on to the next candidate on the next tick.
    Retry,
}

#[derive(Debug, Clone, Copy)]
pub enum ElementAction<'a> {
    Click,
    /// Click only when the control does not already report a checked state.
    Check,
    Fill(&'a str),
    TypeText(&'a str),
    SetFiles(&'a [PathBuf]),
}

impl ElementAction<'_> {
    fn requires_visibility(&self) -> bool {
        !matches!(self, ElementAction::SetFiles(_))
    }

    async fn perform(&self, driver: &dyn PageDriver, target: &ElementTarget) -> BrowserResult<()> {
        match self {
            ElementAction::Click => driver.click(target).await,
            ElementAction::Check => {
                if driver.is_checked(target).await? {
                    Ok(())
                } else {
                    driver.click(target).await
                }
            }
            ElementAction::Fill(text) => driver.fill(target, text).await,
            ElementAction::TypeText(text) => driver.type_text(target, text).await,
            ElementAction::SetFiles(files) => driver.set_input_files(target, files).await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Probe<'a> {
    Present,
    Visible,
    Act(ElementAction<'a>, ActionRetry),
}

/// The control a resolution settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlHandle {
    pub target: ElementTarget,
    /// Position of the winning candidate in the supplied list.
    pub candidate: usize,
    pub preferred: bool,
}

enum TickOutcome {
    Resolved(ControlHandle),
    ActionFailed {
        candidate: usize,
        target: ElementTarget,
        source: BrowserError,
    },
    Nothing,
}

#[derive(Clone)]
pub struct ElementResolver {
    clock: SharedClock,
    poll_interval: Duration,
    metrics: Arc<Mutex<PublishMetrics>>,
}

impl ElementResolver {
    pub fn new(clock: SharedClock, poll_interval: Duration) -> Self {
        Self {
            clock,
            poll_interval,
            metrics: Arc::new(Mutex::new(PublishMetrics::default())),
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn metrics(&self) -> PublishMetrics {
        self.with_metrics(|metrics| metrics.clone())
    }

    pub fn with_metrics<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut PublishMetrics) -> R,
    {
        let mut guard = self.metrics.lock().unwrap_or_else(|poison| poison.into_inner());
        f(&mut guard)
    }

    /// Waits until any candidate matches an element in the page.
    pub async fn resolve(
        &self,
        driver: &dyn PageDriver,
        control: &str,
        candidates: &[SelectorCandidate],
        timeout: Duration,
    ) -> Result<ControlHandle, ElementError> {
        self.run(driver, control, candidates, timeout, Probe::Present)
            .await
    }

    /// Waits until any candidate matches a visible element.
    pub async fn wait_visible(
        &self,
        driver: &dyn PageDriver,
        control: &str,
        candidates: &[SelectorCandidate],
        timeout: Duration,
    ) -> Result<ControlHandle, ElementError> {
        self.run(driver, control, candidates, timeout, Probe::Visible)
            .await
    }

    /// Resolves a control and performs `action` on it.
    pub async fn act(
        &self,
        driver: &dyn PageDriver,
        control: &str,
        candidates: &[SelectorCandidate],
        timeout: Duration,
        action: ElementAction<'_>,
        retry: ActionRetry,
    ) -> Result<ControlHandle, ElementError> {
        self.run(driver, control, candidates, timeout, Probe::Act(action, retry))
            .await
    }

    pub async fn click(
        &self,
        driver: &dyn PageDriver,
        control: &str,
        candidates: &[SelectorCandidate],
        timeout: Duration,
        retry: ActionRetry,
    ) -> Result<ControlHandle, ElementError> {
        self.act(driver, control, candidates, timeout, ElementAction::Click, retry)
            .await
    }

    /// Single non-waiting probe: the first candidate with a visible match.
    pub async fn first_visible(
        &self,
        driver: &dyn PageDriver,
        candidates: &[SelectorCandidate],
    ) -> Option<ControlHandle> {
        match self
            .tick(driver, "visibility probe", candidates, 0, Probe::Visible, &mut None)
            .await
        {
            TickOutcome::Resolved(handle) => Some(handle),
            _ => None,
        }
    }

    /// Polls the page location until `predicate` accepts it.
    pub async fn wait_for_url<F>(
        &self,
        driver: &dyn PageDriver,
        control: &str,
        timeout: Duration,
        predicate: F,
    ) -> Result<String, ElementError>
    where
        F: Fn(&str) -> bool,
    {
        let started = self.clock.now();
        let deadline = started + timeout;
        let mut last_error = None;
        loop {
            match driver.current_url().await {
                Ok(url) if predicate(&url) => return Ok(url),
                Ok(url) => trace!(control, %url, "location not reached yet"),
                Err(err) => {
                    debug!(control, error = %err, "location probe failed");
                    last_error = Some(err.to_string());
                }
            }
            if !self.pause_until(deadline).await {
                return Err(ElementError::NotFound {
                    control: control.to_string(),
                    waited: self.clock.now() - started,
                    last_probe_error: last_error,
                });
            }
        }
    }

    /// Sleeps one poll interval, clipped to `deadline`. Returns `false` once
    /// the deadline has been reached and no further probe should run.
    async fn pause_until(&self, deadline: Instant) -> bool {
        let now = self.clock.now();
        if now >= deadline {
            return false;
        }
        let remaining = deadline - now;
        self.clock.sleep(self.poll_interval.min(remaining)).await;
        true
    }

    async fn run(
        &self,
        driver: &dyn PageDriver,
        control: &str,
        candidates: &[SelectorCandidate],
        timeout: Duration,
        probe: Probe<'_>,
    ) -> Result<ControlHandle, ElementError> {
        let started = self.clock.now();
        let deadline = started + timeout;
        let mut start = 0;
        let mut found_but_failed: Option<(ElementTarget, BrowserError)> = None;
        let mut last_probe_error = None;

        loop {
            self.with_metrics(PublishMetrics::record_poll);
            match self
                .tick(driver, control, candidates, start, probe, &mut last_probe_error)
                .await
            {
                TickOutcome::Resolved(handle) => {
                    self.with_metrics(|metrics| metrics.record_resolved(handle.preferred));
                    debug!(
                        control,
                        target = %handle.target,
                        candidate = handle.candidate,
                        preferred = handle.preferred,
                        elapsed_ms = (self.clock.now() - started).as_millis() as u64,
                        "control resolved"
                    );
                    return Ok(handle);
                }
                TickOutcome::ActionFailed {
                    candidate,
                    target,
                    source,
                } => {
                    self.with_metrics(PublishMetrics::record_action_failure);
                    let retry = matches!(probe, Probe::Act(_, ActionRetry::Retry));
                    if !retry {
                        return Err(ElementError::ActionFailed {
                            control: control.to_string(),
                            target: target.to_string(),
                            retryable: false,
                            source,
                        });
                    }
                    debug!(control, %target, error = %source, "action failed, retrying on next tick");
                    start = (candidate + 1) % candidates.len().max(1);
                    found_but_failed = Some((target, source));
                }
                TickOutcome::Nothing => {}
            }

            if !self.pause_until(deadline).await {
                self.with_metrics(PublishMetrics::record_timeout);
                let waited = self.clock.now() - started;
                return Err(match found_but_failed {
                    Some((target, source)) => ElementError::ActionFailed {
                        control: control.to_string(),
                        target: target.to_string(),
                        retryable: true,
                        source,
                    },
                    None => ElementError::NotFound {
                        control: control.to_string(),
                        waited,
                        last_probe_error,
                    },
                });
            }
        }
    }

    async fn tick(
        &self,
        driver: &dyn PageDriver,
        control: &str,
        candidates: &[SelectorCandidate],
        start: usize,
        probe: Probe<'_>,
        last_probe_error: &mut Option<String>,
    ) -> TickOutcome {
        let total = candidates.len();
        for offset in 0..total {
            let index = (start + offset) % total;
            let candidate = &candidates[index];
            let ordered = match self.ordered_matches(driver, candidate, probe).await {
                Ok(ordered) => ordered,
                Err(err) => {
                    trace!(control, locator = %candidate.locator, error = %err, "probe failed");
                    *last_probe_error = Some(err.to_string());
                    continue;
                }
            };
            let mut failure = None;
            for (target, preferred) in ordered {
                match probe {
                    Probe::Present | Probe::Visible => {
                        return TickOutcome::Resolved(ControlHandle {
                            target,
                            candidate: index,
                            preferred,
                        });
                    }
                    Probe::Act(action, _) => match action.perform(driver, &target).await {
                        Ok(()) => {
                            return TickOutcome::Resolved(ControlHandle {
                                target,
                                candidate: index,
                                preferred,
                            });
                        }
                        Err(err) => {
                            debug!(control, %target, error = %err, "action on match failed");
                            failure = Some((target, err));
                        }
                    },
                }
            }
            if let Some((target, source)) = failure {
                return TickOutcome::ActionFailed {
                    candidate: index,
                    target,
                    source,
                };
            }
        }
        TickOutcome::Nothing
    }

    /// Matches of one candidate, preferred group first, both in document order.
    async fn ordered_matches(
        &self,
        driver: &dyn PageDriver,
        candidate: &SelectorCandidate,
        probe: Probe<'_>,
    ) -> BrowserResult<Vec<(ElementTarget, bool)>> {
        let count = driver.count(&candidate.locator).await?;
        let needs_visible = match probe {
            Probe::Present => false,
            Probe::Visible => true,
            Probe::Act(action, _) => action.requires_visibility(),
        };
        let mut preferred = Vec::new();
        let mut fallback = Vec::new();
        for index in 0..count {
            let target = ElementTarget::new(candidate.locator.clone(), index);
            if needs_visible && !driver.is_visible(&target).await? {
                continue;
            }
            let is_preferred = match &candidate.preference {
                None => true,
                Some(preference) => match preference.matches(driver, &target).await {
                    Ok(value) => value,
                    Err(err) => {
                        trace!(%target, error = %err, "preference check failed");
                        false
                    }
                },
            };
            if is_preferred {
                preferred.push((target, true));
            } else {
                fallback.push((target, false));
            }
        }
        preferred.extend(fallback);
        Ok(preferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{FakeElement, Interaction, ScriptedPage};

    fn resolver(clock: &ManualClock) -> ElementResolver {
        ElementResolver::new(clock.shared(), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn resolves_within_one_interval_of_appearance() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.add(
            FakeElement::new("publish")
                .matching(Locator::role("button", "发布"))
                .appears_after(Duration::from_millis(1_050)),
        );
        let handle = resolver(&clock)
            .resolve(
                &page,
                "publish button",
                &[Locator::role("button", "发布").into()],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(handle.candidate, 0);
        assert!(clock.elapsed() >= Duration::from_millis(1_050));
        assert!(clock.elapsed() <= Duration::from_millis(1_250));
    }

    #[tokio::test]
    async fn never_polls_past_the_deadline() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        let err = resolver(&clock)
            .resolve(
                &page,
                "missing",
                &[SelectorCandidate::css("#nope")],
                Duration::from_millis(1_100),
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(clock.elapsed(), Duration::from_millis(1_100));
        // ticks at 0, 200, ..., 1000 and a final one at the deadline
        assert_eq!(page.count_probes(), 7);
    }

    #[tokio::test]
    async fn later_candidate_wins_when_first_is_absent() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.add(FakeElement::new("tab").matching(Locator::text("图文")));
        let handle = resolver(&clock)
            .click(
                &page,
                "image tab",
                &[
                    Locator::exact_text("发布图文").into(),
                    Locator::text("图文").into(),
                ],
                Duration::from_secs(1),
                ActionRetry::FailFast,
            )
            .await
            .unwrap();
        assert_eq!(handle.candidate, 1);
        assert_eq!(page.journal(), vec![Interaction::Click("tab".into())]);
    }

    #[tokio::test]
    async fn preferred_match_is_acted_on_first() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        let input = Locator::css("input[type='file']");
        page.add(
            FakeElement::new("video-input")
                .matching(input.clone())
                .attr("accept", "video/*")
                .hidden(),
        );
        page.add(
            FakeElement::new("image-input")
                .matching(input.clone())
                .attr("accept", "image/png,image/jpeg")
                .attr("multiple", "")
                .hidden(),
        );
        let files = vec![PathBuf::from("a.png"), PathBuf::from("b.png")];
        let handle = resolver(&clock)
            .act(
                &page,
                "file input",
                &[SelectorCandidate::new(input).prefer(Preference::attribute_contains("accept", "image"))],
                Duration::from_secs(1),
                ElementAction::SetFiles(&files),
                ActionRetry::FailFast,
            )
            .await
            .unwrap();
        assert!(handle.preferred);
        assert_eq!(handle.target.index, 1);
        assert_eq!(
            page.journal(),
            vec![Interaction::Upload("image-input".into(), files.clone())]
        );
    }

    #[tokio::test]
    async fn fallback_match_used_when_preferred_action_fails() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        let input = Locator::css("input[type='file']");
        page.add(
            FakeElement::new("single-image")
                .matching(input.clone())
                .attr("accept", "image/*")
                .hidden(),
        );
        page.add(
            FakeElement::new("generic")
                .matching(input.clone())
                .attr("multiple", "")
                .hidden(),
        );
        let files = vec![PathBuf::from("a.png"), PathBuf::from("b.png")];
        let resolver = resolver(&clock);
        let handle = resolver
            .act(
                &page,
                "file input",
                &[SelectorCandidate::new(input).prefer(Preference::attribute_contains("accept", "image"))],
                Duration::from_secs(1),
                ElementAction::SetFiles(&files),
                ActionRetry::FailFast,
            )
            .await
            .unwrap();
        assert!(!handle.preferred);
        assert_eq!(
            page.journal(),
            vec![Interaction::Upload("generic".into(), files.clone())]
        );
        assert_eq!(resolver.metrics().fallback_matches, 1);
    }

    #[tokio::test]
    async fn fail_fast_surfaces_action_failure_immediately() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.add(
            FakeElement::new("publish")
                .matching(Locator::role("button", "发布"))
                .intercept_clicks(1),
        );
        let err = resolver(&clock)
            .click(
                &page,
                "publish button",
                &[Locator::role("button", "发布").into()],
                Duration::from_secs(5),
                ActionRetry::FailFast,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ElementError::ActionFailed {
                retryable: false,
                source: BrowserError::Intercepted { .. },
                ..
            }
        ));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn retry_moves_to_next_candidate_on_next_tick() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.add(
            FakeElement::new("primary")
                .matching(Locator::role("button", "发布"))
                .intercept_clicks(10),
        );
        page.add(
            FakeElement::new("secondary")
                .matching(Locator::css_with_text("button.semi-button-primary", "发布")),
        );
        let handle = resolver(&clock)
            .click(
                &page,
                "publish button",
                &[
                    Locator::role("button", "发布").into(),
                    Locator::css_with_text("button.semi-button-primary", "发布").into(),
                ],
                Duration::from_secs(5),
                ActionRetry::Retry,
            )
            .await
            .unwrap();
        assert_eq!(handle.candidate, 1);
        assert_eq!(clock.elapsed(), Duration::from_millis(200));
        assert_eq!(
            page.journal(),
            vec![
                Interaction::ClickIntercepted("primary".into()),
                Interaction::Click("secondary".into()),
            ]
        );
    }

    #[tokio::test]
    async fn retry_reports_found_but_failed_at_timeout() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.add(
            FakeElement::new("publish")
                .matching(Locator::role("button", "发布"))
                .intercept_clicks(100),
        );
        let err = resolver(&clock)
            .click(
                &page,
                "publish button",
                &[Locator::role("button", "发布").into()],
                Duration::from_secs(1),
                ActionRetry::Retry,
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable_action_failure());
        assert_eq!(clock.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn hidden_matches_do_not_satisfy_visibility() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.add(
            FakeElement::new("stale-error")
                .matching(Locator::text("上传失败"))
                .hidden(),
        );
        let resolver = resolver(&clock);
        let candidates = [SelectorCandidate::text("上传失败")];
        assert!(resolver.first_visible(&page, &candidates).await.is_none());
        assert!(resolver
            .resolve(&page, "error", &candidates, Duration::ZERO)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn wait_for_url_observes_navigation() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.set_url("https://creator.douyin.com/creator-micro/content/upload");
        page.navigate_after(
            "https://creator.douyin.com/creator-micro/content/manage",
            Duration::from_millis(700),
        );
        let url = resolver(&clock)
            .wait_for_url(&page, "manage view", Duration::from_secs(3), |url| {
                url.contains("/content/manage")
            })
            .await
            .unwrap();
        assert!(url.ends_with("/content/manage"));
        assert_eq!(clock.elapsed(), Duration::from_millis(800));
    }
}
