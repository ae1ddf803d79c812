//! Xiaohongshu creator platform.

use std::cell::Cell;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::browser::{ActionRetry, ElementAction, ElementError, Locator, Preference, SelectorCandidate};
use crate::content::{ContentType, MediaPolicy, MAX_IMAGES, SCHEDULE_FORMAT};
use crate::publish::{
    Phase, PhaseContext, PhaseOutcome, PhaseResult, PlatformAdapter, RejectionSignal, SessionProbe,
};

use super::{css, driver_error, single, texts};

pub const PUBLISH_URL: &str = "https://creator.xiaohongshu.com/publish/publish?from=homepage&target=video";
pub const PUBLISH_PATH: &str = "/publish/publish";
pub const SUCCESS_PATH: &str = "/publish/success";

pub const LOGIN_MARKERS: &[&str] = &["短信登录", "扫码登录", "手机号登录"];
pub const IMAGE_TAB: &str = "上传图文";
pub const UPLOAD_ERRORS: &[&str] = &["格式不支持", "文件过大", "上传失败"];

pub const UPLOAD_INPUTS: &[&str] = &["div[class^='upload-content'] input.upload-input", "input[type='file']"];
pub const VIDEO_READY_TEXT: &str = "上传成功";
pub const TITLE_INPUTS: &[&str] = &["div.title-container input.d-text", "input[placeholder*='标题']"];
pub const BODY_EDITORS: &[&str] = &["div.ql-editor", "div[contenteditable='true']"];

pub const ORIGINAL_SWITCH: &str = ".original-wrapper .d-switch";
pub const MODAL: &str = ".d-modal";
pub const ORIGINAL_CHECKBOX: &str = ".d-modal .d-checkbox input[type='checkbox']";
pub const ORIGINAL_CHECKBOX_SIMULATOR: &str = ".d-modal .d-checkbox .d-checkbox-simulator";
pub const MODAL_BUTTON: &str = ".d-modal button";

pub const VISIBILITY_PUBLIC: &str = "公开可见";
pub const VISIBILITY_PRIVATE: &str = "仅自己可见";

pub const SCHEDULE_SWITCH: &str = ".post-time-wrapper .d-switch";
pub const SCHEDULE_INPUT: &str = "input[placeholder='选择日期和时间']";
pub const PUBLISH_AREA_BUTTON: &str = ".publish-page-publish-btn button";

const TITLE_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(format!("unknown visibility: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct XiaohongshuOptions {
    pub declare_original: bool,
    pub visibility: Visibility,
}

#[derive(Debug, Default)]
struct Progress {
    media_set: Cell<bool>,
    body_typed: Cell<bool>,
    original_done: Cell<bool>,
    visibility_done: Cell<bool>,
    schedule_enabled: Cell<bool>,
}

#[derive(Debug, Default)]
pub struct XiaohongshuAdapter {
    options: XiaohongshuOptions,
    progress: Progress,
}

impl XiaohongshuAdapter {
    pub fn new(options: XiaohongshuOptions) -> Self {
        Self {
            options,
            progress: Progress::default(),
        }
    }

    /// Toggles the original-content declaration and confirms its modal. The
    /// agreement checkbox must be ticked before the declare button enables;
    /// when the native input refuses the click the styled simulator is used.
    async fn declare_original(&self, ctx: &PhaseContext<'_>) -> Result<(), ElementError> {
        let driver = ctx.driver;
        ctx.resolver
            .click(
                driver,
                "original declaration switch",
                &[
                    SelectorCandidate::css(ORIGINAL_SWITCH),
                    SelectorCandidate::new(Locator::css_with_text("label", "原创声明")),
                ],
                ctx.step(),
                ActionRetry::Retry,
            )
            .await?;
        match ctx
            .resolver
            .wait_visible(driver, "original declaration modal", &css(&[MODAL]), ctx.step())
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                debug!("no declaration modal shown");
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        ctx.resolver
            .act(
                driver,
                "original agreement checkbox",
                &css(&[ORIGINAL_CHECKBOX, ORIGINAL_CHECKBOX_SIMULATOR]),
                ctx.step(),
                ElementAction::Check,
                ActionRetry::Retry,
            )
            .await?;
        ctx.resolver
            .click(
                driver,
                "declare original button",
                &single(Locator::css_with_text(MODAL_BUTTON, "声明原创")),
                ctx.step(),
                ActionRetry::Retry,
            )
            .await?;
        info!("original content declared");
        Ok(())
    }

    async fn set_private(&self, ctx: &PhaseContext<'_>) -> Result<(), ElementError> {
        ctx.resolver
            .click(ctx.driver, "visibility selector", &texts(&[VISIBILITY_PUBLIC]), ctx.step(), ActionRetry::Retry)
            .await?;
        ctx.resolver
            .click(ctx.driver, "private option", &texts(&[VISIBILITY_PRIVATE]), ctx.step(), ActionRetry::Retry)
            .await?;
        debug!("visibility set to private");
        Ok(())
    }
}

#[async_trait(?Send)]
impl PlatformAdapter for XiaohongshuAdapter {
    fn name(&self) -> &'static str {
        "xiaohongshu"
    }

    fn media_policy(&self, content_type: ContentType) -> MediaPolicy {
        match content_type {
            ContentType::Video => MediaPolicy::video(),
            ContentType::Image => MediaPolicy::images(MAX_IMAGES),
        }
    }

    fn title_limit(&self) -> usize {
        TITLE_LIMIT
    }

    fn session_probe(&self) -> SessionProbe {
        SessionProbe {
            entry_url: PUBLISH_URL.to_string(),
            authoring_fragment: PUBLISH_PATH.to_string(),
            login_markers: texts(LOGIN_MARKERS),
        }
    }

    fn uses_default_composer(&self, content_type: ContentType) -> bool {
        content_type == ContentType::Video
    }

    fn rejection_signals(&self, phase: Phase) -> Vec<RejectionSignal> {
        match phase {
            Phase::MediaInjection => UPLOAD_ERRORS.iter().map(|text| RejectionSignal::text(text)).collect(),
            _ => Vec::new(),
        }
    }

    async fn navigate_to_composer(&self, ctx: &PhaseContext<'_>, _content_type: ContentType) -> PhaseOutcome {
        let location = ctx
            .driver
            .current_url()
            .await
            .map_err(driver_error("composer location"))?;
        if !location.contains(PUBLISH_PATH) {
            ctx.driver.goto(PUBLISH_URL).await.map_err(driver_error("publish composer"))?;
        }
        ctx.resolver
            .wait_for_url(ctx.driver, "publish composer", ctx.step(), |url| url.contains(PUBLISH_PATH))
            .await?;
        Ok(PhaseResult::Success)
    }

    async fn select_content_mode(&self, ctx: &PhaseContext<'_>, content_type: ContentType) -> PhaseOutcome {
        if content_type == ContentType::Image {
            ctx.resolver
                .click(ctx.driver, "image note tab", &texts(&[IMAGE_TAB]), ctx.step(), ActionRetry::Retry)
                .await?;
        }
        Ok(PhaseResult::Success)
    }

    async fn inject_media(
        &self,
        ctx: &PhaseContext<'_>,
        files: &[PathBuf],
        content_type: ContentType,
    ) -> PhaseOutcome {
        let driver = ctx.driver;
        if !self.progress.media_set.get() {
            let accepts = match content_type {
                ContentType::Video => "video",
                ContentType::Image => "image",
            };
            let inputs: Vec<SelectorCandidate> = UPLOAD_INPUTS
                .iter()
                .map(|selector| {
                    SelectorCandidate::css(*selector).prefer(Preference::attribute_contains("accept", accepts))
                })
                .collect();
            ctx.resolver
                .act(
                    driver,
                    "upload input",
                    &inputs,
                    ctx.step(),
                    ElementAction::SetFiles(files),
                    ActionRetry::Retry,
                )
                .await?;
            self.progress.media_set.set(true);
            info!(files = files.len(), %content_type, "media handed to uploader");
        }
        if content_type == ContentType::Video {
            ctx.resolver
                .wait_visible(driver, "video upload finished", &texts(&[VIDEO_READY_TEXT]), ctx.step())
                .await?;
        }
        ctx.resolver
            .wait_visible(driver, "note editor", &css(TITLE_INPUTS), ctx.step())
            .await?;
        Ok(PhaseResult::Success)
    }

    async fn fill_title(&self, ctx: &PhaseContext<'_>, title: &str) -> PhaseOutcome {
        ctx.resolver
            .act(
                ctx.driver,
                "title input",
                &css(TITLE_INPUTS),
                ctx.step(),
                ElementAction::Fill(title),
                ActionRetry::Retry,
            )
            .await?;
        Ok(PhaseResult::Success)
    }

    async fn fill_body(&self, ctx: &PhaseContext<'_>, body_and_tags: &str) -> PhaseOutcome {
        if !body_and_tags.is_empty() && !self.progress.body_typed.get() {
            ctx.resolver
                .act(
                    ctx.driver,
                    "note body editor",
                    &css(BODY_EDITORS),
                    ctx.step(),
                    ElementAction::TypeText(body_and_tags),
                    ActionRetry::Retry,
                )
                .await?;
            self.progress.body_typed.set(true);
        }
        if self.options.declare_original && !self.progress.original_done.get() {
            self.declare_original(ctx).await?;
            self.progress.original_done.set(true);
        }
        if self.options.visibility == Visibility::Private && !self.progress.visibility_done.get() {
            self.set_private(ctx).await?;
            self.progress.visibility_done.set(true);
        }
        Ok(PhaseResult::Success)
    }

    async fn configure_schedule(&self, ctx: &PhaseContext<'_>, at: NaiveDateTime) -> PhaseOutcome {
        if !self.progress.schedule_enabled.get() {
            ctx.resolver
                .click(
                    ctx.driver,
                    "schedule switch",
                    &[
                        SelectorCandidate::css(SCHEDULE_SWITCH),
                        SelectorCandidate::new(Locator::css_with_text("label", "定时发布")),
                    ],
                    ctx.step(),
                    ActionRetry::Retry,
                )
                .await?;
            self.progress.schedule_enabled.set(true);
        }
        let formatted = at.format(SCHEDULE_FORMAT).to_string();
        ctx.resolver
            .act(
                ctx.driver,
                "schedule input",
                &css(&[SCHEDULE_INPUT]),
                ctx.step(),
                ElementAction::Fill(&formatted),
                ActionRetry::Retry,
            )
            .await?;
        ctx.driver
            .press_key("Enter")
            .await
            .map_err(driver_error("schedule input"))?;
        info!(at = %formatted, "publish time scheduled");
        Ok(PhaseResult::Success)
    }

    async fn confirm_publish(&self, ctx: &PhaseContext<'_>, scheduled: bool) -> PhaseOutcome {
        let label = if scheduled { "定时发布" } else { "发布" };
        let candidates = vec![
            SelectorCandidate::new(Locator::role("button", label)),
            SelectorCandidate::new(Locator::css_with_text(PUBLISH_AREA_BUTTON, label)),
        ];
        ctx.resolver
            .click(ctx.driver, "publish button", &candidates, ctx.step(), ActionRetry::FailFast)
            .await?;
        Ok(PhaseResult::Success)
    }

    async fn verify_published(&self, ctx: &PhaseContext<'_>, timeout: Duration) -> PhaseOutcome {
        ctx.resolver
            .wait_for_url(ctx.driver, "publish success page", timeout, |url| url.contains(SUCCESS_PATH))
            .await?;
        Ok(PhaseResult::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::ElementResolver;
    use crate::clock::ManualClock;
    use crate::config::TimingSection;
    use crate::testing::{Effect, FakeElement, ScriptedPage};

    fn original_modal(page: &ScriptedPage, checkbox_refuses_click: bool) {
        page.add(
            FakeElement::new("original-switch")
                .matching(Locator::css(ORIGINAL_SWITCH))
                .on_click(Effect::reveal("modal"))
                .on_click(Effect::reveal("checkbox"))
                .on_click(Effect::reveal("simulator"))
                .on_click(Effect::reveal("declare")),
        );
        page.add(FakeElement::new("modal").matching(Locator::css(MODAL)).detached());
        let checkbox = FakeElement::new("checkbox")
            .matching(Locator::css(ORIGINAL_CHECKBOX))
            .checkable()
            .detached();
        page.add(if checkbox_refuses_click { checkbox.intercept_clicks(1) } else { checkbox });
        page.add(
            FakeElement::new("simulator")
                .matching(Locator::css(ORIGINAL_CHECKBOX_SIMULATOR))
                .checkable()
                .detached(),
        );
        page.add(
            FakeElement::new("declare")
                .matching(Locator::css_with_text(MODAL_BUTTON, "声明原创"))
                .on_click(Effect::conceal("modal"))
                .detached(),
        );
    }

    async fn run_body_fill(page: &ScriptedPage, clock: &ManualClock) {
        let resolver = ElementResolver::new(clock.shared(), Duration::from_millis(200));
        let timing = TimingSection::default();
        let adapter = XiaohongshuAdapter::new(XiaohongshuOptions {
            declare_original: true,
            visibility: Visibility::Public,
        });
        let ctx = PhaseContext::new(
            page,
            &resolver,
            &timing,
            Phase::ContentFill,
            resolver.now() + Duration::from_secs(30),
            Duration::from_secs(1),
        );
        let result = adapter.fill_body(&ctx, "").await.unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn declaration_ticks_agreement_before_declaring() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        original_modal(&page, false);
        run_body_fill(&page, &clock).await;
        assert_eq!(
            page.clicks(),
            vec!["original-switch".to_string(), "checkbox".into(), "declare".into()]
        );
    }

    #[tokio::test]
    async fn declaration_falls_back_to_checkbox_simulator() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        original_modal(&page, true);
        run_body_fill(&page, &clock).await;
        assert_eq!(
            page.clicks(),
            vec!["original-switch".to_string(), "simulator".into(), "declare".into()]
        );
    }

    #[test]
    fn parses_visibility() {
        assert_eq!("Private".parse::<Visibility>().unwrap(), Visibility::Private);
        assert!("friends".parse::<Visibility>().is_err());
    }
}
