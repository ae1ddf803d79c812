//! Douyin creator center.
//!
//! Videos go through the default upload composer; image posts switch to the
//! image tab first. Selector tables are public so page fixtures can be built
//! against exactly what the adapter probes.

use std::cell::Cell;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::browser::{ActionRetry, ElementAction, ElementError, Locator, Preference, SelectorCandidate};
use crate::content::{ContentType, MediaPolicy, MAX_IMAGES, SCHEDULE_FORMAT};
use crate::publish::{
    Phase, PhaseContext, PhaseOutcome, PhaseResult, PlatformAdapter, RejectionSignal, SessionProbe,
};

use super::{click_if_visible, css, dismiss_overlays, driver_error, single, texts};

pub const UPLOAD_URL: &str = "https://creator.douyin.com/creator-micro/content/upload";
pub const UPLOAD_PATH: &str = "/creator-micro/content/upload";
pub const VIDEO_EDITOR_PATHS: &[&str] = &[
    "/creator-micro/content/publish",
    "/creator-micro/content/post/video",
];
pub const IMAGE_EDITOR_PATH: &str = "/creator-micro/content/post/image";
pub const MANAGE_PATH: &str = "/creator-micro/content/manage";

pub const LOGIN_MARKERS: &[&str] = &["手机号登录", "扫码登录"];
pub const IMAGE_MODE_TABS: &[&str] = &["发布图文", "上传图文", "图文"];
pub const OVERLAY_DISMISS: &[&str] = &["我知道了", "知道了", "跳过", "稍后再说"];
pub const UPLOAD_ERRORS: &[&str] = &[
    "不支持该格式",
    "不支持gif格式",
    "格式不支持",
    "图片上传失败",
    "文件上传失败",
];

pub const VIDEO_INPUT: &str = "div[class^='container'] input";
pub const VIDEO_REUPLOAD_INPUT: &str = "div.progress-div [class^='upload-btn-input']";
pub const IMAGE_INPUTS: &[&str] = &["div[class^='container'] input[type='file']", "input[type='file']"];
pub const UPLOAD_DONE_CARD: &str = "[class^='long-card'] div";
pub const UPLOAD_PROGRESS_ITEM: &str = "div.progress-div > div";

pub const TITLE_INPUTS: &[&str] = &[
    "input[placeholder*='作品标题']",
    "input[placeholder*='输入标题']",
    "textarea[placeholder*='标题']",
    ".notranslate",
];
pub const BODY_EDITORS: &[&str] = &[
    "div[contenteditable='true'][role='textbox']",
    "div[contenteditable='true'][data-placeholder*='简介']",
    "div[contenteditable='true'][data-placeholder*='描述']",
    "textarea[placeholder*='作品简介']",
    ".zone-container",
];
pub const IMAGE_EDITOR_READY: &[&str] = &[
    "input[placeholder*='作品标题']",
    "input[placeholder*='输入标题']",
    "textarea[placeholder*='标题']",
    "div[contenteditable='true'][role='textbox']",
];

pub const THIRD_PARTY_SWITCH: &str = "[class^='info'] > [class^='first-part'] div div.semi-switch";
pub const THIRD_PARTY_TOGGLE: &str =
    "[class^='info'] > [class^='first-part'] div div.semi-switch input.semi-switch-native-control";

pub const PRODUCT_TAG_SELECT: &str = ".semi-select";
pub const PRODUCT_LINK_INPUT: &str = "input[placeholder='粘贴商品链接']";
pub const PRODUCT_TITLE_INPUT: &str = "input[placeholder='请输入商品短标题']";

pub const SCHEDULE_RADIO: &str = "[class^='radio']";
pub const SCHEDULE_INPUT: &str = ".semi-input[placeholder='日期和时间']";
pub const PUBLISH_PRIMARY: &str = "button.semi-button-primary";
pub const RECOMMENDED_COVER: &str = "[class^='recommendCover-']";

const TITLE_LIMIT: usize = 30;
const PRODUCT_TITLE_LIMIT: usize = 10;

/// Shopping-cart link attached under the post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductLink {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct DouyinOptions {
    pub product_link: Option<ProductLink>,
    /// Turn on the Toutiao/Xigua sync switch when the composer offers it.
    pub sync_third_party: bool,
}

impl Default for DouyinOptions {
    fn default() -> Self {
        Self {
            product_link: None,
            sync_third_party: true,
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    media_set: Cell<bool>,
    editor_reached: Cell<bool>,
    body_typed: Cell<bool>,
    product_done: Cell<bool>,
    sync_done: Cell<bool>,
    schedule_selected: Cell<bool>,
}

#[derive(Debug, Default)]
pub struct DouyinAdapter {
    options: DouyinOptions,
    progress: Progress,
}

impl DouyinAdapter {
    pub fn new(options: DouyinOptions) -> Self {
        Self {
            options,
            progress: Progress::default(),
        }
    }

    async fn inject_video(&self, ctx: &PhaseContext<'_>, files: &[PathBuf]) -> PhaseOutcome {
        let driver = ctx.driver;
        if !self.progress.media_set.get() {
            ctx.resolver
                .act(
                    driver,
                    "video file input",
                    &css(&[VIDEO_INPUT]),
                    ctx.step(),
                    ElementAction::SetFiles(files),
                    ActionRetry::Retry,
                )
                .await?;
            self.progress.media_set.set(true);
            info!(files = files.len(), "video handed to uploader");
        }
        if !self.progress.editor_reached.get() {
            ctx.resolver
                .wait_for_url(driver, "video editor", ctx.step(), |url| {
                    VIDEO_EDITOR_PATHS.iter().any(|path| url.contains(path))
                })
                .await?;
            self.progress.editor_reached.set(true);
        }

        let done = single(Locator::css_with_text(UPLOAD_DONE_CARD, "重新上传"));
        if ctx.resolver.first_visible(driver, &done).await.is_some() {
            info!("video upload finished");
            return Ok(PhaseResult::Success);
        }
        let failed = single(Locator::css_with_text(UPLOAD_PROGRESS_ITEM, "上传失败"));
        if ctx.resolver.first_visible(driver, &failed).await.is_some() {
            warn!("video upload failed, handing the file over again");
            ctx.resolver
                .act(
                    driver,
                    "video re-upload input",
                    &css(&[VIDEO_REUPLOAD_INPUT]),
                    ctx.step(),
                    ElementAction::SetFiles(files),
                    ActionRetry::Retry,
                )
                .await?;
            return Ok(PhaseResult::soft("video upload failed and was restarted"));
        }
        Ok(PhaseResult::soft("video still uploading"))
    }

    async fn inject_images(&self, ctx: &PhaseContext<'_>, files: &[PathBuf]) -> PhaseOutcome {
        let driver = ctx.driver;
        dismiss_overlays(ctx, OVERLAY_DISMISS).await;
        if !self.progress.media_set.get() {
            let inputs: Vec<SelectorCandidate> = IMAGE_INPUTS
                .iter()
                .map(|selector| {
                    SelectorCandidate::css(*selector)
                        .prefer(Preference::attribute_contains("accept", "image"))
                })
                .collect();
            let handle = ctx
                .resolver
                .act(
                    driver,
                    "image file input",
                    &inputs,
                    ctx.step(),
                    ElementAction::SetFiles(files),
                    ActionRetry::Retry,
                )
                .await?;
            self.progress.media_set.set(true);
            info!(files = files.len(), input = %handle.target, preferred = handle.preferred, "images handed to uploader");
        }
        if !self.progress.editor_reached.get() {
            let reached = ctx
                .resolver
                .wait_for_url(driver, "image editor", ctx.step(), |url| url.contains(IMAGE_EDITOR_PATH))
                .await;
            if let Err(err) = reached {
                if ctx.resolver.first_visible(driver, &texts(&["上传失败"])).await.is_some() {
                    return Ok(PhaseResult::hard("image upload failed: 上传失败"));
                }
                return Err(err);
            }
            self.progress.editor_reached.set(true);
        }
        ctx.resolver
            .wait_visible(driver, "image editor", &css(IMAGE_EDITOR_READY), ctx.step())
            .await?;
        Ok(PhaseResult::Success)
    }

    async fn attach_product(&self, ctx: &PhaseContext<'_>, link: &ProductLink) -> bool {
        let driver = ctx.driver;
        let resolver = ctx.resolver;
        let step = ctx.step();
        let opened = async {
            resolver
                .click(driver, "product tag select", &css(&[PRODUCT_TAG_SELECT]), step, ActionRetry::Retry)
                .await?;
            resolver
                .click(driver, "cart option", &single(Locator::role("option", "购物车")), step, ActionRetry::Retry)
                .await?;
            resolver
                .act(
                    driver,
                    "product link input",
                    &css(&[PRODUCT_LINK_INPUT]),
                    step,
                    ElementAction::Fill(&link.url),
                    ActionRetry::Retry,
                )
                .await?;
            resolver
                .click(
                    driver,
                    "add link button",
                    &single(Locator::css_with_text("span", "添加链接")),
                    step,
                    ActionRetry::FailFast,
                )
                .await
        }
        .await;
        if let Err(err) = opened {
            warn!(error = %err, "product link not attached");
            return false;
        }

        if resolver
            .first_visible(driver, &texts(&["未搜索到对应商品"]))
            .await
            .is_some()
        {
            click_if_visible(ctx, "product error confirm", &single(Locator::role("button", "确定"))).await;
            warn!(url = %link.url, "product link was not recognised");
            return false;
        }

        let short_title: String = link.title.chars().take(PRODUCT_TITLE_LIMIT).collect();
        let edited = resolver
            .act(
                driver,
                "product short title",
                &css(&[PRODUCT_TITLE_INPUT]),
                step,
                ElementAction::Fill(&short_title),
                ActionRetry::Retry,
            )
            .await;
        if let Err(err) = edited {
            warn!(error = %err, "product dialog did not open");
            return false;
        }
        let finish = single(Locator::css_with_text("button", "完成编辑"));
        let finished = match resolver.wait_visible(driver, "finish editing", &finish, step).await {
            Ok(handle) => {
                let class = driver
                    .attribute(&handle.target, "class")
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                !class.contains("disabled") && click_if_visible(ctx, "finish editing", &finish).await
            }
            Err(_) => false,
        };
        if !finished {
            click_if_visible(ctx, "product dialog cancel", &single(Locator::css_with_text("button", "取消"))).await;
            warn!("product dialog could not be completed");
        }
        finished
    }

    async fn enable_third_party_sync(&self, ctx: &PhaseContext<'_>) -> Result<(), ElementError> {
        let Some(handle) = ctx
            .resolver
            .first_visible(ctx.driver, &css(&[THIRD_PARTY_SWITCH]))
            .await
        else {
            return Ok(());
        };
        let class = ctx
            .driver
            .attribute(&handle.target, "class")
            .await
            .map_err(driver_error("third-party sync switch"))?
            .unwrap_or_default();
        if !class.contains("semi-switch-checked") {
            ctx.resolver
                .click(
                    ctx.driver,
                    "third-party sync toggle",
                    &css(&[THIRD_PARTY_TOGGLE]),
                    ctx.step(),
                    ActionRetry::Retry,
                )
                .await?;
            debug!("third-party sync enabled");
        }
        Ok(())
    }

    /// Picks the first recommended cover when the platform refuses to
    /// publish without one.
    async fn apply_recommended_cover(&self, ctx: &PhaseContext<'_>) {
        let demand = texts(&["请设置封面后再发布"]);
        if ctx.resolver.first_visible(ctx.driver, &demand).await.is_none() {
            return;
        }
        info!("cover required before publishing, selecting the first recommendation");
        if click_if_visible(ctx, "recommended cover", &css(&[RECOMMENDED_COVER])).await {
            let confirm = texts(&["是否确认应用此封面？"]);
            if ctx.resolver.first_visible(ctx.driver, &confirm).await.is_some() {
                click_if_visible(ctx, "cover confirm", &single(Locator::role("button", "确定"))).await;
            }
        }
    }
}

pub fn publish_buttons() -> Vec<SelectorCandidate> {
    vec![
        SelectorCandidate::new(Locator::role("button", "发布")),
        SelectorCandidate::new(Locator::css_with_text(PUBLISH_PRIMARY, "发布")),
    ]
}

#[async_trait(?Send)]
impl PlatformAdapter for DouyinAdapter {
    fn name(&self) -> &'static str {
        "douyin"
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
            entry_url: UPLOAD_URL.to_string(),
            authoring_fragment: UPLOAD_PATH.to_string(),
            login_markers: texts(LOGIN_MARKERS),
        }
    }

    fn uses_default_composer(&self, content_type: ContentType) -> bool {
        content_type == ContentType::Video
    }

    fn rejection_signals(&self, phase: Phase) -> Vec<RejectionSignal> {
        match phase {
            Phase::MediaInjection | Phase::ContentFill => {
                UPLOAD_ERRORS.iter().map(|text| RejectionSignal::text(text)).collect()
            }
            _ => Vec::new(),
        }
    }

    async fn navigate_to_composer(&self, ctx: &PhaseContext<'_>, _content_type: ContentType) -> PhaseOutcome {
        let location = ctx
            .driver
            .current_url()
            .await
            .map_err(driver_error("composer location"))?;
        if !location.contains(UPLOAD_PATH) {
            ctx.driver.goto(UPLOAD_URL).await.map_err(driver_error("upload composer"))?;
        }
        ctx.resolver
            .wait_for_url(ctx.driver, "upload composer", ctx.step(), |url| url.contains(UPLOAD_PATH))
            .await?;
        Ok(PhaseResult::Success)
    }

    async fn select_content_mode(&self, ctx: &PhaseContext<'_>, content_type: ContentType) -> PhaseOutcome {
        if content_type == ContentType::Image {
            ctx.resolver
                .click(ctx.driver, "image mode tab", &texts(IMAGE_MODE_TABS), ctx.step(), ActionRetry::Retry)
                .await?;
            debug!("switched composer to image mode");
        }
        Ok(PhaseResult::Success)
    }

    async fn inject_media(
        &self,
        ctx: &PhaseContext<'_>,
        files: &[PathBuf],
        content_type: ContentType,
    ) -> PhaseOutcome {
        match content_type {
            ContentType::Video => self.inject_video(ctx, files).await,
            ContentType::Image => self.inject_images(ctx, files).await,
        }
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
                    "description editor",
                    &css(BODY_EDITORS),
                    ctx.step(),
                    ElementAction::TypeText(body_and_tags),
                    ActionRetry::Retry,
                )
                .await?;
            self.progress.body_typed.set(true);
        }
        if let Some(link) = &self.options.product_link {
            if !self.progress.product_done.get() {
                let attached = self.attach_product(ctx, link).await;
                info!(attached, "product link side flow finished");
                self.progress.product_done.set(true);
            }
        }
        if self.options.sync_third_party && !self.progress.sync_done.get() {
            self.enable_third_party_sync(ctx).await?;
            self.progress.sync_done.set(true);
        }
        Ok(PhaseResult::Success)
    }

    async fn configure_schedule(&self, ctx: &PhaseContext<'_>, at: NaiveDateTime) -> PhaseOutcome {
        if !self.progress.schedule_selected.get() {
            ctx.resolver
                .click(
                    ctx.driver,
                    "scheduled publish option",
                    &single(Locator::css_with_text(SCHEDULE_RADIO, "定时发布")),
                    ctx.step(),
                    ActionRetry::Retry,
                )
                .await?;
            self.progress.schedule_selected.set(true);
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
        dismiss_overlays(ctx, OVERLAY_DISMISS).await;
        self.apply_recommended_cover(ctx).await;
        let mut candidates = Vec::new();
        if scheduled {
            candidates.push(SelectorCandidate::new(Locator::role("button", "定时发布")));
        }
        candidates.extend(publish_buttons());
        let handle = ctx
            .resolver
            .click(ctx.driver, "publish button", &candidates, ctx.step(), ActionRetry::FailFast)
            .await?;
        debug!(target = %handle.target, scheduled, "publish clicked");
        Ok(PhaseResult::Success)
    }

    async fn verify_published(&self, ctx: &PhaseContext<'_>, timeout: Duration) -> PhaseOutcome {
        ctx.resolver
            .wait_for_url(ctx.driver, "content manager", timeout, |url| url.contains(MANAGE_PATH))
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
    use crate::testing::{Effect, FakeElement, Interaction, ScriptedPage};

    fn context<'a>(
        page: &'a ScriptedPage,
        resolver: &'a ElementResolver,
        timing: &'a TimingSection,
        phase: Phase,
    ) -> PhaseContext<'a> {
        PhaseContext::new(
            page,
            resolver,
            timing,
            phase,
            resolver.now() + Duration::from_secs(30),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn image_upload_prefers_image_input() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.set_url(UPLOAD_URL);
        page.add(
            FakeElement::new("video-input")
                .matching(Locator::css(IMAGE_INPUTS[1]))
                .attr("accept", "video/mp4"),
        );
        page.add(
            FakeElement::new("image-input")
                .matching(Locator::css(IMAGE_INPUTS[1]))
                .attr("accept", "image/png,image/jpeg")
                .attr("multiple", "")
                .on_upload(Effect::navigate(
                    format!("https://creator.douyin.com{IMAGE_EDITOR_PATH}"),
                    Duration::ZERO,
                )),
        );
        page.add(FakeElement::new("title").matching(Locator::css(IMAGE_EDITOR_READY[0])));
        let resolver = ElementResolver::new(clock.shared(), Duration::from_millis(200));
        let timing = TimingSection::default();
        let adapter = DouyinAdapter::default();
        let files = vec![PathBuf::from("a.jpg"), PathBuf::from("b.png")];

        let ctx = context(&page, &resolver, &timing, Phase::MediaInjection);
        let result = adapter.inject_media(&ctx, &files, ContentType::Image).await.unwrap();

        assert!(result.is_success());
        assert!(page
            .journal()
            .contains(&Interaction::Upload("image-input".into(), files.clone())));
        assert!(!page
            .journal()
            .iter()
            .any(|entry| matches!(entry, Interaction::Upload(name, _) if name == "video-input")));
    }

    #[tokio::test]
    async fn failed_video_upload_is_handed_over_again() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.set_url(format!("https://creator.douyin.com{}", VIDEO_EDITOR_PATHS[0]));
        page.add(FakeElement::new("upload").matching(Locator::css(VIDEO_INPUT)));
        page.add(
            FakeElement::new("failed")
                .matching(Locator::css_with_text(UPLOAD_PROGRESS_ITEM, "上传失败"))
                .on_url("/content/publish"),
        );
        page.add(
            FakeElement::new("reupload")
                .matching(Locator::css(VIDEO_REUPLOAD_INPUT))
                .on_upload(Effect::conceal("failed"))
                .on_upload(Effect::reveal_after("done", Duration::from_secs(1))),
        );
        page.add(
            FakeElement::new("done")
                .matching(Locator::css_with_text(UPLOAD_DONE_CARD, "重新上传"))
                .detached(),
        );
        let resolver = ElementResolver::new(clock.shared(), Duration::from_millis(200));
        let timing = TimingSection::default();
        let adapter = DouyinAdapter::default();
        let files = vec![PathBuf::from("clip.mp4")];

        let ctx = context(&page, &resolver, &timing, Phase::MediaInjection);
        let first = adapter.inject_media(&ctx, &files, ContentType::Video).await.unwrap();
        assert!(matches!(first, PhaseResult::SoftFailure(reason) if reason.contains("restarted")));

        clock.advance(Duration::from_secs(1));
        let second = adapter.inject_media(&ctx, &files, ContentType::Video).await.unwrap();
        assert!(second.is_success());
        let uploads: Vec<_> = page
            .journal()
            .into_iter()
            .filter_map(|entry| match entry {
                Interaction::Upload(name, _) => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(uploads, vec!["upload".to_string(), "reupload".to_string()]);
    }

    #[tokio::test]
    async fn required_cover_is_selected_before_publishing() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.add(FakeElement::new("cover-demand").matching(Locator::text("请设置封面后再发布")));
        page.add(
            FakeElement::new("cover")
                .matching(Locator::css(RECOMMENDED_COVER))
                .on_click(Effect::conceal("cover-demand")),
        );
        page.add(FakeElement::new("publish").matching(Locator::role("button", "发布")));
        let resolver = ElementResolver::new(clock.shared(), Duration::from_millis(200));
        let timing = TimingSection::default();
        let adapter = DouyinAdapter::default();

        let ctx = context(&page, &resolver, &timing, Phase::PublishConfirm);
        adapter.confirm_publish(&ctx, false).await.unwrap();

        assert_eq!(page.clicks(), vec!["cover".to_string(), "publish".to_string()]);
    }

    #[tokio::test]
    async fn checked_sync_switch_is_left_alone() {
        let clock = ManualClock::new();
        let page = ScriptedPage::new(clock.clone());
        page.add(
            FakeElement::new("switch")
                .matching(Locator::css(THIRD_PARTY_SWITCH))
                .attr("class", "semi-switch semi-switch-checked"),
        );
        page.add(FakeElement::new("toggle").matching(Locator::css(THIRD_PARTY_TOGGLE)));
        let resolver = ElementResolver::new(clock.shared(), Duration::from_millis(200));
        let timing = TimingSection::default();
        let adapter = DouyinAdapter::default();

        let ctx = context(&page, &resolver, &timing, Phase::ContentFill);
        adapter.fill_body(&ctx, "").await.unwrap();
        assert!(page.clicks().is_empty());
    }
}
