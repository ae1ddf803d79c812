//! Platform adapters and the shared probes they are built from.

pub mod douyin;
pub mod xiaohongshu;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::browser::{ActionRetry, BrowserError, ElementError, Locator, PublishMetrics, SelectorCandidate};
use crate::publish::{PhaseContext, PlatformAdapter};

pub use douyin::{DouyinAdapter, DouyinOptions, ProductLink};
pub use xiaohongshu::{Visibility, XiaohongshuAdapter, XiaohongshuOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Douyin,
    Xiaohongshu,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Douyin => "douyin",
            Platform::Xiaohongshu => "xiaohongshu",
        }
    }

    pub fn adapter(&self, options: &PlatformOptions) -> Box<dyn PlatformAdapter> {
        match self {
            Platform::Douyin => Box::new(DouyinAdapter::new(options.douyin.clone())),
            Platform::Xiaohongshu => Box::new(XiaohongshuAdapter::new(options.xiaohongshu.clone())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "douyin" | "dy" => Ok(Platform::Douyin),
            "xiaohongshu" | "xhs" => Ok(Platform::Xiaohongshu),
            other => Err(format!("unsupported platform: {other}")),
        }
    }
}

/// Per-platform side-flow settings.
#[derive(Debug, Clone, Default)]
pub struct PlatformOptions {
    pub douyin: DouyinOptions,
    pub xiaohongshu: XiaohongshuOptions,
}

fn css(selectors: &[&str]) -> Vec<SelectorCandidate> {
    selectors.iter().map(|selector| SelectorCandidate::css(*selector)).collect()
}

fn texts(values: &[&str]) -> Vec<SelectorCandidate> {
    values.iter().map(|value| SelectorCandidate::text(*value)).collect()
}

fn single(locator: Locator) -> Vec<SelectorCandidate> {
    vec![SelectorCandidate::new(locator)]
}

fn driver_error(control: &'static str) -> impl FnOnce(BrowserError) -> ElementError {
    move |source| ElementError::driver(control, source)
}

/// Clicks the first visible candidate if there is one. Failures are logged
/// and reported as `false`; callers treat these controls as optional.
async fn click_if_visible(ctx: &PhaseContext<'_>, control: &str, candidates: &[SelectorCandidate]) -> bool {
    let Some(handle) = ctx.resolver.first_visible(ctx.driver, candidates).await else {
        return false;
    };
    let winner = std::slice::from_ref(&candidates[handle.candidate]);
    match ctx
        .resolver
        .click(ctx.driver, control, winner, Duration::ZERO, ActionRetry::FailFast)
        .await
    {
        Ok(_) => true,
        Err(err) => {
            debug!(control, error = %err, "optional control could not be clicked");
            false
        }
    }
}

async fn dismiss_overlays(ctx: &PhaseContext<'_>, dismiss_texts: &[&str]) {
    if click_if_visible(ctx, "blocking overlay", &texts(dismiss_texts)).await {
        ctx.resolver.with_metrics(PublishMetrics::record_overlay_dismissed);
        debug!(phase = %ctx.phase, "blocking overlay dismissed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_platform_aliases() {
        assert_eq!("xhs".parse::<Platform>().unwrap(), Platform::Xiaohongshu);
        assert_eq!(" Douyin ".parse::<Platform>().unwrap(), Platform::Douyin);
        assert!("kuaishou".parse::<Platform>().is_err());
        assert_eq!(Platform::Xiaohongshu.to_string(), "xiaohongshu");
    }

    #[test]
    fn adapters_report_platform_names() {
        let options = PlatformOptions::default();
        assert_eq!(Platform::Douyin.adapter(&options).name(), "douyin");
        assert_eq!(Platform::Xiaohongshu.adapter(&options).name(), "xiaohongshu");
    }
}
