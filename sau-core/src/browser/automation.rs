use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::{seq::SliceRandom, Rng};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{PublisherConfig, ViewportSection};

use super::error::{BrowserError, BrowserResult};
use super::profile::{BrowserProfile, ProfileManager};

const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct ViewportSpec {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOverrides {
    pub headless: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: Arc<PublisherConfig>,
    profiles: ProfileManager,
    overrides: LaunchOverrides,
}

impl BrowserLauncher {
    pub fn new(config: Arc<PublisherConfig>, profiles: ProfileManager) -> Self {
        Self {
            config,
            profiles,
            overrides: LaunchOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: LaunchOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub async fn launch(&self, label: &str) -> BrowserResult<BrowserAutomation> {
        match self.profiles.cleanup_expired() {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "removed expired scratch profiles"),
            Err(err) => warn!(error = %err, "profile cleanup failed"),
        }
        let profile = self.profiles.allocate(label)?;
        let viewport = select_viewport(&self.config.viewport);
        let user_agent = self.select_user_agent();
        let headless = self
            .overrides
            .headless
            .unwrap_or(self.config.chromium.headless);
        let chromium_config = self.build_chromium_config(&profile, &viewport, &user_agent, headless)?;
        info!(
            profile = %profile.id(),
            ua = %user_agent,
            width = viewport.width,
            height = viewport.height,
            headless,
            "launching chromium instance"
        );

        let (browser, mut handler) = match Browser::launch(chromium_config).await {
            Ok(pair) => pair,
            Err(err) => {
                if let Err(cleanup) = profile.remove().await {
                    warn!(error = %cleanup, "failed to remove profile after launch error");
                }
                return Err(BrowserError::Launch(err.to_string()));
            }
        };

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        profile.touch().await?;

        Ok(BrowserAutomation {
            browser,
            profile,
            handler_task: Some(handler_task),
            config: Arc::clone(&self.config),
            user_agent,
        })
    }

    fn select_user_agent(&self) -> String {
        let mut rng = rand::thread_rng();
        self.config
            .user_agents
            .pool
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| FALLBACK_USER_AGENT.to_string())
    }

    fn build_chromium_config(
        &self,
        profile: &BrowserProfile,
        viewport: &ViewportSpec,
        user_agent: &str,
        headless: bool,
    ) -> BrowserResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder()
            .chrome_executable(&self.config.chromium.executable_path)
            .user_data_dir(profile.path())
            .viewport(ChromiumViewport {
                width: viewport.width,
                height: viewport.height,
                device_scale_factor: Some(viewport.device_scale_factor),
                emulating_mobile: false,
                is_landscape: viewport.width >= viewport.height,
                has_touch: false,
            });

        if !headless {
            builder = builder.with_head();
        }
        if !self.config.chromium.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = self.config.chromium.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }

        let mut args = vec![
            format!("--user-agent={user_agent}"),
            format!("--window-size={},{}", viewport.width, viewport.height),
        ];
        if self.config.chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(lang) = &self.config.flags.lang {
            args.push(format!("--lang={lang}"));
        }
        if self.config.flags.no_first_run {
            args.push("--no-first-run".into());
        }
        if self.config.flags.disable_automation_controlled {
            args.push("--disable-blink-features=AutomationControlled".into());
        }
        if let Some(accept) = &self.config.flags.accept_language {
            args.push(format!("--accept-lang={accept}"));
        }
        args.push("--disable-background-timer-throttling".into());
        args.push("--password-store=basic".into());

        builder = builder.args(args);
        builder.build().map_err(BrowserError::Configuration)
    }
}

fn select_viewport(section: &ViewportSection) -> ViewportSpec {
    let ViewportSection {
        resolutions,
        jitter_pixels,
        device_scale_factor,
    } = section;

    let mut rng = rand::thread_rng();
    let base = resolutions.choose(&mut rng).cloned().unwrap_or([1366, 768]);
    let jitter = *jitter_pixels as i32;
    let width = (base[0] as i32 + rng.gen_range(-jitter..=jitter)).clamp(1024, 2560) as u32;
    let height = (base[1] as i32 + rng.gen_range(-jitter..=jitter)).clamp(700, 1600) as u32;
    let (low, high) = if device_scale_factor[0] <= device_scale_factor[1] {
        (device_scale_factor[0], device_scale_factor[1])
    } else {
        (device_scale_factor[1], device_scale_factor[0])
    };
    let scale = rng.gen_range(low..=high) as f64;
    ViewportSpec {
        width,
        height,
        device_scale_factor: scale,
    }
}

#[derive(Debug)]
pub struct BrowserAutomation {
    browser: Browser,
    profile: BrowserProfile,
    handler_task: Option<JoinHandle<()>>,
    config: Arc<PublisherConfig>,
    user_agent: String,
}

impl BrowserAutomation {
    pub async fn new_context(&self) -> BrowserResult<BrowserContext> {
        let params = CreateTargetParams::new("about:blank");
        let page = self.browser.new_page(params).await?;
        self.configure_page(&page).await?;
        Ok(BrowserContext {
            page,
            navigate_timeout: Duration::from_millis(self.config.timing.navigate_ms),
        })
    }

    /// Closes the browser and deletes the scratch profile.
    pub async fn shutdown(mut self) -> BrowserResult<()> {
        info!(profile = %self.profile.id(), "shutting down chromium instance");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        self.profile.remove().await
    }

    async fn configure_page(&self, page: &Page) -> BrowserResult<()> {
        page.enable_stealth_mode_with_agent(&self.user_agent).await?;

        let mut params_builder =
            SetUserAgentOverrideParams::builder().user_agent(self.user_agent.clone());
        if let Some(accept) = &self.config.flags.accept_language {
            params_builder = params_builder.accept_language(accept.clone());
        }
        let params = params_builder
            .build()
            .map_err(BrowserError::Configuration)?;
        page.set_user_agent(params).await?;

        if let Some(lang) = &self.config.flags.lang {
            let languages_script = format!(
                "Object.defineProperty(navigator, 'language', {{ get: () => '{lang}' }});\nObject.defineProperty(navigator, 'languages', {{ get: () => ['{lang}', 'en-US'] }});"
            );
            page.evaluate_on_new_document(
                AddScriptToEvaluateOnNewDocumentParams::builder()
                    .source(languages_script)
                    .build()
                    .map_err(BrowserError::Configuration)?,
            )
            .await?;
        }
        Ok(())
    }
}

impl Drop for BrowserAutomation {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!(
                    profile = %self.profile.id(),
                    "BrowserAutomation dropped without explicit shutdown"
                );
            }
        }
    }
}

#[derive(Debug)]
pub struct BrowserContext {
    page: Page,
    navigate_timeout: Duration,
}

impl BrowserContext {
    pub fn page(&self) -> &Page {
        &self.page
    }

    pub async fn navigate(&self, url: &str) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        let load = async {
            self.page.goto(params).await?;
            self.page.wait_for_navigation().await?;
            Ok::<(), BrowserError>(())
        };
        match tokio::time::timeout(self.navigate_timeout, load).await {
            Ok(result) => result,
            Err(_) => Err(BrowserError::Timeout(format!("navigation to {url}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_respects_bounds_and_scale_order() {
        let section = ViewportSection {
            resolutions: vec![[1920, 1080]],
            jitter_pixels: 12,
            device_scale_factor: [2.0, 1.0],
        };
        for _ in 0..32 {
            let viewport = select_viewport(&section);
            assert!((1908..=1932).contains(&viewport.width));
            assert!((1068..=1092).contains(&viewport.height));
            assert!((1.0..=2.0).contains(&viewport.device_scale_factor));
        }
    }

    #[test]
    fn empty_resolution_list_falls_back() {
        let section = ViewportSection {
            resolutions: vec![],
            jitter_pixels: 0,
            device_scale_factor: [1.0, 1.0],
        };
        let viewport = select_viewport(&section);
        assert_eq!((viewport.width, viewport.height), (1366, 768));
    }
}
