use std::path::PathBuf;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, TimeSinceEpoch};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::element::Element;
use chromiumoxide::page::ScreenshotParams;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::automation::{BrowserAutomation, BrowserContext, BrowserLauncher};
use super::driver::{
    ElementTarget, Locator, OriginStorage, PageDriver, PageSession, PageSessionFactory,
    StorageEntry, StorageState, StoredCookie,
};
use super::error::{BrowserError, BrowserResult};

const MARK_ATTRIBUTE: &str = "data-sau-mark";

/// Tags every node matching a non-CSS locator so it can be fetched with a
/// plain attribute selector afterwards. Returns the match count.
const MARK_FN: &str = r#"(probe) => {
    const norm = (value) => String(value || '').replace(/\s+/g, ' ').trim();
    const matches = (value) => probe.exact ? value === probe.text : value.includes(probe.text);
    const roleSelectors = {
        button: 'button, [role="button"], input[type="button"], input[type="submit"]',
        link: 'a[href], [role="link"]',
        checkbox: 'input[type="checkbox"], [role="checkbox"]',
        radio: 'input[type="radio"], [role="radio"]',
        textbox: 'input:not([type]), input[type="text"], textarea, [role="textbox"]',
        tab: '[role="tab"]',
    };
    document.querySelectorAll('[' + probe.attr + ']').forEach((node) => node.removeAttribute(probe.attr));
    let pool = [];
    let label = (node) => norm(node.innerText || node.textContent);
    if (probe.kind === 'text') {
        pool = Array.from(document.body ? document.body.querySelectorAll('*') : [])
            .filter((node) => !['SCRIPT', 'STYLE', 'NOSCRIPT', 'TEMPLATE'].includes(node.tagName));
    } else if (probe.kind === 'role') {
        pool = Array.from(document.querySelectorAll(roleSelectors[probe.role] || ('[role="' + probe.role + '"]')));
        label = (node) => norm(node.getAttribute('aria-label') || node.innerText || node.textContent || node.value);
    } else {
        pool = Array.from(document.querySelectorAll(probe.selector));
    }
    let hits = pool.filter((node) => matches(label(node)));
    if (probe.kind === 'text') {
        hits = hits.filter((node) => !Array.from(node.children).some((child) => matches(label(child))));
    }
    hits.forEach((node) => node.setAttribute(probe.attr, probe.token));
    return hits.length;
}"#;

const VISIBLE_FN: &str = r#"function() {
    if (!this.isConnected) return false;
    const style = window.getComputedStyle(this);
    if (style.visibility === 'hidden' || style.display === 'none' || Number(style.opacity) === 0) return false;
    const rect = this.getBoundingClientRect();
    return rect.width > 0 && rect.height > 0;
}"#;

const CHECKED_FN: &str = r#"function() {
    if (typeof this.checked === 'boolean') return this.checked;
    const aria = this.getAttribute('aria-checked');
    if (aria !== null) return aria === 'true';
    return /(^|[\s-])checked(\s|$)/.test(String(this.className || ''));
}"#;

/// True when a click at the element centre would land on the element itself.
const HIT_TEST_FN: &str = r#"function() {
    const rect = this.getBoundingClientRect();
    const hit = document.elementFromPoint(rect.left + rect.width / 2, rect.top + rect.height / 2);
    return !hit || hit === this || this.contains(hit);
}"#;

const STORAGE_EXPORT_SCRIPT: &str = r#"(() => {
    try {
        const entries = Object.keys(window.localStorage).map((name) => ({ name, value: window.localStorage.getItem(name) || '' }));
        return { origin: window.location.origin, entries };
    } catch (_) {
        return { origin: window.location.origin, entries: [] };
    }
})()"#;

#[derive(Debug, Serialize)]
struct MarkSpec<'a> {
    kind: &'static str,
    attr: &'static str,
    token: String,
    selector: Option<&'a str>,
    text: Option<&'a str>,
    role: Option<&'a str>,
    exact: bool,
}

#[derive(Debug, Deserialize)]
struct OriginSnapshot {
    origin: String,
    entries: Vec<StorageEntry>,
}

impl BrowserContext {
    async fn elements(&self, locator: &Locator) -> BrowserResult<Vec<Element>> {
        let probe = match locator {
            Locator::Css { selector } => {
                return Ok(self.page().find_elements(selector.as_str()).await?);
            }
            Locator::Text { text, exact } => MarkSpec {
                kind: "text",
                attr: MARK_ATTRIBUTE,
                token: uuid::Uuid::new_v4().to_string(),
                selector: None,
                text: Some(text),
                role: None,
                exact: *exact,
            },
            Locator::Role { role, name, exact } => MarkSpec {
                kind: "role",
                attr: MARK_ATTRIBUTE,
                token: uuid::Uuid::new_v4().to_string(),
                selector: None,
                text: Some(name),
                role: Some(role),
                exact: *exact,
            },
            Locator::CssWithText { selector, text } => MarkSpec {
                kind: "css",
                attr: MARK_ATTRIBUTE,
                token: uuid::Uuid::new_v4().to_string(),
                selector: Some(selector),
                text: Some(text),
                role: None,
                exact: false,
            },
        };
        let script = format!("({MARK_FN})({})", serde_json::to_string(&probe)?);
        let count: usize = self
            .page()
            .evaluate(script.as_str())
            .await
            .map_err(|err| BrowserError::Script(format!("locator {locator}: {err}")))?
            .into_value()
            .map_err(|err| BrowserError::Script(format!("locator {locator}: {err}")))?;
        trace!(%locator, count, "marked locator matches");
        if count == 0 {
            return Ok(Vec::new());
        }
        let selector = format!("[{MARK_ATTRIBUTE}=\"{}\"]", probe.token);
        Ok(self.page().find_elements(selector).await?)
    }

    async fn element(&self, target: &ElementTarget) -> BrowserResult<Element> {
        self.elements(&target.locator)
            .await?
            .into_iter()
            .nth(target.index)
            .ok_or_else(|| BrowserError::Detached {
                target: target.to_string(),
            })
    }

    async fn call_bool(element: &Element, function: &str) -> BrowserResult<bool> {
        let returns = element.call_js_fn(function, false).await?;
        Ok(returns
            .result
            .value
            .and_then(|value| value.as_bool())
            .unwrap_or(false))
    }

    async fn dispatch_key(&self, key: &str) -> BrowserResult<()> {
        let (code, text) = match key {
            "Enter" => (13, Some("\r")),
            "Tab" => (9, None),
            "Escape" => (27, None),
            "Backspace" => (8, None),
            "Delete" => (46, None),
            _ => (0, None),
        };
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let is_down = matches!(kind, DispatchKeyEventType::KeyDown);
            let mut builder = DispatchKeyEventParams::builder()
                .r#type(kind)
                .key(key.to_string())
                .code(key.to_string());
            if code != 0 {
                builder = builder.windows_virtual_key_code(code);
            }
            if let (Some(text), true) = (text, is_down) {
                builder = builder.text(text.to_string());
            }
            let params = builder.build().map_err(BrowserError::Configuration)?;
            self.page().execute(params).await?;
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl PageDriver for BrowserContext {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        debug!(url, "navigating");
        self.navigate(url).await
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self.page().url().await?.unwrap_or_default())
    }

    async fn count(&self, locator: &Locator) -> BrowserResult<usize> {
        Ok(self.elements(locator).await?.len())
    }

    async fn attribute(&self, target: &ElementTarget, name: &str) -> BrowserResult<Option<String>> {
        let element = self.element(target).await?;
        Ok(element.attribute(name).await?)
    }

    async fn is_visible(&self, target: &ElementTarget) -> BrowserResult<bool> {
        let element = self.element(target).await?;
        Self::call_bool(&element, VISIBLE_FN).await
    }

    async fn is_checked(&self, target: &ElementTarget) -> BrowserResult<bool> {
        let element = self.element(target).await?;
        Self::call_bool(&element, CHECKED_FN).await
    }

    async fn click(&self, target: &ElementTarget) -> BrowserResult<()> {
        let element = self.element(target).await?;
        element.scroll_into_view().await?;
        if !Self::call_bool(&element, HIT_TEST_FN).await? {
            return Err(BrowserError::Intercepted {
                target: target.to_string(),
            });
        }
        element.click().await?;
        Ok(())
    }

    async fn fill(&self, target: &ElementTarget, text: &str) -> BrowserResult<()> {
        let element = self.element(target).await?;
        element.scroll_into_view().await?;
        let function = format!(
            r#"function() {{
    const value = {};
    this.focus();
    if (this.isContentEditable) {{
        this.textContent = value;
    }} else {{
        const proto = this instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
        const descriptor = Object.getOwnPropertyDescriptor(proto, 'value');
        if (descriptor && descriptor.set) {{ descriptor.set.call(this, value); }} else {{ this.value = value; }}
    }}
    this.dispatchEvent(new Event('input', {{ bubbles: true }}));
    this.dispatchEvent(new Event('change', {{ bubbles: true }}));
    return true;
}}"#,
            serde_json::to_string(text)?
        );
        element.call_js_fn(function, false).await?;
        Ok(())
    }

    async fn type_text(&self, target: &ElementTarget, text: &str) -> BrowserResult<()> {
        let element = self.element(target).await?;
        element.scroll_into_view().await?;
        element.focus().await?;
        for (index, line) in text.split('\n').enumerate() {
            if index > 0 {
                element.press_key("Enter").await?;
            }
            if !line.is_empty() {
                element.type_str(line).await?;
            }
        }
        Ok(())
    }

    async fn press_key(&self, key: &str) -> BrowserResult<()> {
        self.dispatch_key(key).await
    }

    async fn set_input_files(&self, target: &ElementTarget, files: &[PathBuf]) -> BrowserResult<()> {
        let element = self.element(target).await?;
        if files.len() > 1 && element.attribute("multiple").await?.is_none() {
            return Err(BrowserError::Unexpected(format!(
                "{target} accepts a single file, got {}",
                files.len()
            )));
        }
        let mut absolute = Vec::with_capacity(files.len());
        for file in files {
            absolute.push(std::fs::canonicalize(file)?.display().to_string());
        }
        let params = SetFileInputFilesParams::builder()
            .files(absolute)
            .backend_node_id(element.backend_node_id)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page().execute(params).await?;
        Ok(())
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        Ok(self.page().screenshot(params).await?)
    }

    async fn content(&self) -> BrowserResult<String> {
        Ok(self.page().content().await?)
    }

    async fn export_storage(&self) -> BrowserResult<StorageState> {
        let cookies = self
            .page()
            .get_cookies()
            .await?
            .into_iter()
            .map(|cookie| StoredCookie {
                name: cookie.name,
                value: cookie.value,
                domain: cookie.domain,
                path: cookie.path,
                expires: if cookie.session { -1.0 } else { cookie.expires },
                http_only: cookie.http_only,
                secure: cookie.secure,
            })
            .collect();
        let snapshot: OriginSnapshot = self
            .page()
            .evaluate(STORAGE_EXPORT_SCRIPT)
            .await
            .map_err(|err| BrowserError::Script(format!("failed to read local storage: {err}")))?
            .into_value()?;
        let origins = if snapshot.entries.is_empty() || snapshot.origin == "null" {
            Vec::new()
        } else {
            vec![OriginStorage {
                origin: snapshot.origin,
                local_storage: snapshot.entries,
            }]
        };
        Ok(StorageState { cookies, origins })
    }

    async fn import_storage(&self, state: &StorageState) -> BrowserResult<()> {
        let mut params = Vec::with_capacity(state.cookies.len());
        for cookie in &state.cookies {
            let mut builder = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone())
                .domain(cookie.domain.clone())
                .path(cookie.path.clone())
                .secure(cookie.secure)
                .http_only(cookie.http_only);
            if cookie.expires > 0.0 {
                builder = builder.expires(TimeSinceEpoch::new(cookie.expires));
            }
            params.push(builder.build().map_err(BrowserError::Storage)?);
        }
        if !params.is_empty() {
            self.page().set_cookies(params).await?;
        }
        for origin in &state.origins {
            if origin.local_storage.is_empty() {
                continue;
            }
            let script = format!(
                "(() => {{ const origin = {}; const entries = {}; if (window.location.origin !== origin) return; for (const entry of entries) {{ try {{ window.localStorage.setItem(entry.name, entry.value); }} catch (_) {{}} }} }})();",
                serde_json::to_string(&origin.origin)?,
                serde_json::to_string(&origin.local_storage)?
            );
            self.page()
                .evaluate_on_new_document(
                    AddScriptToEvaluateOnNewDocumentParams::builder()
                        .source(script)
                        .build()
                        .map_err(BrowserError::Configuration)?,
                )
                .await?;
        }
        debug!(
            cookies = state.cookies.len(),
            origins = state.origins.len(),
            "imported storage state"
        );
        Ok(())
    }
}

/// Chromium instance plus its single page.
pub struct ChromiumSession {
    automation: BrowserAutomation,
    context: BrowserContext,
}

#[async_trait(?Send)]
impl PageSession for ChromiumSession {
    fn driver(&self) -> &dyn PageDriver {
        &self.context
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        let ChromiumSession {
            automation,
            context,
        } = *self;
        drop(context);
        automation.shutdown().await
    }
}

pub struct ChromiumSessionFactory {
    launcher: BrowserLauncher,
}

impl ChromiumSessionFactory {
    pub fn new(launcher: BrowserLauncher) -> Self {
        Self { launcher }
    }
}

#[async_trait(?Send)]
impl PageSessionFactory for ChromiumSessionFactory {
    async fn open(&self, label: &str) -> BrowserResult<Box<dyn PageSession>> {
        let automation = self.launcher.launch(label).await?;
        let context = match automation.new_context().await {
            Ok(context) => context,
            Err(err) => {
                if let Err(shutdown) = automation.shutdown().await {
                    debug!(error = %shutdown, "shutdown after failed page open");
                }
                return Err(err);
            }
        };
        Ok(Box::new(ChromiumSession {
            automation,
            context,
        }))
    }
}
