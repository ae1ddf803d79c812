//! Scripted page doubles for exercising resolver, adapters and state machine
//! without a browser.
//!
//! A [`ScriptedPage`] holds a flat list of [`FakeElement`]s, each matching a
//! fixed set of locators. Elements can appear after a delay on the shared
//! [`ManualClock`], be restricted to a URL, intercept clicks, and trigger
//! effects (navigation, revealing or hiding other elements) when clicked or
//! given files. Every mutating call is journaled as an [`Interaction`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::browser::{
    BrowserError, BrowserResult, ElementTarget, Locator, PageDriver, PageSession,
    PageSessionFactory, StorageState,
};
use crate::clock::ManualClock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
    Goto(String),
    Click(String),
    ClickIntercepted(String),
    Fill(String, String),
    Type(String, String),
    Press(String),
    Upload(String, Vec<PathBuf>),
    ImportStorage,
}

#[derive(Debug, Clone)]
pub enum Effect {
    Navigate { url: String, after: Duration },
    Reveal { name: String, after: Duration },
    Conceal { name: String },
}

impl Effect {
    pub fn navigate(url: impl Into<String>, after: Duration) -> Self {
        Effect::Navigate {
            url: url.into(),
            after,
        }
    }

    pub fn reveal(name: impl Into<String>) -> Self {
        Effect::Reveal {
            name: name.into(),
            after: Duration::ZERO,
        }
    }

    pub fn reveal_after(name: impl Into<String>, after: Duration) -> Self {
        Effect::Reveal {
            name: name.into(),
            after,
        }
    }

    pub fn conceal(name: impl Into<String>) -> Self {
        Effect::Conceal { name: name.into() }
    }
}

#[derive(Debug, Clone)]
pub struct FakeElement {
    name: String,
    locators: Vec<Locator>,
    attributes: BTreeMap<String, String>,
    visible: bool,
    checked: bool,
    checkable: bool,
    /// Offset on the clock from which the element is attached, `None` while detached.
    present_from: Option<Duration>,
    on_url: Option<String>,
    intercepted_clicks: u32,
    on_click: Vec<Effect>,
    on_upload: Vec<Effect>,
}

impl FakeElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locators: Vec::new(),
            attributes: BTreeMap::new(),
            visible: true,
            checked: false,
            checkable: false,
            present_from: Some(Duration::ZERO),
            on_url: None,
            intercepted_clicks: 0,
            on_click: Vec::new(),
            on_upload: Vec::new(),
        }
    }

    pub fn matching(mut self, locator: Locator) -> Self {
        self.locators.push(locator);
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn checkable(mut self) -> Self {
        self.checkable = true;
        self
    }

    pub fn appears_after(mut self, after: Duration) -> Self {
        self.present_from = Some(after);
        self
    }

    /// Starts detached; attach it with [`Effect::reveal`].
    pub fn detached(mut self) -> Self {
        self.present_from = None;
        self
    }

    /// Only attached while the page location contains `fragment`.
    pub fn on_url(mut self, fragment: impl Into<String>) -> Self {
        self.on_url = Some(fragment.into());
        self
    }

    pub fn intercept_clicks(mut self, count: u32) -> Self {
        self.intercepted_clicks = count;
        self
    }

    pub fn on_click(mut self, effect: Effect) -> Self {
        self.on_click.push(effect);
        self
    }

    pub fn on_upload(mut self, effect: Effect) -> Self {
        self.on_upload.push(effect);
        self
    }
}

#[derive(Debug, Default)]
struct PageState {
    url: String,
    pending_navigation: Option<(Duration, String)>,
    elements: Vec<FakeElement>,
    journal: Vec<Interaction>,
    redirects: Vec<(String, String)>,
    storage: StorageState,
    probes: usize,
    fail_screenshots: bool,
}

#[derive(Debug, Clone)]
pub struct ScriptedPage {
    clock: ManualClock,
    state: Arc<Mutex<PageState>>,
}

impl ScriptedPage {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(PageState {
                url: "about:blank".to_string(),
                ..PageState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PageState> {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        let now = self.clock.elapsed();
        let due = matches!(&state.pending_navigation, Some((at, _)) if *at <= now);
        if due {
            if let Some((_, url)) = state.pending_navigation.take() {
                state.url = url;
            }
        }
        state
    }

    pub fn add(&self, element: FakeElement) {
        self.lock().elements.push(element);
    }

    pub fn set_url(&self, url: impl Into<String>) {
        self.lock().url = url.into();
    }

    pub fn navigate_after(&self, url: impl Into<String>, after: Duration) {
        let at = self.clock.elapsed() + after;
        self.lock().pending_navigation = Some((at, url.into()));
    }

    /// Any `goto` whose URL contains `fragment` lands on `target` instead.
    pub fn redirect(&self, fragment: impl Into<String>, target: impl Into<String>) {
        self.lock().redirects.push((fragment.into(), target.into()));
    }

    pub fn storage(&self) -> StorageState {
        self.lock().storage.clone()
    }

    pub fn fail_screenshots(&self) {
        self.lock().fail_screenshots = true;
    }

    pub fn journal(&self) -> Vec<Interaction> {
        self.lock().journal.clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter_map(|entry| match entry {
                Interaction::Click(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn was_clicked(&self, name: &str) -> bool {
        self.clicks().iter().any(|clicked| clicked == name)
    }

    pub fn count_probes(&self) -> usize {
        self.lock().probes
    }

    fn attached(state: &PageState, element: &FakeElement, now: Duration) -> bool {
        let present = element.present_from.map(|from| from <= now).unwrap_or(false);
        let on_url = element
            .on_url
            .as_ref()
            .map(|fragment| state.url.contains(fragment.as_str()))
            .unwrap_or(true);
        present && on_url
    }

    fn find_index(&self, state: &PageState, target: &ElementTarget) -> BrowserResult<usize> {
        let now = self.clock.elapsed();
        state
            .elements
            .iter()
            .enumerate()
            .filter(|(_, element)| Self::attached(state, element, now))
            .filter(|(_, element)| element.locators.contains(&target.locator))
            .nth(target.index)
            .map(|(index, _)| index)
            .ok_or_else(|| BrowserError::Detached {
                target: target.to_string(),
            })
    }

    fn apply(&self, state: &mut PageState, effects: &[Effect]) {
        let now = self.clock.elapsed();
        for effect in effects {
            match effect {
                Effect::Navigate { url, after } => {
                    if after.is_zero() {
                        state.url = url.clone();
                        state.pending_navigation = None;
                    } else {
                        state.pending_navigation = Some((now + *after, url.clone()));
                    }
                }
                Effect::Reveal { name, after } => {
                    for element in state.elements.iter_mut().filter(|e| &e.name == name) {
                        element.present_from = Some(now + *after);
                        element.visible = true;
                    }
                }
                Effect::Conceal { name } => {
                    for element in state.elements.iter_mut().filter(|e| &e.name == name) {
                        element.visible = false;
                    }
                }
            }
        }
    }
}

#[async_trait(?Send)]
impl PageDriver for ScriptedPage {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        let mut state = self.lock();
        state.journal.push(Interaction::Goto(url.to_string()));
        let landing = state
            .redirects
            .iter()
            .find(|(fragment, _)| url.contains(fragment.as_str()))
            .map(|(_, target)| target.clone())
            .unwrap_or_else(|| url.to_string());
        state.url = landing;
        state.pending_navigation = None;
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self.lock().url.clone())
    }

    async fn count(&self, locator: &Locator) -> BrowserResult<usize> {
        let mut state = self.lock();
        state.probes += 1;
        let now = self.clock.elapsed();
        Ok(state
            .elements
            .iter()
            .filter(|element| Self::attached(&state, element, now))
            .filter(|element| element.locators.contains(locator))
            .count())
    }

    async fn attribute(&self, target: &ElementTarget, name: &str) -> BrowserResult<Option<String>> {
        let state = self.lock();
        let index = self.find_index(&state, target)?;
        Ok(state.elements[index].attributes.get(name).cloned())
    }

    async fn is_visible(&self, target: &ElementTarget) -> BrowserResult<bool> {
        let state = self.lock();
        let index = self.find_index(&state, target)?;
        Ok(state.elements[index].visible)
    }

    async fn is_checked(&self, target: &ElementTarget) -> BrowserResult<bool> {
        let state = self.lock();
        let index = self.find_index(&state, target)?;
        Ok(state.elements[index].checked)
    }

    async fn click(&self, target: &ElementTarget) -> BrowserResult<()> {
        let mut state = self.lock();
        let index = self.find_index(&state, target)?;
        let element = &mut state.elements[index];
        let name = element.name.clone();
        if element.intercepted_clicks > 0 {
            element.intercepted_clicks -= 1;
            state.journal.push(Interaction::ClickIntercepted(name));
            return Err(BrowserError::Intercepted {
                target: target.to_string(),
            });
        }
        if element.checkable {
            element.checked = !element.checked;
        }
        let effects = element.on_click.clone();
        state.journal.push(Interaction::Click(name));
        self.apply(&mut state, &effects);
        Ok(())
    }

    async fn fill(&self, target: &ElementTarget, text: &str) -> BrowserResult<()> {
        let mut state = self.lock();
        let index = self.find_index(&state, target)?;
        let element = &mut state.elements[index];
        element.attributes.insert("value".into(), text.to_string());
        let name = element.name.clone();
        state.journal.push(Interaction::Fill(name, text.to_string()));
        Ok(())
    }

    async fn type_text(&self, target: &ElementTarget, text: &str) -> BrowserResult<()> {
        let mut state = self.lock();
        let index = self.find_index(&state, target)?;
        let element = &mut state.elements[index];
        let typed = element.attributes.get("value").cloned().unwrap_or_default() + text;
        element.attributes.insert("value".into(), typed);
        let name = element.name.clone();
        state.journal.push(Interaction::Type(name, text.to_string()));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> BrowserResult<()> {
        self.lock().journal.push(Interaction::Press(key.to_string()));
        Ok(())
    }

    async fn set_input_files(&self, target: &ElementTarget, files: &[PathBuf]) -> BrowserResult<()> {
        let mut state = self.lock();
        let index = self.find_index(&state, target)?;
        let element = &state.elements[index];
        if files.len() > 1 && !element.attributes.contains_key("multiple") {
            return Err(BrowserError::Unexpected(format!(
                "{target} accepts a single file, got {}",
                files.len()
            )));
        }
        let name = element.name.clone();
        let effects = element.on_upload.clone();
        state.journal.push(Interaction::Upload(name, files.to_vec()));
        self.apply(&mut state, &effects);
        Ok(())
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        if self.lock().fail_screenshots {
            return Err(BrowserError::Unexpected("screenshot capture failed".into()));
        }
        Ok(b"\x89PNG\r\n\x1a\nscripted".to_vec())
    }

    async fn content(&self) -> BrowserResult<String> {
        let state = self.lock();
        let now = self.clock.elapsed();
        let names = state
            .elements
            .iter()
            .filter(|element| Self::attached(&state, element, now))
            .map(|element| format!("<div data-name=\"{}\"></div>", element.name))
            .collect::<Vec<_>>()
            .join("");
        Ok(format!("<html><body data-url=\"{}\">{names}</body></html>", state.url))
    }

    async fn export_storage(&self) -> BrowserResult<StorageState> {
        Ok(self.lock().storage.clone())
    }

    async fn import_storage(&self, storage: &StorageState) -> BrowserResult<()> {
        let mut state = self.lock();
        state.storage = storage.clone();
        state.journal.push(Interaction::ImportStorage);
        Ok(())
    }
}

pub struct ScriptedSession {
    page: ScriptedPage,
    closed: Arc<AtomicUsize>,
}

#[async_trait(?Send)]
impl PageSession for ScriptedSession {
    fn driver(&self) -> &dyn PageDriver {
        &self.page
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out the same scripted page for every open and counts launches.
#[derive(Debug, Clone)]
pub struct ScriptedSessionFactory {
    page: ScriptedPage,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedSessionFactory {
    pub fn new(page: ScriptedPage) -> Self {
        Self {
            page,
            opened: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait(?Send)]
impl PageSessionFactory for ScriptedSessionFactory {
    async fn open(&self, _label: &str) -> BrowserResult<Box<dyn PageSession>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            page: self.page.clone(),
            closed: Arc::clone(&self.closed),
        }))
    }
}
