use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::BrowserResult;

/// Structural way of finding controls on the page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Locator {
    Css { selector: String },
    /// Smallest element whose visible text matches.
    Text { text: String, exact: bool },
    /// Element with an ARIA role (explicit or implied by tag) and accessible name.
    Role {
        role: String,
        name: String,
        exact: bool,
    },
    /// CSS match narrowed to elements whose text contains `text`.
    CssWithText { selector: String, text: String },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css {
            selector: selector.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Locator::Text {
            text: text.into(),
            exact: false,
        }
    }

    pub fn exact_text(text: impl Into<String>) -> Self {
        Locator::Text {
            text: text.into(),
            exact: true,
        }
    }

    pub fn role(role: impl Into<String>, name: impl Into<String>) -> Self {
        Locator::Role {
            role: role.into(),
            name: name.into(),
            exact: true,
        }
    }

    pub fn css_with_text(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Locator::CssWithText {
            selector: selector.into(),
            text: text.into(),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css { selector } => write!(f, "css={selector}"),
            Locator::Text { text, exact: true } => write!(f, "text=\"{text}\""),
            Locator::Text { text, exact: false } => write!(f, "text={text}"),
            Locator::Role { role, name, .. } => write!(f, "role={role}[name=\"{name}\"]"),
            Locator::CssWithText { selector, text } => {
                write!(f, "css={selector}:has-text(\"{text}\")")
            }
        }
    }
}

/// One concrete match of a locator, addressed by document order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementTarget {
    pub locator: Locator,
    pub index: usize,
}

impl ElementTarget {
    pub fn new(locator: Locator, index: usize) -> Self {
        Self { locator, index }
    }

    pub fn first(locator: Locator) -> Self {
        Self::new(locator, 0)
    }
}

impl fmt::Display for ElementTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} >> nth={}", self.locator, self.index)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    pub cookies: Vec<StoredCookie>,
    #[serde(default)]
    pub origins: Vec<OriginStorage>,
}

impl StorageState {
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.origins.iter().all(|origin| origin.local_storage.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Seconds since the epoch, `-1` for session cookies.
    pub expires: f64,
    pub http_only: bool,
    pub secure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginStorage {
    pub origin: String,
    pub local_storage: Vec<StorageEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    pub value: String,
}

/// Everything the publishing engine needs from a live page.
///
/// Implemented by the chromium context and by scripted fakes in tests.
#[async_trait(?Send)]
pub trait PageDriver {
    async fn goto(&self, url: &str) -> BrowserResult<()>;
    async fn current_url(&self) -> BrowserResult<String>;
    async fn count(&self, locator: &Locator) -> BrowserResult<usize>;
    async fn attribute(&self, target: &ElementTarget, name: &str) -> BrowserResult<Option<String>>;
    async fn is_visible(&self, target: &ElementTarget) -> BrowserResult<bool>;
    async fn is_checked(&self, target: &ElementTarget) -> BrowserResult<bool>;
    async fn click(&self, target: &ElementTarget) -> BrowserResult<()>;
    /// Replaces the value of an input or textarea.
    async fn fill(&self, target: &ElementTarget, text: &str) -> BrowserResult<()>;
    /// Focuses the element and types as keyboard input; `\n` becomes Enter.
    async fn type_text(&self, target: &ElementTarget, text: &str) -> BrowserResult<()>;
    async fn press_key(&self, key: &str) -> BrowserResult<()>;
    async fn set_input_files(&self, target: &ElementTarget, files: &[PathBuf]) -> BrowserResult<()>;
    async fn screenshot(&self) -> BrowserResult<Vec<u8>>;
    async fn content(&self) -> BrowserResult<String>;
    async fn export_storage(&self) -> BrowserResult<StorageState>;
    async fn import_storage(&self, state: &StorageState) -> BrowserResult<()>;
}

/// A page plus the browser that owns it, closed once the run ends.
#[async_trait(?Send)]
pub trait PageSession {
    fn driver(&self) -> &dyn PageDriver;
    async fn close(self: Box<Self>) -> BrowserResult<()>;
}

#[async_trait(?Send)]
pub trait PageSessionFactory: Send + Sync {
    /// `label` names the scratch profile, typically `<platform>-<account>`.
    async fn open(&self, label: &str) -> BrowserResult<Box<dyn PageSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_display_is_readable() {
        assert_eq!(Locator::css("input[type='file']").to_string(), "css=input[type='file']");
        assert_eq!(Locator::role("button", "发布").to_string(), "role=button[name=\"发布\"]");
        assert_eq!(
            ElementTarget::new(Locator::exact_text("发布图文"), 2).to_string(),
            "text=\"发布图文\" >> nth=2"
        );
    }

    #[test]
    fn storage_state_uses_camel_case_fields() {
        let state = StorageState {
            cookies: vec![StoredCookie {
                name: "sessionid".into(),
                value: "abc".into(),
                domain: ".douyin.com".into(),
                path: "/".into(),
                expires: -1.0,
                http_only: true,
                secure: true,
            }],
            origins: vec![],
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["cookies"][0]["httpOnly"], true);
        let back: StorageState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
        assert!(!back.is_empty());
    }
}
