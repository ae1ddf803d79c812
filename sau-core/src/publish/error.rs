use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::browser::{BrowserError, ElementError};
use crate::content::ContentError;

use super::phase::Phase;
use super::session::SessionStoreError;

/// Optional diagnostic bundle path, rendered as a message suffix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticRef(pub Option<PathBuf>);

impl DiagnosticRef {
    pub fn none() -> Self {
        DiagnosticRef(None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.0.as_deref()
    }
}

impl fmt::Display for DiagnosticRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(path) => write!(f, " [diagnostics: {}]", path.display()),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Validation,
    SessionInvalid,
    ElementNotFound,
    ElementActionFailed,
    ContentRejected,
    PublishTimeout,
    Browser,
    Storage,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Validation => "validation",
            FailureCategory::SessionInvalid => "session_invalid",
            FailureCategory::ElementNotFound => "element_not_found",
            FailureCategory::ElementActionFailed => "element_action_failed",
            FailureCategory::ContentRejected => "content_rejected",
            FailureCategory::PublishTimeout => "publish_timeout",
            FailureCategory::Browser => "browser",
            FailureCategory::Storage => "storage",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("content validation failed: {0}")]
    Validation(#[from] ContentError),
    #[error("session for {platform}/{account} is invalid: {reason}{diagnostics}")]
    SessionInvalid {
        platform: String,
        account: String,
        reason: String,
        diagnostics: DiagnosticRef,
    },
    #[error("element not found during {phase}: {detail}{diagnostics}")]
    ElementNotFound {
        phase: Phase,
        detail: String,
        diagnostics: DiagnosticRef,
    },
    #[error("element action failed during {phase}: {source}{diagnostics}")]
    ElementActionFailed {
        phase: Phase,
        #[source]
        source: ElementError,
        diagnostics: DiagnosticRef,
    },
    #[error("content rejected during {phase}: {reason}{diagnostics}")]
    ContentRejected {
        phase: Phase,
        reason: String,
        diagnostics: DiagnosticRef,
    },
    #[error("publish not confirmed within {waited:?} after {attempts} attempt(s): {detail}{diagnostics}")]
    PublishTimeout {
        waited: Duration,
        attempts: u32,
        detail: String,
        diagnostics: DiagnosticRef,
    },
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Storage(#[from] SessionStoreError),
}

impl PublishError {
    pub fn category(&self) -> FailureCategory {
        match self {
            PublishError::Validation(_) => FailureCategory::Validation,
            PublishError::SessionInvalid { .. } => FailureCategory::SessionInvalid,
            PublishError::ElementNotFound { .. } => FailureCategory::ElementNotFound,
            PublishError::ElementActionFailed { .. } => FailureCategory::ElementActionFailed,
            PublishError::ContentRejected { .. } => FailureCategory::ContentRejected,
            PublishError::PublishTimeout { .. } => FailureCategory::PublishTimeout,
            PublishError::Browser(_) => FailureCategory::Browser,
            PublishError::Storage(_) => FailureCategory::Storage,
        }
    }

    pub fn diagnostics(&self) -> Option<&Path> {
        match self {
            PublishError::SessionInvalid { diagnostics, .. }
            | PublishError::ElementNotFound { diagnostics, .. }
            | PublishError::ElementActionFailed { diagnostics, .. }
            | PublishError::ContentRejected { diagnostics, .. }
            | PublishError::PublishTimeout { diagnostics, .. } => diagnostics.path(),
            _ => None,
        }
    }

    /// Attaches a diagnostic bundle to errors that carry one.
    pub fn with_diagnostics(mut self, bundle: Option<PathBuf>) -> Self {
        match &mut self {
            PublishError::SessionInvalid { diagnostics, .. }
            | PublishError::ElementNotFound { diagnostics, .. }
            | PublishError::ElementActionFailed { diagnostics, .. }
            | PublishError::ContentRejected { diagnostics, .. }
            | PublishError::PublishTimeout { diagnostics, .. } => {
                *diagnostics = DiagnosticRef(bundle);
            }
            _ => {}
        }
        self
    }

    /// Short tag used in diagnostic directory names.
    pub fn reason_tag(&self) -> String {
        match self {
            PublishError::ElementNotFound { phase, .. }
            | PublishError::ElementActionFailed { phase, .. }
            | PublishError::ContentRejected { phase, .. } => {
                format!("{}_{}", self.category(), phase)
            }
            _ => self.category().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_embeds_diagnostic_path() {
        let err = PublishError::ContentRejected {
            phase: Phase::MediaInjection,
            reason: "不支持该格式".into(),
            diagnostics: DiagnosticRef::none(),
        };
        assert_eq!(
            err.to_string(),
            "content rejected during media_injection: 不支持该格式"
        );
        let err = err.with_diagnostics(Some(PathBuf::from("logs/diag/20260101_rejected")));
        assert!(err.to_string().ends_with("[diagnostics: logs/diag/20260101_rejected]"));
        assert_eq!(err.diagnostics(), Some(Path::new("logs/diag/20260101_rejected")));
        assert_eq!(err.category(), FailureCategory::ContentRejected);
        assert_eq!(err.reason_tag(), "content_rejected_media_injection");
    }

    #[test]
    fn validation_errors_never_carry_diagnostics() {
        let err = PublishError::from(ContentError::NoMedia)
            .with_diagnostics(Some(PathBuf::from("ignored")));
        assert!(err.diagnostics().is_none());
        assert_eq!(err.category(), FailureCategory::Validation);
    }
}
