pub mod browser;
pub mod clock;
pub mod config;
pub mod content;
pub mod error;
pub mod platforms;
pub mod publish;
pub mod testing;

pub use browser::{
    ActionRetry, BrowserError, BrowserLauncher, ChromiumSessionFactory, ControlHandle,
    ElementAction, ElementError, ElementResolver, Locator, PageDriver, PageSessionFactory,
    Preference, ProfileManager, PublishMetrics, SelectorCandidate, StorageState,
};
pub use clock::{tokio_clock, Clock, ManualClock, SharedClock, TokioClock};
pub use config::{load_publisher_config, PublisherConfig, TimingSection};
pub use content::{
    compose_note_text, parse_tags, ContentError, ContentItem, ContentType, MediaPolicy,
    PublishTime, MAX_IMAGES, SCHEDULE_FORMAT,
};
pub use error::{ConfigError, Result};
pub use platforms::{Platform, PlatformOptions};
pub use publish::{
    DiagnosticBundle, DiagnosticCapture, FailureCategory, Phase, PhaseRecord, PhaseResult,
    PlatformAdapter, PublishError, PublishReport, Publisher, RunLedger, RunRecord,
    SessionStatus, SessionStore, SessionValidator, UploadStateMachine,
};
