mod automation;
mod driver;
mod error;
mod metrics;
mod page;
mod profile;
mod resolver;

pub use automation::{BrowserAutomation, BrowserContext, BrowserLauncher, LaunchOverrides, ViewportSpec};
pub use driver::{
    ElementTarget, Locator, OriginStorage, PageDriver, PageSession, PageSessionFactory,
    StorageEntry, StorageState, StoredCookie,
};
pub use error::{BrowserError, BrowserResult};
pub use metrics::PublishMetrics;
pub use page::{ChromiumSession, ChromiumSessionFactory};
pub use profile::{BrowserProfile, ProfileManager};
pub use resolver::{
    ActionRetry, ControlHandle, ElementAction, ElementError, ElementResolver, Preference,
    SelectorCandidate,
};
