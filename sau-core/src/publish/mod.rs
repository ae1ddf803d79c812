//! Platform-agnostic publishing workflow.

pub mod adapter;
pub mod diagnostics;
pub mod error;
pub mod ledger;
pub mod machine;
pub mod phase;
pub mod publisher;
pub mod session;

pub use adapter::{PhaseContext, PhaseOutcome, PlatformAdapter, RejectionSignal};
pub use diagnostics::{bundle_dir_name, DiagnosticBundle, DiagnosticCapture};
pub use error::{DiagnosticRef, FailureCategory, PublishError};
pub use ledger::{LedgerError, RunLedger, RunRecord};
pub use machine::UploadStateMachine;
pub use phase::{format_trace, Phase, PhaseRecord, PhaseResult, PhaseStatus};
pub use publisher::{PublishReport, Publisher};
pub use session::{SessionProbe, SessionStatus, SessionStore, SessionStoreError, SessionValidator};
