//! Package Retrieval and Verification
//!
//! Components:
//! - `download` - segmented / resumable HTTP transfers
//! - `resume` - persisted segment ledger
//! - `verify` - content hash and publisher signature gate
//! - `state` - installation state machine and progress events

pub mod download;
pub mod resume;
pub mod state;
pub mod verify;

pub use download::{plan_dir, Downloader, RangeSupport};
pub use resume::SegmentLedger;
pub use state::{InstallState, InstallTransaction, Progress, ProgressEvent, Stage};
pub use verify::{calculate_sha256, ApprovedPackage, RejectReason, Verdict, VerificationGate};
