//! Provisioning core: creates a mini-program application across the
//! database, a generated source tree, and its resource assets as one saga.
//!
//! ```text
//! Orchestrator::run(task_id, request)
//!     |
//!     +-- TargetLocks::try_acquire(user_id/app_name)   (reject if held)
//!     |
//!     +-- DatabasePhase      --registers--> DeleteAppRecords
//!     +-- LocalFilePhase     --registers--> RemoveDirectory
//!     +-- ResourceFilePhase  --registers--> RemoveResourceFiles
//!     |
//!     +-- success: discard CompensationStack, COMMITTED
//!     +-- failure: unwind CompensationStack (LIFO), ROLLED_BACK | FAILED
//!
//! every step --> TaskLog --> TaskLogSink (persist) --> ProgressBroadcaster
//! ```

pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod phases;
pub mod progress;
pub mod request;
pub mod saga;
pub mod state;

pub use error::{CompensationFailure, CreationError, PhaseError};
pub use orchestrator::{CreatedApp, Orchestrator, PhaseLimits, Pipeline};
pub use request::CreateNovelAppRequest;
