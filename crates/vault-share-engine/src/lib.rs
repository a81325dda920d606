//! Job-state-machine engines composing `vault-share-core`'s codec,
//! transport, and remote client into the upload/sync/import flows of the
//! system spec: upload (C5), sync (C6), import (C7), plus the shared
//! job-table and platform-hook plumbing they all build on.

pub mod import;
pub mod jobs;
pub mod platform;
pub mod sync;
pub mod upload;

pub use import::{ImportEngine, ImportError};
pub use jobs::{scan_pending_directory, CancelFlag, Cancelled, DebouncedWriter};
pub use platform::{BackgroundExecution, BackgroundToken, DeferredTaskScheduler, NoopPlatform};
pub use sync::{SyncEngine, SyncError};
pub use upload::{UploadEngine, UploadError};
