//! reportbox storage - the record and blob collaborators.
//!
//! # Features
//!
//! - Users, tasks and reports kept in a single JSON snapshot
//! - Batched report lookup with owners resolved in one pass
//! - Report files read from a local uploads directory or over HTTP
//!
//! # Usage
//!
//! ```rust,no_run
//! use reportbox_storage::{JsonRecordStore, RecordStore, StoragePaths};
//!
//! #[tokio::main]
//! async fn main() -> reportbox_storage::Result<()> {
//!     let store = JsonRecordStore::open(StoragePaths::new()?).await?;
//!     let found = store.find_reports(&["r1".to_string()]).await?;
//!     println!("Resolved {} reports", found.len());
//!     Ok(())
//! }
//! ```

pub mod blobs;
pub mod error;
pub mod paths;
pub mod records;

pub use blobs::{
    BlobReader, BlobResolver, BlobStore, HttpBlobStore, LocalBlobStore, sanitize_file_name,
};
pub use error::{Result, StorageError};
pub use paths::{StoragePaths, reportbox_data_dir};
pub use records::{
    JsonRecordStore, NewTask, RecordStore, Report, ReportQuery, ReportSort, ReportWithOwner,
    Role, Task, TaskFilter, TaskSummary, User,
};
