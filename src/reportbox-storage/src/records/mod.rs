//! Record storage - users, tasks and submitted reports.
//!
//! - [`types`] - Core data structures (User, Task, Report, ...)
//! - [`query`] - Filtering and sorting for report listings
//! - [`store`] - The `RecordStore` trait and its JSON-snapshot implementation

mod query;
mod store;
mod types;

pub use query::{ReportQuery, ReportSort, TaskFilter};
pub use store::{JsonRecordStore, RecordStore};
pub use types::{NewTask, Report, ReportWithOwner, Role, Task, TaskSummary, User};
