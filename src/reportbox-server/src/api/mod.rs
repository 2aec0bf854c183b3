//! REST API routes and handlers.
//!
//! Every gated handler asks the access gate before touching the store, so a
//! refused caller never causes a lookup. Registration and login are open.

mod accounts;
mod exports;
mod health;
mod reports;
mod tasks;
pub mod types;
mod upload;

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};
use serde::de::DeserializeOwned;

use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub use accounts::STUDENT_ID_LEN;
pub use exports::EXPORT_ID_HEADER;
pub use types::HealthResponse;
pub use upload::extension_allowed;

/// Create the API routes.
///
/// JSON endpoints accept bodies up to `max_body_size`; the upload endpoint
/// up to `max_upload_size`.
pub fn routes(config: &ServerConfig) -> Router<Arc<AppState>> {
    let uploads = Router::new()
        .route("/upload", post(upload::upload_report))
        .layer(DefaultBodyLimit::max(config.max_upload_size));

    Router::new()
        .route("/health", get(health::health_check))
        // Accounts
        .route("/auth/register", post(accounts::register))
        .route("/auth/login", post(accounts::login))
        .route("/auth/change-password", post(accounts::change_password))
        // Export and maintenance
        .route("/reports/export", post(exports::export_reports))
        .route("/reports/exports/{id}", get(exports::get_export))
        .route("/reports/purge", post(exports::purge_export))
        // Reports
        .route("/reports", get(reports::list_reports))
        .route("/reports/assign", post(reports::assign_report))
        .route("/reports/bulk-assign", post(reports::bulk_assign))
        .route("/reports/delete", post(reports::delete_report))
        // Tasks
        .route("/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/tasks/{id}", delete(tasks::delete_task))
        .route("/tasks/{id}/submissions", get(tasks::task_submissions))
        .layer(DefaultBodyLimit::max(config.max_body_size))
        .merge(uploads)
}

/// Decode a JSON body read as raw bytes.
fn parse_json<T: DeserializeOwned>(body: &Bytes) -> AppResult<T> {
    serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("invalid body: {e}")))
}
