//! Archive export and purge endpoints.

use std::sync::Arc;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{StatusCode, header},
    response::Response,
};

use crate::auth::CurrentSession;
use crate::error::{AppError, AppResult};
use crate::export::{ExportOutcome, PurgeSummary, parse_report_ids};
use crate::gate::{Action, authorize};
use crate::state::AppState;

use super::parse_json;
use super::types::PurgeRequest;

/// Response header naming the export, for later inspection or purge.
pub const EXPORT_ID_HEADER: &str = "X-Export-Id";

/// `POST /reports/export` - stream a ZIP of the requested reports.
pub async fn export_reports(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    body: Bytes,
) -> AppResult<Response> {
    authorize(session.session(), &Action::ExportReports)?;
    let report_ids = parse_report_ids(&body)?;

    let archive = state.exports.export_archive(report_ids).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", archive.file_name),
        )
        .header(EXPORT_ID_HEADER, archive.export_id.as_str())
        .body(Body::from_stream(archive.body))
        .map_err(|e| AppError::Internal(format!("Failed to build archive response: {e}")))
}

/// `GET /reports/exports/{id}` - how an export ended.
pub async fn get_export(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    Path(export_id): Path<String>,
) -> AppResult<Json<ExportOutcome>> {
    authorize(session.session(), &Action::ViewExport)?;
    Ok(Json(state.exports.outcome(&export_id).await?))
}

/// `POST /reports/purge` - delete the rows of a complete export.
pub async fn purge_export(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    body: Bytes,
) -> AppResult<Json<PurgeSummary>> {
    authorize(session.session(), &Action::PurgeReports)?;
    let request: PurgeRequest = parse_json(&body)?;

    Ok(Json(state.exports.purge(&request.export_id).await?))
}
