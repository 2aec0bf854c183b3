//! Report listing, reassignment and deletion.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::Uri,
};
use reportbox_storage::{RecordStore, ReportQuery, ReportWithOwner};
use tracing::{info, warn};

use crate::auth::CurrentSession;
use crate::error::{AppError, AppResult};
use crate::gate::{Action, Denial, authorize};
use crate::state::AppState;

use super::parse_json;
use super::types::{
    AssignReportRequest, BulkAssignRequest, DeleteReportRequest, DeletedResponse,
    ListReportsQuery, UpdatedResponse,
};

/// `GET /reports` - every report with its owner, newest first.
pub async fn list_reports(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    uri: Uri,
) -> AppResult<Json<Vec<ReportWithOwner>>> {
    authorize(session.session(), &Action::ListAllReports)?;
    let Query(params) = Query::<ListReportsQuery>::try_from_uri(&uri)
        .map_err(|e| AppError::BadRequest(e.body_text()))?;

    let mut query = ReportQuery::new();
    if params.unassigned {
        query = query.unassigned();
    } else if let Some(task_id) = params.task_id.filter(|id| !id.is_empty()) {
        query = query.in_task(task_id);
    }
    if let Some(q) = params.q.filter(|q| !q.trim().is_empty()) {
        query = query.search(q.trim());
    }

    Ok(Json(state.store.query_reports(&query).await?))
}

/// Fail with 400 unless `task_id` names an existing task.
async fn require_task(store: &dyn RecordStore, task_id: Option<&str>) -> AppResult<()> {
    if let Some(task_id) = task_id
        && store.get_task(task_id).await?.is_none()
    {
        return Err(AppError::BadRequest(format!("task does not exist: {task_id}")));
    }
    Ok(())
}

/// `POST /reports/assign` - move one report to a task or detach it.
pub async fn assign_report(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    body: Bytes,
) -> AppResult<Json<UpdatedResponse>> {
    authorize(session.session(), &Action::AssignReports)?;
    let request: AssignReportRequest = parse_json(&body)?;

    if state.store.get_report(&request.report_id).await?.is_none() {
        return Err(AppError::NotFound(format!("report {}", request.report_id)));
    }
    let task_id = request.task_id.as_deref();
    require_task(state.store.as_ref(), task_id).await?;

    let updated = state
        .store
        .assign_reports(std::slice::from_ref(&request.report_id), task_id)
        .await?;
    Ok(Json(UpdatedResponse { updated }))
}

/// `POST /reports/bulk-assign` - move many reports; unknown ids are ignored.
pub async fn bulk_assign(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    body: Bytes,
) -> AppResult<Json<UpdatedResponse>> {
    authorize(session.session(), &Action::AssignReports)?;
    let request: BulkAssignRequest = parse_json(&body)?;

    if request.report_ids.is_empty() {
        return Err(AppError::BadRequest("reportIds must not be empty".to_string()));
    }
    let task_id = request.task_id.as_deref();
    require_task(state.store.as_ref(), task_id).await?;

    let updated = state.store.assign_reports(&request.report_ids, task_id).await?;
    info!(updated, task_id = ?task_id, "Reassigned reports");
    Ok(Json(UpdatedResponse { updated }))
}

/// `POST /reports/delete` - the owner or a teacher removes one report.
pub async fn delete_report(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    body: Bytes,
) -> AppResult<Json<DeletedResponse>> {
    // Ownership is only known after the lookup, so anonymous callers are
    // turned away first.
    let caller = session.session().ok_or(Denial::Unauthenticated)?;
    let request: DeleteReportRequest = parse_json(&body)?;

    let report = state
        .store
        .get_report(&request.report_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("report {}", request.report_id)))?;
    authorize(
        Some(caller),
        &Action::DeleteReport {
            owner_id: &report.user_id,
        },
    )?;

    if let Err(e) = state.blobs.remove(&report.file_url).await {
        warn!(report_id = %report.id, error = %e, "Could not remove report file");
    }
    let deleted = state
        .store
        .delete_reports(std::slice::from_ref(&report.id))
        .await?;

    Ok(Json(DeletedResponse { deleted }))
}
