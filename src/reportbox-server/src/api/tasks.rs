//! Task management and per-task submissions.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use reportbox_storage::{NewTask, ReportQuery, ReportWithOwner, StorageError, Task, TaskSummary};
use tracing::info;

use crate::auth::CurrentSession;
use crate::error::{AppError, AppResult};
use crate::gate::{Action, Denial, Scope, authorize};
use crate::state::AppState;

use super::parse_json;

/// `GET /tasks` - tasks newest first, with submission counts.
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
) -> AppResult<Json<Vec<TaskSummary>>> {
    authorize(session.session(), &Action::ListTasks)?;
    Ok(Json(state.store.list_tasks().await?))
}

/// `POST /tasks`
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    body: Bytes,
) -> AppResult<(StatusCode, Json<Task>)> {
    authorize(session.session(), &Action::ManageTasks)?;
    let caller = session.session().ok_or(Denial::Unauthenticated)?;
    let mut new: NewTask = parse_json(&body)?;

    new.title = new.title.trim().to_string();
    if new.title.is_empty() {
        return Err(AppError::BadRequest("title is required".to_string()));
    }

    let task = state
        .store
        .create_task(Task::from_new(new, &caller.user_id))
        .await?;
    info!(task_id = %task.id, title = %task.title, "Task created");
    Ok((StatusCode::CREATED, Json(task)))
}

/// `DELETE /tasks/{id}` - refused while submissions still point at the task.
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    Path(task_id): Path<String>,
) -> AppResult<StatusCode> {
    authorize(session.session(), &Action::ManageTasks)?;

    match state.store.delete_task(&task_id).await {
        Ok(()) => {
            info!(task_id = %task_id, "Task deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(StorageError::Conflict(reason)) => Err(AppError::BadRequest(reason)),
        Err(e) => Err(e.into()),
    }
}

/// `GET /tasks/{id}/submissions` - students only see their own.
pub async fn task_submissions(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    Path(task_id): Path<String>,
) -> AppResult<Json<Vec<ReportWithOwner>>> {
    let scope = authorize(session.session(), &Action::ListTaskSubmissions)?;

    if state.store.get_task(&task_id).await?.is_none() {
        return Err(AppError::NotFound(format!("task {task_id}")));
    }

    let query = match scope {
        Scope::All => ReportQuery::new().in_task(task_id),
        Scope::Own(user_id) => ReportQuery::new().in_task(task_id).owned_by(user_id),
    };
    Ok(Json(state.store.query_reports(&query).await?))
}
