//! Report submission by multipart upload.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartError},
    http::StatusCode,
};
use futures::TryStreamExt;
use reportbox_storage::{Report, StorageError, sanitize_file_name};
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use crate::auth::CurrentSession;
use crate::error::{AppError, AppResult};
use crate::gate::{Action, Denial, Session, authorize};
use crate::state::AppState;

/// A file already written to the blob store.
#[derive(Debug)]
struct StoredFile {
    name: String,
    location: String,
}

#[derive(Debug, Default)]
struct UploadForm {
    task_id: Option<String>,
    file: Option<StoredFile>,
}

/// Whether `file_name` carries one of the task's accepted extensions.
///
/// An empty list accepts anything. Entries may be written with or without
/// the leading dot.
pub fn extension_allowed(allowed: &[String], file_name: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some((_, ext)) = file_name.rsplit_once('.') else {
        return false;
    };
    allowed
        .iter()
        .any(|a| a.trim().trim_start_matches('.').eq_ignore_ascii_case(ext))
}

fn multipart_error(error: MultipartError) -> AppError {
    rejected_body(&error)
}

fn rejected_body(error: &MultipartError) -> AppError {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge
    } else {
        AppError::BadRequest(error.body_text())
    }
}

/// Body read failures surface as IO errors from the blob store; recover the
/// multipart cause so an oversized upload still answers 413.
fn store_error(error: StorageError) -> AppError {
    if let StorageError::Io(io) = &error
        && let Some(cause) = io.get_ref().and_then(|e| e.downcast_ref::<MultipartError>())
    {
        return rejected_body(cause);
    }
    error.into()
}

async fn read_form(
    state: &AppState,
    multipart: &mut Multipart,
    form: &mut UploadForm,
) -> AppResult<()> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let field_name = field.name().map(str::to_owned);
        match field_name.as_deref() {
            Some("taskId") => {
                form.task_id = Some(field.text().await.map_err(multipart_error)?);
            }
            Some("file") => {
                if form.file.is_some() {
                    return Err(AppError::BadRequest(
                        "only one file per upload".to_string(),
                    ));
                }
                let name = sanitize_file_name(field.file_name().unwrap_or_default());
                let mut reader = StreamReader::new(Box::pin(field.map_err(std::io::Error::other)));
                let location = state
                    .blobs
                    .put(&name, &mut reader)
                    .await
                    .map_err(store_error)?;
                form.file = Some(StoredFile { name, location });
            }
            _ => {}
        }
    }
    Ok(())
}

async fn submit(state: &AppState, caller: &Session, form: &UploadForm) -> AppResult<Report> {
    let file = form
        .file
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("file is required".to_string()))?;
    let task_id = form
        .task_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("taskId is required".to_string()))?;

    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or_else(|| AppError::BadRequest(format!("task {task_id} does not exist")))?;
    if !extension_allowed(&task.allowed_extensions, &file.name) {
        return Err(AppError::BadRequest(format!(
            "file type not accepted for this task, expected one of: {}",
            task.allowed_extensions.join(", ")
        )));
    }

    let report = Report::new(&caller.user_id, &file.name, &file.location).with_task(task_id);
    match state.store.insert_report(report).await {
        Ok(report) => Ok(report),
        Err(StorageError::Conflict(reason)) => Err(AppError::BadRequest(reason)),
        Err(e @ StorageError::NotFound { .. }) => Err(AppError::BadRequest(e.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// `POST /upload` - multipart form with `taskId` and `file`.
///
/// One submission per student and task. The stored file is removed again
/// when the submission is refused.
pub async fn upload_report(
    State(state): State<Arc<AppState>>,
    session: CurrentSession,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<Report>)> {
    authorize(session.session(), &Action::SubmitReport)?;
    let caller = session.session().ok_or(Denial::Unauthenticated)?;

    let mut form = UploadForm::default();
    let result = match read_form(&state, &mut multipart, &mut form).await {
        Ok(()) => submit(&state, caller, &form).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(report) => {
            info!(
                report_id = %report.id,
                user_id = %report.user_id,
                file = %report.file_name,
                "Report submitted"
            );
            Ok((StatusCode::CREATED, Json(report)))
        }
        Err(e) => {
            if let Some(file) = &form.file
                && let Err(cleanup) = state.blobs.remove(&file.location).await
            {
                warn!(location = %file.location, error = %cleanup, "Failed to remove refused upload");
            }
            Err(e)
        }
    }
}
