//! Record store operations.
//!
//! [`RecordStore`] is the seam the server talks to. [`JsonRecordStore`] keeps
//! every table in memory and, when opened on disk, rewrites a single JSON
//! snapshot after each mutation.

use std::collections::{HashMap, HashSet};
use std::io::Write;

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::paths::StoragePaths;

use super::query::ReportQuery;
use super::types::{Report, ReportWithOwner, Task, TaskSummary, User};

/// Relational store for users, tasks and reports.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Point lookup of a user.
    async fn get_user(&self, id: &str) -> Result<Option<User>>;

    /// Lookup by login name.
    async fn find_user_by_student_id(&self, student_id: &str) -> Result<Option<User>>;

    /// Insert or replace a user. Fails with `Conflict` when another user
    /// already holds the student id.
    async fn insert_user(&self, user: User) -> Result<User>;

    async fn set_password_hash(&self, user_id: &str, hash: &str) -> Result<()>;

    /// Record a submission. Fails with `Conflict` when the owner already
    /// submitted to the report's task.
    async fn insert_report(&self, report: Report) -> Result<Report>;

    /// Batched lookup of reports with their owners resolved.
    ///
    /// Results follow the order in which ids first appear in `ids`. Unknown
    /// ids and repeated ids produce no extra entries.
    async fn find_reports(&self, ids: &[String]) -> Result<Vec<ReportWithOwner>>;

    /// Point lookup of a report.
    async fn get_report(&self, id: &str) -> Result<Option<Report>>;

    /// Filtered listing.
    async fn query_reports(&self, query: &ReportQuery) -> Result<Vec<ReportWithOwner>>;

    /// Attach reports to a task, or detach them with `None`. Returns the number updated.
    async fn assign_reports(&self, ids: &[String], task_id: Option<&str>) -> Result<usize>;

    /// Delete exactly the given reports. Returns the number removed.
    async fn delete_reports(&self, ids: &[String]) -> Result<usize>;

    /// All tasks, newest first, with submission counts.
    async fn list_tasks(&self) -> Result<Vec<TaskSummary>>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    async fn create_task(&self, task: Task) -> Result<Task>;

    /// Delete a task. Fails with `Conflict` while reports still reference it.
    async fn delete_task(&self, id: &str) -> Result<()>;
}

/// On-disk snapshot layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    reports: Vec<Report>,
}

impl Tables {
    fn join_owner(&self, report: &Report, users: &HashMap<&str, &User>) -> ReportWithOwner {
        match users.get(report.user_id.as_str()) {
            Some(user) => ReportWithOwner {
                report: report.clone(),
                owner_name: user.name.clone(),
                owner_student_id: user.student_id.clone(),
            },
            None => {
                warn!(report_id = %report.id, user_id = %report.user_id, "Report owner missing");
                ReportWithOwner {
                    report: report.clone(),
                    owner_name: report.user_id.clone(),
                    owner_student_id: String::new(),
                }
            }
        }
    }

    fn user_index(&self) -> HashMap<&str, &User> {
        self.users.iter().map(|u| (u.id.as_str(), u)).collect()
    }
}

/// JSON-snapshot record store.
#[derive(Debug)]
pub struct JsonRecordStore {
    paths: Option<StoragePaths>,
    tables: RwLock<Tables>,
}

impl JsonRecordStore {
    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            paths: None,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Open (or create) the snapshot under `paths`.
    pub async fn open(paths: StoragePaths) -> Result<Self> {
        paths.ensure_dirs().await?;

        let tables = match tokio::fs::read_to_string(&paths.records_file).await {
            Ok(content) => serde_json::from_str::<Tables>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            records_file = %paths.records_file.display(),
            users = tables.users.len(),
            tasks = tables.tasks.len(),
            reports = tables.reports.len(),
            "Record store opened"
        );

        Ok(Self {
            paths: Some(paths),
            tables: RwLock::new(tables),
        })
    }

    /// Storage paths, if the store is file-backed.
    pub fn paths(&self) -> Option<&StoragePaths> {
        self.paths.as_ref()
    }

    /// Every report id currently stored, oldest submission first.
    pub async fn all_report_ids(&self) -> Vec<String> {
        let tables = self.tables.read().await;
        let mut reports: Vec<&Report> = tables.reports.iter().collect();
        reports.sort_by_key(|r| r.submitted_at);
        reports.into_iter().map(|r| r.id.clone()).collect()
    }

    /// Apply `f` to a copy of the tables, persist it, then publish it.
    async fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut guard = self.tables.write().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;

        if let Some(paths) = &self.paths {
            persist(paths.clone(), serde_json::to_vec_pretty(&next)?).await?;
        }

        *guard = next;
        Ok(out)
    }
}

/// Atomically replace the snapshot file while holding the cross-process lock.
async fn persist(paths: StoragePaths, content: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let lock = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&paths.lock_file)?;
        lock.lock_exclusive()?;

        let tmp = paths.records_file.with_extension("json.tmp");
        let result = (|| -> Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&content)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &paths.records_file)?;
            Ok(())
        })();

        lock.unlock()?;
        result?;
        debug!(records_file = %paths.records_file.display(), "Records snapshot saved");
        Ok(())
    })
    .await
    .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_user_by_student_id(&self, student_id: &str) -> Result<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .iter()
            .find(|u| u.student_id == student_id)
            .cloned())
    }

    async fn set_password_hash(&self, user_id: &str, hash: &str) -> Result<()> {
        self.mutate(|tables| {
            let user = tables
                .users
                .iter_mut()
                .find(|u| u.id == user_id)
                .ok_or_else(|| StorageError::not_found("user", user_id))?;
            user.password_hash = Some(hash.to_string());
            Ok(())
        })
        .await
    }

    async fn insert_user(&self, user: User) -> Result<User> {
        self.mutate(|tables| {
            if tables
                .users
                .iter()
                .any(|u| u.student_id == user.student_id && u.id != user.id)
            {
                return Err(StorageError::Conflict(format!(
                    "student id already registered: {}",
                    user.student_id
                )));
            }
            tables.users.retain(|u| u.id != user.id);
            tables.users.push(user.clone());
            Ok(user)
        })
        .await
    }

    async fn insert_report(&self, report: Report) -> Result<Report> {
        self.mutate(|tables| {
            if !tables.users.iter().any(|u| u.id == report.user_id) {
                return Err(StorageError::not_found("user", report.user_id.clone()));
            }
            if let Some(task_id) = report.task_id.as_deref() {
                if !tables.tasks.iter().any(|t| t.id == task_id) {
                    return Err(StorageError::not_found("task", task_id));
                }
                if tables
                    .reports
                    .iter()
                    .any(|r| r.user_id == report.user_id && r.task_id.as_deref() == Some(task_id))
                {
                    return Err(StorageError::Conflict(format!(
                        "user {} already submitted to task {task_id}",
                        report.user_id
                    )));
                }
            }
            tables.reports.retain(|r| r.id != report.id);
            tables.reports.push(report.clone());
            Ok(report)
        })
        .await
    }


    async fn find_reports(&self, ids: &[String]) -> Result<Vec<ReportWithOwner>> {
        let tables = self.tables.read().await;
        let users = tables.user_index();
        let by_id: HashMap<&str, &Report> =
            tables.reports.iter().map(|r| (r.id.as_str(), r)).collect();

        let mut seen = HashSet::new();
        Ok(ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| by_id.get(id.as_str()))
            .map(|report| tables.join_owner(report, &users))
            .collect())
    }

    async fn get_report(&self, id: &str) -> Result<Option<Report>> {
        let tables = self.tables.read().await;
        Ok(tables.reports.iter().find(|r| r.id == id).cloned())
    }

    async fn query_reports(&self, query: &ReportQuery) -> Result<Vec<ReportWithOwner>> {
        let tables = self.tables.read().await;
        let users = tables.user_index();
        let mut reports: Vec<ReportWithOwner> = tables
            .reports
            .iter()
            .map(|r| tables.join_owner(r, &users))
            .filter(|r| query.matches(r))
            .collect();

        query.apply_sort(&mut reports);
        Ok(query.apply_pagination(reports))
    }

    async fn assign_reports(&self, ids: &[String], task_id: Option<&str>) -> Result<usize> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.mutate(|tables| {
            if let Some(task_id) = task_id {
                if !tables.tasks.iter().any(|t| t.id == task_id) {
                    return Err(StorageError::not_found("task", task_id));
                }
            }
            let mut updated = 0;
            for report in tables
                .reports
                .iter_mut()
                .filter(|r| wanted.contains(r.id.as_str()))
            {
                report.task_id = task_id.map(str::to_string);
                updated += 1;
            }
            Ok(updated)
        })
        .await
    }

    async fn delete_reports(&self, ids: &[String]) -> Result<usize> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let removed = self
            .mutate(|tables| {
                let before = tables.reports.len();
                tables.reports.retain(|r| !wanted.contains(r.id.as_str()));
                Ok(before - tables.reports.len())
            })
            .await?;
        info!(removed, "Deleted reports");
        Ok(removed)
    }

    async fn list_tasks(&self) -> Result<Vec<TaskSummary>> {
        let tables = self.tables.read().await;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for task_id in tables.reports.iter().filter_map(|r| r.task_id.as_deref()) {
            *counts.entry(task_id).or_insert(0) += 1;
        }

        let mut tasks: Vec<TaskSummary> = tables
            .tasks
            .iter()
            .map(|t| TaskSummary {
                task: t.clone(),
                report_count: counts.get(t.id.as_str()).copied().unwrap_or(0),
            })
            .collect();
        tasks.sort_by(|a, b| b.task.created_at.cmp(&a.task.created_at));
        Ok(tasks)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let tables = self.tables.read().await;
        Ok(tables.tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn create_task(&self, task: Task) -> Result<Task> {
        self.mutate(|tables| {
            if tables.tasks.iter().any(|t| t.id == task.id) {
                return Err(StorageError::Conflict(format!("task exists: {}", task.id)));
            }
            tables.tasks.push(task.clone());
            Ok(task)
        })
        .await
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        self.mutate(|tables| {
            if !tables.tasks.iter().any(|t| t.id == id) {
                return Err(StorageError::not_found("task", id));
            }
            if tables.reports.iter().any(|r| r.task_id.as_deref() == Some(id)) {
                return Err(StorageError::Conflict(
                    "task still has submissions".to_string(),
                ));
            }
            tables.tasks.retain(|t| t.id != id);
            Ok(())
        })
        .await
    }
}
