//! Report query and filtering.
//!
//! - `ReportSort` - Sort order options
//! - `ReportQuery` - Query/filter builder used by report listings

use serde::Deserialize;

use super::types::ReportWithOwner;

/// Sort order for report queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportSort {
    /// Newest submission first (default).
    #[default]
    SubmittedDesc,
    /// Oldest submission first.
    SubmittedAsc,
    /// Owner display name, then file name.
    OwnerAsc,
}

/// Which task a listing is restricted to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TaskFilter {
    /// Any task, including unassigned reports.
    #[default]
    Any,
    /// Only reports attached to this task.
    Task(String),
    /// Only reports with no task.
    Unassigned,
}

/// Query/filter for reports.
#[derive(Debug, Clone, Default)]
pub struct ReportQuery {
    /// Task restriction.
    pub task: TaskFilter,
    /// Only reports owned by this user.
    pub owner_id: Option<String>,
    /// Case-insensitive search in title, file name, owner name or student id.
    pub search: Option<String>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Offset for pagination.
    pub offset: usize,
    /// Sort order.
    pub sort: ReportSort,
}

impl ReportQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one task.
    pub fn in_task(mut self, task_id: impl Into<String>) -> Self {
        self.task = TaskFilter::Task(task_id.into());
        self
    }

    /// Restrict to reports not attached to any task.
    pub fn unassigned(mut self) -> Self {
        self.task = TaskFilter::Unassigned;
        self
    }

    /// Restrict to one owner.
    pub fn owned_by(mut self, user_id: impl Into<String>) -> Self {
        self.owner_id = Some(user_id.into());
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.offset = n;
        self
    }

    pub fn sort_by(mut self, sort: ReportSort) -> Self {
        self.sort = sort;
        self
    }

    /// Check if a report matches this query.
    pub fn matches(&self, entry: &ReportWithOwner) -> bool {
        let report = &entry.report;

        match &self.task {
            TaskFilter::Any => {}
            TaskFilter::Task(id) => {
                if report.task_id.as_deref() != Some(id.as_str()) {
                    return false;
                }
            }
            TaskFilter::Unassigned => {
                if report.task_id.is_some() {
                    return false;
                }
            }
        }

        if let Some(ref owner) = self.owner_id {
            if &report.user_id != owner {
                return false;
            }
        }

        if let Some(ref search) = self.search {
            let needle = search.to_lowercase();
            let hit = [
                report.title.as_str(),
                report.file_name.as_str(),
                entry.owner_name.as_str(),
                entry.owner_student_id.as_str(),
            ]
            .iter()
            .any(|field| field.to_lowercase().contains(&needle));

            if !hit {
                return false;
            }
        }

        true
    }

    /// Apply sorting to a list of reports.
    pub fn apply_sort(&self, reports: &mut [ReportWithOwner]) {
        match self.sort {
            ReportSort::SubmittedDesc => {
                reports.sort_by(|a, b| b.report.submitted_at.cmp(&a.report.submitted_at))
            }
            ReportSort::SubmittedAsc => {
                reports.sort_by(|a, b| a.report.submitted_at.cmp(&b.report.submitted_at))
            }
            ReportSort::OwnerAsc => reports.sort_by(|a, b| {
                a.owner_name
                    .cmp(&b.owner_name)
                    .then_with(|| a.report.file_name.cmp(&b.report.file_name))
            }),
        }
    }

    /// Apply offset and limit to a list of reports.
    pub fn apply_pagination(&self, reports: Vec<ReportWithOwner>) -> Vec<ReportWithOwner> {
        reports
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}
