//! Record data types.
//!
//! - `User` - account with a role tag
//! - `Task` - teacher-defined assignment reports are submitted against
//! - `Report` - one submitted file
//! - `ReportWithOwner` - report joined with its owner's display fields
//! - `TaskSummary` - task with its submission count

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role tag carried by every user and session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Teacher => "TEACHER",
            Self::Student => "STUDENT",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TEACHER" => Ok(Self::Teacher),
            "STUDENT" => Ok(Self::Student),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    /// Student or staff number used to log in.
    pub student_id: String,
    /// Display name, also used to name exported archive entries.
    pub name: String,
    pub role: Role,
    /// PHC-format password hash. Accounts without one cannot log in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Creation timestamp (Unix seconds).
    pub created_at: i64,
}

impl User {
    pub fn new(student_id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            student_id: student_id.into(),
            name: name.into(),
            role,
            password_hash: None,
            created_at: Utc::now().timestamp(),
        }
    }

    /// Override the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_password_hash(mut self, hash: impl Into<String>) -> Self {
        self.password_hash = Some(hash.into());
        self
    }
}

/// A teacher-defined task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Due date (Unix seconds).
    #[serde(default)]
    pub due_date: Option<i64>,
    /// Number of submissions the teacher expects.
    #[serde(default)]
    pub expected_count: Option<u32>,
    /// Accepted file extensions, empty means any.
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    pub creator_id: String,
    pub created_at: i64,
}

/// Fields supplied when creating a task.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_date: Option<i64>,
    #[serde(default)]
    pub expected_count: Option<u32>,
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
}

impl Task {
    /// Build a task owned by `creator_id` from the submitted fields.
    pub fn from_new(new: NewTask, creator_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: new.title,
            description: new.description,
            due_date: new.due_date,
            expected_count: new.expected_count,
            allowed_extensions: new.allowed_extensions,
            creator_id: creator_id.into(),
            created_at: Utc::now().timestamp(),
        }
    }
}

/// A submitted report file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub title: String,
    /// Original file name as uploaded.
    pub file_name: String,
    /// Where the bytes live: an `http(s)://` URL or a path under the uploads dir.
    pub file_url: String,
    pub user_id: String,
    #[serde(default)]
    pub task_id: Option<String>,
    /// Submission timestamp (Unix seconds).
    pub submitted_at: i64,
}

impl Report {
    /// Create a report whose title is its file name.
    pub fn new(
        user_id: impl Into<String>,
        file_name: impl Into<String>,
        file_url: impl Into<String>,
    ) -> Self {
        let file_name = file_name.into();
        Self {
            id: Uuid::new_v4().to_string(),
            title: file_name.clone(),
            file_name,
            file_url: file_url.into(),
            user_id: user_id.into(),
            task_id: None,
            submitted_at: Utc::now().timestamp(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Report joined with its owner's display fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportWithOwner {
    #[serde(flatten)]
    pub report: Report,
    pub owner_name: String,
    pub owner_student_id: String,
}

/// Task listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    #[serde(flatten)]
    pub task: Task,
    pub report_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_format() {
        assert_eq!(serde_json::to_string(&Role::Teacher).unwrap(), "\"TEACHER\"");
        let role: Role = serde_json::from_str("\"STUDENT\"").unwrap();
        assert_eq!(role, Role::Student);
        assert_eq!("teacher".parse::<Role>().unwrap(), Role::Teacher);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn test_report_with_owner_flattens() {
        let entry = ReportWithOwner {
            report: Report::new("u1", "a.pdf", "a.pdf").with_id("r1"),
            owner_name: "Alice".to_string(),
            owner_student_id: "2021000001".to_string(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["id"], "r1");
        assert_eq!(json["fileName"], "a.pdf");
        assert_eq!(json["ownerName"], "Alice");
    }
}
