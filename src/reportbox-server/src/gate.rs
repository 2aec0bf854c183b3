//! Access gate.
//!
//! Every gated operation is an [`Action`]; [`authorize`] decides it from the
//! current session alone. The gate never touches the store or the network, so
//! handlers call it before reading the request body.

use reportbox_storage::Role;

/// The identity attached to a request by the session middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub role: Role,
    pub name: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>, role: Role, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            name: name.into(),
        }
    }

    pub fn is_teacher(&self) -> bool {
        self.role == Role::Teacher
    }
}

/// A gated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<'a> {
    /// Bulk download of report files.
    ExportReports,
    /// Inspect a recorded export outcome.
    ViewExport,
    /// Delete the rows of a completed export.
    PurgeReports,
    /// Listing reports across every owner.
    ListAllReports,
    /// Move reports between tasks.
    AssignReports,
    /// Create or delete tasks.
    ManageTasks,
    ListTasks,
    /// Upload a report file against a task.
    SubmitReport,
    /// Change the caller's own password.
    ChangePassword,
    /// Submissions for one task, scoped by role.
    ListTaskSubmissions,
    /// Delete a single report owned by `owner_id`.
    DeleteReport { owner_id: &'a str },
}

/// Why the gate refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// No session.
    Unauthenticated,
    /// A session that fails the action's rule.
    Forbidden(&'static str),
}

/// Which reports an allowed caller may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    /// Only reports owned by this user.
    Own(String),
}

/// Role requirement for an action.
#[derive(Debug, Clone, Copy)]
pub struct RoleGuard {
    allowed: &'static [Role],
}

impl RoleGuard {
    pub const TEACHER: Self = Self::any_of(&[Role::Teacher]);
    pub const ANY: Self = Self::any_of(&[Role::Teacher, Role::Student]);

    /// Create a guard that admits any of the listed roles.
    pub const fn any_of(roles: &'static [Role]) -> Self {
        Self { allowed: roles }
    }

    pub fn check(&self, session: &Session) -> bool {
        self.allowed.contains(&session.role)
    }
}

/// Decide whether `session` may perform `action`.
pub fn authorize(session: Option<&Session>, action: &Action<'_>) -> Result<Scope, Denial> {
    let session = session.ok_or(Denial::Unauthenticated)?;

    match action {
        Action::ExportReports
        | Action::ViewExport
        | Action::PurgeReports
        | Action::ListAllReports
        | Action::AssignReports
        | Action::ManageTasks => {
            if RoleGuard::TEACHER.check(session) {
                Ok(Scope::All)
            } else {
                Err(Denial::Forbidden("teacher role required"))
            }
        }
        Action::ListTasks | Action::SubmitReport | Action::ChangePassword => {
            if RoleGuard::ANY.check(session) {
                Ok(Scope::All)
            } else {
                Err(Denial::Forbidden("unknown role"))
            }
        }
        Action::ListTaskSubmissions => Ok(visibility(session)),
        Action::DeleteReport { owner_id } => {
            if session.is_teacher() || session.user_id == *owner_id {
                Ok(Scope::All)
            } else {
                Err(Denial::Forbidden("only the owner or a teacher may delete a report"))
            }
        }
    }
}

fn visibility(session: &Session) -> Scope {
    match session.role {
        Role::Teacher => Scope::All,
        Role::Student => Scope::Own(session.user_id.clone()),
    }
}
