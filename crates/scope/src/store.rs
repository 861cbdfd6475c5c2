use std::collections::HashMap;

use async_trait::async_trait;

/// Failure of an underlying directory lookup. The message is for logs;
/// callers map it to a generic internal error without leaking detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "directory lookup failed: {}", self.message)
    }
}

impl std::error::Error for StoreError {}

/// Role assignments by user id.
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Role names assigned to the user. Names outside the closed role set
    /// may appear and are dropped by the caller.
    async fn role_names(&self, user_id: &str) -> Result<Vec<String>, StoreError>;
}

/// Project/subproject assignment relations keyed by user id.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn project_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    async fn subproject_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError>;
}

/// The project ← subproject ← activity containment chain, bulk lookups
/// only. Ids absent from a result map have no corresponding row; callers
/// treat that as "cannot be placed in scope".
#[async_trait]
pub trait HierarchyStore: Send + Sync {
    /// subproject id → owning project id, for every input id that exists.
    async fn projects_of_subprojects(
        &self,
        subproject_ids: &[String],
    ) -> Result<HashMap<String, String>, StoreError>;

    /// activity id → owning subproject id, for every input id that exists.
    async fn subprojects_of_activities(
        &self,
        activity_ids: &[String],
    ) -> Result<HashMap<String, String>, StoreError>;

    /// All subproject ids contained in any of the given projects.
    async fn subproject_ids_in_projects(
        &self,
        project_ids: &[String],
    ) -> Result<Vec<String>, StoreError>;

    /// All activity ids contained in any of the given subprojects.
    async fn activity_ids_in_subprojects(
        &self,
        subproject_ids: &[String],
    ) -> Result<Vec<String>, StoreError>;
}
