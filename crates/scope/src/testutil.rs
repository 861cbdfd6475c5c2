use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::store::{AssignmentStore, HierarchyStore, RoleStore, StoreError};

/// In-memory directory fake. Lookup counters let tests assert the
/// one-bulk-query-per-level batching contract.
#[derive(Default)]
pub struct MemoryDirectory {
    pub roles: HashMap<String, Vec<String>>,
    pub project_assignments: HashMap<String, Vec<String>>,
    pub subproject_assignments: HashMap<String, Vec<String>>,
    pub subproject_projects: HashMap<String, String>,
    pub activity_subprojects: HashMap<String, String>,
    pub fail_roles: bool,
    pub fail_assignments: bool,
    pub fail_hierarchy: bool,
    role_lookups: AtomicUsize,
    hierarchy_lookups: AtomicUsize,
}

impl MemoryDirectory {
    pub fn role_lookups(&self) -> usize {
        self.role_lookups.load(Ordering::SeqCst)
    }

    pub fn hierarchy_lookups(&self) -> usize {
        self.hierarchy_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoleStore for MemoryDirectory {
    async fn role_names(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        self.role_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_roles {
            return Err(StoreError::new("role store offline"));
        }
        Ok(self.roles.get(user_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl AssignmentStore for MemoryDirectory {
    async fn project_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        if self.fail_assignments {
            return Err(StoreError::new("assignment store offline"));
        }
        Ok(self
            .project_assignments
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn subproject_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        if self.fail_assignments {
            return Err(StoreError::new("assignment store offline"));
        }
        Ok(self
            .subproject_assignments
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl HierarchyStore for MemoryDirectory {
    async fn projects_of_subprojects(
        &self,
        subproject_ids: &[String],
    ) -> Result<HashMap<String, String>, StoreError> {
        self.hierarchy_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_hierarchy {
            return Err(StoreError::new("hierarchy store offline"));
        }
        Ok(subproject_ids
            .iter()
            .filter_map(|id| {
                self.subproject_projects
                    .get(id)
                    .map(|parent| (id.clone(), parent.clone()))
            })
            .collect())
    }

    async fn subprojects_of_activities(
        &self,
        activity_ids: &[String],
    ) -> Result<HashMap<String, String>, StoreError> {
        self.hierarchy_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_hierarchy {
            return Err(StoreError::new("hierarchy store offline"));
        }
        Ok(activity_ids
            .iter()
            .filter_map(|id| {
                self.activity_subprojects
                    .get(id)
                    .map(|parent| (id.clone(), parent.clone()))
            })
            .collect())
    }

    async fn subproject_ids_in_projects(
        &self,
        project_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        self.hierarchy_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_hierarchy {
            return Err(StoreError::new("hierarchy store offline"));
        }
        let mut out = self
            .subproject_projects
            .iter()
            .filter(|(_, project)| project_ids.contains(project))
            .map(|(subproject, _)| subproject.clone())
            .collect::<Vec<_>>();
        out.sort();
        Ok(out)
    }

    async fn activity_ids_in_subprojects(
        &self,
        subproject_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        self.hierarchy_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_hierarchy {
            return Err(StoreError::new("hierarchy store offline"));
        }
        let mut out = self
            .activity_subprojects
            .iter()
            .filter(|(_, subproject)| subproject_ids.contains(subproject))
            .map(|(activity, _)| activity.clone())
            .collect::<Vec<_>>();
        out.sort();
        Ok(out)
    }
}
