use std::collections::HashMap;

use amani_contracts::{EntityFilter, EntityRef, EntityType, ScopeLevel};

use crate::store::{HierarchyStore, StoreError};

/// Walks the activity → subproject → project containment chain against
/// the directory. Hop results (including known-missing rows) are cached
/// for the lifetime of the resolver, which is one request; nothing here
/// survives across requests.
pub struct OwnershipResolver<'a, S: HierarchyStore> {
    store: &'a S,
    // None = the row was looked up and does not exist.
    activity_parents: HashMap<String, Option<String>>,
    subproject_parents: HashMap<String, Option<String>>,
}

impl<'a, S: HierarchyStore> OwnershipResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            activity_parents: HashMap::new(),
            subproject_parents: HashMap::new(),
        }
    }

    async fn parent_subproject(&mut self, activity_id: &str) -> Result<Option<String>, StoreError> {
        if let Some(cached) = self.activity_parents.get(activity_id) {
            return Ok(cached.clone());
        }
        let found = self
            .store
            .subprojects_of_activities(&[activity_id.to_string()])
            .await?;
        let parent = found.get(activity_id).cloned();
        self.activity_parents
            .insert(activity_id.to_string(), parent.clone());
        Ok(parent)
    }

    async fn parent_project(&mut self, subproject_id: &str) -> Result<Option<String>, StoreError> {
        if let Some(cached) = self.subproject_parents.get(subproject_id) {
            return Ok(cached.clone());
        }
        let found = self
            .store
            .projects_of_subprojects(&[subproject_id.to_string()])
            .await?;
        let parent = found.get(subproject_id).cloned();
        self.subproject_parents
            .insert(subproject_id.to_string(), parent.clone());
        Ok(parent)
    }

    /// The project that owns this entity: zero hops for a project, one
    /// for a subproject, two for an activity. `None` when any hop target
    /// is absent — the entity cannot be placed in scope.
    pub async fn owning_project(&mut self, entity: &EntityRef) -> Result<Option<String>, StoreError> {
        match entity.entity_type {
            EntityType::Project => Ok(Some(entity.entity_id.clone())),
            EntityType::Subproject => self.parent_project(&entity.entity_id).await,
            EntityType::Activity => {
                let Some(subproject_id) = self.parent_subproject(&entity.entity_id).await? else {
                    return Ok(None);
                };
                self.parent_project(&subproject_id).await
            }
        }
    }

    /// The subproject that owns this entity. A project-level entity has
    /// none: the chain only resolves upward.
    pub async fn owning_subproject(
        &mut self,
        entity: &EntityRef,
    ) -> Result<Option<String>, StoreError> {
        match entity.entity_type {
            EntityType::Project => Ok(None),
            EntityType::Subproject => Ok(Some(entity.entity_id.clone())),
            EntityType::Activity => self.parent_subproject(&entity.entity_id).await,
        }
    }

    /// Membership of one entity in a scope filter. Only `ByEntityIds`
    /// restricts the entity dimension; the self-staff filter constrains
    /// rows by staff column instead and admin scope admits everything.
    pub async fn is_in_scope(
        &mut self,
        entity: &EntityRef,
        filter: &EntityFilter,
    ) -> Result<bool, StoreError> {
        match filter {
            EntityFilter::Unrestricted | EntityFilter::BySelfStaffId(_) => Ok(true),
            EntityFilter::ByEntityIds { level, ids } => {
                if ids.is_empty() {
                    return Ok(false);
                }
                let owner = match level {
                    ScopeLevel::Project => self.owning_project(entity).await?,
                    ScopeLevel::Subproject => self.owning_subproject(entity).await?,
                };
                Ok(owner.is_some_and(|id| ids.contains(&id)))
            }
        }
    }

    /// Batched membership over many rows: at most one bulk lookup per
    /// hierarchy level regardless of row count. Returns one bool per
    /// input ref, in order.
    pub async fn filter_in_scope(
        &mut self,
        refs: &[EntityRef],
        filter: &EntityFilter,
    ) -> Result<Vec<bool>, StoreError> {
        let (level, ids) = match filter {
            EntityFilter::Unrestricted | EntityFilter::BySelfStaffId(_) => {
                return Ok(vec![true; refs.len()]);
            }
            EntityFilter::ByEntityIds { level, ids } => (*level, ids),
        };
        if ids.is_empty() {
            return Ok(vec![false; refs.len()]);
        }

        self.prefetch(refs, level).await?;

        let mut mask = Vec::with_capacity(refs.len());
        for entity in refs {
            mask.push(self.is_in_scope(entity, filter).await?);
        }
        Ok(mask)
    }

    /// Warm the hop caches for a batch: one bulk activity lookup, then
    /// (for project-level scopes) one bulk subproject lookup covering
    /// both direct subproject refs and the activity parents just found.
    async fn prefetch(&mut self, refs: &[EntityRef], level: ScopeLevel) -> Result<(), StoreError> {
        let mut activity_ids = Vec::new();
        for entity in refs {
            if entity.entity_type == EntityType::Activity
                && !self.activity_parents.contains_key(&entity.entity_id)
                && !activity_ids.contains(&entity.entity_id)
            {
                activity_ids.push(entity.entity_id.clone());
            }
        }
        if !activity_ids.is_empty() {
            let found = self.store.subprojects_of_activities(&activity_ids).await?;
            for activity_id in activity_ids {
                let parent = found.get(&activity_id).cloned();
                self.activity_parents.insert(activity_id, parent);
            }
        }

        if level == ScopeLevel::Subproject {
            return Ok(());
        }

        let mut subproject_ids = Vec::new();
        for entity in refs {
            if entity.entity_type == EntityType::Subproject
                && !self.subproject_parents.contains_key(&entity.entity_id)
                && !subproject_ids.contains(&entity.entity_id)
            {
                subproject_ids.push(entity.entity_id.clone());
            }
        }
        for parent in self.activity_parents.values().flatten() {
            if !self.subproject_parents.contains_key(parent) && !subproject_ids.contains(parent) {
                subproject_ids.push(parent.clone());
            }
        }
        if !subproject_ids.is_empty() {
            let found = self.store.projects_of_subprojects(&subproject_ids).await?;
            for subproject_id in subproject_ids {
                let parent = found.get(&subproject_id).cloned();
                self.subproject_parents.insert(subproject_id, parent);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryDirectory;
    use std::collections::BTreeSet;

    fn chain_fixture() -> MemoryDirectory {
        // p1 ← s1 ← a1, p2 ← s3 ← a3
        let mut dir = MemoryDirectory::default();
        dir.subproject_projects
            .insert("s1".to_string(), "p1".to_string());
        dir.subproject_projects
            .insert("s3".to_string(), "p2".to_string());
        dir.activity_subprojects
            .insert("a1".to_string(), "s1".to_string());
        dir.activity_subprojects
            .insert("a3".to_string(), "s3".to_string());
        dir
    }

    fn project_scope(ids: &[&str]) -> EntityFilter {
        EntityFilter::ByEntityIds {
            level: ScopeLevel::Project,
            ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn subproject_scope(ids: &[&str]) -> EntityFilter {
        EntityFilter::ByEntityIds {
            level: ScopeLevel::Subproject,
            ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn project_entities_resolve_to_themselves() {
        let dir = chain_fixture();
        let mut resolver = OwnershipResolver::new(&dir);
        let owner = resolver
            .owning_project(&EntityRef::new("p9", EntityType::Project))
            .await
            .expect("resolution should succeed");
        assert_eq!(owner, Some("p9".to_string()));
        assert_eq!(dir.hierarchy_lookups(), 0);
    }

    #[tokio::test]
    async fn activity_resolves_through_two_hops() {
        let dir = chain_fixture();
        let mut resolver = OwnershipResolver::new(&dir);
        let owner = resolver
            .owning_project(&EntityRef::new("a1", EntityType::Activity))
            .await
            .expect("resolution should succeed");
        assert_eq!(owner, Some("p1".to_string()));
    }

    #[tokio::test]
    async fn missing_hop_resolves_to_none() {
        let dir = chain_fixture();
        let mut resolver = OwnershipResolver::new(&dir);

        let owner = resolver
            .owning_project(&EntityRef::new("ghost", EntityType::Activity))
            .await
            .expect("resolution should succeed");
        assert_eq!(owner, None);

        // Subproject row exists but its project hop is dangling.
        let mut dangling = chain_fixture();
        dangling
            .activity_subprojects
            .insert("a9".to_string(), "s9".to_string());
        let mut resolver = OwnershipResolver::new(&dangling);
        let owner = resolver
            .owning_project(&EntityRef::new("a9", EntityType::Activity))
            .await
            .expect("resolution should succeed");
        assert_eq!(owner, None);
    }

    #[tokio::test]
    async fn activity_in_scope_iff_owning_project_matches() {
        let dir = chain_fixture();
        let mut resolver = OwnershipResolver::new(&dir);
        let scope = project_scope(&["p1"]);

        assert!(
            resolver
                .is_in_scope(&EntityRef::new("a1", EntityType::Activity), &scope)
                .await
                .expect("membership should resolve")
        );
        assert!(
            !resolver
                .is_in_scope(&EntityRef::new("a3", EntityType::Activity), &scope)
                .await
                .expect("membership should resolve")
        );
        assert!(
            !resolver
                .is_in_scope(&EntityRef::new("ghost", EntityType::Activity), &scope)
                .await
                .expect("membership should resolve")
        );
    }

    #[tokio::test]
    async fn subproject_level_scope_tests_at_subproject_level() {
        let dir = chain_fixture();
        let mut resolver = OwnershipResolver::new(&dir);
        let scope = subproject_scope(&["s1", "s2"]);

        // a3 lives under s3, which is not assigned.
        assert!(
            !resolver
                .is_in_scope(&EntityRef::new("a3", EntityType::Activity), &scope)
                .await
                .expect("membership should resolve")
        );
        assert!(
            resolver
                .is_in_scope(&EntityRef::new("a1", EntityType::Activity), &scope)
                .await
                .expect("membership should resolve")
        );
        assert!(
            resolver
                .is_in_scope(&EntityRef::new("s1", EntityType::Subproject), &scope)
                .await
                .expect("membership should resolve")
        );
        // A project-level row can never satisfy a subproject scope.
        assert!(
            !resolver
                .is_in_scope(&EntityRef::new("p1", EntityType::Project), &scope)
                .await
                .expect("membership should resolve")
        );
    }

    #[tokio::test]
    async fn empty_id_set_matches_nothing() {
        let dir = chain_fixture();
        let mut resolver = OwnershipResolver::new(&dir);
        let scope = EntityFilter::ByEntityIds {
            level: ScopeLevel::Project,
            ids: BTreeSet::new(),
        };
        assert!(
            !resolver
                .is_in_scope(&EntityRef::new("p1", EntityType::Project), &scope)
                .await
                .expect("membership should resolve")
        );
    }

    #[tokio::test]
    async fn batched_filter_issues_one_bulk_lookup_per_level() {
        let dir = chain_fixture();
        let mut resolver = OwnershipResolver::new(&dir);
        let refs = vec![
            EntityRef::new("a1", EntityType::Activity),
            EntityRef::new("a3", EntityType::Activity),
            EntityRef::new("s1", EntityType::Subproject),
            EntityRef::new("p1", EntityType::Project),
            EntityRef::new("ghost", EntityType::Activity),
        ];

        let mask = resolver
            .filter_in_scope(&refs, &project_scope(&["p1"]))
            .await
            .expect("batch membership should resolve");
        assert_eq!(mask, vec![true, false, true, true, false]);
        assert_eq!(dir.hierarchy_lookups(), 2);
    }

    #[tokio::test]
    async fn batched_filter_under_unrestricted_scope_skips_lookups() {
        let dir = chain_fixture();
        let mut resolver = OwnershipResolver::new(&dir);
        let refs = vec![EntityRef::new("a1", EntityType::Activity)];

        let mask = resolver
            .filter_in_scope(&refs, &EntityFilter::Unrestricted)
            .await
            .expect("batch membership should resolve");
        assert_eq!(mask, vec![true]);
        assert_eq!(dir.hierarchy_lookups(), 0);
    }

    #[tokio::test]
    async fn hop_results_are_cached_within_the_resolver() {
        let dir = chain_fixture();
        let mut resolver = OwnershipResolver::new(&dir);
        let entity = EntityRef::new("a1", EntityType::Activity);

        resolver
            .owning_project(&entity)
            .await
            .expect("resolution should succeed");
        let after_first = dir.hierarchy_lookups();
        resolver
            .owning_project(&entity)
            .await
            .expect("resolution should succeed");
        assert_eq!(dir.hierarchy_lookups(), after_first);
    }
}
