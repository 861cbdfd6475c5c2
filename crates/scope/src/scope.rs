use std::collections::BTreeSet;

use amani_contracts::{EntityFilter, Role, ScopeLevel};

use crate::predicate::ScopePredicate;
use crate::store::{AssignmentStore, HierarchyStore, StoreError};

/// Admin tier: unrestricted scope. The same tier gates PII decryption,
/// evaluated independently by the PII crate.
pub fn is_privileged(roles: &BTreeSet<Role>) -> bool {
    roles.contains(&Role::SuperAdmin) || roles.contains(&Role::SystemAdministrator)
}

/// Compute the entity filter for one principal. Tier order is
/// load-bearing and first-match-wins: a principal holding both an admin
/// and a manager role gets admin behavior, never an intersection.
///
/// Assignment-lookup failures surface to the caller: "we don't know your
/// scope" must stay distinguishable from "you have none".
pub async fn compute_scope(
    store: &impl AssignmentStore,
    user_id: &str,
    roles: &BTreeSet<Role>,
) -> Result<EntityFilter, StoreError> {
    if is_privileged(roles) {
        return Ok(EntityFilter::Unrestricted);
    }

    if roles.contains(&Role::FieldOperator) {
        return Ok(EntityFilter::BySelfStaffId(user_id.to_string()));
    }

    if roles.contains(&Role::ProgramManager) {
        let ids = store.project_ids_for_user(user_id).await?;
        return Ok(EntityFilter::ByEntityIds {
            level: ScopeLevel::Project,
            ids: ids.into_iter().collect(),
        });
    }

    if roles.contains(&Role::SubProjectManager) {
        let ids = store.subproject_ids_for_user(user_id).await?;
        return Ok(EntityFilter::ByEntityIds {
            level: ScopeLevel::Subproject,
            ids: ids.into_iter().collect(),
        });
    }

    Ok(EntityFilter::no_access())
}

/// Widen a scope filter into the predicate form SQL call sites consume.
/// `ByEntityIds` expands downward to the full allowed entity-id set
/// (scope ids plus everything they contain) with one bulk lookup per
/// hierarchy level, so rows attached at any depth match a plain
/// `entity_id IN (…)` clause. An empty scope stays empty.
pub async fn resolve_scope_predicate(
    store: &impl HierarchyStore,
    filter: &EntityFilter,
) -> Result<ScopePredicate, StoreError> {
    match filter {
        EntityFilter::Unrestricted => Ok(ScopePredicate::Any),
        EntityFilter::BySelfStaffId(user_id) => Ok(ScopePredicate::SelfStaff(user_id.clone())),
        EntityFilter::ByEntityIds { level, ids } => {
            if ids.is_empty() {
                return Ok(ScopePredicate::EntityIn(BTreeSet::new()));
            }

            let mut allowed: BTreeSet<String> = ids.iter().cloned().collect();

            let subproject_ids = match level {
                ScopeLevel::Project => {
                    let scope_ids = ids.iter().cloned().collect::<Vec<_>>();
                    let subs = store.subproject_ids_in_projects(&scope_ids).await?;
                    allowed.extend(subs.iter().cloned());
                    subs
                }
                ScopeLevel::Subproject => ids.iter().cloned().collect::<Vec<_>>(),
            };

            if !subproject_ids.is_empty() {
                let activities = store.activity_ids_in_subprojects(&subproject_ids).await?;
                allowed.extend(activities);
            }

            Ok(ScopePredicate::EntityIn(allowed))
        }
    }
}
