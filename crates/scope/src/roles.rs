use std::collections::BTreeSet;

use amani_contracts::{Role, parse_role_names};

use crate::store::RoleStore;

/// Resolve the principal's role set. A non-empty pre-attached list (the
/// token's role claim) wins over a directory lookup; a failed lookup
/// degrades to the empty set so the principal ends up with no access
/// rather than elevated access. No error escapes this call.
pub async fn resolve_roles(
    store: &impl RoleStore,
    user_id: &str,
    preattached: Option<&[String]>,
) -> BTreeSet<Role> {
    if let Some(names) = preattached
        && !names.is_empty()
    {
        return parse_role_names(names.iter().map(String::as_str));
    }

    match store.role_names(user_id).await {
        Ok(names) => parse_role_names(names.iter().map(String::as_str)),
        Err(err) => {
            tracing::warn!(user_id, error = %err, "role lookup failed; principal treated as role-less");
            BTreeSet::new()
        }
    }
}
