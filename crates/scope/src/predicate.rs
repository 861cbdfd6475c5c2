use std::collections::BTreeSet;

/// Equality conjunct on an allowlisted column, e.g. `("status", "active")`.
pub type FilterEq = (String, String);

/// Half-open or closed range conjunct on an allowlisted column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRange {
    pub column: String,
    pub min: Option<String>,
    pub max: Option<String>,
}

/// A scope filter in the form SQL call sites consume: either no entity
/// restriction, a concrete allowed-entity-id set (already expanded down
/// the hierarchy), or the field-operator self filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopePredicate {
    Any,
    EntityIn(BTreeSet<String>),
    SelfStaff(String),
}

/// Entity dimension of a built row filter. `IdIn` with an empty set must
/// translate to a clause matching zero rows, never to a missing clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityClause {
    Any,
    IdIn(BTreeSet<String>),
}

/// Filters the caller supplied explicitly on the request. These are a
/// manual override: they take precedence over the role-derived scope
/// rather than intersecting with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilters {
    pub entity_id: Option<String>,
    pub entity_ids: Option<Vec<String>>,
    pub staff_user_id: Option<String>,
    pub equals: Vec<FilterEq>,
    pub ranges: Vec<FilterRange>,
}

/// The composed filter handed to a data-store call. One shape shared by
/// the PII listing, delivery metrics, and both sync call sites; each
/// translates it onto its own base query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub entity: EntityClause,
    pub staff_user_id: Option<String>,
    pub equals: Vec<FilterEq>,
    pub ranges: Vec<FilterRange>,
}

/// Combine caller-supplied filters with the role-derived scope.
///
/// Precedence, highest first: a singular request entity id; a request
/// entity-id list; the scope predicate. A request staff id overrides the
/// self-staff default. Remaining conjuncts are orthogonal to scope and
/// pass through untouched.
pub fn build_row_filter(request: &RequestFilters, scope: &ScopePredicate) -> RowFilter {
    let entity = if let Some(entity_id) = request
        .entity_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        EntityClause::IdIn(BTreeSet::from([entity_id.to_string()]))
    } else if let Some(entity_ids) = request.entity_ids.as_ref() {
        EntityClause::IdIn(
            entity_ids
                .iter()
                .map(|id| id.trim())
                .filter(|id| !id.is_empty())
                .map(|id| id.to_string())
                .collect(),
        )
    } else {
        match scope {
            ScopePredicate::Any | ScopePredicate::SelfStaff(_) => EntityClause::Any,
            ScopePredicate::EntityIn(ids) => EntityClause::IdIn(ids.clone()),
        }
    };

    let staff_user_id = match (&request.staff_user_id, scope) {
        (Some(explicit), _) => Some(explicit.clone()),
        (None, ScopePredicate::SelfStaff(user_id)) => Some(user_id.clone()),
        (None, _) => None,
    };

    RowFilter {
        entity,
        staff_user_id,
        equals: request.equals.clone(),
        ranges: request.ranges.clone(),
    }
}
