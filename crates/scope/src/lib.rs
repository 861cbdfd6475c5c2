//! Role-scoped data access: who may see which slice of the program
//! hierarchy, and how that scope becomes a query filter.
//!
//! The pipeline per request is role resolution ([`resolve_roles`]), scope
//! calculation ([`compute_scope`]), then either a row filter for SQL call
//! sites ([`resolve_scope_predicate`] + [`build_row_filter`]) or a
//! membership test over already-fetched rows ([`OwnershipResolver`]).
//! Nothing in this crate caches across requests.

pub mod hierarchy;
pub mod predicate;
pub mod roles;
pub mod scope;
pub mod store;

pub use hierarchy::OwnershipResolver;
pub use predicate::{
    EntityClause, FilterEq, FilterRange, RequestFilters, RowFilter, ScopePredicate,
    build_row_filter,
};
pub use roles::resolve_roles;
pub use scope::{compute_scope, is_privileged, resolve_scope_predicate};
pub use store::{AssignmentStore, HierarchyStore, RoleStore, StoreError};

#[cfg(test)]
pub(crate) mod testutil;
