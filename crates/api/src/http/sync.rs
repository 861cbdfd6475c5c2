use std::time::Instant;

use amani_audit::AuditRecord;
use amani_contracts::{EntityFilter, EntityRef, EntityType, ServiceDeliveryRecord, canonical};
use amani_pii::{ShapedBeneficiary, can_decrypt, shape_list};
use amani_scope::{
    EntityClause, HierarchyStore, OwnershipResolver, RequestFilters, RowFilter, ScopePredicate,
    build_row_filter,
};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::{
    ApiError, AppState, CallerScope, ROUTE_ENTITY_SYNC, ROUTE_SYNC_PULL, apply_no_store,
    db_unavailable, extract_request_id, finish, internal_error, json_error, not_found,
    resolve_request_scope, validate_cursor,
};

#[derive(Debug, Deserialize)]
pub(super) struct SyncPullQuery {
    #[serde(default)]
    updated_after: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SyncPullResponse {
    server_time: String,
    updated_after: Option<String>,
    beneficiaries: Vec<ShapedBeneficiary>,
    deliveries: Vec<ServiceDeliveryRecord>,
    snapshot_hash: String,
}

pub(super) async fn sync_pull(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SyncPullQuery>,
) -> Response {
    let started = Instant::now();
    let result = handle_sync_pull(&state, &headers, query).await;
    finish(ROUTE_SYNC_PULL, "GET", started, result)
}

async fn handle_sync_pull(
    state: &AppState,
    headers: &HeaderMap,
    query: SyncPullQuery,
) -> Result<Response, ApiError> {
    let request_id = extract_request_id(headers);
    let caller = resolve_request_scope(state, headers).await?;
    check_sync_rate(state, &caller)?;

    let span = tracing::info_span!(
        "sync.pull",
        request_id = %request_id,
        principal_id = %caller.user_id,
    );

    async move {
        let cursor = validate_cursor(query.updated_after.as_deref())?;
        let limit = query
            .limit
            .unwrap_or(state.config.sync_rows_max)
            .clamp(1, state.config.sync_rows_max);

        let scope_predicate =
            amani_scope::resolve_scope_predicate(&state.directory, &caller.filter)
                .await
                .map_err(internal_error)?;
        let beneficiary_filter = build_row_filter(&RequestFilters::default(), &scope_predicate);

        let beneficiaries = state
            .directory
            .beneficiaries_updated_since(&beneficiary_filter, cursor.as_deref(), limit)
            .await
            .map_err(db_unavailable)?;

        // Deliveries are fetched broad and membership-filtered in memory
        // through the batched resolver; the staff self-filter still
        // applies in SQL.
        let delivery_filter = RowFilter {
            entity: EntityClause::Any,
            staff_user_id: match &caller.filter {
                EntityFilter::BySelfStaffId(user_id) => Some(user_id.clone()),
                _ => None,
            },
            equals: Vec::new(),
            ranges: Vec::new(),
        };
        let fetched = state
            .directory
            .deliveries_since(&delivery_filter, cursor.as_deref(), limit)
            .await
            .map_err(db_unavailable)?;

        let refs = fetched
            .iter()
            .map(ServiceDeliveryRecord::entity_ref)
            .collect::<Vec<EntityRef>>();
        let mut resolver = OwnershipResolver::new(&state.directory);
        let mask = resolver
            .filter_in_scope(&refs, &caller.filter)
            .await
            .map_err(internal_error)?;
        let deliveries = fetched
            .into_iter()
            .zip(mask)
            .filter_map(|(delivery, keep)| keep.then_some(delivery))
            .collect::<Vec<_>>();

        let allow_decrypt = can_decrypt(&caller.roles);
        let beneficiaries =
            shape_list(beneficiaries, &state.decryptor, allow_decrypt).map_err(internal_error)?;

        let server_time = state
            .directory
            .current_time_utc()
            .await
            .map_err(db_unavailable)?;

        let snapshot = serde_json::json!({
            "beneficiaries": serde_json::to_value(&beneficiaries).map_err(internal_error)?,
            "deliveries": serde_json::to_value(&deliveries).map_err(internal_error)?,
        });
        let snapshot_hash = canonical::hash_canonical_json(&snapshot);

        crate::metrics::observe_sync_rows("beneficiaries", beneficiaries.len());
        crate::metrics::observe_sync_rows("deliveries", deliveries.len());
        if allow_decrypt {
            crate::metrics::observe_pii_disclosure(ROUTE_SYNC_PULL);
        }

        state.audit.record_detached(AuditRecord {
            principal_id: caller.user_id.clone(),
            action: amani_audit::ACTION_SYNC_PULL,
            description: format!(
                "sync pull: {} beneficiaries, {} deliveries (decrypted: {})",
                beneficiaries.len(),
                deliveries.len(),
                allow_decrypt
            ),
            details: serde_json::json!({
                "beneficiaries": beneficiaries.len(),
                "deliveries": deliveries.len(),
                "updated_after": cursor,
                "decrypted": allow_decrypt,
            }),
        });

        tracing::info!(
            beneficiaries = beneficiaries.len(),
            deliveries = deliveries.len(),
            "api.sync.pull"
        );

        let mut response = (
            StatusCode::OK,
            Json(SyncPullResponse {
                server_time,
                updated_after: cursor,
                beneficiaries,
                deliveries,
                snapshot_hash,
            }),
        )
            .into_response();
        if allow_decrypt {
            apply_no_store(&mut response);
        }
        Ok(response)
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
pub(super) struct EntitySyncQuery {
    #[serde(default)]
    updated_after: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

pub(super) async fn entity_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((entity_type, entity_id)): Path<(String, String)>,
    Query(query): Query<EntitySyncQuery>,
) -> Response {
    let started = Instant::now();
    let result = handle_entity_sync(&state, &headers, entity_type, entity_id, query).await;
    finish(ROUTE_ENTITY_SYNC, "GET", started, result)
}

async fn handle_entity_sync(
    state: &AppState,
    headers: &HeaderMap,
    entity_type: String,
    entity_id: String,
    query: EntitySyncQuery,
) -> Result<Response, ApiError> {
    // Unknown entity types fail closed before any lookup.
    let Some(entity_type) = EntityType::from_name(entity_type.trim()) else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "entity_type must be project, subproject, or activity".to_string(),
            false,
        ));
    };

    let request_id = extract_request_id(headers);
    let caller = resolve_request_scope(state, headers).await?;
    check_sync_rate(state, &caller)?;

    let span = tracing::info_span!(
        "sync.entity",
        request_id = %request_id,
        principal_id = %caller.user_id,
        entity_id = %entity_id,
        entity_type = %entity_type.as_str(),
    );

    async move {
        let cursor = validate_cursor(query.updated_after.as_deref())?;
        let limit = query
            .limit
            .unwrap_or(state.config.sync_rows_max)
            .clamp(1, state.config.sync_rows_max);

        let entity = EntityRef::new(entity_id.clone(), entity_type);
        if let filter @ EntityFilter::ByEntityIds { .. } = &caller.filter {
            let mut resolver = OwnershipResolver::new(&state.directory);
            let in_scope = resolver
                .is_in_scope(&entity, filter)
                .await
                .map_err(internal_error)?;
            if !in_scope {
                crate::metrics::observe_scope_denial(ROUTE_ENTITY_SYNC);
                return Err(not_found());
            }
        }

        // The requested entity is an explicit override: rows attached to
        // it or anything beneath it, regardless of the wider scope.
        let subtree = expand_subtree(&state.directory, &entity)
            .await
            .map_err(db_unavailable)?;
        let request_filters = RequestFilters {
            entity_ids: Some(subtree),
            ..Default::default()
        };
        let residual_scope = match &caller.filter {
            EntityFilter::BySelfStaffId(user_id) => ScopePredicate::SelfStaff(user_id.clone()),
            _ => ScopePredicate::Any,
        };
        let row_filter = build_row_filter(&request_filters, &residual_scope);

        let beneficiaries = state
            .directory
            .beneficiaries_updated_since(&row_filter, cursor.as_deref(), limit)
            .await
            .map_err(db_unavailable)?;
        let deliveries = state
            .directory
            .deliveries_since(&row_filter, cursor.as_deref(), limit)
            .await
            .map_err(db_unavailable)?;

        let allow_decrypt = can_decrypt(&caller.roles);
        let beneficiaries =
            shape_list(beneficiaries, &state.decryptor, allow_decrypt).map_err(internal_error)?;

        let server_time = state
            .directory
            .current_time_utc()
            .await
            .map_err(db_unavailable)?;

        let snapshot = serde_json::json!({
            "beneficiaries": serde_json::to_value(&beneficiaries).map_err(internal_error)?,
            "deliveries": serde_json::to_value(&deliveries).map_err(internal_error)?,
        });
        let snapshot_hash = canonical::hash_canonical_json(&snapshot);

        crate::metrics::observe_sync_rows("beneficiaries", beneficiaries.len());
        crate::metrics::observe_sync_rows("deliveries", deliveries.len());
        if allow_decrypt {
            crate::metrics::observe_pii_disclosure(ROUTE_ENTITY_SYNC);
        }

        state.audit.record_detached(AuditRecord {
            principal_id: caller.user_id.clone(),
            action: amani_audit::ACTION_SYNC_PULL,
            description: format!(
                "entity sync {} {}: {} beneficiaries, {} deliveries (decrypted: {})",
                entity.entity_type.as_str(),
                entity.entity_id,
                beneficiaries.len(),
                deliveries.len(),
                allow_decrypt
            ),
            details: serde_json::json!({
                "entity_id": entity.entity_id,
                "entity_type": entity.entity_type.as_str(),
                "beneficiaries": beneficiaries.len(),
                "deliveries": deliveries.len(),
                "updated_after": cursor,
                "decrypted": allow_decrypt,
            }),
        });

        tracing::info!(
            beneficiaries = beneficiaries.len(),
            deliveries = deliveries.len(),
            "api.sync.entity"
        );

        let mut response = (
            StatusCode::OK,
            Json(SyncPullResponse {
                server_time,
                updated_after: cursor,
                beneficiaries,
                deliveries,
                snapshot_hash,
            }),
        )
            .into_response();
        if allow_decrypt {
            apply_no_store(&mut response);
        }
        Ok(response)
    }
    .instrument(span)
    .await
}

fn check_sync_rate(state: &AppState, caller: &CallerScope) -> Result<(), ApiError> {
    if state.rate_limiter.allow(
        format!("sync:{}", caller.user_id).as_str(),
        state.config.rate_limit_sync_per_window,
    ) {
        Ok(())
    } else {
        Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "rate limit exceeded for sync".to_string(),
            true,
        ))
    }
}

/// The requested entity plus everything it contains, one bulk lookup
/// per level below it.
async fn expand_subtree(
    store: &impl HierarchyStore,
    entity: &EntityRef,
) -> Result<Vec<String>, amani_scope::StoreError> {
    let mut ids = vec![entity.entity_id.clone()];

    let subproject_ids = match entity.entity_type {
        EntityType::Project => {
            let subs = store
                .subproject_ids_in_projects(&[entity.entity_id.clone()])
                .await?;
            ids.extend(subs.iter().cloned());
            subs
        }
        EntityType::Subproject => vec![entity.entity_id.clone()],
        EntityType::Activity => Vec::new(),
    };

    if !subproject_ids.is_empty() {
        let activities = store.activity_ids_in_subprojects(&subproject_ids).await?;
        ids.extend(activities);
    }

    Ok(ids)
}
