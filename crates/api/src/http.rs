use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use amani_audit::{AuditRecord, AuditWriter};
use amani_auth::{AuthContext, JwtConfig, JwtVerifier};
use amani_contracts::{EntityFilter, Role};
use amani_pii::{AesGcmDecryptor, can_decrypt, shape_list, shape_record};
use amani_scope::{
    OwnershipResolver, RequestFilters, StoreError, build_row_filter, compute_scope,
    resolve_roles, resolve_scope_predicate,
};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{AppConfig, AuthMode, StartupError};
use crate::rate_limit::RateLimiter;
use crate::store::PgDirectory;

mod sync;

use self::sync::{entity_sync, sync_pull};

const ROUTE_BENEFICIARIES: &str = "/v1/beneficiaries";
const ROUTE_BENEFICIARY: &str = "/v1/beneficiaries/{id}";
const ROUTE_DELIVERY_METRICS: &str = "/v1/metrics/service-deliveries";
const ROUTE_SYNC_PULL: &str = "/v1/sync/pull";
const ROUTE_ENTITY_SYNC: &str = "/v1/sync/entities/{entity_type}/{entity_id}";

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    directory: PgDirectory,
    audit: AuditWriter,
    decryptor: AesGcmDecryptor,
    jwt: Option<JwtVerifier>,
    rate_limiter: RateLimiter,
}

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

pub async fn router(config: AppConfig) -> Result<Router, StartupError> {
    let jwt = match (config.auth_mode, config.jwt.as_ref()) {
        (AuthMode::Jwt, Some(settings)) => Some(
            JwtVerifier::new(JwtConfig {
                secret: settings.secret.clone(),
                audience: settings.audience.clone(),
                clock_skew: Duration::from_secs(settings.clock_skew_secs),
                roles_claim: settings.roles_claim.clone(),
            })
            .map_err(|err| StartupError {
                code: err.code,
                message: err.message,
            })?,
        ),
        (AuthMode::Jwt, None) => {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "jwt auth mode requires jwt settings".to_string(),
            });
        }
        (AuthMode::Local, _) => None,
    };

    let decryptor = AesGcmDecryptor::from_hex(&config.pii_key_hex).map_err(|_| StartupError {
        code: "ERR_INVALID_PII_KEY",
        message: "AMANI_PII_KEY_HEX is not a usable key".to_string(),
    })?;

    let pool = sqlx::PgPool::connect(&config.db_url)
        .await
        .map_err(|_| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: "failed to initialize directory database pool".to_string(),
        })?;
    let directory = PgDirectory::new(pool, Duration::from_millis(config.db_query_timeout_ms));

    let audit = AuditWriter::connect_and_migrate(
        &config.audit_db_url,
        Duration::from_millis(config.audit_write_timeout_ms),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_AUDIT_UNAVAILABLE",
        message: format!("failed to initialize audit sink: {}", err),
    })?;

    let rate_limiter = RateLimiter::new(
        Duration::from_secs(config.rate_limit_window_secs.max(1)),
        16_384,
    );

    let state = AppState {
        config,
        directory,
        audit,
        decryptor,
        jwt,
        rate_limiter,
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(ROUTE_BENEFICIARIES, get(list_beneficiaries))
        .route(ROUTE_BENEFICIARY, get(get_beneficiary))
        .route(ROUTE_DELIVERY_METRICS, get(delivery_metrics))
        .route(ROUTE_SYNC_PULL, get(sync_pull))
        .route(ROUTE_ENTITY_SYNC, get(entity_sync))
        .with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("directory", state.directory.ping().await.is_ok());
    checks.insert("audit", state.audit.ping().await.is_ok());

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.config.metrics_require_auth
        && let Err(err) = extract_auth(&state, &headers)
    {
        return err.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ListBeneficiariesQuery {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    per_page: Option<u32>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    entity_ids: Option<String>,
    #[serde(default)]
    staff_user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct BeneficiaryListResponse {
    page: u32,
    per_page: u32,
    count: usize,
    beneficiaries: Vec<amani_pii::ShapedBeneficiary>,
}

async fn list_beneficiaries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListBeneficiariesQuery>,
) -> Response {
    let started = Instant::now();
    let result = handle_list_beneficiaries(&state, &headers, query).await;
    finish(ROUTE_BENEFICIARIES, "GET", started, result)
}

async fn handle_list_beneficiaries(
    state: &AppState,
    headers: &HeaderMap,
    query: ListBeneficiariesQuery,
) -> Result<Response, ApiError> {
    let request_id = extract_request_id(headers);
    let caller = resolve_request_scope(state, headers).await?;

    let span = tracing::info_span!(
        "beneficiaries.list",
        request_id = %request_id,
        principal_id = %caller.user_id,
    );

    async move {
        let page = query.page.unwrap_or(1).max(1);
        let per_page = query
            .per_page
            .unwrap_or(state.config.page_size_default)
            .clamp(1, state.config.page_size_max);
        let offset = u64::from(page - 1) * u64::from(per_page);

        let mut request_filters = RequestFilters {
            entity_id: query.entity_id,
            entity_ids: query.entity_ids.as_deref().map(parse_id_list),
            staff_user_id: query.staff_user_id,
            ..Default::default()
        };
        if let Some(status) = query
            .status
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            request_filters
                .equals
                .push(("status".to_string(), status.to_string()));
        }

        let scope_predicate = resolve_scope_predicate(&state.directory, &caller.filter)
            .await
            .map_err(internal_error)?;
        let row_filter = build_row_filter(&request_filters, &scope_predicate);

        let records = state
            .directory
            .list_beneficiaries(&row_filter, per_page, offset)
            .await
            .map_err(db_unavailable)?;

        let allow_decrypt = can_decrypt(&caller.roles);
        let shaped = shape_list(records, &state.decryptor, allow_decrypt).map_err(internal_error)?;
        let count = shaped.len();

        if allow_decrypt {
            crate::metrics::observe_pii_disclosure(ROUTE_BENEFICIARIES);
            state.audit.record_detached(AuditRecord {
                principal_id: caller.user_id.clone(),
                action: amani_audit::ACTION_PII_LIST_READ,
                description: format!(
                    "listed {} beneficiaries with decrypted PII (page {}, per_page {})",
                    count, page, per_page
                ),
                details: serde_json::json!({
                    "count": count,
                    "page": page,
                    "per_page": per_page,
                }),
            });
        }

        tracing::info!(count, page, per_page, "api.beneficiaries.list");

        let mut response = (
            StatusCode::OK,
            Json(BeneficiaryListResponse {
                page,
                per_page,
                count,
                beneficiaries: shaped,
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

async fn get_beneficiary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(beneficiary_id): Path<String>,
) -> Response {
    let started = Instant::now();
    let result = handle_get_beneficiary(&state, &headers, beneficiary_id).await;
    finish(ROUTE_BENEFICIARY, "GET", started, result)
}

async fn handle_get_beneficiary(
    state: &AppState,
    headers: &HeaderMap,
    beneficiary_id: String,
) -> Result<Response, ApiError> {
    let request_id = extract_request_id(headers);
    let caller = resolve_request_scope(state, headers).await?;

    let span = tracing::info_span!(
        "beneficiaries.get",
        request_id = %request_id,
        principal_id = %caller.user_id,
        beneficiary_id = %beneficiary_id,
    );

    async move {
        let record = state
            .directory
            .get_beneficiary(&beneficiary_id)
            .await
            .map_err(db_unavailable)?;
        // Absent and out-of-scope are indistinguishable on purpose.
        let Some(record) = record else {
            return Err(not_found());
        };

        match &caller.filter {
            EntityFilter::Unrestricted => {}
            EntityFilter::BySelfStaffId(user_id) => {
                if record.staff_user_id != *user_id {
                    crate::metrics::observe_scope_denial(ROUTE_BENEFICIARY);
                    return Err(not_found());
                }
            }
            filter @ EntityFilter::ByEntityIds { .. } => {
                let mut resolver = OwnershipResolver::new(&state.directory);
                let in_scope = resolver
                    .is_in_scope(&record.entity_ref(), filter)
                    .await
                    .map_err(internal_error)?;
                if !in_scope {
                    crate::metrics::observe_scope_denial(ROUTE_BENEFICIARY);
                    return Err(not_found());
                }
            }
        }

        let allow_decrypt = can_decrypt(&caller.roles);
        let shaped =
            shape_record(record, &state.decryptor, allow_decrypt).map_err(internal_error)?;

        if allow_decrypt {
            // Awaited on the single-record path: a PII disclosure that
            // cannot be audited is refused.
            state
                .audit
                .record(AuditRecord {
                    principal_id: caller.user_id.clone(),
                    action: amani_audit::ACTION_PII_RECORD_READ,
                    description: format!(
                        "read beneficiary {} with decrypted PII",
                        shaped.beneficiary_id
                    ),
                    details: serde_json::json!({
                        "beneficiary_id": shaped.beneficiary_id,
                    }),
                })
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, "audit write failed for PII read");
                    json_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "ERR_AUDIT_UNAVAILABLE",
                        "audit sink unavailable".to_string(),
                        true,
                    )
                })?;
            crate::metrics::observe_pii_disclosure(ROUTE_BENEFICIARY);
        }

        tracing::info!("api.beneficiaries.get");

        let mut response = (StatusCode::OK, Json(shaped)).into_response();
        if allow_decrypt {
            apply_no_store(&mut response);
        }
        Ok(response)
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
struct DeliveryMetricsQuery {
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    entity_ids: Option<String>,
    #[serde(default)]
    staff_user_id: Option<String>,
    #[serde(default)]
    service_id: Option<String>,
    #[serde(default)]
    delivered_from: Option<String>,
    #[serde(default)]
    delivered_to: Option<String>,
}

async fn delivery_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DeliveryMetricsQuery>,
) -> Response {
    let started = Instant::now();
    let result = handle_delivery_metrics(&state, &headers, query).await;
    finish(ROUTE_DELIVERY_METRICS, "GET", started, result)
}

async fn handle_delivery_metrics(
    state: &AppState,
    headers: &HeaderMap,
    query: DeliveryMetricsQuery,
) -> Result<Response, ApiError> {
    let request_id = extract_request_id(headers);
    let caller = resolve_request_scope(state, headers).await?;

    let span = tracing::info_span!(
        "deliveries.metrics",
        request_id = %request_id,
        principal_id = %caller.user_id,
    );

    async move {
        let mut request_filters = RequestFilters {
            entity_id: query.entity_id,
            entity_ids: query.entity_ids.as_deref().map(parse_id_list),
            staff_user_id: query.staff_user_id,
            ..Default::default()
        };
        if let Some(service_id) = query
            .service_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            request_filters
                .equals
                .push(("service_id".to_string(), service_id.to_string()));
        }

        let delivered_from = validate_cursor(query.delivered_from.as_deref())?;
        let delivered_to = validate_cursor(query.delivered_to.as_deref())?;
        if delivered_from.is_some() || delivered_to.is_some() {
            request_filters.ranges.push(amani_scope::FilterRange {
                column: "delivered_at".to_string(),
                min: delivered_from,
                max: delivered_to,
            });
        }

        let scope_predicate = resolve_scope_predicate(&state.directory, &caller.filter)
            .await
            .map_err(internal_error)?;
        let row_filter = build_row_filter(&request_filters, &scope_predicate);

        let metrics = state
            .directory
            .delivery_metrics(&row_filter, state.config.metrics_max_groups)
            .await
            .map_err(db_unavailable)?;

        tracing::info!(
            total = metrics.total_deliveries,
            unique = metrics.unique_beneficiaries,
            "api.deliveries.metrics"
        );

        Ok((StatusCode::OK, Json(metrics)).into_response())
    }
    .instrument(span)
    .await
}

/// Principal plus resolved role set and scope, computed once per request.
pub(crate) struct CallerScope {
    pub user_id: String,
    pub roles: BTreeSet<Role>,
    pub filter: EntityFilter,
}

pub(crate) async fn resolve_request_scope(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<CallerScope, ApiError> {
    let auth = extract_auth(state, headers)?;
    let roles = resolve_roles(&state.directory, &auth.user_id, auth.roles.as_deref()).await;
    let filter = compute_scope(&state.directory, &auth.user_id, &roles)
        .await
        .map_err(internal_error)?;

    Ok(CallerScope {
        user_id: auth.user_id,
        roles,
        filter,
    })
}

fn extract_auth(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    match state.config.auth_mode {
        AuthMode::Local => {
            validate_local_auth_shared_secret(
                headers,
                state.config.local_auth_shared_secret.as_deref(),
            )?;
            let user_id = headers
                .get("x-amani-user-id")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
                .ok_or_else(|| {
                    json_error(
                        StatusCode::UNAUTHORIZED,
                        "ERR_AUTH_REQUIRED",
                        "missing x-amani-user-id header".to_string(),
                        false,
                    )
                })?;
            Ok(AuthContext {
                user_id,
                roles: None,
            })
        }
        AuthMode::Jwt => {
            let Some(verifier) = state.jwt.as_ref() else {
                return Err(json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ERR_INTERNAL",
                    "jwt verifier is not initialized".to_string(),
                    false,
                ));
            };

            verifier.authenticate(headers).map_err(|err| {
                json_error(StatusCode::UNAUTHORIZED, err.code, err.message, false)
            })
        }
    }
}

fn validate_local_auth_shared_secret(
    headers: &HeaderMap,
    expected_secret: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected_secret) = expected_secret else {
        return Ok(());
    };

    let provided_secret = headers
        .get("x-amani-auth-secret")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_AUTH_REQUIRED",
                "missing local auth secret".to_string(),
                false,
            )
        })?;

    if provided_secret != expected_secret {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_INVALID",
            "invalid local auth secret".to_string(),
            false,
        ));
    }

    Ok(())
}

pub(crate) fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-amani-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && v.len() <= 64)
        .filter(|v| {
            v.bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
        .map(|v| v.to_string())
        .unwrap_or_else(|| Ulid::new().to_string())
}

/// Split a comma-separated id list, dropping blanks. An explicitly
/// supplied empty list still overrides scope and matches nothing.
pub(crate) fn parse_id_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| id.to_string())
        .collect()
}

/// Accept only `YYYY-MM-DDTHH:MM:SSZ`; anything else is a 400 rather
/// than a silently ignored filter.
pub(crate) fn sanitize_utc_timestamp(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    if bytes.len() != 20 {
        return None;
    }
    for (idx, b) in bytes.iter().enumerate() {
        let ok = match idx {
            4 | 7 => *b == b'-',
            10 => *b == b'T',
            13 | 16 => *b == b':',
            19 => *b == b'Z',
            _ => b.is_ascii_digit(),
        };
        if !ok {
            return None;
        }
    }
    Some(raw.to_string())
}

pub(crate) fn validate_cursor(raw: Option<&str>) -> Result<Option<String>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => sanitize_utc_timestamp(raw).map(Some).ok_or_else(|| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_PARAMS",
                "timestamps must be UTC RFC3339 (YYYY-MM-DDTHH:MM:SSZ)".to_string(),
                false,
            )
        }),
    }
}

/// Decrypted PII must never be stored by an intermediary; encrypted-only
/// responses carry no such restriction.
pub(crate) fn apply_no_store(response: &mut Response) {
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, private"),
    );
    response
        .headers_mut()
        .insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
}

pub(crate) fn finish(
    route: &'static str,
    method: &str,
    started: Instant,
    result: Result<Response, ApiError>,
) -> Response {
    let response = match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    crate::metrics::observe_http_request(
        route,
        method,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

pub(crate) fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}

pub(crate) fn not_found() -> ApiError {
    json_error(
        StatusCode::NOT_FOUND,
        "ERR_NOT_FOUND",
        "not found".to_string(),
        false,
    )
}

/// Scope/PII failures collapse into one opaque internal error; callers
/// cannot tell "denied" from "erred".
pub(crate) fn internal_error(err: impl std::fmt::Display) -> ApiError {
    tracing::error!(error = %err, "internal error");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "ERR_INTERNAL",
        "internal error".to_string(),
        false,
    )
}

pub(crate) fn db_unavailable(err: StoreError) -> ApiError {
    tracing::error!(error = %err, "directory unavailable");
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "ERR_DB_UNAVAILABLE",
        "database unavailable".to_string(),
        true,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_list_parsing_trims_and_drops_blanks() {
        assert_eq!(parse_id_list("p1, p2 ,,p3"), vec!["p1", "p2", "p3"]);
        assert!(parse_id_list(" , ").is_empty());
    }

    #[test]
    fn timestamp_sanitizer_accepts_only_utc_rfc3339() {
        assert_eq!(
            sanitize_utc_timestamp("2026-02-03T10:20:30Z").as_deref(),
            Some("2026-02-03T10:20:30Z")
        );
        assert_eq!(sanitize_utc_timestamp("2026-02-03 10:20:30"), None);
        assert_eq!(sanitize_utc_timestamp("2026-02-03T10:20:30+02:00"), None);
        assert_eq!(sanitize_utc_timestamp("not-a-time"), None);
        assert_eq!(sanitize_utc_timestamp("2026-02-03T10:20:30z"), None);
    }

    #[test]
    fn request_id_falls_back_to_a_generated_ulid() {
        let mut headers = HeaderMap::new();
        headers.insert("x-amani-request-id", "req-123".parse().expect("header"));
        assert_eq!(extract_request_id(&headers), "req-123");

        headers.insert(
            "x-amani-request-id",
            "bad id with spaces".parse().expect("header"),
        );
        let generated = extract_request_id(&headers);
        assert_eq!(generated.len(), 26);

        let generated = extract_request_id(&HeaderMap::new());
        assert_eq!(generated.len(), 26);
    }
}
