use std::collections::HashMap;
use std::time::Duration;

use amani_contracts::{
    BeneficiaryRecord, CipherEnvelope, EntityType, PiiEnvelopes, ServiceDeliveryRecord,
};
use amani_scope::{
    AssignmentStore, EntityClause, HierarchyStore, RoleStore, RowFilter, StoreError,
};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

const TIME_COLUMN_FORMAT: &str = "YYYY-MM-DD\"T\"HH24:MI:SS\"Z\"";

const BENEFICIARY_EQ_COLUMNS: &[&str] = &["status", "entity_type"];
const BENEFICIARY_RANGE_COLUMNS: &[&str] = &["created_at", "updated_at"];
const DELIVERY_EQ_COLUMNS: &[&str] = &["service_id", "beneficiary_id", "entity_type"];
const DELIVERY_RANGE_COLUMNS: &[&str] = &["delivered_at"];

/// Read-side access to the program database: role and assignment
/// lookups, hierarchy hops, and the beneficiary/delivery collections.
/// Scope-defining tables are only ever read here.
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
    query_timeout: Duration,
}

#[derive(Debug, Clone)]
enum BindValue {
    Text(String),
    TextArray(Vec<String>),
}

/// WHERE-clause accumulator shared by every collection query. Column
/// names never come from request input directly; each call site passes
/// them through its table's allowlist.
struct SqlFilter {
    clauses: Vec<String>,
    binds: Vec<BindValue>,
}

impl SqlFilter {
    fn new() -> Self {
        Self {
            clauses: Vec::new(),
            binds: Vec::new(),
        }
    }

    fn placeholder(&mut self, value: BindValue) -> String {
        self.binds.push(value);
        format!("${}", self.binds.len())
    }

    fn apply_row_filter(
        &mut self,
        filter: &RowFilter,
        eq_columns: &[&str],
        range_columns: &[&str],
    ) -> Result<(), StoreError> {
        match &filter.entity {
            EntityClause::Any => {}
            EntityClause::IdIn(ids) if ids.is_empty() => {
                // Empty scope matches nothing; dropping the clause would
                // silently widen it to everything.
                self.clauses.push("false".to_string());
            }
            EntityClause::IdIn(ids) => {
                let p = self.placeholder(BindValue::TextArray(ids.iter().cloned().collect()));
                self.clauses.push(format!("entity_id = ANY({})", p));
            }
        }

        if let Some(staff_user_id) = &filter.staff_user_id {
            let p = self.placeholder(BindValue::Text(staff_user_id.clone()));
            self.clauses.push(format!("staff_user_id = {}", p));
        }

        for (column, value) in &filter.equals {
            if !eq_columns.contains(&column.as_str()) {
                return Err(StoreError::new(format!(
                    "column {} is not filterable here",
                    column
                )));
            }
            let p = self.placeholder(BindValue::Text(value.clone()));
            self.clauses.push(format!("{} = {}", column, p));
        }

        for range in &filter.ranges {
            if !range_columns.contains(&range.column.as_str()) {
                return Err(StoreError::new(format!(
                    "column {} is not range-filterable here",
                    range.column
                )));
            }
            if let Some(min) = &range.min {
                let p = self.placeholder(BindValue::Text(min.clone()));
                self.clauses.push(format!("{} >= {}::timestamptz", range.column, p));
            }
            if let Some(max) = &range.max {
                let p = self.placeholder(BindValue::Text(max.clone()));
                self.clauses.push(format!("{} <= {}::timestamptz", range.column, p));
            }
        }

        Ok(())
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ServiceCount {
    pub service_id: String,
    pub delivery_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeliveryMetrics {
    pub total_deliveries: i64,
    pub unique_beneficiaries: i64,
    pub by_service: Vec<ServiceCount>,
}

impl PgDirectory {
    pub fn new(pool: PgPool, query_timeout: Duration) -> Self {
        Self {
            pool,
            query_timeout,
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.fetch_all("SELECT 1", Vec::new()).await.map(|_| ())
    }

    /// Server clock as an RFC3339 UTC string; the sync cursor format.
    pub async fn current_time_utc(&self) -> Result<String, StoreError> {
        let sql = format!(
            "SELECT to_char(now() AT TIME ZONE 'UTC', '{}') AS server_time",
            TIME_COLUMN_FORMAT
        );
        let rows = self.fetch_all(&sql, Vec::new()).await?;
        let row = rows
            .first()
            .ok_or_else(|| StoreError::new("clock query returned no rows"))?;
        row.try_get::<String, _>("server_time")
            .map_err(|err| StoreError::new(err.to_string()))
    }

    pub async fn list_beneficiaries(
        &self,
        filter: &RowFilter,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<BeneficiaryRecord>, StoreError> {
        let mut sql_filter = SqlFilter::new();
        sql_filter.apply_row_filter(filter, BENEFICIARY_EQ_COLUMNS, BENEFICIARY_RANGE_COLUMNS)?;

        let sql = format!(
            "SELECT {} FROM beneficiaries{} ORDER BY beneficiary_id LIMIT {} OFFSET {}",
            beneficiary_columns(),
            sql_filter.where_sql(),
            limit,
            offset
        );
        let rows = self.fetch_all(&sql, sql_filter.binds).await?;
        Ok(collect_beneficiaries(rows))
    }

    pub async fn get_beneficiary(
        &self,
        beneficiary_id: &str,
    ) -> Result<Option<BeneficiaryRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM beneficiaries WHERE beneficiary_id = $1",
            beneficiary_columns()
        );
        let row = self
            .fetch_optional(&sql, vec![BindValue::Text(beneficiary_id.to_string())])
            .await?;
        match row {
            None => Ok(None),
            // A row with an unknown entity type cannot be placed in
            // scope; it is treated as absent rather than served.
            Some(row) => Ok(beneficiary_from_row(&row)),
        }
    }

    pub async fn beneficiaries_updated_since(
        &self,
        filter: &RowFilter,
        updated_after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<BeneficiaryRecord>, StoreError> {
        let mut sql_filter = SqlFilter::new();
        sql_filter.apply_row_filter(filter, BENEFICIARY_EQ_COLUMNS, BENEFICIARY_RANGE_COLUMNS)?;
        if let Some(cursor) = updated_after {
            let p = sql_filter.placeholder(BindValue::Text(cursor.to_string()));
            sql_filter
                .clauses
                .push(format!("updated_at > {}::timestamptz", p));
        }

        let sql = format!(
            "SELECT {} FROM beneficiaries{} ORDER BY updated_at, beneficiary_id LIMIT {}",
            beneficiary_columns(),
            sql_filter.where_sql(),
            limit
        );
        let rows = self.fetch_all(&sql, sql_filter.binds).await?;
        Ok(collect_beneficiaries(rows))
    }

    pub async fn deliveries_since(
        &self,
        filter: &RowFilter,
        delivered_after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ServiceDeliveryRecord>, StoreError> {
        let mut sql_filter = SqlFilter::new();
        sql_filter.apply_row_filter(filter, DELIVERY_EQ_COLUMNS, DELIVERY_RANGE_COLUMNS)?;
        if let Some(cursor) = delivered_after {
            let p = sql_filter.placeholder(BindValue::Text(cursor.to_string()));
            sql_filter
                .clauses
                .push(format!("delivered_at > {}::timestamptz", p));
        }

        let sql = format!(
            "SELECT {} FROM service_deliveries{} ORDER BY delivered_at, delivery_id LIMIT {}",
            delivery_columns(),
            sql_filter.where_sql(),
            limit
        );
        let rows = self.fetch_all(&sql, sql_filter.binds).await?;
        Ok(collect_deliveries(rows))
    }

    pub async fn delivery_metrics(
        &self,
        filter: &RowFilter,
        max_groups: u32,
    ) -> Result<DeliveryMetrics, StoreError> {
        let mut sql_filter = SqlFilter::new();
        sql_filter.apply_row_filter(filter, DELIVERY_EQ_COLUMNS, DELIVERY_RANGE_COLUMNS)?;
        let where_sql = sql_filter.where_sql();
        let binds = sql_filter.binds;

        let totals_sql = format!(
            "SELECT count(*) AS total_deliveries, count(DISTINCT beneficiary_id) AS unique_beneficiaries FROM service_deliveries{}",
            where_sql
        );
        let totals_rows = self.fetch_all(&totals_sql, binds.clone()).await?;
        let totals = totals_rows
            .first()
            .ok_or_else(|| StoreError::new("aggregate query returned no rows"))?;
        let total_deliveries: i64 = totals
            .try_get("total_deliveries")
            .map_err(|err| StoreError::new(err.to_string()))?;
        let unique_beneficiaries: i64 = totals
            .try_get("unique_beneficiaries")
            .map_err(|err| StoreError::new(err.to_string()))?;

        let groups_sql = format!(
            "SELECT service_id, count(*) AS delivery_count FROM service_deliveries{} GROUP BY service_id ORDER BY delivery_count DESC, service_id LIMIT {}",
            where_sql, max_groups
        );
        let group_rows = self.fetch_all(&groups_sql, binds).await?;
        let mut by_service = Vec::with_capacity(group_rows.len());
        for row in &group_rows {
            by_service.push(ServiceCount {
                service_id: row
                    .try_get("service_id")
                    .map_err(|err| StoreError::new(err.to_string()))?,
                delivery_count: row
                    .try_get("delivery_count")
                    .map_err(|err| StoreError::new(err.to_string()))?,
            });
        }

        Ok(DeliveryMetrics {
            total_deliveries,
            unique_beneficiaries,
            by_service,
        })
    }

    async fn fetch_all(
        &self,
        sql: &str,
        binds: Vec<BindValue>,
    ) -> Result<Vec<PgRow>, StoreError> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = match bind {
                BindValue::Text(value) => query.bind(value),
                BindValue::TextArray(values) => query.bind(values),
            };
        }
        tokio::time::timeout(self.query_timeout, query.fetch_all(&self.pool))
            .await
            .map_err(|_| StoreError::new("query timed out"))?
            .map_err(|err| StoreError::new(err.to_string()))
    }

    async fn fetch_optional(
        &self,
        sql: &str,
        binds: Vec<BindValue>,
    ) -> Result<Option<PgRow>, StoreError> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = match bind {
                BindValue::Text(value) => query.bind(value),
                BindValue::TextArray(values) => query.bind(values),
            };
        }
        tokio::time::timeout(self.query_timeout, query.fetch_optional(&self.pool))
            .await
            .map_err(|_| StoreError::new("query timed out"))?
            .map_err(|err| StoreError::new(err.to_string()))
    }
}

#[async_trait]
impl RoleStore for PgDirectory {
    async fn role_names(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = self
            .fetch_all(
                "SELECT r.name FROM user_roles ur JOIN roles r ON r.role_id = ur.role_id WHERE ur.user_id = $1",
                vec![BindValue::Text(user_id.to_string())],
            )
            .await?;
        column_values(&rows, "name")
    }
}

#[async_trait]
impl AssignmentStore for PgDirectory {
    async fn project_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = self
            .fetch_all(
                "SELECT project_id FROM project_assignments WHERE user_id = $1",
                vec![BindValue::Text(user_id.to_string())],
            )
            .await?;
        column_values(&rows, "project_id")
    }

    async fn subproject_ids_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = self
            .fetch_all(
                "SELECT subproject_id FROM subproject_assignments WHERE user_id = $1",
                vec![BindValue::Text(user_id.to_string())],
            )
            .await?;
        column_values(&rows, "subproject_id")
    }
}

#[async_trait]
impl HierarchyStore for PgDirectory {
    async fn projects_of_subprojects(
        &self,
        subproject_ids: &[String],
    ) -> Result<HashMap<String, String>, StoreError> {
        let rows = self
            .fetch_all(
                "SELECT subproject_id, project_id FROM subprojects WHERE subproject_id = ANY($1)",
                vec![BindValue::TextArray(subproject_ids.to_vec())],
            )
            .await?;
        pair_map(&rows, "subproject_id", "project_id")
    }

    async fn subprojects_of_activities(
        &self,
        activity_ids: &[String],
    ) -> Result<HashMap<String, String>, StoreError> {
        let rows = self
            .fetch_all(
                "SELECT activity_id, subproject_id FROM activities WHERE activity_id = ANY($1)",
                vec![BindValue::TextArray(activity_ids.to_vec())],
            )
            .await?;
        pair_map(&rows, "activity_id", "subproject_id")
    }

    async fn subproject_ids_in_projects(
        &self,
        project_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let rows = self
            .fetch_all(
                "SELECT subproject_id FROM subprojects WHERE project_id = ANY($1)",
                vec![BindValue::TextArray(project_ids.to_vec())],
            )
            .await?;
        column_values(&rows, "subproject_id")
    }

    async fn activity_ids_in_subprojects(
        &self,
        subproject_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let rows = self
            .fetch_all(
                "SELECT activity_id FROM activities WHERE subproject_id = ANY($1)",
                vec![BindValue::TextArray(subproject_ids.to_vec())],
            )
            .await?;
        column_values(&rows, "activity_id")
    }
}

fn beneficiary_columns() -> String {
    format!(
        "beneficiary_id, pseudonym, status, entity_id, entity_type, staff_user_id, \
         to_char(created_at AT TIME ZONE 'UTC', '{fmt}') AS created_at, \
         to_char(updated_at AT TIME ZONE 'UTC', '{fmt}') AS updated_at, \
         first_name_enc, last_name_enc, date_of_birth_enc, national_id_enc, \
         phone_enc, email_enc, address_enc",
        fmt = TIME_COLUMN_FORMAT
    )
}

fn delivery_columns() -> String {
    format!(
        "delivery_id, beneficiary_id, service_id, entity_id, entity_type, staff_user_id, \
         to_char(delivered_at AT TIME ZONE 'UTC', '{fmt}') AS delivered_at",
        fmt = TIME_COLUMN_FORMAT
    )
}

fn collect_beneficiaries(rows: Vec<PgRow>) -> Vec<BeneficiaryRecord> {
    rows.iter().filter_map(beneficiary_from_row).collect()
}

fn collect_deliveries(rows: Vec<PgRow>) -> Vec<ServiceDeliveryRecord> {
    rows.iter().filter_map(delivery_from_row).collect()
}

fn beneficiary_from_row(row: &PgRow) -> Option<BeneficiaryRecord> {
    let beneficiary_id: String = row.try_get("beneficiary_id").ok()?;
    let Some(entity_type) = entity_type_from_row(row, &beneficiary_id) else {
        return None;
    };

    Some(BeneficiaryRecord {
        beneficiary_id,
        pseudonym: row.try_get("pseudonym").ok()?,
        status: row.try_get("status").ok()?,
        entity_id: row.try_get("entity_id").ok()?,
        entity_type,
        staff_user_id: row.try_get("staff_user_id").ok()?,
        created_at: row.try_get("created_at").ok()?,
        updated_at: row.try_get("updated_at").ok()?,
        pii_enc: PiiEnvelopes {
            first_name: envelope_column(row, "first_name_enc"),
            last_name: envelope_column(row, "last_name_enc"),
            date_of_birth: envelope_column(row, "date_of_birth_enc"),
            national_id: envelope_column(row, "national_id_enc"),
            phone: envelope_column(row, "phone_enc"),
            email: envelope_column(row, "email_enc"),
            address: envelope_column(row, "address_enc"),
        },
    })
}

fn delivery_from_row(row: &PgRow) -> Option<ServiceDeliveryRecord> {
    let delivery_id: String = row.try_get("delivery_id").ok()?;
    let Some(entity_type) = entity_type_from_row(row, &delivery_id) else {
        return None;
    };

    Some(ServiceDeliveryRecord {
        delivery_id,
        beneficiary_id: row.try_get("beneficiary_id").ok()?,
        service_id: row.try_get("service_id").ok()?,
        entity_id: row.try_get("entity_id").ok()?,
        entity_type,
        staff_user_id: row.try_get("staff_user_id").ok()?,
        delivered_at: row.try_get("delivered_at").ok()?,
    })
}

fn entity_type_from_row(row: &PgRow, row_id: &str) -> Option<EntityType> {
    let raw: String = row.try_get("entity_type").ok()?;
    let parsed = EntityType::from_name(&raw);
    if parsed.is_none() {
        // Fails closed: a row whose entity type is outside the known
        // hierarchy is never served.
        tracing::warn!(row_id, entity_type = %raw, "dropping row with unknown entity type");
    }
    parsed
}

fn envelope_column(row: &PgRow, column: &str) -> Option<CipherEnvelope> {
    let value: Option<serde_json::Value> = row.try_get(column).ok()?;
    let value = value?;
    match serde_json::from_value::<CipherEnvelope>(value) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            tracing::warn!(column, error = %err, "stored cipher envelope is malformed");
            None
        }
    }
}

fn column_values(rows: &[PgRow], column: &str) -> Result<Vec<String>, StoreError> {
    rows.iter()
        .map(|row| {
            row.try_get::<String, _>(column)
                .map_err(|err| StoreError::new(err.to_string()))
        })
        .collect()
}

fn pair_map(
    rows: &[PgRow],
    key_column: &str,
    value_column: &str,
) -> Result<HashMap<String, String>, StoreError> {
    rows.iter()
        .map(|row| {
            let key = row
                .try_get::<String, _>(key_column)
                .map_err(|err| StoreError::new(err.to_string()))?;
            let value = row
                .try_get::<String, _>(value_column)
                .map_err(|err| StoreError::new(err.to_string()))?;
            Ok((key, value))
        })
        .collect()
}
