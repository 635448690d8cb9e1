use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{
    ColumnKind, CrmRepository, CrmTable, LeadActivity, Page, RepositoryError, SearchFilters,
};
use crate::DbPool;

pub struct SqlCrmRepository {
    pool: DbPool,
}

impl SqlCrmRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

enum BindValue {
    Int(i64),
    Text(String),
    Null,
}

fn coerce_bind(
    table: CrmTable,
    column: &str,
    value: &Value,
) -> Result<BindValue, RepositoryError> {
    let kind = table
        .columns()
        .iter()
        .find(|candidate| candidate.name == column)
        .map(|candidate| candidate.kind)
        .ok_or_else(|| {
            RepositoryError::Decode(format!(
                "unknown column `{column}` for table `{}`",
                table.as_str()
            ))
        })?;

    let bind = match (kind, value) {
        (_, Value::Null) => BindValue::Null,
        (ColumnKind::Integer, Value::Number(number)) => number
            .as_i64()
            .map(BindValue::Int)
            .ok_or_else(|| RepositoryError::Decode(format!("non-integer value for `{column}`")))?,
        (ColumnKind::Integer, Value::String(raw)) => raw
            .trim()
            .parse::<i64>()
            .map(BindValue::Int)
            .map_err(|_| RepositoryError::Decode(format!("non-integer value for `{column}`")))?,
        (ColumnKind::Text, Value::String(raw)) => BindValue::Text(raw.clone()),
        (ColumnKind::Text, Value::Number(number)) => BindValue::Text(number.to_string()),
        (ColumnKind::Text, Value::Bool(flag)) => BindValue::Text(flag.to_string()),
        (_, other) => {
            return Err(RepositoryError::Decode(format!(
                "unsupported value {other} for column `{column}`"
            )))
        }
    };
    Ok(bind)
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: Vec<BindValue>,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            BindValue::Int(value) => query.bind(value),
            BindValue::Text(value) => query.bind(value),
            BindValue::Null => query.bind(None::<String>),
        };
    }
    query
}

fn row_to_value(table: CrmTable, row: &SqliteRow) -> Result<Value, RepositoryError> {
    let mut object = Map::new();
    for column in table.columns() {
        let value = match column.kind {
            ColumnKind::Integer => row
                .try_get::<Option<i64>, _>(column.name)
                .map(|maybe| maybe.map(Value::from).unwrap_or(Value::Null)),
            ColumnKind::Text => row
                .try_get::<Option<String>, _>(column.name)
                .map(|maybe| maybe.map(Value::from).unwrap_or(Value::Null)),
        }
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        object.insert(column.name.to_string(), value);
    }
    Ok(Value::Object(object))
}

fn column_list(table: CrmTable) -> String {
    table.columns().iter().map(|column| column.name).collect::<Vec<_>>().join(", ")
}

fn parse_row_id(id: &str) -> Option<i64> {
    id.trim().parse::<i64>().ok()
}

#[async_trait::async_trait]
impl CrmRepository for SqlCrmRepository {
    async fn search(
        &self,
        table: CrmTable,
        filters: &SearchFilters,
        page: Page,
    ) -> Result<Vec<Value>, RepositoryError> {
        let mut sql = format!("SELECT {} FROM {}", column_list(table), table.as_str());
        let mut binds = Vec::new();

        if let Some(term) = filters.term.as_deref().filter(|term| !term.trim().is_empty()) {
            let pattern = format!("%{}%", term.trim());
            let clauses = table
                .search_fields()
                .iter()
                .map(|field| format!("{field} LIKE ?"))
                .collect::<Vec<_>>()
                .join(" OR ");
            sql.push_str(&format!(" WHERE ({clauses})"));
            for _ in table.search_fields() {
                binds.push(BindValue::Text(pattern.clone()));
            }
        }

        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
        binds.push(BindValue::Int(i64::from(page.limit)));
        binds.push(BindValue::Int(i64::from(page.offset)));

        let rows = bind_all(sqlx::query(&sql), binds).fetch_all(&self.pool).await?;
        rows.iter().map(|row| row_to_value(table, row)).collect()
    }

    async fn insert(
        &self,
        table: CrmTable,
        fields: &Map<String, Value>,
    ) -> Result<Vec<Value>, RepositoryError> {
        let mut columns = Vec::new();
        let mut binds = Vec::new();
        for (key, value) in fields {
            columns.push(key.as_str());
            binds.push(coerce_bind(table, key, value)?);
        }

        let now = Utc::now().to_rfc3339();
        columns.push("created_at");
        binds.push(BindValue::Text(now.clone()));
        columns.push("updated_at");
        binds.push(BindValue::Text(now));

        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table.as_str(),
            columns.join(", "),
            placeholders,
            column_list(table),
        );

        let rows = bind_all(sqlx::query(&sql), binds).fetch_all(&self.pool).await?;
        rows.iter().map(|row| row_to_value(table, row)).collect()
    }

    async fn update(
        &self,
        table: CrmTable,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<Vec<Value>, RepositoryError> {
        let Some(row_id) = parse_row_id(id) else {
            return Ok(Vec::new());
        };

        let mut assignments = Vec::new();
        let mut binds = Vec::new();
        for (key, value) in fields {
            assignments.push(format!("{key} = ?"));
            binds.push(coerce_bind(table, key, value)?);
        }

        assignments.push("updated_at = ?".to_string());
        binds.push(BindValue::Text(Utc::now().to_rfc3339()));
        binds.push(BindValue::Int(row_id));

        let sql = format!(
            "UPDATE {} SET {} WHERE id = ? RETURNING {}",
            table.as_str(),
            assignments.join(", "),
            column_list(table),
        );

        let rows = bind_all(sqlx::query(&sql), binds).fetch_all(&self.pool).await?;
        rows.iter().map(|row| row_to_value(table, row)).collect()
    }

    async fn delete(&self, table: CrmTable, id: &str) -> Result<Vec<Value>, RepositoryError> {
        let Some(row_id) = parse_row_id(id) else {
            return Ok(Vec::new());
        };

        let sql = format!(
            "DELETE FROM {} WHERE id = ? RETURNING {}",
            table.as_str(),
            column_list(table),
        );

        let rows = sqlx::query(&sql).bind(row_id).fetch_all(&self.pool).await?;
        rows.iter().map(|row| row_to_value(table, row)).collect()
    }

    async fn find_lead_by_id(&self, id: i64) -> Result<Option<Value>, RepositoryError> {
        let sql = format!("SELECT {} FROM leads WHERE id = ?", column_list(CrmTable::Leads));
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| row_to_value(CrmTable::Leads, &row)).transpose()
    }

    async fn find_lead_by_name(&self, name: &str) -> Result<Option<Value>, RepositoryError> {
        let columns = column_list(CrmTable::Leads);
        let exact_sql = format!(
            "SELECT {columns} FROM leads WHERE LOWER(name) = LOWER(?) \
             ORDER BY created_at DESC LIMIT 1",
        );
        if let Some(row) =
            sqlx::query(&exact_sql).bind(name.trim()).fetch_optional(&self.pool).await?
        {
            return row_to_value(CrmTable::Leads, &row).map(Some);
        }

        let like_sql = format!(
            "SELECT {columns} FROM leads WHERE name LIKE ? ORDER BY created_at DESC LIMIT 1",
        );
        let pattern = format!("%{}%", name.trim());
        let row = sqlx::query(&like_sql).bind(pattern).fetch_optional(&self.pool).await?;
        row.map(|row| row_to_value(CrmTable::Leads, &row)).transpose()
    }

    async fn leads_requiring_followup(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Value>, RepositoryError> {
        let sql = format!(
            "SELECT {} FROM leads \
             WHERE next_follow_up IS NOT NULL \
               AND next_follow_up <= ? \
               AND lead_status NOT IN ('Closed', 'Lost') \
             ORDER BY next_follow_up ASC",
            column_list(CrmTable::Leads),
        );

        let rows = sqlx::query(&sql).bind(now.to_rfc3339()).fetch_all(&self.pool).await?;
        rows.iter().map(|row| row_to_value(CrmTable::Leads, row)).collect()
    }

    async fn lead_activity(&self, lead_id: i64) -> Result<LeadActivity, RepositoryError> {
        let mut activity = LeadActivity::default();

        for (table, bucket) in [
            (CrmTable::Tasks, &mut activity.tasks),
            (CrmTable::Notes, &mut activity.notes),
            (CrmTable::Emails, &mut activity.emails),
        ] {
            let sql = format!(
                "SELECT {} FROM {} WHERE lead_id = ? ORDER BY created_at DESC",
                column_list(table),
                table.as_str(),
            );
            let rows = sqlx::query(&sql).bind(lead_id).fetch_all(&self.pool).await?;
            *bucket = rows
                .iter()
                .map(|row| row_to_value(table, row))
                .collect::<Result<Vec<_>, _>>()?;
        }

        Ok(activity)
    }
}
