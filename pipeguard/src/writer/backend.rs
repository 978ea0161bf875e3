//! Storage backend abstraction used by the idempotent writer.

use crate::errors::BackendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

/// A row: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// Serializes the values of `fields` into a comparable key.
///
/// Returns `None` if any field is missing or null.
#[must_use]
pub fn row_key(row: &Row, fields: &[String]) -> Option<String> {
    let mut values = Vec::with_capacity(fields.len());
    for field in fields {
        match row.get(field) {
            None | Some(Value::Null) => return None,
            Some(v) => values.push(v.clone()),
        }
    }
    serde_json::to_string(&values).ok()
}

/// The rows a write is responsible for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteScope {
    /// Rows whose primary key is in the set.
    Keys {
        /// Primary key columns.
        fields: Vec<String>,
        /// Serialized keys, see [`row_key`].
        keys: Vec<String>,
    },
    /// Rows whose partition column takes one of the values.
    Partition {
        /// Partition column.
        field: String,
        /// Partition values.
        values: Vec<Value>,
    },
}

impl WriteScope {
    /// Returns true if `row` falls inside the scope.
    #[must_use]
    pub fn contains(&self, row: &Row) -> bool {
        match self {
            Self::Keys { fields, keys } => {
                row_key(row, fields).is_some_and(|k| keys.contains(&k))
            }
            Self::Partition { field, values } => {
                row.get(field).is_some_and(|v| values.contains(v))
            }
        }
    }
}

/// Operations a warehouse must offer to the writer.
#[async_trait]
pub trait WarehouseBackend: Send + Sync {
    /// Creates `table` and loads `rows` into it.
    async fn create_staging(&self, table: &str, rows: &[Row]) -> Result<(), BackendError>;

    /// Upserts `staging` into `target` on `primary_key`; staged duplicates
    /// are resolved by the greatest `order_field`. Returns rows affected.
    async fn merge(
        &self,
        staging: &str,
        target: &str,
        primary_key: &[String],
        order_field: &str,
    ) -> Result<u64, BackendError>;

    /// Deletes every row of `table` inside `scope`. Returns rows removed.
    async fn delete_scope(&self, table: &str, scope: &WriteScope) -> Result<u64, BackendError>;

    /// Appends rows. Returns rows inserted.
    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64, BackendError>;

    /// Drops a table if it exists.
    async fn drop_table(&self, table: &str) -> Result<(), BackendError>;

    /// Counts rows of `table` inside `scope`.
    async fn count_rows(&self, table: &str, scope: &WriteScope) -> Result<u64, BackendError>;

    /// Returns up to `limit` rows of `table` inside `scope`.
    async fn sample_rows(
        &self,
        table: &str,
        scope: &WriteScope,
        limit: usize,
    ) -> Result<Vec<Row>, BackendError>;
}

/// Backend operation, used for failure injection and call logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarehouseOp {
    /// `create_staging`
    CreateStaging,
    /// `merge`
    Merge,
    /// `delete_scope`
    Delete,
    /// `insert`
    Insert,
    /// `drop_table`
    Drop,
    /// `count_rows`
    Count,
    /// `sample_rows`
    Sample,
}

#[derive(Debug, Default)]
struct WarehouseState {
    tables: HashMap<String, Vec<Row>>,
    failures: HashMap<WarehouseOp, VecDeque<BackendError>>,
    calls: Vec<WarehouseOp>,
}

impl WarehouseState {
    fn enter(&mut self, op: WarehouseOp) -> Result<(), BackendError> {
        self.calls.push(op);
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A warehouse held in memory, with scripted failures.
#[derive(Debug, Default)]
pub struct InMemoryWarehouse {
    state: Mutex<WarehouseState>,
}

impl InMemoryWarehouse {
    /// Creates an empty warehouse.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: WarehouseOp, error: BackendError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Returns a copy of a table's rows.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Replaces a table's rows.
    pub fn set_rows(&self, table: &str, rows: Vec<Row>) {
        self.state.lock().tables.insert(table.to_string(), rows);
    }

    /// Returns true if the table exists.
    #[must_use]
    pub fn table_exists(&self, table: &str) -> bool {
        self.state.lock().tables.contains_key(table)
    }

    /// Names of every table.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Operations called so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<WarehouseOp> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of `op`.
    #[must_use]
    pub fn call_count(&self, op: WarehouseOp) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == op).count()
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl WarehouseBackend for InMemoryWarehouse {
    async fn create_staging(&self, table: &str, rows: &[Row]) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter(WarehouseOp::CreateStaging)?;
        state.tables.insert(table.to_string(), rows.to_vec());
        Ok(())
    }

    async fn merge(
        &self,
        staging: &str,
        target: &str,
        primary_key: &[String],
        order_field: &str,
    ) -> Result<u64, BackendError> {
        let mut state = self.state.lock();
        state.enter(WarehouseOp::Merge)?;
        let staged = state
            .tables
            .get(staging)
            .cloned()
            .ok_or_else(|| BackendError::not_found(format!("staging table {staging}")))?;

        let mut newest: Vec<(String, Row)> = Vec::new();
        for row in staged {
            let Some(key) = row_key(&row, primary_key) else {
                continue;
            };
            match newest.iter_mut().find(|(k, _)| *k == key) {
                Some((_, existing)) => {
                    if compare_values(row.get(order_field), existing.get(order_field))
                        != Ordering::Less
                    {
                        *existing = row;
                    }
                }
                None => newest.push((key, row)),
            }
        }

        let rows = state.tables.entry(target.to_string()).or_default();
        let mut affected = 0;
        for (key, row) in newest {
            match rows
                .iter_mut()
                .find(|r| row_key(r, primary_key).as_deref() == Some(key.as_str()))
            {
                Some(existing) => *existing = row,
                None => rows.push(row),
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete_scope(&self, table: &str, scope: &WriteScope) -> Result<u64, BackendError> {
        let mut state = self.state.lock();
        state.enter(WarehouseOp::Delete)?;
        let rows = state.tables.entry(table.to_string()).or_default();
        let before = rows.len();
        rows.retain(|r| !scope.contains(r));
        Ok((before - rows.len()) as u64)
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64, BackendError> {
        let mut state = self.state.lock();
        state.enter(WarehouseOp::Insert)?;
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn drop_table(&self, table: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter(WarehouseOp::Drop)?;
        state.tables.remove(table);
        Ok(())
    }

    async fn count_rows(&self, table: &str, scope: &WriteScope) -> Result<u64, BackendError> {
        let mut state = self.state.lock();
        state.enter(WarehouseOp::Count)?;
        Ok(state
            .tables
            .get(table)
            .map_or(0, |rows| rows.iter().filter(|r| scope.contains(r)).count() as u64))
    }

    async fn sample_rows(
        &self,
        table: &str,
        scope: &WriteScope,
        limit: usize,
    ) -> Result<Vec<Row>, BackendError> {
        let mut state = self.state.lock();
        state.enter(WarehouseOp::Sample)?;
        Ok(state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| scope.contains(r))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_row_key() {
        let fields = vec!["id".to_string(), "date".to_string()];
        assert!(row_key(&row(json!({"id": 1, "date": "2025-01-01"})), &fields).is_some());
        assert!(row_key(&row(json!({"id": 1})), &fields).is_none());
        assert!(row_key(&row(json!({"id": null, "date": "x"})), &fields).is_none());
    }

    #[tokio::test]
    async fn test_merge_newest_staged_wins() {
        let warehouse = InMemoryWarehouse::new();
        let pk = vec!["id".to_string()];
        warehouse
            .create_staging(
                "stg",
                &[
                    row(json!({"id": 1, "v": "new", "processed_at": "2025-01-02T00:00:00Z"})),
                    row(json!({"id": 1, "v": "old", "processed_at": "2025-01-01T00:00:00Z"})),
                ],
            )
            .await
            .unwrap();

        let affected = warehouse.merge("stg", "target", &pk, "processed_at").await.unwrap();
        assert_eq!(affected, 1);
        let rows = warehouse.rows("target");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["v"], json!("new"));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.fail_next(WarehouseOp::Insert, BackendError::transient("flaky"));
        assert!(warehouse.insert("t", &[]).await.is_err());
        assert!(warehouse.insert("t", &[]).await.is_ok());
        assert_eq!(warehouse.call_count(WarehouseOp::Insert), 2);
    }
}
