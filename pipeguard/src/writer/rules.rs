//! Row-level validation applied before a write.

use super::backend::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A row excluded from a write and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedRow {
    /// Rule that rejected the row.
    pub rule: String,
    /// What was wrong.
    pub reason: String,
    /// The rejected row.
    pub row: Row,
}

/// A check every row must pass to be written.
pub trait ValidationRule: Send + Sync + fmt::Debug {
    /// Rule name, reported with blocked rows.
    fn name(&self) -> &str;

    /// Returns the reason the row is invalid, if it is.
    fn check(&self, row: &Row) -> Result<(), String>;
}

/// Returns true for null, missing, or blank-string values.
#[must_use]
pub fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Rejects rows with an empty value in any of the fields.
#[derive(Debug, Clone)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    /// Creates the rule.
    #[must_use]
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// The required fields.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

impl ValidationRule for RequiredFields {
    fn name(&self) -> &str {
        "required_fields"
    }

    fn check(&self, row: &Row) -> Result<(), String> {
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| is_empty_value(row.get(f.as_str())))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required fields: {}", missing.join(", ")))
        }
    }
}

/// Rejects rows where `field` is zero although `when_positive` is above zero.
///
/// Catches aggregates that were written before their inputs landed, e.g.
/// zero points for a player with positive minutes.
#[derive(Debug, Clone)]
pub struct NonZeroWhen {
    field: String,
    when_positive: String,
}

impl NonZeroWhen {
    /// Creates the rule.
    #[must_use]
    pub fn new(field: impl Into<String>, when_positive: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            when_positive: when_positive.into(),
        }
    }
}

impl ValidationRule for NonZeroWhen {
    fn name(&self) -> &str {
        "non_zero_when"
    }

    fn check(&self, row: &Row) -> Result<(), String> {
        let driver = row.get(&self.when_positive).and_then(Value::as_f64);
        let value = row.get(&self.field).and_then(Value::as_f64);
        match (driver, value) {
            (Some(d), Some(v)) if d > 0.0 && v == 0.0 => Err(format!(
                "{} is 0 while {} is {}",
                self.field, self.when_positive, d
            )),
            _ => Ok(()),
        }
    }
}

/// Partitions rows into valid ones and blocked ones.
#[must_use]
pub fn apply_rules(rules: &[Arc<dyn ValidationRule>], rows: Vec<Row>) -> (Vec<Row>, Vec<BlockedRow>) {
    let mut valid = Vec::with_capacity(rows.len());
    let mut blocked = Vec::new();
    'rows: for row in rows {
        for rule in rules {
            if let Err(reason) = rule.check(&row) {
                blocked.push(BlockedRow {
                    rule: rule.name().to_string(),
                    reason,
                    row,
                });
                continue 'rows;
            }
        }
        valid.push(row);
    }
    (valid, blocked)
}
