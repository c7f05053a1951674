//! Additional typed columns.
//!
//! キュー作成時に `ColumnSchema` を宣言し、enqueue 時に `AdditionalColumns` を
//! スキーマに対して検証する。SQLite では実カラム（`col_<name>`）として保存される。

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Text,
    Boolean,
    Real,
}

impl ColumnType {
    /// SQL storage class used when the column is materialized.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Text => "TEXT",
            ColumnType::Real => "REAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    Integer(i64),
    Text(String),
    Boolean(bool),
    Real(f64),
}

impl ColumnValue {
    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnValue::Integer(_) => ColumnType::Integer,
            ColumnValue::Text(_) => ColumnType::Text,
            ColumnValue::Boolean(_) => ColumnType::Boolean,
            ColumnValue::Real(_) => ColumnType::Real,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Columns declared when the queue is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnSchema {
    columns: Vec<ColumnDefinition>,
}

impl ColumnSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, definition: ColumnDefinition) -> Self {
        self.columns.push(definition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.iter()
    }

    pub fn get(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names end up inside generated SQL, so only plain identifiers pass.
    pub fn validate_definitions(&self) -> Result<()> {
        for (i, column) in self.columns.iter().enumerate() {
            if !is_identifier(&column.name) {
                return Err(QueueError::configuration(format!(
                    "column name `{}` is not a valid identifier",
                    column.name
                )));
            }
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(QueueError::configuration(format!(
                    "column `{}` declared twice",
                    column.name
                )));
            }
        }
        Ok(())
    }

    /// Check caller-supplied values against the declared schema.
    pub fn validate(&self, values: &AdditionalColumns) -> Result<()> {
        for (name, value) in values.iter() {
            let Some(definition) = self.get(name) else {
                return Err(QueueError::configuration(format!(
                    "unknown additional column `{name}`"
                )));
            };
            if definition.column_type != value.column_type() {
                return Err(QueueError::configuration(format!(
                    "column `{name}` expects {:?}, got {:?}",
                    definition.column_type,
                    value.column_type()
                )));
            }
        }
        for definition in self.columns.iter().filter(|c| !c.nullable) {
            if values.get(&definition.name).is_none() {
                return Err(QueueError::configuration(format!(
                    "column `{}` is required",
                    definition.name
                )));
            }
        }
        Ok(())
    }
}

/// Typed key/value pairs attached to one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdditionalColumns {
    values: Vec<(String, ColumnValue)>,
}

impl AdditionalColumns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value.
    pub fn set(&mut self, name: impl Into<String>, value: ColumnValue) {
        let name = name.into();
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: ColumnValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn schema() -> ColumnSchema {
        ColumnSchema::new()
            .with(ColumnDefinition::new("tenant", ColumnType::Text).required())
            .with(ColumnDefinition::new("weight", ColumnType::Real))
    }

    #[test]
    fn accepts_matching_values() {
        let values = AdditionalColumns::new()
            .with("tenant", ColumnValue::Text("acme".into()))
            .with("weight", ColumnValue::Real(0.5));
        schema().validate(&values).unwrap();
    }

    #[test]
    fn rejects_type_mismatch() {
        let values = AdditionalColumns::new()
            .with("tenant", ColumnValue::Text("acme".into()))
            .with("weight", ColumnValue::Integer(1));
        let err = schema().validate(&values).unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));
    }

    #[test]
    fn rejects_unknown_and_missing_columns() {
        let unknown = AdditionalColumns::new()
            .with("tenant", ColumnValue::Text("acme".into()))
            .with("color", ColumnValue::Text("red".into()));
        assert!(schema().validate(&unknown).is_err());

        let missing = AdditionalColumns::new().with("weight", ColumnValue::Real(1.0));
        assert!(schema().validate(&missing).is_err());
    }

    #[test]
    fn set_replaces_existing_value() {
        let mut values = AdditionalColumns::new().with("a", ColumnValue::Integer(1));
        values.set("a", ColumnValue::Integer(2));
        assert_eq!(values.len(), 1);
        assert_eq!(values.get("a"), Some(&ColumnValue::Integer(2)));
    }

    #[rstest]
    #[case("tenant", true)]
    #[case("_private", true)]
    #[case("col_2", true)]
    #[case("2col", false)]
    #[case("drop table", false)]
    #[case("", false)]
    fn identifier_rules(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_identifier(name), expected);
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let schema = ColumnSchema::new()
            .with(ColumnDefinition::new("a", ColumnType::Integer))
            .with(ColumnDefinition::new("a", ColumnType::Text));
        assert!(schema.validate_definitions().is_err());
    }

    #[test]
    fn values_serialize_with_type_tag() {
        let json = serde_json::to_value(ColumnValue::Boolean(true)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "boolean", "value": true}));
    }
}
