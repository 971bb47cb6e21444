//! Command-related data models.
//!
//! This module defines the parameter, command and result types that flow
//! between the executor and the driver.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A scalar value sent to or read from the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// NULL value
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
    Guid(Uuid),
}

impl SqlValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this value for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::DateTime(_) => "datetime",
            Self::Guid(_) => "guid",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(v) => Some(i64::from(*v)),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        Self::Guid(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Declared T-SQL type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    Bit,
    Int,
    BigInt,
    Float,
    Decimal { precision: u8, scale: u8 },
    /// `None` means `NVARCHAR(MAX)`
    NVarChar(Option<u16>),
    /// `None` means `VARBINARY(MAX)`
    VarBinary(Option<u16>),
    DateTime2,
    UniqueIdentifier,
}

impl SqlType {
    /// Render the type as it appears in a `DECLARE` statement.
    pub fn declaration(&self) -> String {
        match self {
            Self::Bit => "BIT".to_string(),
            Self::Int => "INT".to_string(),
            Self::BigInt => "BIGINT".to_string(),
            Self::Float => "FLOAT".to_string(),
            Self::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            Self::NVarChar(Some(len)) => format!("NVARCHAR({})", len),
            Self::NVarChar(None) => "NVARCHAR(MAX)".to_string(),
            Self::VarBinary(Some(len)) => format!("VARBINARY({})", len),
            Self::VarBinary(None) => "VARBINARY(MAX)".to_string(),
            Self::DateTime2 => "DATETIME2".to_string(),
            Self::UniqueIdentifier => "UNIQUEIDENTIFIER".to_string(),
        }
    }

    /// Infer a reasonable declared type from a value.
    pub fn infer(value: &SqlValue) -> Self {
        match value {
            SqlValue::Bool(_) => Self::Bit,
            SqlValue::Int(_) => Self::BigInt,
            SqlValue::Float(_) => Self::Float,
            SqlValue::Bytes(_) => Self::VarBinary(None),
            SqlValue::DateTime(_) => Self::DateTime2,
            SqlValue::Guid(_) => Self::UniqueIdentifier,
            SqlValue::Null | SqlValue::String(_) => Self::NVarChar(None),
        }
    }
}

/// Direction of a command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
}

impl ParameterDirection {
    /// Whether the database writes a value back into this parameter.
    pub fn returns_value(&self) -> bool {
        matches!(self, Self::Output | Self::InputOutput)
    }

    /// Whether the caller-supplied value is sent to the database.
    pub fn sends_value(&self) -> bool {
        matches!(self, Self::Input | Self::InputOutput)
    }
}

/// A named command parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlParameter {
    /// Name without the leading `@`
    pub name: String,
    pub sql_type: SqlType,
    pub direction: ParameterDirection,
    pub value: SqlValue,
}

impl SqlParameter {
    /// Create an input parameter, inferring its declared type from the value.
    pub fn input(name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        let value = value.into();
        Self {
            name: normalize_parameter_name(name.into()),
            sql_type: SqlType::infer(&value),
            direction: ParameterDirection::Input,
            value,
        }
    }

    /// Create an output parameter of the given type.
    pub fn output(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: normalize_parameter_name(name.into()),
            sql_type,
            direction: ParameterDirection::Output,
            value: SqlValue::Null,
        }
    }

    /// Create an input/output parameter.
    pub fn input_output(
        name: impl Into<String>,
        sql_type: SqlType,
        value: impl Into<SqlValue>,
    ) -> Self {
        Self {
            name: normalize_parameter_name(name.into()),
            sql_type,
            direction: ParameterDirection::InputOutput,
            value: value.into(),
        }
    }

    /// Override the declared type.
    pub fn with_type(mut self, sql_type: SqlType) -> Self {
        self.sql_type = sql_type;
        self
    }

    /// Copy of this parameter for a fresh execution attempt.
    ///
    /// Input and input/output parameters keep name, type and value. Output
    /// parameters keep name and type only; their previous value belongs to
    /// the failed attempt and is repopulated by the new execution.
    pub fn for_retry(&self) -> Self {
        let value = if self.direction.sends_value() {
            self.value.clone()
        } else {
            SqlValue::Null
        };
        Self {
            name: self.name.clone(),
            sql_type: self.sql_type,
            direction: self.direction,
            value,
        }
    }

    /// The parameter as referenced in T-SQL text.
    pub fn placeholder(&self) -> String {
        format!("@{}", self.name)
    }
}

fn normalize_parameter_name(name: String) -> String {
    match name.strip_prefix('@') {
        Some(stripped) => stripped.to_string(),
        None => name,
    }
}

/// Clone a parameter list for a retry attempt.
pub fn clone_parameters_for_retry(params: &[SqlParameter]) -> Vec<SqlParameter> {
    params.iter().map(SqlParameter::for_retry).collect()
}

/// How the driver dispatches a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Ad hoc batch text
    Text,
    /// `text` is a routine name dispatched natively
    StoredProcedure,
}

/// A prepared command handed to the driver.
#[derive(Debug, Clone)]
pub struct Command {
    pub text: String,
    pub kind: CommandKind,
    pub params: Vec<SqlParameter>,
    pub timeout: Duration,
}

impl Command {
    pub fn text(text: impl Into<String>, params: Vec<SqlParameter>, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            kind: CommandKind::Text,
            params,
            timeout,
        }
    }

    pub fn procedure(
        name: impl Into<String>,
        params: Vec<SqlParameter>,
        timeout: Duration,
    ) -> Self {
        Self {
            text: name.into(),
            kind: CommandKind::StoredProcedure,
            params,
            timeout,
        }
    }
}

/// One row of a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl DataRow {
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at a column position.
    pub fn get_index(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Value of a column, matched case-insensitively.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(SqlValue::as_str)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(SqlValue::as_bool)
    }
}

/// A result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub rows: Vec<DataRow>,
}

impl DataTable {
    /// Build a table from column names and row values.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        let shared: Arc<[String]> = columns.clone().into();
        Self {
            columns,
            rows: rows
                .into_iter()
                .map(|values| DataRow::new(Arc::clone(&shared), values))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&DataRow> {
        self.rows.first()
    }
}

/// Everything a single command execution produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub result_sets: Vec<DataTable>,
    /// Rows affected by the last statement of the batch
    pub rows_affected: u64,
    /// Output and input/output parameter values, keyed by lower-cased name
    pub output_values: HashMap<String, SqlValue>,
}

impl CommandOutput {
    /// First result set, or an empty table.
    pub fn first_table(&self) -> DataTable {
        self.result_sets.first().cloned().unwrap_or_default()
    }

    /// Value written back into an output parameter.
    pub fn output(&self, name: &str) -> Option<&SqlValue> {
        let key = normalize_parameter_name(name.to_string()).to_lowercase();
        self.output_values.get(&key)
    }

    /// Copy output values into the caller's parameters.
    pub fn apply_outputs(&self, params: &mut [SqlParameter]) {
        for param in params.iter_mut().filter(|p| p.direction.returns_value()) {
            if let Some(value) = self.output_values.get(&param.name.to_lowercase()) {
                param.value = value.clone();
            }
        }
    }
}
