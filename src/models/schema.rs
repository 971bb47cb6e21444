//! Schema-related data models.
//!
//! Snapshots are read-only reflections of what exists in the database.
//! Definitions describe what the caller wants to exist.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A table as seen by the schema cache: the caller's logical key plus the
/// physical table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub key: String,
    pub name: String,
}

impl TableRef {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
        }
    }

    /// A table whose logical key is its own name.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: name.clone(),
            name,
        }
    }

    /// Lower-cased (key, name) pair used by caches.
    pub fn cache_key(&self) -> (String, String) {
        (self.key.to_lowercase(), self.name.to_lowercase())
    }
}

/// Anything stored in a [`NamedSet`].
pub trait Named {
    fn name(&self) -> &str;
}

/// Ordered collection with case-insensitive lookup by name.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedSet<T> {
    items: Vec<T>,
    by_name: HashMap<String, usize>,
}

impl<T: Named> NamedSet<T> {
    pub fn new(items: Vec<T>) -> Self {
        let by_name = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.name().to_lowercase(), i))
            .collect();
        Self { items, by_name }
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.by_name
            .get(&name.to_lowercase())
            .and_then(|&i| self.items.get(i))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(&name.to_lowercase())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Named> Default for NamedSet<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<'a, T> IntoIterator for &'a NamedSet<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Whether a name carries the reserved hand-authored prefix.
pub fn is_custom_name(name: &str, prefix: &str) -> bool {
    name.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSnapshot {
    pub name: String,
    pub column_id: i32,
    /// Catalog type name, e.g. `nvarchar`
    pub data_type: String,
    /// Characters for string types, bytes otherwise; `-1` means `MAX`
    pub max_length: Option<i32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub is_nullable: bool,
    pub is_identity: bool,
    pub is_computed: bool,
    pub default_definition: Option<String>,
    pub default_constraint: Option<String>,
    pub collation: Option<String>,
    pub is_custom: bool,
}

impl ColumnSnapshot {
    /// Full type as written in DDL, e.g. `nvarchar(200)` or `decimal(18,4)`.
    pub fn type_definition(&self) -> String {
        let base = self.data_type.to_lowercase();
        match base.as_str() {
            "varchar" | "nvarchar" | "char" | "nchar" | "varbinary" | "binary" => {
                match self.max_length {
                    Some(-1) => format!("{}(max)", base),
                    Some(len) => format!("{}({})", base, len),
                    None => base,
                }
            }
            "decimal" | "numeric" => format!(
                "{}({},{})",
                base,
                self.precision.unwrap_or(18),
                self.scale.unwrap_or(0)
            ),
            "datetime2" | "time" | "datetimeoffset" => match self.scale {
                Some(scale) if scale != 7 => format!("{}({})", base, scale),
                _ => base,
            },
            _ => base,
        }
    }
}

impl Named for ColumnSnapshot {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Physical kind of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Clustered,
    NonClustered,
    FullText,
    Other,
}

impl IndexKind {
    /// Map `sys.indexes.type`.
    pub fn from_catalog(type_code: i64) -> Self {
        match type_code {
            1 => Self::Clustered,
            2 => Self::NonClustered,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumnSnapshot {
    pub column_name: String,
    pub key_ordinal: i32,
    pub is_descending: bool,
    pub is_included: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub name: String,
    pub index_id: i32,
    pub kind: IndexKind,
    pub is_primary_key: bool,
    pub is_unique: bool,
    pub is_unique_constraint: bool,
    pub filter_definition: Option<String>,
    /// Key columns in key order, followed by included columns
    pub columns: Vec<IndexColumnSnapshot>,
    pub is_custom: bool,
}

impl IndexSnapshot {
    /// Indexes that can only be removed with `ALTER TABLE ... DROP CONSTRAINT`.
    pub fn is_constraint(&self) -> bool {
        self.is_primary_key || self.is_unique_constraint
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &IndexColumnSnapshot> {
        self.columns.iter().filter(|c| !c.is_included)
    }

    pub fn included_columns(&self) -> impl Iterator<Item = &IndexColumnSnapshot> {
        self.columns.iter().filter(|c| c.is_included)
    }

    pub fn references_column(&self, column: &str) -> bool {
        self.columns
            .iter()
            .any(|c| c.column_name.eq_ignore_ascii_case(column))
    }
}

impl Named for IndexSnapshot {
    fn name(&self) -> &str {
        &self.name
    }
}

/// DML events a trigger fires on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvents {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

impl TriggerEvents {
    pub const INSERT: Self = Self {
        insert: true,
        update: false,
        delete: false,
    };
    pub const UPDATE: Self = Self {
        insert: false,
        update: true,
        delete: false,
    };
    pub const DELETE: Self = Self {
        insert: false,
        update: false,
        delete: true,
    };

    pub fn union(self, other: Self) -> Self {
        Self {
            insert: self.insert || other.insert,
            update: self.update || other.update,
            delete: self.delete || other.delete,
        }
    }

    /// Map `sys.trigger_events.type_desc`.
    pub fn from_type_desc(desc: &str) -> Self {
        match desc.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Self::INSERT,
            "UPDATE" => Self::UPDATE,
            "DELETE" => Self::DELETE,
            _ => Self::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.insert || self.update || self.delete)
    }

    /// `INSERT, UPDATE` style list for `AFTER` clauses.
    pub fn to_sql(&self) -> String {
        let mut parts = Vec::new();
        if self.insert {
            parts.push("INSERT");
        }
        if self.update {
            parts.push("UPDATE");
        }
        if self.delete {
            parts.push("DELETE");
        }
        parts.join(", ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSnapshot {
    pub name: String,
    pub is_disabled: bool,
    pub is_instead_of: bool,
    pub events: TriggerEvents,
    pub definition: Option<String>,
    pub is_custom: bool,
}

impl Named for TriggerSnapshot {
    fn name(&self) -> &str {
        &self.name
    }
}

pub type ColumnSet = NamedSet<ColumnSnapshot>;
pub type IndexSet = NamedSet<IndexSnapshot>;
pub type TriggerSet = NamedSet<TriggerSnapshot>;

/// Structure of one existing table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSnapshot {
    pub table: TableRef,
    pub exists: bool,
    pub columns: Arc<ColumnSet>,
    pub indexes: Arc<IndexSet>,
    pub triggers: Arc<TriggerSet>,
}

impl TableSnapshot {
    /// Snapshot of a table that does not exist.
    pub fn missing(table: TableRef) -> Self {
        Self {
            table,
            exists: false,
            columns: Arc::default(),
            indexes: Arc::default(),
            triggers: Arc::default(),
        }
    }

    pub fn identity_column(&self) -> Option<&ColumnSnapshot> {
        self.columns.iter().find(|c| c.is_identity)
    }

    pub fn primary_key(&self) -> Option<&IndexSnapshot> {
        self.indexes.iter().find(|i| i.is_primary_key)
    }

    /// Indexes that reference `column` as a key or included column.
    pub fn dependent_indexes(&self, column: &str) -> Vec<&IndexSnapshot> {
        self.indexes
            .iter()
            .filter(|i| i.references_column(column))
            .collect()
    }
}

/// Declared column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    /// Full type, e.g. `nvarchar(200)`
    pub data_type: String,
    pub nullable: bool,
    pub identity: bool,
    /// Default expression, e.g. `(getutcdate())`
    pub default: Option<String>,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
            identity: false,
            default: None,
        }
    }

    pub fn identity(mut self) -> Self {
        self.identity = true;
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumnDefinition {
    pub name: String,
    pub descending: bool,
}

/// Declared index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<IndexColumnDefinition>,
    pub included: Vec<String>,
    pub unique: bool,
    pub clustered: bool,
    pub primary_key: bool,
    pub full_text: bool,
    pub filter: Option<String>,
}

impl IndexDefinition {
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns
                .into_iter()
                .map(|c| IndexColumnDefinition {
                    name: c.into(),
                    descending: false,
                })
                .collect(),
            included: Vec::new(),
            unique: false,
            clustered: false,
            primary_key: false,
            full_text: false,
            filter: None,
        }
    }

    pub fn primary_key<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut def = Self::new(name, columns);
        def.primary_key = true;
        def.unique = true;
        def.clustered = true;
        def
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn include<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.included = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn references_column(&self, column: &str) -> bool {
        self.columns
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(column))
            || self.included.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

/// Declared `AFTER` trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub name: String,
    pub events: TriggerEvents,
    /// Statements following `AS`
    pub body: String,
}

/// Declared table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub indexes: Vec<IndexDefinition>,
    pub triggers: Vec<TriggerDefinition>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            triggers: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn trigger(mut self, trigger: TriggerDefinition) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexDefinition> {
        self.indexes
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
    }

    pub fn find_trigger(&self, name: &str) -> Option<&TriggerDefinition> {
        self.triggers
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, data_type: &str, max_length: Option<i32>) -> ColumnSnapshot {
        ColumnSnapshot {
            name: name.to_string(),
            column_id: 1,
            data_type: data_type.to_string(),
            max_length,
            precision: None,
            scale: None,
            is_nullable: true,
            is_identity: false,
            is_computed: false,
            default_definition: None,
            default_constraint: None,
            collation: None,
            is_custom: false,
        }
    }

    #[test]
    fn test_named_set_lookup_is_case_insensitive() {
        let set = NamedSet::new(vec![column("FileName", "nvarchar", Some(200))]);
        assert!(set.contains("filename"));
        assert_eq!(set.get("FILENAME").unwrap().name, "FileName");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_type_definition() {
        assert_eq!(
            column("a", "NVARCHAR", Some(-1)).type_definition(),
            "nvarchar(max)"
        );
        assert_eq!(
            column("a", "varchar", Some(50)).type_definition(),
            "varchar(50)"
        );
        let mut dec = column("a", "decimal", None);
        dec.precision = Some(18);
        dec.scale = Some(4);
        assert_eq!(dec.type_definition(), "decimal(18,4)");
        assert_eq!(column("a", "int", Some(4)).type_definition(), "int");
    }

    #[test]
    fn test_custom_prefix_detection() {
        assert!(is_custom_name("custom_IX_Files", "custom_"));
        assert!(is_custom_name("CUSTOM_trg", "custom_"));
        assert!(!is_custom_name("IX_custom", "custom_"));
        assert!(!is_custom_name("cu", "custom_"));
    }

    #[test]
    fn test_trigger_events() {
        let events = TriggerEvents::INSERT.union(TriggerEvents::DELETE);
        assert_eq!(events.to_sql(), "INSERT, DELETE");
        assert_eq!(TriggerEvents::from_type_desc("update"), TriggerEvents::UPDATE);
        assert!(TriggerEvents::default().is_empty());
    }

    #[test]
    fn test_derived_views() {
        let mut id = column("Id", "int", Some(4));
        id.is_identity = true;
        let name = column("Name", "nvarchar", Some(100));
        let pk = IndexSnapshot {
            name: "PK_Files".into(),
            index_id: 1,
            kind: IndexKind::Clustered,
            is_primary_key: true,
            is_unique: true,
            is_unique_constraint: false,
            filter_definition: None,
            columns: vec![IndexColumnSnapshot {
                column_name: "Id".into(),
                key_ordinal: 1,
                is_descending: false,
                is_included: false,
            }],
            is_custom: false,
        };
        let ix = IndexSnapshot {
            name: "IX_Files_Name".into(),
            index_id: 2,
            kind: IndexKind::NonClustered,
            is_primary_key: false,
            is_unique: false,
            is_unique_constraint: false,
            filter_definition: None,
            columns: vec![IndexColumnSnapshot {
                column_name: "Name".into(),
                key_ordinal: 0,
                is_descending: false,
                is_included: true,
            }],
            is_custom: false,
        };
        let snapshot = TableSnapshot {
            table: TableRef::named("Files"),
            exists: true,
            columns: Arc::new(NamedSet::new(vec![id, name])),
            indexes: Arc::new(NamedSet::new(vec![pk, ix])),
            triggers: Arc::default(),
        };
        assert_eq!(snapshot.identity_column().unwrap().name, "Id");
        assert_eq!(snapshot.primary_key().unwrap().name, "PK_Files");
        let deps = snapshot.dependent_indexes("name");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].name, "IX_Files_Name");
        assert_eq!(deps[0].included_columns().count(), 1);
    }
}
