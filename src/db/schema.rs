//! Schema reflection cache.
//!
//! [`SchemaCache`] answers "what does table X look like right now?" from
//! SQL Server catalog views and keeps the answer for the life of the cache.
//! Columns, indexes (with their columns) and triggers (with their events)
//! are cached separately per `(table key, table name)` pair and invalidated
//! explicitly with the `reset_*` methods.
//!
//! # Extraction modes
//!
//! - Per table (default): one catalog query per table and kind.
//! - Bulk, inside [`SchemaCache::run_summary_tables_metadata_context`]: one
//!   query per kind for the whole database, grouped by table. Each pair is
//!   served from the bulk result at most once per kind; after a reset it is
//!   queried individually. Tables recorded with
//!   [`SchemaCache::add_renamed_table`] are never served from bulk results.
//!
//! SQL queries live in the `queries` submodule. The cache belongs to one
//! session and is not `Send`.

use crate::config::DEFAULT_CUSTOM_PREFIX;
use crate::db::ambient::AmbientContext;
use crate::db::executor::CommandExecutor;
use crate::db::flags::{SUMMARY_METADATA_FLAG, ScopedFlags};
use crate::error::DbResult;
use crate::models::{
    ColumnSet, ColumnSnapshot, DataRow, DataTable, IndexColumnSnapshot, IndexKind, IndexSet,
    IndexSnapshot, Named, NamedSet, SqlParameter, SqlType, SqlValue, TableRef, TableSnapshot,
    TriggerEvents, TriggerSet, TriggerSnapshot, is_custom_name, split_object_name,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

type CacheKey = (String, String);

/// Normalized `schema.table` used to match catalog rows to a table name.
pub(crate) fn table_lookup_key(name: &str) -> String {
    let (schema, table) = split_object_name(name);
    format!("{}.{}", schema, table).to_lowercase()
}

struct KindCache<T> {
    tables: HashMap<CacheKey, Arc<NamedSet<T>>>,
    /// Whole-database rows grouped by [`table_lookup_key`]
    bulk: Option<HashMap<String, Vec<DataRow>>>,
    /// Pairs already served from `bulk`
    extracted: HashSet<CacheKey>,
}

impl<T> Default for KindCache<T> {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
            bulk: None,
            extracted: HashSet::new(),
        }
    }
}

impl<T> KindCache<T> {
    fn end_bulk_session(&mut self) {
        self.bulk = None;
        self.extracted.clear();
    }

    fn reset(&mut self, key: &CacheKey) {
        self.tables.remove(key);
    }

    fn reset_name(&mut self, lookup: &str) {
        self.tables
            .retain(|(_, name), _| table_lookup_key(name) != lookup);
    }
}

#[derive(Default)]
struct Caches {
    columns: KindCache<ColumnSnapshot>,
    indexes: KindCache<IndexSnapshot>,
    triggers: KindCache<TriggerSnapshot>,
    /// Lookup keys of tables renamed during the current bulk session
    renamed: HashSet<String>,
    /// `schema.table` names seen by the bulk column query
    bulk_tables: Option<Vec<String>>,
}

/// A catalog object kind the cache knows how to query and parse.
trait CatalogObject: Named + Sized {
    const KIND: &'static str;
    const QUERY: &'static str;

    fn cache(caches: &mut Caches) -> &mut KindCache<Self>;

    fn parse(rows: &[DataRow], custom_prefix: &str) -> Vec<Self>;
}

impl CatalogObject for ColumnSnapshot {
    const KIND: &'static str = "columns";
    const QUERY: &'static str = queries::COLUMNS;

    fn cache(caches: &mut Caches) -> &mut KindCache<Self> {
        &mut caches.columns
    }

    fn parse(rows: &[DataRow], custom_prefix: &str) -> Vec<Self> {
        parse_columns(rows, custom_prefix)
    }
}

impl CatalogObject for IndexSnapshot {
    const KIND: &'static str = "indexes";
    const QUERY: &'static str = queries::INDEXES;

    fn cache(caches: &mut Caches) -> &mut KindCache<Self> {
        &mut caches.indexes
    }

    fn parse(rows: &[DataRow], custom_prefix: &str) -> Vec<Self> {
        parse_indexes(rows, custom_prefix)
    }
}

impl CatalogObject for TriggerSnapshot {
    const KIND: &'static str = "triggers";
    const QUERY: &'static str = queries::TRIGGERS;

    fn cache(caches: &mut Caches) -> &mut KindCache<Self> {
        &mut caches.triggers
    }

    fn parse(rows: &[DataRow], custom_prefix: &str) -> Vec<Self> {
        parse_triggers(rows, custom_prefix)
    }
}

/// Read-through cache of table structure for one database.
pub struct SchemaCache {
    executor: CommandExecutor,
    context: AmbientContext,
    flags: ScopedFlags,
    custom_prefix: String,
    caches: Caches,
}

impl SchemaCache {
    /// Create a cache whose catalog queries run through `executor` in `context`.
    pub fn new(executor: CommandExecutor, context: AmbientContext) -> Self {
        Self {
            executor,
            context,
            flags: ScopedFlags::new(),
            custom_prefix: DEFAULT_CUSTOM_PREFIX.to_string(),
            caches: Caches::default(),
        }
    }

    /// Override the prefix marking hand-authored objects.
    pub fn with_custom_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.custom_prefix = prefix.into();
        self
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn context(&self) -> &AmbientContext {
        &self.context
    }

    pub fn custom_prefix(&self) -> &str {
        &self.custom_prefix
    }

    /// Whether bulk extraction is active.
    pub fn is_bulk(&self) -> bool {
        self.flags.is(SUMMARY_METADATA_FLAG)
    }

    /// Run `body` with whole-database extraction enabled.
    ///
    /// Contexts nest; bulk results and the renamed-table list are discarded
    /// when the outermost one ends.
    pub async fn run_summary_tables_metadata_context<R>(
        &mut self,
        body: impl AsyncFnOnce(&mut Self) -> R,
    ) -> R {
        let guard = self.flags.begin(SUMMARY_METADATA_FLAG);
        let result = body(self).await;
        drop(guard);

        if !self.is_bulk() {
            self.end_bulk_session();
        }
        result
    }

    fn end_bulk_session(&mut self) {
        self.caches.columns.end_bulk_session();
        self.caches.indexes.end_bulk_session();
        self.caches.triggers.end_bulk_session();
        self.caches.renamed.clear();
        self.caches.bulk_tables = None;
        debug!(
            connection = %self.executor.identity().display_name(),
            "Summary metadata context ended"
        );
    }

    /// Names (`schema.table`) of every user table. Only legal in bulk mode.
    pub async fn bulk_tables(&mut self) -> DbResult<Vec<String>> {
        self.flags.check(SUMMARY_METADATA_FLAG)?;
        if self.caches.bulk_tables.is_none() {
            self.load_bulk::<ColumnSnapshot>().await?;
        }
        Ok(self.caches.bulk_tables.clone().unwrap_or_default())
    }

    /// Record that `name` was renamed (as source or target) during this
    /// synchronization run. Its snapshots are dropped and it is never served
    /// from bulk results again in the current bulk session.
    pub fn add_renamed_table(&mut self, name: &str) {
        let lookup = table_lookup_key(name);
        self.caches.columns.reset_name(&lookup);
        self.caches.indexes.reset_name(&lookup);
        self.caches.triggers.reset_name(&lookup);
        debug!(table = %lookup, "Recorded renamed table");
        self.caches.renamed.insert(lookup);
    }

    pub fn is_renamed(&self, name: &str) -> bool {
        self.caches.renamed.contains(&table_lookup_key(name))
    }

    /// Columns keyed by lower-cased name.
    pub async fn columns(&mut self, table: &TableRef) -> DbResult<Arc<ColumnSet>> {
        self.lookup::<ColumnSnapshot>(table).await
    }

    /// Indexes keyed by lower-cased name, each with its ordered columns.
    pub async fn indexes(&mut self, table: &TableRef) -> DbResult<Arc<IndexSet>> {
        self.lookup::<IndexSnapshot>(table).await
    }

    /// Triggers keyed by lower-cased name, each with its events.
    pub async fn triggers(&mut self, table: &TableRef) -> DbResult<Arc<TriggerSet>> {
        self.lookup::<TriggerSnapshot>(table).await
    }

    /// A table exists when the catalog reports at least one column for it.
    pub async fn table_exists(&mut self, table: &TableRef) -> DbResult<bool> {
        Ok(!self.columns(table).await?.is_empty())
    }

    /// Columns, indexes and triggers of `table` in one value.
    pub async fn snapshot(&mut self, table: &TableRef) -> DbResult<TableSnapshot> {
        let columns = self.columns(table).await?;
        if columns.is_empty() {
            return Ok(TableSnapshot::missing(table.clone()));
        }
        let indexes = self.indexes(table).await?;
        let triggers = self.triggers(table).await?;
        Ok(TableSnapshot {
            table: table.clone(),
            exists: true,
            columns,
            indexes,
            triggers,
        })
    }

    pub fn reset_columns(&mut self, table: &TableRef) {
        self.caches.columns.reset(&table.cache_key());
    }

    pub fn reset_indexes(&mut self, table: &TableRef) {
        self.caches.indexes.reset(&table.cache_key());
    }

    pub fn reset_triggers(&mut self, table: &TableRef) {
        self.caches.triggers.reset(&table.cache_key());
    }

    /// Forget everything cached about `table`.
    pub fn reset_table(&mut self, table: &TableRef) {
        self.reset_columns(table);
        self.reset_indexes(table);
        self.reset_triggers(table);
    }

    async fn lookup<T: CatalogObject>(&mut self, table: &TableRef) -> DbResult<Arc<NamedSet<T>>> {
        let key = table.cache_key();
        if let Some(hit) = T::cache(&mut self.caches).tables.get(&key) {
            return Ok(Arc::clone(hit));
        }

        let lookup = table_lookup_key(&table.name);
        let from_bulk = self.is_bulk()
            && !self.caches.renamed.contains(&lookup)
            && !T::cache(&mut self.caches).extracted.contains(&key);

        let items = if from_bulk {
            if T::cache(&mut self.caches).bulk.is_none() {
                self.load_bulk::<T>().await?;
            }
            let cache = T::cache(&mut self.caches);
            cache.extracted.insert(key.clone());
            let rows = cache
                .bulk
                .as_ref()
                .and_then(|bulk| bulk.get(&lookup))
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            T::parse(rows, &self.custom_prefix)
        } else {
            debug!(
                connection = %self.executor.identity().display_name(),
                table = %table.name,
                kind = T::KIND,
                "Querying table metadata"
            );
            let data = self.query(T::QUERY, Some(&table.name)).await?;
            T::parse(&data.rows, &self.custom_prefix)
        };

        let set = Arc::new(NamedSet::new(items));
        T::cache(&mut self.caches)
            .tables
            .insert(key, Arc::clone(&set));
        Ok(set)
    }

    async fn load_bulk<T: CatalogObject>(&mut self) -> DbResult<()> {
        let data = self.query(T::QUERY, None).await?;
        let grouped = group_by_table(&data);
        info!(
            connection = %self.executor.identity().display_name(),
            kind = T::KIND,
            rows = data.rows.len(),
            tables = grouped.len(),
            "Loaded summary table metadata"
        );

        if T::KIND == ColumnSnapshot::KIND {
            let mut names: Vec<String> = data
                .rows
                .iter()
                .filter_map(|row| {
                    Some(format!(
                        "{}.{}",
                        row.get_str("schema_name")?,
                        row.get_str("table_name")?
                    ))
                })
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect();
            names.sort_by_key(|n| n.to_lowercase());
            self.caches.bulk_tables = Some(names);
        }

        T::cache(&mut self.caches).bulk = Some(grouped);
        Ok(())
    }

    async fn query(&self, sql: &str, table: Option<&str>) -> DbResult<DataTable> {
        let param = match table {
            Some(name) => SqlParameter::input("table", name),
            None => SqlParameter::input("table", SqlValue::Null),
        }
        .with_type(SqlType::NVarChar(Some(776)));
        self.executor
            .get_data_table(&self.context, sql, &[param])
            .await
    }
}

fn group_by_table(data: &DataTable) -> HashMap<String, Vec<DataRow>> {
    let mut grouped: HashMap<String, Vec<DataRow>> = HashMap::new();
    for row in &data.rows {
        let (Some(schema), Some(table)) = (row.get_str("schema_name"), row.get_str("table_name"))
        else {
            continue;
        };
        grouped
            .entry(format!("{}.{}", schema, table).to_lowercase())
            .or_default()
            .push(row.clone());
    }
    grouped
}

fn get_string(row: &DataRow, column: &str) -> String {
    row.get_str(column).unwrap_or_default().to_string()
}

fn get_optional_string(row: &DataRow, column: &str) -> Option<String> {
    row.get_str(column).map(str::to_string)
}

fn get_u8(row: &DataRow, column: &str) -> Option<u8> {
    row.get_i64(column).and_then(|v| u8::try_from(v).ok())
}

fn parse_columns(rows: &[DataRow], custom_prefix: &str) -> Vec<ColumnSnapshot> {
    rows.iter()
        .map(|row| {
            let name = get_string(row, "column_name");
            ColumnSnapshot {
                is_custom: is_custom_name(&name, custom_prefix),
                column_id: row.get_i64("column_id").unwrap_or_default() as i32,
                data_type: get_string(row, "data_type"),
                max_length: row.get_i64("max_length").map(|v| v as i32),
                precision: get_u8(row, "precision"),
                scale: get_u8(row, "scale"),
                is_nullable: row.get_bool("is_nullable").unwrap_or(true),
                is_identity: row.get_bool("is_identity").unwrap_or(false),
                is_computed: row.get_bool("is_computed").unwrap_or(false),
                default_definition: get_optional_string(row, "default_definition"),
                default_constraint: get_optional_string(row, "default_constraint"),
                collation: get_optional_string(row, "collation_name"),
                name,
            }
        })
        .collect()
}

fn parse_indexes(rows: &[DataRow], custom_prefix: &str) -> Vec<IndexSnapshot> {
    let mut indexes: Vec<IndexSnapshot> = Vec::new();
    for row in rows {
        let name = get_string(row, "index_name");
        let column = IndexColumnSnapshot {
            column_name: get_string(row, "column_name"),
            key_ordinal: row.get_i64("key_ordinal").unwrap_or_default() as i32,
            is_descending: row.get_bool("is_descending_key").unwrap_or(false),
            is_included: row.get_bool("is_included_column").unwrap_or(false),
        };
        if let Some(existing) = indexes
            .last_mut()
            .filter(|i| i.name.eq_ignore_ascii_case(&name))
        {
            existing.columns.push(column);
            continue;
        }
        let kind = if row.get_bool("is_fulltext").unwrap_or(false) {
            IndexKind::FullText
        } else {
            IndexKind::from_catalog(row.get_i64("index_type").unwrap_or_default())
        };
        indexes.push(IndexSnapshot {
            is_custom: is_custom_name(&name, custom_prefix),
            index_id: row.get_i64("index_id").unwrap_or_default() as i32,
            kind,
            is_primary_key: row.get_bool("is_primary_key").unwrap_or(false),
            is_unique: row.get_bool("is_unique").unwrap_or(false),
            is_unique_constraint: row.get_bool("is_unique_constraint").unwrap_or(false),
            filter_definition: get_optional_string(row, "filter_definition"),
            columns: vec![column],
            name,
        });
    }
    indexes
}

fn parse_triggers(rows: &[DataRow], custom_prefix: &str) -> Vec<TriggerSnapshot> {
    let mut triggers: Vec<TriggerSnapshot> = Vec::new();
    for row in rows {
        let name = get_string(row, "trigger_name");
        let events = TriggerEvents::from_type_desc(row.get_str("event_type").unwrap_or_default());
        if let Some(existing) = triggers
            .iter_mut()
            .find(|t| t.name.eq_ignore_ascii_case(&name))
        {
            existing.events = existing.events.union(events);
            continue;
        }
        triggers.push(TriggerSnapshot {
            is_custom: is_custom_name(&name, custom_prefix),
            is_disabled: row.get_bool("is_disabled").unwrap_or(false),
            is_instead_of: row.get_bool("is_instead_of_trigger").unwrap_or(false),
            events,
            definition: get_optional_string(row, "definition"),
            name,
        });
    }
    triggers
}

/// Catalog queries. `@table` is a (possibly schema-qualified) table name, or
/// NULL for the whole database.
pub(crate) mod queries {
    pub const COLUMNS: &str = r#"
        SELECT
            s.name AS schema_name,
            t.name AS table_name,
            c.name AS column_name,
            c.column_id,
            ty.name AS data_type,
            CAST(COALESCE(isc.CHARACTER_MAXIMUM_LENGTH, c.max_length) AS INT) AS max_length,
            c.precision,
            c.scale,
            c.is_nullable,
            c.is_identity,
            c.is_computed,
            dc.definition AS default_definition,
            dc.name AS default_constraint,
            c.collation_name
        FROM sys.tables t
        JOIN sys.schemas s ON s.schema_id = t.schema_id
        JOIN sys.columns c ON c.object_id = t.object_id
        JOIN sys.types ty ON ty.user_type_id = c.user_type_id
        LEFT JOIN sys.default_constraints dc ON dc.object_id = c.default_object_id
        LEFT JOIN INFORMATION_SCHEMA.COLUMNS isc
            ON isc.TABLE_SCHEMA = s.name
            AND isc.TABLE_NAME = t.name
            AND isc.COLUMN_NAME = c.name
        WHERE @table IS NULL OR t.object_id = OBJECT_ID(@table)
        ORDER BY s.name, t.name, c.column_id
        "#;

    pub const INDEXES: &str = r#"
        SELECT
            s.name AS schema_name,
            t.name AS table_name,
            i.name AS index_name,
            i.index_id,
            CAST(i.type AS INT) AS index_type,
            CAST(0 AS BIT) AS is_fulltext,
            i.is_primary_key,
            i.is_unique,
            i.is_unique_constraint,
            i.filter_definition,
            col.name AS column_name,
            CAST(ic.key_ordinal AS INT) AS key_ordinal,
            ic.is_descending_key,
            ic.is_included_column
        FROM sys.indexes i
        JOIN sys.tables t ON t.object_id = i.object_id
        JOIN sys.schemas s ON s.schema_id = t.schema_id
        JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id
        JOIN sys.columns col ON col.object_id = ic.object_id AND col.column_id = ic.column_id
        WHERE i.type IN (1, 2)
            AND (@table IS NULL OR t.object_id = OBJECT_ID(@table))
        UNION ALL
        SELECT
            s.name,
            t.name,
            N'FullText',
            CAST(fi.unique_index_id AS INT),
            CAST(-1 AS INT),
            CAST(1 AS BIT),
            CAST(0 AS BIT),
            CAST(0 AS BIT),
            CAST(0 AS BIT),
            NULL,
            col.name,
            CAST(fic.column_id AS INT),
            CAST(0 AS BIT),
            CAST(0 AS BIT)
        FROM sys.fulltext_indexes fi
        JOIN sys.tables t ON t.object_id = fi.object_id
        JOIN sys.schemas s ON s.schema_id = t.schema_id
        JOIN sys.fulltext_index_columns fic ON fic.object_id = fi.object_id
        JOIN sys.columns col ON col.object_id = fic.object_id AND col.column_id = fic.column_id
        WHERE @table IS NULL OR t.object_id = OBJECT_ID(@table)
        ORDER BY schema_name, table_name, index_id, index_name, is_included_column, key_ordinal
        "#;

    pub const TRIGGERS: &str = r#"
        SELECT
            s.name AS schema_name,
            t.name AS table_name,
            tr.name AS trigger_name,
            tr.is_disabled,
            tr.is_instead_of_trigger,
            te.type_desc AS event_type,
            OBJECT_DEFINITION(tr.object_id) AS definition
        FROM sys.triggers tr
        JOIN sys.tables t ON t.object_id = tr.parent_id
        JOIN sys.schemas s ON s.schema_id = t.schema_id
        JOIN sys.trigger_events te ON te.object_id = tr.object_id
        WHERE @table IS NULL OR t.object_id = OBJECT_ID(@table)
        ORDER BY s.name, t.name, tr.name
        "#;
}
