//! Declared-vs-actual table synchronization.
//!
//! [`SchemaSynchronizer`] compares a [`TableDefinition`] with the cached
//! [`TableSnapshot`] and produces an ordered [`TablePlan`] of DDL steps:
//!
//! 1. drop full-text indexes that are undeclared, changed or affected
//! 2. drop undeclared triggers
//! 3. drop other undeclared or changed indexes, and indexes on columns
//!    being altered or dropped
//! 4. drop undeclared columns
//! 5. alter changed columns and defaults
//! 6. add missing columns
//! 7. create missing indexes (primary key first, full-text last)
//! 8. create or alter declared triggers
//!
//! Objects whose name carries the custom prefix are never dropped here.
//! Full-text DDL cannot run inside a user transaction. It runs on its own
//! connection with the ambient transaction suppressed, which would block
//! on a table the ambient transaction has already changed. Full-text drops
//! therefore come first, before the transaction touches the table, and
//! full-text creates are deferred until the ambient transaction commits
//! (and skipped when it rolls back). A full-text drop can still block when
//! earlier work in the same transaction changed the table.

use crate::db::ddl;
use crate::db::schema::SchemaCache;
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnDefinition, ColumnSnapshot, IndexDefinition, IndexKind, IndexSnapshot,
    TableDefinition, TableRef, TableSnapshot,
};
use tracing::{debug, info};

/// One DDL statement of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStep {
    pub description: String,
    pub sql: String,
    /// Must run with the ambient transaction suppressed
    pub outside_transaction: bool,
    /// Runs once the ambient transaction commits, when there is one
    pub after_commit: bool,
}

impl SyncStep {
    fn new(description: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            sql: sql.into(),
            outside_transaction: false,
            after_commit: false,
        }
    }

    fn full_text(description: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            outside_transaction: true,
            ..Self::new(description, sql)
        }
    }

    fn after_commit(self) -> Self {
        Self {
            after_commit: true,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePlan {
    pub table: TableRef,
    pub steps: Vec<SyncStep>,
}

impl TablePlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

fn normalize_type(data_type: &str) -> String {
    let compact: String = data_type
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    for base in ["datetime2", "datetimeoffset", "time"] {
        if compact == format!("{}(7)", base) {
            return base.to_string();
        }
    }
    compact
}

/// Whether the parenthesis opening `s` closes at its last character.
fn wraps_whole(s: &str) -> bool {
    if !(s.starts_with('(') && s.ends_with(')')) {
        return false;
    }
    let mut depth = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 && i + 1 != s.len() {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

/// The server stores defaults as `((0))` or `(getutcdate())`.
fn normalize_default(expression: &str) -> String {
    let mut s = expression.trim();
    while wraps_whole(s) {
        s = s[1..s.len() - 1].trim();
    }
    s.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

fn column_changed(declared: &ColumnDefinition, actual: &ColumnSnapshot) -> bool {
    normalize_type(&declared.data_type) != normalize_type(&actual.type_definition())
        || declared.nullable != actual.is_nullable
}

fn default_changed(declared: &ColumnDefinition, actual: &ColumnSnapshot) -> bool {
    declared.default.as_deref().map(normalize_default)
        != actual.default_definition.as_deref().map(normalize_default)
}

fn index_matches(declared: &IndexDefinition, actual: &IndexSnapshot) -> bool {
    let mut actual_keys: Vec<_> = actual.key_columns().collect();
    if declared.full_text {
        let mut declared_names: Vec<String> =
            declared.columns.iter().map(|c| c.name.to_lowercase()).collect();
        let mut actual_names: Vec<String> =
            actual_keys.iter().map(|c| c.column_name.to_lowercase()).collect();
        declared_names.sort();
        actual_names.sort();
        return actual.kind == IndexKind::FullText && declared_names == actual_names;
    }

    actual_keys.sort_by_key(|c| c.key_ordinal);
    let keys_match = declared.columns.len() == actual_keys.len()
        && declared.columns.iter().zip(&actual_keys).all(|(d, a)| {
            d.name.eq_ignore_ascii_case(&a.column_name) && d.descending == a.is_descending
        });

    let mut declared_included: Vec<String> =
        declared.included.iter().map(|c| c.to_lowercase()).collect();
    let mut actual_included: Vec<String> = actual
        .included_columns()
        .map(|c| c.column_name.to_lowercase())
        .collect();
    declared_included.sort();
    actual_included.sort();

    // Filter text is rewritten by the server; only its presence is compared.
    keys_match
        && declared_included == actual_included
        && declared.primary_key == actual.is_primary_key
        && declared.unique == actual.is_unique
        && declared.clustered == (actual.kind == IndexKind::Clustered)
        && declared.filter.is_some() == actual.filter_definition.is_some()
}

fn declared_index_for<'a>(
    definition: &'a TableDefinition,
    actual: &IndexSnapshot,
) -> Option<&'a IndexDefinition> {
    if actual.kind == IndexKind::FullText {
        definition.indexes.iter().find(|i| i.full_text)
    } else {
        definition.find_index(&actual.name).filter(|i| !i.full_text)
    }
}

fn create_index_step(
    table: &str,
    index: &IndexDefinition,
    key_index: Option<&str>,
) -> DbResult<SyncStep> {
    if index.full_text {
        let key_index = key_index.ok_or_else(|| {
            DbError::schema(
                "Full-text index requires a primary key on the table",
                &index.name,
            )
        })?;
        return Ok(SyncStep::full_text(
            format!("create full-text index {}", index.name),
            ddl::create_fulltext_index(table, index, key_index),
        )
        .after_commit());
    }
    Ok(SyncStep::new(
        format!("create index {}", index.name),
        ddl::create_index(table, index)?,
    ))
}

/// Primary key first, full-text last.
fn creation_order(indexes: &mut [&IndexDefinition]) {
    indexes.sort_by_key(|i| match (i.primary_key, i.full_text) {
        (true, _) => 0,
        (false, false) => 1,
        (false, true) => 2,
    });
}

fn plan_new_table(definition: &TableDefinition) -> DbResult<Vec<SyncStep>> {
    let table = definition.name.as_str();
    let mut steps = vec![SyncStep::new(
        format!("create table {}", table),
        ddl::create_table(definition)?,
    )];

    let key_index = definition
        .indexes
        .iter()
        .find(|i| i.primary_key)
        .map(|i| i.name.as_str());
    let mut indexes: Vec<&IndexDefinition> =
        definition.indexes.iter().filter(|i| !i.primary_key).collect();
    creation_order(&mut indexes);
    for index in indexes {
        steps.push(create_index_step(table, index, key_index)?);
    }
    for trigger in &definition.triggers {
        steps.push(SyncStep::new(
            format!("create trigger {}", trigger.name),
            ddl::create_or_alter_trigger(table, trigger)?,
        ));
    }
    Ok(steps)
}

/// Plan the DDL that turns `snapshot` into `definition`.
pub fn plan_changes(
    definition: &TableDefinition,
    snapshot: &TableSnapshot,
) -> DbResult<Vec<SyncStep>> {
    if !snapshot.exists {
        return plan_new_table(definition);
    }

    let table = definition.name.as_str();
    let mut steps = Vec::new();
    let mut full_text_drops = Vec::new();

    let altered: Vec<(&ColumnDefinition, &ColumnSnapshot)> = definition
        .columns
        .iter()
        .filter_map(|d| snapshot.columns.get(&d.name).map(|a| (d, a)))
        .filter(|(d, a)| column_changed(d, a))
        .collect();
    let dropped: Vec<&ColumnSnapshot> = snapshot
        .columns
        .iter()
        .filter(|c| !c.is_custom && definition.find_column(&c.name).is_none())
        .collect();

    for trigger in snapshot.triggers.iter() {
        if !trigger.is_custom && definition.find_trigger(&trigger.name).is_none() {
            steps.push(SyncStep::new(
                format!("drop trigger {}", trigger.name),
                ddl::drop_trigger(table, &trigger.name),
            ));
        }
    }

    let mut kept: Vec<&IndexSnapshot> = Vec::new();
    for index in snapshot.indexes.iter() {
        if index.is_custom {
            kept.push(index);
            continue;
        }
        let affected = altered.iter().any(|(d, _)| index.references_column(&d.name))
            || dropped.iter().any(|c| index.references_column(&c.name));
        let matches = declared_index_for(definition, index).is_some_and(|d| index_matches(d, index));
        if matches && !affected {
            kept.push(index);
            continue;
        }
        let description = format!("drop index {}", index.name);
        let sql = ddl::drop_index(table, index);
        if index.kind == IndexKind::FullText {
            full_text_drops.push(SyncStep::full_text(description, sql));
        } else {
            steps.push(SyncStep::new(description, sql));
        }
    }

    for column in &dropped {
        steps.push(SyncStep::new(
            format!("drop column {}", column.name),
            ddl::drop_column(table, &column.name),
        ));
    }

    for declared in &definition.columns {
        let Some(actual) = snapshot.columns.get(&declared.name) else {
            continue;
        };
        let changed = column_changed(declared, actual);
        if !changed && !default_changed(declared, actual) {
            continue;
        }
        if let Some(constraint) = &actual.default_constraint {
            steps.push(SyncStep::new(
                format!("drop default of {}", declared.name),
                ddl::drop_default_constraint(table, constraint),
            ));
        }
        if changed {
            steps.push(SyncStep::new(
                format!("alter column {}", declared.name),
                ddl::alter_column(table, declared),
            ));
        }
        if let Some(default) = &declared.default {
            steps.push(SyncStep::new(
                format!("add default of {}", declared.name),
                ddl::add_default_constraint(table, &declared.name, default),
            ));
        }
    }

    for declared in &definition.columns {
        if !snapshot.columns.contains(&declared.name) {
            steps.push(SyncStep::new(
                format!("add column {}", declared.name),
                ddl::add_column(table, declared),
            ));
        }
    }

    let key_index = definition
        .indexes
        .iter()
        .find(|i| i.primary_key)
        .map(|i| i.name.as_str())
        .or_else(|| snapshot.primary_key().map(|i| i.name.as_str()));
    let mut missing: Vec<&IndexDefinition> = definition
        .indexes
        .iter()
        .filter(|d| {
            !kept.iter().any(|k| {
                if d.full_text {
                    k.kind == IndexKind::FullText
                } else {
                    k.kind != IndexKind::FullText && k.name.eq_ignore_ascii_case(&d.name)
                }
            })
        })
        .collect();
    creation_order(&mut missing);
    for index in missing {
        steps.push(create_index_step(table, index, key_index)?);
    }

    for trigger in &definition.triggers {
        let current = snapshot.triggers.get(&trigger.name);
        let up_to_date = current.is_some_and(|t| {
            t.events == trigger.events
                && t.definition
                    .as_deref()
                    .is_some_and(|d| d.contains(trigger.body.trim()))
        });
        if !up_to_date {
            steps.push(SyncStep::new(
                format!("create or alter trigger {}", trigger.name),
                ddl::create_or_alter_trigger(table, trigger)?,
            ));
        }
    }

    full_text_drops.extend(steps);
    Ok(full_text_drops)
}

/// Brings tables in line with their declarations.
pub struct SchemaSynchronizer {
    cache: SchemaCache,
}

impl SchemaSynchronizer {
    pub fn new(cache: SchemaCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut SchemaCache {
        &mut self.cache
    }

    pub fn into_cache(self) -> SchemaCache {
        self.cache
    }

    /// Plan the changes for `definition` without running them.
    pub async fn plan_table(&mut self, key: &str, definition: &TableDefinition) -> DbResult<TablePlan> {
        let table = TableRef::new(key, definition.name.as_str());
        let snapshot = self.cache.snapshot(&table).await?;
        let steps = plan_changes(definition, &snapshot)?;
        debug!(table = %definition.name, steps = steps.len(), "Planned table synchronization");
        Ok(TablePlan { table, steps })
    }

    /// Plan and run the changes for `definition`. The table's cached
    /// snapshots are reset afterwards, whether or not every step succeeded.
    pub async fn synchronize_table(
        &mut self,
        key: &str,
        definition: &TableDefinition,
    ) -> DbResult<TablePlan> {
        let plan = self.plan_table(key, definition).await?;
        if plan.is_empty() {
            return Ok(plan);
        }

        let result = self.run_steps(&plan.steps).await;
        self.cache.reset_table(&plan.table);
        result?;

        info!(
            connection = %self.cache.executor().identity().display_name(),
            table = %definition.name,
            steps = plan.len(),
            "Synchronized table"
        );
        Ok(plan)
    }

    async fn run_steps(&self, steps: &[SyncStep]) -> DbResult<()> {
        let executor = self.cache.executor();
        let context = self.cache.context();
        let transaction = context.active_transaction();
        for step in steps {
            if let (true, Some(transaction)) = (step.after_commit, &transaction) {
                debug!(
                    step = %step.description,
                    transaction_id = %transaction.id(),
                    "Deferring synchronization step until commit"
                );
                let executor = executor.clone();
                let sql = step.sql.clone();
                transaction.on_completed(move |ctx| async move {
                    executor.execute_non_query(&ctx, &sql, &mut []).await.map(|_| ())
                })?;
                continue;
            }
            debug!(step = %step.description, "Running synchronization step");
            if step.outside_transaction {
                context
                    .suppress_transaction(|ctx| async move {
                        executor.execute_non_query(&ctx, &step.sql, &mut []).await
                    })
                    .await?;
            } else {
                executor.execute_non_query(context, &step.sql, &mut []).await?;
            }
        }
        Ok(())
    }

    /// Rename a table and keep both names out of bulk extraction for the
    /// rest of the current bulk session.
    pub async fn rename_table(&mut self, old_name: &str, new_name: &str) -> DbResult<()> {
        let sql = ddl::rename_table(old_name, new_name);
        let result = self
            .cache
            .executor()
            .execute_non_query(self.cache.context(), &sql, &mut [])
            .await;
        self.cache.add_renamed_table(old_name);
        self.cache.add_renamed_table(new_name);
        result?;
        info!(from = %old_name, to = %new_name, "Renamed table");
        Ok(())
    }

    pub async fn rename_column(
        &mut self,
        table: &TableRef,
        column: &str,
        new_name: &str,
    ) -> DbResult<()> {
        let sql = ddl::rename_column(&table.name, column, new_name);
        let result = self
            .cache
            .executor()
            .execute_non_query(self.cache.context(), &sql, &mut [])
            .await;
        self.cache.reset_table(table);
        result.map(|_| ())
    }
}
