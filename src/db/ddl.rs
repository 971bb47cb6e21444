//! DDL fragment generators.
//!
//! Every function returns a self-contained batch. Drops are guarded by an
//! existence check so they can be replayed. Statements that must be first in
//! their batch (`CREATE TRIGGER`) are wrapped in `sp_executesql`, because the
//! executor may prefix a batch with `USE` and parameter declarations.

use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnDefinition, IndexDefinition, IndexKind, IndexSnapshot, TableDefinition,
    TriggerDefinition, qualify_object_name, quote_literal, quote_name, split_object_name,
};

fn object_id(qualified: &str, type_code: &str) -> String {
    format!("OBJECT_ID({}, N'{}')", quote_literal(qualified), type_code)
}

/// `DF_<table>_<column>`
pub fn default_constraint_name(table: &str, column: &str) -> String {
    let (_, table) = split_object_name(table);
    format!("DF_{}_{}", table, column)
}

/// Wrap a default expression in parentheses unless it already is.
fn default_expression(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.starts_with('(') && trimmed.ends_with(')') {
        trimmed.to_string()
    } else {
        format!("({})", trimmed)
    }
}

/// `[Name] nvarchar(200) NOT NULL`, plus identity and a named default.
pub fn column_definition(table: &str, column: &ColumnDefinition) -> String {
    let mut sql = format!("{} {}", quote_name(&column.name), column.data_type);
    if column.identity {
        sql.push_str(" IDENTITY(1,1)");
    }
    sql.push_str(if column.nullable { " NULL" } else { " NOT NULL" });
    if let Some(default) = &column.default {
        sql.push_str(&format!(
            " CONSTRAINT {} DEFAULT {}",
            quote_name(&default_constraint_name(table, &column.name)),
            default_expression(default)
        ));
    }
    sql
}

fn index_key_list(index: &IndexDefinition) -> String {
    index
        .columns
        .iter()
        .map(|c| {
            format!(
                "{} {}",
                quote_name(&c.name),
                if c.descending { "DESC" } else { "ASC" }
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn primary_key_clause(index: &IndexDefinition) -> String {
    format!(
        "CONSTRAINT {} PRIMARY KEY {} ({})",
        quote_name(&index.name),
        if index.clustered { "CLUSTERED" } else { "NONCLUSTERED" },
        index_key_list(index)
    )
}

/// `CREATE TABLE` with columns and the primary key. Other indexes and
/// triggers are created separately.
pub fn create_table(table: &TableDefinition) -> DbResult<String> {
    if table.columns.is_empty() {
        return Err(DbError::schema("Table declares no columns", &table.name));
    }
    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|c| column_definition(&table.name, c))
        .collect();
    if let Some(pk) = table.indexes.iter().find(|i| i.primary_key) {
        lines.push(primary_key_clause(pk));
    }
    Ok(format!(
        "CREATE TABLE {} (\n    {}\n);",
        qualify_object_name(&table.name),
        lines.join(",\n    ")
    ))
}

pub fn drop_table(table: &str) -> String {
    let qualified = qualify_object_name(table);
    format!(
        "IF EXISTS (SELECT 1 FROM sys.tables WHERE [object_id] = {})\nBEGIN\n    DROP TABLE {};\nEND",
        object_id(&qualified, "U"),
        qualified
    )
}

pub fn add_column(table: &str, column: &ColumnDefinition) -> String {
    format!(
        "ALTER TABLE {} ADD {};",
        qualify_object_name(table),
        column_definition(table, column)
    )
}

/// Change type and nullability. Defaults are handled with
/// [`add_default_constraint`] and [`drop_default_constraint`].
pub fn alter_column(table: &str, column: &ColumnDefinition) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} {} {};",
        qualify_object_name(table),
        quote_name(&column.name),
        column.data_type,
        if column.nullable { "NULL" } else { "NOT NULL" }
    )
}

/// Drop a column together with its default constraint, if both exist.
pub fn drop_column(table: &str, column: &str) -> String {
    let qualified = qualify_object_name(table);
    let table_id = object_id(&qualified, "U");
    let column_name = quote_literal(column);
    format!(
        "IF EXISTS (SELECT 1 FROM sys.columns WHERE [object_id] = {table_id} AND [name] = {column_name})
BEGIN
    DECLARE @default_constraint SYSNAME = (
        SELECT dc.[name] FROM sys.default_constraints dc
        JOIN sys.columns c ON c.default_object_id = dc.[object_id]
        WHERE c.[object_id] = {table_id} AND c.[name] = {column_name});
    IF @default_constraint IS NOT NULL
        EXEC (N'ALTER TABLE {escaped} DROP CONSTRAINT [' + @default_constraint + N']');
    ALTER TABLE {qualified} DROP COLUMN {column};
END",
        escaped = qualified.replace('\'', "''"),
        column = quote_name(column),
    )
}

pub fn rename_column(table: &str, column: &str, new_name: &str) -> String {
    let target = format!("{}.{}", qualify_object_name(table), quote_name(column));
    format!(
        "EXEC sp_rename {}, {}, N'COLUMN';",
        quote_literal(&target),
        quote_literal(new_name)
    )
}

/// `sp_rename` takes the new name without schema or brackets.
pub fn rename_table(table: &str, new_name: &str) -> String {
    let (_, new_name) = split_object_name(new_name);
    format!(
        "EXEC sp_rename {}, {};",
        quote_literal(&qualify_object_name(table)),
        quote_literal(&new_name)
    )
}

pub fn add_default_constraint(table: &str, column: &str, expression: &str) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} DEFAULT {} FOR {};",
        qualify_object_name(table),
        quote_name(&default_constraint_name(table, column)),
        default_expression(expression),
        quote_name(column)
    )
}

pub fn drop_default_constraint(table: &str, constraint: &str) -> String {
    let (schema, _) = split_object_name(table);
    let qualified = qualify_object_name(&format!("{}.{}", quote_name(&schema), quote_name(constraint)));
    format!(
        "IF {} IS NOT NULL\nBEGIN\n    ALTER TABLE {} DROP CONSTRAINT {};\nEND",
        object_id(&qualified, "D"),
        qualify_object_name(table),
        quote_name(constraint)
    )
}

/// Create a declared index. Primary keys become constraints; full-text
/// indexes need [`create_fulltext_index`].
pub fn create_index(table: &str, index: &IndexDefinition) -> DbResult<String> {
    if index.columns.is_empty() {
        return Err(DbError::schema("Index declares no key columns", &index.name));
    }
    if index.full_text {
        return Err(DbError::schema(
            "Full-text indexes need a key index",
            &index.name,
        ));
    }
    let qualified = qualify_object_name(table);
    if index.primary_key {
        return Ok(format!(
            "ALTER TABLE {} ADD {};",
            qualified,
            primary_key_clause(index)
        ));
    }

    let mut sql = format!(
        "CREATE {}{} INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        if index.clustered { "CLUSTERED" } else { "NONCLUSTERED" },
        quote_name(&index.name),
        qualified,
        index_key_list(index)
    );
    if !index.included.is_empty() {
        let included: Vec<String> = index.included.iter().map(|c| quote_name(c)).collect();
        sql.push_str(&format!(" INCLUDE ({})", included.join(", ")));
    }
    if let Some(filter) = &index.filter {
        sql.push_str(&format!(" WHERE {}", filter));
    }
    sql.push(';');
    Ok(sql)
}

/// `CREATE FULLTEXT INDEX` keyed on the unique index `key_index`.
pub fn create_fulltext_index(table: &str, index: &IndexDefinition, key_index: &str) -> String {
    let columns: Vec<String> = index.columns.iter().map(|c| quote_name(&c.name)).collect();
    format!(
        "CREATE FULLTEXT INDEX ON {} ({}) KEY INDEX {};",
        qualify_object_name(table),
        columns.join(", "),
        quote_name(key_index)
    )
}

/// Drop an existing index the way its kind requires.
pub fn drop_index(table: &str, index: &IndexSnapshot) -> String {
    let qualified = qualify_object_name(table);
    let table_id = object_id(&qualified, "U");
    if index.kind == IndexKind::FullText {
        return format!(
            "IF EXISTS (SELECT 1 FROM sys.fulltext_indexes WHERE [object_id] = {})\nBEGIN\n    DROP FULLTEXT INDEX ON {};\nEND",
            table_id, qualified
        );
    }
    let statement = if index.is_constraint() {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT {};",
            qualified,
            quote_name(&index.name)
        )
    } else {
        format!(
            "DROP INDEX {} ON {} WITH (ONLINE = OFF);",
            quote_name(&index.name),
            qualified
        )
    };
    format!(
        "IF EXISTS (SELECT 1 FROM sys.indexes WHERE [object_id] = {} AND [name] = {})\nBEGIN\n    {}\nEND",
        table_id,
        quote_literal(&index.name),
        statement
    )
}

/// Triggers live in their table's schema.
fn trigger_name(table: &str, trigger: &str) -> String {
    let (schema, _) = split_object_name(table);
    format!("{}.{}", quote_name(&schema), quote_name(trigger))
}

pub fn drop_trigger(table: &str, trigger: &str) -> String {
    let qualified = trigger_name(table, trigger);
    format!(
        "IF {} IS NOT NULL\nBEGIN\n    DROP TRIGGER {};\nEND",
        object_id(&qualified, "TR"),
        qualified
    )
}

/// Create the trigger, or alter it when one with that name exists.
pub fn create_or_alter_trigger(table: &str, trigger: &TriggerDefinition) -> DbResult<String> {
    if trigger.events.is_empty() {
        return Err(DbError::schema("Trigger declares no events", &trigger.name));
    }
    let qualified = trigger_name(table, &trigger.name);
    let rest = format!(
        " TRIGGER {} ON {} AFTER {} AS\n{}",
        qualified,
        qualify_object_name(table),
        trigger.events.to_sql(),
        trigger.body.trim()
    );
    Ok(format!(
        "DECLARE @keyword NVARCHAR(6) = CASE WHEN {} IS NULL THEN N'CREATE' ELSE N'ALTER' END;
DECLARE @trigger NVARCHAR(MAX) = @keyword + {};
EXEC sp_executesql @trigger;",
        object_id(&qualified, "TR"),
        quote_literal(&rest)
    ))
}
