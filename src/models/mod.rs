//! Data models for the toolkit.
//!
//! This module re-exports all model types used throughout the crate.

pub mod command;
pub mod identity;
pub mod schema;

// Re-export commonly used types
pub use command::{
    Command, CommandKind, CommandOutput, DataRow, DataTable, ParameterDirection, SqlParameter,
    SqlType, SqlValue, clone_parameters_for_retry,
};
pub use identity::{
    ConnectionIdentity, ConnectionRegistry, DEFAULT_SCHEMA, qualify_object_name, quote_literal,
    quote_name, split_object_name, unquote_name,
};
pub use schema::{
    ColumnDefinition, ColumnSet, ColumnSnapshot, IndexColumnDefinition, IndexColumnSnapshot,
    IndexDefinition, IndexKind, IndexSet, IndexSnapshot, Named, NamedSet, TableDefinition,
    TableRef, TableSnapshot, TriggerDefinition, TriggerEvents, TriggerSet, TriggerSnapshot,
    is_custom_name,
};
