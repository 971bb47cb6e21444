//! SQL Server access toolkit.
//!
//! Commands issued through a [`CommandExecutor`] join the ambient
//! transaction of the caller's [`AmbientContext`], standalone commands
//! survive deadlocks by retrying, and a [`SchemaCache`] backed
//! [`SchemaSynchronizer`] reconciles tables with their declarations.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;

pub use config::{RetryPolicy, ToolkitConfig};
pub use db::{
    AmbientContext, CommandExecutor, ExecutorFactory, SchemaCache, SchemaSynchronizer,
    TransactionScope,
};
pub use error::{DbError, DbResult};
pub use models::{ConnectionIdentity, SqlParameter, SqlValue};
