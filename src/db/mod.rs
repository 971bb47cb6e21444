//! Database access layer.
//!
//! This module provides:
//! - The driver boundary and its tiberius implementation
//! - Ambient transactions scoped to an [`AmbientContext`]
//! - Command execution with deadlock retry
//! - Idempotent stored procedure and function upserts
//! - Schema reflection, DDL generation and table synchronization
//! - Reference-counted scoped flags

pub mod ambient;
pub mod ddl;
pub mod driver;
pub mod executor;
pub mod flags;
pub mod routine;
pub mod schema;
pub mod sync;
pub mod tds;

pub use ambient::{AmbientContext, AmbientTransaction, TransactionScope, TransactionState};
pub use driver::{Connection, Connector, DEADLOCK_ERROR_CODE, DriverError, DriverErrorKind};
pub use executor::{CommandExecutor, ExecutorFactory};
pub use flags::{
    SUMMARY_METADATA_FLAG, SUPPRESS_TRANSACTION_FLAG, ScopedFlagGuard, ScopedFlags,
    SharedFlagGuard, SharedScopedFlags,
};
pub use routine::{ProgramUnitHeader, ProgramUnitKind, program_unit_script};
pub use schema::SchemaCache;
pub use sync::{SchemaSynchronizer, SyncStep, TablePlan, plan_changes};
pub use tds::{TdsConnection, TdsConnector};
