//! Error types for the ambient transaction toolkit.
//!
//! This module defines all error types using `thiserror`. Every failure that
//! reaches a caller carries enough context (connection display name, command
//! text, nested driver error) to be diagnosed from a single log line.

use crate::db::driver::DriverError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Operation requires the '{flag}' execution context")]
    NotInContext { flag: String },

    #[error(
        "Ambient transaction is bound to server '{entry_point}' and cannot be joined from '{requested}'"
    )]
    ServerMismatch {
        entry_point: String,
        requested: String,
    },

    #[error("Program unit mismatch: expected '{expected}', found '{found}'")]
    ProgramUnitMismatch { expected: String, found: String },

    #[error("Connection to {connection} was closed in the middle of transaction {transaction_id}")]
    ConnectionClosed {
        connection: String,
        transaction_id: String,
    },

    #[error("Command failed on {connection} after {attempts} attempt(s): {source}\nCommand: {command}")]
    Command {
        connection: String,
        command: String,
        attempts: u32,
        #[source]
        source: DriverError,
    },

    #[error("Failed to connect to {connection}: {source}")]
    Connect {
        connection: String,
        #[source]
        source: DriverError,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("{operation} of transaction {transaction_id} failed after {attempts} attempt(s): {source}")]
    Finalization {
        transaction_id: String,
        operation: &'static str,
        attempts: u32,
        #[source]
        source: DriverError,
    },

    #[error("Multiple failures: {}", join_messages(.errors))]
    Aggregate { errors: Vec<DbError> },

    #[error("Schema error: {message} (object: {object})")]
    Schema { message: String, object: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn join_messages(errors: &[DbError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a missing execution context error.
    pub fn not_in_context(flag: impl Into<String>) -> Self {
        Self::NotInContext { flag: flag.into() }
    }

    /// Create a cross-server transaction join error.
    pub fn server_mismatch(entry_point: impl Into<String>, requested: impl Into<String>) -> Self {
        Self::ServerMismatch {
            entry_point: entry_point.into(),
            requested: requested.into(),
        }
    }

    /// Create a program unit name/type mismatch error.
    pub fn program_unit_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::ProgramUnitMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create a transaction misuse error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            object: object.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Combine failures so that none of them is dropped.
    ///
    /// Nested aggregates are flattened; a single error is returned as-is.
    pub fn aggregate(errors: Vec<DbError>) -> Self {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                Self::Aggregate { errors } => flat.extend(errors),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            return flat.remove(0);
        }
        Self::Aggregate { errors: flat }
    }

    /// Merge two optional failures into at most one error.
    pub fn combine(first: Option<DbError>, second: Option<DbError>) -> Option<DbError> {
        match (first, second) {
            (None, None) => None,
            (Some(e), None) | (None, Some(e)) => Some(e),
            (Some(a), Some(b)) => Some(Self::aggregate(vec![a, b])),
        }
    }

    /// The driver error underneath this failure, if any.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::Command { source, .. }
            | Self::Connect { source, .. }
            | Self::Finalization { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Check if this error was caused by a deadlock-class transient failure.
    pub fn is_transient(&self) -> bool {
        self.driver_error().is_some_and(DriverError::is_transient)
    }

    /// Check if this error is a deadlock victim notification.
    pub fn is_deadlock(&self) -> bool {
        self.driver_error().is_some_and(DriverError::is_deadlock)
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
