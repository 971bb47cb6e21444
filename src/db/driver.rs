//! Driver boundary.
//!
//! The executor and the ambient coordinator only talk to the database through
//! the [`Connector`] and [`Connection`] traits. The production implementation
//! lives in [`crate::db::tds`]; tests substitute an in-memory fake.
//!
//! Failures are classified into a [`DriverErrorKind`] by the driver itself,
//! so retry decisions never depend on message text.

use crate::models::{Command, CommandOutput, ConnectionIdentity};
use async_trait::async_trait;
use thiserror::Error;

/// SQL Server error number raised for the victim of a deadlock.
pub const DEADLOCK_ERROR_CODE: u32 = 1205;

/// Classification of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The session was chosen as deadlock victim
    Deadlock,
    /// The command or connection attempt exceeded its timeout
    Timeout,
    /// The physical connection is gone
    ConnectionLost,
    /// Any other error reported by the server
    Server,
    /// Malformed response, unsupported type or similar client-side issue
    Protocol,
}

/// Error raised by a [`Connector`] or [`Connection`].
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    /// Server error number, when the server reported one
    pub code: Option<u32>,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, code: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    /// Deadlock victim notification.
    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::new(
            DriverErrorKind::Deadlock,
            Some(DEADLOCK_ERROR_CODE),
            message,
        )
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Timeout, None, message)
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::ConnectionLost, None, message)
    }

    /// Server-reported error. Error 1205 is classified as a deadlock.
    pub fn server(code: u32, message: impl Into<String>) -> Self {
        let kind = if code == DEADLOCK_ERROR_CODE {
            DriverErrorKind::Deadlock
        } else {
            DriverErrorKind::Server
        };
        Self::new(kind, Some(code), message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Protocol, None, message)
    }

    pub fn is_deadlock(&self) -> bool {
        self.kind == DriverErrorKind::Deadlock || self.code == Some(DEADLOCK_ERROR_CODE)
    }

    /// Whether the failure may succeed when retried on a fresh connection.
    pub fn is_transient(&self) -> bool {
        self.is_deadlock() || self.kind == DriverErrorKind::Timeout
    }

    pub fn is_connection_lost(&self) -> bool {
        self.kind == DriverErrorKind::ConnectionLost
    }
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to the database named by `identity`.
    async fn connect(
        &self,
        identity: &ConnectionIdentity,
    ) -> Result<Box<dyn Connection>, DriverError>;
}

/// An open physical connection.
///
/// At most one driver transaction is active per connection.
#[async_trait]
pub trait Connection: Send {
    /// Execute a command and collect every result set it produced.
    async fn execute(&mut self, command: &Command) -> Result<CommandOutput, DriverError>;

    async fn begin(&mut self) -> Result<(), DriverError>;

    async fn commit(&mut self) -> Result<(), DriverError>;

    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    /// Close the connection, releasing server resources.
    async fn close(self: Box<Self>) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlock_classification_uses_error_number() {
        let err = DriverError::server(1205, "Transaction was deadlocked");
        assert_eq!(err.kind, DriverErrorKind::Deadlock);
        assert!(err.is_deadlock());
        assert!(err.is_transient());
    }

    #[test]
    fn test_message_text_is_not_used_for_classification() {
        let err = DriverError::server(547, "deadlock mentioned in a constraint name");
        assert!(!err.is_deadlock());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_timeout_is_transient_but_not_deadlock() {
        let err = DriverError::timeout("command timed out");
        assert!(err.is_transient());
        assert!(!err.is_deadlock());
        assert!(!DriverError::connection_lost("reset").is_transient());
    }
}
