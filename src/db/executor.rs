//! Command execution engine.
//!
//! This module provides command execution with support for:
//! - Ambient transactions (commands join the current transaction of the
//!   caller's [`AmbientContext`])
//! - Deadlock retry for standalone commands
//! - Stored procedure invocation with output parameters
//! - Idempotent create-or-alter of procedures and functions
//!
//! # Routing
//!
//! Each call decides where it runs:
//! - No current transaction, or the transaction is suppressed: a standalone
//!   connection is opened, used once and closed. A deadlock victim is
//!   retried on a fresh connection after a fixed delay.
//! - Otherwise the command runs on the transaction's connection, prefixed
//!   with `USE [database]` because a shared connection's current database
//!   may have been changed by an earlier statement. Nothing is retried.

use crate::config::{RetryPolicy, ToolkitConfig};
use crate::db::ambient::{AmbientContext, AmbientTransaction};
use crate::db::driver::Connector;
use crate::db::routine::{drop_program_unit_script, program_unit_script};
use crate::db::schema::SchemaCache;
use crate::db::tds::TdsConnector;
use crate::error::{DbError, DbResult};
use crate::logging::{FailureRecord, FailureSink, TracingFailureSink, init_tracing};
use crate::models::{
    Command, CommandOutput, ConnectionIdentity, ConnectionRegistry, DataRow,
    DataTable, ParameterDirection, SqlParameter, SqlValue, clone_parameters_for_retry,
    qualify_object_name, quote_name,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Executes commands against one database.
#[derive(Clone)]
pub struct CommandExecutor {
    identity: ConnectionIdentity,
    connector: Arc<dyn Connector>,
    deadlock_policy: RetryPolicy,
    command_timeout: Duration,
    sink: Arc<dyn FailureSink>,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("identity", &self.identity.display_name())
            .field("deadlock_policy", &self.deadlock_policy)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl CommandExecutor {
    /// Create an executor with default retry and timeout settings.
    pub fn new(identity: ConnectionIdentity, connector: Arc<dyn Connector>) -> Self {
        Self {
            identity,
            connector,
            deadlock_policy: RetryPolicy::deadlock_default(),
            command_timeout: Duration::from_secs(crate::config::DEFAULT_COMMAND_TIMEOUT_SECS),
            sink: Arc::new(TracingFailureSink),
        }
    }

    pub fn with_deadlock_policy(mut self, policy: RetryPolicy) -> Self {
        self.deadlock_policy = policy;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// Run `text` and hand the output to `handler`.
    ///
    /// Output and input/output parameters in `params` receive their new
    /// values once the command has succeeded.
    pub async fn execute_command<T, H>(
        &self,
        ctx: &AmbientContext,
        text: &str,
        params: &mut [SqlParameter],
        handler: H,
    ) -> DbResult<T>
    where
        H: FnOnce(&CommandOutput) -> DbResult<T>,
    {
        let transaction = ctx.active_transaction();
        let command_text = match &transaction {
            Some(_) => format!("{}\n{}", self.identity.use_statement(), text),
            None => text.to_string(),
        };
        let command = Command::text(command_text, params.to_vec(), self.command_timeout);
        let output = self.run(transaction, command).await?;
        output.apply_outputs(params);
        handler(&output)
    }

    /// Run a statement and return the number of rows it affected.
    pub async fn execute_non_query(
        &self,
        ctx: &AmbientContext,
        text: &str,
        params: &mut [SqlParameter],
    ) -> DbResult<u64> {
        self.execute_command(ctx, text, params, |output| Ok(output.rows_affected))
            .await
    }

    /// First result set of a query; empty when the query returned none.
    pub async fn get_data_table(
        &self,
        ctx: &AmbientContext,
        text: &str,
        params: &[SqlParameter],
    ) -> DbResult<DataTable> {
        let mut params = params.to_vec();
        self.execute_command(ctx, text, &mut params, |output| Ok(output.first_table()))
            .await
    }

    /// First row of the first result set.
    pub async fn get_data_row(
        &self,
        ctx: &AmbientContext,
        text: &str,
        params: &[SqlParameter],
    ) -> DbResult<Option<DataRow>> {
        let table = self.get_data_table(ctx, text, params).await?;
        Ok(table.rows.into_iter().next())
    }

    /// First column of the first row, or `Null` when there is no row.
    pub async fn get_scalar_value(
        &self,
        ctx: &AmbientContext,
        text: &str,
        params: &[SqlParameter],
    ) -> DbResult<SqlValue> {
        let row = self.get_data_row(ctx, text, params).await?;
        Ok(row
            .and_then(|r| r.get_index(0).cloned())
            .unwrap_or(SqlValue::Null))
    }

    /// Call a stored procedure.
    ///
    /// Without an ambient transaction the procedure is dispatched natively.
    /// Inside one, an explicit `USE ... EXEC` batch is sent instead. It
    /// passes every argument by name (`@a = @a`, `@b = @b OUTPUT`), so the
    /// order of `params` does not matter, and the output parameters are
    /// read back from a trailing `SELECT`.
    pub async fn execute_procedure(
        &self,
        ctx: &AmbientContext,
        name: &str,
        params: &mut [SqlParameter],
    ) -> DbResult<CommandOutput> {
        let transaction = ctx.active_transaction();
        let output = match transaction {
            None => {
                let command = Command::procedure(name, params.to_vec(), self.command_timeout);
                self.run(None, command).await?
            }
            Some(transaction) => {
                let command = Command::text(
                    self.procedure_batch(name, params),
                    procedure_batch_parameters(params),
                    self.command_timeout,
                );
                let mut output = self.run(Some(transaction), command).await?;
                if params.iter().any(|p| p.direction.returns_value()) {
                    if let Some(captured) = output.result_sets.pop() {
                        if let Some(row) = captured.first() {
                            for (column, value) in row.columns().iter().zip(row.values()) {
                                output
                                    .output_values
                                    .insert(column.to_lowercase(), value.clone());
                            }
                        }
                    }
                }
                output
            }
        };
        output.apply_outputs(params);
        Ok(output)
    }

    /// `USE [db] EXEC [schema].[proc] @a = @a, @b = @b OUTPUT; SELECT @b AS [b];`
    fn procedure_batch(&self, name: &str, params: &[SqlParameter]) -> String {
        let args: Vec<String> = params
            .iter()
            .map(|p| {
                if p.direction.returns_value() {
                    format!("{0} = {0} OUTPUT", p.placeholder())
                } else {
                    format!("{0} = {0}", p.placeholder())
                }
            })
            .collect();
        let mut batch = format!(
            "{} EXEC {} {};",
            self.identity.use_statement(),
            qualify_object_name(name),
            args.join(", ")
        );
        let outputs: Vec<String> = params
            .iter()
            .filter(|p| p.direction.returns_value())
            .map(|p| format!("{} AS {}", p.placeholder(), quote_name(&p.name)))
            .collect();
        if !outputs.is_empty() {
            batch.push_str(&format!(" SELECT {};", outputs.join(", ")));
        }
        batch
    }

    /// Create or alter a stored procedure or function from its source text.
    ///
    /// `source` must start with `CREATE PROCEDURE|FUNCTION <name>`.
    pub async fn create_program_unit(
        &self,
        ctx: &AmbientContext,
        name: &str,
        source: &str,
    ) -> DbResult<()> {
        let script = program_unit_script(name, source)?;
        debug!(
            connection = %self.identity.display_name(),
            program_unit = %name,
            "Creating or altering program unit"
        );
        self.execute_non_query(ctx, &script, &mut []).await?;
        Ok(())
    }

    /// Drop a stored procedure or function if it exists.
    pub async fn drop_program_unit(&self, ctx: &AmbientContext, name: &str) -> DbResult<()> {
        self.execute_non_query(ctx, &drop_program_unit_script(name), &mut [])
            .await?;
        Ok(())
    }

    async fn run(
        &self,
        transaction: Option<Arc<AmbientTransaction>>,
        command: Command,
    ) -> DbResult<CommandOutput> {
        debug!(
            connection = %self.identity.display_name(),
            sql = %command.text,
            params = command.params.len(),
            ambient = transaction.is_some(),
            "Executing command"
        );

        let result = match &transaction {
            Some(transaction) => {
                let result = transaction
                    .execute(self.connector.as_ref(), &self.identity, &command)
                    .await;
                if let Err(e) = &result {
                    if e.is_deadlock() {
                        warn!(
                            connection = %self.identity.display_name(),
                            transaction_id = %transaction.id(),
                            "Deadlock inside ambient transaction; not retried"
                        );
                    }
                }
                result
            }
            None => self.run_standalone(&command).await,
        };

        result.map_err(|e| self.fail(e, &command.text))
    }

    async fn run_standalone(&self, command: &Command) -> DbResult<CommandOutput> {
        let policy = self.deadlock_policy;
        let mut attempt_command = command.clone();
        let mut attempt = 1;
        loop {
            match self.execute_once(&attempt_command, attempt).await {
                Ok(output) => {
                    if attempt > 1 {
                        debug!(
                            connection = %self.identity.display_name(),
                            attempt,
                            "Command succeeded after deadlock retry"
                        );
                    }
                    return Ok(output);
                }
                Err(e) if e.is_deadlock() && attempt < policy.attempts => {
                    warn!(
                        connection = %self.identity.display_name(),
                        attempt,
                        max_attempts = policy.attempts,
                        delay_ms = policy.delay.as_millis() as u64,
                        error = %e,
                        "Deadlock detected; retrying on a fresh connection"
                    );
                    tokio::time::sleep(policy.delay).await;
                    attempt_command = Command {
                        params: clone_parameters_for_retry(&command.params),
                        ..command.clone()
                    };
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt on a connection of its own.
    async fn execute_once(&self, command: &Command, attempt: u32) -> DbResult<CommandOutput> {
        let mut connection =
            self.connector
                .connect(&self.identity)
                .await
                .map_err(|source| DbError::Connect {
                    connection: self.identity.display_name(),
                    source,
                })?;

        let result = connection.execute(command).await;
        if let Err(e) = connection.close().await {
            debug!(
                connection = %self.identity.display_name(),
                error = %e,
                "Failed to close standalone connection"
            );
        }

        result.map_err(|source| DbError::Command {
            connection: self.identity.display_name(),
            command: command.text.clone(),
            attempts: attempt,
            source,
        })
    }

    /// Log a terminal failure once and hand it to the failure sink.
    fn fail(&self, err: DbError, text: &str) -> DbError {
        error!(
            connection = %self.identity.display_name(),
            sql = %text,
            error = %err,
            "Command failed"
        );
        let record = FailureRecord::new(err.to_string(), self.identity.display_name(), text);
        if let Err(sink_err) = self.sink.record(&record) {
            debug!(error = %sink_err, "Failure sink rejected record");
        }
        err
    }
}

/// Parameters sent with a synthesized procedure batch.
///
/// Every parameter is declared with its input value (NULL for output-only
/// ones); the batch's own `SELECT` carries the output values back.
fn procedure_batch_parameters(params: &[SqlParameter]) -> Vec<SqlParameter> {
    params
        .iter()
        .map(|p| SqlParameter {
            name: p.name.clone(),
            sql_type: p.sql_type,
            direction: ParameterDirection::Input,
            value: if p.direction.sends_value() {
                p.value.clone()
            } else {
                SqlValue::Null
            },
        })
        .collect()
}

/// Creates executors that share a connector, settings and identity cache.
#[derive(Clone)]
pub struct ExecutorFactory {
    registry: ConnectionRegistry,
    connector: Arc<dyn Connector>,
    deadlock_policy: RetryPolicy,
    finalize_policy: RetryPolicy,
    command_timeout: Duration,
    sink: Arc<dyn FailureSink>,
    custom_prefix: String,
}

impl std::fmt::Debug for ExecutorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorFactory")
            .field("deadlock_policy", &self.deadlock_policy)
            .field("finalize_policy", &self.finalize_policy)
            .field("command_timeout", &self.command_timeout)
            .field("custom_prefix", &self.custom_prefix)
            .finish_non_exhaustive()
    }
}

impl ExecutorFactory {
    /// Validate `config` and build a factory on top of `connector`.
    pub fn new(config: &ToolkitConfig, connector: Arc<dyn Connector>) -> DbResult<Self> {
        config.validate().map_err(DbError::configuration)?;
        Ok(Self {
            registry: ConnectionRegistry::new(config.connection_settings()),
            connector,
            deadlock_policy: config.deadlock_policy(),
            finalize_policy: config.finalize_policy(),
            command_timeout: config.command_timeout(),
            sink: Arc::new(TracingFailureSink),
            custom_prefix: config.custom_prefix.clone(),
        })
    }

    /// Factory backed by the TDS driver.
    pub fn from_config(config: &ToolkitConfig) -> DbResult<Self> {
        let connector = TdsConnector::new(Duration::from_secs(config.connect_timeout));
        Self::new(config, Arc::new(connector))
    }

    /// Read `MSSQL_AMBIENT_*` settings, install the tracing subscriber and
    /// build a TDS-backed factory.
    pub fn from_env() -> DbResult<Self> {
        let config = ToolkitConfig::from_env()
            .map_err(|e| DbError::configuration(format!("Invalid configuration: {e}")))?;
        init_tracing(&config.log_config());
        let factory = Self::from_config(&config)?;
        info!(
            command_timeout_secs = config.command_timeout,
            deadlock_retry_attempts = config.deadlock_retry_attempts,
            finalize_retry_attempts = config.finalize_retry_attempts,
            "Executor factory configured"
        );
        Ok(factory)
    }

    pub fn with_failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Executor for `database` on `server`.
    pub fn executor(&self, server: &str, database: &str) -> DbResult<CommandExecutor> {
        let identity = self.registry.identity(server, database)?;
        Ok(CommandExecutor::new(identity, Arc::clone(&self.connector))
            .with_deadlock_policy(self.deadlock_policy)
            .with_command_timeout(self.command_timeout)
            .with_failure_sink(Arc::clone(&self.sink)))
    }

    /// Schema cache for `database` on `server` whose catalog queries run in
    /// `context`.
    pub fn schema_cache(
        &self,
        server: &str,
        database: &str,
        context: AmbientContext,
    ) -> DbResult<SchemaCache> {
        let executor = self.executor(server, database)?;
        Ok(SchemaCache::new(executor, context).with_custom_prefix(self.custom_prefix.as_str()))
    }

    /// A fresh call-chain context whose commits and rollbacks follow the
    /// configured finalization policy.
    pub fn context(&self) -> AmbientContext {
        AmbientContext::with_retry_policy(self.finalize_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::models::SqlType;

    fn executor() -> CommandExecutor {
        let identity = ConnectionIdentity::new("sql01", "Models", ConnectionSettings::default())
            .unwrap();
        CommandExecutor::new(identity, Arc::new(TdsConnector::default()))
    }

    #[test]
    fn test_executor_defaults() {
        let exec = executor();
        assert_eq!(exec.deadlock_policy.attempts, 5);
        assert_eq!(exec.command_timeout, Duration::from_secs(30));
        assert_eq!(exec.identity().key(), "sql01.models");
    }

    #[test]
    fn test_procedure_batch_selects_outputs() {
        let params = vec![
            SqlParameter::input("name", "a.bin"),
            SqlParameter::output("id", SqlType::BigInt),
            SqlParameter::input_output("version", SqlType::Int, 3),
        ];
        let batch = executor().procedure_batch("AddFile", &params);
        assert_eq!(
            batch,
            "USE [Models]; EXEC [dbo].[AddFile] @name = @name, @id = @id OUTPUT, \
             @version = @version OUTPUT; SELECT @id AS [id], @version AS [version];"
        );
    }

    #[test]
    fn test_procedure_batch_without_outputs() {
        let params = vec![SqlParameter::input("name", "a.bin")];
        let batch = executor().procedure_batch("audit.Touch", &params);
        assert_eq!(batch, "USE [Models]; EXEC [audit].[Touch] @name = @name;");
    }

    #[test]
    fn test_procedure_batch_parameters_are_inputs() {
        let mut out = SqlParameter::output("id", SqlType::BigInt);
        out.value = SqlValue::Int(5);
        let params = procedure_batch_parameters(&[
            out,
            SqlParameter::input_output("v", SqlType::Int, 3),
        ]);
        assert!(params.iter().all(|p| p.direction == ParameterDirection::Input));
        assert!(params[0].value.is_null());
        assert_eq!(params[1].value, SqlValue::Int(3));
    }

    #[test]
    fn test_factory_reuses_identities() {
        let factory = ExecutorFactory::from_config(&ToolkitConfig::default_config()).unwrap();
        let a = factory.executor("sql01", "Models").unwrap();
        let b = factory.executor("SQL01", "models").unwrap();
        assert_eq!(a.identity(), b.identity());
        assert_eq!(factory.registry().len(), 1);
        assert!(factory.executor("", "Models").is_err());
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let config = ToolkitConfig {
            finalize_retry_attempts: 0,
            ..ToolkitConfig::default_config()
        };
        let err = ExecutorFactory::from_config(&config).unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    #[test]
    fn test_factory_context_uses_finalize_policy() {
        let config = ToolkitConfig {
            finalize_retry_attempts: 2,
            finalize_retry_delay_ms: 10,
            ..ToolkitConfig::default_config()
        };
        let factory = ExecutorFactory::from_config(&config).unwrap();
        assert_eq!(
            factory.context().finalize_policy(),
            RetryPolicy::new(2, Duration::from_millis(10))
        );
    }
}
