//! Integration tests for the command executor.

mod common;

use common::{FakeServer, ProgramUnitCatalog, identity, is_native_procedure, param};
use mssql_ambient::config::{RetryPolicy, ToolkitConfig};
use mssql_ambient::db::{AmbientContext, CommandExecutor, Connector, DriverError, ExecutorFactory};
use mssql_ambient::error::DbError;
use mssql_ambient::logging::MemoryFailureSink;
use mssql_ambient::models::{
    CommandOutput, DataTable, ParameterDirection, SqlParameter, SqlType, SqlValue,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const UPLOAD_PROC: &str = "CREATE PROCEDURE dbo.AddFile @name NVARCHAR(200), @id INT OUTPUT AS
BEGIN
    INSERT INTO Files (Name) VALUES (@name);
    SET @id = SCOPE_IDENTITY();
END";

fn setup() -> (FakeServer, CommandExecutor, Arc<MemoryFailureSink>) {
    let server = FakeServer::new();
    let sink = Arc::new(MemoryFailureSink::new());
    let connector: Arc<dyn Connector> = Arc::new(server.clone());
    let executor = CommandExecutor::new(identity("sql01", "Models"), connector)
        .with_failure_sink(sink.clone());
    (server, executor, sink)
}

fn deadlock() -> DriverError {
    DriverError::server(1205, "Transaction was deadlocked on lock resources")
}

fn outputs(values: &[(&str, SqlValue)]) -> CommandOutput {
    CommandOutput {
        rows_affected: 1,
        output_values: values
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<HashMap<_, _>>(),
        ..CommandOutput::default()
    }
}

// =========================================================================
// Deadlock retry
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_deadlock_outside_transaction_is_retried() {
    let (server, executor, sink) = setup();
    let ctx = AmbientContext::new();
    server.fail_when("UPDATE Files", deadlock(), 4);
    server.respond("UPDATE Files", |_| Some(outputs(&[("total", SqlValue::Int(42))])));

    let mut stale = SqlParameter::output("total", SqlType::BigInt);
    stale.value = SqlValue::Int(99);
    let mut params = vec![SqlParameter::input("size", 10), stale];

    let rows = executor
        .execute_non_query(
            &ctx,
            "UPDATE Files SET Size = @size; SET @total = @@ROWCOUNT",
            &mut params,
        )
        .await
        .unwrap();

    assert_eq!(rows, 1);
    assert_eq!(server.connection_count(), 5);
    assert_eq!(server.count("close"), 5);
    assert!(sink.records().is_empty());

    let attempts = server.commands_matching("UPDATE Files");
    assert_eq!(attempts.len(), 5);
    for (i, (_, command)) in attempts.iter().enumerate() {
        assert_eq!(param(command, "size").unwrap().value, SqlValue::Int(10));
        let total = param(command, "total").unwrap();
        assert_eq!(total.direction, ParameterDirection::Output);
        assert_eq!(total.sql_type, SqlType::BigInt);
        if i == 0 {
            assert_eq!(total.value, SqlValue::Int(99));
        } else {
            assert_eq!(total.value, SqlValue::Null);
        }
    }
    assert_eq!(params[1].value, SqlValue::Int(42));
}

#[tokio::test(start_paused = true)]
async fn test_deadlock_retries_are_bounded() {
    let (server, executor, sink) = setup();
    let ctx = AmbientContext::new();
    server.fail_when("UPDATE Files", deadlock(), 100);

    let err = executor
        .execute_non_query(&ctx, "UPDATE Files SET Size = 0", &mut [])
        .await
        .unwrap_err();

    match &err {
        DbError::Command {
            connection,
            command,
            attempts,
            source,
        } => {
            assert_eq!(connection, "sql01.Models");
            assert_eq!(command, "UPDATE Files SET Size = 0");
            assert_eq!(*attempts, 5);
            assert!(source.is_deadlock());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_deadlock());
    assert_eq!(server.count("execute"), 5);

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].connection, "sql01.Models");
    assert_eq!(records[0].command, "UPDATE Files SET Size = 0");
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_between_attempts() {
    let (server, executor, _) = setup();
    let executor = executor.with_deadlock_policy(RetryPolicy::new(3, Duration::from_secs(2)));
    let ctx = AmbientContext::new();
    server.fail_when("UPDATE Files", deadlock(), 2);

    let started = tokio::time::Instant::now();
    executor
        .execute_non_query(&ctx, "UPDATE Files SET Size = 0", &mut [])
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(4));
    assert_eq!(server.count("execute"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_deadlock_inside_transaction_is_not_retried() {
    let (server, executor, sink) = setup();
    let ctx = AmbientContext::new();
    server.fail_when("UPDATE Files", deadlock(), 1);

    let scope = ctx.create_transaction_scope(true);
    let err = executor
        .execute_non_query(&ctx, "UPDATE Files SET Size = 0", &mut [])
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Command { attempts: 1, .. }));
    assert!(err.is_deadlock());
    assert_eq!(server.count("execute"), 1);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(sink.records().len(), 1);

    scope.close().await.unwrap();
    assert_eq!(server.count("rollback"), 1);
    assert!(server.committed().is_empty());
}

#[tokio::test]
async fn test_other_errors_are_not_retried() {
    let (server, executor, _) = setup();
    let ctx = AmbientContext::new();
    server.fail_when(
        "INSERT INTO Files",
        DriverError::server(2627, "Violation of PRIMARY KEY constraint"),
        1,
    );

    let err = executor
        .execute_non_query(&ctx, "INSERT INTO Files VALUES (1)", &mut [])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Command { attempts: 1, .. }));
    assert!(!err.is_transient());
    assert_eq!(server.count("execute"), 1);
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let (server, executor, sink) = setup();
    let ctx = AmbientContext::new();
    server.fail_when(
        "CONNECT sql01.Models",
        DriverError::connection_lost("connection refused"),
        1,
    );

    let err = executor
        .get_scalar_value(&ctx, "SELECT 1", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Connect { .. }));
    assert_eq!(sink.records().len(), 1);
}

// =========================================================================
// Reads
// =========================================================================

#[tokio::test]
async fn test_reads_return_first_result_set() {
    let (server, executor, _) = setup();
    let ctx = AmbientContext::new();
    server.respond("FROM Files", |_| {
        Some(CommandOutput {
            result_sets: vec![DataTable::from_rows(
                vec!["Id".to_string(), "Name".to_string()],
                vec![
                    vec![SqlValue::Int(1), SqlValue::from("a.txt")],
                    vec![SqlValue::Int(2), SqlValue::from("b.txt")],
                ],
            )],
            ..CommandOutput::default()
        })
    });

    let table = executor
        .get_data_table(&ctx, "SELECT Id, Name FROM Files", &[])
        .await
        .unwrap();
    assert_eq!(table.rows.len(), 2);

    let row = executor
        .get_data_row(&ctx, "SELECT Id, Name FROM Files", &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get_str("name"), Some("a.txt"));

    let scalar = executor
        .get_scalar_value(&ctx, "SELECT Id, Name FROM Files", &[])
        .await
        .unwrap();
    assert_eq!(scalar, SqlValue::Int(1));

    let empty = executor
        .get_scalar_value(&ctx, "SELECT COUNT(*) FROM Missing", &[])
        .await
        .unwrap();
    assert_eq!(empty, SqlValue::Null);
}

// =========================================================================
// Stored procedures
// =========================================================================

#[tokio::test]
async fn test_procedure_without_transaction_is_native() {
    let (server, executor, _) = setup();
    let ctx = AmbientContext::new();
    server.respond("AddFile", |_| Some(outputs(&[("id", SqlValue::Int(7))])));

    let mut params = vec![
        SqlParameter::input("name", "report.pdf"),
        SqlParameter::output("id", SqlType::Int),
    ];
    executor
        .execute_procedure(&ctx, "AddFile", &mut params)
        .await
        .unwrap();

    let (_, command) = server.commands().pop().unwrap();
    assert!(is_native_procedure(&command));
    assert_eq!(command.text, "AddFile");
    assert_eq!(params[1].value, SqlValue::Int(7));
}

#[tokio::test]
async fn test_procedure_inside_transaction_selects_outputs() {
    let (server, executor, _) = setup();
    let ctx = AmbientContext::new();
    server.respond("EXEC [dbo].[AddFile]", |_| {
        Some(CommandOutput {
            result_sets: vec![DataTable::from_rows(
                vec!["id".to_string()],
                vec![vec![SqlValue::Int(8)]],
            )],
            rows_affected: 1,
            ..CommandOutput::default()
        })
    });

    let mut scope = ctx.create_transaction_scope(true);
    let mut params = vec![
        SqlParameter::input("name", "report.pdf"),
        SqlParameter::output("id", SqlType::Int),
    ];
    executor
        .execute_procedure(&ctx, "AddFile", &mut params)
        .await
        .unwrap();
    scope.complete().unwrap();
    scope.close().await.unwrap();

    let (_, command) = server.commands_matching("AddFile").pop().unwrap();
    assert!(!is_native_procedure(&command));
    assert_eq!(
        command.text,
        "USE [Models]; EXEC [dbo].[AddFile] @name = @name, @id = @id OUTPUT; SELECT @id AS [id];"
    );
    assert!(
        command
            .params
            .iter()
            .all(|p| p.direction == ParameterDirection::Input)
    );
    assert_eq!(params[1].value, SqlValue::Int(8));
}

// =========================================================================
// Program units
// =========================================================================

#[tokio::test]
async fn test_create_program_unit_sends_upsert_script() {
    let (server, executor, _) = setup();
    let ctx = AmbientContext::new();

    executor
        .create_program_unit(&ctx, "AddFile", UPLOAD_PROC)
        .await
        .unwrap();
    executor
        .create_program_unit(&ctx, "dbo.AddFile", UPLOAD_PROC)
        .await
        .unwrap();

    let scripts = server.commands_matching("sp_executesql @program_unit");
    assert_eq!(scripts.len(), 2);
    assert_eq!(scripts[0].1.text, scripts[1].1.text);
    let script = &scripts[0].1.text;
    assert!(script.contains("SET @keyword = N'ALTER'"));
    assert!(script.contains("EXEC (N'DROP FUNCTION [dbo].[AddFile]')"));
    assert!(script.contains("+ @keyword + N' PROCEDURE dbo.AddFile"));
}

#[tokio::test]
async fn test_program_unit_name_mismatch_never_reaches_server() {
    let (server, executor, _) = setup();
    let ctx = AmbientContext::new();

    let err = executor
        .create_program_unit(&ctx, "RemoveFile", UPLOAD_PROC)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ProgramUnitMismatch { .. }));
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_drop_program_unit_is_guarded() {
    let (server, executor, _) = setup();
    let ctx = AmbientContext::new();

    executor.drop_program_unit(&ctx, "AddFile").await.unwrap();
    let (_, command) = server.commands().pop().unwrap();
    assert!(command.text.contains("OBJECT_ID(N'[dbo].[AddFile]')"));
    assert!(command.text.contains("DROP PROCEDURE [dbo].[AddFile]"));
}

#[tokio::test]
async fn test_program_unit_second_upsert_takes_alter_path() {
    let (server, executor, _) = setup();
    let catalog = ProgramUnitCatalog::install(&server);
    let ctx = AmbientContext::new();

    for _ in 0..2 {
        executor
            .create_program_unit(&ctx, "AddFile", UPLOAD_PROC)
            .await
            .unwrap();
    }

    assert_eq!(
        catalog.actions(),
        vec!["CREATE [dbo].[AddFile]", "ALTER [dbo].[AddFile]"]
    );
    assert_eq!(catalog.type_of("[dbo].[AddFile]").as_deref(), Some("P"));
}

#[tokio::test]
async fn test_program_unit_of_other_kind_is_replaced() {
    let (server, executor, _) = setup();
    let catalog = ProgramUnitCatalog::install(&server);
    let ctx = AmbientContext::new();
    catalog.insert("[dbo].[Rate]", "FN");

    let procedure = "CREATE PROCEDURE dbo.Rate @id INT AS SELECT @id";
    executor
        .create_program_unit(&ctx, "Rate", procedure)
        .await
        .unwrap();
    assert_eq!(catalog.type_of("[dbo].[Rate]").as_deref(), Some("P"));

    let function = "-- rate lookup\nCREATE FUNCTION dbo.Rate (@id INT) RETURNS INT AS BEGIN RETURN @id END";
    executor
        .create_program_unit(&ctx, "Rate", function)
        .await
        .unwrap();
    assert_eq!(catalog.type_of("[dbo].[Rate]").as_deref(), Some("FN"));

    executor.drop_program_unit(&ctx, "Rate").await.unwrap();
    assert_eq!(catalog.type_of("[dbo].[Rate]"), None);
    assert_eq!(
        catalog.actions(),
        vec![
            "DROP FUNCTION [dbo].[Rate]",
            "CREATE [dbo].[Rate]",
            "DROP PROCEDURE [dbo].[Rate]",
            "CREATE [dbo].[Rate]",
            "DROP FUNCTION [dbo].[Rate]",
        ]
    );
}

// =========================================================================
// Factory
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_factory_applies_configuration() {
    let server = FakeServer::new();
    let mut config = ToolkitConfig::default_config();
    config.deadlock_retry_attempts = 2;
    let factory = ExecutorFactory::new(&config, Arc::new(server.clone())).unwrap();

    let executor = factory.executor("sql01", "Models").unwrap();
    assert_eq!(executor.identity().display_name(), "sql01.Models");
    assert_eq!(factory.registry().len(), 1);
    factory.executor("SQL01", "models").unwrap();
    assert_eq!(factory.registry().len(), 1);

    server.fail_when("UPDATE", deadlock(), 10);
    let err = executor
        .execute_non_query(&AmbientContext::new(), "UPDATE Files SET Size = 0", &mut [])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Command { attempts: 2, .. }));

    assert!(matches!(
        factory.executor("sql01", " "),
        Err(DbError::Configuration { .. })
    ));
}
