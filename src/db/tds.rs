//! SQL Server driver over TDS.
//!
//! This module implements [`Connector`] and [`Connection`] with `tiberius`
//! running on a tokio TCP stream. It handles:
//! - Connection setup from the identity's ADO connection string
//! - Named parameters, declared in the batch and bound positionally
//! - Output parameter and `@@ROWCOUNT` capture through a trailing result set
//! - Per-command timeouts
//! - Mapping server errors to [`DriverError`] by error number

use crate::db::driver::{Connection, Connector, DriverError, DriverErrorKind};
use crate::models::{
    Command, CommandKind, CommandOutput, ConnectionIdentity, DataTable, SqlParameter, SqlType,
    SqlValue, qualify_object_name, quote_name,
};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures_util::TryStreamExt;
use std::time::Duration;
use tiberius::{Client, ColumnData, Config, QueryItem};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};
use uuid::Uuid;

type TdsClient = Client<Compat<TcpStream>>;

/// Column name of the row count in the capture result set.
const ROWS_AFFECTED_COLUMN: &str = "__rows_affected";

/// Opens TDS connections.
#[derive(Debug, Clone)]
pub struct TdsConnector {
    connect_timeout: Duration,
}

impl TdsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TdsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(
            crate::config::DEFAULT_CONNECT_TIMEOUT_SECS,
        ))
    }
}

#[async_trait]
impl Connector for TdsConnector {
    async fn connect(
        &self,
        identity: &ConnectionIdentity,
    ) -> Result<Box<dyn Connection>, DriverError> {
        let config = Config::from_ado_string(&identity.connection_string())
            .map_err(|e| DriverError::protocol(format!("Invalid connection string: {e}")))?;
        let timeout = identity
            .settings()
            .connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.connect_timeout);

        debug!(
            connection = %identity.display_name(),
            addr = %config.get_addr(),
            connection_string = %identity.masked_connection_string(),
            "Opening SQL Server connection"
        );

        let client = tokio::time::timeout(timeout, async {
            let tcp = TcpStream::connect(config.get_addr())
                .await
                .map_err(|e| DriverError::connection_lost(e.to_string()))?;
            tcp.set_nodelay(true).ok();
            Client::connect(config, tcp.compat_write())
                .await
                .map_err(map_tiberius_error)
        })
        .await
        .map_err(|_| {
            DriverError::timeout(format!(
                "Connecting to {} timed out after {:?}",
                identity.display_name(),
                timeout
            ))
        })??;

        Ok(Box::new(TdsConnection {
            client,
            broken: false,
        }))
    }
}

/// One open TDS session.
pub struct TdsConnection {
    client: TdsClient,
    broken: bool,
}

impl TdsConnection {
    async fn run_batch(&mut self, sql: &str) -> Result<(), DriverError> {
        let stream = self
            .client
            .simple_query(sql)
            .await
            .map_err(map_tiberius_error)?;
        stream.into_results().await.map_err(map_tiberius_error)?;
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T, DriverError>) -> Result<T, DriverError> {
        if let Err(e) = &result {
            if e.is_connection_lost() || e.kind == DriverErrorKind::Timeout {
                self.broken = true;
            }
        }
        result
    }
}

#[async_trait]
impl Connection for TdsConnection {
    async fn execute(&mut self, command: &Command) -> Result<CommandOutput, DriverError> {
        let batch = build_batch(command);
        let timeout = command.timeout;

        let result = tokio::time::timeout(timeout, async {
            let mut query = tiberius::Query::new(batch.as_str());
            for param in command.params.iter().filter(|p| p.direction.sends_value()) {
                bind_parameter(&mut query, param);
            }
            let mut stream = query
                .query(&mut self.client)
                .await
                .map_err(map_tiberius_error)?;

            let mut tables: Vec<(Vec<String>, Vec<Vec<SqlValue>>)> = Vec::new();
            while let Some(item) = stream.try_next().await.map_err(map_tiberius_error)? {
                match item {
                    QueryItem::Metadata(meta) => tables.push((
                        meta.columns().iter().map(|c| c.name().to_string()).collect(),
                        Vec::new(),
                    )),
                    QueryItem::Row(row) => match tables.last_mut() {
                        Some((_, rows)) => rows.push(convert_row(&row)),
                        None => {
                            return Err(DriverError::protocol("Row received before metadata"));
                        }
                    },
                }
            }
            Ok::<_, DriverError>(tables)
        })
        .await
        .map_err(|_| DriverError::timeout(format!("Command timed out after {:?}", timeout)))
        .and_then(|r| r);

        let tables = self.track(result)?;
        Ok(split_capture(command, tables))
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        let result = self.run_batch("BEGIN TRANSACTION").await;
        self.track(result)
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        let result = self.run_batch("COMMIT TRANSACTION").await;
        self.track(result)
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        let result = self.run_batch("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await;
        self.track(result)
    }

    fn is_open(&self) -> bool {
        !self.broken
    }

    async fn close(self: Box<Self>) -> Result<(), DriverError> {
        if self.broken {
            // Nothing to say goodbye to.
            return Ok(());
        }
        self.client.close().await.map_err(map_tiberius_error)
    }
}

/// Build the full batch sent for `command`.
///
/// ```text
/// DECLARE @id BIGINT = @P1;
/// DECLARE @newId INT;
/// <command text>
/// ;SELECT CAST(@@ROWCOUNT AS BIGINT) AS [__rows_affected], @newId AS [newId];
/// ```
pub(crate) fn build_batch(command: &Command) -> String {
    let mut batch = String::new();
    let mut position = 0;
    for param in &command.params {
        if param.direction.sends_value() {
            position += 1;
            batch.push_str(&format!(
                "DECLARE {} {} = @P{};\n",
                param.placeholder(),
                param.sql_type.declaration(),
                position
            ));
        } else {
            batch.push_str(&format!(
                "DECLARE {} {};\n",
                param.placeholder(),
                param.sql_type.declaration()
            ));
        }
    }

    match command.kind {
        CommandKind::Text => batch.push_str(&command.text),
        CommandKind::StoredProcedure => {
            let args: Vec<String> = command
                .params
                .iter()
                .map(|p| {
                    if p.direction.returns_value() {
                        format!("{0} = {0} OUTPUT", p.placeholder())
                    } else {
                        format!("{0} = {0}", p.placeholder())
                    }
                })
                .collect();
            batch.push_str(&format!(
                "EXEC {} {}",
                qualify_object_name(&command.text),
                args.join(", ")
            ));
        }
    }

    let mut capture = vec![format!(
        "CAST(@@ROWCOUNT AS BIGINT) AS {}",
        quote_name(ROWS_AFFECTED_COLUMN)
    )];
    capture.extend(
        command
            .params
            .iter()
            .filter(|p| p.direction.returns_value())
            .map(|p| format!("{} AS {}", p.placeholder(), quote_name(&p.name))),
    );
    batch.push_str(&format!("\n;SELECT {};", capture.join(", ")));
    batch
}

/// Separate the capture result set from the caller's result sets.
fn split_capture(
    command: &Command,
    mut tables: Vec<(Vec<String>, Vec<Vec<SqlValue>>)>,
) -> CommandOutput {
    let mut output = CommandOutput::default();
    let is_capture = tables.last().is_some_and(|(columns, _)| {
        columns
            .first()
            .is_some_and(|c| c.eq_ignore_ascii_case(ROWS_AFFECTED_COLUMN))
    });

    if is_capture {
        if let Some((columns, rows)) = tables.pop() {
            if let Some(values) = rows.into_iter().next() {
                for (column, value) in columns.iter().zip(values) {
                    if column.eq_ignore_ascii_case(ROWS_AFFECTED_COLUMN) {
                        output.rows_affected = value.as_i64().unwrap_or(0).max(0) as u64;
                    } else {
                        output.output_values.insert(column.to_lowercase(), value);
                    }
                }
            }
        }
    } else if command.params.iter().any(|p| p.direction.returns_value()) {
        warn!("Command ended before output parameters could be captured");
    }

    output.result_sets = tables
        .into_iter()
        .map(|(columns, rows)| DataTable::from_rows(columns, rows))
        .collect();
    output
}

fn bind_parameter<'a>(query: &mut tiberius::Query<'a>, param: &SqlParameter) {
    match (&param.value, param.sql_type) {
        (SqlValue::Null, SqlType::Bit) => query.bind(Option::<bool>::None),
        (SqlValue::Null, SqlType::Int | SqlType::BigInt) => query.bind(Option::<i64>::None),
        (SqlValue::Null, SqlType::Float | SqlType::Decimal { .. }) => {
            query.bind(Option::<f64>::None)
        }
        (SqlValue::Null, SqlType::VarBinary(_)) => query.bind(Option::<Vec<u8>>::None),
        (SqlValue::Null, SqlType::DateTime2) => query.bind(Option::<NaiveDateTime>::None),
        (SqlValue::Null, SqlType::UniqueIdentifier) => query.bind(Option::<Uuid>::None),
        (SqlValue::Null, SqlType::NVarChar(_)) => query.bind(Option::<String>::None),
        (SqlValue::Bool(v), _) => query.bind(*v),
        (SqlValue::Int(v), _) => query.bind(*v),
        (SqlValue::Float(v), _) => query.bind(*v),
        (SqlValue::String(v), _) => query.bind(v.clone()),
        (SqlValue::Bytes(v), _) => query.bind(v.clone()),
        (SqlValue::DateTime(v), _) => query.bind(*v),
        (SqlValue::Guid(v), _) => query.bind(*v),
    }
}

fn convert_column_data(data: &ColumnData<'_>) -> SqlValue {
    match data {
        ColumnData::Bit(Some(b)) => SqlValue::Bool(*b),
        ColumnData::U8(Some(v)) => SqlValue::Int(i64::from(*v)),
        ColumnData::I16(Some(v)) => SqlValue::Int(i64::from(*v)),
        ColumnData::I32(Some(v)) => SqlValue::Int(i64::from(*v)),
        ColumnData::I64(Some(v)) => SqlValue::Int(*v),
        ColumnData::F32(Some(v)) => SqlValue::Float(f64::from(*v)),
        ColumnData::F64(Some(v)) => SqlValue::Float(*v),
        ColumnData::Numeric(Some(n)) => {
            SqlValue::Float(n.value() as f64 / 10f64.powi(i32::from(n.scale())))
        }
        ColumnData::String(Some(s)) => SqlValue::String(s.to_string()),
        ColumnData::Guid(Some(g)) => SqlValue::Guid(*g),
        ColumnData::Binary(Some(b)) => SqlValue::Bytes(b.to_vec()),
        ColumnData::Xml(Some(xml)) => SqlValue::String(xml.to_string()),
        _ => SqlValue::Null,
    }
}

fn convert_row(row: &tiberius::Row) -> Vec<SqlValue> {
    row.cells()
        .enumerate()
        .map(|(i, (_, data))| match data {
            ColumnData::DateTime(Some(_))
            | ColumnData::SmallDateTime(Some(_))
            | ColumnData::DateTime2(Some(_)) => row
                .try_get::<NaiveDateTime, _>(i)
                .ok()
                .flatten()
                .map(SqlValue::DateTime)
                .unwrap_or(SqlValue::Null),
            ColumnData::DateTimeOffset(Some(_)) => row
                .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                .ok()
                .flatten()
                .map(|dt| SqlValue::DateTime(dt.naive_utc()))
                .unwrap_or(SqlValue::Null),
            ColumnData::Date(Some(_)) => row
                .try_get::<NaiveDate, _>(i)
                .ok()
                .flatten()
                .map(|d| SqlValue::DateTime(d.and_time(NaiveTime::MIN)))
                .unwrap_or(SqlValue::Null),
            ColumnData::Time(Some(_)) => row
                .try_get::<NaiveTime, _>(i)
                .ok()
                .flatten()
                .map(|t| SqlValue::String(t.format("%H:%M:%S%.f").to_string()))
                .unwrap_or(SqlValue::Null),
            _ => convert_column_data(data),
        })
        .collect()
}

/// Classify a tiberius error by server error number or transport failure.
fn map_tiberius_error(err: tiberius::error::Error) -> DriverError {
    match err {
        tiberius::error::Error::Server(token) => DriverError::server(token.code(), token.message()),
        tiberius::error::Error::Io { message, .. } => DriverError::connection_lost(message),
        other => DriverError::protocol(other.to_string()),
    }
}
