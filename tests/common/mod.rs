//! In-process SQL Server stand-in for integration tests.
//!
//! [`FakeServer`] implements [`Connector`]. Every connection it hands out
//! records its events (`#<n> connect|begin|execute|commit|rollback|close`)
//! in a shared log. Statements executed inside a driver transaction become
//! "committed" only when that transaction commits; statements executed
//! outside one are committed immediately. Failures and result sets are
//! scripted by substring of the command text. A connection dropped
//! without `close` records `drop`.
//!
//! [`ProgramUnitCatalog`] plays the part of `sys.objects` for the
//! create-or-alter and drop batches of procedures and functions.

#![allow(dead_code)]

use async_trait::async_trait;
use mssql_ambient::config::ConnectionSettings;
use mssql_ambient::db::{Connection, Connector, DriverError};
use mssql_ambient::models::{Command, CommandKind, CommandOutput, ConnectionIdentity, SqlParameter};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Arc<dyn Fn(&Command) -> Option<CommandOutput> + Send + Sync>;

struct ScriptedFailure {
    pattern: String,
    error: DriverError,
    remaining: usize,
}

#[derive(Default)]
struct ServerState {
    events: Vec<String>,
    commands: Vec<(usize, Command)>,
    committed: Vec<String>,
    failures: Vec<ScriptedFailure>,
    responders: Vec<(String, Responder)>,
    delays: Vec<(String, Duration)>,
    connections: usize,
    /// Connections numbered up to this one report `is_open() == false`
    killed_through: usize,
}

impl ServerState {
    fn take_failure(&mut self, subject: &str) -> Option<DriverError> {
        let failure = self
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && subject.contains(&f.pattern))?;
        failure.remaining -= 1;
        Some(failure.error.clone())
    }
}

#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    /// Fail the next `times` operations whose text contains `pattern`.
    /// `BEGIN TRANSACTION`, `COMMIT TRANSACTION`, `ROLLBACK TRANSACTION`
    /// and `CONNECT <server.database>` can be targeted as well.
    pub fn fail_when(&self, pattern: &str, error: DriverError, times: usize) {
        self.state().failures.push(ScriptedFailure {
            pattern: pattern.to_string(),
            error,
            remaining: times,
        });
    }

    /// Answer commands containing `pattern` with `respond`'s output.
    pub fn respond<F>(&self, pattern: &str, respond: F)
    where
        F: Fn(&Command) -> Option<CommandOutput> + Send + Sync + 'static,
    {
        self.state()
            .responders
            .push((pattern.to_string(), Arc::new(respond)));
    }

    /// Hold commands containing `pattern` for `delay` before answering.
    pub fn delay_when(&self, pattern: &str, delay: Duration) {
        self.state().delays.push((pattern.to_string(), delay));
    }

    /// Make every connection opened so far report itself closed.
    pub fn kill_connections(&self) {
        let mut state = self.state();
        state.killed_through = state.connections;
    }

    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    /// Events with the connection number stripped.
    pub fn actions(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|e| e.split_once(' ').map(|(_, a)| a.to_string()).unwrap_or(e))
            .collect()
    }

    pub fn commands(&self) -> Vec<(usize, Command)> {
        self.state().commands.clone()
    }

    /// Commands whose text contains `pattern`.
    pub fn commands_matching(&self, pattern: &str) -> Vec<(usize, Command)> {
        self.commands()
            .into_iter()
            .filter(|(_, c)| c.text.contains(pattern))
            .collect()
    }

    pub fn committed(&self) -> Vec<String> {
        self.state().committed.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections
    }

    pub fn count(&self, action: &str) -> usize {
        self.actions().iter().filter(|a| a.starts_with(action)).count()
    }
}

#[async_trait]
impl Connector for FakeServer {
    async fn connect(
        &self,
        identity: &ConnectionIdentity,
    ) -> Result<Box<dyn Connection>, DriverError> {
        let mut state = self.state();
        let subject = format!("CONNECT {}", identity.display_name());
        if let Some(err) = state.take_failure(&subject) {
            return Err(err);
        }
        state.connections += 1;
        let id = state.connections;
        state
            .events
            .push(format!("#{} connect {}", id, identity.display_name()));
        Ok(Box::new(FakeConnection {
            id,
            server: self.clone(),
            pending: Vec::new(),
            in_transaction: false,
            closed: false,
        }))
    }
}

pub struct FakeConnection {
    id: usize,
    server: FakeServer,
    pending: Vec<String>,
    in_transaction: bool,
    closed: bool,
}

impl FakeConnection {
    fn record(&self, action: &str) {
        self.server
            .state()
            .events
            .push(format!("#{} {}", self.id, action));
    }

    fn fail(&self, subject: &str) -> Result<(), DriverError> {
        match self.server.state().take_failure(subject) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn execute(&mut self, command: &Command) -> Result<CommandOutput, DriverError> {
        self.record(&format!("execute {}", command.text));
        self.server
            .state()
            .commands
            .push((self.id, command.clone()));
        let delay = self
            .server
            .state()
            .delays
            .iter()
            .find(|(pattern, _)| command.text.contains(pattern.as_str()))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.fail(&command.text)?;

        let responders = self.server.state().responders.clone();
        let output = responders
            .iter()
            .filter(|(pattern, _)| command.text.contains(pattern.as_str()))
            .find_map(|(_, respond)| respond(command))
            .unwrap_or_else(|| CommandOutput {
                rows_affected: 1,
                ..CommandOutput::default()
            });

        if self.in_transaction {
            self.pending.push(command.text.clone());
        } else {
            self.server.state().committed.push(command.text.clone());
        }
        Ok(output)
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.record("begin");
        self.fail("BEGIN TRANSACTION")?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.record("commit");
        self.fail("COMMIT TRANSACTION")?;
        let pending = std::mem::take(&mut self.pending);
        self.server.state().committed.extend(pending);
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.record("rollback");
        self.fail("ROLLBACK TRANSACTION")?;
        self.pending.clear();
        self.in_transaction = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.id > self.server.state().killed_through
    }

    async fn close(mut self: Box<Self>) -> Result<(), DriverError> {
        self.closed = true;
        self.record("close");
        Ok(())
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.record("drop");
        }
    }
}

static OBJECT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"OBJECT_ID\(N'((?:[^']|'')+)'\)").unwrap());
static ALTER_TYPES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"IN \(([^)]*)\)\s*SET @keyword = N'ALTER'").unwrap());
static DROP_BRANCHES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"IN \(([^)]*)\)\s*EXEC \(N'DROP (PROCEDURE|FUNCTION) ").unwrap()
});
static CREATED_KIND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)@keyword \+ N'\s*(PROCEDURE|PROC|FUNCTION)\b").unwrap());

fn type_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|t| t.trim().trim_matches('\'').to_string())
        .collect()
}

#[derive(Default)]
struct CatalogState {
    /// `[schema].[name]` -> `sys.objects.type`
    objects: HashMap<String, String>,
    actions: Vec<String>,
}

/// Simulated `sys.objects` that evaluates program-unit batches the way
/// SQL Server would: the batch's own type lists decide between CREATE,
/// ALTER and drop-then-CREATE.
#[derive(Clone, Default)]
pub struct ProgramUnitCatalog {
    state: Arc<Mutex<CatalogState>>,
}

impl ProgramUnitCatalog {
    pub fn install(server: &FakeServer) -> Self {
        let catalog = Self::default();
        let handle = catalog.clone();
        server.respond("FROM sys.objects WHERE [object_id] = OBJECT_ID(", move |command| {
            handle.run_batch(&command.text);
            None
        });
        catalog
    }

    pub fn insert(&self, object: &str, type_code: &str) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(object.to_string(), type_code.to_string());
    }

    pub fn type_of(&self, object: &str) -> Option<String> {
        self.state.lock().unwrap().objects.get(object).cloned()
    }

    /// `CREATE|ALTER|DROP <KIND> <object>` in execution order.
    pub fn actions(&self) -> Vec<String> {
        self.state.lock().unwrap().actions.clone()
    }

    fn run_batch(&self, text: &str) {
        let Some(object) = OBJECT_NAME.captures(text).map(|c| c[1].replace("''", "'")) else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        let existing = state.objects.get(&object).cloned();

        let mut dropped = false;
        if let Some(existing) = &existing {
            for branch in DROP_BRANCHES.captures_iter(text) {
                if type_list(&branch[1]).contains(existing) {
                    state.actions.push(format!("DROP {} {}", &branch[2], object));
                    state.objects.remove(&object);
                    dropped = true;
                    break;
                }
            }
        }

        let Some(created) = CREATED_KIND.captures(text) else {
            return;
        };
        let alter_types = ALTER_TYPES
            .captures(text)
            .map(|c| type_list(&c[1]))
            .unwrap_or_default();
        let keyword = match &existing {
            Some(t) if !dropped && alter_types.contains(t) => "ALTER",
            Some(_) if !dropped => {
                state.actions.push(format!("ERROR {}", object));
                return;
            }
            _ => "CREATE",
        };
        let type_code = if created[1].eq_ignore_ascii_case("FUNCTION") {
            "FN"
        } else {
            "P"
        };
        state.actions.push(format!("{} {}", keyword, object));
        if keyword == "CREATE" {
            state.objects.insert(object, type_code.to_string());
        }
    }
}

pub fn identity(server: &str, database: &str) -> ConnectionIdentity {
    ConnectionIdentity::new(server, database, ConnectionSettings::default()).unwrap()
}

/// Whether `command` is a stored procedure call dispatched natively.
pub fn is_native_procedure(command: &Command) -> bool {
    command.kind == CommandKind::StoredProcedure
}

pub fn param<'a>(command: &'a Command, name: &str) -> Option<&'a SqlParameter> {
    command
        .params
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
}
