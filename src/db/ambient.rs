//! Ambient transaction coordination.
//!
//! An [`AmbientContext`] represents one logical call chain. It carries a
//! stack of [`AmbientTransaction`]s; only the top of the stack is current.
//! Code opens a [`TransactionScope`] around a unit of work, and every command
//! issued through a [`CommandExecutor`](crate::db::CommandExecutor) with the
//! same context joins the current transaction without it being passed around.
//!
//! Lifecycle of a transaction:
//! - Created by the first scope that asks for it (that scope owns it)
//! - Initialized lazily by the first command: a connection is opened, a
//!   driver transaction begun and the command's identity recorded as the
//!   entry point
//! - Finalized by the owning scope's [`TransactionScope::close`]: committed
//!   when the scope was completed, rolled back otherwise
//! - Completion or rollback callbacks run afterwards on a fresh context
//!
//! Contexts are `Send`; cloning one shares the call chain. Independent work
//! must use its own `AmbientContext::new()`.

use crate::config::RetryPolicy;
use crate::db::driver::{Connection, Connector, DriverError};
use crate::db::flags::{SUPPRESS_TRANSACTION_FLAG, SharedScopedFlags};
use crate::error::{DbError, DbResult};
use crate::models::{Command, CommandOutput, ConnectionIdentity};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::{debug, error, info, warn};

/// Deferred work run once a transaction has been finalized.
type TransactionCallback =
    Box<dyn FnOnce(AmbientContext) -> BoxFuture<'static, DbResult<()>> + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Generate a unique ambient transaction ID.
fn generate_transaction_id() -> String {
    format!("atx_{}", uuid::Uuid::new_v4().simple())
}

/// Lifecycle state of an [`AmbientTransaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created, no connection opened yet
    Initializing,
    /// Connection open and driver transaction begun
    Open,
    Committed,
    RolledBack,
    /// Connection released; terminal
    Disposed,
}

impl TransactionState {
    fn is_finalized(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Disposed)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Open => "open",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
struct Callbacks {
    completed: Vec<TransactionCallback>,
    rolled_back: Vec<TransactionCallback>,
}

/// A transaction joined implicitly by every command issued in its scope.
pub struct AmbientTransaction {
    id: String,
    /// Physical connection; the async lock keeps statements in issue order
    connection: tokio::sync::Mutex<Option<Box<dyn Connection>>>,
    entry_point: OnceLock<ConnectionIdentity>,
    state: Mutex<TransactionState>,
    usage_depth: AtomicUsize,
    completed: AtomicBool,
    committed: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl fmt::Debug for AmbientTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmbientTransaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("entry_point", &self.entry_point().map(|e| e.display_name()))
            .field("usage_depth", &self.usage_depth())
            .finish()
    }
}

impl AmbientTransaction {
    fn new() -> Self {
        Self {
            id: generate_transaction_id(),
            connection: tokio::sync::Mutex::new(None),
            entry_point: OnceLock::new(),
            state: Mutex::new(TransactionState::Initializing),
            usage_depth: AtomicUsize::new(1),
            completed: AtomicBool::new(false),
            committed: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: TransactionState) {
        *lock(&self.state) = state;
    }

    /// Identity of the first command that initialized the transaction.
    pub fn entry_point(&self) -> Option<&ConnectionIdentity> {
        self.entry_point.get()
    }

    /// Number of scopes currently sharing the transaction.
    pub fn usage_depth(&self) -> usize {
        self.usage_depth.load(Ordering::Acquire)
    }

    /// Whether the owning scope called `complete()`.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether the transaction was committed. Only meaningful once finalized.
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    /// Register work to run after a successful commit.
    ///
    /// The callback receives a fresh context with no transaction, so
    /// commands it issues run on their own connections.
    pub fn on_completed<F, Fut>(&self, callback: F) -> DbResult<()>
    where
        F: FnOnce(AmbientContext) -> Fut + Send + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        self.register(callback, true)
    }

    /// Register work to run after the transaction was rolled back.
    pub fn on_rolled_back<F, Fut>(&self, callback: F) -> DbResult<()>
    where
        F: FnOnce(AmbientContext) -> Fut + Send + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        self.register(callback, false)
    }

    fn register<F, Fut>(&self, callback: F, on_commit: bool) -> DbResult<()>
    where
        F: FnOnce(AmbientContext) -> Fut + Send + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        let state = self.state();
        if state.is_finalized() {
            return Err(DbError::transaction(
                format!("Cannot register a callback on a {} transaction", state),
                &self.id,
            ));
        }
        let boxed: TransactionCallback = Box::new(move |ctx| callback(ctx).boxed());
        let mut callbacks = lock(&self.callbacks);
        if on_commit {
            callbacks.completed.push(boxed);
        } else {
            callbacks.rolled_back.push(boxed);
        }
        Ok(())
    }

    /// Run `command` on the transaction's connection, initializing it first
    /// when this is the first database access.
    pub(crate) async fn execute(
        &self,
        connector: &dyn Connector,
        identity: &ConnectionIdentity,
        command: &Command,
    ) -> DbResult<CommandOutput> {
        let mut slot = self.connection.lock().await;

        let state = self.state();
        if state.is_finalized() {
            drop(slot.take());
            return Err(DbError::transaction(
                format!("Transaction is already {}", state),
                &self.id,
            ));
        }

        let connection = match slot.as_mut() {
            Some(connection) => {
                if let Some(entry_point) = self.entry_point() {
                    if !entry_point.is_same_server(identity) {
                        return Err(DbError::server_mismatch(
                            entry_point.server_name(),
                            identity.server_name(),
                        ));
                    }
                }
                if !connection.is_open() {
                    return Err(DbError::ConnectionClosed {
                        connection: identity.display_name(),
                        transaction_id: self.id.clone(),
                    });
                }
                connection
            }
            None => slot.insert(self.initialize(connector, identity).await?),
        };

        let result = connection
            .execute(command)
            .await
            .map_err(|source| DbError::Command {
                connection: identity.display_name(),
                command: command.text.clone(),
                attempts: 1,
                source,
            });

        // The scope was dropped while this command held the connection.
        if self.state() == TransactionState::Disposed {
            drop(slot.take());
            debug!(
                transaction_id = %self.id,
                "Released connection of abandoned transaction"
            );
        }
        result
    }

    async fn initialize(
        &self,
        connector: &dyn Connector,
        identity: &ConnectionIdentity,
    ) -> DbResult<Box<dyn Connection>> {
        let mut connection =
            connector
                .connect(identity)
                .await
                .map_err(|source| DbError::Connect {
                    connection: identity.display_name(),
                    source,
                })?;

        if let Err(source) = connection.begin().await {
            if let Err(close_err) = connection.close().await {
                debug!(error = %close_err, "Failed to close connection after BEGIN failure");
            }
            return Err(DbError::Command {
                connection: identity.display_name(),
                command: "BEGIN TRANSACTION".to_string(),
                attempts: 1,
                source,
            });
        }

        // Holding the connection lock makes this the only initializer.
        let _ = self.entry_point.set(identity.clone());
        self.set_state(TransactionState::Open);

        info!(
            transaction_id = %self.id,
            entry_point = %identity.display_name(),
            "Ambient transaction initialized"
        );
        Ok(connection)
    }

    /// Commit or roll back, then release the connection.
    async fn finalize(&self, commit: bool, policy: RetryPolicy) -> Option<DbError> {
        let mut slot = self.connection.lock().await;
        let Some(mut connection) = slot.take() else {
            // Never touched the database: nothing to commit physically.
            self.committed.store(commit, Ordering::Release);
            self.set_state(if commit {
                TransactionState::Committed
            } else {
                TransactionState::RolledBack
            });
            debug!(
                transaction_id = %self.id,
                committed = commit,
                "Finalized ambient transaction without a connection"
            );
            return None;
        };

        let operation = if commit { "commit" } else { "rollback" };
        let mut failure = None;
        for attempt in 1..=policy.attempts {
            let result = if commit {
                connection.commit().await
            } else {
                connection.rollback().await
            };
            match result {
                Ok(()) => {
                    debug!(
                        transaction_id = %self.id,
                        operation,
                        attempt,
                        "Finalization attempt succeeded"
                    );
                    failure = None;
                    break;
                }
                Err(e) => {
                    warn!(
                        transaction_id = %self.id,
                        operation,
                        attempt,
                        max_attempts = policy.attempts,
                        error = %e,
                        "Finalization attempt failed"
                    );
                    // A timed-out or reset session cannot finish the transaction.
                    let retry =
                        e.is_transient() && connection.is_open() && attempt < policy.attempts;
                    failure = Some(finalization_error(&self.id, operation, attempt, e));
                    if !retry {
                        break;
                    }
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }

        let committed = commit && failure.is_none();
        self.committed.store(committed, Ordering::Release);
        self.set_state(if committed {
            TransactionState::Committed
        } else {
            TransactionState::RolledBack
        });

        let close_failure = connection
            .close()
            .await
            .err()
            .map(|e| finalization_error(&self.id, "close", 1, e));

        match &failure {
            None => info!(
                transaction_id = %self.id,
                committed,
                "Ambient transaction finalized"
            ),
            Some(e) => error!(transaction_id = %self.id, error = %e, "Ambient transaction finalization failed"),
        }

        self.set_state(TransactionState::Disposed);
        DbError::combine(failure, close_failure)
    }

    /// Run the callbacks matching the outcome, each on a fresh context.
    async fn fire_callbacks(&self, policy: RetryPolicy) -> Option<DbError> {
        let callbacks = {
            let mut guard = lock(&self.callbacks);
            let taken = std::mem::take(&mut *guard);
            if self.is_committed() {
                taken.completed
            } else {
                taken.rolled_back
            }
        };
        if callbacks.is_empty() {
            return None;
        }

        debug!(
            transaction_id = %self.id,
            count = callbacks.len(),
            committed = self.is_committed(),
            "Running transaction callbacks"
        );
        let mut errors = Vec::new();
        for callback in callbacks {
            if let Err(e) = callback(AmbientContext::with_retry_policy(policy)).await {
                warn!(transaction_id = %self.id, error = %e, "Transaction callback failed");
                errors.push(e);
            }
        }
        (!errors.is_empty()).then(|| DbError::aggregate(errors))
    }

    /// Release the connection without a server round trip.
    ///
    /// Dropping the connection closes the session and the server rolls the
    /// transaction back. When a command is still running on it, the
    /// connection is released as soon as that command returns.
    fn abandon(&self) {
        self.committed.store(false, Ordering::Release);
        // Set first so a command holding the connection sees it on return.
        self.set_state(TransactionState::Disposed);
        match self.connection.try_lock() {
            Ok(mut slot) => {
                drop(slot.take());
            }
            Err(_) => debug!(
                transaction_id = %self.id,
                "Connection busy while abandoning transaction; released after the running command"
            ),
        }
        let skipped = {
            let mut guard = lock(&self.callbacks);
            let taken = std::mem::take(&mut *guard);
            taken.completed.len() + taken.rolled_back.len()
        };
        warn!(
            transaction_id = %self.id,
            skipped_callbacks = skipped,
            "Transaction scope dropped without close; transaction abandoned"
        );
    }
}

fn finalization_error(
    transaction_id: &str,
    operation: &'static str,
    attempts: u32,
    source: DriverError,
) -> DbError {
    DbError::Finalization {
        transaction_id: transaction_id.to_string(),
        operation,
        attempts,
        source,
    }
}

struct ContextInner {
    stack: Mutex<Vec<Arc<AmbientTransaction>>>,
    flags: SharedScopedFlags,
    finalize_policy: RetryPolicy,
}

/// The ambient state of one logical call chain.
#[derive(Clone)]
pub struct AmbientContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for AmbientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmbientContext")
            .field("depth", &self.depth())
            .field("suppressed", &self.is_suppressed())
            .finish()
    }
}

impl Default for AmbientContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AmbientContext {
    /// Create a transaction-free context with the default finalization policy.
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::finalize_default())
    }

    /// Create a context whose commits and rollbacks use `policy`.
    pub fn with_retry_policy(policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                stack: Mutex::new(Vec::new()),
                flags: SharedScopedFlags::new(),
                finalize_policy: policy,
            }),
        }
    }

    pub fn finalize_policy(&self) -> RetryPolicy {
        self.inner.finalize_policy
    }

    /// Execution flags of this call chain.
    pub fn flags(&self) -> &SharedScopedFlags {
        &self.inner.flags
    }

    /// The current transaction, if any.
    pub fn current(&self) -> Option<Arc<AmbientTransaction>> {
        lock(&self.inner.stack).last().cloned()
    }

    /// Number of transactions on the stack.
    pub fn depth(&self) -> usize {
        lock(&self.inner.stack).len()
    }

    /// Whether `transaction` is the current one.
    pub fn is_current(&self, transaction: &AmbientTransaction) -> bool {
        lock(&self.inner.stack)
            .last()
            .is_some_and(|top| std::ptr::eq(Arc::as_ptr(top), transaction))
    }

    pub fn is_suppressed(&self) -> bool {
        self.inner.flags.is(SUPPRESS_TRANSACTION_FLAG)
    }

    /// The transaction commands should join: `None` when there is no
    /// current transaction or the transaction is suppressed.
    pub fn active_transaction(&self) -> Option<Arc<AmbientTransaction>> {
        if self.is_suppressed() {
            None
        } else {
            self.current()
        }
    }

    /// Open a scope that joins the current transaction, or creates a new
    /// one when there is none or `create_new` is set.
    pub fn create_transaction_scope(&self, create_new: bool) -> TransactionScope {
        let mut stack = lock(&self.inner.stack);
        match stack.last() {
            Some(current) if !create_new => {
                let depth = current.usage_depth.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(
                    transaction_id = %current.id,
                    usage_depth = depth,
                    "Joined ambient transaction"
                );
                TransactionScope {
                    context: self.clone(),
                    transaction: Arc::clone(current),
                    owner: false,
                    completed: false,
                    closed: false,
                }
            }
            _ => {
                let transaction = Arc::new(AmbientTransaction::new());
                stack.push(Arc::clone(&transaction));
                debug!(
                    transaction_id = %transaction.id,
                    stack_depth = stack.len(),
                    "Created ambient transaction"
                );
                TransactionScope {
                    context: self.clone(),
                    transaction,
                    owner: true,
                    completed: false,
                    closed: false,
                }
            }
        }
    }

    /// Run `body` inside a scope. The scope is completed when `body`
    /// succeeds and always closed; failures of both are reported together.
    pub async fn execute_transaction<F, Fut, T>(&self, create_new: bool, body: F) -> DbResult<T>
    where
        F: FnOnce(AmbientContext) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut scope = self.create_transaction_scope(create_new);
        let result = body(self.clone()).await;
        let completion = match &result {
            Ok(_) => scope.complete().err(),
            Err(_) => None,
        };
        let closing = scope.close().await.err();

        match (result, DbError::combine(completion, closing)) {
            (Ok(value), None) => Ok(value),
            (Ok(_), Some(e)) => Err(e),
            (Err(e), None) => Err(e),
            (Err(e), Some(cleanup)) => Err(DbError::aggregate(vec![e, cleanup])),
        }
    }

    /// Run `body` with the ambient transaction bypassed: commands it issues
    /// open standalone connections even when a transaction is current.
    pub async fn suppress_transaction<F, Fut, T>(&self, body: F) -> T
    where
        F: FnOnce(AmbientContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.inner.flags.begin(SUPPRESS_TRANSACTION_FLAG);
        body(self.clone()).await
    }

    fn pop(&self, transaction: &Arc<AmbientTransaction>) {
        let mut stack = lock(&self.inner.stack);
        match stack.iter().rposition(|t| Arc::ptr_eq(t, transaction)) {
            Some(index) => {
                if index + 1 != stack.len() {
                    warn!(
                        transaction_id = %transaction.id,
                        "Closing a transaction that is not current"
                    );
                }
                stack.remove(index);
            }
            None => warn!(
                transaction_id = %transaction.id,
                "Transaction already removed from the ambient stack"
            ),
        }
    }
}

/// Handle on a unit of work that owns or joins an ambient transaction.
///
/// Call [`close`](Self::close) to finalize. Dropping an owning scope without
/// closing it abandons the transaction.
#[must_use = "a transaction scope must be closed"]
pub struct TransactionScope {
    context: AmbientContext,
    transaction: Arc<AmbientTransaction>,
    owner: bool,
    completed: bool,
    closed: bool,
}

impl fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("transaction_id", &self.transaction.id)
            .field("owner", &self.owner)
            .field("completed", &self.completed)
            .finish()
    }
}

impl TransactionScope {
    /// Whether this scope created the transaction and finalizes it.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn transaction(&self) -> &Arc<AmbientTransaction> {
        &self.transaction
    }

    /// Mark the unit of work as successful. May be called once.
    ///
    /// A joining scope records completion locally only; the owner decides.
    pub fn complete(&mut self) -> DbResult<()> {
        if self.completed {
            return Err(DbError::transaction(
                "Scope has already been completed",
                &self.transaction.id,
            ));
        }
        self.completed = true;
        if self.owner {
            self.transaction.completed.store(true, Ordering::Release);
        }
        debug!(
            transaction_id = %self.transaction.id,
            owner = self.owner,
            "Transaction scope completed"
        );
        Ok(())
    }

    /// Leave the scope. The owner commits or rolls back, releases the
    /// connection, pops the transaction and runs its callbacks.
    pub async fn close(mut self) -> DbResult<()> {
        self.closed = true;
        self.transaction.usage_depth.fetch_sub(1, Ordering::AcqRel);

        if !self.owner {
            debug!(
                transaction_id = %self.transaction.id,
                usage_depth = self.transaction.usage_depth(),
                "Left ambient transaction"
            );
            return Ok(());
        }

        let policy = self.context.finalize_policy();
        let finalization = self.transaction.finalize(self.completed, policy).await;
        self.context.pop(&self.transaction);
        let callbacks = self.transaction.fire_callbacks(policy).await;

        match DbError::combine(finalization, callbacks) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.transaction.usage_depth.fetch_sub(1, Ordering::AcqRel);
        if self.owner {
            self.context.pop(&self.transaction);
            self.transaction.abandon();
        }
    }
}
