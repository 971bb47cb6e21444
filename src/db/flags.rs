//! Reentrant, named execution flags.
//!
//! A flag answers "is this call running inside operation X?" without passing
//! an extra parameter through every layer. [`ScopedFlags::begin`] raises a
//! flag and returns a guard; dropping the guard lowers it. The flag stays up
//! until every guard for it has been dropped, so nested and recursive
//! callers see consistent answers.
//!
//! Two variants exist:
//! - [`ScopedFlags`]: owned by a single logical session, not `Send`.
//! - [`SharedScopedFlags`]: cloneable across tasks and threads; map changes
//!   happen under a mutex and counters are atomic.
//!
//! Names are matched case-insensitively. A flag whose counter reaches zero
//! is removed from the map.

use crate::error::{DbError, DbResult};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Flag raised while a command must bypass the ambient transaction.
pub const SUPPRESS_TRANSACTION_FLAG: &str = "Suppress";

/// Flag raised while whole-database schema metadata extraction is active.
pub const SUMMARY_METADATA_FLAG: &str = "SummaryTablesMetadata";

fn flag_key(name: &str) -> String {
    name.to_lowercase()
}

/// Session-affine flag set backed by plain counters.
#[derive(Debug, Clone, Default)]
pub struct ScopedFlags {
    counters: Rc<RefCell<HashMap<String, usize>>>,
}

impl ScopedFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `name`, creating it on first use.
    #[must_use = "the flag is lowered as soon as the guard is dropped"]
    pub fn begin(&self, name: &str) -> ScopedFlagGuard {
        let key = flag_key(name);
        *self.counters.borrow_mut().entry(key.clone()).or_insert(0) += 1;
        ScopedFlagGuard {
            counters: Rc::clone(&self.counters),
            key,
        }
    }

    /// Whether `name` is currently raised.
    pub fn is(&self, name: &str) -> bool {
        self.counters.borrow().contains_key(&flag_key(name))
    }

    /// Fail unless `name` is currently raised.
    pub fn check(&self, name: &str) -> DbResult<()> {
        if self.is(name) {
            Ok(())
        } else {
            Err(DbError::not_in_context(name))
        }
    }

    /// Number of live guards for `name`.
    pub fn usage(&self, name: &str) -> usize {
        self.counters
            .borrow()
            .get(&flag_key(name))
            .copied()
            .unwrap_or(0)
    }
}

/// Guard returned by [`ScopedFlags::begin`].
#[derive(Debug)]
pub struct ScopedFlagGuard {
    counters: Rc<RefCell<HashMap<String, usize>>>,
    key: String,
}

impl Drop for ScopedFlagGuard {
    fn drop(&mut self) {
        let mut counters = self.counters.borrow_mut();
        match counters.get_mut(&self.key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counters.remove(&self.key);
            }
            None => warn!(flag = %self.key, "Scoped flag released more times than raised"),
        }
    }
}

/// Flag set that can be shared between tasks and threads.
#[derive(Debug, Clone, Default)]
pub struct SharedScopedFlags {
    counters: Arc<Mutex<HashMap<String, Arc<AtomicUsize>>>>,
}

impl SharedScopedFlags {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<AtomicUsize>>> {
        // A panic while holding the lock cannot leave a counter half-updated.
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Raise `name`, creating it on first use.
    #[must_use = "the flag is lowered as soon as the guard is dropped"]
    pub fn begin(&self, name: &str) -> SharedFlagGuard {
        let key = flag_key(name);
        {
            let mut counters = self.lock();
            counters
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .fetch_add(1, Ordering::AcqRel);
        }
        SharedFlagGuard {
            counters: Arc::clone(&self.counters),
            key,
        }
    }

    /// Whether `name` is currently raised.
    pub fn is(&self, name: &str) -> bool {
        self.lock().contains_key(&flag_key(name))
    }

    /// Fail unless `name` is currently raised.
    pub fn check(&self, name: &str) -> DbResult<()> {
        if self.is(name) {
            Ok(())
        } else {
            Err(DbError::not_in_context(name))
        }
    }

    /// Number of live guards for `name`.
    pub fn usage(&self, name: &str) -> usize {
        self.lock()
            .get(&flag_key(name))
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Guard returned by [`SharedScopedFlags::begin`].
#[derive(Debug)]
pub struct SharedFlagGuard {
    counters: Arc<Mutex<HashMap<String, Arc<AtomicUsize>>>>,
    key: String,
}

impl Drop for SharedFlagGuard {
    fn drop(&mut self) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(counter) = counters.get(&self.key) else {
            warn!(flag = %self.key, "Shared flag released more times than raised");
            return;
        };
        // Saturate at 0 so an extra release can never wrap the counter.
        let previous = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(1))
            })
            .unwrap_or(0);
        if previous <= 1 {
            counters.remove(&self.key);
        }
    }
}
