//! Pattern set manager.
//!
//! Owns the current expression set and its compiled matcher. Readers take an
//! `Arc` snapshot and keep scanning against it even if an update swaps in a
//! new one; updates are serialized by a single writer lock that also owns the
//! durable store.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{error, info, warn};

use crate::error::{BasaliskResult, CompileError, PersistenceError};
use crate::expression::ExpressionSet;
use crate::matcher::Matcher;
use crate::storage::{DurableStore, RecoverySource};

/// Immutable view of the active rules.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Absent when the expression set is empty.
    pub matcher: Option<Arc<Matcher>>,
    pub expressions: ExpressionSet,
}

/// Result of a successful `update`.
#[derive(Debug)]
pub struct UpdateOutcome {
    /// The matcher now serving scans (absent if the set became empty).
    pub matcher: Option<Arc<Matcher>>,
    /// Whether the new state reached disk.
    pub persisted: Result<(), PersistenceError>,
}

impl UpdateOutcome {
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.persisted.is_ok()
    }
}

/// Single owner of the live pattern set.
#[derive(Debug)]
pub struct PatternSetManager {
    current: RwLock<Arc<Snapshot>>,
    writer: Mutex<DurableStore>,
    recovered_from: RecoverySource,
}

impl PatternSetManager {
    /// Loads the starting state from `store` and takes ownership of it.
    ///
    /// # Errors
    /// Only if recovery cannot produce any state (see `DurableStore::load`).
    pub fn initialize(store: DurableStore) -> BasaliskResult<Self> {
        let recovered = store.load()?;
        info!(
            source = ?recovered.source,
            patterns = recovered.expressions.len(),
            "pattern set initialized"
        );
        let snapshot = Snapshot {
            matcher: recovered.matcher.map(Arc::new),
            expressions: recovered.expressions,
        };
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(store),
            recovered_from: recovered.source,
        })
    }

    /// Consistent snapshot of the current matcher and expression set.
    #[must_use]
    pub fn current(&self) -> Arc<Snapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Where the startup state came from.
    #[must_use]
    pub const fn recovered_from(&self) -> RecoverySource {
        self.recovered_from
    }

    /// Applies `(current ∪ add) − remove`.
    ///
    /// The next set is compiled before anything changes: a compile error
    /// rejects the whole update and leaves the live state untouched. On
    /// success the new snapshot is swapped in and then persisted; a
    /// persistence failure is reported in the outcome but does not undo the
    /// swap.
    ///
    /// # Errors
    /// Returns the compile error when the next set does not compile.
    pub fn update(&self, add: &ExpressionSet, remove: &ExpressionSet) -> Result<UpdateOutcome, CompileError> {
        let store = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let next = self.current().expressions.apply(add, remove);
        let matcher = if next.is_empty() {
            None
        } else {
            Some(Arc::new(Matcher::compile(&next, store.compile_options())?))
        };

        let snapshot = Arc::new(Snapshot {
            matcher: matcher.clone(),
            expressions: next,
        });
        {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            *current = Arc::clone(&snapshot);
        }

        let persisted = store.save(matcher.as_deref(), &snapshot.expressions);
        match &persisted {
            Ok(()) => info!(
                added = add.len(),
                removed = remove.len(),
                patterns = snapshot.expressions.len(),
                "pattern set updated"
            ),
            Err(e) => error!(error = %e, "pattern set updated in memory but not persisted"),
        }
        if matcher.is_none() {
            warn!("pattern set is empty; scans are no-ops until rules are added");
        }

        Ok(UpdateOutcome { matcher, persisted })
    }
}
