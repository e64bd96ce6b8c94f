//! In-process validity cache
//!
//! Queries are keyed on the constraint set plus a canonicalized goal:
//! the structurally smaller of the goal and its negation represents
//! both, so a query and its negation share one entry. Entries hold a
//! [`PartialValidity`], which definite answers serve directly and
//! one-sided answers (`MayBeTrue`/`MayBeFalse`) refine with a single
//! truth query against the inner solver.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::SolverResult;
use crate::expr::{ExprId, ExprStore};
use crate::query::{ConstraintSet, PartialValidity, Query, Validity};
use crate::solve::{QuerySolver, SolverReply, SolverStats};

/// Pick the cache representative for `goal`: the structurally smaller
/// of the goal and its negation. The flag records whether the negated
/// form won; callers negate cached values accordingly. Idempotent, and
/// `goal` and `not(goal)` map to the same representative with opposite
/// flags.
pub fn canonicalize_goal(store: &ExprStore, goal: ExprId) -> (ExprId, bool) {
    let negated = store.not(goal);
    if store.structural_cmp(goal, negated) == std::cmp::Ordering::Less {
        (goal, false)
    } else {
        (negated, true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    constraints: ConstraintSet,
    goal: ExprId,
}

/// Chain layer holding the in-process validity cache.
pub struct CachingSolver {
    store: Rc<ExprStore>,
    inner: Box<dyn QuerySolver>,
    stats: Arc<SolverStats>,
    cache: FxHashMap<CacheKey, PartialValidity>,
}

impl CachingSolver {
    pub fn new(store: Rc<ExprStore>, inner: Box<dyn QuerySolver>, stats: Arc<SolverStats>) -> Self {
        Self {
            store,
            inner,
            stats,
            cache: FxHashMap::default(),
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn key_for(&self, query: &Query) -> (CacheKey, bool) {
        let (goal, negated) = canonicalize_goal(&self.store, query.goal);
        (
            CacheKey {
                constraints: query.constraints.clone(),
                goal,
            },
            negated,
        )
    }

    fn lookup(&self, query: &Query) -> Option<PartialValidity> {
        let (key, negated) = self.key_for(query);
        self.cache.get(&key).copied().map(|pv| {
            if negated {
                pv.negate()
            } else {
                pv
            }
        })
    }

    /// Store `result` in canonical orientation. Re-inserting a key
    /// overwrites in place.
    fn insert(&mut self, query: &Query, result: PartialValidity) {
        let (key, negated) = self.key_for(query);
        let stored = if negated { result.negate() } else { result };
        self.cache.insert(key, stored);
    }
}

impl QuerySolver for CachingSolver {
    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool> {
        let cached = self.lookup(query);

        // a cached MayBeTrue still forces a check for a counterexample
        if let Some(pv) = cached {
            if pv != PartialValidity::MayBeTrue && pv != PartialValidity::None {
                self.stats.count_hit();
                return Ok(pv == PartialValidity::MustBeTrue);
            }
        }

        self.stats.count_miss();
        let is_valid = self.inner.compute_truth(query)?;

        let entry = if is_valid {
            PartialValidity::MustBeTrue
        } else if cached == Some(PartialValidity::MayBeTrue) {
            // a true assignment was known to exist, so now both sides do
            PartialValidity::TrueOrFalse
        } else {
            PartialValidity::MayBeFalse
        };
        self.insert(query, entry);
        Ok(is_valid)
    }

    fn compute_validity(&mut self, query: &Query) -> SolverResult<Validity> {
        match self.lookup(query) {
            Some(PartialValidity::MustBeTrue) => {
                self.stats.count_hit();
                Ok(Validity::True)
            }
            Some(PartialValidity::MustBeFalse) => {
                self.stats.count_hit();
                Ok(Validity::False)
            }
            Some(PartialValidity::TrueOrFalse) => {
                self.stats.count_hit();
                Ok(Validity::Unknown)
            }
            Some(PartialValidity::MayBeTrue) => {
                // refine with one truth query on the original query
                self.stats.count_miss();
                if self.inner.compute_truth(query)? {
                    self.insert(query, PartialValidity::MustBeTrue);
                    Ok(Validity::True)
                } else {
                    self.insert(query, PartialValidity::TrueOrFalse);
                    Ok(Validity::Unknown)
                }
            }
            Some(PartialValidity::MayBeFalse) => {
                self.stats.count_miss();
                let negated = query.negate(&self.store);
                if self.inner.compute_truth(&negated)? {
                    self.insert(query, PartialValidity::MustBeFalse);
                    Ok(Validity::False)
                } else {
                    self.insert(query, PartialValidity::TrueOrFalse);
                    Ok(Validity::Unknown)
                }
            }
            Some(PartialValidity::None) | None => {
                self.stats.count_miss();
                let result = self.inner.compute_validity(query)?;
                let entry = match result {
                    Validity::True => PartialValidity::MustBeTrue,
                    Validity::False => PartialValidity::MustBeFalse,
                    Validity::Unknown => PartialValidity::TrueOrFalse,
                };
                self.insert(query, entry);
                debug!(?result, entries = self.cache.len(), "validity cached");
                Ok(result)
            }
        }
    }

    fn compute_value(&mut self, query: &Query) -> SolverResult<ExprId> {
        self.stats.count_miss();
        self.inner.compute_value(query)
    }

    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[crate::expr::ArrayId],
    ) -> SolverResult<SolverReply> {
        self.stats.count_miss();
        self.inner.compute_initial_values(query, arrays)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.inner.set_timeout(timeout);
    }

    fn constraint_log(&mut self, query: &Query) -> SolverResult<String> {
        self.inner.constraint_log(query)
    }
}
