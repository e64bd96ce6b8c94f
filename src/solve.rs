//! Solver abstraction, shared statistics and chain construction
//!
//! Every layer of the resolution chain (independence reduction, local
//! cache, remote cache, backend) implements [`QuerySolver`] and wraps
//! the next layer as a boxed trait object. The chain is built
//! explicitly by [`SolverChainBuilder`]; there is no global solver.

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::CachingSolver;
use crate::config::SolverConfig;
use crate::error::SolverResult;
use crate::expr::{ArrayId, ExprId, ExprStore};
use crate::independent::IndependentSolver;
use crate::query::{Query, Validity};
use crate::remote::RemoteCacheSolver;
use crate::z3::Z3Solver;

/// Counterexample reply for [`QuerySolver::compute_initial_values`].
///
/// `values[i]` holds the bytes of the i-th requested array when
/// `has_solution` is set; otherwise `values` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolverReply {
    pub has_solution: bool,
    pub values: Vec<Vec<u8>>,
}

impl SolverReply {
    pub fn no_solution() -> Self {
        Self {
            has_solution: false,
            values: Vec::new(),
        }
    }

    pub fn solution(values: Vec<Vec<u8>>) -> Self {
        Self {
            has_solution: true,
            values,
        }
    }
}

/// One layer of the resolution chain.
///
/// The chain is synchronous and single-threaded; methods take
/// `&mut self` because the cache layers mutate their state per query.
pub trait QuerySolver {
    /// True iff the constraints entail the goal.
    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool>;

    /// Three-valued validity of the goal under the constraints.
    fn compute_validity(&mut self, query: &Query) -> SolverResult<Validity>;

    /// A concrete constant the goal may evaluate to under the
    /// constraints.
    fn compute_value(&mut self, query: &Query) -> SolverResult<ExprId>;

    /// A counterexample (model of constraints plus negated goal)
    /// covering every array in `arrays`.
    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[ArrayId],
    ) -> SolverResult<SolverReply>;

    /// Propagates down to the backend. Zero disables the limit.
    fn set_timeout(&mut self, timeout: Duration);

    /// Textual dump of the query as the backend would receive it.
    fn constraint_log(&mut self, query: &Query) -> SolverResult<String>;
}

/// Counters shared across the chain.
#[derive(Debug, Default)]
pub struct SolverStats {
    queries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    queries_valid: AtomicU64,
    queries_invalid: AtomicU64,
}

impl SolverStats {
    pub(crate) fn count_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_valid(&self) {
        self.queries_valid.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_invalid(&self) {
        self.queries_invalid.fetch_add(1, Ordering::Relaxed);
    }

    /// Queries that reached a backend run.
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn queries_valid(&self) -> u64 {
        self.queries_valid.load(Ordering::Relaxed)
    }

    pub fn queries_invalid(&self) -> u64 {
        self.queries_invalid.load(Ordering::Relaxed)
    }

    /// Fraction of cache lookups that hit, or 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.cache_hits() as f64;
        let total = hits + self.cache_misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

/// Builds the resolution chain described by a [`SolverConfig`].
///
/// Layer order, outermost first: independence reduction, local cache,
/// remote cache, backend.
pub struct SolverChainBuilder {
    store: Rc<ExprStore>,
    config: SolverConfig,
    stats: Arc<SolverStats>,
}

impl SolverChainBuilder {
    pub fn new(store: Rc<ExprStore>, config: SolverConfig) -> Self {
        Self {
            store,
            config,
            stats: Arc::new(SolverStats::default()),
        }
    }

    /// Handle to the counters the chain will update.
    pub fn stats(&self) -> Arc<SolverStats> {
        Arc::clone(&self.stats)
    }

    /// Build the chain over a Z3 backend.
    pub fn build(self) -> SolverResult<Box<dyn QuerySolver>> {
        let backend: Box<dyn QuerySolver> = Box::new(Z3Solver::new(
            Rc::clone(&self.store),
            Arc::clone(&self.stats),
            self.config.z3_path.clone(),
            self.config.timeout,
        ));
        self.build_over(backend)
    }

    /// Build the chain over a caller-supplied backend. The configured
    /// timeout is pushed down before the layers are stacked.
    pub fn build_over(
        self,
        mut backend: Box<dyn QuerySolver>,
    ) -> SolverResult<Box<dyn QuerySolver>> {
        backend.set_timeout(self.config.timeout);
        let mut chain = backend;
        if self.config.use_remote_cache {
            chain = Box::new(RemoteCacheSolver::connect(
                Rc::clone(&self.store),
                chain,
                Arc::clone(&self.stats),
                &self.config.remote_addr,
            )?);
        }
        if self.config.use_cache {
            chain = Box::new(CachingSolver::new(
                Rc::clone(&self.store),
                chain,
                Arc::clone(&self.stats),
            ));
        }
        if self.config.use_independence {
            chain = Box::new(IndependentSolver::new(Rc::clone(&self.store), chain));
        }
        info!(
            independence = self.config.use_independence,
            cache = self.config.use_cache,
            remote = self.config.use_remote_cache,
            "solver chain built"
        );
        Ok(chain)
    }
}
