//! Query resolution for symbolic execution
//!
//! A symbolic-execution engine asks the same shape of question over and
//! over: given a set of path constraints over symbolic byte arrays, is
//! a boolean goal entailed, and if not, what concrete bytes refute it?
//! This crate answers those questions through a layered chain:
//!
//! 1. [`IndependentSolver`] drops constraints that cannot influence the
//!    goal before anything expensive runs.
//! 2. [`CachingSolver`] keeps an in-process map from canonicalized
//!    queries to five-valued [`PartialValidity`] knowledge.
//! 3. [`RemoteCacheSolver`] consults a cache daemon over TCP, keyed on
//!    the query's SMT-LIB text, so results survive across runs.
//! 4. [`Z3Solver`] settles misses with a fresh `z3` process per query.
//!
//! Expressions are interned in an [`ExprStore`] arena and passed around
//! as [`ExprId`] handles. The chain is assembled explicitly:
//!
//! ```no_run
//! use std::rc::Rc;
//! use symsolve::{ConstraintSet, ExprStore, Query, SolverChainBuilder, SolverConfig};
//!
//! let store = Rc::new(ExprStore::new());
//! let x = store.array("x", 1);
//! let byte = store.read_byte(x, 0);
//! let goal = store.ult(byte, store.constant(10u32, 8));
//!
//! let mut chain = SolverChainBuilder::new(Rc::clone(&store), SolverConfig::default())
//!     .build()
//!     .unwrap();
//! let validity = chain
//!     .compute_validity(&Query::new(ConstraintSet::new(), goal))
//!     .unwrap();
//! println!("{validity:?}");
//! ```

mod cache;
mod config;
mod error;
mod expr;
mod independent;
mod query;
mod remote;
mod smtlib;
mod solve;
mod z3;

pub use cache::{canonicalize_goal, CachingSolver};
pub use config::SolverConfig;
pub use error::{SolverError, SolverResult};
pub use expr::{
    for_each_node, symbolic_arrays, Array, ArrayId, ExprData, ExprId, ExprStore, Width,
};
pub use independent::{
    independent_constraints, independent_partitions, ElementSet, IndependentSolver,
};
pub use query::{Assignment, ConstraintSet, PartialValidity, Query, Validity};
pub use remote::{parse_check_reply, RemoteAnswer, RemoteCacheClient, RemoteCacheSolver};
pub use smtlib::{render_query, SmtLibPrinter};
pub use solve::{QuerySolver, SolverChainBuilder, SolverReply, SolverStats};
pub use z3::Z3Solver;
