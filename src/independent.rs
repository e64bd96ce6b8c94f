//! Constraint independence analysis
//!
//! Two constraints are dependent when they may touch the same array
//! cells: either both read a common concrete offset, or one of them
//! reads the array through a symbolic index (which taints the whole
//! object). [`independent_constraints`] closes a query's goal over this
//! relation so the backend only sees the relevant constraints;
//! [`independent_partitions`] factors a whole constraint set into
//! disjoint groups.

use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::error::SolverResult;
use crate::expr::{for_each_node, ArrayId, ExprData, ExprId, ExprStore};
use crate::query::{ConstraintSet, Query, Validity};
use crate::solve::{QuerySolver, SolverReply};

/// Footprint of one or more expressions over the symbolic arrays.
#[derive(Debug, Clone, Default)]
pub struct ElementSet {
    /// Arrays read through at least one symbolic index.
    whole: FxHashSet<ArrayId>,
    /// Concretely-indexed offsets, per array not already in `whole`.
    elements: FxHashMap<ArrayId, BTreeSet<u32>>,
    /// Expressions this footprint was built from.
    exprs: Vec<ExprId>,
}

impl ElementSet {
    pub fn from_expr(store: &ExprStore, expr: ExprId) -> Self {
        let mut set = ElementSet {
            exprs: vec![expr],
            ..Default::default()
        };
        for_each_node(store, &[expr], |id| {
            if let ExprData::Read { root, index, updates } = store.data(id) {
                // a concrete array with no pending writes pins nothing
                if !store.array_info(root).is_symbolic() && updates.is_empty() {
                    return;
                }
                if set.whole.contains(&root) {
                    return;
                }
                match store.as_constant(index) {
                    Some(offset) => {
                        let offset = u32::try_from(offset).unwrap_or(u32::MAX);
                        set.elements.entry(root).or_default().insert(offset);
                    }
                    None => {
                        set.elements.remove(&root);
                        set.whole.insert(root);
                    }
                }
            }
        });
        set
    }

    pub fn exprs(&self) -> &[ExprId] {
        &self.exprs
    }

    pub fn intersects(&self, other: &ElementSet) -> bool {
        for array in &self.whole {
            if other.whole.contains(array) || other.elements.contains_key(array) {
                return true;
            }
        }
        for (array, offsets) in &self.elements {
            if other.whole.contains(array) {
                return true;
            }
            if let Some(theirs) = other.elements.get(array) {
                if offsets.iter().any(|o| theirs.contains(o)) {
                    return true;
                }
            }
        }
        false
    }

    /// Union `other` into `self`; returns whether the footprint grew.
    /// A concretely-indexed array meeting a whole-object reference
    /// widens to whole-object.
    pub fn add(&mut self, other: &ElementSet) -> bool {
        self.exprs.extend_from_slice(&other.exprs);
        let mut modified = false;
        for &array in &other.whole {
            if self.elements.remove(&array).is_some() {
                modified = true;
            }
            if self.whole.insert(array) {
                modified = true;
            }
        }
        for (&array, offsets) in &other.elements {
            if self.whole.contains(&array) {
                continue;
            }
            let mine = self.elements.entry(array).or_default();
            for &o in offsets {
                if mine.insert(o) {
                    modified = true;
                }
            }
        }
        modified
    }
}

/// The subset of `query.constraints` that transitively overlaps the
/// goal, in original order, together with the closed footprint.
pub fn independent_constraints(
    store: &ExprStore,
    query: &Query,
) -> (Vec<ExprId>, ElementSet) {
    let mut closure = ElementSet::from_expr(store, query.goal);
    let mut worklist: Vec<(ExprId, ElementSet)> = query
        .constraints
        .iter()
        .map(|c| (c, ElementSet::from_expr(store, c)))
        .collect();
    let mut required = FxHashSet::default();

    let mut done = false;
    while !done {
        done = true;
        let mut remaining = Vec::with_capacity(worklist.len());
        for (expr, set) in worklist {
            if set.intersects(&closure) {
                if closure.add(&set) {
                    done = false;
                }
                required.insert(expr);
            } else {
                remaining.push((expr, set));
            }
        }
        worklist = remaining;
    }

    let ordered: Vec<ExprId> = query
        .constraints
        .iter()
        .filter(|c| required.contains(c))
        .collect();
    (ordered, closure)
}

/// Factor `query.constraints` into independent groups. Overlap is
/// transitive: A and C land in one group whenever both overlap B, even
/// if they share nothing directly.
pub fn independent_partitions(store: &ExprStore, query: &Query) -> Vec<Vec<ExprId>> {
    let mut groups: Vec<ElementSet> = Vec::new();
    for c in query.constraints.iter() {
        let mut current = ElementSet::from_expr(store, c);
        let mut merged = Vec::with_capacity(groups.len());
        for group in groups {
            if group.intersects(&current) {
                current.add(&group);
            } else {
                merged.push(group);
            }
        }
        merged.push(current);
        groups = merged;
    }
    groups.into_iter().map(|g| g.exprs).collect()
}

/// Chain layer that drops constraints irrelevant to the goal before
/// passing a query down.
pub struct IndependentSolver {
    store: Rc<ExprStore>,
    inner: Box<dyn QuerySolver>,
}

impl IndependentSolver {
    pub fn new(store: Rc<ExprStore>, inner: Box<dyn QuerySolver>) -> Self {
        Self { store, inner }
    }

    fn reduce(&self, query: &Query) -> Query {
        let (required, _) = independent_constraints(&self.store, query);
        debug!(
            total = query.constraints.len(),
            kept = required.len(),
            "independence reduction"
        );
        Query::new(ConstraintSet::from_exprs(required), query.goal)
    }
}

impl QuerySolver for IndependentSolver {
    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool> {
        let reduced = self.reduce(query);
        self.inner.compute_truth(&reduced)
    }

    fn compute_validity(&mut self, query: &Query) -> SolverResult<Validity> {
        let reduced = self.reduce(query);
        self.inner.compute_validity(&reduced)
    }

    fn compute_value(&mut self, query: &Query) -> SolverResult<ExprId> {
        let reduced = self.reduce(query);
        self.inner.compute_value(&reduced)
    }

    // Forwarded unreduced: the model must cover every requested array,
    // including ones the reduction would drop.
    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[ArrayId],
    ) -> SolverResult<SolverReply> {
        self.inner.compute_initial_values(query, arrays)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.inner.set_timeout(timeout);
    }

    fn constraint_log(&mut self, query: &Query) -> SolverResult<String> {
        self.inner.constraint_log(query)
    }
}
