//! Shared test backends
//!
//! [`BruteForceSolver`] decides queries exactly by enumerating every
//! byte assignment over the referenced symbolic arrays, so chain tests
//! get real semantics without an external solver. Capped at two
//! symbolic bytes total.

#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use symsolve::{
    render_query, symbolic_arrays, ArrayId, Assignment, ExprId, ExprStore, Query, QuerySolver,
    SolverError, SolverReply, SolverResult, Validity,
};

/// Per-operation call counts, shared with the test body.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub truth: Cell<usize>,
    pub validity: Cell<usize>,
    pub value: Cell<usize>,
    pub initial_values: Cell<usize>,
}

pub struct BruteForceSolver {
    store: Rc<ExprStore>,
    pub calls: Rc<CallCounts>,
}

impl BruteForceSolver {
    pub fn new(store: Rc<ExprStore>) -> Self {
        Self {
            store,
            calls: Rc::new(CallCounts::default()),
        }
    }

    pub fn counts(&self) -> Rc<CallCounts> {
        Rc::clone(&self.calls)
    }

    /// Model of `constraints && !goal` if one exists, projected onto
    /// `requested` in order.
    fn counterexample(&self, query: &Query, requested: &[ArrayId]) -> Option<Vec<Vec<u8>>> {
        let store = &self.store;
        let mut roots: Vec<ExprId> = query.constraints.iter().collect();
        roots.push(query.goal);
        let mut arrays = symbolic_arrays(store, &roots);
        for &a in requested {
            if !arrays.contains(&a) {
                arrays.push(a);
            }
        }
        let sizes: Vec<usize> = arrays
            .iter()
            .map(|&a| store.array_info(a).size as usize)
            .collect();
        let total: usize = sizes.iter().sum();
        assert!(total <= 2, "brute force is limited to two symbolic bytes");

        let mut flat = vec![0u8; total];
        loop {
            let mut values = Vec::with_capacity(sizes.len());
            let mut cursor = 0;
            for &size in &sizes {
                values.push(flat[cursor..cursor + size].to_vec());
                cursor += size;
            }
            let assignment = Assignment::new(&arrays, values.clone());
            let satisfied = query
                .constraints
                .iter()
                .all(|c| assignment.evaluate_bool(store, c))
                && !assignment.evaluate_bool(store, query.goal);
            if satisfied {
                let out = requested
                    .iter()
                    .map(|r| {
                        let pos = arrays.iter().position(|a| a == r).unwrap();
                        values[pos].clone()
                    })
                    .collect();
                return Some(out);
            }
            let mut i = 0;
            loop {
                if i == total {
                    return None;
                }
                if flat[i] == 255 {
                    flat[i] = 0;
                    i += 1;
                } else {
                    flat[i] += 1;
                    break;
                }
            }
        }
    }
}

impl QuerySolver for BruteForceSolver {
    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool> {
        self.calls.truth.set(self.calls.truth.get() + 1);
        Ok(self.counterexample(query, &[]).is_none())
    }

    fn compute_validity(&mut self, query: &Query) -> SolverResult<Validity> {
        self.calls.validity.set(self.calls.validity.get() + 1);
        if self.counterexample(query, &[]).is_none() {
            return Ok(Validity::True);
        }
        let negated = query.negate(&self.store);
        if self.counterexample(&negated, &[]).is_none() {
            return Ok(Validity::False);
        }
        Ok(Validity::Unknown)
    }

    fn compute_value(&mut self, query: &Query) -> SolverResult<ExprId> {
        self.calls.value.set(self.calls.value.get() + 1);
        let arrays = symbolic_arrays(&self.store, &[query.goal]);
        let relaxed = query.with_false(&self.store);
        let values = self
            .counterexample(&relaxed, &arrays)
            .ok_or_else(|| SolverError::Internal("constraint set is unsatisfiable".into()))?;
        let assignment = Assignment::new(&arrays, values);
        let value = assignment.evaluate(&self.store, query.goal);
        Ok(self.store.constant(value, self.store.width(query.goal)))
    }

    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[ArrayId],
    ) -> SolverResult<SolverReply> {
        self.calls
            .initial_values
            .set(self.calls.initial_values.get() + 1);
        match self.counterexample(query, arrays) {
            Some(values) => Ok(SolverReply::solution(values)),
            None => Ok(SolverReply::no_solution()),
        }
    }

    fn set_timeout(&mut self, _timeout: Duration) {}

    fn constraint_log(&mut self, query: &Query) -> SolverResult<String> {
        Ok(render_query(&self.store, query))
    }
}
