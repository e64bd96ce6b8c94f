//! Z3 backend adapter
//!
//! Bottom of the chain. Each query runs a fresh `z3 -smt2 -in` process
//! over the rendered SMT-LIB script: constraints plus the negated goal,
//! `(check-sat)`, and one `(get-value ...)` per requested array cell.
//! `unsat` means the query is valid; `sat` yields the counter-model.
//! Output parsing is lenient and line-oriented.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{SolverError, SolverResult};
use crate::expr::{symbolic_arrays, ArrayId, ExprId, ExprStore};
use crate::query::{Assignment, Query, Validity};
use crate::smtlib::render_query;
use crate::solve::{QuerySolver, SolverReply, SolverStats};

/// Subprocess-backed SMT solver.
pub struct Z3Solver {
    store: Rc<ExprStore>,
    stats: Arc<SolverStats>,
    z3_path: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
enum CheckSat {
    Sat,
    Unsat,
}

impl Z3Solver {
    pub fn new(
        store: Rc<ExprStore>,
        stats: Arc<SolverStats>,
        z3_path: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            stats,
            z3_path,
            timeout,
        }
    }

    fn build_script(&self, query: &Query, arrays: Option<&[ArrayId]>) -> String {
        let mut script = String::new();
        let ms = self.timeout.as_millis();
        if ms > 0 {
            script.push_str(&format!("(set-option :timeout {ms})\n"));
        }
        script.push_str("(set-option :produce-models true)\n");
        script.push_str(&render_query(&self.store, query));
        script.push_str("(check-sat)\n(get-info :reason-unknown)\n");
        if let Some(arrays) = arrays {
            for &array in arrays {
                let info = self.store.array_info(array);
                for offset in 0..info.size {
                    script.push_str(&format!(
                        "(get-value ((select |{}| (_ bv{offset} 32))))\n",
                        info.name
                    ));
                }
            }
        }
        script.push_str("(exit)\n");
        script
    }

    /// Solve constraints plus negated goal. `has_solution` reports a
    /// counterexample; a model is decoded only when `arrays` is given.
    fn run(&mut self, query: &Query, arrays: Option<&[ArrayId]>) -> SolverResult<SolverReply> {
        self.stats.count_query();
        let script = self.build_script(query, arrays);
        let mut child = Command::new(&self.z3_path)
            .arg("-smt2")
            .arg("-in")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SolverError::Backend(format!(
                    "failed to spawn {}: {e}",
                    self.z3_path.display()
                ))
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(bytes = stdout.len(), "backend replied");

        match classify(&stdout)? {
            CheckSat::Unsat => {
                self.stats.count_valid();
                Ok(SolverReply::no_solution())
            }
            CheckSat::Sat => {
                self.stats.count_invalid();
                let values = match arrays {
                    Some(arrays) => extract_model(&self.store, arrays, &stdout),
                    None => Vec::new(),
                };
                Ok(SolverReply::solution(values))
            }
        }
    }
}

impl QuerySolver for Z3Solver {
    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool> {
        let reply = self.run(query, None)?;
        Ok(!reply.has_solution)
    }

    fn compute_validity(&mut self, query: &Query) -> SolverResult<Validity> {
        if self.compute_truth(query)? {
            return Ok(Validity::True);
        }
        let negated = query.negate(&self.store);
        if self.compute_truth(&negated)? {
            return Ok(Validity::False);
        }
        Ok(Validity::Unknown)
    }

    fn compute_value(&mut self, query: &Query) -> SolverResult<ExprId> {
        // any model of the constraints alone fixes a value for the goal
        let arrays = symbolic_arrays(&self.store, &[query.goal]);
        let relaxed = query.with_false(&self.store);
        let reply = self.run(&relaxed, Some(&arrays))?;
        if !reply.has_solution {
            return Err(SolverError::Internal(
                "constraint set is unsatisfiable".to_string(),
            ));
        }
        let assignment = Assignment::new(&arrays, reply.values);
        let value = assignment.evaluate(&self.store, query.goal);
        Ok(self.store.constant(value, self.store.width(query.goal)))
    }

    fn compute_initial_values(
        &mut self,
        query: &Query,
        arrays: &[ArrayId],
    ) -> SolverResult<SolverReply> {
        self.run(query, Some(arrays))
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn constraint_log(&mut self, query: &Query) -> SolverResult<String> {
        Ok(render_query(&self.store, query))
    }
}

fn classify(stdout: &str) -> SolverResult<CheckSat> {
    for line in stdout.lines() {
        match line.trim() {
            "sat" => return Ok(CheckSat::Sat),
            "unsat" => return Ok(CheckSat::Unsat),
            "unknown" => {
                let reason = extract_reason(stdout).unwrap_or_else(|| "unknown".to_string());
                return if reason.contains("timeout")
                    || reason.contains("canceled")
                    || reason.contains("resource limits reached")
                {
                    Err(SolverError::Timeout)
                } else {
                    Err(SolverError::Backend(format!(
                        "solver returned unknown: {reason}"
                    )))
                };
            }
            _ => {}
        }
    }
    Err(SolverError::Backend(format!(
        "unexpected solver output: {:?}",
        stdout.lines().next().unwrap_or("")
    )))
}

fn extract_reason(stdout: &str) -> Option<String> {
    let start = stdout.find(":reason-unknown")?;
    let rest = &stdout[start + ":reason-unknown".len()..];
    let end = rest.find(')')?;
    Some(rest[..end].trim().trim_matches('"').to_string())
}

/// Collect the byte values answered for the `get-value` reads, in
/// request order, and split them per array. Cells the solver left out
/// complete to zero.
fn extract_model(store: &ExprStore, arrays: &[ArrayId], stdout: &str) -> Vec<Vec<u8>> {
    let mut bytes: Vec<u8> = Vec::new();
    for line in stdout.lines() {
        if !line.contains("(select ") {
            continue;
        }
        bytes.push(parse_value_literal(line).unwrap_or(0));
    }

    let total: usize = arrays
        .iter()
        .map(|&a| store.array_info(a).size as usize)
        .sum();
    if bytes.len() < total {
        warn!(
            got = bytes.len(),
            expected = total,
            "incomplete model, missing cells read as zero"
        );
    }

    let mut out = Vec::with_capacity(arrays.len());
    let mut cursor = 0;
    for &array in arrays {
        let size = store.array_info(array).size as usize;
        let chunk = (0..size)
            .map(|i| bytes.get(cursor + i).copied().unwrap_or(0))
            .collect();
        cursor += size;
        out.push(chunk);
    }
    out
}

/// Rightmost value literal on a `get-value` echo line: `#x..`, `#b..`
/// or `(_ bvN W)`.
fn parse_value_literal(line: &str) -> Option<u8> {
    let candidates = [
        (line.rfind("#x"), 16usize, 2usize),
        (line.rfind("#b"), 2, 2),
        (line.rfind("(_ bv"), 10, 5),
    ];
    let (pos, radix, skip) = candidates
        .iter()
        .filter_map(|&(pos, radix, skip)| pos.map(|p| (p, radix, skip)))
        .max_by_key(|&(p, _, _)| p)?;
    let digits: String = line[pos + skip..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    let value = u32::from_str_radix(&digits, radix as u32).ok()?;
    Some((value & 0xff) as u8)
}
