//! Remote cache daemon client
//!
//! The daemon holds query results across runs, keyed on the SMT-LIB
//! text of the canonicalized query. The protocol is textual and one
//! request per round-trip:
//!
//! - `check <key>`: reply starts with `G` on a hit; the payload is a
//!   validity tag digit, or `T`/`F` for satisfiability entries with the
//!   counter-model bytes attached to `T` (decimal, `|` between bytes,
//!   `;` between arrays). Anything else is a miss.
//! - `insert <tag> <key>`: daemon answers a short ack.
//! - `CLOSE`: sent once when the client drops; no reply.
//!
//! A socket or protocol failure during a lookup degrades to a miss and
//! the query falls through to the inner solver; inserts are
//! best-effort. Neither path is retried.

use std::io::{Read as _, Write as _};
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::canonicalize_goal;
use crate::error::{SolverError, SolverResult};
use crate::expr::{ArrayId, ExprId, ExprStore};
use crate::query::{PartialValidity, Query, Validity};
use crate::smtlib::render_query;
use crate::solve::{QuerySolver, SolverReply, SolverStats};

const REPLY_BUFSIZE: usize = 65536;

/// Decoded hit payload of a `check` round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAnswer {
    /// Validity entry, in the key's canonical orientation.
    Validity(PartialValidity),
    /// Satisfiable, with per-array counter-model bytes.
    Sat(Vec<Vec<u8>>),
    /// Unsatisfiable.
    Unsat,
}

/// Blocking TCP connection to the cache daemon.
pub struct RemoteCacheClient {
    stream: TcpStream,
}

impl RemoteCacheClient {
    pub fn connect(addr: &str) -> SolverResult<Self> {
        let stream = TcpStream::connect(addr)?;
        debug!(%addr, "connected to cache daemon");
        Ok(Self { stream })
    }

    fn round_trip(&mut self, request: &str) -> SolverResult<String> {
        self.stream.write_all(request.as_bytes())?;
        let mut buf = vec![0u8; REPLY_BUFSIZE];
        let n = self.stream.read(&mut buf)?;
        if n == 0 {
            return Err(SolverError::Protocol(
                "daemon closed the connection".to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }

    /// Look up `key`; `Ok(None)` is a miss.
    pub fn check(&mut self, key: &str) -> SolverResult<Option<RemoteAnswer>> {
        let reply = self.round_trip(&format!("check {key}"))?;
        parse_check_reply(&reply)
    }

    /// Store `tag` under `key`. The daemon's ack is read and discarded.
    pub fn insert(&mut self, tag: &str, key: &str) -> SolverResult<()> {
        let _ack = self.round_trip(&format!("insert {tag} {key}"))?;
        Ok(())
    }
}

impl Drop for RemoteCacheClient {
    fn drop(&mut self) {
        let _ = self.stream.write_all(b"CLOSE");
    }
}

/// Parse a `check` reply. A leading `G` marks a hit; everything else is
/// a miss.
pub fn parse_check_reply(reply: &str) -> SolverResult<Option<RemoteAnswer>> {
    let mut tokens = reply.split_whitespace();
    match tokens.next() {
        Some("G") => {}
        _ => return Ok(None),
    }
    match tokens.next() {
        Some("F") => Ok(Some(RemoteAnswer::Unsat)),
        Some("T") => {
            let values = match tokens.next() {
                None | Some("-") => Vec::new(),
                Some(payload) => decode_model(payload)?,
            };
            Ok(Some(RemoteAnswer::Sat(values)))
        }
        Some(tag) => {
            let digit = tag.parse::<u8>().map_err(|_| {
                SolverError::MalformedResponse(format!("unrecognized hit tag {tag:?}"))
            })?;
            let pv = PartialValidity::from_wire(digit).ok_or_else(|| {
                SolverError::MalformedResponse(format!("validity tag {digit} out of range"))
            })?;
            Ok(Some(RemoteAnswer::Validity(pv)))
        }
        None => Err(SolverError::MalformedResponse(
            "hit marker without payload".to_string(),
        )),
    }
}

fn decode_model(payload: &str) -> SolverResult<Vec<Vec<u8>>> {
    payload
        .split(';')
        .map(|array| {
            if array.is_empty() {
                return Ok(Vec::new());
            }
            array
                .split('|')
                .map(|byte| {
                    byte.parse::<u8>().map_err(|_| {
                        SolverError::MalformedResponse(format!("bad model byte {byte:?}"))
                    })
                })
                .collect()
        })
        .collect()
}

fn encode_model(values: &[Vec<u8>]) -> String {
    if values.is_empty() {
        return "-".to_string();
    }
    values
        .iter()
        .map(|array| {
            array
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join("|")
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Chain layer backed by the cache daemon. Same five-valued refinement
/// as the in-process cache, with lookups and inserts over the wire.
pub struct RemoteCacheSolver {
    store: Rc<ExprStore>,
    inner: Box<dyn QuerySolver>,
    stats: Arc<SolverStats>,
    client: RemoteCacheClient,
}

impl RemoteCacheSolver {
    pub fn connect(
        store: Rc<ExprStore>,
        inner: Box<dyn QuerySolver>,
        stats: Arc<SolverStats>,
        addr: &str,
    ) -> SolverResult<Self> {
        Ok(Self {
            store,
            inner,
            stats,
            client: RemoteCacheClient::connect(addr)?,
        })
    }

    fn validity_key(&self, query: &Query) -> (String, bool) {
        let (goal, negated) = canonicalize_goal(&self.store, query.goal);
        let canonical = Query::new(query.constraints.clone(), goal);
        (render_query(&self.store, &canonical), negated)
    }

    /// A failed or malformed `check` degrades to a miss so the query
    /// still reaches the inner solver.
    fn lookup_validity(&mut self, query: &Query) -> Option<PartialValidity> {
        let (key, negated) = self.validity_key(query);
        let answer = match self.client.check(&key) {
            Ok(answer) => answer,
            Err(err) => {
                warn!(%err, "remote cache lookup failed, treating as miss");
                return None;
            }
        };
        answer.map(|a| {
            let pv = match a {
                RemoteAnswer::Validity(pv) => pv,
                // a model entry proves a counterexample for the
                // canonical orientation; unsat proves validity
                RemoteAnswer::Sat(_) => PartialValidity::MayBeFalse,
                RemoteAnswer::Unsat => PartialValidity::MustBeTrue,
            };
            if negated {
                pv.negate()
            } else {
                pv
            }
        })
    }

    /// Best-effort: failures are logged, never surfaced.
    fn insert_validity(&mut self, query: &Query, result: PartialValidity) {
        let (key, negated) = self.validity_key(query);
        let stored = if negated { result.negate() } else { result };
        let Some(tag) = stored.to_wire() else {
            return;
        };
        if let Err(err) = self.client.insert(&tag.to_string(), &key) {
            warn!(%err, "remote cache insert failed");
        }
    }
}

impl QuerySolver for RemoteCacheSolver {
    fn compute_truth(&mut self, query: &Query) -> SolverResult<bool> {
        let cached = self.lookup_validity(query);

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
            PartialValidity::TrueOrFalse
        } else {
            PartialValidity::MayBeFalse
        };
        self.insert_validity(query, entry);
        Ok(is_valid)
    }

    fn compute_validity(&mut self, query: &Query) -> SolverResult<Validity> {
        match self.lookup_validity(query) {
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
                self.stats.count_miss();
                if self.inner.compute_truth(query)? {
                    self.insert_validity(query, PartialValidity::MustBeTrue);
                    Ok(Validity::True)
                } else {
                    self.insert_validity(query, PartialValidity::TrueOrFalse);
                    Ok(Validity::Unknown)
                }
            }
            Some(PartialValidity::MayBeFalse) => {
                self.stats.count_miss();
                let negated = query.negate(&self.store);
                if self.inner.compute_truth(&negated)? {
                    self.insert_validity(query, PartialValidity::MustBeFalse);
                    Ok(Validity::False)
                } else {
                    self.insert_validity(query, PartialValidity::TrueOrFalse);
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
                self.insert_validity(query, entry);
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
        arrays: &[ArrayId],
    ) -> SolverResult<SolverReply> {
        // model entries key on the query as posed, not canonicalized:
        // the counter-model is oriented to the original goal
        let key = render_query(&self.store, query);
        let cached = match self.client.check(&key) {
            Ok(answer) => answer,
            Err(err) => {
                warn!(%err, "remote cache lookup failed, treating as miss");
                None
            }
        };
        match cached {
            Some(RemoteAnswer::Sat(values)) => {
                self.stats.count_hit();
                let values = fit_model(&self.store, arrays, values)?;
                Ok(SolverReply::solution(values))
            }
            Some(RemoteAnswer::Unsat)
            | Some(RemoteAnswer::Validity(PartialValidity::MustBeTrue)) => {
                self.stats.count_hit();
                Ok(SolverReply::no_solution())
            }
            _ => {
                self.stats.count_miss();
                let reply = self.inner.compute_initial_values(query, arrays)?;
                let tag = if reply.has_solution {
                    format!("T {}", encode_model(&reply.values))
                } else {
                    "F".to_string()
                };
                if let Err(err) = self.client.insert(&tag, &key) {
                    warn!(%err, "remote cache insert failed");
                }
                Ok(reply)
            }
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.inner.set_timeout(timeout);
    }

    fn constraint_log(&mut self, query: &Query) -> SolverResult<String> {
        self.inner.constraint_log(query)
    }
}

/// Check a cached model against the declared array sizes. Too few
/// bytes is unrecoverable; extra bytes are dropped with a warning.
fn fit_model(
    store: &ExprStore,
    arrays: &[ArrayId],
    values: Vec<Vec<u8>>,
) -> SolverResult<Vec<Vec<u8>>> {
    if values.len() != arrays.len() {
        return Err(SolverError::MalformedResponse(format!(
            "model covers {} arrays, expected {}",
            values.len(),
            arrays.len()
        )));
    }
    arrays
        .iter()
        .zip(values)
        .map(|(&array, mut bytes)| {
            let info = store.array_info(array);
            let expected = info.size as usize;
            if bytes.len() < expected {
                return Err(SolverError::ModelSizeMismatch {
                    name: info.name,
                    expected,
                    actual: bytes.len(),
                });
            }
            if bytes.len() > expected {
                warn!(
                    array = %info.name,
                    expected,
                    actual = bytes.len(),
                    "oversized cached model truncated"
                );
                bytes.truncate(expected);
            }
            Ok(bytes)
        })
        .collect()
}
