//! Remote cache round-trips against an in-process mock daemon.

mod common;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;

use symsolve::{
    render_query, ConstraintSet, ExprStore, Query, QuerySolver, RemoteCacheClient,
    RemoteCacheSolver, SolverChainBuilder, SolverConfig, SolverError, SolverStats, Validity,
};

use common::BruteForceSolver;

/// Minimal daemon speaking the textual cache protocol. Connections are
/// served one at a time; the table outlives them.
fn spawn_daemon() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let table: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            serve(&mut stream, &table);
        }
    });
    addr
}

fn serve(stream: &mut TcpStream, table: &Mutex<HashMap<String, String>>) {
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let msg = String::from_utf8_lossy(&buf[..n]).into_owned();
        if msg.starts_with("CLOSE") {
            return;
        }
        let reply = if let Some(key) = msg.strip_prefix("check ") {
            match table.lock().unwrap().get(key) {
                Some(tag) => format!("G {tag}"),
                None => "N".to_string(),
            }
        } else if let Some(rest) = msg.strip_prefix("insert ") {
            let (tag, key) = split_insert(rest);
            table.lock().unwrap().insert(key, tag);
            "K".to_string()
        } else {
            "E".to_string()
        };
        if stream.write_all(reply.as_bytes()).is_err() {
            return;
        }
    }
}

/// `insert <tag> <key>`, where a `T` tag carries its model payload as a
/// second token.
fn split_insert(rest: &str) -> (String, String) {
    let (first, remainder) = rest.split_once(' ').unwrap();
    if first == "T" {
        let (payload, key) = remainder.split_once(' ').unwrap();
        (format!("T {payload}"), key.to_string())
    } else {
        (first.to_string(), remainder.to_string())
    }
}

fn remote_over_brute_force(
    store: &Rc<ExprStore>,
    addr: &str,
) -> (RemoteCacheSolver, Rc<common::CallCounts>) {
    let backend = BruteForceSolver::new(Rc::clone(store));
    let counts = backend.counts();
    let solver = RemoteCacheSolver::connect(
        Rc::clone(store),
        Box::new(backend),
        Arc::new(SolverStats::default()),
        addr,
    )
    .unwrap();
    (solver, counts)
}

#[test]
fn test_validity_entry_survives_reconnect() {
    let addr = spawn_daemon();
    let store = Rc::new(ExprStore::new());
    let x = store.array("x", 1);
    let goal = store.ult(store.read_byte(x, 0), store.constant(10u32, 8));
    let query = Query::new(ConstraintSet::new(), goal);

    let (mut solver, counts) = remote_over_brute_force(&store, &addr);
    assert_eq!(solver.compute_validity(&query).unwrap(), Validity::Unknown);
    assert_eq!(counts.validity.get(), 1);

    // second ask on the same connection hits
    assert_eq!(solver.compute_validity(&query).unwrap(), Validity::Unknown);
    assert_eq!(counts.validity.get(), 1);
    drop(solver);

    // a fresh connection still sees the entry
    let (mut solver, counts) = remote_over_brute_force(&store, &addr);
    assert_eq!(solver.compute_validity(&query).unwrap(), Validity::Unknown);
    assert_eq!(counts.validity.get(), 0);
    assert_eq!(counts.truth.get(), 0);
}

#[test]
fn test_hit_is_orientation_adjusted_for_the_negated_goal() {
    let addr = spawn_daemon();
    let store = Rc::new(ExprStore::new());
    let x = store.array("x", 1);
    let byte = store.read_byte(x, 0);
    let lt10 = store.ult(byte, store.constant(10u32, 8));
    let lt20 = store.ult(byte, store.constant(20u32, 8));
    let constraints = ConstraintSet::from_exprs([lt10]);

    let (mut solver, counts) = remote_over_brute_force(&store, &addr);
    assert!(solver
        .compute_truth(&Query::new(constraints.clone(), lt20))
        .unwrap());
    assert_eq!(counts.truth.get(), 1);
    drop(solver);

    let (mut solver, counts) = remote_over_brute_force(&store, &addr);
    let refuted = Query::new(constraints, store.not(lt20));
    assert_eq!(solver.compute_validity(&refuted).unwrap(), Validity::False);
    assert_eq!(counts.truth.get(), 0);
    assert_eq!(counts.validity.get(), 0);
}

#[test]
fn test_initial_values_round_trip() {
    let addr = spawn_daemon();
    let store = Rc::new(ExprStore::new());
    let x = store.array("x", 1);
    let is_seven = store.eq(store.read_byte(x, 0), store.constant(7u32, 8));
    let query = Query::new(ConstraintSet::from_exprs([is_seven]), store.false_expr());

    let (mut solver, counts) = remote_over_brute_force(&store, &addr);
    let reply = solver.compute_initial_values(&query, &[x]).unwrap();
    assert!(reply.has_solution);
    assert_eq!(reply.values, vec![vec![7]]);
    assert_eq!(counts.initial_values.get(), 1);

    let cached = solver.compute_initial_values(&query, &[x]).unwrap();
    assert_eq!(cached, reply);
    assert_eq!(counts.initial_values.get(), 1);
}

#[test]
fn test_unsatisfiable_initial_values_round_trip() {
    let addr = spawn_daemon();
    let store = Rc::new(ExprStore::new());
    let x = store.array("x", 1);
    let lt5 = store.ult(store.read_byte(x, 0), store.constant(5u32, 8));
    let query = Query::new(
        ConstraintSet::from_exprs([lt5, store.not(lt5)]),
        store.false_expr(),
    );

    let (mut solver, counts) = remote_over_brute_force(&store, &addr);
    assert!(!solver.compute_initial_values(&query, &[x]).unwrap().has_solution);
    assert_eq!(counts.initial_values.get(), 1);

    assert!(!solver.compute_initial_values(&query, &[x]).unwrap().has_solution);
    assert_eq!(counts.initial_values.get(), 1);
}

#[test]
fn test_cached_model_size_checks() {
    let addr = spawn_daemon();
    let store = Rc::new(ExprStore::new());
    let m = store.array("m", 2);
    let short_query = Query::new(ConstraintSet::new(), store.false_expr());
    let long_query = Query::new(ConstraintSet::new(), store.true_expr());

    // seed entries of the wrong shape directly
    let mut client = RemoteCacheClient::connect(&addr).unwrap();
    client
        .insert("T 1", &render_query(&store, &short_query))
        .unwrap();
    client
        .insert("T 1|2|3", &render_query(&store, &long_query))
        .unwrap();
    drop(client);

    let (mut solver, _) = remote_over_brute_force(&store, &addr);
    let short = solver.compute_initial_values(&short_query, &[m]);
    assert!(matches!(
        short,
        Err(SolverError::ModelSizeMismatch { expected: 2, actual: 1, .. })
    ));

    // oversized entries are truncated instead
    let long = solver.compute_initial_values(&long_query, &[m]).unwrap();
    assert!(long.has_solution);
    assert_eq!(long.values, vec![vec![1, 2]]);
}

/// Daemon answering an unparseable hit to every `check`.
fn spawn_broken_daemon() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut buf = vec![0u8; 1 << 16];
            loop {
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let msg = String::from_utf8_lossy(&buf[..n]);
                if msg.starts_with("CLOSE") {
                    break;
                }
                let reply = if msg.starts_with("check ") { "G x" } else { "K" };
                if stream.write_all(reply.as_bytes()).is_err() {
                    break;
                }
            }
        }
    });
    addr
}

#[test]
fn test_malformed_hit_degrades_to_backend_solve() {
    let addr = spawn_broken_daemon();
    let store = Rc::new(ExprStore::new());
    let x = store.array("x", 1);
    let byte = store.read_byte(x, 0);
    let lt10 = store.ult(byte, store.constant(10u32, 8));
    let lt20 = store.ult(byte, store.constant(20u32, 8));

    let (mut solver, counts) = remote_over_brute_force(&store, &addr);

    // a garbage reply is a miss, never an error
    let contingent = Query::new(ConstraintSet::new(), lt10);
    assert_eq!(
        solver.compute_validity(&contingent).unwrap(),
        Validity::Unknown
    );
    assert_eq!(counts.validity.get(), 1);

    let entailed = Query::new(ConstraintSet::from_exprs([lt10]), lt20);
    assert!(solver.compute_truth(&entailed).unwrap());
    assert_eq!(counts.truth.get(), 1);

    let model_query = Query::new(ConstraintSet::from_exprs([lt10]), store.false_expr());
    let reply = solver.compute_initial_values(&model_query, &[x]).unwrap();
    assert!(reply.has_solution);
    assert_eq!(counts.initial_values.get(), 1);
}

#[test]
fn test_lost_connection_degrades_to_backend_solve() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = thread::spawn(move || {
        // accept the connection and drop it straight away
        let _ = listener.accept();
    });

    let store = Rc::new(ExprStore::new());
    let x = store.array("x", 1);
    let goal = store.ult(store.read_byte(x, 0), store.constant(10u32, 8));

    let (mut solver, counts) = remote_over_brute_force(&store, &addr);
    handle.join().unwrap();

    let query = Query::new(ConstraintSet::new(), goal);
    assert_eq!(solver.compute_validity(&query).unwrap(), Validity::Unknown);
    assert_eq!(counts.validity.get(), 1);
}

#[test]
fn test_full_chain_with_remote_enabled() {
    let addr = spawn_daemon();
    let store = Rc::new(ExprStore::new());
    let x = store.array("x", 1);
    let byte = store.read_byte(x, 0);
    let lt10 = store.ult(byte, store.constant(10u32, 8));
    let lt20 = store.ult(byte, store.constant(20u32, 8));

    let config = SolverConfig {
        remote_addr: addr,
        use_remote_cache: true,
        ..SolverConfig::default()
    };
    let backend = BruteForceSolver::new(Rc::clone(&store));
    let counts = backend.counts();
    let chain_builder = SolverChainBuilder::new(Rc::clone(&store), config);
    let stats = chain_builder.stats();
    let mut chain = chain_builder.build_over(Box::new(backend)).unwrap();

    let query = Query::new(ConstraintSet::from_exprs([lt10]), lt20);
    assert!(chain.compute_truth(&query).unwrap());
    assert!(chain.compute_truth(&query).unwrap());
    assert_eq!(counts.truth.get(), 1);
    assert!(stats.cache_hits() >= 1);
}
