//! Configuration for the solver chain

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for [`crate::SolverChainBuilder`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Backend timeout per query. Zero means no limit.
    pub timeout: Duration,

    /// Path to the z3 binary
    pub z3_path: PathBuf,

    /// Address of the cache daemon
    pub remote_addr: String,

    /// Reduce constraint sets to the goal-relevant subset
    pub use_independence: bool,

    /// Keep an in-process validity cache
    pub use_cache: bool,

    /// Consult the cache daemon before the backend
    pub use_remote_cache: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            z3_path: PathBuf::from("z3"),
            remote_addr: "127.0.0.1:9407".to_string(),
            use_independence: true,
            use_cache: true,
            use_remote_cache: false,
        }
    }
}
