//! # distcg
//!
//! A distributed, preconditioned Conjugate Gradient solver for sparse
//! symmetric positive-definite linear systems, row-partitioned across MPI
//! ranks. [`matrix::DistributedMatrix`] owns the row-wise partitioning,
//! neighbour discovery and halo communication index sets;
//! [`vector::DistributedVector`] pairs an owned segment with per-neighbour
//! halo staging; [`spmv`] orchestrates the sparse SpMV and, when present, an
//! auxiliary [`subblock::DistributedSubblock`] operator; [`cg`] drives the
//! iteration.

pub mod cg;
pub mod comm;
pub mod config;
pub mod device;
pub mod error;
pub mod io;
pub mod matrix;
pub mod spmv;
pub mod subblock;
pub mod vector;

pub use cg::{conjugate_gradient_jacobi, CgOptions, CgOutcome};
pub use comm::{MpiComm, RankComm};
pub use config::SolverConfig;
pub use device::{Device, HostDevice, SpmvAlgorithm};
pub use error::{Result, SolverError};
pub use matrix::{DistributedMatrix, LocalCsr};
pub use spmv::{GpuPackingCam, Split1, Split2, Split3, SpmvStrategy};
pub use subblock::DistributedSubblock;
pub use vector::DistributedVector;

/// Installs a `tracing-subscriber` `fmt` layer honoring `RUST_LOG`,
/// falling back to `info` when unset. Idempotent: a second call is a
/// no-op rather than a panic, so library consumers that also set up
/// their own subscriber don't have to special-case calling this first.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
