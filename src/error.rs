//! Error taxonomy for the distributed CG solver.
//!
//! Mirrors the four-way split the original HIP/MPI implementation enforced
//! through abort-on-nonzero-status macros, but returns `Result` instead of
//! aborting the process: `ConfigurationError` and `ResourceError` map to
//! [`SolverError::Configuration`] and [`SolverError::Resource`],
//! `LibraryError` (BLAS/sparse/MPI status codes) maps to
//! [`SolverError::Library`] and [`SolverError::Mpi`]. `NumericalWarning`
//! (non-convergence at the iteration cap) is not an error variant at all —
//! see [`crate::cg::CgOutcome`].

use thiserror::Error;

/// Errors produced by matrix construction, SpMV, and the CG driver.
#[derive(Error, Debug)]
pub enum SolverError {
    /// Row count mismatch, inconsistent `counts`/`displacements`, or any
    /// other input that fails to describe a valid partition.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Device buffer or handle allocation failed.
    #[error("resource allocation failed: {0}")]
    Resource(String),

    /// A BLAS/sparse backend call returned a nonzero status.
    #[error("library call failed ({context}): status {status}")]
    Library { context: &'static str, status: i32 },

    /// An MPI call failed or the communicator topology is inconsistent
    /// with the partition (e.g. `counts.len() != comm.size()`).
    #[error("mpi error: {0}")]
    Mpi(String),

    /// CSR dump/reload I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// CSR dump/reload (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, SolverError>;
