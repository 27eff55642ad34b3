//! Preconditioned Conjugate Gradient driver.
//!
//! Jacobi (diagonal) preconditioning, the standard two-allreduce-per-iteration
//! form: one reduction for `rho = r . z`, one for `p . Ap`. No pipelining —
//! each iteration's allreduces are on the critical path, trading latency for
//! the simplicity of a single code path shared by every [`SpmvStrategy`].

use tracing::{info, warn};

use crate::comm::RankComm;
use crate::error::{Result, SolverError};
use crate::matrix::DistributedMatrix;
use crate::spmv::SpmvStrategy;
use crate::subblock::DistributedSubblock;
use crate::vector::DistributedVector;

/// Stopping criteria and iteration cap for [`conjugate_gradient_jacobi`].
#[derive(Debug, Clone, Copy)]
pub struct CgOptions {
    /// Stop once the preconditioned residual `sqrt(rho / norm2_rhs) <=
    /// relative_tolerance`, where `rho = <r, z>` and `norm2_rhs = <b, b>`
    /// (spec's `GLOSSARY` "Preconditioned residual norm").
    pub relative_tolerance: f64,
    /// Upper bound on the number of CG steps actually performed: the body
    /// runs at most `max_iterations` times (spec's `k = 1; while … and k
    /// <= K: body(); k += 1`). Hitting the cap without converging reports
    /// `iterations == max_iterations + 1`, since `k` is incremented once
    /// more — past the bound, without another body run — before the loop
    /// guard is re-checked and fails.
    pub max_iterations: u32,
}

impl Default for CgOptions {
    fn default() -> Self {
        Self {
            relative_tolerance: 1e-8,
            max_iterations: 1000,
        }
    }
}

/// The outcome of a solve: final iterate is written back into the `x`
/// vector passed to [`conjugate_gradient_jacobi`], so only the
/// convergence bookkeeping is returned here.
#[derive(Debug, Clone, Copy)]
pub struct CgOutcome {
    /// The count of completed CG steps, with one exception: when the
    /// `max_iterations` cap is what ended the loop (rather than
    /// convergence or a degenerate search direction), this is
    /// `max_iterations + 1` — `k` advances past the cap once more before
    /// the guard fails, matching the spec's loop literally.
    pub iterations: u32,
    pub relative_residual: f64,
    pub converged: bool,
}

/// Runs preconditioned CG to solve `A x = b` for this rank's rows,
/// starting from whatever `x` currently holds (the caller is
/// responsible for seeding an initial guess, zero or otherwise).
///
/// `diag_inv` is the Jacobi preconditioner: `1 / A[i][i]` for each of
/// this rank's owned rows, precomputed by the caller from the assembled
/// matrix (the matrix itself only exposes per-neighbour blocks, not a
/// convenient diagonal accessor).
pub fn conjugate_gradient_jacobi<S: SpmvStrategy>(
    matrix: &DistributedMatrix,
    subblock: Option<&DistributedSubblock>,
    strategy: &S,
    comm: &dyn RankComm,
    b: &[f64],
    x: &mut DistributedVector,
    diag_inv: &[f64],
    options: CgOptions,
) -> Result<CgOutcome> {
    let n = matrix.rows_this_rank();
    if b.len() != n || diag_inv.len() != n || x.owned_len() != n {
        return Err(SolverError::Configuration(format!(
            "conjugate_gradient_jacobi expects b/diag_inv/x.owned of length {n}, got b={}, diag_inv={}, x.owned={}",
            b.len(),
            diag_inv.len(),
            x.owned_len()
        )));
    }

    let device = matrix.device();

    let norm2_rhs = comm.all_reduce_sum(device.dot(b, b));
    if norm2_rhs == 0.0 {
        info!("right-hand side is zero; returning the zero vector");
        return Ok(CgOutcome {
            iterations: 0,
            relative_residual: 0.0,
            converged: true,
        });
    }

    let mut ap = vec![0.0; n];
    strategy.apply(matrix, subblock, x, &mut ap, comm)?;

    let mut r = vec![0.0; n];
    r.copy_from_slice(b);
    device.axpy(-1.0, &ap, &mut r);

    let mut z = vec![0.0; n];
    device.elementwise_mul(&r, diag_inv, &mut z);
    let mut rho = comm.all_reduce_sum(device.dot(&r, &z));
    let tolerance_sq = options.relative_tolerance * options.relative_tolerance;
    let mut relative_residual = (rho / norm2_rhs).max(0.0).sqrt();

    if rho <= tolerance_sq * norm2_rhs {
        info!(relative_residual, "converged before the first iteration");
        return Ok(CgOutcome {
            iterations: 0,
            relative_residual,
            converged: true,
        });
    }

    let mut p = z.clone();
    let mut k = 1u32;
    let mut converged = false;

    loop {
        if k > options.max_iterations {
            break;
        }

        let mut p_dist = matrix.vector_from_owned(p.clone());
        strategy.apply(matrix, subblock, &mut p_dist, &mut ap, comm)?;

        let p_dot_ap = comm.all_reduce_sum(device.dot(&p, &ap));
        if p_dot_ap == 0.0 {
            warn!(iteration = k, "p . Ap vanished; A is not positive definite on this search direction, stopping early");
            break;
        }
        let alpha = rho / p_dot_ap;

        device.axpy(alpha, &p, x.owned_mut().as_mut_slice());
        device.axpy(-alpha, &ap, &mut r);

        device.elementwise_mul(&r, diag_inv, &mut z);
        let rho_prev = rho;
        rho = comm.all_reduce_sum(device.dot(&r, &z));
        relative_residual = (rho / norm2_rhs).max(0.0).sqrt();
        if rho <= tolerance_sq * norm2_rhs {
            converged = true;
            break;
        }

        if rho_prev == 0.0 {
            warn!(iteration = k, "rho vanished; stopping early");
            break;
        }
        let beta = rho / rho_prev;

        device.scal(beta, &mut p);
        device.axpy(1.0, &z, &mut p);

        k += 1;
    }

    if converged {
        info!(iterations = k, relative_residual, "converged");
    } else {
        warn!(iterations = k, relative_residual, max_iterations = options.max_iterations, "did not reach the requested tolerance");
    }

    Ok(CgOutcome {
        iterations: k,
        relative_residual,
        converged,
    })
}
