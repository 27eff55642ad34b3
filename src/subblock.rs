//! The auxiliary "subblock" operator: a dense or sparse matrix acting on
//! a distinguished subset of global indices, added to the sparse part of
//! `A`.
//!
//! Both variants transport through the same path: gather the full
//! subblock vector from every rank's local contribution (via
//! [`crate::comm::RankComm::all_gather_varying`]), apply this rank's row
//! stripe locally, and scatter the result back into `Ap_local` by
//! indexed add. The dense variant uses `nalgebra` GEMV; the sparse
//! variant reuses [`SparseDescriptor`] exactly as the main matrix does.

use nalgebra::{DMatrix, DVector};

use crate::comm::RankComm;
use crate::device::{Device, SparseDescriptor};
use crate::error::{Result, SolverError};

enum Operator {
    Dense(DMatrix<f64>),
    Sparse(SparseDescriptor),
}

/// An operator over a subset of `subblock_size` global indices,
/// partitioned across ranks by `count_subblock`/`displ_subblock`
/// (independently of the main matrix's row partition).
pub struct DistributedSubblock {
    count_subblock: Vec<i32>,
    displ_subblock: Vec<i32>,
    subblock_size: usize,
    rows_local: usize,
    operator: Operator,
    /// Positions in this rank's local system (`Ap_local`) that the
    /// subblock's output rows correspond to.
    subblock_indices_local: Vec<i32>,
}

impl DistributedSubblock {
    /// `stripe` is this rank's row stripe of the dense subblock matrix:
    /// `rows_local x subblock_size`.
    pub fn new_dense(
        rank: i32,
        count_subblock: Vec<i32>,
        displ_subblock: Vec<i32>,
        stripe: DMatrix<f64>,
        subblock_indices_local: Vec<i32>,
    ) -> Result<Self> {
        let subblock_size = count_subblock.iter().sum::<i32>() as usize;
        let rows_local = count_subblock[rank as usize] as usize;
        if stripe.nrows() != rows_local || stripe.ncols() != subblock_size {
            return Err(SolverError::Configuration(format!(
                "dense subblock stripe is {}x{}, expected {rows_local}x{subblock_size}",
                stripe.nrows(),
                stripe.ncols()
            )));
        }
        if subblock_indices_local.len() != rows_local {
            return Err(SolverError::Configuration(format!(
                "subblock_indices_local has {} entries, expected {rows_local}",
                subblock_indices_local.len()
            )));
        }
        Ok(Self {
            count_subblock,
            displ_subblock,
            subblock_size,
            rows_local,
            operator: Operator::Dense(stripe),
            subblock_indices_local,
        })
    }

    /// `descriptor` is this rank's row stripe of the sparse subblock
    /// matrix, with `cols == subblock_size` (global subblock indexing,
    /// no further splitting by neighbour).
    pub fn new_sparse(
        rank: i32,
        count_subblock: Vec<i32>,
        displ_subblock: Vec<i32>,
        descriptor: SparseDescriptor,
        subblock_indices_local: Vec<i32>,
    ) -> Result<Self> {
        let subblock_size = count_subblock.iter().sum::<i32>() as usize;
        let rows_local = count_subblock[rank as usize] as usize;
        if descriptor.rows != rows_local || descriptor.cols != subblock_size {
            return Err(SolverError::Configuration(format!(
                "sparse subblock descriptor is {}x{}, expected {rows_local}x{subblock_size}",
                descriptor.rows, descriptor.cols
            )));
        }
        if subblock_indices_local.len() != rows_local {
            return Err(SolverError::Configuration(format!(
                "subblock_indices_local has {} entries, expected {rows_local}",
                subblock_indices_local.len()
            )));
        }
        Ok(Self {
            count_subblock,
            displ_subblock,
            subblock_size,
            rows_local,
            operator: Operator::Sparse(descriptor),
            subblock_indices_local,
        })
    }

    pub fn subblock_size(&self) -> usize {
        self.subblock_size
    }

    pub fn rows_local(&self) -> usize {
        self.rows_local
    }

    pub fn subblock_indices_local(&self) -> &[i32] {
        &self.subblock_indices_local
    }

    /// Gathers every rank's local contribution into the full
    /// `subblock_size`-length vector (`Iallgatherv` in the original).
    pub fn gather_full(&self, p_sub_local: &[f64], comm: &dyn RankComm) -> Result<Vec<f64>> {
        if p_sub_local.len() != self.rows_local {
            return Err(SolverError::Configuration(format!(
                "p_sub_local has {} entries, expected {}",
                p_sub_local.len(),
                self.rows_local
            )));
        }
        comm.all_gather_varying(p_sub_local, &self.count_subblock, &self.displ_subblock)
    }

    /// Applies this rank's row stripe to the already-gathered full
    /// subblock vector, returning this rank's `rows_local`-length
    /// contribution.
    pub fn apply_local(&self, p_sub_full: &[f64], device: &dyn Device) -> Result<Vec<f64>> {
        if p_sub_full.len() != self.subblock_size {
            return Err(SolverError::Configuration(format!(
                "gathered subblock vector has {} entries, expected {}",
                p_sub_full.len(),
                self.subblock_size
            )));
        }
        match &self.operator {
            Operator::Dense(stripe) => {
                let x = DVector::from_row_slice(p_sub_full);
                let y = stripe * x;
                Ok(y.iter().copied().collect())
            }
            Operator::Sparse(descriptor) => {
                let mut y = vec![0.0; descriptor.rows];
                device.spmv(descriptor, 1.0, p_sub_full, 0.0, &mut y)?;
                Ok(y)
            }
        }
    }

    /// Gather then apply, the full subblock SpMV from this rank's
    /// local slice of `p_sub` to its local contribution to `Ap_sub`.
    pub fn apply(&self, p_sub_local: &[f64], comm: &dyn RankComm, device: &dyn Device) -> Result<Vec<f64>> {
        let full = self.gather_full(p_sub_local, comm)?;
        self.apply_local(&full, device)
    }

    /// Scatters `contribution` (this rank's `Ap_sub`) into `ap_local` by
    /// indexed add at [`Self::subblock_indices_local`].
    pub fn scatter_add(&self, contribution: &[f64], ap_local: &mut [f64], device: &dyn Device) {
        device.unpack_add(ap_local, contribution, &self.subblock_indices_local);
    }
}
