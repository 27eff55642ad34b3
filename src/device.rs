//! Compute-backend abstraction.
//!
//! The original implementation threads `rocsparse`/`rocblas`/`hipblas`
//! handles, `hipStream_t`s and `hipEvent_t`s through nearly every call
//! site. No ROCm/CUDA binding exists among the crates this project draws
//! from, so this module bundles the sparse/dense descriptors and the
//! stream/event ordering primitives behind one trait, and [`HostDevice`]
//! is the only implementation shipped — CPU, `rayon`-parallel CSR SpMV. A real GPU
//! backend would implement the same trait without touching
//! [`crate::matrix::DistributedMatrix`], [`crate::spmv`], or [`crate::cg`].

use rayon::prelude::*;

use crate::error::{Result, SolverError};

/// Selects the SpMV kernel variant for a neighbour block, matching the
/// `rocsparse_spmv_alg` convention: index 0 (the local, usually densest
/// block) gets `Adaptive`, all others get `Stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpmvAlgorithm {
    Adaptive,
    Stream,
}

/// The algorithm convention a caller not specifying otherwise should
/// use: slot 0 (the local, usually densest block) gets `Adaptive`,
/// every other neighbour slot gets `Stream`.
pub fn default_algorithm(neighbour_index: usize) -> SpmvAlgorithm {
    if neighbour_index == 0 {
        SpmvAlgorithm::Adaptive
    } else {
        SpmvAlgorithm::Stream
    }
}

/// A logical ordering token. On the host backend this carries no OS
/// resource; it exists so call sites read the way the original's
/// `hipStream_t` plumbing does, and so a GPU backend has somewhere to put
/// a real stream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub usize);

/// A synchronization point recorded on a stream and waited on from
/// another. The host backend implements this with an atomic generation
/// counter: `record` bumps it, `wait` spins until the waiter has observed
/// a recording at least that recent. This reproduces the ordering
/// contract (scatter-then-multiply) without pretending to model
/// real async GPU execution.
#[derive(Debug, Default)]
pub struct Event {
    generation: std::sync::atomic::AtomicU64,
    target: std::sync::atomic::AtomicU64,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the work up to this point on `stream` has happened.
    /// On the host backend all streams execute inline, so this simply
    /// marks the event as satisfied.
    pub fn record(&self, _stream: StreamId) {
        use std::sync::atomic::Ordering;
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.target.store(gen, Ordering::SeqCst);
    }

    /// Block until the most recent `record` has been observed.
    pub fn wait(&self) {
        use std::sync::atomic::Ordering;
        while self.generation.load(Ordering::SeqCst) < self.target.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }
    }
}

/// A CSR matrix block as seen by the device layer: base-0, int32 column
/// indices local to the owning neighbour's column range, `f64` values.
/// This is the device-resident counterpart of [`crate::matrix::CsrBlock`];
/// on the host backend the two are the same allocation.
#[derive(Debug, Clone)]
pub struct SparseDescriptor {
    pub rows: usize,
    pub cols: usize,
    pub row_ptr: Vec<i32>,
    pub col_idx: Vec<i32>,
    pub data: Vec<f64>,
    pub algorithm: SpmvAlgorithm,
}

impl SparseDescriptor {
    pub fn new(
        rows: usize,
        cols: usize,
        row_ptr: Vec<i32>,
        col_idx: Vec<i32>,
        data: Vec<f64>,
        algorithm: SpmvAlgorithm,
    ) -> Self {
        debug_assert_eq!(row_ptr.len(), rows + 1);
        debug_assert_eq!(col_idx.len(), data.len());
        Self {
            rows,
            cols,
            row_ptr,
            col_idx,
            data,
            algorithm,
        }
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// `y = alpha * A * x + beta * y`, row-parallel. This is the single
    /// CSR SpMV kernel used both for the per-neighbour matrix blocks and
    /// for the sparse subblock variant; `algorithm` only distinguishes
    /// preflight buffer-sizing in a GPU backend and is inert here.
    pub fn spmv(&self, alpha: f64, x: &[f64], beta: f64, y: &mut [f64]) -> Result<()> {
        if x.len() != self.cols {
            return Err(SolverError::Configuration(format!(
                "spmv input vector length {} does not match descriptor cols {}",
                x.len(),
                self.cols
            )));
        }
        if y.len() != self.rows {
            return Err(SolverError::Configuration(format!(
                "spmv output vector length {} does not match descriptor rows {}",
                y.len(),
                self.rows
            )));
        }

        y.par_iter_mut().enumerate().for_each(|(row, y_row)| {
            let start = self.row_ptr[row] as usize;
            let end = self.row_ptr[row + 1] as usize;
            let mut acc = 0.0;
            for j in start..end {
                acc += self.data[j] * x[self.col_idx[j] as usize];
            }
            *y_row = beta * *y_row + alpha * acc;
        });

        Ok(())
    }
}

/// Host-resident dense vector buffer. Stands in for a device pointer
/// managed through `hipMalloc`/`hipMemcpy`; on the host backend it is
/// simply an owned `Vec<f64>`.
#[derive(Debug, Clone, Default)]
pub struct DenseBuffer {
    pub data: Vec<f64>,
}

impl DenseBuffer {
    pub fn zeros(len: usize) -> Self {
        Self {
            data: vec![0.0; len],
        }
    }

    pub fn from_vec(data: Vec<f64>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn fill(&mut self, value: f64) {
        self.data.iter_mut().for_each(|v| *v = value);
    }
}

/// Gathers `src[indices[i]]` into `dst[i]`, the device-side "pack" kernel
/// used before a send, both for halo packing and subblock packing.
pub fn pack(dst: &mut [f64], src: &[f64], indices: &[i32]) {
    debug_assert_eq!(dst.len(), indices.len());
    dst.par_iter_mut()
        .zip(indices.par_iter())
        .for_each(|(d, &idx)| *d = src[idx as usize]);
}

/// Scatters `src[i]` into `dst[indices[i]]`, the "unpack" kernel used
/// after a receive.
pub fn unpack(dst: &mut [f64], src: &[f64], indices: &[i32]) {
    debug_assert_eq!(src.len(), indices.len());
    for (i, &idx) in indices.iter().enumerate() {
        dst[idx as usize] = src[i];
    }
}

/// Scatters `src[i]` into `dst[indices[i]] += src[i]`, used to fold the
/// subblock's contribution back into `Ap_local`.
pub fn unpack_add(dst: &mut [f64], src: &[f64], indices: &[i32]) {
    debug_assert_eq!(src.len(), indices.len());
    for (i, &idx) in indices.iter().enumerate() {
        dst[idx as usize] += src[i];
    }
}

/// Elementwise `z = r * diag_inv`, the Jacobi preconditioner application
/// in the CG driver.
pub fn elementwise_mul(r: &[f64], diag_inv: &[f64], z: &mut [f64]) {
    debug_assert_eq!(r.len(), diag_inv.len());
    debug_assert_eq!(r.len(), z.len());
    z.par_iter_mut()
        .zip(r.par_iter())
        .zip(diag_inv.par_iter())
        .for_each(|((z_i, &r_i), &d_i)| *z_i = r_i * d_i);
}

/// Local BLAS-1 dot product, row-parallel reduction.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.par_iter().zip(b.par_iter()).map(|(&x, &y)| x * y).sum()
}

/// `y += alpha * x` (BLAS-1 axpy).
pub fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    debug_assert_eq!(x.len(), y.len());
    y.par_iter_mut()
        .zip(x.par_iter())
        .for_each(|(y_i, &x_i)| *y_i += alpha * x_i);
}

/// `y = alpha * y` (BLAS-1 scal).
pub fn scal(alpha: f64, y: &mut [f64]) {
    y.par_iter_mut().for_each(|y_i| *y_i *= alpha);
}

/// The seam a GPU backend would occupy: sparse SpMV, the BLAS-1 kernels
/// the CG driver needs, and the pack/unpack/preconditioner kernels the
/// SpMV orchestrator needs. [`DistributedMatrix`](crate::matrix::DistributedMatrix)
/// and [`crate::cg::conjugate_gradient_jacobi`] are generic over this
/// trait rather than calling the free functions above directly, so a
/// `Device` can be swapped without touching either.
pub trait Device: Send + Sync {
    fn spmv(&self, descr: &SparseDescriptor, alpha: f64, x: &[f64], beta: f64, y: &mut [f64]) -> Result<()>;
    fn pack(&self, dst: &mut [f64], src: &[f64], indices: &[i32]);
    fn unpack(&self, dst: &mut [f64], src: &[f64], indices: &[i32]);
    fn unpack_add(&self, dst: &mut [f64], src: &[f64], indices: &[i32]);
    fn elementwise_mul(&self, r: &[f64], diag_inv: &[f64], z: &mut [f64]);
    fn dot(&self, a: &[f64], b: &[f64]) -> f64;
    fn axpy(&self, alpha: f64, x: &[f64], y: &mut [f64]);
    fn scal(&self, alpha: f64, y: &mut [f64]);
}

/// CPU backend: every kernel above runs inline via `rayon`, on the
/// thread that calls it. [`StreamId`]/[`Event`] ordering still applies —
/// it just never has to wait on real asynchronous device work.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostDevice;

impl Device for HostDevice {
    fn spmv(&self, descr: &SparseDescriptor, alpha: f64, x: &[f64], beta: f64, y: &mut [f64]) -> Result<()> {
        descr.spmv(alpha, x, beta, y)
    }

    fn pack(&self, dst: &mut [f64], src: &[f64], indices: &[i32]) {
        pack(dst, src, indices)
    }

    fn unpack(&self, dst: &mut [f64], src: &[f64], indices: &[i32]) {
        unpack(dst, src, indices)
    }

    fn unpack_add(&self, dst: &mut [f64], src: &[f64], indices: &[i32]) {
        unpack_add(dst, src, indices)
    }

    fn elementwise_mul(&self, r: &[f64], diag_inv: &[f64], z: &mut [f64]) {
        elementwise_mul(r, diag_inv, z)
    }

    fn dot(&self, a: &[f64], b: &[f64]) -> f64 {
        dot(a, b)
    }

    fn axpy(&self, alpha: f64, x: &[f64], y: &mut [f64]) {
        axpy(alpha, x, y)
    }

    fn scal(&self, alpha: f64, y: &mut [f64]) {
        scal(alpha, y)
    }
}
