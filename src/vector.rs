//! Distributed vector storage.
//!
//! A [`DistributedVector`] holds one [`DenseBuffer`] per neighbour entry:
//! entry 0 is this rank's owned segment (length `rows_this_rank`), and
//! entries `1..` are receive staging areas sized to the number of
//! foreign columns referenced from each neighbour (`nnz_cols_per_neighbour`
//! in [`crate::matrix`]). SpMV packs the owned segment into outgoing
//! buffers and unpacks incoming halo data straight into these staging
//! areas, so the local sparse block can be applied against a single
//! contiguous slice per neighbour without an extra copy.

use crate::device::DenseBuffer;

/// Owned segment plus per-neighbour halo staging buffers.
pub struct DistributedVector {
    /// `buffers[0]` is the owned segment; `buffers[k]` for `k >= 1` holds
    /// data received from `neighbours[k]`.
    buffers: Vec<DenseBuffer>,
}

impl DistributedVector {
    /// `neighbour_lens[0]` must be the owned row count; `neighbour_lens[k]`
    /// for `k >= 1` is the halo length expected from that neighbour.
    pub fn new(neighbour_lens: &[usize]) -> Self {
        let buffers = neighbour_lens.iter().map(|&len| DenseBuffer::zeros(len)).collect();
        Self { buffers }
    }

    pub fn from_owned(owned: Vec<f64>, halo_lens: &[usize]) -> Self {
        let mut buffers = Vec::with_capacity(1 + halo_lens.len());
        buffers.push(DenseBuffer::from_vec(owned));
        buffers.extend(halo_lens.iter().map(|&len| DenseBuffer::zeros(len)));
        Self { buffers }
    }

    pub fn owned(&self) -> &DenseBuffer {
        &self.buffers[0]
    }

    pub fn owned_mut(&mut self) -> &mut DenseBuffer {
        &mut self.buffers[0]
    }

    pub fn halo(&self, neighbour_index: usize) -> &DenseBuffer {
        &self.buffers[neighbour_index]
    }

    pub fn halo_mut(&mut self, neighbour_index: usize) -> &mut DenseBuffer {
        &mut self.buffers[neighbour_index]
    }

    pub fn neighbour_count(&self) -> usize {
        self.buffers.len() - 1
    }

    pub fn owned_len(&self) -> usize {
        self.buffers[0].len()
    }

    /// Zeroes every halo staging buffer, leaving the owned segment intact.
    /// Called before a fresh SpMV to guard against stale halo data being
    /// read if a neighbour's receive is skipped (e.g. zero shared
    /// columns this iteration).
    pub fn clear_halo(&mut self) {
        for buf in self.buffers.iter_mut().skip(1) {
            buf.fill(0.0);
        }
    }
}
