//! Communicator abstraction over MPI.
//!
//! The original threads a raw `MPI_Comm` through every constructor and
//! SpMV variant. This crate narrows that down to the handful of
//! operations the solver actually performs — rank/size queries, a global
//! sum-reduce for dot products, and the halo/subblock point-to-point
//! exchanges — behind [`RankComm`], so tests can supply an in-process
//! fake (see `test_support`) that reproduces a `P`-rank exchange without
//! linking MPI or spawning `mpirun`.
//!
//! This crate has no CUDA-aware MPI transport to rely on (there is no GPU
//! memory to point MPI at); every send/receive here moves host-resident
//! `Vec<f64>` buffers.

use mpi::collective::SystemOperation;
use mpi::point_to_point::Status;
use mpi::request::{self, LocalScope};
use mpi::topology::{Communicator, SimpleCommunicator};
use mpi::Rank;

use crate::error::{Result, SolverError};

/// A single point-to-point send this rank must issue during a halo or
/// subblock exchange.
pub struct PendingSend<'a> {
    pub dest: i32,
    pub tag: i32,
    pub data: &'a [f64],
}

/// A single point-to-point receive this rank must post; `len` is the
/// expected message length.
pub struct PendingRecv {
    pub source: i32,
    pub tag: i32,
    pub len: usize,
}

/// Everything the solver needs from an MPI communicator.
///
/// Implementations are responsible for their own non-blocking-request
/// bookkeeping; `halo_exchange` posts every receive, then every send, and
/// returns only once all of them complete — posting every receive, then
/// every send, then draining both in one call so the scope of any
/// non-blocking requests stays contained.
pub trait RankComm: Send + Sync {
    fn rank(&self) -> i32;
    fn size(&self) -> i32;

    /// `MPI_Allreduce(..., MPI_SUM, comm)` on a single scalar.
    fn all_reduce_sum(&self, local: f64) -> f64;

    /// Post all `recvs` then all `sends`, wait for both sets to
    /// complete, and return the received buffers in `recvs` order.
    fn halo_exchange(&self, sends: &[PendingSend<'_>], recvs: &[PendingRecv]) -> Result<Vec<Vec<f64>>>;

    /// `MPI_Iallgatherv` (or a point-to-point ring equivalent) of a
    /// variable-length contribution from every rank, used by the dense
    /// subblock's full-vector gather.
    fn all_gather_varying(&self, local: &[f64], counts: &[i32], displacements: &[i32]) -> Result<Vec<f64>>;

    fn barrier(&self);
}

/// Production communicator: wraps `mpi::topology::SimpleCommunicator`.
pub struct MpiComm {
    world: SimpleCommunicator,
}

impl MpiComm {
    pub fn new(world: SimpleCommunicator) -> Self {
        Self { world }
    }

    pub fn world(&self) -> &SimpleCommunicator {
        &self.world
    }
}

impl RankComm for MpiComm {
    fn rank(&self) -> i32 {
        self.world.rank()
    }

    fn size(&self) -> i32 {
        self.world.size()
    }

    fn all_reduce_sum(&self, local: f64) -> f64 {
        let mut global = 0.0f64;
        self.world
            .all_reduce_into(&local, &mut global, SystemOperation::sum());
        global
    }

    fn halo_exchange(&self, sends: &[PendingSend<'_>], recvs: &[PendingRecv]) -> Result<Vec<Vec<f64>>> {
        let mut recv_buffers: Vec<Vec<f64>> = recvs.iter().map(|r| vec![0.0; r.len]).collect();

        request::scope(|scope: &LocalScope| {
            let mut recv_requests = Vec::with_capacity(recvs.len());
            for (spec, buf) in recvs.iter().zip(recv_buffers.iter_mut()) {
                let req = self
                    .world
                    .process_at_rank(spec.source)
                    .immediate_receive_into_with_tag(scope, buf.as_mut_slice(), spec.tag);
                recv_requests.push(req);
            }

            let mut send_requests = Vec::with_capacity(sends.len());
            for spec in sends {
                let req = self
                    .world
                    .process_at_rank(spec.dest)
                    .immediate_send_with_tag(scope, spec.data, spec.tag);
                send_requests.push(req);
            }

            for req in recv_requests {
                let _: Status = req.wait();
            }
            for req in send_requests {
                req.wait();
            }
        });

        Ok(recv_buffers)
    }

    fn all_gather_varying(&self, local: &[f64], counts: &[i32], displacements: &[i32]) -> Result<Vec<f64>> {
        let total: i32 = counts.iter().sum();
        let mut gathered = vec![0.0f64; total as usize];
        {
            let mut partition = mpi::datatype::PartitionMut::new(&mut gathered, counts.to_vec(), displacements.to_vec());
            self.world.all_gather_varcount_into(local, &mut partition);
        }
        Ok(gathered)
    }

    fn barrier(&self) {
        self.world.barrier();
    }
}

/// Validates that `counts`/`displacements` describe a partition consistent
/// with the communicator size, returning [`SolverError::Configuration`]
/// (spec.md §7's "row count mismatch, inconsistent counts/displacements"
/// category) on failure. rsmpi itself does not report MPI errors as
/// `Result` (it aborts through the communicator's error handler instead),
/// so [`SolverError::Mpi`] is reserved for a future non-blocking transport
/// layer that can observe a request failure directly.
pub fn check_partition(counts: &[i32], displacements: &[i32], comm_size: i32) -> Result<()> {
    if counts.len() != comm_size as usize || displacements.len() != comm_size as usize {
        return Err(SolverError::Configuration(format!(
            "counts/displacements length ({}, {}) does not match communicator size {}",
            counts.len(),
            displacements.len(),
            comm_size
        )));
    }
    let mut running = 0i32;
    for (k, (&count, &displ)) in counts.iter().zip(displacements.iter()).enumerate() {
        if displ != running {
            return Err(SolverError::Configuration(format!(
                "displacements[{k}] = {displ} is inconsistent with the running prefix sum {running}"
            )));
        }
        running += count;
    }
    Ok(())
}

/// Tag convention for the sparse halo exchange: `|neighbour - rank|`.
pub fn halo_tag(rank: Rank, neighbour: Rank) -> i32 {
    (neighbour - rank).abs()
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    //! In-process communicator fakes for small multi-rank scenarios
    //! (tridiagonal solves, halo exchange, subblock variants), so the
    //! test suite can exercise the exact message pattern `MpiComm` would
    //! perform without requiring `mpirun`.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Condvar, Mutex};

    /// Keyed by `(source, dest, tag)`; each entry is a FIFO queue rather
    /// than a single slot. A fixed key (e.g. a halo exchange's
    /// `|neighbour - rank|` tag) is reused every CG iteration, so without
    /// FIFO ordering a rank that reaches iteration `k+1` before its peer
    /// has drained iteration `k`'s value would clobber it — a silent
    /// cross-iteration data race. Queuing preserves per-key send order
    /// regardless of how ranks interleave. Used for point-to-point
    /// exchanges only; the broadcast-style collectives below use
    /// [`CollectiveState`] instead, since a FIFO queue of single entries
    /// cannot be drained by more than one reader.
    type Mailbox = Mutex<HashMap<(i32, i32, i32), VecDeque<Vec<f64>>>>;

    /// Rendezvous state for one tag's worth of an `all_reduce_sum` or
    /// `all_gather_varying` call. Every one of `size` ranks must deposit
    /// its contribution (`arrived == size`) before `result` is computed;
    /// every rank must then read `result` (`departed == size`) before the
    /// slot resets for the tag's next round. This is a two-phase barrier
    /// rather than a single-producer queue, because a broadcast value
    /// needs every rank to observe it, not just the first one to ask.
    #[derive(Default)]
    struct CollectiveState {
        generation: u64,
        contributions: HashMap<i32, Vec<f64>>,
        result: Option<Vec<f64>>,
        arrived: i32,
        departed: i32,
    }

    /// Shared state for a fixed-size group of [`FakeComm`]s, one per
    /// simulated rank, all living in the same process (typically on
    /// separate `std::thread`s).
    pub struct FakeWorld {
        size: i32,
        mailbox: Mailbox,
        collectives: Mutex<HashMap<i32, CollectiveState>>,
        condvar: Condvar,
    }

    impl FakeWorld {
        pub fn new(size: i32) -> Arc<Self> {
            Arc::new(Self {
                size,
                mailbox: Mutex::new(HashMap::new()),
                collectives: Mutex::new(HashMap::new()),
                condvar: Condvar::new(),
            })
        }

        pub fn comm(self: &Arc<Self>, rank: i32) -> FakeComm {
            FakeComm {
                world: self.clone(),
                rank,
            }
        }
    }

    pub struct FakeComm {
        world: Arc<FakeWorld>,
        rank: i32,
    }

    impl FakeComm {
        /// Pushes `data` onto the `(self.rank, dest, tag)` queue and wakes
        /// any rank waiting to pop from it.
        fn deposit(&self, dest: i32, tag: i32, data: Vec<f64>) {
            let mut mailbox = self.world.mailbox.lock().unwrap();
            mailbox.entry((self.rank, dest, tag)).or_default().push_back(data);
            drop(mailbox);
            self.world.condvar.notify_all();
        }

        /// Blocks until `(source, self.rank, tag)` has a queued entry, then
        /// pops and returns it in FIFO order.
        fn take(&self, source: i32, dest: i32, tag: i32) -> Vec<f64> {
            let mut mailbox = self.world.mailbox.lock().unwrap();
            loop {
                if let Some(queue) = mailbox.get_mut(&(source, dest, tag)) {
                    if let Some(value) = queue.pop_front() {
                        return value;
                    }
                }
                mailbox = self.world.condvar.wait(mailbox).unwrap();
            }
        }

        /// Runs a barrier-style all-to-all combine keyed by `tag`: every
        /// one of the world's `size` ranks deposits a contribution, then
        /// `combine` runs exactly once against all of them (sorted by
        /// rank, for determinism), and every rank reads the same result
        /// before the slot resets for the tag's next round. Unlike a
        /// single-producer FIFO queue, this never lets two ranks race to
        /// pop the one entry a broadcast result requires both to see.
        fn collective_combine(&self, tag: i32, local: Vec<f64>, combine: impl FnOnce(Vec<(i32, Vec<f64>)>) -> Vec<f64>) -> Vec<f64> {
            let mut table = self.world.collectives.lock().unwrap();
            let my_gen = table.entry(tag).or_default().generation;

            {
                let entry = table.get_mut(&tag).unwrap();
                entry.contributions.insert(self.rank, local);
                entry.arrived += 1;
                if entry.arrived == self.world.size {
                    let mut items: Vec<(i32, Vec<f64>)> = entry.contributions.drain().collect();
                    items.sort_by_key(|(rank, _)| *rank);
                    entry.result = Some(combine(items));
                }
            }
            drop(table);
            self.world.condvar.notify_all();
            table = self.world.collectives.lock().unwrap();

            loop {
                let ready = table.get(&tag).and_then(|entry| (entry.generation == my_gen).then(|| entry.result.clone()).flatten());
                if let Some(result) = ready {
                    let entry = table.get_mut(&tag).unwrap();
                    entry.departed += 1;
                    if entry.departed == self.world.size {
                        *entry = CollectiveState {
                            generation: my_gen + 1,
                            ..CollectiveState::default()
                        };
                        drop(table);
                        self.world.condvar.notify_all();
                    }
                    return result;
                }
                table = self.world.condvar.wait(table).unwrap();
            }
        }
    }

    impl RankComm for FakeComm {
        fn rank(&self) -> i32 {
            self.rank
        }

        fn size(&self) -> i32 {
            self.world.size
        }

        fn all_reduce_sum(&self, local: f64) -> f64 {
            let tag = -1;
            let result = self.collective_combine(tag, vec![local], |items| vec![items.iter().map(|(_, v)| v[0]).sum()]);
            result[0]
        }

        fn halo_exchange(&self, sends: &[PendingSend<'_>], recvs: &[PendingRecv]) -> Result<Vec<Vec<f64>>> {
            // Unlike `MpiComm` (which must post non-blocking receives
            // before sends to have a buffer ready for an arriving
            // message), this mailbox is pull-based: a deposit just queues
            // data under its key regardless of whether a reader is
            // waiting yet, so there is no receive-buffer-readiness
            // ordering to preserve here. Depositing sends before draining
            // receives is equivalent to the reverse order.
            for send in sends {
                self.deposit(send.dest, send.tag, send.data.to_vec());
            }

            let mut results = Vec::with_capacity(recvs.len());
            for recv in recvs {
                results.push(self.take(recv.source, self.rank, recv.tag));
            }
            Ok(results)
        }

        fn all_gather_varying(&self, local: &[f64], counts: &[i32], displacements: &[i32]) -> Result<Vec<f64>> {
            let tag = -2;
            let total: i32 = counts.iter().sum();
            let displacements = displacements.to_vec();
            let gathered = self.collective_combine(tag, local.to_vec(), move |items| {
                let mut gathered = vec![0.0; total as usize];
                for (rank, contribution) in items {
                    let displ = displacements[rank as usize] as usize;
                    gathered[displ..displ + contribution.len()].copy_from_slice(&contribution);
                }
                gathered
            });
            Ok(gathered)
        }

        fn barrier(&self) {
            // Not needed for the deterministic fakes used in tests.
        }
    }

    /// Wraps any [`RankComm`] and counts `all_reduce_sum` calls, so a test
    /// can assert how many real CG steps ran rather than trusting the
    /// reported `iterations` counter alone — the two can diverge (see
    /// [`crate::cg`]'s `max_iterations` handling).
    pub struct CountingComm<'a> {
        inner: &'a dyn RankComm,
        all_reduce_calls: std::sync::atomic::AtomicUsize,
    }

    impl<'a> CountingComm<'a> {
        pub fn new(inner: &'a dyn RankComm) -> Self {
            Self {
                inner,
                all_reduce_calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        pub fn all_reduce_calls(&self) -> usize {
            self.all_reduce_calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl<'a> RankComm for CountingComm<'a> {
        fn rank(&self) -> i32 {
            self.inner.rank()
        }

        fn size(&self) -> i32 {
            self.inner.size()
        }

        fn all_reduce_sum(&self, local: f64) -> f64 {
            self.all_reduce_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.all_reduce_sum(local)
        }

        fn halo_exchange(&self, sends: &[PendingSend<'_>], recvs: &[PendingRecv]) -> Result<Vec<Vec<f64>>> {
            self.inner.halo_exchange(sends, recvs)
        }

        fn all_gather_varying(&self, local: &[f64], counts: &[i32], displacements: &[i32]) -> Result<Vec<f64>> {
            self.inner.all_gather_varying(local, counts, displacements)
        }

        fn barrier(&self) {
            self.inner.barrier()
        }
    }

}
