//! Collective communication between parallel chains
//!
//! Chains only ever meet at convergence checkpoints. Readiness is a
//! non-blocking signal-and-poll, so a chain that reaches its checkpoint
//! keeps proposing while the others catch up; once every chain has
//! signalled, all of them enter the synchronous gather/broadcast sequence.

use std::sync::{Arc, Condvar, Mutex};

use nalgebra::DMatrix;

use crate::convergence::{ChainStats, Verdict};

/// The collective operations a chain needs. Injected into the driver so a
/// single chain runs against a no-op implementation.
pub trait Communicator: Send {
    /// Number of chains in the group
    fn size(&self) -> usize;
    /// This chain's rank
    fn rank(&self) -> usize;
    /// Non-blocking: announce this chain is ready for a checkpoint
    fn signal_ready(&self);
    /// Non-blocking: true once per checkpoint, when every chain is ready
    fn poll_checkpoint(&self) -> bool;
    /// Enter the synchronous checkpoint
    fn checkpoint_begin(&self);
    /// Leave the synchronous checkpoint
    fn checkpoint_end(&self);
    /// Collect every chain's statistics; `Some` only on the root chain
    fn gather_stats(&self, stats: ChainStats) -> Option<Vec<ChainStats>>;
    /// Share the root's verdict; non-root chains pass `None`
    fn broadcast_verdict(&self, verdict: Option<Verdict>) -> Verdict;
    /// Share the root's learned covariance; non-root chains pass `None`
    fn broadcast_covmat(&self, covmat: Option<DMatrix<f64>>) -> DMatrix<f64>;
    /// This chain finished sampling but will keep servicing checkpoints
    fn mark_done(&self);
    /// True once every chain is done or has left
    fn all_done(&self) -> bool;
    /// This chain exits for good (error path); waiters are released
    fn leave(&self);
}

/// Single-chain communicator: readiness is immediate and every collective
/// is an identity operation
pub struct NullComm;

impl Communicator for NullComm {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn signal_ready(&self) {}

    fn poll_checkpoint(&self) -> bool {
        true
    }

    fn checkpoint_begin(&self) {}

    fn checkpoint_end(&self) {}

    fn gather_stats(&self, stats: ChainStats) -> Option<Vec<ChainStats>> {
        Some(vec![stats])
    }

    fn broadcast_verdict(&self, verdict: Option<Verdict>) -> Verdict {
        verdict.expect("single-chain broadcast must carry a verdict")
    }

    fn broadcast_covmat(&self, covmat: Option<DMatrix<f64>>) -> DMatrix<f64> {
        covmat.expect("single-chain broadcast must carry a covariance")
    }

    fn mark_done(&self) {}

    fn all_done(&self) -> bool {
        true
    }

    fn leave(&self) {}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ChainFlag {
    Stepping,
    Ready,
    Done,
    Left,
}

struct SharedState {
    flags: Vec<ChainFlag>,
    /// Completed checkpoints; checkpoint `ticket + 1` is the one forming
    ticket: u64,
    /// Last checkpoint each rank enrolled in
    enrolled: Vec<u64>,
    arrived: usize,
    generation: u64,
    stats: Vec<Option<ChainStats>>,
    verdict: Option<Verdict>,
    covmat: Option<DMatrix<f64>>,
}

struct Shared {
    state: Mutex<SharedState>,
    cond: Condvar,
}

impl Shared {
    fn alive(&self, s: &SharedState) -> usize {
        s.flags.iter().filter(|&&f| f != ChainFlag::Left).count()
    }
}

/// In-process rank-labelled chain group sharing one checkpoint rendezvous
pub struct MemComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl MemComm {
    /// Create a group of `n` communicators, one per chain, rank-ordered
    pub fn group(n: usize) -> Vec<MemComm> {
        assert!(n > 0, "a chain group cannot be empty");
        let shared = Arc::new(Shared {
            state: Mutex::new(SharedState {
                flags: vec![ChainFlag::Stepping; n],
                ticket: 0,
                enrolled: vec![0; n],
                arrived: 0,
                generation: 0,
                stats: vec![None; n],
                verdict: None,
                covmat: None,
            }),
            cond: Condvar::new(),
        });
        (0..n)
            .map(|rank| MemComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Block until every chain that has not left arrives here
    fn rendezvous(&self) {
        let mut s = self.shared.state.lock().unwrap();
        let gen = s.generation;
        s.arrived += 1;
        if s.arrived >= self.shared.alive(&s) {
            s.arrived = 0;
            s.generation += 1;
            self.shared.cond.notify_all();
        } else {
            while s.generation == gen {
                s = self.shared.cond.wait(s).unwrap();
            }
        }
    }

    fn root(&self) -> usize {
        let s = self.shared.state.lock().unwrap();
        s.flags
            .iter()
            .position(|&f| f != ChainFlag::Left)
            .expect("no chains left in the group")
    }
}

impl Communicator for MemComm {
    fn size(&self) -> usize {
        let s = self.shared.state.lock().unwrap();
        s.flags.len()
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn signal_ready(&self) {
        let mut s = self.shared.state.lock().unwrap();
        if s.flags[self.rank] == ChainFlag::Stepping {
            s.flags[self.rank] = ChainFlag::Ready;
        }
    }

    fn poll_checkpoint(&self) -> bool {
        let mut s = self.shared.state.lock().unwrap();
        let settled = s.flags.iter().all(|&f| f != ChainFlag::Stepping);
        let any_ready = s.flags.iter().any(|&f| f == ChainFlag::Ready);
        if settled && any_ready && s.enrolled[self.rank] != s.ticket + 1 {
            s.enrolled[self.rank] = s.ticket + 1;
            true
        } else {
            false
        }
    }

    fn checkpoint_begin(&self) {
        self.rendezvous();
    }

    fn checkpoint_end(&self) {
        self.rendezvous();
        let mut s = self.shared.state.lock().unwrap();
        // First one through resets the group for the next checkpoint
        if s.ticket < s.enrolled[self.rank] {
            s.ticket = s.enrolled[self.rank];
            for f in s.flags.iter_mut() {
                if *f == ChainFlag::Ready {
                    *f = ChainFlag::Stepping;
                }
            }
            for slot in s.stats.iter_mut() {
                *slot = None;
            }
            s.verdict = None;
            s.covmat = None;
        }
    }

    fn gather_stats(&self, stats: ChainStats) -> Option<Vec<ChainStats>> {
        {
            let mut s = self.shared.state.lock().unwrap();
            s.stats[self.rank] = Some(stats);
        }
        self.rendezvous();
        if self.rank == self.root() {
            let s = self.shared.state.lock().unwrap();
            Some(s.stats.iter().flatten().cloned().collect())
        } else {
            None
        }
    }

    fn broadcast_verdict(&self, verdict: Option<Verdict>) -> Verdict {
        if let Some(v) = verdict {
            let mut s = self.shared.state.lock().unwrap();
            s.verdict = Some(v);
        }
        self.rendezvous();
        let s = self.shared.state.lock().unwrap();
        s.verdict.clone().expect("verdict broadcast without a root")
    }

    fn broadcast_covmat(&self, covmat: Option<DMatrix<f64>>) -> DMatrix<f64> {
        if let Some(c) = covmat {
            let mut s = self.shared.state.lock().unwrap();
            s.covmat = Some(c);
        }
        self.rendezvous();
        let s = self.shared.state.lock().unwrap();
        s.covmat.clone().expect("covariance broadcast without a root")
    }

    fn mark_done(&self) {
        let mut s = self.shared.state.lock().unwrap();
        if s.flags[self.rank] != ChainFlag::Left {
            s.flags[self.rank] = ChainFlag::Done;
        }
    }

    fn all_done(&self) -> bool {
        let s = self.shared.state.lock().unwrap();
        s.flags
            .iter()
            .all(|&f| f == ChainFlag::Done || f == ChainFlag::Left)
    }

    fn leave(&self) {
        let mut s = self.shared.state.lock().unwrap();
        s.flags[self.rank] = ChainFlag::Left;
        let alive = self.shared.alive(&s);
        if alive > 0 && s.arrived >= alive {
            s.arrived = 0;
            s.generation += 1;
        }
        self.shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;
    use std::thread;

    fn stats(rank: usize) -> ChainStats {
        ChainStats {
            n: 10 * (rank + 1),
            mean: DVector::from_vec(vec![rank as f64]),
            cov: DMatrix::identity(1, 1),
            bound_lower: DVector::from_vec(vec![-1.0]),
            bound_upper: DVector::from_vec(vec![1.0]),
        }
    }

    fn run_checkpoint(comm: &MemComm) -> Verdict {
        comm.signal_ready();
        while !comm.poll_checkpoint() {
            thread::yield_now();
        }
        comm.checkpoint_begin();
        let gathered = comm.gather_stats(stats(comm.rank()));
        let verdict = gathered.map(|all| Verdict {
            success: true,
            rminus1: all.len() as f64,
            converged: false,
        });
        let verdict = comm.broadcast_verdict(verdict);
        comm.checkpoint_end();
        verdict
    }

    #[test]
    fn checkpoint_gathers_all_and_broadcasts_one_verdict() {
        let comms = MemComm::group(4);
        let verdicts: Vec<Verdict> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .iter()
                .map(|comm| scope.spawn(move || run_checkpoint(comm)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for v in &verdicts {
            assert!(v.success);
            assert_eq!(v.rminus1, 4.0);
        }
    }

    #[test]
    fn two_consecutive_checkpoints() {
        let comms = MemComm::group(3);
        thread::scope(|scope| {
            for comm in &comms {
                scope.spawn(move || {
                    for _ in 0..2 {
                        let v = run_checkpoint(comm);
                        assert_eq!(v.rminus1, 3.0);
                    }
                });
            }
        });
    }

    #[test]
    fn done_chains_keep_servicing_checkpoints() {
        let comms = MemComm::group(2);
        thread::scope(|scope| {
            let (first, second) = (&comms[0], &comms[1]);
            scope.spawn(move || {
                // Finished sampling: drain checkpoints until everyone is done
                first.mark_done();
                while !first.all_done() {
                    if first.poll_checkpoint() {
                        run_collective(first);
                    }
                    thread::yield_now();
                }
            });
            scope.spawn(move || {
                let v = run_checkpoint(second);
                assert_eq!(v.rminus1, 2.0);
                second.mark_done();
            });
        });

        fn run_collective(comm: &MemComm) {
            comm.checkpoint_begin();
            let gathered = comm.gather_stats(stats(comm.rank()));
            let verdict = gathered.map(|all| Verdict {
                success: true,
                rminus1: all.len() as f64,
                converged: false,
            });
            comm.broadcast_verdict(verdict);
            comm.checkpoint_end();
        }
    }

    #[test]
    fn leaving_releases_waiters() {
        let comms = MemComm::group(2);
        thread::scope(|scope| {
            let (stayer, leaver) = (&comms[0], &comms[1]);
            scope.spawn(move || {
                leaver.leave();
            });
            scope.spawn(move || {
                // Eventually the group shrinks to just this chain
                stayer.mark_done();
                while !stayer.all_done() {
                    thread::yield_now();
                }
            });
        });
    }
}
