//! Per-chain driver: the main sampling loop and its bookkeeping

use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use nalgebra::DMatrix;
use rand::Rng;

use crate::collection::{Collection, OnePoint};
use crate::comm::Communicator;
use crate::convergence::{self, ChainStats, ConvergenceCriteria};
use crate::covmat::AssembledCovmat;
use crate::error::{Error, Result};
use crate::parameter::Parameterization;
use crate::posterior::LogPosterior;
use crate::prior::Prior;
use crate::proposal::BlockedProposer;
use crate::settings::{Engine, McmcOptions, ResolvedScheme};
use crate::steppers::{get_new_sample_dragging, get_new_sample_metropolis, StepOutcome};

/// Read-only facet of a running chain handed to sample callbacks
pub struct SamplerView<'a> {
    /// The sampled parameters
    pub parametrization: &'a Parameterization,
    /// Samples stored so far
    pub collection: &'a Collection,
    /// The chain's current point
    pub current: &'a OnePoint,
}

/// Callback invoked every `callback_every` freshly accepted samples
pub trait SampleHandler: Send + Sync {
    /// Observe the chain just after a point was accepted
    fn on_new_sample(&self, view: SamplerView<'_>);
}

impl<F> SampleHandler for F
where
    F: Fn(SamplerView<'_>) + Send + Sync,
{
    fn on_new_sample(&self, view: SamplerView<'_>) {
        self(view)
    }
}

/// Everything a chain borrows from its runner
pub(crate) struct ChainSetup<'a, L> {
    pub parametrization: &'a Parameterization,
    pub posterior: &'a L,
    pub options: &'a McmcOptions,
    pub scheme: &'a ResolvedScheme,
    pub initial_covmat: &'a AssembledCovmat,
    pub handler: Option<&'a dyn SampleHandler>,
}

impl<'a, L> Clone for ChainSetup<'a, L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, L> Copy for ChainSetup<'a, L> {}

/// One Markov chain: current point, collection and proposer, advanced by
/// the engine picked at scheme resolution
pub(crate) struct Chain<'a, L: LogPosterior, C: Communicator> {
    setup: ChainSetup<'a, L>,
    proposer: BlockedProposer,
    collection: Collection,
    current: OnePoint,
    burn_in_left: u64,
    converged: bool,
    rminus1_last: f64,
    learn_rminus1_max: f64,
    pending_ready: bool,
    comm: C,
}

impl<'a, L, C> Chain<'a, L, C>
where
    L: LogPosterior,
    C: Communicator,
{
    /// Build the proposer and seat the initial point, drawn from the
    /// reference pdfs until the posterior is finite
    pub fn new<R: Rng>(
        setup: ChainSetup<'a, L>,
        collection: Collection,
        comm: C,
        rng: &mut R,
    ) -> Result<Self> {
        match Self::build(setup, rng) {
            Ok((proposer, current, learn_rminus1_max)) => Ok(Chain {
                setup,
                proposer,
                collection,
                current,
                burn_in_left: setup.options.burn_in + 1,
                converged: false,
                rminus1_last: f64::INFINITY,
                learn_rminus1_max,
                pending_ready: false,
                comm,
            }),
            Err(e) => {
                // Release any sibling chains before surfacing the failure
                comm.leave();
                Err(e)
            }
        }
    }

    fn build<R: Rng>(
        setup: ChainSetup<'a, L>,
        rng: &mut R,
    ) -> Result<(BlockedProposer, OnePoint, f64)> {
        let scheme = setup.scheme;
        let options = setup.options;
        let mut proposer = BlockedProposer::new(
            scheme.blocks.clone(),
            scheme.oversampling_factors.as_deref(),
            scheme.i_last_slow_block,
            options.propose_scale,
        )?;
        proposer.set_covariance(&setup.initial_covmat.matrix)?;

        let learn_rminus1_max = if setup.initial_covmat.incomplete {
            info!(
                "Covariance matrix not complete. We will start learning the \
                 covariance of the proposal earlier: R-1 = {} (was {}).",
                options.learn_proposal_rminus1_max_early, options.learn_proposal_rminus1_max
            );
            options.learn_proposal_rminus1_max_early
        } else {
            options.learn_proposal_rminus1_max
        };

        let prior = Prior::new(setup.parametrization);
        let mut current = None;
        for _ in 0..options.max_tries.max(1) {
            let point = prior.reference(rng);
            let eval = setup.posterior.eval(&point);
            if eval.logpost.is_finite() {
                current = Some(OnePoint::new(point, eval));
                break;
            }
        }
        let current = current.ok_or(Error::InitialPointFailed {
            tries: options.max_tries,
        })?;
        info!("Initial point: {:?}", current.values);
        Ok((proposer, current, learn_rminus1_max))
    }

    /// Number of stored samples
    fn n(&self) -> usize {
        self.collection.n()
    }

    /// Accepted steps including those discarded during burn-in
    fn n_with_burn_in(&self) -> u64 {
        self.collection.n() as u64 + (self.setup.options.burn_in + 1 - self.burn_in_left)
    }

    /// Run the chain to completion and hand back its collection
    pub fn run<R: Rng>(mut self, rng: &mut R) -> Result<Collection> {
        match self.sample_loop(rng) {
            Ok(()) => {}
            Err(e) => {
                self.comm.leave();
                return Err(e);
            }
        }
        // Finished chains keep answering checkpoints with their final
        // statistics until the whole group is done
        self.comm.mark_done();
        while !self.comm.all_done() {
            if self.comm.poll_checkpoint() {
                self.check_convergence_and_learn_proposal();
            }
            thread::sleep(Duration::from_micros(200));
        }
        info!(
            "Sampling complete after {} accepted steps ({} including burn-in).",
            self.n(),
            self.n_with_burn_in()
        );
        Ok(self.collection)
    }

    fn sample_loop<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        if self.comm.size() == 1 {
            info!(
                "Single chain: convergence is not tested; sampling stops at \
                 max_samples."
            );
        }
        info!("Sampling!");
        while self.n() < self.setup.scheme.effective_max_samples && !self.converged {
            self.get_new_sample(rng)?;
            if let Some(handler) = self.setup.handler {
                if self.n().max(1) % self.setup.options.callback_every == 0
                    && self.current.weight == 1
                {
                    handler.on_new_sample(SamplerView {
                        parametrization: self.setup.parametrization,
                        collection: &self.collection,
                        current: &self.current,
                    });
                }
            }
            if self.check_all_ready() {
                self.check_convergence_and_learn_proposal();
            }
        }
        self.collection.out_update()
    }

    fn get_new_sample<R: Rng>(&mut self, rng: &mut R) -> Result<bool> {
        let outcome = match self.setup.scheme.engine {
            Engine::Metropolis => get_new_sample_metropolis(
                rng,
                self.setup.posterior,
                &mut self.proposer,
                &self.current,
            ),
            Engine::Dragging { interp_steps } => get_new_sample_dragging(
                rng,
                self.setup.posterior,
                &mut self.proposer,
                &self.current,
                interp_steps,
            ),
        };
        self.process_accept_or_reject(outcome)
    }

    fn process_accept_or_reject(&mut self, outcome: StepOutcome) -> Result<bool> {
        match outcome {
            StepOutcome::Accept(trial) => {
                if self.burn_in_left == 0 {
                    let outgoing = std::mem::replace(&mut self.current, trial);
                    self.collection.add(outgoing);
                    debug!("New sample, #{}: {:?}", self.n(), self.current.values);
                    if self.n() % self.setup.options.output_every == 0 {
                        self.collection.out_update()?;
                    }
                } else {
                    self.burn_in_left -= 1;
                    debug!("Burn-in sample: {:?}", trial.values);
                    if self.burn_in_left == 0 && self.setup.options.burn_in > 0 {
                        info!(
                            "Finished burn-in phase: discarded {} accepted steps.",
                            self.setup.options.burn_in
                        );
                    }
                    self.current = trial;
                }
                Ok(true)
            }
            StepOutcome::Reject => {
                self.current.increase_weight(1);
                if self.current.weight > self.setup.options.max_tries {
                    if let Err(e) = self.collection.out_update() {
                        warn!("Could not flush the collection: {}", e);
                    }
                    return Err(Error::StuckChain {
                        tries: self.setup.options.max_tries,
                    });
                }
                Ok(false)
            }
        }
    }

    /// Signal readiness at our own checkpoints and poll until every chain
    /// is ready; non-blocking, so sampling continues in between
    fn check_all_ready(&mut self) -> bool {
        let n = self.n();
        let interval =
            self.setup.options.check_every_dimension_times * self.setup.scheme.n_slow;
        if !self.pending_ready
            && n > 0
            && self.current.weight == 1
            && n % interval == 0
        {
            info!("Checkpoint: {} samples accepted.", n);
            self.comm.signal_ready();
            self.pending_ready = true;
        }
        if self.pending_ready && self.comm.poll_checkpoint() {
            self.pending_ready = false;
            true
        } else {
            false
        }
    }

    /// Synchronous checkpoint: gather statistics, assess convergence on the
    /// root, share the verdict and optionally install a learned covariance
    fn check_convergence_and_learn_proposal(&mut self) {
        self.comm.checkpoint_begin();

        let first = self.n() / 2;
        let stats = ChainStats::from_collection(
            &self.collection,
            first,
            self.setup.options.rminus1_cl_level,
        );
        let gathered = self.comm.gather_stats(stats);
        let mut learned: Option<DMatrix<f64>> = None;
        let verdict = gathered.map(|all| {
            let assessment = convergence::assess(
                &all,
                self.rminus1_last,
                ConvergenceCriteria {
                    rminus1_stop: self.setup.options.rminus1_stop,
                    rminus1_cl_stop: self.setup.options.rminus1_cl_stop,
                },
            );
            learned = Some(assessment.mean_of_covs);
            assessment.verdict
        });
        let verdict = self.comm.broadcast_verdict(verdict);
        if verdict.success {
            self.rminus1_last = verdict.rminus1;
            self.converged = verdict.converged;
        }

        if self.setup.options.learn_proposal && !self.converged {
            let do_learn = if self.comm.size() > 1 {
                let good = self.rminus1_last > self.setup.options.learn_proposal_rminus1_min
                    && self.rminus1_last < self.learn_rminus1_max;
                if !good {
                    info!("Bad convergence statistics: waiting until the next checkpoint.");
                }
                good
            } else {
                true
            };
            if do_learn {
                let new_cov = self.comm.broadcast_covmat(learned.take());
                match self.proposer.set_covariance(&new_cov) {
                    Ok(()) => {
                        info!("Updated covariance matrix of proposal pdf.");
                        debug!("{:?}", new_cov);
                    }
                    Err(_) => warn!(
                        "Learned covariance is not positive-definite; keeping \
                         the previous proposal."
                    ),
                }
            }
        }

        self.comm.checkpoint_end();
    }
}
