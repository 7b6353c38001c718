//! Multi-chain front-end

use std::thread;

use log::info;
use rand::{Rng, SeedableRng};

use crate::chain::{Chain, ChainSetup, SampleHandler};
use crate::collection::{Collection, SampleWriter};
use crate::comm::{MemComm, NullComm};
use crate::covmat::{initial_proposal_covmat, CovmatSource};
use crate::error::Result;
use crate::parameter::Parameterization;
use crate::posterior::LogPosterior;
use crate::prior::Prior;
use crate::settings::{resolve_scheme, McmcOptions};

/// Factory producing one sample writer per chain rank
pub type WriterFactory = dyn Fn(usize) -> Box<dyn SampleWriter> + Sync;

/// Runs one or more chains against a posterior and returns their
/// collections.
///
/// # Example
/// ```rust
/// use fastslow::{FnPosterior, McmcOptions, Parameterization, Runner, SampledParam};
/// use nalgebra::DVector;
/// use rand::rngs::StdRng;
/// use rand::SeedableRng;
/// use rv::dist::Gaussian;
///
/// let params = Parameterization::new(vec![SampledParam::new(
///     "x",
///     Box::new(Gaussian::standard()),
/// )])
/// .unwrap();
/// let posterior = FnPosterior::new(vec!["x"], |v: &DVector<f64>| -0.5 * v[0] * v[0]);
///
/// let mut rng = StdRng::seed_from_u64(0xFEED);
/// let collections = Runner::new(&params, &posterior)
///     .options(McmcOptions::new().max_samples(500).learn_proposal(false))
///     .run(&mut rng)
///     .unwrap();
/// assert_eq!(collections.len(), 1);
/// assert_eq!(collections[0].n(), 500);
/// ```
pub struct Runner<'a, L: LogPosterior> {
    parametrization: &'a Parameterization,
    posterior: &'a L,
    options: McmcOptions,
    covmat: Option<CovmatSource>,
    chains: usize,
    handler: Option<&'a dyn SampleHandler>,
    writers: Option<&'a WriterFactory>,
}

impl<'a, L: LogPosterior> Clone for Runner<'a, L> {
    fn clone(&self) -> Self {
        Self {
            parametrization: self.parametrization,
            posterior: self.posterior,
            options: self.options.clone(),
            covmat: self.covmat.clone(),
            chains: self.chains,
            handler: self.handler,
            writers: self.writers,
        }
    }
}

impl<'a, L: LogPosterior> Runner<'a, L> {
    /// A single-chain runner with default options
    pub fn new(parametrization: &'a Parameterization, posterior: &'a L) -> Self {
        Runner {
            parametrization,
            posterior,
            options: McmcOptions::default(),
            covmat: None,
            chains: 1,
            handler: None,
            writers: None,
        }
    }

    /// Replace the sampler options
    pub fn options(&self, options: McmcOptions) -> Self {
        Self {
            options,
            ..(*self).clone()
        }
    }

    /// Supply an initial proposal covariance
    pub fn covmat(&self, covmat: CovmatSource) -> Self {
        Self {
            covmat: Some(covmat),
            ..(*self).clone()
        }
    }

    /// Number of chains to run in parallel
    pub fn chains(&self, chains: usize) -> Self {
        assert!(chains >= 1, "the number of chains must be one or more");
        Self {
            chains,
            ..(*self).clone()
        }
    }

    /// Register a callback invoked on freshly accepted samples
    pub fn callback(&self, handler: &'a dyn SampleHandler) -> Self {
        Self {
            handler: Some(handler),
            ..(*self).clone()
        }
    }

    /// Attach per-chain sample writers
    pub fn writers(&self, writers: &'a WriterFactory) -> Self {
        Self {
            writers: Some(writers),
            ..(*self).clone()
        }
    }

    fn make_collection(&self, rank: usize) -> Collection {
        match self.writers {
            Some(f) => Collection::with_writer(f(rank)),
            None => Collection::new(),
        }
    }

    /// Run every chain to termination and return the collections by rank.
    ///
    /// Per-chain RNGs are seeded from `rng`, so a seeded master gives a
    /// reproducible run.
    pub fn run<R: Rng + SeedableRng>(&self, rng: &mut R) -> Result<Vec<Collection>> {
        let speed_blocks = self.posterior.speeds_of_params();
        let scheme = resolve_scheme(&self.options, self.parametrization, &speed_blocks)?;
        let prior = Prior::new(self.parametrization);
        let assembled =
            initial_proposal_covmat(self.covmat.as_ref(), self.parametrization, &prior)?;
        info!("Sampling with covariance matrix: {:?}", assembled.matrix);

        let setup = ChainSetup {
            parametrization: self.parametrization,
            posterior: self.posterior,
            options: &self.options,
            scheme: &scheme,
            initial_covmat: &assembled,
            handler: self.handler,
        };

        if self.chains == 1 {
            let chain = Chain::new(setup, self.make_collection(0), NullComm, rng)?;
            return Ok(vec![chain.run(rng)?]);
        }

        let seeds: Vec<u64> = (0..self.chains).map(|_| rng.gen()).collect();
        let comms = MemComm::group(self.chains);
        let results: Vec<Result<Collection>> = thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .zip(&seeds)
                .enumerate()
                .map(|(rank, (comm, &seed))| {
                    let collection = self.make_collection(rank);
                    scope.spawn(move || {
                        let mut rng = R::seed_from_u64(seed);
                        let chain = Chain::new(setup, collection, comm, &mut rng)?;
                        chain.run(&mut rng)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("chain thread panicked"))
                .collect()
        });

        let mut collections = Vec::with_capacity(results.len());
        for result in results {
            collections.push(result?);
        }
        Ok(collections)
    }
}
