//! # fastslow
//!
//! A blocked fast/slow Metropolis MCMC sampler for Bayesian inference.
//!
//! The proposal pdf is a Gaussian mixed with an exponential pdf in random
//! directions, blocked by likelihood speed: parameters that are expensive
//! to vary sit in slow blocks, cheap ones in fast blocks. On top of plain
//! Metropolis the sampler can *oversample* the fast blocks (take
//! proportionally more cheap steps) or *drag* the fast parameters along
//! slow moves through a sequence of interpolated acceptance tests.
//!
//! Parallel chains synchronize at checkpoints to compute the Gelman-Rubin
//! R-1 diagnostic and, optionally, to learn the proposal covariance from
//! the samples gathered so far.
//!
//! ```rust
//! use fastslow::{FnPosterior, McmcOptions, Parameterization, Runner, SampledParam};
//! use nalgebra::DVector;
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use rv::dist::Gaussian;
//!
//! let params = Parameterization::new(vec![
//!     SampledParam::new("x", Box::new(Gaussian::standard())),
//!     SampledParam::new("y", Box::new(Gaussian::standard())),
//! ])
//! .unwrap();
//! let posterior = FnPosterior::new(vec!["x", "y"], |v: &DVector<f64>| {
//!     -0.5 * v.norm_squared()
//! });
//!
//! let mut rng = StdRng::seed_from_u64(0xFA57);
//! let collections = Runner::new(&params, &posterior)
//!     .options(McmcOptions::new().max_samples(1000).learn_proposal(false))
//!     .run(&mut rng)
//!     .unwrap();
//! assert_eq!(collections[0].n(), 1000);
//! ```

pub mod chain;
pub mod collection;
pub mod comm;
pub mod convergence;
pub mod covmat;
pub mod error;
pub mod parameter;
pub mod posterior;
pub mod prior;
pub mod proposal;
pub mod runner;
pub mod settings;
pub mod steppers;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::chain::{SampleHandler, SamplerView};
pub use crate::collection::{Collection, OnePoint, SampleWriter, TextWriter};
pub use crate::comm::{Communicator, MemComm, NullComm};
pub use crate::convergence::{assess, ChainStats, ConvergenceCriteria, Verdict};
pub use crate::covmat::{initial_proposal_covmat, load_covmat, save_covmat, CovmatSource};
pub use crate::error::{Error, Result};
pub use crate::parameter::{Parameterization, SampledParam, ScalarDist};
pub use crate::posterior::{Evaluation, FnPosterior, LogPosterior, SpeedBlock};
pub use crate::prior::Prior;
pub use crate::proposal::{BlockedProposer, CyclicIndexRandomizer};
pub use crate::runner::{Runner, WriterFactory};
pub use crate::settings::McmcOptions;
pub use crate::steppers::metropolis_accept;
