//! The posterior evaluator seam

use nalgebra::DVector;

/// Everything one posterior evaluation yields.
///
/// A non-finite `logpost` marks a point outside the support (or an otherwise
/// invalid evaluation); it is handled as a routine rejection, never an error.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct Evaluation {
    /// Log-posterior density (up to a constant)
    pub logpost: f64,
    /// Log-prior density
    pub logprior: f64,
    /// Per-likelihood log-likelihoods
    pub logliks: Vec<f64>,
    /// Derived parameter values
    pub derived: Vec<f64>,
}

impl Evaluation {
    /// Evaluation carrying only a log-posterior
    pub fn from_logpost(logpost: f64) -> Self {
        Evaluation {
            logpost,
            logprior: 0.0,
            logliks: Vec::new(),
            derived: Vec::new(),
        }
    }
}

/// One group of parameters sharing a likelihood speed.
///
/// The speed is the relative cost factor of re-evaluating the likelihood
/// when a parameter of the block varies; only the ranking matters.
#[derive(Clone, Debug)]
pub struct SpeedBlock {
    /// Relative speed (higher is cheaper)
    pub speed: f64,
    /// Names of the sampled parameters in this block
    pub params: Vec<String>,
}

/// The external posterior: a pure function of the sampled point, plus the
/// speed structure of its likelihoods.
pub trait LogPosterior: Send + Sync {
    /// Evaluate the log-posterior and its components at `x`
    fn eval(&self, x: &DVector<f64>) -> Evaluation;

    /// Parameter blocks ordered by ascending speed (slowest first)
    fn speeds_of_params(&self) -> Vec<SpeedBlock>;
}

/// Posterior built from a plain log-density function, for targets without
/// per-likelihood structure.
pub struct FnPosterior<F> {
    f: F,
    blocks: Vec<SpeedBlock>,
}

impl<F> FnPosterior<F>
where
    F: Fn(&DVector<f64>) -> f64 + Send + Sync,
{
    /// Wrap `f` as a single-block posterior over the named parameters
    pub fn new<S: Into<String>>(params: Vec<S>, f: F) -> Self {
        FnPosterior {
            f,
            blocks: vec![SpeedBlock {
                speed: 1.0,
                params: params.into_iter().map(|s| s.into()).collect(),
            }],
        }
    }

    /// Replace the speed structure, e.g. to split slow and fast parameters
    pub fn with_speeds(mut self, blocks: Vec<SpeedBlock>) -> Self {
        self.blocks = blocks;
        self
    }
}

impl<F> LogPosterior for FnPosterior<F>
where
    F: Fn(&DVector<f64>) -> f64 + Send + Sync,
{
    fn eval(&self, x: &DVector<f64>) -> Evaluation {
        Evaluation::from_logpost((self.f)(x))
    }

    fn speeds_of_params(&self) -> Vec<SpeedBlock> {
        self.blocks.clone()
    }
}
