//! Sampler options and the sampling-scheme resolution

use itertools::Itertools;
use log::info;

use crate::error::{Error, Result};
use crate::parameter::Parameterization;
use crate::posterior::SpeedBlock;

/// Recognized sampler options, with the conventional defaults.
///
/// Thresholds named `rminus1` refer to the Gelman-Rubin R-1 statistic.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde_support", derive(serde::Serialize, serde::Deserialize))]
pub struct McmcOptions {
    /// Accepted samples discarded at the start of the chain
    pub burn_in: u64,
    /// Cap on stored samples per chain
    pub max_samples: usize,
    /// Stuck-chain threshold, also the initial-point retry budget
    pub max_tries: u64,
    /// Stored samples between output flushes
    pub output_every: usize,
    /// Stored samples between callback invocations
    pub callback_every: usize,
    /// Whether to adapt the proposal covariance from the samples
    pub learn_proposal: bool,
    /// Largest R-1 at which learning is still worthwhile
    pub learn_proposal_rminus1_max: f64,
    /// Operational learning bound while the covariance guess is incomplete
    pub learn_proposal_rminus1_max_early: f64,
    /// Smallest R-1 below which learning is skipped as noise
    pub learn_proposal_rminus1_min: f64,
    /// Checkpoint cadence, in accepted samples per slow dimension
    pub check_every_dimension_times: usize,
    /// Convergence threshold on the R-1 of the chain means
    pub rminus1_stop: f64,
    /// Convergence threshold on the spread of the confidence bounds
    pub rminus1_cl_stop: f64,
    /// Confidence level of the bounds entering the second criterion
    pub rminus1_cl_level: f64,
    /// Take proportionally more steps in faster blocks
    pub oversample: bool,
    /// Dragging steps as a multiple of the number of fast parameters
    pub drag_nfast_times: Option<f64>,
    /// Dragging interpolation steps, set directly
    pub drag_interp_steps: Option<usize>,
    /// Largest speed still considered slow when splitting for dragging
    pub max_speed_slow: f64,
    /// Overall scale factor of the proposal
    pub propose_scale: f64,
}

impl Default for McmcOptions {
    fn default() -> Self {
        McmcOptions {
            burn_in: 0,
            max_samples: usize::MAX,
            max_tries: 1000,
            output_every: 20,
            callback_every: 1,
            learn_proposal: true,
            learn_proposal_rminus1_max: 2.0,
            learn_proposal_rminus1_max_early: 30.0,
            learn_proposal_rminus1_min: 0.0,
            check_every_dimension_times: 40,
            rminus1_stop: 0.01,
            rminus1_cl_stop: 0.2,
            rminus1_cl_level: 0.95,
            oversample: false,
            drag_nfast_times: None,
            drag_interp_steps: None,
            max_speed_slow: 0.5,
            propose_scale: 2.4,
        }
    }
}

impl McmcOptions {
    /// Options with the conventional defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of accepted samples to discard at the start
    pub fn burn_in(&self, burn_in: u64) -> Self {
        Self {
            burn_in,
            ..self.clone()
        }
    }

    /// Cap the number of stored samples
    pub fn max_samples(&self, max_samples: usize) -> Self {
        Self {
            max_samples,
            ..self.clone()
        }
    }

    /// Set the stuck-chain threshold and initial-point retry budget
    pub fn max_tries(&self, max_tries: u64) -> Self {
        Self {
            max_tries,
            ..self.clone()
        }
    }

    /// Set the output flush cadence
    pub fn output_every(&self, output_every: usize) -> Self {
        assert!(output_every > 0, "output_every must be positive");
        Self {
            output_every,
            ..self.clone()
        }
    }

    /// Set the callback cadence
    pub fn callback_every(&self, callback_every: usize) -> Self {
        assert!(callback_every > 0, "callback_every must be positive");
        Self {
            callback_every,
            ..self.clone()
        }
    }

    /// Enable or disable proposal learning
    pub fn learn_proposal(&self, learn: bool) -> Self {
        Self {
            learn_proposal: learn,
            ..self.clone()
        }
    }

    /// Set the checkpoint cadence per slow dimension
    pub fn check_every_dimension_times(&self, times: usize) -> Self {
        assert!(times > 0, "check_every_dimension_times must be positive");
        Self {
            check_every_dimension_times: times,
            ..self.clone()
        }
    }

    /// Set the convergence threshold on the means
    pub fn rminus1_stop(&self, stop: f64) -> Self {
        Self {
            rminus1_stop: stop,
            ..self.clone()
        }
    }

    /// Set the convergence threshold on the bounds
    pub fn rminus1_cl_stop(&self, stop: f64) -> Self {
        Self {
            rminus1_cl_stop: stop,
            ..self.clone()
        }
    }

    /// Enable oversampling of the fast blocks
    pub fn oversample(&self, oversample: bool) -> Self {
        Self {
            oversample,
            ..self.clone()
        }
    }

    /// Request fast-dragging with this many interpolation steps
    pub fn drag_interp_steps(&self, steps: usize) -> Self {
        Self {
            drag_interp_steps: Some(steps),
            ..self.clone()
        }
    }

    /// Request fast-dragging with steps proportional to the fast dimension
    pub fn drag_nfast_times(&self, times: f64) -> Self {
        Self {
            drag_nfast_times: Some(times),
            ..self.clone()
        }
    }

    /// Set the slow/fast speed boundary
    pub fn max_speed_slow(&self, speed: f64) -> Self {
        Self {
            max_speed_slow: speed,
            ..self.clone()
        }
    }

    /// Set the overall proposal scale
    pub fn propose_scale(&self, scale: f64) -> Self {
        assert!(scale > 0.0, "propose_scale must be positive");
        Self {
            propose_scale: scale,
            ..self.clone()
        }
    }
}

/// Which acceptance engine drives the chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Engine {
    Metropolis,
    Dragging { interp_steps: usize },
}

/// The sampling scheme after validation: block structure, slow/fast split
/// and the engine, fixed once at startup
#[derive(Clone, Debug)]
pub(crate) struct ResolvedScheme {
    pub blocks: Vec<Vec<usize>>,
    pub oversampling_factors: Option<Vec<usize>>,
    pub i_last_slow_block: Option<usize>,
    pub n_slow: usize,
    pub effective_max_samples: usize,
    pub engine: Engine,
}

/// Integer oversampling factors: each speed relative to the slowest
pub(crate) fn oversampling_factors(speeds: &[f64]) -> Vec<usize> {
    speeds
        .iter()
        .map(|s| (s / speeds[0]).round().max(1.0) as usize)
        .collect()
}

/// Stored-sample budget per unit of full-space cost under oversampling
pub(crate) fn oversampling_budget(blocks: &[Vec<usize>], factors: &[usize]) -> f64 {
    let weighted: usize = blocks.iter().zip(factors).map(|(b, f)| b.len() * f).sum();
    let d: usize = blocks.iter().map(Vec::len).sum();
    weighted as f64 / d as f64
}

/// Validate the mode flags against the speed structure and fix the scheme
pub(crate) fn resolve_scheme(
    options: &McmcOptions,
    parametrization: &Parameterization,
    speed_blocks: &[SpeedBlock],
) -> Result<ResolvedScheme> {
    let d = parametrization.d();
    let mut ordered: Vec<&SpeedBlock> = speed_blocks.iter().collect();
    ordered.sort_by(|a, b| a.speed.partial_cmp(&b.speed).expect("non-finite speed"));

    let mut blocks: Vec<Vec<usize>> = Vec::with_capacity(ordered.len());
    for sb in &ordered {
        let block: Result<Vec<usize>> = sb
            .params
            .iter()
            .map(|name| {
                parametrization
                    .index_of(name)
                    .ok_or_else(|| Error::UnknownParam(name.clone()))
            })
            .collect();
        blocks.push(block?);
    }
    let covered: usize = blocks.iter().map(Vec::len).sum();
    if covered != d {
        return Err(Error::BadBlocks);
    }
    let speeds: Vec<f64> = ordered.iter().map(|b| b.speed).collect();

    let dragging = options.drag_nfast_times.is_some() || options.drag_interp_steps.is_some();
    if options.oversample && dragging {
        return Err(Error::ConflictingSchemes);
    }

    if options.oversample {
        let factors = oversampling_factors(&speeds);
        if factors.iter().all_equal() {
            return Err(Error::UniformSpeeds("oversampling"));
        }
        let budget = oversampling_budget(&blocks, &factors);
        let effective_max_samples = if options.max_samples == usize::MAX {
            usize::MAX
        } else {
            (options.max_samples as f64 * budget).round() as usize
        };
        info!(
            "Oversampling with factors {:?} (budget factor {:.3}).",
            factors, budget
        );
        let n_slow = blocks[0].len();
        Ok(ResolvedScheme {
            blocks,
            oversampling_factors: Some(factors),
            i_last_slow_block: None,
            n_slow,
            effective_max_samples,
            engine: Engine::Metropolis,
        })
    } else if dragging {
        if speeds.iter().all_equal() {
            return Err(Error::UniformSpeeds("fast-dragging"));
        }
        if options.drag_nfast_times.is_some() && options.drag_interp_steps.is_some() {
            return Err(Error::ConflictingDragOptions);
        }
        let min = speeds[0];
        let max = *speeds.last().unwrap();
        if !(min <= options.max_speed_slow && options.max_speed_slow < max) {
            return Err(Error::BadMaxSpeedSlow {
                min,
                max,
                got: options.max_speed_slow,
            });
        }
        let i_last_slow_block = speeds
            .iter()
            .position(|&s| s > options.max_speed_slow)
            .expect("a block faster than max_speed_slow exists")
            - 1;
        let n_slow: usize = blocks[..=i_last_slow_block].iter().map(Vec::len).sum();
        let n_fast = d - n_slow;
        let interp_steps = match options.drag_interp_steps {
            Some(steps) => steps,
            None => (options.drag_nfast_times.unwrap() * n_fast as f64).round() as usize,
        };
        info!(
            "Using fast dragging over {} slow parameters, with {} interpolating \
             steps on {} fast parameters.",
            n_slow, interp_steps, n_fast
        );
        Ok(ResolvedScheme {
            blocks,
            oversampling_factors: None,
            i_last_slow_block: Some(i_last_slow_block),
            n_slow,
            effective_max_samples: options.max_samples,
            engine: Engine::Dragging { interp_steps },
        })
    } else {
        Ok(ResolvedScheme {
            blocks,
            oversampling_factors: None,
            i_last_slow_block: None,
            n_slow: d,
            effective_max_samples: options.max_samples,
            engine: Engine::Metropolis,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::SampledParam;
    use rv::dist::Gaussian;

    fn pz(n: usize) -> Parameterization {
        Parameterization::new(
            (0..n)
                .map(|i| {
                    SampledParam::new(format!("p{}", i), Box::new(Gaussian::standard()))
                })
                .collect(),
        )
        .unwrap()
    }

    fn two_speeds(slow: f64, fast: f64) -> Vec<SpeedBlock> {
        vec![
            SpeedBlock {
                speed: slow,
                params: vec!["p0".into()],
            },
            SpeedBlock {
                speed: fast,
                params: vec!["p1".into()],
            },
        ]
    }

    #[test]
    fn oversampling_budget_for_two_singleton_blocks() {
        let options = McmcOptions::new().oversample(true).max_samples(1000);
        let scheme = resolve_scheme(&options, &pz(2), &two_speeds(1.0, 4.0)).unwrap();
        assert_eq!(scheme.oversampling_factors, Some(vec![1, 4]));
        // (1*1 + 1*4) / 2 = 2.5 times the per-block budget
        assert_eq!(scheme.effective_max_samples, 2500);
        assert_eq!(scheme.n_slow, 1);
        assert_eq!(scheme.engine, Engine::Metropolis);
    }

    #[test]
    fn oversampling_requires_a_speed_hierarchy() {
        let options = McmcOptions::new().oversample(true);
        assert!(matches!(
            resolve_scheme(&options, &pz(2), &two_speeds(1.0, 1.0)),
            Err(Error::UniformSpeeds(_))
        ));
    }

    #[test]
    fn oversampling_and_dragging_conflict() {
        let options = McmcOptions::new().oversample(true).drag_interp_steps(3);
        assert!(matches!(
            resolve_scheme(&options, &pz(2), &two_speeds(1.0, 4.0)),
            Err(Error::ConflictingSchemes)
        ));
    }

    #[test]
    fn both_drag_options_conflict() {
        let options = McmcOptions::new()
            .drag_interp_steps(3)
            .drag_nfast_times(2.0)
            .max_speed_slow(1.5);
        assert!(matches!(
            resolve_scheme(&options, &pz(2), &two_speeds(1.0, 2.0)),
            Err(Error::ConflictingDragOptions)
        ));
    }

    #[test]
    fn max_speed_slow_must_split_the_speeds() {
        let options = McmcOptions::new().drag_interp_steps(3).max_speed_slow(5.0);
        assert!(matches!(
            resolve_scheme(&options, &pz(2), &two_speeds(1.0, 2.0)),
            Err(Error::BadMaxSpeedSlow { .. })
        ));
    }

    #[test]
    fn dragging_counts_fast_params_for_interp_steps() {
        let options = McmcOptions::new().drag_nfast_times(2.0).max_speed_slow(1.0);
        let blocks = vec![
            SpeedBlock {
                speed: 1.0,
                params: vec!["p0".into()],
            },
            SpeedBlock {
                speed: 4.0,
                params: vec!["p1".into(), "p2".into()],
            },
        ];
        let scheme = resolve_scheme(&options, &pz(3), &blocks).unwrap();
        assert_eq!(scheme.engine, Engine::Dragging { interp_steps: 4 });
        assert_eq!(scheme.i_last_slow_block, Some(0));
        assert_eq!(scheme.n_slow, 1);
    }

    #[test]
    fn blocks_are_sorted_slowest_first() {
        let options = McmcOptions::new();
        let blocks = vec![
            SpeedBlock {
                speed: 4.0,
                params: vec!["p1".into()],
            },
            SpeedBlock {
                speed: 1.0,
                params: vec!["p0".into()],
            },
        ];
        let scheme = resolve_scheme(&options, &pz(2), &blocks).unwrap();
        assert_eq!(scheme.blocks, vec![vec![0], vec![1]]);
        assert_eq!(scheme.n_slow, 2);
    }
}
