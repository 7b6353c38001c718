//! Multi-chain convergence diagnostics and proposal learning
//!
//! Gelman-Rubin R-1 on the chain means, computed in the whitened frame of
//! the mean within-chain covariance, with a second criterion on the spread
//! of the marginal confidence bounds once the means have settled.

use log::{debug, info, warn};
use nalgebra::{Cholesky, DMatrix, DVector};

use crate::collection::Collection;

/// Per-chain summary statistics over the trailing half of its collection
#[derive(Clone, Debug)]
pub struct ChainStats {
    /// Number of stored samples in the chain
    pub n: usize,
    /// Weighted mean
    pub mean: DVector<f64>,
    /// Weighted covariance
    pub cov: DMatrix<f64>,
    /// Lower confidence bound per parameter
    pub bound_lower: DVector<f64>,
    /// Upper confidence bound per parameter
    pub bound_upper: DVector<f64>,
}

impl ChainStats {
    /// Summarize the points `first..` of a collection, with marginal bounds
    /// at confidence level `cl_level`
    pub fn from_collection(collection: &Collection, first: usize, cl_level: f64) -> Self {
        let mean = collection.mean(first);
        let cov = collection.cov(first);
        let d = mean.len();
        let limfrac = cl_level / 2.0;
        let bound_lower = DVector::from_iterator(
            d,
            (0..d).map(|i| collection.confidence(first, i, limfrac, false)),
        );
        let bound_upper = DVector::from_iterator(
            d,
            (0..d).map(|i| collection.confidence(first, i, limfrac, true)),
        );
        ChainStats {
            n: collection.n(),
            mean,
            cov,
            bound_lower,
            bound_upper,
        }
    }
}

/// Checkpoint result shared by every chain
#[derive(Clone, Debug)]
pub struct Verdict {
    /// Whether the R-1 statistic could be computed
    pub success: bool,
    /// R-1 of the means, meaningful only when `success`
    pub rminus1: f64,
    /// Whether the run has converged
    pub converged: bool,
}

/// Outcome of one checkpoint assessment on the gathered statistics
#[derive(Clone, Debug)]
pub struct Assessment {
    /// The verdict to broadcast
    pub verdict: Verdict,
    /// Sample-weighted mean of the within-chain covariances, the candidate
    /// for the next proposal covariance
    pub mean_of_covs: DMatrix<f64>,
}

/// Thresholds consumed by the checkpoint assessment
#[derive(Clone, Copy, Debug)]
pub struct ConvergenceCriteria {
    /// Stop threshold for R-1 of the means (must hold twice in a row)
    pub rminus1_stop: f64,
    /// Stop threshold for the normalized spread of the confidence bounds
    pub rminus1_cl_stop: f64,
}

/// Assess a checkpoint from the gathered per-chain statistics.
///
/// `rminus1_last` is the R-1 of the previous successful checkpoint
/// (infinity before the first), enforcing the twice-in-a-row means
/// criterion before the bound criterion is consulted.
pub fn assess(stats: &[ChainStats], rminus1_last: f64, criteria: ConvergenceCriteria) -> Assessment {
    let d = stats[0].mean.len();
    let n_total: f64 = stats.iter().map(|s| s.n as f64).sum();
    let mut mean_of_covs = DMatrix::zeros(d, d);
    for s in stats {
        mean_of_covs += &s.cov * (s.n as f64);
    }
    mean_of_covs /= n_total;

    let m = stats.len();
    if m < 2 {
        // Nothing to compare against; only the sample cap terminates
        return Assessment {
            verdict: Verdict {
                success: false,
                rminus1: f64::INFINITY,
                converged: false,
            },
            mean_of_covs,
        };
    }

    // Between-chains term: unweighted, so short outlier chains stand out
    let grand_mean = stats.iter().fold(DVector::zeros(d), |acc, s| acc + &s.mean) / m as f64;
    let mut cov_of_means = DMatrix::zeros(d, d);
    for s in stats {
        let delta = &s.mean - &grand_mean;
        cov_of_means += &delta * delta.transpose();
    }
    cov_of_means /= (m - 1) as f64;

    // Normalize both terms to the correlation frame of the between-chains
    // covariance; the eigenvalues are unchanged
    let diag_inv_sqrt =
        DMatrix::from_diagonal(&cov_of_means.diagonal().map(|x| x.powf(-0.5)));
    let corr_of_means = &diag_inv_sqrt * &cov_of_means * &diag_inv_sqrt;
    let norm_mean_of_covs = &diag_inv_sqrt * &mean_of_covs * &diag_inv_sqrt;

    let whitened = Cholesky::new(norm_mean_of_covs.clone())
        .and_then(|chol| chol.l().try_inverse())
        .map(|l_inv| &l_inv * &corr_of_means * l_inv.transpose());
    let whitened = match whitened {
        Some(w) if w.iter().all(|x| x.is_finite()) => w,
        _ => {
            warn!(
                "Negative covariance eigenvectors. This may mean that the \
                 covariance of the samples does not contain enough \
                 information at this point. Skipping this checkpoint."
            );
            return Assessment {
                verdict: Verdict {
                    success: false,
                    rminus1: f64::INFINITY,
                    converged: false,
                },
                mean_of_covs,
            };
        }
    };
    let symmetrized = (&whitened + whitened.transpose()) / 2.0;
    let eigvals = symmetrized.symmetric_eigen().eigenvalues;
    let rminus1 = eigvals.iter().fold(0.0_f64, |acc, &l| acc.max(l.abs()));
    let smallest = eigvals
        .iter()
        .fold(f64::INFINITY, |acc, &l| acc.min(l.abs()));
    debug!("Condition number = {:e}", rminus1 / smallest);
    debug!("Eigenvalues = {:?}", eigvals);
    info!("Convergence of means: R-1 = {:.6}", rminus1);

    let mut converged = false;
    if rminus1.max(rminus1_last) < criteria.rminus1_stop {
        // Means have settled twice in a row; now ask the same of the
        // confidence bounds, in units of the mean chain standard deviation
        let rminus1_cl = (0..d)
            .flat_map(|i| {
                let sd = mean_of_covs[(i, i)].sqrt();
                [
                    std_across(stats.iter().map(|s| s.bound_lower[i])) / sd,
                    std_across(stats.iter().map(|s| s.bound_upper[i])) / sd,
                ]
            })
            .fold(0.0_f64, f64::max);
        info!("Convergence of bounds: R-1 = {:.6}", rminus1_cl);
        if rminus1_cl < criteria.rminus1_cl_stop {
            converged = true;
            info!("The run has converged!");
        }
    }

    Assessment {
        verdict: Verdict {
            success: true,
            rminus1,
            converged,
        },
        mean_of_covs,
    }
}

fn std_across(values: impl Iterator<Item = f64>) -> f64 {
    let values: Vec<f64> = values.collect();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}
