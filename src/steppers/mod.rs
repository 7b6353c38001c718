//! Acceptance engines
//!
//! Both engines assume the proposal density is symmetric, so the acceptance
//! rule reduces to the posterior ratio.

mod dragging;
mod metropolis;

pub(crate) use dragging::get_new_sample_dragging;
pub(crate) use metropolis::get_new_sample_metropolis;

use rand::Rng;
use rv::dist::Exponential;
use rv::traits::Rv;

use crate::collection::OnePoint;

/// Outcome of one full proposal round
pub(crate) enum StepOutcome {
    /// The chain moves to this point
    Accept(OnePoint),
    /// The current point survives with one more unit of weight
    Reject,
}

/// Symmetric-proposal Metropolis test on two log-posteriors.
///
/// Equivalent to accepting with probability `min(1, exp(trial - current))`;
/// an `Exp(1)` draw exceeding the deficit is the standard equivalent form.
/// A non-finite trial is always rejected.
pub fn metropolis_accept<R: Rng>(rng: &mut R, logp_trial: f64, logp_current: f64) -> bool {
    if !logp_trial.is_finite() {
        false
    } else if logp_trial > logp_current {
        true
    } else {
        let draw: f64 = Exponential::new(1.0).unwrap().draw(rng);
        draw > logp_current - logp_trial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn better_points_always_accepted() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert!(metropolis_accept(&mut rng, -1.0, -2.0));
        }
    }

    #[test]
    fn non_finite_trials_always_rejected() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert!(!metropolis_accept(&mut rng, f64::NEG_INFINITY, -1.0));
            assert!(!metropolis_accept(&mut rng, f64::NAN, -1.0));
        }
    }

    #[test]
    fn acceptance_rate_matches_posterior_ratio() {
        let mut rng = StdRng::seed_from_u64(7);
        let delta: f64 = 1.5;
        let n = 100_000;
        let accepted = (0..n)
            .filter(|_| metropolis_accept(&mut rng, -delta, 0.0))
            .count();
        let rate = accepted as f64 / n as f64;
        let expected = (-delta).exp();
        assert!(
            (rate - expected).abs() < 0.01,
            "rate {} expected {}",
            rate,
            expected
        );
    }
}
