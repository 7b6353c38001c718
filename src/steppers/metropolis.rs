//! Single-step Metropolis engine

use log::debug;
use rand::Rng;

use super::{metropolis_accept, StepOutcome};
use crate::collection::OnePoint;
use crate::posterior::LogPosterior;
use crate::proposal::BlockedProposer;

/// Draw one trial from the full blocked proposal and test it against the
/// current point.
pub(crate) fn get_new_sample_metropolis<L, R>(
    rng: &mut R,
    posterior: &L,
    proposer: &mut BlockedProposer,
    current: &OnePoint,
) -> StepOutcome
where
    L: LogPosterior,
    R: Rng,
{
    let mut trial = current.values.clone();
    proposer.get_proposal(&mut trial, rng);
    let eval = posterior.eval(&trial);
    if metropolis_accept(rng, eval.logpost, current.logpost) {
        StepOutcome::Accept(OnePoint::new(trial, eval))
    } else {
        debug!("Proposal rejected (trial logpost {}).", eval.logpost);
        StepOutcome::Reject
    }
}
