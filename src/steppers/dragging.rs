//! Fast-dragging engine
//!
//! A slow proposal fixes two extremes in the slow subspace; fast proposals
//! are then dragged along both extremes through a sequence of interpolated
//! Metropolis tests, and the whole move is accepted on the path-averaged
//! log-posteriors. The intermediate tests let the fast trajectory adapt to
//! any degeneracy between slow and fast directions.

use log::debug;
use nalgebra::DVector;
use rand::Rng;

use super::{metropolis_accept, StepOutcome};
use crate::collection::OnePoint;
use crate::posterior::LogPosterior;
use crate::proposal::BlockedProposer;

/// Draw one slow trial and drag the fast parameters along it with
/// `interp_steps` interpolating sub-steps. With zero sub-steps this is a
/// plain Metropolis test on the slow move.
pub(crate) fn get_new_sample_dragging<L, R>(
    rng: &mut R,
    posterior: &L,
    proposer: &mut BlockedProposer,
    current: &OnePoint,
    interp_steps: usize,
) -> StepOutcome
where
    L: LogPosterior,
    R: Rng,
{
    // Extremes of the move in the slow subspace
    let start_slow_logpost = current.logpost;
    let mut end_slow_point = current.values.clone();
    proposer.get_proposal_slow(&mut end_slow_point, rng);
    debug!("Proposed slow end-point: {:?}", end_slow_point);
    let end_slow_eval = posterior.eval(&end_slow_point);
    if !end_slow_eval.logpost.is_finite() {
        return StepOutcome::Reject;
    }
    if interp_steps == 0 {
        return if metropolis_accept(rng, end_slow_eval.logpost, start_slow_logpost) {
            StepOutcome::Accept(OnePoint::new(end_slow_point, end_slow_eval))
        } else {
            StepOutcome::Reject
        };
    }

    let mut current_start_point = current.values.clone();
    let mut current_start_logpost = start_slow_logpost;
    let mut current_end_point = end_slow_point;
    let mut current_end_eval = end_slow_eval;

    // Accumulators of the dragging log-posteriors, tested at the end
    let mut start_drag_logpost_acc = 0.0;
    let mut end_drag_logpost_acc = 0.0;

    for i_step in 1..=interp_steps {
        debug!("Dragging step: {}", i_step);
        let mut delta_fast = DVector::zeros(current_start_point.len());
        proposer.get_proposal_fast(&mut delta_fast, rng);

        let proposal_start_point = &current_start_point + &delta_fast;
        let proposal_end_point = &current_end_point + &delta_fast;

        // Skip the end-point evaluation when the start already failed; only
        // the start's log-posterior is needed, its derived values are not
        // kept
        let proposal_start_logpost = posterior.eval(&proposal_start_point).logpost;
        let accepted = if proposal_start_logpost.is_finite() {
            let proposal_end_eval = posterior.eval(&proposal_end_point);
            if proposal_end_eval.logpost.is_finite() {
                let frac = i_step as f64 / (1 + interp_steps) as f64;
                let proposal_interp = (1.0 - frac) * proposal_start_logpost
                    + frac * proposal_end_eval.logpost;
                let current_interp = (1.0 - frac) * current_start_logpost
                    + frac * current_end_eval.logpost;
                if metropolis_accept(rng, proposal_interp, current_interp) {
                    Some(proposal_end_eval)
                } else {
                    None
                }
            } else {
                None
            }
        } else {
            None
        };

        if let Some(end_eval) = accepted {
            current_start_point = proposal_start_point;
            current_start_logpost = proposal_start_logpost;
            current_end_point = proposal_end_point;
            current_end_eval = end_eval;
        }
        // The final test uses the path average, accepted or not
        start_drag_logpost_acc += current_start_logpost;
        end_drag_logpost_acc += current_end_eval.logpost;
    }

    let n = interp_steps as f64;
    if metropolis_accept(rng, end_drag_logpost_acc / n, start_drag_logpost_acc / n) {
        StepOutcome::Accept(OnePoint::new(current_end_point, current_end_eval))
    } else {
        StepOutcome::Reject
    }
}
