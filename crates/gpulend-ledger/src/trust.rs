//! Trust scoring over recent ledger history.
//!
//! Score is an exponentially weighted success ratio over the last
//! [`TRUST_WINDOW`] entries in which the peer was the executor. Outcomes that
//! say nothing about the executor (declines, cancellations, payload errors)
//! are skipped.

use crate::entry::{ErrorClass, LedgerEntry, Outcome};

/// Number of most recent entries considered.
pub const TRUST_WINDOW: usize = 20;

/// Smoothing factor: weight of each new observation.
pub const TRUST_ALPHA: f64 = 0.3;

/// Score of a peer with no usable history.
pub const TRUST_PRIOR: f64 = 0.5;

/// Map an outcome to an observation in `[0, 1]`, or `None` when it carries
/// no signal about the executor.
pub fn observation(outcome: &Outcome) -> Option<f64> {
    match outcome {
        Outcome::Succeeded => Some(1.0),
        Outcome::Failed {
            class: ErrorClass::PayloadError,
        } => None,
        Outcome::Failed { .. } | Outcome::TimedOut | Outcome::PeerLost => Some(0.0),
        Outcome::Declined | Outcome::Cancelled => None,
    }
}

/// Compute the trust score from entries ordered newest first.
pub fn score(newest_first: &[LedgerEntry]) -> f64 {
    newest_first
        .iter()
        .take(TRUST_WINDOW)
        .rev()
        .filter_map(|e| observation(&e.outcome))
        .fold(TRUST_PRIOR, |acc, x| acc + TRUST_ALPHA * (x - acc))
}

/// Count failing outcomes among entries ordered newest first.
pub fn failures(newest_first: &[LedgerEntry]) -> u32 {
    newest_first
        .iter()
        .take(TRUST_WINDOW)
        .filter(|e| observation(&e.outcome) == Some(0.0))
        .count() as u32
}
