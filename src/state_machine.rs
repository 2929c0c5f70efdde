//! Intent state machine (spec §4.G).
//!
//! Pure decision logic: given the intent's current status and an incoming
//! observation delta, decides the next status (or `None` if nothing
//! changes). Holding no I/O here keeps "pure state-machine transitions must
//! not suspend mid-transition" (spec §5) trivially true -- the caller
//! (`reconciler`) performs the single storage update that defines the
//! transition boundary.

use time::OffsetDateTime;

use crate::model::IntentStatus;

/// Where an [`ObservationDelta`] originated (spec §9, "tagged-union
/// deltas"). Informational only -- the state machine treats every source
/// identically; the reconciler and scheduler use it for logging and to
/// avoid redundant RPC calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaSource {
    Zmq,
    RpcPoll,
    IndexerPoll,
}

/// A single logical observation update, produced identically by ZMQ, RPC
/// poll, and indexer poll (spec §9).
#[derive(Debug, Clone)]
pub struct ObservationDelta {
    pub txid: String,
    pub vout: i32,
    pub value_sats: i64,
    pub confirmations: i32,
    pub seen_at: OffsetDateTime,
    pub source: DeltaSource,
}

/// Resolves the §9 "first output meets" vs. "sum of outputs meets" open
/// question. Default `FirstOutputMeets` matches the behavior the spec
/// documents as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    #[default]
    FirstOutputMeets,
    SumOfOutputsMeets,
}

/// The outcome of applying a delta to an intent: either nothing changes, or
/// the intent moves to a new status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    ToProcessing,
    ToConfirmed,
    /// `confirmed -> processing` on reorg (spec §4.G transition table).
    ToProcessingOnReorg,
    ToExpired,
}

/// Decides the transition (if any) for an intent currently in `status`,
/// given a newly observed or updated `(confirmations, value_sats)` pair.
/// `meets_amount` already folds in [`MatchMode`] (the reconciler computes
/// it once per delta, since that decision needs the full set of outputs
/// for `SumOfOutputsMeets`).
///
/// Spec §4.G transition table:
/// - `pending -> processing`: new observation, `confirmations = 0`, intent
///   not expired.
/// - `pending -> confirmed`: new observation already meeting
///   `requiredConfs`, intent not expired.
/// - `processing -> confirmed`: `confirmations` reaches `requiredConfs`.
/// - `pending -> expired` is driven by the scheduler's expiry sweep, not
///   this function (see [`expiry_transition`]).
pub fn apply_delta(
    status: IntentStatus,
    is_expired: bool,
    meets_amount: bool,
    confirmations: i32,
    required_confs: i32,
) -> Option<Transition> {
    let meets_confs = confirmations >= required_confs;

    match status {
        IntentStatus::Pending if !is_expired => {
            if meets_amount && meets_confs {
                Some(Transition::ToConfirmed)
            } else {
                Some(Transition::ToProcessing)
            }
        }
        IntentStatus::Processing => {
            if meets_amount && meets_confs {
                Some(Transition::ToConfirmed)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// `confirmed -> processing` when reconciliation finds the confirming
/// transaction is no longer known to the node (spec §4.G, "reorg").
pub fn reorg_transition(status: IntentStatus) -> Option<Transition> {
    if status == IntentStatus::Confirmed {
        Some(Transition::ToProcessingOnReorg)
    } else {
        None
    }
}

/// `pending -> expired`: the expiry sweep's guard is "no observation exists
/// yet", which the scheduler enforces by only calling this for intents
/// still in `pending` (an intent with any observation has already left
/// `pending`).
pub fn expiry_transition(status: IntentStatus, now: OffsetDateTime, expires_at: OffsetDateTime) -> Option<Transition> {
    if status == IntentStatus::Pending && now >= expires_at {
        Some(Transition::ToExpired)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn pending_with_zero_confs_goes_processing() {
        let t = apply_delta(IntentStatus::Pending, false, true, 0, 1);
        assert_eq!(t, Some(Transition::ToProcessing));
    }

    #[test]
    fn pending_meeting_confs_and_amount_goes_confirmed_in_one_step() {
        let t = apply_delta(IntentStatus::Pending, false, true, 1, 1);
        assert_eq!(t, Some(Transition::ToConfirmed));
    }

    #[test]
    fn processing_reaching_required_confs_confirms() {
        let t = apply_delta(IntentStatus::Processing, false, true, 1, 1);
        assert_eq!(t, Some(Transition::ToConfirmed));
    }

    #[test]
    fn under_amount_never_confirms() {
        let t = apply_delta(IntentStatus::Processing, false, false, 6, 1);
        assert_eq!(t, None);
    }

    #[test]
    fn expired_pending_does_not_advance_on_new_observation() {
        let t = apply_delta(IntentStatus::Pending, true, true, 1, 1);
        assert_eq!(t, None);
    }

    #[test]
    fn reorg_only_applies_to_confirmed() {
        assert_eq!(reorg_transition(IntentStatus::Confirmed), Some(Transition::ToProcessingOnReorg));
        assert_eq!(reorg_transition(IntentStatus::Processing), None);
        assert_eq!(reorg_transition(IntentStatus::Pending), None);
    }

    #[test]
    fn expiry_only_applies_to_pending_past_deadline() {
        let now = OffsetDateTime::now_utc();
        let past = now - Duration::minutes(1);
        let future = now + Duration::minutes(1);
        assert_eq!(expiry_transition(IntentStatus::Pending, now, past), Some(Transition::ToExpired));
        assert_eq!(expiry_transition(IntentStatus::Pending, now, future), None);
        assert_eq!(expiry_transition(IntentStatus::Processing, now, past), None);
    }
}
