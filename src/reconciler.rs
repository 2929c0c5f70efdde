//! Observation reconciler (spec §4.F).
//!
//! Turns a transaction's outputs into `TxObservation` upserts and, for each
//! new observation or upward `confirmations` change, drives the owning
//! intent through [`crate::state_machine`]. Source-agnostic: the push path
//! (ZMQ + RPC verbose-tx fetch) and the pull path (indexer / `listunspent`)
//! both funnel through [`Reconciler::reconcile_outputs`].

use std::sync::Arc;

use bitcoin::Txid;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::events::{dispatch, EventSink, GatewayEvent};
use crate::model::{IntentStatus, ObservationStatus, TxObservation};
use crate::rpc::RpcReader;
use crate::state_machine::{self, DeltaSource, MatchMode, Transition};
use crate::storage::CoreStore;
use crate::watched_set::WatchedAddressSet;
use crate::error::{GatewayError, GatewayResult};

/// One output of a transaction, already decoded to the shape the
/// reconciler needs regardless of whether it came from RPC or the indexer.
#[derive(Debug, Clone)]
pub struct TxOutputSighting {
    pub vout: i32,
    pub script_pubkey_hex: String,
    pub value_sats: i64,
}

pub struct Reconciler {
    storage: Arc<dyn CoreStore>,
    watched: Arc<WatchedAddressSet>,
    rpc: Option<RpcReader>,
    sink: Arc<dyn EventSink>,
    match_mode: MatchMode,
}

impl Reconciler {
    pub fn new(
        storage: Arc<dyn CoreStore>,
        watched: Arc<WatchedAddressSet>,
        rpc: Option<RpcReader>,
        sink: Arc<dyn EventSink>,
        match_mode: MatchMode,
    ) -> Self {
        Self { storage, watched, rpc, sink, match_mode }
    }

    /// Push-path entry point (spec §4.F): fetches the full verbose
    /// transaction via RPC and reconciles every output against the
    /// watched-address set. `confirmations_hint` is `0` when driven by
    /// `hashtx` (mempool) or the node's own reported `confirmations` when
    /// driven by a block notification or poll.
    pub async fn reconcile_via_rpc(&self, txid: &Txid, confirmations_hint: i32) -> GatewayResult<()> {
        let Some(rpc) = &self.rpc else {
            warn!(%txid, "reconcile_via_rpc called with no RPC client configured");
            return Ok(());
        };

        let tx = rpc.get_raw_transaction_verbosity_one(txid).await?;
        let confirmations = tx.confirmations.map(|c| c as i32).unwrap_or(confirmations_hint);

        let outputs: Vec<TxOutputSighting> = tx
            .transaction
            .output
            .iter()
            .enumerate()
            .map(|(vout, out)| TxOutputSighting {
                vout: vout as i32,
                script_pubkey_hex: out.script_pubkey.to_hex_string(),
                value_sats: out.value.to_sat() as i64,
            })
            .collect();

        self.reconcile_outputs(
            &txid.to_string(),
            &outputs,
            confirmations,
            OffsetDateTime::now_utc(),
            DeltaSource::RpcPoll,
        )
        .await
    }

    /// Source-agnostic core (spec §4.F steps 2-4). Processes every output,
    /// skipping (and logging) any that fail individually rather than
    /// aborting the whole transaction (spec §4.F, "Fatal per-output errors
    /// ... log and skip; they do not abort the tx").
    pub async fn reconcile_outputs(
        &self,
        txid: &str,
        outputs: &[TxOutputSighting],
        confirmations: i32,
        seen_at: OffsetDateTime,
        source: DeltaSource,
    ) -> GatewayResult<()> {
        // matchMode needs every watched output in this tx when sumOfOutputsMeets
        // is configured (spec §9); firstOutputMeets only needs each output in
        // isolation, so the per-output loop below already implements it.
        let total_to_watched: i64 = if self.match_mode == MatchMode::SumOfOutputsMeets {
            outputs
                .iter()
                .filter(|o| self.watched.contains(&script_from_hex(&o.script_pubkey_hex)))
                .map(|o| o.value_sats)
                .sum()
        } else {
            0
        };

        for output in outputs {
            if let Err(e) = self
                .reconcile_one_output(txid, output, confirmations, seen_at, source, total_to_watched)
                .await
            {
                warn!(%txid, vout = output.vout, error = %e, "skipping output during reconciliation");
            }
        }
        Ok(())
    }

    async fn reconcile_one_output(
        &self,
        txid: &str,
        output: &TxOutputSighting,
        confirmations: i32,
        seen_at: OffsetDateTime,
        source: DeltaSource,
        total_to_watched: i64,
    ) -> GatewayResult<()> {
        let script = script_from_hex(&output.script_pubkey_hex);
        let Some(intent_id) = self.watched.lookup(&script) else {
            return Ok(());
        };

        let Some(mut intent) = self.storage.get_intent(intent_id).await? else {
            return Ok(());
        };
        let Some(address_id) = intent.address_id else {
            return Ok(());
        };

        let existing = self.storage.get_observation(txid, output.vout).await?;
        let is_new = existing.is_none();
        let previous_confirmations = existing.as_ref().map(|o| o.confirmations).unwrap_or(-1);

        // Status only flips upward (mempool -> confirmed), never down, outside
        // of reorg handling (spec §4.F step 2).
        let status = if confirmations >= intent.required_confs {
            ObservationStatus::Confirmed
        } else {
            existing
                .as_ref()
                .map(|o| o.status)
                .unwrap_or(ObservationStatus::Mempool)
        };

        let observation = TxObservation {
            id: existing.as_ref().map(|o| o.id).unwrap_or_else(uuid::Uuid::new_v4),
            txid: txid.to_string(),
            vout: output.vout,
            value_sats: output.value_sats,
            confirmations: confirmations.max(previous_confirmations),
            address_id,
            script_pubkey_hex: output.script_pubkey_hex.clone(),
            status,
            seen_at: existing.as_ref().map(|o| o.seen_at).unwrap_or(seen_at),
            updated_at: seen_at,
        };
        let stored = self.storage.upsert_observation(observation).await?;

        let confirmations_rose = is_new || stored.confirmations > previous_confirmations;
        if !confirmations_rose {
            return Ok(());
        }

        let meets_amount = match self.match_mode {
            MatchMode::FirstOutputMeets => output.value_sats >= intent.amount_sats,
            MatchMode::SumOfOutputsMeets => total_to_watched >= intent.amount_sats,
        };
        let is_expired = intent.expires_at <= seen_at;

        let transition =
            state_machine::apply_delta(intent.status, is_expired, meets_amount, stored.confirmations, intent.required_confs);

        if let Some(transition) = transition {
            self.apply_transition(&mut intent, transition, stored.id, seen_at).await?;
        }

        info!(%txid, vout = output.vout, intent_id = %intent_id, ?source, "reconciled output");
        Ok(())
    }

    /// Checks a previously confirmed intent's transaction against the node
    /// again; if the node no longer knows it, fires the reorg transition
    /// (spec §4.G, `confirmed -> processing`; spec §9, mark the observation
    /// `mempool, confirmations=0` rather than deleting it).
    pub async fn check_for_reorg(&self, intent_id: uuid::Uuid) -> GatewayResult<()> {
        let Some(mut intent) = self.storage.get_intent(intent_id).await? else {
            return Ok(());
        };
        if intent.status != IntentStatus::Confirmed {
            return Ok(());
        }
        let Some(address_id) = intent.address_id else { return Ok(()) };
        let Some(observation) = self.storage.latest_observation_for_address(address_id).await? else {
            return Ok(());
        };
        let Some(rpc) = &self.rpc else { return Ok(()) };

        let txid: Txid = observation
            .txid
            .parse()
            .map_err(|e| crate::error::GatewayError::Fatal(format!("stored txid malformed: {e}")))?;

        // Only Bitcoin Core's specific "no such tx" response (mapped to
        // `NotFound` in the RPC client) counts as a reorg signal; any other
        // failure (timeout, node temporarily down) must not demote a
        // confirmed intent, since that is not evidence the tx was reorged
        // out -- it's evidence the node is unreachable right now (spec §4.G,
        // "iff RPC reports the tx missing").
        match rpc.get_raw_transaction_verbosity_one(&txid).await {
            Ok(_) => return Ok(()),
            Err(GatewayError::NotFound(_)) => {}
            Err(other) => {
                warn!(%txid, error = %other, "reorg check could not reach the node, deferring to next tick");
                return Ok(());
            }
        }

        let mut demoted = observation.clone();
        demoted.status = ObservationStatus::Mempool;
        demoted.confirmations = 0;
        demoted.updated_at = OffsetDateTime::now_utc();
        let demoted = self.storage.upsert_observation(demoted).await?;

        if let Some(Transition::ToProcessingOnReorg) = state_machine::reorg_transition(intent.status) {
            intent.status = IntentStatus::Processing;
            intent.confirmed_at = None;
            intent.updated_at = OffsetDateTime::now_utc();
            self.storage.update_intent(intent.clone()).await?;
            dispatch(
                self.sink.as_ref(),
                GatewayEvent::Reorg { intent_id, observation_id: demoted.id, at: OffsetDateTime::now_utc() },
            )
            .await;
        }
        Ok(())
    }

    async fn apply_transition(
        &self,
        intent: &mut crate::model::Intent,
        transition: Transition,
        observation_id: uuid::Uuid,
        at: OffsetDateTime,
    ) -> GatewayResult<()> {
        let previous_status = intent.status;
        match transition {
            Transition::ToProcessing => intent.status = IntentStatus::Processing,
            Transition::ToConfirmed => {
                intent.status = IntentStatus::Confirmed;
                intent.confirmed_at = Some(at);
            }
            Transition::ToProcessingOnReorg => {
                intent.status = IntentStatus::Processing;
                intent.confirmed_at = None;
            }
            Transition::ToExpired => intent.status = IntentStatus::Expired,
        }
        if intent.status == previous_status {
            // Re-application of an already-applied edge: idempotent no-op
            // (spec §4.G, "Each transition ... is idempotent").
            return Ok(());
        }
        intent.updated_at = at;
        self.storage.update_intent(intent.clone()).await?;

        if intent.status == IntentStatus::Confirmed {
            if let Some(address_id) = intent.address_id {
                if let Some(address) = self.storage.get_address(address_id).await? {
                    self.watched.remove(&script_from_hex(&address.script_pubkey_hex));
                }
            }
        }

        let event = match intent.status {
            IntentStatus::Processing => GatewayEvent::Processing { intent_id: intent.id, observation_id, at },
            IntentStatus::Confirmed => GatewayEvent::Confirmed { intent_id: intent.id, observation_id, at },
            _ => return Ok(()),
        };
        dispatch(self.sink.as_ref(), event).await;
        Ok(())
    }
}

fn script_from_hex(hex_str: &str) -> bitcoin::ScriptBuf {
    bitcoin::ScriptBuf::from_hex(hex_str).unwrap_or_default()
}

#[allow(unused_imports)]
use bitcoin::hex::FromHex as _;
