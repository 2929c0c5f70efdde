//! Intent API core verbs (spec §4.I), exposed to the HTTP adapter and to
//! library users directly.

use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::instrument;
use uuid::Uuid;

use crate::descriptor::DescriptorEngine;
use crate::error::{GatewayError, GatewayResult};
use crate::events::{dispatch, EventSink, GatewayEvent};
use crate::model::{DepositAddress, Intent, IntentId, IntentStatus, MagicLinkToken};
use crate::state_machine::{self, Transition};
use crate::storage::CoreStore;
use crate::token;
use crate::watched_set::WatchedAddressSet;

/// Resolves the §9 Open Question on magic-link replay: whether a token
/// remains usable after its first redemption (`UntilExpiry`, the source's
/// permissive default) or is blocked after one use (`SingleUse`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenReuse {
    #[default]
    UntilExpiry,
    SingleUse,
}

/// Forces a pull-path reconciliation for one intent right now (spec §4.I,
/// `scanForPayments`). Implemented by [`crate::scheduler::Scheduler`] and
/// wired in by [`crate::gateway::Gateway::assemble`]; left `None` when a
/// `GatewayContext` is assembled without a running watcher (tests), in
/// which case `scanForPayments` just re-reads storage.
#[async_trait]
pub trait ScanTrigger: Send + Sync {
    async fn reconcile_now(&self, intent_id: IntentId) -> GatewayResult<()>;
}

/// Everything a core verb needs: storage, the descriptor engine, the
/// watched-address set, an event sink, and the pieces of [`crate::config::GatewayConfig`]
/// that affect verb behavior (spec §9, "Shared singleton instance ->
/// explicit context" -- passed explicitly rather than memoized globally).
pub struct GatewayContext {
    pub storage: Arc<dyn CoreStore>,
    pub descriptor: Arc<DescriptorEngine>,
    pub watched: Arc<WatchedAddressSet>,
    pub sink: Arc<dyn EventSink>,
    pub secret: Vec<u8>,
    pub base_url: String,
    pub gap_limit: u32,
    pub token_reuse: TokenReuse,
    pub scan: Option<Arc<dyn ScanTrigger>>,
    /// Fallback for `createIntent`'s `requiredConfs` when the caller omits
    /// it, sourced from `GatewayConfig::default_required_confs` (spec §6).
    pub default_required_confs: i32,
}

/// Response shape for `createIntent` is just [`Intent`]; the remaining core
/// verbs each have a bespoke response shape per spec §4.I.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnsureAssignedResponse {
    pub address: String,
    pub bip21: String,
    #[serde(rename = "amountSats")]
    pub amount_sats: i64,
    #[serde(rename = "expiresAt", with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub status: IntentStatus,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IssueTokenResponse {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RedeemTokenResponse {
    #[serde(rename = "intentId")]
    pub intent_id: IntentId,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusResponse {
    pub status: IntentStatus,
    #[serde(rename = "amountSats")]
    pub amount_sats: i64,
    #[serde(rename = "expiresAt", with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(rename = "confirmedAt", with = "time::serde::rfc3339::option")]
    pub confirmed_at: Option<OffsetDateTime>,
    pub confs: i32,
    pub txid: Option<String>,
    #[serde(rename = "valueSats")]
    pub value_sats: Option<i64>,
}

impl GatewayContext {
    /// **createIntent**(`amountSats>0, requiredConfs≥1, expiresInMinutes>0,
    /// email?, customerId?, memo?`) → `Intent` in `pending`. No address is
    /// assigned yet (spec §4.I).
    #[instrument(skip(self))]
    pub async fn create_intent(
        &self,
        amount_sats: i64,
        required_confs: i32,
        expires_in_minutes: i64,
        email: Option<String>,
        customer_id: Option<String>,
        memo: Option<String>,
    ) -> GatewayResult<Intent> {
        if amount_sats <= 0 {
            return Err(GatewayError::Validation("amountSats must be > 0".to_string()));
        }
        if required_confs < 1 {
            return Err(GatewayError::Validation("requiredConfs must be >= 1".to_string()));
        }
        if expires_in_minutes <= 0 {
            return Err(GatewayError::Validation("expiresInMinutes must be > 0".to_string()));
        }

        let now = OffsetDateTime::now_utc();
        let intent = Intent {
            id: Uuid::new_v4(),
            amount_sats,
            status: IntentStatus::Pending,
            address_id: None,
            required_confs,
            expires_at: now + TimeDuration::minutes(expires_in_minutes),
            confirmed_at: None,
            customer_id,
            email,
            memo,
            created_at: now,
            updated_at: now,
        };
        let intent = self.storage.create_intent(intent).await?;
        dispatch(self.sink.as_ref(), GatewayEvent::Created { intent_id: intent.id, at: now }).await;
        Ok(intent)
    }

    /// **ensureAssigned**(`intentId`) (spec §4.I). Idempotent: returns the
    /// existing address if one is already assigned. Otherwise takes the
    /// lowest-index unassigned address, or derives a fresh one at
    /// `max(derivationIndex)+1`, in a single transaction spanning both
    /// rows.
    #[instrument(skip(self))]
    pub async fn ensure_assigned(&self, intent_id: IntentId) -> GatewayResult<EnsureAssignedResponse> {
        let intent = self
            .storage
            .get_intent(intent_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("intent {intent_id} not found")))?;

        if !matches!(intent.status, IntentStatus::Pending | IntentStatus::Processing) {
            return Err(GatewayError::InvalidState(format!(
                "intent {intent_id} is {}, cannot assign an address",
                intent.status
            )));
        }

        let address = if let Some(address_id) = intent.address_id {
            self.storage
                .get_address(address_id)
                .await?
                .ok_or_else(|| GatewayError::NotFound(format!("address {address_id} not found")))?
        } else {
            let address = self.take_or_derive_address().await?;
            let now = OffsetDateTime::now_utc();
            let assigned = self
                .storage
                .assign_address_to_intent(address.id, intent_id, now)
                .await?;
            self.watched.insert(script_pubkey(&assigned)?, intent_id);
            assigned
        };

        let bip21 = crate::bip21::Bip21Uri {
            address: address.address.clone(),
            amount_sats: intent.amount_sats,
            label: None,
            message: intent.memo.clone(),
        };

        Ok(EnsureAssignedResponse {
            address: address.address,
            bip21: bip21.to_string(),
            amount_sats: intent.amount_sats,
            expires_at: intent.expires_at,
            status: intent.status,
        })
    }

    async fn take_or_derive_address(&self) -> GatewayResult<DepositAddress> {
        if let Some(unassigned) = self.storage.get_unassigned_address().await? {
            return Ok(unassigned);
        }

        let next_index = self.storage.max_derivation_index().await?.map(|m| m + 1).unwrap_or(0);
        let index: u32 = next_index
            .try_into()
            .map_err(|_| GatewayError::Fatal("derivation index overflowed u32".to_string()))?;
        let (address, script_pubkey) = self.descriptor.derive(index)?;

        let now = OffsetDateTime::now_utc();
        self.storage
            .create_address(DepositAddress {
                id: Uuid::new_v4(),
                address: address.to_string(),
                derivation_index: next_index,
                script_pubkey_hex: script_pubkey.to_hex_string(),
                intent_id: None,
                assigned_at: None,
                created_at: now,
            })
            .await
    }

    /// **issueToken**(`intentId, ttlSeconds`) → `{url, token}` (spec §4.I).
    #[instrument(skip(self))]
    pub async fn issue_token(&self, intent_id: IntentId, ttl_seconds: i64) -> GatewayResult<IssueTokenResponse> {
        let intent = self
            .storage
            .get_intent(intent_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("intent {intent_id} not found")))?;
        if intent.status.is_terminal() && intent.status != IntentStatus::Confirmed {
            return Err(GatewayError::InvalidState(format!(
                "intent {intent_id} is {}, cannot issue a magic link",
                intent.status
            )));
        }

        let now = OffsetDateTime::now_utc();
        let token_str = token::issue(intent_id, &self.secret, ttl_seconds, now)?;

        self.storage
            .create_token(MagicLinkToken {
                id: Uuid::new_v4(),
                token: token_str.clone(),
                intent_id,
                consumed: false,
                consumed_at: None,
                expires_at: now + TimeDuration::seconds(ttl_seconds),
                created_at: now,
            })
            .await?;

        let url = format!("{}/pay/{}", self.base_url.trim_end_matches('/'), token_str);
        Ok(IssueTokenResponse { url, token: token_str })
    }

    /// **redeemToken**(`token`) → `{intentId}` (spec §4.I). Distinguishes
    /// `GatewayError` variants internally for logging, but spec §7 requires
    /// the *caller-facing* failure to be opaque ("Invalid or expired link",
    /// never leaking which check failed); the HTTP adapter's
    /// `redeem_magic_link` handler is what collapses every `Err` here to
    /// that one message, since this method's own `Err` values are also used
    /// by non-HTTP callers that may want the detail.
    #[instrument(skip(self, token))]
    pub async fn redeem_token(&self, token: &str) -> GatewayResult<RedeemTokenResponse> {
        let now = OffsetDateTime::now_utc();
        let payload = token::verify(token, &self.secret, now)?;

        let row = self
            .storage
            .get_token(token)
            .await?
            .ok_or_else(|| GatewayError::NotFound("TokenNotFound".to_string()))?;

        if row.consumed && self.token_reuse == TokenReuse::SingleUse {
            return Err(GatewayError::Auth("InvalidToken: already consumed".to_string()));
        }

        self.storage.mark_token_consumed(token, now).await?;

        Ok(RedeemTokenResponse { intent_id: payload.intent_id })
    }

    /// **getStatus**(`intentId`) (spec §4.I), using the most recent
    /// observation by `seenAt`.
    #[instrument(skip(self))]
    pub async fn get_status(&self, intent_id: IntentId) -> GatewayResult<StatusResponse> {
        let intent = self
            .storage
            .get_intent(intent_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("intent {intent_id} not found")))?;

        let observation = match intent.address_id {
            Some(address_id) => self.storage.latest_observation_for_address(address_id).await?,
            None => None,
        };

        Ok(StatusResponse {
            status: intent.status,
            amount_sats: intent.amount_sats,
            expires_at: intent.expires_at,
            confirmed_at: intent.confirmed_at,
            confs: observation.as_ref().map(|o| o.confirmations).unwrap_or(0),
            txid: observation.as_ref().map(|o| o.txid.clone()),
            value_sats: observation.as_ref().map(|o| o.value_sats),
        })
    }

    /// **scanForPayments**(`intentId`): forces a pull-path reconciliation
    /// now, used by `POST /scan/:id` (spec §4.I). The actual RPC/indexer
    /// fan-out lives in [`crate::scheduler::Scheduler`], reached through
    /// [`ScanTrigger`]; without one wired in, this just re-reads storage.
    #[instrument(skip(self))]
    pub async fn scan_for_payments(&self, intent_id: IntentId) -> GatewayResult<Intent> {
        if let Some(scan) = &self.scan {
            scan.reconcile_now(intent_id).await?;
        }
        self.storage
            .get_intent(intent_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("intent {intent_id} not found")))
    }
}

fn script_pubkey(address: &DepositAddress) -> GatewayResult<bitcoin::ScriptBuf> {
    use bitcoin::hex::FromHex;
    bitcoin::ScriptBuf::from_hex(&address.script_pubkey_hex)
        .map_err(|e| GatewayError::Fatal(format!("stored scriptPubkey malformed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorEngine;
    use crate::events::NullEventSink;
    use crate::storage::memory::MemoryStore;
    use bitcoin::Network;

    const TPRV_DESC: &str = "wpkh(tpubD6NzVbkrYhZ4WZaiWHz59q5EQ61bd6dUYfU4ggRWAtNAyyYRNWT6ktJ7UHJEXURvTfTfskFQmK3HqKEX4DPnRV45aPofuRuu6s9QCbMQWB5/0/*)";

    fn ctx() -> GatewayContext {
        GatewayContext {
            storage: Arc::new(MemoryStore::new()),
            descriptor: Arc::new(DescriptorEngine::parse(TPRV_DESC, Network::Testnet).unwrap()),
            watched: Arc::new(WatchedAddressSet::new()),
            sink: Arc::new(NullEventSink),
            secret: b"0123456789abcdef0123456789abcdef".to_vec(),
            base_url: "https://pay.example.com".to_string(),
            gap_limit: 20,
            token_reuse: TokenReuse::UntilExpiry,
            scan: None,
            default_required_confs: 1,
        }
    }

    #[tokio::test]
    async fn create_intent_rejects_bad_input() {
        let ctx = ctx();
        assert!(ctx.create_intent(0, 1, 60, None, None, None).await.is_err());
        assert!(ctx.create_intent(1000, 0, 60, None, None, None).await.is_err());
        assert!(ctx.create_intent(1000, 1, 0, None, None, None).await.is_err());
    }

    #[tokio::test]
    async fn ensure_assigned_is_idempotent_and_gap_free() {
        let ctx = ctx();
        let i1 = ctx.create_intent(50_000, 1, 60, None, None, None).await.unwrap();
        let i2 = ctx.create_intent(50_000, 1, 60, None, None, None).await.unwrap();

        let r1 = ctx.ensure_assigned(i1.id).await.unwrap();
        let r1_again = ctx.ensure_assigned(i1.id).await.unwrap();
        assert_eq!(r1.address, r1_again.address);

        let r2 = ctx.ensure_assigned(i2.id).await.unwrap();
        assert_ne!(r1.address, r2.address);
    }

    #[tokio::test]
    async fn token_round_trips_through_redeem() {
        let ctx = ctx();
        let intent = ctx.create_intent(50_000, 1, 60, None, None, None).await.unwrap();
        let issued = ctx.issue_token(intent.id, 3600).await.unwrap();
        let redeemed = ctx.redeem_token(&issued.token).await.unwrap();
        assert_eq!(redeemed.intent_id, intent.id);
        // Replay before expiry succeeds under the default UntilExpiry policy.
        assert!(ctx.redeem_token(&issued.token).await.is_ok());
    }

    #[tokio::test]
    async fn single_use_token_reuse_blocks_replay() {
        let mut ctx = ctx();
        ctx.token_reuse = TokenReuse::SingleUse;
        let intent = ctx.create_intent(50_000, 1, 60, None, None, None).await.unwrap();
        let issued = ctx.issue_token(intent.id, 3600).await.unwrap();
        assert!(ctx.redeem_token(&issued.token).await.is_ok());
        assert!(ctx.redeem_token(&issued.token).await.is_err());
    }
}
