//! Storage contract (spec §4.C), split into a required core capability plus
//! optional, feature-detected capabilities (spec §9, "Dynamic duck-typed
//! storage adapter -> capability set").

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use bitcoin::ScriptBuf;
use time::OffsetDateTime;

use crate::error::GatewayResult;
use crate::model::{
    AddressId, Customer, DepositAddress, Intent, IntentId, IntentStatus, MagicLinkToken,
    ObservationId, TxObservation,
};

/// The required storage surface: intents, addresses, observations, tokens,
/// and the named `system_metadata` keys (spec §4.C).
#[async_trait]
pub trait CoreStore: Send + Sync {
    async fn create_intent(&self, intent: Intent) -> GatewayResult<Intent>;
    async fn get_intent(&self, id: IntentId) -> GatewayResult<Option<Intent>>;
    /// Replaces the stored row for `intent.id` wholesale. Callers are
    /// responsible for only ever moving `status` along the edges in §4.G;
    /// this method itself performs no transition validation.
    async fn update_intent(&self, intent: Intent) -> GatewayResult<Intent>;
    async fn list_intents_by_status(&self, status: IntentStatus) -> GatewayResult<Vec<Intent>>;
    /// `status=pending AND expiresAt < now` (spec §4.H, expiry sweep).
    async fn list_expired_pending(&self, now: OffsetDateTime) -> GatewayResult<Vec<Intent>>;

    async fn create_address(&self, address: DepositAddress) -> GatewayResult<DepositAddress>;
    async fn get_address(&self, id: AddressId) -> GatewayResult<Option<DepositAddress>>;
    async fn get_address_by_script_pubkey(
        &self,
        script_pubkey_hex: &str,
    ) -> GatewayResult<Option<DepositAddress>>;
    /// The lowest-`derivationIndex` address with `intentId IS NULL`, if any
    /// (spec §4.I, `ensureAssigned`).
    async fn get_unassigned_address(&self) -> GatewayResult<Option<DepositAddress>>;
    /// The highest `derivationIndex` across all addresses, or `None` if the
    /// table is empty (spec §4.I, "derive a fresh one at
    /// `max(derivationIndex)+1`").
    async fn max_derivation_index(&self) -> GatewayResult<Option<i64>>;
    /// Assigns `address_id` to `intent_id` in a single transaction spanning
    /// both rows (spec §5, "Transactionality"). Fails with `Conflict` if the
    /// address is already assigned to a different intent.
    async fn assign_address_to_intent(
        &self,
        address_id: AddressId,
        intent_id: IntentId,
        assigned_at: OffsetDateTime,
    ) -> GatewayResult<DepositAddress>;
    /// All currently assigned addresses, for seeding the in-process
    /// watched-address set at startup (spec §5).
    async fn list_assigned_addresses(&self) -> GatewayResult<Vec<DepositAddress>>;

    /// Inserts or updates the observation for `(txid, vout)`, unique per
    /// spec §6's schema. Returns the stored row.
    async fn upsert_observation(&self, observation: TxObservation) -> GatewayResult<TxObservation>;
    async fn get_observation(
        &self,
        txid: &str,
        vout: i32,
    ) -> GatewayResult<Option<TxObservation>>;
    /// The most recent observation for `address_id` by `seenAt` (spec §4.I,
    /// `getStatus`).
    async fn latest_observation_for_address(
        &self,
        address_id: AddressId,
    ) -> GatewayResult<Option<TxObservation>>;
    async fn get_observation_by_id(&self, id: ObservationId) -> GatewayResult<Option<TxObservation>>;

    async fn create_token(&self, token: MagicLinkToken) -> GatewayResult<MagicLinkToken>;
    async fn get_token(&self, token: &str) -> GatewayResult<Option<MagicLinkToken>>;
    /// Marks a token consumed. Idempotent: calling this more than once
    /// leaves `consumedAt` unchanged on the second and later calls (spec
    /// §4.I, `redeemToken`).
    async fn mark_token_consumed(
        &self,
        token: &str,
        consumed_at: OffsetDateTime,
    ) -> GatewayResult<MagicLinkToken>;

    async fn get_metadata(&self, key: &str) -> GatewayResult<Option<String>>;
    async fn set_metadata(&self, key: &str, value: &str) -> GatewayResult<()>;
}

/// Optional capability over the `customers` table named in spec §6's
/// schema. Not exercised by any core verb in §4.I; present so callers can
/// feature-detect it rather than probe for `None` methods on a duck-typed
/// adapter.
#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn get_customer(&self, id: &str) -> GatewayResult<Option<Customer>>;
    async fn upsert_customer(&self, customer: Customer) -> GatewayResult<Customer>;
}

/// Hook for the named-but-out-of-scope subscription billing collaborator
/// (spec §9, Open Questions). No entity for it exists in §3/§6, so this
/// trait has no methods yet -- it exists purely to reserve the capability
/// slot in [`crate::api::GatewayContext`] for forward compatibility.
pub trait SubscriptionStore: Send + Sync {}

/// Script pubkeys are hex-encoded at the storage boundary; this helper
/// keeps that conversion in one place.
pub fn script_pubkey_hex(script: &ScriptBuf) -> String {
    script.to_hex_string()
}
