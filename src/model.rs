//! Domain entities (spec §3).
//!
//! These are the in-memory shapes every [`crate::storage`] implementation
//! reads and writes. Storage backends own the string/enum and
//! timestamp/column mapping; nothing outside `storage` should need to know
//! whether a row lives in Postgres or in a `HashMap`.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Opaque identifier for a [`Intent`] row.
pub type IntentId = Uuid;
/// Opaque identifier for a [`DepositAddress`] row.
pub type AddressId = Uuid;
/// Opaque identifier for a [`TxObservation`] row.
pub type ObservationId = Uuid;
/// Opaque identifier for a [`MagicLinkToken`] row.
pub type TokenId = Uuid;

/// Lifecycle states for an [`Intent`] (spec §3, "Lifecycles").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Processing,
    Confirmed,
    Expired,
    Failed,
}

impl IntentStatus {
    /// Terminal states never transition again (spec §3, "Lifecycles").
    pub fn is_terminal(self) -> bool {
        matches!(self, IntentStatus::Confirmed | IntentStatus::Expired | IntentStatus::Failed)
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Processing => "processing",
            IntentStatus::Confirmed => "confirmed",
            IntentStatus::Expired => "expired",
            IntentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A merchant's expected payment (spec §3, "Intent").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    pub amount_sats: i64,
    pub status: IntentStatus,
    pub address_id: Option<AddressId>,
    pub required_confs: i32,
    pub expires_at: OffsetDateTime,
    pub confirmed_at: Option<OffsetDateTime>,
    pub customer_id: Option<String>,
    pub email: Option<String>,
    pub memo: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A derived, watch-only deposit address (spec §3, "DepositAddress").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositAddress {
    pub id: AddressId,
    pub address: String,
    pub derivation_index: i64,
    pub script_pubkey_hex: String,
    pub intent_id: Option<IntentId>,
    pub assigned_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl DepositAddress {
    /// "An address is *assigned* iff `intentId` is set" (spec §3).
    pub fn is_assigned(&self) -> bool {
        self.intent_id.is_some()
    }
}

/// Status of a per-output sighting (spec §3, "TxObservation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationStatus {
    Mempool,
    Confirmed,
}

/// A per-output sighting of a transaction paying a watched address (spec §3,
/// "TxObservation"). `(txid, vout)` is unique across the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxObservation {
    pub id: ObservationId,
    pub txid: String,
    pub vout: i32,
    pub value_sats: i64,
    pub confirmations: i32,
    pub address_id: AddressId,
    pub script_pubkey_hex: String,
    pub status: ObservationStatus,
    pub seen_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A signed, single-purpose magic-link token row (spec §3,
/// "MagicLinkToken").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagicLinkToken {
    pub id: TokenId,
    pub token: String,
    pub intent_id: IntentId,
    pub consumed: bool,
    pub consumed_at: Option<OffsetDateTime>,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

/// Opaque key/value metadata row (spec §3, "SystemMetadata").
///
/// Well-known keys used by this crate:
/// - `descriptor_fingerprint`: the fingerprint the descriptor engine was
///   initialized with, used to detect a changed descriptor across restarts.
/// - `next_scan_height`: the next block height the scheduler's pull path has
///   not yet reconciled.
/// - `plans_digest`: a digest of the resolved scheduler intervals, used to
///   detect a changed `pollInterval`/expiry configuration across restarts.
pub mod metadata_keys {
    pub const DESCRIPTOR_FINGERPRINT: &str = "descriptor_fingerprint";
    pub const NEXT_SCAN_HEIGHT: &str = "next_scan_height";
    pub const PLANS_DIGEST: &str = "plans_digest";
    pub const SCHEMA_VERSION: &str = "schema_version";
}

/// A lightweight customer record (spec §6 schema: `customers` table).
/// Not read or written by any core verb; present purely so the optional
/// [`crate::storage::CustomerStore`] capability has something to operate
/// on, per spec §9's capability-split design note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: Option<String>,
    pub created_at: OffsetDateTime,
}
