//! Concrete Postgres implementation of the storage contract (spec §6).
//!
//! Schema lives in `migrations/`. Row <-> domain conversions are explicit
//! (no `sqlx::Type` enum derives) so the six tables stay plain `TEXT`/`BOOL`/
//! `BIGINT` columns, matching the column list spec §6 mandates.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;

use crate::error::{GatewayError, GatewayResult};
use crate::model::{
    AddressId, Customer, DepositAddress, Intent, IntentId, IntentStatus, MagicLinkToken,
    ObservationId, ObservationStatus, TxObservation,
};

use super::{CoreStore, CustomerStore};

/// A `sqlx`-backed implementation of [`CoreStore`] and [`CustomerStore`]
/// against a Postgres database migrated with `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> GatewayResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(GatewayError::from)?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> GatewayResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| GatewayError::Fatal(format!("migration failed: {e}")))
    }
}

fn status_to_str(status: IntentStatus) -> &'static str {
    match status {
        IntentStatus::Pending => "pending",
        IntentStatus::Processing => "processing",
        IntentStatus::Confirmed => "confirmed",
        IntentStatus::Expired => "expired",
        IntentStatus::Failed => "failed",
    }
}

fn str_to_status(s: &str) -> GatewayResult<IntentStatus> {
    match s {
        "pending" => Ok(IntentStatus::Pending),
        "processing" => Ok(IntentStatus::Processing),
        "confirmed" => Ok(IntentStatus::Confirmed),
        "expired" => Ok(IntentStatus::Expired),
        "failed" => Ok(IntentStatus::Failed),
        other => Err(GatewayError::Fatal(format!("unknown intent status in row: {other}"))),
    }
}

fn obs_status_to_str(status: ObservationStatus) -> &'static str {
    match status {
        ObservationStatus::Mempool => "mempool",
        ObservationStatus::Confirmed => "confirmed",
    }
}

fn str_to_obs_status(s: &str) -> GatewayResult<ObservationStatus> {
    match s {
        "mempool" => Ok(ObservationStatus::Mempool),
        "confirmed" => Ok(ObservationStatus::Confirmed),
        other => Err(GatewayError::Fatal(format!("unknown observation status in row: {other}"))),
    }
}

#[derive(FromRow)]
struct IntentRow {
    id: IntentId,
    amount_sats: i64,
    status: String,
    address_id: Option<AddressId>,
    required_confs: i32,
    expires_at: OffsetDateTime,
    confirmed_at: Option<OffsetDateTime>,
    customer_id: Option<String>,
    email: Option<String>,
    memo: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl IntentRow {
    fn into_domain(self) -> GatewayResult<Intent> {
        Ok(Intent {
            id: self.id,
            amount_sats: self.amount_sats,
            status: str_to_status(&self.status)?,
            address_id: self.address_id,
            required_confs: self.required_confs,
            expires_at: self.expires_at,
            confirmed_at: self.confirmed_at,
            customer_id: self.customer_id,
            email: self.email,
            memo: self.memo,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct AddressRow {
    id: AddressId,
    address: String,
    derivation_index: i64,
    script_pubkey_hex: String,
    intent_id: Option<IntentId>,
    assigned_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl From<AddressRow> for DepositAddress {
    fn from(row: AddressRow) -> Self {
        DepositAddress {
            id: row.id,
            address: row.address,
            derivation_index: row.derivation_index,
            script_pubkey_hex: row.script_pubkey_hex,
            intent_id: row.intent_id,
            assigned_at: row.assigned_at,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct ObservationRow {
    id: ObservationId,
    txid: String,
    vout: i32,
    value_sats: i64,
    confirmations: i32,
    address_id: AddressId,
    script_pubkey_hex: String,
    status: String,
    seen_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl ObservationRow {
    fn into_domain(self) -> GatewayResult<TxObservation> {
        Ok(TxObservation {
            id: self.id,
            txid: self.txid,
            vout: self.vout,
            value_sats: self.value_sats,
            confirmations: self.confirmations,
            address_id: self.address_id,
            script_pubkey_hex: self.script_pubkey_hex,
            status: str_to_obs_status(&self.status)?,
            seen_at: self.seen_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct TokenRow {
    id: uuid::Uuid,
    token: String,
    intent_id: IntentId,
    consumed: bool,
    consumed_at: Option<OffsetDateTime>,
    expires_at: OffsetDateTime,
    created_at: OffsetDateTime,
}

impl From<TokenRow> for MagicLinkToken {
    fn from(row: TokenRow) -> Self {
        MagicLinkToken {
            id: row.id,
            token: row.token,
            intent_id: row.intent_id,
            consumed: row.consumed,
            consumed_at: row.consumed_at,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl CoreStore for PgStore {
    async fn create_intent(&self, intent: Intent) -> GatewayResult<Intent> {
        sqlx::query(
            "INSERT INTO payment_intents
                (id, amount_sats, status, address_id, required_confs, expires_at,
                 confirmed_at, customer_id, email, memo, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
        )
        .bind(intent.id)
        .bind(intent.amount_sats)
        .bind(status_to_str(intent.status))
        .bind(intent.address_id)
        .bind(intent.required_confs)
        .bind(intent.expires_at)
        .bind(intent.confirmed_at)
        .bind(&intent.customer_id)
        .bind(&intent.email)
        .bind(&intent.memo)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from)?;
        Ok(intent)
    }

    async fn get_intent(&self, id: IntentId) -> GatewayResult<Option<Intent>> {
        let row: Option<IntentRow> = sqlx::query_as("SELECT * FROM payment_intents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(GatewayError::from)?;
        row.map(IntentRow::into_domain).transpose()
    }

    async fn update_intent(&self, intent: Intent) -> GatewayResult<Intent> {
        sqlx::query(
            "UPDATE payment_intents SET
                amount_sats=$2, status=$3, address_id=$4, required_confs=$5,
                expires_at=$6, confirmed_at=$7, customer_id=$8, email=$9,
                memo=$10, updated_at=$11
             WHERE id=$1",
        )
        .bind(intent.id)
        .bind(intent.amount_sats)
        .bind(status_to_str(intent.status))
        .bind(intent.address_id)
        .bind(intent.required_confs)
        .bind(intent.expires_at)
        .bind(intent.confirmed_at)
        .bind(&intent.customer_id)
        .bind(&intent.email)
        .bind(&intent.memo)
        .bind(intent.updated_at)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from)?;
        Ok(intent)
    }

    async fn list_intents_by_status(&self, status: IntentStatus) -> GatewayResult<Vec<Intent>> {
        let rows: Vec<IntentRow> =
            sqlx::query_as("SELECT * FROM payment_intents WHERE status = $1")
                .bind(status_to_str(status))
                .fetch_all(&self.pool)
                .await
                .map_err(GatewayError::from)?;
        rows.into_iter().map(IntentRow::into_domain).collect()
    }

    async fn list_expired_pending(&self, now: OffsetDateTime) -> GatewayResult<Vec<Intent>> {
        let rows: Vec<IntentRow> = sqlx::query_as(
            "SELECT * FROM payment_intents WHERE status = 'pending' AND expires_at < $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(GatewayError::from)?;
        rows.into_iter().map(IntentRow::into_domain).collect()
    }

    async fn create_address(&self, address: DepositAddress) -> GatewayResult<DepositAddress> {
        sqlx::query(
            "INSERT INTO deposit_addresses
                (id, address, derivation_index, script_pubkey_hex, intent_id,
                 assigned_at, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(address.id)
        .bind(&address.address)
        .bind(address.derivation_index)
        .bind(&address.script_pubkey_hex)
        .bind(address.intent_id)
        .bind(address.assigned_at)
        .bind(address.created_at)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from)?;
        Ok(address)
    }

    async fn get_address(&self, id: AddressId) -> GatewayResult<Option<DepositAddress>> {
        let row: Option<AddressRow> =
            sqlx::query_as("SELECT * FROM deposit_addresses WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(GatewayError::from)?;
        Ok(row.map(DepositAddress::from))
    }

    async fn get_address_by_script_pubkey(
        &self,
        script_pubkey_hex: &str,
    ) -> GatewayResult<Option<DepositAddress>> {
        let row: Option<AddressRow> =
            sqlx::query_as("SELECT * FROM deposit_addresses WHERE script_pubkey_hex = $1")
                .bind(script_pubkey_hex)
                .fetch_optional(&self.pool)
                .await
                .map_err(GatewayError::from)?;
        Ok(row.map(DepositAddress::from))
    }

    async fn get_unassigned_address(&self) -> GatewayResult<Option<DepositAddress>> {
        let row: Option<AddressRow> = sqlx::query_as(
            "SELECT * FROM deposit_addresses WHERE intent_id IS NULL
             ORDER BY derivation_index ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(GatewayError::from)?;
        Ok(row.map(DepositAddress::from))
    }

    async fn max_derivation_index(&self) -> GatewayResult<Option<i64>> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(derivation_index) FROM deposit_addresses")
                .fetch_one(&self.pool)
                .await
                .map_err(GatewayError::from)?;
        Ok(row.0)
    }

    async fn assign_address_to_intent(
        &self,
        address_id: AddressId,
        intent_id: IntentId,
        assigned_at: OffsetDateTime,
    ) -> GatewayResult<DepositAddress> {
        // One transaction spanning address + intent rows (spec §5,
        // "Transactionality").
        let mut tx = self.pool.begin().await.map_err(GatewayError::from)?;

        let existing: Option<AddressRow> =
            sqlx::query_as("SELECT * FROM deposit_addresses WHERE id = $1 FOR UPDATE")
                .bind(address_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(GatewayError::from)?;
        let existing =
            existing.ok_or_else(|| GatewayError::NotFound(format!("address {address_id} not found")))?;

        if let Some(current) = existing.intent_id {
            if current != intent_id {
                return Err(GatewayError::Conflict(format!(
                    "address {address_id} already assigned to intent {current}"
                )));
            }
            tx.commit().await.map_err(GatewayError::from)?;
            return Ok(existing.into());
        }

        sqlx::query(
            "UPDATE deposit_addresses SET intent_id = $2, assigned_at = $3 WHERE id = $1",
        )
        .bind(address_id)
        .bind(intent_id)
        .bind(assigned_at)
        .execute(&mut *tx)
        .await
        .map_err(GatewayError::from)?;

        sqlx::query("UPDATE payment_intents SET address_id = $2, updated_at = $3 WHERE id = $1")
            .bind(intent_id)
            .bind(address_id)
            .bind(assigned_at)
            .execute(&mut *tx)
            .await
            .map_err(GatewayError::from)?;

        tx.commit().await.map_err(GatewayError::from)?;

        Ok(DepositAddress {
            intent_id: Some(intent_id),
            assigned_at: Some(assigned_at),
            ..existing.into()
        })
    }

    async fn list_assigned_addresses(&self) -> GatewayResult<Vec<DepositAddress>> {
        let rows: Vec<AddressRow> =
            sqlx::query_as("SELECT * FROM deposit_addresses WHERE intent_id IS NOT NULL")
                .fetch_all(&self.pool)
                .await
                .map_err(GatewayError::from)?;
        Ok(rows.into_iter().map(DepositAddress::from).collect())
    }

    async fn upsert_observation(&self, observation: TxObservation) -> GatewayResult<TxObservation> {
        let row: ObservationRow = sqlx::query_as(
            "INSERT INTO tx_observations
                (id, txid, vout, value_sats, confirmations, address_id,
                 script_pubkey_hex, status, seen_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
             ON CONFLICT (txid, vout) DO UPDATE SET
                value_sats = EXCLUDED.value_sats,
                confirmations = EXCLUDED.confirmations,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
             RETURNING *",
        )
        .bind(observation.id)
        .bind(&observation.txid)
        .bind(observation.vout)
        .bind(observation.value_sats)
        .bind(observation.confirmations)
        .bind(observation.address_id)
        .bind(&observation.script_pubkey_hex)
        .bind(obs_status_to_str(observation.status))
        .bind(observation.seen_at)
        .bind(observation.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(GatewayError::from)?;
        row.into_domain()
    }

    async fn get_observation(&self, txid: &str, vout: i32) -> GatewayResult<Option<TxObservation>> {
        let row: Option<ObservationRow> =
            sqlx::query_as("SELECT * FROM tx_observations WHERE txid = $1 AND vout = $2")
                .bind(txid)
                .bind(vout)
                .fetch_optional(&self.pool)
                .await
                .map_err(GatewayError::from)?;
        row.map(ObservationRow::into_domain).transpose()
    }

    async fn latest_observation_for_address(
        &self,
        address_id: AddressId,
    ) -> GatewayResult<Option<TxObservation>> {
        let row: Option<ObservationRow> = sqlx::query_as(
            "SELECT * FROM tx_observations WHERE address_id = $1 ORDER BY seen_at DESC LIMIT 1",
        )
        .bind(address_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(GatewayError::from)?;
        row.map(ObservationRow::into_domain).transpose()
    }

    async fn get_observation_by_id(&self, id: ObservationId) -> GatewayResult<Option<TxObservation>> {
        let row: Option<ObservationRow> = sqlx::query_as("SELECT * FROM tx_observations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(GatewayError::from)?;
        row.map(ObservationRow::into_domain).transpose()
    }

    async fn create_token(&self, token: MagicLinkToken) -> GatewayResult<MagicLinkToken> {
        sqlx::query(
            "INSERT INTO magic_link_tokens
                (id, token, intent_id, consumed, consumed_at, expires_at, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(token.id)
        .bind(&token.token)
        .bind(token.intent_id)
        .bind(token.consumed)
        .bind(token.consumed_at)
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from)?;
        Ok(token)
    }

    async fn get_token(&self, token: &str) -> GatewayResult<Option<MagicLinkToken>> {
        let row: Option<TokenRow> = sqlx::query_as("SELECT * FROM magic_link_tokens WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(GatewayError::from)?;
        Ok(row.map(MagicLinkToken::from))
    }

    async fn mark_token_consumed(
        &self,
        token: &str,
        consumed_at: OffsetDateTime,
    ) -> GatewayResult<MagicLinkToken> {
        let row: Option<TokenRow> = sqlx::query_as(
            "UPDATE magic_link_tokens SET consumed = true,
                consumed_at = COALESCE(consumed_at, $2)
             WHERE token = $1
             RETURNING *",
        )
        .bind(token)
        .bind(consumed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(GatewayError::from)?;
        row.map(MagicLinkToken::from)
            .ok_or_else(|| GatewayError::NotFound("TokenNotFound".to_string()))
    }

    async fn get_metadata(&self, key: &str) -> GatewayResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM system_metadata WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(GatewayError::from)?;
        Ok(row.map(|(v,)| v))
    }

    async fn set_metadata(&self, key: &str, value: &str) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO system_metadata (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from)?;
        Ok(())
    }
}

#[async_trait]
impl CustomerStore for PgStore {
    async fn get_customer(&self, id: &str) -> GatewayResult<Option<Customer>> {
        let row: Option<(String, Option<String>, OffsetDateTime)> =
            sqlx::query_as("SELECT id, email, created_at FROM customers WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(GatewayError::from)?;
        Ok(row.map(|(id, email, created_at)| Customer { id, email, created_at }))
    }

    async fn upsert_customer(&self, customer: Customer) -> GatewayResult<Customer> {
        sqlx::query(
            "INSERT INTO customers (id, email, created_at) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET email = EXCLUDED.email",
        )
        .bind(&customer.id)
        .bind(&customer.email)
        .bind(customer.created_at)
        .execute(&self.pool)
        .await
        .map_err(GatewayError::from)?;
        Ok(customer)
    }
}
