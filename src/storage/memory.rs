//! In-memory storage backend: used by tests and by callers embedding the
//! gateway without a database (spec §4.C).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::{GatewayError, GatewayResult};
use crate::model::{
    AddressId, Customer, DepositAddress, Intent, IntentId, IntentStatus, MagicLinkToken,
    ObservationId, TxObservation,
};

use super::{CoreStore, CustomerStore};

#[derive(Default)]
struct Tables {
    intents: HashMap<IntentId, Intent>,
    addresses: HashMap<AddressId, DepositAddress>,
    observations: HashMap<ObservationId, TxObservation>,
    tokens: HashMap<String, MagicLinkToken>,
    metadata: HashMap<String, String>,
    customers: HashMap<String, Customer>,
}

/// `Arc<Mutex<...>>`-guarded in-memory implementation of [`CoreStore`] (and
/// [`CustomerStore`]). Every method takes the single lock for its own
/// duration and never holds it across an `.await` (there are none -- all
/// work here is synchronous).
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoreStore for MemoryStore {
    async fn create_intent(&self, intent: Intent) -> GatewayResult<Intent> {
        let mut tables = self.tables.lock().unwrap();
        tables.intents.insert(intent.id, intent.clone());
        Ok(intent)
    }

    async fn get_intent(&self, id: IntentId) -> GatewayResult<Option<Intent>> {
        Ok(self.tables.lock().unwrap().intents.get(&id).cloned())
    }

    async fn update_intent(&self, intent: Intent) -> GatewayResult<Intent> {
        let mut tables = self.tables.lock().unwrap();
        tables.intents.insert(intent.id, intent.clone());
        Ok(intent)
    }

    async fn list_intents_by_status(&self, status: IntentStatus) -> GatewayResult<Vec<Intent>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .intents
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }

    async fn list_expired_pending(&self, now: OffsetDateTime) -> GatewayResult<Vec<Intent>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .intents
            .values()
            .filter(|i| i.status == IntentStatus::Pending && i.expires_at < now)
            .cloned()
            .collect())
    }

    async fn create_address(&self, address: DepositAddress) -> GatewayResult<DepositAddress> {
        let mut tables = self.tables.lock().unwrap();
        tables.addresses.insert(address.id, address.clone());
        Ok(address)
    }

    async fn get_address(&self, id: AddressId) -> GatewayResult<Option<DepositAddress>> {
        Ok(self.tables.lock().unwrap().addresses.get(&id).cloned())
    }

    async fn get_address_by_script_pubkey(
        &self,
        script_pubkey_hex: &str,
    ) -> GatewayResult<Option<DepositAddress>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .addresses
            .values()
            .find(|a| a.script_pubkey_hex == script_pubkey_hex)
            .cloned())
    }

    async fn get_unassigned_address(&self) -> GatewayResult<Option<DepositAddress>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .addresses
            .values()
            .filter(|a| !a.is_assigned())
            .min_by_key(|a| a.derivation_index)
            .cloned())
    }

    async fn max_derivation_index(&self) -> GatewayResult<Option<i64>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .addresses
            .values()
            .map(|a| a.derivation_index)
            .max())
    }

    async fn assign_address_to_intent(
        &self,
        address_id: AddressId,
        intent_id: IntentId,
        assigned_at: OffsetDateTime,
    ) -> GatewayResult<DepositAddress> {
        let mut tables = self.tables.lock().unwrap();
        let address = tables
            .addresses
            .get_mut(&address_id)
            .ok_or_else(|| GatewayError::NotFound(format!("address {address_id} not found")))?;
        if let Some(existing) = address.intent_id {
            if existing != intent_id {
                return Err(GatewayError::Conflict(format!(
                    "address {address_id} already assigned to intent {existing}"
                )));
            }
            return Ok(address.clone());
        }
        address.intent_id = Some(intent_id);
        address.assigned_at = Some(assigned_at);
        let updated = address.clone();

        if let Some(intent) = tables.intents.get_mut(&intent_id) {
            intent.address_id = Some(address_id);
        }

        Ok(updated)
    }

    async fn list_assigned_addresses(&self) -> GatewayResult<Vec<DepositAddress>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .addresses
            .values()
            .filter(|a| a.is_assigned())
            .cloned()
            .collect())
    }

    async fn upsert_observation(&self, observation: TxObservation) -> GatewayResult<TxObservation> {
        let mut tables = self.tables.lock().unwrap();
        let existing_id = tables
            .observations
            .values()
            .find(|o| o.txid == observation.txid && o.vout == observation.vout)
            .map(|o| o.id);

        let mut row = observation;
        if let Some(existing_id) = existing_id {
            row.id = existing_id;
        }
        tables.observations.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_observation(&self, txid: &str, vout: i32) -> GatewayResult<Option<TxObservation>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .observations
            .values()
            .find(|o| o.txid == txid && o.vout == vout)
            .cloned())
    }

    async fn latest_observation_for_address(
        &self,
        address_id: AddressId,
    ) -> GatewayResult<Option<TxObservation>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .observations
            .values()
            .filter(|o| o.address_id == address_id)
            .max_by_key(|o| o.seen_at)
            .cloned())
    }

    async fn get_observation_by_id(&self, id: ObservationId) -> GatewayResult<Option<TxObservation>> {
        Ok(self.tables.lock().unwrap().observations.get(&id).cloned())
    }

    async fn create_token(&self, token: MagicLinkToken) -> GatewayResult<MagicLinkToken> {
        let mut tables = self.tables.lock().unwrap();
        tables.tokens.insert(token.token.clone(), token.clone());
        Ok(token)
    }

    async fn get_token(&self, token: &str) -> GatewayResult<Option<MagicLinkToken>> {
        Ok(self.tables.lock().unwrap().tokens.get(token).cloned())
    }

    async fn mark_token_consumed(
        &self,
        token: &str,
        consumed_at: OffsetDateTime,
    ) -> GatewayResult<MagicLinkToken> {
        let mut tables = self.tables.lock().unwrap();
        let row = tables
            .tokens
            .get_mut(token)
            .ok_or_else(|| GatewayError::NotFound("TokenNotFound".to_string()))?;
        if !row.consumed {
            row.consumed = true;
            row.consumed_at = Some(consumed_at);
        }
        Ok(row.clone())
    }

    async fn get_metadata(&self, key: &str) -> GatewayResult<Option<String>> {
        Ok(self.tables.lock().unwrap().metadata.get(key).cloned())
    }

    async fn set_metadata(&self, key: &str, value: &str) -> GatewayResult<()> {
        self.tables
            .lock()
            .unwrap()
            .metadata
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl CustomerStore for MemoryStore {
    async fn get_customer(&self, id: &str) -> GatewayResult<Option<Customer>> {
        Ok(self.tables.lock().unwrap().customers.get(id).cloned())
    }

    async fn upsert_customer(&self, customer: Customer) -> GatewayResult<Customer> {
        let mut tables = self.tables.lock().unwrap();
        tables.customers.insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_address(index: i64) -> DepositAddress {
        DepositAddress {
            id: Uuid::new_v4(),
            address: format!("addr-{index}"),
            derivation_index: index,
            script_pubkey_hex: format!("spk-{index}"),
            intent_id: None,
            assigned_at: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn unassigned_address_picks_lowest_index() {
        let store = MemoryStore::new();
        store.create_address(sample_address(2)).await.unwrap();
        store.create_address(sample_address(0)).await.unwrap();
        store.create_address(sample_address(1)).await.unwrap();
        let picked = store.get_unassigned_address().await.unwrap().unwrap();
        assert_eq!(picked.derivation_index, 0);
    }

    #[tokio::test]
    async fn assign_address_is_idempotent_for_same_intent() {
        let store = MemoryStore::new();
        let address = store.create_address(sample_address(0)).await.unwrap();
        let intent_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        store.assign_address_to_intent(address.id, intent_id, now).await.unwrap();
        let again = store.assign_address_to_intent(address.id, intent_id, now).await.unwrap();
        assert_eq!(again.intent_id, Some(intent_id));
    }

    #[tokio::test]
    async fn assign_address_conflicts_for_different_intent() {
        let store = MemoryStore::new();
        let address = store.create_address(sample_address(0)).await.unwrap();
        let now = OffsetDateTime::now_utc();
        store.assign_address_to_intent(address.id, Uuid::new_v4(), now).await.unwrap();
        let err = store
            .assign_address_to_intent(address.id, Uuid::new_v4(), now)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn upsert_observation_replaces_same_txid_vout() {
        let store = MemoryStore::new();
        let address_id = Uuid::new_v4();
        let base = TxObservation {
            id: Uuid::new_v4(),
            txid: "abc".to_string(),
            vout: 0,
            value_sats: 1000,
            confirmations: 0,
            address_id,
            script_pubkey_hex: "spk".to_string(),
            status: crate::model::ObservationStatus::Mempool,
            seen_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        };
        let first = store.upsert_observation(base.clone()).await.unwrap();
        let mut updated = base.clone();
        updated.id = Uuid::new_v4();
        updated.confirmations = 1;
        let second = store.upsert_observation(updated).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.confirmations, 1);
    }
}
