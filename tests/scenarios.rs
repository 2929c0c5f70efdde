//! End-to-end scenarios against the in-memory store and a null RPC client,
//! following the crate's own `corepc_node_helpers`-style fixture pattern: a
//! small helper that assembles a ready-to-use context, reused across tests.

use std::sync::Arc;

use bitcoin::Network;
use bitcoin_pay_gateway::api::{GatewayContext, TokenReuse};
use bitcoin_pay_gateway::descriptor::DescriptorEngine;
use bitcoin_pay_gateway::events::{ChannelEventSink, GatewayEvent};
use bitcoin_pay_gateway::model::IntentStatus;
use bitcoin_pay_gateway::reconciler::{Reconciler, TxOutputSighting};
use bitcoin_pay_gateway::state_machine::{DeltaSource, MatchMode};
use bitcoin_pay_gateway::storage::memory::MemoryStore;
use bitcoin_pay_gateway::storage::CoreStore;
use bitcoin_pay_gateway::watched_set::WatchedAddressSet;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedReceiver;

const TPRV_DESC: &str = "wpkh(tpubD6NzVbkrYhZ4WZaiWHz59q5EQ61bd6dUYfU4ggRWAtNAyyYRNWT6ktJ7UHJEXURvTfTfskFQmK3HqKEX4DPnRV45aPofuRuu6s9QCbMQWB5/0/*)";

struct Fixture {
    ctx: GatewayContext,
    reconciler: Reconciler,
    events: UnboundedReceiver<GatewayEvent>,
}

fn fixture() -> Fixture {
    let storage: Arc<dyn CoreStore> = Arc::new(MemoryStore::new());
    let watched = Arc::new(WatchedAddressSet::new());
    let (sink, events) = ChannelEventSink::new();
    let sink = Arc::new(sink);

    let reconciler = Reconciler::new(storage.clone(), watched.clone(), None, sink.clone(), MatchMode::FirstOutputMeets);
    let ctx = GatewayContext {
        storage,
        descriptor: Arc::new(DescriptorEngine::parse(TPRV_DESC, Network::Testnet).unwrap()),
        watched,
        sink,
        secret: b"0123456789abcdef0123456789abcdef".to_vec(),
        base_url: "https://pay.example.com".to_string(),
        gap_limit: 20,
        token_reuse: TokenReuse::UntilExpiry,
        scan: None,
        default_required_confs: 1,
    };

    Fixture { ctx, reconciler, events }
}

async fn feed(f: &Fixture, address_script_hex: &str, txid: &str, value_sats: i64, confirmations: i32) {
    let outputs = vec![TxOutputSighting { vout: 0, script_pubkey_hex: address_script_hex.to_string(), value_sats }];
    f.reconciler
        .reconcile_outputs(txid, &outputs, confirmations, OffsetDateTime::now_utc(), DeltaSource::RpcPoll)
        .await
        .unwrap();
}

fn script_hex_of(assigned_address: &str) -> String {
    // The fixture only ever assigns index-0 addresses off TPRV_DESC in these
    // tests, so re-deriving here gives the same scriptPubKey the gateway
    // stored -- avoids threading the hex through every call site.
    let _ = assigned_address;
    let engine = DescriptorEngine::parse(TPRV_DESC, Network::Testnet).unwrap();
    let (_, script) = engine.derive(0).unwrap();
    script.to_hex_string()
}

/// S1 -- Happy path: a single observation at or above `requiredConfs`
/// confirms the intent in one step.
#[tokio::test]
async fn s1_happy_path_confirms_in_one_step() {
    let mut f = fixture();
    let intent = f.ctx.create_intent(50_000, 1, 60, None, None, None).await.unwrap();
    let issued = f.ctx.issue_token(intent.id, 86_400).await.unwrap();
    let redeemed = f.ctx.redeem_token(&issued.token).await.unwrap();
    assert_eq!(redeemed.intent_id, intent.id);
    let assigned = f.ctx.ensure_assigned(intent.id).await.unwrap();

    let script_hex = script_hex_of(&assigned.address);
    feed(&f, &script_hex, "deadbeef", 50_000, 1).await;

    let status = f.ctx.get_status(intent.id).await.unwrap();
    assert_eq!(status.status, IntentStatus::Confirmed);
    assert_eq!(status.confs, 1);
    assert_eq!(status.txid.as_deref(), Some("deadbeef"));

    let event = f.events.recv().await.unwrap();
    assert!(matches!(event, GatewayEvent::Created { .. }));
    let event = f.events.recv().await.unwrap();
    assert!(matches!(event, GatewayEvent::Confirmed { intent_id, .. } if intent_id == intent.id));
    assert!(f.events.try_recv().is_err());
}

/// S2 -- Mempool then confirm: transitions pass through `processing` before
/// `confirmed`, each callback firing exactly once.
#[tokio::test]
async fn s2_mempool_then_confirm() {
    let mut f = fixture();
    let intent = f.ctx.create_intent(50_000, 1, 60, None, None, None).await.unwrap();
    let assigned = f.ctx.ensure_assigned(intent.id).await.unwrap();
    let script_hex = script_hex_of(&assigned.address);

    feed(&f, &script_hex, "txabc", 50_000, 0).await;
    let after_mempool = f.ctx.storage.get_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(after_mempool.status, IntentStatus::Processing);

    feed(&f, &script_hex, "txabc", 50_000, 1).await;
    let after_confirm = f.ctx.storage.get_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(after_confirm.status, IntentStatus::Confirmed);

    assert!(matches!(f.events.recv().await.unwrap(), GatewayEvent::Created { .. }));
    assert!(matches!(f.events.recv().await.unwrap(), GatewayEvent::Processing { .. }));
    assert!(matches!(f.events.recv().await.unwrap(), GatewayEvent::Confirmed { .. }));
    assert!(f.events.try_recv().is_err());
}

/// S3 -- Expiry: a pending intent past its deadline is swept to `expired`,
/// after which `ensureAssigned` fails with `InvalidState`.
#[tokio::test]
async fn s3_expiry_blocks_further_assignment() {
    let f = fixture();
    let intent = f.ctx.create_intent(50_000, 1, 1, None, None, None).await.unwrap();

    // Simulate the expiry sweep directly rather than waiting a real minute.
    let mut expired = f.ctx.storage.get_intent(intent.id).await.unwrap().unwrap();
    expired.status = IntentStatus::Expired;
    expired.expires_at = OffsetDateTime::now_utc() - time::Duration::seconds(10);
    f.ctx.storage.update_intent(expired).await.unwrap();

    let err = f.ctx.ensure_assigned(intent.id).await.unwrap_err();
    assert!(matches!(err, bitcoin_pay_gateway::error::GatewayError::InvalidState(_)));
}

/// S4 -- Reorg: once confirmed, a reconciliation call that can no longer
/// find the transaction demotes the intent back to `processing` and fires
/// `onReorg` exactly once. (The demotion branch needs a live RPC client to
/// observe "tx unknown"; here we exercise the pure state-machine transition
/// the reconciler applies, which is the unit under test for this scenario.)
#[tokio::test]
async fn s4_reorg_demotes_confirmed_intent() {
    use bitcoin_pay_gateway::state_machine::{reorg_transition, Transition};

    let f = fixture();
    let intent = f.ctx.create_intent(50_000, 1, 60, None, None, None).await.unwrap();
    let assigned = f.ctx.ensure_assigned(intent.id).await.unwrap();
    let script_hex = script_hex_of(&assigned.address);
    feed(&f, &script_hex, "txreorg", 50_000, 1).await;

    let confirmed = f.ctx.storage.get_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(confirmed.status, IntentStatus::Confirmed);
    assert!(confirmed.confirmed_at.is_some());

    assert_eq!(reorg_transition(confirmed.status), Some(Transition::ToProcessingOnReorg));
    assert_eq!(reorg_transition(IntentStatus::Processing), None);
}

/// S5 -- Under-payment: a below-amount observation holds the intent at
/// `processing`; a second, independent observation on the same address does
/// not combine with the first.
#[tokio::test]
async fn s5_under_payment_tracked_independently() {
    let f = fixture();
    let intent = f.ctx.create_intent(50_000, 1, 60, None, None, None).await.unwrap();
    let assigned = f.ctx.ensure_assigned(intent.id).await.unwrap();
    let script_hex = script_hex_of(&assigned.address);

    feed(&f, &script_hex, "tx1", 40_000, 6).await;
    let after_first = f.ctx.storage.get_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(after_first.status, IntentStatus::Processing);

    feed(&f, &script_hex, "tx2", 10_000, 1).await;
    let after_second = f.ctx.storage.get_intent(intent.id).await.unwrap().unwrap();
    assert_eq!(after_second.status, IntentStatus::Processing);

    assert!(f.ctx.storage.get_observation("tx1", 0).await.unwrap().is_some());
    assert!(f.ctx.storage.get_observation("tx2", 0).await.unwrap().is_some());
}

/// S6 -- Token replay after consume: redeeming twice before expiry succeeds
/// both times under the default `untilExpiry` policy; after expiry it fails.
#[tokio::test]
async fn s6_token_replay_until_expiry_then_rejected() {
    let f = fixture();
    let intent = f.ctx.create_intent(50_000, 1, 60, None, None, None).await.unwrap();
    let issued = f.ctx.issue_token(intent.id, 1).await.unwrap();

    let first = f.ctx.redeem_token(&issued.token).await.unwrap();
    assert_eq!(first.intent_id, intent.id);
    let second = f.ctx.redeem_token(&issued.token).await.unwrap();
    assert_eq!(second.intent_id, intent.id);

    let row = f.ctx.storage.get_token(&issued.token).await.unwrap().unwrap();
    assert!(row.consumed);

    tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
    let err = f.ctx.redeem_token(&issued.token).await.unwrap_err();
    assert!(matches!(err, bitcoin_pay_gateway::error::GatewayError::Expired(_)));
}
