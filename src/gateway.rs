//! Gateway assembly and lifecycle (spec §5, §9 "Shared singleton instance ->
//! explicit context"; spec §2's data-flow diagram).
//!
//! Everything else in this crate is a component in isolation; this module is
//! the one place that wires them together the way spec §2 describes: the
//! push path (`zmq_sub`) feeds `txid`s into the reconciler, the scheduler
//! drives the pull path and expiry sweep, and `startWatcher`/`stopWatcher`
//! (spec §5) are the lifecycle points a caller actually touches. Built as an
//! explicit struct assembled once at startup rather than a memoized
//! module-scope singleton, per the §9 design note.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::hex::FromHex;
use bitcoin::{ScriptBuf, Txid};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use crate::api::GatewayContext;
use crate::config::{GatewayConfig, WatcherBackend, ZmqConfig};
use crate::descriptor::DescriptorEngine;
use crate::error::{GatewayError, GatewayResult};
use crate::events::EventSink;
use crate::indexer::IndexerClient;
use crate::reconciler::Reconciler;
use crate::rpc::{Auth, RpcReader};
use crate::scheduler::{PullBackend, Scheduler};
use crate::storage::CoreStore;
use crate::watched_set::WatchedAddressSet;
use crate::zmq_sub::{ZmqNotification, ZmqSubscriber};

/// How long `stop()` waits for the push-path loop and the scheduler's
/// in-flight tick to finish before giving up (spec §5, "waiting for at most
/// one in-flight tick with a short deadline").
const STOP_DEADLINE: Duration = Duration::from_secs(5);

/// The assembled gateway: the core verbs (`ctx`, spec §4.I) plus the watcher
/// subsystem that keeps `ctx.watched` and storage in sync with the chain
/// (spec §4.E-H). Build with [`Gateway::assemble`]; call [`Gateway::start`]
/// to begin watching and [`Gateway::stop`] to tear down. A second `start`
/// after `stop` is allowed (spec §5).
pub struct Gateway {
    pub ctx: Arc<GatewayContext>,
    reconciler: Arc<Reconciler>,
    scheduler: Arc<Scheduler>,
    zmq_config: Option<ZmqConfig>,
    running: Mutex<Option<RunningHandles>>,
}

struct RunningHandles {
    shutdown_tx: watch::Sender<bool>,
    scheduler_task: JoinHandle<()>,
    push_path_task: Option<JoinHandle<()>>,
}

impl Gateway {
    /// Builds the descriptor engine, node client(s), reconciler, and
    /// scheduler from `config`, wired per spec §2's data flow, but does not
    /// start any background task yet -- call [`Gateway::start`] for that.
    pub fn assemble(
        config: &GatewayConfig,
        storage: Arc<dyn CoreStore>,
        sink: Arc<dyn EventSink>,
    ) -> GatewayResult<Self> {
        let descriptor = Arc::new(DescriptorEngine::parse(&config.descriptor, config.network)?);
        let watched = Arc::new(WatchedAddressSet::new());

        let (rpc, zmq_config) = match &config.watcher {
            WatcherBackend::Rpc { rpc, zmq } => {
                let auth = if rpc.username.is_empty() {
                    Auth::None
                } else {
                    Auth::UserPass(rpc.username.clone(), rpc.password.clone())
                };
                let url = format!("http://{}:{}", rpc.host, rpc.port);
                let client = RpcReader::new(url, auth, config.rpc_timeout)?;
                (Some(client), Some(zmq.clone()))
            }
            WatcherBackend::Indexer(_) => (None, None),
        };

        let reconciler = Arc::new(Reconciler::new(
            storage.clone(),
            watched.clone(),
            rpc.clone(),
            sink.clone(),
            config.match_mode,
        ));

        let pull_backend = match &config.watcher {
            WatcherBackend::Rpc { .. } => {
                let rpc = rpc.clone().ok_or_else(|| {
                    GatewayError::Fatal("RPC backend selected but no client was constructed".to_string())
                })?;
                PullBackend::Rpc(rpc)
            }
            WatcherBackend::Indexer(indexer) => {
                PullBackend::Indexer(IndexerClient::new(indexer.api_url.clone(), config.rpc_timeout)?)
            }
        };

        let scheduler = Arc::new(Scheduler::new(
            storage.clone(),
            reconciler.clone(),
            pull_backend,
            sink.clone(),
            config.poll_interval,
        ));

        let ctx = Arc::new(GatewayContext {
            storage,
            descriptor,
            watched,
            sink,
            secret: config.secret.clone(),
            base_url: config.base_url.clone(),
            gap_limit: config.gap_limit,
            token_reuse: config.token_reuse,
            scan: Some(scheduler.clone() as Arc<dyn crate::api::ScanTrigger>),
            default_required_confs: config.default_required_confs,
        });

        Ok(Self { ctx, reconciler, scheduler, zmq_config, running: Mutex::new(None) })
    }

    /// **startWatcher** (spec §5). Seeds the watched-address set from
    /// `listAssignedAddresses()`, starts the ZMQ subscriber (skipped if
    /// unconfigured or inert, per spec §4.E -- the system degrades to
    /// polling), and starts the scheduler's two periodic tasks. Idempotent:
    /// calling `start` while already running is a no-op.
    pub async fn start(&self) -> GatewayResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let assigned = self.ctx.storage.list_assigned_addresses().await?;
        let count = assigned.len();
        self.ctx.watched.seed(assigned.into_iter().filter_map(|a| {
            let script = ScriptBuf::from_hex(&a.script_pubkey_hex).ok()?;
            Some((script, a.intent_id?))
        }));
        info!(watched = count, "watched-address set seeded at startup");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let push_path_task = match &self.zmq_config {
            Some(zmq_config) if !zmq_config.is_inert() => {
                let subscriber = ZmqSubscriber::start(zmq_config.clone())?;
                let reconciler = self.reconciler.clone();
                let mut shutdown_rx = shutdown_rx.clone();
                Some(tokio::spawn(async move {
                    run_push_path(subscriber, reconciler, &mut shutdown_rx).await;
                }))
            }
            _ => {
                info!("ZMQ subscriber unconfigured or inert; degrading to polling only");
                None
            }
        };

        let scheduler = self.scheduler.clone();
        let scheduler_task = tokio::spawn(async move {
            scheduler.run(shutdown_rx).await;
        });

        *running = Some(RunningHandles { shutdown_tx, scheduler_task, push_path_task });
        Ok(())
    }

    /// **stopWatcher** (spec §5). Unsubscribes ZMQ sockets, stops the
    /// scheduler (waiting at most [`STOP_DEADLINE`] for an in-flight tick),
    /// and clears the watched-address set. A no-op if not currently running.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(handles) = running.take() else { return };

        let _ = handles.shutdown_tx.send(true);

        if let Some(push_path_task) = handles.push_path_task {
            if tokio::time::timeout(STOP_DEADLINE, push_path_task).await.is_err() {
                warn!("push-path task did not exit within the stop deadline");
            }
        }
        if tokio::time::timeout(STOP_DEADLINE, handles.scheduler_task).await.is_err() {
            warn!("scheduler task did not exit within the stop deadline");
        }

        self.ctx.watched.clear();
    }

    /// Whether the watcher subsystem is currently running. Used by the
    /// `/scan/:id` handler's `503` guard (spec §6) together with
    /// `watched_set::WatchedAddressSet::is_empty`.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

/// Consumes decoded ZMQ notifications and drives them into the reconciler
/// (spec §2, "E pushes txids -> F"). `hashtx` triggers an immediate
/// verbose-tx fetch at `confirmations = 0` (mempool sighting); `hashblock`
/// is logged only -- a new block's confirmation growth is picked up by the
/// scheduler's next pending-payment poll (which also runs the reorg check),
/// rather than re-deriving confirmation counts here.
async fn run_push_path(mut subscriber: ZmqSubscriber, reconciler: Arc<Reconciler>, shutdown: &mut watch::Receiver<bool>) {
    loop {
        tokio::select! {
            notification = subscriber.recv() => {
                let Some(notification) = notification else { break };
                handle_notification(&reconciler, notification).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    subscriber.stop().await;
}

async fn handle_notification(reconciler: &Reconciler, notification: ZmqNotification) {
    match notification {
        ZmqNotification::HashTx { txid, sequence } => {
            trace!(%sequence, "hashtx notification received");
            let Some(txid) = txid_from_internal_bytes(&txid) else {
                warn!("hashtx notification carried an unparseable txid");
                return;
            };
            if let Err(e) = reconciler.reconcile_via_rpc(&txid, 0).await {
                warn!(%txid, error = %e, "hashtx reconciliation failed, deferring to next scheduler tick");
            }
        }
        ZmqNotification::HashBlock { sequence, .. } => {
            trace!(%sequence, "hashblock notification received");
        }
        ZmqNotification::RawTx { sequence, .. }
        | ZmqNotification::RawBlock { sequence, .. }
        | ZmqNotification::Sequence { sequence, .. } => {
            trace!(%sequence, "unused zmq topic notification received");
        }
    }
}

/// Bitcoin Core's ZMQ `hashtx`/`hashblock` payload is the hash in internal
/// (natural) byte order, the same order `Txid`/`BlockHash` store internally
/// -- no byte-reversal needed here, unlike parsing a display/RPC hex string.
fn txid_from_internal_bytes(bytes: &[u8; 32]) -> Option<Txid> {
    use bitcoin::hashes::Hash;
    Txid::from_slice(bytes).ok()
}
