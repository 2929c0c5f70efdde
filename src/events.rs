//! Event dispatcher (spec §4.J).
//!
//! Delivery is best-effort in-process: callbacks for a given intent are
//! awaited serially (so a downstream chain observes ordered transitions),
//! across intents delivery may interleave. Callback errors are caught and
//! logged; they never roll back the state transition that produced them.

use time::OffsetDateTime;
use tracing::warn;

use crate::model::{IntentId, ObservationId};

/// One of the five lifecycle notifications named in spec §4.J
/// (`onIntentCreated/onProcessing/onConfirmed/onExpired/onReorg`),
/// represented as a single tagged union per the §9 design note ("typed
/// channel / visitor").
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Created { intent_id: IntentId, at: OffsetDateTime },
    Processing { intent_id: IntentId, observation_id: ObservationId, at: OffsetDateTime },
    Confirmed { intent_id: IntentId, observation_id: ObservationId, at: OffsetDateTime },
    Expired { intent_id: IntentId, at: OffsetDateTime },
    Reorg { intent_id: IntentId, observation_id: ObservationId, at: OffsetDateTime },
}

impl GatewayEvent {
    pub fn intent_id(&self) -> IntentId {
        match self {
            GatewayEvent::Created { intent_id, .. }
            | GatewayEvent::Processing { intent_id, .. }
            | GatewayEvent::Confirmed { intent_id, .. }
            | GatewayEvent::Expired { intent_id, .. }
            | GatewayEvent::Reorg { intent_id, .. } => *intent_id,
        }
    }
}

/// A sink that receives [`GatewayEvent`]s. Implementations are expected to
/// return quickly and swallow their own errors internally where possible;
/// the dispatcher logs (but does not propagate) any `Err` returned here.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, event: GatewayEvent) -> Result<(), String>;
}

/// Dispatches events to a sink, logging and swallowing callback errors
/// (spec §4.J, "Callback errors are caught and logged; they MUST NOT roll
/// back the state transition").
pub async fn dispatch(sink: &dyn EventSink, event: GatewayEvent) {
    let intent_id = event.intent_id();
    if let Err(e) = sink.handle(event).await {
        warn!(%intent_id, error = %e, "event sink callback failed");
    }
}

/// The default sink: discards every event. Useful for embedding the
/// gateway without any downstream side effects wired up.
#[derive(Debug, Default)]
pub struct NullEventSink;

#[async_trait::async_trait]
impl EventSink for NullEventSink {
    async fn handle(&self, _event: GatewayEvent) -> Result<(), String> {
        Ok(())
    }
}

/// A sink backed by an unbounded channel, for callers who would rather
/// consume a stream of events than implement [`EventSink`] directly.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: tokio::sync::mpsc::UnboundedSender<GatewayEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<GatewayEvent>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl EventSink for ChannelEventSink {
    async fn handle(&self, event: GatewayEvent) -> Result<(), String> {
        self.sender.send(event).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelEventSink::new();
        let intent_id = Uuid::new_v4();
        dispatch(&sink, GatewayEvent::Created { intent_id, at: OffsetDateTime::now_utc() }).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.intent_id(), intent_id);
    }

    #[tokio::test]
    async fn null_sink_discards_events() {
        let sink = NullEventSink;
        let intent_id = Uuid::new_v4();
        dispatch(&sink, GatewayEvent::Expired { intent_id, at: OffsetDateTime::now_utc() }).await;
    }
}
