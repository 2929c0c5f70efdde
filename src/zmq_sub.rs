//! ZMQ push subscriber (spec §4.E).
//!
//! One blocking `SUB` socket per configured topic, bridged into async Rust
//! via `tokio::task::spawn_blocking` feeding an `mpsc` channel -- the
//! standard way to drive a blocking C-library socket from a Tokio runtime,
//! and it keeps each subscriber loop single-threaded and cooperative as
//! specified.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::config::ZmqConfig;
use crate::error::{GatewayError, GatewayResult};

/// A decoded ZMQ notification, matching the wire formats in spec §6.
#[derive(Debug, Clone)]
pub enum ZmqNotification {
    /// `hashtx`: 32-byte txid + 4-byte LE sequence.
    HashTx { txid: [u8; 32], sequence: u32 },
    /// `hashblock`: 32-byte block hash + 4-byte LE sequence.
    HashBlock { hash: [u8; 32], sequence: u32 },
    /// `rawtx`: serialized transaction + 4-byte LE sequence trailer.
    RawTx { payload: Vec<u8>, sequence: u32 },
    /// `rawblock`: serialized block + 4-byte LE sequence trailer.
    RawBlock { payload: Vec<u8>, sequence: u32 },
    /// `sequence`: 32-byte hash + 1-byte label + 4-byte LE sequence.
    Sequence { hash: [u8; 32], label: u8, sequence: u32 },
}

const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Handle to a running ZMQ subscriber. Dropping or calling [`ZmqSubscriber::stop`]
/// unsubscribes every socket and drains the channel with a deadline (spec
/// §5, "stop unsubscribes ZMQ sockets").
pub struct ZmqSubscriber {
    handles: Vec<JoinHandle<()>>,
    receiver: mpsc::Receiver<ZmqNotification>,
}

impl ZmqSubscriber {
    /// Starts one blocking SUB socket per configured, non-`None` port. If
    /// every port is unset the subscriber is inert: it still returns a
    /// handle, but it spawns no sockets and the channel never yields
    /// anything (spec §6, "if all ports unset, subscriber is inert").
    pub fn start(config: ZmqConfig) -> GatewayResult<Self> {
        let (tx, rx) = mpsc::channel(1024);
        let mut handles = Vec::new();

        let topics: [(&str, Option<u16>); 5] = [
            ("hashtx", config.hashtx_port),
            ("hashblock", config.hashblock_port),
            ("rawtx", config.rawtx_port),
            ("rawblock", config.rawblock_port),
            ("sequence", config.sequence_port),
        ];

        for (topic, port) in topics {
            let Some(port) = port else { continue };
            let endpoint = format!("tcp://{}:{port}", config.host);
            let topic = topic.to_string();
            let tx = tx.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                if let Err(e) = run_subscriber_loop(&endpoint, &topic, tx) {
                    warn!(%endpoint, %topic, error = %e, "ZMQ subscriber loop exited");
                }
            }));
        }

        Ok(Self { handles, receiver: rx })
    }

    /// Receives the next decoded notification. Returns `None` once every
    /// socket loop has exited and the channel is drained.
    pub async fn recv(&mut self) -> Option<ZmqNotification> {
        self.receiver.recv().await
    }

    /// Unsubscribes and waits for the in-flight sockets to stop, up to
    /// [`DRAIN_DEADLINE`].
    pub async fn stop(self) {
        drop(self.receiver);
        for handle in self.handles {
            let _ = tokio::time::timeout(DRAIN_DEADLINE, handle).await;
        }
    }
}

#[cfg(feature = "zmq")]
fn run_subscriber_loop(
    endpoint: &str,
    topic: &str,
    tx: mpsc::Sender<ZmqNotification>,
) -> GatewayResult<()> {
    let ctx = zmq::Context::new();
    let socket = ctx
        .socket(zmq::SUB)
        .map_err(|e| GatewayError::Fatal(format!("zmq socket create: {e}")))?;
    socket
        .connect(endpoint)
        .map_err(|e| GatewayError::Fatal(format!("zmq connect {endpoint}: {e}")))?;
    socket
        .set_subscribe(topic.as_bytes())
        .map_err(|e| GatewayError::Fatal(format!("zmq subscribe {topic}: {e}")))?;

    loop {
        let frames = match socket.recv_multipart(0) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(%endpoint, error = %e, "zmq recv failed, stopping loop");
                return Ok(());
            }
        };
        trace!(%topic, frame_count = frames.len(), "zmq frame received");
        if let Some(notification) = decode_frames(topic, &frames) {
            if tx.blocking_send(notification).is_err() {
                return Ok(());
            }
        }
    }
}

#[cfg(not(feature = "zmq"))]
fn run_subscriber_loop(
    _endpoint: &str,
    _topic: &str,
    _tx: mpsc::Sender<ZmqNotification>,
) -> GatewayResult<()> {
    Err(GatewayError::Fatal(
        "ZMQ subscriber requires the `zmq` feature".to_string(),
    ))
}

fn decode_frames(topic: &str, frames: &[Vec<u8>]) -> Option<ZmqNotification> {
    if frames.len() < 2 {
        return None;
    }
    let body = &frames[1];
    match topic {
        "hashtx" if body.len() >= 36 => Some(ZmqNotification::HashTx {
            txid: body[0..32].try_into().ok()?,
            sequence: u32::from_le_bytes(body[32..36].try_into().ok()?),
        }),
        "hashblock" if body.len() >= 36 => Some(ZmqNotification::HashBlock {
            hash: body[0..32].try_into().ok()?,
            sequence: u32::from_le_bytes(body[32..36].try_into().ok()?),
        }),
        "rawtx" if body.len() >= 4 => {
            let split = body.len() - 4;
            Some(ZmqNotification::RawTx {
                payload: body[..split].to_vec(),
                sequence: u32::from_le_bytes(body[split..].try_into().ok()?),
            })
        }
        "rawblock" if body.len() >= 4 => {
            let split = body.len() - 4;
            Some(ZmqNotification::RawBlock {
                payload: body[..split].to_vec(),
                sequence: u32::from_le_bytes(body[split..].try_into().ok()?),
            })
        }
        "sequence" if body.len() >= 37 => Some(ZmqNotification::Sequence {
            hash: body[0..32].try_into().ok()?,
            label: body[32],
            sequence: u32::from_le_bytes(body[33..37].try_into().ok()?),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hashtx_frame() {
        let mut body = vec![7u8; 32];
        body.extend_from_slice(&42u32.to_le_bytes());
        let decoded = decode_frames("hashtx", &[b"hashtx".to_vec(), body]).unwrap();
        match decoded {
            ZmqNotification::HashTx { txid, sequence } => {
                assert_eq!(txid, [7u8; 32]);
                assert_eq!(sequence, 42);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decodes_sequence_frame() {
        let mut body = vec![1u8; 32];
        body.push(b'C');
        body.extend_from_slice(&9u32.to_le_bytes());
        let decoded = decode_frames("sequence", &[b"sequence".to_vec(), body]).unwrap();
        match decoded {
            ZmqNotification::Sequence { hash, label, sequence } => {
                assert_eq!(hash, [1u8; 32]);
                assert_eq!(label, b'C');
                assert_eq!(sequence, 9);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_short_frame() {
        assert!(decode_frames("hashtx", &[b"hashtx".to_vec(), vec![0u8; 10]]).is_none());
    }
}
