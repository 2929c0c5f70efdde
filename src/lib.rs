pub mod api;
pub mod bip21;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod gateway;
#[cfg(feature = "http")]
pub mod http;
pub mod indexer;
pub mod model;
pub mod reconciler;
pub mod rpc;
pub mod scheduler;
pub mod state_machine;
pub mod storage;
pub mod token;
pub mod watched_set;
pub mod zmq_sub;

#[cfg(test)]
pub mod test_utils;
