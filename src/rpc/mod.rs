//! Bitcoin Core JSON-RPC client (spec §4.D).

pub mod client;
pub mod types;

pub use client::{Auth, RpcReader};
