//! Response shapes for the Bitcoin Core JSON-RPC methods this crate calls
//! (spec §4.D). Trimmed from the teacher's much larger RPC type catalogue to
//! just the watch-only surface this gateway needs.

use bitcoin::{consensus, Address, Amount, Transaction, Txid};
use serde::{de, Deserialize, Deserializer, Serialize};

/// Result of `getblockchaininfo`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GetBlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    pub headers: u64,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: String,
    #[serde(rename = "mediantime")]
    pub median_time: u64,
    #[serde(rename = "initialblockdownload")]
    pub initial_block_download: bool,
}

/// Result of `getrawtransaction txid true`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetRawTransactionVerbosityOne {
    pub in_active_chain: Option<bool>,
    #[serde(deserialize_with = "deserialize_tx")]
    #[serde(rename = "hex")]
    pub transaction: Transaction,
    #[serde(deserialize_with = "deserialize_txid")]
    pub txid: Txid,
    pub blockhash: Option<bitcoin::BlockHash>,
    pub confirmations: Option<u32>,
    pub blocktime: Option<i64>,
}

/// Result of `gettxout txid n`. `None` (a JSON `null`) means the output is
/// spent or unknown.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetTxOut {
    #[serde(rename = "bestblock")]
    pub best_block: String,
    pub confirmations: u32,
    #[serde(deserialize_with = "deserialize_bitcoin")]
    pub value: Amount,
    pub coinbase: bool,
}

/// One entry of `listunspent`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListUnspentEntry {
    #[serde(deserialize_with = "deserialize_txid")]
    pub txid: Txid,
    pub vout: u32,
    #[serde(deserialize_with = "deserialize_address")]
    pub address: Address<bitcoin::address::NetworkUnchecked>,
    #[serde(rename = "scriptPubKey")]
    pub script_pubkey: String,
    #[serde(deserialize_with = "deserialize_bitcoin")]
    pub amount: Amount,
    pub confirmations: u32,
    pub spendable: bool,
    pub safe: bool,
}

/// Query filter for `listunspent`, third (`addresses`) argument only --
/// this gateway only ever asks for specific watched addresses.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ListUnspentQueryOptions {
    #[serde(rename = "minconf", skip_serializing_if = "Option::is_none")]
    pub min_conf: Option<u32>,
    #[serde(rename = "maxconf", skip_serializing_if = "Option::is_none")]
    pub max_conf: Option<u32>,
}

/// Result of `scantxoutset start [descriptors]`, trimmed to the fields the
/// reconciler's fallback pull path needs.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ScanTxOutSetResult {
    pub success: bool,
    pub height: Option<u64>,
    pub unspents: Vec<ScanTxOutSetUnspent>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ScanTxOutSetUnspent {
    #[serde(deserialize_with = "deserialize_txid")]
    pub txid: Txid,
    pub vout: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pubkey: String,
    #[serde(deserialize_with = "deserialize_bitcoin")]
    pub amount: Amount,
    pub height: Option<u64>,
}

fn deserialize_bitcoin<'d, D>(deserializer: D) -> Result<Amount, D::Error>
where
    D: Deserializer<'d>,
{
    let v = f64::deserialize(deserializer)?;
    Amount::from_btc(v).map_err(de::Error::custom)
}

fn deserialize_txid<'d, D>(deserializer: D) -> Result<Txid, D::Error>
where
    D: Deserializer<'d>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<Txid>().map_err(de::Error::custom)
}

fn deserialize_tx<'d, D>(deserializer: D) -> Result<Transaction, D::Error>
where
    D: Deserializer<'d>,
{
    let s = String::deserialize(deserializer)?;
    consensus::encode::deserialize_hex::<Transaction>(&s).map_err(de::Error::custom)
}

fn deserialize_address<'d, D>(
    deserializer: D,
) -> Result<Address<bitcoin::address::NetworkUnchecked>, D::Error>
where
    D: Deserializer<'d>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<Address<_>>().map_err(de::Error::custom)
}
