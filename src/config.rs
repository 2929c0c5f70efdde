//! Runtime configuration (spec §6, "Environment/configuration").
//!
//! Read directly from environment variables via `std::env::var`, matching
//! the teacher's preference for a config struct assembled at startup rather
//! than a config-file crate. All defaults match spec §6 verbatim.

use std::env;
use std::time::Duration;

use bitcoin::Network;

use crate::error::{GatewayError, GatewayResult};
use crate::api::TokenReuse;
use crate::state_machine::MatchMode;

const DEFAULT_CONFIRMATIONS: i32 = 1;
const DEFAULT_POLL_INTERVAL_CRON: &str = "*/5 * * * *";
const DEFAULT_GAP_LIMIT: u32 = 20;
const DEFAULT_MAGIC_LINK_TTL_SECS: i64 = 86_400;
const DEFAULT_INTENT_EXPIRY_MINUTES: i64 = 60;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BASE_PATH: &str = "/api/pay";

/// Bitcoin Core RPC connection settings (spec §6, `watcher.rpc.*`).
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// ZMQ subscriber endpoints (spec §6, `watcher.zmq.*`). A port left unset
/// disables that topic; if every port is unset the subscriber is inert, per
/// spec §6.
#[derive(Debug, Clone, Default)]
pub struct ZmqConfig {
    pub host: String,
    pub hashtx_port: Option<u16>,
    pub hashblock_port: Option<u16>,
    pub rawtx_port: Option<u16>,
    pub rawblock_port: Option<u16>,
    pub sequence_port: Option<u16>,
}

impl ZmqConfig {
    /// True if no topic port is configured, i.e. the subscriber should not
    /// start (spec §6, "if all ports unset, subscriber is inert").
    pub fn is_inert(&self) -> bool {
        self.hashtx_port.is_none()
            && self.hashblock_port.is_none()
            && self.rawtx_port.is_none()
            && self.rawblock_port.is_none()
            && self.sequence_port.is_none()
    }
}

/// Indexer (Esplora-compatible) backend settings (spec §6, `indexer.*`).
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub api_url: String,
}

/// Which watcher backend(s) are active. Exactly one of `Rpc` (optionally
/// with ZMQ) or `Indexer` is permitted (spec §4.D); constructing an invalid
/// combination is a `Validation` error at config build time, not a runtime
/// one.
#[derive(Debug, Clone)]
pub enum WatcherBackend {
    Rpc { rpc: RpcConfig, zmq: ZmqConfig },
    Indexer(IndexerConfig),
}

/// Fully resolved gateway configuration (spec §6).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// External base URL used to build magic-link URLs (spec §6, `baseURL`).
    pub base_url: String,
    /// HMAC key for the token codec (spec §4.B). At least 32 bytes
    /// recommended; not enforced here, since the spec only recommends it.
    pub secret: Vec<u8>,
    /// Watch-only descriptor string (spec §4.A).
    pub descriptor: String,
    pub network: Network,
    /// Default `requiredConfs` for new intents (spec §6, `confirmations`).
    pub default_required_confs: i32,
    pub watcher: WatcherBackend,
    /// Resolved poll interval (spec §6, `pollInterval`, cron -> duration
    /// per the §9 design note).
    pub poll_interval: Duration,
    pub gap_limit: u32,
    pub magic_link_ttl_secs: i64,
    pub intent_expiry_minutes: i64,
    pub rpc_timeout: Duration,
    pub match_mode: MatchMode,
    pub token_reuse: TokenReuse,
    /// Mount point for the HTTP surface (spec §6, default `/api/pay`).
    pub base_path: String,
}

impl GatewayConfig {
    /// Reads and validates configuration from the process environment.
    /// Fails with `Validation` if required keys are missing or the watcher
    /// backend is ambiguous (neither or both of `rpc`/`indexer` configured).
    pub fn from_env() -> GatewayResult<Self> {
        let base_url = require_env("baseURL")?;
        let secret = require_env("secret")?.into_bytes();
        let descriptor = require_env("descriptor")?;
        let network = parse_network(&require_env("network")?)?;

        let default_required_confs = env::var("confirmations")
            .ok()
            .map(|s| parse_i32(&s, "confirmations"))
            .transpose()?
            .unwrap_or(DEFAULT_CONFIRMATIONS);

        let watcher = resolve_watcher_backend(network)?;

        let poll_interval_cron =
            env::var("pollInterval").unwrap_or_else(|_| DEFAULT_POLL_INTERVAL_CRON.to_string());
        let poll_interval = resolve_cron_minutes(&poll_interval_cron)?;

        let gap_limit = env::var("advanced.gapLimit")
            .ok()
            .map(|s| parse_u32(&s, "advanced.gapLimit"))
            .transpose()?
            .unwrap_or(DEFAULT_GAP_LIMIT);

        let magic_link_ttl_secs = env::var("magicLinkTTL")
            .ok()
            .map(|s| parse_i64(&s, "magicLinkTTL"))
            .transpose()?
            .unwrap_or(DEFAULT_MAGIC_LINK_TTL_SECS);

        let intent_expiry_minutes = env::var("intentExpiryMinutes")
            .ok()
            .map(|s| parse_i64(&s, "intentExpiryMinutes"))
            .transpose()?
            .unwrap_or(DEFAULT_INTENT_EXPIRY_MINUTES);

        let match_mode = match env::var("matchMode").ok().as_deref() {
            None => MatchMode::FirstOutputMeets,
            Some("firstOutputMeets") => MatchMode::FirstOutputMeets,
            Some("sumOfOutputsMeets") => MatchMode::SumOfOutputsMeets,
            Some(other) => {
                return Err(GatewayError::Validation(format!(
                    "matchMode: unrecognized value `{other}`"
                )))
            }
        };

        let token_reuse = match env::var("tokenReuse").ok().as_deref() {
            None => TokenReuse::UntilExpiry,
            Some("untilExpiry") => TokenReuse::UntilExpiry,
            Some("singleUse") => TokenReuse::SingleUse,
            Some(other) => {
                return Err(GatewayError::Validation(format!(
                    "tokenReuse: unrecognized value `{other}`"
                )))
            }
        };

        let base_path = env::var("basePath").unwrap_or_else(|_| DEFAULT_BASE_PATH.to_string());

        Ok(Self {
            base_url,
            secret,
            descriptor,
            network,
            default_required_confs,
            watcher,
            poll_interval,
            gap_limit,
            magic_link_ttl_secs,
            intent_expiry_minutes,
            rpc_timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
            match_mode,
            token_reuse,
            base_path,
        })
    }
}

fn require_env(key: &str) -> GatewayResult<String> {
    env::var(key).map_err(|_| GatewayError::Validation(format!("missing required config key `{key}`")))
}

fn parse_network(s: &str) -> GatewayResult<Network> {
    match s {
        "mainnet" => Ok(Network::Bitcoin),
        "testnet" => Ok(Network::Testnet),
        "regtest" => Ok(Network::Regtest),
        "signet" => Ok(Network::Signet),
        other => Err(GatewayError::Validation(format!(
            "network: unrecognized value `{other}`, expected mainnet|testnet|regtest|signet"
        ))),
    }
}

fn parse_i32(s: &str, key: &str) -> GatewayResult<i32> {
    s.parse()
        .map_err(|_| GatewayError::Validation(format!("{key}: not an integer: `{s}`")))
}

fn parse_u32(s: &str, key: &str) -> GatewayResult<u32> {
    s.parse()
        .map_err(|_| GatewayError::Validation(format!("{key}: not an integer: `{s}`")))
}

fn parse_i64(s: &str, key: &str) -> GatewayResult<i64> {
    s.parse()
        .map_err(|_| GatewayError::Validation(format!("{key}: not an integer: `{s}`")))
}

fn parse_u16(s: &str, key: &str) -> GatewayResult<u16> {
    s.parse()
        .map_err(|_| GatewayError::Validation(format!("{key}: not a port number: `{s}`")))
}

/// Picks the watcher backend per spec §4.D/§6: RPC (optionally with ZMQ) or
/// an indexer, never both, never neither -- except on `regtest`, where the
/// spec requires an explicit `indexer.network`/`indexer.apiUrl` if RPC isn't
/// configured, so the ambiguity check is unconditional.
fn resolve_watcher_backend(network: Network) -> GatewayResult<WatcherBackend> {
    let has_rpc = env::var("watcher.rpc.host").is_ok();
    let has_indexer = env::var("indexer.apiUrl").is_ok() || env::var("indexer.network").is_ok();

    match (has_rpc, has_indexer) {
        (true, false) => {
            let rpc = RpcConfig {
                host: require_env("watcher.rpc.host")?,
                port: parse_u16(&require_env("watcher.rpc.port")?, "watcher.rpc.port")?,
                username: env::var("watcher.rpc.username").unwrap_or_default(),
                password: env::var("watcher.rpc.password").unwrap_or_default(),
            };
            let zmq = ZmqConfig {
                host: env::var("watcher.zmq.host").unwrap_or_default(),
                hashtx_port: optional_port("watcher.zmq.hashtxPort")?,
                hashblock_port: optional_port("watcher.zmq.hashblockPort")?,
                rawtx_port: optional_port("watcher.zmq.rawtxPort")?,
                rawblock_port: optional_port("watcher.zmq.rawblockPort")?,
                sequence_port: optional_port("watcher.zmq.sequencePort")?,
            };
            Ok(WatcherBackend::Rpc { rpc, zmq })
        }
        (false, true) => {
            let api_url = match env::var("indexer.apiUrl") {
                Ok(url) => url,
                Err(_) => default_indexer_url(network)?,
            };
            Ok(WatcherBackend::Indexer(IndexerConfig { api_url }))
        }
        (false, false) => Err(GatewayError::Validation(
            "no watcher backend configured: set watcher.rpc.host or indexer.apiUrl/indexer.network".to_string(),
        )),
        (true, true) => Err(GatewayError::Validation(
            "ambiguous watcher backend: both watcher.rpc.host and indexer.apiUrl/indexer.network are set"
                .to_string(),
        )),
    }
}

fn optional_port(key: &str) -> GatewayResult<Option<u16>> {
    env::var(key).ok().map(|s| parse_u16(&s, key)).transpose()
}

/// Default Esplora-style base URL per named network. `regtest` has no
/// sensible public default, so it must be set explicitly (spec §6, "for
/// `regtest` must be explicit").
fn default_indexer_url(network: Network) -> GatewayResult<String> {
    match network {
        Network::Bitcoin => Ok("https://blockstream.info/api".to_string()),
        Network::Testnet => Ok("https://blockstream.info/testnet/api".to_string()),
        Network::Signet => Ok("https://mempool.space/signet/api".to_string()),
        _ => Err(GatewayError::Validation(
            "indexer.apiUrl must be set explicitly for regtest".to_string(),
        )),
    }
}

/// Resolves a cron string to a tick duration. Only the common `*/N * * * *`
/// minute-step grammar is supported (spec §9, "Cron strings -> duration");
/// anything else is a `Validation` error at config time.
pub fn resolve_cron_minutes(cron: &str) -> GatewayResult<Duration> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(GatewayError::Validation(format!(
            "unsupported cron expression `{cron}`: expected 5 fields"
        )));
    }
    let minute_field = fields[0];
    let rest_are_wildcards = fields[1..].iter().all(|f| *f == "*");
    if !rest_are_wildcards {
        return Err(GatewayError::Validation(format!(
            "unsupported cron expression `{cron}`: only minute-step `*/N * * * *` is supported"
        )));
    }
    let n: u64 = if minute_field == "*" {
        1
    } else if let Some(step) = minute_field.strip_prefix("*/") {
        step.parse()
            .map_err(|_| GatewayError::Validation(format!("unsupported cron expression `{cron}`")))?
    } else {
        return Err(GatewayError::Validation(format!(
            "unsupported cron expression `{cron}`: only `*` or `*/N` minute fields are supported"
        )));
    };
    if n == 0 {
        return Err(GatewayError::Validation(format!(
            "unsupported cron expression `{cron}`: step must be > 0"
        )));
    }
    Ok(Duration::from_secs(n * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_minute_step() {
        assert_eq!(resolve_cron_minutes("*/5 * * * *").unwrap(), Duration::from_secs(300));
        assert_eq!(resolve_cron_minutes("*/1 * * * *").unwrap(), Duration::from_secs(60));
        assert_eq!(resolve_cron_minutes("* * * * *").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_non_minute_step_grammar() {
        assert!(resolve_cron_minutes("0 */2 * * *").is_err());
        assert!(resolve_cron_minutes("*/5 * * * 1-5").is_err());
        assert!(resolve_cron_minutes("garbage").is_err());
        assert!(resolve_cron_minutes("*/0 * * * *").is_err());
    }

    #[test]
    fn default_indexer_url_rejects_regtest() {
        assert!(default_indexer_url(Network::Regtest).is_err());
        assert!(default_indexer_url(Network::Bitcoin).is_ok());
    }
}
