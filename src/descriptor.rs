//! Descriptor engine (spec §4.A).
//!
//! Parses a watch-only descriptor of the form
//! `<type>([<origin>]<xpub>/<path>)`, `type ∈ {tr, wpkh, sh, pkh}`, path
//! ending in `/*`, and derives `(address, scriptPubKey)` pairs for a given
//! index. Derivation is delegated entirely to `rust-miniscript`/`rust-bitcoin`
//! (spec §1, "the descriptor parser and BIP-32 key derivation ... consumed as
//! library functions").

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use bitcoin::{Address, Network, ScriptBuf};
use miniscript::descriptor::DescriptorPublicKey;
use miniscript::Descriptor;

use crate::error::{GatewayError, GatewayResult};

/// One of the four descriptor kinds spec §4.A names. Kept purely for
/// diagnostics; `miniscript::Descriptor` already enforces the grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Tr,
    Wpkh,
    Sh,
    Pkh,
}

impl DescriptorKind {
    fn detect(desc: &str) -> GatewayResult<Self> {
        let trimmed = desc.trim();
        let kind = if trimmed.starts_with("tr(") {
            DescriptorKind::Tr
        } else if trimmed.starts_with("wpkh(") {
            DescriptorKind::Wpkh
        } else if trimmed.starts_with("sh(") {
            DescriptorKind::Sh
        } else if trimmed.starts_with("pkh(") {
            DescriptorKind::Pkh
        } else {
            return Err(GatewayError::Fatal(format!(
                "UnsupportedDescriptor: unrecognized descriptor type in `{desc}`"
            )));
        };
        Ok(kind)
    }
}

/// A parsed, watch-only output descriptor ready for index-keyed derivation.
///
/// Instances are cheap to clone (an `Arc`-free clone of the underlying
/// `miniscript` descriptor plus a small memoization cache), so a
/// [`DescriptorEngine`] can be shared across the gateway context without
/// wrapping it in an `Arc` itself -- though callers typically do so anyway
/// since it is held by long-lived tasks.
pub struct DescriptorEngine {
    kind: DescriptorKind,
    descriptor: Descriptor<DescriptorPublicKey>,
    network: Network,
    fingerprint: u64,
    cache: Mutex<HashMap<u32, (Address, ScriptBuf)>>,
}

impl std::fmt::Debug for DescriptorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorEngine")
            .field("kind", &self.kind)
            .field("network", &self.network)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl DescriptorEngine {
    /// Parses `descriptor` for the given `network`. The descriptor's path
    /// must end in `/*` (external-chain, unhardened wildcard) -- spec §4.A,
    /// "the path ends in `/*`". Fails with `UnsupportedDescriptor` if the
    /// outer function isn't one of `tr/wpkh/sh/pkh`, or `InvalidXpub` if the
    /// key material fails to parse.
    pub fn parse(descriptor: &str, network: Network) -> GatewayResult<Self> {
        let kind = DescriptorKind::detect(descriptor)?;

        // Strip an optional `#checksum` suffix before checking the path
        // shape; the wildcard must end the derivation path (spec §4.A).
        let without_checksum = descriptor.split('#').next().unwrap_or(descriptor);
        if !without_checksum.trim_end().ends_with("/*)") {
            return Err(GatewayError::Fatal(format!(
                "UnsupportedDescriptor: path must end in /* in `{descriptor}`"
            )));
        }

        let descriptor_obj = Descriptor::<DescriptorPublicKey>::from_str(descriptor)
            .map_err(|e| GatewayError::Fatal(format!("InvalidXpub: {e}")))?;

        if !descriptor_obj.has_wildcard() {
            return Err(GatewayError::Fatal(format!(
                "UnsupportedDescriptor: descriptor has no derivation wildcard: `{descriptor}`"
            )));
        }

        let fingerprint = fnv1a64(descriptor);

        Ok(Self {
            kind,
            descriptor: descriptor_obj,
            network,
            fingerprint,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// The descriptor kind detected at parse time.
    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    /// A stable fingerprint of the descriptor string, used as the
    /// `descriptor_fingerprint` system-metadata value (spec §3,
    /// "SystemMetadata") to detect a changed descriptor across restarts.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Derives the `(address, scriptPubKey)` pair at `index`, memoized in
    /// process memory keyed by `(descriptorHash, index)` (spec §4.A, "The
    /// engine memoizes derivations in process memory").
    ///
    /// Derivation is deterministic: property 1 in spec §8 requires the same
    /// `(address, scriptPubKey)` across processes for the same
    /// `(descriptor, index)`, which holds here because `miniscript`'s
    /// derivation is a pure function of the descriptor and index.
    pub fn derive(&self, index: u32) -> GatewayResult<(Address, ScriptBuf)> {
        if let Some(hit) = self.cache.lock().unwrap().get(&index) {
            return Ok(hit.clone());
        }

        let derived = self
            .descriptor
            .at_derivation_index(index)
            .map_err(|e| GatewayError::Fatal(format!("InvalidXpub: derivation failed: {e}")))?;

        let script_pubkey = derived.script_pubkey();
        let address = derived
            .address(self.network)
            .map_err(|e| GatewayError::Fatal(format!("UnsupportedDescriptor: {e}")))?;

        let pair = (address, script_pubkey);
        self.cache.lock().unwrap().insert(index, pair.clone());
        Ok(pair)
    }
}

/// Small, dependency-free fingerprint (not cryptographic) used only to key
/// the in-process derivation cache and to detect a changed descriptor
/// across restarts -- not a security boundary, so FNV-1a is plenty.
fn fnv1a64(s: &str) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    s.bytes().fold(OFFSET, |hash, byte| (hash ^ byte as u64).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TPRV_DESC: &str = "wpkh(tpubD6NzVbkrYhZ4WZaiWHz59q5EQ61bd6dUYfU4ggRWAtNAyyYRNWT6ktJ7UHJEXURvTfTfskFQmK3HqKEX4DPnRV45aPofuRuu6s9QCbMQWB5/0/*)";

    #[test]
    fn derivation_is_deterministic() {
        let engine = DescriptorEngine::parse(TPRV_DESC, Network::Testnet).unwrap();
        let (addr1, spk1) = engine.derive(0).unwrap();
        let (addr2, spk2) = engine.derive(0).unwrap();
        assert_eq!(addr1, addr2);
        assert_eq!(spk1, spk2);

        // A second, independent engine for the same descriptor/index must
        // agree -- property 1 in spec §8 ("across processes").
        let engine2 = DescriptorEngine::parse(TPRV_DESC, Network::Testnet).unwrap();
        let (addr3, spk3) = engine2.derive(0).unwrap();
        assert_eq!(addr1, addr3);
        assert_eq!(spk1, spk3);
    }

    #[test]
    fn distinct_indices_derive_distinct_addresses() {
        let engine = DescriptorEngine::parse(TPRV_DESC, Network::Testnet).unwrap();
        let (addr0, _) = engine.derive(0).unwrap();
        let (addr1, _) = engine.derive(1).unwrap();
        assert_ne!(addr0, addr1);
    }

    #[test]
    fn rejects_unsupported_outer_function() {
        let bad = "multi(2,tpubD6NzVbkrYhZ4WZaiWHz59q5EQ61bd6dUYfU4ggRWAtNAyyYRNWT6ktJ7UHJEXURvTfTfskFQmK3HqKEX4DPnRV45aPofuRuu6s9QCbMQWB5/0/*)";
        let err = DescriptorEngine::parse(bad, Network::Testnet).unwrap_err();
        assert!(matches!(err, GatewayError::Fatal(_)));
    }

    #[test]
    fn rejects_malformed_key() {
        let bad = "wpkh(not-a-real-xpub/0/*)";
        let err = DescriptorEngine::parse(bad, Network::Testnet).unwrap_err();
        assert!(matches!(err, GatewayError::Fatal(_)));
    }
}
