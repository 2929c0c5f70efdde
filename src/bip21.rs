//! BIP21 URI formatting (spec §6, "Wire formats").
//!
//! `bitcoin:{address}?amount={btc8}[&label={pct}][&message={pct}]`, where
//! `btc8` is sats/10^8 formatted with exactly eight decimal places. Grounded
//! on the pack's BIP321/BIP21 formatter (`lexe-app-lexe-public`'s
//! `payment-uri-core`), simplified to the single-address, no-Lightning shape
//! this spec calls for.

use std::fmt;

/// A BIP21 payment URI (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bip21Uri {
    pub address: String,
    pub amount_sats: i64,
    pub label: Option<String>,
    pub message: Option<String>,
}

impl fmt::Display for Bip21Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bitcoin:{}?amount={}", self.address, format_btc8(self.amount_sats))?;
        if let Some(label) = &self.label {
            write!(f, "&label={}", percent_encode(label))?;
        }
        if let Some(message) = &self.message {
            write!(f, "&message={}", percent_encode(message))?;
        }
        Ok(())
    }
}

/// Formats a satoshi amount as a BTC decimal string with exactly eight
/// decimal places, e.g. `50000` sats -> `0.00050000`.
fn format_btc8(sats: i64) -> String {
    let negative = sats < 0;
    let sats_abs = sats.unsigned_abs();
    let whole = sats_abs / 100_000_000;
    let frac = sats_abs % 100_000_000;
    let sign = if negative { "-" } else { "" };
    format!("{sign}{whole}.{frac:08}")
}

/// Minimal percent-encoding for BIP21 `label`/`message` query values: encodes
/// everything outside of unreserved characters, matching the `pct` grammar
/// in spec §6.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-rolled check of the grammar in spec §8 property 8
    /// (`^bitcoin:[a-zA-Z0-9]+\?amount=\d+\.\d{8}(&(label|message)=.+)*$`)
    /// so the test doesn't need a regex dependency just for this.
    fn matches_bip21_grammar(s: &str) -> bool {
        let Some(rest) = s.strip_prefix("bitcoin:") else { return false };
        let Some((addr, query)) = rest.split_once('?') else { return false };
        if addr.is_empty() || !addr.chars().all(|c| c.is_ascii_alphanumeric()) {
            return false;
        }
        let mut parts = query.split('&');
        let Some(amount_part) = parts.next() else { return false };
        let Some(amount) = amount_part.strip_prefix("amount=") else { return false };
        let Some((whole, frac)) = amount.split_once('.') else { return false };
        if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        if frac.len() != 8 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        for part in parts {
            let Some((key, value)) = part.split_once('=') else { return false };
            if (key != "label" && key != "message") || value.is_empty() {
                return false;
            }
        }
        true
    }

    #[test]
    fn formats_exactly_eight_decimals() {
        let uri = Bip21Uri {
            address: "bc1qexampleaddress".to_string(),
            amount_sats: 50_000,
            label: None,
            message: None,
        };
        assert_eq!(uri.to_string(), "bitcoin:bc1qexampleaddress?amount=0.00050000");
    }

    #[test]
    fn includes_label_and_message_when_present() {
        let uri = Bip21Uri {
            address: "bc1qexampleaddress".to_string(),
            amount_sats: 1,
            label: Some("Order #42".to_string()),
            message: Some("thanks!".to_string()),
        };
        let s = uri.to_string();
        assert!(s.starts_with("bitcoin:bc1qexampleaddress?amount=0.00000001"));
        assert!(s.contains("&label=Order%20%2342"));
        assert!(s.contains("&message=thanks%21"));
    }

    #[test]
    fn matches_spec_grammar() {
        // spec §8 property 8.
        let uri = Bip21Uri {
            address: "bc1qexampleaddress".to_string(),
            amount_sats: 123_456_789,
            label: Some("m".to_string()),
            message: None,
        };
        assert!(matches_bip21_grammar(&uri.to_string()));
    }
}
