//! Symbol normalization.
//!
//! Canonical crypto form is `BASE/QUOTE` (slash mandatory at ingress).
//! Venue wire forms:
//!
//! | Venue | Form | Example |
//! |---|---|---|
//! | Binance / Bybit | `BASEQUOTE` | `BTCUSDT` |
//! | Upbit | `QUOTE-BASE` | `USDT-BTC`, `KRW-BTC` |
//! | Bithumb | `BASE_QUOTE` | `BTC_KRW` |
//!
//! Securities symbols pass through with permissive validation only.

use crate::core_types::ExchangeId;

/// A canonical crypto pair split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    /// Canonical `BASE/QUOTE` form.
    pub fn canonical(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

/// Quote assets recognized when decoding concatenated venue symbols.
/// Longest match wins, so USDT is tried before USD-like prefixes.
const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "FDUSD", "KRW", "BTC", "ETH", "USD"];

/// Parse a canonical `BASE/QUOTE` crypto symbol.
pub fn parse_pair(raw: &str) -> Option<Pair> {
    let (base, quote) = raw.split_once('/')?;
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    let ok = |s: &str| {
        s.len() <= 20
            && s.chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    };
    if !ok(base) || !ok(quote) {
        return None;
    }
    Some(Pair {
        base: base.to_string(),
        quote: quote.to_string(),
    })
}

/// Permissive securities check: `^[A-Z0-9._-]{1,30}$`, at least one
/// alphanumeric, and not crypto-shaped.
pub fn is_valid_security(raw: &str) -> bool {
    if raw.is_empty() || raw.len() > 30 || raw.contains('/') {
        return false;
    }
    let charset_ok = raw
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    charset_ok && raw.chars().any(|c| c.is_ascii_alphanumeric())
}

/// Webhook-layer syntactic check. Crypto requires the slash form; anything
/// else is validated as a security. The registry remains authoritative.
pub fn symbol_ok(raw: &str) -> bool {
    if raw.contains('/') {
        parse_pair(raw).is_some()
    } else {
        is_valid_security(raw)
    }
}

/// Encode a canonical symbol into the venue's wire form.
/// Securities (no slash) pass through unchanged.
pub fn encode(exchange: ExchangeId, canonical: &str) -> String {
    let Some(pair) = parse_pair(canonical) else {
        return canonical.to_string();
    };
    match exchange {
        ExchangeId::Binance | ExchangeId::Bybit => format!("{}{}", pair.base, pair.quote),
        ExchangeId::Upbit => format!("{}-{}", pair.quote, pair.base),
        ExchangeId::Bithumb => format!("{}_{}", pair.base, pair.quote),
    }
}

/// Decode a venue wire symbol back into canonical `BASE/QUOTE` form.
/// Returns the input unchanged when it cannot be decoded (securities).
pub fn decode(exchange: ExchangeId, native: &str) -> String {
    match exchange {
        ExchangeId::Binance | ExchangeId::Bybit => {
            for quote in KNOWN_QUOTES {
                if let Some(base) = native.strip_suffix(quote) {
                    if !base.is_empty() {
                        return format!("{}/{}", base, quote);
                    }
                }
            }
            native.to_string()
        }
        ExchangeId::Upbit => match native.split_once('-') {
            Some((quote, base)) if !quote.is_empty() && !base.is_empty() => {
                format!("{}/{}", base, quote)
            }
            _ => native.to_string(),
        },
        ExchangeId::Bithumb => match native.split_once('_') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() => {
                format!("{}/{}", base, quote)
            }
            _ => native.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        let pair = parse_pair("BTC/USDT").unwrap();
        assert_eq!(pair.base, "BTC");
        assert_eq!(pair.quote, "USDT");
        assert_eq!(pair.canonical(), "BTC/USDT");

        assert!(parse_pair("BTCUSDT").is_none());
        assert!(parse_pair("/USDT").is_none());
        assert!(parse_pair("BTC/").is_none());
        assert!(parse_pair("btc/usdt").is_none());
        assert!(parse_pair("BTC/USDT/X").is_none());
    }

    #[test]
    fn test_encode_per_venue() {
        assert_eq!(encode(ExchangeId::Binance, "BTC/USDT"), "BTCUSDT");
        assert_eq!(encode(ExchangeId::Bybit, "ETH/USDT"), "ETHUSDT");
        assert_eq!(encode(ExchangeId::Upbit, "BTC/KRW"), "KRW-BTC");
        assert_eq!(encode(ExchangeId::Bithumb, "BTC/KRW"), "BTC_KRW");
    }

    #[test]
    fn test_decode_per_venue() {
        assert_eq!(decode(ExchangeId::Binance, "BTCUSDT"), "BTC/USDT");
        assert_eq!(decode(ExchangeId::Bybit, "SOLUSDC"), "SOL/USDC");
        assert_eq!(decode(ExchangeId::Upbit, "KRW-BTC"), "BTC/KRW");
        assert_eq!(decode(ExchangeId::Bithumb, "ETH_KRW"), "ETH/KRW");
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        for ex in [
            ExchangeId::Binance,
            ExchangeId::Bybit,
            ExchangeId::Upbit,
            ExchangeId::Bithumb,
        ] {
            let canonical = if ex.is_domestic() { "BTC/KRW" } else { "BTC/USDT" };
            assert_eq!(decode(ex, &encode(ex, canonical)), canonical);
        }
    }

    #[test]
    fn test_securities_pass_through() {
        assert_eq!(encode(ExchangeId::Binance, "AAPL"), "AAPL");
        assert!(is_valid_security("AAPL"));
        assert!(is_valid_security("BRK.B"));
        assert!(is_valid_security("005930-KS"));
        assert!(!is_valid_security(""));
        assert!(!is_valid_security("..."));
        assert!(!is_valid_security("aapl"));
        assert!(!is_valid_security(&"A".repeat(31)));
    }

    #[test]
    fn test_symbol_ok() {
        assert!(symbol_ok("BTC/USDT"));
        assert!(symbol_ok("AAPL"));
        assert!(!symbol_ok("BTC/"));
        assert!(!symbol_ok("btc/usdt"));
        assert!(!symbol_ok("___"));
    }
}
