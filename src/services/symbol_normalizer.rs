//! Mapping between exchange-native symbols and canonical storage keys.

use crate::types::MarketType;

/// Quote assets recognised when splitting a canonical symbol, in match order.
pub const COMMON_QUOTES: &[&str] = &["USDT", "USDC", "BUSD", "BTC", "ETH", "BNB"];

const SEPARATORS: &[char] = &['/', '-', '_'];

/// Stateless symbol conversions.
pub struct SymbolNormalizer;

impl SymbolNormalizer {
    /// `BTC/USDT:USDT` -> `BTCUSDT`.
    pub fn normalize(symbol: &str) -> String {
        let base_pair = symbol.split(':').next().unwrap_or_default();
        base_pair
            .chars()
            .filter(|c| !SEPARATORS.contains(c) && !c.is_whitespace())
            .collect::<String>()
            .to_uppercase()
    }

    pub fn normalize_all<S: AsRef<str>>(symbols: &[S]) -> Vec<String> {
        symbols.iter().map(|s| Self::normalize(s.as_ref())).collect()
    }

    /// `BTCUSDT` -> `BTC/USDT` (spot) or `BTC/USDT:USDT` (futures).
    ///
    /// Known quotes are tried first. Unknown quotes fall back to treating the
    /// last four characters as the quote, which misparses three-letter quotes
    /// such as `EUR`; symbols shorter than six characters are returned as-is.
    pub fn denormalize(symbol: &str, market_type: MarketType) -> String {
        let canonical = Self::normalize(symbol);

        for quote in COMMON_QUOTES {
            if let Some(base) = canonical.strip_suffix(quote) {
                if !base.is_empty() {
                    return Self::join(base, quote, market_type);
                }
            }
        }

        if canonical.len() >= 6 && canonical.is_ascii() {
            for quote_len in [4usize, 3] {
                if canonical.len() > quote_len {
                    let (base, quote) = canonical.split_at(canonical.len() - quote_len);
                    return Self::join(base, quote, market_type);
                }
            }
        }

        canonical
    }

    fn join(base: &str, quote: &str, market_type: MarketType) -> String {
        match market_type {
            MarketType::Spot => format!("{}/{}", base, quote),
            MarketType::Futures => format!("{}/{}:{}", base, quote, quote),
        }
    }
}
