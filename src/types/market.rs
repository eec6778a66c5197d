use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Market segment a symbol trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Futures,
}

impl MarketType {
    pub const ALL: [MarketType; 2] = [MarketType::Spot, MarketType::Futures];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Futures => "futures",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected market type string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid market type '{0}', expected 'spot' or 'futures'")]
pub struct InvalidMarketType(pub String);

impl FromStr for MarketType {
    type Err = InvalidMarketType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spot" => Ok(MarketType::Spot),
            "futures" => Ok(MarketType::Futures),
            other => Err(InvalidMarketType(other.to_string())),
        }
    }
}

/// A `(market type, canonical symbol)` pair.
///
/// Rendered as `"<marketType>:<canonicalSymbol>"`, which is also the key
/// used by progress maps and the scheduler's failure counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolKey {
    pub market_type: MarketType,
    pub symbol: String,
}

impl SymbolKey {
    pub fn new(market_type: MarketType, symbol: impl Into<String>) -> Self {
        Self {
            market_type,
            symbol: symbol.into(),
        }
    }

    /// Parse `"spot:BTCUSDT"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (market, symbol) = raw.split_once(':')?;
        if symbol.is_empty() {
            return None;
        }
        let market_type = market.parse().ok()?;
        Some(Self::new(market_type, symbol))
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.market_type, self.symbol)
    }
}
