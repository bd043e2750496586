use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A perp market the bot is allowed to quote.
///
/// The set is closed: every symbol carries its own quantity and price tick,
/// and anything outside the set is rejected at the config boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Symbol {
    BtcUsd,
    EthUsd,
    XauUsd,
    XagUsd,
}

pub const SUPPORTED: &[Symbol] = &[
    Symbol::BtcUsd,
    Symbol::EthUsd,
    Symbol::XauUsd,
    Symbol::XagUsd,
];

impl Symbol {
    /// Returns the usual string code, e.g "BTC-USD"
    pub fn code(&self) -> &'static str {
        match self {
            Symbol::BtcUsd => "BTC-USD",
            Symbol::EthUsd => "ETH-USD",
            Symbol::XauUsd => "XAU-USD",
            Symbol::XagUsd => "XAG-USD",
        }
    }

    /// Smallest order-quantity increment the exchange accepts.
    pub fn qty_tick(&self) -> Decimal {
        match self {
            Symbol::BtcUsd => Decimal::new(1, 3), // 0.001
            Symbol::EthUsd => Decimal::new(1, 2), // 0.01
            Symbol::XauUsd => Decimal::new(1, 2), // 0.01
            Symbol::XagUsd => Decimal::new(1, 1), // 0.1
        }
    }

    /// Smallest price increment the exchange accepts.
    pub fn price_tick(&self) -> Decimal {
        match self {
            Symbol::BtcUsd => Decimal::new(1, 1), // 0.1
            Symbol::EthUsd => Decimal::new(1, 2), // 0.01
            Symbol::XauUsd => Decimal::new(1, 2), // 0.01
            Symbol::XagUsd => Decimal::new(1, 3), // 0.001
        }
    }

    pub fn supported() -> &'static [Symbol] {
        SUPPORTED
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Symbol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SUPPORTED
            .iter()
            .copied()
            .find(|sym| sym.code() == s)
            .ok_or_else(|| format!("unsupported symbol `{s}`"))
    }
}

impl TryFrom<String> for Symbol {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Symbol> for String {
    fn from(s: Symbol) -> String {
        s.code().to_string()
    }
}
