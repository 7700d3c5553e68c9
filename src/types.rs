use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use web3::types::Address;

use crate::error::MarketError;
use crate::registry::{Network, TokenSymbol};

/// A reserve asset on one network. Identity is the contract address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenIdentifier {
    pub symbol: TokenSymbol,
    pub address: Address,
    pub decimals: u32,
}

impl PartialEq for TokenIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for TokenIdentifier {}

impl std::hash::Hash for TokenIdentifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for TokenIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.symbol, self.address)
    }
}

/// Raw fields of one `getReserveData` call, still in protocol encoding.
///
/// Rates are ray-scaled (1e27); amounts are scaled by the token decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMarketReading {
    pub supply_rate_raw: i128,
    pub borrow_rate_raw: i128,
    pub total_liquidity_raw: i128,
    pub total_borrowed_raw: i128,
}

/// Normalized market view for one token.
///
/// Percent fields are kept unrounded; rounding happens at display time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRecord {
    pub token: TokenIdentifier,
    pub supply_apy: Decimal,
    pub borrow_apy: Decimal,
    pub utilization: Decimal,
    pub available_liquidity: Decimal,
    pub fetched_at: DateTime<Utc>,
}

/// Per-token result of a batch, positioned at the caller's input index.
#[derive(Debug, Clone)]
pub enum TokenOutcome {
    Ready(MarketRecord),
    Unavailable {
        token: TokenIdentifier,
        error: MarketError,
    },
}

impl TokenOutcome {
    pub fn token(&self) -> &TokenIdentifier {
        match self {
            TokenOutcome::Ready(record) => &record.token,
            TokenOutcome::Unavailable { token, .. } => token,
        }
    }

    pub fn record(&self) -> Option<&MarketRecord> {
        match self {
            TokenOutcome::Ready(record) => Some(record),
            TokenOutcome::Unavailable { .. } => None,
        }
    }
}

/// Ordered outcome of one `fetch_all` call.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub network: Network,
    pub outcomes: Vec<TokenOutcome>,
    pub completed_at: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn get(&self, symbol: &str) -> Option<&TokenOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.token().symbol.as_str().eq_ignore_ascii_case(symbol))
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &MarketRecord> {
        self.outcomes.iter().filter_map(TokenOutcome::record)
    }

    pub fn failed(&self) -> impl Iterator<Item = (&TokenIdentifier, &MarketError)> {
        self.outcomes.iter().filter_map(|o| match o {
            TokenOutcome::Unavailable { token, error } => Some((token, error)),
            TokenOutcome::Ready(_) => None,
        })
    }

    /// Successful records with the highest supply APY first.
    pub fn top_supply_rates(&self, limit: usize) -> Vec<&MarketRecord> {
        let mut records: Vec<&MarketRecord> = self.succeeded().collect();
        records.sort_by(|a, b| b.supply_apy.cmp(&a.supply_apy));
        records.truncate(limit);
        records
    }
}

/// Result of a single liveness probe. Never cached.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub chain_id: Option<u64>,
    pub latency: Duration,
    pub error: Option<MarketError>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    pub fn up(chain_id: u64, latency: Duration) -> Self {
        Self {
            healthy: true,
            chain_id: Some(chain_id),
            latency,
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn down(error: MarketError, latency: Duration) -> Self {
        Self {
            healthy: false,
            chain_id: None,
            latency,
            error: Some(error),
            checked_at: Utc::now(),
        }
    }
}
