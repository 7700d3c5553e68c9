use thiserror::Error;

use crate::registry::TokenSymbol;

/// A raw protocol value that cannot be turned into a market figure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{field} is negative ({value})")]
    NegativeValue { field: &'static str, value: String },

    #[error("{field} does not fit the decimal working range")]
    OutOfRange { field: &'static str },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("unsupported token decimals: {0}")]
    UnsupportedDecimals(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    Connection,
    RateLimited,
    Server(u16),
}

impl std::fmt::Display for TransientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientKind::Timeout => f.write_str("request timed out"),
            TransientKind::Connection => f.write_str("connection failure"),
            TransientKind::RateLimited => f.write_str("rate limited"),
            TransientKind::Server(status) => write!(f, "server error (HTTP {status})"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum MarketError {
    #[error("transient network error: {kind}: {detail}")]
    TransientNetwork { kind: TransientKind, detail: String },

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<MarketError>,
    },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("response-time budget elapsed before the fetch completed")]
    DeadlineElapsed,

    #[error("no token could be fetched ({} failures)", failures.len())]
    BatchFailure {
        failures: Vec<(TokenSymbol, MarketError)>,
    },

    #[error("health check failed: {0}")]
    HealthCheckFailure(String),

    #[error("token {0} is not listed on this network")]
    UnknownToken(String),

    #[error("unsupported network: {0}")]
    UnknownNetwork(String),
}

impl MarketError {
    pub fn transient(kind: TransientKind, detail: impl Into<String>) -> Self {
        MarketError::TransientNetwork {
            kind,
            detail: detail.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, MarketError::TransientNetwork { .. })
    }
}

/// Top-level failure of a run, mapped to a process exit code in `main`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Market(#[from] MarketError),

    #[error("message delivery failed: {0}")]
    Delivery(String),
}

impl AppError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::Market(_) => 1,
            AppError::Delivery(_) => 3,
        }
    }
}
