//! Aave lending-market digest: reads reserve data for a fixed token set,
//! normalizes rates and liquidity, and formats a message for delivery.

pub mod cache;
pub mod config;
pub mod data_source;
pub mod error;
pub mod market_client;
pub mod registry;
pub mod report;
pub mod retry;
pub mod telegram;
pub mod types;
pub mod utils;
