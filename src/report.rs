//! Telegram message layout for a market snapshot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::MarketError;
use crate::registry::Network;
use crate::types::{HealthStatus, MarketRecord, MarketSnapshot, TokenOutcome};
use crate::utils::{round_display, round_percent};

const MARKETS_LINK: &str = "https://app.aave.com/?marketName=proto_base_v3";

fn percent(value: Decimal, dp: u32) -> String {
    if value > Decimal::ZERO {
        format!("{:.*}%", dp as usize, round_display(value, dp))
    } else {
        "N/A".to_string()
    }
}

/// Whole units with thousands separators above 1000, two decimals below.
fn liquidity(value: Decimal) -> String {
    if value > Decimal::ONE_THOUSAND {
        let whole = round_display(value, 0).to_string();
        let digits: Vec<char> = whole.chars().collect();
        let mut out = String::with_capacity(digits.len() + digits.len() / 3);
        for (i, c) in digits.iter().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                out.push(',');
            }
            out.push(*c);
        }
        out
    } else if value > Decimal::ZERO {
        format!("{:.2}", round_display(value, 2))
    } else {
        "N/A".to_string()
    }
}

fn push_card(parts: &mut Vec<String>, record: &MarketRecord) {
    parts.push(format!("💰 **{}**", record.token.symbol));
    parts.push(format!("├ 📈 Supply: `{}`", percent(round_percent(record.supply_apy), 2)));
    parts.push(format!("├ 📉 Borrow: `{}`", percent(round_percent(record.borrow_apy), 2)));
    parts.push(format!("├ 📊 Utilization: `{}`", percent(record.utilization, 1)));
    parts.push(format!("└ 💧 Liquidity: `{}`", liquidity(record.available_liquidity)));
    parts.push(String::new());
}

/// Backslash-escape the entity markers of Telegram's legacy Markdown.
fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn degraded(network: Network, reason: &str) -> String {
    format!(
        "⚠️ **AAVE {} Market**\n\nMarket data is temporarily unavailable ({}).\nPlease check again later.",
        network.display_name(),
        escape_markdown(reason)
    )
}

/// Build the market section.
///
/// A failed health check or a batch with no usable token renders a degraded
/// notice instead of cards; per-token failures render as `unavailable`.
pub fn render(
    network: Network,
    snapshot: &Result<MarketSnapshot, MarketError>,
    health: &HealthStatus,
    now: DateTime<Utc>,
) -> String {
    if !health.healthy {
        let reason = health
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "health check failed".to_string());
        return degraded(network, &reason);
    }

    let snapshot = match snapshot {
        Ok(snapshot) => snapshot,
        Err(e) => return degraded(network, &e.to_string()),
    };

    let mut parts = vec![
        format!("🏦 **AAVE {} Market**", network.display_name()),
        String::new(),
    ];

    for outcome in &snapshot.outcomes {
        match outcome {
            TokenOutcome::Ready(record) => push_card(&mut parts, record),
            TokenOutcome::Unavailable { token, .. } => {
                parts.push(format!("💰 **{}**", token.symbol));
                parts.push("└ ❌ Data unavailable".to_string());
                parts.push(String::new());
            }
        }
    }

    if network == Network::Base {
        parts.push("🔗 **View Full Markets**".to_string());
        parts.push(format!("👉 [AAVE Base Markets]({MARKETS_LINK})"));
        parts.push(String::new());
    }
    parts.push(format!("⏰ Updated: {}", now.format("%H:%M UTC")));

    parts.join("\n")
}

/// Message used when the market section is switched off.
pub fn greeting(message: &str) -> String {
    format!("👋 {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransientKind;
    use crate::registry::TokenSymbol;
    use crate::types::TokenIdentifier;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use web3::types::Address;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 9, 5, 0).unwrap()
    }

    fn eth_record() -> MarketRecord {
        MarketRecord {
            token: TokenIdentifier {
                symbol: TokenSymbol::Eth,
                address: Address::repeat_byte(1),
                decimals: 18,
            },
            supply_apy: dec!(1.7849),
            borrow_apy: dec!(2.5),
            utilization: dec!(83.49999),
            available_liquidity: dec!(15077.4),
            fetched_at: now(),
        }
    }

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            network: Network::Base,
            outcomes: vec![
                TokenOutcome::Ready(eth_record()),
                TokenOutcome::Unavailable {
                    token: TokenIdentifier {
                        symbol: TokenSymbol::Usdc,
                        address: Address::repeat_byte(2),
                        decimals: 6,
                    },
                    error: MarketError::DeadlineElapsed,
                },
            ],
            completed_at: now(),
        }
    }

    #[test]
    fn renders_cards_and_unavailable_markers() {
        let health = HealthStatus::up(8453, Duration::from_millis(80));
        let text = render(Network::Base, &Ok(snapshot()), &health, now());

        assert!(text.starts_with("🏦 **AAVE Base Market**"));
        assert!(text.contains("Supply: `1.78%`"));
        assert!(text.contains("Borrow: `2.50%`"));
        assert!(text.contains("Utilization: `83.5%`"));
        assert!(text.contains("Liquidity: `15,077`"));
        assert!(text.contains("💰 **USDC**\n└ ❌ Data unavailable"));
        assert!(text.ends_with("⏰ Updated: 09:05 UTC"));
    }

    #[test]
    fn failed_health_check_renders_degraded_notice() {
        let health = HealthStatus::down(
            MarketError::HealthCheckFailure("connection refused".into()),
            Duration::from_millis(5),
        );
        let text = render(Network::Base, &Ok(snapshot()), &health, now());
        assert!(text.contains("temporarily unavailable"));
        assert!(text.contains("connection refused"));
        assert!(!text.contains("Supply"));
    }

    #[test]
    fn batch_failure_renders_degraded_notice() {
        let health = HealthStatus::up(1, Duration::ZERO);
        let failure = Err(MarketError::BatchFailure {
            failures: vec![(
                TokenSymbol::Eth,
                MarketError::transient(TransientKind::Timeout, "t"),
            )],
        });
        let text = render(Network::Ethereum, &failure, &health, now());
        assert!(text.starts_with("⚠️ **AAVE Ethereum Market**"));
    }

    #[test]
    fn error_text_is_escaped_for_markdown() {
        let health = HealthStatus::down(
            MarketError::HealthCheckFailure("eth_chainId timed out [*rpc*]".into()),
            Duration::from_millis(5),
        );
        let text = render(Network::Base, &Ok(snapshot()), &health, now());
        assert!(text.contains(r"eth\_chainId timed out \[\*rpc\*]"));
        let bare = text.replace(r"\_", "");
        assert!(!bare.contains('_'));
    }

    #[test]
    fn small_and_empty_values() {
        assert_eq!(liquidity(dec!(12.345)), "12.35");
        assert_eq!(liquidity(dec!(0)), "N/A");
        assert_eq!(liquidity(dec!(1234567.8)), "1,234,568");
        assert_eq!(percent(dec!(0), 2), "N/A");
        assert_eq!(percent(dec!(0.125), 2), "0.13%");
        assert_eq!(greeting("gm"), "👋 gm");
    }
}
