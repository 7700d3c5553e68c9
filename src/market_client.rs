use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::{timeout_at, Instant};

use crate::cache::TtlCache;
use crate::data_source::{MarketDataSource, ReserveReader};
use crate::error::MarketError;
use crate::registry::Network;
use crate::types::{HealthStatus, MarketRecord, MarketSnapshot, RawMarketReading, TokenIdentifier, TokenOutcome};
use crate::utils::{calculate_utilization, ray_to_percent, to_human_amount};

pub const DEFAULT_RESPONSE_BUDGET: Duration = Duration::from_secs(30);

/// Fetches normalized market records for a token list, one network at a time.
pub struct MarketClient<R> {
    network: Network,
    source: MarketDataSource<R>,
    cache: TtlCache<TokenIdentifier, MarketRecord>,
    response_budget: Duration,
}

impl<R: ReserveReader> MarketClient<R> {
    pub fn new(
        network: Network,
        source: MarketDataSource<R>,
        cache: TtlCache<TokenIdentifier, MarketRecord>,
        response_budget: Duration,
    ) -> Self {
        Self {
            network,
            source,
            cache,
            response_budget,
        }
    }

    pub fn source(&self) -> &MarketDataSource<R> {
        &self.source
    }

    pub fn cache(&self) -> &TtlCache<TokenIdentifier, MarketRecord> {
        &self.cache
    }

    /// Fetch every token concurrently and return outcomes in request order.
    ///
    /// Per-token failures stay in their slot. Tokens still in flight when the
    /// response budget runs out are reported as `DeadlineElapsed` and never
    /// reach the cache. Fails with `BatchFailure` only when nothing succeeded.
    pub async fn fetch_all(&self, tokens: &[TokenIdentifier]) -> Result<MarketSnapshot, MarketError> {
        log::info!(
            "[MarketClient::fetch_all] Fetching market data for {} tokens on {}",
            tokens.len(),
            self.network
        );

        let deadline = Instant::now() + self.response_budget;
        let mut slots: Vec<Option<Result<MarketRecord, MarketError>>> =
            tokens.iter().map(|_| None).collect();

        let mut pending: FuturesUnordered<_> = tokens
            .iter()
            .enumerate()
            .map(|(index, token)| async move { (index, self.fetch_token(token).await) })
            .collect();

        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some((index, result))) => slots[index] = Some(result),
                Ok(None) => break,
                Err(_) => {
                    log::warn!(
                        "[MarketClient::fetch_all] Response budget of {:?} elapsed with {} fetches in flight",
                        self.response_budget,
                        pending.len()
                    );
                    break;
                }
            }
        }
        drop(pending);

        let outcomes: Vec<TokenOutcome> = tokens
            .iter()
            .zip(slots)
            .map(|(token, slot)| match slot {
                Some(Ok(record)) => TokenOutcome::Ready(record),
                Some(Err(error)) => {
                    log::warn!("[MarketClient::fetch_all] Failed to fetch data for {}: {}", token.symbol, error);
                    TokenOutcome::Unavailable { token: *token, error }
                }
                None => TokenOutcome::Unavailable {
                    token: *token,
                    error: MarketError::DeadlineElapsed,
                },
            })
            .collect();

        let succeeded = outcomes.iter().filter(|o| o.record().is_some()).count();
        if succeeded == 0 {
            let failures = outcomes
                .into_iter()
                .filter_map(|o| match o {
                    TokenOutcome::Unavailable { token, error } => Some((token.symbol, error)),
                    TokenOutcome::Ready(_) => None,
                })
                .collect();
            return Err(MarketError::BatchFailure { failures });
        }

        if succeeded < outcomes.len() {
            log::warn!(
                "[MarketClient::fetch_all] Partial result: {}/{} tokens available",
                succeeded,
                outcomes.len()
            );
        } else {
            log::info!(
                "[MarketClient::fetch_all] Successfully fetched data for {} reserves on {}",
                succeeded,
                self.network
            );
        }

        Ok(MarketSnapshot {
            network: self.network,
            outcomes,
            completed_at: Utc::now(),
        })
    }

    /// Cache hit, or a fresh read decoded and stored under the token.
    pub async fn fetch_token(&self, token: &TokenIdentifier) -> Result<MarketRecord, MarketError> {
        if let Some(record) = self.cache.get(token).await {
            log::debug!("[MarketClient::fetch_token] Using cached data for {}", token.symbol);
            return Ok(record);
        }

        let raw = self.source.read_token(token).await?;
        let record = decode_record(token, &raw, Utc::now())?;
        self.cache.set(*token, record.clone(), None).await;

        log::debug!(
            "[MarketClient::fetch_token] {}: supply {}%, borrow {}%, utilization {}%",
            token.symbol,
            record.supply_apy.round_dp(4),
            record.borrow_apy.round_dp(4),
            record.utilization.round_dp(2)
        );
        Ok(record)
    }

    pub async fn health_check(&self) -> HealthStatus {
        self.source.probe().await
    }
}

fn decode_record(
    token: &TokenIdentifier,
    raw: &RawMarketReading,
    fetched_at: DateTime<Utc>,
) -> Result<MarketRecord, MarketError> {
    let available_liquidity = to_human_amount(raw.total_liquidity_raw, token.decimals)?;
    let total_borrowed = to_human_amount(raw.total_borrowed_raw, token.decimals)?;

    Ok(MarketRecord {
        token: *token,
        supply_apy: ray_to_percent(raw.supply_rate_raw)?,
        borrow_apy: ray_to_percent(raw.borrow_rate_raw)?,
        utilization: calculate_utilization(total_borrowed, available_liquidity),
        available_liquidity,
        fetched_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_TTL;
    use crate::data_source::testing::{fail, ok, ScriptedReader, Step};
    use crate::error::{DecodeError, TransientKind};
    use crate::registry::TokenSymbol;
    use crate::retry::RetryPolicy;
    use crate::utils::round_percent;
    use rust_decimal_macros::dec;
    use web3::types::Address;

    const E18: i128 = 1_000_000_000_000_000_000;

    fn token(symbol: TokenSymbol, byte: u8) -> TokenIdentifier {
        TokenIdentifier {
            symbol,
            address: Address::repeat_byte(byte),
            decimals: 18,
        }
    }

    fn eth() -> TokenIdentifier {
        token(TokenSymbol::Eth, 1)
    }

    fn usdc() -> TokenIdentifier {
        token(TokenSymbol::Usdc, 2)
    }

    fn dai() -> TokenIdentifier {
        token(TokenSymbol::Dai, 3)
    }

    fn reading() -> RawMarketReading {
        RawMarketReading {
            supply_rate_raw: 17_800_000_000_000_000_000_000_000,
            borrow_rate_raw: 25_000_000_000_000_000_000_000_000,
            total_liquidity_raw: 15_077 * E18,
            total_borrowed_raw: 15_077 * E18 * 835 / 165,
        }
    }

    fn delayed(ms: u64) -> Step {
        Step {
            delay: Duration::from_millis(ms),
            result: Ok(reading()),
        }
    }

    fn timeout_err() -> MarketError {
        MarketError::transient(TransientKind::Timeout, "timed out")
    }

    fn client(reader: ScriptedReader) -> MarketClient<ScriptedReader> {
        MarketClient::new(
            Network::Base,
            MarketDataSource::new(reader, RetryPolicy::default(), 8453),
            TtlCache::new(DEFAULT_TTL),
            DEFAULT_RESPONSE_BUDGET,
        )
    }

    fn symbols(snapshot: &MarketSnapshot) -> Vec<TokenSymbol> {
        snapshot.outcomes.iter().map(|o| o.token().symbol).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn decodes_reserve_scenario() {
        let client = client(ScriptedReader::new(Ok(8453)).script(&eth(), vec![ok(reading())]));
        let record = client.fetch_token(&eth()).await.unwrap();

        assert_eq!(round_percent(record.supply_apy), dec!(1.78));
        assert_eq!(round_percent(record.borrow_apy), dec!(2.50));
        assert_eq!(record.available_liquidity, dec!(15077));
        assert_eq!(round_percent(record.utilization), dec!(83.5));
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_request_order_regardless_of_completion() {
        let reader = ScriptedReader::new(Ok(8453))
            .script(&eth(), vec![delayed(300)])
            .script(&usdc(), vec![delayed(10)])
            .script(&dai(), vec![delayed(200)]);
        let client = client(reader);

        let snapshot = client.fetch_all(&[eth(), usdc(), dai()]).await.unwrap();
        assert_eq!(
            symbols(&snapshot),
            vec![TokenSymbol::Eth, TokenSymbol::Usdc, TokenSymbol::Dai]
        );
        assert_eq!(snapshot.succeeded().count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_run_concurrently() {
        let reader = ScriptedReader::new(Ok(8453))
            .script(&eth(), vec![delayed(1_000)])
            .script(&usdc(), vec![delayed(1_000)]);
        let client = client(reader);

        let started = Instant::now();
        client.fetch_all(&[eth(), usdc()]).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_reuses_record_verbatim() {
        let client = client(ScriptedReader::new(Ok(8453)).script(&eth(), vec![ok(reading())]));

        let first = client.fetch_all(&[eth()]).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        let second = client.fetch_all(&[eth()]).await.unwrap();

        assert_eq!(client.source().reader().calls(&eth()), 1);
        assert_eq!(
            first.outcomes[0].record().unwrap().fetched_at,
            second.outcomes[0].record().unwrap().fetched_at
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_refetched() {
        let client = client(ScriptedReader::new(Ok(8453)).script(&eth(), vec![ok(reading())]));

        client.fetch_all(&[eth()]).await.unwrap();
        tokio::time::advance(DEFAULT_TTL + Duration::from_secs(1)).await;
        client.fetch_all(&[eth()]).await.unwrap();

        assert_eq!(client.source().reader().calls(&eth()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_marks_only_the_failed_token() {
        let reader = ScriptedReader::new(Ok(8453))
            .script(&eth(), vec![ok(reading())])
            .script(&usdc(), vec![fail(timeout_err())]);
        let client = client(reader);

        let snapshot = client.fetch_all(&[eth(), usdc()]).await.unwrap();
        assert!(snapshot.outcomes[0].record().is_some());
        match &snapshot.outcomes[1] {
            TokenOutcome::Unavailable { token, error } => {
                assert_eq!(token.symbol, TokenSymbol::Usdc);
                assert!(matches!(error, MarketError::RetryExhausted { attempts: 3, .. }));
            }
            other => panic!("expected failure marker, got {other:?}"),
        }
        assert_eq!(client.source().reader().calls(&usdc()), 3);
        assert!(client.cache().get(&usdc()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn total_failure_is_a_batch_failure() {
        let reader = ScriptedReader::new(Ok(8453))
            .script(&eth(), vec![fail(timeout_err())])
            .script(&usdc(), vec![fail(timeout_err())]);
        let client = client(reader);

        match client.fetch_all(&[eth(), usdc()]).await {
            Err(MarketError::BatchFailure { failures }) => {
                let failed: Vec<_> = failures.iter().map(|(s, _)| *s).collect();
                assert_eq!(failed, vec![TokenSymbol::Eth, TokenSymbol::Usdc]);
            }
            other => panic!("expected BatchFailure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn negative_liquidity_is_a_terminal_decode_error() {
        let broken = RawMarketReading {
            total_liquidity_raw: -5,
            ..reading()
        };
        let reader = ScriptedReader::new(Ok(8453))
            .script(&eth(), vec![ok(reading())])
            .script(&dai(), vec![ok(broken)]);
        let client = client(reader);

        let snapshot = client.fetch_all(&[eth(), dai()]).await.unwrap();
        assert!(matches!(
            snapshot.outcomes[1],
            TokenOutcome::Unavailable {
                error: MarketError::Decode(DecodeError::NegativeValue { .. }),
                ..
            }
        ));
        assert_eq!(client.source().reader().calls(&dai()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_returns_partial_result_and_skips_cache() {
        let reader = ScriptedReader::new(Ok(8453))
            .script(&eth(), vec![delayed(50)])
            .script(&usdc(), vec![delayed(120_000)]);
        let client = client(reader);

        let started = Instant::now();
        let snapshot = client.fetch_all(&[eth(), usdc()]).await.unwrap();

        assert_eq!(started.elapsed(), DEFAULT_RESPONSE_BUDGET);
        assert!(snapshot.outcomes[0].record().is_some());
        assert!(matches!(
            snapshot.outcomes[1],
            TokenOutcome::Unavailable {
                error: MarketError::DeadlineElapsed,
                ..
            }
        ));
        assert!(client.cache().get(&usdc()).await.is_none());
        assert!(client.cache().get(&eth()).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_request_is_a_batch_failure() {
        let client = client(ScriptedReader::new(Ok(8453)));
        assert!(matches!(
            client.fetch_all(&[]).await,
            Err(MarketError::BatchFailure { failures }) if failures.is_empty()
        ));
    }

    #[tokio::test]
    async fn health_check_delegates_to_probe() {
        let up = client(ScriptedReader::new(Ok(8453))).health_check().await;
        assert!(up.healthy);

        let down = client(ScriptedReader::new(Err(timeout_err()))).health_check().await;
        assert!(!down.healthy);
    }
}
