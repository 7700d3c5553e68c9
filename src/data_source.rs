use std::time::Duration;

use async_trait::async_trait;
use ethabi::Token;
use tokio::time::{timeout, Instant};
use web3::contract::{Contract, Options};
use web3::error::TransportError;
use web3::transports::Http;
use web3::types::{Address, Bytes, CallRequest, U256};
use web3::Web3;

use crate::error::{DecodeError, MarketError, TransientKind};
use crate::registry::NetworkConfig;
use crate::retry::RetryPolicy;
use crate::types::{HealthStatus, RawMarketReading, TokenIdentifier};

const POOL_DATA_PROVIDER_ABI: &[u8] = include_bytes!("abi/pool_data_provider.json");

/// Read access to the lending protocol for one network.
#[async_trait]
pub trait ReserveReader: Send + Sync {
    /// One aggregated reserve read for `token`.
    async fn reserve_data(&self, token: &TokenIdentifier) -> Result<RawMarketReading, MarketError>;

    /// Cheapest liveness call available.
    async fn chain_id(&self) -> Result<u64, MarketError>;
}

/// `ReserveReader` backed by the Aave `PoolDataProvider` over JSON-RPC.
pub struct Web3ReserveReader {
    web3: Web3<Http>,
    data_provider_contract: Contract<Http>,
    request_timeout: Duration,
}

impl Web3ReserveReader {
    pub fn new(
        rpc_endpoint: &str,
        network: &NetworkConfig,
        request_timeout: Duration,
    ) -> Result<Self, MarketError> {
        let url = url::Url::parse(rpc_endpoint)
            .map_err(|e| DecodeError::Malformed(format!("invalid RPC url {rpc_endpoint}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| MarketError::transient(TransientKind::Connection, e.to_string()))?;
        let web3 = Web3::new(Http::with_client(client, url));

        let data_provider_contract =
            Contract::from_json(web3.eth(), network.data_provider, POOL_DATA_PROVIDER_ABI)
                .map_err(|e| DecodeError::Malformed(format!("PoolDataProvider ABI: {e}")))?;

        log::info!(
            "[Web3ReserveReader::new] {} data provider {:?}",
            network.network,
            network.data_provider
        );

        Ok(Self {
            web3,
            data_provider_contract,
            request_timeout,
        })
    }

    /// Manually call `getAllReservesTokens` via `eth_call` and decode `(string, address)[]`.
    pub async fn listed_reserves(&self) -> Result<Vec<(String, Address)>, MarketError> {
        let function = self
            .data_provider_contract
            .abi()
            .function("getAllReservesTokens")
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let encoded_data = function
            .encode_input(&[])
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let call_req = CallRequest {
            from: None,
            to: Some(self.data_provider_contract.address()),
            gas: None,
            gas_price: None,
            value: None,
            data: Some(Bytes(encoded_data)),
            transaction_type: None,
            access_list: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
        };

        let raw_bytes = timeout(self.request_timeout, self.web3.eth().call(call_req, None))
            .await
            .map_err(|_| elapsed("getAllReservesTokens"))?
            .map_err(classify_api_error)?;

        let tokens = function
            .decode_output(&raw_bytes.0)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        decode_reserve_list(tokens)
    }
}

#[async_trait]
impl ReserveReader for Web3ReserveReader {
    async fn reserve_data(&self, token: &TokenIdentifier) -> Result<RawMarketReading, MarketError> {
        #[allow(non_snake_case)]
        let (
            _unbacked,
            _accruedToTreasuryScaled,
            totalAToken,
            totalStableDebt,
            totalVariableDebt,
            liquidityRate,
            variableBorrowRate,
            _stableBorrowRate,
            _averageStableBorrowRate,
            _liquidityIndex,
            _variableBorrowIndex,
            lastUpdateTimestamp,
        ): (U256, U256, U256, U256, U256, U256, U256, U256, U256, U256, U256, u64) = timeout(
            self.request_timeout,
            self.data_provider_contract.query(
                "getReserveData",
                (token.address,),
                None,
                Options::default(),
                None,
            ),
        )
        .await
        .map_err(|_| elapsed("getReserveData"))?
        .map_err(classify_contract_error)?;

        log::debug!(
            "[Web3ReserveReader::reserve_data] {} => totalAToken={}, liquidityRate={}, variableBorrowRate={}, lastUpdateTimestamp={}",
            token.symbol, totalAToken, liquidityRate, variableBorrowRate, lastUpdateTimestamp
        );

        reading_from_reserve(
            totalAToken,
            totalStableDebt,
            totalVariableDebt,
            liquidityRate,
            variableBorrowRate,
        )
    }

    async fn chain_id(&self) -> Result<u64, MarketError> {
        let id = timeout(self.request_timeout, self.web3.eth().chain_id())
            .await
            .map_err(|_| elapsed("eth_chainId"))?
            .map_err(classify_api_error)?;
        if id > U256::from(u64::MAX) {
            return Err(DecodeError::OutOfRange { field: "chain id" }.into());
        }
        Ok(id.as_u64())
    }
}

fn elapsed(call: &str) -> MarketError {
    MarketError::transient(TransientKind::Timeout, format!("{call} timed out"))
}

fn u256_to_i128(field: &'static str, value: U256) -> Result<i128, DecodeError> {
    if value > U256::from(i128::MAX as u128) {
        return Err(DecodeError::OutOfRange { field });
    }
    Ok(value.as_u128() as i128)
}

/// Map the `getReserveData` fields onto a raw reading.
///
/// Available liquidity is aToken supply minus debt; it may come out negative,
/// which the rate codec rejects.
fn reading_from_reserve(
    total_a_token: U256,
    total_stable_debt: U256,
    total_variable_debt: U256,
    liquidity_rate: U256,
    variable_borrow_rate: U256,
) -> Result<RawMarketReading, MarketError> {
    let total_debt = total_stable_debt
        .checked_add(total_variable_debt)
        .ok_or(DecodeError::OutOfRange { field: "total debt" })?;
    let total_borrowed_raw = u256_to_i128("total debt", total_debt)?;
    let supplied = u256_to_i128("total aToken", total_a_token)?;

    Ok(RawMarketReading {
        supply_rate_raw: u256_to_i128("liquidity rate", liquidity_rate)?,
        borrow_rate_raw: u256_to_i128("variable borrow rate", variable_borrow_rate)?,
        total_liquidity_raw: supplied - total_borrowed_raw,
        total_borrowed_raw,
    })
}

fn decode_reserve_list(tokens: Vec<Token>) -> Result<Vec<(String, Address)>, MarketError> {
    let first_token = tokens
        .into_iter()
        .next()
        .ok_or_else(|| DecodeError::Malformed("no output tokens from getAllReservesTokens".into()))?;

    let items = match first_token {
        Token::Array(items) => items,
        other => {
            return Err(DecodeError::Malformed(format!("expected Token::Array, got {other:?}")).into())
        }
    };

    items
        .into_iter()
        .map(|item| match item {
            Token::Tuple(fields) => match fields.as_slice() {
                [Token::String(symbol), Token::Address(address)] => Ok((symbol.clone(), *address)),
                _ => Err(DecodeError::Malformed("tuple fields not (string, address)".into()).into()),
            },
            other => Err(DecodeError::Malformed(format!("expected tuple, got {other:?}")).into()),
        })
        .collect()
}

fn classify_contract_error(err: web3::contract::Error) -> MarketError {
    match err {
        web3::contract::Error::Api(api) => classify_api_error(api),
        other => DecodeError::Malformed(other.to_string()).into(),
    }
}

/// Sort RPC failures into retryable and terminal classes.
fn classify_api_error(err: web3::Error) -> MarketError {
    match err {
        web3::Error::Unreachable => MarketError::transient(TransientKind::Connection, "unreachable"),
        web3::Error::Io(e) => MarketError::transient(TransientKind::Connection, e.to_string()),
        web3::Error::Transport(TransportError::Code(code)) => match code {
            408 => MarketError::transient(TransientKind::Timeout, "HTTP 408"),
            429 => MarketError::transient(TransientKind::RateLimited, "HTTP 429"),
            500..=599 => MarketError::transient(TransientKind::Server(code), format!("HTTP {code}")),
            _ => MarketError::Rejected(format!("HTTP {code}")),
        },
        // The HTTP transport reports an unparseable JSON-RPC body as a message.
        web3::Error::Transport(TransportError::Message(msg))
            if msg.starts_with("failed to deserialize response") =>
        {
            DecodeError::Malformed(msg).into()
        }
        web3::Error::Transport(TransportError::Message(msg)) => {
            let kind = if msg.contains("timed out") || msg.contains("timeout") {
                TransientKind::Timeout
            } else {
                TransientKind::Connection
            };
            MarketError::transient(kind, msg)
        }
        // -32005: provider request limit, -32603: internal node error
        web3::Error::Rpc(rpc) => match rpc.code.code() {
            -32005 => MarketError::transient(TransientKind::RateLimited, rpc.message),
            -32603 => MarketError::transient(TransientKind::Server(500), rpc.message),
            _ => MarketError::Rejected(format!("rpc error {}: {}", rpc.code.code(), rpc.message)),
        },
        other => DecodeError::Malformed(other.to_string()).into(),
    }
}

/// Resilient per-token reads plus a fail-fast probe. Holds no cache.
pub struct MarketDataSource<R> {
    reader: R,
    retry: RetryPolicy,
    expected_chain_id: u64,
}

impl<R: ReserveReader> MarketDataSource<R> {
    pub fn new(reader: R, retry: RetryPolicy, expected_chain_id: u64) -> Self {
        Self {
            reader,
            retry,
            expected_chain_id,
        }
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub async fn read_token(&self, token: &TokenIdentifier) -> Result<RawMarketReading, MarketError> {
        let label = token.symbol.as_str();
        self.retry
            .execute(label, || self.reader.reserve_data(token))
            .await
    }

    /// Single `chain_id` call, no retry.
    pub async fn probe(&self) -> HealthStatus {
        let started = Instant::now();
        let result = self.reader.chain_id().await;
        let latency = started.elapsed();

        match result {
            Ok(id) if id == self.expected_chain_id => {
                log::debug!("[MarketDataSource::probe] chain {id} up in {latency:?}");
                HealthStatus::up(id, latency)
            }
            Ok(id) => {
                let err = MarketError::HealthCheckFailure(format!(
                    "connected to chain {id}, expected {}",
                    self.expected_chain_id
                ));
                log::error!("[MarketDataSource::probe] {err}");
                let mut status = HealthStatus::down(err, latency);
                status.chain_id = Some(id);
                status
            }
            Err(e) => {
                log::error!("[MarketDataSource::probe] {e}");
                HealthStatus::down(MarketError::HealthCheckFailure(e.to_string()), latency)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::registry::TokenSymbol;

    const RAY_PCT: i128 = 10_000_000_000_000_000_000_000_000; // 1% in ray

    fn weth() -> TokenIdentifier {
        TokenIdentifier {
            symbol: TokenSymbol::Eth,
            address: Address::repeat_byte(0x42),
            decimals: 18,
        }
    }

    fn reading() -> RawMarketReading {
        RawMarketReading {
            supply_rate_raw: 2 * RAY_PCT,
            borrow_rate_raw: 3 * RAY_PCT,
            total_liquidity_raw: 900,
            total_borrowed_raw: 100,
        }
    }

    #[test]
    fn reserve_fields_map_onto_reading() {
        let r = reading_from_reserve(
            U256::from(1_000u64),
            U256::from(40u64),
            U256::from(60u64),
            U256::from(5u64),
            U256::from(7u64),
        )
        .unwrap();
        assert_eq!(r.total_borrowed_raw, 100);
        assert_eq!(r.total_liquidity_raw, 900);
        assert_eq!(r.supply_rate_raw, 5);
        assert_eq!(r.borrow_rate_raw, 7);
    }

    #[test]
    fn oversized_words_are_out_of_range() {
        let err = reading_from_reserve(
            U256::MAX,
            U256::zero(),
            U256::zero(),
            U256::zero(),
            U256::zero(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MarketError::Decode(DecodeError::OutOfRange { field: "total aToken" })
        ));
    }

    #[test]
    fn transport_failures_are_classified() {
        assert!(classify_api_error(web3::Error::Transport(TransportError::Code(429))).is_transient());
        assert!(classify_api_error(web3::Error::Transport(TransportError::Code(502))).is_transient());
        assert!(classify_api_error(web3::Error::Unreachable).is_transient());
        assert!(classify_api_error(web3::Error::Transport(TransportError::Message(
            "operation timed out".into()
        )))
        .is_transient());
        assert!(!classify_api_error(web3::Error::Transport(TransportError::Code(404))).is_transient());
        assert!(!classify_api_error(web3::Error::Decoder("bad hex".into())).is_transient());
        assert!(matches!(
            classify_api_error(web3::Error::Transport(TransportError::Message(
                "failed to deserialize response: expected value at line 1 column 1".into()
            ))),
            MarketError::Decode(DecodeError::Malformed(_))
        ));
        assert!(!classify_contract_error(web3::contract::Error::InvalidOutputType("x".into()))
            .is_transient());
    }

    #[test]
    fn reserve_list_decodes_symbol_address_pairs() {
        let tokens = vec![Token::Array(vec![Token::Tuple(vec![
            Token::String("USDC".into()),
            Token::Address(Address::repeat_byte(1)),
        ])])];
        let list = decode_reserve_list(tokens).unwrap();
        assert_eq!(list, vec![("USDC".to_string(), Address::repeat_byte(1))]);

        assert!(decode_reserve_list(vec![Token::Bool(true)]).is_err());
        assert!(decode_reserve_list(vec![]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn read_token_retries_transient_failures() {
        let token = weth();
        let reader = ScriptedReader::new(Ok(8453)).script(
            &token,
            vec![
                fail(MarketError::transient(TransientKind::Timeout, "t")),
                fail(MarketError::transient(TransientKind::RateLimited, "429")),
                ok(reading()),
            ],
        );
        let source = MarketDataSource::new(reader, RetryPolicy::default(), 8453);

        assert_eq!(source.read_token(&token).await.unwrap(), reading());
        assert_eq!(source.reader().calls(&token), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn read_token_surfaces_decode_errors_immediately() {
        let token = weth();
        let reader = ScriptedReader::new(Ok(8453)).script(
            &token,
            vec![fail(DecodeError::Malformed("short output".into()).into())],
        );
        let source = MarketDataSource::new(reader, RetryPolicy::default(), 8453);

        assert!(matches!(
            source.read_token(&token).await,
            Err(MarketError::Decode(_))
        ));
        assert_eq!(source.reader().calls(&token), 1);
    }

    #[tokio::test]
    async fn probe_reports_chain_and_mismatch() {
        let healthy = MarketDataSource::new(ScriptedReader::new(Ok(8453)), RetryPolicy::default(), 8453)
            .probe()
            .await;
        assert!(healthy.healthy);
        assert_eq!(healthy.chain_id, Some(8453));

        let wrong = MarketDataSource::new(ScriptedReader::new(Ok(1)), RetryPolicy::default(), 8453)
            .probe()
            .await;
        assert!(!wrong.healthy);
        assert_eq!(wrong.chain_id, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_fails_fast_without_retry() {
        let source = MarketDataSource::new(
            ScriptedReader::new(Err(MarketError::transient(TransientKind::Connection, "refused"))),
            RetryPolicy::default(),
            8453,
        );
        let started = Instant::now();
        let down = source.probe().await;

        assert!(!down.healthy);
        assert!(matches!(down.error, Some(MarketError::HealthCheckFailure(_))));
        assert_eq!(source.reader().chain_calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
