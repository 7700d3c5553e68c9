use chrono::Utc;

use aave_market_digest::cache::TtlCache;
use aave_market_digest::config::Config;
use aave_market_digest::data_source::{MarketDataSource, Web3ReserveReader};
use aave_market_digest::error::{AppError, MarketError};
use aave_market_digest::market_client::MarketClient;
use aave_market_digest::registry::network_config;
use aave_market_digest::retry::RetryPolicy;
use aave_market_digest::report;
use aave_market_digest::telegram::TelegramClient;
use aave_market_digest::types::TokenIdentifier;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("[main] Starting up...");

    match run().await {
        Ok(()) => log::info!("[main] Run completed successfully"),
        Err(e) => {
            log::error!("[main] {e}");
            std::process::exit(e.exit_code());
        }
    }
}

async fn run() -> Result<(), AppError> {
    let config = Config::load()?;
    let retry = RetryPolicy::exponential(config.max_attempts, config.retry_base_delay).with_jitter();

    let telegram = TelegramClient::new(
        config.telegram_api_url.clone(),
        config.bot_token.clone(),
        config.chat_id.clone(),
        config.request_timeout,
        retry,
    )?;
    telegram.validate().await?;
    log::info!("[main] Configuration loaded for chat ID: {}", config.chat_id);

    if !config.aave_enabled {
        return telegram.send(&report::greeting(&config.greeting)).await;
    }

    let (message, outcome) = build_market_message(&config, retry).await?;
    telegram.send(&message).await?;
    outcome
}

/// Market message plus the batch verdict; the message is sent either way.
async fn build_market_message(
    config: &Config,
    retry: RetryPolicy,
) -> Result<(String, Result<(), AppError>), AppError> {
    let network = network_config(config.network).map_err(|e| AppError::Config(e.to_string()))?;
    let rpc_endpoint = config
        .rpc_endpoint
        .clone()
        .unwrap_or_else(|| network.default_rpc_url.to_string());
    let tokens = network.resolve_tokens(&config.target_tokens);

    let reader = Web3ReserveReader::new(&rpc_endpoint, &network, config.request_timeout)
        .map_err(|e| AppError::Config(e.to_string()))?;
    let client = MarketClient::new(
        network.network,
        MarketDataSource::new(reader, retry, network.chain_id),
        TtlCache::new(config.cache_ttl),
        config.response_budget,
    );

    let health = client.health_check().await;
    let snapshot = if health.healthy {
        log::info!("[main] Health check passed in {:?}", health.latency);
        warn_unlisted(&client, &tokens).await;
        client.fetch_all(&tokens).await
    } else {
        Err(health
            .error
            .clone()
            .unwrap_or_else(|| MarketError::HealthCheckFailure("unknown".into())))
    };

    let message = report::render(network.network, &snapshot, &health, Utc::now());
    let outcome = snapshot.map(|_| ()).map_err(AppError::from);
    Ok((message, outcome))
}

async fn warn_unlisted(client: &MarketClient<Web3ReserveReader>, tokens: &[TokenIdentifier]) {
    match client.source().reader().listed_reserves().await {
        Ok(listed) => {
            for token in tokens {
                if !listed.iter().any(|(_, address)| *address == token.address) {
                    log::warn!("[main] {} is not listed as a reserve on-chain", token.symbol);
                }
            }
        }
        Err(e) => log::debug!("[main] Could not list reserves: {e}"),
    }
}
