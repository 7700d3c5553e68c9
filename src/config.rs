use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::DEFAULT_TTL;
use crate::error::AppError;
use crate::market_client::DEFAULT_RESPONSE_BUDGET;
use crate::registry::Network;
use crate::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub chat_id: String,
    pub telegram_api_url: String,
    pub greeting: String,

    pub aave_enabled: bool,
    pub network: Network,
    pub rpc_endpoint: Option<String>,
    pub target_tokens: Vec<String>,

    pub cache_ttl: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
    pub response_budget: Duration,
}

/// Shape of `config.yaml`; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    bot_token: Option<String>,
    chat_id: Option<String>,
    telegram_api_url: Option<String>,
    message: Option<String>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    request_timeout: Option<u64>,
    response_budget_secs: Option<u64>,
    cache_ttl_secs: Option<u64>,
    aave: Option<FileAaveConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileAaveConfig {
    enabled: Option<bool>,
    network: Option<String>,
    rpc_url: Option<String>,
    target_tokens: Option<Vec<String>>,
}

impl Config {
    /// YAML file (path from `AAVE_DIGEST_CONFIG` or `config.yaml`), then `.env`
    /// and process environment on top.
    pub fn load() -> Result<Self, AppError> {
        dotenv::dotenv().ok();
        let path = env::var("AAVE_DIGEST_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let file = read_file_config(Path::new(&path))?;
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_sources(file, &vars)
    }

    fn from_sources(file: FileConfig, vars: &HashMap<String, String>) -> Result<Self, AppError> {
        let var = |key: &str| vars.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let aave = file.aave.unwrap_or_default();

        let bot_token = var("TELEGRAM_BOT_TOKEN")
            .or(non_empty(file.bot_token))
            .ok_or_else(|| AppError::Config("TELEGRAM_BOT_TOKEN is required".into()))?;
        let chat_id = var("TELEGRAM_CHAT_ID")
            .or(non_empty(file.chat_id))
            .ok_or_else(|| AppError::Config("TELEGRAM_CHAT_ID is required".into()))?;
        let telegram_api_url = var("TELEGRAM_API_URL")
            .or(non_empty(file.telegram_api_url))
            .unwrap_or_else(|| DEFAULT_TELEGRAM_API.to_string());

        let network = match var("AAVE_NETWORK").or(non_empty(aave.network)) {
            Some(raw) => Network::from_str(&raw).map_err(|e| AppError::Config(e.to_string()))?,
            None => Network::Base,
        };

        let rpc_endpoint = var("AAVE_RPC_URL").or(non_empty(aave.rpc_url));
        if let Some(endpoint) = &rpc_endpoint {
            url::Url::parse(endpoint)
                .map_err(|e| AppError::Config(format!("Invalid AAVE_RPC_URL {endpoint}: {e}")))?;
        }

        let target_tokens = match var("AAVE_TOKENS") {
            Some(raw) => parse_csv(&raw),
            None => aave
                .target_tokens
                .unwrap_or_else(|| vec!["ETH".into(), "USDC".into(), "cbBTC".into()]),
        };

        let aave_enabled = match var("AAVE_ENABLED") {
            Some(raw) => parse_bool(&raw),
            None => aave.enabled.unwrap_or(true),
        };

        let max_attempts = parse_num(var("MAX_RETRIES"), "MAX_RETRIES")?
            .or(file.max_retries)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(AppError::Config("MAX_RETRIES must be at least 1".into()));
        }

        let retry_base_delay = parse_num(var("RETRY_BASE_DELAY_MS"), "RETRY_BASE_DELAY_MS")?
            .or(file.retry_base_delay_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BASE_DELAY);
        let request_timeout = parse_num(var("REQUEST_TIMEOUT"), "REQUEST_TIMEOUT")?
            .or(file.request_timeout)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let cache_ttl = parse_num(var("CACHE_TTL_SECS"), "CACHE_TTL_SECS")?
            .or(file.cache_ttl_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TTL);
        let response_budget = parse_num(var("RESPONSE_BUDGET_SECS"), "RESPONSE_BUDGET_SECS")?
            .or(file.response_budget_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RESPONSE_BUDGET);
        if response_budget.is_zero() {
            return Err(AppError::Config("RESPONSE_BUDGET_SECS must be positive".into()));
        }

        Ok(Self {
            bot_token,
            chat_id,
            telegram_api_url,
            greeting: file.message.unwrap_or_else(|| "Hello World!".to_string()),
            aave_enabled,
            network,
            rpc_endpoint,
            target_tokens,
            cache_ttl,
            max_attempts,
            retry_base_delay,
            request_timeout,
            response_budget,
        })
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, AppError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let parsed: Option<FileConfig> = serde_yaml::from_str(&raw)
                .map_err(|e| AppError::Config(format!("Error parsing {}: {e}", path.display())))?;
            log::info!("[Config::load] YAML configuration loaded from {}", path.display());
            Ok(parsed.unwrap_or_default())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("[Config::load] Configuration file {} not found", path.display());
            Ok(FileConfig::default())
        }
        Err(e) => Err(AppError::Config(format!("Cannot read {}: {e}", path.display()))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on")
}

fn parse_num<T: FromStr>(raw: Option<String>, key: &str) -> Result<Option<T>, AppError> {
    raw.map(|v| {
        v.parse::<T>()
            .map_err(|_| AppError::Config(format!("Invalid {key}: {v} (expected integer)")))
    })
    .transpose()
}
