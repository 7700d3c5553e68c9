use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use web3::types::Address;

use crate::error::{DecodeError, MarketError};
use crate::types::TokenIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Base,
    Ethereum,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Base => "base",
            Network::Ethereum => "ethereum",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Network::Base => "Base",
            Network::Ethereum => "Ethereum",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base" => Ok(Network::Base),
            "ethereum" | "mainnet" => Ok(Network::Ethereum),
            other => Err(MarketError::UnknownNetwork(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenSymbol {
    #[serde(rename = "ETH")]
    Eth,
    #[serde(rename = "USDC")]
    Usdc,
    #[serde(rename = "USDT")]
    Usdt,
    #[serde(rename = "DAI")]
    Dai,
    #[serde(rename = "cbBTC")]
    CbBtc,
}

impl TokenSymbol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenSymbol::Eth => "ETH",
            TokenSymbol::Usdc => "USDC",
            TokenSymbol::Usdt => "USDT",
            TokenSymbol::Dai => "DAI",
            TokenSymbol::CbBtc => "cbBTC",
        }
    }
}

impl fmt::Display for TokenSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenSymbol {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ETH" | "WETH" => Ok(TokenSymbol::Eth),
            "USDC" => Ok(TokenSymbol::Usdc),
            "USDT" => Ok(TokenSymbol::Usdt),
            "DAI" => Ok(TokenSymbol::Dai),
            "CBBTC" => Ok(TokenSymbol::CbBtc),
            _ => Err(MarketError::UnknownToken(s.trim().to_string())),
        }
    }
}

/// Deployment facts for one supported network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: Network,
    pub chain_id: u64,
    pub default_rpc_url: &'static str,
    pub data_provider: Address,
    pub tokens: Vec<TokenIdentifier>,
}

impl NetworkConfig {
    pub fn token(&self, symbol: TokenSymbol) -> Option<TokenIdentifier> {
        self.tokens.iter().copied().find(|t| t.symbol == symbol)
    }

    pub fn supported_tokens(&self) -> Vec<TokenSymbol> {
        self.tokens.iter().map(|t| t.symbol).collect()
    }

    /// Resolve an allow-list of symbols in order.
    ///
    /// Unknown or unlisted symbols are skipped; an empty result falls back to ETH.
    pub fn resolve_tokens<S: AsRef<str>>(&self, symbols: &[S]) -> Vec<TokenIdentifier> {
        let mut resolved: Vec<TokenIdentifier> = Vec::new();
        for raw in symbols {
            let token = raw
                .as_ref()
                .parse::<TokenSymbol>()
                .ok()
                .and_then(|symbol| self.token(symbol));
            match token {
                Some(t) if !resolved.contains(&t) => resolved.push(t),
                Some(_) => {}
                None => log::warn!(
                    "[NetworkConfig::resolve_tokens] Skipping token {} not listed on {}",
                    raw.as_ref(),
                    self.network
                ),
            }
        }

        if resolved.is_empty() {
            let supported: Vec<&str> = self.supported_tokens().iter().map(TokenSymbol::as_str).collect();
            log::warn!(
                "[NetworkConfig::resolve_tokens] No valid target tokens (supported on {}: {}), using ETH",
                self.network,
                supported.join(", ")
            );
            resolved.extend(self.token(TokenSymbol::Eth));
        }
        resolved
    }
}

fn parse_address(raw: &str) -> Result<Address, MarketError> {
    raw.parse::<Address>()
        .map_err(|_| MarketError::Decode(DecodeError::Malformed(format!("invalid address {raw}"))))
}

fn token(symbol: TokenSymbol, address: &str, decimals: u32) -> Result<TokenIdentifier, MarketError> {
    Ok(TokenIdentifier {
        symbol,
        address: parse_address(address)?,
        decimals,
    })
}

/// Static registry of Aave V3 deployments.
pub fn network_config(network: Network) -> Result<NetworkConfig, MarketError> {
    let config = match network {
        Network::Base => NetworkConfig {
            network,
            chain_id: 8453,
            default_rpc_url: "https://base.llamarpc.com",
            data_provider: parse_address("0xd82a47fdebB5bf5329b09441C3DaB4b5df2153Ad")?,
            tokens: vec![
                // WETH on Base
                token(TokenSymbol::Eth, "0x4200000000000000000000000000000000000006", 18)?,
                token(TokenSymbol::Usdc, "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913", 6)?,
                token(TokenSymbol::CbBtc, "0xcbB7C0000aB88B473b1f5aFd9ef808440eed33Bf", 8)?,
                token(TokenSymbol::Dai, "0x50c5725949A6F0c72E6C4a641F24049A917DB0Cb", 18)?,
            ],
        },
        Network::Ethereum => NetworkConfig {
            network,
            chain_id: 1,
            default_rpc_url: "https://eth.llamarpc.com",
            data_provider: parse_address("0x7B4EB56E7CD4b454BA8ff71E4518426369a138a3")?,
            tokens: vec![
                token(TokenSymbol::Eth, "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2", 18)?,
                token(TokenSymbol::Usdc, "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", 6)?,
                token(TokenSymbol::Usdt, "0xdAC17F958D2ee523a2206206994597C13D831ec7", 6)?,
                token(TokenSymbol::Dai, "0x6B175474E89094C44Da98b954EedeAC495271d0F", 18)?,
            ],
        },
    };
    Ok(config)
}
