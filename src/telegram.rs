use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, MarketError, TransientKind};
use crate::retry::RetryPolicy;

/// Delivers the finished message to one Telegram chat.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: Client,
    base_url: String,
    bot_token: String,
    chat_id: String,
    retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramClient {
    pub fn new(
        base_url: String,
        bot_token: String,
        chat_id: String,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, AppError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AppError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            bot_token,
            chat_id,
            retry,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.base_url.trim_end_matches('/'),
            self.bot_token,
            method
        )
    }

    /// `getMe`; confirms the token is accepted.
    pub async fn validate(&self) -> Result<(), AppError> {
        let url = self.method_url("getMe");
        let result = match self.http.get(&url).send().await {
            Ok(resp) => check_response(resp).await,
            Err(e) => Err(classify_request_error(e)),
        };
        result.map_err(|e| AppError::Config(format!("Failed to validate Telegram connection: {e}")))
    }

    pub async fn send(&self, text: &str) -> Result<(), AppError> {
        let url = self.method_url("sendMessage");
        let body = SendRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: "Markdown",
            disable_web_page_preview: true,
        };

        self.retry
            .execute("telegram sendMessage", || async {
                let resp = self
                    .http
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(classify_request_error)?;
                check_response(resp).await
            })
            .await
            .map_err(|e| AppError::Delivery(e.to_string()))?;

        log::info!("[TelegramClient::send] Message delivered to chat {}", self.chat_id);
        Ok(())
    }
}

fn classify_request_error(err: reqwest::Error) -> MarketError {
    if err.is_timeout() {
        MarketError::transient(TransientKind::Timeout, err.to_string())
    } else if err.is_connect() || err.is_request() {
        MarketError::transient(TransientKind::Connection, err.to_string())
    } else {
        MarketError::Rejected(err.to_string())
    }
}

async fn check_response(resp: reqwest::Response) -> Result<(), MarketError> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(MarketError::transient(TransientKind::RateLimited, text));
    }
    if status.is_server_error() {
        return Err(MarketError::transient(TransientKind::Server(status.as_u16()), text));
    }

    let parsed: Option<ApiResponse> = serde_json::from_str(&text).ok();
    match parsed {
        Some(ApiResponse { ok: true, .. }) if status.is_success() => Ok(()),
        Some(ApiResponse { description, .. }) => Err(MarketError::Rejected(format!(
            "Telegram API {status}: {}",
            description.unwrap_or_default()
        ))),
        None => Err(MarketError::Rejected(format!("Telegram API {status} body={text}"))),
    }
}
