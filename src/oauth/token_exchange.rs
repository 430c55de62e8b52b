//! Usage: Token endpoint client for the authorization_code grant.

use crate::config::{Credentials, FlowConfig};
use crate::shared::error::{AppError, AppResult, SYSTEM_ERROR};
use crate::shared::security::mask_token;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

const UNPARSEABLE_BODY: &str = "unparseable";
const ERROR_BODY_MAX_CHARS: usize = 500;

#[derive(Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    /// Omitted by the provider when the app was already authorized.
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &mask_token(&self.access_token))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_token", &self.refresh_token.as_deref().map(mask_token))
            .field("scope", &self.scope)
            .finish()
    }
}

/// Wire shape of a successful token response; `expires_in` arrives as a number or a string.
#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<Value>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("token exchange failed ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("token exchange request failed: {0}")]
    Transport(String),
    #[error("token exchange response invalid: {0}")]
    InvalidBody(String),
}

pub type ExchangeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TokenResponse, ExchangeError>> + Send + 'a>>;

/// Swaps an authorization code for tokens.
///
/// Object safe so the callback listener can hold `Arc<dyn TokenExchanger>`.
pub trait TokenExchanger: Send + Sync {
    fn exchange<'a>(&'a self, code: &'a str, redirect_uri: &'a str) -> ExchangeFuture<'a>;
}

pub struct HttpTokenExchanger {
    client: reqwest::Client,
    token_url: String,
    authorization: String,
}

impl HttpTokenExchanger {
    pub fn new(cfg: &FlowConfig, credentials: &Credentials) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "spotify-refresh-token/{}",
                env!("CARGO_PKG_VERSION")
            ))
            .connect_timeout(cfg.connect_timeout)
            .timeout(cfg.exchange_timeout)
            .build()
            .map_err(|e| {
                AppError::new(SYSTEM_ERROR, format!("token client init failed: {e}"))
            })?;

        Ok(Self {
            client,
            token_url: cfg.token_url.clone(),
            authorization: basic_authorization(credentials),
        })
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, ExchangeError> {
        tracing::info!(code = %mask_token(code), "exchanging authorization code");

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code.trim()),
            ("redirect_uri", redirect_uri),
        ];
        let response = self
            .client
            .post(&self.token_url)
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .form(&form)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(format!("response read failed: {e}")))?;

        parse_token_response(status.as_u16(), status.is_success(), &body)
    }
}

impl TokenExchanger for HttpTokenExchanger {
    fn exchange<'a>(&'a self, code: &'a str, redirect_uri: &'a str) -> ExchangeFuture<'a> {
        Box::pin(self.exchange_code(code, redirect_uri))
    }
}

pub fn basic_authorization(credentials: &Credentials) -> String {
    let raw = format!("{}:{}", credentials.client_id, credentials.client_secret);
    format!("Basic {}", STANDARD.encode(raw))
}

fn parse_token_response(
    status: u16,
    success: bool,
    body: &str,
) -> Result<TokenResponse, ExchangeError> {
    if !success {
        let body = sanitize_error_body(body);
        tracing::warn!(status, body = %body, "token endpoint rejected the exchange");
        return Err(ExchangeError::Status { status, body });
    }

    let raw: RawTokenResponse = serde_json::from_str(body)
        .map_err(|e| ExchangeError::InvalidBody(format!("json invalid: {e}")))?;

    let access_token = non_empty(raw.access_token)
        .ok_or_else(|| ExchangeError::InvalidBody("missing access_token".to_string()))?;

    Ok(TokenResponse {
        access_token,
        token_type: non_empty(raw.token_type),
        expires_in: raw.expires_in.as_ref().and_then(parse_i64_lossy),
        refresh_token: non_empty(raw.refresh_token),
        scope: non_empty(raw.scope),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_i64_lossy(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lc = key.trim().to_ascii_lowercase();
    key_lc.contains("token") || key_lc.contains("secret") || key_lc == "authorization"
}

fn redact_sensitive_json_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if is_sensitive_key(key) {
                    if let Some(raw) = nested.as_str() {
                        *nested = Value::String(mask_token(raw));
                        continue;
                    }
                }
                redact_sensitive_json_fields(nested);
            }
        }
        Value::Array(items) => {
            for nested in items {
                redact_sensitive_json_fields(nested);
            }
        }
        _ => {}
    }
}

fn sanitize_error_body(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(mut value) => {
            redact_sensitive_json_fields(&mut value);
            serde_json::to_string(&value)
                .map(|encoded| encoded.chars().take(ERROR_BODY_MAX_CHARS).collect())
                .unwrap_or_else(|_| UNPARSEABLE_BODY.to_string())
        }
        Err(_) => UNPARSEABLE_BODY.to_string(),
    }
}
