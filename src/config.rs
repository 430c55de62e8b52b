//! Usage: Startup configuration (client credentials from the environment + flow endpoints).

use crate::shared::error::{AppError, AppResult, CONFIG_MISSING};
use std::fmt;
use std::time::Duration;

pub const CLIENT_ID_ENV: &str = "SPOTIFY_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "SPOTIFY_CLIENT_SECRET";
pub const OAUTH_STATE_ENV: &str = "SPOTIFY_OAUTH_STATE";

pub const DEFAULT_CALLBACK_PORT: u16 = 8081;
pub const CALLBACK_PATH: &str = "/callback";
pub const REDIRECT_HOST: &str = "localhost";

const AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Read-only playback status permissions.
pub const SCOPES: &[&str] = &["user-read-currently-playing", "user-read-playback-state"];

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Both values are trimmed; a blank value counts as missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        match (read(CLIENT_ID_ENV), read(CLIENT_SECRET_ENV)) {
            (Some(client_id), Some(client_secret)) => Ok(Self {
                client_id,
                client_secret,
            }),
            (id, secret) => {
                let mut missing = Vec::new();
                if id.is_none() {
                    missing.push(CLIENT_ID_ENV);
                }
                if secret.is_none() {
                    missing.push(CLIENT_SECRET_ENV);
                }
                Err(AppError::new(
                    CONFIG_MISSING,
                    format!(
                        "missing {} in your environment (.env); both {CLIENT_ID_ENV} and {CLIENT_SECRET_ENV} are required",
                        missing.join(" / ")
                    ),
                ))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub bind_host_v4: String,
    pub bind_host_v6: Option<String>,
    pub port: u16,
    pub callback_path: &'static str,
    pub scopes: &'static [&'static str],
    pub exchange_timeout: Duration,
    pub connect_timeout: Duration,
    pub verify_state: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            authorize_url: AUTHORIZE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            bind_host_v4: "127.0.0.1".to_string(),
            bind_host_v6: Some("::1".to_string()),
            port: DEFAULT_CALLBACK_PORT,
            callback_path: CALLBACK_PATH,
            scopes: SCOPES,
            exchange_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            verify_state: false,
        }
    }
}

impl FlowConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let verify_state = lookup(OAUTH_STATE_ENV)
            .as_deref()
            .map(parse_flag)
            .unwrap_or(false);
        Self {
            verify_state,
            ..Self::default()
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn credentials_load_and_trim() {
        let creds = Credentials::from_lookup(lookup_from(&[
            (CLIENT_ID_ENV, " id-123 "),
            (CLIENT_SECRET_ENV, "secret-456\n"),
        ]))
        .expect("credentials");
        assert_eq!(creds.client_id, "id-123");
        assert_eq!(creds.client_secret, "secret-456");
    }

    #[test]
    fn missing_client_id_names_both_variables() {
        let err = Credentials::from_lookup(lookup_from(&[(CLIENT_SECRET_ENV, "secret")]))
            .expect_err("should fail");
        assert_eq!(err.code(), CONFIG_MISSING);
        assert!(err.message().contains(CLIENT_ID_ENV));
        assert!(err.message().contains(CLIENT_SECRET_ENV));
    }

    #[test]
    fn blank_secret_counts_as_missing() {
        let err = Credentials::from_lookup(lookup_from(&[
            (CLIENT_ID_ENV, "id"),
            (CLIENT_SECRET_ENV, "   "),
        ]))
        .expect_err("should fail");
        assert!(err.message().starts_with("missing SPOTIFY_CLIENT_SECRET"));
    }

    #[test]
    fn debug_output_hides_secret() {
        let creds = Credentials {
            client_id: "id".to_string(),
            client_secret: "top-secret".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("top-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn defaults_target_spotify_on_8081() {
        let cfg = FlowConfig::default();
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.callback_path, "/callback");
        assert_eq!(cfg.token_url, "https://accounts.spotify.com/api/token");
        assert!(!cfg.verify_state);
    }

    #[test]
    fn state_flag_parses_truthy_values() {
        assert!(FlowConfig::from_lookup(lookup_from(&[(OAUTH_STATE_ENV, "TRUE")])).verify_state);
        assert!(FlowConfig::from_lookup(lookup_from(&[(OAUTH_STATE_ENV, "1")])).verify_state);
        assert!(!FlowConfig::from_lookup(lookup_from(&[(OAUTH_STATE_ENV, "0")])).verify_state);
        assert!(!FlowConfig::from_lookup(lookup_from(&[])).verify_state);
    }
}
