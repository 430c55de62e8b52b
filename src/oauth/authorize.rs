//! Usage: Authorization URL construction for the browser leg of the code flow.

use crate::config::{Credentials, FlowConfig, REDIRECT_HOST};
use crate::shared::error::{AppError, AppResult, SYSTEM_ERROR};
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::Url;

pub fn redirect_uri(port: u16, callback_path: &str) -> String {
    format!("http://{REDIRECT_HOST}:{port}{callback_path}")
}

/// 32 random bytes, hex encoded.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn build_authorize_url(
    cfg: &FlowConfig,
    credentials: &Credentials,
    redirect_uri: &str,
    state: Option<&str>,
) -> AppResult<String> {
    let mut url = Url::parse(&cfg.authorize_url)
        .map_err(|e| AppError::new(SYSTEM_ERROR, format!("invalid authorize url: {e}")))?;
    {
        let scope = cfg.scopes.join(" ");
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        query.append_pair("client_id", &credentials.client_id);
        query.append_pair("scope", &scope);
        query.append_pair("redirect_uri", redirect_uri);
        query.append_pair("show_dialog", "true");
        if let Some(state) = state {
            query.append_pair("state", state);
        }
    }
    Ok(url.to_string())
}
