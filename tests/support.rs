#![allow(dead_code)]

use std::ffi::OsString;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use spotify_refresh_token_lib::oauth::token_exchange::{
    ExchangeError, ExchangeFuture, TokenExchanger, TokenResponse,
};
use spotify_refresh_token_lib::FlowConfig;
use tokio::sync::Notify;

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct EnvRestore {
    saved: Vec<(&'static str, Option<OsString>)>,
}

impl EnvRestore {
    fn save_once(&mut self, key: &'static str) {
        if self.saved.iter().any(|(k, _)| *k == key) {
            return;
        }
        self.saved.push((key, std::env::var_os(key)));
    }

    pub fn set_var(&mut self, key: &'static str, value: impl Into<OsString>) {
        self.save_once(key);
        std::env::set_var(key, value.into());
    }

    pub fn remove_var(&mut self, key: &'static str) {
        self.save_once(key);
        std::env::remove_var(key);
    }
}

impl Drop for EnvRestore {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..).rev() {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
    }
}

/// Loopback-only config on an ephemeral port.
pub fn test_config() -> FlowConfig {
    FlowConfig {
        bind_host_v6: None,
        port: 0,
        ..FlowConfig::default()
    }
}

pub fn credentials() -> spotify_refresh_token_lib::Credentials {
    spotify_refresh_token_lib::Credentials {
        client_id: "abc".to_string(),
        client_secret: "xyz".to_string(),
    }
}

pub fn tokens(refresh_token: Option<&str>) -> TokenResponse {
    TokenResponse {
        access_token: "X".to_string(),
        token_type: Some("Bearer".to_string()),
        expires_in: Some(3600),
        refresh_token: refresh_token.map(str::to_string),
        scope: Some("user-read-currently-playing user-read-playback-state".to_string()),
    }
}

/// Writer the test can read while the session still holds `&mut` to a clone.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        let guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&guard).into_owned()
    }

    /// Port taken from the printed redirect URI line.
    pub fn redirect_port(&self) -> Option<u16> {
        self.contents().lines().find_map(|line| {
            line.trim()
                .strip_prefix("http://localhost:")?
                .strip_suffix("/callback")?
                .parse()
                .ok()
        })
    }

    pub fn authorize_url(&self) -> Option<String> {
        self.contents()
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with("https://"))
            .map(str::to_string)
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub async fn wait_for_port(out: &SharedBuf) -> u16 {
    let poll = async {
        loop {
            if let Some(port) = out.redirect_port() {
                return port;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("session printed redirect uri")
}

/// Exchanger whose future panics, standing in for an unexpected handler fault.
pub struct PanickingExchanger;

impl TokenExchanger for PanickingExchanger {
    fn exchange<'a>(&'a self, _code: &'a str, _redirect_uri: &'a str) -> ExchangeFuture<'a> {
        Box::pin(explode())
    }
}

async fn explode() -> Result<TokenResponse, ExchangeError> {
    panic!("exchanger blew up")
}

/// Canned exchanger that records every call.
pub struct StubExchanger {
    result: Result<TokenResponse, ExchangeError>,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, String)>>,
}

impl StubExchanger {
    pub fn returning(result: Result<TokenResponse, ExchangeError>) -> Arc<Self> {
        Arc::new(Self {
            result,
            gate: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Holds every exchange until `gate` is notified.
    pub fn gated(result: Result<TokenResponse, ExchangeError>, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            result,
            gate: Some(gate),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl TokenExchanger for StubExchanger {
    fn exchange<'a>(&'a self, code: &'a str, redirect_uri: &'a str) -> ExchangeFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((code.to_string(), redirect_uri.to_string()));
        let result = self.result.clone();
        let gate = self.gate.clone();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            result
        })
    }
}
