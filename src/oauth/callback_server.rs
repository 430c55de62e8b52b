//! Usage: One-shot localhost callback listener for the OAuth authorization code flow.
//!
//! The first request on the callback path is terminal: it answers the browser, delivers a
//! `SessionEnd` on a oneshot channel and the session then shuts every listener down.

use crate::oauth::token_exchange::TokenExchanger;
use crate::session::SessionEnd;
use crate::shared::error::{AppError, AppResult, BIND_FAILED, INTERNAL_ERROR};
use crate::shared::security::{constant_time_eq, mask_token};
use axum::{
    extract::{RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use reqwest::Url;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

const SUCCESS_HTML: &str =
    "<h2>Spotify token captured.</h2><p>You can close this tab and go back to the terminal.</p>";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Success { code: String },
    Denied { error: String },
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
    pub state: Option<String>,
}

impl CallbackParams {
    /// A provider error wins over a code when both are present.
    pub fn outcome(&self) -> CallbackOutcome {
        if let Some(error) = &self.error {
            return CallbackOutcome::Denied {
                error: error.clone(),
            };
        }
        match &self.code {
            Some(code) => CallbackOutcome::Success { code: code.clone() },
            None => CallbackOutcome::Malformed,
        }
    }
}

pub fn parse_callback_query(query: Option<&str>) -> CallbackParams {
    let mut params = CallbackParams {
        code: None,
        error: None,
        state: None,
    };
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return params;
    };
    let Ok(url) = Url::parse(&format!("http://localhost/?{query}")) else {
        return params;
    };

    // First occurrence of a key wins.
    for (key, value) in url.query_pairs() {
        if value.is_empty() {
            continue;
        }
        let slot = match key.as_ref() {
            "code" => &mut params.code,
            "error" => &mut params.error,
            "state" => &mut params.state,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(value.into_owned());
        }
    }
    params
}

#[derive(Debug)]
pub struct BoundCallbackListener {
    port: u16,
    listener_v4: TcpListener,
    listener_v6: Option<TcpListener>,
}

impl BoundCallbackListener {
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// IPv4 is required; IPv6 loopback on the same port is best effort since browsers may
/// resolve `localhost` to `::1`.
pub async fn bind_callback_listener(
    host_v4: &str,
    host_v6: Option<&str>,
    port: u16,
) -> AppResult<BoundCallbackListener> {
    let listener_v4 = TcpListener::bind((host_v4, port)).await.map_err(|e| {
        AppError::with_source(BIND_FAILED, format!("{host_v4}:{port} ({e})"), e)
    })?;
    let port = listener_v4
        .local_addr()
        .map_err(|e| {
            AppError::new(
                BIND_FAILED,
                format!("{host_v4}:{port} (local_addr failed: {e})"),
            )
        })?
        .port();

    let listener_v6 = match host_v6 {
        Some(host) => match TcpListener::bind((host, port)).await {
            Ok(listener) => Some(listener),
            Err(err) => {
                tracing::debug!(host, port, "ipv6 callback bind skipped: {err}");
                None
            }
        },
        None => None,
    };

    Ok(BoundCallbackListener {
        port,
        listener_v4,
        listener_v6,
    })
}

pub struct CallbackSettings {
    pub callback_path: &'static str,
    pub redirect_uri: String,
    pub expected_state: Option<String>,
}

struct CallbackShared {
    redirect_uri: String,
    expected_state: Option<String>,
    exchanger: Arc<dyn TokenExchanger>,
    handled: AtomicBool,
    done_tx: Mutex<Option<oneshot::Sender<SessionEnd>>>,
}

impl CallbackShared {
    fn finish(&self, end: SessionEnd) {
        let sender = match self.done_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => {
                if tx.send(end).is_err() {
                    tracing::warn!("session stopped waiting before the callback finished");
                }
            }
            None => tracing::warn!("callback outcome already delivered"),
        }
    }
}

#[derive(Clone)]
struct CallbackState(Arc<CallbackShared>);

pub struct RunningCallbackServer {
    done_rx: oneshot::Receiver<SessionEnd>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub fn spawn_callback_server(
    listener: BoundCallbackListener,
    settings: CallbackSettings,
    exchanger: Arc<dyn TokenExchanger>,
) -> RunningCallbackServer {
    let (done_tx, done_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let shared = Arc::new(CallbackShared {
        redirect_uri: settings.redirect_uri,
        expected_state: settings.expected_state,
        exchanger,
        handled: AtomicBool::new(false),
        done_tx: Mutex::new(Some(done_tx)),
    });
    let app = build_router(settings.callback_path, CallbackState(shared));

    let mut tasks = Vec::with_capacity(2);
    let listeners = std::iter::once(listener.listener_v4).chain(listener.listener_v6);
    for tcp in listeners {
        let app = app.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let addr = tcp
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            let serve = axum::serve(tcp, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            });
            if let Err(err) = serve.await {
                tracing::error!(addr = %addr, "callback listener failed: {}", err);
            }
        }));
    }

    RunningCallbackServer {
        done_rx,
        shutdown_tx,
        tasks,
    }
}

impl RunningCallbackServer {
    /// Blocks until the terminal callback arrives, then closes every listener.
    pub async fn wait(self) -> SessionEnd {
        let RunningCallbackServer {
            done_rx,
            shutdown_tx,
            tasks,
        } = self;

        let end = done_rx.await.unwrap_or_else(|_| {
            SessionEnd::Internal(AppError::new(
                INTERNAL_ERROR,
                "callback listener stopped before a callback arrived",
            ))
        });

        let _ = shutdown_tx.send(true);
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                tracing::warn!("callback listener did not drain in time; aborting");
                task.abort();
            }
        }
        tracing::debug!("callback listener closed");
        end
    }
}

fn build_router(callback_path: &str, state: CallbackState) -> Router {
    Router::new()
        .route(callback_path, get(handle_callback))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> Response {
    text_response(StatusCode::NOT_FOUND, "Not found".to_string())
}

async fn handle_callback(
    State(state): State<CallbackState>,
    RawQuery(query): RawQuery,
) -> Response {
    let shared = state.0;
    if shared.handled.swap(true, Ordering::SeqCst) {
        return text_response(
            StatusCode::CONFLICT,
            "authorization already completed".to_string(),
        );
    }

    let params = parse_callback_query(query.as_deref());

    if let Some(expected) = shared.expected_state.as_deref() {
        let state_ok = params
            .state
            .as_deref()
            .is_some_and(|got| constant_time_eq(got.as_bytes(), expected.as_bytes()));
        if !state_ok {
            let reason = "state parameter missing or mismatched".to_string();
            tracing::warn!("{reason}");
            shared.finish(SessionEnd::MalformedCallback {
                reason: reason.clone(),
            });
            return text_response(StatusCode::BAD_REQUEST, reason);
        }
    }

    match params.outcome() {
        CallbackOutcome::Denied { error } => {
            tracing::warn!(error = %error, "provider denied the authorization");
            let body = format!("Spotify auth error: {error}");
            shared.finish(SessionEnd::Denied { error });
            text_response(StatusCode::BAD_REQUEST, body)
        }
        CallbackOutcome::Malformed => {
            let reason = "missing code: expected ?code= or ?error=".to_string();
            tracing::warn!("callback carried neither code nor error");
            shared.finish(SessionEnd::MalformedCallback {
                reason: reason.clone(),
            });
            text_response(StatusCode::BAD_REQUEST, reason)
        }
        CallbackOutcome::Success { code } => {
            tracing::info!(code = %mask_token(&code), "authorization code received");
            exchange_and_respond(shared, code).await
        }
    }
}

async fn exchange_and_respond(shared: Arc<CallbackShared>, code: String) -> Response {
    // Detached so a dropped browser connection cannot cancel the single-use exchange.
    let task_shared = shared.clone();
    let exchange = tokio::spawn(async move {
        let result = task_shared
            .exchanger
            .exchange(&code, &task_shared.redirect_uri)
            .await;
        match result {
            Ok(tokens) => {
                task_shared.finish(SessionEnd::TokenObtained(tokens));
                true
            }
            Err(err) => {
                tracing::error!("{err}");
                task_shared.finish(SessionEnd::ExchangeFailed(err));
                false
            }
        }
    });

    match exchange.await {
        Ok(true) => html_response(StatusCode::OK, SUCCESS_HTML),
        Ok(false) => {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
        }
        Err(join_err) => {
            // Panic payloads may contain the code; only the kind is reported.
            let kind = if join_err.is_panic() { "panicked" } else { "cancelled" };
            tracing::error!("token exchange task {kind}");
            shared.finish(SessionEnd::Internal(AppError::new(
                INTERNAL_ERROR,
                format!("token exchange task {kind}"),
            )));
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
        }
    }
}

fn text_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CONNECTION, "close"),
        ],
        body,
    )
        .into_response()
}

fn html_response(status: StatusCode, body: &'static str) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CONNECTION, "close"),
        ],
        body,
    )
        .into_response()
}
