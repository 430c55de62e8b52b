//! Usage: Drives one authorization run end to end and maps it to a terminal state.
//!
//! Order: config -> bind -> print instructions -> serve -> single callback -> report.
//! A bind failure is reported before any URL is printed.

use crate::config::{Credentials, FlowConfig};
use crate::oauth::authorize::{build_authorize_url, generate_state, redirect_uri};
use crate::oauth::callback_server::{
    bind_callback_listener, spawn_callback_server, CallbackSettings,
};
use crate::oauth::token_exchange::{
    ExchangeError, HttpTokenExchanger, TokenExchanger, TokenResponse,
};
use crate::shared::error::{AppError, SYSTEM_ERROR};
use std::io::Write;
use std::sync::Arc;

pub const REFRESH_TOKEN_KEY: &str = "SPOTIFY_REFRESH_TOKEN";

#[derive(Debug)]
pub enum SessionEnd {
    TokenObtained(TokenResponse),
    MissingConfig(AppError),
    ListenerBindFailed(AppError),
    Denied { error: String },
    MalformedCallback { reason: String },
    ExchangeFailed(ExchangeError),
    Internal(AppError),
}

impl SessionEnd {
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionEnd::TokenObtained(_) => 0,
            SessionEnd::MissingConfig(_) => 1,
            SessionEnd::ListenerBindFailed(_) => 2,
            SessionEnd::Denied { .. } => 3,
            SessionEnd::MalformedCallback { .. } => 4,
            SessionEnd::ExchangeFailed(_) => 5,
            SessionEnd::Internal(_) => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEnd::TokenObtained(_) => "token-obtained",
            SessionEnd::MissingConfig(_) => "missing-config",
            SessionEnd::ListenerBindFailed(_) => "listener-bind-failed",
            SessionEnd::Denied { .. } => "denied",
            SessionEnd::MalformedCallback { .. } => "malformed-callback",
            SessionEnd::ExchangeFailed(_) => "exchange-failed",
            SessionEnd::Internal(_) => "internal-error",
        }
    }
}

/// Entry point used by the binary: credentials and flags come from the process environment.
pub async fn run_from_env<O: Write, E: Write>(out: &mut O, err: &mut E) -> SessionEnd {
    run_with_lookup(|key| std::env::var(key).ok(), out, err).await
}

pub async fn run_with_lookup<O: Write, E: Write>(
    lookup: impl Fn(&str) -> Option<String>,
    out: &mut O,
    err: &mut E,
) -> SessionEnd {
    let credentials = match Credentials::from_lookup(&lookup) {
        Ok(credentials) => credentials,
        Err(e) => {
            let end = SessionEnd::MissingConfig(e);
            report(&end, out, err);
            return end;
        }
    };
    let cfg = FlowConfig::from_lookup(&lookup);

    let exchanger = match HttpTokenExchanger::new(&cfg, &credentials) {
        Ok(exchanger) => Arc::new(exchanger),
        Err(e) => {
            let end = SessionEnd::Internal(e);
            report(&end, out, err);
            return end;
        }
    };

    run(&cfg, &credentials, exchanger, out, err).await
}

pub async fn run<O: Write, E: Write>(
    cfg: &FlowConfig,
    credentials: &Credentials,
    exchanger: Arc<dyn TokenExchanger>,
    out: &mut O,
    err: &mut E,
) -> SessionEnd {
    let end = run_inner(cfg, credentials, exchanger, out).await;
    tracing::info!(outcome = end.as_str(), "authorization session finished");
    report(&end, out, err);
    end
}

async fn run_inner<O: Write>(
    cfg: &FlowConfig,
    credentials: &Credentials,
    exchanger: Arc<dyn TokenExchanger>,
    out: &mut O,
) -> SessionEnd {
    let listener =
        match bind_callback_listener(&cfg.bind_host_v4, cfg.bind_host_v6.as_deref(), cfg.port)
            .await
        {
            Ok(listener) => listener,
            Err(e) => return SessionEnd::ListenerBindFailed(e),
        };

    let port = listener.port();
    let redirect = redirect_uri(port, cfg.callback_path);
    let state = cfg.verify_state.then(generate_state);
    let auth_url = match build_authorize_url(cfg, credentials, &redirect, state.as_deref()) {
        Ok(url) => url,
        Err(e) => return SessionEnd::Internal(e),
    };

    if let Err(e) = print_instructions(out, &redirect, &auth_url, cfg.callback_path) {
        return SessionEnd::Internal(AppError::with_source(
            SYSTEM_ERROR,
            format!("failed to write instructions: {e}"),
            e,
        ));
    }

    let server = spawn_callback_server(
        listener,
        CallbackSettings {
            callback_path: cfg.callback_path,
            redirect_uri: redirect,
            expected_state: state,
        },
        exchanger,
    );
    tracing::info!("Listening on http://localhost:{port} ...");

    server.wait().await
}

fn print_instructions<O: Write>(
    out: &mut O,
    redirect: &str,
    auth_url: &str,
    callback_path: &str,
) -> std::io::Result<()> {
    writeln!(out)?;
    writeln!(out, "1) Add this Redirect URI in Spotify Dashboard:")?;
    writeln!(out, "   {redirect}")?;
    writeln!(out)?;
    writeln!(out, "2) Open this URL in your browser and approve:")?;
    writeln!(out, "   {auth_url}")?;
    writeln!(out)?;
    writeln!(
        out,
        "3) After approval, you'll be redirected to {callback_path} and this tool will print {REFRESH_TOKEN_KEY}."
    )?;
    writeln!(out)?;
    out.flush()
}

fn report<O: Write, E: Write>(end: &SessionEnd, out: &mut O, err: &mut E) {
    let written = match end {
        SessionEnd::TokenObtained(tokens) => report_tokens(tokens, out),
        SessionEnd::MissingConfig(e) => writeln!(err, "{}", e.message()),
        SessionEnd::ListenerBindFailed(e) => {
            writeln!(err, "Could not start the callback listener: {e}")
        }
        SessionEnd::Denied { error } => writeln!(err, "Spotify auth error: {error}"),
        SessionEnd::MalformedCallback { reason } => writeln!(err, "Invalid callback: {reason}"),
        SessionEnd::ExchangeFailed(e) => writeln!(err, "{e}"),
        SessionEnd::Internal(e) => writeln!(err, "Internal error: {e}"),
    };
    if let Err(e) = written {
        tracing::error!("failed to write session report: {e}");
    }
}

fn report_tokens<O: Write>(tokens: &TokenResponse, out: &mut O) -> std::io::Result<()> {
    match tokens.refresh_token.as_deref() {
        Some(refresh_token) => {
            writeln!(out)?;
            writeln!(out, "Success. Add this to your .env (DO NOT COMMIT .env):")?;
            writeln!(out)?;
            writeln!(out, "{REFRESH_TOKEN_KEY}={refresh_token}")?;
            writeln!(out)?;
        }
        None => {
            writeln!(out)?;
            writeln!(
                out,
                "Note: Spotify did not return a refresh_token. If you previously authorized this app, remove it from your Spotify Account > Apps, then run again."
            )?;
        }
    }
    out.flush()
}
