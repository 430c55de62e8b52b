//! Usage: OAuth authorization code flow pieces (authorize URL, callback listener, token exchange).

pub mod authorize;
pub mod callback_server;
pub mod token_exchange;
