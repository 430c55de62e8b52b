//! Usage: One-shot helper that walks an operator through the Spotify authorization code flow
//! and prints the resulting refresh token.

pub mod config;
pub mod oauth;
pub mod session;
pub mod shared;

pub use config::{Credentials, FlowConfig};
pub use session::SessionEnd;
