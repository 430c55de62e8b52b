//! Usage: Cross-cutting helpers (errors, secret handling, logging).

pub mod error;
pub mod logging;
pub mod security;
