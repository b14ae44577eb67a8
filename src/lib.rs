//! Rotating reverse proxy for EVM JSON-RPC endpoints.
//!
//! Tenants authenticate with a bearer token and submit a JSON-RPC request
//! (single or batch) targeting a named chain; the proxy picks an upstream
//! node from the chain's pool, forwards the request, rotates the pool and
//! retries on failure, and returns the upstream response verbatim. A
//! middleware pipeline can short-circuit (`eth_chainId`), rewrite
//! (`eth_getLogs` ranges, `ext_estimateGas`), or unbundle batches for nodes
//! that cannot serve them.

pub mod chains;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod rpc;
pub mod server;
pub mod settings;
pub mod stats;
pub mod tasks;
pub mod utils;

pub use error::{Error, Result};

/// Installs the process-wide rustls crypto provider exactly once.
///
/// `reqwest`'s `rustls-no-provider` feature (needed to pick ring vs.
/// aws-lc-rs per platform, see `Cargo.toml`) leaves this unset; every
/// `reqwest::Client` build panics until it's installed.
pub fn install_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        #[cfg(not(windows))]
        let _ = rustls::crypto::ring::default_provider().install_default();
        #[cfg(windows)]
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}
