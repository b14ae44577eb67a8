//! Command-line interface definitions.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Rotating reverse proxy for EVM JSON-RPC endpoints",
    long_about = "evmproxy forwards JSON-RPC requests to per-chain upstream pools,\n\
                  rotating nodes on failure and rewriting selected requests\n\
                  (eth_chainId short-circuit, eth_getLogs clamping, batch\n\
                  unbundling, synthetic ext_estimateGas).\n\n\
                  Examples:\n  \
                  evmproxy api --port 13431\n  \
                  evmproxy tasks --once"
)]
pub struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the HTTP API. Configuration is through EVMPROXY_* environment
    /// variables.
    Api {
        /// Bind address (overrides EVMPROXY_API_BIND)
        #[arg(long)]
        bind: Option<String>,
        /// Bind port (overrides EVMPROXY_API_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the periodic health-check loop over all configured upstreams.
    Tasks {
        /// Run a single round and exit
        #[arg(long)]
        once: bool,
        /// Pause between rounds, in seconds
        #[arg(long, default_value_t = 60.0)]
        pause_sec: f64,
    },
}
