//! The background health-check loop (`evmproxy tasks`).

use crate::chains::REGISTRY;
use crate::config;
use crate::error::Result;
use crate::rpc::check::{run_check, CheckOptions};
use crate::rpc::client::RpcClient;
use crate::settings::Settings;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

pub struct Tasks {
    pub run_pause: Duration,
    pub settings: Settings,
}

impl Tasks {
    #[must_use]
    pub fn new(settings: Settings, run_pause: Duration) -> Self {
        Self {
            run_pause,
            settings,
        }
    }

    /// One full sequential probe of every configured chain, with a summary
    /// log of failing chains and nodes.
    pub async fn run_once(&self) -> Result<()> {
        let start_time = Instant::now();
        let (proxy_config, secrets) = config::load(&self.settings)?;
        let client = RpcClient::new(proxy_config, secrets)?;

        let options = CheckOptions {
            sequential: true,
            per_chain_pause: Duration::from_millis(500),
            ..CheckOptions::default()
        };
        let results = run_check(&client, &REGISTRY, &options).await;

        let time_taken = start_time.elapsed().as_secs_f64();
        let successes = results.iter().filter(|result| result.success).count();
        let failures: Vec<_> = results.iter().filter(|result| !result.success).collect();
        let chains: BTreeSet<&str> = results.iter().map(|result| result.chain.as_str()).collect();
        let any_success_chains: BTreeSet<&str> = results
            .iter()
            .filter(|result| result.success)
            .map(|result| result.chain.as_str())
            .collect();
        let any_failure_chains: BTreeSet<&str> =
            failures.iter().map(|result| result.chain.as_str()).collect();
        let any_failure_nodes: BTreeSet<&str> =
            failures.iter().map(|result| result.node.as_str()).collect();
        let full_failure_chains: Vec<&str> = chains
            .difference(&any_success_chains)
            .copied()
            .collect();

        if !failures.is_empty() {
            tracing::error!(
                x_successes = successes,
                x_failures = failures.len(),
                x_chains = chains.len(),
                x_failing_chains = ?any_failure_chains,
                x_failing_nodes = ?any_failure_nodes,
                x_time_taken = time_taken,
                "health check returned {}/{} failures on {}/{} chains",
                failures.len(),
                results.len(),
                any_failure_chains.len(),
                chains.len(),
            );
        }
        if !full_failure_chains.is_empty() {
            tracing::error!(
                x_full_failure_chains = ?full_failure_chains,
                "health check has fully failing chains: {}",
                full_failure_chains.join(", "),
            );
        }
        tracing::info!(
            x_successes = successes,
            x_failures = failures.len(),
            x_chains = chains.len(),
            x_time_taken = time_taken,
            "health check results"
        );
        Ok(())
    }

    pub async fn run(&self, once: bool) -> Result<()> {
        loop {
            self.run_once().await?;
            if once {
                return Ok(());
            }
            tracing::debug!(pause_sec = self.run_pause.as_secs_f64(), "sleeping");
            tokio::time::sleep(self.run_pause).await;
        }
    }
}
