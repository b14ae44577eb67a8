//! Health checking of every configured `(chain, node)` pair.
//!
//! Each probe sends one batched request (`eth_chainId`, `eth_blockNumber`,
//! and a Multicall3 `eth_call` where the address is known) pinned to the
//! node under test, verifies the answers, and records the block number.
//! After all probes, per-chain block numbers are correlated: a node lagging
//! more than the allowed distance behind the best node of its chain is
//! downgraded to a failure.

use crate::chains::{ChainInfo, ChainRegistry};
use crate::rpc::client::RpcClient;
use crate::rpc::models::RequestParams;
use crate::utils::parse_hex_u64;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

/// `Multicall3.aggregate3([])` calldata and its expected return blob.
pub const CHECK_REQ_MC_CALLDATA: &str = "0x82ad56cb00000000000000000000000000000000000000000000000000000000000000200000000000000000000000000000000000000000000000000000000000000000";
pub const CHECK_RES_MC_DATA: &str = "0x00000000000000000000000000000000000000000000000000000000000000200000000000000000000000000000000000000000000000000000000000000000";

pub const DEFAULT_MAX_BLOCK_NUMBER_LAG: u64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub chain: String,
    pub node: String,
    pub res: Option<Value>,
    pub exc: Option<String>,
    pub block_number: Option<u64>,
    pub block_number_lag: Option<u64>,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct CheckOptions {
    /// Restrict probing to these chains; `None` probes every configured
    /// chain with known EVM metadata.
    pub chain_names: Option<Vec<String>>,
    pub sequential: bool,
    pub max_block_number_lag: Option<u64>,
    /// In sequential mode, pause between chains to avoid hammering
    /// multi-node providers.
    pub per_chain_pause: Duration,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            chain_names: None,
            sequential: false,
            max_block_number_lag: Some(DEFAULT_MAX_BLOCK_NUMBER_LAG),
            per_chain_pause: Duration::ZERO,
        }
    }
}

fn probe_request_data(chain: &ChainInfo) -> Value {
    let mut req_data = vec![
        json!({"jsonrpc": "2.0", "id": 1, "method": "eth_chainId", "params": []}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "eth_blockNumber", "params": []}),
    ];
    if let Some(multicall3) = &chain.multicall3_address {
        req_data.push(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "eth_call",
            "params": [{"to": multicall3, "data": CHECK_REQ_MC_CALLDATA}, "latest"],
        }));
    }
    Value::Array(req_data)
}

fn evaluate_probe(data: &Value, chain: &ChainInfo, result: &mut CheckResult) -> Result<(), String> {
    let items = data
        .as_array()
        .ok_or_else(|| "probe response is not a list".to_string())?;
    let by_id: HashMap<u64, &Value> = items
        .iter()
        .filter_map(|item| item.get("id").and_then(Value::as_u64).map(|id| (id, item)))
        .collect();

    let chain_id = by_id
        .get(&1)
        .and_then(|item| item.get("result"))
        .and_then(Value::as_str)
        .and_then(parse_hex_u64)
        .ok_or_else(|| "missing eth_chainId result".to_string())?;
    if chain_id != chain.id {
        return Err(format!(
            "response chain_id {chain_id} != configured {}",
            chain.id
        ));
    }

    let block_number = by_id
        .get(&2)
        .and_then(|item| item.get("result"))
        .and_then(Value::as_str)
        .and_then(parse_hex_u64)
        .ok_or_else(|| "missing eth_blockNumber result".to_string())?;
    result.block_number = Some(block_number);

    if let Some(mc_item) = by_id.get(&3) {
        if mc_item.get("result").and_then(Value::as_str) != Some(CHECK_RES_MC_DATA) {
            return Err("unexpected eth_call result".to_string());
        }
    }
    Ok(())
}

async fn probe_one(client: &RpcClient, chain: &ChainInfo, node_name: &str) -> CheckResult {
    let chain_name = chain.shortname.clone();
    let mut result = CheckResult {
        chain: chain_name.clone(),
        node: node_name.to_string(),
        res: None,
        exc: None,
        block_number: None,
        block_number_lag: None,
        success: false,
    };

    match client
        .request(
            &chain_name,
            probe_request_data(chain),
            Some(node_name),
            Some("__evmrpc_check__"),
            RequestParams::default(),
        )
        .await
    {
        Ok(resp) => {
            result.res = Some(resp.data.clone());
            match evaluate_probe(&resp.data, chain, &mut result) {
                Ok(()) => result.success = true,
                Err(message) => result.exc = Some(message),
            }
        }
        Err(err) => result.exc = Some(err.to_string()),
    }
    result
}

fn apply_block_lag(results: &mut [CheckResult], max_block_number_lag: u64) {
    let mut max_bn_by_chain: HashMap<&str, u64> = HashMap::new();
    for result in results.iter() {
        if let Some(block_number) = result.block_number {
            let entry = max_bn_by_chain.entry(result.chain.as_str()).or_default();
            *entry = (*entry).max(block_number);
        }
    }
    let max_bn_by_chain: HashMap<String, u64> = max_bn_by_chain
        .into_iter()
        .map(|(chain, bn)| (chain.to_string(), bn))
        .collect();

    for result in results.iter_mut() {
        let (Some(block_number), Some(max_bn)) = (
            result.block_number,
            max_bn_by_chain.get(&result.chain).copied(),
        ) else {
            continue;
        };
        if block_number == 0 || max_bn == 0 {
            continue;
        }
        let lag = max_bn - block_number;
        result.block_number_lag = Some(lag);
        if result.success && lag > max_block_number_lag {
            result.success = false;
            if result.exc.is_none() {
                result.exc = Some(format!(
                    "block_number_lag {lag} > {max_block_number_lag}"
                ));
            }
        }
    }
}

/// Probes every configured node of every matching chain and returns one
/// record per `(chain, node)`.
pub async fn run_check(
    client: &RpcClient,
    registry: &ChainRegistry,
    options: &CheckOptions,
) -> Vec<CheckResult> {
    let probes: Vec<(&ChainInfo, String)> = client
        .chains()
        .iter()
        .filter_map(|(chain_name, nodes)| {
            let chain = registry.by_name(chain_name)?;
            if chain.non_evm {
                return None;
            }
            if let Some(filter) = &options.chain_names {
                if !filter.iter().any(|name| name == chain_name) {
                    return None;
                }
            }
            Some((chain, nodes))
        })
        .flat_map(|(chain, nodes)| nodes.keys().map(move |node| (chain, node.clone())))
        .collect();

    let mut results = if options.sequential {
        let mut seq_results = Vec::with_capacity(probes.len());
        let mut prev_chain: Option<&str> = None;
        for (chain, node_name) in &probes {
            if let Some(prev) = prev_chain {
                if !options.per_chain_pause.is_zero() && prev != chain.shortname {
                    tokio::time::sleep(options.per_chain_pause).await;
                }
            }
            seq_results.push(probe_one(client, chain, node_name).await);
            prev_chain = Some(chain.shortname.as_str());
        }
        seq_results
    } else {
        join_all(
            probes
                .iter()
                .map(|(chain, node_name)| probe_one(client, chain, node_name)),
        )
        .await
    };

    if let Some(max_lag) = options.max_block_number_lag {
        apply_block_lag(&mut results, max_lag);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::REGISTRY;

    fn sample_result(chain: &str, node: &str, block_number: Option<u64>) -> CheckResult {
        CheckResult {
            chain: chain.to_string(),
            node: node.to_string(),
            res: None,
            exc: None,
            block_number,
            block_number_lag: None,
            success: block_number.is_some(),
        }
    }

    #[test]
    fn test_probe_request_data_includes_multicall_when_known() {
        let mainnet = REGISTRY.by_name("mainnet").unwrap();
        let data = probe_request_data(mainnet);
        assert_eq!(data.as_array().unwrap().len(), 3);

        let bouncebit = REGISTRY.by_name("bouncebit").unwrap();
        let data = probe_request_data(bouncebit);
        assert_eq!(data.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_evaluate_probe_checks_chain_id() {
        let mainnet = REGISTRY.by_name("mainnet").unwrap();
        let mut result = sample_result("mainnet", "quiknode", None);

        let data = json!([
            {"id": 1, "result": "0x1"},
            {"id": 2, "result": "0x100"},
            {"id": 3, "result": CHECK_RES_MC_DATA},
        ]);
        evaluate_probe(&data, mainnet, &mut result).unwrap();
        assert_eq!(result.block_number, Some(0x100));

        let data = json!([
            {"id": 1, "result": "0x89"},
            {"id": 2, "result": "0x100"},
        ]);
        let err = evaluate_probe(&data, mainnet, &mut result).unwrap_err();
        assert!(err.contains("chain_id"));
    }

    #[test]
    fn test_evaluate_probe_checks_multicall_blob() {
        let mainnet = REGISTRY.by_name("mainnet").unwrap();
        let mut result = sample_result("mainnet", "quiknode", None);
        let data = json!([
            {"id": 1, "result": "0x1"},
            {"id": 2, "result": "0x100"},
            {"id": 3, "result": "0xdeadbeef"},
        ]);
        let err = evaluate_probe(&data, mainnet, &mut result).unwrap_err();
        assert!(err.contains("eth_call"));
        // The block number survives the later failure.
        assert_eq!(result.block_number, Some(0x100));
    }

    #[test]
    fn test_apply_block_lag_downgrades_stragglers() {
        let mut results = vec![
            sample_result("mainnet", "a", Some(1000)),
            sample_result("mainnet", "b", Some(995)),
            sample_result("mainnet", "c", Some(900)),
            sample_result("polygon", "d", Some(50)),
            sample_result("polygon", "e", None),
        ];
        apply_block_lag(&mut results, 10);

        assert!(results[0].success);
        assert_eq!(results[0].block_number_lag, Some(0));
        assert!(results[1].success);
        assert_eq!(results[1].block_number_lag, Some(5));
        assert!(!results[2].success);
        assert_eq!(results[2].block_number_lag, Some(100));
        assert!(results[2].exc.as_deref().unwrap().contains("block_number_lag"));
        // Separate chain with a single reporting node: zero lag.
        assert!(results[3].success);
        assert_eq!(results[3].block_number_lag, Some(0));
        assert!(results[4].block_number_lag.is_none());
    }
}
