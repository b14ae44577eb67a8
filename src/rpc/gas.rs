//! Gas parameter building for the synthetic `ext_estimateGas` method.
//!
//! Produces EIP-1559 or legacy gas-price parameters plus a gas-units
//! estimate, all hex-encoded. The base data comes from helper JSON-RPC calls
//! issued through a [`GasRpc`] handler, except on chains where the fee data
//! of the RPC nodes is unusable and a gas-station HTTP API is consulted
//! instead (polygon, polygonzkevm).

use crate::error::Error;
use crate::utils::{parse_hex_u128, to_hex};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;

/// Partial equivalent of the usual `TxParams` object: `from`, `to`, `data`,
/// `value`, gas pricing fields; all quantities hex-encoded strings.
pub type TxParams = Map<String, Value>;

pub const POLYGON_GASSTATION_URL: &str = "https://gasstation.polygon.technology/v2";
pub const POLYGONZKEVM_GASSTATION_URL: &str = "https://gasstation.polygon.technology/zkevm";

/// Chains where EIP-1559 fee data is absent or unusable:
/// rootstock (no EIP-1559), polygonzkevm (no `baseFeePerGas` in blocks;
/// recommends its gas-station API), merlin (fixed-price fee model).
pub const PRE_EIP1559_CHAIN_IDS: &[u64] = &[30, 1101, 4200];

/// Chains that reject gas estimation without a `from` address.
const FROM_REQUIRED_CHAIN_IDS: &[u64] = &[4200, 59144];

pub const DEFAULT_GAS_PRICE_EXTRA_PCT: f64 = 20.0;
pub const DEFAULT_GAS_PRIORITY_FEE_EXTRA_PCT: f64 = 10.0;
pub const DEFAULT_GAS_UNITS_EXTRA_PCT: f64 = 100.0;
pub const DEFAULT_GASSTATION_CACHE_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, ThisError)]
pub enum GasError {
    /// Deliberate requester-facing error; the value ends up in the `error`
    /// field of the response.
    #[error("gas parameter error: {0}")]
    Data(Value),
    /// The node does not implement a method the builder needs.
    #[error("method unavailable: {0:?}")]
    MethodUnavailable(Vec<Value>),
    /// Malformed helper results, gas-station trouble, and other conditions
    /// where falling back to plain `eth_estimateGas` is the best answer.
    #[error("unexpected gas builder error: {0}")]
    Unexpected(String),
    #[error(transparent)]
    Upstream(Error),
}

impl GasError {
    pub fn message(message: impl Into<String>) -> Self {
        Self::Data(json!({"message": message.into()}))
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

/// Handler for the helper calls against the upstream node:
/// `[{method, params}, ...] -> [result, ...]`.
///
/// The implementation owns the `jsonrpc`/`id` envelope, surfaces upstream
/// error objects as [`GasError::Data`], and unknown-method errors
/// (`32601`/`-32601`) as [`GasError::MethodUnavailable`].
#[async_trait]
pub trait GasRpc: Send + Sync {
    async fn call(&self, calls: Vec<Value>) -> Result<Vec<Value>, GasError>;
}

/// Integer percentage bump: `add_pct(1234, 10) == 1357`.
#[must_use]
pub fn add_pct(value: u128, extra_pct: f64) -> u128 {
    const FRAC_MULT: i128 = 10_000;
    #[allow(clippy::cast_possible_truncation)]
    let extra_frac = (extra_pct * FRAC_MULT as f64 / 100.0).floor() as i128;
    let result = (value as i128) * (FRAC_MULT + extra_frac) / FRAC_MULT;
    result.max(0) as u128
}

fn add_pct_hex(value: &str, extra_pct: f64) -> Result<String, GasError> {
    let parsed = parse_hex_u128(value)
        .ok_or_else(|| GasError::unexpected(format!("non-hex gas value {value:?}")))?;
    Ok(to_hex(add_pct(parsed, extra_pct)))
}

#[must_use]
pub fn gwei_to_wei(value: f64) -> u128 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let wei = (value * 1e9) as u128;
    wei
}

/// Strips incoming gas pricing fields (they get rebuilt) and hexifies
/// decimal `value`/`chainId` entries.
#[must_use]
pub fn normalize_tx_params(data: &Map<String, Value>) -> TxParams {
    let mut result = data.clone();
    for key in ["gas", "gasPrice", "maxFeePerGas", "maxPriorityFeePerGas"] {
        result.remove(key);
    }
    for key in ["value", "chainId"] {
        let hexified = match result.get(key) {
            Some(Value::Number(num)) => num.as_u64().map(|num| to_hex(u128::from(num))),
            Some(Value::String(text))
                if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) =>
            {
                text.parse::<u128>().ok().map(to_hex)
            }
            _ => None,
        };
        if let Some(hex) = hexified {
            result.insert(key.to_string(), json!(hex));
        }
    }
    result
}

fn result_hex(results: &[Value], idx: usize) -> Result<u128, GasError> {
    results
        .get(idx)
        .and_then(Value::as_str)
        .and_then(parse_hex_u128)
        .ok_or_else(|| GasError::unexpected(format!("non-hex helper result at {idx}")))
}

fn field_hex(value: &Value, key: &str) -> Result<u128, GasError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(parse_hex_u128)
        .ok_or_else(|| GasError::unexpected(format!("missing hex field {key:?}")))
}

/// Builds EIP-1559-format gas price parameters from the priority fee and
/// the latest block's base fee. Fails with `MethodUnavailable` on chains
/// without `eth_maxPriorityFeePerGas`.
async fn build_gas_price_dynamic(rpc: &dyn GasRpc) -> Result<TxParams, GasError> {
    let calls = vec![
        json!({"method": "eth_maxPriorityFeePerGas", "params": []}),
        json!({"method": "eth_getBlockByNumber", "params": ["latest", false]}),
    ];
    let results = rpc.call(calls).await?;
    let max_priority_fee = result_hex(&results, 0)?;
    let block = results
        .get(1)
        .ok_or_else(|| GasError::unexpected("missing block result"))?;
    let base_fee = field_hex(block, "baseFeePerGas")?;

    let max_fee_per_gas = max_priority_fee + 2 * base_fee;
    let mut params = TxParams::new();
    params.insert("maxPriorityFeePerGas".to_string(), json!(to_hex(max_priority_fee)));
    params.insert("maxFeePerGas".to_string(), json!(to_hex(max_fee_per_gas)));
    Ok(params)
}

/// Builds the pre-EIP-1559 gas price parameter from `eth_gasPrice`.
async fn build_gas_price_legacy(rpc: &dyn GasRpc) -> Result<TxParams, GasError> {
    let results = rpc
        .call(vec![json!({"method": "eth_gasPrice", "params": []})])
        .await?;
    let gas_price = result_hex(&results, 0)?;
    let mut params = TxParams::new();
    params.insert("gasPrice".to_string(), json!(to_hex(gas_price)));
    Ok(params)
}

/// `linea_estimateGas` returns price and units in one call.
async fn build_gas_params_linea(
    tx_params: &TxParams,
    rpc: &dyn GasRpc,
) -> Result<TxParams, GasError> {
    // Specifying the block (`[tx_params, "latest"]`) can produce error
    // responses here.
    let results = rpc
        .call(vec![json!({"method": "linea_estimateGas", "params": [tx_params]})])
        .await?;
    let resp = results
        .first()
        .ok_or_else(|| GasError::unexpected("missing linea_estimateGas result"))?;
    let gas_limit = field_hex(resp, "gasLimit")?;
    let base_fee_per_gas = field_hex(resp, "baseFeePerGas")?;
    let priority_fee_per_gas = field_hex(resp, "priorityFeePerGas")?;

    let mut params = TxParams::new();
    params.insert(
        "maxPriorityFeePerGas".to_string(),
        json!(to_hex(priority_fee_per_gas)),
    );
    params.insert(
        "maxFeePerGas".to_string(),
        json!(to_hex(priority_fee_per_gas + 2 * base_fee_per_gas)),
    );
    params.insert("gas".to_string(), json!(to_hex(gas_limit)));
    Ok(params)
}

async fn build_gas_units(tx_params: &TxParams, rpc: &dyn GasRpc) -> Result<TxParams, GasError> {
    let results = rpc
        .call(vec![
            json!({"method": "eth_estimateGas", "params": [tx_params, "latest"]}),
        ])
        .await?;
    let gas_units = result_hex(&results, 0)?;
    let mut params = TxParams::new();
    params.insert("gas".to_string(), json!(to_hex(gas_units)));
    Ok(params)
}

// Simple in-memory cache over a small set of gas-station URLs:
// url -> (fetch time, response data). Concurrent fetches before the first
// write are tolerated; last writer wins.
static GASSTATION_CACHE: LazyLock<Mutex<HashMap<String, (Instant, Value)>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

pub struct GasHelper<'a> {
    pub chain_id: u64,
    pub rpc: &'a dyn GasRpc,
    pub http: reqwest::Client,
    pub gasstation_key: String,
    pub gasstation_cache_ttl: Duration,
    pub gas_price_extra_pct: f64,
    pub gas_priority_fee_extra_pct: f64,
    pub gas_units_extra_pct: f64,
}

impl<'a> GasHelper<'a> {
    #[must_use]
    pub fn new(chain_id: u64, rpc: &'a dyn GasRpc, http: reqwest::Client) -> Self {
        Self {
            chain_id,
            rpc,
            http,
            gasstation_key: "fast".to_string(),
            gasstation_cache_ttl: DEFAULT_GASSTATION_CACHE_TTL,
            gas_price_extra_pct: DEFAULT_GAS_PRICE_EXTRA_PCT,
            gas_priority_fee_extra_pct: DEFAULT_GAS_PRIORITY_FEE_EXTRA_PCT,
            gas_units_extra_pct: DEFAULT_GAS_UNITS_EXTRA_PCT,
        }
    }

    async fn request_gasstation_full(&self, url: &str) -> Result<Value, GasError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| GasError::unexpected(format!("gasstation request failed: {err}")))?;
        let data: Value = resp
            .json()
            .await
            .map_err(|err| GasError::unexpected(format!("gasstation returned non-JSON: {err}")))?;
        tracing::debug!(x_url = url, x_data = %data, "gasstation response");
        if !data.is_object() {
            return Err(GasError::unexpected(format!(
                "gasstation returned non-object from {url:?}"
            )));
        }
        Ok(data)
    }

    async fn request_gasstation_full_cached(&self, url: &str) -> Result<Value, GasError> {
        {
            let cache = GASSTATION_CACHE
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some((fetched_at, data)) = cache.get(url) {
                if fetched_at.elapsed() < self.gasstation_cache_ttl {
                    tracing::debug!(x_url = url, "gasstation cache hit");
                    return Ok(data.clone());
                }
                tracing::debug!(x_url = url, "gasstation cache expired");
            } else {
                tracing::debug!(x_url = url, "gasstation cache miss");
            }
        }

        let fetched_at = Instant::now();
        let data = self.request_gasstation_full(url).await?;
        GASSTATION_CACHE
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), (fetched_at, data.clone()));
        Ok(data)
    }

    async fn request_gasstation(&self, url: &str) -> Result<Value, GasError> {
        let data = if self.gasstation_cache_ttl.is_zero() {
            self.request_gasstation_full(url).await?
        } else {
            self.request_gasstation_full_cached(url).await?
        };
        let keyed = data.get(&self.gasstation_key).cloned().unwrap_or(Value::Null);
        if keyed.is_null() {
            return Err(GasError::unexpected(format!(
                "gasstation returned no data for key {:?} from {url:?}",
                self.gasstation_key
            )));
        }
        Ok(keyed)
    }

    /// Polygon RPC nodes don't reliably return usable fee data; the
    /// gas-station API is the documented source.
    async fn build_gas_price_polygon(&self) -> Result<TxParams, GasError> {
        let data = self.request_gasstation(POLYGON_GASSTATION_URL).await?;
        let max_fee = data
            .get("maxFee")
            .and_then(Value::as_f64)
            .ok_or_else(|| GasError::unexpected("gasstation data missing maxFee"))?;
        let max_priority_fee = data
            .get("maxPriorityFee")
            .and_then(Value::as_f64)
            .ok_or_else(|| GasError::unexpected("gasstation data missing maxPriorityFee"))?;
        let mut params = TxParams::new();
        params.insert("maxFeePerGas".to_string(), json!(to_hex(gwei_to_wei(max_fee))));
        params.insert(
            "maxPriorityFeePerGas".to_string(),
            json!(to_hex(gwei_to_wei(max_priority_fee))),
        );
        Ok(params)
    }

    async fn build_gas_price_polygonzkevm(&self) -> Result<TxParams, GasError> {
        let data = self.request_gasstation(POLYGONZKEVM_GASSTATION_URL).await?;
        let gwei = data
            .as_f64()
            .ok_or_else(|| GasError::unexpected("gasstation data is not a number"))?;
        let mut params = TxParams::new();
        params.insert("gasPrice".to_string(), json!(to_hex(gwei_to_wei(gwei))));
        Ok(params)
    }

    async fn build_gas_price_base(&self) -> Result<TxParams, GasError> {
        if self.chain_id == 137 {
            return self.build_gas_price_polygon().await;
        }
        if self.chain_id == 1101 {
            return self.build_gas_price_polygonzkevm().await;
        }
        if PRE_EIP1559_CHAIN_IDS.contains(&self.chain_id) {
            return build_gas_price_legacy(self.rpc).await;
        }

        match build_gas_price_dynamic(self.rpc).await {
            Ok(params) => Ok(params),
            Err(GasError::MethodUnavailable(_)) => {
                tracing::error!(chain_id = self.chain_id, "failed to build EIP-1559 gas");
                build_gas_price_legacy(self.rpc).await
            }
            Err(err) => Err(err),
        }
    }

    fn add_extra_gas_price_and_units(&self, tx_params: &TxParams) -> Result<TxParams, GasError> {
        let mut tx_params = tx_params.clone();
        for (key, pct) in [
            ("gasPrice", self.gas_price_extra_pct),
            ("maxFeePerGas", self.gas_price_extra_pct),
            // The `maxPriorityFeePerGas` extra isn't necessarily useful,
            // but should be harmless.
            ("maxPriorityFeePerGas", self.gas_priority_fee_extra_pct),
            ("gas", self.gas_units_extra_pct),
        ] {
            if pct == 0.0 {
                continue;
            }
            let Some(value) = tx_params.get(key).and_then(Value::as_str) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            let bumped = add_pct_hex(value, pct)?;
            tx_params.insert(key.to_string(), json!(bumped));
        }
        Ok(tx_params)
    }

    async fn build_gas_params_pre(&self, tx_params: &TxParams) -> Result<TxParams, GasError> {
        let from_missing = tx_params
            .get("from")
            .and_then(Value::as_str)
            .is_none_or(str::is_empty);
        if FROM_REQUIRED_CHAIN_IDS.contains(&self.chain_id) && from_missing {
            return Err(GasError::message(
                "Tx params need specified `from` for linea and merlin",
            ));
        }

        if self.chain_id == 59144 {
            return build_gas_params_linea(tx_params, self.rpc).await;
        }

        let gas_price_params = self.build_gas_price_base().await?;
        let mut estimate_params = tx_params.clone();
        estimate_params.extend(gas_price_params.clone());
        let gas_units_params = build_gas_units(&estimate_params, self.rpc).await?;

        let mut result = gas_price_params;
        result.insert(
            "gas".to_string(),
            gas_units_params
                .get("gas")
                .cloned()
                .unwrap_or_else(|| json!("0x0")),
        );
        Ok(result)
    }

    /// The full pipeline: base parameters per chain family, then the
    /// configured surcharges.
    pub async fn build_gas_params(&self, tx_params: &TxParams) -> Result<TxParams, GasError> {
        let pre_result = self.build_gas_params_pre(tx_params).await?;
        self.add_extra_gas_price_and_units(&pre_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn test_add_pct() {
        assert_eq!(add_pct(1234, 10.0), 1357);
        assert_eq!(add_pct(1234, -10.0), 1110);
        assert_eq!(add_pct(0, 100.0), 0);
        assert_eq!(add_pct(100, 0.0), 100);
    }

    #[test]
    fn test_gwei_to_wei() {
        assert_eq!(gwei_to_wei(1.0), 1_000_000_000);
        assert_eq!(gwei_to_wei(30.5), 30_500_000_000);
    }

    #[test]
    fn test_normalize_tx_params() {
        let data: Map<String, Value> = serde_json::from_value(json!({
            "from": "0x29097A7dc18F1d7B736Ead6328370913AB8d845c",
            "to": "0xcA11bde05977b3631167028862bE2a173976CA11",
            "gas": "0x5208",
            "gasPrice": "0x1",
            "maxFeePerGas": "0x2",
            "maxPriorityFeePerGas": "0x3",
            "value": 10,
            "chainId": "137"
        }))
        .unwrap();
        let normalized = normalize_tx_params(&data);
        assert!(normalized.get("gas").is_none());
        assert!(normalized.get("gasPrice").is_none());
        assert!(normalized.get("maxFeePerGas").is_none());
        assert_eq!(normalized["value"], json!("0xa"));
        assert_eq!(normalized["chainId"], json!("0x89"));
        assert_eq!(normalized["to"], data["to"]);
    }

    struct ScriptedRpc {
        responses: Mutex<VecDeque<Result<Vec<Value>, GasError>>>,
        calls: Mutex<Vec<Vec<Value>>>,
    }

    impl ScriptedRpc {
        fn new(responses: Vec<Result<Vec<Value>, GasError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GasRpc for ScriptedRpc {
        async fn call(&self, calls: Vec<Value>) -> Result<Vec<Value>, GasError> {
            self.calls.lock().unwrap().push(calls);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GasError::unexpected("no scripted response")))
        }
    }

    fn helper<'a>(chain_id: u64, rpc: &'a ScriptedRpc) -> GasHelper<'a> {
        crate::install_crypto_provider();
        GasHelper::new(chain_id, rpc, reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_dynamic_path_with_surcharges() {
        let rpc = ScriptedRpc::new(vec![
            // eth_maxPriorityFeePerGas + latest block
            Ok(vec![json!("0x64"), json!({"baseFeePerGas": "0xc8"})]),
            // eth_estimateGas
            Ok(vec![json!("0x5208")]),
        ]);
        let helper = helper(1, &rpc);
        let params = helper.build_gas_params(&TxParams::new()).await.unwrap();

        // priority 0x64 + 10% = 0x6e; maxFee (0x64 + 2*0xc8) + 20% = 0x258;
        // gas 0x5208 + 100% = 0xa410
        assert_eq!(params["maxPriorityFeePerGas"], json!("0x6e"));
        assert_eq!(params["maxFeePerGas"], json!("0x258"));
        assert_eq!(params["gas"], json!("0xa410"));

        let calls = rpc.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][0]["method"], json!("eth_maxPriorityFeePerGas"));
        assert_eq!(calls[1][0]["method"], json!("eth_estimateGas"));
    }

    #[tokio::test]
    async fn test_dynamic_falls_back_to_legacy_on_method_unavailable() {
        let rpc = ScriptedRpc::new(vec![
            Err(GasError::MethodUnavailable(vec![json!({"code": -32601})])),
            // eth_gasPrice
            Ok(vec![json!("0x64")]),
            // eth_estimateGas
            Ok(vec![json!("0x10")]),
        ]);
        let helper = helper(42_161, &rpc);
        let params = helper.build_gas_params(&TxParams::new()).await.unwrap();
        assert_eq!(params["gasPrice"], json!("0x78")); // 0x64 + 20%
        assert_eq!(params["gas"], json!("0x20")); // 0x10 + 100%
        assert!(params.get("maxFeePerGas").is_none());
    }

    #[tokio::test]
    async fn test_pre_eip1559_chain_goes_straight_to_legacy() {
        let rpc = ScriptedRpc::new(vec![Ok(vec![json!("0x64")]), Ok(vec![json!("0x10")])]);
        let helper = helper(30, &rpc);
        let params = helper.build_gas_params(&TxParams::new()).await.unwrap();
        assert_eq!(params["gasPrice"], json!("0x78"));
        let calls = rpc.calls.lock().unwrap();
        assert_eq!(calls[0][0]["method"], json!("eth_gasPrice"));
    }

    #[tokio::test]
    async fn test_linea_requires_from() {
        let rpc = ScriptedRpc::new(vec![]);
        let helper = helper(59_144, &rpc);
        let err = helper.build_gas_params(&TxParams::new()).await.unwrap_err();
        assert!(matches!(err, GasError::Data(_)));
    }

    #[tokio::test]
    async fn test_linea_single_call_path() {
        let rpc = ScriptedRpc::new(vec![Ok(vec![json!({
            "gasLimit": "0x100",
            "baseFeePerGas": "0x10",
            "priorityFeePerGas": "0x8"
        })])]);
        let helper = helper(59_144, &rpc);
        let mut tx = TxParams::new();
        tx.insert("from".to_string(), json!("0x29097A7dc18F1d7B736Ead6328370913AB8d845c"));
        let params = helper.build_gas_params(&tx).await.unwrap();
        // priority 0x8 + 10%; maxFee (0x8 + 2*0x10) + 20%; gas 0x100 + 100%
        assert_eq!(params["maxPriorityFeePerGas"], json!("0x8"));
        assert_eq!(params["maxFeePerGas"], json!("0x30"));
        assert_eq!(params["gas"], json!("0x200"));
        let calls = rpc.calls.lock().unwrap();
        assert_eq!(calls[0][0]["method"], json!("linea_estimateGas"));
    }
}
