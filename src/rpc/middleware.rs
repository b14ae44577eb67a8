//! The middleware pipeline wrapping the upstream caller.
//!
//! Middlewares are stacked; the first in declaration order is the outermost
//! one. Dispatch is an interpreter over the stack: [`Next`] is a cursor into
//! the remaining middlewares, bottoming out at
//! [`RpcClient::call_upstream`](crate::rpc::client::RpcClient).
//!
//! Two orchestration patterns recur:
//!
//! - *single-request preprocessor* (`MangleGetlogs`): split the request into
//!   singles, transform each, recombine preserving the original shape;
//! - *selective handler* (`ChainId`, `ExtGas`): partition singles into
//!   normal ones (forwarded as one request) and relevant ones (handled
//!   locally, concurrently with the normal leg), then reinsert the local
//!   results at their original positions.

use crate::error::{Error, Result};
use crate::rpc::client::RpcClient;
use crate::rpc::gas::{GasError, GasHelper, GasRpc, normalize_tx_params};
use crate::rpc::models::{
    from_singles, synthesize_error, to_singles, BatchRequest, RequestMeta, RpcRequest,
    RpcResponse, SingleRequest,
};
use crate::utils::{parse_hex_u64, pick_out_special_items, put_in_special_results, to_hex};
use async_trait::async_trait;
use futures::future::try_join_all;
use futures::try_join;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub type MiddlewareStack = Vec<Arc<dyn Middleware>>;

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, req: RpcRequest, next: Next<'_>) -> Result<RpcResponse>;
}

/// Cursor into the middleware stack; `run` dispatches to the next
/// middleware, or to the upstream caller once the stack is exhausted.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stack: &'a [Arc<dyn Middleware>],
    client: &'a RpcClient,
}

impl<'a> Next<'a> {
    pub(crate) fn new(stack: &'a [Arc<dyn Middleware>], client: &'a RpcClient) -> Self {
        Self { stack, client }
    }

    pub async fn run(self, req: RpcRequest) -> Result<RpcResponse> {
        match self.stack.split_first() {
            Some((middleware, rest)) => {
                let next = Self {
                    stack: rest,
                    client: self.client,
                };
                middleware.handle(req, next).await
            }
            None => self.client.call_upstream(req).await,
        }
    }

    pub(crate) fn http_client(&self) -> reqwest::Client {
        self.client.http().clone()
    }
}

/// The reference stack. The topmost middleware sees the caller's request
/// first; `Unbatch` should stay at the bottom.
#[must_use]
pub fn default_stack() -> MiddlewareStack {
    vec![
        // Pick out and handle `ext_estimateGas` requests.
        Arc::new(ExtGasMiddleware),
        // Answer `eth_chainId` without any network calls.
        Arc::new(ChainIdMiddleware),
        // Clamp `eth_getLogs` ranges so the upstream returns at least
        // something instead of rejecting the span outright.
        Arc::new(MangleGetlogsMiddleware),
        // Issue separate requests on nodes that don't support batches.
        Arc::new(UnbatchMiddleware),
    ]
}

/// The *selective handler* half of a middleware: which singles it takes
/// over, and how each is answered.
#[async_trait]
trait SelectiveHandler: Send + Sync {
    fn is_relevant(&self, req: &SingleRequest) -> bool;
    async fn handle_single(&self, req: SingleRequest, next: Next<'_>) -> Result<RpcResponse>;
}

async fn handle_normal(
    reqs: Vec<SingleRequest>,
    next: Next<'_>,
) -> Result<RpcResponse> {
    // A lone normal request goes out unbatched; its response is wrapped in
    // a list to keep recombination uniform.
    let req = from_singles(reqs, None)?;
    let was_single = req.is_single();
    let mut resp = next.run(req).await?;
    if was_single {
        resp.data = Value::Array(vec![resp.data]);
    }
    Ok(resp)
}

async fn handle_relevant<H: SelectiveHandler + ?Sized>(
    handler: &H,
    reqs: Vec<SingleRequest>,
    top_req: &RpcRequest,
    next: Next<'_>,
) -> Result<RpcResponse> {
    let resps = try_join_all(
        reqs.into_iter()
            .map(|req| handler.handle_single(req, next)),
    )
    .await?;
    Ok(RpcResponse {
        data: Value::Array(resps.into_iter().map(|resp| resp.data).collect()),
        req: top_req.clone(),
    })
}

async fn handle_selective<H: SelectiveHandler + ?Sized>(
    handler: &H,
    name: &'static str,
    req: RpcRequest,
    next: Next<'_>,
) -> Result<RpcResponse> {
    let singles = to_singles(&req);
    let (reqs_normal, reqs_relevant_with_idx) =
        pick_out_special_items(singles, |single| handler.is_relevant(single));

    if reqs_relevant_with_idx.is_empty() {
        // Straight pass-through.
        return next.run(req).await;
    }

    let reqs_relevant: Vec<SingleRequest> = reqs_relevant_with_idx
        .iter()
        .map(|(_, single)| single.clone())
        .collect();

    if reqs_normal.is_empty() {
        let resp = handle_relevant(handler, reqs_relevant, &req, next).await?;
        // Non-batched request gets a non-batched result.
        return Ok(resp.match_shape());
    }

    let (resp_normal, resp_relevant) = try_join!(
        handle_normal(reqs_normal, next),
        handle_relevant(handler, reqs_relevant, &req, next),
    )?;

    let data_normal = match resp_normal.data {
        Value::Array(items) => items,
        other => {
            // Likely some error happened; the locally handled results are
            // dropped in favor of the upstream error body.
            tracing::warn!(
                middleware = name,
                "ignoring relevant results due to non-list normal response"
            );
            return Ok(RpcResponse {
                data: other,
                req: resp_normal.req,
            });
        }
    };

    let Value::Array(data_relevant) = resp_relevant.data else {
        return Err(Error::internal("relevant results must be a list"));
    };
    if data_relevant.len() != reqs_relevant_with_idx.len() {
        return Err(Error::internal("relevant result count mismatch"));
    }

    let data_relevant_with_idx: Vec<(usize, Value)> = reqs_relevant_with_idx
        .iter()
        .map(|(idx, _)| *idx)
        .zip(data_relevant)
        .collect();
    let data_full = put_in_special_results(data_normal, data_relevant_with_idx);
    Ok(RpcResponse {
        data: Value::Array(data_full),
        req: resp_normal.req,
    })
}

/// Answers `eth_chainId` from the statically known chain id, skipping the
/// upstream entirely.
pub struct ChainIdMiddleware;

#[async_trait]
impl SelectiveHandler for ChainIdMiddleware {
    fn is_relevant(&self, req: &SingleRequest) -> bool {
        req.method() == Some("eth_chainId") && req.meta.params.chain_id.is_some()
    }

    async fn handle_single(&self, req: SingleRequest, _next: Next<'_>) -> Result<RpcResponse> {
        let chain_id = req
            .meta
            .params
            .chain_id
            .ok_or_else(|| Error::internal("chain id vanished after is_relevant"))?;
        Ok(RpcResponse::from_single_req(
            &req,
            json!(to_hex(u128::from(chain_id))),
        ))
    }
}

#[async_trait]
impl Middleware for ChainIdMiddleware {
    fn name(&self) -> &'static str {
        "ChainId"
    }

    async fn handle(&self, req: RpcRequest, next: Next<'_>) -> Result<RpcResponse> {
        handle_selective(self, self.name(), req, next).await
    }
}

/// Rewrites `eth_getLogs` block ranges so that the scan window never
/// exceeds the node's configured maximum.
pub struct MangleGetlogsMiddleware;

impl MangleGetlogsMiddleware {
    fn mangle_eth_getlogs(body: &Value, max_blocks_distance: u64) -> Value {
        let params = body.get("params").and_then(|params| params.get(0));
        let from_block_hex = params
            .and_then(|params| params.get("fromBlock"))
            .and_then(Value::as_str);
        let to_block_hex = params
            .and_then(|params| params.get("toBlock"))
            .and_then(Value::as_str);
        let (Some(from_block_hex), Some(to_block_hex)) = (from_block_hex, to_block_hex) else {
            tracing::error!("missing block params in eth_getLogs mangling");
            return body.clone();
        };

        let (Some(from_block), Some(to_block)) =
            (parse_hex_u64(from_block_hex), parse_hex_u64(to_block_hex))
        else {
            tracing::error!(
                from_block = from_block_hex,
                to_block = to_block_hex,
                "non-hex blocks in eth_getLogs mangling"
            );
            return body.clone();
        };

        let distance = i128::from(to_block) - i128::from(from_block);
        if distance <= i128::from(max_blocks_distance) {
            return body.clone();
        }

        let new_from_block_hex = to_hex(u128::from(to_block - max_blocks_distance));
        tracing::info!(
            distance,
            max_blocks_distance,
            from_block = from_block_hex,
            new_from_block = %new_from_block_hex,
            to_block = to_block_hex,
            "mangling eth_getLogs block range"
        );
        let mut mangled = body.clone();
        if let Some(params) = mangled
            .get_mut("params")
            .and_then(|params| params.get_mut(0))
            .and_then(Value::as_object_mut)
        {
            params.insert("fromBlock".to_string(), json!(new_from_block_hex));
        }
        mangled
    }

    fn process_single(req: SingleRequest) -> SingleRequest {
        if !req.meta.params.allow_getlogs_mangle || req.method() != Some("eth_getLogs") {
            return req;
        }
        let Some(max_blocks_distance) = req.meta.node.max_blocks_distance else {
            return req;
        };
        let body = Self::mangle_eth_getlogs(&req.body, max_blocks_distance);
        SingleRequest {
            body,
            meta: req.meta,
        }
    }
}

#[async_trait]
impl Middleware for MangleGetlogsMiddleware {
    fn name(&self) -> &'static str {
        "MangleGetlogs"
    }

    async fn handle(&self, req: RpcRequest, next: Next<'_>) -> Result<RpcResponse> {
        let singles = to_singles(&req)
            .into_iter()
            .map(Self::process_single)
            .collect();
        let req_mangled = from_singles(singles, Some(&req))?;
        next.run(req_mangled).await
    }
}

/// Fans a batch out into concurrent single calls when the node does not
/// support batch requests, and reassembles the responses in order.
pub struct UnbatchMiddleware;

#[async_trait]
impl Middleware for UnbatchMiddleware {
    fn name(&self) -> &'static str {
        "Unbatch"
    }

    async fn handle(&self, req: RpcRequest, next: Next<'_>) -> Result<RpcResponse> {
        if !req.meta().node.supports_batch && !req.is_single() {
            let singles = to_singles(&req);
            let resps = try_join_all(
                singles
                    .into_iter()
                    .map(|single| next.run(RpcRequest::Single(single))),
            )
            .await?;
            return Ok(RpcResponse {
                data: Value::Array(resps.into_iter().map(|resp| resp.data).collect()),
                req,
            });
        }
        next.run(req).await
    }
}

pub const EXT_GAS_METHOD: &str = "ext_estimateGas";

fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
        Value::Number(num) => num.as_f64() != Some(0.0),
    }
}

fn pick_unknown_method_errors(data: &Value) -> Option<Vec<Value>> {
    let items = data.as_array()?;
    let errors: Vec<Value> = items
        .iter()
        .filter_map(|item| item.get("error"))
        .filter(|error| {
            matches!(
                error.get("code").and_then(Value::as_i64),
                Some(32_601 | -32_601)
            )
        })
        .cloned()
        .collect();
    if errors.is_empty() {
        None
    } else {
        Some(errors)
    }
}

/// [`GasRpc`] over the rest of the middleware stack: wraps helper calls in
/// a synthetic batch with sequential ids.
struct NextGasRpc<'a> {
    next: Next<'a>,
    meta: RequestMeta,
}

#[async_trait]
impl GasRpc for NextGasRpc<'_> {
    async fn call(&self, calls: Vec<Value>) -> Result<Vec<Value>, GasError> {
        let bodies: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(idx, call)| {
                let mut body = Map::new();
                body.insert("jsonrpc".to_string(), json!("2.0"));
                body.insert("id".to_string(), json!(idx + 1));
                if let Some(call_obj) = call.as_object() {
                    for (key, value) in call_obj {
                        body.insert(key.clone(), value.clone());
                    }
                }
                Value::Object(body)
            })
            .collect();
        let req = RpcRequest::Batch(BatchRequest {
            bodies,
            meta: self.meta.clone(),
        });

        let resp = match self.next.run(req).await {
            Ok(resp) => resp,
            Err(Error::RetriableResponse(resp)) => {
                if let Some(errors) = pick_unknown_method_errors(&resp.data) {
                    return Err(GasError::MethodUnavailable(errors));
                }
                return Err(GasError::Upstream(Error::RetriableResponse(resp)));
            }
            Err(err) => return Err(GasError::Upstream(err)),
        };

        let Value::Array(items) = &resp.data else {
            return Err(GasError::Data(
                json!({"message": "Upstream error", "x_reqs": calls, "x_resp": resp.data}),
            ));
        };
        if items.len() != calls.len() {
            return Err(GasError::Data(
                json!({"message": "Upstream error", "x_reqs": calls, "x_resp": resp.data}),
            ));
        }

        if let Some(errors) = pick_unknown_method_errors(&resp.data) {
            return Err(GasError::MethodUnavailable(errors));
        }
        let errors: Vec<&Value> = items
            .iter()
            .filter_map(|item| item.get("error"))
            .filter(|error| value_truthy(error))
            .collect();
        if let Some(first) = errors.first() {
            return Err(GasError::Data((*first).clone()));
        }

        Ok(items
            .iter()
            .map(|item| item.get("result").cloned().unwrap_or(Value::Null))
            .collect())
    }
}

/// Handles the synthetic `ext_estimateGas` method via [`GasHelper`],
/// falling back to a plain `eth_estimateGas` pass-through when the gas
/// pipeline cannot answer.
pub struct ExtGasMiddleware;

impl ExtGasMiddleware {
    async fn handle_fallback(req: SingleRequest, next: Next<'_>) -> Result<RpcResponse> {
        let mut body = req.body.clone();
        if let Some(body_obj) = body.as_object_mut() {
            body_obj.insert("method".to_string(), json!("eth_estimateGas"));
        }
        // This loses on the batching, but shouldn't normally happen anyway.
        next.run(RpcRequest::Single(SingleRequest {
            body,
            meta: req.meta,
        }))
        .await
    }

    async fn handle_gas(
        chain_id: u64,
        req: &SingleRequest,
        next: Next<'_>,
    ) -> std::result::Result<Map<String, Value>, GasError> {
        let params = req
            .body
            .get("params")
            .and_then(Value::as_array)
            .ok_or_else(|| GasError::message("Expected a params list"))?;
        if params.len() > 2 {
            return Err(GasError::message("Expected at most 2 params"));
        }
        if params.len() == 2 && params[1] != json!("latest") {
            return Err(GasError::message("Only `latest` block is supported"));
        }
        let mut data_work = params
            .first()
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| GasError::message("Expected a tx params object"))?;

        let gas_price_extra_pct = pop_pct(&mut data_work, "x_gas_price_extra_pct", 20.0);
        let gas_priority_fee_extra_pct =
            pop_pct(&mut data_work, "x_gas_priority_fee_extra_pct", 10.0);
        let gas_units_extra_pct = pop_pct(&mut data_work, "x_gas_units_extra_pct", 100.0);
        let gasstation_key = data_work
            .remove("x_gasstation_key")
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| "fast".to_string());

        let rpc = NextGasRpc {
            next,
            meta: req.meta.clone(),
        };
        let mut helper = GasHelper::new(chain_id, &rpc, next.http_client());
        helper.gasstation_key = gasstation_key;
        helper.gas_price_extra_pct = gas_price_extra_pct;
        helper.gas_priority_fee_extra_pct = gas_priority_fee_extra_pct;
        helper.gas_units_extra_pct = gas_units_extra_pct;

        let tx_params = normalize_tx_params(&data_work);
        helper.build_gas_params(&tx_params).await
    }

    /// The gas pipeline issues batched upstream requests which produce
    /// lists of errors, but this is a single request; make sure the
    /// last-response carried by the error is a single object.
    fn unwrap_single_response(mut resp: RpcResponse) -> RpcResponse {
        if let Value::Array(items) = &resp.data {
            if items.len() > 1 {
                tracing::warn!(ignored = items.len() - 1, "ignoring extra upstream errors");
            }
            if let Some(first) = items.first() {
                resp.data = first.clone();
            }
        }
        resp
    }
}

fn pop_pct(data: &mut Map<String, Value>, key: &str, default: f64) -> f64 {
    match data.remove(key) {
        Some(Value::Number(num)) => num.as_f64().unwrap_or(default),
        Some(Value::String(text)) => text.parse().unwrap_or(default),
        _ => default,
    }
}

#[async_trait]
impl SelectiveHandler for ExtGasMiddleware {
    fn is_relevant(&self, req: &SingleRequest) -> bool {
        req.method() == Some(EXT_GAS_METHOD)
    }

    async fn handle_single(&self, req: SingleRequest, next: Next<'_>) -> Result<RpcResponse> {
        let Some(chain_id) = req.meta.params.chain_id else {
            tracing::error!(
                chain = %req.meta.node.chain_name,
                "no chain id specified for ext_estimateGas"
            );
            return Self::handle_fallback(req, next).await;
        };

        match Self::handle_gas(chain_id, &req, next).await {
            Ok(result) => Ok(RpcResponse::from_single_req(&req, Value::Object(result))),
            Err(GasError::Data(error_data)) => {
                tracing::warn!(x_error = %error_data, "gas error in ext_estimateGas");
                let data = synthesize_error(&req.body, error_data);
                Ok(RpcResponse {
                    data,
                    req: RpcRequest::Single(req),
                })
            }
            Err(GasError::Upstream(Error::RetriableResponse(resp))) => {
                tracing::error!("response error in ext_estimateGas");
                Err(Error::RetriableResponse(Box::new(
                    Self::unwrap_single_response(*resp),
                )))
            }
            Err(err) => {
                tracing::error!(error = %err, "error in ext_estimateGas");
                Self::handle_fallback(req, next).await
            }
        }
    }
}

#[async_trait]
impl Middleware for ExtGasMiddleware {
    fn name(&self) -> &'static str {
        "ExtGas"
    }

    async fn handle(&self, req: RpcRequest, next: Next<'_>) -> Result<RpcResponse> {
        handle_selective(self, self.name(), req, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::rpc::models::RequestParams;

    fn single_req(body: Value, allow_mangle: bool, max_distance: Option<u64>) -> SingleRequest {
        let mut node = NodeConfig::from_config_value(
            "mainnet",
            "quiknode",
            &serde_yaml::Value::String("https://q.example/".to_string()),
        )
        .unwrap();
        node.max_blocks_distance = max_distance;
        SingleRequest {
            body,
            meta: RequestMeta {
                node: Arc::new(node),
                params: RequestParams {
                    allow_getlogs_mangle: allow_mangle,
                    chain_id: Some(1),
                },
                try_n: 0,
            },
        }
    }

    #[test]
    fn test_mangle_getlogs_clamps_wide_range() {
        let body = json!({
            "method": "eth_getLogs",
            "params": [{"fromBlock": "0x1", "toBlock": "0x2717", "address": "0xabc"}]
        });
        let req = single_req(body, true, Some(3000));
        let mangled = MangleGetlogsMiddleware::process_single(req);
        // 0x2717 = 10007; clamped from = 10007 - 3000 = 7007 = 0x1b5f
        assert_eq!(
            mangled.body["params"][0]["fromBlock"],
            json!("0x1b5f")
        );
        assert_eq!(mangled.body["params"][0]["toBlock"], json!("0x2717"));
        assert_eq!(mangled.body["params"][0]["address"], json!("0xabc"));
    }

    #[test]
    fn test_mangle_getlogs_keeps_narrow_range() {
        let body = json!({
            "method": "eth_getLogs",
            "params": [{"fromBlock": "0x10", "toBlock": "0x20"}]
        });
        let req = single_req(body.clone(), true, Some(3000));
        let mangled = MangleGetlogsMiddleware::process_single(req);
        assert_eq!(mangled.body, body);
    }

    #[test]
    fn test_mangle_getlogs_requires_opt_in_and_limit() {
        let body = json!({
            "method": "eth_getLogs",
            "params": [{"fromBlock": "0x1", "toBlock": "0xffff"}]
        });
        let req = single_req(body.clone(), false, Some(3000));
        assert_eq!(MangleGetlogsMiddleware::process_single(req).body, body);

        let req = single_req(body.clone(), true, None);
        assert_eq!(MangleGetlogsMiddleware::process_single(req).body, body);
    }

    #[test]
    fn test_mangle_getlogs_leaves_malformed_params() {
        let body = json!({
            "method": "eth_getLogs",
            "params": [{"fromBlock": "zz", "toBlock": "0x10"}]
        });
        let req = single_req(body.clone(), true, Some(3000));
        assert_eq!(MangleGetlogsMiddleware::process_single(req).body, body);

        let body = json!({"method": "eth_getLogs", "params": []});
        let req = single_req(body.clone(), true, Some(3000));
        assert_eq!(MangleGetlogsMiddleware::process_single(req).body, body);
    }

    #[test]
    fn test_pick_unknown_method_errors() {
        let data = json!([
            {"id": 1, "error": {"code": -32601, "message": "method not found"}},
            {"id": 2, "result": "0x1"}
        ]);
        let errors = pick_unknown_method_errors(&data).unwrap();
        assert_eq!(errors.len(), 1);

        let data = json!([{"id": 1, "error": {"code": -32000, "message": "other"}}]);
        assert!(pick_unknown_method_errors(&data).is_none());
        assert!(pick_unknown_method_errors(&json!({"id": 1})).is_none());
    }

    #[test]
    fn test_chain_id_relevance() {
        let mw = ChainIdMiddleware;
        let req = single_req(json!({"method": "eth_chainId"}), false, None);
        assert!(mw.is_relevant(&req));

        let mut no_chain_id = req.clone();
        no_chain_id.meta.params.chain_id = None;
        assert!(!mw.is_relevant(&no_chain_id));

        let other = single_req(json!({"method": "eth_blockNumber"}), false, None);
        assert!(!mw.is_relevant(&other));
    }

    #[test]
    fn test_pop_pct() {
        let mut data: Map<String, Value> =
            serde_json::from_value(json!({"a": 25, "b": "12.5", "c": "bad"})).unwrap();
        assert_eq!(pop_pct(&mut data, "a", 1.0), 25.0);
        assert_eq!(pop_pct(&mut data, "b", 1.0), 12.5);
        assert_eq!(pop_pct(&mut data, "c", 1.0), 1.0);
        assert_eq!(pop_pct(&mut data, "missing", 7.0), 7.0);
        assert!(data.is_empty());
    }
}
