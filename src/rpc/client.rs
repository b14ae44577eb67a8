//! Node selection, rotation, and the retry-driven upstream caller.
//!
//! Each chain keeps its configured nodes in a rotation order shared across
//! concurrent requests: the head node serves new requests, and failures
//! rotate the head to the tail so the next attempt (and the next caller)
//! lands elsewhere. RPC-level errors are classified before HTTP status is
//! considered, because some upstreams return RPC errors with `200` while
//! legitimate results occasionally arrive with other statuses.

use crate::config::{NodeConfig, ProxyConfig, Secrets};
use crate::error::{Error, Result};
use crate::rpc::classify;
use crate::rpc::middleware::{default_stack, MiddlewareStack, Next};
use crate::rpc::models::{RequestParams, ResponseError, RpcRequest, RpcResponse};
use crate::utils::dumpcut;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Called for every failed attempt with the attempted request and whether
/// the failure was final; used to feed per-attempt stats counters.
pub type ErrorHook<'a> = &'a (dyn Fn(&RpcRequest, bool) + Send + Sync);

/// Timeouts of the shared upstream HTTP client.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
        }
    }
}

/// Creates the long-lived HTTP client used for upstream calls.
pub fn build_http_client(timeout_config: &TimeoutConfig) -> Result<reqwest::Client> {
    crate::install_crypto_provider();
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(timeout_config.connect_timeout_ms))
        .timeout(Duration::from_millis(timeout_config.request_timeout_ms))
        .build()?)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn round3(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

pub struct RpcClient {
    chains: IndexMap<String, IndexMap<String, Arc<NodeConfig>>>,
    /// Per-chain rotation order; the front node is the current head.
    pools: HashMap<String, Mutex<VecDeque<Arc<NodeConfig>>>>,
    secrets: Secrets,
    http: reqwest::Client,
    middlewares: MiddlewareStack,
    pub retry_attempts: u32,
    /// Rotate the pool even on a non-retriable error response, to step off
    /// a sticky bad node.
    pub rotate_on_error_response: bool,
    pub do_upstream_debug: bool,
    max_req_log_len: usize,
    max_resp_log_len: usize,
}

impl RpcClient {
    pub fn new(config: ProxyConfig, secrets: Secrets) -> Result<Self> {
        let http = build_http_client(&TimeoutConfig::default())?;
        let mut chains = IndexMap::new();
        let mut pools = HashMap::new();
        for (chain_name, nodes) in config.chains {
            let nodes: IndexMap<String, Arc<NodeConfig>> = nodes
                .into_iter()
                .map(|(name, node)| (name, Arc::new(node)))
                .collect();
            pools.insert(
                chain_name.clone(),
                Mutex::new(nodes.values().cloned().collect()),
            );
            chains.insert(chain_name, nodes);
        }
        Ok(Self {
            chains,
            pools,
            secrets,
            http,
            middlewares: default_stack(),
            retry_attempts: 5,
            rotate_on_error_response: true,
            do_upstream_debug: false,
            // Requests are mostly reproducible from context, responses are
            // not, hence the smaller request cap.
            max_req_log_len: 10_000,
            max_resp_log_len: 16_000,
        })
    }

    #[must_use]
    pub fn with_upstream_debug(mut self, enabled: bool) -> Self {
        self.do_upstream_debug = enabled;
        self
    }

    #[must_use]
    pub fn with_middlewares(mut self, middlewares: MiddlewareStack) -> Self {
        self.middlewares = middlewares;
        self
    }

    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    #[must_use]
    pub fn chains(&self) -> &IndexMap<String, IndexMap<String, Arc<NodeConfig>>> {
        &self.chains
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// The current head node of the chain's pool, optionally rotating the
    /// head to the tail first.
    pub fn node_config(&self, chain_name: &str, rotate: bool) -> Result<Arc<NodeConfig>> {
        let pool = self
            .pools
            .get(chain_name)
            .ok_or_else(|| Error::NoNodesAvailable(chain_name.to_string()))?;
        let mut nodes = lock(pool);
        if nodes.is_empty() {
            return Err(Error::NoNodesAvailable(chain_name.to_string()));
        }
        if rotate {
            let head = nodes
                .pop_front()
                .ok_or_else(|| Error::internal("pool emptied under lock"))?;
            nodes.push_back(head);
        }
        nodes
            .front()
            .cloned()
            .ok_or_else(|| Error::NoNodesAvailable(chain_name.to_string()))
    }

    pub fn node_by_name(&self, chain_name: &str, node_name: &str) -> Result<Arc<NodeConfig>> {
        let nodes = self
            .chains
            .get(chain_name)
            .ok_or_else(|| Error::NoNodesAvailable(chain_name.to_string()))?;
        nodes.get(node_name).cloned().ok_or_else(|| {
            Error::config(format!(
                "unknown node {node_name:?} for chain {chain_name:?}"
            ))
        })
    }

    /// Forwards `data` to the chain's pool with rotation-driven retries.
    ///
    /// Supplying `node_name` pins the request to that node and disables
    /// retries. On a final retriable error response the upstream body is
    /// returned as a normal response rather than an error.
    pub async fn request(
        &self,
        chain_name: &str,
        data: Value,
        node_name: Option<&str>,
        context: Option<&str>,
        params: RequestParams,
    ) -> Result<RpcResponse> {
        self.request_with_hook(chain_name, data, node_name, context, params, None)
            .await
    }

    pub async fn request_with_hook(
        &self,
        chain_name: &str,
        data: Value,
        node_name: Option<&str>,
        context: Option<&str>,
        params: RequestParams,
        error_hook: Option<ErrorHook<'_>>,
    ) -> Result<RpcResponse> {
        let context = context.unwrap_or("");
        let req_dump = dumpcut(&data, self.max_req_log_len);

        let retry_attempts = if node_name.is_some() {
            1
        } else {
            self.retry_attempts
        };
        let mut node = match node_name {
            Some(name) => self.node_by_name(chain_name, name)?,
            None => self.node_config(chain_name, false)?,
        };

        let start_time = Instant::now();
        for try_n in 0..retry_attempts {
            let node_start_time = Instant::now();
            let req = RpcRequest::from_body(data.clone(), node.clone(), params, try_n);

            match self.request_one_node(req.clone()).await {
                Ok(resp) => {
                    // For non-retriable error responses, rotate anyway to
                    // step off a possibly sticky bad node.
                    if resp.has_errors() && self.rotate_on_error_response {
                        let _ = self.node_config(chain_name, true);
                    }
                    let resp_dump = dumpcut(&resp.data, self.max_resp_log_len);
                    tracing::info!(
                        chain = chain_name,
                        evmrpc_node = %node.node_name,
                        try_n,
                        x_context = context,
                        x_request = %req_dump.text,
                        x_response = %resp_dump.text,
                        x_node_time = round3(node_start_time.elapsed().as_secs_f64()),
                        x_total_time = round3(start_time.elapsed().as_secs_f64()),
                        "evmrpc result"
                    );
                    return Ok(resp);
                }
                Err(err) => {
                    let is_final = try_n + 1 >= retry_attempts;
                    if let Some(hook) = error_hook {
                        hook(&req, is_final);
                    }

                    if is_final {
                        tracing::error!(
                            chain = chain_name,
                            evmrpc_node = %node.node_name,
                            try_n,
                            x_context = context,
                            x_request = %req_dump.text,
                            x_evmrpc_error = %err,
                            x_node_time = round3(node_start_time.elapsed().as_secs_f64()),
                            x_total_time = round3(start_time.elapsed().as_secs_f64()),
                            "evmrpc final error"
                        );
                        // Return RPC-level error responses directly.
                        return match err {
                            Error::RetriableResponse(resp) => Ok(*resp),
                            other => Err(other),
                        };
                    }

                    tracing::error!(
                        chain = chain_name,
                        evmrpc_node = %node.node_name,
                        try_n,
                        x_context = context,
                        x_evmrpc_error = %err,
                        x_node_time = round3(node_start_time.elapsed().as_secs_f64()),
                        "evmrpc error"
                    );
                    node = self.node_config(chain_name, true)?;
                }
            }
        }

        Err(Error::internal("retry loop ended without a result"))
    }

    /// Runs one attempt through the middleware pipeline down to the
    /// upstream caller.
    async fn request_one_node(&self, req: RpcRequest) -> Result<RpcResponse> {
        Next::new(&self.middlewares, self).run(req).await
    }

    /// POSTs the request to its node and interprets the result, checking
    /// RPC-level errors before the HTTP status.
    pub(crate) async fn call_upstream(&self, req: RpcRequest) -> Result<RpcResponse> {
        let node = req.meta().node.clone();
        let url = node.url(&self.secrets)?;
        let body = req.body_json();

        let mut builder = self.http.post(&url).json(&body);
        for (name, value) in &node.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let http_resp = builder.send().await?;
        let status = http_resp.status().as_u16();
        let http_ok = status == 200;
        let raw = http_resp.bytes().await?;
        let text = String::from_utf8_lossy(&raw);

        if self.do_upstream_debug {
            tracing::debug!(
                x_url = %url,
                x_req_data = %body,
                x_resp_status = status,
                x_resp_body = %text,
                "evmrpc upstream response"
            );
        }

        let data = serde_json::from_slice::<Value>(&raw)
            .ok()
            .filter(|value| value.is_object() || value.is_array());
        let Some(data) = data else {
            let message = if http_ok {
                "response failed to parse as JSON object/array"
            } else {
                "error response failed to parse as JSON object/array"
            };
            let resp = RpcResponse {
                data: json!({"__raw__": text}),
                req,
            };
            return Err(Error::Upstream {
                message: message.to_string(),
                status,
                response: Some(Box::new(resp)),
            });
        };

        let resp = RpcResponse { data, req };

        // RPC-level errors first: the HTTP status varies between providers
        // and the RPC-level handling is the more specific one.
        self.check_response(&resp)?;

        if !http_ok {
            return Err(Error::Upstream {
                message: "node error status".to_string(),
                status,
                response: Some(Box::new(resp)),
            });
        }
        Ok(resp)
    }

    fn check_response(&self, resp: &RpcResponse) -> Result<()> {
        let errors = ResponseError::parse(resp);
        if errors.is_empty() {
            return Ok(());
        }

        let retriable = errors
            .iter()
            .any(|error| classify::is_retriable(error.code, &error.message));
        let meta = resp.req.meta();
        tracing::error!(
            chain = %meta.node.chain_name,
            evmrpc_node = %meta.node.node_name,
            try_n = meta.try_n,
            x_errors = %serde_json::Value::Array(errors.iter().map(ResponseError::dump_for_log).collect()),
            retriable,
            "evmrpc response error"
        );

        if retriable {
            return Err(Error::RetriableResponse(Box::new(resp.clone())));
        }
        // Non-retriable error responses are returned as-is, same as
        // non-error responses.
        Ok(())
    }
}
