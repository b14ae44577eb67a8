//! Shared helpers for the integration suites.

#![allow(dead_code)]

use evmproxy::config::{ProxyConfig, Secrets};
use evmproxy::rpc::client::RpcClient;
use serde_json::{json, Value};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// A URL where nothing listens; connections fail immediately.
pub const DEAD_URL: &str = "http://127.0.0.1:1/";

pub const REQ_BLOCK_NUMBER: &str =
    r#"{"jsonrpc": "2.0", "id": 2, "method": "eth_blockNumber", "params": []}"#;
pub const REQ_BLOCK_NUMBER_2: &str = r#"{"jsonrpc": "2.0", "id": 3, "method": "eth_blockNumber"}"#;
pub const REQ_CHAIN_ID: &str = r#"{"jsonrpc": "2.0", "id": 1, "method": "eth_chainId"}"#;

pub fn req(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap()
}

/// The in-spec sample pool: a batching `mainnet` pair and a non-batching
/// `bouncebit` pair.
pub fn sample_config(
    quiknode_url: &str,
    infura_url: &str,
    blockvision_url: &str,
    bouncebitapi_url: &str,
) -> ProxyConfig {
    ProxyConfig::from_yaml_str(&format!(
        r#"
mainnet:
  x_chain_id: 1
  quiknode: "{quiknode_url}"
  infura: "{infura_url}"
bouncebit:
  x_chain_id: 6001
  blockvision: {{url: "{blockvision_url}", max_blocks_distance: 1500, supports_batch: false}}
  bouncebitapi_public: {{url: "{bouncebitapi_url}", max_blocks_distance: 1500, supports_batch: false}}
"#
    ))
    .unwrap()
}

pub fn mainnet_client(quiknode_url: &str, infura_url: &str) -> RpcClient {
    let config = sample_config(quiknode_url, infura_url, DEAD_URL, DEAD_URL);
    RpcClient::new(config, Secrets::default()).unwrap()
}

/// Echoes each request entry back as its own result:
/// `{method, params}` under the request's `jsonrpc`/`id` envelope.
pub struct PongResponder;

pub fn pong_item(item: &Value) -> Value {
    json!({
        "jsonrpc": item
            .get("jsonrpc")
            .cloned()
            .filter(|value| !value.is_null())
            .unwrap_or_else(|| json!("2.0")),
        "id": item.get("id").cloned().unwrap_or(Value::Null),
        "result": {
            "method": item.get("method").cloned().unwrap_or(Value::Null),
            "params": item.get("params").cloned().unwrap_or(Value::Null),
        },
    })
}

impl Respond for PongResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let resp = match &body {
            Value::Array(items) => Value::Array(items.iter().map(pong_item).collect()),
            item => pong_item(item),
        };
        ResponseTemplate::new(200).set_body_json(resp)
    }
}

pub async fn start_pong_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(PongResponder)
        .mount(&server)
        .await;
    server
}

/// Answers health-check probes like a live node: a fixed chain id, block
/// number, and the well-known Multicall3 return blob.
pub struct HealthResponder {
    pub chain_id: u64,
    pub block_number: u64,
}

impl Respond for HealthResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let items = match &body {
            Value::Array(items) => items.clone(),
            item => vec![item.clone()],
        };
        let results: Vec<Value> = items
            .iter()
            .map(|item| {
                let result = match item.get("method").and_then(Value::as_str) {
                    Some("eth_chainId") => json!(format!("{:#x}", self.chain_id)),
                    Some("eth_blockNumber") => json!(format!("{:#x}", self.block_number)),
                    Some("eth_call") => json!(evmproxy::rpc::check::CHECK_RES_MC_DATA),
                    _ => Value::Null,
                };
                json!({
                    "jsonrpc": "2.0",
                    "id": item.get("id").cloned().unwrap_or(Value::Null),
                    "result": result,
                })
            })
            .collect();
        let resp = if body.is_array() {
            Value::Array(results)
        } else {
            results.into_iter().next().unwrap_or(Value::Null)
        };
        ResponseTemplate::new(200).set_body_json(resp)
    }
}

/// Bodies of all requests the mock server has received, decoded as JSON.
pub async fn received_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).unwrap_or(Value::Null))
        .collect()
}
