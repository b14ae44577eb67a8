//! Request and response model.
//!
//! A JSON-RPC request is either a lone object (`Single`) or an array of
//! objects (`Batch`); the shape is preserved end-to-end: a single in means a
//! single out, a batch in means a batch out of the same length. Middlewares
//! convert freely between the two through [`to_singles`] / [`from_singles`],
//! and the selective layers re-match the caller's shape at the end.

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::sync::Arc;

/// Error code used when an upstream error object carries none.
pub const NO_CODE: i64 = 0;

/// Per-request behavior switches, set by the public entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestParams {
    pub allow_getlogs_mangle: bool,
    /// A static chain id, enabling the `eth_chainId` short-circuit and the
    /// `ext_estimateGas` handler.
    pub chain_id: Option<u64>,
}

/// Fields shared by every request regardless of shape.
// To avoid losing values on single<->batch transitions, avoid adding
// fields with defaults here.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMeta {
    pub node: Arc<NodeConfig>,
    pub params: RequestParams,
    pub try_n: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingleRequest {
    pub body: Value,
    pub meta: RequestMeta,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub bodies: Vec<Value>,
    pub meta: RequestMeta,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcRequest {
    Single(SingleRequest),
    Batch(BatchRequest),
}

impl SingleRequest {
    /// The `method` field of the request body, when present.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        self.body.get("method").and_then(Value::as_str)
    }
}

impl RpcRequest {
    /// Wraps a caller-supplied JSON body: an array becomes a `Batch`,
    /// anything else a `Single`.
    #[must_use]
    pub fn from_body(
        body: Value,
        node: Arc<NodeConfig>,
        params: RequestParams,
        try_n: u32,
    ) -> Self {
        let meta = RequestMeta {
            node,
            params,
            try_n,
        };
        match body {
            Value::Array(bodies) => Self::Batch(BatchRequest { bodies, meta }),
            body => Self::Single(SingleRequest { body, meta }),
        }
    }

    #[must_use]
    pub fn meta(&self) -> &RequestMeta {
        match self {
            Self::Single(req) => &req.meta,
            Self::Batch(req) => &req.meta,
        }
    }

    #[must_use]
    pub const fn is_single(&self) -> bool {
        matches!(self, Self::Single(_))
    }

    /// The JSON payload as it goes on the wire.
    #[must_use]
    pub fn body_json(&self) -> Value {
        match self {
            Self::Single(req) => req.body.clone(),
            Self::Batch(req) => Value::Array(req.bodies.clone()),
        }
    }
}

/// Splits a request into per-entry singles inheriting its metadata.
#[must_use]
pub fn to_singles(req: &RpcRequest) -> Vec<SingleRequest> {
    match req {
        RpcRequest::Single(single) => vec![single.clone()],
        RpcRequest::Batch(batch) => batch
            .bodies
            .iter()
            .map(|body| SingleRequest {
                body: body.clone(),
                meta: batch.meta.clone(),
            })
            .collect(),
    }
}

/// Recombines singles into one request.
///
/// One element stays a `Single` unless `to_match` is a `Batch` (then it
/// becomes a one-element `Batch`); several elements become a `Batch`. The
/// metadata of all elements must be identical.
pub fn from_singles(
    reqs: Vec<SingleRequest>,
    to_match: Option<&RpcRequest>,
) -> Result<RpcRequest> {
    let Some(first_meta) = reqs.first().map(|req| req.meta.clone()) else {
        return Err(Error::internal("cannot combine zero requests"));
    };
    if reqs.iter().any(|req| req.meta != first_meta) {
        return Err(Error::internal("mismatch in single-request metadata"));
    }

    if reqs.len() == 1 && !matches!(to_match, Some(RpcRequest::Batch(_))) {
        let mut reqs = reqs;
        return Ok(RpcRequest::Single(reqs.remove(0)));
    }

    Ok(RpcRequest::Batch(BatchRequest {
        bodies: reqs.into_iter().map(|req| req.body).collect(),
        meta: first_meta,
    }))
}

/// An upstream (or synthesized) response paired with the request it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub data: Value,
    pub req: RpcRequest,
}

impl RpcResponse {
    /// Synthesizes a `{jsonrpc, id, result}` object answering `req`,
    /// round-tripping its `jsonrpc` and `id` fields.
    #[must_use]
    pub fn from_single_req(req: &SingleRequest, result: Value) -> Self {
        Self {
            data: synthesize_result(&req.body, result),
            req: RpcRequest::Single(req.clone()),
        }
    }

    /// Whether any entry of the response carries an `error` field.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        match &self.data {
            Value::Object(obj) => obj.contains_key("error"),
            Value::Array(items) => items
                .iter()
                .any(|item| item.get("error").is_some()),
            _ => false,
        }
    }

    /// Re-matches the response shape to the request: a `Single` request
    /// whose data came back as a one-element list is unwrapped.
    #[must_use]
    pub fn match_shape(mut self) -> Self {
        if self.req.is_single() {
            if let Value::Array(items) = &mut self.data {
                debug_assert_eq!(items.len(), 1);
                if items.len() == 1 {
                    self.data = items.remove(0);
                }
            }
        }
        self
    }
}

/// Builds a `{jsonrpc, id, result}` object echoing the request envelope.
#[must_use]
pub fn synthesize_result(req_body: &Value, result: Value) -> Value {
    let jsonrpc = req_body
        .get("jsonrpc")
        .filter(|v| !v.is_null())
        .cloned()
        .unwrap_or_else(|| json!("2.0"));
    let id = req_body.get("id").cloned().unwrap_or(Value::Null);
    json!({"jsonrpc": jsonrpc, "id": id, "result": result})
}

/// Builds a `{jsonrpc, id, error}` object echoing the request envelope.
#[must_use]
pub fn synthesize_error(req_body: &Value, error: Value) -> Value {
    let mut data = synthesize_result(req_body, Value::Null);
    if let Some(obj) = data.as_object_mut() {
        obj.remove("result");
        obj.insert("error".to_string(), error);
    }
    data
}

/// An RPC-level error extracted from a response entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

impl ResponseError {
    fn parse_one(item: &Value) -> Option<Self> {
        let Some(obj) = item.as_object() else {
            return Some(Self {
                code: NO_CODE,
                message: "Non-object response".to_string(),
            });
        };
        let error = obj.get("error")?;
        let error_is_empty = match error {
            Value::Null => true,
            Value::Bool(flag) => !flag,
            Value::String(text) => text.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(fields) => fields.is_empty(),
            Value::Number(num) => num.as_f64() == Some(0.0),
        };
        if error_is_empty {
            return None;
        }
        let Some(error_obj) = error.as_object() else {
            return Some(Self {
                code: NO_CODE,
                message: "Non-object error".to_string(),
            });
        };
        let code = error_obj
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or(NO_CODE);
        let message = match error_obj.get("message") {
            Some(Value::String(message)) => message.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        Some(Self { code, message })
    }

    /// All RPC-level errors present in the response entries.
    #[must_use]
    pub fn parse(resp: &RpcResponse) -> Vec<Self> {
        match &resp.data {
            Value::Array(items) => items.iter().filter_map(Self::parse_one).collect(),
            data => Self::parse_one(data).into_iter().collect(),
        }
    }

    #[must_use]
    pub fn dump_for_log(&self) -> Value {
        json!({"code": self.code, "message": self.message})
    }
}
