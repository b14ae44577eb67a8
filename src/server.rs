//! The HTTP API: the proxy entry point, the on-demand health check, and a
//! diagnostic ping.

use crate::chains::REGISTRY;
use crate::config;
use crate::error::{Error, Result};
use crate::rpc::check::{run_check, CheckOptions};
use crate::rpc::client::RpcClient;
use crate::rpc::models::{RequestParams, RpcRequest};
use crate::settings::Settings;
use crate::stats::{ChClient, RequestContext, StatsKey, StatsUpdater};
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::header::HeaderName;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

pub const NODE_HEADER: &str = "x-evmrpc-node";
pub const ATTEMPT_HEADER: &str = "x-evmrpc-attempt";

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub client: Arc<RpcClient>,
    pub stats: Option<Arc<StatsUpdater>>,
}

/// Builds the shared application state: pools, secrets, upstream client,
/// and the optional stats aggregator.
pub fn build_state(settings: Settings) -> Result<AppState> {
    let (proxy_config, secrets) = config::load(&settings)?;
    let client =
        RpcClient::new(proxy_config, secrets)?.with_upstream_debug(settings.do_upstream_debug);
    let stats = settings
        .stats_url
        .as_ref()
        .map(|url| {
            let ch_client = ChClient::new(url, &settings.stats_table, &StatsKey::COLUMNS)?;
            Ok::<_, Error>(StatsUpdater::new(
                ch_client,
                Duration::from_secs(settings.stats_sync_period_secs),
            ))
        })
        .transpose()?;
    Ok(AppState {
        settings: Arc::new(settings),
        client: Arc::new(client),
        stats,
    })
}

#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(get_ping))
        .route("/api/v1/evmrpc/{chain}", post(evmrpc_proxy))
        .route("/api/v1/evmrpc_check/", post(evmrpc_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds and serves the API until the process is stopped.
pub async fn serve(settings: Settings) -> Result<()> {
    let state = build_state(settings)?;
    let bind_addr = format!("{}:{}", state.settings.api_bind, state.settings.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, env = %state.settings.env, "serving evmproxy API");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

async fn get_ping(OriginalUri(uri): OriginalUri, headers: HeaderMap) -> Json<Value> {
    let headers_dump: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                json!(value.to_str().unwrap_or("<binary>")),
            )
        })
        .collect();
    Json(json!({
        "message": "pong",
        "url": uri.to_string(),
        "headers": headers_dump,
        "now": chrono::Utc::now().naive_utc().to_string(),
    }))
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"detail": "Invalid authentication"})),
    )
        .into_response()
}

/// Frames a terminal proxy error: the upstream body (when any) enriched
/// with `x_error_message`/`x_http_status`, under the upstream HTTP status
/// or 500.
fn frame_error(err: &Error) -> Response {
    let status = match err.last_status() {
        0 => StatusCode::INTERNAL_SERVER_ERROR,
        status => StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    };
    let data = match err.last_response() {
        Some(resp) => match &resp.data {
            Value::Object(body) => {
                let mut enriched = body.clone();
                enriched.insert("x_error_message".to_string(), json!(err.to_string()));
                enriched.insert("x_http_status".to_string(), json!(err.last_status()));
                Value::Object(enriched)
            }
            other => other.clone(),
        },
        None => json!({"error": "unknown error", "x_error_message": err.to_string()}),
    };
    (status, Json(data)).into_response()
}

#[derive(Debug, Deserialize)]
struct ProxyQuery {
    #[serde(default)]
    token: String,
    #[serde(default)]
    mangle_getlogs: bool,
    /// Debug parameter: pin to a named node, disabling retries.
    x_node_name: Option<String>,
    /// Non-authoritative requester comment for stats and logs.
    x_requester: Option<String>,
    #[serde(default)]
    log_extra: String,
}

async fn evmrpc_proxy(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    Query(query): Query<ProxyQuery>,
    Json(data): Json<Value>,
) -> Response {
    let Some(requester) = state.settings.requester_for_token(&query.token) else {
        return forbidden();
    };
    let Some(chain_info) = REGISTRY.resolve(&chain) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": format!("Chain not found: {chain:?}")})),
        )
            .into_response();
    };
    let chain_name = chain_info.shortname.clone();
    let x_requester = query.x_requester.as_deref().unwrap_or("-");

    let request_ctx = RequestContext {
        env: state.settings.stats_env().to_string(),
        chain: chain_name.clone(),
        requester: requester.to_string(),
        x_requester: x_requester.to_string(),
        method: RequestContext::method_label(&data),
    };
    let mut log_context = format!("requester={requester} x_requester={x_requester}");
    if !query.log_extra.is_empty() {
        log_context.push_str(&format!(" x_extra={}", query.log_extra));
    }

    let hook_stats = state.stats.clone();
    let hook_ctx = request_ctx.clone();
    let error_hook = move |req: &RpcRequest, is_final: bool| {
        if let Some(stats) = &hook_stats {
            let meta = req.meta();
            stats.increment(
                StatsKey::new(&hook_ctx, is_final, false, &meta.node.node_name, meta.try_n),
                1,
            );
        }
    };

    let params = RequestParams {
        allow_getlogs_mangle: query.mangle_getlogs,
        chain_id: Some(chain_info.id),
    };
    let result = state
        .client
        .request_with_hook(
            &chain_name,
            data,
            query.x_node_name.as_deref(),
            Some(&log_context),
            params,
            Some(&error_hook),
        )
        .await;

    match result {
        Ok(resp) => {
            let meta = resp.req.meta();
            if let Some(stats) = &state.stats {
                stats.increment(
                    StatsKey::new(&request_ctx, true, true, &meta.node.node_name, meta.try_n),
                    1,
                );
            }
            let node_name = meta.node.node_name.clone();
            let try_n = meta.try_n;
            let mut response = Json(resp.data).into_response();
            if let Ok(value) = HeaderValue::from_str(&node_name) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(NODE_HEADER), value);
            }
            if let Ok(value) = HeaderValue::from_str(&try_n.to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(ATTEMPT_HEADER), value);
            }
            response
        }
        // Failed-attempt stats are handled through the error hook.
        Err(err) => frame_error(&err),
    }
}

#[derive(Debug, Deserialize)]
struct CheckQuery {
    #[serde(default)]
    token: String,
    #[serde(default)]
    sequential: bool,
    /// Comma-separated chain filter; empty means all.
    #[serde(default)]
    chain_names: String,
    /// Return successful probes too, not just failures.
    #[serde(default)]
    return_all: bool,
}

async fn evmrpc_check(
    State(state): State<AppState>,
    Query(query): Query<CheckQuery>,
) -> Response {
    if state.settings.requester_for_token(&query.token).is_none() {
        return forbidden();
    }

    let chain_names = if query.chain_names.is_empty() {
        None
    } else {
        Some(
            query
                .chain_names
                .split(',')
                .map(str::to_string)
                .collect::<Vec<_>>(),
        )
    };
    let options = CheckOptions {
        chain_names,
        sequential: query.sequential,
        ..CheckOptions::default()
    };

    let mut results = run_check(&state.client, &REGISTRY, &options).await;
    if !query.return_all {
        results.retain(|result| !result.success);
    }
    Json(json!({"results": results})).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::models::RpcResponse;

    #[test]
    fn test_frame_error_enriches_object_body() {
        let node = crate::config::NodeConfig::from_config_value(
            "mainnet",
            "quiknode",
            &serde_yaml::Value::String("https://q.example/".to_string()),
        )
        .unwrap();
        let req = RpcRequest::from_body(
            json!({"method": "eth_blockNumber"}),
            Arc::new(node),
            RequestParams::default(),
            0,
        );
        let err = Error::Upstream {
            message: "node error status".to_string(),
            status: 503,
            response: Some(Box::new(RpcResponse {
                data: json!({"error": {"code": -32000, "message": "overloaded"}}),
                req,
            })),
        };
        let response = frame_error(&err);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_frame_error_without_response() {
        let err = Error::NoNodesAvailable("mainnet".to_string());
        let response = frame_error(&err);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
