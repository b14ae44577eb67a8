//! Request counters, buffered in memory and flushed to a ClickHouse-style
//! HTTP sink in the background.
//!
//! The flush is snapshot-and-replace: the live map is swapped for a fresh
//! one before uploading, so concurrent increments land in the new map, and
//! a failed upload simply re-merges the snapshot. No counts are lost either
//! way.

use crate::error::{Error, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(60);

/// Per-request labels resolved by the public entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub env: String,
    pub chain: String,
    pub requester: String,
    pub x_requester: String,
    pub method: String,
}

impl RequestContext {
    /// The `method` label of a request payload: `"batch"` for arrays, the
    /// inner method for objects, `"???"` otherwise.
    #[must_use]
    pub fn method_label(data: &Value) -> String {
        match data {
            Value::Array(_) => "batch".to_string(),
            Value::Object(obj) => obj
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("-")
                .to_string(),
            _ => "???".to_string(),
        }
    }
}

/// Counter key for requested upstream nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatsKey {
    pub env: String,
    /// `true` when this attempt's outcome was returned to the caller,
    /// `false` for retried attempts.
    pub is_final: bool,
    pub chain: String,
    pub requester: String,
    pub success: bool,
    pub x_requester: String,
    pub method: String,
    pub node: String,
    pub try_n: u32,
}

impl StatsKey {
    pub const COLUMNS: [&'static str; 11] = [
        "env",
        "final",
        "chain",
        "requester",
        "success",
        "x_requester",
        "method",
        "node",
        "try_n",
        "ts",
        "count",
    ];

    #[must_use]
    pub fn new(
        context: &RequestContext,
        is_final: bool,
        success: bool,
        node: &str,
        try_n: u32,
    ) -> Self {
        Self {
            env: context.env.clone(),
            is_final,
            chain: context.chain.clone(),
            requester: context.requester.clone(),
            success,
            x_requester: context.x_requester.clone(),
            method: context.method.clone(),
            node: node.to_string(),
            try_n,
        }
    }

    fn to_row(&self, ts: &str, count: u64) -> Value {
        json!([
            self.env,
            self.is_final,
            self.chain,
            self.requester,
            self.success,
            self.x_requester,
            self.method,
            self.node,
            self.try_n,
            ts,
            count,
        ])
    }
}

/// Minimal ClickHouse HTTP client: one insert query, NDJSON rows.
#[derive(Debug, Clone)]
pub struct ChClient {
    url: String,
    insert_query: String,
    http: reqwest::Client,
}

impl ChClient {
    pub fn new(url: &str, table_name: &str, column_names: &[&str]) -> Result<Self> {
        let columns_sql = column_names
            .iter()
            .map(|name| Self::quote_ident(name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let insert_query = format!(
            "insert into {} ({columns_sql}) format JSONCompactEachRow",
            Self::quote_ident(table_name)?
        );
        crate::install_crypto_provider();
        Ok(Self {
            url: url.to_string(),
            insert_query,
            http: reqwest::Client::new(),
        })
    }

    /// Simple "quote identifier" for trusted input only.
    fn quote_ident(name: &str) -> Result<String> {
        if name.contains('"') {
            return Err(Error::config(format!("suspicious identifier: {name:?}")));
        }
        Ok(format!("\"{name}\""))
    }

    #[must_use]
    pub fn serialize_ndjson(rows: &[Value]) -> Vec<u8> {
        let mut body = Vec::new();
        for row in rows {
            body.extend_from_slice(row.to_string().as_bytes());
            body.push(b'\n');
        }
        body
    }

    pub async fn upload(&self, rows: &[Value]) -> Result<()> {
        let body = Self::serialize_ndjson(rows);
        self.http
            .post(&self.url)
            .query(&[("query", &self.insert_query)])
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    #[must_use]
    pub fn insert_query(&self) -> &str {
        &self.insert_query
    }
}

struct StatsInner {
    stats: HashMap<StatsKey, u64>,
    last_sync: Instant,
}

/// In-memory counter map with periodic background flushing.
pub struct StatsUpdater {
    ch_client: ChClient,
    min_sync_period: Duration,
    inner: Mutex<StatsInner>,
    flushes_in_flight: AtomicUsize,
}

fn lock(inner: &Mutex<StatsInner>) -> MutexGuard<'_, StatsInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StatsUpdater {
    #[must_use]
    pub fn new(ch_client: ChClient, min_sync_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            ch_client,
            min_sync_period,
            inner: Mutex::new(StatsInner {
                stats: HashMap::new(),
                last_sync: Instant::now(),
            }),
            flushes_in_flight: AtomicUsize::new(0),
        })
    }

    /// Adds to the in-memory map; when the sync period has elapsed, spawns
    /// a detached background flush.
    pub fn increment(self: &Arc<Self>, key: StatsKey, count: u64) {
        let flush_due = {
            let mut inner = lock(&self.inner);
            *inner.stats.entry(key).or_insert(0) += count;
            inner.last_sync.elapsed() > self.min_sync_period
        };
        if !flush_due {
            return;
        }

        let this = Arc::clone(self);
        self.flushes_in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            this.flush().await;
            this.flushes_in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        tracing::debug!(
            flushes_in_flight = self.flushes_in_flight.load(Ordering::SeqCst),
            "spawned stats flush task"
        );
    }

    /// Snapshots and replaces the live map, uploads the snapshot, and
    /// re-merges it on upload failure.
    pub async fn flush(&self) {
        let snapshot = {
            let mut inner = lock(&self.inner);
            inner.last_sync = Instant::now();
            std::mem::take(&mut inner.stats)
        };

        if let Err(err) = self.upload_snapshot(&snapshot).await {
            tracing::error!(error = %err, "error uploading stats");
            // Put the counts back in.
            let mut inner = lock(&self.inner);
            for (key, count) in snapshot {
                *inner.stats.entry(key).or_insert(0) += count;
            }
        }
    }

    async fn upload_snapshot(&self, snapshot: &HashMap<StatsKey, u64>) -> Result<()> {
        let ts = Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        let rows: Vec<Value> = snapshot
            .iter()
            .map(|(key, count)| key.to_row(&ts, *count))
            .collect();
        self.ch_client.upload(&rows).await
    }

    /// Sum of all buffered counts; used by tests and shutdown logging.
    #[must_use]
    pub fn pending_total(&self) -> u64 {
        lock(&self.inner).stats.values().sum()
    }

    #[must_use]
    pub fn flushes_in_flight(&self) -> usize {
        self.flushes_in_flight.load(Ordering::SeqCst)
    }
}
