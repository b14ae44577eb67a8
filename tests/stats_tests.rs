//! Stats aggregator upload behavior against a mocked sink.

use evmproxy::stats::{ChClient, RequestContext, StatsKey, StatsUpdater};
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sample_context() -> RequestContext {
    RequestContext {
        env: "tests".to_string(),
        chain: "mainnet".to_string(),
        requester: "tester".to_string(),
        x_requester: "-".to_string(),
        method: "eth_blockNumber".to_string(),
    }
}

#[tokio::test]
async fn test_flush_uploads_ndjson_rows() {
    let sink = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sink)
        .await;

    let ch_client = ChClient::new(&sink.uri(), "evmrpc_request_stats", &StatsKey::COLUMNS).unwrap();
    let updater = StatsUpdater::new(ch_client, Duration::from_secs(60));

    let context = sample_context();
    updater.increment(StatsKey::new(&context, true, true, "quiknode", 0), 1);
    updater.increment(StatsKey::new(&context, true, true, "quiknode", 0), 1);
    updater.increment(StatsKey::new(&context, false, false, "infura", 1), 1);
    assert_eq!(updater.pending_total(), 3);

    updater.flush().await;
    assert_eq!(updater.pending_total(), 0);

    let requests = sink.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let query = requests[0].url.query().unwrap();
    assert!(query.contains("JSONCompactEachRow"));
    assert!(query.contains("evmrpc_request_stats"));

    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    let rows: Vec<serde_json::Value> = body
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    // Two distinct keys, one aggregated to count 2.
    assert_eq!(rows.len(), 2);
    for row in &rows {
        let row = row.as_array().unwrap();
        assert_eq!(row.len(), StatsKey::COLUMNS.len());
    }
    let counts: Vec<i64> = rows
        .iter()
        .map(|row| row.as_array().unwrap()[10].as_i64().unwrap())
        .collect();
    assert!(counts.contains(&2));
    assert!(counts.contains(&1));
}

#[tokio::test]
async fn test_failed_upload_remerges_into_live_map() {
    let sink = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&sink)
        .await;

    let ch_client = ChClient::new(&sink.uri(), "evmrpc_request_stats", &StatsKey::COLUMNS).unwrap();
    let updater = StatsUpdater::new(ch_client, Duration::from_secs(60));

    let context = sample_context();
    updater.increment(StatsKey::new(&context, true, true, "quiknode", 0), 3);
    updater.flush().await;

    // The snapshot was merged back after the 503.
    assert_eq!(updater.pending_total(), 3);

    // A concurrent-looking increment stacks on top of the re-merge.
    updater.increment(StatsKey::new(&context, true, true, "quiknode", 0), 2);
    assert_eq!(updater.pending_total(), 5);
}

#[tokio::test]
async fn test_increment_spawns_background_flush_after_period() {
    let sink = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&sink)
        .await;

    let ch_client = ChClient::new(&sink.uri(), "evmrpc_request_stats", &StatsKey::COLUMNS).unwrap();
    // Zero period: every increment past the first instant is flush-due.
    let updater = StatsUpdater::new(ch_client, Duration::ZERO);

    let context = sample_context();
    updater.increment(StatsKey::new(&context, true, true, "quiknode", 0), 1);

    // Wait for the detached flush to drain the map.
    for _ in 0..50 {
        if updater.pending_total() == 0 && updater.flushes_in_flight() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(updater.pending_total(), 0);
    assert_eq!(sink.received_requests().await.unwrap().len(), 1);
}
