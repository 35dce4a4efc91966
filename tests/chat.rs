//! Integration tests for POST /v1/chat/completions (buffered).
//!
//! Fake providers are wiremock servers; the gateway router is driven with
//! `tower::ServiceExt::oneshot` against a temporary SQLite log.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::Request;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tollgate::catalog::{Catalog, ReloadController, Snapshot};
use tollgate::config::Config;
use tollgate::proxy::{build_http_client, create_router, AppState};
use tollgate::storage::{LogStore, Pagination, RequestFilter, UNKNOWN_PROVIDER};

struct TestApp {
    app: axum::Router,
    store: LogStore,
    _dir: tempfile::TempDir,
}

async fn setup_test_app(config_toml: &str) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("tollgate.toml");
    std::fs::write(&config_path, config_toml).expect("write config");

    let (config, _) = Config::parse_with_lookup(config_toml, |_| None).expect("valid config");
    let db_path = dir.path().join("requests.db");
    let store = LogStore::open(db_path.to_str().unwrap())
        .await
        .expect("open log store");

    let catalog = Arc::new(Catalog::new(Snapshot::from_config(&config, 1).unwrap()));
    let state = AppState {
        catalog: catalog.clone(),
        store: store.clone(),
        http_client: build_http_client().unwrap(),
        reloader: Arc::new(ReloadController::new(&config_path, catalog)),
        auth_token: config.server.auth_token.clone(),
    };

    TestApp {
        app: create_router(state),
        store,
        _dir: dir,
    }
}

/// One priced model on `primary`, optionally falling back to `backup`.
fn gateway_config(primary: &str, backup: Option<&str>, num_retries: u32) -> String {
    let mut toml = format!(
        r#"
[gateway]
num_retries = {num_retries}

[[providers]]
name = "primary"
base_url = "{primary}/v1"
requires_api_key = false
"#
    );
    if let Some(backup) = backup {
        toml.push_str(&format!(
            r#"
[[providers]]
name = "backup"
base_url = "{backup}/v1"
requires_api_key = false
"#
        ));
    }
    toml.push_str(
        r#"
[[models]]
name = "mini"
provider = "primary"
upstream_model = "upstream-mini"
prompt_price_per_million = 0.15
completion_price_per_million = 0.60
context_length = 128000
"#,
    );
    if backup.is_some() {
        toml.push_str(
            r#"
[[models.fallbacks]]
provider = "backup"
upstream_model = "backup-mini"
"#,
        );
    }
    toml
}

fn completion_body(content: &str, usage: Option<(u32, u32)>) -> Value {
    let mut body = json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "model": "upstream-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    });
    if let Some((prompt, completion)) = usage {
        body["usage"] = json!({
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion
        });
    }
    body
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn header<'a>(response: &'a axum::response::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn all_records(store: &LogStore) -> Vec<tollgate::storage::RequestSummary> {
    store
        .query(&RequestFilter::default(), Pagination::default())
        .await
        .unwrap()
        .requests
}

#[tokio::test]
async fn test_buffered_completion_priced_and_logged() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "upstream-mini"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body("hello", Some((100, 50)))),
        )
        .expect(1)
        .mount(&provider)
        .await;

    let test = setup_test_app(&gateway_config(&provider.uri(), None, 0)).await;
    let response = test
        .app
        .clone()
        .oneshot(chat_request(json!({
            "model": "mini",
            "messages": [{"role": "user", "content": "hi"}],
            "timeout": 30,
            "num_retries": 0
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "x-tollgate-provider"), Some("primary"));
    assert!(header(&response, "x-tollgate-latency-ms").is_some());
    assert!(header(&response, "x-tollgate-estimated").is_none());
    assert!(header(&response, "x-tollgate-retries").is_none());
    let cost: f64 = header(&response, "x-tollgate-cost")
        .expect("priced model sets cost header")
        .parse()
        .unwrap();
    assert!((cost - 0.000045).abs() < 1e-12, "cost was {}", cost);
    let request_id = header(&response, "x-tollgate-request-id")
        .unwrap()
        .to_string();

    let json = body_json(response).await;
    assert_eq!(json["choices"][0]["message"]["content"], "hello");

    let detail = test.store.get(&request_id).await.unwrap().expect("record");
    assert_eq!(detail.model, "mini");
    assert_eq!(detail.provider, "primary");
    assert!(!detail.streaming);
    assert_eq!(detail.prompt_tokens, Some(100));
    assert_eq!(detail.completion_tokens, Some(50));
    assert_eq!(detail.total_tokens, Some(150));
    assert!((detail.cost - 0.000045).abs() < 1e-12);
    assert!(!detail.unpriced);
    assert!(!detail.estimated);
    assert!(detail.error.is_none());

    // gateway-only fields never reach the provider
    let outbound: Value = serde_json::from_str(detail.outbound_request.as_deref().unwrap()).unwrap();
    assert_eq!(outbound["model"], "upstream-mini");
    assert!(outbound.get("timeout").is_none());
    assert!(outbound.get("num_retries").is_none());

    // the incoming request is stored verbatim
    let incoming: Value = serde_json::from_str(&detail.incoming_request).unwrap();
    assert_eq!(incoming["timeout"], 30);
}

#[tokio::test]
async fn test_missing_usage_is_estimated() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body("twelve chars", None)),
        )
        .mount(&provider)
        .await;

    let test = setup_test_app(&gateway_config(&provider.uri(), None, 0)).await;
    let response = test
        .app
        .clone()
        .oneshot(chat_request(json!({
            "model": "mini",
            "messages": [{"role": "user", "content": "abcdefgh"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "x-tollgate-estimated"), Some("true"));

    let records = all_records(&test.store).await;
    assert_eq!(records.len(), 1);
    assert!(records[0].estimated);
    // 8 chars / 4 + 4 framing tokens
    assert_eq!(records[0].prompt_tokens, Some(6));
    // 12 chars / 4
    assert_eq!(records[0].completion_tokens, Some(3));
    assert!(records[0].cost > 0.0);
}

#[tokio::test]
async fn test_fallback_after_primary_failure() {
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("primary down"))
        .expect(1)
        .mount(&primary)
        .await;

    let backup = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"model": "backup-mini"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body("from backup", Some((5, 5)))),
        )
        .expect(1)
        .mount(&backup)
        .await;

    let test = setup_test_app(&gateway_config(&primary.uri(), Some(&backup.uri()), 1)).await;
    let response = test
        .app
        .clone()
        .oneshot(chat_request(json!({
            "model": "mini",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "x-tollgate-provider"), Some("backup"));
    assert_eq!(header(&response, "x-tollgate-retries"), Some("1/primary"));

    let records = all_records(&test.store).await;
    assert_eq!(records.len(), 1, "one record per call, not per attempt");
    assert_eq!(records[0].provider, "backup");
    assert!(records[0].error.is_none());
}

#[tokio::test]
async fn test_all_attempts_fail_logs_one_error() {
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(2)
        .mount(&primary)
        .await;

    let backup = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("also down"))
        .expect(1)
        .mount(&backup)
        .await;

    // three attempts: primary, backup, primary
    let test = setup_test_app(&gateway_config(&primary.uri(), Some(&backup.uri()), 2)).await;
    let response = test
        .app
        .clone()
        .oneshot(chat_request(json!({
            "model": "mini",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert_eq!(header(&response, "x-tollgate-provider"), Some("primary"));
    assert_eq!(
        header(&response, "x-tollgate-retries"),
        Some("1/primary, 1/backup")
    );
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "upstream_error");
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("overloaded"));

    let records = all_records(&test.store).await;
    assert_eq!(records.len(), 1);
    assert!(records[0].error.is_some());
    assert!(records[0].unpriced);
    assert_eq!(records[0].cost, 0.0);
}

#[tokio::test]
async fn test_request_timeout_returns_504() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("late", Some((1, 1))))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&provider)
        .await;

    let test = setup_test_app(&gateway_config(&provider.uri(), None, 0)).await;
    let response = test
        .app
        .clone()
        .oneshot(chat_request(json!({
            "model": "mini",
            "messages": [{"role": "user", "content": "hi"}],
            "timeout": 0.2
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), 504);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "timeout_error");

    let records = all_records(&test.store).await;
    assert_eq!(records.len(), 1);
    assert!(records[0].error.as_deref().unwrap().contains("timeout"));
}

#[tokio::test]
async fn test_unknown_model_rejected_and_logged() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&provider)
        .await;

    let test = setup_test_app(&gateway_config(&provider.uri(), None, 0)).await;
    let response = test
        .app
        .clone()
        .oneshot(chat_request(json!({
            "model": "no-such-model",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let request_id = header(&response, "x-tollgate-request-id")
        .unwrap()
        .to_string();
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "model_not_found");
    assert!(json["error"]["message"].as_str().unwrap().contains("mini"));

    let detail = test.store.get(&request_id).await.unwrap().expect("record");
    assert_eq!(detail.model, "no-such-model");
    assert_eq!(detail.provider, UNKNOWN_PROVIDER);
    assert!(detail.outbound_request.is_none());
    assert!(detail.response.is_none());
    assert!(detail.error.is_some());
}

#[tokio::test]
async fn test_invalid_requests_rejected_and_logged() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&provider)
        .await;

    let test = setup_test_app(&gateway_config(&provider.uri(), None, 0)).await;

    let bodies = [
        json!({"model": "mini"}),
        json!({"model": "mini", "messages": []}),
        json!({"model": "mini", "messages": [{"role": "wizard", "content": "hi"}]}),
        json!({"model": "mini", "messages": [{"role": "user", "content": "hi"}], "temperature": 3.5}),
    ];
    for body in bodies {
        let response = test.app.clone().oneshot(chat_request(body)).await.unwrap();
        assert_eq!(response.status(), 400);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "invalid_request_error");
    }

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let records = all_records(&test.store).await;
    assert_eq!(records.len(), 5);
    assert!(records.iter().all(|r| r.error.is_some()));
    // the malformed body carries no model name
    assert!(records.iter().any(|r| r.model == "unknown"));
}

#[tokio::test]
async fn test_bare_path_alias() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok", Some((1, 1)))))
        .mount(&provider)
        .await;

    let test = setup_test_app(&gateway_config(&provider.uri(), None, 0)).await;
    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/chat/completions")
                .body(Body::from(
                    json!({"model": "mini", "messages": [{"role": "user", "content": "hi"}]})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_list_models() {
    let test = setup_test_app(&gateway_config("http://127.0.0.1:1", None, 0)).await;
    let response = test
        .app
        .clone()
        .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json = body_json(response).await;
    assert_eq!(json["object"], "list");
    let model = &json["data"][0];
    assert_eq!(model["id"], "mini");
    assert_eq!(model["provider"], "primary");
    assert_eq!(model["upstream_model"], "upstream-mini");
    assert_eq!(model["context_length"], 128000);
    let prompt_price = model["pricing"]["prompt_per_million"].as_f64().unwrap();
    assert!((prompt_price - 0.15).abs() < 1e-9);
    assert!(json["data"][0]["fallbacks"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_bearer_token_required_except_health() {
    let mut toml = gateway_config("http://127.0.0.1:1", None, 0);
    toml.insert_str(0, "[server]\nauth_token = \"s3cret\"\n");
    let test = setup_test_app(&toml).await;

    let response = test
        .app
        .clone()
        .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(header(&response, "www-authenticate"), Some("Bearer"));

    let response = test
        .app
        .clone()
        .oneshot(
            Request::get("/stats")
                .header("authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = test
        .app
        .clone()
        .oneshot(
            Request::get("/v1/models")
                .header("authorization", "Bearer s3cret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = test
        .app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["config_version"], 1);

    // rejected before dispatch, so nothing is logged
    let response = test
        .app
        .clone()
        .oneshot(chat_request(json!({
            "model": "mini",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert!(all_records(&test.store).await.is_empty());
}

#[tokio::test]
async fn test_client_cancel_before_response_logs_incomplete() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("too late", Some((10, 5))))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&provider)
        .await;

    let test = setup_test_app(&gateway_config(&provider.uri(), None, 0)).await;
    let call = test.app.clone().oneshot(chat_request(json!({
        "model": "mini",
        "messages": [{"role": "user", "content": "hi"}]
    })));
    // the client gives up while the provider is still thinking
    assert!(tokio::time::timeout(Duration::from_millis(300), call)
        .await
        .is_err());

    let mut records = Vec::new();
    for _ in 0..200 {
        records = all_records(&test.store).await;
        if !records.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(records.len(), 1, "exactly one record per call");
    let record = &records[0];
    assert_eq!(record.model, "mini");
    assert_eq!(record.provider, "primary");
    assert!(record.incomplete);
    assert!(!record.streaming);
    assert_eq!(
        record.error.as_deref(),
        Some(tollgate::storage::ABANDONED_ERROR)
    );

    // nothing else is written once the provider would have answered
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(all_records(&test.store).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_write_one_record_each() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body("hi", Some((100, 50)))),
        )
        .mount(&provider)
        .await;

    let test = setup_test_app(&gateway_config(&provider.uri(), None, 0)).await;
    let calls: Vec<_> = (0..30)
        .map(|i| {
            let app = test.app.clone();
            tokio::spawn(async move {
                let response = app
                    .oneshot(chat_request(json!({
                        "model": "mini",
                        "messages": [{"role": "user", "content": format!("call {}", i)}]
                    })))
                    .await
                    .unwrap();
                assert_eq!(response.status(), 200);
                header(&response, "x-tollgate-request-id")
                    .unwrap()
                    .to_string()
            })
        })
        .collect();

    let mut returned = Vec::new();
    for call in calls {
        returned.push(call.await.unwrap());
    }
    returned.sort();

    let page = test
        .store
        .query(&RequestFilter::default(), Pagination::new(None, Some(200)))
        .await
        .unwrap();
    assert_eq!(page.totals.total, 30);
    let mut logged: Vec<String> = page.requests.into_iter().map(|r| r.id).collect();
    logged.sort();
    assert_eq!(logged, returned);
    assert!((page.totals.total_cost - 30.0 * 0.000045).abs() < 1e-12);
}

#[tokio::test]
async fn test_model_info() {
    let mut toml = gateway_config("http://127.0.0.1:1", None, 0);
    toml.push_str("params = { temperature = 0.2, max_tokens = 256, seed = 7 }\n");
    let test = setup_test_app(&toml).await;

    let response = test
        .app
        .clone()
        .oneshot(Request::get("/v1/model/info").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let json = body_json(response).await;
    let model = &json["data"][0];
    assert_eq!(model["model_name"], "mini");
    assert_eq!(model["model_info"]["provider"], "primary");
    assert_eq!(model["model_info"]["max_input_tokens"], 128000);
    let input_cost = model["model_info"]["input_cost_per_token"].as_f64().unwrap();
    assert!((input_cost - 0.15e-6).abs() < 1e-15);
    let output_cost = model["model_info"]["output_cost_per_token"].as_f64().unwrap();
    assert!((output_cost - 0.60e-6).abs() < 1e-15);

    assert_eq!(model["model_params"]["model"], "upstream-mini");
    assert_eq!(model["model_params"]["temperature"], 0.2);
    assert_eq!(model["model_params"]["max_tokens"], 256);
    // only the documented defaults are echoed
    assert!(model["model_params"].get("seed").is_none());
}
