use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

use jobforge_infra::bootstrap;
use jobforge_infra::config::Settings;
use jobforge_infra::workers::{WorkerPool, WorkerPoolHandle, builtin_registry};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    pool: Option<WorkerPoolHandle>,
}

impl TestServer {
    /// Same router as prod on an ephemeral port, backed by in-memory infrastructure.
    async fn spawn(with_workers: bool) -> Self {
        let settings = Settings {
            dequeue_timeout: Duration::from_millis(20),
            lease_ttl: Duration::from_secs(3),
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(50),
            ..Settings::default()
        };
        let infra = bootstrap::build_in_memory(&settings);

        let pool = with_workers.then(|| {
            WorkerPool::new(infra.coordinator.clone(), builtin_registry())
                .spawn(settings.pool_config().with_concurrency(2))
        });

        let app = jobforge_api::app::build_app((&infra).into());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            pool,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        // Dropping the pool handle closes its shutdown channel.
        drop(self.pool.take());
    }
}

async fn submit(client: &reqwest::Client, srv: &TestServer, body: serde_json::Value) -> String {
    let res = client.post(srv.url("/jobs")).json(&body).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["state"], "PENDING");
    body["id"].as_str().unwrap().to_string()
}

async fn wait_for_state(
    client: &reqwest::Client,
    srv: &TestServer,
    id: &str,
    state: &str,
) -> serde_json::Value {
    // Execution is asynchronous; poll the status view until it catches up.
    for _ in 0..200 {
        let res = client.get(srv.url(&format!("/jobs/{id}"))).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = res.json().await.unwrap();
        if body["state"] == state {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not reach {state} within timeout");
}

#[tokio::test]
async fn health_reports_store_and_broker() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("x-request-id"));

    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["services"]["store"]["status"], "ok");
    assert_eq!(body["services"]["broker"]["status"], "ok");
}

#[tokio::test]
async fn every_response_carries_security_headers() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    for path in ["/health", "/jobs/stats", "/jobs/not-a-uuid"] {
        let res = client.get(srv.url(path)).send().await.unwrap();
        let headers = res.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff", "{path}");
        assert_eq!(headers["x-frame-options"], "DENY", "{path}");
        assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");
        assert_eq!(headers["strict-transport-security"], "max-age=31536000; includeSubDomains");
        assert_eq!(headers["x-xss-protection"], "1; mode=block");
        assert_eq!(headers["content-security-policy"], "default-src 'self'");
    }
}

#[tokio::test]
async fn client_request_id_is_echoed() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let res = client
        .get(srv.url("/jobs/stats"))
        .header("x-request-id", "trace-42")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-request-id"], "trace-42");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submitted_job_succeeds_with_its_result() {
    let srv = TestServer::spawn(true).await;
    let client = reqwest::Client::new();

    let id = submit(&client, &srv, json!({"kind": "echo", "payload": {"x": 1}})).await;
    let body = wait_for_state(&client, &srv, &id, "SUCCEEDED").await;

    assert_eq!(body["result"], json!({"x": 1}));
    assert_eq!(body["attempt_count"], 1);
    assert_eq!(body["kind"], "echo");
    assert!(body.get("error").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_without_handler_fails_permanently() {
    let srv = TestServer::spawn(true).await;
    let client = reqwest::Client::new();

    let id = submit(&client, &srv, json!({"kind": "reports.render", "payload": null})).await;
    let body = wait_for_state(&client, &srv, &id, "FAILED").await;

    assert_eq!(body["error"]["kind"], "permanent");
    assert_eq!(body["attempt_count"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_job_can_be_cancelled() {
    let srv = TestServer::spawn(true).await;
    let client = reqwest::Client::new();

    let id = submit(&client, &srv, json!({"kind": "sleep", "payload": {"ms": 60000}})).await;
    wait_for_state(&client, &srv, &id, "RUNNING").await;

    let res = client.post(srv.url(&format!("/jobs/{id}/cancel"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["cancelled"], true);

    wait_for_state(&client, &srv, &id, "CANCELLED").await;

    // A second cancel is a no-op.
    let res = client.post(srv.url(&format!("/jobs/{id}/cancel"))).send().await.unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn queued_jobs_are_listed_and_counted() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        submit(&client, &srv, json!({"kind": "email", "payload": {}})).await;
    }
    submit(&client, &srv, json!({"payload": {}})).await;

    let res = client
        .get(srv.url("/jobs?state=pending&kind=email&limit=2"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["count"], 2);
    assert!(body["jobs"].as_array().unwrap().iter().all(|j| j["kind"] == "email"));

    let res = client.get(srv.url("/jobs/stats")).send().await.unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["total"], 4);
    assert_eq!(body["by_state"]["pending"], 4);
}

#[tokio::test]
async fn pending_job_is_cancelled_without_workers() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let id = submit(&client, &srv, json!({"payload": {"x": 1}})).await;
    let res = client.post(srv.url(&format!("/jobs/{id}/cancel"))).send().await.unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["cancelled"], true);

    let body = wait_for_state(&client, &srv, &id, "CANCELLED").await;
    assert_eq!(body["attempt_count"], 0);
}

#[tokio::test]
async fn bad_requests_get_json_errors() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/jobs/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");

    let unknown = uuid::Uuid::now_v7();
    let res = client.get(srv.url(&format!("/jobs/{unknown}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = client.post(srv.url(&format!("/jobs/{unknown}/cancel"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .post(srv.url("/jobs"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_body");

    let res = client.get(srv.url("/jobs?state=sleeping")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
}
