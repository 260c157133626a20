mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeTransport, ok, server};
use litesentry::config::AppConfig;
use litesentry::context::AppContext;
use litesentry::db::MemoryJobStore;
use litesentry::rpc::{MethodHandler, Request, Response};
use serde_json::{Value, json};
use tokio::time::timeout;

fn handler() -> MethodHandler {
    let mut gone = server("gone");
    gone.host = "unreachable.example.com".into();
    let config = AppConfig {
        servers: vec![server("db1"), gone],
        ..AppConfig::default()
    };
    let fake = Arc::new(FakeTransport::new());
    fake.on("find ", ok("/srv/a.db\n")).on("stat -c", ok("ERROR\n"));
    MethodHandler::new(AppContext::with_transport(
        config,
        Arc::new(MemoryJobStore::new()),
        fake,
    ))
}

async fn call(handler: &MethodHandler, method: &str, params: Value) -> Response {
    handler
        .handle(Request {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: (!params.is_null()).then_some(params),
            id: Some(json!(1)),
        })
        .await
}

fn result(response: Response) -> Value {
    assert!(response.error.is_none(), "{:?}", response.error);
    response.result.unwrap()
}

#[tokio::test]
async fn enqueued_job_can_be_fetched_and_listed() {
    let handler = handler();

    let reply = result(
        call(
            &handler,
            "jobs.enqueue",
            json!({ "kind": "discovery", "payload": { "server": "db1" } }),
        )
        .await,
    );
    let id = reply["id"].as_str().unwrap().to_string();

    let job = timeout(Duration::from_secs(5), async {
        loop {
            let job = result(call(&handler, "jobs.get", json!({ "id": id })).await);
            if job["status"] == "Completed" {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(job["name"], "discovery db1");
    assert_eq!(job["progress"], 100);

    let listed = result(call(&handler, "jobs.list", json!({ "status": "Completed" })).await);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let running = result(call(&handler, "jobs.list", json!({ "status": "Running" })).await);
    assert!(running.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let handler = handler();

    let response = call(&handler, "jobs.get", json!({ "id": "missing" })).await;
    assert_eq!(response.error.unwrap().code, -32000);

    let cancel = result(call(&handler, "jobs.cancel", json!({ "id": "missing" })).await);
    assert_eq!(cancel["cancelled"], false);
}

#[tokio::test]
async fn bad_params_are_rejected() {
    let handler = handler();

    let response = call(&handler, "jobs.enqueue", json!({ "kind": "teleport" })).await;
    assert_eq!(response.error.unwrap().code, -32602);

    let response = call(&handler, "jobs.list", json!({ "status": "sleeping" })).await;
    assert_eq!(response.error.unwrap().code, -32602);

    let response = call(&handler, "jobs.explode", Value::Null).await;
    assert_eq!(response.error.unwrap().code, -32601);
}

#[tokio::test]
async fn server_list_omits_credentials() {
    let handler = handler();

    let servers = result(call(&handler, "servers.list", Value::Null).await);
    let text = servers.to_string();
    assert!(text.contains("db1.example.com"));
    assert!(!text.contains("hunter2"));
    assert_eq!(servers[0]["name"], "db1");
}

#[tokio::test]
async fn server_test_reports_reachability() {
    let handler = handler();

    let up = result(call(&handler, "servers.test", json!({ "server": "db1" })).await);
    assert_eq!(up["reachable"], true);

    let down = result(call(&handler, "servers.test", json!({ "server": "gone" })).await);
    assert_eq!(down["reachable"], false);

    let unknown = call(&handler, "servers.test", json!({ "server": "nope" })).await;
    assert_eq!(unknown.error.unwrap().code, -32000);
}

#[tokio::test]
async fn status_reports_queue_shape() {
    let handler = handler();

    let status = result(call(&handler, "daemon.status", Value::Null).await);
    assert_eq!(status["servers"], 2);
    assert_eq!(status["queue"]["workers"], 4);
    assert_eq!(status["queue"]["shutting_down"], false);
}
