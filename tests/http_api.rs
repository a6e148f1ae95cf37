use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use ulid::Ulid;

use gridlock::engine::Engine;
use gridlock::http;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let dir = std::env::temp_dir().join(format!("gridlock_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let engine = Arc::new(Engine::new(dir.join("gridlock.wal")).unwrap());
    engine.seed_grid(5, 5).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = http::build_router(engine);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

async fn post(
    client: &reqwest::Client,
    addr: SocketAddr,
    path: &str,
    body: Value,
) -> (u16, Value) {
    let resp = client
        .post(format!("http://{addr}{path}"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

async fn get(client: &reqwest::Client, addr: SocketAddr, path: &str) -> (u16, Value) {
    let resp = client
        .get(format!("http://{addr}{path}"))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn health_and_machine_list() {
    let addr = start_test_server().await;
    let client = reqwest::Client::new();

    let (status, body) = get(&client, addr, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], "OK");

    let (status, body) = get(&client, addr, "/api/machines").await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    let machines = body["data"].as_array().unwrap();
    assert_eq!(machines.len(), 25);
    assert_eq!(machines[0]["id"], 1);
    assert_eq!(machines[0]["row"], 1);
    assert_eq!(machines[0]["col"], 1);
    assert_eq!(machines[0]["status"], "available");
}

#[tokio::test]
async fn full_booking_flow() {
    let addr = start_test_server().await;
    let client = reqwest::Client::new();

    // u1 takes a hold on machine 1
    let (status, body) = post(
        &client,
        addr,
        "/api/machines/1/hold",
        json!({ "holder": "u1" }),
    )
    .await;
    assert_eq!(status, 200);
    let token = body["data"]["hold_token"].as_str().unwrap().to_string();

    // u2 loses the race
    let (status, body) = post(
        &client,
        addr,
        "/api/machines/1/hold",
        json!({ "holder": "u2" }),
    )
    .await;
    assert_eq!(status, 409);
    assert_eq!(body["success"], false);

    // u1 confirms
    let (status, _) = post(
        &client,
        addr,
        "/api/machines/1/confirm",
        json!({ "holder": "u1", "hold_token": token }),
    )
    .await;
    assert_eq!(status, 200);

    let (_, body) = get(&client, addr, "/api/machines").await;
    let m1 = &body["data"].as_array().unwrap()[0];
    assert_eq!(m1["status"], "booked");
    assert_eq!(m1["booked_by"], "u1");

    // u2 still can't hold a booked machine
    let (status, _) = post(
        &client,
        addr,
        "/api/machines/1/hold",
        json!({ "holder": "u2" }),
    )
    .await;
    assert_eq!(status, 409);

    // Only u1 may cancel
    let (status, _) = post(
        &client,
        addr,
        "/api/machines/1/cancel",
        json!({ "holder": "u2" }),
    )
    .await;
    assert_eq!(status, 404);

    let (status, _) = post(
        &client,
        addr,
        "/api/machines/1/cancel",
        json!({ "holder": "u1" }),
    )
    .await;
    assert_eq!(status, 200);

    let (_, body) = get(&client, addr, "/api/machines").await;
    assert_eq!(body["data"].as_array().unwrap()[0]["status"], "available");
}

#[tokio::test]
async fn release_flow() {
    let addr = start_test_server().await;
    let client = reqwest::Client::new();

    let (_, body) = post(
        &client,
        addr,
        "/api/machines/2/hold",
        json!({ "holder": "u1" }),
    )
    .await;
    let token = body["data"]["hold_token"].as_str().unwrap().to_string();

    let (status, _) = post(
        &client,
        addr,
        "/api/machines/2/release",
        json!({ "hold_token": token }),
    )
    .await;
    assert_eq!(status, 200);

    // Releasing twice: the hold is gone
    let (status, body) = post(
        &client,
        addr,
        "/api/machines/2/release",
        json!({ "hold_token": token }),
    )
    .await;
    assert_eq!(status, 404);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn scoped_holds_are_invisible_to_other_scopes() {
    let addr = start_test_server().await;
    let client = reqwest::Client::new();

    let (status, _) = post(
        &client,
        addr,
        "/api/machines/3/hold",
        json!({ "holder": "u1", "scope": "yoga-0800" }),
    )
    .await;
    assert_eq!(status, 200);

    let (_, body) = get(&client, addr, "/api/machines?scope=yoga-0800").await;
    let m3 = &body["data"].as_array().unwrap()[2];
    assert_eq!(m3["status"], "held");
    assert_eq!(m3["held_by"], "u1");

    // The unscoped view is unaffected
    let (_, body) = get(&client, addr, "/api/machines").await;
    assert_eq!(body["data"].as_array().unwrap()[2]["status"], "available");
}

#[tokio::test]
async fn validation_and_not_found() {
    let addr = start_test_server().await;
    let client = reqwest::Client::new();

    // Empty holder
    let (status, _) = post(
        &client,
        addr,
        "/api/machines/1/hold",
        json!({ "holder": "" }),
    )
    .await;
    assert_eq!(status, 400);

    // Unknown machine
    let (status, _) = post(
        &client,
        addr,
        "/api/machines/999/hold",
        json!({ "holder": "u1" }),
    )
    .await;
    assert_eq!(status, 404);

    // Malformed token
    let (status, _) = post(
        &client,
        addr,
        "/api/machines/1/release",
        json!({ "hold_token": "not-a-token" }),
    )
    .await;
    assert_eq!(status, 404);

    let (status, _) = post(
        &client,
        addr,
        "/api/machines/1/confirm",
        json!({ "holder": "u1", "hold_token": "not-a-token" }),
    )
    .await;
    assert_eq!(status, 409);
}
