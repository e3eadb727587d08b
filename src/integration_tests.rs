//! End-to-end scenarios driven entirely through the in-memory mock
//! transport: no real socket, no real server, just the actor and
//! subscription machinery talking to a channel pair.

use serde_json::json;
use tokio::time::{timeout, Duration};

use crate::client::Client;
use crate::transport::mock::mock_pair;

fn test_timeout() -> Duration {
    Duration::from_secs(2)
}

#[tokio::test]
async fn send_receives_matching_response_by_req_id() {
    let (socket, mut server) = mock_pair();
    let client = Client::new_with_socket(socket).await;

    let send_fut = client.send(json!({"ping": 1}));
    let req = timeout(test_timeout(), server.recv_json()).await.unwrap().unwrap();
    let req_id = req["req_id"].as_u64().unwrap();
    server.push_json(&json!({"ping": "pong", "req_id": req_id}));

    let response = timeout(test_timeout(), send_fut).await.unwrap().unwrap();
    assert_eq!(response["ping"], "pong");
}

#[tokio::test]
async fn duplicate_subscribe_reuses_the_same_upstream_subscription() {
    let (socket, mut server) = mock_pair();
    let client = Client::new_with_socket(socket).await;

    let mut first = client.subscribe(json!({"ticks": "R_100"})).await.unwrap();
    let req = timeout(test_timeout(), server.recv_json()).await.unwrap().unwrap();
    let req_id = req["req_id"].as_u64().unwrap();
    assert_eq!(req["ticks"], "R_100");
    assert_eq!(req["subscribe"], 1);

    let mut second = client.subscribe(json!({"ticks": "R_100"})).await.unwrap();

    // Only one subscribe request should ever have reached the wire.
    assert!(timeout(Duration::from_millis(100), server.recv_json()).await.is_err());

    server.push_json(&json!({
        "tick": {"quote": 101.5},
        "req_id": req_id,
        "subscription": {"id": "abc-123"},
    }));

    let a = timeout(test_timeout(), first.recv()).await.unwrap().unwrap().unwrap();
    let b = timeout(test_timeout(), second.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(a["tick"]["quote"], 101.5);
    assert_eq!(b["tick"]["quote"], 101.5);
}

#[tokio::test]
async fn dropping_the_last_consumer_forgets_the_subscription() {
    let (socket, mut server) = mock_pair();
    let client = Client::new_with_socket(socket).await;

    let subscription = client.subscribe(json!({"ticks": "R_100"})).await.unwrap();
    let req = timeout(test_timeout(), server.recv_json()).await.unwrap().unwrap();
    let req_id = req["req_id"].as_u64().unwrap();
    server.push_json(&json!({
        "tick": {"quote": 1},
        "req_id": req_id,
        "subscription": {"id": "sub-1"},
    }));

    drop(subscription);

    let forget_req = timeout(test_timeout(), server.recv_json()).await.unwrap().unwrap();
    assert_eq!(forget_req["forget"], "sub-1");
}

#[tokio::test]
async fn error_response_terminates_a_plain_request() {
    let (socket, mut server) = mock_pair();
    let client = Client::new_with_socket(socket).await;

    let send_fut = client.send(json!({"balance": 1}));
    let req = timeout(test_timeout(), server.recv_json()).await.unwrap().unwrap();
    let req_id = req["req_id"].as_u64().unwrap();
    server.push_json(&json!({
        "error": {"code": "InvalidToken", "message": "invalid token"},
        "req_id": req_id,
    }));

    let err = timeout(test_timeout(), send_fut).await.unwrap().unwrap_err();
    match err {
        crate::error::ClientError::Response(response) => {
            assert_eq!(response.message, "invalid token");
            assert_eq!(response.code.as_deref(), Some("InvalidToken"));
        }
        other => panic!("expected a Response error, got {other:?}"),
    }
}

#[tokio::test]
async fn forget_all_removes_every_subscription_of_the_named_types() {
    let (socket, mut server) = mock_pair();
    let client = Client::new_with_socket(socket).await;
    let connection_id = client.default_connection_id();

    let _ticks = client.subscribe(json!({"ticks": "R_100"})).await.unwrap();
    let ticks_req = timeout(test_timeout(), server.recv_json()).await.unwrap().unwrap();
    let ticks_req_id = ticks_req["req_id"].as_u64().unwrap();
    server.push_json(&json!({"tick": {"quote": 1}, "req_id": ticks_req_id, "subscription": {"id": "t-1"}}));

    let removed_fut = client.forget_all(connection_id, &["ticks"]);
    tokio::pin!(removed_fut);

    let forget_all_req = timeout(test_timeout(), server.recv_json()).await.unwrap().unwrap();
    assert_eq!(forget_all_req["forget_all"], json!(["ticks"]));
    let forget_all_req_id = forget_all_req["req_id"].as_u64().unwrap();
    server.push_json(&json!({"forget_all": 1, "req_id": forget_all_req_id}));

    let response = timeout(test_timeout(), removed_fut).await.unwrap().unwrap();
    assert_eq!(response["forget_all"], 1);
}

#[tokio::test]
async fn unrecognized_req_id_is_surfaced_as_an_unmatched_response() {
    let (socket, mut server) = mock_pair();
    let client = Client::new_with_socket(socket).await;
    let mut events = client.subscribe_events();

    server.push_json(&json!({"tick": {"quote": 1}, "req_id": 999_999}));

    loop {
        let event = timeout(test_timeout(), events.recv()).await.unwrap().unwrap();
        if let crate::event::Event::UnmatchedResponse { data, .. } = event {
            assert_eq!(data["req_id"], 999_999);
            break;
        }
    }
}
