//! Control-API tests against a real listener.

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use mq_client::{ClientError, MockClient};
use mq_common::{Message, MessageStatus, QueuedMessage};
use mq_storage::Storage;

struct TestApi {
    storage: Storage,
    client: MockClient,
    base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
}

async fn start_api() -> TestApi {
    let storage = Storage::new();
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown, rx) = oneshot::channel::<()>();
    tokio::spawn(mq_http::serve(storage.clone(), listener, async {
        let _ = rx.await;
    }));
    TestApi {
        storage,
        client: MockClient::new("127.0.0.1", port),
        base_url: format!("http://127.0.0.1:{port}"),
        shutdown: Some(shutdown),
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn message(id: &str, value: Value) -> Message {
    serde_json::from_value(json!({
        "id": id,
        "value": value,
        "exchange": "",
        "routing_key": "",
        "properties": null,
    }))
    .unwrap()
}

#[tokio::test]
async fn healthcheck_returns_json_ok_string() {
    let api = start_api().await;

    let response = reqwest::get(format!("{}/healthcheck", api.base_url)).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!("200 OK"));

    api.client.healthcheck().await.unwrap();
}

#[tokio::test]
async fn publish_message_enqueues_and_appears_in_history() {
    let api = start_api().await;

    api.client.publish_message("q", &message("m1", json!([1, 2, 3]))).await.unwrap();

    let history = api.client.queue_history("q").await.unwrap();
    assert_eq!(history.len(), 1);
    let QueuedMessage { message, queue, status } = &history[0];
    assert_eq!(message.id, "m1");
    assert_eq!(message.value, json!([1, 2, 3]));
    assert_eq!(queue, "q");
    assert_eq!(*status, MessageStatus::Init);

    assert_eq!(api.storage.pending_count("q"), 1);
}

#[tokio::test]
async fn history_is_filtered_per_queue_and_newest_first() {
    let api = start_api().await;

    api.client.publish_message("q1", &message("m1", json!(1))).await.unwrap();
    api.client.publish_message("q1", &message("m2", json!(2))).await.unwrap();
    api.client.publish_message("q2", &message("m3", json!(3))).await.unwrap();

    let history = api.client.queue_history("q1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].message.id, "m2");
    assert_eq!(history[1].message.id, "m1");

    assert!(api.client.queue_history("unknown").await.unwrap().is_empty());
}

#[tokio::test]
async fn message_without_id_gets_one_assigned() {
    let api = start_api().await;

    let response = reqwest::Client::new()
        .post(format!("{}/queues/q/messages", api.base_url))
        .json(&json!({"value": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let history = api.client.queue_history("q").await.unwrap();
    assert!(!history[0].message.id.is_empty());
    assert_eq!(history[0].message.value, json!("hello"));
}

#[tokio::test]
async fn exchange_log_get_and_delete() {
    let api = start_api().await;

    api.storage.publish_to_exchange(
        "ex",
        Message::new(json!("a")).with_id("m1").with_exchange("ex"),
    );
    api.storage.publish_to_exchange(
        "ex",
        Message::new(json!("b")).with_id("m2").with_exchange("ex"),
    );

    let messages = api.client.exchange_messages("ex").await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, "m2");
    assert_eq!(messages[1].id, "m1");

    api.client.delete_exchange_messages("ex").await.unwrap();
    assert!(api.client.exchange_messages("ex").await.unwrap().is_empty());
}

#[tokio::test]
async fn default_exchange_resolves_with_empty_name() {
    let api = start_api().await;

    api.storage.declare_queue("q");
    api.storage
        .publish_to_exchange("", Message::new(json!(1)).with_id("m1").with_routing_key("q"));

    // /exchanges//messages
    let messages = api.client.exchange_messages("").await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "m1");

    api.client.delete_exchange_messages("").await.unwrap();
    assert!(api.client.exchange_messages("").await.unwrap().is_empty());
}

#[tokio::test]
async fn reset_clears_storage() {
    let api = start_api().await;

    api.client.publish_message("q", &message("m1", json!(1))).await.unwrap();
    api.storage.publish_to_exchange("ex", Message::new(json!(2)).with_id("m2"));

    api.client.reset().await.unwrap();

    assert!(api.client.queue_history("q").await.unwrap().is_empty());
    assert!(api.client.exchange_messages("ex").await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_message_body_is_a_bad_request() {
    let api = start_api().await;

    let response = reqwest::Client::new()
        .post(format!("{}/queues/q/messages", api.base_url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());

    assert!(api.client.queue_history("q").await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let api = start_api().await;

    let http_client = reqwest::Client::new();
    let wrong_suffix = http_client
        .get(format!("{}/exchanges/ex/nope", api.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_suffix.status(), 404);

    let wrong_history = http_client
        .get(format!("{}/queues/q/history", api.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_history.status(), 404);
}

#[tokio::test]
async fn client_surfaces_transport_errors() {
    // a port nothing listens on
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = MockClient::new("127.0.0.1", port);
    let error = client.healthcheck().await.unwrap_err();
    assert!(matches!(error, ClientError::Http(_)), "got {error:?}");
}
