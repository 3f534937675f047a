//! End-to-end scenarios crossing both surfaces: messages preloaded over
//! HTTP and consumed over AMQP, and publishes inspected over HTTP.

use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;

use mq_client::MockClient;
use mq_common::{Message, MessageStatus};
use mq_server::{AmqpServer, AmqpServerConfig, AmqpServerHandle};
use mq_storage::Storage;

mod support;
use support::TestAmqpClient;

struct Mock {
    storage: Storage,
    amqp: AmqpServerHandle,
    http: MockClient,
    http_shutdown: oneshot::Sender<()>,
}

async fn start_mock() -> Mock {
    let storage = Storage::new();

    let amqp = AmqpServer::new(
        storage.clone(),
        AmqpServerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            server_properties: None,
            heartbeat: 0,
        },
    )
    .start()
    .await
    .unwrap();

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (http_shutdown, rx) = oneshot::channel::<()>();
    tokio::spawn(mq_http::serve(storage.clone(), listener, async {
        let _ = rx.await;
    }));

    Mock {
        storage,
        amqp,
        http: MockClient::new("127.0.0.1", port),
        http_shutdown,
    }
}

impl Mock {
    async fn stop(self) {
        let _ = self.http_shutdown.send(());
        self.amqp.shutdown().await;
    }
}

#[tokio::test]
async fn http_publish_amqp_consume_ack_http_history() {
    let mock = start_mock().await;
    let mut amqp = TestAmqpClient::connect(mock.amqp.local_addr()).await;

    let message: Message = serde_json::from_value(json!({
        "id": "m1",
        "value": [1, 2, 3],
        "exchange": "",
        "routing_key": "",
        "properties": null,
    }))
    .unwrap();
    mock.http.publish_message("q", &message).await.unwrap();

    amqp.consume("q", "c1").await;
    let delivery = amqp.next_delivery().await;
    assert_eq!(&delivery.body[..], b"[1,2,3]");
    amqp.ack(delivery.delivery_tag).await;

    let history = timeout(Duration::from_secs(5), async {
        loop {
            let history = mock.http.queue_history("q").await.unwrap();
            if !history.is_empty() && history[0].status == MessageStatus::Acked {
                return history;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ack did not reach history in time");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].message.id, "m1");
    assert_eq!(history[0].message.value, json!([1, 2, 3]));
    assert_eq!(history[0].queue, "q");

    amqp.close().await;
    mock.stop().await;
}

#[tokio::test]
async fn amqp_publish_http_inspect() {
    let mock = start_mock().await;
    let mut amqp = TestAmqpClient::connect(mock.amqp.local_addr()).await;

    amqp.publish(b"[1,2,3]", "ex", "").await;

    let messages = mock.http.exchange_messages("ex").await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].value, json!([1, 2, 3]));
    assert_eq!(messages[0].exchange, "ex");
    assert_eq!(messages[0].routing_key, "");

    amqp.close().await;
    mock.stop().await;
}

#[tokio::test]
async fn fanout_histories_visible_over_http() {
    let mock = start_mock().await;
    let mut amqp = TestAmqpClient::connect(mock.amqp.local_addr()).await;

    amqp.declare_exchange("fx", "fanout").await;
    amqp.queue_bind("q1", "fx", "q1").await;
    amqp.queue_bind("q2", "fx", "q2").await;
    amqp.publish(b"{\"k\": true}", "fx", "rk").await;

    for queue in ["q1", "q2"] {
        let history = mock.http.queue_history(queue).await.unwrap();
        assert_eq!(history.len(), 1, "queue {queue}");
        assert_eq!(history[0].message.value, json!({"k": true}));
        assert_eq!(history[0].message.routing_key, "rk");
        assert_eq!(history[0].status, MessageStatus::Init);
    }

    amqp.close().await;
    mock.stop().await;
}

#[tokio::test]
async fn reset_clears_every_collection() {
    let mock = start_mock().await;
    let mut amqp = TestAmqpClient::connect(mock.amqp.local_addr()).await;

    amqp.declare_queue("q").await;
    amqp.publish(b"\"x\"", "", "q").await;
    amqp.publish(b"\"y\"", "ex", "").await;

    mock.http.reset().await.unwrap();

    assert!(mock.http.exchange_messages("").await.unwrap().is_empty());
    assert!(mock.http.exchange_messages("ex").await.unwrap().is_empty());
    assert!(mock.http.queue_history("q").await.unwrap().is_empty());
    assert_eq!(mock.storage.pending_count("q"), 0);

    amqp.close().await;
    mock.stop().await;
}

#[tokio::test]
async fn delete_exchange_messages_leaves_queues_and_history() {
    let mock = start_mock().await;
    let mut amqp = TestAmqpClient::connect(mock.amqp.local_addr()).await;

    amqp.declare_queue("q").await;
    amqp.publish(b"\"x\"", "", "q").await;

    mock.http.delete_exchange_messages("").await.unwrap();

    assert!(mock.http.exchange_messages("").await.unwrap().is_empty());
    assert_eq!(mock.http.queue_history("q").await.unwrap().len(), 1);

    // the queued copy is still deliverable
    amqp.consume("q", "c1").await;
    let delivery = amqp.next_delivery().await;
    assert_eq!(&delivery.body[..], b"\"x\"");

    amqp.close().await;
    mock.stop().await;
}
