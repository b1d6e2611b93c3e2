use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use murmur_net::chunking;
use murmur_net::{Gateway, GatewayConfig, GatewayError, MemoryBroker, Subscription};
use murmur_shared::constants::{GROUP_PREFIX, GROUP_SUFFIX_LEN};
use murmur_shared::{identity, ChatMessage, InboundMessage, MessageBody, Topic};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> GatewayConfig {
    GatewayConfig {
        presence_refresh_interval: Duration::ZERO,
        ..GatewayConfig::default()
    }
}

fn gateway(broker: &Arc<MemoryBroker>) -> Gateway {
    Gateway::new(Arc::new(broker.transport()), config())
}

fn inbox(gateway: &Gateway) -> (Subscription, mpsc::UnboundedReceiver<(Topic, InboundMessage)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = gateway.on_message(move |topic, message| {
        let _ = tx.send((topic, message.clone()));
    });
    (subscription, rx)
}

async fn next_chat(
    rx: &mut mpsc::UnboundedReceiver<(Topic, InboundMessage)>,
) -> (Topic, ChatMessage) {
    loop {
        let (topic, message) = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("inbox closed");
        if let InboundMessage::Chat(chat) = message {
            return (topic, chat);
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[tokio::test]
async fn join_with_punctuated_name() {
    let broker = MemoryBroker::new();
    let alice = gateway(&broker);

    let directory = alice.join("al!ce").await.unwrap();
    let identity = alice.identity().await.unwrap();
    let group_id = identity.group_id();

    let suffix = group_id
        .strip_prefix(&format!("{GROUP_PREFIX}alce-"))
        .expect("group id has the reserved prefix and sanitized name");
    assert_eq!(suffix.len(), GROUP_SUFFIX_LEN);
    assert!(suffix
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    assert_eq!(identity::decode(group_id).as_deref(), Some("alce"));
    assert_eq!(directory.get("alce"), Some(group_id));

    alice.leave().await;
}

#[tokio::test]
async fn broadcast_and_direct_messages_arrive_in_order() {
    let broker = MemoryBroker::new();
    let alice = gateway(&broker);
    let bob = gateway(&broker);
    let (_sub, mut bob_inbox) = inbox(&bob);

    bob.join("bob").await.unwrap();
    alice.join("alice").await.unwrap();

    for i in 0..20 {
        alice
            .send(Topic::Broadcast, &ChatMessage::text("alice", format!("msg {i}")))
            .await
            .unwrap();
    }
    alice
        .send(Topic::Direct, &ChatMessage::text("alice", "psst").to("bob"))
        .await
        .unwrap();

    for i in 0..20 {
        let (topic, chat) = next_chat(&mut bob_inbox).await;
        assert_eq!(topic, Topic::Broadcast);
        assert_eq!(chat.body, MessageBody::Text(format!("msg {i}")));
    }
    let (topic, dm) = next_chat(&mut bob_inbox).await;
    assert_eq!(topic, Topic::Direct);
    assert!(dm.involves("bob"));
    assert!(!dm.involves("carol"));

    alice.leave().await;
    bob.leave().await;
}

#[tokio::test]
async fn two_mib_file_is_chunked_and_rebuilt() {
    let broker = MemoryBroker::new();
    let alice = gateway(&broker);
    let bob = gateway(&broker);
    let (_sub, mut bob_inbox) = inbox(&bob);

    bob.join("bob").await.unwrap();
    alice.join("alice").await.unwrap();

    let data = payload(2 * 1024 * 1024);
    let file = ChatMessage::file("alice", "big.bin", "application/octet-stream", data.clone());
    let receipt = alice.send(Topic::Broadcast, &file).await.unwrap();
    assert_eq!(receipt.records, 3);

    let records = broker.published("global-chat");
    assert_eq!(records.len(), 3);
    for (i, record) in records.iter().enumerate() {
        let value: Value = serde_json::from_slice(&record.payload).unwrap();
        assert_eq!(value["content"]["chunkIndex"], i as u64);
        assert_eq!(value["content"]["totalChunks"], 3);
        assert_eq!(value["content"]["isChunked"], true);
        assert_eq!(
            value["content"]["fileId"].as_str(),
            receipt.transfer_id.as_deref()
        );
    }

    let (_, rebuilt) = next_chat(&mut bob_inbox).await;
    let fragment = rebuilt.file_fragment().unwrap();
    assert!(!fragment.chunked);
    assert_eq!(fragment.filename, "big.bin");
    assert_eq!(fragment.data, data);

    // Exactly one message for the whole transfer.
    assert!(bob_inbox.try_recv().is_err());

    alice.leave().await;
    bob.leave().await;
}

#[tokio::test]
async fn fragments_out_of_order_yield_one_message() {
    let broker = MemoryBroker::new();
    let bob = gateway(&broker);
    let (_sub, mut bob_inbox) = inbox(&bob);
    bob.join("bob").await.unwrap();

    let data = payload(2 * 1024 * 1024);
    let file = ChatMessage::file("alice", "big.bin", "application/octet-stream", data.clone());
    let transfer = chunking::split(&file, 750 * 1024).unwrap();
    assert_eq!(transfer.total(), 3);

    for i in [2, 0, 1] {
        let body = transfer.fragments[i].to_json().unwrap();
        broker.inject("global-chat", body).await;
    }
    // A duplicate after completion must not produce a second message.
    broker
        .inject("global-chat", transfer.fragments[0].to_json().unwrap())
        .await;
    broker
        .inject("global-chat", ChatMessage::text("alice", "after").to_json().unwrap())
        .await;

    let (_, rebuilt) = next_chat(&mut bob_inbox).await;
    assert_eq!(rebuilt.file_fragment().unwrap().data, data);

    let (_, after) = next_chat(&mut bob_inbox).await;
    assert_eq!(after.body, MessageBody::Text("after".into()));

    bob.leave().await;
}

#[tokio::test]
async fn failed_fragment_aborts_transfer() {
    let broker = MemoryBroker::new();
    let alice = gateway(&broker);
    alice.join("alice").await.unwrap();

    broker.fail_publishes_where(|topic, payload| {
        topic == "global-chat" && String::from_utf8_lossy(payload).contains("\"chunkIndex\":1,")
    });

    let file = ChatMessage::file("alice", "big.bin", "application/octet-stream", payload(2 * 1024 * 1024));
    let err = alice.send(Topic::Broadcast, &file).await.unwrap_err();

    assert!(matches!(
        err,
        GatewayError::FragmentPublish { index: 1, total: 3, .. }
    ));
    assert_eq!(err.failed_fragment(), Some(1));

    let published = broker.published("global-chat");
    assert_eq!(published.len(), 1);
    let value: Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(value["content"]["chunkIndex"], 0);

    alice.leave().await;
}

#[tokio::test]
async fn malformed_records_do_not_stop_delivery() {
    let broker = MemoryBroker::new();
    let bob = gateway(&broker);
    let (_sub, mut bob_inbox) = inbox(&bob);
    bob.join("bob").await.unwrap();

    broker.inject("global-chat", b"{not json".to_vec()).await;
    broker
        .inject(
            "global-chat",
            br#"{"username":"m","type":"file","content":{"data":"***","fileId":"x","chunkIndex":0,"totalChunks":2,"isChunked":true}}"#.to_vec(),
        )
        .await;
    broker
        .inject("global-chat", ChatMessage::text("alice", "still here").to_json().unwrap())
        .await;

    let (topic, message) = tokio::time::timeout(WAIT, bob_inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, Topic::Broadcast);
    assert!(matches!(message, InboundMessage::Unrecognized(_)));

    let (_, chat) = next_chat(&mut bob_inbox).await;
    assert_eq!(chat.body, MessageBody::Text("still here".into()));

    bob.leave().await;
}

#[tokio::test]
async fn presence_follows_join_and_leave() {
    let broker = MemoryBroker::new();
    let alice = gateway(&broker);
    let bob = gateway(&broker);
    let (_sub, mut bob_inbox) = inbox(&bob);

    bob.join("bob").await.unwrap();
    alice.join("alice").await.unwrap();

    wait_until(|| bob.list_active_participants().contains("alice")).await;

    alice.leave().await;

    let mut saw_leave = false;
    while !saw_leave {
        let (topic, message) = tokio::time::timeout(WAIT, bob_inbox.recv())
            .await
            .unwrap()
            .unwrap();
        if let InboundMessage::Left(notice) = message {
            assert_eq!(topic, Topic::Left);
            assert_eq!(notice.username, "alice");
            saw_leave = true;
        }
    }

    // No forced refresh: the leave notice alone takes alice off the list,
    // even though the hint-driven refresh may still see her group.
    assert!(!bob.list_active_participants().contains("alice"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let directory = bob.list_active_participants();
    assert!(!directory.contains("alice"));
    assert!(directory.contains("bob"));

    bob.leave().await;
}

#[tokio::test]
async fn unreachable_broker_fails_join_retryably() {
    let broker = MemoryBroker::new();
    broker.set_unreachable(true);
    let alice = gateway(&broker);

    let err = alice.join("alice").await.unwrap_err();
    assert!(matches!(err, GatewayError::Connection(_)));
    assert!(err.is_retryable());
    assert!(!alice.is_joined().await);

    broker.set_unreachable(false);
    alice.join("alice").await.unwrap();
    alice.leave().await;
}
