//! End-to-end routing over the in-memory backends.

use courier_core::{
    Broker, GroupDirectory, Keyspace, MemoryArchive, MemoryBroker, MemoryStore, OutboundMessage,
    PoolConfig, PresenceRegistry, PublishPool, Router, RouterConfig, RouterParts,
    SequenceAllocator, SessionId, StoreDirectory, DEFAULT_SESSION_TTL,
};
use courier_protocol::{codec, Frame, Scope};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;

struct Cluster {
    router: Router,
    registry: Arc<PresenceRegistry>,
    directory: Arc<StoreDirectory>,
    broker: Arc<MemoryBroker>,
    pool: Arc<PublishPool>,
    keys: Keyspace,
}

fn cluster() -> Cluster {
    let store = Arc::new(MemoryStore::new());
    let keys = Keyspace::new("test");
    let registry = Arc::new(PresenceRegistry::new(
        store.clone(),
        keys.clone(),
        DEFAULT_SESSION_TTL,
    ));
    let directory = Arc::new(StoreDirectory::new(store.clone(), keys.clone()));
    let broker = Arc::new(MemoryBroker::new());
    let pool = Arc::new(PublishPool::start(broker.clone(), PoolConfig::default()));

    let router = Router::new(
        RouterParts {
            registry: registry.clone(),
            sequences: SequenceAllocator::new(store, keys.clone()),
            archive: Arc::new(MemoryArchive::new()),
            directory: directory.clone(),
            pool: pool.clone(),
            keys: keys.clone(),
        },
        RouterConfig::default(),
    );

    Cluster {
        router,
        registry,
        directory,
        broker,
        pool,
        keys,
    }
}

#[tokio::test]
async fn direct_message_reaches_the_serving_node() {
    let c = cluster();
    let mut inbox = c.broker.subscribe(&c.keys.node_topic("n1")).await.unwrap();

    c.registry
        .connect("u1", &SessionId::new("s1"), "n1", None)
        .await
        .unwrap();

    let receipt = c
        .router
        .push_message(OutboundMessage::direct("u2", "u1", b"hello".to_vec()))
        .await
        .unwrap();
    assert_eq!(receipt.scope, Scope::user("u1"));
    assert_eq!(receipt.sequence, 1);

    let payload = tokio::time::timeout(Duration::from_secs(1), inbox.next())
        .await
        .unwrap()
        .unwrap();
    let Frame::Notify { node_id, deliveries } = codec::decode(&payload).unwrap() else {
        panic!("expected a notification");
    };
    assert_eq!(node_id, "n1");
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].session_id, "s1");
    assert_eq!(deliveries[0].item.sequence, 1);
    assert_eq!(deliveries[0].item.envelope.body, b"hello");
}

#[tokio::test]
async fn group_fan_out_publishes_once_per_node() {
    let c = cluster();
    for member in ["u1", "u2", "u3"] {
        c.directory.add_member("g1", member).await.unwrap();
    }
    c.registry
        .connect("u1", &SessionId::new("s1"), "n1", None)
        .await
        .unwrap();
    c.registry
        .connect("u3", &SessionId::new("s3"), "n1", None)
        .await
        .unwrap();

    let receipt = c
        .router
        .push_message(OutboundMessage::group("u1", "g1", b"hi all".to_vec()))
        .await
        .unwrap();
    c.pool.shutdown().await;

    assert_eq!(receipt.scope, Scope::group("g1"));
    assert_eq!(receipt.sequence, 1);
    assert_eq!(receipt.dispatched, 1);
    assert_eq!(c.broker.published_count(&c.keys.node_topic("n1")), 1);
    assert_eq!(c.broker.total_published(), 1);

    // The offline member can still pull it.
    let items = c.router.sync("u2", &Scope::user("u2"), 0, 10).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].sequence, 1);
    assert_eq!(items[0].envelope.message_id, receipt.message_id);

    let timeline = c.router.sync("u2", &Scope::group("g1"), 0, 10).await.unwrap();
    assert_eq!(timeline.len(), 1);
}

#[tokio::test]
async fn offline_recipient_recovers_by_sequence() {
    let c = cluster();

    let mut ids = Vec::new();
    for i in 0..5u8 {
        let receipt = c
            .router
            .push_message(OutboundMessage::direct("u2", "u1", vec![i]))
            .await
            .unwrap();
        assert_eq!(receipt.sequence, u64::from(i) + 1);
        ids.push(receipt.message_id);
    }
    c.pool.shutdown().await;
    assert_eq!(c.broker.total_published(), 0);

    let items = c.router.sync("u1", &Scope::user("u1"), 2, 10).await.unwrap();
    let sequences: Vec<u64> = items.iter().map(|item| item.sequence).collect();
    assert_eq!(sequences, vec![3, 4, 5]);
    assert_eq!(items[0].envelope.message_id, ids[2]);
}

#[tokio::test]
async fn sessions_on_different_nodes_get_separate_jobs() {
    let c = cluster();
    c.registry
        .connect("u1", &SessionId::new("phone"), "n1", None)
        .await
        .unwrap();
    c.registry
        .connect("u1", &SessionId::new("laptop"), "n2", None)
        .await
        .unwrap();

    let receipt = c
        .router
        .push_message(OutboundMessage::direct("u2", "u1", b"x".to_vec()))
        .await
        .unwrap();
    c.pool.shutdown().await;

    assert_eq!(receipt.dispatched, 2);
    assert_eq!(c.broker.published_count(&c.keys.node_topic("n1")), 1);
    assert_eq!(c.broker.published_count(&c.keys.node_topic("n2")), 1);
}

#[tokio::test]
async fn disconnected_session_is_not_targeted() {
    let c = cluster();
    let session = SessionId::new("s1");
    c.registry.connect("u1", &session, "n1", None).await.unwrap();
    c.registry.disconnect("u1", &session).await.unwrap();

    let receipt = c
        .router
        .push_message(OutboundMessage::direct("u2", "u1", b"x".to_vec()))
        .await
        .unwrap();
    c.pool.shutdown().await;

    assert_eq!(receipt.dispatched, 0);
    assert_eq!(c.broker.total_published(), 0);
    assert!(!c.registry.is_online("u1").await.unwrap());
}

#[tokio::test]
async fn group_message_sequences_every_member_inbox() {
    let c = cluster();
    let mut inbox = c.broker.subscribe(&c.keys.node_topic("n1")).await.unwrap();
    for member in ["u1", "u2"] {
        c.directory.add_member("g1", member).await.unwrap();
    }
    c.registry
        .connect("u1", &SessionId::new("s1"), "n1", None)
        .await
        .unwrap();

    let receipt = c
        .router
        .push_message(OutboundMessage::group("u3", "g1", b"hello group".to_vec()))
        .await
        .unwrap();
    c.pool.shutdown().await;

    assert_eq!((receipt.scope.clone(), receipt.sequence), (Scope::group("g1"), 1));
    assert_eq!(receipt.dispatched, 1);
    assert_eq!(c.broker.total_published(), 1);

    let inboxes = [
        ("u1", Scope::user("u1")),
        ("u2", Scope::user("u2")),
        ("u1", Scope::group("g1")),
    ];
    for (user, scope) in inboxes {
        let items = c.router.sync(user, &scope, 0, 10).await.unwrap();
        assert_eq!(items.len(), 1, "{scope}");
        assert_eq!(items[0].scope, scope);
        assert_eq!(items[0].sequence, 1, "{scope}");
        assert_eq!(items[0].envelope.message_id, receipt.message_id);
    }

    let payload = tokio::time::timeout(Duration::from_secs(1), inbox.next())
        .await
        .unwrap()
        .unwrap();
    let Frame::Notify { node_id, deliveries } = codec::decode(&payload).unwrap() else {
        panic!("expected a notification");
    };
    assert_eq!(node_id, "n1");
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].user_id, "u1");
    assert_eq!(deliveries[0].item.scope, Scope::user("u1"));
    assert_eq!(deliveries[0].item.sequence, 1);
}
