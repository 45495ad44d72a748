//! Full wire round trip: framed TCP client → ingress → engine → egress →
//! framed TCP subscriber.

use std::{path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use sift_engine::{
    server,
    services::{RulePublisher, TrainService},
    storage::StoreCache,
};
use sift_protocol::{Client, RuleSubscriber, message};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
};

fn scratch_root() -> PathBuf {
    let root = std::env::temp_dir().join(format!("sift-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&root).unwrap();
    root
}

#[tokio::test]
async fn rules_flow_from_ingress_to_subscriber() {
    let root = scratch_root();
    let cache = StoreCache::new();
    let (updates_tx, updates_rx) = mpsc::channel(100);
    let service = Arc::new(TrainService::new(root, cache.clone(), updates_tx));
    let feed = broadcast::Sender::new(64);
    tokio::spawn(RulePublisher::new(cache, feed.clone()).run(updates_rx));

    let train_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let train_addr = train_listener.local_addr().unwrap();
    let rules_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let rules_addr = rules_listener.local_addr().unwrap();
    tokio::spawn(server::serve_training(train_listener, service));
    tokio::spawn(server::serve_rules(rules_listener, feed));

    let mut subscriber = RuleSubscriber::connect(&rules_addr.to_string()).await.unwrap();
    // Let the egress accept loop register the subscription before anything
    // can be published.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = Client::connect(&format!("tcp://{train_addr}")).await.unwrap();
    for _ in 0..3 {
        let reply = client
            .add_train_packet("wire", false, true, Bytes::from_static(&[0x41, 0x42, 0x43]))
            .await
            .unwrap();
        assert_eq!(&reply[..], message::SUCCESS);
    }
    for _ in 0..3 {
        client
            .add_train_packet("wire", true, true, Bytes::from_static(&[0x41, 0x42, 0x44]))
            .await
            .unwrap();
    }

    let rule = tokio::time::timeout(Duration::from_secs(5), subscriber.next_rule())
        .await
        .expect("rule published within deadline")
        .unwrap();
    assert_eq!(rule.dataset, "wire");
    assert!(rule.incoming);
    assert!(rule.require_forbid);
    assert_eq!(&rule.sequence[..], &[0x00, 0x00, 0x41, 0x42, 0x44]);
}
