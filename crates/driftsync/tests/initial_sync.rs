//! Snapshot transfer between two peers over an in-memory connector.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use driftsync::store::{MemoryStore, Storage};
use driftsync::sync::{
    ChannelConfig, ChannelHooks, FastSyncConfig, FastSyncOutcome, MemoryConnector, SyncPackage,
    SyncRole,
};
use driftsync::{InitialSync, InitialSyncConfig, InitialSyncEvent};
use driftsync_testkit::fixtures::{note, sample_registry, seeded_store};
use tokio::sync::broadcast;

fn drain(events: &mut broadcast::Receiver<InitialSyncEvent>) -> Vec<InitialSyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(role: SyncRole) -> InitialSyncConfig {
    InitialSyncConfig {
        channel: ChannelConfig {
            timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        },
        fast_sync: FastSyncConfig {
            collections: vec!["notes".into()],
            batch_size: 1,
        },
        role,
        ..Default::default()
    }
}

async fn ids(store: &MemoryStore) -> Vec<i64> {
    store
        .find_objects("notes", &Default::default(), None)
        .await
        .unwrap()
        .iter()
        .filter_map(|o| o.get("id").and_then(|v| v.as_i64()))
        .collect()
}

#[tokio::test]
async fn test_one_way_snapshot() {
    let source = seeded_store(3).await;
    let target = Arc::new(MemoryStore::new(sample_registry()));
    let (a, b) = MemoryConnector::pair();

    let sender = InitialSync::new(source, a, config(SyncRole::Sender));
    let receiver = InitialSync::new(target.clone(), b, config(SyncRole::Receiver));
    let mut events = receiver.events().subscribe();

    let (sent, received) = tokio::join!(sender.run(), receiver.run());
    let sent = sent.unwrap();
    let received = received.unwrap();

    assert_eq!(sent.outcome, FastSyncOutcome::Finished);
    assert_eq!(received.outcome, FastSyncOutcome::Finished);
    assert_eq!(received.role, SyncRole::Receiver);
    assert_eq!(ids(&target).await, vec![1, 2, 3]);

    let events = drain(&mut events);
    assert_eq!(events.first(), Some(&InitialSyncEvent::Connecting));
    assert_eq!(events.get(1), Some(&InitialSyncEvent::Connected));
    assert!(events
        .iter()
        .any(|e| matches!(e, InitialSyncEvent::Prepared { info } if info.object_count == 3)));
    assert_eq!(
        events.last(),
        Some(&InitialSyncEvent::Finished {
            outcome: FastSyncOutcome::Finished
        })
    );
}

#[tokio::test]
async fn test_negotiated_two_way_sync_yields_union() {
    // Two objects on one side, one on the other; the emptier side receives
    // first.
    let big = seeded_store(2).await;
    let small = Arc::new(MemoryStore::new(sample_registry()));
    small.create_object("notes", note(3, "three")).await.unwrap();

    let (a, b) = MemoryConnector::pair();
    let mut big_config = config(SyncRole::Receiver);
    big_config.negotiate_roles = true;
    big_config.two_way = true;
    let mut small_config = config(SyncRole::Sender);
    small_config.negotiate_roles = true;
    small_config.two_way = true;

    let big_sync = InitialSync::new(big.clone(), a, big_config);
    let small_sync = InitialSync::new(small.clone(), b, small_config);
    let mut big_events = big_sync.events().subscribe();
    let mut small_events = small_sync.events().subscribe();

    let (big_report, small_report) = tokio::join!(big_sync.run(), small_sync.run());
    assert_eq!(big_report.unwrap().role, SyncRole::Sender);
    assert_eq!(small_report.unwrap().role, SyncRole::Receiver);

    assert_eq!(ids(&big).await, vec![1, 2, 3]);
    assert_eq!(ids(&small).await, vec![1, 2, 3]);

    assert!(drain(&mut big_events).contains(&InitialSyncEvent::RoleSwitch {
        before: SyncRole::Receiver,
        after: SyncRole::Sender,
    }));
    assert!(drain(&mut small_events).contains(&InitialSyncEvent::RoleSwitch {
        before: SyncRole::Sender,
        after: SyncRole::Receiver,
    }));
}

/// Holds back the n-th confirmation this side writes.
struct DelayConfirm {
    confirms: AtomicUsize,
    nth: usize,
    delay: Duration,
}

#[async_trait]
impl ChannelHooks for DelayConfirm {
    async fn pre_send(&self, package: &SyncPackage) {
        if *package == SyncPackage::Confirm
            && self.confirms.fetch_add(1, Ordering::SeqCst) + 1 == self.nth
        {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[tokio::test]
async fn test_stall_reconnects_and_completes() {
    init_tracing();
    let source = seeded_store(4).await;
    let target = Arc::new(MemoryStore::new(sample_registry()));
    // The receiver initiates, so the stalled sender waits for its reconnect.
    let (initiator, acceptor) = MemoryConnector::pair();

    let mut sender_config = config(SyncRole::Sender);
    sender_config.channel.timeout = Some(Duration::from_millis(100));
    let sender = InitialSync::new(source, acceptor, sender_config);
    let receiver = InitialSync::new(target.clone(), initiator, config(SyncRole::Receiver)).with_hooks(
        Arc::new(DelayConfirm {
            confirms: AtomicUsize::new(0),
            nth: 3,
            delay: Duration::from_millis(400),
        }),
    );
    let mut sender_events = sender.events().subscribe();

    let (sent, received) = tokio::join!(sender.run(), receiver.run());
    let sent = sent.unwrap();
    let received = received.unwrap();

    assert_eq!(sent.outcome, FastSyncOutcome::Finished);
    assert_eq!(sent.reconnects, 1);
    assert_eq!(received.reconnects, 1);
    assert_eq!(ids(&target).await, vec![1, 2, 3, 4]);
    assert!(drain(&mut sender_events).contains(&InitialSyncEvent::Reconnected { attempt: 1 }));
}

#[tokio::test]
async fn test_exhausted_reconnects_surface_the_stall() {
    let source = seeded_store(2).await;
    let (a, b) = MemoryConnector::pair();

    let mut sender_config = config(SyncRole::Sender);
    sender_config.channel.timeout = Some(Duration::from_millis(50));
    sender_config.max_reconnects = 0;
    let sender = InitialSync::new(source, a, sender_config);

    // The peer connects but never answers.
    let _silent = tokio::spawn(async move {
        use driftsync::sync::Connector;
        let transport = b.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(transport);
    });

    let result = sender.run().await;
    assert!(matches!(
        result,
        Err(driftsync::DriftError::ReconnectsExhausted { attempts: 0, .. })
    ));
}

#[tokio::test]
async fn test_cancel_before_start_reports_cancelled() {
    let source = seeded_store(2).await;
    let target = Arc::new(MemoryStore::new(sample_registry()));
    let (a, b) = MemoryConnector::pair();

    let mut sender_config = config(SyncRole::Sender);
    sender_config.max_reconnects = 0;
    let sender = InitialSync::new(source, a, sender_config);
    let receiver = InitialSync::new(target.clone(), b, config(SyncRole::Receiver));
    receiver.cancel();

    let (_, received) = tokio::join!(sender.run(), receiver.run());
    assert_eq!(received.unwrap().outcome, FastSyncOutcome::Cancelled);
    assert!(ids(&target).await.is_empty());
}
