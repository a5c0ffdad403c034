//! Acknowledgment, redelivery and cursor hooks.

mod common;

use common::{TestConsumer, cursor, dispatcher, dispatcher_with};
use pulsaresque::config::DispatcherConfig;
use pulsaresque::error::Error;
use pulsaresque::types::{ConsumerId, Epoch, Position, SubType};

#[tokio::test]
async fn test_stale_epoch_redelivers_nothing() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    let p = cursor.append_many(2).await;
    dispatcher.consumer_flow(c1.id(), 6).await;
    assert_eq!(c1.received().await, p);

    let count = dispatcher
        .redeliver_unacknowledged_messages(c1.id(), Epoch::new(2))
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(c1.received().await, vec![p[0], p[1], p[0], p[1]]);

    let stale = dispatcher
        .redeliver_unacknowledged_messages(c1.id(), Epoch::new(1))
        .await
        .unwrap();
    assert_eq!(stale, 0);
    assert_eq!(c1.received().await.len(), 4);

    let same = dispatcher
        .redeliver_unacknowledged_messages(c1.id(), Epoch::new(2))
        .await
        .unwrap();
    assert_eq!(same, 2);
    assert_eq!(c1.received().await.len(), 6);
}

#[tokio::test]
async fn test_redeliver_unknown_consumer() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);

    let err = dispatcher
        .redeliver_unacknowledged_messages(ConsumerId::new(5), Epoch::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConsumerNotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn test_redeliver_positions_only_requeues_held_entries() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    let p = cursor.append_many(3).await;
    dispatcher.consumer_flow(c1.id(), 4).await;
    assert_eq!(c1.received().await, p);

    let count = dispatcher
        .redeliver_positions(c1.id(), &[p[1], Position::new(9, 9)])
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(c1.received().await, vec![p[0], p[1], p[2], p[1]]);
}

#[tokio::test]
async fn test_removed_consumer_entries_go_to_others() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    let c2 = TestConsumer::new(2, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    dispatcher.add_consumer(c2.consumer.clone()).await.unwrap();
    let p = cursor.append_many(2).await;
    dispatcher.consumer_flow(c1.id(), 2).await;
    assert_eq!(c1.received().await, p);

    dispatcher.remove_consumer(c1.id()).await.unwrap();
    assert_eq!(dispatcher.stats().await.pending_redeliveries, 2);

    dispatcher.consumer_flow(c2.id(), 5).await;
    assert_eq!(c2.received().await, p);
    assert_eq!(dispatcher.stats().await.total_unacked, 2);

    let err = dispatcher.remove_consumer(c1.id()).await.unwrap_err();
    assert!(matches!(err, Error::ConsumerNotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn test_acknowledge_deletes_from_cursor() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    let p = cursor.append_many(3).await;
    dispatcher.consumer_flow(c1.id(), 3).await;

    dispatcher.acknowledge(c1.id(), &[p[0]]).await.unwrap();

    assert!(cursor.is_deleted(&p[0]).await);
    let stats = dispatcher.stats().await;
    assert_eq!(stats.total_unacked, 2);
    assert_eq!(stats.consumers[0].unacked, 2);
    assert!(!dispatcher.redelivery_tracker().await.contains(&p[0]));
}

#[tokio::test]
async fn test_late_ack_from_removed_consumer_still_applies() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    let p = cursor.append_many(1).await;
    dispatcher.consumer_flow(c1.id(), 1).await;
    dispatcher.remove_consumer(c1.id()).await.unwrap();

    dispatcher.acknowledge(c1.id(), &p).await.unwrap();

    assert!(cursor.is_deleted(&p[0]).await);
    assert_eq!(dispatcher.stats().await.pending_redeliveries, 0);
}

#[tokio::test]
async fn test_mark_delete_moving_forward_releases_unacked() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    let p = cursor.append_many(4).await;
    dispatcher.consumer_flow(c1.id(), 4).await;

    cursor.delete_up_to(p[1]).await;
    dispatcher.mark_delete_position_move_forward().await;

    let stats = dispatcher.stats().await;
    assert_eq!(stats.total_unacked, 2);
    assert_eq!(stats.consumers[0].unacked, 2);
    let tracker = dispatcher.redelivery_tracker().await;
    assert!(!tracker.contains(&p[1]));
    assert!(tracker.contains(&p[2]));
}

#[tokio::test]
async fn test_cursor_reset_rewinds_and_drops_replay_pool() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    let p = cursor.append_many(3).await;
    dispatcher.consumer_flow(c1.id(), 2).await;
    dispatcher.redeliver_positions(c1.id(), &[p[1]]).await.unwrap();
    assert_eq!(dispatcher.stats().await.pending_redeliveries, 1);

    dispatcher.cursor_is_reset().await;
    assert_eq!(dispatcher.stats().await.pending_redeliveries, 0);
    assert_eq!(cursor.read_position().await, p[0]);

    dispatcher.consumer_flow(c1.id(), 3).await;
    assert_eq!(c1.received().await, vec![p[0], p[1], p[0], p[1], p[2]]);
}

#[tokio::test]
async fn test_disconnect_all_with_reset_replays_from_mark_delete() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    let c2 = TestConsumer::new(2, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    dispatcher.add_consumer(c2.consumer.clone()).await.unwrap();
    let p = cursor.append_many(3).await;
    dispatcher.consumer_flow(c1.id(), 3).await;
    assert_eq!(c1.received().await, p);

    dispatcher.disconnect_all_consumers(true).await.unwrap();
    assert!(c1.transport.is_disconnected());
    assert!(c2.transport.is_disconnected());
    assert!(!dispatcher.is_consumer_connected().await);
    assert!(!dispatcher.is_closed());

    let c3 = TestConsumer::new(3, SubType::Shared);
    dispatcher.add_consumer(c3.consumer.clone()).await.unwrap();
    dispatcher.consumer_flow(c3.id(), 10).await;
    assert_eq!(c3.received().await, p);
}

#[tokio::test]
async fn test_failed_mark_delete_still_applies_remaining_acks() {
    let cursor = cursor();
    let config = DispatcherConfig::default().with_max_unacked_messages_per_subscription(3);
    let dispatcher = dispatcher_with(SubType::Shared, &cursor, config);
    let c1 = TestConsumer::new(1, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    let p = cursor.append_many(5).await;

    dispatcher.consumer_flow(c1.id(), 10).await;
    assert_eq!(c1.received().await, p[..3].to_vec());
    assert!(dispatcher.stats().await.blocked_on_unacked);

    cursor.fail_next_mark_deletes(1);
    let err = dispatcher
        .acknowledge(c1.id(), &[p[0], p[1], p[2]])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cursor(_)), "{err:?}");

    assert!(!cursor.is_deleted(&p[0]).await);
    assert!(cursor.is_deleted(&p[1]).await);
    assert!(cursor.is_deleted(&p[2]).await);

    // The acks released the ceiling, so the rest was dispatched.
    assert_eq!(c1.received().await, p);
    let stats = dispatcher.stats().await;
    assert_eq!(stats.total_unacked, 2);
    assert!(!stats.blocked_on_unacked);
    assert!(!dispatcher.redelivery_tracker().await.contains(&p[0]));
}
