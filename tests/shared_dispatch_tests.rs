//! Shared subscription dispatch: round-robin, flow control and unacked ceilings.

mod common;

use common::{TestConsumer, cursor, dispatcher, dispatcher_with};
use pulsaresque::config::DispatcherConfig;
use pulsaresque::types::{ConsumerId, SubType};

#[tokio::test]
async fn test_round_robin_skips_consumer_without_credit() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    let c2 = TestConsumer::new(2, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    dispatcher.add_consumer(c2.consumer.clone()).await.unwrap();
    dispatcher.consumer_flow(c1.id(), 2).await;
    dispatcher.consumer_flow(c2.id(), 1).await;

    let p = cursor.append_many(3).await;
    assert_eq!(dispatcher.read_more_entries().await.unwrap(), 3);

    assert_eq!(c1.received().await, vec![p[0], p[2]]);
    assert_eq!(c2.received().await, vec![p[1]]);
}

#[tokio::test]
async fn test_never_sends_beyond_permits() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    cursor.append_many(10).await;

    dispatcher.consumer_flow(c1.id(), 4).await;
    assert_eq!(c1.transport.received_count().await, 4);

    dispatcher.read_more_entries().await.unwrap();
    assert_eq!(c1.transport.received_count().await, 4);

    dispatcher.consumer_flow(c1.id(), 3).await;
    assert_eq!(c1.transport.received_count().await, 7);
}

#[tokio::test]
async fn test_flow_for_unknown_consumer_is_ignored() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    cursor.append_many(2).await;

    dispatcher.consumer_flow(ConsumerId::new(99), 10).await;
    assert_eq!(dispatcher.stats().await.msgs_dispatched, 0);
}

#[tokio::test]
async fn test_subscription_ceiling_blocks_and_unblocks() {
    let cursor = cursor();
    let config = DispatcherConfig::default().with_max_unacked_messages_per_subscription(3);
    let dispatcher = dispatcher_with(SubType::Shared, &cursor, config);
    let c1 = TestConsumer::new(1, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    let p = cursor.append_many(5).await;

    dispatcher.consumer_flow(c1.id(), 10).await;
    assert_eq!(c1.received().await, p[..3].to_vec());
    assert!(dispatcher.stats().await.blocked_on_unacked);

    dispatcher.acknowledge(c1.id(), &[p[0]]).await.unwrap();
    assert_eq!(c1.received().await, p[..4].to_vec());
    assert!(dispatcher.stats().await.blocked_on_unacked);
}

#[tokio::test]
async fn test_add_unacked_messages_moves_ceiling_state() {
    let cursor = cursor();
    let config = DispatcherConfig::default().with_max_unacked_messages_per_subscription(3);
    let dispatcher = dispatcher_with(SubType::Shared, &cursor, config);
    let c1 = TestConsumer::new(1, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    dispatcher.consumer_flow(c1.id(), 10).await;

    cursor.append_many(2).await;
    dispatcher.read_more_entries().await.unwrap();
    assert_eq!(c1.transport.received_count().await, 2);

    dispatcher.add_unacked_messages(1).await;
    assert!(dispatcher.stats().await.blocked_on_unacked);

    cursor.append_many(1).await;
    assert_eq!(dispatcher.read_more_entries().await.unwrap(), 0);

    dispatcher.add_unacked_messages(-1).await;
    assert_eq!(c1.transport.received_count().await, 3);
    assert_eq!(dispatcher.stats().await.total_unacked, 3);
}

#[tokio::test]
async fn test_consumer_ceiling_spreads_entries() {
    let cursor = cursor();
    let config = DispatcherConfig::default().with_max_unacked_messages_per_consumer(2);
    let dispatcher = dispatcher_with(SubType::Shared, &cursor, config);
    let c1 = TestConsumer::new(1, SubType::Shared);
    let c2 = TestConsumer::new(2, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    dispatcher.add_consumer(c2.consumer.clone()).await.unwrap();
    dispatcher.consumer_flow(c1.id(), 10).await;
    cursor.append_many(5).await;

    dispatcher.read_more_entries().await.unwrap();
    assert_eq!(c1.transport.received_count().await, 2);
    assert_eq!(c2.transport.received_count().await, 0);

    dispatcher.consumer_flow(c2.id(), 10).await;
    assert_eq!(c2.transport.received_count().await, 2);

    let stats = dispatcher.stats().await;
    assert!(stats.consumers.iter().all(|c| c.blocked));
    assert_eq!(stats.total_unacked, 4);
}

#[tokio::test]
async fn test_refused_tail_is_retried_in_order() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    c1.transport.accept_at_most(Some(1));
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    let p = cursor.append_many(3).await;

    dispatcher.consumer_flow(c1.id(), 3).await;

    assert_eq!(c1.received().await, p);
    assert_eq!(dispatcher.redelivery_tracker().await.pending_len(), 0);
}

#[tokio::test]
async fn test_unwritable_consumer_gets_nothing() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    c1.transport.set_writable(false);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    cursor.append_many(2).await;

    dispatcher.consumer_flow(c1.id(), 5).await;
    assert_eq!(c1.transport.received_count().await, 0);

    c1.transport.set_writable(true);
    dispatcher.read_more_entries().await.unwrap();
    assert_eq!(c1.transport.received_count().await, 2);
}

#[tokio::test]
async fn test_failed_send_keeps_entries() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    c1.transport.set_fail_sends(true);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    let p = cursor.append_many(2).await;

    dispatcher.consumer_flow(c1.id(), 5).await;
    assert_eq!(dispatcher.redelivery_tracker().await.pending_len(), 2);

    c1.transport.set_fail_sends(false);
    dispatcher.read_more_entries().await.unwrap();
    assert_eq!(c1.received().await, p);
}

#[tokio::test]
async fn test_stuck_check_dispatches_waiting_entries() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    dispatcher.consumer_flow(c1.id(), 5).await;

    // Appending does not trigger a dispatch cycle on its own.
    let p = cursor.append_many(2).await;
    assert!(c1.received().await.is_empty());

    assert!(dispatcher.check_and_unblock_if_stuck().await);
    assert_eq!(c1.received().await, p);

    assert!(!dispatcher.check_and_unblock_if_stuck().await);
}

#[tokio::test]
async fn test_stuck_check_idle_without_credit() {
    let cursor = cursor();
    let dispatcher = dispatcher(SubType::Shared, &cursor);
    let c1 = TestConsumer::new(1, SubType::Shared);
    dispatcher.add_consumer(c1.consumer.clone()).await.unwrap();
    cursor.append_many(2).await;

    assert!(!dispatcher.check_and_unblock_if_stuck().await);
    assert_eq!(dispatcher.stats().await.msgs_dispatched, 0);
}
