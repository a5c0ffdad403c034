//! Shared fixtures for dispatcher integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use pulsaresque::config::DispatcherConfig;
use pulsaresque::dispatch::{Consumer, Dispatcher, InMemoryCursor, RecordingTransport};
use pulsaresque::types::{ConsumerId, KeySharedMeta, MessageMetadata, Position, SubType};

pub const SUBSCRIPTION: &str = "persistent://public/default/orders:sub";

pub fn cursor() -> Arc<InMemoryCursor> {
    Arc::new(InMemoryCursor::new())
}

pub fn dispatcher(sub_type: SubType, cursor: &Arc<InMemoryCursor>) -> Dispatcher {
    dispatcher_with(sub_type, cursor, DispatcherConfig::default())
}

pub fn dispatcher_with(
    sub_type: SubType,
    cursor: &Arc<InMemoryCursor>,
    config: DispatcherConfig,
) -> Dispatcher {
    Dispatcher::new(SUBSCRIPTION, sub_type, cursor.clone(), config)
        .expect("valid dispatcher config")
}

pub struct TestConsumer {
    pub consumer: Arc<Consumer>,
    pub transport: Arc<RecordingTransport>,
}

impl TestConsumer {
    pub fn new(id: u64, sub_type: SubType) -> Self {
        Self::build(id, sub_type, |c| c)
    }

    pub fn with_priority(id: u64, sub_type: SubType, priority: u32) -> Self {
        Self::build(id, sub_type, |c| c.with_priority_level(priority))
    }

    pub fn key_shared(id: u64, meta: KeySharedMeta) -> Self {
        Self::build(id, SubType::KeyShared, |c| c.with_key_shared_meta(meta))
    }

    fn build(id: u64, sub_type: SubType, configure: impl FnOnce(Consumer) -> Consumer) -> Self {
        let transport = Arc::new(RecordingTransport::new());
        let consumer = configure(Consumer::new(
            id,
            format!("consumer-{id}"),
            sub_type,
            transport.clone(),
        ));
        Self {
            consumer: Arc::new(consumer),
            transport,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.consumer.id()
    }

    pub async fn received(&self) -> Vec<Position> {
        self.transport.received_positions().await
    }
}

pub async fn append_keyed(cursor: &InMemoryCursor, key: &str) -> Position {
    cursor
        .append(MessageMetadata::new("producer", 0).with_partition_key(key), "payload")
        .await
}
