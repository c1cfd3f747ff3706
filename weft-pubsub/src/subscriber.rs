// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Subscriber side of Weft pub/sub with long-poll style delivery.
//!
//! Each open subscription is one forwarding task that waits on the remote
//! publisher's broadcast channel and invokes the caller's callbacks — one
//! outstanding message per watch, not one thread.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use weft_common::address::WorkerAddress;
use weft_common::id::WorkerID;
use weft_common::status::WeftError;
use weft_proto::{ChannelType, SubMessage};

use crate::publisher::{BusEvent, PublisherDirectory};
use crate::{MessagePublishedCallback, PublisherFailedCallback, SubscriberInterface};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct SubscriptionKey {
    channel: ChannelType,
    publisher_worker_id: WorkerID,
    key_id: Vec<u8>,
}

/// In-process subscriber. Locates peer publishers through a shared
/// [`PublisherDirectory`] and forwards their events from spawned tasks, so
/// callbacks never run inside `subscribe` itself.
///
/// Must be created inside a tokio runtime; the runtime handle is captured at
/// construction and used to spawn forwarding tasks from any thread.
pub struct Subscriber {
    directory: Arc<PublisherDirectory>,
    runtime: tokio::runtime::Handle,
    subscriptions: DashMap<SubscriptionKey, tokio::task::JoinHandle<()>>,
}

impl Subscriber {
    pub fn new(directory: Arc<PublisherDirectory>) -> Self {
        Self {
            directory,
            runtime: tokio::runtime::Handle::current(),
            subscriptions: DashMap::new(),
        }
    }

    /// Number of open subscriptions.
    pub fn num_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }
}

impl SubscriberInterface for Subscriber {
    fn subscribe(
        &self,
        sub_message: SubMessage,
        channel: ChannelType,
        publisher_address: &WorkerAddress,
        key_id: &[u8],
        on_published: MessagePublishedCallback,
        on_publisher_failed: PublisherFailedCallback,
    ) -> bool {
        let key = SubscriptionKey {
            channel,
            publisher_worker_id: publisher_address.worker_id,
            key_id: key_id.to_vec(),
        };

        let Some(publisher) = self.directory.lookup(&publisher_address.worker_id) else {
            // The publisher is unknown, so the entity behind the key is
            // unreachable. Report asynchronously, like a dead peer would.
            let key_owned = key_id.to_vec();
            self.runtime.spawn(async move {
                on_publisher_failed(
                    &key_owned,
                    WeftError::not_found("publisher worker not registered"),
                );
            });
            return true;
        };

        let mut receiver = publisher.listen(channel, key_id);
        let key_owned = key_id.to_vec();
        let handle = self.runtime.spawn(async move {
            // Hand the subscription payload to the publisher's worker first so
            // it can install its side of the watch, then forward events.
            publisher.handle_subscription(channel, &key_owned, sub_message);
            loop {
                match receiver.recv().await {
                    Ok(BusEvent::Message(message)) => on_published(message),
                    Ok(BusEvent::Failure) => {
                        on_publisher_failed(&key_owned, WeftError::disconnected("publisher failed"));
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        on_publisher_failed(
                            &key_owned,
                            WeftError::disconnected("publisher channel closed"),
                        );
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("subscription lagged by {n} messages, continuing");
                    }
                }
            }
        });

        if let Some(previous) = self.subscriptions.insert(key, handle) {
            tracing::warn!(
                channel = ?channel,
                "replacing an existing subscription for the same topic"
            );
            previous.abort();
        }
        true
    }

    fn unsubscribe(
        &self,
        channel: ChannelType,
        publisher_address: &WorkerAddress,
        key_id: &[u8],
    ) -> bool {
        let key = SubscriptionKey {
            channel,
            publisher_worker_id: publisher_address.worker_id,
            key_id: key_id.to_vec(),
        };
        match self.subscriptions.remove(&key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::Publisher;
    use crate::PublisherInterface;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weft_common::id::NodeID;
    use weft_proto::{pub_message, PubMessage, WorkerObjectLocationsMessage};

    fn make_address(worker_id: WorkerID) -> WorkerAddress {
        WorkerAddress::new(worker_id, NodeID::from_random(), "127.0.0.1", 7000)
    }

    fn locations_message(key: &[u8]) -> PubMessage {
        PubMessage {
            channel_type: ChannelType::WorkerObjectLocationsChannel as i32,
            key_id: key.to_vec(),
            inner_message: Some(pub_message::InnerMessage::WorkerObjectLocationsMessage(
                WorkerObjectLocationsMessage::default(),
            )),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let directory = Arc::new(PublisherDirectory::new());
        let publisher = Arc::new(Publisher::with_capacity(16));
        let worker_id = WorkerID::from_random();
        directory.register(worker_id, Arc::clone(&publisher));

        let subscriber = Subscriber::new(Arc::clone(&directory));
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = Arc::clone(&received);

        let key = vec![1u8; 28];
        assert!(subscriber.subscribe(
            SubMessage::default(),
            ChannelType::WorkerObjectLocationsChannel,
            &make_address(worker_id),
            &key,
            Box::new(move |_msg| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(|_key, _err| {}),
        ));

        // Wait for the forwarding task to attach before publishing.
        tokio::task::yield_now().await;
        assert!(publisher.publish(locations_message(&key)));

        for _ in 0..100 {
            if received.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_returns_false() {
        let publisher = Publisher::with_capacity(16);
        assert!(!publisher.publish(locations_message(&[1u8; 28])));
    }

    #[tokio::test]
    async fn test_publisher_failure_invokes_failure_callback() {
        let directory = Arc::new(PublisherDirectory::new());
        let publisher = Arc::new(Publisher::with_capacity(16));
        let worker_id = WorkerID::from_random();
        directory.register(worker_id, Arc::clone(&publisher));

        let subscriber = Subscriber::new(Arc::clone(&directory));
        let failed = Arc::new(AtomicUsize::new(0));
        let failed_clone = Arc::clone(&failed);

        let key = vec![2u8; 28];
        subscriber.subscribe(
            SubMessage::default(),
            ChannelType::WorkerRefRemovedChannel,
            &make_address(worker_id),
            &key,
            Box::new(|_msg| {}),
            Box::new(move |_key, err| {
                assert!(err.is_disconnected());
                failed_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tokio::task::yield_now().await;

        publisher.publish_failure(ChannelType::WorkerRefRemovedChannel, &key);

        for _ in 0..100 {
            if failed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_publisher_reports_failure() {
        let directory = Arc::new(PublisherDirectory::new());
        let subscriber = Subscriber::new(directory);
        let failed = Arc::new(AtomicUsize::new(0));
        let failed_clone = Arc::clone(&failed);

        subscriber.subscribe(
            SubMessage::default(),
            ChannelType::WorkerRefRemovedChannel,
            &make_address(WorkerID::from_random()),
            &[3u8; 28],
            Box::new(|_msg| {}),
            Box::new(move |_key, err| {
                assert!(err.is_not_found());
                failed_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for _ in 0..100 {
            if failed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscription_handler_receives_sub_message() {
        let directory = Arc::new(PublisherDirectory::new());
        let publisher = Arc::new(Publisher::with_capacity(16));
        let worker_id = WorkerID::from_random();
        directory.register(worker_id, Arc::clone(&publisher));

        let handled = Arc::new(AtomicUsize::new(0));
        let handled_clone = Arc::clone(&handled);
        publisher.set_subscription_handler(Box::new(move |channel, _key, _sub| {
            assert_eq!(channel, ChannelType::WorkerRefRemovedChannel);
            handled_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let subscriber = Subscriber::new(Arc::clone(&directory));
        subscriber.subscribe(
            SubMessage::default(),
            ChannelType::WorkerRefRemovedChannel,
            &make_address(worker_id),
            &[4u8; 28],
            Box::new(|_msg| {}),
            Box::new(|_key, _err| {}),
        );

        for _ in 0..100 {
            if handled.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let directory = Arc::new(PublisherDirectory::new());
        let publisher = Arc::new(Publisher::with_capacity(16));
        let worker_id = WorkerID::from_random();
        directory.register(worker_id, Arc::clone(&publisher));

        let subscriber = Subscriber::new(Arc::clone(&directory));
        let addr = make_address(worker_id);
        let key = vec![5u8; 28];
        subscriber.subscribe(
            SubMessage::default(),
            ChannelType::WorkerObjectLocationsChannel,
            &addr,
            &key,
            Box::new(|_msg| {}),
            Box::new(|_key, _err| {}),
        );
        assert_eq!(subscriber.num_subscriptions(), 1);

        assert!(subscriber.unsubscribe(ChannelType::WorkerObjectLocationsChannel, &addr, &key));
        assert_eq!(subscriber.num_subscriptions(), 0);
        assert!(!subscriber.unsubscribe(ChannelType::WorkerObjectLocationsChannel, &addr, &key));
    }
}
