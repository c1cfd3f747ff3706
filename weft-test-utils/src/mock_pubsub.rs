// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Deterministic pub/sub mocks for unit tests.
//!
//! The mock publisher records everything published; the mock subscriber
//! records subscriptions and lets the test deliver messages or failures at a
//! chosen point. Delivery is one-shot: the subscription is consumed when the
//! test delivers to it, mirroring the long-poll reply pattern.

use std::collections::HashMap;
use std::sync::Mutex;

use weft_common::address::WorkerAddress;
use weft_common::id::WorkerID;
use weft_common::status::WeftError;
use weft_proto::{ChannelType, PubMessage, SubMessage};
use weft_pubsub::{
    MessagePublishedCallback, PublisherFailedCallback, PublisherInterface, SubscriberInterface,
};

/// Records published messages and failure notifications for inspection.
#[derive(Default)]
pub struct MockWorkerPublisher {
    published: Mutex<Vec<PubMessage>>,
    failures: Mutex<Vec<(ChannelType, Vec<u8>)>>,
}

impl MockWorkerPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_published(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    /// All messages published on a channel, in publish order.
    pub fn published_on(&self, channel: ChannelType) -> Vec<PubMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.channel() == channel)
            .cloned()
            .collect()
    }

    /// Drain and return all recorded messages.
    pub fn take_published(&self) -> Vec<PubMessage> {
        std::mem::take(&mut self.published.lock().unwrap())
    }

    /// All (channel, key) failure notifications, in order.
    pub fn failures(&self) -> Vec<(ChannelType, Vec<u8>)> {
        self.failures.lock().unwrap().clone()
    }
}

impl PublisherInterface for MockWorkerPublisher {
    fn publish(&self, message: PubMessage) -> bool {
        self.published.lock().unwrap().push(message);
        true
    }

    fn publish_failure(&self, channel: ChannelType, key_id: &[u8]) {
        self.failures.lock().unwrap().push((channel, key_id.to_vec()));
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct MockSubscriptionKey {
    channel: ChannelType,
    publisher_worker_id: WorkerID,
    key_id: Vec<u8>,
}

struct MockSubscription {
    sub_message: SubMessage,
    on_published: MessagePublishedCallback,
    on_publisher_failed: PublisherFailedCallback,
}

/// Records subscriptions; the test decides when (and whether) each one fires.
#[derive(Default)]
pub struct MockWorkerSubscriber {
    subscriptions: Mutex<HashMap<MockSubscriptionKey, MockSubscription>>,
}

impl MockWorkerSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_subscriptions(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    pub fn has_subscription(
        &self,
        channel: ChannelType,
        publisher_worker_id: &WorkerID,
        key_id: &[u8],
    ) -> bool {
        self.subscriptions.lock().unwrap().contains_key(&MockSubscriptionKey {
            channel,
            publisher_worker_id: *publisher_worker_id,
            key_id: key_id.to_vec(),
        })
    }

    /// The payload the caller attached to a live subscription.
    pub fn sub_message_for(
        &self,
        channel: ChannelType,
        publisher_worker_id: &WorkerID,
        key_id: &[u8],
    ) -> Option<SubMessage> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(&MockSubscriptionKey {
                channel,
                publisher_worker_id: *publisher_worker_id,
                key_id: key_id.to_vec(),
            })
            .map(|s| s.sub_message.clone())
    }

    /// Deliver a published message to a subscription, consuming it.
    /// Returns false if no such subscription exists.
    ///
    /// The callback is invoked outside the internal lock, so it may freely
    /// open new subscriptions or call `unsubscribe`.
    pub fn deliver(
        &self,
        channel: ChannelType,
        publisher_worker_id: &WorkerID,
        key_id: &[u8],
        message: PubMessage,
    ) -> bool {
        let subscription = self.subscriptions.lock().unwrap().remove(&MockSubscriptionKey {
            channel,
            publisher_worker_id: *publisher_worker_id,
            key_id: key_id.to_vec(),
        });
        match subscription {
            Some(s) => {
                (s.on_published)(message);
                true
            }
            None => false,
        }
    }

    /// Report the publisher of a subscription as failed, consuming it.
    /// Returns false if no such subscription exists.
    pub fn fail(
        &self,
        channel: ChannelType,
        publisher_worker_id: &WorkerID,
        key_id: &[u8],
    ) -> bool {
        let subscription = self.subscriptions.lock().unwrap().remove(&MockSubscriptionKey {
            channel,
            publisher_worker_id: *publisher_worker_id,
            key_id: key_id.to_vec(),
        });
        match subscription {
            Some(s) => {
                (s.on_publisher_failed)(key_id, WeftError::disconnected("mock publisher failed"));
                true
            }
            None => false,
        }
    }
}

impl SubscriberInterface for MockWorkerSubscriber {
    fn subscribe(
        &self,
        sub_message: SubMessage,
        channel: ChannelType,
        publisher_address: &WorkerAddress,
        key_id: &[u8],
        on_published: MessagePublishedCallback,
        on_publisher_failed: PublisherFailedCallback,
    ) -> bool {
        self.subscriptions.lock().unwrap().insert(
            MockSubscriptionKey {
                channel,
                publisher_worker_id: publisher_address.worker_id,
                key_id: key_id.to_vec(),
            },
            MockSubscription {
                sub_message,
                on_published,
                on_publisher_failed,
            },
        );
        true
    }

    fn unsubscribe(
        &self,
        channel: ChannelType,
        publisher_address: &WorkerAddress,
        key_id: &[u8],
    ) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .remove(&MockSubscriptionKey {
                channel,
                publisher_worker_id: publisher_address.worker_id,
                key_id: key_id.to_vec(),
            })
            .is_some()
    }
}
