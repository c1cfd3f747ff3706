// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Publisher side of Weft pub/sub.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use weft_common::config::weft_config;
use weft_common::id::WorkerID;
use weft_proto::{ChannelType, PubMessage, SubMessage};

use crate::PublisherInterface;

/// One pub/sub topic: a channel plus the entity key within it.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct TopicKey(ChannelType, Vec<u8>);

/// Event delivered to topic listeners.
#[derive(Clone)]
pub(crate) enum BusEvent {
    Message(PubMessage),
    /// The publisher declared the entity behind the key gone.
    Failure,
}

/// Invoked when a remote worker opens a subscription on this publisher,
/// carrying the subscription payload. This is how the worker that owns the
/// publisher learns what is being watched (e.g. to install a ref-removed
/// reply).
pub type SubscriptionHandler = Box<dyn Fn(ChannelType, &[u8], SubMessage) + Send + Sync>;

/// In-process publisher: manages one broadcast channel per topic.
pub struct Publisher {
    channels: DashMap<TopicKey, broadcast::Sender<BusEvent>>,
    channel_capacity: usize,
    subscription_handler: parking_lot::Mutex<Option<SubscriptionHandler>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::with_capacity(weft_config().pubsub_channel_capacity)
    }

    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            channel_capacity,
            subscription_handler: parking_lot::Mutex::new(None),
        }
    }

    /// Install the hook invoked when a subscription arrives. At most one
    /// handler; installing again replaces the previous one.
    pub fn set_subscription_handler(&self, handler: SubscriptionHandler) {
        *self.subscription_handler.lock() = Some(handler);
    }

    /// Get or create the broadcast channel for a topic and return a receiver.
    pub(crate) fn listen(&self, channel: ChannelType, key_id: &[u8]) -> broadcast::Receiver<BusEvent> {
        let entry = self
            .channels
            .entry(TopicKey(channel, key_id.to_vec()))
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0);
        entry.subscribe()
    }

    /// Hand an incoming subscription payload to the installed handler.
    pub(crate) fn handle_subscription(&self, channel: ChannelType, key_id: &[u8], sub_message: SubMessage) {
        if let Some(handler) = self.subscription_handler.lock().as_ref() {
            handler(channel, key_id, sub_message);
        }
    }

    /// Number of live topics.
    pub fn num_topics(&self) -> usize {
        self.channels.len()
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl PublisherInterface for Publisher {
    fn publish(&self, message: PubMessage) -> bool {
        let key = TopicKey(message.channel(), message.key_id.clone());
        if let Some(sender) = self.channels.get(&key) {
            sender.send(BusEvent::Message(message)).is_ok()
        } else {
            false
        }
    }

    fn publish_failure(&self, channel: ChannelType, key_id: &[u8]) {
        let key = TopicKey(channel, key_id.to_vec());
        // The topic is dead after a failure; drop it so late subscribers see a
        // closed channel rather than silence.
        if let Some((_, sender)) = self.channels.remove(&key) {
            let _ = sender.send(BusEvent::Failure);
        }
    }
}

/// Directory of in-process publishers keyed by worker id, used by
/// [`crate::Subscriber`] to locate the publisher of a peer worker.
#[derive(Default)]
pub struct PublisherDirectory {
    publishers: DashMap<WorkerID, Arc<Publisher>>,
}

impl PublisherDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker_id: WorkerID, publisher: Arc<Publisher>) {
        self.publishers.insert(worker_id, publisher);
    }

    pub fn unregister(&self, worker_id: &WorkerID) {
        self.publishers.remove(worker_id);
    }

    pub fn lookup(&self, worker_id: &WorkerID) -> Option<Arc<Publisher>> {
        self.publishers.get(worker_id).map(|p| Arc::clone(&p))
    }
}
