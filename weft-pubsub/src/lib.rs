// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Pub/sub messaging between Weft workers.
//!
//! The reference counter talks to the rest of the cluster exclusively through
//! the [`PublisherInterface`] and [`SubscriberInterface`] traits defined here.
//! An in-process implementation backed by broadcast channels
//! ([`publisher::Publisher`], [`subscriber::Subscriber`]) serves single-node
//! deployments and tests; a transport-backed implementation can be swapped in
//! without touching the counter.

pub mod publisher;
pub mod subscriber;

pub use publisher::{Publisher, PublisherDirectory};
pub use subscriber::Subscriber;

use weft_common::address::WorkerAddress;
use weft_common::status::WeftError;
use weft_proto::{ChannelType, PubMessage, SubMessage};

/// Invoked for each message published on a subscribed key.
pub type MessagePublishedCallback = Box<dyn Fn(PubMessage) + Send + Sync>;

/// Invoked once when the publisher of a subscribed key fails or disappears.
/// Receives the subscribed key and the failure status.
pub type PublisherFailedCallback = Box<dyn Fn(&[u8], WeftError) + Send + Sync>;

/// Outbound side: push messages to whoever is watching a (channel, key) pair.
///
/// All operations are non-blocking; callers may hold locks while publishing.
pub trait PublisherInterface: Send + Sync {
    /// Publish a message to all subscribers of its (channel, key). Returns
    /// false if nobody is subscribed.
    fn publish(&self, message: PubMessage) -> bool;

    /// Notify subscribers of (channel, key) that the entity behind the key is
    /// gone and no further messages will arrive.
    fn publish_failure(&self, channel: ChannelType, key_id: &[u8]);
}

/// Inbound side: open long-poll style watches on remote publishers.
///
/// Implementations MUST deliver `on_published` / `on_publisher_failed`
/// asynchronously, never from inside `subscribe` itself: callers commonly hold
/// a lock during `subscribe` that the callbacks re-acquire.
pub trait SubscriberInterface: Send + Sync {
    /// Watch (channel, key) on the worker at `publisher_address`.
    /// `sub_message` is handed to the publisher side so it knows what is being
    /// watched. Returns false if the subscription could not be opened.
    fn subscribe(
        &self,
        sub_message: SubMessage,
        channel: ChannelType,
        publisher_address: &WorkerAddress,
        key_id: &[u8],
        on_published: MessagePublishedCallback,
        on_publisher_failed: PublisherFailedCallback,
    ) -> bool;

    /// Stop watching (channel, key) on `publisher_address`. Returns false if
    /// there was no such subscription.
    fn unsubscribe(
        &self,
        channel: ChannelType,
        publisher_address: &WorkerAddress,
        key_id: &[u8],
    ) -> bool;
}
