// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Wire message types exchanged between Weft workers.
//!
//! These are hand-authored `prost` messages rather than protoc output: the
//! schema is small and owned entirely by this repository, so the derives are
//! written directly against the same field/tag layout a `.proto` file would
//! produce. Field tags are part of the wire contract — do not renumber.

/// A worker endpoint: the worker's id plus where to reach it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Address {
    #[prost(bytes = "vec", tag = "1")]
    pub node_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub ip_address: String,
    #[prost(int32, tag = "3")]
    pub port: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub worker_id: Vec<u8>,
}

/// An object id paired with its owner's address.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectReference {
    #[prost(bytes = "vec", tag = "1")]
    pub object_id: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub owner_address: Option<Address>,
}

/// One entry of a serialized reference sub-table: the reference counts and
/// borrow/containment sets a worker reports back to an object's owner.
///
/// The repeated form (`Vec<ObjectReferenceCount>`) is the reference-table
/// payload carried by [`WorkerRefRemovedMessage`] and by task replies.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectReferenceCount {
    /// The object and its owner.
    #[prost(message, optional, tag = "1")]
    pub reference: Option<ObjectReference>,
    /// Whether the reporting worker still holds a language-level reference.
    #[prost(bool, tag = "2")]
    pub has_local_ref: bool,
    /// Workers this worker handed the object to.
    #[prost(message, repeated, tag = "3")]
    pub borrowers: Vec<Address>,
    /// Objects this id was serialized into, with the outer objects' owners.
    #[prost(message, repeated, tag = "4")]
    pub stored_in_objects: Vec<ObjectReference>,
    /// Borrowed outer ids whose values contain this id.
    #[prost(bytes = "vec", repeated, tag = "5")]
    pub contained_in_borrowed_ids: Vec<Vec<u8>>,
    /// Ids nested inside this object's value.
    #[prost(bytes = "vec", repeated, tag = "6")]
    pub contains: Vec<Vec<u8>>,
}

/// Transport used for an object's tensor payload. Recorded by the reference
/// table; interpreted only by the transfer layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TensorTransport {
    ObjectStore = 0,
    Nccl = 1,
    Gloo = 2,
}

/// Pub/sub channels between workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ChannelType {
    /// Owner publishes location/spill changes for objects it owns.
    WorkerObjectLocationsChannel = 0,
    /// Borrower publishes its accumulated borrowers once it stops borrowing.
    WorkerRefRemovedChannel = 1,
}

/// Snapshot of an owned object's locations, published on the
/// object-locations channel.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerObjectLocationsMessage {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub node_ids: Vec<Vec<u8>>,
    #[prost(uint64, tag = "2")]
    pub object_size: u64,
    #[prost(string, tag = "3")]
    pub spilled_url: String,
    #[prost(bytes = "vec", tag = "4")]
    pub spilled_node_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub primary_node_id: Vec<u8>,
    #[prost(bool, tag = "6")]
    pub pending_creation: bool,
    #[prost(bool, tag = "7")]
    pub did_spill: bool,
    /// Set when the reference was already erased at publish time.
    #[prost(bool, tag = "8")]
    pub ref_removed: bool,
}

/// A borrower's reply on the ref-removed channel: the sub-table of references
/// it handed out while borrowing.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerRefRemovedMessage {
    #[prost(message, repeated, tag = "1")]
    pub borrowed_refs: Vec<ObjectReferenceCount>,
}

/// A published pub/sub message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PubMessage {
    #[prost(enumeration = "ChannelType", tag = "1")]
    pub channel_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub key_id: Vec<u8>,
    #[prost(oneof = "pub_message::InnerMessage", tags = "3, 4")]
    pub inner_message: Option<pub_message::InnerMessage>,
}

pub mod pub_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum InnerMessage {
        #[prost(message, tag = "3")]
        WorkerObjectLocationsMessage(super::WorkerObjectLocationsMessage),
        #[prost(message, tag = "4")]
        WorkerRefRemovedMessage(super::WorkerRefRemovedMessage),
    }
}

impl PubMessage {
    pub fn channel(&self) -> ChannelType {
        ChannelType::try_from(self.channel_type).unwrap_or(ChannelType::WorkerObjectLocationsChannel)
    }

    pub fn object_locations_message(&self) -> Option<&WorkerObjectLocationsMessage> {
        match &self.inner_message {
            Some(pub_message::InnerMessage::WorkerObjectLocationsMessage(m)) => Some(m),
            _ => None,
        }
    }

    pub fn ref_removed_message(&self) -> Option<&WorkerRefRemovedMessage> {
        match &self.inner_message {
            Some(pub_message::InnerMessage::WorkerRefRemovedMessage(m)) => Some(m),
            _ => None,
        }
    }
}

/// A subscription request for the ref-removed channel: which object to watch
/// and the outer id the borrower received it inside (possibly empty).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerRefRemovedSubMessage {
    #[prost(message, optional, tag = "1")]
    pub reference: Option<ObjectReference>,
    #[prost(bytes = "vec", tag = "2")]
    pub contained_in_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub intended_worker_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub subscriber_worker_id: Vec<u8>,
}

/// The payload sent along with a subscription.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubMessage {
    #[prost(oneof = "sub_message::InnerMessage", tags = "1")]
    pub inner_message: Option<sub_message::InnerMessage>,
}

pub mod sub_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum InnerMessage {
        #[prost(message, tag = "1")]
        WorkerRefRemovedSubMessage(super::WorkerRefRemovedSubMessage),
    }
}

impl SubMessage {
    pub fn ref_removed_sub_message(&self) -> Option<&WorkerRefRemovedSubMessage> {
        match &self.inner_message {
            Some(sub_message::InnerMessage::WorkerRefRemovedSubMessage(m)) => Some(m),
            None => None,
        }
    }
}

/// One object's reference state in a stats dump.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectRefInfo {
    #[prost(bytes = "vec", tag = "1")]
    pub object_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub call_site: String,
    #[prost(int64, tag = "3")]
    pub object_size: i64,
    #[prost(uint64, tag = "4")]
    pub local_ref_count: u64,
    #[prost(uint64, tag = "5")]
    pub submitted_task_ref_count: u64,
    #[prost(bool, tag = "6")]
    pub pinned_in_memory: bool,
    #[prost(bytes = "vec", repeated, tag = "7")]
    pub contained_in_owned: Vec<Vec<u8>>,
}

/// Debug/stats export of a worker's reference table.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CoreWorkerStats {
    #[prost(message, repeated, tag = "1")]
    pub object_refs: Vec<ObjectRefInfo>,
    #[prost(int64, tag = "2")]
    pub objects_total: i64,
}
