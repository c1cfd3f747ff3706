// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Worker addresses.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::id::{NodeID, WorkerID};

/// A worker endpoint.
///
/// Two addresses identify the same worker iff their `worker_id`s match; the
/// ip/port/node fields are routing information only and do not participate in
/// equality or hashing. This is what lets borrower sets deduplicate a worker
/// whose endpoint was reported through different paths.
#[derive(Clone, Debug)]
pub struct WorkerAddress {
    pub worker_id: WorkerID,
    pub node_id: NodeID,
    pub ip_address: String,
    pub port: i32,
}

impl WorkerAddress {
    pub fn new(worker_id: WorkerID, node_id: NodeID, ip_address: impl Into<String>, port: i32) -> Self {
        Self {
            worker_id,
            node_id,
            ip_address: ip_address.into(),
            port,
        }
    }

    /// True when the worker id is unset.
    pub fn is_nil(&self) -> bool {
        self.worker_id.is_nil()
    }

    pub fn from_proto(addr: &weft_proto::Address) -> Self {
        Self {
            worker_id: WorkerID::from_binary(&addr.worker_id),
            node_id: NodeID::from_binary(&addr.node_id),
            ip_address: addr.ip_address.clone(),
            port: addr.port,
        }
    }

    pub fn to_proto(&self) -> weft_proto::Address {
        weft_proto::Address {
            node_id: self.node_id.binary(),
            ip_address: self.ip_address.clone(),
            port: self.port,
            worker_id: self.worker_id.binary(),
        }
    }
}

impl PartialEq for WorkerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.worker_id == other.worker_id
    }
}

impl Eq for WorkerAddress {}

impl Hash for WorkerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.worker_id.hash(state);
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (worker {})",
            self.ip_address,
            self.port,
            &self.worker_id.hex()[..8.min(self.worker_id.hex().len())]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_ignores_endpoint() {
        let worker_id = WorkerID::from_random();
        let a = WorkerAddress::new(worker_id, NodeID::from_random(), "10.0.0.1", 7001);
        let b = WorkerAddress::new(worker_id, NodeID::from_random(), "10.0.0.2", 7002);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_different_workers_are_distinct() {
        let node = NodeID::from_random();
        let a = WorkerAddress::new(WorkerID::from_random(), node, "10.0.0.1", 7001);
        let b = WorkerAddress::new(WorkerID::from_random(), node, "10.0.0.1", 7001);
        assert_ne!(a, b);
    }

    #[test]
    fn test_proto_roundtrip() {
        let addr = WorkerAddress::new(WorkerID::from_random(), NodeID::from_random(), "10.0.0.5", 9000);
        let restored = WorkerAddress::from_proto(&addr.to_proto());
        assert_eq!(addr, restored);
        assert_eq!(addr.node_id, restored.node_id);
        assert_eq!(addr.ip_address, restored.ip_address);
        assert_eq!(addr.port, restored.port);
    }
}
