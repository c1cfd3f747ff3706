// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared test helpers for Weft crates.

pub mod mock_pubsub;
pub mod wait;

use tracing_subscriber::EnvFilter;
use weft_common::address::WorkerAddress;
use weft_common::id::*;

/// Route tracing through the test harness capture. The default filter holds
/// the weft crates at debug and everything else at warn; override with
/// `WEFT_TEST_LOG`. Safe to call from every test; only the first call
/// installs a subscriber.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_env("WEFT_TEST_LOG").unwrap_or_else(|_| {
        EnvFilter::new(
            "warn,weft_common=debug,weft_proto=debug,weft_pubsub=debug,weft_core_worker=debug",
        )
    });
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(filter)
        .try_init();
}

/// An ObjectID whose first byte is `tag` (deterministic across runs).
pub fn object_id_with_tag(tag: u8) -> ObjectID {
    let mut data = [0u8; ObjectID::SIZE];
    data[0] = tag;
    ObjectID::from_binary(&data)
}

/// A NodeID whose first byte is `tag`.
pub fn node_id_with_tag(tag: u8) -> NodeID {
    let mut data = [0u8; NodeID::SIZE];
    data[0] = tag;
    NodeID::from_binary(&data)
}

/// A random worker address on localhost.
pub fn random_worker_address() -> WorkerAddress {
    WorkerAddress::new(
        WorkerID::from_random(),
        NodeID::from_random(),
        "127.0.0.1",
        7000 + rand::random::<u16>() as i32 % 1000,
    )
}
