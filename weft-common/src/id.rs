// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Weft ID types.
//!
//! ID hierarchy:
//! - `JobID` (4 bytes)
//! - `ActorID` (16 bytes = 12 unique + 4 JobID)
//! - `TaskID` (24 bytes = 8 unique + 16 ActorID)
//! - `ObjectID` (28 bytes = 4 return index + 24 TaskID)
//! - `UniqueID` / `WorkerID` / `NodeID` (28 bytes)
//!
//! An `ObjectID` is structural: it encodes the task that produced the object,
//! the return index within that task, and whether the id stands for an actor
//! handle (return index 1 of an actor-creation task).

use std::fmt;

use rand::Rng;

use crate::constants::UNIQUE_ID_SIZE;

// ─── FNV-1a ─────────────────────────────────────────────────────────────────
// Deterministic 64-bit hash used to derive child ids from parent ids. The
// derivation must be stable across processes and releases, so the std hasher
// is not an option here.

fn fnv1a_64(data: &[u8], seed: u64) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut h = OFFSET_BASIS ^ seed;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

// ─── ID Macro ────────────────────────────────────────────────────────────────

/// Generates a fixed-size Weft ID type.
///
/// Each ID is a `[u8; N]` newtype with:
/// - `from_binary` / `from_hex` / `from_random` constructors
/// - `binary()` / `hex()` / `data()` accessors
/// - `Hash`, `Eq`, `PartialEq`, `Clone`, `Copy`, `Debug`, `Display`
/// - `nil()` default (all 0xFF bytes)
macro_rules! define_weft_id {
    ($name:ident, $size:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(C)]
        pub struct $name {
            data: [u8; $size],
        }

        impl $name {
            /// The fixed byte size of this ID type.
            pub const SIZE: usize = $size;

            /// Create a nil ID (all 0xFF bytes).
            pub const fn nil() -> Self {
                Self {
                    data: [0xFF; $size],
                }
            }

            /// Create an ID from raw bytes. Panics if `bytes.len() != SIZE`.
            pub fn from_binary(bytes: &[u8]) -> Self {
                assert_eq!(
                    bytes.len(),
                    $size,
                    "expected {} bytes for {}, got {}",
                    $size,
                    stringify!($name),
                    bytes.len()
                );
                let mut data = [0u8; $size];
                data.copy_from_slice(bytes);
                Self { data }
            }

            /// Create an ID from a hex string. Returns `nil()` on invalid input.
            pub fn from_hex(hex_str: &str) -> Self {
                if hex_str.len() != $size * 2 {
                    tracing::error!(
                        "incorrect hex string length for {}: expected {}, got {}",
                        stringify!($name),
                        $size * 2,
                        hex_str.len()
                    );
                    return Self::nil();
                }
                match hex::decode(hex_str) {
                    Ok(bytes) => Self::from_binary(&bytes),
                    Err(_) => {
                        tracing::error!("invalid hex string for {}", stringify!($name));
                        Self::nil()
                    }
                }
            }

            /// Create a random ID.
            pub fn from_random() -> Self {
                let mut data = [0u8; $size];
                rand::thread_rng().fill(&mut data[..]);
                Self { data }
            }

            /// Returns true if this is the nil ID (all 0xFF).
            pub fn is_nil(&self) -> bool {
                self.data == [0xFF; $size]
            }

            /// Raw byte array reference.
            pub fn data(&self) -> &[u8; $size] {
                &self.data
            }

            /// Raw bytes as `&[u8]`.
            pub fn as_bytes(&self) -> &[u8] {
                &self.data
            }

            /// Binary string (owned copy of the bytes).
            pub fn binary(&self) -> Vec<u8> {
                self.data.to_vec()
            }

            /// Hex-encoded string (lowercase).
            pub fn hex(&self) -> String {
                hex::encode(self.data)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.hex())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.data
            }
        }
    };
}

// ─── ID Type Definitions ────────────────────────────────────────────────────

define_weft_id!(UniqueID, UNIQUE_ID_SIZE);

// JobID: 4 bytes
define_weft_id!(JobID, 4);

// ActorID: 16 bytes (12 unique + 4 JobID)
define_weft_id!(ActorID, 16);

// TaskID: 24 bytes (8 unique + 16 ActorID)
define_weft_id!(TaskID, 24);

// ObjectID: 28 bytes (4 index + 24 TaskID)
define_weft_id!(ObjectID, 28);

define_weft_id!(WorkerID, UNIQUE_ID_SIZE);
define_weft_id!(NodeID, UNIQUE_ID_SIZE);

// ─── JobID extras ───────────────────────────────────────────────────────────

impl JobID {
    /// Create a JobID from a u32 integer.
    pub fn from_int(value: u32) -> Self {
        Self {
            data: value.to_be_bytes(),
        }
    }

    /// Convert to a u32 integer.
    pub fn to_int(&self) -> u32 {
        u32::from_be_bytes(self.data)
    }
}

// ─── ActorID extras ─────────────────────────────────────────────────────────

impl ActorID {
    const UNIQUE_BYTES_LENGTH: usize = 12;

    /// Derive an ActorID from a job and the (parent task, counter) pair that
    /// created the actor. Deterministic across processes.
    pub fn of(job_id: &JobID, parent_task_id: &TaskID, parent_task_counter: usize) -> Self {
        let mut data = [0u8; 16];

        let mut hash_input = Vec::with_capacity(TaskID::SIZE + 8);
        hash_input.extend_from_slice(parent_task_id.as_bytes());
        hash_input.extend_from_slice(&(parent_task_counter as u64).to_le_bytes());

        let h1 = fnv1a_64(&hash_input, 0);
        data[..8].copy_from_slice(&h1.to_le_bytes());
        let h2 = fnv1a_64(&hash_input, 1);
        data[8..Self::UNIQUE_BYTES_LENGTH].copy_from_slice(&h2.to_le_bytes()[..4]);

        data[Self::UNIQUE_BYTES_LENGTH..].copy_from_slice(job_id.data());

        Self { data }
    }

    /// Extract the embedded JobID (last 4 bytes).
    pub fn job_id(&self) -> JobID {
        JobID::from_binary(&self.data[Self::UNIQUE_BYTES_LENGTH..])
    }
}

// ─── TaskID extras ──────────────────────────────────────────────────────────

impl TaskID {
    const UNIQUE_BYTES_LENGTH: usize = 8;

    /// Create a TaskID for an actor creation task. The unique bytes of a
    /// creation task are all zero; this is what marks the task's return
    /// objects as actor handles.
    pub fn for_actor_creation_task(actor_id: &ActorID) -> Self {
        let mut data = [0u8; 24];
        data[Self::UNIQUE_BYTES_LENGTH..].copy_from_slice(actor_id.data());
        Self { data }
    }

    /// Create a TaskID for a normal (non-actor) task.
    pub fn for_normal_task(
        job_id: &JobID,
        parent_task_id: &TaskID,
        parent_task_counter: usize,
    ) -> Self {
        Self::for_actor_task(job_id, parent_task_id, parent_task_counter, &ActorID::nil())
    }

    /// Create a TaskID for an actor task.
    pub fn for_actor_task(
        _job_id: &JobID,
        parent_task_id: &TaskID,
        parent_task_counter: usize,
        actor_id: &ActorID,
    ) -> Self {
        let mut data = [0u8; 24];

        let mut hash_input = Vec::with_capacity(TaskID::SIZE + 8);
        hash_input.extend_from_slice(parent_task_id.as_bytes());
        hash_input.extend_from_slice(&(parent_task_counter as u64).to_le_bytes());
        let h = fnv1a_64(&hash_input, 0);

        data[..Self::UNIQUE_BYTES_LENGTH].copy_from_slice(&h.to_le_bytes());
        data[Self::UNIQUE_BYTES_LENGTH..].copy_from_slice(actor_id.data());

        Self { data }
    }

    /// Extract the embedded ActorID (last 16 bytes).
    pub fn actor_id(&self) -> ActorID {
        ActorID::from_binary(&self.data[Self::UNIQUE_BYTES_LENGTH..])
    }

    /// Extract the embedded JobID (via the ActorID).
    pub fn job_id(&self) -> JobID {
        self.actor_id().job_id()
    }

    /// Check if this is an actor creation task (unique bytes are all zeros).
    pub fn is_for_actor_creation_task(&self) -> bool {
        self.data[..Self::UNIQUE_BYTES_LENGTH]
            .iter()
            .all(|&b| b == 0)
    }
}

// ─── ObjectID extras ────────────────────────────────────────────────────────

impl ObjectID {
    const INDEX_BYTES_LENGTH: usize = 4;

    /// Return index reserved for the actor handle of an actor-creation task.
    const ACTOR_HANDLE_INDEX: u32 = 1;

    /// Create an ObjectID from a TaskID and a return index.
    pub fn from_index(task_id: &TaskID, index: u32) -> Self {
        let mut data = [0u8; 28];
        data[..Self::INDEX_BYTES_LENGTH].copy_from_slice(&index.to_be_bytes());
        data[Self::INDEX_BYTES_LENGTH..].copy_from_slice(task_id.data());
        Self { data }
    }

    /// Get the return index (first 4 bytes as big-endian u32).
    pub fn object_index(&self) -> u32 {
        u32::from_be_bytes(self.data[..Self::INDEX_BYTES_LENGTH].try_into().unwrap())
    }

    /// Extract the embedded TaskID (last 24 bytes).
    pub fn task_id(&self) -> TaskID {
        TaskID::from_binary(&self.data[Self::INDEX_BYTES_LENGTH..])
    }

    /// Create the ObjectID tracking an actor's lifetime handle.
    pub fn for_actor_handle(actor_id: &ActorID) -> Self {
        let task_id = TaskID::for_actor_creation_task(actor_id);
        Self::from_index(&task_id, Self::ACTOR_HANDLE_INDEX)
    }

    /// Whether this ObjectID stands for an actor handle.
    pub fn is_actor_id(&self) -> bool {
        self.object_index() == Self::ACTOR_HANDLE_INDEX
            && self.task_id().is_for_actor_creation_task()
    }

    /// Extract the ActorID from an actor-handle ObjectID.
    pub fn to_actor_id(&self) -> ActorID {
        self.task_id().actor_id()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nil_id() {
        let id = JobID::nil();
        assert!(id.is_nil());
        assert_eq!(id.data(), &[0xFF; 4]);
    }

    #[test]
    fn test_job_id_roundtrip() {
        for val in [0u32, 1, 100, u32::MAX] {
            let id = JobID::from_int(val);
            assert_eq!(id.to_int(), val);

            let hex_str = id.hex();
            let id2 = JobID::from_hex(&hex_str);
            assert_eq!(id, id2);

            let bin = id.binary();
            let id3 = JobID::from_binary(&bin);
            assert_eq!(id, id3);
        }
    }

    #[test]
    fn test_actor_id_embeds_job_id() {
        let job_id = JobID::from_int(7);
        let task_id = TaskID::nil();
        let actor_id = ActorID::of(&job_id, &task_id, 0);
        assert_eq!(actor_id.job_id(), job_id);
    }

    #[test]
    fn test_actor_id_deterministic() {
        let job_id = JobID::from_int(7);
        let parent = TaskID::from_random();
        assert_eq!(ActorID::of(&job_id, &parent, 3), ActorID::of(&job_id, &parent, 3));
        assert_ne!(ActorID::of(&job_id, &parent, 3), ActorID::of(&job_id, &parent, 4));
    }

    #[test]
    fn test_task_id_embeds_actor_id() {
        let job_id = JobID::from_int(3);
        let parent = TaskID::nil();
        let actor_id = ActorID::of(&job_id, &parent, 1);
        let task_id = TaskID::for_actor_creation_task(&actor_id);
        assert_eq!(task_id.actor_id(), actor_id);
        assert!(task_id.is_for_actor_creation_task());
    }

    #[test]
    fn test_object_id_from_index() {
        let task_id = TaskID::from_random();
        let obj_id = ObjectID::from_index(&task_id, 5);
        assert_eq!(obj_id.object_index(), 5);
        assert_eq!(obj_id.task_id(), task_id);
    }

    #[test]
    fn test_object_id_for_actor_handle() {
        let job_id = JobID::from_int(1);
        let actor_id = ActorID::of(&job_id, &TaskID::nil(), 0);
        let obj_id = ObjectID::for_actor_handle(&actor_id);
        assert!(obj_id.is_actor_id());
        assert_eq!(obj_id.to_actor_id(), actor_id);
    }

    #[test]
    fn test_plain_object_id_is_not_actor() {
        let job_id = JobID::from_int(1);
        let task_id = TaskID::for_normal_task(&job_id, &TaskID::nil(), 0);
        let obj_id = ObjectID::from_index(&task_id, 1);
        assert!(!obj_id.is_actor_id());
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = UniqueID::from_random();
        let hex_str = id.hex();
        assert_eq!(hex_str.len(), 56);
        let id2 = UniqueID::from_hex(&hex_str);
        assert_eq!(id, id2);
    }

    #[test]
    fn test_unique_id_size() {
        assert_eq!(UniqueID::SIZE, 28);
        assert_eq!(WorkerID::SIZE, 28);
        assert_eq!(NodeID::SIZE, 28);
        assert_eq!(ObjectID::SIZE, 28);
    }
}
