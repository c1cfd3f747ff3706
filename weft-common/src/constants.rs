// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared constants.

/// Length of Weft full-length UniqueIDs in bytes.
pub const UNIQUE_ID_SIZE: usize = 28;

/// Sentinel for an object whose size has not been reported yet.
pub const OBJECT_SIZE_UNKNOWN: i64 = -1;

/// Weft version string.
pub const WEFT_VERSION: &str = "0.1.0";
