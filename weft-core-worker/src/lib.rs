// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Worker-side object reference counting for Weft.
//!
//! Tracks which objects in the cluster are still reachable from this worker —
//! through language-level references, submitted tasks, remote borrowers, and
//! nesting inside other objects — and decides when an object's value may be
//! reclaimed from the object store.

pub mod reference_counter;

pub use reference_counter::{
    LineageReleasedCallback, LocalityData, NodeLivenessProbe, ObjectCallback, ReferenceCounter,
};
