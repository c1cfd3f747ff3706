// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Utility library for Weft.
//!
//! Logging setup and the rate-limited warning macro shared by the
//! worker-side crates.

pub mod logging;
