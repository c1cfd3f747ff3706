// Copyright 2025 The Weft Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Common types for Weft: IDs, worker addresses, status/error types, config.

pub mod address;
pub mod config;
pub mod constants;
pub mod id;
pub mod status;
