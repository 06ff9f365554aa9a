// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Timestamp primitives shared by the storage seam and the transaction layer.

mod timestamp;

pub use timestamp::Timestamp;
