// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Storage-engine timestamp type.

use std::fmt;

/// A 64-bit storage-engine timestamp.
///
/// Timestamps order commits and anchor read views. The engine's textual
/// transaction configuration encodes them as lowercase base-16, zero-padded
/// to 16 digits with no prefix (`Timestamp::new(7)` encodes as
/// `0000000000000007`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp from its raw 64-bit value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw 64-bit value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Encodes the timestamp for a transaction configuration string.
    #[inline]
    pub fn to_config_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    /// Decodes a timestamp from its configuration-string encoding.
    pub fn from_config_hex(hex: &str) -> Option<Self> {
        u64::from_str_radix(hex, 16).ok().map(Self)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
