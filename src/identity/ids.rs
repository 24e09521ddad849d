// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Trace and span identifiers.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::TokenError;

/// A 128-bit trace identifier, rendered as 32 lowercase hex characters.
///
/// The all-zero value is invalid and can never be constructed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u128);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        // v4 UUIDs always carry version bits, so the value is never zero.
        Self(Uuid::new_v4().as_u128())
    }

    /// Create a trace ID from a raw value. Returns `None` for zero.
    pub fn from_u128(value: u128) -> Option<Self> {
        (value != 0).then_some(Self(value))
    }

    /// Get the raw value.
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Render as 32 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.0)
    }

    /// Parse from exactly 32 lowercase hex characters.
    pub fn from_hex(hex: &str) -> Result<Self, TokenError> {
        if hex.len() != 32 || !is_lower_hex(hex) {
            return Err(TokenError::InvalidTraceId(hex.to_string()));
        }
        u128::from_str_radix(hex, 16)
            .ok()
            .and_then(Self::from_u128)
            .ok_or_else(|| TokenError::InvalidTraceId(hex.to_string()))
    }

    /// Get a short representation (first 8 characters).
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.short())
    }
}

impl FromStr for TraceId {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// A 64-bit span identifier, rendered as 16 lowercase hex characters.
///
/// The all-zero value is invalid and can never be constructed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    /// Generate a new random span ID.
    pub fn new() -> Self {
        // The low half of a v4 UUID holds the variant bits, so it is never zero.
        let (_, low) = Uuid::new_v4().as_u64_pair();
        Self(low)
    }

    /// Create a span ID from a raw value. Returns `None` for zero.
    pub fn from_u64(value: u64) -> Option<Self> {
        (value != 0).then_some(Self(value))
    }

    /// Get the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Render as 16 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    /// Parse from exactly 16 lowercase hex characters.
    pub fn from_hex(hex: &str) -> Result<Self, TokenError> {
        if hex.len() != 16 || !is_lower_hex(hex) {
            return Err(TokenError::InvalidSpanId(hex.to_string()));
        }
        u64::from_str_radix(hex, 16)
            .ok()
            .and_then(Self::from_u64)
            .ok_or_else(|| TokenError::InvalidSpanId(hex.to_string()))
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self.to_hex())
    }
}

impl FromStr for SpanId {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl serde::Serialize for TraceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for TraceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for SpanId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for SpanId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Generate a new globally-unique trace ID.
pub fn new_trace_id() -> TraceId {
    TraceId::new()
}

/// Generate a new span ID.
pub fn new_span_id() -> SpanId {
    SpanId::new()
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_unique() {
        let a = new_trace_id();
        let b = new_trace_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_span_id_unique() {
        let ids: std::collections::HashSet<SpanId> = (0..1000).map(|_| new_span_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_trace_id_hex_shape() {
        let id = TraceId::new();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(TraceId::from_hex(&hex).unwrap(), id);
        assert_eq!(id.to_string(), hex);
    }

    #[test]
    fn test_span_id_keeps_leading_zeros() {
        let id = SpanId::from_u64(0xab).unwrap();
        assert_eq!(id.to_hex(), "00000000000000ab");
        assert_eq!(SpanId::from_hex("00000000000000ab").unwrap(), id);
    }

    #[test]
    fn test_zero_ids_rejected() {
        assert!(TraceId::from_u128(0).is_none());
        assert!(SpanId::from_u64(0).is_none());
        assert!(TraceId::from_hex(&"0".repeat(32)).is_err());
        assert!(SpanId::from_hex(&"0".repeat(16)).is_err());
    }

    #[test]
    fn test_rejects_uppercase_and_signs() {
        assert!(SpanId::from_hex("00000000000000AB").is_err());
        assert!(SpanId::from_hex("+000000000000001").is_err());
        assert!(TraceId::from_hex("short").is_err());
    }

    #[test]
    fn test_debug_format() {
        let id = TraceId::new();
        assert!(format!("{:?}", id).starts_with("TraceId("));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = SpanId::from_u64(0x1234).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0000000000001234\"");
        let parsed: SpanId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
        assert!(serde_json::from_str::<SpanId>("\"zz\"").is_err());
    }
}
