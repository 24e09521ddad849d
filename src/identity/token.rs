// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cross-process propagation tokens.
//!
//! Tokens use the W3C `traceparent` layout: `version-traceid-spanid-flags`,
//! e.g. `00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01`.
//! Tokens are read back from persisted state that may be stale or corrupted, so
//! decoding never panics: every malformed input maps to a [`TokenError`].

use std::fmt;
use std::str::FromStr;

use crate::error::TokenError;

use super::ids::{SpanId, TraceId};

/// Protocol version written by [`encode_token`].
pub const TOKEN_VERSION: u8 = 0x00;

/// Sampled / always-record flag.
pub const FLAG_SAMPLED: u8 = 0x01;

/// Version value reserved as invalid by the format.
const INVALID_VERSION: &str = "ff";

/// A decoded propagation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropagationToken {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub flags: u8,
}

impl PropagationToken {
    /// Create a sampled token for the given span.
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self {
            trace_id,
            span_id,
            flags: FLAG_SAMPLED,
        }
    }

    /// Check if the sampled flag is set.
    pub fn is_sampled(&self) -> bool {
        self.flags & FLAG_SAMPLED != 0
    }

    /// Encode to the compact string form.
    pub fn encode(&self) -> String {
        format!(
            "{:02x}-{}-{}-{:02x}",
            TOKEN_VERSION, self.trace_id, self.span_id, self.flags
        )
    }

    /// Decode from the compact string form.
    pub fn decode(token: &str) -> Result<Self, TokenError> {
        let token = token.trim();
        let parts: Vec<&str> = token.split('-').collect();
        if parts.len() < 4 {
            return Err(TokenError::Malformed(token.to_string()));
        }

        let version = parts[0];
        if version.len() != 2 || !version.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TokenError::Malformed(token.to_string()));
        }
        if version.eq_ignore_ascii_case(INVALID_VERSION) {
            return Err(TokenError::UnsupportedVersion(version.to_string()));
        }
        // Version 00 has exactly four fields; later versions may append more.
        if version == "00" && parts.len() != 4 {
            return Err(TokenError::Malformed(token.to_string()));
        }

        let trace_id = TraceId::from_hex(parts[1])?;
        let span_id = SpanId::from_hex(parts[2])?;

        let flags_hex = parts[3];
        if flags_hex.len() != 2 {
            return Err(TokenError::InvalidFlags(flags_hex.to_string()));
        }
        let flags = u8::from_str_radix(flags_hex, 16)
            .map_err(|_| TokenError::InvalidFlags(flags_hex.to_string()))?;

        Ok(Self {
            trace_id,
            span_id,
            flags,
        })
    }
}

impl fmt::Display for PropagationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for PropagationToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Encode a sampled token for `(trace_id, span_id)`.
pub fn encode_token(trace_id: TraceId, span_id: SpanId) -> String {
    PropagationToken::new(trace_id, span_id).encode()
}

/// Decode a token back into `(trace_id, span_id)`.
pub fn decode_token(token: &str) -> Result<(TraceId, SpanId), TokenError> {
    PropagationToken::decode(token).map(|t| (t.trace_id, t.span_id))
}
