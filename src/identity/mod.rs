// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identity generation and cross-process context propagation.
//!
//! A span created in one hook invocation is referenced from a later, unrelated
//! invocation through a [`PropagationToken`] persisted in the span-state store.

mod ids;
mod token;

pub use ids::{new_span_id, new_trace_id, SpanId, TraceId};
pub use token::{
    decode_token, encode_token, PropagationToken, FLAG_SAMPLED, TOKEN_VERSION,
};
