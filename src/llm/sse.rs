// ABOUTME: Shared SSE (Server-Sent Events) line-buffering parser for LLM streaming responses
// ABOUTME: Handles partial lines across TCP boundaries and multiple events per chunk
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # SSE Stream Parser
//!
//! A shared line-buffering parser for Server-Sent Events (SSE) used by the
//! streaming providers. Solves two correctness issues:
//!
//! 1. **Multiple events per TCP chunk**: when network buffers batch several
//!    SSE events into a single `bytes_stream()` chunk, all events are emitted.
//!
//! 2. **Partial JSON across TCP boundaries**: when a payload is split across
//!    two TCP chunks, the line buffer accumulates until a complete line arrives.
//!
//! Each provider supplies a `parse_data` closure that converts raw JSON
//! strings into [`StreamChunk`] values. The SSE framing (line buffering,
//! `data:` prefix stripping, `[DONE]` detection) is handled once here.

use std::collections::VecDeque;
use std::mem;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::stream::unfold;
use futures_util::{future, Stream, StreamExt};

use super::{ChatStream, StreamChunk};
use crate::errors::AppError;

/// A parsed SSE event from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// A `data:` payload with the JSON string (prefix stripped)
    Data(String),
    /// The `[DONE]` termination signal (OpenAI convention)
    Done,
}

/// Parse one complete SSE line into an event
///
/// Non-`data:` fields (`event:`, `id:`, `retry:`, comments) and empty
/// separator lines produce nothing.
fn parse_line(line: &str) -> Option<SseEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == "data: [DONE]" {
        return Some(SseEvent::Done);
    }
    let data = trimmed.strip_prefix("data: ")?;
    if data.trim().is_empty() {
        return None;
    }
    Some(SseEvent::Data(data.to_owned()))
}

/// Line-buffering SSE parser that handles partial lines across TCP chunk boundaries
///
/// SSE streams are newline-delimited but TCP does not align network chunks
/// with event boundaries. Incomplete lines stay buffered until the terminating
/// `\n` arrives.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    /// Accumulated bytes not yet terminated by a newline
    buffer: String,
}

impl SseLineBuffer {
    /// Create a new empty line buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from a TCP chunk, returning any complete SSE events
    ///
    /// Complete lines are extracted and parsed; a trailing partial line
    /// remains in the buffer for the next `feed()` call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let rest = self.buffer.split_off(newline_pos + 1);
            let line = mem::replace(&mut self.buffer, rest);
            if let Some(event) = parse_line(line.trim_end_matches('\n').trim_end_matches('\r')) {
                events.push(event);
            }
        }
        events
    }

    /// Flush any remaining buffered content as a final event
    ///
    /// Called when the byte stream ends with a partial line (no trailing
    /// newline) still in the buffer.
    pub fn flush(&mut self) -> Vec<SseEvent> {
        let remaining = mem::take(&mut self.buffer);
        parse_line(&remaining).into_iter().collect()
    }
}

/// Internal state carried through the stream unfold
struct StreamState {
    lines: SseLineBuffer,
    pending: VecDeque<Result<StreamChunk, AppError>>,
    ended: bool,
}

impl StreamState {
    /// Convert parsed SSE events into pending stream chunks
    fn absorb<F>(&mut self, events: Vec<SseEvent>, parse_data: &F)
    where
        F: Fn(&str) -> Option<Result<StreamChunk, AppError>>,
    {
        for event in events {
            match event {
                SseEvent::Data(json_str) => {
                    if let Some(result) = parse_data(&json_str) {
                        self.pending.push_back(result);
                    }
                }
                SseEvent::Done => {
                    self.pending.push_back(Ok(StreamChunk {
                        delta: String::new(),
                        is_final: true,
                        finish_reason: Some("stop".to_owned()),
                    }));
                }
            }
        }
    }
}

/// Create a properly-buffered SSE stream from a raw byte stream
///
/// Wraps a `reqwest` byte stream with SSE line buffering. The `parse_data`
/// closure converts provider-specific JSON strings into [`StreamChunk`]
/// values; returning `None` skips events that produce no output (empty
/// deltas, metadata-only chunks).
pub fn create_sse_stream<S, F>(
    byte_stream: S,
    parse_data: F,
    provider_name: &'static str,
) -> ChatStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    F: Fn(&str) -> Option<Result<StreamChunk, AppError>> + Send + 'static,
{
    let state = StreamState {
        lines: SseLineBuffer::new(),
        pending: VecDeque::new(),
        ended: false,
    };

    // unfold keeps parser state across async iterations; each turn either
    // drains a pending event or reads the next TCP chunk
    let stream = unfold(
        (
            Box::pin(byte_stream)
                as Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
            state,
            parse_data,
            provider_name,
        ),
        |(mut byte_stream, mut state, parse_data, provider_name)| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, (byte_stream, state, parse_data, provider_name)));
                }

                if state.ended {
                    return None;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        let events = state.lines.feed(&bytes);
                        state.absorb(events, &parse_data);
                        // Loop back to drain pending events
                    }
                    Some(Err(e)) => {
                        state.ended = true;
                        return Some((
                            Err(AppError::model_unavailable(format!(
                                "{provider_name} stream read error: {e}"
                            ))),
                            (byte_stream, state, parse_data, provider_name),
                        ));
                    }
                    None => {
                        state.ended = true;
                        let events = state.lines.flush();
                        state.absorb(events, &parse_data);
                        if let Some(item) = state.pending.pop_front() {
                            return Some((item, (byte_stream, state, parse_data, provider_name)));
                        }
                        return None;
                    }
                }
            }
        },
    );

    // Empty deltas carry no information unless they mark the end
    let filtered = stream.filter(|result| {
        future::ready(
            result
                .as_ref()
                .map_or(true, |chunk| !chunk.delta.is_empty() || chunk.is_final),
        )
    });

    Box::pin(filtered)
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry configuration for provider HTTP requests
///
/// Retries only cover the initial request. Once bytes start flowing a
/// stream is not retried, since the client may have consumed partial output.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: u32,
    /// Initial delay before first retry (milliseconds)
    pub initial_delay_ms: u64,
    /// Maximum delay cap for exponential backoff (milliseconds)
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Default retry config: 3 retries, 500ms initial, 5s max
    #[must_use]
    pub const fn default_config() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
        }
    }

    /// Calculate exponential backoff delay with jitter for a given attempt
    ///
    /// `delay = min(initial_ms * 2^attempt, max_ms) + jitter(0..100ms)`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms.saturating_mul(1_u64 << attempt);
        let capped_delay = base_delay.min(self.max_delay_ms);
        // Small jitter to avoid thundering herd
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::from(d.subsec_millis()))
            % 100;
        Duration::from_millis(capped_delay + jitter)
    }
}

/// Check if an HTTP error status code is retryable
///
/// Retryable errors are transient conditions that may resolve on retry:
/// 429 (rate limiting), 503 (temporary overload), 502 (upstream issues).
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503)
}

/// Check if a request error is retryable (connection/timeout errors)
#[must_use]
pub fn is_retryable_request_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}
