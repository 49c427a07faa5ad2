//! Incremental HTTP response framing over a throttled byte stream.
//!
//! A throttled transport hands bytes over in short, arbitrarily sized chunks,
//! so the `\r\n\r\n` that ends the response headers can land anywhere: inside a
//! chunk, straddling two chunks, or spread one byte at a time across four.
//! [`FramingState`] classifies every chunk as header or payload bytes by
//! scanning the chunk together with the last three bytes of the stream seen so
//! far. The comparison is purely byte-oriented; nothing is decoded as text, so
//! binary bodies pass through untouched.
//!
//! [`FramingReader`] drives that state against a [`ThrottledConnection`] until
//! the stream closes or an expected number of bytes has arrived.
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use std::time::Duration;

use crate::{error::ConnectionError, transport::ThrottledConnection};

pub const HEADER_TERMINATOR: [u8; 4] = *b"\r\n\r\n";
/// Bytes carried from one chunk into the next scan. A terminator split across
/// chunks always has at most this many bytes on the earlier side.
const CARRY_LEN: usize = HEADER_TERMINATOR.len() - 1;

pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// When a run stops reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPolicy {
    /// Read until the peer closes the stream (zero-length read).
    #[default]
    OnClose,
    /// Read until this many bytes, headers included, have arrived. A closed
    /// stream still ends the run early.
    ExpectedTotal(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    ReadingHeaders,
    ReadingBody,
    Terminated,
}

/// How the header/body split of a finished run was established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingOutcome {
    /// The terminator was found; payload counts are exact.
    Complete,
    /// The stream ended before any terminator. Everything counted as header.
    Aborted,
    /// Header tracking was disabled; every byte counted as payload.
    Unframed,
}

impl FramingOutcome {
    /// Same spelling as the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            FramingOutcome::Complete => "complete",
            FramingOutcome::Aborted => "aborted",
            FramingOutcome::Unframed => "unframed",
        }
    }
}

/// Per-run parser state. Never shared between runs.
#[derive(Clone, Debug)]
pub struct FramingState {
    mode: Mode,
    tracking: bool,
    total_received: u64,
    payload_received: u64,
    header_len: Option<u64>,
    pending: Vec<u8>,
}

impl FramingState {
    pub fn new(track_header_boundary: bool) -> Self {
        Self {
            mode: if track_header_boundary {
                Mode::ReadingHeaders
            } else {
                Mode::ReadingBody
            },
            tracking: track_header_boundary,
            total_received: 0,
            payload_received: 0,
            header_len: None,
            pending: Vec::with_capacity(CARRY_LEN),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    pub fn payload_received(&self) -> u64 {
        self.payload_received
    }

    /// Length of the header block including the terminator, once found.
    pub fn header_len(&self) -> Option<u64> {
        self.header_len
    }

    /// Classifies one chunk and returns how many of its bytes are payload.
    ///
    /// Chunks handed in after [`FramingState::finish`] are ignored.
    pub fn consume(&mut self, chunk: &[u8]) -> u64 {
        let len = chunk.len() as u64;
        let payload = match self.mode {
            Mode::Terminated => return 0,
            Mode::ReadingBody => len,
            Mode::ReadingHeaders => match self.body_start(chunk) {
                Some(start) => {
                    self.header_len = Some(self.total_received + start as u64);
                    self.mode = Mode::ReadingBody;
                    self.pending = Vec::new();
                    (chunk.len() - start) as u64
                }
                None => {
                    self.carry(chunk);
                    0
                }
            },
        };

        self.total_received += len;
        self.payload_received += payload;
        payload
    }

    /// Whether the policy says to stop before issuing another read.
    pub fn reached(&self, policy: TerminationPolicy) -> bool {
        match policy {
            TerminationPolicy::OnClose => false,
            TerminationPolicy::ExpectedTotal(expected) => self.total_received >= expected,
        }
    }

    pub fn finish(&mut self) -> FramingOutcome {
        let outcome = match self.mode {
            _ if !self.tracking => FramingOutcome::Unframed,
            Mode::ReadingHeaders => FramingOutcome::Aborted,
            _ if self.header_len.is_none() => FramingOutcome::Aborted,
            _ => FramingOutcome::Complete,
        };
        self.mode = Mode::Terminated;
        self.pending = Vec::new();
        outcome
    }

    /// Offset in `chunk` where the body begins, if the terminator ends in it.
    fn body_start(&self, chunk: &[u8]) -> Option<usize> {
        // A match starting in the carried tail necessarily ends within the
        // first `CARRY_LEN` bytes of this chunk, and precedes any match that
        // lies entirely inside the chunk.
        if !self.pending.is_empty() {
            let head = &chunk[..chunk.len().min(CARRY_LEN)];
            let mut window = [0u8; 2 * CARRY_LEN];
            let carried = self.pending.len();
            let filled = carried + head.len();
            window[..carried].copy_from_slice(&self.pending);
            window[carried..filled].copy_from_slice(head);

            if let Some(pos) = find_terminator(&window[..filled]) {
                return Some(pos + HEADER_TERMINATOR.len() - carried);
            }
        }

        find_terminator(chunk).map(|pos| pos + HEADER_TERMINATOR.len())
    }

    /// Keeps the last `CARRY_LEN` bytes of the stream seen so far.
    fn carry(&mut self, chunk: &[u8]) {
        if chunk.len() >= CARRY_LEN {
            self.pending.clear();
            self.pending.extend_from_slice(&chunk[chunk.len() - CARRY_LEN..]);
        } else {
            self.pending.extend_from_slice(chunk);
            let excess = self.pending.len().saturating_sub(CARRY_LEN);
            self.pending.drain(..excess);
        }
    }
}

/// Position of the first `\r\n\r\n` in `haystack`.
pub fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR.as_slice())
}

#[derive(Clone, Debug, PartialEq, TypedBuilder, Serialize, Deserialize)]
pub struct FramingConfig {
    /// Upper bound handed to every `read_with_throttle` call.
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[builder(default)]
    #[serde(default)]
    pub termination: TerminationPolicy,
    #[builder(default = true)]
    #[serde(default = "default_tracking")]
    pub track_header_boundary: bool,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_tracking() -> bool {
    true
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Byte accounting of a finished run.
#[derive(Clone, Debug, PartialEq)]
pub struct Transfer {
    pub total_bytes: u64,
    pub payload_bytes: u64,
    pub header_bytes: Option<u64>,
    /// From just before the first read to termination.
    pub duration: Duration,
    pub outcome: FramingOutcome,
}

/// Sequential read loop over one connection.
pub struct FramingReader<'c, C> {
    conn: &'c mut C,
    config: FramingConfig,
    state: FramingState,
}

impl<'c, C: ThrottledConnection> FramingReader<'c, C> {
    pub fn new(conn: &'c mut C, config: FramingConfig) -> Self {
        let state = FramingState::new(config.track_header_boundary);
        Self {
            conn,
            config,
            state,
        }
    }

    pub fn state(&self) -> &FramingState {
        &self.state
    }

    /// Reads until the termination policy is met.
    ///
    /// Any transport error aborts the run and is returned as is; the bytes
    /// counted so far are dropped with it.
    pub async fn run(mut self) -> Result<Transfer, ConnectionError> {
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let start = Instant::now();

        while !self.state.reached(self.config.termination) {
            let n = self.conn.read_with_throttle(&mut buf).await?;
            if n == 0 {
                tracing::debug!("Stream closed by peer.");
                break;
            }
            let payload = self.state.consume(&buf[..n]);
            tracing::trace!(read = n, payload, "Chunk received.");
        }

        let duration = start.elapsed();
        let outcome = self.state.finish();
        if outcome == FramingOutcome::Aborted {
            tracing::warn!(
                total = self.state.total_received(),
                "Stream ended before the header terminator, counting zero payload."
            );
        }

        Ok(Transfer {
            total_bytes: self.state.total_received(),
            payload_bytes: self.state.payload_received(),
            header_bytes: self.state.header_len(),
            duration,
            outcome,
        })
    }
}
