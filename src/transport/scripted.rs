//! In-memory loopback transport serving a canned response.
//!
//! Useful for dry runs of a stage plan and for tests. Reads are paced by
//! sleeping `bytes / cap` seconds on the tokio clock, which makes runs under
//! `#[tokio::test(start_paused = true)]` deterministic.
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::Mutex;
use typed_builder::TypedBuilder;

use super::{Connector, ThrottledConnection};
use crate::error::ConnectionError;

/// Builds the response the load-test server sends for `GET /test?size=N`:
/// an octet-stream body of `size` bytes where byte `i` is `i % 256`.
pub fn http_response(size: usize) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {size}\r\nConnection: close\r\n\r\n"
    )
    .into_bytes();
    response.extend((0..size).map(|i| (i % 256) as u8));
    response
}

/// How many bytes each read hands out, before the caller's buffer size and
/// the remaining response are taken into account. A size of zero is served
/// as one byte, since an empty read means the peer closed.
#[derive(Clone, Debug, PartialEq)]
pub enum Chunking {
    Fixed(usize),
    /// Cycles through the given sizes.
    Sizes(Vec<usize>),
}

impl Default for Chunking {
    fn default() -> Self {
        Chunking::Fixed(4096)
    }
}

#[derive(Clone, Debug, TypedBuilder)]
pub struct Script {
    #[builder(setter(into))]
    pub response: Arc<[u8]>,
    #[builder(default)]
    pub chunking: Chunking,
    /// Sleep `n / cap` seconds per read once a cap is set.
    #[builder(default = true)]
    pub pace: bool,
    /// Keep the stream open after the response instead of returning `Ok(0)`.
    /// Reads past the end then never complete.
    #[builder(default)]
    pub hold_open: bool,
    /// Fail with [`ConnectionError::Reset`] once this many bytes were served.
    #[builder(default)]
    pub reset_after: Option<u64>,
}

pub struct ScriptedConnection {
    script: Script,
    position: usize,
    reads: usize,
    bandwidth_limit: Option<u64>,
    receive_buffer: Option<usize>,
    closed: bool,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedConnection {
    pub fn new(script: Script) -> Self {
        Self::with_log(script, Arc::default())
    }

    fn with_log(script: Script, requests: Arc<Mutex<Vec<Vec<u8>>>>) -> Self {
        Self {
            script,
            position: 0,
            reads: 0,
            bandwidth_limit: None,
            receive_buffer: None,
            closed: false,
            requests,
        }
    }

    pub fn bandwidth_limit(&self) -> Option<u64> {
        self.bandwidth_limit
    }

    pub fn receive_buffer(&self) -> Option<usize> {
        self.receive_buffer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn next_chunk(&self) -> usize {
        let size = match &self.script.chunking {
            Chunking::Fixed(n) => *n,
            Chunking::Sizes(sizes) if sizes.is_empty() => usize::MAX,
            Chunking::Sizes(sizes) => sizes[self.reads % sizes.len()],
        };
        size.max(1)
    }
}

impl ThrottledConnection for ScriptedConnection {
    fn set_bandwidth_limit(&mut self, bytes_per_second: u64) {
        if self.reads > 0 {
            tracing::warn!("Bandwidth limit changed mid-stream, ignoring.");
            return;
        }
        self.bandwidth_limit = Some(bytes_per_second);
    }

    fn set_receive_buffer(&mut self, bytes: usize) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.receive_buffer = Some(bytes);
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.requests.lock().await.push(data.to_vec());
        Ok(())
    }

    async fn read_with_throttle(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }

        let remaining = self.script.response.len() - self.position;
        if remaining == 0 {
            if self.script.hold_open {
                std::future::pending::<()>().await;
            }
            return Ok(0);
        }

        let mut n = buf.len().min(self.next_chunk()).min(remaining);
        if let Some(limit) = self.script.reset_after {
            let served = self.position as u64;
            if served >= limit {
                return Err(ConnectionError::Reset { received: served });
            }
            n = n.min((limit - served) as usize);
        }

        if let (true, Some(cap)) = (self.script.pace, self.bandwidth_limit) {
            if cap > 0 {
                tokio::time::sleep(Duration::from_secs_f64(n as f64 / cap as f64)).await;
            }
        }

        buf[..n].copy_from_slice(&self.script.response[self.position..self.position + n]);
        self.position += n;
        self.reads += 1;
        Ok(n)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.closed = true;
        Ok(())
    }
}

/// Hands out [`ScriptedConnection`]s that all replay the same script.
pub struct ScriptedConnector {
    script: Script,
    refused: HashSet<String>,
    connects: AtomicUsize,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ScriptedConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            refused: HashSet::new(),
            connects: AtomicUsize::new(0),
            requests: Arc::default(),
        }
    }

    /// Refuse every connection attempt to `addr`.
    pub fn refuse(mut self, addr: impl Into<String>) -> Self {
        self.refused.insert(addr.into());
        self
    }

    /// Successful connections so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    /// Every request written through any of this connector's connections.
    pub async fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().await.clone()
    }
}

impl Connector for ScriptedConnector {
    type Connection = ScriptedConnection;

    async fn connect(&self, addr: &str) -> Result<ScriptedConnection, ConnectionError> {
        if self.refused.contains(addr) {
            return Err(ConnectionError::Refused {
                addr: addr.to_string(),
                reason: "scripted refusal".to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(ScriptedConnection::with_log(
            self.script.clone(),
            Arc::clone(&self.requests),
        ))
    }
}
