//! The rate-limited transport, seen only through the operations a
//! measurement run needs.
//!
//! Enforcing the byte budget is the transport's job. A run configures the cap
//! once, sends its request and then reads until the stream ends; every read may
//! block for as long as the cap requires and may return fewer bytes than asked
//! for.
use std::future::Future;

use crate::error::ConnectionError;

#[cfg(feature = "builtins")]
pub mod scripted;

/// An open connection whose reads are paced by a bandwidth cap.
pub trait ThrottledConnection: Send {
    /// Must be called before the first read. Changing the cap mid-stream is
    /// implementation-defined.
    fn set_bandwidth_limit(&mut self, bytes_per_second: u64);

    /// Receive buffer hint; has no effect on correctness.
    fn set_receive_buffer(&mut self, bytes: usize) -> Result<(), ConnectionError>;

    fn write(&mut self, data: &[u8]) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Fills at most `buf.len()` bytes. `Ok(0)` means the peer closed the
    /// stream.
    fn read_with_throttle(
        &mut self,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<usize, ConnectionError>> + Send;

    /// Releases the connection. Calling it more than once is harmless.
    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Opens [`ThrottledConnection`]s.
pub trait Connector: Send + Sync {
    type Connection: ThrottledConnection;

    fn connect(
        &self,
        addr: &str,
    ) -> impl Future<Output = Result<Self::Connection, ConnectionError>> + Send;
}
