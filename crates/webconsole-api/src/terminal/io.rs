//! Terminal I/O contract used by the exec launcher
//!
//! The launcher only sees this trait. The WebSocket bridge implements it for
//! browser connections; tests plug in in-memory versions.

use async_trait::async_trait;
use kube::api::TerminalSize;

use crate::error::Result;

/// WebSocket close codes sent to the browser
pub mod close_code {
    /// Process exited or the browser went away
    pub const NORMAL: u16 = 1000;
    /// Server is shutting down or not serving terminals
    pub const GOING_AWAY: u16 = 1001;
    /// Frame did not follow the terminal protocol
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Bind failed: wrong first message or unknown session
    pub const BIND_FAILED: u16 = 4001;
    /// The remote process could not be started or streamed
    pub const EXEC_FAILED: u16 = 4002;
}

/// Duplex terminal endpoint
///
/// A `read` returning `Ok(0)` means the call consumed a non-data frame
/// (resize, ping). End of input is reported as
/// [`Error::ConnectionClosed`](crate::Error::ConnectionClosed).
#[async_trait]
pub trait TerminalIo: Send + Sync {
    /// Read keystrokes into `buf`
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send process output
    async fn write(&self, data: &[u8]) -> Result<usize>;

    /// Wait for the next window size; `None` once the terminal is closed
    async fn next_resize(&self) -> Option<TerminalSize>;

    /// Send an out-of-band notice
    async fn toast(&self, message: &str) -> Result<()>;

    /// Close the terminal with a status code and reason
    async fn close(&self, code: u16, reason: &str);
}
