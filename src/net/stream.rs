use async_trait::async_trait;
use std::fmt;

/// Application error code a receiver uses to stop a stream on purpose.
pub const GRACEFUL_STOP: u64 = 0;

/// How a unidirectional stream stopped carrying bytes.
#[derive(Debug)]
pub enum StreamEnd {
    /// The writer finished the stream cleanly.
    Finished,
    /// The peer aborted the stream with an application error code.
    Aborted(u64),
    /// Anything else: connection loss, local misuse, transport faults.
    Failed(anyhow::Error),
}

impl StreamEnd {
    pub fn is_graceful_stop(&self) -> bool {
        matches!(self, StreamEnd::Aborted(GRACEFUL_STOP))
    }
}

impl fmt::Display for StreamEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamEnd::Finished => write!(f, "stream finished"),
            StreamEnd::Aborted(code) => write!(f, "stream aborted by peer with code {}", code),
            StreamEnd::Failed(e) => write!(f, "stream failed: {:#}", e),
        }
    }
}

/// Sending half of a unidirectional stream.
#[async_trait]
pub trait UniSend: Send {
    /// Writes a prefix of `data` and returns how many bytes were accepted.
    async fn send(&mut self, data: &[u8]) -> Result<usize, StreamEnd>;

    /// Finishes the stream and waits, best effort, for the peer to take delivery.
    async fn close(&mut self);
}

/// Receiving half of a unidirectional stream.
#[async_trait]
pub trait UniRecv: Send {
    /// Reads into `buf`. Never returns `Ok(0)` for a non-empty buffer; the end
    /// of the stream is reported as `Err(StreamEnd::Finished)`.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, StreamEnd>;

    /// Asks the writer to stop sending, best effort.
    fn abort(&mut self, code: u64);
}
