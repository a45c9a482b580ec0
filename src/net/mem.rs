//! In-process stream pair with the same semantics as a QUIC unidirectional
//! stream: bounded buffering, clean finish and abort codes.

use super::{StreamEnd, UniRecv, UniSend};
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct Shared {
    finished: AtomicBool,
    abort_code: Mutex<Option<u64>>,
}

impl Shared {
    fn abort_code(&self) -> Option<u64> {
        match self.abort_code.lock() {
            Ok(code) => *code,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

pub struct MemSend {
    tx: Option<mpsc::Sender<Bytes>>,
    shared: Arc<Shared>,
    max_chunk: usize,
}

pub struct MemRecv {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    shared: Arc<Shared>,
}

/// Creates a pipe holding at most `depth` chunks of at most `max_chunk` bytes
/// in flight before the sender blocks.
pub fn pipe(depth: usize, max_chunk: usize) -> (MemSend, MemRecv) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    let shared = Arc::new(Shared::default());
    (
        MemSend {
            tx: Some(tx),
            shared: shared.clone(),
            max_chunk: max_chunk.max(1),
        },
        MemRecv {
            rx,
            pending: Bytes::new(),
            shared,
        },
    )
}

#[async_trait]
impl UniSend for MemSend {
    async fn send(&mut self, data: &[u8]) -> Result<usize, StreamEnd> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(StreamEnd::Failed(anyhow!("send on a finished stream")));
        };
        let n = data.len().min(self.max_chunk);
        match tx.send(Bytes::copy_from_slice(&data[..n])).await {
            Ok(()) => Ok(n),
            Err(_) => match self.shared.abort_code() {
                Some(code) => Err(StreamEnd::Aborted(code)),
                None => Err(StreamEnd::Failed(anyhow!("receiver dropped the stream"))),
            },
        }
    }

    async fn close(&mut self) {
        if self.tx.take().is_some() {
            self.shared.finished.store(true, Ordering::Release);
        }
    }
}

#[async_trait]
impl UniRecv for MemRecv {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, StreamEnd> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.pending = chunk,
                None if self.shared.finished.load(Ordering::Acquire) => {
                    return Err(StreamEnd::Finished);
                }
                None => return Err(StreamEnd::Failed(anyhow!("sender reset the stream"))),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }

    fn abort(&mut self, code: u64) {
        match self.shared.abort_code.lock() {
            Ok(mut slot) => *slot = Some(code),
            Err(poisoned) => *poisoned.into_inner() = Some(code),
        }
        self.rx.close();
    }
}
