use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    Server,
    Client,
}

impl Perspective {
    fn as_str(self) -> &'static str {
        match self {
            Perspective::Server => "server",
            Perspective::Client => "client",
        }
    }
}

/// Names tried before giving up on a directory full of collisions.
const CREATE_ATTEMPTS: usize = 4;

#[derive(Serialize)]
struct Record<'a> {
    time_ms: f64,
    name: &'a str,
    data: serde_json::Value,
}

/// JSON-lines event log for a single connection. Buffered, flushed on drop.
pub struct ConnectionTrace {
    out: BufWriter<File>,
    path: PathBuf,
    start: Instant,
}

pub fn trace_file_name(perspective: Perspective, trace_id: u64) -> String {
    format!("{}_{:016x}.jsonl", perspective.as_str(), trace_id)
}

impl ConnectionTrace {
    /// Creates the trace file for `trace_id`. Fails rather than overwrite an
    /// existing file.
    pub fn create(dir: &Path, perspective: Perspective, trace_id: u64) -> Result<Self> {
        let path = dir.join(trace_file_name(perspective, trace_id));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("creating trace file {}", path.display()))?;
        info!("Created new trace file: {}", path.display());
        Ok(Self {
            out: BufWriter::new(file),
            path,
            start: Instant::now(),
        })
    }

    /// Creates a trace file under a fresh random id.
    pub fn create_unique(dir: &Path, perspective: Perspective) -> Result<Self> {
        let mut attempt = 1;
        loop {
            match Self::create(dir, perspective, rand::random()) {
                Err(e) if attempt < CREATE_ATTEMPTS && already_exists(&e) => attempt += 1,
                created => return created,
            }
        }
    }

    /// Opens a trace for `conn` when a trace directory is configured. A file
    /// that can't be created only disables tracing for this connection.
    pub fn for_connection(
        dir: Option<&Path>,
        perspective: Perspective,
        conn: &quinn::Connection,
    ) -> Option<Self> {
        let dir = dir?;
        match Self::create_unique(dir, perspective) {
            Ok(mut trace) => {
                trace.event(
                    "connection_started",
                    json!({ "remote": conn.remote_address().to_string() }),
                );
                Some(trace)
            }
            Err(e) => {
                warn!("Trace disabled for connection: {:#}", e);
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn event(&mut self, name: &str, data: serde_json::Value) {
        let record = Record {
            time_ms: self.start.elapsed().as_secs_f64() * 1e3,
            name,
            data,
        };
        let written = serde_json::to_writer(&mut self.out, &record)
            .map_err(io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"));
        if let Err(e) = written {
            warn!("Writing trace {}: {:#}", self.path.display(), e);
        }
    }

    pub fn connection_stats(&mut self, conn: &quinn::Connection) {
        let stats = conn.stats();
        self.event(
            "connection_stats",
            json!({
                "rtt_us": stats.path.rtt.as_micros() as u64,
                "cwnd": stats.path.cwnd,
                "sent_packets": stats.path.sent_packets,
                "lost_packets": stats.path.lost_packets,
                "udp_tx_bytes": stats.udp_tx.bytes,
                "udp_rx_bytes": stats.udp_rx.bytes,
            }),
        );
    }
}

fn already_exists(e: &anyhow::Error) -> bool {
    e.downcast_ref::<io::Error>()
        .is_some_and(|e| e.kind() == ErrorKind::AlreadyExists)
}

impl Drop for ConnectionTrace {
    fn drop(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!("Flushing trace {}: {}", self.path.display(), e);
        }
    }
}
