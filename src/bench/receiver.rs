use super::{READ_CHUNK_SIZE, Report, Shutdown, TokenBucket};
use crate::config::ReceiverConfig;
use crate::net::{
    ConnectionTrace, GRACEFUL_STOP, Perspective, StreamEnd, UniRecv, client_config,
    client_endpoint, resolve_remote,
};
use anyhow::{Context, Result};
use quinn::VarInt;
use serde_json::json;
use std::time::Duration;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info};

/// Upper bound on waiting for the connection close to reach the sender.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Application close code sent when the transfer failed on our side.
pub const RECEIVE_FAILED: u32 = 1;

/// Why a receive session stopped.
#[derive(Debug)]
pub enum RecvEnd {
    /// The sender finished the stream.
    Finished,
    /// The configured duration elapsed.
    DeadlineElapsed,
    Cancelled,
    Failed(StreamEnd),
}

#[derive(Debug)]
pub struct Received {
    pub report: Report,
    pub end: RecvEnd,
}

impl Received {
    pub fn is_failure(&self) -> bool {
        matches!(self.end, RecvEnd::Failed(_))
    }

    /// Code for closing the connection once the session is over. Zero reads
    /// as a graceful stop on the sender, so failures use another code.
    pub fn close_code(&self) -> VarInt {
        if self.is_failure() {
            VarInt::from_u32(RECEIVE_FAILED)
        } else {
            VarInt::from_u32(0)
        }
    }
}

/// Reads and discards everything on `stream`, at most `READ_CHUNK_SIZE` bytes
/// per read and paced by `bucket`, until the stream ends, `deadline` passes or
/// `shutdown` fires. On deadline or shutdown the sender is told to stop with
/// the graceful-stop code.
pub async fn receive<R: UniRecv + ?Sized>(
    stream: &mut R,
    deadline: Option<Instant>,
    bucket: &mut TokenBucket,
    shutdown: &mut Shutdown,
) -> Received {
    let mut discard = vec![0u8; READ_CHUNK_SIZE];
    let mut bytes = 0u64;
    let start = Instant::now();

    let end = loop {
        let read = async {
            bucket.acquire(READ_CHUNK_SIZE).await;
            stream.recv(&mut discard).await
        };
        let read = async {
            match deadline {
                Some(deadline) => timeout_at(deadline, read).await.ok(),
                None => Some(read.await),
            }
        };
        tokio::select! {
            biased;
            _ = shutdown.wait() => break RecvEnd::Cancelled,
            read = read => match read {
                None => break RecvEnd::DeadlineElapsed,
                Some(Ok(n)) => bytes += n as u64,
                Some(Err(StreamEnd::Finished)) => break RecvEnd::Finished,
                Some(Err(e)) => break RecvEnd::Failed(e),
            },
        }
    };
    let elapsed = start.elapsed();

    match &end {
        RecvEnd::DeadlineElapsed | RecvEnd::Cancelled => stream.abort(GRACEFUL_STOP),
        RecvEnd::Failed(e) => error!("Error reading from stream: {}", e),
        RecvEnd::Finished => {}
    }
    Received {
        report: Report::new(bytes, elapsed),
        end,
    }
}

/// Dials the sender, accepts its stream and runs one receive session.
/// Setup failures are errors; a transfer failure is reported in the result
/// alongside the bytes already received.
pub async fn run_receiver(config: &ReceiverConfig, mut shutdown: Shutdown) -> Result<Received> {
    let (host, remote) = resolve_remote(&config.remote).await?;
    let endpoint = client_endpoint(remote, client_config(config.insecure)?)?;
    let connecting = endpoint
        .connect(remote, &host)
        .with_context(|| format!("connecting to {}", config.remote))?;
    let conn = tokio::select! {
        _ = shutdown.wait() => return Ok(cancelled()),
        conn = connecting => conn.with_context(|| format!("establishing connection to {}", config.remote))?,
    };
    info!(remote = %conn.remote_address(), "Connected");
    let mut trace =
        ConnectionTrace::for_connection(config.trace_dir.as_deref(), Perspective::Client, &conn);

    let accepted = tokio::select! {
        _ = shutdown.wait() => return Ok(cancelled()),
        stream = conn.accept_uni() => stream,
    };
    let mut stream =
        accepted.with_context(|| format!("accepting stream from {}", conn.remote_address()))?;
    if let Some(trace) = trace.as_mut() {
        trace.event("stream_accepted", json!({}));
    }

    let mut bucket = TokenBucket::new(config.rate_limit);
    let limit = bucket.limit();
    info!(limit = limit.bytes_per_sec, burst = limit.burst, "Limiter configured");

    let deadline = config.duration.map(|d| Instant::now() + d);
    let received = receive(&mut stream, deadline, &mut bucket, &mut shutdown).await;
    debug!(end = ?received.end, bytes = received.report.bytes, "Receive session ended");

    if let Some(trace) = trace.as_mut() {
        trace.event(
            "transfer_finished",
            json!({ "bytes": received.report.bytes, "end": format!("{:?}", received.end) }),
        );
        trace.connection_stats(&conn);
    }
    drop(trace);

    conn.close(received.close_code(), b"done");
    if timeout(CLOSE_GRACE, endpoint.wait_idle()).await.is_err() {
        debug!("Connection did not drain before exit");
    }
    Ok(received)
}

fn cancelled() -> Received {
    Received {
        report: Report::new(0, Duration::ZERO),
        end: RecvEnd::Cancelled,
    }
}
