use super::{PAYLOAD_SIZE, Payload, Shutdown};
use crate::config::SenderConfig;
use crate::net::{ConnectionTrace, Perspective, StreamEnd, UniSend, server_endpoint};
use anyhow::Result;
use quinn::{Endpoint, VarInt};
use serde_json::json;
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span};

/// Why a send session stopped.
#[derive(Debug)]
pub enum SendEnd {
    /// The byte cap was reached.
    CapReached,
    /// The receiver stopped the stream with the graceful-stop code.
    PeerStopped,
    Cancelled,
    Failed(StreamEnd),
}

#[derive(Debug)]
pub struct Sent {
    pub bytes: u64,
    pub end: SendEnd,
}

/// Writes `payload` to `stream` until `total_bytes` have gone out, the peer
/// stops the stream, or `shutdown` fires. Never writes more than one payload
/// past the cap.
pub async fn send_payload<S: UniSend + ?Sized>(
    stream: &mut S,
    payload: &Payload,
    total_bytes: u64,
    shutdown: &mut Shutdown,
) -> Sent {
    let mut bytes = 0u64;
    let end = loop {
        if bytes >= total_bytes {
            break SendEnd::CapReached;
        }
        tokio::select! {
            biased;
            _ = shutdown.wait() => break SendEnd::Cancelled,
            written = stream.send(payload) => match written {
                Ok(n) => bytes += n as u64,
                Err(e) if e.is_graceful_stop() => break SendEnd::PeerStopped,
                Err(e) => break SendEnd::Failed(e),
            },
        }
    };
    Sent { bytes, end }
}

/// Generates the payload, binds the endpoint and serves until `shutdown`.
/// Setup failures are returned before any connection is accepted.
pub async fn run_sender(config: SenderConfig, shutdown: Shutdown) -> Result<()> {
    let payload = Payload::generate(PAYLOAD_SIZE)?;
    let endpoint = server_endpoint(config.listen, &config.cert, &config.key)?;
    serve(endpoint, Arc::new(config), payload, shutdown).await
}

/// Accepts connections until `shutdown` fires or the endpoint closes. Every
/// connection is served on its own task.
pub async fn serve(
    endpoint: Endpoint,
    config: Arc<SenderConfig>,
    payload: Payload,
    mut shutdown: Shutdown,
) -> Result<()> {
    info!("Listening on address {}", endpoint.local_addr()?);
    loop {
        let incoming = tokio::select! {
            _ = shutdown.wait() => break,
            incoming = endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else {
            break;
        };
        let span = info_span!("connection", remote = %incoming.remote_address());
        tokio::spawn(
            handle_connection(incoming, config.clone(), payload.clone(), shutdown.clone())
                .instrument(span),
        );
    }
    info!("Listener stopped");
    endpoint.close(VarInt::from_u32(0), b"shutdown");
    Ok(())
}

async fn handle_connection(
    incoming: quinn::Incoming,
    config: Arc<SenderConfig>,
    payload: Payload,
    mut shutdown: Shutdown,
) {
    let conn = match incoming.await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Error accepting connection: {}", e);
            return;
        }
    };
    info!("Accepted connection");
    let mut trace =
        ConnectionTrace::for_connection(config.trace_dir.as_deref(), Perspective::Server, &conn);

    info!("Opening unidirectional stream to client");
    let opened = tokio::select! {
        _ = shutdown.wait() => {
            conn.close(VarInt::from_u32(0), b"shutdown");
            return;
        }
        opened = conn.open_uni() => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            error!("Error opening unidirectional stream to client: {}", e);
            return;
        }
    };
    if let Some(trace) = trace.as_mut() {
        trace.event("stream_opened", json!({}));
    }

    let sent = send_payload(&mut stream, &payload, config.total_bytes, &mut shutdown).await;
    match &sent.end {
        SendEnd::CapReached => tokio::select! {
            _ = shutdown.wait() => conn.close(VarInt::from_u32(0), b"shutdown"),
            _ = UniSend::close(&mut stream) => {}
        },
        SendEnd::PeerStopped => info!("Client stopped the stream"),
        SendEnd::Cancelled => conn.close(VarInt::from_u32(0), b"shutdown"),
        SendEnd::Failed(e) => error!("Error writing to client: {}", e),
    }
    info!(bytes = sent.bytes, "Wrote {} bytes to client", sent.bytes);

    if let Some(trace) = trace.as_mut() {
        trace.event(
            "transfer_finished",
            json!({ "bytes": sent.bytes, "end": format!("{:?}", sent.end) }),
        );
        trace.connection_stats(&conn);
    }
}
