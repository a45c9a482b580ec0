// End-to-end transfer scenarios over the in-memory stream pair. The pair has
// the same finish/abort semantics as a QUIC unidirectional stream, so these
// exercise the sender and receiver loops without sockets.

use qperf::bench::{
    PAYLOAD_SIZE, Payload, READ_CHUNK_SIZE, RateLimit, RecvEnd, SendEnd, Shutdown, TokenBucket,
    receive, send_payload, shutdown_channel,
};
use qperf::net::UniSend;
use qperf::net::mem::pipe;
use std::time::Duration;
use tokio::time::Instant;

const PIPE_DEPTH: usize = 32;

#[tokio::test(flavor = "multi_thread")]
async fn duration_capped_run() {
    let payload = Payload::generate(PAYLOAD_SIZE).unwrap();
    let (mut tx, mut rx) = pipe(PIPE_DEPTH, PAYLOAD_SIZE);

    let sender = tokio::spawn(async move {
        send_payload(&mut tx, &payload, u64::MAX, &mut Shutdown::never()).await
    });

    let mut bucket = TokenBucket::new(RateLimit::UNLIMITED);
    let deadline = Instant::now() + Duration::from_secs(2);
    let received = receive(&mut rx, Some(deadline), &mut bucket, &mut Shutdown::never()).await;

    assert!(matches!(received.end, RecvEnd::DeadlineElapsed));
    assert!(received.report.bytes > 0);
    let elapsed = received.report.elapsed;
    assert!(elapsed >= Duration::from_millis(1990), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2500), "{:?}", elapsed);

    let sent = tokio::time::timeout(Duration::from_secs(5), sender)
        .await
        .expect("sender did not notice the graceful stop")
        .unwrap();
    assert!(matches!(sent.end, SendEnd::PeerStopped), "{:?}", sent.end);
    assert!(received.report.bytes <= sent.bytes);
}

#[tokio::test]
async fn byte_cap_ends_transfer() {
    const CAP: u64 = 1 << 20;
    let payload = Payload::generate(PAYLOAD_SIZE).unwrap();
    let (mut tx, mut rx) = pipe(PIPE_DEPTH, 10_000);

    let sender = tokio::spawn(async move {
        let sent = send_payload(&mut tx, &payload, CAP, &mut Shutdown::never()).await;
        tx.close().await;
        sent
    });

    let mut bucket = TokenBucket::new(RateLimit::UNLIMITED);
    let received = receive(&mut rx, None, &mut bucket, &mut Shutdown::never()).await;
    let sent = sender.await.unwrap();

    assert!(matches!(sent.end, SendEnd::CapReached));
    assert!(sent.bytes >= CAP);
    assert!(sent.bytes < CAP + PAYLOAD_SIZE as u64);
    assert!(matches!(received.end, RecvEnd::Finished));
    assert_eq!(received.report.bytes, sent.bytes);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_receiver_stays_under_limit() {
    let payload = Payload::generate(PAYLOAD_SIZE).unwrap();
    let (mut tx, mut rx) = pipe(PIPE_DEPTH, READ_CHUNK_SIZE);
    let _sender = tokio::spawn(async move {
        send_payload(&mut tx, &payload, u64::MAX, &mut Shutdown::never()).await
    });

    let limit = RateLimit::parse("1M").unwrap();
    assert_eq!(limit.bytes_per_sec, 1.25 * 1e6 / 8.0);
    let mut bucket = TokenBucket::new(limit);
    let deadline = Instant::now() + Duration::from_secs(4);
    let received = receive(&mut rx, Some(deadline), &mut bucket, &mut Shutdown::never()).await;

    assert!(matches!(received.end, RecvEnd::DeadlineElapsed));
    let secs = received.report.elapsed.as_secs_f64();
    let allowed = limit.bytes_per_sec * secs + limit.burst as f64;
    let bytes = received.report.bytes as f64;
    assert!(bytes <= allowed, "{} > {}", bytes, allowed);
    assert!(bytes >= 0.9 * limit.bytes_per_sec * secs, "{} too slow", bytes);
}

#[tokio::test]
async fn shutdown_stops_both_sides() {
    let payload = Payload::generate(PAYLOAD_SIZE).unwrap();
    let (mut tx, mut rx) = pipe(PIPE_DEPTH, PAYLOAD_SIZE);
    let (trigger, shutdown) = shutdown_channel();

    let mut sender_shutdown = shutdown.clone();
    let sender = tokio::spawn(async move {
        send_payload(&mut tx, &payload, u64::MAX, &mut sender_shutdown).await
    });
    let mut receiver_shutdown = shutdown;
    let receiver = tokio::spawn(async move {
        // Throttled hard enough that the receiver spends its time waiting for tokens.
        let mut bucket = TokenBucket::new(RateLimit::parse("8K").unwrap());
        receive(&mut rx, None, &mut bucket, &mut receiver_shutdown).await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    trigger.trigger();

    let (sent, received) = tokio::time::timeout(Duration::from_secs(2), async {
        (sender.await.unwrap(), receiver.await.unwrap())
    })
    .await
    .expect("shutdown was not observed");

    assert!(matches!(received.end, RecvEnd::Cancelled));
    assert!(received.report.bytes > 0);
    // Either the signal or the receiver's stop reached the sender first.
    assert!(matches!(sent.end, SendEnd::Cancelled | SendEnd::PeerStopped), "{:?}", sent.end);
    assert!(received.report.bytes <= sent.bytes);
}
