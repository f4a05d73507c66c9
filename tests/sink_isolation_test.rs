//! Fan-out isolation: one misbehaving sink must never affect delivery to
//! the others or block the publisher.

use async_trait::async_trait;
use bytes::Bytes;
use ssdaq::error::{DaqError, DaqResult};
use ssdaq::net::{NullSink, PublisherFanout, Sink, TcpPublisher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fails every delivery.
struct FailingSink {
    attempts: AtomicU64,
}

impl FailingSink {
    fn new() -> Self {
        Self {
            attempts: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Sink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn send(&self, _payload: Bytes) -> DaqResult<()> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(DaqError::Publish {
            sink: "failing".to_string(),
            message: "simulated downstream failure".to_string(),
        })
    }

    async fn close(&self) -> DaqResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn failing_sink_does_not_starve_the_others() {
    let healthy = Arc::new(NullSink::new());
    let failing = Arc::new(FailingSink::new());
    let fanout = PublisherFanout::new(vec![healthy.clone(), failing.clone()]);

    for i in 0..100u32 {
        fanout.publish(i.to_le_bytes().to_vec());
    }
    fanout.close(false).await;

    assert_eq!(healthy.delivered(), 100);
    assert_eq!(failing.attempts.load(Ordering::Relaxed), 100);
}

#[tokio::test]
async fn slow_subscriber_backpressure_stays_local() {
    let publisher = TcpPublisher::bind("readouts", "127.0.0.1:0").await.unwrap();
    let addr = publisher.local_addr().to_string();

    // A subscriber that connects but never reads.
    let stalled = tokio::net::TcpStream::connect(&addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Enough frames to fill the per-client queue and the socket buffer;
    // send must keep returning promptly instead of blocking on the stalled
    // client.
    let payload = Bytes::from(vec![0u8; 64 * 1024]);
    for _ in 0..512 {
        tokio::time::timeout(Duration::from_secs(1), publisher.send(payload.clone()))
            .await
            .expect("publish must not block on a stalled subscriber")
            .unwrap();
    }

    drop(stalled);
    publisher.close().await.unwrap();
}
