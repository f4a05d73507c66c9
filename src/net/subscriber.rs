//! Subscriber clients for the published data streams.

use crate::data::Readout;
use crate::error::DaqResult;
use log::{debug, info};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SUBSCRIBER_QUEUE_DEPTH: usize = 10_000;

/// Connects to a publisher and buffers received frames.
///
/// `recv` yields payloads in publish order and returns `None` once the
/// stream ends or the subscriber is closed.
pub struct Subscriber {
    rx: mpsc::Receiver<Vec<u8>>,
    reader_task: JoinHandle<()>,
    peer: String,
}

impl Subscriber {
    pub async fn connect(addr: &str) -> DaqResult<Self> {
        let mut socket = TcpStream::connect(addr).await?;
        info!("Subscriber connected to {}", addr);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let peer = addr.to_string();
        let task_peer = peer.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                let mut len_bytes = [0u8; 4];
                if socket.read_exact(&mut len_bytes).await.is_err() {
                    debug!("Subscriber stream from {} ended", task_peer);
                    break;
                }
                let len = u32::from_le_bytes(len_bytes) as usize;
                let mut payload = vec![0u8; len];
                if socket.read_exact(&mut payload).await.is_err() {
                    debug!("Subscriber stream from {} truncated", task_peer);
                    break;
                }
                // Blocking here only backpressures this subscriber's own
                // socket, never the publisher's other clients.
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(Self {
            rx,
            reader_task,
            peer,
        })
    }

    /// Awaits the next published payload.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Stops the stream. Pending `recv` calls unblock; with `hard` set any
    /// buffered frames are discarded, otherwise they remain readable until
    /// the buffer drains.
    pub fn close(&mut self, hard: bool) {
        self.reader_task.abort();
        if hard {
            info!("Subscriber to {}: emptying data buffer", self.peer);
            while self.rx.try_recv().is_ok() {}
            self.rx.close();
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Typed wrapper decoding readout frames.
pub struct ReadoutSubscriber {
    inner: Subscriber,
}

impl ReadoutSubscriber {
    pub async fn connect(addr: &str) -> DaqResult<Self> {
        Ok(Self {
            inner: Subscriber::connect(addr).await?,
        })
    }

    /// Next readout, or `None` once the stream is closed. Malformed frames
    /// surface as errors so callers can log and continue.
    pub async fn recv(&mut self) -> Option<DaqResult<Readout>> {
        let payload = self.inner.recv().await?;
        Some(Readout::decode(&payload))
    }

    pub fn close(&mut self, hard: bool) {
        self.inner.close(hard);
    }
}

impl From<Subscriber> for ReadoutSubscriber {
    fn from(inner: Subscriber) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::publisher::{Sink, TcpPublisher};
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn frames_arrive_fifo_and_close_unblocks() {
        let publisher = TcpPublisher::bind("readouts", "127.0.0.1:0").await.unwrap();
        let addr = publisher.local_addr().to_string();
        let mut subscriber = Subscriber::connect(&addr).await.unwrap();
        // Give the accept loop time to register the client.
        tokio::time::sleep(Duration::from_millis(50)).await;

        for i in 0u8..3 {
            publisher.send(Bytes::from(vec![i; 4])).await.unwrap();
        }
        for i in 0u8..3 {
            assert_eq!(subscriber.recv().await.unwrap(), vec![i; 4]);
        }

        subscriber.close(true);
        assert!(subscriber.recv().await.is_none());
        publisher.close().await.unwrap();
    }

    #[tokio::test]
    async fn late_joiner_misses_earlier_messages() {
        let publisher = TcpPublisher::bind("readouts", "127.0.0.1:0").await.unwrap();
        let addr = publisher.local_addr().to_string();
        publisher.send(Bytes::from(vec![0xAA; 8])).await.unwrap();

        let mut subscriber = Subscriber::connect(&addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.send(Bytes::from(vec![0xBB; 8])).await.unwrap();

        assert_eq!(subscriber.recv().await.unwrap(), vec![0xBB; 8]);
        subscriber.close(true);
        publisher.close().await.unwrap();
    }
}
