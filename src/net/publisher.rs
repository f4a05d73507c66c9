//! Publish sinks and the fan-out that feeds them.
//!
//! A [`Sink`] is anything that accepts a serialized readout. The
//! [`PublisherFanout`] serializes each readout once and hands the shared
//! buffer to one queue per sink; a dedicated task per sink drains its queue,
//! so a slow or failing sink never blocks ingestion or its neighbors.

use crate::error::{DaqError, DaqResult};
use crate::io::raw::{ContentType, RawObjectWriter};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Capability every publish target implements.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Instance name, used in log lines.
    fn name(&self) -> &str;

    /// Delivers one serialized readout. Errors are isolated by the fanout.
    async fn send(&self, payload: Bytes) -> DaqResult<()>;

    /// Flushes and releases resources.
    async fn close(&self) -> DaqResult<()>;
}

/// TCP pub/sub broadcaster.
///
/// Accepts any number of subscribers; each gets a bounded outgoing queue and
/// its own writer task. A subscriber that cannot keep up has frames dropped
/// rather than stalling the publisher, mirroring PUB/SUB semantics.
pub struct TcpPublisher {
    name: String,
    clients: Arc<Mutex<Vec<ClientHandle>>>,
    accept_task: JoinHandle<()>,
    local_addr: std::net::SocketAddr,
}

struct ClientHandle {
    addr: std::net::SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

/// Frames dropped per slow subscriber before we log again.
const CLIENT_QUEUE_DEPTH: usize = 256;

impl TcpPublisher {
    pub async fn bind(name: &str, addr: &str) -> DaqResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Publisher '{}' listening on {}", name, local_addr);
        let clients: Arc<Mutex<Vec<ClientHandle>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_clients = clients.clone();
        let accept_name = name.to_string();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        info!("Publisher '{}': subscriber connected from {}", accept_name, peer);
                        let (tx, rx) = mpsc::channel::<Bytes>(CLIENT_QUEUE_DEPTH);
                        accept_clients.lock().await.push(ClientHandle { addr: peer, tx });
                        let writer_name = accept_name.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::client_writer(socket, rx).await {
                                debug!(
                                    "Publisher '{}': subscriber {} dropped: {}",
                                    writer_name, peer, e
                                );
                            }
                        });
                    }
                    Err(e) => {
                        error!("Publisher '{}': accept error: {}", accept_name, e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            name: name.to_string(),
            clients,
            accept_task,
            local_addr,
        })
    }

    /// Address the publisher actually bound (useful with port 0 in tests).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    async fn client_writer(
        mut socket: TcpStream,
        mut rx: mpsc::Receiver<Bytes>,
    ) -> DaqResult<()> {
        while let Some(payload) = rx.recv().await {
            socket
                .write_all(&(payload.len() as u32).to_le_bytes())
                .await?;
            socket.write_all(&payload).await?;
        }
        socket.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for TcpPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: Bytes) -> DaqResult<()> {
        let mut clients = self.clients.lock().await;
        clients.retain(|client| match client.tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Publisher '{}': subscriber {} queue full, dropping frame",
                    self.name, client.addr
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                info!(
                    "Publisher '{}': subscriber {} disconnected",
                    self.name, client.addr
                );
                false
            }
        });
        Ok(())
    }

    async fn close(&self) -> DaqResult<()> {
        self.accept_task.abort();
        // Dropping the senders ends each client writer after its queue
        // drains to the OS buffer.
        self.clients.lock().await.clear();
        Ok(())
    }
}

/// Append-only framed raw file sink.
pub struct FileSink {
    name: String,
    writer: Mutex<Option<RawObjectWriter>>,
}

impl FileSink {
    pub fn create(name: &str, path: &str) -> DaqResult<Self> {
        let writer = RawObjectWriter::create(path, ContentType::Readout)?;
        info!("Sink '{}' writing readouts to {}", name, path);
        Ok(Self {
            name: name.to_string(),
            writer: Mutex::new(Some(writer)),
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: Bytes) -> DaqResult<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.write(&payload),
            None => Err(DaqError::Publish {
                sink: self.name.clone(),
                message: "file sink already closed".into(),
            }),
        }
    }

    async fn close(&self) -> DaqResult<()> {
        if let Some(writer) = self.writer.lock().await.take() {
            let written = writer.data_counter();
            writer.close()?;
            info!("Sink '{}' closed after {} readouts", self.name, written);
        }
        Ok(())
    }
}

/// Discards every payload while counting it. Used in dry runs and tests.
#[derive(Default)]
pub struct NullSink {
    delivered: AtomicU64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    async fn send(&self, _payload: Bytes) -> DaqResult<()> {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> DaqResult<()> {
        Ok(())
    }
}

struct SinkWorker {
    name: String,
    tx: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
    sink: Arc<dyn Sink>,
}

/// Serialize-once fan-out over independent per-sink delivery tasks.
pub struct PublisherFanout {
    workers: Vec<SinkWorker>,
}

/// Queue depth per sink before frames are dropped for that sink.
const SINK_QUEUE_DEPTH: usize = 1024;

impl PublisherFanout {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        let workers = sinks
            .into_iter()
            .map(|sink| {
                let (tx, mut rx) = mpsc::channel::<Bytes>(SINK_QUEUE_DEPTH);
                let worker_sink = sink.clone();
                let name = sink.name().to_string();
                let task_name = name.clone();
                let task = tokio::spawn(async move {
                    while let Some(payload) = rx.recv().await {
                        if let Err(e) = worker_sink.send(payload).await {
                            warn!("Sink '{}' failed, message skipped: {}", task_name, e);
                        }
                    }
                });
                SinkWorker {
                    name,
                    tx,
                    task,
                    sink,
                }
            })
            .collect();
        Self { workers }
    }

    pub fn n_sinks(&self) -> usize {
        self.workers.len()
    }

    /// Hands the payload to every sink queue without awaiting delivery.
    pub fn publish(&self, payload: Vec<u8>) {
        let shared = Bytes::from(payload);
        for worker in &self.workers {
            match worker.tx.try_send(shared.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Sink '{}' queue full, dropping readout", worker.name);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Sink '{}' delivery task gone", worker.name);
                }
            }
        }
    }

    /// Closes all sinks. With `hard` set, queued-but-undelivered payloads are
    /// discarded; otherwise every queue drains first.
    pub async fn close(self, hard: bool) {
        let mut sinks = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            drop(worker.tx);
            if hard {
                worker.task.abort();
            } else if let Err(e) = worker.task.await {
                if !e.is_cancelled() {
                    warn!("Sink '{}' delivery task panicked: {}", worker.name, e);
                }
            }
            sinks.push((worker.name, worker.sink));
        }
        let closes = sinks.iter().map(|(_, sink)| sink.close());
        for ((name, _), result) in sinks.iter().zip(join_all(closes).await) {
            if let Err(e) = result {
                warn!("Sink '{}' failed to close: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fanout_delivers_same_payload_to_all_sinks() {
        let a = Arc::new(NullSink::new());
        let b = Arc::new(NullSink::new());
        let fanout = PublisherFanout::new(vec![a.clone(), b.clone()]);
        for _ in 0..5 {
            fanout.publish(vec![1, 2, 3]);
        }
        fanout.close(false).await;
        assert_eq!(a.delivered(), 5);
        assert_eq!(b.delivered(), 5);
    }

    #[test]
    fn hard_close_discards_queued_payloads() {
        tokio_test::block_on(async {
            let sink = Arc::new(NullSink::new());
            let fanout = PublisherFanout::new(vec![sink.clone()]);
            fanout.publish(vec![0u8; 8]);
            fanout.close(true).await;
            // No assertion on the count: delivery may or may not have
            // happened, but close must not hang.
        });
    }
}
