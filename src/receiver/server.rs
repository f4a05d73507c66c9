//! The readout assembler: wires ingestion, correlation, fan-out, control
//! and monitoring into one running instance.
//!
//! Task layout: the UDP receive loop feeds an unbounded channel; a single
//! correlator task owns the partial-readout buffer and the sink fan-out;
//! control and monitoring run beside them. Stop is a watch signal: a soft
//! stop lets the correlator drain its buffer through the sinks, a hard stop
//! discards everything in flight.

use crate::config::{Settings, SinkSettings};
use crate::data::ModulePacket;
use crate::error::{DaqError, DaqResult};
use crate::net::{FileSink, NullSink, PublisherFanout, Sink, TcpPublisher};
use crate::receiver::control::ControlServer;
use crate::receiver::correlator::{CorrelatorConfig, ReadoutCorrelator};
use crate::receiver::monitor::MonitoringSender;
use crate::receiver::protocol::SlowSignalProtocol;
use crate::receiver::ReceiverCounters;
use log::{error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub struct ReadoutAssembler;

/// Running instance; stopping consumes the handle.
pub struct ReadoutAssemblerHandle {
    stop_tx: watch::Sender<bool>,
    hard_stop: Arc<AtomicBool>,
    counters: Arc<ReceiverCounters>,
    udp_addr: SocketAddr,
    control_addr: SocketAddr,
    /// Bound address per TCP sink name, plus the monitoring publisher under
    /// the reserved name "monitor".
    publisher_addrs: HashMap<String, SocketAddr>,
    fatal_rx: Option<oneshot::Receiver<DaqError>>,
    ingest_task: JoinHandle<()>,
    correlate_task: JoinHandle<()>,
    control_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

impl ReadoutAssembler {
    /// Binds all sockets and spawns the pipeline tasks.
    pub async fn start(settings: &Settings) -> DaqResult<ReadoutAssemblerHandle> {
        let counters = Arc::new(ReceiverCounters::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let hard_stop = Arc::new(AtomicBool::new(false));
        let (packet_tx, packet_rx) = mpsc::unbounded_channel::<ModulePacket>();

        let listen = format!(
            "{}:{}",
            settings.receiver.listen_ip, settings.receiver.listen_port
        );
        let protocol = SlowSignalProtocol::bind(
            &listen,
            packet_tx,
            counters.clone(),
            settings.receiver.relaxed_ip_range,
            settings.receiver.packet_debug_stream_file.as_deref(),
        )
        .await?;
        let udp_addr = protocol.local_addr()?;

        let mut publisher_addrs = HashMap::new();
        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        for (name, sink_settings) in &settings.sinks {
            match sink_settings {
                SinkSettings::Tcp { ip, port } => {
                    let publisher =
                        TcpPublisher::bind(name, &format!("{}:{}", ip, port)).await?;
                    publisher_addrs.insert(name.clone(), publisher.local_addr());
                    sinks.push(Arc::new(publisher));
                }
                SinkSettings::File { path } => {
                    sinks.push(Arc::new(FileSink::create(name, path)?));
                }
                SinkSettings::Null => {
                    sinks.push(Arc::new(NullSink::new()));
                }
            }
        }
        if sinks.is_empty() {
            warn!("No sinks configured, assembled readouts will be discarded");
            sinks.push(Arc::new(NullSink::new()));
        }
        let fanout = PublisherFanout::new(sinks);

        let monitor_publisher = TcpPublisher::bind(
            "monitor",
            &format!("{}:{}", settings.monitor.ip, settings.monitor.port),
        )
        .await?;
        publisher_addrs.insert("monitor".to_string(), monitor_publisher.local_addr());
        let monitor_sink: Arc<dyn Sink> = Arc::new(monitor_publisher);

        let control =
            ControlServer::bind(settings.receiver.control_port, counters.clone()).await?;
        let control_addr = control.local_addr()?;

        let (fatal_tx, fatal_rx) = oneshot::channel();
        let ingest_stop = stop_rx.clone();
        let ingest_task = tokio::spawn(async move {
            if let Err(e) = protocol.run(ingest_stop).await {
                error!("UDP receive loop died: {}", e);
                let _ = fatal_tx.send(e);
            }
        });

        let correlator = ReadoutCorrelator::new(
            CorrelatorConfig {
                readout_window: settings.receiver.readout_window,
                buffer_time: settings.receiver.buffer_time,
                buffer_length: settings.receiver.buffer_length,
            },
            counters.clone(),
        );
        let correlate_task = tokio::spawn(correlate_loop(
            correlator,
            packet_rx,
            fanout,
            counters.clone(),
            hard_stop.clone(),
        ));

        let control_task = tokio::spawn(control.run(stop_rx.clone()));

        let monitoring = MonitoringSender::new(
            "readout_assembler",
            settings.monitor.mon_wait,
            counters.clone(),
            monitor_sink,
        );
        let monitor_task = tokio::spawn(monitoring.run(stop_rx));

        info!(
            "Readout assembler up: udp {}, control {}",
            udp_addr, control_addr
        );
        Ok(ReadoutAssemblerHandle {
            stop_tx,
            hard_stop,
            counters,
            udp_addr,
            control_addr,
            publisher_addrs,
            fatal_rx: Some(fatal_rx),
            ingest_task,
            correlate_task,
            control_task,
            monitor_task,
        })
    }
}

/// Single consumer of the ingestion channel; the only task that ever touches
/// the partial-readout buffer.
async fn correlate_loop(
    mut correlator: ReadoutCorrelator,
    mut packet_rx: mpsc::UnboundedReceiver<ModulePacket>,
    fanout: PublisherFanout,
    counters: Arc<ReceiverCounters>,
    hard_stop: Arc<AtomicBool>,
) {
    while let Some(packet) = packet_rx.recv().await {
        counters.queue_depth.fetch_sub(1, Ordering::Relaxed);
        for readout in correlator.process_packet(packet) {
            if counters.publish_readouts.load(Ordering::Relaxed) {
                fanout.publish(readout.encode());
            }
        }
    }

    let hard = hard_stop.load(Ordering::Relaxed);
    if hard {
        info!(
            "Hard stop: discarding {} partial readouts",
            correlator.buffer_len()
        );
    } else {
        let remaining = correlator.drain();
        info!("Flushing {} buffered readouts before close", remaining.len());
        for readout in remaining {
            if counters.publish_readouts.load(Ordering::Relaxed) {
                fanout.publish(readout.encode());
            }
        }
    }
    fanout.close(hard).await;
}

impl ReadoutAssemblerHandle {
    pub fn counters(&self) -> Arc<ReceiverCounters> {
        self.counters.clone()
    }

    /// Address the UDP socket actually bound.
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Bound address of a named TCP publisher ("monitor" for the monitoring
    /// stream).
    pub fn publisher_addr(&self, name: &str) -> Option<SocketAddr> {
        self.publisher_addrs.get(name).copied()
    }

    /// Receiver that resolves with the error when the UDP loop dies, e.g. the
    /// strict-mode topology failure. Yields `None` on a second call.
    pub fn take_fatal(&mut self) -> Option<oneshot::Receiver<DaqError>> {
        self.fatal_rx.take()
    }

    /// Stops the instance. A soft stop drains the correlator buffer and the
    /// sink queues; a hard stop discards both.
    pub async fn stop(self, hard: bool) {
        self.hard_stop.store(hard, Ordering::Relaxed);
        if self.stop_tx.send(true).is_err() {
            warn!("All pipeline tasks already gone at stop");
        }
        if let Err(e) = self.ingest_task.await {
            if !e.is_cancelled() {
                error!("UDP receive loop panicked: {}", e);
            }
        }
        // The receive loop owned the packet sender; the correlator sees the
        // channel close, flushes (or discards) and shuts the sinks down.
        if let Err(e) = self.correlate_task.await {
            if !e.is_cancelled() {
                error!("Correlator task panicked: {}", e);
            }
        }
        let _ = self.control_task.await;
        let _ = self.monitor_task.await;
        info!(
            "Readout assembler stopped after {} readouts",
            self.counters.nconstructed_readouts.load(Ordering::Relaxed)
        );
    }
}
