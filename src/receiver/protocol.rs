//! UDP ingestion: turns raw datagrams into validated [`ModulePacket`]s.
//!
//! The receive loop never blocks on a full ingestion channel; the channel is
//! unbounded and a depth gauge warns when it grows past
//! [`QUEUE_DEPTH_WARN`]. All per-packet errors are logged and counted, never
//! propagated; the single fatal case is an out-of-range module index in
//! strict mode, which indicates a miswired network.

use crate::data::{packet, ModulePacket, N_MODULES, READOUT_LENGTH};
use crate::error::{DaqError, DaqResult};
use crate::receiver::ReceiverCounters;
use log::{info, warn};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// Ingestion channel depth above which the receive loop complains.
pub const QUEUE_DEPTH_WARN: usize = 1000;

/// Derives a module slot from the sender address.
///
/// Provisioning convention: module `k` is addressed at `.1{k+1:02}`, so the
/// digits after the last dot are taken modulo 100, minus one. Out-of-range
/// results are folded back in relaxed mode (standalone and simulator
/// setups) and fatal in strict mode.
pub fn derive_module_index(addr: &SocketAddr, relaxed: bool) -> DaqResult<usize> {
    let ip = addr.ip().to_string();
    let last_octet = ip.rsplit('.').next().unwrap_or("");
    let value: i64 = last_octet.parse().map_err(|_| DaqError::Configuration(
        format!("cannot derive module index from sender address {}", ip),
    ))?;
    let index = value % 100 - 1;
    if (0..N_MODULES as i64).contains(&index) {
        Ok(index as usize)
    } else if relaxed {
        Ok(fold_out_of_range(index))
    } else {
        Err(DaqError::ModuleIndexOutOfRange {
            index,
            addr: ip,
            n_modules: N_MODULES,
        })
    }
}

/// Relaxed-mode fold of an out-of-range derived index.
pub fn fold_out_of_range(index: i64) -> usize {
    index.rem_euclid(N_MODULES as i64) as usize
}

/// The UDP receive loop.
pub struct SlowSignalProtocol {
    socket: UdpSocket,
    tx: mpsc::UnboundedSender<ModulePacket>,
    counters: Arc<ReceiverCounters>,
    relaxed_ip_range: bool,
    debug_stream: Option<std::fs::File>,
}

impl SlowSignalProtocol {
    pub async fn bind(
        addr: &str,
        tx: mpsc::UnboundedSender<ModulePacket>,
        counters: Arc<ReceiverCounters>,
        relaxed_ip_range: bool,
        packet_debug_stream_file: Option<&str>,
    ) -> DaqResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Setting up UDP receiver socket at {}", socket.local_addr()?);
        let debug_stream = match packet_debug_stream_file {
            Some(path) => {
                info!("Opening a packet debug stream file at {}", path);
                Some(std::fs::File::create(path)?)
            }
            None => None,
        };
        Ok(Self {
            socket,
            tx,
            counters,
            relaxed_ip_range,
            debug_stream,
        })
    }

    pub fn local_addr(&self) -> DaqResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs until the stop signal fires or a fatal configuration error
    /// surfaces.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> DaqResult<()> {
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    info!("UDP receive loop stopping");
                    return Ok(());
                }
                result = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = result?;
                    self.on_datagram(&buf[..len], addr)?;
                }
            }
        }
    }

    /// Validates one datagram and enqueues its module packets. Returns an
    /// error only for the strict-mode topology failure.
    pub fn on_datagram(&mut self, payload: &[u8], addr: SocketAddr) -> DaqResult<()> {
        if payload.len() % READOUT_LENGTH != 0 {
            warn!(
                "Got unsupported packet size {} from {}, skipping packet",
                payload.len(),
                addr
            );
            self.counters.dropped_packets.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let module = match derive_module_index(&addr, self.relaxed_ip_range) {
            Ok(module) => module,
            Err(e @ DaqError::ModuleIndexOutOfRange { .. }) => {
                // Misconfigured topology; suppressible with relaxed_ip_range.
                return Err(e);
            }
            Err(e) => {
                warn!("Dropping datagram from {}: {}", addr, e);
                self.counters.dropped_packets.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        let arrival = SystemTime::now();
        let n_blocks = payload.len() / READOUT_LENGTH;
        for i in 0..n_blocks {
            let (ts_primary, ts_aux, counts) =
                match packet::decode_block(payload, i * READOUT_LENGTH) {
                    Ok(block) => block,
                    Err(e) => {
                        warn!("Undecodable block {} from {}: {}", i, addr, e);
                        self.counters.dropped_packets.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
            if let Some(stream) = self.debug_stream.as_mut() {
                let arrival_ns = arrival
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                let _ = writeln!(stream, "{}  {}  {}", ts_primary, arrival_ns, module);
            }
            let packet = ModulePacket::new(module, ts_primary, ts_aux, counts, arrival);
            if self.tx.send(packet).is_err() {
                // Correlator is gone; we are shutting down.
                return Ok(());
            }
            self.counters.total_packets.fetch_add(1, Ordering::Relaxed);
            self.counters.per_module[module].fetch_add(1, Ordering::Relaxed);
            let depth = self.counters.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
            if depth > QUEUE_DEPTH_WARN {
                warn!("Ingestion buffer depth {}", depth);
            }
        }
        Ok(())
    }
}
