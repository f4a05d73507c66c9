//! The receiver side of the pipeline: UDP ingestion, readout correlation,
//! control commands and monitoring.

pub mod control;
pub mod correlator;
pub mod monitor;
pub mod protocol;
pub mod server;

use crate::data::N_MODULES;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};

pub use correlator::{CorrelatorConfig, ReadoutCorrelator};
pub use protocol::{derive_module_index, SlowSignalProtocol};
pub use server::{ReadoutAssembler, ReadoutAssemblerHandle};

/// Counters and flags shared between the ingestion path and the
/// control/monitoring loops. Everything here is atomic: the ingestion and
/// correlator tasks write, control and monitoring only read (except for the
/// explicit reset and pause commands).
pub struct ReceiverCounters {
    /// Packets accepted into the ingestion channel.
    pub total_packets: AtomicU64,
    /// Datagrams or blocks dropped at the protocol boundary.
    pub dropped_packets: AtomicU64,
    /// Accepted packets per module slot.
    pub per_module: [AtomicU64; N_MODULES],
    /// Current ingestion channel depth.
    pub queue_depth: AtomicUsize,
    /// Next readout sequence number; starts at 1, resettable via control.
    pub readout_count: AtomicU64,
    /// Total readouts assembled since process start.
    pub nconstructed_readouts: AtomicU64,
    /// Fan-out pause flag (`set_publish_readouts`).
    pub publish_readouts: AtomicBool,
}

impl ReceiverCounters {
    pub fn new() -> Self {
        Self {
            total_packets: AtomicU64::new(0),
            dropped_packets: AtomicU64::new(0),
            per_module: std::array::from_fn(|_| AtomicU64::new(0)),
            queue_depth: AtomicUsize::new(0),
            readout_count: AtomicU64::new(1),
            nconstructed_readouts: AtomicU64::new(0),
            publish_readouts: AtomicBool::new(true),
        }
    }
}

impl Default for ReceiverCounters {
    fn default() -> Self {
        Self::new()
    }
}
