//! The readout correlator: merges per-module packets that share (almost) the
//! same hardware timestamp into camera readouts.
//!
//! The correlator owns a timestamp-ordered deque of partial readouts. A
//! packet either merges into an existing entry whose timestamp lies within
//! `readout_window` ticks, or opens a new entry at the right position. Once
//! the buffer spans more than `buffer_time` ticks, the oldest entry is
//! flushed and assembled regardless of completeness; modules that never
//! arrived stay NaN. Flushing from the front of a sorted deque makes the
//! emitted stream non-decreasing in hardware timestamp.
//!
//! The whole struct is single-writer: exactly one task feeds it packets.
//! Shared observability goes through the atomic [`ReceiverCounters`].

use crate::data::{ModuleBlock, ModulePacket, Readout, N_MODULES};
use crate::receiver::ReceiverCounters;
use log::{info, warn};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

/// Tuning parameters; both time values are in hardware ticks.
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Max timestamp distance for two packets to share a readout.
    pub readout_window: u64,
    /// Minimum buffer span before the oldest entry is flushed. Acts as a
    /// settle delay so stragglers for an old readout can still arrive.
    pub buffer_time: u64,
    /// Hard cap on buffered partial readouts.
    pub buffer_length: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            readout_window: 100_000,
            buffer_time: 10_000_000_000,
            buffer_length: 1000,
        }
    }
}

/// An in-progress readout accumulator.
struct PartialReadout {
    hw_timestamp: u64,
    per_module: [Option<ModuleBlock>; N_MODULES],
    n_received: usize,
    min_arrival: SystemTime,
    sequence_id: u64,
}

impl PartialReadout {
    fn new(packet: &ModulePacket, sequence_id: u64) -> Self {
        let mut per_module: [Option<ModuleBlock>; N_MODULES] = [None; N_MODULES];
        per_module[packet.module] = Some(packet.counts);
        Self {
            hw_timestamp: packet.hw_timestamp,
            per_module,
            n_received: 1,
            min_arrival: packet.arrival,
            sequence_id,
        }
    }

    fn has_module(&self, module: usize) -> bool {
        self.per_module[module].is_some()
    }

    fn add_part(&mut self, packet: &ModulePacket) {
        self.per_module[packet.module] = Some(packet.counts);
        self.n_received += 1;
        self.min_arrival = self.min_arrival.min(packet.arrival);
    }
}

pub struct ReadoutCorrelator {
    config: CorrelatorConfig,
    buffer: VecDeque<PartialReadout>,
    counters: Arc<ReceiverCounters>,
    next_sequence_id: u64,
    /// Per-module participation counts, correlator-local.
    readout_counter: [u64; N_MODULES],
}

impl ReadoutCorrelator {
    pub fn new(config: CorrelatorConfig, counters: Arc<ReceiverCounters>) -> Self {
        let capacity = config.buffer_length.min(4096);
        Self {
            config,
            buffer: VecDeque::with_capacity(capacity),
            counters,
            next_sequence_id: 0,
            readout_counter: [0; N_MODULES],
        }
    }

    /// Partial readouts currently buffered.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Participation count for one module slot.
    pub fn module_participation(&self, module: usize) -> u64 {
        self.readout_counter[module]
    }

    fn new_partial(&mut self, packet: &ModulePacket) -> PartialReadout {
        self.next_sequence_id += 1;
        PartialReadout::new(packet, self.next_sequence_id)
    }

    /// Feeds one packet in, returning any readouts that became due.
    pub fn process_packet(&mut self, packet: ModulePacket) -> Vec<Readout> {
        if self.buffer.is_empty() {
            let partial = self.new_partial(&packet);
            self.buffer.push_back(partial);
            return Vec::new();
        }

        let window = self.config.readout_window as i128;
        let tail = self
            .buffer
            .back()
            .map(|p| (p.hw_timestamp, p.has_module(packet.module)));
        if let Some((tail_ts, tail_has)) = tail {
            let dt = tail_ts as i128 - packet.hw_timestamp as i128;
            if dt.abs() < window {
                if tail_has {
                    warn!(
                        "Duplicate packet for module {} at timestamp {} (dt {} ticks), dropping",
                        packet.module, packet.hw_timestamp, dt
                    );
                } else if let Some(back) = self.buffer.back_mut() {
                    back.add_part(&packet);
                }
            } else if dt < 0 {
                let partial = self.new_partial(&packet);
                self.buffer.push_back(partial);
            } else {
                self.place_out_of_order(packet);
            }
        }

        self.evict_over_capacity();
        self.flush_due()
    }

    /// Backward scan for a packet that is older than the tail (or a
    /// duplicate for the tail itself).
    fn place_out_of_order(&mut self, packet: ModulePacket) {
        let window = self.config.readout_window as i128;
        for i in (0..self.buffer.len()).rev() {
            let entry_ts = self.buffer[i].hw_timestamp;
            let dt = entry_ts as i128 - packet.hw_timestamp as i128;
            if dt.abs() < window {
                if self.buffer[i].has_module(packet.module) {
                    // First writer wins; numeric data is never overwritten.
                    warn!(
                        "Duplicate packet for module {} at timestamp {} (dt {} ticks), dropping",
                        packet.module, packet.hw_timestamp, dt
                    );
                } else {
                    self.buffer[i].add_part(&packet);
                }
                return;
            }
            if dt < 0 {
                // Newer than entry i but older than i+1: positional insert
                // keeps the deque sorted by timestamp.
                let partial = self.new_partial(&packet);
                self.buffer.insert(i + 1, partial);
                return;
            }
        }
        // Older than everything buffered.
        let partial = self.new_partial(&packet);
        self.buffer.push_front(partial);
    }

    fn evict_over_capacity(&mut self) {
        while self.buffer.len() > self.config.buffer_length {
            if let Some(evicted) = self.buffer.pop_front() {
                warn!(
                    "Partial readout buffer over capacity; evicting entry {} at timestamp {} with {} modules",
                    evicted.sequence_id, evicted.hw_timestamp, evicted.n_received
                );
            }
        }
    }

    fn flush_due(&mut self) -> Vec<Readout> {
        let mut out = Vec::new();
        loop {
            let span = match (self.buffer.front(), self.buffer.back()) {
                (Some(front), Some(back)) => back.hw_timestamp - front.hw_timestamp,
                _ => break,
            };
            if span <= self.config.buffer_time {
                break;
            }
            if let Some(partial) = self.buffer.pop_front() {
                out.push(self.assemble(partial));
            }
        }
        out
    }

    /// Flushes everything still buffered, oldest first. Used at shutdown.
    pub fn drain(&mut self) -> Vec<Readout> {
        let mut out = Vec::new();
        while let Some(partial) = self.buffer.pop_front() {
            out.push(self.assemble(partial));
        }
        out
    }

    /// Builds the immutable readout from a partial: amplitude conversion per
    /// contributing module, NaN rows elsewhere, wall clock from the minimum
    /// arrival instant among the merged packets.
    fn assemble(&mut self, partial: PartialReadout) -> Readout {
        let iro = self.counters.readout_count.fetch_add(1, Ordering::Relaxed);
        let (cpu_t_s, cpu_t_ns) = match partial.min_arrival.duration_since(SystemTime::UNIX_EPOCH)
        {
            Ok(d) => (d.as_secs(), d.subsec_nanos() as u64),
            Err(_) => (0, 0),
        };
        let mut readout = Readout::new(iro, partial.hw_timestamp, cpu_t_s, cpu_t_ns);
        for (module, block) in partial.per_module.iter().enumerate() {
            if let Some(counts) = block {
                let mut row = [0.0f64; crate::data::N_CHANNELS];
                for (out, count) in row.iter_mut().zip(counts.iter()) {
                    *out = crate::data::counts_to_mv(*count);
                }
                readout.data[module] = row;
                self.readout_counter[module] += 1;
            }
        }

        let built = self
            .counters
            .nconstructed_readouts
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if built % 10 == 0 {
            let span = match (self.buffer.front(), self.buffer.back()) {
                (Some(front), Some(back)) => back.hw_timestamp - front.hw_timestamp,
                _ => 0,
            };
            info!(
                "Built readout {} (buffer length {}, span {} ticks)",
                built,
                self.buffer.len(),
                span
            );
        }
        readout
    }
}
