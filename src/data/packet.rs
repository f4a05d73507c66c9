//! Module data packets: the hardware-side wire format.
//!
//! Each UDP datagram from a module carries one or more 144-byte blocks in
//! hardware byte order (big-endian): `[hw_ts_primary:u64][32 x u16]
//! [hw_ts_aux:u64][32 x u16]`. This intentionally differs from the
//! little-endian readout format and must be preserved exactly.

use crate::data::{N_CHANNELS, READOUT_LENGTH};
use crate::error::{DaqError, DaqResult};
use std::time::SystemTime;

/// Raw channel counts of one module block, primary group first.
pub type ModuleBlock = [u16; N_CHANNELS];

/// One module's contribution to a readout, normalized from a datagram and
/// consumed exactly once by the correlator.
#[derive(Debug, Clone)]
pub struct ModulePacket {
    /// Module slot, already validated against the camera size.
    pub module: usize,
    /// Primary hardware (TACK) timestamp, the correlation key.
    pub hw_timestamp: u64,
    /// Auxiliary hardware timestamp of the second channel group.
    pub hw_timestamp_aux: u64,
    /// 64 raw channel counts: primary group in 0..32, aux group in 32..64.
    pub counts: ModuleBlock,
    /// Wall-clock arrival instant. Used for monitoring and the assembled
    /// readout's cpu timestamp, never for correlation.
    pub arrival: SystemTime,
}

/// Converts a raw channel count to millivolts.
///
/// The hardware emits a biased 15-bit ADC value: counts below 0x8000 gain
/// the sign bit, counts at or above it are masked down to 15 bits. The
/// reconstructed value is scaled by 0.03815 * 2.0. Documented quirk, not
/// configurable.
pub fn counts_to_mv(count: u16) -> f64 {
    let adc = if count < 0x8000 {
        count as u32 + 0x8000
    } else {
        (count & 0x7FFF) as u32
    };
    adc as f64 * 0.03815 * 2.0
}

/// Decodes one big-endian 144-byte module block starting at `offset`.
pub fn decode_block(data: &[u8], offset: usize) -> DaqResult<(u64, u64, ModuleBlock)> {
    if data.len() < offset + READOUT_LENGTH {
        return Err(DaqError::MalformedRecord(format!(
            "module block needs {} bytes at offset {}, got {}",
            READOUT_LENGTH,
            offset,
            data.len()
        )));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&data[offset..offset + 8]);
    let ts_primary = u64::from_be_bytes(word);
    word.copy_from_slice(&data[offset + 72..offset + 80]);
    let ts_aux = u64::from_be_bytes(word);

    let mut counts = [0u16; N_CHANNELS];
    for (i, count) in counts.iter_mut().take(32).enumerate() {
        let pos = offset + 8 + i * 2;
        *count = u16::from_be_bytes([data[pos], data[pos + 1]]);
    }
    for (i, count) in counts.iter_mut().skip(32).enumerate() {
        let pos = offset + 80 + i * 2;
        *count = u16::from_be_bytes([data[pos], data[pos + 1]]);
    }
    Ok((ts_primary, ts_aux, counts))
}

/// Encodes one module block in hardware byte order. The inverse of
/// [`decode_block`]; used by tests and simulators.
pub fn encode_block(ts_primary: u64, ts_aux: u64, counts: &ModuleBlock) -> Vec<u8> {
    let mut buf = Vec::with_capacity(READOUT_LENGTH);
    buf.extend_from_slice(&ts_primary.to_be_bytes());
    for count in &counts[..32] {
        buf.extend_from_slice(&count.to_be_bytes());
    }
    buf.extend_from_slice(&ts_aux.to_be_bytes());
    for count in &counts[32..] {
        buf.extend_from_slice(&count.to_be_bytes());
    }
    buf
}

impl ModulePacket {
    /// Builds a packet from a decoded block.
    pub fn new(
        module: usize,
        ts_primary: u64,
        ts_aux: u64,
        counts: ModuleBlock,
        arrival: SystemTime,
    ) -> Self {
        Self {
            module,
            hw_timestamp: ts_primary,
            hw_timestamp_aux: ts_aux,
            counts,
            arrival,
        }
    }

    /// Applies the amplitude conversion to every channel, keeping the
    /// primary-then-aux channel layout of the readout row.
    pub fn amplitudes_mv(&self) -> [f64; N_CHANNELS] {
        let mut row = [0.0f64; N_CHANNELS];
        for (out, count) in row.iter_mut().zip(self.counts.iter()) {
            *out = counts_to_mv(*count);
        }
        row
    }
}
