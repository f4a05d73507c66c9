//! The assembled camera readout record and its wire format.

use crate::data::{N_CAM_CHANNELS, N_CHANNELS, N_MODULES};
use crate::error::{DaqError, DaqResult};

/// Size in bytes of an encoded readout: four u64 header words plus the
/// 32x64 float64 amplitude matrix.
pub const READOUT_WIRE_SIZE: usize = 4 * 8 + N_CAM_CHANNELS * 8;

/// One assembled, timestamp-aligned snapshot across all participating
/// modules. Immutable once built; modules that did not contribute are rows
/// of NaN.
#[derive(Debug, Clone)]
pub struct Readout {
    /// Readout sequence number (monotonic, resettable via control command).
    pub iro: u64,
    /// Hardware (TACK) timestamp the contributing packets matched on.
    pub time: u64,
    /// Wall-clock seconds assigned at assembly time.
    pub cpu_t_s: u64,
    /// Wall-clock nanosecond remainder.
    pub cpu_t_ns: u64,
    /// Amplitudes in millivolts, row per module.
    pub data: Vec<[f64; N_CHANNELS]>,
}

impl Readout {
    /// Creates an empty readout with every channel set to NaN.
    pub fn new(iro: u64, time: u64, cpu_t_s: u64, cpu_t_ns: u64) -> Self {
        Self {
            iro,
            time,
            cpu_t_s,
            cpu_t_ns,
            data: vec![[f64::NAN; N_CHANNELS]; N_MODULES],
        }
    }

    /// Wall-clock timestamp as fractional seconds.
    pub fn cpu_t(&self) -> f64 {
        self.cpu_t_s as f64 + self.cpu_t_ns as f64 * 1e-9
    }

    /// Number of modules that contributed data (rows with no NaN).
    pub fn n_contributing(&self) -> usize {
        self.data
            .iter()
            .filter(|row| row.iter().all(|v| !v.is_nan()))
            .count()
    }

    /// Encodes the readout into its wire format:
    /// `[iro:u64][time:u64][cpu_t_s:u64][cpu_t_ns:u64][2048 x f64]`,
    /// all little-endian, row-major, no padding.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(READOUT_WIRE_SIZE);
        buf.extend_from_slice(&self.iro.to_le_bytes());
        buf.extend_from_slice(&self.time.to_le_bytes());
        buf.extend_from_slice(&self.cpu_t_s.to_le_bytes());
        buf.extend_from_slice(&self.cpu_t_ns.to_le_bytes());
        for row in &self.data {
            for value in row {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        buf
    }

    /// Decodes a readout from its wire format. NaN bit patterns survive the
    /// trip unchanged.
    pub fn decode(data: &[u8]) -> DaqResult<Self> {
        if data.len() < READOUT_WIRE_SIZE {
            return Err(DaqError::MalformedRecord(format!(
                "readout record needs {} bytes, got {}",
                READOUT_WIRE_SIZE,
                data.len()
            )));
        }
        let mut word = [0u8; 8];
        let mut read_u64 = |offset: usize| {
            word.copy_from_slice(&data[offset..offset + 8]);
            u64::from_le_bytes(word)
        };
        let iro = read_u64(0);
        let time = read_u64(8);
        let cpu_t_s = read_u64(16);
        let cpu_t_ns = read_u64(24);

        let mut rows = Vec::with_capacity(N_MODULES);
        let mut offset = 32;
        for _ in 0..N_MODULES {
            let mut row = [0.0f64; N_CHANNELS];
            for value in row.iter_mut() {
                let mut fw = [0u8; 8];
                fw.copy_from_slice(&data[offset..offset + 8]);
                *value = f64::from_le_bytes(fw);
                offset += 8;
            }
            rows.push(row);
        }

        Ok(Self {
            iro,
            time,
            cpu_t_s,
            cpu_t_ns,
            data: rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_fields_and_nan_placement() {
        let mut readout = Readout::new(7, 123_456_789, 1_700_000_000, 42);
        readout.data[3] = [1.5; N_CHANNELS];
        readout.data[31][0] = -0.25;

        let encoded = readout.encode();
        assert_eq!(encoded.len(), READOUT_WIRE_SIZE);
        let decoded = Readout::decode(&encoded).unwrap();

        assert_eq!(decoded.iro, readout.iro);
        assert_eq!(decoded.time, readout.time);
        assert_eq!(decoded.cpu_t_s, readout.cpu_t_s);
        assert_eq!(decoded.cpu_t_ns, readout.cpu_t_ns);
        for (a, b) in decoded.data.iter().zip(readout.data.iter()) {
            for (x, y) in a.iter().zip(b.iter()) {
                assert_eq!(x.to_bits(), y.to_bits());
            }
        }
        assert!(decoded.data[0][0].is_nan());
        assert_eq!(decoded.data[31][0], -0.25);
    }

    #[test]
    fn short_buffer_is_malformed() {
        let err = Readout::decode(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, DaqError::MalformedRecord(_)));
    }

    #[test]
    fn contributing_module_count() {
        let mut readout = Readout::new(1, 0, 0, 0);
        assert_eq!(readout.n_contributing(), 0);
        readout.data[5] = [0.0; N_CHANNELS];
        assert_eq!(readout.n_contributing(), 1);
    }
}
