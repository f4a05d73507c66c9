//! Monitoring status records, serialized as JSON on the wire.

use serde::{Deserialize, Serialize};

/// Periodic receiver status, emitted by the monitoring sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorRecord {
    /// Process id of the reporting receiver.
    pub pid: u32,
    /// Instance name of the reporting receiver.
    pub name: String,
    /// Packets per second over the last interval.
    pub data_rate: f64,
    /// Whether any data arrived during the interval.
    pub recv_data: bool,
    /// Wall-clock seconds of the report.
    pub time_s: u64,
    /// Nanosecond remainder of the report time.
    pub time_ns: u64,
}

impl MonitorRecord {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip() {
        let record = MonitorRecord {
            pid: 4242,
            name: "readout_assembler".into(),
            data_rate: 320.5,
            recv_data: true,
            time_s: 1_700_000_000,
            time_ns: 250,
        };
        let decoded = MonitorRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }
}
