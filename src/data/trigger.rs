//! Trigger packet codec.
//!
//! Trigger packets share a three-byte header `[magic:u16 = 0xCAFE][type:u8]`
//! followed by a type-specific payload. Decoding dispatches on the type byte
//! with a plain `match`; new packet types add a variant and an arm.

use crate::error::{DaqError, DaqResult};

/// Magic marker every trigger packet starts with (little-endian on the wire).
pub const TRIGGER_MAGIC: u16 = 0xCAFE;

const HEADER_SIZE: usize = 3;
const NOMINAL_TYPE: u8 = 0x1;
const NOMINAL_PAYLOAD_SIZE: usize = 8 + 64 + 3 * 4 + 2 * 2;

/// The nominal trigger packet: full 512-bit trigger pattern plus UC counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NominalTriggerPacket {
    /// Hardware (TACK) timestamp of the trigger.
    pub tack: u64,
    /// Trigger pattern bitmap, one bit per trigger patch.
    pub trigger_pattern: [u8; 64],
    /// UC event counter.
    pub uc_ev: u32,
    /// UC pps counter.
    pub uc_pps: u32,
    /// UC clock counter.
    pub uc_clock: u32,
    /// Trigger type tag.
    pub trigger_type: u16,
}

/// A decoded trigger packet of any known type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerPacket {
    Nominal(NominalTriggerPacket),
}

impl TriggerPacket {
    /// Encodes the packet with its header.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            TriggerPacket::Nominal(p) => {
                let mut buf = Vec::with_capacity(HEADER_SIZE + NOMINAL_PAYLOAD_SIZE);
                buf.extend_from_slice(&TRIGGER_MAGIC.to_le_bytes());
                buf.push(NOMINAL_TYPE);
                buf.extend_from_slice(&p.tack.to_le_bytes());
                buf.extend_from_slice(&p.trigger_pattern);
                buf.extend_from_slice(&p.uc_ev.to_le_bytes());
                buf.extend_from_slice(&p.uc_pps.to_le_bytes());
                buf.extend_from_slice(&p.uc_clock.to_le_bytes());
                buf.extend_from_slice(&p.trigger_type.to_le_bytes());
                buf.extend_from_slice(&0u16.to_le_bytes()); // reserved tail
                buf
            }
        }
    }

    /// Decodes a trigger packet, verifying the magic marker and dispatching
    /// on the type byte.
    pub fn decode(data: &[u8]) -> DaqResult<Self> {
        if data.len() < HEADER_SIZE {
            return Err(DaqError::MalformedRecord(
                "trigger packet shorter than header".into(),
            ));
        }
        let magic = u16::from_le_bytes([data[0], data[1]]);
        if magic != TRIGGER_MAGIC {
            return Err(DaqError::MalformedRecord(format!(
                "trigger magic {:#06x}, expected {:#06x}",
                magic, TRIGGER_MAGIC
            )));
        }
        match data[2] {
            NOMINAL_TYPE => Self::decode_nominal(&data[HEADER_SIZE..]),
            other => Err(DaqError::UnknownRecordType(other)),
        }
    }

    fn decode_nominal(payload: &[u8]) -> DaqResult<Self> {
        if payload.len() < NOMINAL_PAYLOAD_SIZE {
            return Err(DaqError::MalformedRecord(format!(
                "nominal trigger payload needs {} bytes, got {}",
                NOMINAL_PAYLOAD_SIZE,
                payload.len()
            )));
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&payload[..8]);
        let tack = u64::from_le_bytes(word);
        let mut trigger_pattern = [0u8; 64];
        trigger_pattern.copy_from_slice(&payload[8..72]);
        let uc_ev = u32::from_le_bytes([payload[72], payload[73], payload[74], payload[75]]);
        let uc_pps = u32::from_le_bytes([payload[76], payload[77], payload[78], payload[79]]);
        let uc_clock = u32::from_le_bytes([payload[80], payload[81], payload[82], payload[83]]);
        let trigger_type = u16::from_le_bytes([payload[84], payload[85]]);
        Ok(TriggerPacket::Nominal(NominalTriggerPacket {
            tack,
            trigger_pattern,
            uc_ev,
            uc_pps,
            uc_clock,
            trigger_type,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NominalTriggerPacket {
        let mut pattern = [0u8; 64];
        pattern[0] = 0b1010_0001;
        pattern[63] = 0xFF;
        NominalTriggerPacket {
            tack: 987_654_321,
            trigger_pattern: pattern,
            uc_ev: 17,
            uc_pps: 3,
            uc_clock: 123_456,
            trigger_type: 2,
        }
    }

    #[test]
    fn nominal_roundtrip() {
        let packet = TriggerPacket::Nominal(sample());
        let decoded = TriggerPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn wrong_magic_is_malformed() {
        let mut encoded = TriggerPacket::Nominal(sample()).encode();
        encoded[0] = 0xAA;
        let err = TriggerPacket::decode(&encoded).unwrap_err();
        assert!(matches!(err, DaqError::MalformedRecord(_)));
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let mut encoded = TriggerPacket::Nominal(sample()).encode();
        encoded[2] = 0x7F;
        let err = TriggerPacket::decode(&encoded).unwrap_err();
        assert!(matches!(err, DaqError::UnknownRecordType(0x7F)));
    }
}
