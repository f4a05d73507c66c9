//! Data records and their wire codecs.
//!
//! All encode/decode functions in this module are pure: deterministic,
//! side-effect free, and allocating nothing beyond the returned buffer.
//! Byte orders are part of the hardware contract and must not be changed:
//! module data packets are big-endian (hardware order) while readout records
//! are little-endian (file/pub-sub order).

pub mod monitor;
pub mod packet;
pub mod readout;
pub mod trigger;

/// Number of hardware modules contributing to a camera readout.
pub const N_MODULES: usize = 32;
/// Number of channels per module.
pub const N_CHANNELS: usize = 64;
/// Total channels in one assembled readout.
pub const N_CAM_CHANNELS: usize = N_MODULES * N_CHANNELS;
/// Size in bytes of one module data block: 64 2-byte channel counts and two
/// 8-byte timestamps.
pub const READOUT_LENGTH: usize = N_CHANNELS * 2 + 2 * 8;

pub use monitor::MonitorRecord;
pub use packet::{counts_to_mv, ModuleBlock, ModulePacket};
pub use readout::Readout;
pub use trigger::{NominalTriggerPacket, TriggerPacket, TRIGGER_MAGIC};
