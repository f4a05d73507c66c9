//! # Slow-Signal DAQ Library
//!
//! Core library of the `ssdaq` application: readout assembly for a
//! slow-signal camera. Hardware modules push channel samples over UDP; this
//! crate correlates the per-module packets into camera-wide readouts by
//! hardware timestamp and fans the assembled records out to network
//! subscribers and raw files.
//!
//! ## Crate Structure
//!
//! - **`config`**: YAML deployment configuration, `config::Settings`.
//! - **`data`**: The record types and their byte-exact wire formats: module
//!   packets, assembled readouts, trigger packets and monitoring records.
//! - **`error`**: The crate-wide `DaqError` enum.
//! - **`io`**: The framed raw-object file format (plain and compressed
//!   bunched layouts) with random access and corruption isolation.
//! - **`net`**: TCP pub/sub transport: publish sinks, the serialize-once
//!   fan-out and subscriber clients.
//! - **`receiver`**: The running pipeline: UDP ingestion, the readout
//!   correlator, control channel and monitoring sender, wired together by
//!   `receiver::ReadoutAssembler`.

pub mod config;
pub mod data;
pub mod error;
pub mod io;
pub mod net;
pub mod receiver;

pub use error::{DaqError, DaqResult};
