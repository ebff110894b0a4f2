//! # sbdlink - Store-and-forward messaging over Iridium SBD
//!
//! sbdlink moves small command, telemetry and file messages between an
//! unattended remote station and its control center over Iridium Short Burst
//! Data. The only link is a half-duplex serial modem shared by several station
//! processes.
//!
//! ## Features
//!
//! - **Exclusive Lock**: Crash-safe cross-process ownership of the modem device.
//! - **Modem Driver**: AT command sequencing, signal gating and the MO/MT session state machine.
//! - **Message Codec**: Bit-exact envelope, file meta, part header and acknowledgment formats.
//! - **File Transfer**: Compressed, CRC-checked chunked uploads with on-disk reassembly.
//! - **Exchange Scheduler**: Prioritized spool sources with retention limits and ring-alert polling.
//! - **Inbound Dispatcher**: Routes received messages to the reassembler or command handlers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sbdlink::transfer::{encode_file, Reassembler, TransferOptions};
//!
//! fn main() -> anyhow::Result<()> {
//!     let transfer = encode_file(b"#!/bin/sh\necho hi\n", "/opt/bin/hello.sh", TransferOptions {
//!         execute: true,
//!         remove: false,
//!     })?;
//!
//!     let reassembler = Reassembler::new("spool/staging", "/")?;
//!     for part in &transfer.parts {
//!         // Skip the envelope type byte.
//!         if let Some(ack) = reassembler.process(&part[1..])? {
//!             println!("transfer {} ok={}", ack.serial, ack.contents_ok);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`lockfile`] - Exclusive Lock over the serial device
//! - [`modem`] - Modem Driver and serial link abstraction
//! - [`protocol`] - Message Codec wire formats
//! - [`transfer`] - File Transfer Encoder and Reassembler
//! - [`inbound`] - Inbound Dispatcher
//! - [`exchange`] - Outbound Exchange Scheduler and spool sources
//! - [`transport`] - File-drop boundary to the station message transport
//! - [`config`] - Configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! spool sources ─► Exchange Scheduler ─► Modem Driver ─► satellite
//!                         │                  │
//!                         ▼              Exclusive Lock
//!                    inbound drop
//!                         │
//!                         ▼
//!                 Inbound Dispatcher ─► Reassembler ─► ack spool
//! ```

pub mod config;
pub mod exchange;
pub mod inbound;
pub mod lockfile;
pub mod logutil;
pub mod modem;
pub mod protocol;
pub mod transfer;
pub mod transport;
