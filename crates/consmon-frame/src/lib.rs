//! Byte-stuffed heartbeat framing for serial console links.
//!
//! This is the core value-add layer of consmon. Heartbeat frames share the
//! wire with arbitrary terminal traffic, so the codec is built to survive
//! mid-stream reader entry, partial reads, and single-byte corruption:
//! - A triple `SOF`/`EOF` delimiter pair around every frame
//! - DLE byte-stuffing so delimiter bytes inside the body stay inert
//! - CRC-16/MODBUS over the unstuffed body
//!
//! [`FrameFilter`] consumes the raw RX stream one byte at a time and
//! separates it into user bytes (forwarded untouched) and decoded frames.
//! No buffering to EOF, no heap beyond the 64-byte frame window.

pub mod codec;
pub mod crc;
pub mod error;
pub mod filter;

pub use codec::{stuff, unstuff, Frame, FrameType, MAX_PAYLOAD, PROTOCOL_VERSION};
pub use crc::crc16;
pub use error::{FrameError, Result};
pub use filter::{FilterEvent, FilterStats, FrameFilter};

/// Start-of-frame delimiter byte.
pub const SOF: u8 = 0x01;
/// End-of-frame delimiter byte.
pub const EOF: u8 = 0x1B;
/// Data link escape: prefixes any delimiter byte occurring inside a body.
pub const DLE: u8 = 0x10;

/// Delimiter repetition count on the wire (`SOF SOF SOF … EOF EOF EOF`).
pub const DELIMITER_LEN: usize = 3;

/// Maximum stuffed body size between the outer delimiters. Also the frame
/// filter's accumulation window.
pub const MAX_BODY: usize = 64;

/// Minimum body size: 5 header bytes plus the 2-byte CRC.
pub const MIN_BODY: usize = 7;
