/// Errors that can occur during frame encoding/decoding.
///
/// All of these are recovered locally by the RX pipeline: the offending
/// bytes are dropped and the filter state resets. None of them may ever
/// terminate a proxy.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds the wire format's 24-byte limit.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The body CRC does not match the received trailer.
    #[error("frame CRC mismatch (expected {expected:#06x}, received {received:#06x})")]
    CrcMismatch { expected: u16, received: u16 },

    /// The body is structurally invalid (too short, bad escape, bad length).
    #[error("malformed frame: {reason}")]
    Malformed { reason: &'static str },
}

pub type Result<T> = std::result::Result<T, FrameError>;
