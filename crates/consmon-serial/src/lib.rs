//! Serial and pseudo-terminal I/O for console links.
//!
//! Owns the two kinds of file descriptors a link proxy needs: the physical
//! UART (opened non-controlling, non-blocking, raw 8N1 at a configured
//! baud) and a PTY pair whose slave side is published under a stable
//! `/dev/V<prefix><id>` symlink for operator tools.
//!
//! Everything here is blocking-syscall territory; readiness waits go
//! through [`wait_readable`], a thin `poll(2)` wrapper with a timeout.

pub mod error;
pub mod poll;
pub mod pty;
pub mod uart;

pub use error::{Result, SerialError};
pub use poll::wait_readable;
pub use pty::{PtyPair, SymlinkGuard};
pub use uart::{FlowControl, Uart};
