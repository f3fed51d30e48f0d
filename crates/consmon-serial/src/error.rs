use std::path::PathBuf;

/// Errors from UART and PTY plumbing.
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    /// Failed to open the device node.
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to apply termios settings.
    #[error("failed to configure {path}: {source}")]
    Configure {
        path: PathBuf,
        source: nix::Error,
    },

    /// The configured baud rate is not in the supported set.
    #[error("unsupported baud rate {baud}")]
    UnsupportedBaud { baud: u32 },

    /// The flow-control setting could not be parsed.
    #[error("unsupported flow control setting {value:?}")]
    UnsupportedFlowControl { value: String },

    /// Pseudo-terminal allocation failed.
    #[error("failed to allocate pty: {0}")]
    Pty(nix::Error),

    /// Creating or replacing the stable symlink failed.
    #[error("failed to publish symlink {path}: {source}")]
    Symlink {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An I/O error on an already-open descriptor.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
