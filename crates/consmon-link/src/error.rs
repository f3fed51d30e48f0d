/// Errors from link orchestration.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// A per-link configuration entry is unusable.
    #[error("bad link configuration: {reason}")]
    Misconfigured { reason: String },

    /// UART or PTY setup failed.
    #[error(transparent)]
    Serial(#[from] consmon_serial::SerialError),

    /// Store access failed.
    #[error(transparent)]
    Db(#[from] consmon_db::DbError),

    /// Frame construction failed.
    #[error(transparent)]
    Frame(#[from] consmon_frame::FrameError),

    /// An I/O error outside the serial layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;
