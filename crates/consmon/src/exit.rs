use std::fmt;

use consmon_db::DbError;
use consmon_link::LinkError;
use consmon_serial::SerialError;

/// Exit codes of the process surface: the service manager restarts on 3,
/// treats 2 as "fix the config first", and 0 as a clean stop.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const MISCONFIG: i32 = 2;
pub const IO_FATAL: i32 = 3;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn db_error(context: &str, err: DbError) -> CliError {
    // Every store-layer failure at the CLI boundary is a configuration
    // problem: bad topology file, unknown database, or an unreachable
    // store at startup.
    CliError::new(MISCONFIG, format!("{context}: {err}"))
}

pub fn serial_error(context: &str, err: SerialError) -> CliError {
    let code = match err {
        SerialError::UnsupportedBaud { .. } | SerialError::UnsupportedFlowControl { .. } => {
            MISCONFIG
        }
        _ => IO_FATAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn link_error(context: &str, err: LinkError) -> CliError {
    match err {
        LinkError::Misconfigured { .. } => CliError::new(MISCONFIG, format!("{context}: {err}")),
        LinkError::Db(err) => db_error(context, err),
        LinkError::Serial(err) => serial_error(context, err),
        LinkError::Io(_) => CliError::new(IO_FATAL, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}
