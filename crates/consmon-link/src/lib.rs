//! Link orchestration for consmon: the DCE-side proxy workers and
//! supervisor, the per-link liveness state machine, and the DTE-side
//! heartbeat sender.
//!
//! Scheduling is multi-threaded cooperative I/O with blocking syscalls:
//! each link proxy owns two worker threads (UART→PTY and PTY→UART), the
//! supervisor owns the configuration subscription, and one ticker thread
//! drives heartbeat expiry for all links. Every blocking wait is bounded
//! (≤ 1 s) so stop flags are honored promptly.

pub mod config;
pub mod error;
pub mod liveness;
pub mod proxy;
pub mod sender;
pub mod supervisor;

pub use config::{read_udev_prefix, symlink_path, LinkConfig};
pub use error::{LinkError, Result};
pub use liveness::{epoch_secs, Liveness, LivenessRegistry, StatePublisher, StoreStatePublisher};
pub use proxy::LinkProxy;
pub use sender::{parse_console_cmdline, resolve_uart, Sender};
pub use supervisor::Supervisor;

/// Configuration table describing console ports, one entry per link.
pub const CONSOLE_PORT_TABLE: &str = "CONSOLE_PORT";
/// Configuration table holding the per-role enable flags.
pub const CONSOLE_SWITCH_TABLE: &str = "CONSOLE_SWITCH";
/// Entry gating the DCE supervisor.
pub const DCE_SWITCH_ENTRY: &str = "console_mgmt";
/// Entry gating the DTE sender.
pub const DTE_SWITCH_ENTRY: &str = "controlled_device";
/// Enable flag field; the only recognized affirmative value is `"yes"`.
pub const ENABLED_FIELD: &str = "enabled";

/// State fields owned by consmon under `CONSOLE_PORT|<id>`. Everything
/// else at that key belongs to other components and must survive our
/// writes and deletes.
pub const OPER_STATE_FIELD: &str = "oper_state";
pub const LAST_HEARTBEAT_FIELD: &str = "last_heartbeat";

/// Quiescence window for the RX frame filter.
pub const FILTER_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);
/// A link is down once no heartbeat arrived for this long.
pub const HEARTBEAT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);
/// DTE heartbeat emission period.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
/// Granularity of supervisor/ticker/sender control loops.
pub const CONTROL_TICK: std::time::Duration = std::time::Duration::from_secs(1);
