use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use consmon_db::Store;
use consmon_frame::Frame;
use consmon_serial::{FlowControl, Uart};
use tracing::{debug, info, warn};

use crate::error::{LinkError, Result};
use crate::{
    CONSOLE_SWITCH_TABLE, CONTROL_TICK, DTE_SWITCH_ENTRY, ENABLED_FIELD, HEARTBEAT_INTERVAL,
};

/// Parse the console UART from kernel command-line contents.
///
/// Recognizes `console=<tty>,<baud>[extras]` and bare `console=<tty>`
/// (baud defaults to 9600). When several `console=` tokens are present
/// the last one wins, matching the kernel's choice of `/dev/console`.
pub fn parse_console_cmdline(cmdline: &str) -> Option<(String, u32)> {
    let mut found = None;
    for token in cmdline.split_whitespace() {
        let Some(value) = token.strip_prefix("console=") else {
            continue;
        };
        let (tty, baud) = match value.split_once(',') {
            Some((tty, rest)) => {
                // Baud may carry a mode suffix, e.g. "9600n8".
                let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
                match digits.parse::<u32>() {
                    Ok(baud) => (tty, baud),
                    Err(_) => (tty, 9600),
                }
            }
            None => (value, 9600),
        };
        if !tty.is_empty() && tty.chars().all(|c| c.is_ascii_alphanumeric()) {
            found = Some((tty.to_string(), baud));
        }
    }
    found
}

/// Resolve the DTE UART from CLI arguments, falling back to
/// `/proc/cmdline`.
pub fn resolve_uart(device: Option<String>, baud: Option<u32>) -> Result<(PathBuf, u32)> {
    if let Some(device) = device {
        let path = if device.starts_with('/') {
            PathBuf::from(device)
        } else {
            PathBuf::from("/dev").join(device)
        };
        return Ok((path, baud.unwrap_or(9600)));
    }

    let cmdline = std::fs::read_to_string("/proc/cmdline").map_err(LinkError::Io)?;
    let (tty, parsed_baud) =
        parse_console_cmdline(&cmdline).ok_or_else(|| LinkError::Misconfigured {
            reason: "no console= parameter in /proc/cmdline and no --device given".to_string(),
        })?;
    Ok((PathBuf::from("/dev").join(tty), baud.unwrap_or(parsed_baud)))
}

/// The DTE-side heartbeat sender.
///
/// When the enable flag is on, emits one heartbeat frame every 5 s with a
/// sequence number wrapping mod 256. The UART is held open only while
/// enabled; flipping the flag off releases the device.
pub struct Sender {
    device: PathBuf,
    baud: u32,
    config_store: Store,
    seq: u8,
}

impl Sender {
    pub fn new(device: PathBuf, baud: u32, config_store: Store) -> Self {
        Self {
            device,
            baud,
            config_store,
            seq: 0,
        }
    }

    fn enabled(&mut self) -> Result<bool> {
        let enabled =
            self.config_store
                .hget(CONSOLE_SWITCH_TABLE, DTE_SWITCH_ENTRY, ENABLED_FIELD)?;
        Ok(enabled.as_deref() == Some("yes"))
    }

    /// Run until the stop flag is set.
    ///
    /// Fails fast when the sender starts enabled and the UART cannot be
    /// opened (the fatal-at-startup case); later open failures are
    /// retried each tick, since an unplugged adapter may come back.
    pub fn run(&mut self, stop: Arc<AtomicBool>) -> Result<()> {
        let subscription = self
            .config_store
            .subscribe(&[format!("{CONSOLE_SWITCH_TABLE}|*")])?;

        let mut enabled = self.enabled()?;
        let mut uart: Option<Uart> = None;
        if enabled {
            uart = Some(Uart::open(&self.device, self.baud, FlowControl::None)?);
            info!(device = %self.device.display(), baud = self.baud, "heartbeat sender enabled");
        } else {
            info!("heartbeat sender disabled");
        }
        let mut next_beat = Instant::now() + HEARTBEAT_INTERVAL;

        while !stop.load(Ordering::SeqCst) {
            if let Some(event) = subscription.poll(CONTROL_TICK) {
                debug!(key = %event.key, op = %event.op, "switch configuration changed");
                let now_enabled = match self.enabled() {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(%err, "cannot read enable flag; keeping previous state");
                        enabled
                    }
                };
                if now_enabled != enabled {
                    enabled = now_enabled;
                    if enabled {
                        info!("heartbeat sender enabled");
                        next_beat = Instant::now() + HEARTBEAT_INTERVAL;
                    } else {
                        info!("heartbeat sender disabled, releasing uart");
                        uart = None;
                    }
                }
            }

            if !enabled {
                continue;
            }

            if uart.is_none() {
                match Uart::open(&self.device, self.baud, FlowControl::None) {
                    Ok(opened) => {
                        info!(device = %self.device.display(), "uart opened");
                        uart = Some(opened);
                    }
                    Err(err) => {
                        warn!(device = %self.device.display(), %err, "uart open failed; retrying");
                        continue;
                    }
                }
            }

            if Instant::now() >= next_beat {
                if let Some(port) = &uart {
                    let wire = Frame::heartbeat(self.seq).build()?;
                    match port.write_all(&wire) {
                        Ok(()) => {
                            debug!(seq = self.seq, "heartbeat sent");
                            self.seq = self.seq.wrapping_add(1);
                        }
                        Err(err) => {
                            warn!(%err, "heartbeat write failed; reopening uart");
                            uart = None;
                        }
                    }
                }
                next_beat = Instant::now() + HEARTBEAT_INTERVAL;
            }
        }

        subscription.shutdown();
        info!("heartbeat sender stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tty_and_baud() {
        assert_eq!(
            parse_console_cmdline("root=/dev/sda1 console=ttyS0,9600"),
            Some(("ttyS0".to_string(), 9600))
        );
    }

    #[test]
    fn last_console_token_wins() {
        assert_eq!(
            parse_console_cmdline("console=tty0 console=ttyS1,115200 quiet"),
            Some(("ttyS1".to_string(), 115200))
        );
    }

    #[test]
    fn mode_suffix_is_ignored() {
        assert_eq!(
            parse_console_cmdline("console=ttyS0,9600n8"),
            Some(("ttyS0".to_string(), 9600))
        );
    }

    #[test]
    fn bare_tty_defaults_to_9600() {
        assert_eq!(
            parse_console_cmdline("console=ttyS2"),
            Some(("ttyS2".to_string(), 9600))
        );
    }

    #[test]
    fn no_console_parameter() {
        assert_eq!(parse_console_cmdline("root=/dev/sda1 quiet splash"), None);
        assert_eq!(parse_console_cmdline(""), None);
    }

    #[test]
    fn malformed_tty_rejected() {
        assert_eq!(parse_console_cmdline("console=../etc,9600"), None);
    }

    #[test]
    fn explicit_device_overrides() {
        let (path, baud) = resolve_uart(Some("ttyUSB0".to_string()), Some(19200)).unwrap();
        assert_eq!(path, PathBuf::from("/dev/ttyUSB0"));
        assert_eq!(baud, 19200);

        let (path, baud) = resolve_uart(Some("/dev/pts/5".to_string()), None).unwrap();
        assert_eq!(path, PathBuf::from("/dev/pts/5"));
        assert_eq!(baud, 9600);
    }
}
