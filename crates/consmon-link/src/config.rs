use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use consmon_serial::FlowControl;
use tracing::warn;

use crate::error::{LinkError, Result};

const DEFAULT_BAUD: u32 = 9600;
const DEFAULT_DEVICE_PREFIX: &str = "C0-";

/// Resolved configuration for one console link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub link_id: String,
    pub device: PathBuf,
    pub baud: u32,
    pub flow: FlowControl,
}

impl LinkConfig {
    /// Build from the fields of a `CONSOLE_PORT|<id>` entry.
    ///
    /// `remote_device` names the UART under `/dev`; when absent the device
    /// follows the platform naming scheme `<prefix><link_id>`. Baud
    /// defaults to 9600; an unparseable baud or flow-control value rejects
    /// the entry rather than silently proxying at the wrong speed.
    pub fn from_fields(
        link_id: &str,
        fields: &HashMap<String, String>,
        device_prefix: &str,
    ) -> Result<Self> {
        let device_name = match fields.get("remote_device") {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{device_prefix}{link_id}"),
        };

        let baud = match fields.get("baud_rate") {
            Some(raw) => raw.parse::<u32>().map_err(|_| LinkError::Misconfigured {
                reason: format!("link {link_id}: invalid baud_rate {raw:?}"),
            })?,
            None => DEFAULT_BAUD,
        };

        let flow = match fields.get("flow_control") {
            Some(raw) => {
                FlowControl::from_str(raw).map_err(|_| LinkError::Misconfigured {
                    reason: format!("link {link_id}: invalid flow_control {raw:?}"),
                })?
            }
            None => FlowControl::None,
        };

        Ok(Self {
            link_id: link_id.to_string(),
            device: Path::new("/dev").join(device_name),
            baud,
            flow,
        })
    }
}

/// Path of the stable operator-facing symlink for a link:
/// `<dev_dir>/V<prefix><link_id>`.
pub fn symlink_path(dev_dir: &Path, prefix: &str, link_id: &str) -> PathBuf {
    dev_dir.join(format!("V{prefix}{link_id}"))
}

/// Read the platform's device-name prefix from `udevprefix.conf`.
///
/// The file holds a single short string (e.g. `C0-`); physical ports are
/// `/dev/<prefix><n>` and our PTY symlinks are `/dev/V<prefix><n>`. Falls
/// back to the conventional prefix when the file is missing.
pub fn read_udev_prefix(platform_dir: &Path) -> String {
    let path = platform_dir.join("udevprefix.conf");
    match std::fs::read_to_string(&path) {
        Ok(raw) => {
            let prefix = raw.lines().next().unwrap_or("").trim().to_string();
            if prefix.is_empty() {
                warn!(path = %path.display(), "empty udevprefix.conf, using default");
                DEFAULT_DEVICE_PREFIX.to_string()
            } else {
                prefix
            }
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "cannot read udevprefix.conf, using default");
            DEFAULT_DEVICE_PREFIX.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn full_entry_parses() {
        let cfg = LinkConfig::from_fields(
            "link1",
            &fields(&[
                ("remote_device", "ttyUSB3"),
                ("baud_rate", "115200"),
                ("flow_control", "rtscts"),
            ]),
            "C0-",
        )
        .unwrap();

        assert_eq!(cfg.device, PathBuf::from("/dev/ttyUSB3"));
        assert_eq!(cfg.baud, 115200);
        assert_eq!(cfg.flow, FlowControl::Hardware);
    }

    #[test]
    fn defaults_apply() {
        let cfg = LinkConfig::from_fields("7", &fields(&[]), "C0-").unwrap();
        assert_eq!(cfg.device, PathBuf::from("/dev/C0-7"));
        assert_eq!(cfg.baud, 9600);
        assert_eq!(cfg.flow, FlowControl::None);
    }

    #[test]
    fn bad_baud_rejected() {
        let err =
            LinkConfig::from_fields("1", &fields(&[("baud_rate", "fast")]), "C0-").unwrap_err();
        assert!(matches!(err, LinkError::Misconfigured { .. }));
    }

    #[test]
    fn bad_flow_control_rejected() {
        let err = LinkConfig::from_fields("1", &fields(&[("flow_control", "psychic")]), "C0-")
            .unwrap_err();
        assert!(matches!(err, LinkError::Misconfigured { .. }));
    }

    #[test]
    fn symlink_path_shape() {
        assert_eq!(
            symlink_path(Path::new("/dev"), "C0-", "3"),
            PathBuf::from("/dev/VC0-3")
        );
    }

    #[test]
    fn udev_prefix_from_file() {
        let dir = std::env::temp_dir().join(format!("consmon-prefix-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("udevprefix.conf"), "CX9-\n").unwrap();
        assert_eq!(read_udev_prefix(&dir), "CX9-");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn udev_prefix_default_when_missing() {
        assert_eq!(read_udev_prefix(Path::new("/nonexistent-platform")), "C0-");
    }
}
