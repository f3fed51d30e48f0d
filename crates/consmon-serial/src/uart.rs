use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::libc;
use nix::sys::termios::{
    cfsetispeed, cfsetospeed, tcflush, tcgetattr, tcsetattr, BaudRate, ControlFlags, FlushArg,
    InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices,
};
use tracing::info;

use crate::error::{Result, SerialError};

/// Flow-control setting for a UART.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    #[default]
    None,
    /// XON/XOFF in-band flow control.
    Software,
    /// RTS/CTS hardware flow control.
    Hardware,
}

impl FromStr for FlowControl {
    type Err = SerialError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" | "off" | "no" => Ok(FlowControl::None),
            "software" | "xon" | "xonxoff" | "xon-xoff" => Ok(FlowControl::Software),
            "hardware" | "rtscts" | "rts-cts" | "rts/cts" => Ok(FlowControl::Hardware),
            other => Err(SerialError::UnsupportedFlowControl {
                value: other.to_string(),
            }),
        }
    }
}

/// Map a numeric baud rate onto the termios constant.
///
/// The allow-list mirrors what the console hardware is deployed with;
/// anything else is a configuration error, not a fallback to a default.
pub fn baud_rate(baud: u32) -> Result<BaudRate> {
    match baud {
        1200 => Ok(BaudRate::B1200),
        2400 => Ok(BaudRate::B2400),
        4800 => Ok(BaudRate::B4800),
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        _ => Err(SerialError::UnsupportedBaud { baud }),
    }
}

/// Put an open terminal fd into raw mode: 8N1, no canonical processing,
/// no echo, no input/output mapping, VMIN=0/VTIME=0, at the given speed.
pub(crate) fn configure_raw(
    fd: BorrowedFd<'_>,
    path: &Path,
    speed: BaudRate,
    flow: FlowControl,
) -> Result<()> {
    let configure = |fd: BorrowedFd<'_>| -> nix::Result<()> {
        let mut tio = tcgetattr(fd)?;

        tio.input_flags &= !(InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON);
        tio.output_flags &= !OutputFlags::OPOST;
        tio.control_flags &= !(ControlFlags::CSIZE | ControlFlags::PARENB);
        tio.control_flags |= ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;
        tio.local_flags &= !(LocalFlags::ECHO
            | LocalFlags::ECHONL
            | LocalFlags::ICANON
            | LocalFlags::ISIG
            | LocalFlags::IEXTEN);

        match flow {
            FlowControl::None => {}
            FlowControl::Software => {
                tio.input_flags |= InputFlags::IXON | InputFlags::IXOFF;
            }
            FlowControl::Hardware => {
                tio.control_flags |= ControlFlags::CRTSCTS;
            }
        }

        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        cfsetispeed(&mut tio, speed)?;
        cfsetospeed(&mut tio, speed)?;
        tcsetattr(fd, SetArg::TCSANOW, &tio)?;
        tcflush(fd, FlushArg::TCIOFLUSH)?;
        Ok(())
    };

    configure(fd).map_err(|source| SerialError::Configure {
        path: path.to_path_buf(),
        source,
    })
}

/// An exclusive handle on a raw-configured UART.
///
/// Opened read/write, non-controlling, non-blocking. Each descriptor is
/// owned by exactly one link proxy; there is no sharing across links.
pub struct Uart {
    file: File,
    path: PathBuf,
}

impl Uart {
    /// Open and raw-configure `/dev/...` at the given baud.
    pub fn open(path: impl AsRef<Path>, baud: u32, flow: FlowControl) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let speed = baud_rate(baud)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(&path)
            .map_err(|source| SerialError::Open {
                path: path.clone(),
                source,
            })?;

        configure_raw(file.as_fd(), &path, speed, flow)?;
        info!(path = %path.display(), baud, ?flow, "uart opened");

        Ok(Self { file, path })
    }

    /// Non-blocking read; `Ok(0)` means no data or hangup.
    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&self.file).read(buf)
    }

    /// Non-blocking write; may be short.
    pub fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        (&self.file).write(buf)
    }

    /// Write the whole buffer, retrying short writes and transient errors
    /// until it is sent or the device returns a fatal error.
    pub fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        let mut offset = 0usize;
        while offset < buf.len() {
            match (&self.file).write(&buf[offset..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "uart accepted no bytes",
                    ))
                }
                Ok(n) => offset += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Uart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uart").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_allow_list() {
        for baud in [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200] {
            assert!(baud_rate(baud).is_ok(), "baud {baud} should map");
        }
        assert!(matches!(
            baud_rate(31337),
            Err(SerialError::UnsupportedBaud { baud: 31337 })
        ));
        assert!(matches!(baud_rate(0), Err(SerialError::UnsupportedBaud { .. })));
    }

    #[test]
    fn flow_control_parsing() {
        assert_eq!("none".parse::<FlowControl>().unwrap(), FlowControl::None);
        assert_eq!("".parse::<FlowControl>().unwrap(), FlowControl::None);
        assert_eq!(
            "rtscts".parse::<FlowControl>().unwrap(),
            FlowControl::Hardware
        );
        assert_eq!(
            "XonXoff".parse::<FlowControl>().unwrap(),
            FlowControl::Software
        );
        assert!(matches!(
            "fancy".parse::<FlowControl>(),
            Err(SerialError::UnsupportedFlowControl { .. })
        ));
    }

    #[test]
    fn open_missing_device_reports_path() {
        let err = Uart::open("/dev/consmon-does-not-exist", 9600, FlowControl::None).unwrap_err();
        match err {
            SerialError::Open { path, .. } => {
                assert_eq!(path, PathBuf::from("/dev/consmon-does-not-exist"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn open_pty_slave_as_uart() {
        // A PTY slave behaves like a serial device; this is also how the
        // integration tests stand in for real hardware.
        let pair = crate::pty::PtyPair::open(9600).unwrap();
        let uart = Uart::open(pair.slave_path(), 115200, FlowControl::None).unwrap();

        pair.master_write(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let mut got = 0;
        for _ in 0..100 {
            match uart.read(&mut buf[got..]) {
                Ok(0) => std::thread::sleep(std::time::Duration::from_millis(5)),
                Ok(n) => {
                    got += n;
                    if got >= 4 {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(&buf[..4], b"ping");
    }
}
