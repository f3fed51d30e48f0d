use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};

use nix::libc;
use nix::pty::openpty;
use tracing::{debug, info};

use crate::error::{Result, SerialError};
use crate::uart::{baud_rate, configure_raw, FlowControl};

/// A pseudo-terminal pair backing one console link.
///
/// The master side stays with the proxy; the slave side is what operator
/// tools open (via the published symlink). The slave fd is kept open for
/// the lifetime of the pair so the master does not see a hangup whenever
/// the last external opener disconnects.
pub struct PtyPair {
    master: File,
    slave: File,
    slave_path: PathBuf,
}

impl PtyPair {
    /// Allocate a PTY pair and put both ends into raw mode at `baud`, so
    /// tools opening the slave observe a conventional serial device.
    pub fn open(baud: u32) -> Result<Self> {
        let speed = baud_rate(baud)?;
        let pty = openpty(None, None).map_err(SerialError::Pty)?;

        let slave_path = nix::unistd::ttyname(pty.slave.as_fd()).map_err(SerialError::Pty)?;

        configure_raw(pty.master.as_fd(), &slave_path, speed, FlowControl::None)?;
        configure_raw(pty.slave.as_fd(), &slave_path, speed, FlowControl::None)?;
        set_nonblocking(pty.master.as_fd());

        debug!(slave = %slave_path.display(), "pty pair allocated");

        Ok(Self {
            master: File::from(pty.master),
            slave: File::from(pty.slave),
            slave_path,
        })
    }

    /// Path of the slave device node (`/dev/pts/N`).
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    pub fn master_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Non-blocking read from the master (bytes typed into the slave).
    pub fn master_read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&self.master).read(buf)
    }

    /// Non-blocking write to the master (bytes the slave will read).
    pub fn master_write(&self, buf: &[u8]) -> std::io::Result<usize> {
        (&self.master).write(buf)
    }

    /// Write on the slave end. Only exercised by tests; external tools
    /// normally open the slave through the symlink.
    pub fn slave_write(&self, buf: &[u8]) -> std::io::Result<usize> {
        (&self.slave).write(buf)
    }

    /// Read on the slave end.
    pub fn slave_read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&self.slave).read(buf)
    }
}

impl std::fmt::Debug for PtyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyPair")
            .field("slave", &self.slave_path)
            .finish()
    }
}

fn set_nonblocking(fd: BorrowedFd<'_>) {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is an open descriptor owned by the calling PtyPair;
    // F_GETFL/F_SETFL neither retain the fd nor touch memory.
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// A published `/dev/V<prefix><id>` symlink, removed again on drop.
///
/// Creation goes through a temporary sibling name plus `rename`, so a
/// concurrent opener never observes a missing link during restart. Removal
/// checks that the link still points at our target first; a link replaced
/// by a newer proxy instance is left alone.
pub struct SymlinkGuard {
    link: PathBuf,
    target: PathBuf,
}

impl SymlinkGuard {
    pub fn create(link: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Result<Self> {
        let link = link.into();
        let target = target.into();

        let file_name = link
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = link.with_file_name(format!(".{}.tmp.{}", file_name, std::process::id()));

        let publish = || -> std::io::Result<()> {
            if tmp.symlink_metadata().is_ok() {
                std::fs::remove_file(&tmp)?;
            }
            std::os::unix::fs::symlink(&target, &tmp)?;
            std::fs::rename(&tmp, &link)
        };
        publish().map_err(|source| SerialError::Symlink {
            path: link.clone(),
            source,
        })?;

        info!(link = %link.display(), target = %target.display(), "symlink published");
        Ok(Self { link, target })
    }

    pub fn path(&self) -> &Path {
        &self.link
    }
}

impl Drop for SymlinkGuard {
    fn drop(&mut self) {
        match std::fs::read_link(&self.link) {
            Ok(current) if current == self.target => {
                debug!(link = %self.link.display(), "removing symlink");
                let _ = std::fs::remove_file(&self.link);
            }
            Ok(_) => {
                debug!(
                    link = %self.link.display(),
                    "symlink target changed; skipping cleanup"
                );
            }
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("consmon-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn pty_roundtrip_master_to_slave() {
        let pair = PtyPair::open(9600).unwrap();
        assert!(pair.slave_path().exists());

        pair.master_write(b"hello").unwrap();
        let mut buf = [0u8; 8];
        let mut got = 0;
        for _ in 0..100 {
            match pair.slave_read(&mut buf[got..]) {
                Ok(0) => std::thread::sleep(std::time::Duration::from_millis(5)),
                Ok(n) => {
                    got += n;
                    if got >= 5 {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("slave read failed: {e}"),
            }
        }
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn symlink_created_and_removed() {
        let dir = temp_dir("symlink");
        let target = dir.join("target");
        std::fs::write(&target, b"t").unwrap();
        let link = dir.join("Vconsole-1");

        let guard = SymlinkGuard::create(&link, &target).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), target);

        drop(guard);
        assert!(
            link.symlink_metadata().is_err(),
            "symlink should be removed on drop"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn symlink_replaces_existing_atomically() {
        let dir = temp_dir("symlink-replace");
        let old_target = dir.join("old");
        let new_target = dir.join("new");
        std::fs::write(&old_target, b"o").unwrap();
        std::fs::write(&new_target, b"n").unwrap();
        let link = dir.join("Vconsole-2");

        let _old = SymlinkGuard::create(&link, &old_target).unwrap();
        let new = SymlinkGuard::create(&link, &new_target).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), new_target);

        drop(new);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn drop_skips_replaced_symlink() {
        let dir = temp_dir("symlink-race");
        let target_a = dir.join("a");
        let target_b = dir.join("b");
        std::fs::write(&target_a, b"a").unwrap();
        std::fs::write(&target_b, b"b").unwrap();
        let link = dir.join("Vconsole-3");

        let guard = SymlinkGuard::create(&link, &target_a).unwrap();

        // Another instance replaces the link while the guard is alive.
        std::fs::remove_file(&link).unwrap();
        std::os::unix::fs::symlink(&target_b, &link).unwrap();

        drop(guard);
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            target_b,
            "drop must not remove a link it no longer owns"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
