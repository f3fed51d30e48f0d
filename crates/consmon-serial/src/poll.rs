use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::Result;

/// Wait until `fd` is readable or `timeout` elapses.
///
/// Returns `Ok(true)` when the descriptor has data, an error, or a hangup
/// pending; in the latter cases the subsequent `read` surfaces the
/// condition to the caller's error path. EINTR counts as a timeout,
/// since callers loop anyway.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<bool> {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(0) => Ok(false),
        Ok(_) => {
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            Ok(revents
                .intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP))
        }
        Err(nix::Error::EINTR) => Ok(false),
        Err(err) => Err(crate::SerialError::Io(std::io::Error::from_raw_os_error(
            err as i32,
        ))),
    }
}
