use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use consmon_frame::{FilterEvent, FrameFilter};
use consmon_serial::{wait_readable, PtyPair, SymlinkGuard, Uart};
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::error::Result;
use crate::liveness::{epoch_secs, Liveness, StatePublisher};
use crate::FILTER_TIMEOUT;

const READ_CHUNK: usize = 4096;

/// One running console link: a UART, a PTY pair with its published
/// symlink, and the two pump threads between them.
///
/// The UART→PTY direction runs through the frame filter (heartbeats out,
/// user bytes through); the PTY→UART direction is a verbatim passthrough.
pub struct LinkProxy {
    config: LinkConfig,
    liveness: Arc<Liveness>,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    rx_thread: Option<JoinHandle<()>>,
    tx_thread: Option<JoinHandle<()>>,
    // Dropped on stop, which unlinks the published name.
    _symlink: SymlinkGuard,
}

impl LinkProxy {
    /// Open the devices, publish the symlink, and start both pump
    /// threads. The link starts in the `down` state; only a decoded
    /// heartbeat brings it up.
    pub fn spawn(
        config: LinkConfig,
        symlink: PathBuf,
        publisher: Arc<dyn StatePublisher>,
    ) -> Result<Self> {
        let uart = Arc::new(Uart::open(&config.device, config.baud, config.flow)?);
        let pty = Arc::new(PtyPair::open(config.baud)?);
        let symlink = SymlinkGuard::create(symlink, pty.slave_path())?;

        let liveness = Arc::new(Liveness::new(config.link_id.clone(), publisher));
        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let rx_thread = {
            let uart = Arc::clone(&uart);
            let pty = Arc::clone(&pty);
            let liveness = Arc::clone(&liveness);
            let stop = Arc::clone(&stop);
            let failed = Arc::clone(&failed);
            let link_id = config.link_id.clone();
            std::thread::Builder::new()
                .name(format!("consmon-rx-{link_id}"))
                .spawn(move || pump_uart_to_pty(&link_id, &uart, &pty, &liveness, &stop, &failed))?
        };

        let tx_thread = {
            let uart = Arc::clone(&uart);
            let pty = Arc::clone(&pty);
            let liveness = Arc::clone(&liveness);
            let stop = Arc::clone(&stop);
            let failed = Arc::clone(&failed);
            let link_id = config.link_id.clone();
            let stop_err = Arc::clone(&stop);
            let spawned = std::thread::Builder::new()
                .name(format!("consmon-tx-{link_id}"))
                .spawn(move || pump_pty_to_uart(&link_id, &uart, &pty, &liveness, &stop, &failed));
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    stop_err.store(true, Ordering::SeqCst);
                    let _ = rx_thread.join();
                    return Err(err.into());
                }
            }
        };

        info!(
            link = %config.link_id,
            device = %config.device.display(),
            baud = config.baud,
            "link proxy started"
        );

        Ok(Self {
            config,
            liveness,
            stop,
            failed,
            rx_thread: Some(rx_thread),
            tx_thread: Some(tx_thread),
            _symlink: symlink,
        })
    }

    pub fn link_id(&self) -> &str {
        &self.config.link_id
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn liveness(&self) -> Arc<Liveness> {
        Arc::clone(&self.liveness)
    }

    /// False once a pump thread hit a fatal device error or exited.
    pub fn is_healthy(&self) -> bool {
        if self.failed.load(Ordering::SeqCst) {
            return false;
        }
        let rx_alive = self.rx_thread.as_ref().is_some_and(|h| !h.is_finished());
        let tx_alive = self.tx_thread.as_ref().is_some_and(|h| !h.is_finished());
        rx_alive && tx_alive
    }

    /// Signal both threads and wait for them; the symlink disappears when
    /// `self` drops. Bounded by the 0.5 s poll timeout per thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.rx_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.tx_thread.take() {
            let _ = handle.join();
        }
        info!(link = %self.config.link_id, "link proxy stopped");
    }
}

impl Drop for LinkProxy {
    fn drop(&mut self) {
        if self.rx_thread.is_some() || self.tx_thread.is_some() {
            self.stop();
        }
    }
}

/// UART→PTY: poll, read, filter, forward. Heartbeats feed the liveness
/// deadline strictly after the user bytes that preceded them were
/// written, so an `up` publication can never race ahead of still-buffered
/// terminal output.
fn pump_uart_to_pty(
    link_id: &str,
    uart: &Uart,
    pty: &PtyPair,
    liveness: &Liveness,
    stop: &AtomicBool,
    failed: &AtomicBool,
) {
    let mut filter = FrameFilter::new();
    let mut buf = [0u8; READ_CHUNK];

    while !stop.load(Ordering::SeqCst) {
        let readable = match wait_readable(uart.as_fd(), FILTER_TIMEOUT) {
            Ok(ready) => ready,
            Err(err) => {
                error!(link = link_id, %err, "uart poll failed");
                fail(link_id, liveness, failed);
                break;
            }
        };

        if !readable {
            // Quiescence: release any user bytes parked in the filter.
            if let Some(bytes) = filter.on_timeout() {
                write_pty(link_id, pty, &bytes);
            }
            continue;
        }

        match uart.read(&mut buf) {
            Ok(0) => {
                // Readable with no data: the device went away.
                error!(link = link_id, "uart hangup");
                fail(link_id, liveness, failed);
                break;
            }
            Ok(n) => {
                for event in filter.push(&buf[..n]) {
                    match event {
                        FilterEvent::User(bytes) => write_pty(link_id, pty, &bytes),
                        FilterEvent::Frame(frame) if frame.is_heartbeat() => {
                            debug!(link = link_id, seq = frame.seq, "heartbeat");
                            liveness.heartbeat(epoch_secs());
                        }
                        FilterEvent::Frame(_) => {
                            // Already counted and logged by the filter.
                        }
                    }
                }
            }
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(err) => {
                error!(link = link_id, %err, "uart read failed");
                fail(link_id, liveness, failed);
                break;
            }
        }
    }

    // Don't strand user bytes that were waiting on a flush boundary.
    let tail = filter.flush();
    if !tail.is_empty() {
        write_pty(link_id, pty, &tail);
    }

    let stats = filter.stats();
    debug!(
        link = link_id,
        crc_mismatch = stats.crc_mismatch,
        malformed = stats.malformed,
        aborted = stats.aborted,
        overflow = stats.overflow,
        "rx pump exiting"
    );
}

/// PTY→UART: verbatim passthrough of operator input. Heartbeat is
/// unidirectional, so nothing here touches the filter.
fn pump_pty_to_uart(
    link_id: &str,
    uart: &Uart,
    pty: &PtyPair,
    liveness: &Liveness,
    stop: &AtomicBool,
    failed: &AtomicBool,
) {
    let mut buf = [0u8; READ_CHUNK];

    while !stop.load(Ordering::SeqCst) {
        let readable = match wait_readable(pty.master_fd(), FILTER_TIMEOUT) {
            Ok(ready) => ready,
            Err(err) => {
                debug!(link = link_id, %err, "pty poll failed");
                continue;
            }
        };
        if !readable {
            continue;
        }

        match pty.master_read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if let Err(err) = uart.write_all(&buf[..n]) {
                    error!(link = link_id, %err, "uart write failed");
                    fail(link_id, liveness, failed);
                    break;
                }
            }
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(err) => {
                // A PTY error (e.g. every slave closed) must not stop the
                // proxy; the master stays valid while we hold the pair.
                debug!(link = link_id, %err, "pty read failed");
                continue;
            }
        }
    }
}

/// Forward user bytes to the PTY master. When nobody reads the slave the
/// kernel buffer eventually fills; those bytes are dropped rather than
/// letting the session stall the heartbeat path.
fn write_pty(link_id: &str, pty: &PtyPair, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        match pty.master_write(bytes) {
            Ok(0) => break,
            Ok(n) => bytes = &bytes[n..],
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                debug!(link = link_id, dropped = bytes.len(), "pty full, dropping");
                break;
            }
            Err(err) => {
                debug!(link = link_id, %err, dropped = bytes.len(), "pty write failed");
                break;
            }
        }
    }
}

fn fail(link_id: &str, liveness: &Liveness, failed: &AtomicBool) {
    if !failed.swap(true, Ordering::SeqCst) {
        warn!(link = link_id, "proxy failed; awaiting respawn");
    }
    liveness.mark_down();
}
