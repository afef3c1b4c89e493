//! Target I/O Channel
//!
//! A pseudo-terminal pair dedicated to the debugged program. GDB is told to
//! run the inferior on the slave side (`set inferior-tty`), the server keeps
//! the master side and uses it to feed stdin and collect stdout/stderr.
//!
//! The slave is kept in raw mode so arbitrary bytes (NUL, 0x7f, CR, control
//! characters) reach the target untouched. Signal generation is briefly
//! re-enabled only while a control character is being delivered.

use crate::gdb::error::SessionResult;
use crate::gdb::types::ControlSignal;
use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::openpty;
use nix::sys::termios::{
    cfmakeraw, tcgetattr, tcsetattr, LocalFlags, SetArg, SpecialCharacterIndices, Termios,
};
use nix::unistd::ttyname;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The line discipline consumes master-side input asynchronously, so the
/// signal-capable mode must stay in place until the control byte is handled.
const SIGNAL_SETTLE: Duration = Duration::from_millis(50);

/// Pseudo-terminal owned by one debugger session
pub struct TargetTerminal {
    master: File,
    slave: File,
    slave_path: PathBuf,
    /// Modes the slave was created with (canonical, ISIG on).
    /// Kept as plain `libc::termios`: nix's `Termios` is not `Sync`.
    saved: libc::termios,
    /// Raw modes applied between signal deliveries
    raw: libc::termios,
    /// Readers and writers share the lock, a signal delivery takes it
    /// exclusively while the slave is out of raw mode
    mode: RwLock<()>,
}

impl TargetTerminal {
    /// Allocate a new pty pair and put the slave into raw mode
    pub fn open() -> SessionResult<Self> {
        let pty = openpty(None, None)?;
        let master = File::from(pty.master);
        let slave = File::from(pty.slave);
        let slave_path = ttyname(slave.as_fd())?;

        let saved = tcgetattr(slave.as_fd())?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(slave.as_fd(), SetArg::TCSANOW, &raw)?;

        info!("Allocated target terminal {}", slave_path.display());

        Ok(Self {
            master,
            slave,
            slave_path,
            saved: saved.into(),
            raw: raw.into(),
            mode: RwLock::new(()),
        })
    }

    /// Path of the slave device, handed to GDB as the inferior tty
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Write `data` verbatim to the target's stdin
    pub fn send(&self, data: &[u8]) -> SessionResult<usize> {
        let _shared = self.mode.read().unwrap_or_else(PoisonError::into_inner);
        (&self.master).write_all(data)?;
        debug!("Sent {} bytes to target", data.len());
        Ok(data.len())
    }

    /// Read up to `max` bytes of target output, waiting at most `timeout`.
    ///
    /// Returns `None` when nothing arrived in time.
    pub fn read(&self, max: usize, timeout: Duration) -> SessionResult<Option<Vec<u8>>> {
        if max == 0 {
            return Ok(None);
        }
        if !self.wait_readable(timeout)? {
            return Ok(None);
        }

        let _shared = self.mode.read().unwrap_or_else(PoisonError::into_inner);
        let mut buf = vec![0u8; max];
        match (&self.master).read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                buf.truncate(n);
                debug!("Read {} bytes from target", n);
                Ok(Some(buf))
            }
            // EIO: no process currently holds the slave side
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => Ok(None),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Deliver a control character so the line discipline raises the signal
    /// (or EOF) for the target's foreground process group.
    ///
    /// Returns the byte that was written.
    pub fn interrupt(&self, signal: ControlSignal) -> SessionResult<u8> {
        let byte = self.control_byte(signal);
        let _mode = SignalMode::enter(self)?;
        (&self.master).write_all(&[byte])?;
        thread::sleep(SIGNAL_SETTLE);
        info!("Delivered {:?} (0x{:02x}) to target", signal, byte);
        Ok(byte)
    }

    fn control_byte(&self, signal: ControlSignal) -> u8 {
        let index = match signal {
            ControlSignal::Interrupt => SpecialCharacterIndices::VINTR,
            ControlSignal::EndOfFile => SpecialCharacterIndices::VEOF,
            ControlSignal::Suspend => SpecialCharacterIndices::VSUSP,
        };
        match self.saved.c_cc[index as usize] {
            0 => signal.default_byte(),
            byte => byte,
        }
    }

    fn wait_readable(&self, timeout: Duration) -> SessionResult<bool> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(self.master.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, timeout) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => Ok(fds[0]
                .revents()
                .is_some_and(|events| events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))),
            Err(e) => Err(e.into()),
        }
    }
}

/// Slave held in signal-capable mode; raw mode is re-armed on drop,
/// whether or not the delivery succeeded.
struct SignalMode<'a> {
    terminal: &'a TargetTerminal,
    _exclusive: RwLockWriteGuard<'a, ()>,
}

impl<'a> SignalMode<'a> {
    fn enter(terminal: &'a TargetTerminal) -> SessionResult<Self> {
        let exclusive = terminal.mode.write().unwrap_or_else(PoisonError::into_inner);
        let guard = Self {
            terminal,
            _exclusive: exclusive,
        };

        // Cooked modes with ISIG, minus echo so the control byte is not
        // reflected back into the output stream
        let mut modes = Termios::from(terminal.saved);
        modes.local_flags.insert(LocalFlags::ISIG);
        modes
            .local_flags
            .remove(LocalFlags::ECHO | LocalFlags::ECHONL);
        tcsetattr(terminal.slave.as_fd(), SetArg::TCSANOW, &modes)?;

        Ok(guard)
    }
}

impl Drop for SignalMode<'_> {
    fn drop(&mut self) {
        if let Err(e) = tcsetattr(
            self.terminal.slave.as_fd(),
            SetArg::TCSANOW,
            &Termios::from(self.terminal.raw),
        ) {
            warn!("Failed to restore raw mode on target terminal: {}", e);
        }
    }
}

impl Drop for TargetTerminal {
    fn drop(&mut self) {
        debug!("Closing target terminal {}", self.slave_path.display());
    }
}

/// Render target output for display: text when every byte is printable
/// (or CR/LF) and valid UTF-8, a byte dump otherwise.
pub fn render_target_bytes(data: &[u8]) -> String {
    let printable = data
        .iter()
        .all(|&b| b >= 0x20 || b == b'\r' || b == b'\n');
    if printable {
        if let Ok(text) = std::str::from_utf8(data) {
            return text.to_string();
        }
    }
    byte_dump(data)
}

/// Classic 16-bytes-per-row hex dump with an ASCII column
pub fn byte_dump(data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(row, chunk)| {
            let cells: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
            let (low, high) = cells.split_at(cells.len().min(8));
            let hex = if high.is_empty() {
                low.join(" ")
            } else {
                format!("{}  {}", low.join(" "), high.join(" "))
            };
            let ascii: String = chunk
                .iter()
                .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
                .collect();
            format!("{:08X}: {:<48}  {}", row * 16, hex, ascii)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
