/*! Serial I/O.

Owns the UART the LIN bus hangs off: 9600 baud, 8N1, raw. Reads are
bounded by a short poll timeout so the protocol loop can service timers
and the request queue; writes block until the bytes left the shifter,
because a responder's bytes have to land inside the master's frame
window.

Cheap USB transceivers do not report LIN breaks out of band. What the
UART sees instead is a 0x00 byte after the bus was idle, so each read
reports whether an idle period preceded it and the deframer does the
rest.

The device is locked exclusively. Two emulators on one bus answer the
master twice per header, which corrupts every frame; better to refuse
to start.
 */
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use nix::fcntl::{Flock, FlockArg};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::termios::{self, BaudRate, ControlFlags, SetArg, SpecialCharacterIndices};

use crate::{Error, Result};

/// Poll timeout per read.
const READ_TIMEOUT_MS: u8 = 30;

/// One read's worth of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Number of bytes placed in the caller's buffer. Zero on timeout.
    pub len: usize,
    /// True if the bus was idle before the first of these bytes.
    pub after_gap: bool,
}

/// The byte-level interface the protocol stack runs on. Implemented by
/// the real UART here and by loopbacks in tests.
pub trait SerialIo {
    /// Read whatever is available, waiting at most the poll timeout.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Chunk>;

    /// Write a full response, blocking until it is on the wire.
    fn write_frame(&mut self, data: &[u8]) -> Result<()>;
}

/// A real serial device.
pub struct SerialPort {
    file: Flock<std::fs::File>,
    path: PathBuf,
    idle: bool,
}

impl SerialPort {
    /// Open and configure the UART, taking the exclusive lock.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::file_io(e, path))?;
        let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(f) => f,
            Err((_, e)) => {
                debug!("flock on {}: {e}", path.display());
                return Err(Error::DeviceBusy(path.into()));
            }
        };

        let mut tio = termios::tcgetattr(&*file)?;
        termios::cfmakeraw(&mut tio);
        termios::cfsetspeed(&mut tio, BaudRate::B9600)?;
        tio.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
        tio.control_flags &= !(ControlFlags::CSTOPB | ControlFlags::CRTSCTS);
        // Reads are gated by poll(), never by the line discipline.
        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::tcsetattr(&*file, SetArg::TCSANOW, &tio)?;
        termios::tcflush(&*file, termios::FlushArg::TCIOFLUSH)?;
        debug!("opened {} at 9600 8N1", path.display());
        Ok(Self {
            file,
            path: path.into(),
            idle: true,
        })
    }

    /// The device path this port was opened with.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SerialIo for SerialPort {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Chunk> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        let n = poll(&mut fds, PollTimeout::from(READ_TIMEOUT_MS))?;
        if n == 0 {
            self.idle = true;
            return Ok(Chunk {
                len: 0,
                after_gap: false,
            });
        }
        let len = (&*self.file)
            .read(buf)
            .map_err(|e| Error::file_io(e, &self.path))?;
        if len == 0 {
            // EOF only happens on pty test rigs, treat it as idle.
            self.idle = true;
            return Ok(Chunk {
                len: 0,
                after_gap: false,
            });
        }
        let after_gap = std::mem::take(&mut self.idle);
        trace!("read {len} bytes, gap={after_gap}");
        Ok(Chunk { len, after_gap })
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        (&*self.file)
            .write_all(data)
            .map_err(|e| Error::file_io(e, &self.path))?;
        termios::tcdrain(&*self.file)?;
        Ok(())
    }
}
