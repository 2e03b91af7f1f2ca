#![warn(missing_docs)]
/*! This crate emulates the Truma iNet box, a LIN bus peripheral of the
CP Plus heating controller found in many campers and caravans.

From the point of view of the CP Plus (the bus master), the emulator is
the real thing: it answers the scheduled frames the master polls, speaks
the LIN diagnostic transport layer to exchange status buffers, and
advertises pending setting changes so that the master pulls them.

# Architecture overview

The protocol stack is layered bottom-up. Each layer consumes the one
below it through a narrow interface, and all of it runs on a single
thread (see [`emulator`]).

```text
      [ UART 9600 8N1 ]            serial.rs
             ↓
  [ Break / sync / PID / data ]    deframer.rs, frame.rs
             ↓
   [ Transport reassembly ]        transport.rs
             ↓
    [ Slave state machine ]        slave.rs
             ↓
  [ Status buffer schemas ]        schema.rs
             ↕
   [ Update coordinator ]          updater.rs, settings.rs
```

Upward, bus bytes become decoded telemetry. Downward, user set-requests
are validated, debounced, and encoded into a status buffer the master
will accept.

# Example

Decode a captured bus log and print every frame:

```no_run
use inetbox::deframer::{Deframer, DeframerEvent};
use std::io::BufRead;

let mut deframer = Deframer::new();
let file = std::fs::File::open("capture.log")?;
for line in std::io::BufReader::new(file).lines() {
    let Some(bytes) = inetbox::replay::parse_line(&line?, 1, -2) else {
        continue;
    };
    for ev in deframer.feed_frame(&bytes) {
        if let DeframerEvent::Frame(f) = ev {
            println!("{f:?}");
        }
    }
}
# Ok::<(), anyhow::Error>(())
```

## Links

* The protocol was reverse engineered by the inetbox.py project:
  <https://github.com/danielfett/inetbox.py>
 */

pub mod config;
pub mod deframer;
pub mod emulator;
pub mod frame;
pub mod replay;
pub mod schema;
pub mod serial;
pub mod settings;
pub mod slave;
pub mod transport;
pub mod updater;

/// Errors for this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error attributable to a named file or device.
    #[error("I/O error on {path}: {0}", path = .1.display())]
    FileIo(std::io::Error, std::path::PathBuf),

    /// I/O error without a better home.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The UART is already held by another instance.
    #[error("device {} is locked by another process", .0.display())]
    DeviceBusy(std::path::PathBuf),

    /// System call failure from the serial layer.
    #[error("syscall failed: {0}")]
    Sys(#[from] nix::Error),

    /// A user set-request was rejected.
    #[error("invalid setting {key}: {reason}")]
    InvalidSetting {
        /// The offending setting name.
        key: String,
        /// Human readable rejection reason.
        reason: String,
    },

    /// Bad configuration file.
    #[error("config error in {path}: {1}", path = .0.display())]
    Config(std::path::PathBuf, String),
}

impl Error {
    /// Create a file I/O error with the path attached.
    pub fn file_io<P: Into<std::path::PathBuf>>(e: std::io::Error, path: P) -> Self {
        Self::FileIo(e, path.into())
    }

    /// Create a setting rejection.
    pub fn invalid_setting<K: Into<String>, R: Into<String>>(key: K, reason: R) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
