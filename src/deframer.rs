/*! LIN deframer.

Consumes the raw byte stream from the UART and emits frame events. A
frame begins with a bus break. Transceivers without break detection
deliver the break as a 0x00 data byte after an idle gap, so every byte
is pushed together with a flag saying whether an idle gap preceded it.

Two kinds of events come out:

* [`DeframerEvent::Header`] as soon as a PID passes parity. The slave
  has to decide *right now* whether to put response bytes on the wire,
  before the data section of the frame.
* [`DeframerEvent::Frame`] once data and checksum have been collected
  and verified. When we answered the header ourselves, this frame is
  the echo of our own transmission.
 */
use log::{debug, info, trace};

use crate::frame::{self, Frame, Pid, SYNC};

/// Events produced by the deframer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeframerEvent {
    /// A valid header (break + sync + PID) was just received.
    Header(Pid),
    /// A complete frame passed checksum validation.
    Frame(Frame),
}

enum State {
    /// Waiting for a break.
    WaitBreak,
    /// Break seen, waiting for the sync byte.
    WaitSync,
    /// Sync seen, waiting for the PID byte.
    WaitPid,
    /// Header done, collecting data bytes.
    Data(Pid, Vec<u8>),
    /// Data done, next byte is the checksum.
    Checksum(Pid, Vec<u8>),
}

/// Byte stream to LIN frame state machine.
pub struct Deframer {
    state: State,
    frames_ok: u64,
    parity_errors: u64,
    checksum_errors: u64,
    aborted: u64,
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Deframer {
    fn drop(&mut self) {
        info!(
            "LIN deframer: {} frames ok, {} parity errors, {} checksum errors, {} aborted",
            self.frames_ok, self.parity_errors, self.checksum_errors, self.aborted
        );
    }
}

impl Deframer {
    /// Create a new deframer, waiting for the first break.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::WaitBreak,
            frames_ok: 0,
            parity_errors: 0,
            checksum_errors: 0,
            aborted: 0,
        }
    }

    /// Frames accepted so far.
    #[must_use]
    pub fn frames_ok(&self) -> u64 {
        self.frames_ok
    }

    /// Parity plus checksum errors so far.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.parity_errors + self.checksum_errors
    }

    /// Push one received byte. `after_gap` is true if the read that
    /// produced this byte followed an idle period on the bus.
    pub fn push(&mut self, byte: u8, after_gap: bool) -> Option<DeframerEvent> {
        // A 0x00 after bus idle can only be a break. If it interrupts a
        // frame in progress, that frame is lost; resynchronize.
        if after_gap && byte == 0x00 {
            if matches!(self.state, State::Data(..) | State::Checksum(..)) {
                debug!("break in the middle of a frame, dropping it");
                self.aborted += 1;
            }
            self.state = State::WaitSync;
            return None;
        }

        let mut state = State::WaitBreak;
        std::mem::swap(&mut state, &mut self.state);
        let (next, event) = match state {
            State::WaitBreak => {
                if byte == 0x00 {
                    (State::WaitSync, None)
                } else {
                    (State::WaitBreak, None)
                }
            }
            State::WaitSync => match byte {
                SYNC => (State::WaitPid, None),
                // A long break can read as several zero bytes.
                0x00 => (State::WaitSync, None),
                _ => (State::WaitBreak, None),
            },
            State::WaitPid => match Pid::from_wire(byte) {
                Some(pid) => {
                    trace!("header for {pid:?}");
                    let next = if frame::data_len(pid.id()) == 0 {
                        State::WaitBreak
                    } else {
                        State::Data(pid, Vec::with_capacity(8))
                    };
                    (next, Some(DeframerEvent::Header(pid)))
                }
                None => {
                    debug!("PID byte 0x{byte:02X} fails parity");
                    self.parity_errors += 1;
                    (State::WaitBreak, None)
                }
            },
            State::Data(pid, mut buf) => {
                buf.push(byte);
                if buf.len() == frame::data_len(pid.id()) {
                    (State::Checksum(pid, buf), None)
                } else {
                    (State::Data(pid, buf), None)
                }
            }
            State::Checksum(pid, buf) => {
                let want = frame::checksum(frame::checksum_kind(pid.id()), pid, &buf);
                if byte == want {
                    self.frames_ok += 1;
                    (
                        State::WaitBreak,
                        Some(DeframerEvent::Frame(Frame::new(pid, buf))),
                    )
                } else {
                    debug!(
                        "checksum mismatch on id 0x{:02X}: got 0x{byte:02X}, want 0x{want:02X}",
                        pid.id()
                    );
                    self.checksum_errors += 1;
                    (State::WaitBreak, None)
                }
            }
        };
        self.state = next;
        event
    }

    /// Feed one whole frame, PID byte first, checksum last, as it
    /// appears in a bus log. Synthesizes the break and sync for it.
    pub fn feed_frame(&mut self, bytes: &[u8]) -> Vec<DeframerEvent> {
        let mut out = Vec::new();
        out.extend(self.push(0x00, true));
        out.extend(self.push(SYNC, false));
        for &b in bytes {
            out.extend(self.push(b, false));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ChecksumKind;

    fn wire(id: u8, data: &[u8], kind: ChecksumKind) -> Vec<u8> {
        let pid = Pid::new(id);
        let mut v = vec![pid.byte()];
        v.extend_from_slice(data);
        v.push(frame::checksum(kind, pid, data));
        v
    }

    #[test]
    fn single_frame() {
        let mut d = Deframer::new();
        let data = [0x01, 0x06, 0xB8, 0x40, 0x03, 0x00, 0x00, 0xFF];
        let events = d.feed_frame(&wire(0x3C, &data, ChecksumKind::Classic));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], DeframerEvent::Header(Pid::new(0x3C)));
        assert_eq!(
            events[1],
            DeframerEvent::Frame(Frame::new(Pid::new(0x3C), data.to_vec()))
        );
        assert_eq!(d.frames_ok(), 1);
    }

    #[test]
    fn broadcast_uses_enhanced() {
        let mut d = Deframer::new();
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        let events = d.feed_frame(&wire(0x20, &data, ChecksumKind::Enhanced));
        assert!(matches!(events[1], DeframerEvent::Frame(_)));

        // The same frame with a classic checksum must be rejected.
        let mut d = Deframer::new();
        let events = d.feed_frame(&wire(0x20, &data, ChecksumKind::Classic));
        assert_eq!(events.len(), 1);
        assert_eq!(d.error_count(), 1);
    }

    #[test]
    fn bad_parity_resyncs() {
        let mut d = Deframer::new();
        // Take a valid PID and corrupt one identifier bit.
        assert!(d.push(0x00, true).is_none());
        assert!(d.push(SYNC, false).is_none());
        assert!(d.push(Pid::new(0x32).byte() ^ 0x04, false).is_none());
        assert_eq!(d.error_count(), 1);

        // A following good frame is still decoded.
        let events = d.feed_frame(&wire(0x18, &[0; 8], ChecksumKind::Classic));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn break_mid_frame_aborts() {
        let mut d = Deframer::new();
        let good = wire(0x20, &[1, 2, 3, 4, 5, 6, 7, 8], ChecksumKind::Enhanced);
        assert!(d.push(0x00, true).is_none());
        assert!(d.push(SYNC, false).is_none());
        assert!(d.push(good[0], false).is_some());
        assert!(d.push(good[1], false).is_none());
        // Master gives up and starts a new frame.
        let events = d.feed_frame(&good);
        assert_eq!(events.len(), 2);
        assert_eq!(d.frames_ok(), 1);
    }

    #[test]
    fn unknown_id_is_header_only() {
        let mut d = Deframer::new();
        let events = d.feed_frame(&[Pid::new(0x07).byte()]);
        assert_eq!(events, vec![DeframerEvent::Header(Pid::new(0x07))]);
        // Stray bytes before the next break are ignored.
        assert!(d.push(0xAA, false).is_none());
        let events = d.feed_frame(&wire(0x18, &[0; 8], ChecksumKind::Classic));
        assert_eq!(events.len(), 2);
    }
}
