/*! LIN transport layer (diagnostic PDU reassembly and segmentation).

The master sends requests in 0x3C frames and polls responses with 0x3D
headers. Payloads longer than six bytes are split:

* PCI `0x0l` single frame: `l` bytes of payload (SID included) follow.
* PCI `0x1h ll` first frame: twelve bits of total length, then five
  payload bytes.
* PCI `0x2s` consecutive frame: four-bit sequence counter, starting at
  one and wrapping 15 → 0, then six payload bytes.

Unused bytes at the end of a frame must be 0xFF. Anything that is not a
valid continuation cancels the reassembly in progress, as does one
second without a continuation arriving.
 */
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::{debug, trace, warn};

/// Broadcast node address, accepted by every slave.
pub const NAD_BROADCAST: u8 = 0x7F;

/// A reassembly session is dropped after this much silence.
const SESSION_TIMEOUT: Duration = Duration::from_secs(1);

// Largest PDU we are willing to buffer. The longest real payload is a
// status buffer of a few dozen bytes.
const MAX_PDU: usize = 256;

/// A fully reassembled diagnostic request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    /// Node address the request was sent to.
    pub nad: u8,
    /// Service identifier.
    pub sid: u8,
    /// Payload after the SID.
    pub payload: Vec<u8>,
}

struct Reassembly {
    nad: u8,
    total: usize,
    buf: Vec<u8>,
    next_seq: u8,
    last_frame: Instant,
}

struct Outbound {
    nad: u8,
    /// RSID plus payload.
    pdu: Vec<u8>,
    sent: usize,
    next_seq: u8,
}

/// Reassembles inbound 0x3C payloads and segments the outbound response
/// for successive 0x3D polls.
pub struct Transport {
    rx: Option<Reassembly>,
    tx: Option<Outbound>,
    rx_errors: u64,
    timeouts: u64,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        debug!(
            "LIN transport: {} reassembly errors, {} timeouts",
            self.rx_errors, self.timeouts
        );
    }
}

impl Transport {
    /// New transport with no session in progress.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rx: None,
            tx: None,
            rx_errors: 0,
            timeouts: 0,
        }
    }

    /// Reassembly errors seen so far (sequence, fill, length).
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.rx_errors + self.timeouts
    }

    fn cancel_rx(&mut self, why: &str) {
        if let Some(r) = self.rx.take() {
            debug!(
                "dropping reassembly for NAD 0x{:02X} after {} of {} bytes: {why}",
                r.nad,
                r.buf.len(),
                r.total
            );
            self.rx_errors += 1;
        }
    }

    /// Drop a reassembly session that has gone quiet.
    pub fn tick(&mut self, now: Instant) {
        if let Some(r) = &self.rx
            && now.duration_since(r.last_frame) >= SESSION_TIMEOUT
        {
            warn!("transport reassembly timed out");
            self.rx = None;
            self.timeouts += 1;
        }
    }

    /// Handle the data of a 0x3C frame. Returns the reassembled PDU
    /// once complete. Frames for other nodes' addresses are ignored,
    /// but they still cancel any session in progress for us.
    pub fn handle_request(&mut self, data: &[u8; 8], own_nad: u8, now: Instant) -> Option<Pdu> {
        let nad = data[0];
        let pci = data[1];
        match pci >> 4 {
            0x0 => {
                self.cancel_rx("single frame while receiving");
                if nad != own_nad && nad != NAD_BROADCAST {
                    trace!("diagnostic request for NAD 0x{nad:02X}, not us");
                    return None;
                }
                let len = usize::from(pci & 0x0F);
                if len == 0 || len > 6 {
                    warn!("single frame with bad length {len}");
                    self.rx_errors += 1;
                    return None;
                }
                if !data[2 + len..].iter().all(|&b| b == 0xFF) {
                    warn!("single frame fill bytes are not 0xFF");
                    self.rx_errors += 1;
                    return None;
                }
                Some(Pdu {
                    nad,
                    sid: data[2],
                    payload: data[3..2 + len].to_vec(),
                })
            }
            0x1 => {
                self.cancel_rx("new first frame");
                if nad != own_nad && nad != NAD_BROADCAST {
                    return None;
                }
                let total = (usize::from(pci & 0x0F) << 8) | usize::from(data[2]);
                if total <= 6 || total > MAX_PDU {
                    warn!("first frame with implausible length {total}");
                    self.rx_errors += 1;
                    return None;
                }
                self.rx = Some(Reassembly {
                    nad,
                    total,
                    buf: data[3..8].to_vec(),
                    next_seq: 1,
                    last_frame: now,
                });
                None
            }
            0x2 => {
                let Some(r) = &mut self.rx else {
                    debug!("consecutive frame without a first frame");
                    self.rx_errors += 1;
                    return None;
                };
                let seq = pci & 0x0F;
                if nad != r.nad || seq != r.next_seq {
                    self.cancel_rx("sequence mismatch");
                    return None;
                }
                r.next_seq = (r.next_seq + 1) & 0x0F;
                r.last_frame = now;
                let missing = r.total - r.buf.len();
                if missing > 6 {
                    r.buf.extend_from_slice(&data[2..8]);
                    return None;
                }
                r.buf.extend_from_slice(&data[2..2 + missing]);
                if !data[2 + missing..].iter().all(|&b| b == 0xFF) {
                    self.cancel_rx("final frame fill bytes are not 0xFF");
                    return None;
                }
                let r = self.rx.take()?;
                trace!(
                    "reassembled {} byte PDU: {}",
                    r.total,
                    r.buf.iter().map(|b| format!("{b:02X}")).join(" ")
                );
                Some(Pdu {
                    nad: r.nad,
                    sid: r.buf[0],
                    payload: r.buf[1..].to_vec(),
                })
            }
            _ => {
                self.cancel_rx("unknown PCI type");
                warn!("unknown PCI byte 0x{pci:02X}");
                None
            }
        }
    }

    /// Queue a response PDU to be drained by upcoming 0x3D polls.
    /// Replaces anything still queued.
    pub fn queue_response(&mut self, nad: u8, rsid: u8, payload: &[u8]) {
        let mut pdu = Vec::with_capacity(1 + payload.len());
        pdu.push(rsid);
        pdu.extend_from_slice(payload);
        if self.tx.is_some() {
            debug!("replacing a queued response that was never polled");
        }
        self.tx = Some(Outbound {
            nad,
            pdu,
            sent: 0,
            next_seq: 1,
        });
    }

    /// True if a response is queued.
    #[must_use]
    pub fn has_response(&self) -> bool {
        self.tx.is_some()
    }

    /// Produce the next 0x3D frame data. `None` when nothing is queued.
    /// The bool is true once this frame completes the queued PDU.
    pub fn next_response_frame(&mut self) -> Option<([u8; 8], bool)> {
        let t = self.tx.as_mut()?;
        let mut frame = [0xFFu8; 8];
        frame[0] = t.nad;
        let done = if t.sent == 0 {
            if t.pdu.len() <= 6 {
                frame[1] = t.pdu.len() as u8;
                frame[2..2 + t.pdu.len()].copy_from_slice(&t.pdu);
                true
            } else {
                frame[1] = 0x10 | ((t.pdu.len() >> 8) as u8 & 0x0F);
                frame[2] = (t.pdu.len() & 0xFF) as u8;
                frame[3..8].copy_from_slice(&t.pdu[..5]);
                t.sent = 5;
                false
            }
        } else {
            frame[1] = 0x20 | t.next_seq;
            t.next_seq = (t.next_seq + 1) & 0x0F;
            let n = (t.pdu.len() - t.sent).min(6);
            frame[2..2 + n].copy_from_slice(&t.pdu[t.sent..t.sent + n]);
            t.sent += n;
            t.sent == t.pdu.len()
        };
        if done {
            self.tx = None;
        }
        Some((frame, done))
    }
}
