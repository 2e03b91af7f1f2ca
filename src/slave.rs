/*! iNet box slave state machine.

Decides, for every header the master puts on the bus, whether this node
answers and with what. The interesting parts:

* PID 0x18 is the master's poll of this slave. Bit 0 of the first
  response byte advertises "I have a setting change for you"; the
  master reacts by running the diagnostic upload dance.
* PID 0x3C carries diagnostic requests, PID 0x3D polls the responses.
  The service handlers live here; segmentation is [`Transport`]'s job.

The bytes answered for 0x18 beyond the update bit, and the canned
frames for the remaining polled identifiers, are reproduced verbatim
from a capture of a real iNet box. Their meaning is unknown and they
are deliberately not interpreted.
 */
use itertools::Itertools;
use log::{debug, info, trace, warn};

use crate::frame::{Frame, ID_DIAG_RESPONSE, ID_STATUS, Pid};
use crate::schema::{self, Schema, Snapshots, StatusMap};
use crate::transport::Transport;

/// Node address after power up, before any SID 0xB0 assignment.
pub const NAD_DEFAULT: u8 = 0x03;

// LIN product identification of the emulated device, as read back from
// the reference capture. 0x7FFF is the standard wildcard.
const SUPPLIER_ID: u16 = 0x4617;
const FUNCTION_ID: u16 = 0x4E42;

// Response to PID 0x18 beyond the update-pending bit in byte 0.
const PID18_TAIL: [u8; 7] = [0xFA, 0x00, 0x1F, 0x00, 0x00, 0x00, 0x00];

// Other identifiers the reference device answers, with the bytes it
// answers them with.
const CANNED: &[(u8, [u8; 8])] = &[
    (0x19, [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
    (0x35, [0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
];

// Diagnostic service identifiers.
const SID_ASSIGN_NAD: u8 = 0xB0;
const SID_READ_BY_ID: u8 = 0xB2;
const SID_ALIVE: u8 = 0xB9;
const SID_UPLOAD: u8 = 0xBA;
const SID_DOWNLOAD: u8 = 0xBB;

// A positive response echoes the SID with bit 6 set.
const RSID: u8 = 0x40;

/// Things that happened inside the slave that upper layers care about.
#[derive(Debug, Clone, PartialEq)]
pub enum SlaveEvent {
    /// The master downloaded a status buffer; here is its decoded view.
    StatusDecoded(&'static Schema, StatusMap),
    /// An upload buffer was queued; here is what we are about to send.
    UploadQueued(&'static Schema, StatusMap),
    /// The master pulled the whole queued upload.
    Pulled(&'static Schema),
}

/// The slave node: address, update-pending flag, and service handlers.
pub struct Slave {
    nad: u8,
    update_pending: bool,
    queued_upload: Option<&'static Schema>,
}

impl Slave {
    /// New slave with the given node address.
    #[must_use]
    pub fn new(nad: u8) -> Self {
        Self {
            nad,
            update_pending: false,
            queued_upload: None,
        }
    }

    /// Current node address.
    #[must_use]
    pub fn nad(&self) -> u8 {
        self.nad
    }

    /// Set the flag advertised in the 0x18 response.
    pub fn set_update_pending(&mut self, v: bool) {
        if self.update_pending != v {
            debug!("update_pending = {v}");
            self.update_pending = v;
        }
    }

    /// Does this node answer headers for the given identifier? Frames
    /// read back for these are the echo of our own transmission.
    #[must_use]
    pub fn answers(&self, id: u8) -> bool {
        id == ID_STATUS || id == ID_DIAG_RESPONSE || CANNED.iter().any(|(c, _)| *c == id)
    }

    /// The wire bytes (data plus checksum) to transmit in response to a
    /// header, or `None` to stay silent. Must be called for every
    /// header, immediately.
    pub fn response_for_header(
        &mut self,
        id: u8,
        transport: &mut Transport,
    ) -> (Option<Vec<u8>>, Option<SlaveEvent>) {
        match id {
            ID_STATUS => {
                let mut data = vec![u8::from(self.update_pending)];
                data.extend_from_slice(&PID18_TAIL);
                (Some(Frame::new(Pid::new(id), data).response_bytes()), None)
            }
            ID_DIAG_RESPONSE => match transport.next_response_frame() {
                Some((data, done)) => {
                    let event = if done {
                        self.queued_upload.take().map(SlaveEvent::Pulled)
                    } else {
                        None
                    };
                    (
                        Some(Frame::new(Pid::new(id), data.to_vec()).response_bytes()),
                        event,
                    )
                }
                None => {
                    trace!("0x3D poll with nothing queued, staying silent");
                    (None, None)
                }
            },
            id => match CANNED.iter().find(|(c, _)| *c == id) {
                Some((_, data)) => (
                    Some(Frame::new(Pid::new(id), data.to_vec()).response_bytes()),
                    None,
                ),
                None => (None, None),
            },
        }
    }

    fn queue_positive(&self, transport: &mut Transport, sid: u8, payload: &[u8]) {
        transport.queue_response(self.nad, sid | RSID, payload);
    }

    /// Handle a reassembled diagnostic request.
    pub fn handle_pdu(
        &mut self,
        nad: u8,
        sid: u8,
        payload: &[u8],
        transport: &mut Transport,
        snapshots: &mut Snapshots,
        committed: &StatusMap,
    ) -> Option<SlaveEvent> {
        trace!(
            "SID 0x{sid:02X} for NAD 0x{nad:02X}: {}",
            payload.iter().map(|b| format!("{b:02X}")).join(" ")
        );
        match sid {
            SID_ALIVE => {
                self.queue_positive(transport, SID_ALIVE, &[0x00]);
                None
            }
            SID_ASSIGN_NAD => {
                if payload.len() < 5 {
                    warn!("assign-NAD with a short payload, declining");
                    return None;
                }
                let supplier = u16::from_le_bytes([payload[0], payload[1]]);
                let function = u16::from_le_bytes([payload[2], payload[3]]);
                if (supplier != SUPPLIER_ID && supplier != 0x7FFF)
                    || (function != FUNCTION_ID && function != 0x7FFF)
                {
                    debug!("assign-NAD for someone else (supplier 0x{supplier:04X})");
                    return None;
                }
                // Positive response goes out under the old address.
                self.queue_positive(transport, SID_ASSIGN_NAD, &[]);
                info!("NAD reassigned 0x{:02X} -> 0x{:02X}", self.nad, payload[4]);
                self.nad = payload[4];
                None
            }
            SID_READ_BY_ID => {
                self.queue_positive(transport, SID_READ_BY_ID, &[]);
                None
            }
            SID_UPLOAD => {
                if payload.len() < 2 {
                    warn!("upload request without buffer identifiers, declining");
                    return None;
                }
                let Some(schema) = schema::schema_for(payload[0], payload[1]) else {
                    warn!(
                        "upload request for unknown buffer (0x{:02X}, 0x{:02X}), declining",
                        payload[0], payload[1]
                    );
                    return None;
                };
                let buf = snapshots.encode_write(schema, committed);
                let decoded = schema.decode(&buf);
                self.queue_positive(transport, SID_UPLOAD, &buf);
                self.queued_upload = Some(schema);
                debug!("queued {} upload, {} bytes", schema.name, buf.len());
                decoded.map(|m| SlaveEvent::UploadQueued(schema, m))
            }
            SID_DOWNLOAD => {
                if payload.len() < 12 {
                    warn!("download of {} bytes is no status buffer, declining", payload.len());
                    return None;
                }
                let Some(schema) = schema::schema_for(payload[10], payload[11]) else {
                    warn!(
                        "download of unknown buffer (0x{:02X}, 0x{:02X}), declining",
                        payload[10], payload[11]
                    );
                    return None;
                };
                let Some(decoded) = schema.decode(payload) else {
                    return None;
                };
                snapshots.store(schema, payload.to_vec());
                self.queue_positive(transport, SID_DOWNLOAD, &[]);
                Some(SlaveEvent::StatusDecoded(schema, decoded))
            }
            _ => {
                warn!("unknown SID 0x{sid:02X}, declining");
                None
            }
        }
    }
}
