/*! The emulator event loop.

One thread owns the serial device and every piece of protocol state.
Bus bytes drive the deframer; frames drive the transport and the slave;
the slave's answers go straight back out the UART. Between bus events
the loop drains the set-request queue and advances the timers. Nothing
here is ever written to the bus spontaneously: a responder only speaks
inside the window right after a master header, so the 30 ms read
timeout is the only pacing needed.

User requests come in through a bounded channel and telemetry goes out
through another, which keeps this the single mutator of all protocol
state. No locks anywhere.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Instant;

use log::{debug, info, trace, warn};

use crate::config::Config;
use crate::deframer::{Deframer, DeframerEvent};
use crate::frame::{Frame, ID_BROADCAST, ID_DIAG_REQUEST};
use crate::schema::{Snapshots, StatusMap};
use crate::serial::SerialIo;
use crate::slave::{Slave, SlaveEvent};
use crate::transport::Transport;
use crate::updater::{CpPlusStatus, UpdateState, Updater, UpdaterEvent};
use crate::{Error, Result};

/// One user set-request: a setting name and its unparsed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetRequest {
    /// Setting name, e.g. `target_temp_room`.
    pub name: String,
    /// UTF-8 value, parsed against the setting's domain.
    pub value: String,
}

/// Telemetry emitted by the emulator.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    /// Decoded master view of the heater, after each download.
    DisplayStatus(StatusMap),
    /// Decoded view of a buffer we queued for upload.
    ControlStatus(StatusMap),
    /// Update coordinator state changed.
    UpdateStatus(UpdateState),
    /// Master liveness changed.
    CpPlusStatus(CpPlusStatus),
    /// A set-request was rejected.
    Error {
        /// The offending setting name.
        key: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// The caller's side of a running emulator.
pub struct Handles {
    /// Send set-requests here. Bounded; sending blocks when full
    /// rather than dropping.
    pub requests: mpsc::SyncSender<SetRequest>,
    /// Telemetry events come out here.
    pub telemetry: mpsc::Receiver<Telemetry>,
    /// Set true for a graceful shutdown.
    pub stop: Arc<AtomicBool>,
}

// Requests queued beyond this block the sender. The protocol loop
// drains the queue every 30 ms, so this never fills up in practice.
const REQUEST_QUEUE: usize = 64;

/// The whole protocol stack around one serial device.
pub struct Emulator<S: SerialIo> {
    serial: S,
    deframer: Deframer,
    transport: Transport,
    slave: Slave,
    snapshots: Snapshots,
    updater: Updater,
    requests: mpsc::Receiver<SetRequest>,
    telemetry: mpsc::Sender<Telemetry>,
    stop: Arc<AtomicBool>,
}

impl<S: SerialIo> Emulator<S> {
    /// Build an emulator around an open serial device.
    pub fn new(serial: S, config: &Config) -> (Self, Handles) {
        let (req_tx, req_rx) = mpsc::sync_channel(REQUEST_QUEUE);
        let (tel_tx, tel_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        (
            Self {
                serial,
                deframer: Deframer::new(),
                transport: Transport::new(),
                slave: Slave::new(config.nad),
                snapshots: Snapshots::new(),
                updater: Updater::new(config.defaults(), config.timing()),
                requests: req_rx,
                telemetry: tel_tx,
                stop: stop.clone(),
            },
            Handles {
                requests: req_tx,
                telemetry: tel_rx,
                stop,
            },
        )
    }

    /// Run until the stop flag is raised. Serial errors are fatal and
    /// bubble up; everything else is handled in place.
    pub fn run(&mut self) -> Result<()> {
        info!("iNet box emulator up, NAD 0x{:02X}", self.slave.nad());
        let mut buf = [0u8; 64];
        while !self.stop.load(Ordering::Relaxed) {
            let chunk = self.serial.read_chunk(&mut buf)?;
            let now = Instant::now();
            for i in 0..chunk.len {
                let after_gap = chunk.after_gap && i == 0;
                if let Some(ev) = self.deframer.push(buf[i], after_gap) {
                    self.handle_bus_event(ev, now)?;
                }
            }
            self.drain_requests(now);
            self.transport.tick(now);
            let events = self.updater.tick(now);
            self.apply(events);
        }
        // Late requests still get validated, so the caller hears about
        // mistakes even during shutdown. They will never reach the bus.
        self.drain_requests(Instant::now());
        info!("shutting down");
        Ok(())
    }

    fn handle_bus_event(&mut self, ev: DeframerEvent, now: Instant) -> Result<()> {
        match ev {
            DeframerEvent::Header(pid) => {
                let (response, event) = self.slave.response_for_header(pid.id(), &mut self.transport);
                if let Some(bytes) = response {
                    self.serial.write_frame(&bytes)?;
                }
                if let Some(SlaveEvent::Pulled(schema)) = event {
                    let events = self.updater.buffer_pulled(schema, now);
                    self.apply(events);
                }
            }
            DeframerEvent::Frame(frame) => self.handle_frame(frame, now),
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        let id = frame.pid.id();
        if id == ID_DIAG_REQUEST {
            let Ok(data) = <&[u8; 8]>::try_from(frame.data.as_slice()) else {
                return;
            };
            let Some(pdu) = self.transport.handle_request(data, self.slave.nad(), now) else {
                return;
            };
            let event = self.slave.handle_pdu(
                pdu.nad,
                pdu.sid,
                &pdu.payload,
                &mut self.transport,
                &mut self.snapshots,
                self.updater.committed(),
            );
            match event {
                Some(SlaveEvent::StatusDecoded(schema, map)) => {
                    // Identity and clock downloads land on the same
                    // stream as the heater status; the keys differ.
                    debug!("decoded inbound {}", schema.name);
                    self.send(Telemetry::DisplayStatus(map));
                }
                Some(SlaveEvent::UploadQueued(schema, map)) => {
                    debug!("queued outbound {}", schema.name);
                    self.send(Telemetry::ControlStatus(map));
                }
                Some(SlaveEvent::Pulled(_)) | None => {}
            }
        } else if ID_BROADCAST.contains(&id) {
            trace!("CP Plus broadcast on 0x{id:02X}");
            let events = self.updater.broadcast_seen(now);
            self.apply(events);
        } else if self.slave.answers(id) {
            trace!("echo of our own response on 0x{id:02X}");
        } else {
            trace!("frame for someone else on 0x{id:02X}");
        }
    }

    fn drain_requests(&mut self, now: Instant) {
        while let Ok(req) = self.requests.try_recv() {
            match self.updater.apply_request(&req.name, &req.value, now) {
                Ok(events) => self.apply(events),
                Err(Error::InvalidSetting { key, reason }) => {
                    warn!("rejected {key}: {reason}");
                    self.send(Telemetry::Error { key, reason });
                }
                Err(e) => {
                    warn!("rejected {}: {e}", req.name);
                    self.send(Telemetry::Error {
                        key: req.name,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn apply(&mut self, events: Vec<UpdaterEvent>) {
        for ev in events {
            match ev {
                UpdaterEvent::State(s) => self.send(Telemetry::UpdateStatus(s)),
                UpdaterEvent::CpPlus(s) => self.send(Telemetry::CpPlusStatus(s)),
                UpdaterEvent::UpdatePending(b) => self.slave.set_update_pending(b),
            }
        }
    }

    fn send(&self, t: Telemetry) {
        // A gone consumer is not our problem; the bus side keeps going.
        let _ = self.telemetry.send(t);
    }
}
