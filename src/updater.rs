/*! Update coordinator.

Sits between the user and the slave state machine. Incoming
set-requests are validated and collected for a short debounce window,
so that a burst of related changes becomes one buffer on the bus. Once
the window closes the batch is committed: the slave raises its
update-pending bit and the master pulls the encoded buffer at its own
pace.

The coordinator also tracks whether the CP Plus is alive at all. The
master broadcasts status frames every few seconds while running; if
none were seen for half a minute there is no point advertising an
update, and commits are held back until it returns.
 */
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::Result;
use crate::schema::{Schema, StatusMap};
use crate::settings::{self, Defaults};

/// Externally visible coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// Nothing pending.
    Idle,
    /// A batch is waiting for the CP Plus to come back online.
    WaitingForCpPlus,
    /// A batch is collecting during the debounce window.
    WaitingCommit,
    /// The buffer is advertised; waiting for the master to pull it.
    WaitingTruma,
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            UpdateState::Idle => "idle",
            UpdateState::WaitingForCpPlus => "waiting_for_cp_plus",
            UpdateState::WaitingCommit => "waiting_commit",
            UpdateState::WaitingTruma => "waiting_truma",
        })
    }
}

/// Liveness of the bus master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpPlusStatus {
    /// No broadcast seen within the online window.
    Waiting,
    /// The CP Plus is talking.
    Online,
}

impl std::fmt::Display for CpPlusStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CpPlusStatus::Waiting => "waiting",
            CpPlusStatus::Online => "online",
        })
    }
}

/// State changes the caller should forward as telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterEvent {
    /// The coordinator state changed.
    State(UpdateState),
    /// The master liveness changed.
    CpPlus(CpPlusStatus),
    /// The update-pending bit the slave advertises changed.
    UpdatePending(bool),
}

/// Timing knobs, all from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Debounce window for set-request batches.
    pub buffer_time: Duration,
    /// How long to wait for the master's pull before re-warning.
    pub pull_timeout: Duration,
    /// Master counts as online this long after its last broadcast.
    pub online_window: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            buffer_time: Duration::from_secs(1),
            pull_timeout: Duration::from_secs(10),
            online_window: Duration::from_secs(30),
        }
    }
}

/// Debounces user settings and feeds them to the slave at the right
/// moment.
pub struct Updater {
    defaults: Defaults,
    timing: Timing,
    state: UpdateState,
    /// Batch still inside the debounce window.
    pending: StatusMap,
    /// Batch advertised to the master, not yet pulled.
    committed: StatusMap,
    commit_at: Option<Instant>,
    pull_deadline: Option<Instant>,
    last_broadcast: Option<Instant>,
    reported_cp: CpPlusStatus,
}

impl Updater {
    /// New coordinator in idle state, master presumed absent.
    #[must_use]
    pub fn new(defaults: Defaults, timing: Timing) -> Self {
        Self {
            defaults,
            timing,
            state: UpdateState::Idle,
            pending: StatusMap::new(),
            committed: StatusMap::new(),
            commit_at: None,
            pull_deadline: None,
            last_broadcast: None,
            reported_cp: CpPlusStatus::Waiting,
        }
    }

    /// Current coordinator state.
    #[must_use]
    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// True while a committed batch waits for the master.
    #[must_use]
    pub fn update_pending(&self) -> bool {
        !self.committed.is_empty()
    }

    /// The committed batch, for the buffer encoder.
    #[must_use]
    pub fn committed(&self) -> &StatusMap {
        &self.committed
    }

    fn cp_plus_status(&self, now: Instant) -> CpPlusStatus {
        match self.last_broadcast {
            Some(t) if now.duration_since(t) < self.timing.online_window => CpPlusStatus::Online,
            _ => CpPlusStatus::Waiting,
        }
    }

    fn set_state(&mut self, state: UpdateState, events: &mut Vec<UpdaterEvent>) {
        if self.state != state {
            debug!("update state {} -> {state}", self.state);
            self.state = state;
            events.push(UpdaterEvent::State(state));
        }
    }

    /// Apply one user set-request. On success the debounce window
    /// (re)starts; on failure nothing changes and the error describes
    /// the offending key.
    pub fn apply_request(
        &mut self,
        key: &str,
        value: &str,
        now: Instant,
    ) -> Result<Vec<UpdaterEvent>> {
        let entries = settings::parse_request(key, value, &self.defaults)?;
        // Validate the would-be batch before touching the real one, so
        // a rejected request leaves no trace.
        let mut trial = self.pending.clone();
        trial.extend(entries);
        settings::cross_validate(&mut trial, &self.defaults)?;
        self.pending = trial;
        self.commit_at = Some(now + self.timing.buffer_time);
        let mut events = Vec::new();
        self.set_state(UpdateState::WaitingCommit, &mut events);
        Ok(events)
    }

    /// Note a master broadcast frame (0x20 class).
    pub fn broadcast_seen(&mut self, now: Instant) -> Vec<UpdaterEvent> {
        self.last_broadcast = Some(now);
        self.tick(now)
    }

    /// The master pulled the upload for `schema`; drop its part of the
    /// committed batch.
    pub fn buffer_pulled(&mut self, schema: &Schema, now: Instant) -> Vec<UpdaterEvent> {
        let before = self.committed.len();
        self.committed.retain(|k, _| !schema.has_field(k));
        let mut events = Vec::new();
        if before != self.committed.len() {
            info!("CP Plus pulled {}", schema.name);
        }
        if self.committed.is_empty() && before > 0 {
            events.push(UpdaterEvent::UpdatePending(false));
            self.pull_deadline = None;
            if self.state == UpdateState::WaitingTruma {
                self.set_state(UpdateState::Idle, &mut events);
            }
        }
        events.extend(self.tick(now));
        events
    }

    fn commit(&mut self, now: Instant, events: &mut Vec<UpdaterEvent>) {
        let was_pending = self.update_pending();
        self.committed.extend(std::mem::take(&mut self.pending));
        self.commit_at = None;
        self.pull_deadline = Some(now + self.timing.pull_timeout);
        self.set_state(UpdateState::WaitingTruma, events);
        if !was_pending {
            events.push(UpdaterEvent::UpdatePending(true));
        }
        info!(
            "committed {} settings, advertising update to the CP Plus",
            self.committed.len()
        );
    }

    /// Drive the timers. Call once per loop iteration.
    pub fn tick(&mut self, now: Instant) -> Vec<UpdaterEvent> {
        let mut events = Vec::new();

        let cp = self.cp_plus_status(now);
        if cp != self.reported_cp {
            info!("CP Plus is {cp}");
            self.reported_cp = cp;
            events.push(UpdaterEvent::CpPlus(cp));
        }

        match self.state {
            UpdateState::WaitingCommit => {
                if let Some(at) = self.commit_at
                    && now >= at
                {
                    if cp == CpPlusStatus::Online {
                        self.commit(now, &mut events);
                    } else {
                        warn!("CP Plus not seen, holding the update back");
                        self.set_state(UpdateState::WaitingForCpPlus, &mut events);
                    }
                }
            }
            UpdateState::WaitingForCpPlus => {
                if cp == CpPlusStatus::Online {
                    self.commit(now, &mut events);
                }
            }
            UpdateState::WaitingTruma => {
                if let Some(at) = self.pull_deadline
                    && now >= at
                {
                    warn!("CP Plus has not pulled the update yet, still advertising");
                    self.pull_deadline = Some(now + self.timing.pull_timeout);
                }
            }
            UpdateState::Idle => {}
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CLOCK_WRITE, CONTROL_WRITE, Value};

    fn updater() -> Updater {
        Updater::new(Defaults::default(), Timing::default())
    }

    fn online(u: &mut Updater, now: Instant) {
        u.broadcast_seen(now);
    }

    #[test]
    fn set_workflow() {
        let mut u = updater();
        let t0 = Instant::now();
        online(&mut u, t0);

        let ev = u.apply_request("target_temp_room", "20", t0).unwrap();
        assert_eq!(ev, vec![UpdaterEvent::State(UpdateState::WaitingCommit)]);
        u.apply_request("heating_mode", "eco", t0 + Duration::from_millis(300))
            .unwrap();

        // Debounce window still open.
        assert!(u.tick(t0 + Duration::from_millis(900)).is_empty());
        assert!(!u.update_pending());

        // Window closed: one commit for both settings.
        let ev = u.tick(t0 + Duration::from_millis(1400));
        assert!(ev.contains(&UpdaterEvent::State(UpdateState::WaitingTruma)));
        assert!(ev.contains(&UpdaterEvent::UpdatePending(true)));
        assert!(u.update_pending());
        assert_eq!(u.committed()["target_temp_room"], Value::Temp(20.0));
        assert_eq!(u.committed()["heating_mode"], Value::Name("eco"));

        // Master pulls; back to idle.
        let ev = u.buffer_pulled(&CONTROL_WRITE, t0 + Duration::from_secs(2));
        assert!(ev.contains(&UpdaterEvent::UpdatePending(false)));
        assert!(ev.contains(&UpdaterEvent::State(UpdateState::Idle)));
        assert!(!u.update_pending());
    }

    #[test]
    fn rejection_leaves_state_alone() {
        let mut u = updater();
        let t0 = Instant::now();
        online(&mut u, t0);
        assert!(u.apply_request("target_temp_water", "50", t0).is_err());
        assert_eq!(u.state(), UpdateState::Idle);
        assert!(u.tick(t0 + Duration::from_secs(5)).is_empty());
        assert!(!u.update_pending());
    }

    #[test]
    fn holds_for_cp_plus() {
        let mut u = updater();
        let t0 = Instant::now();
        u.apply_request("target_temp_room", "20", t0).unwrap();
        let ev = u.tick(t0 + Duration::from_secs(2));
        assert!(ev.contains(&UpdaterEvent::State(UpdateState::WaitingForCpPlus)));
        assert!(!u.update_pending());

        // The master shows up; the commit goes through.
        let ev = u.broadcast_seen(t0 + Duration::from_secs(3));
        assert!(ev.contains(&UpdaterEvent::CpPlus(CpPlusStatus::Online)));
        assert!(ev.contains(&UpdaterEvent::State(UpdateState::WaitingTruma)));
        assert!(u.update_pending());
    }

    #[test]
    fn online_window_expires() {
        let mut u = updater();
        let t0 = Instant::now();
        let ev = u.broadcast_seen(t0);
        assert_eq!(ev, vec![UpdaterEvent::CpPlus(CpPlusStatus::Online)]);
        assert!(u.tick(t0 + Duration::from_secs(29)).is_empty());
        let ev = u.tick(t0 + Duration::from_secs(31));
        assert_eq!(ev, vec![UpdaterEvent::CpPlus(CpPlusStatus::Waiting)]);
    }

    #[test]
    fn watchdog_does_not_retract() {
        let mut u = updater();
        let t0 = Instant::now();
        online(&mut u, t0);
        u.apply_request("target_temp_room", "20", t0).unwrap();
        u.tick(t0 + Duration::from_millis(1100));
        assert!(u.update_pending());
        // Way past the pull timeout: still pending, still waiting.
        assert!(u.tick(t0 + Duration::from_secs(15)).is_empty());
        assert!(u.update_pending());
        assert_eq!(u.state(), UpdateState::WaitingTruma);
    }

    #[test]
    fn partial_pull_keeps_pending() {
        let mut u = updater();
        let t0 = Instant::now();
        online(&mut u, t0);
        u.apply_request("target_temp_room", "20", t0).unwrap();
        u.apply_request("clock", "13:37:09", t0).unwrap();
        u.tick(t0 + Duration::from_secs(2));
        assert!(u.update_pending());

        // The heater buffer is pulled, the clock part remains.
        let ev = u.buffer_pulled(&CONTROL_WRITE, t0 + Duration::from_secs(3));
        assert!(!ev.contains(&UpdaterEvent::UpdatePending(false)));
        assert!(u.update_pending());
        assert_eq!(u.state(), UpdateState::WaitingTruma);

        let ev = u.buffer_pulled(&CLOCK_WRITE, t0 + Duration::from_secs(4));
        assert!(ev.contains(&UpdaterEvent::UpdatePending(false)));
        assert!(!u.update_pending());
        assert_eq!(u.state(), UpdateState::Idle);
    }
}
