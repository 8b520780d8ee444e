//! The seven-state ACD automaton. This is the largest and most
//! load-bearing module in the crate.
//!
//! `Inner` holds the full data model; `on_timer`/`on_packet` are the two
//! event entry points, each re-reading the current state afresh so
//! correctness does not depend on the relative order the two event
//! sources fire in.

use crate::classify::{self, ArpFrame};
use crate::clock::{Clock, MonotonicTime, SystemClock};
use crate::constants::*;
use crate::errno::Errno;
use crate::jitter::{Jitter, SystemJitter};
use crate::notify::{Callback, ConflictInfo, Event};
use crate::reactor::{IoHandle, Priority, Reactor, TimerHandle};
use crate::socket;
use crate::types::{Ipv4Addr, MacAddr};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// The seven states of the conflict-detection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Started,
    WaitingProbe,
    Probing,
    WaitingAnnounce,
    Announcing,
    Running,
}

/// Configuration rejected by a setter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The setter is only legal in `Init` (or some other documented state).
    WrongState,
    /// The argument itself is invalid (zero ifindex, zero MAC/address, ...).
    InvalidArgument,
}

/// Failure of `start()`.
#[derive(Debug)]
pub enum StartError {
    Config(ConfigError),
    NotConfigured(&'static str),
    Io(Errno),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::Config(e) => write!(f, "configuration error: {e:?}"),
            StartError::NotConfigured(field) => write!(f, "not configured: {field}"),
            StartError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StartError {}

/// The ACD instance's full data model.
pub struct Inner {
    self_weak: Weak<RefCell<Inner>>,

    state: State,
    ifindex: Option<i32>,
    mac: Option<MacAddr>,
    address: Option<Ipv4Addr>,

    iteration: u32,
    conflict_count: u32,
    defend_window_deadline: Option<MonotonicTime>,
    next_deadline: Option<MonotonicTime>,

    socket: Option<RawFd>,
    timer: Option<TimerHandle>,
    io: Option<IoHandle>,

    reactor: Option<Reactor>,
    reactor_priority: Priority,

    callback: Option<Callback>,
    pending_event: Option<Event>,

    clock: Box<dyn Clock>,
    jitter: Box<dyn Jitter>,
}

impl Inner {
    pub(crate) fn new(self_weak: Weak<RefCell<Inner>>) -> Self {
        Inner {
            self_weak,
            state: State::Init,
            ifindex: None,
            mac: None,
            address: None,
            iteration: 0,
            conflict_count: 0,
            defend_window_deadline: None,
            next_deadline: None,
            socket: None,
            timer: None,
            io: None,
            reactor: None,
            reactor_priority: Priority::default(),
            callback: None,
            pending_event: None,
            clock: Box::new(SystemClock),
            jitter: Box::new(SystemJitter),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn conflict_count(&self) -> u32 {
        self.conflict_count
    }

    /// Monotonic deadline of the next scheduled wakeup, if any. A
    /// diagnostic accessor; not consulted by the state machine itself.
    pub fn announce_deadline(&self) -> Option<MonotonicTime> {
        self.next_deadline
    }

    /// Overrides the clock and jitter sources, for deterministic tests:
    /// both randomness and monotonic time are injectable so scheduling
    /// decisions can be asserted on without waiting on real time.
    pub fn set_test_sources(&mut self, clock: Box<dyn Clock>, jitter: Box<dyn Jitter>) {
        self.clock = clock;
        self.jitter = jitter;
    }

    // ---- configuration ----

    pub fn set_ifindex(&mut self, ifindex: i32) -> Result<(), ConfigError> {
        self.require_init()?;
        if ifindex <= 0 {
            return Err(ConfigError::InvalidArgument);
        }
        self.ifindex = Some(ifindex);
        Ok(())
    }

    pub fn set_mac(&mut self, mac: MacAddr) -> Result<(), ConfigError> {
        self.require_init()?;
        self.mac = Some(mac);
        Ok(())
    }

    pub fn set_address(&mut self, address: Ipv4Addr) -> Result<(), ConfigError> {
        self.require_init()?;
        self.address = Some(address);
        Ok(())
    }

    pub fn attach_event(
        &mut self,
        reactor: Option<Reactor>,
        priority: Priority,
    ) -> Result<(), ConfigError> {
        if self.reactor.is_some() {
            return Err(ConfigError::WrongState);
        }
        self.reactor = Some(reactor.unwrap_or_else(|| {
            Reactor::new(
                crate::reactor::EpollReactor::new()
                    .expect("failed to create the default reactor backend"),
            )
        }));
        self.reactor_priority = priority;
        Ok(())
    }

    pub fn detach_event(&mut self) {
        self.reactor = None;
    }

    pub fn set_callback(&mut self, callback: Callback) {
        self.callback = Some(callback);
    }

    fn require_init(&self) -> Result<(), ConfigError> {
        if self.state != State::Init {
            Err(ConfigError::WrongState)
        } else {
            Ok(())
        }
    }

    // ---- lifecycle ----

    pub fn start(&mut self) -> Result<(), StartError> {
        if self.state != State::Init {
            return Err(StartError::Config(ConfigError::WrongState));
        }
        let ifindex = self.ifindex.ok_or(StartError::NotConfigured("ifindex"))?;
        let mac = self.mac.ok_or(StartError::NotConfigured("mac"))?;
        let address = self.address.ok_or(StartError::NotConfigured("address"))?;
        if mac.is_zero() {
            return Err(StartError::Config(ConfigError::InvalidArgument));
        }
        if address.is_unspecified() {
            return Err(StartError::Config(ConfigError::InvalidArgument));
        }
        let reactor = self
            .reactor
            .clone()
            .ok_or(StartError::NotConfigured("reactor"))?;

        let fd = socket::open_raw_arp_socket(ifindex, address, mac).map_err(StartError::Io)?;

        let weak_for_io = self.self_weak.clone();
        let io = reactor.add_io(fd, self.reactor_priority, "ipv4acd-socket", move || {
            if let Some(this) = weak_for_io.upgrade() {
                Inner::on_packet(&this);
            }
        });

        self.socket = Some(fd);
        self.io = Some(io);
        // `conflict_count` is deliberately left untouched here: start()
        // resets `iteration` only. It persists across repeated start()
        // calls so the rate-limiting check in on_timer_started can see it.
        self.iteration = 0;
        self.state = State::Started;

        self.schedule_timer(Duration::ZERO, "ipv4acd-started");
        log::debug!(
            "ipv4acd: started on ifindex {ifindex} for {address} ({mac})"
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        let was_running = self.state != State::Init;
        self.reset_to_init();
        if was_running {
            self.notify(Event::Stop);
        }
    }

    pub fn is_running(&self) -> bool {
        self.state != State::Init
    }

    fn reset_to_init(&mut self) {
        self.timer = None;
        self.io = None;
        if let Some(fd) = self.socket.take() {
            socket::close_socket(fd);
        }
        self.state = State::Init;
        self.iteration = 0;
        self.defend_window_deadline = None;
        self.next_deadline = None;
    }

    /// Queues `event` for delivery once the caller has released its borrow
    /// of this `Inner`. Never calls the client callback directly: the
    /// callback is allowed to call back into `Acd` (e.g. `start()` from a
    /// `CONFLICT` handler), which would re-borrow this same `RefCell` and
    /// panic if invoked while a borrow is still held here.
    fn notify(&mut self, event: Event) {
        self.pending_event = Some(event);
    }

    /// Delivers an event queued by [`Inner::notify`], if any, with no
    /// borrow of `this` held while the callback runs.
    pub(crate) fn deliver_pending(this: &Rc<RefCell<Inner>>) {
        let Some(event) = this.borrow_mut().pending_event.take() else {
            return;
        };
        let mut callback = this.borrow_mut().callback.take();
        if let Some(cb) = callback.as_mut() {
            cb(event);
        }
        if let Some(cb) = callback {
            let mut inner = this.borrow_mut();
            if inner.callback.is_none() {
                inner.callback = Some(cb);
            }
        }
    }

    // ---- scheduling ----

    fn schedule_timer(&mut self, delay: Duration, description: &'static str) {
        let Some(reactor) = self.reactor.clone() else {
            return;
        };
        let now = self.clock.now();
        let deadline = now.checked_add(delay).unwrap_or(now);
        self.next_deadline = Some(deadline);
        let weak = self.self_weak.clone();
        let handle = reactor.add_timer(deadline, self.reactor_priority, description, move || {
            if let Some(this) = weak.upgrade() {
                Inner::on_timer(&this);
            }
        });
        self.timer = Some(handle);
    }

    fn draw_jitter(&mut self, bound: Duration) -> Duration {
        self.jitter.uniform(bound)
    }

    // ---- event entry points ----

    /// Dispatches a timer expiration. Consults the current state afresh
    /// on every call rather than caching it across invocations.
    pub fn on_timer(this: &Rc<RefCell<Inner>>) {
        {
            let mut inner = this.borrow_mut();
            match inner.state {
                State::Init => {}
                State::Started => inner.on_timer_started(),
                State::WaitingProbe | State::Probing => inner.on_timer_probing(),
                State::WaitingAnnounce | State::Announcing => inner.on_timer_announcing(),
                State::Running => {}
            }
        }
        Inner::deliver_pending(this);
    }

    /// Dispatches an inbound ARP frame. Consults the current state afresh.
    pub fn on_packet(this: &Rc<RefCell<Inner>>) {
        Inner::on_packet_locked(this);
        Inner::deliver_pending(this);
    }

    /// The borrowing half of `on_packet`, split out so the borrow of
    /// `this` is fully released (see `deliver_pending`) before any queued
    /// event reaches the client callback.
    fn on_packet_locked(this: &Rc<RefCell<Inner>>) {
        let mut inner = this.borrow_mut();
        let Some(fd) = inner.socket else { return };

        let mut buf = [0u8; 128];
        let n = match socket::recv_frame(fd, &mut buf) {
            Ok(n) => n,
            Err(e) if e.would_block_or_interrupted() => return,
            Err(e) => {
                log::error!("ipv4acd: fatal receive error: {e}");
                inner.fatal_stop();
                return;
            }
        };
        let frame = ArpFrame::parse(&buf[..n]);

        match inner.state {
            State::Init | State::Started => {}
            State::WaitingProbe | State::Probing | State::WaitingAnnounce => {
                // Any qualifying frame delivered here is a conflict; the
                // external filter has already screened non-interesting
                // traffic, so the classifier is not reapplied (see
                // DESIGN.md, Open Question OQ-2).
                let sender_mac = frame.map(|f| f.sender_hardware_address());
                inner.handle_conflict(sender_mac);
            }
            State::Announcing | State::Running => {
                let Some(frame) = frame else { return };
                let address = inner.address.expect("address set while running");
                if !classify::is_conflict(&frame, address) {
                    return;
                }
                let now = inner.clock.now();
                match inner.defend_window_deadline {
                    Some(deadline) if now <= deadline => {
                        inner.handle_conflict(Some(frame.sender_hardware_address()));
                    }
                    _ => inner.defend(now),
                }
            }
        }
    }

    fn on_timer_started(&mut self) {
        self.state = State::WaitingProbe;
        self.iteration = 0;
        if self.conflict_count >= MAX_CONFLICTS {
            log::warn!(
                "ipv4acd: rate limiting engaged after {} conflicts, cooling down for {:?}",
                self.conflict_count,
                RATE_LIMIT_INTERVAL
            );
            let extra = self.draw_jitter(PROBE_WAIT);
            self.conflict_count = 0;
            self.schedule_timer(RATE_LIMIT_INTERVAL + extra, "ipv4acd-probe-wait-ratelimited");
        } else {
            let delay = self.draw_jitter(PROBE_WAIT);
            self.schedule_timer(delay, "ipv4acd-probe-wait");
        }
    }

    /// Shared WAITING_PROBE/PROBING timer logic. `iteration` here counts
    /// probes already sent in this group; the thresholds are chosen to
    /// send exactly `PROBE_NUM` probes with `PROBE_NUM - 1` inter-probe
    /// gaps (see DESIGN.md, Open Question OQ-4, for the reasoning behind
    /// this exact count).
    fn on_timer_probing(&mut self) {
        let (ifindex, address, mac, fd) = match self.started_fields() {
            Some(f) => f,
            None => return,
        };
        if let Err(e) = socket::send_probe(fd, ifindex, address, mac) {
            log::error!("ipv4acd: fatal error sending probe: {e}");
            self.fatal_stop();
            return;
        }
        self.iteration += 1;
        log::debug!("ipv4acd: sent probe {}/{PROBE_NUM} for {address}", self.iteration);

        if self.iteration < PROBE_NUM {
            self.state = State::Probing;
            let delay = PROBE_MIN + self.draw_jitter(PROBE_MAX - PROBE_MIN);
            self.schedule_timer(delay, "ipv4acd-probe-interval");
        } else {
            self.state = State::WaitingAnnounce;
            self.iteration = 0;
            self.schedule_timer(ANNOUNCE_WAIT, "ipv4acd-announce-wait");
        }
    }

    /// Shared WAITING_ANNOUNCE/ANNOUNCING timer logic; see the threshold
    /// note on `on_timer_probing` above, applied symmetrically here to
    /// send exactly `ANNOUNCE_NUM` announcements.
    fn on_timer_announcing(&mut self) {
        let (ifindex, address, mac, fd) = match self.started_fields() {
            Some(f) => f,
            None => return,
        };
        if let Err(e) = socket::send_announcement(fd, ifindex, address, mac) {
            log::error!("ipv4acd: fatal error sending announcement: {e}");
            self.fatal_stop();
            return;
        }
        let is_first = self.iteration == 0;
        self.iteration += 1;
        self.state = State::Announcing;
        log::debug!(
            "ipv4acd: sent announcement {}/{ANNOUNCE_NUM} for {address}",
            self.iteration
        );

        if is_first {
            self.conflict_count = 0;
            self.notify(Event::Bind);
        }

        if self.iteration < ANNOUNCE_NUM {
            self.schedule_timer(ANNOUNCE_INTERVAL, "ipv4acd-announce-interval");
        } else {
            self.state = State::Running;
            self.iteration = 0;
            self.timer = None;
            self.next_deadline = None;
            log::info!("ipv4acd: bound {address}, now defending");
        }
    }

    fn started_fields(&self) -> Option<(i32, Ipv4Addr, MacAddr, RawFd)> {
        Some((self.ifindex?, self.address?, self.mac?, self.socket?))
    }

    /// Single-defense rule for the ANNOUNCING/RUNNING packet-received case.
    fn defend(&mut self, now: MonotonicTime) {
        let (ifindex, address, mac, fd) = match self.started_fields() {
            Some(f) => f,
            None => return,
        };
        self.defend_window_deadline = now.checked_add(DEFEND_INTERVAL);
        if let Err(e) = socket::send_announcement(fd, ifindex, address, mac) {
            log::error!("ipv4acd: fatal error sending defensive announcement: {e}");
            self.fatal_stop();
            return;
        }
        log::info!("ipv4acd: defended {address} with a gratuitous announcement");
    }

    /// Conflict handler.
    fn handle_conflict(&mut self, sender_mac: Option<MacAddr>) {
        self.conflict_count += 1;
        let address = self.address;
        log::warn!(
            "ipv4acd: conflict detected for {:?}, conflict_count is now {}",
            address,
            self.conflict_count
        );
        self.reset_to_init();
        self.notify(Event::Conflict(sender_mac.map(|sender_mac| ConflictInfo { sender_mac })));
    }

    /// Fatal I/O error escalation path: behaves as if `stop()` had been
    /// called, but emits `STOP` rather than `CONFLICT`, and does not
    /// touch `conflict_count`.
    fn fatal_stop(&mut self) {
        self.reset_to_init();
        self.notify(Event::Stop);
    }
}

impl Drop for Inner {
    /// `timer`/`io` already cancel themselves via their own `Drop` impls;
    /// a raw fd has no such destructor, so it must be closed explicitly
    /// here or the last `Acd` clone going out of scope while running
    /// leaks the socket.
    fn drop(&mut self) {
        if let Some(fd) = self.socket.take() {
            socket::close_socket(fd);
        }
    }
}
