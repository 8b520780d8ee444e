//! Integration tests exercising the full `Acd` state machine through a
//! `MockReactor`. These drive real raw-socket creation in `start()`, which
//! needs `CAP_NET_RAW` (or root); skipped otherwise.

use ipv4acd::clock::{Clock, MonotonicTime};
use ipv4acd::jitter::Jitter;
use ipv4acd::notify::Event;
use ipv4acd::reactor::{MockReactor, Priority};
use ipv4acd::socket;
use ipv4acd::types::{Ipv4Addr, MacAddr};
use ipv4acd::Acd;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

#[derive(Clone)]
struct TestClock(Rc<Cell<Duration>>);

impl TestClock {
    fn new() -> Self {
        TestClock(Rc::new(Cell::new(Duration::ZERO)))
    }

    fn advance(&self, d: Duration) {
        self.0.set(self.0.get() + d);
    }
}

impl Clock for TestClock {
    fn now(&self) -> MonotonicTime {
        MonotonicTime::from_offset(self.0.get())
    }
}

/// Always draws zero, so scheduled delays are exactly the RFC minimums —
/// deterministic and easy to assert on.
struct ZeroJitter;

impl Jitter for ZeroJitter {
    fn uniform(&mut self, _bound: Duration) -> Duration {
        Duration::ZERO
    }
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

struct Fixture {
    acd: Acd,
    reactor: Rc<RefCell<MockReactor>>,
    clock: TestClock,
    events: Rc<RefCell<Vec<Event>>>,
    ifindex: i32,
    address: Ipv4Addr,
}

fn fixture() -> Fixture {
    let ifindex = socket::if_nametoindex("lo").expect("loopback interface must exist");
    let address = Ipv4Addr::new(169, 254, 5, 7);
    let acd = Acd::new();
    acd.set_ifindex(ifindex).unwrap();
    acd.set_mac(MacAddr::new([0x02, 0, 0, 0, 0, 1])).unwrap();
    acd.set_address(address).unwrap();

    let (reactor, shared) = MockReactor::shared();
    acd.attach_event(Some(reactor), Priority::default()).unwrap();

    let clock = TestClock::new();
    acd.set_test_sources(Box::new(clock.clone()), Box::new(ZeroJitter));

    let events = Rc::new(RefCell::new(Vec::new()));
    let events_for_cb = events.clone();
    acd.set_callback(move |event| events_for_cb.borrow_mut().push(event));

    Fixture {
        acd,
        reactor: shared,
        clock,
        events,
        ifindex,
        address,
    }
}

/// Transmits a real gratuitous ARP over `lo`, claiming `f.address` from
/// `attacker_mac`. `lo` delivers a socket's own output back to every
/// `AF_PACKET` listener bound to it, so this lands on the fixture's real
/// socket the same way a genuine conflicting host's announcement would,
/// letting `fire_io` exercise the actual `recv_frame`/classify path instead
/// of only its EAGAIN branch.
fn inject_conflicting_announcement(f: &Fixture, attacker_mac: MacAddr) {
    let fd = socket::open_raw_arp_socket(f.ifindex, f.address, attacker_mac)
        .expect("failed to open the attacker's raw socket");
    socket::send_announcement(fd, f.ifindex, f.address, attacker_mac)
        .expect("failed to send the spoofed announcement");
    socket::close_socket(fd);
}

/// Fires the single pending timer and advances the test clock to its
/// deadline first, so `saturating_duration_since` computations inside the
/// engine see a consistent timeline.
fn fire_timer(f: &Fixture) {
    let deadline = f
        .reactor
        .borrow()
        .pending_timer_deadline()
        .expect("a timer should be pending");
    let now = f.clock.now();
    f.clock.advance(deadline.saturating_duration_since(now));
    MockReactor::fire_timer(&f.reactor);
}

fn fire_io(f: &Fixture) {
    MockReactor::fire_io(&f.reactor);
}

#[test]
fn unchallenged_claim_binds_after_probes_and_announcements() {
    if !is_root() {
        eprintln!("skipping: requires CAP_NET_RAW to open an AF_PACKET socket");
        return;
    }
    let f = fixture();
    f.acd.start().unwrap();

    fire_timer(&f); // STARTED -> WAITING_PROBE
    fire_timer(&f); // probe 1 -> PROBING
    fire_timer(&f); // probe 2 -> PROBING
    fire_timer(&f); // probe 3 -> WAITING_ANNOUNCE
    fire_timer(&f); // announcement 1 -> ANNOUNCING, BIND
    fire_timer(&f); // announcement 2 -> RUNNING

    assert!(f.acd.is_running());
    assert_eq!(f.events.borrow().as_slice(), &[Event::Bind]);
    assert_eq!(f.reactor.borrow().pending_timer_count(), 0);
    assert_eq!(f.acd.conflict_count(), 0);

    f.acd.stop();
}

#[test]
fn early_conflict_during_probing_resets_to_init() {
    if !is_root() {
        eprintln!("skipping: requires CAP_NET_RAW to open an AF_PACKET socket");
        return;
    }
    let f = fixture();
    f.acd.start().unwrap();

    fire_timer(&f); // STARTED -> WAITING_PROBE
    fire_timer(&f); // probe 1 -> PROBING

    inject_conflicting_announcement(&f, MacAddr::new([2, 0, 0, 0, 0, 9]));
    fire_io(&f); // any frame delivered here is a conflict

    assert!(!f.acd.is_running());
    assert_eq!(f.acd.conflict_count(), 1);
    assert_eq!(f.reactor.borrow().pending_timer_count(), 0);
    assert_eq!(f.reactor.borrow().pending_io_count(), 0);
    match f.events.borrow().as_slice() {
        [Event::Conflict(_)] => {}
        other => panic!("expected a single Conflict event, got {other:?}"),
    }
}

#[test]
fn non_conflicting_traffic_in_running_is_ignored() {
    if !is_root() {
        eprintln!("skipping: requires CAP_NET_RAW to open an AF_PACKET socket");
        return;
    }
    let f = fixture();
    f.acd.start().unwrap();
    for _ in 0..6 {
        fire_timer(&f);
    }
    assert!(f.acd.is_running());

    // No frame is actually queued on the mock io watcher's fd (this harness
    // never injects real packets), but firing it still exercises the
    // non-blocking-read path: with nothing to read, recv_frame reports
    // EAGAIN and the callback returns without mutating state.
    fire_io(&f);

    assert!(f.acd.is_running());
    assert_eq!(f.acd.conflict_count(), 0);
    assert_eq!(f.events.borrow().as_slice(), &[Event::Bind]);

    f.acd.stop();
}

#[test]
fn conflict_is_defended_while_running() {
    if !is_root() {
        eprintln!("skipping: requires CAP_NET_RAW to open an AF_PACKET socket");
        return;
    }
    let f = fixture();
    f.acd.start().unwrap();
    for _ in 0..6 {
        fire_timer(&f);
    }
    assert!(f.acd.is_running());

    f.clock.advance(Duration::from_secs(1));
    inject_conflicting_announcement(&f, MacAddr::new([2, 0, 0, 0, 0, 9]));
    fire_io(&f);

    assert!(f.acd.is_running());
    assert_eq!(f.acd.conflict_count(), 0);
    assert_eq!(f.events.borrow().as_slice(), &[Event::Bind]);

    f.acd.stop();
}

#[test]
fn repeat_conflict_while_running_resets_to_init() {
    if !is_root() {
        eprintln!("skipping: requires CAP_NET_RAW to open an AF_PACKET socket");
        return;
    }
    let f = fixture();
    f.acd.start().unwrap();
    for _ in 0..6 {
        fire_timer(&f);
    }
    assert!(f.acd.is_running());

    // First conflict: defended, still RUNNING, inside DEFEND_INTERVAL's window.
    f.clock.advance(Duration::from_secs(1));
    inject_conflicting_announcement(&f, MacAddr::new([2, 0, 0, 0, 0, 9]));
    fire_io(&f);
    assert!(f.acd.is_running());

    // Second conflict one second later, still well inside the defend window:
    // this one resets to INIT and delivers CONFLICT instead of re-defending.
    f.clock.advance(Duration::from_secs(1));
    inject_conflicting_announcement(&f, MacAddr::new([2, 0, 0, 0, 0, 10]));
    fire_io(&f);

    assert!(!f.acd.is_running());
    assert_eq!(f.acd.conflict_count(), 1);
    match f.events.borrow().as_slice() {
        [Event::Bind, Event::Conflict(_)] => {}
        other => panic!("expected Bind then a single Conflict event, got {other:?}"),
    }
}

#[test]
fn rate_limiting_kicks_in_after_max_conflicts() {
    if !is_root() {
        eprintln!("skipping: requires CAP_NET_RAW to open an AF_PACKET socket");
        return;
    }
    let f = fixture();

    for _ in 0..ipv4acd::constants::MAX_CONFLICTS {
        f.acd.start().unwrap();
        fire_timer(&f); // STARTED -> WAITING_PROBE
        inject_conflicting_announcement(&f, MacAddr::new([2, 0, 0, 0, 0, 9]));
        fire_io(&f);
        assert!(!f.acd.is_running());
    }
    assert_eq!(f.acd.conflict_count(), ipv4acd::constants::MAX_CONFLICTS);

    f.acd.start().unwrap();
    let before = f.clock.now();
    fire_timer(&f); // STARTED -> WAITING_PROBE, rate limiting engages here

    let deadline = f
        .reactor
        .borrow()
        .pending_timer_deadline()
        .expect("a rate-limited timer should still be scheduled");
    assert!(deadline.saturating_duration_since(before) >= ipv4acd::constants::RATE_LIMIT_INTERVAL);
    assert_eq!(f.acd.conflict_count(), 0);

    f.acd.stop();
}

#[test]
fn stop_before_start_is_a_no_op() {
    let acd = Acd::new();
    acd.stop();
    assert!(!acd.is_running());
}

#[test]
fn start_without_configuration_fails() {
    let acd = Acd::new();
    let (reactor, _shared) = MockReactor::shared();
    acd.attach_event(Some(reactor), Priority::default()).unwrap();
    assert!(acd.start().is_err());
}

#[test]
fn set_mac_after_start_is_rejected() {
    if !is_root() {
        eprintln!("skipping: requires CAP_NET_RAW to open an AF_PACKET socket");
        return;
    }
    let f = fixture();
    f.acd.start().unwrap();
    assert!(f.acd.set_mac(MacAddr::new([2, 0, 0, 0, 0, 2])).is_err());
    f.acd.stop();
}
