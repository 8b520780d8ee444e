//! Reactor adapter.
//!
//! Abstracts two primitives — a one-shot timer and a persistent readable-fd
//! watcher — behind a small object-safe trait, so the state machine never
//! talks to epoll or timerfd directly. The event loop itself (driving
//! `epoll_wait` in a loop) is an external collaborator this crate does not
//! own, so `Reactor::turn` is the one method this crate provides for an
//! embedder to pump, not something the state machine calls itself.

use crate::clock::MonotonicTime;
use crate::errno::{Errno, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// Scheduling priority shared by a timer and its instance's io watcher.
/// Opaque to this crate; meaningful only to the concrete `Reactor`
/// implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Priority(pub i32);

type Callback = Box<dyn FnMut()>;

/// Object-safe core every reactor backend implements.
///
/// Not used directly by callers; see [`Reactor`] for the handle-returning
/// facade they interact with.
pub trait ReactorCore {
    fn schedule_timer(&mut self, deadline: MonotonicTime, priority: Priority, cb: Callback) -> u64;
    fn cancel_timer(&mut self, id: u64);
    fn register_io(&mut self, fd: RawFd, priority: Priority, cb: Callback) -> u64;
    fn cancel_io(&mut self, id: u64);
}

/// A cloneable, shared handle to a reactor backend.
///
/// `clone()` is cheap (an `Rc` bump) and is how an instance keeps a
/// reference to the reactor it was attached to between `attach_event` and
/// `detach_event`/destruction.
#[derive(Clone)]
pub struct Reactor(Rc<RefCell<dyn ReactorCore>>);

impl Reactor {
    pub fn new(core: impl ReactorCore + 'static) -> Self {
        Reactor(Rc::new(RefCell::new(core)))
    }

    /// Schedules a one-shot timer at `deadline`. Scheduling a new timer on
    /// the same `TimerHandle` variable naturally cancels the old one when
    /// the old handle is dropped — callers are expected to hold at most one
    /// at a time.
    pub fn add_timer(
        &self,
        deadline: MonotonicTime,
        priority: Priority,
        description: impl Into<String>,
        callback: impl FnMut() + 'static,
    ) -> TimerHandle {
        let id = self
            .0
            .borrow_mut()
            .schedule_timer(deadline, priority, Box::new(callback));
        TimerHandle {
            reactor: self.0.clone(),
            id,
            description: description.into(),
        }
    }

    /// Registers a persistent readable-fd watcher.
    pub fn add_io(
        &self,
        fd: RawFd,
        priority: Priority,
        description: impl Into<String>,
        callback: impl FnMut() + 'static,
    ) -> IoHandle {
        let id = self
            .0
            .borrow_mut()
            .register_io(fd, priority, Box::new(callback));
        IoHandle {
            reactor: self.0.clone(),
            id,
            description: description.into(),
        }
    }
}

/// A pending timer; dropping it cancels the timer.
pub struct TimerHandle {
    reactor: Rc<RefCell<dyn ReactorCore>>,
    id: u64,
    description: String,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.reactor.borrow_mut().cancel_timer(self.id);
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerHandle({})", self.description)
    }
}

/// A registered readable-fd watcher; dropping it deregisters the watcher.
pub struct IoHandle {
    reactor: Rc<RefCell<dyn ReactorCore>>,
    id: u64,
    description: String,
}

impl Drop for IoHandle {
    fn drop(&mut self) {
        self.reactor.borrow_mut().cancel_io(self.id);
    }
}

impl fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoHandle({})", self.description)
    }
}

/// Default, real-syscall backend: one `timerfd` per pending timer, all
/// watched (together with the registered io fds) through a single `epoll`
/// instance.
pub struct EpollReactor {
    epoll_fd: RawFd,
    next_id: u64,
    timers: HashMap<u64, TimerSlot>,
    ios: HashMap<u64, Callback>,
}

struct TimerSlot {
    fd: RawFd,
    callback: Callback,
}

impl EpollReactor {
    pub fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        Errno::result(epoll_fd)?;
        Ok(EpollReactor {
            epoll_fd,
            next_id: 0,
            timers: HashMap::new(),
            ios: HashMap::new(),
        })
    }

    /// Blocks for up to `timeout_ms` (`-1` for indefinitely) waiting for any
    /// registered timer or io watcher to become ready, then dispatches the
    /// matching callbacks. This is the pump an embedder drives; the state
    /// machine never calls it itself.
    pub fn turn(&mut self, timeout_ms: i32) -> Result<()> {
        let mut events: [libc::epoll_event; 16] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let e = Errno::last();
            if e.would_block_or_interrupted() {
                return Ok(());
            }
            return Err(e);
        }
        for ev in &events[..n as usize] {
            let id = ev.u64;
            if let Some(slot) = self.timers.get_mut(&id) {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(slot.fd, buf.as_mut_ptr().cast(), buf.len());
                }
                (slot.callback)();
            } else if let Some(cb) = self.ios.get_mut(&id) {
                cb();
            }
        }
        Ok(())
    }

    fn epoll_add(&self, fd: RawFd, id: u64) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: id,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        Errno::result(ret).map(drop)
    }

    fn epoll_del(&self, fd: RawFd) {
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }
}

impl Drop for EpollReactor {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

impl ReactorCore for EpollReactor {
    fn schedule_timer(&mut self, deadline: MonotonicTime, _priority: Priority, cb: Callback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let fd = unsafe { libc::timerfd_create(libc::CLOCK_BOOTTIME, libc::TFD_CLOEXEC) };
        let fd = if fd < 0 {
            unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC) }
        } else {
            fd
        };
        if fd < 0 {
            log::error!("ipv4acd: timerfd_create failed: {}", Errno::last());
            return id;
        }

        use crate::clock::Clock;
        let now = crate::clock::SystemClock.now();
        let delay = deadline.saturating_duration_since(now);
        let its = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as i64,
                tv_nsec: delay.subsec_nanos() as i64,
            },
        };
        let ret = unsafe { libc::timerfd_settime(fd, 0, &its, std::ptr::null_mut()) };
        if ret < 0 {
            log::error!("ipv4acd: timerfd_settime failed: {}", Errno::last());
        }

        if self.epoll_add(fd, id).is_err() {
            log::error!("ipv4acd: epoll_ctl(ADD) on timerfd failed");
        }
        self.timers.insert(id, TimerSlot { fd, callback: cb });
        id
    }

    fn cancel_timer(&mut self, id: u64) {
        if let Some(slot) = self.timers.remove(&id) {
            self.epoll_del(slot.fd);
            unsafe { libc::close(slot.fd) };
        }
    }

    fn register_io(&mut self, fd: RawFd, _priority: Priority, cb: Callback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if self.epoll_add(fd, id).is_err() {
            log::error!("ipv4acd: epoll_ctl(ADD) on socket failed");
        }
        self.ios.insert(id, cb);
        id
    }

    fn cancel_io(&mut self, id: u64) {
        self.ios.remove(&id);
    }
}

pub use testing::MockReactor;

/// Deterministic, manually-driven `Reactor` backend for tests — both this
/// crate's own unit tests and an embedder's. Exposed unconditionally
/// (not behind `cfg(test)`) so integration tests outside this crate can
/// depend on it too, the way a real embedding application's test suite
/// would.
pub mod testing {
    use super::*;

    /// A manually-driven reactor for deterministic tests: no real time, no
    /// real fds. `fire_timer`/`fire_io` invoke a pending callback directly.
    #[derive(Default)]
    pub struct MockReactor {
        next_id: u64,
        timers: HashMap<u64, (MonotonicTime, Callback)>,
        ios: HashMap<u64, Callback>,
    }

    impl MockReactor {
        pub fn new() -> Self {
            Self::default()
        }

        /// Builds a `MockReactor` and returns both the `Reactor` facade (to
        /// hand to `Acd::attach_event`) and a shared handle tests can use to
        /// call `fire_timer`/`fire_io` on the very same instance.
        pub fn shared() -> (Reactor, Rc<RefCell<MockReactor>>) {
            let core = Rc::new(RefCell::new(MockReactor::new()));
            let reactor = Reactor(core.clone());
            (reactor, core)
        }

        /// Returns the deadline of the single pending timer, if any.
        pub fn pending_timer_deadline(&self) -> Option<MonotonicTime> {
            self.timers.values().next().map(|(d, _)| *d)
        }

        pub fn pending_timer_count(&self) -> usize {
            self.timers.len()
        }

        pub fn pending_io_count(&self) -> usize {
            self.ios.len()
        }

        /// Fires the single pending timer (tests never schedule more than
        /// one; the engine itself never holds two timers at once).
        ///
        /// Takes the shared handle rather than `&mut self`: the fired
        /// callback commonly reschedules (e.g. `on_timer_started` calling
        /// back into `Reactor::add_timer` on this same instance), so no
        /// borrow of `this` can still be held once `cb()` runs.
        pub fn fire_timer(this: &Rc<RefCell<MockReactor>>) {
            let (_, mut cb) = {
                let mut core = this.borrow_mut();
                let id = *core.timers.keys().next().expect("no pending timer");
                core.timers.remove(&id).unwrap()
            };
            cb();
        }

        /// Fires every registered io watcher, simulating a frame becoming
        /// readable. Each callback runs with no borrow held, for the same
        /// reentrancy reason as `fire_timer`; a watcher still present
        /// afterwards (the common case — io watchers are persistent, unlike
        /// timers) is put back under its original id.
        pub fn fire_io(this: &Rc<RefCell<MockReactor>>) {
            let ids: Vec<u64> = this.borrow().ios.keys().copied().collect();
            for id in ids {
                let Some(mut cb) = this.borrow_mut().ios.remove(&id) else {
                    continue;
                };
                cb();
                this.borrow_mut().ios.entry(id).or_insert(cb);
            }
        }
    }

    impl ReactorCore for MockReactor {
        fn schedule_timer(
            &mut self,
            deadline: MonotonicTime,
            _priority: Priority,
            cb: Callback,
        ) -> u64 {
            let id = self.next_id;
            self.next_id += 1;
            self.timers.insert(id, (deadline, cb));
            id
        }

        fn cancel_timer(&mut self, id: u64) {
            self.timers.remove(&id);
        }

        fn register_io(&mut self, _fd: RawFd, _priority: Priority, cb: Callback) -> u64 {
            let id = self.next_id;
            self.next_id += 1;
            self.ios.insert(id, cb);
            id
        }

        fn cancel_io(&mut self, id: u64) {
            self.ios.remove(&id);
        }
    }
}
