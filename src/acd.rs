//! Public lifecycle and configuration handle.
//!
//! `Acd` is the `Rc<RefCell<Inner>>` facade clients hold. Reference
//! counting is realized through `Clone` (bump the count) and `Drop`
//! (release on the last clone) rather than explicit `ref`/`unref` methods —
//! see DESIGN.md, Open Question OQ-1.

use crate::clock::{Clock, MonotonicTime};
use crate::jitter::Jitter;
use crate::notify::{Callback, Event};
use crate::reactor::{Priority, Reactor};
use crate::state::{ConfigError, Inner, StartError, State};
use crate::types::{Ipv4Addr, MacAddr};
use std::cell::RefCell;
use std::rc::Rc;

/// A handle to one ACD instance.
///
/// Cloning shares the same underlying instance: nothing prevents multiple
/// handles referring to it, the way a C caller might hold several
/// pointers with their own ref/unref calls. The instance is torn down and
/// its resources released when the last clone is dropped.
#[derive(Clone)]
pub struct Acd(Rc<RefCell<Inner>>);

impl Acd {
    /// Creates a new instance in `Init`. Configure it with the `set_*`
    /// methods, then call [`Acd::start`].
    pub fn new() -> Self {
        Acd(Rc::new_cyclic(|weak| RefCell::new(Inner::new(weak.clone()))))
    }

    pub fn set_ifindex(&self, ifindex: i32) -> Result<(), ConfigError> {
        self.0.borrow_mut().set_ifindex(ifindex)
    }

    pub fn set_mac(&self, mac: MacAddr) -> Result<(), ConfigError> {
        self.0.borrow_mut().set_mac(mac)
    }

    pub fn set_address(&self, address: Ipv4Addr) -> Result<(), ConfigError> {
        self.0.borrow_mut().set_address(address)
    }

    /// Attaches the reactor this instance will schedule timers and its
    /// socket watcher on. `reactor = None` creates a default `EpollReactor`.
    pub fn attach_event(
        &self,
        reactor: Option<Reactor>,
        priority: Priority,
    ) -> Result<(), ConfigError> {
        self.0.borrow_mut().attach_event(reactor, priority)
    }

    pub fn detach_event(&self) {
        self.0.borrow_mut().detach_event();
    }

    /// Registers the callback invoked for `Bind`/`Conflict`/`Stop`.
    /// Replaces any previously set callback.
    pub fn set_callback(&self, callback: impl FnMut(Event) + 'static) {
        self.0.borrow_mut().set_callback(Box::new(callback) as Callback);
    }

    /// Overrides the clock and jitter sources, for deterministic tests.
    /// Not part of the production configuration surface.
    pub fn set_test_sources(&self, clock: Box<dyn Clock>, jitter: Box<dyn Jitter>) {
        self.0.borrow_mut().set_test_sources(clock, jitter);
    }

    /// Begins probing. Requires `ifindex`, `mac`, `address`, and a reactor
    /// to already be configured.
    pub fn start(&self) -> Result<(), StartError> {
        self.0.borrow_mut().start()
    }

    /// Stops the instance if running, releasing its socket, timer, and
    /// watcher, and delivering `Stop`. A no-op in `Init`.
    pub fn stop(&self) {
        self.0.borrow_mut().stop();
        Inner::deliver_pending(&self.0);
    }

    pub fn is_running(&self) -> bool {
        self.0.borrow().is_running()
    }

    pub fn state(&self) -> State {
        self.0.borrow().state()
    }

    /// Number of conflicts observed since the last time it was cleared by
    /// a successful bind. A diagnostic accessor for the rate-limiting rule.
    pub fn conflict_count(&self) -> u32 {
        self.0.borrow().conflict_count()
    }

    /// Monotonic deadline of the next scheduled wakeup, if any. Useful for
    /// diagnostics and for asserting timing windows in tests.
    pub fn announce_deadline(&self) -> Option<MonotonicTime> {
        self.0.borrow().announce_deadline()
    }
}

impl Default for Acd {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Acd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acd")
            .field("state", &self.state())
            .field("conflict_count", &self.conflict_count())
            .finish()
    }
}
