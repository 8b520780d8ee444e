//! An IPv4 Address Conflict Detection (ACD) engine, implementing the
//! probe/announce/defend state machine from RFC 5227.
//!
//! The engine itself (`state`, `acd`) never touches a socket or a clock
//! directly; it is driven through the small set of collaborators in
//! `reactor`, `socket`, `clock`, and `jitter`, each of which has both a
//! real, Linux-backed implementation and (for `reactor`/`clock`/`jitter`)
//! a deterministic one for tests. An embedding application owns the event
//! loop: it builds an [`acd::Acd`], configures it, calls `start()`, and
//! repeatedly drives a [`reactor::EpollReactor`] (or its own reactor) to
//! deliver timer and socket events into it.
//!
//! ```no_run
//! use ipv4acd::acd::Acd;
//! use ipv4acd::notify::Event;
//! use ipv4acd::reactor::{EpollReactor, Priority, Reactor};
//! use ipv4acd::types::{Ipv4Addr, MacAddr};
//!
//! let acd = Acd::new();
//! acd.set_ifindex(2).unwrap();
//! acd.set_mac(MacAddr::new([0x02, 0, 0, 0, 0, 1])).unwrap();
//! acd.set_address(Ipv4Addr::new(169, 254, 5, 7)).unwrap();
//! acd.attach_event(None, Priority::default()).unwrap();
//! acd.set_callback(|event| match event {
//!     Event::Bind => log::info!("bound"),
//!     Event::Conflict(_) => log::warn!("conflict"),
//!     Event::Stop => log::info!("stopped"),
//! });
//! acd.start().unwrap();
//! ```

pub mod acd;
pub mod classify;
pub mod clock;
pub mod constants;
pub mod errno;
pub mod jitter;
pub mod notify;
pub mod reactor;
pub mod socket;
pub mod state;
pub mod types;

pub use acd::Acd;
pub use errno::{Errno, Result};
pub use notify::{ConflictInfo, Event};
pub use state::State;
