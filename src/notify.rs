//! Client notification.

use crate::types::MacAddr;

/// An outcome delivered to the client callback.
///
/// `Conflict` additionally carries the conflicting sender's hardware
/// address when it is known, the way real ACD implementations surface it
/// for diagnostics; it is `None` only when a fatal I/O error (rather than
/// an observed frame) forced the reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The first announcement has been sent; the address is now claimed.
    Bind,
    /// A conflicting use was detected; the instance has reset to `Init`.
    Conflict(Option<ConflictInfo>),
    /// The client called `stop()`, or a fatal I/O error forced a reset.
    Stop,
}

/// Detail attached to a `Conflict` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictInfo {
    pub sender_mac: MacAddr,
}

/// The callback signature clients register via `set_callback`. Invoked
/// synchronously from reactor dispatch: it must not drop the last `Acd`
/// handle that invoked it unless it is itself holding another `Acd` clone.
pub type Callback = Box<dyn FnMut(Event)>;
