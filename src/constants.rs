//! RFC 5227 timing constants, in microseconds unless noted otherwise.
//!
//! These are not tunable: the RFC fixes them, and a conforming
//! implementation does not expose them as configuration.

use std::time::Duration;

/// Upper bound of the initial random delay before the first probe.
pub const PROBE_WAIT: Duration = Duration::from_secs(1);
/// Number of probes sent before announcing.
pub const PROBE_NUM: u32 = 3;
/// Minimum spacing between probes.
pub const PROBE_MIN: Duration = Duration::from_secs(1);
/// Maximum spacing between probes.
pub const PROBE_MAX: Duration = Duration::from_secs(2);
/// Delay from the last probe to the first announcement.
pub const ANNOUNCE_WAIT: Duration = Duration::from_secs(2);
/// Number of announcements sent after probing.
pub const ANNOUNCE_NUM: u32 = 2;
/// Spacing between announcements.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);
/// Conflict count above which rate limiting kicks in.
pub const MAX_CONFLICTS: u32 = 10;
/// Cool-down inserted once `MAX_CONFLICTS` is reached.
pub const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(60);
/// Minimum gap between successive defensive announcements.
pub const DEFEND_INTERVAL: Duration = Duration::from_secs(10);
