pub mod image;
pub mod models;
pub mod validation;

use std::ops::RangeInclusive;

/// Host ports handed out to deployments are drawn from this range. Anything
/// below is left to the host system, anything above collides with the
/// ephemeral range agents use for outbound connections.
pub const HOST_PORT_RANGE: RangeInclusive<u16> = 30000..=32767;

/// How long a server enrolment token stays valid.
pub const REGISTRATION_TOKEN_TTL_HOURS: i64 = 24;

/// A server is considered offline when its last heartbeat is older than this.
pub const DEFAULT_HEARTBEAT_STALENESS_SECS: u64 = 90;
