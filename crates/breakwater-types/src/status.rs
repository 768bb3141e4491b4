//! Breaker status codes shared between the local gate and the coordinator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Circuit status.
///
/// `Closed`, `HalfOpen` and `Open` are produced by scoring; `Disabled` and
/// `ForcedOpen` are administrative and only ever set through the explicit
/// API. The integer codes are the wire encoding stored in the shared hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Normal operation; calls proceed and are scored.
    Closed,
    /// Probationary probing; call results decide the next state.
    HalfOpen,
    /// Gate is rejecting calls until the break duration elapses.
    Open,
    /// Scoring bypassed; calls always proceed.
    Disabled,
    /// Administratively rejecting all calls.
    ForcedOpen,
}

/// A payload that does not name a known status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown status {0:?}")]
pub struct UnknownStatus(pub String);

impl Status {
    /// Wire code used in the shared hash: Closed=1, HalfOpen=2, Open=3,
    /// Disabled=4, ForcedOpen=5.
    pub const fn code(self) -> u8 {
        match self {
            Status::Closed => 1,
            Status::HalfOpen => 2,
            Status::Open => 3,
            Status::Disabled => 4,
            Status::ForcedOpen => 5,
        }
    }

    /// Decode a wire code.
    pub const fn from_code(code: u8) -> Option<Status> {
        match code {
            1 => Some(Status::Closed),
            2 => Some(Status::HalfOpen),
            3 => Some(Status::Open),
            4 => Some(Status::Disabled),
            5 => Some(Status::ForcedOpen),
            _ => None,
        }
    }

    /// Lowercase name used as the pub/sub payload.
    pub const fn name(self) -> &'static str {
        match self {
            Status::Closed => "closed",
            Status::HalfOpen => "half_open",
            Status::Open => "open",
            Status::Disabled => "disabled",
            Status::ForcedOpen => "forced_open",
        }
    }

    /// True for the two statuses that scoring must never produce or clear.
    pub const fn is_administrative(self) -> bool {
        matches!(self, Status::Disabled | Status::ForcedOpen)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Status::Closed),
            "half_open" => Ok(Status::HalfOpen),
            "open" => Ok(Status::Open),
            "disabled" => Ok(Status::Disabled),
            "forced_open" => Ok(Status::ForcedOpen),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        status.code()
    }
}
