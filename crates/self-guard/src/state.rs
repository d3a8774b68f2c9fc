use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

/// Coarse security verdict exposed to the host application.
///
/// Ranked `Safe < Warning < Compromised` for escalation. `Compromised` is
/// also the fail-secure answer whenever no baseline is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SecurityState {
    Safe = 0,
    Warning = 1,
    Compromised = 2,
}

impl SecurityState {
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Unknown raw values decode as `Compromised`.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Safe,
            1 => Self::Warning,
            _ => Self::Compromised,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Warning => "WARNING",
            Self::Compromised => "COMPROMISED",
        }
    }
}

impl fmt::Display for SecurityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Probes participating in one integrity check.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CheckFlags: u32 {
        const DEBUGGER = 1 << 0;
        const TIMING = 1 << 1;
        const MEMORY = 1 << 2;
        /// Reserved. Accepted, never evaluated.
        const STACK = 1 << 3;
        const ALL = u32::MAX;
    }
}

impl CheckFlags {
    /// Keeps unknown bits so that raw masks such as `0xFFFF_FFFF` survive intact.
    pub fn from_raw(raw: u32) -> Self {
        Self::from_bits_retain(raw)
    }
}

/// Lock-free holder for the current [`SecurityState`].
///
/// Writers run while holding the manager's exclusion lock and publish with
/// `Release`; readers use `Acquire` and never take that lock.
#[derive(Debug)]
pub(crate) struct StateCell {
    raw: AtomicU8,
}

impl StateCell {
    pub(crate) fn new(initial: SecurityState) -> Self {
        Self {
            raw: AtomicU8::new(initial as u8),
        }
    }

    pub(crate) fn load(&self) -> SecurityState {
        SecurityState::from_raw(self.raw.load(Ordering::Acquire))
    }

    /// Unconditional store, returns the previous state.
    pub(crate) fn force(&self, next: SecurityState) -> SecurityState {
        SecurityState::from_raw(self.raw.swap(next as u8, Ordering::Release))
    }

    /// Moves `Safe -> Warning` only. A cell already at `Warning` or
    /// `Compromised` is left as is and `false` is returned.
    pub(crate) fn arm_warning(&self) -> bool {
        self.raw
            .compare_exchange(
                SecurityState::Safe as u8,
                SecurityState::Warning as u8,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}
