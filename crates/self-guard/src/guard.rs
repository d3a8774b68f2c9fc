//! Outward-facing shell around [`SecurityStateManager`].
//!
//! Validates preconditions before anything reaches the core and maps every
//! outcome to a stable [`ResultCode`]. Any doubt about whether a session is
//! live reads as [`SecurityState::Compromised`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::GuardError;
use crate::locator::LocatorStrategy;
use crate::manager::{GuardConfig, SecurityStateManager};
use crate::probe::DebuggerVerdict;
use crate::state::{CheckFlags, SecurityState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    InitError = -1,
    NotInitialized = -2,
    AlreadyInitialized = -3,
    InternalError = -4,
}

impl ResultCode {
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InitError => "INIT_ERROR",
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::AlreadyInitialized => "ALREADY_INITIALIZED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Caller-owned monitor handle. Independent handles never share state.
///
/// The core manager is owned outright and never handed out, so the active
/// flag and the core state only change together under the lifecycle lock.
#[derive(Debug)]
pub struct SelfGuard {
    manager: SecurityStateManager,
    active: AtomicBool,
    lifecycle: Mutex<()>,
}

impl SelfGuard {
    pub fn new(manager: SecurityStateManager) -> Self {
        Self {
            manager,
            active: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(SecurityStateManager::from_env())
    }

    pub fn with_config(config: &GuardConfig) -> Self {
        Self::new(SecurityStateManager::with_config(config))
    }

    pub fn implementation_name(&self) -> &'static str {
        self.manager.implementation_name()
    }

    pub fn locator_strategy(&self) -> LocatorStrategy {
        self.manager.locator_strategy()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The active flag only flips once the core has finished, and both happen
    /// under the lifecycle lock.
    pub fn init(&self) -> ResultCode {
        let Ok(_lifecycle) = self.lifecycle.lock() else {
            warn!("lifecycle lock poisoned during init");
            return ResultCode::InitError;
        };
        if self.is_active() {
            return ResultCode::AlreadyInitialized;
        }

        match self.manager.initialize() {
            Ok(()) => {
                self.active.store(true, Ordering::Release);
                ResultCode::Ok
            }
            Err(GuardError::AlreadyInitialized) => ResultCode::AlreadyInitialized,
            Err(err) => {
                warn!(error = %err, "security monitor initialization failed");
                ResultCode::InitError
            }
        }
    }

    pub fn snapshot(&self) -> ResultCode {
        if !self.is_active() {
            return ResultCode::NotInitialized;
        }
        map_core_result(self.manager.take_snapshot())
    }

    pub fn check_integrity(&self, flags: CheckFlags) -> ResultCode {
        if !self.is_active() {
            return ResultCode::NotInitialized;
        }
        if flags.is_empty() {
            debug!("integrity check rejected: no probes selected");
            return ResultCode::InternalError;
        }
        map_core_result(self.manager.check_integrity(flags).map(|_| ()))
    }

    /// `Unavailable` while no session is live.
    pub fn detect_debugger(&self) -> DebuggerVerdict {
        if !self.is_active() {
            return DebuggerVerdict::Unavailable;
        }
        self.manager.detect_debugger()
    }

    pub fn security_state(&self) -> SecurityState {
        if !self.is_active() {
            return SecurityState::Compromised;
        }
        self.manager.state()
    }

    /// Clears the active flag even when the core reports a failure.
    pub fn shutdown(&self) -> ResultCode {
        let _lifecycle = match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !self.is_active() {
            return ResultCode::NotInitialized;
        }

        let result = self.manager.shutdown();
        self.active.store(false, Ordering::Release);
        match result {
            Ok(()) => ResultCode::Ok,
            Err(err) => {
                warn!(error = %err, "security monitor shutdown reported failure");
                ResultCode::InternalError
            }
        }
    }
}

impl Drop for SelfGuard {
    fn drop(&mut self) {
        if self.is_active() {
            let _ = self.shutdown();
        }
    }
}

fn map_core_result(result: Result<(), GuardError>) -> ResultCode {
    match result {
        Ok(()) => ResultCode::Ok,
        Err(GuardError::NotInitialized) => ResultCode::NotInitialized,
        Err(err) => {
            warn!(error = %err, "security monitor operation failed");
            ResultCode::InternalError
        }
    }
}
