#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use self_guard::{
    checksum_bytes, CodeSection, CodeSectionLocator, DebuggerVerdict, LocatorStrategy,
    ProbeBackend, SecurityStateManager,
};

pub static IMAGE: [u8; 64] = [
    0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x10, 0x89, 0x7d, 0xfc, 0x8b, 0x45, 0xfc, 0x83,
    0xc0, 0x01, 0xc9, 0xc3, 0x90, 0x90, 0x90, 0x90, 0x90, 0x0f, 0x1f, 0x40, 0x00, 0x66, 0x90,
    0xcc, 0xeb, 0xfe, 0x31, 0xc0, 0x48, 0x8b, 0x05, 0x00, 0x10, 0x00, 0x00, 0xff, 0xd0, 0x5d,
    0xc3, 0x41, 0x57, 0x41, 0x56, 0x41, 0x55, 0x41, 0x54, 0x53, 0x48, 0x81, 0xec, 0x88, 0x00,
    0x00, 0x00, 0x0f, 0x0b,
];

/// Probe whose every answer is set by the test.
pub struct ScriptedProbe {
    debugger: AtomicI32,
    timing: AtomicBool,
    checksum_override: Mutex<Option<u32>>,
}

impl ScriptedProbe {
    pub fn quiet() -> Arc<Self> {
        Arc::new(Self {
            debugger: AtomicI32::new(DebuggerVerdict::Clear.as_raw()),
            timing: AtomicBool::new(false),
            checksum_override: Mutex::new(None),
        })
    }

    pub fn set_debugger(&self, verdict: DebuggerVerdict) {
        self.debugger.store(verdict.as_raw(), Ordering::SeqCst);
    }

    pub fn set_timing_anomaly(&self, anomalous: bool) {
        self.timing.store(anomalous, Ordering::SeqCst);
    }

    /// Forces every subsequent checksum to `value`, simulating modified memory.
    pub fn set_checksum(&self, value: Option<u32>) {
        *self.checksum_override.lock().expect("checksum lock") = value;
    }
}

impl ProbeBackend for ScriptedProbe {
    fn cycle_counter(&self) -> u64 {
        42
    }

    fn low_level_check(&self) -> DebuggerVerdict {
        match self.debugger.load(Ordering::SeqCst) {
            0 => DebuggerVerdict::Clear,
            1 => DebuggerVerdict::Detected,
            _ => DebuggerVerdict::Unavailable,
        }
    }

    fn timing_check(&self) -> bool {
        self.timing.load(Ordering::SeqCst)
    }

    fn checksum_memory(&self, bytes: &[u8]) -> u32 {
        match *self.checksum_override.lock().expect("checksum lock") {
            Some(value) => value,
            None => checksum_bytes(bytes),
        }
    }

    fn implementation_name(&self) -> &'static str {
        "scripted"
    }
}

/// Locator reporting [`IMAGE`] or nothing, switchable at runtime.
pub struct FixedLocator {
    available: AtomicBool,
}

impl FixedLocator {
    pub fn available() -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(true),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(false),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl CodeSectionLocator for FixedLocator {
    fn locate(&self) -> CodeSection {
        if self.available.load(Ordering::SeqCst) {
            CodeSection::from_slice(&IMAGE)
        } else {
            CodeSection::unavailable()
        }
    }

    fn strategy(&self) -> LocatorStrategy {
        LocatorStrategy::LoadedImage
    }
}

pub fn scripted_manager() -> (SecurityStateManager, Arc<ScriptedProbe>, Arc<FixedLocator>) {
    let probe = ScriptedProbe::quiet();
    let locator = FixedLocator::available();
    let manager = SecurityStateManager::new(probe.clone(), locator.clone());
    (manager, probe, locator)
}
