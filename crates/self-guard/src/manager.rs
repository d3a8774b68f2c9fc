use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{GuardError, GuardResult};
use crate::locator::{CodeSection, CodeSectionLocator, LocatorStrategy};
use crate::probe::{default_backend, DebuggerVerdict, ProbeBackend, ProbeConfig};
use crate::report::{IntegrityFinding, IntegrityReport, Severity};
use crate::state::{CheckFlags, SecurityState, StateCell};

const BASELINE_IMAGE_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub probe: ProbeConfig,
    pub locator: LocatorStrategy,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            locator: LocatorStrategy::from_env(),
        }
    }
}

/// Reference values later measurements are compared against. Every byte is
/// wiped on shutdown and on drop.
///
/// Laid out with no implicit padding, so zeroing the fields zeroes the whole
/// struct.
#[derive(Default, Zeroize, ZeroizeOnDrop)]
#[repr(C)]
struct Baseline {
    baseline_timestamp: u64,
    code_checksum: u32,
    initialized: bool,
    /// `code_checksum` was taken over the baseline itself, not over code.
    checksum_degraded: bool,
    _pad: [u8; 2],
}

impl Baseline {
    fn image(&self) -> [u8; BASELINE_IMAGE_LEN] {
        let mut out = [0u8; BASELINE_IMAGE_LEN];
        out[0..4].copy_from_slice(&self.code_checksum.to_le_bytes());
        out[4..12].copy_from_slice(&self.baseline_timestamp.to_le_bytes());
        out[12] = u8::from(self.initialized);
        out[13] = u8::from(self.checksum_degraded);
        out
    }

    /// Image with the checksum bookkeeping cleared, so that storing a
    /// fallback checksum does not change the bytes it was computed over.
    fn fallback_image(&self) -> [u8; BASELINE_IMAGE_LEN] {
        let mut out = self.image();
        out[0..4].fill(0);
        out[13] = 0;
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Measurement {
    checksum: u32,
    degraded: bool,
}

/// Owns the baseline and the security state, and drives the probes.
///
/// `initialize`, `shutdown`, `take_snapshot` and `check_integrity` serialize
/// on one mutex. The state itself lives in an atomic written with `Release`
/// while that mutex is held and read with `Acquire` without it, so `state`
/// and `detect_debugger` never block behind a running check.
pub struct SecurityStateManager {
    state: StateCell,
    baseline: Mutex<Baseline>,
    probe: Arc<dyn ProbeBackend>,
    locator: Arc<dyn CodeSectionLocator>,
}

impl SecurityStateManager {
    pub fn from_env() -> Self {
        Self::with_config(&GuardConfig::default())
    }

    pub fn with_config(config: &GuardConfig) -> Self {
        Self::new(default_backend(&config.probe), config.locator.build())
    }

    pub fn new(probe: Arc<dyn ProbeBackend>, locator: Arc<dyn CodeSectionLocator>) -> Self {
        Self {
            state: StateCell::new(SecurityState::Compromised),
            baseline: Mutex::new(Baseline::default()),
            probe,
            locator,
        }
    }

    pub fn implementation_name(&self) -> &'static str {
        self.probe.implementation_name()
    }

    pub fn locator_strategy(&self) -> LocatorStrategy {
        self.locator.strategy()
    }

    fn lock_baseline(&self) -> GuardResult<MutexGuard<'_, Baseline>> {
        self.baseline
            .lock()
            .map_err(|_| GuardError::InternalFailure("baseline lock poisoned".to_string()))
    }

    /// The only transition out of `Compromised`.
    pub fn initialize(&self) -> GuardResult<()> {
        let mut baseline = self
            .lock_baseline()
            .map_err(|err| GuardError::InitializationFailure(err.to_string()))?;
        if baseline.initialized {
            return Err(GuardError::AlreadyInitialized);
        }

        baseline.baseline_timestamp = self.probe.cycle_counter();
        baseline.initialized = true;
        self.refresh_checksum(&mut baseline);

        let previous = self.state.force(SecurityState::Safe);
        info!(
            backend = self.probe.implementation_name(),
            locator = %self.locator.strategy(),
            degraded = baseline.checksum_degraded,
            from = %previous,
            to = %SecurityState::Safe,
            "security monitor initialized"
        );
        Ok(())
    }

    pub fn shutdown(&self) -> GuardResult<()> {
        let mut baseline = self.lock_baseline()?;
        if !baseline.initialized {
            return Err(GuardError::NotInitialized);
        }

        baseline.zeroize();
        let previous = self.state.force(SecurityState::Compromised);
        info!(from = %previous, to = %SecurityState::Compromised, "security monitor shut down");
        Ok(())
    }

    /// Refreshes the reference checksum. Leaves the security state alone.
    pub fn take_snapshot(&self) -> GuardResult<()> {
        let mut baseline = self.lock_baseline()?;
        if !baseline.initialized {
            return Err(GuardError::NotInitialized);
        }

        self.refresh_checksum(&mut baseline);
        debug!(
            degraded = baseline.checksum_degraded,
            checksum = baseline.code_checksum,
            "baseline snapshot refreshed"
        );
        Ok(())
    }

    /// Runs the probes selected by `flags` and folds their findings into the
    /// state. Returns a report whenever the check ran; callers read the
    /// verdict from `report.state` or [`Self::state`], not from `Ok`.
    pub fn check_integrity(&self, flags: CheckFlags) -> GuardResult<IntegrityReport> {
        let baseline = self.lock_baseline()?;
        if !baseline.initialized {
            return Err(GuardError::NotInitialized);
        }

        let mut findings = Vec::new();

        if flags.contains(CheckFlags::DEBUGGER) {
            match self.probe.low_level_check() {
                DebuggerVerdict::Detected => findings.push(IntegrityFinding::DebuggerDetected),
                DebuggerVerdict::Clear => {}
                DebuggerVerdict::Unavailable => {
                    debug!("debugger probe unavailable; no signal");
                }
            }
        }

        if flags.contains(CheckFlags::TIMING) && self.probe.timing_check() {
            findings.push(IntegrityFinding::TimingAnomaly);
        }

        if flags.contains(CheckFlags::MEMORY) {
            if let Some(finding) = self.verify_memory(&baseline) {
                findings.push(finding);
            }
        }

        for finding in &findings {
            warn!(
                code = finding.code(),
                severity = ?finding.severity(),
                detail = %finding.detail(),
                "integrity finding"
            );
        }

        let compromised = findings
            .iter()
            .any(|finding| finding.severity() == Severity::Compromised);
        let suspicious = findings
            .iter()
            .any(|finding| finding.severity() == Severity::Suspicious);

        if compromised {
            let previous = self.state.force(SecurityState::Compromised);
            if previous != SecurityState::Compromised {
                warn!(from = %previous, to = %SecurityState::Compromised, "security state escalated");
            }
        } else if suspicious && self.state.arm_warning() {
            warn!(from = %SecurityState::Safe, to = %SecurityState::Warning, "security state escalated");
        }

        let state = self.state.load();
        drop(baseline);

        Ok(IntegrityReport {
            flags,
            findings,
            state,
        })
    }

    /// Stateless pass-through to the probe backend.
    pub fn detect_debugger(&self) -> DebuggerVerdict {
        self.probe.low_level_check()
    }

    pub fn state(&self) -> SecurityState {
        self.state.load()
    }

    fn refresh_checksum(&self, baseline: &mut Baseline) {
        let section = self.locator.locate();
        let measured = self.measure(&section, baseline);
        if measured.degraded {
            debug!("code section unavailable; checksumming baseline instead");
        }
        baseline.code_checksum = measured.checksum;
        baseline.checksum_degraded = measured.degraded;
    }

    fn measure(&self, section: &CodeSection, baseline: &Baseline) -> Measurement {
        if section.is_available() {
            // SAFETY: locators only report the running image's own mapped code.
            let bytes = unsafe { section.as_bytes() };
            return Measurement {
                checksum: self.probe.checksum_memory(bytes),
                degraded: false,
            };
        }

        Measurement {
            checksum: self.probe.checksum_memory(&baseline.fallback_image()),
            degraded: true,
        }
    }

    fn verify_memory(&self, baseline: &Baseline) -> Option<IntegrityFinding> {
        let section = self.locator.locate();
        let measured = self.measure(&section, baseline);

        if measured.degraded != baseline.checksum_degraded {
            return Some(IntegrityFinding::ChecksumSourceChanged {
                code_section_available: !measured.degraded,
            });
        }
        if measured.checksum == baseline.code_checksum {
            return None;
        }

        let expected = baseline.code_checksum;
        let observed = measured.checksum;
        if measured.degraded {
            Some(IntegrityFinding::FallbackChecksumMismatch { expected, observed })
        } else {
            Some(IntegrityFinding::CodeChecksumMismatch { expected, observed })
        }
    }
}

impl fmt::Debug for SecurityStateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityStateManager")
            .field("state", &self.state.load())
            .field("backend", &self.probe.implementation_name())
            .field("locator", &self.locator.strategy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::UnavailableLocator;
    use crate::probe::checksum_bytes;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingProbe {
        seen: StdMutex<Vec<Vec<u8>>>,
    }

    impl ProbeBackend for RecordingProbe {
        fn cycle_counter(&self) -> u64 {
            0x1122_3344_5566_7788
        }

        fn low_level_check(&self) -> DebuggerVerdict {
            DebuggerVerdict::Clear
        }

        fn timing_check(&self) -> bool {
            false
        }

        fn checksum_memory(&self, bytes: &[u8]) -> u32 {
            self.seen.lock().expect("seen lock").push(bytes.to_vec());
            checksum_bytes(bytes)
        }

        fn implementation_name(&self) -> &'static str {
            "recording"
        }
    }

    fn manager_with(probe: Arc<RecordingProbe>) -> SecurityStateManager {
        SecurityStateManager::new(probe, Arc::new(UnavailableLocator))
    }

    #[test]
    fn construction_zero_fills_baseline() {
        let manager = manager_with(Arc::new(RecordingProbe::default()));
        let baseline = manager.baseline.lock().expect("baseline lock");
        assert_eq!(baseline.image(), [0u8; BASELINE_IMAGE_LEN]);
        assert_eq!(manager.state(), SecurityState::Compromised);
    }

    #[test]
    fn shutdown_wipes_every_baseline_byte() {
        let probe = Arc::new(RecordingProbe::default());
        let manager = manager_with(probe.clone());
        manager.initialize().expect("initialize");
        manager.take_snapshot().expect("snapshot");
        {
            let baseline = manager.baseline.lock().expect("baseline lock");
            assert_ne!(baseline.image(), [0u8; BASELINE_IMAGE_LEN]);
        }

        manager.shutdown().expect("shutdown");
        let baseline = manager.baseline.lock().expect("baseline lock");
        assert_eq!(baseline.image(), [0u8; BASELINE_IMAGE_LEN]);
        assert_eq!(manager.state(), SecurityState::Compromised);
    }

    fn raw_bytes(baseline: &Baseline) -> Vec<u8> {
        // SAFETY: `Baseline` is `repr(C)` with every byte covered by a field.
        unsafe {
            std::slice::from_raw_parts(
                baseline as *const Baseline as *const u8,
                std::mem::size_of::<Baseline>(),
            )
        }
        .to_vec()
    }

    #[test]
    fn baseline_has_no_implicit_padding() {
        assert_eq!(std::mem::size_of::<Baseline>(), BASELINE_IMAGE_LEN);
    }

    #[test]
    fn shutdown_wipes_raw_baseline_memory() {
        let manager = manager_with(Arc::new(RecordingProbe::default()));
        manager.initialize().expect("initialize");
        {
            let mut baseline = manager.baseline.lock().expect("baseline lock");
            baseline._pad = [0xaa; 2];
            assert_ne!(raw_bytes(&baseline), vec![0u8; BASELINE_IMAGE_LEN]);
        }

        manager.shutdown().expect("shutdown");
        let baseline = manager.baseline.lock().expect("baseline lock");
        assert_eq!(raw_bytes(&baseline), vec![0u8; BASELINE_IMAGE_LEN]);
    }

    #[test]
    fn fallback_checksum_covers_live_baseline_without_checksum_fields() {
        let probe = Arc::new(RecordingProbe::default());
        let manager = manager_with(probe.clone());
        manager.initialize().expect("initialize");

        let seen = probe.seen.lock().expect("seen lock");
        let image = seen.last().expect("fallback image checksummed");
        assert_eq!(image.len(), BASELINE_IMAGE_LEN);
        assert_eq!(&image[0..4], &[0, 0, 0, 0]);
        assert_eq!(&image[4..12], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(image[12], 1);
    }

    #[test]
    fn fallback_checksum_is_stable_across_snapshot_and_check() {
        let manager = manager_with(Arc::new(RecordingProbe::default()));
        manager.initialize().expect("initialize");
        manager.take_snapshot().expect("snapshot");

        let report = manager
            .check_integrity(CheckFlags::MEMORY)
            .expect("check runs");
        assert!(report.is_clean(), "unexpected findings: {}", report.summary());
        assert_eq!(report.state, SecurityState::Safe);
    }

    #[test]
    fn failed_reinitialize_leaves_baseline_untouched() {
        let manager = manager_with(Arc::new(RecordingProbe::default()));
        manager.initialize().expect("initialize");
        let before = manager.baseline.lock().expect("baseline lock").image();

        assert_eq!(manager.initialize(), Err(GuardError::AlreadyInitialized));
        let after = manager.baseline.lock().expect("baseline lock").image();
        assert_eq!(before, after);
    }
}
