use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tracing::{debug, warn};

const PORTABLE_TIMING_THRESHOLD_NANOS: u64 = 100_000;
#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
const CYCLE_COUNTER_TIMING_THRESHOLD_CYCLES: u64 = 1_000_000;

/// Outcome of the low-level debugger/tamper heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerVerdict {
    Clear,
    Detected,
    /// No signal. Never to be read as "safe".
    Unavailable,
}

impl DebuggerVerdict {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Clear => 0,
            Self::Detected => 1,
            Self::Unavailable => -1,
        }
    }

    pub fn detected(self) -> bool {
        matches!(self, Self::Detected)
    }
}

impl fmt::Display for DebuggerVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clear => f.write_str("clear"),
            Self::Detected => f.write_str("detected"),
            Self::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// Platform measurement primitives the state manager is written against.
///
/// Implementations must not mutate shared state; every call only returns a
/// measurement.
pub trait ProbeBackend: Send + Sync {
    /// Monotonically non-decreasing counter, only meaningful as a delta.
    fn cycle_counter(&self) -> u64;

    fn low_level_check(&self) -> DebuggerVerdict;

    /// `true` when a fixed workload took longer than the configured threshold.
    fn timing_check(&self) -> bool;

    fn checksum_memory(&self, bytes: &[u8]) -> u32 {
        checksum_bytes(bytes)
    }

    fn implementation_name(&self) -> &'static str;
}

/// Rotate-left-by-one then XOR accumulator. Order sensitive and
/// deterministic; empty input yields 0.
pub fn checksum_bytes(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, byte| acc.rotate_left(1) ^ u32::from(*byte))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Auto,
    Portable,
    CycleCounter,
}

impl BackendKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Some(Self::Auto),
            "portable" | "portable-fallback" => Some(Self::Portable),
            "cycle-counter" | "native" | "tsc" => Some(Self::CycleCounter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub backend: BackendKind,
    /// Overrides the backend's default threshold, in that backend's counter units.
    pub timing_threshold: Option<u64>,
    pub timing_iterations: u32,
    pub enable_tracer_probe: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            backend: env_backend("SELF_GUARD_PROBE_BACKEND"),
            timing_threshold: env_opt_u64("SELF_GUARD_TIMING_THRESHOLD"),
            timing_iterations: env_u32("SELF_GUARD_TIMING_ITERATIONS", 10),
            enable_tracer_probe: env_bool("SELF_GUARD_ENABLE_TRACER_PROBE", true),
        }
    }
}

/// Clock-based backend usable on every target.
#[derive(Debug, Clone)]
pub struct PortableProbe {
    threshold_nanos: u64,
    iterations: u32,
    enable_tracer_probe: bool,
}

impl PortableProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            threshold_nanos: config
                .timing_threshold
                .unwrap_or(PORTABLE_TIMING_THRESHOLD_NANOS),
            iterations: config.timing_iterations,
            enable_tracer_probe: config.enable_tracer_probe,
        }
    }

    pub fn threshold_nanos(&self) -> u64 {
        self.threshold_nanos
    }
}

impl ProbeBackend for PortableProbe {
    fn cycle_counter(&self) -> u64 {
        monotonic_nanos()
    }

    fn low_level_check(&self) -> DebuggerVerdict {
        if !self.enable_tracer_probe {
            return DebuggerVerdict::Unavailable;
        }
        tracer_verdict()
    }

    fn timing_check(&self) -> bool {
        let elapsed = time_workload(self.iterations, monotonic_nanos);
        exceeds_threshold(elapsed, self.threshold_nanos)
    }

    fn implementation_name(&self) -> &'static str {
        "portable-fallback"
    }
}

/// Hardware time-stamp counter backend.
#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
#[derive(Debug, Clone)]
pub struct CycleCounterProbe {
    threshold_cycles: u64,
    iterations: u32,
    enable_tracer_probe: bool,
}

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
impl CycleCounterProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            threshold_cycles: config
                .timing_threshold
                .unwrap_or(CYCLE_COUNTER_TIMING_THRESHOLD_CYCLES),
            iterations: config.timing_iterations,
            enable_tracer_probe: config.enable_tracer_probe,
        }
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
impl ProbeBackend for CycleCounterProbe {
    fn cycle_counter(&self) -> u64 {
        read_tsc()
    }

    fn low_level_check(&self) -> DebuggerVerdict {
        if !self.enable_tracer_probe {
            return DebuggerVerdict::Unavailable;
        }
        tracer_verdict()
    }

    fn timing_check(&self) -> bool {
        let elapsed = time_workload(self.iterations, read_tsc);
        exceeds_threshold(elapsed, self.threshold_cycles)
    }

    fn implementation_name(&self) -> &'static str {
        native_name().unwrap_or("portable-fallback")
    }
}

/// Builds the backend named by `config`, falling back to the portable one
/// where the requested backend does not exist on this target.
pub fn default_backend(config: &ProbeConfig) -> Arc<dyn ProbeBackend> {
    match config.backend {
        BackendKind::Portable => Arc::new(PortableProbe::new(config)),
        BackendKind::Auto | BackendKind::CycleCounter => native_or_portable(config),
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
fn native_or_portable(config: &ProbeConfig) -> Arc<dyn ProbeBackend> {
    Arc::new(CycleCounterProbe::new(config))
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
fn native_or_portable(config: &ProbeConfig) -> Arc<dyn ProbeBackend> {
    if matches!(config.backend, BackendKind::CycleCounter) {
        warn!("cycle-counter probe backend is not available on this target; using portable");
    }
    Arc::new(PortableProbe::new(config))
}

/// Name of the backend `BackendKind::Auto` resolves to on this target.
pub fn default_implementation_name() -> &'static str {
    native_name().unwrap_or("portable-fallback")
}

fn native_name() -> Option<&'static str> {
    if cfg!(target_arch = "x86_64") {
        Some("x86_64-native")
    } else if cfg!(target_arch = "x86") {
        Some("x86-native")
    } else {
        None
    }
}

fn exceeds_threshold(elapsed: u64, threshold: u64) -> bool {
    if elapsed > threshold {
        debug!(elapsed, threshold, "timing probe exceeded threshold");
        return true;
    }
    false
}

/// Runs a fixed arithmetic loop the optimiser cannot remove and returns the
/// elapsed counter delta.
pub fn time_workload(iterations: u32, counter: impl Fn() -> u64) -> u64 {
    let start = counter();
    let mut state = 0u64;
    for i in 0..iterations {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(u64::from(i));
        std::hint::black_box(state);
    }
    let end = counter();
    end.saturating_sub(start)
}

fn monotonic_nanos() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(Instant::now);
    u64::try_from(anchor.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(target_arch = "x86_64")]
fn read_tsc() -> u64 {
    // SAFETY: reading the processor cycle counter has no memory safety implications.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "x86")]
fn read_tsc() -> u64 {
    // SAFETY: reading the processor cycle counter has no memory safety implications.
    unsafe { core::arch::x86::_rdtsc() }
}

pub fn parse_tracer_pid(status: &str) -> Option<u32> {
    for line in status.lines() {
        let Some(raw) = line.strip_prefix("TracerPid:") else {
            continue;
        };
        let value = raw.trim();
        if value.is_empty() {
            return None;
        }
        return value.parse::<u32>().ok();
    }
    None
}

/// Maps a `/proc/self/status` body to a verdict.
pub fn tracer_verdict_from_status(status: &str) -> DebuggerVerdict {
    match parse_tracer_pid(status) {
        Some(0) => DebuggerVerdict::Clear,
        Some(tracer_pid) => {
            warn!(tracer_pid, "tracer attached to process");
            DebuggerVerdict::Detected
        }
        None => DebuggerVerdict::Unavailable,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn tracer_verdict() -> DebuggerVerdict {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => tracer_verdict_from_status(&status),
        Err(err) => {
            debug!(error = %err, "tracer probe unavailable");
            DebuggerVerdict::Unavailable
        }
    }
}

#[cfg(target_os = "macos")]
const KINFO_PROC_SIZE: usize = 648;
// `kp_proc.p_flag`: after the 16-byte `p_un` union, `p_vmspace` and `p_sigacts`.
const KINFO_P_FLAG_OFFSET: usize = 32;
const P_TRACED: i32 = 0x0000_0800;

/// Reads `P_TRACED` out of a raw `kinfo_proc` as filled in by
/// `sysctl(KERN_PROC_PID)`. A buffer too short to hold `p_flag` gives no signal.
pub fn traced_from_kinfo(kinfo: &[u8]) -> DebuggerVerdict {
    let Some(raw) = kinfo.get(KINFO_P_FLAG_OFFSET..KINFO_P_FLAG_OFFSET + 4) else {
        return DebuggerVerdict::Unavailable;
    };
    let p_flag = i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
    if (p_flag & P_TRACED) != 0 {
        warn!("P_TRACED set on process");
        DebuggerVerdict::Detected
    } else {
        DebuggerVerdict::Clear
    }
}

#[cfg(target_os = "macos")]
fn tracer_verdict() -> DebuggerVerdict {
    let mut mib: [libc::c_int; 4] = [
        libc::CTL_KERN,
        libc::KERN_PROC,
        libc::KERN_PROC_PID,
        unsafe { libc::getpid() },
    ];
    let mut buf = [0u8; KINFO_PROC_SIZE];
    let mut size = KINFO_PROC_SIZE;

    // SAFETY: mib and buf are live for the call and size matches buf.
    let ret = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            4,
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    if ret != 0 {
        debug!("kinfo_proc sysctl failed; tracer probe unavailable");
        return DebuggerVerdict::Unavailable;
    }

    traced_from_kinfo(&buf[..size.min(KINFO_PROC_SIZE)])
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
fn tracer_verdict() -> DebuggerVerdict {
    DebuggerVerdict::Unavailable
}

fn env_backend(name: &str) -> BackendKind {
    match std::env::var(name) {
        Ok(raw) => BackendKind::parse(&raw).unwrap_or_else(|| {
            warn!(value = %raw, "unknown probe backend; using auto");
            BackendKind::Auto
        }),
        Err(_) => BackendKind::Auto,
    }
}

fn env_opt_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "enabled" | "on"
        ),
        Err(_) => default,
    }
}
