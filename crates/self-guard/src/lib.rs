mod error;
mod guard;
mod locator;
mod manager;
mod probe;
mod report;
mod state;

pub use error::{GuardError, GuardResult};
pub use guard::{ResultCode, SelfGuard};
pub use locator::{
    parse_maps_line, select_code_region, CodeSection, CodeSectionLocator, LoadedImageLocator,
    LocatorStrategy, MapsRegion, MemoryMapLocator, UnavailableLocator,
};
#[cfg(all(feature = "link-symbols", target_os = "linux"))]
pub use locator::LinkSymbolLocator;
pub use manager::{GuardConfig, SecurityStateManager};
#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
pub use probe::CycleCounterProbe;
pub use probe::{
    checksum_bytes, default_backend, default_implementation_name, parse_tracer_pid,
    time_workload, traced_from_kinfo, tracer_verdict_from_status, BackendKind, DebuggerVerdict,
    PortableProbe, ProbeBackend, ProbeConfig,
};
pub use report::{IntegrityFinding, IntegrityReport, Severity};
pub use state::{CheckFlags, SecurityState};
