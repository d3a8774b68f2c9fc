use self_guard::{
    checksum_bytes, default_backend, default_implementation_name, parse_tracer_pid,
    time_workload, traced_from_kinfo, tracer_verdict_from_status, BackendKind, DebuggerVerdict,
    PortableProbe, ProbeBackend, ProbeConfig,
};

fn quiet_config() -> ProbeConfig {
    ProbeConfig {
        backend: BackendKind::Portable,
        timing_threshold: None,
        timing_iterations: 10,
        enable_tracer_probe: false,
    }
}

#[test]
fn parse_tracer_pid_extracts_numeric_value() {
    let status = "Name:\ttest\nState:\tR (running)\nTracerPid:\t42\n";
    assert_eq!(parse_tracer_pid(status), Some(42));
}

#[test]
fn parse_tracer_pid_returns_none_when_field_missing_or_invalid() {
    assert_eq!(parse_tracer_pid("Name:\ttest\nState:\tR\n"), None);
    assert_eq!(parse_tracer_pid("TracerPid:\tinvalid\n"), None);
    assert_eq!(parse_tracer_pid("TracerPid:\n"), None);
}

#[test]
fn tracer_status_maps_to_verdicts() {
    assert_eq!(
        tracer_verdict_from_status("TracerPid:\t0\n"),
        DebuggerVerdict::Clear
    );
    assert_eq!(
        tracer_verdict_from_status("TracerPid:\t3117\n"),
        DebuggerVerdict::Detected
    );
    assert_eq!(
        tracer_verdict_from_status("Name:\tno tracer field\n"),
        DebuggerVerdict::Unavailable
    );
}

fn kinfo_with(offset: usize, value: i32) -> Vec<u8> {
    let mut kinfo = vec![0u8; 648];
    kinfo[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    kinfo
}

#[test]
fn kinfo_p_traced_is_read_from_p_flag() {
    const P_TRACED: i32 = 0x0000_0800;
    // p_un (16) + p_vmspace (8) + p_sigacts (8)
    const P_FLAG: usize = 32;

    assert_eq!(
        traced_from_kinfo(&kinfo_with(P_FLAG, P_TRACED | 0x4)),
        DebuggerVerdict::Detected
    );
    assert_eq!(
        traced_from_kinfo(&kinfo_with(P_FLAG, 0x4)),
        DebuggerVerdict::Clear
    );
    // A pointer-looking p_vmspace value with the P_TRACED bit set is not p_flag.
    assert_eq!(
        traced_from_kinfo(&kinfo_with(16, P_TRACED)),
        DebuggerVerdict::Clear
    );
}

#[test]
fn truncated_kinfo_gives_no_signal() {
    assert_eq!(traced_from_kinfo(&[]), DebuggerVerdict::Unavailable);
    assert_eq!(traced_from_kinfo(&[0u8; 35]), DebuggerVerdict::Unavailable);
    assert_eq!(traced_from_kinfo(&[0u8; 36]), DebuggerVerdict::Clear);
}

#[test]
fn debugger_verdict_raw_values_are_stable() {
    assert_eq!(DebuggerVerdict::Clear.as_raw(), 0);
    assert_eq!(DebuggerVerdict::Detected.as_raw(), 1);
    assert_eq!(DebuggerVerdict::Unavailable.as_raw(), -1);
    assert!(DebuggerVerdict::Detected.detected());
    assert!(!DebuggerVerdict::Unavailable.detected());
}

#[test]
fn disabled_tracer_probe_reports_unavailable() {
    let probe = PortableProbe::new(&quiet_config());
    assert_eq!(probe.low_level_check(), DebuggerVerdict::Unavailable);
}

#[cfg(target_os = "linux")]
#[test]
fn tracer_probe_gives_a_definite_answer_on_linux() {
    let probe = PortableProbe::new(&ProbeConfig {
        enable_tracer_probe: true,
        ..quiet_config()
    });
    assert_ne!(probe.low_level_check(), DebuggerVerdict::Unavailable);
}

#[test]
fn time_workload_handles_zero_iterations() {
    let ticks = std::cell::Cell::new(0u64);
    let counter = || {
        ticks.set(ticks.get() + 5);
        ticks.get()
    };
    assert_eq!(time_workload(0, counter), 5);
}

#[test]
fn portable_counter_is_monotonic() {
    let probe = PortableProbe::new(&quiet_config());
    let mut last = probe.cycle_counter();
    for _ in 0..1_000 {
        let next = probe.cycle_counter();
        assert!(next >= last);
        last = next;
    }
}

#[test]
fn timing_probe_flags_anomaly_when_threshold_is_zero() {
    let probe = PortableProbe::new(&ProbeConfig {
        timing_threshold: Some(0),
        timing_iterations: 200_000,
        ..quiet_config()
    });
    assert!(probe.timing_check());
}

#[test]
fn timing_probe_is_quiet_under_unreachable_threshold() {
    let probe = PortableProbe::new(&ProbeConfig {
        timing_threshold: Some(u64::MAX),
        ..quiet_config()
    });
    assert!(!probe.timing_check());
}

#[test]
fn portable_probe_uses_default_threshold_without_override() {
    let probe = PortableProbe::new(&quiet_config());
    assert_eq!(probe.threshold_nanos(), 100_000);
    assert_eq!(probe.implementation_name(), "portable-fallback");
}

#[test]
fn backend_kind_parses_known_names() {
    assert_eq!(BackendKind::parse("Portable"), Some(BackendKind::Portable));
    assert_eq!(BackendKind::parse(" tsc "), Some(BackendKind::CycleCounter));
    assert_eq!(BackendKind::parse("auto"), Some(BackendKind::Auto));
    assert_eq!(BackendKind::parse("quantum"), None);
}

#[test]
fn portable_backend_selection_is_honoured() {
    let backend = default_backend(&quiet_config());
    assert_eq!(backend.implementation_name(), "portable-fallback");
}

#[cfg(target_arch = "x86_64")]
#[test]
fn auto_backend_uses_cycle_counter_on_x86_64() {
    let backend = default_backend(&ProbeConfig {
        backend: BackendKind::Auto,
        ..quiet_config()
    });
    assert_eq!(backend.implementation_name(), "x86_64-native");
    assert_eq!(default_implementation_name(), "x86_64-native");
    let first = backend.cycle_counter();
    assert!(backend.cycle_counter() >= first);
}

#[test]
fn default_checksum_method_matches_shared_accumulator() {
    let probe = PortableProbe::new(&quiet_config());
    let bytes = b"self-guard baseline";
    assert_eq!(probe.checksum_memory(bytes), checksum_bytes(bytes));
}
