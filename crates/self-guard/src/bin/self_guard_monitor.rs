use std::time::Duration;

use anyhow::{bail, Result};
use self_guard::{CheckFlags, DebuggerVerdict, ResultCode, SecurityState, SelfGuard};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let iterations = env_u32("SELF_GUARD_MONITOR_ITERATIONS", 10);
    let interval = Duration::from_millis(env_u64("SELF_GUARD_MONITOR_INTERVAL_MS", 1_000));

    let guard = SelfGuard::from_env();
    info!(
        pid = std::process::id(),
        backend = guard.implementation_name(),
        locator = %guard.locator_strategy(),
        iterations,
        interval_ms = interval.as_millis() as u64,
        "self-guard monitor starting"
    );

    let result = guard.init();
    if !result.is_ok() {
        bail!("initialization failed: {}", result);
    }

    let result = guard.snapshot();
    if !result.is_ok() {
        let _ = guard.shutdown();
        bail!("baseline snapshot failed: {}", result);
    }
    info!(state = %guard.security_state(), "baseline snapshot taken");

    match guard.detect_debugger() {
        DebuggerVerdict::Detected => warn!("debugger detected"),
        DebuggerVerdict::Clear => info!("no debugger detected"),
        DebuggerVerdict::Unavailable => warn!("debugger probe unavailable on this platform"),
    }

    let mut failed: Option<ResultCode> = None;
    for iteration in 1..=iterations {
        std::thread::sleep(interval);

        let result = guard.check_integrity(CheckFlags::ALL);
        let state = guard.security_state();
        info!(iteration, result = %result, state = %state, "integrity check");

        if !result.is_ok() {
            failed = Some(result);
            break;
        }
        if state == SecurityState::Compromised {
            warn!("security breach detected; stopping monitor");
            break;
        }
    }

    let final_state = guard.security_state();
    let result = guard.shutdown();
    if !result.is_ok() {
        bail!("shutdown failed: {}", result);
    }
    info!("self-guard monitor stopped");

    if let Some(result) = failed {
        bail!("integrity check failed: {}", result);
    }
    if final_state == SecurityState::Compromised {
        bail!("process integrity compromised");
    }
    Ok(())
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
