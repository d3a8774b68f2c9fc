use crate::state::{CheckFlags, SecurityState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Suspicious,
    Compromised,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityFinding {
    DebuggerDetected,
    TimingAnomaly,
    CodeChecksumMismatch {
        expected: u32,
        observed: u32,
    },
    FallbackChecksumMismatch {
        expected: u32,
        observed: u32,
    },
    /// The code section appeared or disappeared since the last snapshot.
    ChecksumSourceChanged {
        code_section_available: bool,
    },
}

impl IntegrityFinding {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DebuggerDetected => "debugger_detected",
            Self::TimingAnomaly => "timing_anomaly",
            Self::CodeChecksumMismatch { .. } => "code_checksum_mismatch",
            Self::FallbackChecksumMismatch { .. } => "fallback_checksum_mismatch",
            Self::ChecksumSourceChanged { .. } => "checksum_source_changed",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::DebuggerDetected | Self::CodeChecksumMismatch { .. } => Severity::Compromised,
            Self::TimingAnomaly
            | Self::FallbackChecksumMismatch { .. }
            | Self::ChecksumSourceChanged { .. } => Severity::Suspicious,
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Self::DebuggerDetected => "low-level probe reported an attached debugger".to_string(),
            Self::TimingAnomaly => "timed workload exceeded threshold".to_string(),
            Self::CodeChecksumMismatch { expected, observed } => format!(
                "code section checksum mismatch: expected={:#010x} observed={:#010x}",
                expected, observed
            ),
            Self::FallbackChecksumMismatch { expected, observed } => format!(
                "baseline fallback checksum mismatch: expected={:#010x} observed={:#010x}",
                expected, observed
            ),
            Self::ChecksumSourceChanged {
                code_section_available,
            } => format!(
                "checksum source changed since snapshot (code section available={})",
                code_section_available
            ),
        }
    }
}

/// Outcome of one `check_integrity` run. A report exists whenever the check
/// executed, whatever the resulting state.
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub flags: CheckFlags,
    pub findings: Vec<IntegrityFinding>,
    pub state: SecurityState,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn compromised(&self) -> bool {
        self.findings
            .iter()
            .any(|finding| finding.severity() == Severity::Compromised)
    }

    pub fn suspicious(&self) -> bool {
        self.findings
            .iter()
            .any(|finding| finding.severity() == Severity::Suspicious)
    }

    pub fn finding_codes(&self) -> Vec<&'static str> {
        self.findings.iter().map(IntegrityFinding::code).collect()
    }

    pub fn summary(&self) -> String {
        if self.findings.is_empty() {
            return "ok".to_string();
        }

        self.findings
            .iter()
            .map(IntegrityFinding::detail)
            .collect::<Vec<_>>()
            .join("; ")
    }
}
