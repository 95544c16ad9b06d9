#![forbid(unsafe_code)]

use std::fmt;

use oc_core::{Device, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Session,
    Lifecycle,
    Skip,
    Status,
    Profile,
}

impl EvidenceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Lifecycle => "lifecycle",
            Self::Skip => "skip",
            Self::Status => "status",
            Self::Profile => "profile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn count(&self, kind: EvidenceKind) -> usize {
        self.entries.iter().filter(|entry| entry.kind == kind).count()
    }
}

/// Per-device evidence for one conformance session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    device: Device,
    ledger: EvidenceLedger,
}

impl SessionContext {
    #[must_use]
    pub fn new(device: Device) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Session,
            format!("session opened on {}", device.name()),
        );
        Self { device, ledger }
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn record_stage(&mut self, case: &str, stage: impl fmt::Display) {
        self.ledger
            .record(EvidenceKind::Lifecycle, format!("{case}: {stage}"));
    }

    pub fn record_skip(&mut self, case: &str, reason: &str) {
        self.ledger
            .record(EvidenceKind::Skip, format!("{case}: skipped ({reason})"));
    }

    pub fn record_status_failure(&mut self, case: &str, stage: impl fmt::Display, status: Status) {
        self.ledger.record(
            EvidenceKind::Status,
            format!("{case}: {stage} failed with {status}"),
        );
    }

    pub fn record_profile(&mut self, case: &str, label: &str, mean_ns: u128) {
        self.ledger.record(
            EvidenceKind::Profile,
            format!("{case}: {label} mean={mean_ns}ns"),
        );
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use oc_core::{Device, Status};

    use super::{EvidenceKind, EvidenceLedger, SessionContext};

    #[test]
    fn session_opens_with_one_entry() {
        let ctx = SessionContext::new(Device::Cpu);
        assert_eq!(ctx.device(), Device::Cpu);
        assert_eq!(ctx.ledger().len(), 1);
        assert_eq!(ctx.ledger().entries()[0].kind, EvidenceKind::Session);
        assert!(ctx.ledger().entries()[0].summary.contains("CPU"));
    }

    #[test]
    fn ledger_records_case_events_in_order() {
        let mut ctx = SessionContext::new(Device::Cpu);
        ctx.record_stage("case-0", "descriptor created");
        ctx.record_skip("case-1", "skip_broadcast_operand");
        ctx.record_status_failure("case-2", "execute", Status::InsufficientWorkspace);
        ctx.record_profile("case-3", "lib", 1_250);

        assert_eq!(ctx.ledger().len(), 5);
        assert_eq!(ctx.ledger().count(EvidenceKind::Lifecycle), 1);
        assert_eq!(ctx.ledger().count(EvidenceKind::Skip), 1);
        let entries = ctx.ledger().entries();
        assert_eq!(entries[1].summary, "case-0: descriptor created");
        assert_eq!(entries[3].kind, EvidenceKind::Status);
        assert!(entries[3].summary.contains("STATUS_INSUFFICIENT_WORKSPACE"));
        assert_eq!(entries[4].summary, "case-3: lib mean=1250ns");
    }

    #[test]
    fn empty_ledger_reports_empty() {
        let mut ledger = EvidenceLedger::new();
        assert!(ledger.is_empty());
        ledger.record(EvidenceKind::Status, "ok");
        assert!(!ledger.is_empty());
        assert!(ledger.entries()[0].ts_unix_ms > 0);
    }
}
