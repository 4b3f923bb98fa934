#![forbid(unsafe_code)]

use fo_core::ExecutionMode;

/// What a ledger entry witnesses. One kind per observable session
/// operation, plus `ModePolicy` for mode lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    ModePolicy,
    OpDispatched,
    InplaceApplied,
    OutWritten,
    BackwardCompleted,
    GraphTraced,
    GraphCompiled,
    GraphExecuted,
    GradChecked,
}

impl EvidenceKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::ModePolicy => "mode_policy",
            Self::OpDispatched => "op_dispatched",
            Self::InplaceApplied => "inplace_applied",
            Self::OutWritten => "out_written",
            Self::BackwardCompleted => "backward_completed",
            Self::GraphTraced => "graph_traced",
            Self::GraphCompiled => "graph_compiled",
            Self::GraphExecuted => "graph_executed",
            Self::GradChecked => "grad_checked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

/// Append-only record of what a session did. The harness folds ledgers
/// into the `runtime_evidence` block of forensic logs.
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
    pub fn count_of(&self, kind: EvidenceKind) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    /// FNV-1a over kind labels and summaries, skipping timestamps, so two
    /// sessions that performed the same operations fingerprint identically.
    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        let mut mix = |byte: u8| {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        };
        for entry in &self.entries {
            for byte in entry.kind.label().bytes() {
                mix(byte);
            }
            mix(0x1f);
            for byte in entry.summary.bytes() {
                mix(byte);
            }
            mix(0x1e);
        }
        hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::ModePolicy,
            format!("mode initialized to {mode:?}"),
        );
        Self { mode, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.ledger.record(
            EvidenceKind::ModePolicy,
            format!("mode switched to {mode:?}"),
        );
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }
}

#[must_use]
pub fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
