use std::collections::BTreeMap;

use fo_core::ExecutionMode;
use serde::Serialize;
use serde_json::Value;

pub const FORENSICS_SCHEMA_VERSION: &str = "fo-conformance-log-v1";

#[must_use]
pub fn mode_label(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Strict => "strict",
        ExecutionMode::Hardened => "hardened",
    }
}

/// One line of the forensic JSONL log. The envelope carries everything a
/// replay needs; suite-specific observations travel in `extra_fields`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: &'static str,
    pub ts_unix_ms: u128,
    pub suite_id: String,
    pub scenario_id: String,
    pub fixture_id: String,
    pub packet_id: String,
    pub mode: String,
    pub seed: u64,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: String,
    pub reason_code: String,
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        fixture_id: &str,
        packet_id: &str,
        case_name: &str,
        mode: ExecutionMode,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        let scenario_id = crate::scenario_id(suite_id, mode, case_name);
        // Replay seed is a pure function of the scenario coordinates, so two
        // runs of the same case log the same seed.
        let seed = det_hash64(&[suite_id, scenario_id.as_str(), fixture_id, packet_id]);
        Self {
            schema_version: FORENSICS_SCHEMA_VERSION,
            ts_unix_ms: now_unix_ms(),
            suite_id: suite_id.to_string(),
            scenario_id,
            fixture_id: fixture_id.to_string(),
            packet_id: packet_id.to_string(),
            mode: mode_label(mode).to_string(),
            seed,
            env_fingerprint: env_fingerprint(),
            artifact_refs,
            replay_command,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields = extra_fields;
        self
    }
}

/// Build fingerprint without timestamps: equal toolchain targets produce
/// equal envelopes.
#[must_use]
pub fn env_fingerprint() -> String {
    format!(
        "det64:{:016x}",
        det_hash64(&[
            FORENSICS_SCHEMA_VERSION,
            std::env::consts::OS,
            std::env::consts::ARCH,
            std::env::consts::FAMILY,
        ])
    )
}

pub fn det_hash64(parts: &[&str]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for part in parts {
        for byte in part.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash ^= 0xff;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

pub fn now_unix_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
