use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MARKER_KIND: &str = "satori_index_completion_v1";

/// Reserved document stored in the vector store proving an index run
/// finished under a specific fingerprint (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub kind: String,
    pub codebase_path: String,
    pub fingerprint: Fingerprint,
    pub indexed_files: u64,
    pub total_chunks: u64,
    pub completed_at: DateTime<Utc>,
    pub run_id: String,
}

/// Outcome of validating a fetched marker against an expected path and the
/// runtime fingerprint (spec §4.D). `StaleLocal` carries the specific reason
/// a caller may want to log; `ProbeFailed` is non-authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerValidation {
    Valid,
    StaleLocal(&'static str),
    FingerprintMismatch,
    ProbeFailed,
}

impl MarkerValidation {
    pub fn as_reason(&self) -> &'static str {
        match self {
            MarkerValidation::Valid => "valid",
            MarkerValidation::StaleLocal(reason) => reason,
            MarkerValidation::FingerprintMismatch => "fingerprint_mismatch",
            MarkerValidation::ProbeFailed => "probe_failed",
        }
    }
}

/// A fetched-but-not-yet-structurally-validated marker payload, as it would
/// arrive from a vector-store probe. Modeled loosely (raw JSON-ish fields) so
/// step 3 of the validation sequence (numeric/parseable checks) has
/// something real to fail against.
#[derive(Debug, Clone, Default)]
pub struct RawMarkerPayload {
    pub present: bool,
    pub kind: Option<String>,
    pub codebase_path: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    pub indexed_files: Option<f64>,
    pub total_chunks: Option<f64>,
    pub completed_at: Option<String>,
    pub run_id: Option<String>,
}

/// Runs the 6-step validation sequence from spec §4.D against a fetched
/// payload for `expected_path`, comparing against `runtime_fingerprint`.
pub fn validate_marker(
    payload: &RawMarkerPayload,
    expected_path: &Path,
    runtime_fingerprint: &Fingerprint,
) -> MarkerValidation {
    // 1. Marker present?
    if !payload.present {
        return MarkerValidation::StaleLocal("missing_marker_doc");
    }

    // 2. kind == satori_index_completion_v1?
    if payload.kind.as_deref() != Some(MARKER_KIND) {
        return MarkerValidation::StaleLocal("invalid_marker_kind");
    }

    // 3. Structural validity: non-empty codebasePath, a fingerprint object,
    // finite indexedFiles/totalChunks, parseable completedAt.
    let codebase_path = match payload.codebase_path.as_deref() {
        Some(p) if !p.is_empty() => p,
        _ => return MarkerValidation::StaleLocal("invalid_payload"),
    };
    let fingerprint = match payload.fingerprint.as_ref() {
        Some(fp) => fp,
        None => return MarkerValidation::StaleLocal("invalid_payload"),
    };
    let indexed_files = match payload.indexed_files {
        Some(n) if n.is_finite() => n,
        _ => return MarkerValidation::StaleLocal("invalid_payload"),
    };
    let total_chunks = match payload.total_chunks {
        Some(n) if n.is_finite() => n,
        _ => return MarkerValidation::StaleLocal("invalid_payload"),
    };
    let _ = (indexed_files, total_chunks);
    let completed_at = match payload.completed_at.as_deref() {
        Some(s) => s,
        None => return MarkerValidation::StaleLocal("invalid_payload"),
    };
    if DateTime::parse_from_rfc3339(completed_at).is_err() {
        return MarkerValidation::StaleLocal("invalid_payload");
    }

    // 4. Canonicalized marker path equals canonicalized expected path.
    let marker_path = Path::new(codebase_path);
    let expected_canon = match expected_path.canonicalize() {
        Ok(p) => p,
        Err(_) => expected_path.to_path_buf(),
    };
    let marker_canon = marker_path
        .canonicalize()
        .unwrap_or_else(|_| marker_path.to_path_buf());
    if marker_canon != expected_canon {
        return MarkerValidation::StaleLocal("path_mismatch");
    }

    // 5. Marker fingerprint exactly equals runtime fingerprint.
    if fingerprint != runtime_fingerprint {
        return MarkerValidation::FingerprintMismatch;
    }

    // 6. All pass.
    MarkerValidation::Valid
}

/// Action to take for an `indexing` entry found on startup (spec §4.D
/// interruption recovery, scenario S7).
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    PromoteIndexed {
        reason: &'static str,
        indexed_files: u64,
        total_chunks: u64,
    },
    MarkFailed {
        reason: &'static str,
    },
    /// Probe failed: non-authoritative, caller keeps local status.
    KeepLocal,
}

pub fn decide_interrupted_indexing_recovery(
    payload: &RawMarkerPayload,
    expected_path: &Path,
    runtime_fingerprint: &Fingerprint,
) -> RecoveryDecision {
    match validate_marker(payload, expected_path, runtime_fingerprint) {
        MarkerValidation::Valid => RecoveryDecision::PromoteIndexed {
            reason: "valid_marker",
            indexed_files: payload.indexed_files.unwrap_or(0.0) as u64,
            total_chunks: payload.total_chunks.unwrap_or(0.0) as u64,
        },
        MarkerValidation::StaleLocal("missing_marker_doc") => RecoveryDecision::MarkFailed {
            reason: "missing_marker",
        },
        MarkerValidation::FingerprintMismatch => RecoveryDecision::MarkFailed {
            reason: "fingerprint_mismatch",
        },
        MarkerValidation::StaleLocal(_) => RecoveryDecision::MarkFailed {
            reason: "missing_marker",
        },
        MarkerValidation::ProbeFailed => RecoveryDecision::KeepLocal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{EmbeddingProvider, VectorStoreProvider};

    fn fp() -> Fingerprint {
        Fingerprint::current(EmbeddingProvider::OpenAI, "text-embedding-3-small", 1536, VectorStoreProvider::Milvus)
    }

    fn valid_payload(path: &Path) -> RawMarkerPayload {
        RawMarkerPayload {
            present: true,
            kind: Some(MARKER_KIND.to_string()),
            codebase_path: Some(path.to_string_lossy().to_string()),
            fingerprint: Some(fp()),
            indexed_files: Some(169.0),
            total_chunks: Some(728.0),
            completed_at: Some(Utc::now().to_rfc3339()),
            run_id: Some("run-1".to_string()),
        }
    }

    #[test]
    fn missing_marker_is_stale_local() {
        let payload = RawMarkerPayload::default();
        let dir = tempfile::tempdir().unwrap();
        let result = validate_marker(&payload, dir.path(), &fp());
        assert_eq!(result, MarkerValidation::StaleLocal("missing_marker_doc"));
    }

    #[test]
    fn wrong_kind_is_stale_local() {
        let dir = tempfile::tempdir().unwrap();
        let mut payload = valid_payload(dir.path());
        payload.kind = Some("something_else".to_string());
        let result = validate_marker(&payload, dir.path(), &fp());
        assert_eq!(result, MarkerValidation::StaleLocal("invalid_marker_kind"));
    }

    #[test]
    fn mismatched_fingerprint_is_reported_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        let payload = valid_payload(dir.path());
        let mut other = fp();
        other.embedding_dimension = 768;
        let result = validate_marker(&payload, dir.path(), &other);
        assert_eq!(result, MarkerValidation::FingerprintMismatch);
    }

    #[test]
    fn valid_marker_passes_all_six_steps() {
        let dir = tempfile::tempdir().unwrap();
        let payload = valid_payload(dir.path());
        let result = validate_marker(&payload, dir.path(), &fp());
        assert_eq!(result, MarkerValidation::Valid);
    }

    #[test]
    fn scenario_s7_interrupted_indexing_promotes_with_stats() {
        let dir = tempfile::tempdir().unwrap();
        let payload = valid_payload(dir.path());
        let decision = decide_interrupted_indexing_recovery(&payload, dir.path(), &fp());
        assert_eq!(
            decision,
            RecoveryDecision::PromoteIndexed {
                reason: "valid_marker",
                indexed_files: 169,
                total_chunks: 728,
            }
        );
    }
}
