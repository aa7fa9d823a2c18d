use serde::{Deserialize, Serialize};

/// Active embedding provider (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum EmbeddingProvider {
    OpenAI,
    VoyageAI,
    Gemini,
    Ollama,
}

/// Active vector-store backend (spec §3/§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorStoreProvider {
    Milvus,
    Zilliz,
}

/// Immutable tuple identifying an index's schema (spec §3).
///
/// Two fingerprints are equal iff all five fields are equal, dimension
/// compared numerically never as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub embedding_provider: EmbeddingProvider,
    pub embedding_model: String,
    pub embedding_dimension: u32,
    pub vector_store_provider: VectorStoreProvider,
    pub schema_version: String,
}

pub const CURRENT_SCHEMA_VERSION: &str = "hybrid_v3";

impl Fingerprint {
    pub fn current(
        embedding_provider: EmbeddingProvider,
        embedding_model: impl Into<String>,
        embedding_dimension: u32,
        vector_store_provider: VectorStoreProvider,
    ) -> Self {
        Fingerprint {
            embedding_provider,
            embedding_model: embedding_model.into(),
            embedding_dimension,
            vector_store_provider,
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
        }
    }
}

/// How a persisted entry's fingerprint was established (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintSource {
    Verified,
    AssumedV2,
    RuntimeAssumed,
}

/// Outcome of the fingerprint gate (spec §4.C).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub changed: bool,
    pub reason: Option<&'static str>,
}

impl GateDecision {
    fn allowed() -> Self {
        GateDecision {
            allowed: true,
            changed: false,
            reason: None,
        }
    }

    fn legacy_unverified() -> Self {
        GateDecision {
            allowed: false,
            changed: true,
            reason: Some("legacy_unverified_fingerprint"),
        }
    }

    fn mismatch() -> Self {
        GateDecision {
            allowed: false,
            changed: false,
            reason: Some("fingerprint_mismatch"),
        }
    }
}

/// Evaluates the gate for an entry whose persisted fingerprint/source is
/// `(persisted, source)` against the runtime fingerprint `runtime` (spec
/// §4.C). Pure function; the caller is responsible for mutating the entry's
/// status to `requires_reindex` on any negative outcome.
pub fn evaluate_gate(
    persisted: &Fingerprint,
    source: FingerprintSource,
    runtime: &Fingerprint,
) -> GateDecision {
    if source == FingerprintSource::AssumedV2 {
        return GateDecision::legacy_unverified();
    }
    if persisted != runtime {
        return GateDecision::mismatch();
    }
    GateDecision::allowed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(dim: u32, model: &str) -> Fingerprint {
        Fingerprint::current(
            EmbeddingProvider::OpenAI,
            model,
            dim,
            VectorStoreProvider::Milvus,
        )
    }

    #[test]
    fn equal_fingerprints_compare_dimension_numerically() {
        let a = fp(1536, "text-embedding-3-small");
        let b = fp(1536, "text-embedding-3-small");
        assert_eq!(a, b);
    }

    #[test]
    fn assumed_v2_is_never_allowed_regardless_of_match() {
        // P6-adjacent: assumed_v2 always fails the gate even if the persisted
        // fingerprint happens to match the runtime fingerprint field-for-field.
        let runtime = fp(1536, "text-embedding-3-small");
        let persisted = runtime.clone();
        let decision = evaluate_gate(&persisted, FingerprintSource::AssumedV2, &runtime);
        assert_eq!(decision.allowed, false);
        assert_eq!(decision.reason, Some("legacy_unverified_fingerprint"));
    }

    #[test]
    fn mismatched_fingerprint_is_rejected() {
        // P6: for any fp1 != fp2, an entry seen by a runtime of fp2 is denied
        // with reason "fingerprint_mismatch".
        let runtime = fp(1536, "text-embedding-3-small");
        let persisted = fp(768, "text-embedding-3-small");
        let decision = evaluate_gate(&persisted, FingerprintSource::Verified, &runtime);
        assert_eq!(decision.allowed, false);
        assert_eq!(decision.reason, Some("fingerprint_mismatch"));
    }

    #[test]
    fn verified_matching_fingerprint_is_allowed() {
        let runtime = fp(1536, "text-embedding-3-small");
        let persisted = runtime.clone();
        let decision = evaluate_gate(&persisted, FingerprintSource::Verified, &runtime);
        assert_eq!(decision, GateDecision::allowed());
    }

    #[test]
    fn schema_version_mismatch_counts_as_fingerprint_mismatch() {
        let runtime = fp(1536, "text-embedding-3-small");
        let mut persisted = runtime.clone();
        persisted.schema_version = "hybrid_v1".to_string();
        let decision = evaluate_gate(&persisted, FingerprintSource::Verified, &runtime);
        assert_eq!(decision.reason, Some("fingerprint_mismatch"));
    }
}
