use crate::fingerprint::EmbeddingProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingLocality {
    Local,
    Cloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceProfile {
    Fast,
    Standard,
    Slow,
}

/// Config inputs the resolver derives a capability profile from (spec
/// §4.K). Field presence mirrors the env vars in spec §6.
#[derive(Debug, Clone, Default)]
pub struct CapabilityInputs {
    pub embedding_provider: Option<EmbeddingProvider>,
    pub milvus_endpoint: Option<String>,
    pub milvus_api_token: Option<String>,
    pub voyage_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    pub embedding_locality: EmbeddingLocality,
    pub performance_profile: PerformanceProfile,
    pub has_vector_store: bool,
    pub has_reranker: bool,
    pub default_search_limit: u32,
    pub max_search_limit: u32,
    pub default_rerank_enabled: bool,
}

pub fn resolve_capabilities(inputs: &CapabilityInputs) -> Capabilities {
    let embedding_locality = match inputs.embedding_provider {
        Some(EmbeddingProvider::Ollama) => EmbeddingLocality::Local,
        _ => EmbeddingLocality::Cloud,
    };

    let performance_profile = if embedding_locality == EmbeddingLocality::Local {
        PerformanceProfile::Slow
    } else {
        match inputs.embedding_provider {
            Some(EmbeddingProvider::VoyageAI) | Some(EmbeddingProvider::OpenAI) => {
                PerformanceProfile::Fast
            }
            _ => PerformanceProfile::Standard,
        }
    };

    let has_vector_store = non_empty(&inputs.milvus_endpoint) || non_empty(&inputs.milvus_api_token);
    let has_reranker = non_empty(&inputs.voyage_key);

    let (default_search_limit, max_search_limit) = match performance_profile {
        PerformanceProfile::Fast => (50, 50),
        PerformanceProfile::Standard => (25, 30),
        PerformanceProfile::Slow => (10, 15),
    };

    let default_rerank_enabled = has_reranker && performance_profile != PerformanceProfile::Slow;

    Capabilities {
        embedding_locality,
        performance_profile,
        has_vector_store,
        has_reranker,
        default_search_limit,
        max_search_limit,
        default_rerank_enabled,
    }
}

fn non_empty(opt: &Option<String>) -> bool {
    opt.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ollama_is_local_and_slow() {
        let caps = resolve_capabilities(&CapabilityInputs {
            embedding_provider: Some(EmbeddingProvider::Ollama),
            ..Default::default()
        });
        assert_eq!(caps.embedding_locality, EmbeddingLocality::Local);
        assert_eq!(caps.performance_profile, PerformanceProfile::Slow);
        assert_eq!(caps.default_search_limit, 10);
        assert_eq!(caps.max_search_limit, 15);
    }

    #[test]
    fn openai_is_cloud_and_fast() {
        let caps = resolve_capabilities(&CapabilityInputs {
            embedding_provider: Some(EmbeddingProvider::OpenAI),
            ..Default::default()
        });
        assert_eq!(caps.embedding_locality, EmbeddingLocality::Cloud);
        assert_eq!(caps.performance_profile, PerformanceProfile::Fast);
        assert_eq!(caps.default_search_limit, 50);
    }

    #[test]
    fn gemini_is_cloud_and_standard() {
        let caps = resolve_capabilities(&CapabilityInputs {
            embedding_provider: Some(EmbeddingProvider::Gemini),
            ..Default::default()
        });
        assert_eq!(caps.performance_profile, PerformanceProfile::Standard);
        assert_eq!(caps.default_search_limit, 25);
        assert_eq!(caps.max_search_limit, 30);
    }

    #[test]
    fn rerank_disabled_when_slow_even_with_key() {
        let caps = resolve_capabilities(&CapabilityInputs {
            embedding_provider: Some(EmbeddingProvider::Ollama),
            voyage_key: Some("key".to_string()),
            ..Default::default()
        });
        assert!(caps.has_reranker);
        assert!(!caps.default_rerank_enabled);
    }

    #[test]
    fn has_vector_store_requires_non_empty_credential() {
        let caps = resolve_capabilities(&CapabilityInputs {
            milvus_endpoint: Some(String::new()),
            milvus_api_token: Some(String::new()),
            ..Default::default()
        });
        assert!(!caps.has_vector_store);
    }
}
