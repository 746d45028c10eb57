//! Configuration for the MemoryX server.
//!
//! All tunables live here with environment overrides. Sensible defaults,
//! configurable in production.

use std::env;
use std::path::PathBuf;
use tracing::info;

/// CORS configuration
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Allowed origins (empty = allow all)
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: vec![
                "GET".to_string(),
                "POST".to_string(),
                "DELETE".to_string(),
                "OPTIONS".to_string(),
            ],
            allowed_headers: vec![
                "Content-Type".to_string(),
                "X-API-Key".to_string(),
                "Authorization".to_string(),
            ],
            max_age_seconds: 86_400,
        }
    }
}

impl CorsConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(origins) = env::var("MEMORYX_CORS_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config
    }

    pub fn is_restricted(&self) -> bool {
        !self.allowed_origins.is_empty()
    }

    pub fn to_layer(&self) -> tower_http::cors::CorsLayer {
        use tower_http::cors::{AllowOrigin, Any, CorsLayer};

        let mut layer = CorsLayer::new();

        if self.allowed_origins.is_empty() {
            layer = layer.allow_origin(Any);
        } else {
            let origins: Vec<_> = self
                .allowed_origins
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();
            if origins.is_empty() {
                layer = layer.allow_origin(Any);
            } else {
                layer = layer.allow_origin(AllowOrigin::list(origins));
            }
        }

        let methods: Vec<axum::http::Method> = self
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        layer = layer.allow_methods(methods);

        let headers: Vec<axum::http::HeaderName> = self
            .allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer = layer.allow_headers(headers);

        layer.max_age(std::time::Duration::from_secs(self.max_age_seconds))
    }
}

/// Fused ranking weights of the retriever:
/// `score = alpha * sim + beta * graph_boost + gamma * temporal_decay`.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalWeights {
    pub alpha: f32,
    pub beta: f32,
    pub gamma: f32,
    /// Decay time constant in days: `decay = exp(-age / tau)`.
    pub tau_days: f32,
}

impl Default for RetrievalWeights {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            beta: 0.25,
            gamma: 0.15,
            tau_days: 30.0,
        }
    }
}

/// Similarity thresholds driving the reconciler's deterministic fast paths.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerThresholds {
    /// Below this best-neighbor similarity a candidate is an ADD.
    pub add: f32,
    /// At or above this similarity with equal entity sets, a NOOP.
    pub noop: f32,
}

impl Default for ReconcilerThresholds {
    fn default() -> Self {
        Self { add: 0.80, noop: 0.95 }
    }
}

/// Remote model endpoint (OpenAI-compatible).
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

/// Server configuration loaded from environment with defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Root directory; relational/, vector/, graph/ keyspaces live under it.
    pub data_dir: PathBuf,
    pub is_production: bool,
    pub cors: CorsConfig,

    pub llm: ModelEndpoint,
    pub embed: ModelEndpoint,
    /// Embedding dimensionality; deploy-time constant.
    pub embed_dim: usize,
    /// Max concurrent in-flight LLM calls (semaphore).
    pub llm_concurrency: usize,

    /// Reconciliation worker pool size.
    pub workers: usize,
    /// Per-task deadline in seconds.
    pub task_deadline_secs: u64,
    /// Drift sweep cadence in seconds.
    pub sweep_interval_secs: u64,
    /// Community recompute cadence in seconds.
    pub community_interval_secs: u64,

    pub weights: RetrievalWeights,
    pub thresholds: ReconcilerThresholds,

    /// Session / signing material.
    pub secret_key: Option<String>,
    /// Hex-encoded 32-byte key; when set, memory content is envelope-encrypted.
    pub content_key: Option<String>,

    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3030,
            data_dir: PathBuf::from("./memoryx_data"),
            is_production: false,
            cors: CorsConfig::default(),
            llm: ModelEndpoint {
                base_url: "http://localhost:11434/v1".to_string(),
                model: "qwen3-14b".to_string(),
                api_key: None,
            },
            embed: ModelEndpoint {
                base_url: "http://localhost:11434/v1".to_string(),
                model: "bge-m3".to_string(),
                api_key: None,
            },
            embed_dim: 1024,
            llm_concurrency: 4,
            workers: 2,
            task_deadline_secs: 30,
            sweep_interval_secs: 3600,
            community_interval_secs: 86_400,
            weights: RetrievalWeights::default(),
            thresholds: ReconcilerThresholds::default(),
            secret_key: None,
            content_key: None,
            rate_limit_per_second: 1000,
            rate_limit_burst: 2000,
            max_concurrent_requests: 200,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = env::var(key) {
        if let Ok(parsed) = val.parse() {
            *target = parsed;
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.is_production = env::var("MEMORYX_ENV")
            .map(|v| {
                let v = v.to_lowercase();
                v == "production" || v == "prod"
            })
            .unwrap_or(false);

        env_parse("MEMORYX_PORT", &mut config.port);

        if let Ok(val) = env::var("MEMORYX_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("MEMORYX_LLM_BASE_URL") {
            config.llm.base_url = val;
        }
        if let Ok(val) = env::var("MEMORYX_LLM_MODEL") {
            config.llm.model = val;
        }
        config.llm.api_key = env::var("MEMORYX_LLM_API_KEY").ok().filter(|s| !s.is_empty());

        if let Ok(val) = env::var("MEMORYX_EMBED_BASE_URL") {
            config.embed.base_url = val;
        }
        if let Ok(val) = env::var("MEMORYX_EMBED_MODEL") {
            config.embed.model = val;
        }
        config.embed.api_key = config.llm.api_key.clone();

        env_parse("MEMORYX_EMBED_DIM", &mut config.embed_dim);
        env_parse("MEMORYX_LLM_CONCURRENCY", &mut config.llm_concurrency);
        env_parse("MEMORYX_WORKERS", &mut config.workers);
        env_parse("MEMORYX_TASK_DEADLINE_SECS", &mut config.task_deadline_secs);
        env_parse("MEMORYX_SWEEP_INTERVAL_SECS", &mut config.sweep_interval_secs);
        env_parse(
            "MEMORYX_COMMUNITY_INTERVAL_SECS",
            &mut config.community_interval_secs,
        );

        env_parse("MEMORYX_SCORE_ALPHA", &mut config.weights.alpha);
        env_parse("MEMORYX_SCORE_BETA", &mut config.weights.beta);
        env_parse("MEMORYX_SCORE_GAMMA", &mut config.weights.gamma);
        env_parse("MEMORYX_SCORE_TAU_DAYS", &mut config.weights.tau_days);

        env_parse("MEMORYX_THRESHOLD_ADD", &mut config.thresholds.add);
        env_parse("MEMORYX_THRESHOLD_NOOP", &mut config.thresholds.noop);

        config.secret_key = env::var("MEMORYX_SECRET_KEY").ok().filter(|s| !s.is_empty());
        config.content_key = env::var("MEMORYX_CONTENT_KEY").ok().filter(|s| !s.is_empty());

        env_parse("MEMORYX_RATE_LIMIT", &mut config.rate_limit_per_second);
        env_parse("MEMORYX_RATE_BURST", &mut config.rate_limit_burst);
        env_parse("MEMORYX_MAX_CONCURRENT", &mut config.max_concurrent_requests);

        config.cors = CorsConfig::from_env();

        config
    }

    /// Log the effective configuration at startup.
    pub fn log(&self) {
        info!("Configuration:");
        info!(
            "   Mode: {}",
            if self.is_production {
                "PRODUCTION"
            } else {
                "Development"
            }
        );
        info!("   Port: {}", self.port);
        info!("   Data dir: {:?}", self.data_dir);
        info!("   LLM: {} @ {}", self.llm.model, self.llm.base_url);
        info!(
            "   Embeddings: {} @ {} (dim {})",
            self.embed.model, self.embed.base_url, self.embed_dim
        );
        info!(
            "   Workers: {} (deadline {}s), sweep every {}s",
            self.workers, self.task_deadline_secs, self.sweep_interval_secs
        );
        info!(
            "   Ranking: alpha={} beta={} gamma={} tau={}d",
            self.weights.alpha, self.weights.beta, self.weights.gamma, self.weights.tau_days
        );
        if self.content_key.is_some() {
            info!("   Content-at-rest encryption: enabled");
        }
        if self.cors.is_restricted() {
            info!("   CORS origins: {:?}", self.cors.allowed_origins);
        } else {
            info!("   CORS: permissive (all origins allowed)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3030);
        assert_eq!(config.workers, 2);
        assert_eq!(config.task_deadline_secs, 30);
        assert!(!config.is_production);
        assert!((config.weights.alpha - 0.6).abs() < f32::EPSILON);
        assert!((config.thresholds.add - 0.80).abs() < f32::EPSILON);
        assert!((config.thresholds.noop - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn cors_default_is_permissive() {
        let cors = CorsConfig::default();
        assert!(!cors.is_restricted());
        let _layer = cors.to_layer(); // should not panic
    }
}
