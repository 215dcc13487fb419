//! # Configuration Module
//!
//! Loads the CLI configuration from environment variables (and `.env`).
//! Command-line flags are applied on top in `main.rs`.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use research_flow::{CacheTtls, ResearchConfig};

// =============================================================================
// CONFIGURATION STRUCT
// =============================================================================
#[derive(Debug, Clone)]
pub struct Config {
    /// The Ollama model to use (e.g., "llama3.2")
    pub model: String,

    /// Ollama server URL (default: http://localhost:11434)
    pub ollama_host: String,

    /// Temperature for LLM responses (0.0 = deterministic, 1.0 = creative)
    pub temperature: f32,

    /// Results requested per search query
    pub max_search_results: usize,

    /// Iteration budget per research run
    pub max_iterations: u32,

    /// Search queries in flight at once
    pub max_concurrent_searches: usize,

    /// TTL for cached query plans, searches and results
    pub cache_ttl: Duration,

    /// Per-call model timeout
    pub llm_timeout: Duration,

    /// Per-request search timeout
    pub search_timeout: Duration,

    /// Where research records are written
    pub data_dir: PathBuf,

    /// Redis cache; the in-memory cache is used when unset
    pub redis_url: Option<String>,

    /// Log level for the application
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let research = ResearchConfig::default();
        Self {
            model: "llama3.2".to_string(),
            ollama_host: "http://localhost:11434".to_string(),
            // Lower than chat use: the stages want structured, factual answers
            temperature: 0.3,
            max_search_results: research.max_search_results,
            max_iterations: research.max_iterations,
            max_concurrent_searches: research.max_concurrent_searches,
            cache_ttl: research.cache_ttl.queries,
            llm_timeout: Duration::from_secs(120),
            search_timeout: Duration::from_secs(30),
            data_dir: default_data_dir(),
            redis_url: None,
            log_level: "info".to_string(),
        }
    }
}

/// `~/.local/share/deep-research` (or platform equivalent), else `./research-data`
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("deep-research"))
        .unwrap_or_else(|| PathBuf::from("research-data"))
}

// =============================================================================
// CONFIGURATION LOADING
// =============================================================================
impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Rust Concept: The ? Operator with Context
    ///
    /// `.context()` wraps a parse error with the variable that caused it, so
    /// the user sees `MAX_ITERATIONS must be ...` instead of `invalid digit`.
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (silently ignore if not found)
        let _ = dotenvy::dotenv();

        let mut config = Config::default();

        if let Ok(val) = env::var("OLLAMA_MODEL") {
            config.model = val;
        }

        if let Ok(val) = env::var("OLLAMA_API_BASE_URL") {
            config.ollama_host = val;
        }

        if let Ok(val) = env::var("TEMPERATURE") {
            config.temperature = val
                .parse()
                .context("TEMPERATURE must be a valid floating-point number (e.g., 0.3)")?;
        }

        if let Ok(val) = env::var("MAX_SEARCH_RESULTS") {
            config.max_search_results = val
                .parse()
                .context("MAX_SEARCH_RESULTS must be a valid positive integer")?;
        }

        if let Ok(val) = env::var("MAX_ITERATIONS") {
            config.max_iterations = val
                .parse()
                .context("MAX_ITERATIONS must be a valid positive integer")?;
        }

        if let Ok(val) = env::var("MAX_CONCURRENT_SEARCHES") {
            config.max_concurrent_searches = val
                .parse()
                .context("MAX_CONCURRENT_SEARCHES must be a valid positive integer")?;
        }

        if let Ok(val) = env::var("CACHE_TTL") {
            let secs: u64 = val.parse().context("CACHE_TTL must be a number of seconds")?;
            config.cache_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = env::var("RESEARCH_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("REDIS_URL") {
            if !val.trim().is_empty() {
                config.redis_url = Some(val);
            }
        }

        if let Ok(val) = env::var("RUST_LOG") {
            config.log_level = val;
        }

        Ok(config)
    }

    /// Validate the configuration before anything is started.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            anyhow::bail!(
                "Temperature must be between 0.0 and 2.0, got: {}",
                self.temperature
            );
        }

        if self.model.is_empty() {
            anyhow::bail!("OLLAMA_MODEL cannot be empty");
        }

        if self.cache_ttl.is_zero() {
            anyhow::bail!("CACHE_TTL must be at least 1 second");
        }

        self.research_config()
            .validate()
            .context("Invalid research settings")?;

        Ok(())
    }

    /// Settings handed to the research engine
    pub fn research_config(&self) -> ResearchConfig {
        ResearchConfig::new()
            .with_max_iterations(self.max_iterations)
            .with_max_concurrent_searches(self.max_concurrent_searches)
            .with_max_search_results(self.max_search_results)
            .with_cache_ttl(CacheTtls::uniform(self.cache_ttl))
    }
}

// =============================================================================
// UNIT TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.model, "llama3.2");
        assert_eq!(config.ollama_host, "http://localhost:11434");
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.max_concurrent_searches, 3);
        assert_eq!(config.max_search_results, 10);
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_temperature() {
        let config = Config {
            temperature: 3.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_iterations() {
        let config = Config {
            max_iterations: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_research_config_mapping() {
        let config = Config {
            max_iterations: 2,
            max_concurrent_searches: 4,
            cache_ttl: Duration::from_secs(60),
            ..Default::default()
        };
        let research = config.research_config();

        assert_eq!(research.max_iterations, 2);
        assert_eq!(research.max_concurrent_searches, 4);
        assert_eq!(research.cache_ttl.search, Duration::from_secs(60));
        assert_eq!(research.cache_ttl.embedding, Duration::from_secs(86400));
    }
}
