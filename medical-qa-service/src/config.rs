use thiserror::Error;

pub const DEFAULT_LLM_API_BASE: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_RETRIEVER_API_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Language model settings.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub api_key: String,
    pub api_base: String,
    pub model_id: String,
    pub temperature: f64,
    pub max_tokens: u64,
}

/// Literature search settings.
#[derive(Debug, Clone)]
pub struct RetrieverSettings {
    pub api_key: String,
    pub api_base: String,
    pub top_k_results: usize,
}

/// Record server settings.
#[derive(Debug, Clone)]
pub struct FhirSettings {
    pub app_id: String,
    pub api_base: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Process configuration, resolved once at startup and handed to the components
/// that need it. Never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: String,
    pub app_name: String,
    pub app_version: String,
    pub port: u16,
    pub cors_allowed_origins: Vec<String>,
    pub log_format: LogFormat,
    pub model: ModelSettings,
    pub retriever: RetrieverSettings,
    pub fhir: FhirSettings,
}

impl Settings {
    /// Load `.env.{ENV}` (or `.env`) and read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var("ENV") {
            Ok(env) if !env.trim().is_empty() => {
                dotenvy::from_filename(format!(".env.{}", env.trim())).ok();
            }
            _ => {
                dotenvy::dotenv().ok();
            }
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let model = ModelSettings {
            api_key: require("OPENROUTER_API_KEY")?,
            api_base: get("LLM_API_BASE")
                .unwrap_or_else(|| DEFAULT_LLM_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            model_id: require("MODEL_ID")?,
            temperature: parse("MODEL_TEMPERATURE", &require("MODEL_TEMPERATURE")?)?,
            max_tokens: parse("MODEL_MAX_TOKENS", &require("MODEL_MAX_TOKENS")?)?,
        };
        if !(0.0..=2.0).contains(&model.temperature) {
            return Err(ConfigError::Invalid {
                key: "MODEL_TEMPERATURE",
                reason: format!("{} is outside 0.0..=2.0", model.temperature),
            });
        }

        let retriever = RetrieverSettings {
            api_key: require("RETRIEVER_API_KEY")?,
            api_base: get("RETRIEVER_API_BASE")
                .unwrap_or_else(|| DEFAULT_RETRIEVER_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            top_k_results: parse("RETRIEVER_TOP_K_RESULTS", &require("RETRIEVER_TOP_K_RESULTS")?)?,
        };

        let fhir_base = require("FHIR_CLIENT_API_BASE")?;
        if !fhir_base.starts_with("http://") && !fhir_base.starts_with("https://") {
            return Err(ConfigError::Invalid {
                key: "FHIR_CLIENT_API_BASE",
                reason: "must be an http(s) URL".to_string(),
            });
        }
        let fhir = FhirSettings {
            app_id: require("FHIR_CLIENT_APP_ID")?,
            api_base: fhir_base.trim_end_matches('/').to_string(),
        };

        let port = match get("APP_PORT") {
            Some(port) => parse("APP_PORT", &port)?,
            None => DEFAULT_PORT,
        };

        let log_format = match get("LOG_FORMAT").as_deref() {
            Some("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        };

        Ok(Self {
            environment: get("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            app_name: get("APP_NAME").unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            app_version: get("APP_VERSION").unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            port,
            cors_allowed_origins: get("CORS_ALLOWED_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            log_format,
            model,
            retriever,
            fhir,
        })
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        reason: format!("'{}': {}", value, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("OPENROUTER_API_KEY", "or-key"),
            ("MODEL_ID", "openai/gpt-4.1-mini"),
            ("MODEL_TEMPERATURE", "0.2"),
            ("MODEL_MAX_TOKENS", "2048"),
            ("RETRIEVER_API_KEY", "ncbi-key"),
            ("RETRIEVER_TOP_K_RESULTS", "3"),
            ("FHIR_CLIENT_APP_ID", "medical-qa"),
            ("FHIR_CLIENT_API_BASE", "https://fhir.example.org/baseR4/"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<Settings, ConfigError> {
        Settings::from_lookup(|key| env.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults_fill_optional_values() {
        let settings = load(&base_env()).unwrap();

        assert_eq!(settings.port, DEFAULT_PORT);
        assert_eq!(settings.environment, "development");
        assert_eq!(settings.log_format, LogFormat::Json);
        assert!(settings.cors_allowed_origins.is_empty());
        assert_eq!(settings.model.api_base, DEFAULT_LLM_API_BASE);
        assert_eq!(settings.retriever.top_k_results, 3);
        assert_eq!(settings.fhir.api_base, "https://fhir.example.org/baseR4");
    }

    #[test]
    fn test_missing_required_value_fails() {
        let mut env = base_env();
        env.remove("RETRIEVER_API_KEY");

        assert_eq!(
            load(&env).unwrap_err(),
            ConfigError::Missing("RETRIEVER_API_KEY")
        );
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let mut env = base_env();
        env.insert("MODEL_ID", "   ");

        assert_eq!(load(&env).unwrap_err(), ConfigError::Missing("MODEL_ID"));
    }

    #[test]
    fn test_unparsable_number_fails() {
        let mut env = base_env();
        env.insert("MODEL_MAX_TOKENS", "lots");

        assert!(matches!(
            load(&env).unwrap_err(),
            ConfigError::Invalid { key: "MODEL_MAX_TOKENS", .. }
        ));
    }

    #[test]
    fn test_fhir_base_must_be_http() {
        let mut env = base_env();
        env.insert("FHIR_CLIENT_API_BASE", "fhir.example.org");

        assert!(matches!(
            load(&env).unwrap_err(),
            ConfigError::Invalid { key: "FHIR_CLIENT_API_BASE", .. }
        ));
    }

    #[test]
    fn test_cors_origins_and_pretty_logs() {
        let mut env = base_env();
        env.insert("CORS_ALLOWED_ORIGINS", "http://localhost:3000, https://app.example.org,");
        env.insert("LOG_FORMAT", "pretty");
        env.insert("APP_PORT", "9001");

        let settings = load(&env).unwrap();
        assert_eq!(
            settings.cors_allowed_origins,
            vec!["http://localhost:3000", "https://app.example.org"]
        );
        assert_eq!(settings.log_format, LogFormat::Pretty);
        assert_eq!(settings.port, 9001);
    }
}
