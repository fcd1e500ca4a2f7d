use std::{collections::BTreeSet, env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};

const DEFAULT_ALLOWED_MODELS: &str = "mannix/defog-llama3-sqlcoder-8b:latest,\
llama-3-sqlcoder-8b:latest,sqlcoder-best:latest,pacozaa/defog-llama3-sqlcoder-8b";

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub ollama_base_url: String,
    pub default_model: String,
    pub allowed_models: BTreeSet<String>,
    pub schema_path: PathBuf,
    /// Inclusive upper bound for the `LIMIT` of generated statements.
    pub limit_max: u64,
    pub ollama_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let listen_addr = var("NL2SQL_API_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid NL2SQL_API_ADDR")?;

        let ollama_base_url =
            var("OLLAMA_BASE_URL").unwrap_or_else(|| "http://127.0.0.1:11434".to_string());

        let default_model =
            var("DEFAULT_MODEL").unwrap_or_else(|| "pacozaa/defog-llama3-sqlcoder-8b".to_string());

        let allowed_models =
            parse_string_list(&var("ALLOWED_MODELS").unwrap_or_else(|| DEFAULT_ALLOWED_MODELS.into()));

        let schema_path = var("SCHEMA_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./schema/schema.yaml"));

        let limit_max = match var("LIMIT_MAX") {
            Some(value) => value
                .parse::<u64>()
                .with_context(|| format!("invalid LIMIT_MAX '{value}'"))?,
            None => 200,
        };
        if limit_max == 0 {
            bail!("LIMIT_MAX must be greater than zero");
        }

        let timeout_secs = match var("OLLAMA_TIMEOUT") {
            Some(value) => value
                .parse::<f64>()
                .with_context(|| format!("invalid OLLAMA_TIMEOUT '{value}'"))?,
            None => 60.0,
        };
        if !timeout_secs.is_finite() || timeout_secs <= 0.0 {
            bail!("OLLAMA_TIMEOUT must be a positive number of seconds");
        }

        Ok(Self {
            listen_addr,
            ollama_base_url,
            default_model,
            allowed_models,
            schema_path,
            limit_max,
            ollama_timeout: Duration::from_secs_f64(timeout_secs),
        })
    }

    pub fn is_model_allowed(&self, model: &str) -> bool {
        self.allowed_models.contains(model)
    }
}

fn parse_string_list(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
