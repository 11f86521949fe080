use anyhow::{anyhow, Result};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::inference::GenerationParams;

pub const DEFAULT_MODEL_ID: &str = "meta-llama/Llama-2-13b-hf";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub frontend_dir: PathBuf,
    pub model: ModelConfig,
    pub persona_path: Option<PathBuf>,
    pub generation: GenerationParams,
    pub max_history_turns: usize,
    pub max_concurrent_generations: usize,
    pub generation_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub id: String,
    pub revision: String,
    pub local_dir: Option<PathBuf>,
    pub hf_token: Option<String>,
    pub device: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let defaults = GenerationParams::default();
        let generation = GenerationParams {
            max_new_tokens: parse_or(&var, "MAX_NEW_TOKENS", defaults.max_new_tokens)?,
            temperature: parse_or(&var, "TEMPERATURE", defaults.temperature)?,
            top_p: parse_or(&var, "TOP_P", defaults.top_p)?,
            repetition_penalty: parse_or(&var, "REPETITION_PENALTY", defaults.repetition_penalty)?,
            repeat_last_n: parse_or(&var, "REPEAT_LAST_N", defaults.repeat_last_n)?,
            seed: match var("SEED") {
                Some(raw) => parse_value("SEED", &raw)?,
                None => rand::random(),
            },
        };

        if !(generation.top_p > 0.0 && generation.top_p <= 1.0) {
            return Err(anyhow!("TOP_P must be in (0, 1], got {}", generation.top_p));
        }
        if generation.temperature < 0.0 {
            return Err(anyhow!(
                "TEMPERATURE must not be negative, got {}",
                generation.temperature
            ));
        }

        let max_concurrent_generations: usize = parse_or(&var, "MAX_CONCURRENT_GENERATIONS", 1)?;
        if max_concurrent_generations == 0 {
            return Err(anyhow!("MAX_CONCURRENT_GENERATIONS must be at least 1"));
        }

        let timeout_secs: u64 = parse_or(&var, "GENERATION_TIMEOUT_SECS", 0)?;

        Ok(Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&var, "PORT", 8000)?,
            frontend_dir: var("FRONTEND_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("../frontend/build")),
            model: ModelConfig {
                id: var("MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
                revision: var("MODEL_REVISION").unwrap_or_else(|| "main".to_string()),
                local_dir: var("MODEL_DIR").map(PathBuf::from),
                hf_token: var("HF_TOKEN"),
                device: var("MODEL_DEVICE").unwrap_or_else(|| "auto".to_string()),
            },
            persona_path: var("PERSONA_PATH").map(PathBuf::from),
            generation,
            max_history_turns: parse_or(&var, "MAX_HISTORY_TURNS", 0)?,
            max_concurrent_generations,
            generation_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow!("invalid {key} value '{raw}': {e}"))
}
