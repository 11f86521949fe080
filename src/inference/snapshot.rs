use anyhow::{anyhow, Context, Result};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ModelConfig;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const INDEX_FILE: &str = "model.safetensors.index.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";

/// On-disk locations of everything needed to build the model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

/// Uses `MODEL_DIR` when set, otherwise downloads (or reuses the cached)
/// snapshot of `MODEL_ID` from the Hugging Face hub.
pub fn resolve(cfg: &ModelConfig) -> Result<ModelFiles> {
    match &cfg.local_dir {
        Some(dir) => from_local_dir(dir),
        None => from_hub(cfg),
    }
}

pub fn from_local_dir(dir: &Path) -> Result<ModelFiles> {
    let config = require(dir, CONFIG_FILE)?;
    let tokenizer = require(dir, TOKENIZER_FILE)?;

    let index_path = dir.join(INDEX_FILE);
    let weights = if index_path.exists() {
        shard_names(&read_index(&index_path)?)?
            .into_iter()
            .map(|name| dir.join(name))
            .collect()
    } else {
        vec![require(dir, SINGLE_WEIGHTS_FILE)?]
    };

    info!(snapshot = %dir.display(), shards = weights.len(), "using local model snapshot");

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

fn from_hub(cfg: &ModelConfig) -> Result<ModelFiles> {
    let api = ApiBuilder::new()
        .with_token(cfg.hf_token.clone())
        .with_progress(false)
        .build()
        .context("failed to initialise Hugging Face hub client")?;
    let repo = api.repo(Repo::with_revision(
        cfg.id.clone(),
        RepoType::Model,
        cfg.revision.clone(),
    ));

    let fetch = |name: &str| {
        repo.get(name)
            .with_context(|| format!("failed to fetch {name} from {}@{}", cfg.id, cfg.revision))
    };

    let config = fetch(CONFIG_FILE)?;
    let tokenizer = fetch(TOKENIZER_FILE)?;

    let weights = match repo.get(INDEX_FILE) {
        Ok(index_path) => shard_names(&read_index(&index_path)?)?
            .iter()
            .map(|name| fetch(name.as_str()))
            .collect::<Result<Vec<_>>>()?,
        Err(_) => vec![fetch(SINGLE_WEIGHTS_FILE)?],
    };

    info!(model = %cfg.id, revision = %cfg.revision, shards = weights.len(), "model snapshot ready");

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

fn require(dir: &Path, name: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    if !path.exists() {
        return Err(anyhow!("{name} not found under {}", dir.display()));
    }
    Ok(path)
}

fn read_index(path: &Path) -> Result<serde_json::Value> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Distinct shard file names listed in a safetensors index, sorted.
pub fn shard_names(index: &serde_json::Value) -> Result<Vec<String>> {
    let map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("safetensors index: weight_map is not an object"))?;

    let names = map
        .values()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("invalid shard entry in safetensors index: {v}"))
        })
        .collect::<Result<BTreeSet<_>>>()?;

    if names.is_empty() {
        return Err(anyhow!("safetensors index lists no shards"));
    }
    Ok(names.into_iter().collect())
}
