use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use std::{fs, path::Path, sync::Arc};

macro_rules! prompt_file {
    ($name:literal) => {
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/", $name))
    };
}

static BUILTIN_PERSONA: Lazy<Persona> = Lazy::new(|| Persona::new(prompt_file!("persona.txt")));

/// System-level text placed ahead of every conversation.
#[derive(Clone, Debug)]
pub struct Persona {
    text: Arc<str>,
}

impl Persona {
    pub fn new(text: &str) -> Self {
        Self {
            text: Arc::from(text.trim()),
        }
    }

    pub fn builtin() -> Self {
        BUILTIN_PERSONA.clone()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read persona ({})", path.display()))?;
        if raw.trim().is_empty() {
            return Err(anyhow!("persona file {} is empty", path.display()));
        }
        Ok(Self::new(&raw))
    }

    /// Built-in persona unless an override file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::builtin()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}
