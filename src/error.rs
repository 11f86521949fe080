use std::time::Duration;

use thiserror::Error;

/// Failures of a single chat request.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0:#}")]
    Generation(#[from] anyhow::Error),

    #[error("generation timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("prompt too long: {tokens} tokens plus {max_new_tokens} new tokens exceed the {limit} token context window")]
    PromptTooLong {
        tokens: usize,
        max_new_tokens: usize,
        limit: usize,
    },

    #[error("generation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
