pub mod device;
pub mod llama;
pub mod snapshot;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::conversation::{build_prompt, extract_reply, render_turn, trim_history};
use crate::error::ChatError;
use crate::model::turn::Turn;
use crate::prompts::Persona;

/// Sampling controls handed to the generation routine.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 150,
            temperature: 0.6,
            top_p: 0.8,
            repetition_penalty: 1.2,
            repeat_last_n: 64,
            seed: 299_792_458,
        }
    }
}

/// A loaded causal LM plus its tokenizer.
///
/// `generate` is blocking and returns the decoded text of the whole output
/// sequence (prompt included, special tokens skipped). Implementations must
/// check `cancel` between sampled tokens and bail out once it is raised.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, params: &GenerationParams, cancel: &AtomicBool)
        -> Result<String>;

    fn count_tokens(&self, text: &str) -> Result<usize>;

    fn context_window(&self) -> usize;

    fn model_id(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub params: GenerationParams,
    pub max_history_turns: usize,
    pub max_concurrent: usize,
    pub timeout: Option<Duration>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            params: GenerationParams::default(),
            max_history_turns: 0,
            max_concurrent: 1,
            timeout: None,
        }
    }
}

pub struct InferenceService {
    engine: Arc<dyn TextGenerator>,
    persona: Persona,
    options: ServiceOptions,
    permits: Arc<Semaphore>,
}

/// Raises the cancel flag when the request future goes away, so an
/// abandoned generation stops at its next token.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl InferenceService {
    pub fn new(engine: Arc<dyn TextGenerator>, persona: Persona, options: ServiceOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
        Self {
            engine,
            persona,
            options,
            permits,
        }
    }

    pub fn model_id(&self) -> &str {
        self.engine.model_id()
    }

    /// Builds the prompt for `message`, runs the model and returns the
    /// assistant's latest turn.
    pub async fn chat(&self, history: Vec<Turn>, message: String) -> Result<String, ChatError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("generation permits closed")?;

        let _guard = CancelOnDrop(cancel.clone());
        let engine = self.engine.clone();
        let persona = self.persona.clone();
        let options = self.options.clone();
        let task_cancel = cancel.clone();
        let span = tracing::Span::current();

        let task = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            // Held until the model is actually free, even if the caller timed out.
            let _permit = permit;
            let started = Instant::now();

            let history = trim_history(history, options.max_history_turns);
            let prompt = fit_prompt(engine.as_ref(), &persona, history, &message, &options.params)?;

            let decoded = engine.generate(&prompt, &options.params, &task_cancel)?;
            let reply = extract_reply(&decoded);

            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                reply_chars = reply.chars().count(),
                "generation finished"
            );
            Ok::<_, ChatError>(reply)
        });

        let joined = match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    cancel.store(true, Ordering::SeqCst);
                    warn!(timeout_secs = limit.as_secs(), "generation timed out");
                    return Err(ChatError::Timeout(limit));
                }
            },
            None => task.await,
        };

        joined?
    }
}

/// Renders the prompt, dropping the oldest turns until it leaves room for
/// `max_new_tokens` inside the model's context window.
///
/// Each turn is tokenized at most once, newest first; the rendered prompt is
/// then checked as a whole since per-turn counts only approximate it.
fn fit_prompt(
    engine: &dyn TextGenerator,
    persona: &Persona,
    history: Vec<Turn>,
    message: &str,
    params: &GenerationParams,
) -> Result<String, ChatError> {
    let limit = engine.context_window();
    let too_long = |tokens: usize| ChatError::PromptTooLong {
        tokens,
        max_new_tokens: params.max_new_tokens,
        limit,
    };

    let base = engine.count_tokens(&build_prompt(persona.as_str(), &[], message))?;
    if base.saturating_add(params.max_new_tokens) > limit {
        return Err(too_long(base));
    }
    let budget = limit - params.max_new_tokens - base;

    let mut start = history.len();
    let mut used = 0usize;
    while start > 0 {
        let cost = engine.count_tokens(&render_turn(&history[start - 1]))?;
        if used.saturating_add(cost) > budget {
            break;
        }
        used += cost;
        start -= 1;
    }

    loop {
        let prompt = build_prompt(persona.as_str(), &history[start..], message);
        let tokens = engine.count_tokens(&prompt)?;

        if tokens.saturating_add(params.max_new_tokens) <= limit {
            if start > 0 {
                info!(dropped = start, prompt_tokens = tokens, "dropped oldest history turns");
            } else {
                debug!(prompt_tokens = tokens, "prompt fits context window");
            }
            return Ok(prompt);
        }

        if start == history.len() {
            return Err(too_long(tokens));
        }
        start += 1;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Whitespace-tokenized stand-in for a real model.
    pub struct FakeGenerator {
        pub continuation: String,
        pub fail_with: Option<String>,
        pub panic_with: Option<String>,
        pub context_window: usize,
        pub delay: Duration,
        pub prompts: Mutex<Vec<String>>,
        pub saw_cancel: AtomicBool,
        pub running: AtomicUsize,
        pub peak_running: AtomicUsize,
        pub count_calls: AtomicUsize,
    }

    impl FakeGenerator {
        pub fn replying(continuation: &str) -> Self {
            Self {
                continuation: continuation.to_string(),
                fail_with: None,
                panic_with: None,
                context_window: 100_000,
                delay: Duration::ZERO,
                prompts: Mutex::new(Vec::new()),
                saw_cancel: AtomicBool::new(false),
                running: AtomicUsize::new(0),
                peak_running: AtomicUsize::new(0),
                count_calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                fail_with: Some(message.to_string()),
                ..Self::replying("")
            }
        }

        pub fn panicking(message: &str) -> Self {
            Self {
                panic_with: Some(message.to_string()),
                ..Self::replying("")
            }
        }

        pub fn last_prompt(&self) -> Option<String> {
            self.prompts.lock().unwrap().last().cloned()
        }
    }

    impl TextGenerator for FakeGenerator {
        fn generate(
            &self,
            prompt: &str,
            _params: &GenerationParams,
            cancel: &AtomicBool,
        ) -> Result<String> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_running.fetch_max(now, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            if let Some(message) = &self.panic_with {
                self.running.fetch_sub(1, Ordering::SeqCst);
                panic!("{message}");
            }

            let deadline = Instant::now() + self.delay;
            let mut cancelled = false;
            while Instant::now() < deadline {
                if cancel.load(Ordering::SeqCst) {
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    cancelled = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            if cancelled {
                return Err(anyhow!("generation cancelled"));
            }
            if let Some(message) = &self.fail_with {
                return Err(anyhow!("{message}"));
            }
            Ok(format!("{prompt} {}", self.continuation))
        }

        fn count_tokens(&self, text: &str) -> Result<usize> {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            Ok(text.split_whitespace().count())
        }

        fn context_window(&self) -> usize {
            self.context_window
        }

        fn model_id(&self) -> &str {
            "fake/model"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeGenerator;
    use super::*;

    fn service(engine: Arc<FakeGenerator>, options: ServiceOptions) -> InferenceService {
        InferenceService::new(engine, Persona::new("You are a host."), options)
    }

    fn small_options(max_new_tokens: usize) -> ServiceOptions {
        ServiceOptions {
            params: GenerationParams {
                max_new_tokens,
                ..GenerationParams::default()
            },
            ..ServiceOptions::default()
        }
    }

    #[tokio::test]
    async fn returns_text_after_last_assistant_marker() {
        let engine = Arc::new(FakeGenerator::replying(" Sure, what time?\n"));
        let svc = service(engine.clone(), ServiceOptions::default());

        let reply = svc
            .chat(vec![Turn::user("Hi"), Turn::bot("Hello!")], "Book a table".into())
            .await
            .unwrap();

        assert_eq!(reply, "Sure, what time?");
        assert_eq!(
            engine.last_prompt().unwrap(),
            "You are a host.\nUser: Hi\nAssistant: Hello!\nUser: Book a table\nAssistant:"
        );
    }

    #[tokio::test]
    async fn model_errors_surface_as_generation_errors() {
        let engine = Arc::new(FakeGenerator::failing("CUDA out of memory"));
        let svc = service(engine, ServiceOptions::default());

        let err = svc.chat(Vec::new(), "hi".into()).await.unwrap_err();
        assert!(matches!(err, ChatError::Generation(_)));
        assert_eq!(err.to_string(), "CUDA out of memory");
    }

    #[tokio::test]
    async fn drops_oldest_turns_until_prompt_fits() {
        let mut fake = FakeGenerator::replying("ok");
        // persona (4) + "User: now Assistant:" (3) + one turn (2) = 9 words
        fake.context_window = 9 + 5;
        let engine = Arc::new(fake);
        let svc = service(engine.clone(), small_options(5));

        let history = vec![Turn::user("first"), Turn::bot("second"), Turn::user("third")];
        svc.chat(history, "now".into()).await.unwrap();

        assert_eq!(
            engine.last_prompt().unwrap(),
            "You are a host.\nUser: third\nUser: now\nAssistant:"
        );
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let mut fake = FakeGenerator::replying("ok");
        fake.context_window = 10;
        let engine = Arc::new(fake);
        let svc = service(engine.clone(), small_options(5));

        let err = svc
            .chat(vec![Turn::user("old")], "one two three four".into())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ChatError::PromptTooLong {
                tokens: 10,
                max_new_tokens: 5,
                limit: 10
            }
        ));
        assert!(engine.last_prompt().is_none());
    }

    #[tokio::test]
    async fn long_history_is_fitted_with_linear_tokenizer_calls() {
        let mut fake = FakeGenerator::replying("ok");
        fake.context_window = 200;
        let engine = Arc::new(fake);
        let svc = service(engine.clone(), small_options(5));

        let history = (0..5000).map(|i| Turn::user(format!("w{i}"))).collect();
        svc.chat(history, "now".into()).await.unwrap();

        // persona + message (7) leaves 188 words, i.e. the newest 94 turns
        let prompt = engine.last_prompt().unwrap();
        assert!(prompt.ends_with("\nUser: w4999\nUser: now\nAssistant:"));
        assert!(prompt.contains("\nUser: w4906\n"));
        assert!(!prompt.contains("\nUser: w4905\n"));
        assert!(engine.count_calls.load(Ordering::SeqCst) <= 100);
    }

    #[tokio::test]
    async fn huge_max_new_tokens_does_not_overflow() {
        let engine = Arc::new(FakeGenerator::replying("ok"));
        let svc = service(engine.clone(), small_options(usize::MAX));

        let err = svc
            .chat(vec![Turn::user("hi")], "hello".into())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ChatError::PromptTooLong {
                max_new_tokens: usize::MAX,
                ..
            }
        ));
        assert!(engine.last_prompt().is_none());
    }

    #[tokio::test]
    async fn history_turn_limit_is_applied() {
        let engine = Arc::new(FakeGenerator::replying("ok"));
        let svc = service(
            engine.clone(),
            ServiceOptions {
                max_history_turns: 1,
                ..ServiceOptions::default()
            },
        );

        svc.chat(vec![Turn::user("a"), Turn::bot("b")], "c".into())
            .await
            .unwrap();
        assert_eq!(
            engine.last_prompt().unwrap(),
            "You are a host.\nAssistant: b\nUser: c\nAssistant:"
        );
    }

    #[tokio::test]
    async fn timeout_cancels_running_generation() {
        let mut fake = FakeGenerator::replying("late");
        fake.delay = Duration::from_secs(5);
        let engine = Arc::new(fake);
        let svc = service(
            engine.clone(),
            ServiceOptions {
                timeout: Some(Duration::from_millis(50)),
                ..ServiceOptions::default()
            },
        );

        let err = svc.chat(Vec::new(), "hi".into()).await.unwrap_err();
        assert!(matches!(err, ChatError::Timeout(_)));

        for _ in 0..100 {
            if engine.saw_cancel.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn generations_are_serialized_by_default() {
        let mut fake = FakeGenerator::replying("ok");
        fake.delay = Duration::from_millis(30);
        let engine = Arc::new(fake);
        let svc = Arc::new(service(engine.clone(), ServiceOptions::default()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.chat(Vec::new(), format!("msg {i}")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(engine.peak_running.load(Ordering::SeqCst), 1);
        assert_eq!(engine.prompts.lock().unwrap().len(), 4);
    }
}
