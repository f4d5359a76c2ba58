//! In-process generation back-end.
//!
//! Wraps a user-supplied [`TextGenerator`] (an in-process inference engine,
//! e.g. bindings to a transformer runtime) behind the [`ModelBackend`]
//! trait. Generation runs on the blocking thread pool; a single-permit
//! semaphore serializes requests because model memory pressure is unknown.
//!
//! In-process inference cannot honor seeds at nonzero temperature, so this
//! adapter varies the prompt content in a seeded way instead:
//!
//! - `seed` prefixes the first user message with `(Problem <seed>)`,
//!   replacing any previous such prefix, and
//! - `cot_instruction_seed` swaps the configured step-numbering instruction
//!   for one of a fixed set of paraphrases.
//!
//! When input recording is requested, every chunk carries the exact rendered
//! prompt for provenance.

use crate::backend::{ChunkStream, ModelBackend, StreamChunk};
use crate::error::{BackendError, Result};
use crate::message::{ChatMessage, MessageRole};
use crate::params::GenerationParams;
use async_trait::async_trait;
use futures::stream;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::DEFAULT_LOCAL_PERMITS;

const INSTRUCTION_LEAD_INS: [&str; 5] = [
    "Reason through your answer step by step, and number every step ",
    "Write down your answer by reasoning through it step by step. Number every step ",
    "Produce your answer by reasoning through it step by step. Number all steps ",
    "Construct an answer step by step, and enumerate all steps ",
    "Build your answer one step at a time, and number each of your steps ",
];

const INSTRUCTION_FORMATS: [&str; 4] = [
    "(\"1.\", \"2.\", etc.)",
    "(\"Step 1.\", \"Step 2.\", etc.)",
    "(\"1: \", \"2: \", etc.)",
    "(\"Step 1: \", \"Step 2: \", etc.)",
];

/// A synchronous in-process text generator.
///
/// Implementations receive the fully rendered prompt and return the response
/// as a sequence of chunks (token groups). Called from the blocking thread
/// pool, so implementations may block freely.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<Vec<String>>;
}

/// Back-end running a [`TextGenerator`] in-process.
pub struct InProcessBackend {
    generator: Arc<dyn TextGenerator>,
    semaphore: Arc<Semaphore>,
    cot_instruction: Option<String>,
}

impl InProcessBackend {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            semaphore: Arc::new(Semaphore::new(DEFAULT_LOCAL_PERMITS)),
            cot_instruction: None,
        }
    }

    /// Set the step-numbering instruction text that seeded variation may
    /// replace in the first user message.
    pub fn with_cot_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.cot_instruction = Some(instruction.into());
        self
    }

    /// Prefix the problem statement with `(Problem <seed>)`, replacing an
    /// existing prefix so repeated warps do not stack them.
    fn apply_seed_prefix(content: &str, seed: u64) -> String {
        let re = Regex::new(r"\(Problem \d+\)").expect("static regex");
        if content.starts_with("(Problem") {
            re.replace(content, format!("(Problem {})", seed)).into_owned()
        } else {
            format!("(Problem {}) {}", seed, content)
        }
    }

    /// Swap the configured instruction for a seeded paraphrase.
    fn vary_cot_instruction(&self, content: &str, instruction_seed: u64) -> Result<String> {
        let instruction = self.cot_instruction.as_deref().ok_or_else(|| {
            BackendError::Config(
                "cot_instruction_seed set but no cot instruction configured".into(),
            )
        })?;

        let mut rng = StdRng::seed_from_u64(instruction_seed);
        let lead_in = INSTRUCTION_LEAD_INS[rng.gen_range(0..INSTRUCTION_LEAD_INS.len())];
        let format = INSTRUCTION_FORMATS[rng.gen_range(0..INSTRUCTION_FORMATS.len())];
        let replacement = format!("{}{}.", lead_in, format);

        Ok(content.replace(instruction, &replacement))
    }

    /// Render the conversation into a plain-text prompt. A trailing
    /// assistant message becomes an open continuation; otherwise the prompt
    /// ends with an empty assistant turn.
    fn render_prompt(messages: &[ChatMessage]) -> String {
        let mut lines: Vec<String> = Vec::with_capacity(messages.len() + 1);
        for msg in messages {
            let tag = match msg.role {
                MessageRole::System => "System",
                MessageRole::User => "User",
                MessageRole::Assistant => "Assistant",
            };
            lines.push(format!("{}: {}", tag, msg.content));
        }
        let prompt = lines.join("\n");
        match messages.last() {
            Some(last) if last.role == MessageRole::Assistant => prompt,
            _ => format!("{}\nAssistant:", prompt),
        }
    }

    fn prepare_messages(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<Vec<ChatMessage>> {
        let mut prepared = messages.to_vec();
        if let Some(first) = prepared
            .iter_mut()
            .find(|m| m.role == MessageRole::User)
        {
            if let Some(seed) = params.seed {
                first.content = Self::apply_seed_prefix(&first.content, seed);
            }
            if let Some(instruction_seed) = params.cot_instruction_seed {
                first.content = self.vary_cot_instruction(&first.content, instruction_seed)?;
            }
        }
        Ok(prepared)
    }
}

#[async_trait]
impl ModelBackend for InProcessBackend {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<ChunkStream> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Fatal("request semaphore closed".into()))?;

        let prepared = self.prepare_messages(messages, params)?;
        let prompt = Self::render_prompt(&prepared);
        let input = params.with_input.then(|| prompt.clone());

        let generator = Arc::clone(&self.generator);
        let gen_params = params.clone();
        let gen_prompt = prompt.clone();
        let chunks = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            generator.generate(&gen_prompt, &gen_params)
        })
        .await
        .map_err(|e| BackendError::Fatal(format!("generator panicked: {}", e)))??;

        let items: Vec<Result<StreamChunk>> = chunks
            .into_iter()
            .map(|text| {
                Ok(StreamChunk {
                    text,
                    input: input.clone(),
                })
            })
            .collect();

        Ok(Box::pin(stream::iter(items)))
    }
}
