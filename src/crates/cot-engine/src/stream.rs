//! Checkpointed step stream over a model back-end.
//!
//! Wraps one in-progress completion stream and exposes it as a sequence of
//! reasoning *steps*. A step boundary is a numbered-step marker such as
//! `"\n2. "` or `"\nStep 2: "`; each detected boundary becomes a checkpoint,
//! a byte offset into the accumulated buffer. The stream supports rolling
//! back to a prior checkpoint and, in step-rollout mode, re-sampling the
//! same step position repeatedly with fresh generations.
//!
//! The state machine is `(buffer, checkpoints, next_checkpoint)`, with
//! transitions driven by incoming chunks. Markers can straddle a chunk seam,
//! so detection searches exactly the previous chunk concatenated with the
//! current one, takes the right-most match, and re-anchors it to absolute
//! buffer offsets. A checkpoint sits immediately after the marker's leading
//! newline, so step texts end with `"\n"` and each numbered step starts with
//! its own number.
//!
//! The stream is stateful and not safe for concurrent iteration: exactly one
//! caller at a time advances it. Dropping the underlying chunk stream
//! cancels the in-flight request.

use crate::error::{EngineError, Result};
use llm::{ChatMessage, ChunkStream, GenerationParams, ModelBackend};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// One completed step yielded by the stream.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// The step text, from the previous checkpoint to the detected boundary
    /// (or to the end of the stream).
    pub text: String,
    /// Whether the underlying stream ended while producing this step.
    pub done: bool,
    /// The exact rendered model input, when input recording is on.
    pub input: Option<String>,
}

/// A checkpointed step stream over one conversation.
pub struct BufferedCotStream {
    backend: Arc<dyn ModelBackend>,
    messages: Vec<ChatMessage>,
    assistant_prefix: Vec<ChatMessage>,
    common_params: GenerationParams,
    call_params: GenerationParams,
    step_rollouts: bool,

    buffer: String,
    checkpoints: BTreeMap<usize, usize>,
    next_checkpoint: usize,
    prev_chunk: String,
    stream: Option<ChunkStream>,
    done: bool,
}

impl BufferedCotStream {
    pub fn new(backend: Arc<dyn ModelBackend>, messages: Vec<ChatMessage>) -> Self {
        Self {
            backend,
            messages,
            assistant_prefix: Vec::new(),
            common_params: GenerationParams::default(),
            call_params: GenerationParams::default(),
            step_rollouts: false,
            buffer: String::new(),
            checkpoints: BTreeMap::from([(0, 0)]),
            next_checkpoint: 1,
            prev_chunk: String::new(),
            stream: None,
            done: false,
        }
    }

    /// Set the parameters applied to every generation.
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.common_params = params;
        self
    }

    /// Toggle step-rollout mode: when on, each yielded step rewinds the
    /// buffer to the previous checkpoint and restarts the stream, so the
    /// next iteration produces an alternative same-position step.
    pub fn step_rollouts(&mut self, on: bool) {
        self.step_rollouts = on;
    }

    /// The accumulated buffer.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// The checkpoint map: index to byte offset into the buffer.
    pub fn checkpoints(&self) -> &BTreeMap<usize, usize> {
        &self.checkpoints
    }

    /// Install an assistant prefix and rediscover the checkpoints already
    /// present in it, so the stream resumes cleanly after the last detected
    /// step. Trailing whitespace is trimmed from the buffer and from the
    /// final assistant message (APIs reject assistant content with trailing
    /// whitespace).
    pub fn set_assistant_prefix_and_reset_checkpoints(&mut self, prefix: Vec<ChatMessage>) {
        let mut joined: String = prefix.iter().map(|m| m.content.as_str()).collect();
        joined.truncate(joined.trim_end().len());

        let mut prefix = prefix;
        if let Some(last) = prefix.last_mut() {
            last.content.truncate(last.content.trim_end().len());
        }
        self.assistant_prefix = prefix;
        self.buffer = joined;
        self.checkpoints = BTreeMap::from([(0, 0)]);
        self.next_checkpoint = 1;
        self.done = false;

        loop {
            let window_start = self.checkpoints[&(self.next_checkpoint - 1)];
            match self.find_boundary(window_start) {
                Some(offset) => {
                    self.checkpoints.insert(self.next_checkpoint, offset);
                    self.next_checkpoint += 1;
                }
                None => {
                    // The text after the last marker is a complete step (the
                    // prefix ends at a step boundary), so the resume point
                    // is the end of the buffer.
                    let last = *self.checkpoints.values().last().unwrap_or(&0);
                    if self.buffer.len() > last {
                        self.checkpoints
                            .insert(self.next_checkpoint, self.buffer.len());
                        self.next_checkpoint += 1;
                    }
                    break;
                }
            }
        }

        trace!(checkpoints = ?self.checkpoints, "prefix installed");
        self.restart_stream();
    }

    /// Discard the buffer beyond checkpoint `index`, drop higher-indexed
    /// checkpoints, and restart the underlying stream.
    pub fn rollback_to_checkpoint(&mut self, index: usize) -> Result<()> {
        let offset = *self
            .checkpoints
            .get(&index)
            .ok_or_else(|| EngineError::Fatal(format!("checkpoint {} not found", index)))?;

        self.buffer.truncate(offset);
        self.checkpoints.retain(|&k, _| k <= index);
        self.next_checkpoint = index + 1;
        self.done = false;
        self.restart_stream();
        Ok(())
    }

    /// Perform exactly one iteration with per-call parameter overrides.
    /// With `peek`, step-rollout mode is forced for the duration of the
    /// call so the stream is rewound afterwards.
    pub async fn single_step(
        &mut self,
        peek: bool,
        overrides: &GenerationParams,
    ) -> Result<Option<StepOutput>> {
        let saved_rollouts = self.step_rollouts;
        if peek {
            self.step_rollouts = true;
        }
        self.call_params = overrides.clone();

        let result = self.next_step().await;

        self.call_params = GenerationParams::default();
        if peek {
            self.step_rollouts = saved_rollouts;
        }
        result
    }

    /// Advance to the next completed step.
    ///
    /// Returns `None` once the stream has ended with no bytes since the
    /// last checkpoint. A stream end with bytes in flight flushes the
    /// remainder as a final step with `done = true`.
    pub async fn next_step(&mut self) -> Result<Option<StepOutput>> {
        if self.done {
            return Ok(None);
        }
        self.ensure_stream().await?;

        let start = self.checkpoints[&(self.next_checkpoint - 1)];
        let mut last_input: Option<String> = None;

        loop {
            let item = match self.stream.as_mut() {
                Some(stream) => stream.next().await,
                None => None,
            };

            match item {
                Some(chunk) => {
                    let chunk = chunk?;
                    if chunk.input.is_some() {
                        last_input = chunk.input;
                    }

                    self.buffer.push_str(&chunk.text);
                    let window_len = self.prev_chunk.len() + chunk.text.len();
                    let window_start = self.buffer.len().saturating_sub(window_len);
                    let boundary = self.find_boundary(window_start);
                    self.prev_chunk = chunk.text;

                    if let Some(offset) = boundary {
                        let step_start = self.checkpoints[&(self.next_checkpoint - 1)];
                        let text = self.buffer[step_start..offset].to_string();

                        if self.step_rollouts {
                            self.buffer.truncate(step_start);
                            self.restart_stream();
                        } else {
                            self.checkpoints.insert(self.next_checkpoint, offset);
                            self.next_checkpoint += 1;
                        }

                        return Ok(Some(StepOutput {
                            text,
                            done: false,
                            input: last_input,
                        }));
                    }
                }
                None => {
                    if self.step_rollouts {
                        let text = self.buffer[start..].to_string();
                        self.buffer.truncate(start);
                        self.restart_stream();
                        return Ok(Some(StepOutput {
                            text,
                            done: true,
                            input: last_input,
                        }));
                    }

                    self.done = true;
                    if self.buffer.len() > start {
                        return Ok(Some(StepOutput {
                            text: self.buffer[start..].to_string(),
                            done: true,
                            input: last_input,
                        }));
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn restart_stream(&mut self) {
        self.stream = None;
        self.prev_chunk.clear();
    }

    async fn ensure_stream(&mut self) -> Result<()> {
        if self.stream.is_none() {
            let mut messages = self.messages.clone();
            messages.extend(self.assistant_prefix.iter().cloned());
            let params = self.common_params.merged(&self.call_params);
            self.stream = Some(self.backend.stream(&messages, &params).await?);
            self.prev_chunk.clear();
        }
        Ok(())
    }

    /// Search `buffer[window_start..]` for the next step-number marker and
    /// return the absolute checkpoint offset: the position just after the
    /// marker's leading newline. Marker variants are tried in order and the
    /// right-most occurrence of the first matching variant wins, which
    /// handles markers straddling a chunk seam.
    fn find_boundary(&self, window_start: usize) -> Option<usize> {
        let window = &self.buffer[window_start..];
        for marker in Self::marker_options(self.next_checkpoint) {
            if let Some(pos) = window.rfind(&marker) {
                return Some(window_start + pos + 1);
            }
        }
        None
    }

    fn marker_options(n: usize) -> [String; 15] {
        [
            format!("\n{}. ", n),
            format!("\nStep {}: ", n),
            format!("\nStep {}. ", n),
            format!("\n{}.\n", n),
            format!("\nStep {}:\n", n),
            format!("\nStep {}.\n", n),
            format!("\n**{}.** ", n),
            format!("\n**Step {}:** ", n),
            format!("\n**Step {}.** ", n),
            format!("\n**{}.**\n", n),
            format!("\n**Step {}:**\n", n),
            format!("\n**Step {}.**\n", n),
            format!("\n**{}. ", n),
            format!("\n**Step {}: ", n),
            format!("\n**Step {}. ", n),
        ]
    }
}
