//! A back-end that replays pre-recorded chunk scripts.
//!
//! Used for offline replay of recorded model sessions and as the
//! deterministic test double throughout the workspace. Each call to
//! [`ModelBackend::stream`] consumes the next script; once scripts are
//! exhausted the last one is served repeatedly (so same-position resampling
//! keeps producing output), unless the backend was built with
//! [`ReplayBackend::finite`].

use crate::backend::{ChunkStream, ModelBackend, StreamChunk};
use crate::error::{BackendError, Result};
use crate::message::ChatMessage;
use crate::params::GenerationParams;
use async_trait::async_trait;
use futures::stream;
use std::sync::Mutex;

/// Serves scripted responses, one script per `stream` call.
pub struct ReplayBackend {
    scripts: Mutex<ReplayState>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    repeat_last: bool,
}

struct ReplayState {
    scripts: Vec<Vec<String>>,
    next: usize,
}

impl ReplayBackend {
    /// Replay `scripts` in order, repeating the last one once exhausted.
    pub fn new<S: Into<String>>(scripts: Vec<Vec<S>>) -> Self {
        Self {
            scripts: Mutex::new(ReplayState {
                scripts: scripts
                    .into_iter()
                    .map(|s| s.into_iter().map(Into::into).collect())
                    .collect(),
                next: 0,
            }),
            calls: Mutex::new(Vec::new()),
            repeat_last: true,
        }
    }

    /// Replay `scripts` in order and fail once they run out.
    pub fn finite<S: Into<String>>(scripts: Vec<Vec<S>>) -> Self {
        Self {
            repeat_last: false,
            ..Self::new(scripts)
        }
    }

    /// A single response served for every call.
    pub fn single<S: Into<String>>(chunks: Vec<S>) -> Self {
        Self::new(vec![chunks])
    }

    /// The message lists this backend has been called with, in order.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of `stream` calls served so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_script(&self) -> Result<Vec<String>> {
        let mut state = self.scripts.lock().unwrap();
        if state.next < state.scripts.len() {
            let script = state.scripts[state.next].clone();
            state.next += 1;
            Ok(script)
        } else if self.repeat_last && !state.scripts.is_empty() {
            Ok(state.scripts.last().cloned().unwrap_or_default())
        } else {
            Err(BackendError::Fatal(
                "replay backend has no scripts left".into(),
            ))
        }
    }
}

#[async_trait]
impl ModelBackend for ReplayBackend {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<ChunkStream> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let script = self.next_script()?;

        let input = if params.with_input {
            Some(
                messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        } else {
            None
        };

        let chunks: Vec<Result<StreamChunk>> = script
            .into_iter()
            .map(|text| {
                Ok(StreamChunk {
                    text,
                    input: input.clone(),
                })
            })
            .collect();

        Ok(Box::pin(stream::iter(chunks)))
    }
}
