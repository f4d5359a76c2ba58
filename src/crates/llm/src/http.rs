//! Shared plumbing for HTTP streaming back-ends.

use crate::error::{BackendError, Result};
use reqwest::{Response, StatusCode};

/// Map a non-success HTTP response onto the back-end error taxonomy.
pub(crate) async fn classify_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BackendError::Config(format!("authentication failed ({}): {}", status, body))
        }
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited(body),
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            BackendError::Transport(format!("{}: {}", status, body))
        }
        _ => BackendError::Fatal(format!("unexpected status {}: {}", status, body)),
    })
}

/// Accumulates raw body bytes and yields complete lines.
///
/// Both SSE and NDJSON bodies are line-delimited; body chunks can split a
/// line (or a multi-byte character) anywhere, so bytes are buffered until a
/// newline arrives and only complete lines are decoded.
#[derive(Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pop the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Result<Option<String>> {
        let Some(pos) = self.pending.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|e| BackendError::Fatal(format!("invalid UTF-8 in response: {}", e)))
    }
}
