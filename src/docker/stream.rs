//! Decoding of streaming engine responses
//!
//! Container output arrives in the engine's multiplexed format: every frame
//! starts with an 8-byte header (stream type, three zero bytes, big-endian
//! payload length). Progress of pull/push/build arrives as JSON documents,
//! one per line.

use super::Chunks;
use crate::error::{DominatorError, Result};
use crate::logging;
use std::collections::VecDeque;

const FRAME_HEADER_LEN: usize = 8;

/// Splits a chunk stream into text lines
pub struct LineReader {
    chunks: Chunks,
    framed: bool,
    frames: Vec<u8>,
    text: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl LineReader {
    /// Reader for plain text streams
    pub fn raw(chunks: Chunks) -> Self {
        Self::new(chunks, false)
    }

    /// Reader for multiplexed container output. Falls back to plain text
    /// when the data does not start with a frame header (TTY containers).
    pub fn multiplexed(chunks: Chunks) -> Self {
        Self::new(chunks, true)
    }

    fn new(chunks: Chunks, framed: bool) -> Self {
        Self {
            chunks,
            framed,
            frames: Vec::new(),
            text: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Next complete line, without its terminator
    pub async fn next_line(&mut self) -> Option<Result<String>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(Ok(line));
            }
            if self.done {
                return None;
            }
            match self.chunks.recv().await {
                Some(Ok(bytes)) => self.feed(&bytes),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    self.flush();
                }
            }
        }
    }

    /// Drain every remaining line
    pub async fn collect(mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await {
            lines.push(line?);
        }
        Ok(lines)
    }

    fn feed(&mut self, bytes: &[u8]) {
        if !self.framed {
            self.push_text(bytes);
            return;
        }

        self.frames.extend_from_slice(bytes);
        while self.frames.len() >= FRAME_HEADER_LEN {
            let header = &self.frames[..FRAME_HEADER_LEN];
            if header[0] > 2 || header[1..4] != [0, 0, 0] {
                self.framed = false;
                let rest = std::mem::take(&mut self.frames);
                self.push_text(&rest);
                return;
            }
            let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
            if self.frames.len() < FRAME_HEADER_LEN + size {
                return;
            }
            let payload: Vec<u8> = self
                .frames
                .drain(..FRAME_HEADER_LEN + size)
                .skip(FRAME_HEADER_LEN)
                .collect();
            self.push_text(&payload);
        }
    }

    fn push_text(&mut self, bytes: &[u8]) {
        self.text.extend_from_slice(bytes);
        while let Some(pos) = self.text.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.text.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            self.pending
                .push_back(line.trim_end_matches('\r').to_string());
        }
    }

    fn flush(&mut self) {
        if self.framed && !self.frames.is_empty() {
            tracing::debug!(bytes = self.frames.len(), "discarding truncated frame");
        }
        if !self.text.is_empty() {
            let rest = std::mem::take(&mut self.text);
            self.pending
                .push_back(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string());
        }
    }
}

/// Streaming image operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Pull,
    Push,
    Build,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Pull => write!(f, "pull"),
            Operation::Push => write!(f, "push"),
            Operation::Build => write!(f, "build"),
        }
    }
}

/// Consume a progress stream, logging every message line
///
/// Fails on the first document carrying an `error` key.
pub async fn follow_progress(operation: Operation, subject: &str, chunks: Chunks) -> Result<()> {
    let mut lines = LineReader::raw(chunks);
    while let Some(line) = lines.next_line().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response: serde_json::Value = serde_json::from_str(&line)?;
        report(operation, subject, &response)?;
    }
    Ok(())
}

fn report(operation: Operation, subject: &str, response: &serde_json::Value) -> Result<()> {
    if let Some(error) = response.get("error") {
        let error = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
        return Err(DominatorError::Stream(format!(
            "could not complete {} operation on {} ({})",
            operation, subject, error
        )));
    }

    let message = response
        .get("stream")
        .or_else(|| response.get("status"))
        .and_then(|m| m.as_str())
        .unwrap_or("");

    for line in message.split('\n').filter(|l| !l.is_empty()) {
        match operation {
            Operation::Pull => {
                tracing::debug!(target: logging::DOCKER_PULL, %response, "{}", line)
            }
            Operation::Push => {
                tracing::debug!(target: logging::DOCKER_PUSH, %response, "{}", line)
            }
            Operation::Build => {
                tracing::debug!(target: logging::DOCKER_BUILD, %response, "{}", line)
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn chunks_from(parts: Vec<Vec<u8>>) -> Chunks {
    let (tx, rx) = tokio::sync::mpsc::channel(parts.len().max(1));
    for part in parts {
        tx.try_send(Ok(part)).expect("channel sized for all parts");
    }
    rx
}

#[cfg(test)]
pub(crate) fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![stream, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
