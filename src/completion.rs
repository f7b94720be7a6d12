//! The streaming-completion trait boundary the interpreter (C7) and the
//! streaming executor (C8) consume.
//!
//! LLM provider bindings are explicitly out of scope (§1); this module only
//! defines the capability the core needs from one: an async send that
//! returns a `Pin<Box<dyn Stream<Item = ...>>>` of completion chunks.

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use std::pin::Pin;

/// One chunk of an LLM completion, as consumed incrementally by C8.
pub type CompletionChunk = String;

/// A boxed, send-able stream of completion chunks.
pub type CompletionStream = Pin<Box<dyn Stream<Item = CompletionChunk> + Send>>;

/// The capability the interpreter loop (C7) needs from an LLM: turn a
/// prompt string into a stream of text chunks. The wire contract (§6) is
/// exactly "the prompt is a plain string; the completion is a character
/// stream" — this trait is that contract made concrete.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> CompletionStream;
}

/// A completion provider that replays a fixed, pre-scripted sequence of
/// full completions, one per call. Each call consumes the next scripted
/// completion, split into single-character chunks to exercise the
/// incremental parser the way a real token stream would.
pub struct ScriptedCompletionProvider {
    turns: tokio::sync::Mutex<std::collections::VecDeque<String>>,
}

impl ScriptedCompletionProvider {
    pub fn new(turns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ScriptedCompletionProvider {
            turns: tokio::sync::Mutex::new(turns.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletionProvider {
    async fn complete(&self, _prompt: &str) -> CompletionStream {
        let next = self
            .turns
            .lock()
            .await
            .pop_front()
            .unwrap_or_default();
        let chunks: Vec<String> = next.chars().map(|c| c.to_string()).collect();
        Box::pin(stream::iter(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn scripted_provider_replays_turns_in_order() {
        let provider = ScriptedCompletionProvider::new(["ab", "cd"]);
        let first: String = provider.complete("prompt").await.collect().await;
        let second: String = provider.complete("prompt").await.collect().await;
        assert_eq!(first, "ab");
        assert_eq!(second, "cd");
    }
}
