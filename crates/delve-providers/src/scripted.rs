//! In-process provider that replays queued replies. Used by tests and by
//! `delve-engine run --provider scripted` for offline smoke runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use delve_types::{ModelInfo, ProviderInfo};

use crate::{flatten_messages, ChatMessage, ChunkStream, Provider, StreamChunk};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Fail(String),
}

pub struct ScriptedProvider {
    id: String,
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: String,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            replies: Mutex::new(VecDeque::new()),
            fallback: "ok".to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.push(ScriptedReply::Text(text.into()));
        self
    }

    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push(ScriptedReply::Fail(message.into()));
        self
    }

    /// Reply used once the queue is drained.
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    pub fn push(&self, reply: ScriptedReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    /// Every prompt received so far, flattened.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self, prompt: String) -> ScriptedReply {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt);
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.pop_front())
            .unwrap_or_else(|| ScriptedReply::Text(self.fallback.clone()))
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: "Scripted".to_string(),
            models: vec![ModelInfo {
                id: "scripted-1".to_string(),
                provider_id: self.id.clone(),
                display_name: "Scripted Model".to_string(),
            }],
        }
    }

    async fn complete(&self, prompt: &str, _model_override: Option<&str>) -> anyhow::Result<String> {
        match self.next_reply(prompt.to_string()) {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Fail(message) => anyhow::bail!(message),
        }
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        _model_override: Option<&str>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let text = match self.next_reply(flatten_messages(&messages)) {
            ScriptedReply::Text(text) => text,
            ScriptedReply::Fail(message) => anyhow::bail!(message),
        };
        let mut chunks = text
            .split_inclusive(' ')
            .map(|word| Ok(StreamChunk::TextDelta(word.to_string())))
            .collect::<Vec<_>>();
        chunks.push(Ok(StreamChunk::Done {
            finish_reason: "stop".to_string(),
            usage: None,
        }));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}
