use std::collections::HashMap;
use std::sync::Arc;
use std::pin::Pin;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use delve_types::{ModelInfo, ModelSpec, ProviderInfo};

pub mod scripted;

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;
    async fn complete(&self, prompt: &str, model_override: Option<&str>) -> anyhow::Result<String>;
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let prompt = flatten_messages(&messages);
        let response = self.complete(&prompt, model_override).await?;
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta(response)),
            Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: None,
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

pub fn flatten_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<Vec<Arc<dyn Provider>>>,
    default_provider: Option<String>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        let providers = build_providers(&config);
        Self::with_providers(providers, config.default_provider)
    }

    pub fn with_providers(
        providers: Vec<Arc<dyn Provider>>,
        default_provider: Option<String>,
    ) -> Self {
        Self {
            providers: Arc::new(providers),
            default_provider,
        }
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers.iter().map(|p| p.info()).collect()
    }

    pub async fn complete_for(&self, model: &ModelSpec, prompt: &str) -> anyhow::Result<String> {
        let provider = self.select_provider(model.provider_id.as_deref()).await?;
        provider.complete(prompt, Some(model.model_id.as_str())).await
    }

    pub async fn stream_for(
        &self,
        model: &ModelSpec,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let provider = self.select_provider(model.provider_id.as_deref()).await?;
        provider
            .stream(messages, Some(model.model_id.as_str()), cancel)
            .await
    }

    pub async fn select_provider(
        &self,
        provider_id: Option<&str>,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = &self.providers;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        if let Some(default_id) = self.default_provider.as_deref() {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    add_openai_provider(
        config,
        &mut providers,
        "openai",
        "OpenAI",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "openrouter",
        "OpenRouter",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "ollama",
        "Ollama",
        "http://127.0.0.1:11434/v1",
        "llama3.1:8b",
        false,
    );
    add_openai_provider(
        config,
        &mut providers,
        "groq",
        "Groq",
        "https://api.groq.com/openai/v1",
        "llama-3.1-8b-instant",
        true,
    );

    providers
}

fn add_openai_provider(
    config: &ProvidersConfig,
    providers: &mut Vec<Arc<dyn Provider>>,
    id: &str,
    name: &str,
    default_url: &str,
    default_model: &str,
    use_api_key: bool,
) {
    let Some(entry) = config.providers.get(id) else {
        return;
    };
    providers.push(Arc::new(OpenAICompatibleProvider {
        id: id.to_string(),
        name: name.to_string(),
        base_url: normalize_base(entry.url.as_deref().unwrap_or(default_url)),
        api_key: if use_api_key {
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
                .or_else(|| env_api_key_for_provider(id))
        } else {
            None
        },
        default_model: entry
            .default_model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        client: Client::new(),
    }));
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        _ => None,
    }?;
    std::env::var(env_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
}

struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    fn resolve_model<'a>(&'a self, model_override: Option<&'a str>) -> &'a str {
        model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(body);
        if self.id == "openrouter" {
            req = req.header("X-Title", "Delve");
        }
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        req
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
            }],
        }
    }

    async fn complete(&self, prompt: &str, model_override: Option<&str>) -> anyhow::Result<String> {
        let model = self.resolve_model(model_override);
        let response = self
            .request(&json!({
                "model": model,
                "messages": [{"role": "user", "content": prompt}],
                "stream": false,
            }))
            .send()
            .await?;
        let status = response.status();
        let value: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {}", status));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }
        if let Some(text) = extract_openai_text(&value) {
            return Ok(text);
        }

        let body_preview = truncate_for_error(&value.to_string(), 500);
        anyhow::bail!(
            "provider returned no completion content for model `{}` (response: {})",
            model,
            body_preview
        );
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = self.resolve_model(model_override);
        let wire_messages = messages
            .into_iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>();
        let body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": true,
        });

        let resp = self.request(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let provider_id = self.id.clone();
        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                    };
                    break;
                }

                buffer.extend_from_slice(&chunk?);
                for frame in drain_sse_frames(&mut buffer) {
                    for payload in sse_data_lines(&frame) {
                        if payload == "[DONE]" {
                            yield StreamChunk::Done {
                                finish_reason: "stop".to_string(),
                                usage: None,
                            };
                            continue;
                        }

                        let value = match serde_json::from_str::<serde_json::Value>(payload) {
                            Ok(value) => value,
                            Err(err) => {
                                tracing::warn!(
                                    provider = %provider_id,
                                    "skipping malformed stream payload: {}",
                                    err
                                );
                                continue;
                            }
                        };
                        if let Some(detail) = extract_openai_error(&value) {
                            Err(anyhow::anyhow!(detail))?;
                        }
                        for chunk in chunks_from_payload(&value) {
                            yield chunk;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Splits complete `\n\n`-terminated SSE frames off the front of `buffer`.
/// Frames are cut on raw bytes so a multi-byte character split across network
/// chunks stays intact until its frame is complete.
fn drain_sse_frames(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
        let frame = buffer.drain(..pos + 2).collect::<Vec<_>>();
        frames.push(String::from_utf8_lossy(&frame[..pos]).into_owned());
    }
    frames
}

fn sse_data_lines(frame: &str) -> impl Iterator<Item = &str> {
    frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
}

fn chunks_from_payload(value: &serde_json::Value) -> Vec<StreamChunk> {
    let mut out = Vec::new();
    let Some(choices) = value.get("choices").and_then(|v| v.as_array()) else {
        return out;
    };
    for choice in choices {
        if let Some(delta) = choice.get("delta") {
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    out.push(StreamChunk::TextDelta(text.to_string()));
                }
            }
            if let Some(text) = delta.get("reasoning").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    out.push(StreamChunk::ReasoningDelta(text.to_string()));
                }
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            if !reason.is_empty() {
                out.push(StreamChunk::Done {
                    finish_reason: reason.to_string(),
                    usage: extract_usage(value),
                });
            }
        }
    }
    out
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

fn extract_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_openai_text(value: &serde_json::Value) -> Option<String> {
    let choice = value.get("choices").and_then(|v| v.get(0))?;
    if let Some(text) = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
    {
        if !text.trim().is_empty() {
            return Some(text.to_string());
        }
    }
    choice
        .get("text")
        .and_then(|v| v.as_str())
        .filter(|text| !text.trim().is_empty())
        .map(|text| text.to_string())
}

fn extract_openai_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Collects the text deltas of a stream into one string.
pub async fn collect_text(mut stream: ChunkStream) -> anyhow::Result<String> {
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::TextDelta(delta) => out.push_str(&delta),
            StreamChunk::ReasoningDelta(_) => {}
            StreamChunk::Done { .. } => break,
        }
    }
    Ok(out)
}
