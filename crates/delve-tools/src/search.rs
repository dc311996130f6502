use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use crate::{
    Capability, DiscoveredSource, SearchHitSummary, SearchOutput, ToolContext, ToolInput,
    ToolKind, ToolOutput, ToolResult,
};

pub const DEFAULT_SEARCH_URL: &str = "https://api.exa.ai/search";
const MAX_CONTENT_CHARS: u32 = 4000;
const SEARCH_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    pub api_key: Option<String>,
    pub url: String,
    pub num_results: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            url: DEFAULT_SEARCH_URL.to_string(),
            num_results: 5,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExaSearchRequest<'a> {
    query: &'a str,
    num_results: u32,
    #[serde(rename = "type")]
    search_type: &'a str,
    contents: ExaContents,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExaContents {
    text: ExaTextConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExaTextConfig {
    max_characters: u32,
}

#[derive(Deserialize)]
struct ExaSearchResponse {
    #[serde(default)]
    results: Vec<ExaResult>,
}

#[derive(Deserialize)]
struct ExaResult {
    #[serde(default)]
    title: Option<String>,
    url: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    favicon: Option<String>,
    #[serde(default)]
    image: Option<String>,
}

impl ExaResult {
    fn into_source(self) -> DiscoveredSource {
        let favicon = self
            .favicon
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| favicon_for(&self.url));
        let title = self
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.url.clone());
        DiscoveredSource {
            title,
            content: self.text.unwrap_or_default(),
            favicon,
            images: self.image.into_iter().collect(),
            url: self.url,
        }
    }
}

/// Favicon service url for the host of `url`, empty when the url does not parse.
pub fn favicon_for(url: &str) -> String {
    let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)) else {
        return String::new();
    };
    format!("https://www.google.com/s2/favicons?domain={host}&sz=64")
}

/// Web search backed by the Exa search API.
pub struct ExaSearch {
    config: SearchConfig,
    client: Client,
}

impl ExaSearch {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    async fn fetch(&self, query: &str) -> anyhow::Result<Vec<DiscoveredSource>> {
        let Some(api_key) = self.config.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            anyhow::bail!("search api key is not configured (set EXA_API_KEY)");
        };
        let request = ExaSearchRequest {
            query,
            num_results: self.config.num_results.clamp(1, 10),
            search_type: "auto",
            contents: ExaContents {
                text: ExaTextConfig {
                    max_characters: MAX_CONTENT_CHARS,
                },
            },
        };
        let res = self
            .client
            .post(self.config.url.as_str())
            .header("x-api-key", api_key)
            .timeout(SEARCH_TIMEOUT)
            .json(&request)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let error_text = res.text().await.unwrap_or_default();
            anyhow::bail!("search failed with status {}: {}", status, error_text);
        }
        let body: ExaSearchResponse = res.json().await?;
        Ok(body
            .results
            .into_iter()
            .filter(|r| !r.url.trim().is_empty())
            .map(ExaResult::into_source)
            .collect())
    }
}

#[async_trait]
impl Capability for ExaSearch {
    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    async fn invoke(&self, input: ToolInput, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let ToolInput::Search(input) = input else {
            anyhow::bail!("webSearchTool received a foreign input");
        };
        let query = input.query.trim();
        if query.is_empty() {
            anyhow::bail!("search query is empty");
        }
        let sources = tokio::select! {
            result = self.fetch(query) => result?,
            _ = ctx.cancel.cancelled() => anyhow::bail!("cancelled"),
        };
        tracing::debug!(query_len = query.len(), results = sources.len(), "web search finished");
        Ok(search_result(query, sources))
    }
}

pub(crate) fn search_result(query: &str, sources: Vec<DiscoveredSource>) -> ToolResult {
    let results = sources
        .iter()
        .map(|s| SearchHitSummary {
            title: s.title.clone(),
            url: s.url.clone(),
        })
        .collect();
    ToolResult {
        reasoning: format!("Searching for: {query}"),
        output: ToolOutput::Search(SearchOutput {
            query: query.to_string(),
            results,
        }),
        sources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SearchInput;
    use delve_types::ModelSpec;

    #[test]
    fn favicon_uses_result_host() {
        assert_eq!(
            favicon_for("https://docs.rs/tokio/latest"),
            "https://www.google.com/s2/favicons?domain=docs.rs&sz=64"
        );
        assert_eq!(favicon_for("not a url"), "");
    }

    #[test]
    fn exa_result_without_title_uses_url() {
        let result: ExaResult = serde_json::from_value(serde_json::json!({
            "url": "https://example.com/a",
            "text": "body",
            "image": "https://example.com/a.png"
        }))
        .expect("result");
        let source = result.into_source();
        assert_eq!(source.title, "https://example.com/a");
        assert_eq!(source.images, vec!["https://example.com/a.png"]);
        assert!(source.favicon.contains("example.com"));
    }

    #[tokio::test]
    async fn missing_api_key_fails_the_search() {
        let search = ExaSearch::new(SearchConfig::default());
        let ctx = ToolContext::new(ModelSpec::parse("m").expect("model"));
        let err = search
            .invoke(
                ToolInput::Search(SearchInput {
                    query: "rust".to_string(),
                }),
                &ctx,
            )
            .await
            .expect_err("no key");
        assert!(err.to_string().contains("EXA_API_KEY"));
    }
}
