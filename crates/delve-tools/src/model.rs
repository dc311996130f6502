use async_trait::async_trait;
use serde_json::Value;

use delve_providers::ProviderRegistry;

use crate::{
    AnalyzeOutput, Capability, Finding, ReportOutput, SynthesizeOutput, ToolContext, ToolInput,
    ToolKind, ToolOutput, ToolResult,
};

const MAX_PLANNED_QUERIES: usize = 5;
const FINDING_CONTENT_CHARS: usize = 1200;

const ANALYZE_INSTRUCTIONS: &str = r#"You decide whether a question needs web research.
Reply with one JSON object and nothing else:
{"needsDeepSearch": bool, "searchQueries": [string], "reasoning": string}
Use needsDeepSearch=false for greetings, arithmetic, and anything answerable from general knowledge.
When research is needed, plan between 1 and 5 distinct, specific search queries."#;

const SYNTHESIZE_INSTRUCTIONS: &str = r#"You review research findings for a question.
Reply with one JSON object and nothing else:
{"needsMoreSearch": bool, "followUpQueries": [string], "reasoning": string, "summary": string}
Only ask for more search when an important part of the question is still unanswered."#;

const REPORT_INSTRUCTIONS: &str = "Write a well-structured markdown report answering the question \
from the findings below. Cite sources inline as [title](url). Do not invent facts beyond the findings.";

async fn complete(
    providers: &ProviderRegistry,
    ctx: &ToolContext,
    prompt: &str,
) -> anyhow::Result<String> {
    tokio::select! {
        result = providers.complete_for(&ctx.model, prompt) => result,
        _ = ctx.cancel.cancelled() => anyhow::bail!("cancelled"),
    }
}

/// Returns the first balanced `{...}` object in `text` parsed as JSON.
pub fn extract_first_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (idx, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        if let Ok(value) = serde_json::from_str::<Value>(&text[start..=idx]) {
                            if value.is_object() {
                                return Some(value);
                            }
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        search_from = start + 1;
    }
    None
}

fn clean_queries(raw: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for query in raw {
        let query = query.trim();
        if query.is_empty() || out.iter().any(|q| q.eq_ignore_ascii_case(query)) {
            continue;
        }
        out.push(query.to_string());
        if out.len() == MAX_PLANNED_QUERIES {
            break;
        }
    }
    out
}

fn render_findings(findings: &[Finding]) -> String {
    if findings.is_empty() {
        return "(no findings)".to_string();
    }
    findings
        .iter()
        .enumerate()
        .map(|(idx, f)| {
            let content = f.content.chars().take(FINDING_CONTENT_CHARS).collect::<String>();
            format!(
                "[{}] {} ({})\nquery: {}\n{}",
                idx + 1,
                f.title,
                f.url,
                f.query,
                content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct ModelAnalyzer {
    providers: ProviderRegistry,
}

impl ModelAnalyzer {
    pub fn new(providers: ProviderRegistry) -> Self {
        Self { providers }
    }

    fn parse(raw: &str, prompt: &str) -> AnalyzeOutput {
        let parsed = extract_first_json_object(raw)
            .and_then(|value| serde_json::from_value::<AnalyzeOutput>(value).ok());
        let Some(mut output) = parsed else {
            tracing::warn!("analysis reply was not JSON; answering directly");
            return AnalyzeOutput {
                needs_deep_search: false,
                search_queries: Vec::new(),
                reasoning: raw.trim().to_string(),
            };
        };
        output.search_queries = clean_queries(output.search_queries);
        if output.needs_deep_search && output.search_queries.is_empty() {
            output.search_queries.push(prompt.trim().to_string());
        }
        if !output.needs_deep_search {
            output.search_queries.clear();
        }
        output
    }
}

#[async_trait]
impl Capability for ModelAnalyzer {
    fn kind(&self) -> ToolKind {
        ToolKind::Analyze
    }

    async fn invoke(&self, input: ToolInput, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let ToolInput::Analyze(input) = input else {
            anyhow::bail!("analyzeQueryTool received a foreign input");
        };
        let context = if input.context.is_empty() {
            "(none)".to_string()
        } else {
            input.context.join("\n")
        };
        let prompt = format!(
            "{ANALYZE_INSTRUCTIONS}\n\nConversation so far:\n{context}\n\nQuestion:\n{}",
            input.prompt
        );
        let raw = complete(&self.providers, ctx, &prompt).await?;
        let output = Self::parse(&raw, &input.prompt);
        Ok(ToolResult {
            reasoning: output.reasoning.clone(),
            output: ToolOutput::Analyze(output),
            sources: Vec::new(),
        })
    }
}

pub struct ModelSynthesizer {
    providers: ProviderRegistry,
}

impl ModelSynthesizer {
    pub fn new(providers: ProviderRegistry) -> Self {
        Self { providers }
    }

    fn parse(raw: &str) -> SynthesizeOutput {
        let parsed = extract_first_json_object(raw)
            .and_then(|value| serde_json::from_value::<SynthesizeOutput>(value).ok());
        match parsed {
            Some(mut output) => {
                output.follow_up_queries = clean_queries(output.follow_up_queries);
                if output.follow_up_queries.is_empty() {
                    output.needs_more_search = false;
                }
                output
            }
            None => SynthesizeOutput {
                needs_more_search: false,
                follow_up_queries: Vec::new(),
                reasoning: "findings are sufficient".to_string(),
                summary: raw.trim().to_string(),
            },
        }
    }
}

#[async_trait]
impl Capability for ModelSynthesizer {
    fn kind(&self) -> ToolKind {
        ToolKind::Synthesize
    }

    async fn invoke(&self, input: ToolInput, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let ToolInput::Synthesize(input) = input else {
            anyhow::bail!("synthesizeTool received a foreign input");
        };
        let prompt = format!(
            "{SYNTHESIZE_INSTRUCTIONS}\n\nQuestion:\n{}\n\nFindings:\n{}",
            input.prompt,
            render_findings(&input.findings)
        );
        let raw = complete(&self.providers, ctx, &prompt).await?;
        let output = Self::parse(&raw);
        Ok(ToolResult {
            reasoning: output.reasoning.clone(),
            output: ToolOutput::Synthesize(output),
            sources: Vec::new(),
        })
    }
}

pub struct ModelReporter {
    providers: ProviderRegistry,
}

impl ModelReporter {
    pub fn new(providers: ProviderRegistry) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl Capability for ModelReporter {
    fn kind(&self) -> ToolKind {
        ToolKind::Report
    }

    async fn invoke(&self, input: ToolInput, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let ToolInput::Report(input) = input else {
            anyhow::bail!("generateReportTool received a foreign input");
        };
        let prompt = format!(
            "{REPORT_INSTRUCTIONS}\n\nQuestion:\n{}\n\nFindings:\n{}",
            input.prompt,
            render_findings(&input.findings)
        );
        let report = complete(&self.providers, ctx, &prompt).await?;
        let report = report.trim().to_string();
        if report.is_empty() {
            anyhow::bail!("model returned an empty report");
        }
        Ok(ToolResult {
            reasoning: format!("Compiled report from {} findings", input.findings.len()),
            output: ToolOutput::Report(ReportOutput { report }),
            sources: Vec::new(),
        })
    }
}
