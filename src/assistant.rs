//! Assistant integration via OpenRouter-compatible chat endpoints.
//!
//! One batched request per run: every failure goes into a single markdown
//! context block, and the reply is expected to be a JSON array with one
//! suggestion per failure. Replies that aren't valid JSON are kept as one
//! free-text suggestion rather than dropped. Callers treat any `Err` as
//! "no assistant today" and fall back to the mechanical fixers.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::analyze::TestFailure;
use crate::config::Config;
use crate::logging::Logger;
use crate::util;

const REQUEST_TIMEOUT_SECS: u64 = 60;
const MAX_RESPONSE_TOKENS: u32 = 4096;

/// Failures beyond this are summarized as a count; a runaway suite must
/// not turn into a runaway prompt.
const MAX_BATCHED_FAILURES: usize = 10;

/// Lines of source shown on each side of the failing line.
const EXCERPT_CONTEXT: usize = 3;

const SYSTEM_PROMPT: &str = r#"You are a test-failure analyst. For each failing test, explain the most likely root cause and suggest a concrete fix.

Output format (JSON array, one object per failure):
[
  {
    "test_name": "name of the failing test",
    "explanation": "one-paragraph root cause",
    "file_path": "path of the file to change, if known",
    "suggested_code": "replacement code, if a concrete edit is possible"
  }
]

Only output the JSON array, nothing else. If no concrete edit is possible, leave suggested_code null."#;

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// One suggestion from the assistant. `explanation` is required so that a
/// syntactically-valid-but-wrong reply falls back to free text instead of
/// producing a list of empty suggestions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistSuggestion {
    #[serde(default)]
    pub test_name: String,
    pub explanation: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub suggested_code: Option<String>,
}

/// Boundary to the external assistant. Optional by design: everything else
/// works without a key.
pub struct Assistant {
    api_key: Option<String>,
    model: String,
    base_url: String,
    logger: Logger,
}

impl Assistant {
    pub fn from_config(config: &Config, logger: Logger) -> Self {
        Self {
            api_key: config.get_api_key(),
            model: config.assistant_model.clone(),
            base_url: config.assistant_base_url.clone(),
            logger,
        }
    }

    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    /// Ask the assistant about a batch of failures with one request.
    pub async fn suggest_fixes(&self, failures: &[TestFailure]) -> Result<Vec<AssistSuggestion>> {
        if failures.is_empty() {
            return Ok(Vec::new());
        }
        let api_key = self.api_key.as_deref().with_context(|| {
            format!(
                "OPENROUTER_API_KEY not set; export it or add it to {}",
                Config::config_location()
            )
        })?;
        let endpoint = chat_endpoint(&self.base_url)?;

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: build_context(failures),
                },
            ],
            max_tokens: MAX_RESPONSE_TOKENS,
            stream: false,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build HTTP client")?;

        self.logger.debug(&format!(
            "asking {} about {} failure(s)",
            self.model,
            failures.len()
        ));
        let response = client
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .header("HTTP-Referer", "https://github.com/recheck-cli/recheck")
            .header("X-Title", "recheck")
            .json(&request)
            .send()
            .await
            .context("assistant request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("assistant API error {}: {}", status, util::truncate(&text, 300));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .context("malformed assistant response")?;
        let content = reply
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();
        Ok(parse_suggestions(content))
    }
}

fn chat_endpoint(base_url: &str) -> Result<Url> {
    let trimmed = base_url.trim_end_matches('/');
    Url::parse(&format!("{}/chat/completions", trimmed))
        .with_context(|| format!("invalid assistant base URL: {}", base_url))
}

/// One markdown block covering every failure, capped at
/// [`MAX_BATCHED_FAILURES`].
fn build_context(failures: &[TestFailure]) -> String {
    let mut out = String::from("These tests are failing:\n");
    for (index, failure) in failures.iter().take(MAX_BATCHED_FAILURES).enumerate() {
        out.push_str(&format!("\n## Failure {}: {}\n", index + 1, failure.test_name));
        if let Some(file) = &failure.test_file {
            out.push_str(&format!("- Test file: {}\n", file.display()));
        }
        out.push_str(&format!("- Kind: {}\n", failure.error_kind));
        if let (Some(file), Some(line)) = (&failure.source_file, failure.line) {
            out.push_str(&format!("- Source: {}:{}\n", file.display(), line));
        }
        if let Some(suggestion) = &failure.suggestion {
            out.push_str(&format!("- Heuristic suggestion: {}\n", suggestion));
        }
        out.push_str(&format!(
            "\nError:\n```\n{}\n```\n",
            failure.error_message.trim()
        ));
        if let Some(excerpt) = source_excerpt(failure) {
            out.push_str(&format!(
                "\nCode around the failing line:\n```\n{}\n```\n",
                excerpt
            ));
        }
    }
    if failures.len() > MAX_BATCHED_FAILURES {
        out.push_str(&format!(
            "\n({} more failures omitted)\n",
            failures.len() - MAX_BATCHED_FAILURES
        ));
    }
    out
}

/// Numbered source lines around the failure, when the file is readable.
fn source_excerpt(failure: &TestFailure) -> Option<String> {
    let path = failure.source_file.as_deref()?;
    let line = failure.line?;
    let content = std::fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = content.lines().collect();
    let start = line.saturating_sub(EXCERPT_CONTEXT + 1);
    let end = (line + EXCERPT_CONTEXT).min(lines.len());
    if start >= end {
        return None;
    }
    Some(
        lines[start..end]
            .iter()
            .enumerate()
            .map(|(offset, text)| format!("{:>4} | {}", start + offset + 1, text))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Extract the JSON array from the reply; keep prose replies as a single
/// free-text suggestion.
fn parse_suggestions(response: &str) -> Vec<AssistSuggestion> {
    let json_str = match (response.find('['), response.rfind(']')) {
        (Some(start), Some(end)) if start < end => &response[start..=end],
        _ => response,
    };
    if let Ok(parsed) = serde_json::from_str::<Vec<AssistSuggestion>>(json_str) {
        return parsed;
    }

    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    vec![AssistSuggestion {
        test_name: String::new(),
        explanation: trimmed.to_string(),
        file_path: None,
        suggested_code: None,
    }]
}
