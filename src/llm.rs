//! Analysis model client: vulnerability triage of recon output and patch
//! generation, over an OpenAI-compatible chat completions API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{LlmConfig, Secret};
use crate::errors::AnalystError;
use crate::store::models::Finding;

/// A text-completion backend.
#[async_trait]
pub trait Analyst: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, AnalystError>;
    async fn ping(&self) -> Result<(), AnalystError>;
}

/// One vulnerability as reported by the model, before persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFinding {
    #[serde(rename = "type", default)]
    pub category: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default, alias = "file_path")]
    pub file: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnalysisReply {
    #[serde(default)]
    vulnerabilities: Vec<CandidateFinding>,
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Parse `{"vulnerabilities": [...]}` from model output. Prose around the
/// JSON object and code fences are tolerated; anything else is malformed.
pub fn parse_candidates(text: &str) -> Result<Vec<CandidateFinding>, AnalystError> {
    let body = strip_code_fence(text);
    let json = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if end > start => &body[start..=end],
        _ => {
            return Err(AnalystError::Malformed(format!(
                "no JSON object in model output: {}",
                truncate_chars(body, 200)
            )));
        }
    };
    let reply: AnalysisReply =
        serde_json::from_str(json).map_err(|e| AnalystError::Malformed(e.to_string()))?;
    Ok(reply
        .vulnerabilities
        .into_iter()
        .filter(|c| !c.category.trim().is_empty())
        .collect())
}

pub fn analysis_prompt(recon: &str, max_chars: usize) -> String {
    format!(
        "You are a senior penetration tester. Given the following scan output, list confirmed \
         vulnerabilities with endpoint and type (SQLi, XSS, etc.).\n\
         Only output JSON like:\n\
         {{\"vulnerabilities\": [{{\"type\": \"SQLi\", \"endpoint\": \"/login.php\", \"param\": \"username\", \"severity\": \"high\"}}]}}\n\
         Output {{\"vulnerabilities\": []}} if nothing is confirmed.\n\n\
         Scan output:\n{}",
        truncate_chars(recon, max_chars)
    )
}

/// Ask the model for findings in `recon`.
pub async fn analyze_recon(
    analyst: &dyn Analyst,
    recon: &str,
    max_chars: usize,
) -> Result<Vec<CandidateFinding>, AnalystError> {
    let reply = analyst.complete(&analysis_prompt(recon, max_chars)).await?;
    parse_candidates(&reply)
}

/// Ask the model for a corrected version of the file behind `finding`.
pub async fn generate_patch(
    analyst: &dyn Analyst,
    finding: &Finding,
    evidence: &str,
) -> Result<String, AnalystError> {
    let prompt = format!(
        "You are a senior secure developer. Fix this {} vulnerability at {}.\n\
         Only return the full corrected file content.\n\n\
         Evidence:\n{}",
        finding.category,
        finding.location(),
        truncate_chars(evidence, 8_000)
    );
    let reply = analyst.complete(&prompt).await?;
    let patch = strip_code_fence(&reply);
    if patch.is_empty() {
        return Err(AnalystError::Malformed("model returned an empty patch".into()));
    }
    Ok(patch.to_string())
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

pub struct HttpAnalyst {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<Secret>,
    model: String,
}

impl HttpAnalyst {
    pub fn new(config: &LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }

    fn key(&self) -> Result<&str, AnalystError> {
        self.api_key
            .as_ref()
            .filter(|k| !k.is_blank())
            .map(|k| k.expose())
            .ok_or_else(|| AnalystError::Auth("XAI_API_KEY is not set".into()))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, AnalystError> {
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = format!("HTTP {}: {}", status, truncate_chars(&body, 300));
        Err(match status {
            401 | 403 => AnalystError::Auth(message),
            429 => AnalystError::RateLimited(message),
            500..=599 => AnalystError::Transient(message),
            _ => AnalystError::Rejected(message),
        })
    }
}

#[async_trait]
impl Analyst for HttpAnalyst {
    async fn complete(&self, prompt: &str) -> Result<String, AnalystError> {
        let request = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .bearer_auth(self.key()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| AnalystError::Transient(e.to_string()))?;
        let chat: ChatResponse = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| AnalystError::Malformed(format!("Invalid completion response: {}", e)))?;
        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AnalystError::Malformed("completion had no choices".into()))
    }

    async fn ping(&self) -> Result<(), AnalystError> {
        let resp = self
            .client
            .get(format!("{}/models", self.api_url))
            .bearer_auth(self.key()?)
            .send()
            .await
            .map_err(|e| AnalystError::Transient(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }
}
