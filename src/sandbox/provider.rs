use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{SandboxConfig, Secret};
use crate::errors::SandboxError;

/// Captured result of one sandbox command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Remote environment provider. Implementations map transport failures onto
/// `SandboxError` so the client can classify them.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Start an environment from `template` that the provider should expire
    /// after `lifetime`. Returns the provider's session id.
    async fn create(&self, template: &str, lifetime: Duration) -> Result<String, SandboxError>;

    async fn run(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SandboxError>;

    async fn close(&self, session_id: &str) -> Result<(), SandboxError>;

    /// One cheap authenticated round trip.
    async fn ping(&self) -> Result<(), SandboxError>;
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(alias = "sandboxID", alias = "sandbox_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default, alias = "exitCode")]
    exit_code: i32,
}

/// HTTP sandbox API client authenticated with an `X-API-Key` header.
pub struct HttpSandboxProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<Secret>,
}

impl HttpSandboxProvider {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn key(&self) -> Result<&str, SandboxError> {
        self.api_key
            .as_ref()
            .filter(|k| !k.is_blank())
            .map(|k| k.expose())
            .ok_or_else(|| SandboxError::Auth("E2B_API_KEY is not set".into()))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SandboxError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status.as_u16(), body))
    }
}

fn status_error(status: u16, body: String) -> SandboxError {
    match status {
        401 | 403 => SandboxError::Auth(format!("HTTP {}: {}", status, body)),
        429 => SandboxError::QuotaExceeded(body),
        500..=599 => SandboxError::Transient(format!("HTTP {}: {}", status, body)),
        _ => SandboxError::Rejected(format!("HTTP {}: {}", status, body)),
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> SandboxError {
    if err.is_timeout() {
        SandboxError::ExecutionTimeout(timeout)
    } else if err.is_connect() {
        SandboxError::Disconnected(err.to_string())
    } else {
        SandboxError::Transient(err.to_string())
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create(&self, template: &str, lifetime: Duration) -> Result<String, SandboxError> {
        let timeout = Duration::from_secs(60);
        let resp = self
            .client
            .post(format!("{}/sandboxes", self.api_url))
            .header("X-API-Key", self.key()?)
            .timeout(timeout)
            .json(&serde_json::json!({
                "templateID": template,
                "timeout": lifetime.as_secs(),
            }))
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        let created: CreateResponse = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Transient(format!("Invalid create response: {}", e)))?;
        Ok(created.id)
    }

    async fn run(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SandboxError> {
        let resp = self
            .client
            .post(format!("{}/sandboxes/{}/commands", self.api_url, session_id))
            .header("X-API-Key", self.key()?)
            .timeout(timeout)
            .json(&serde_json::json!({
                "cmd": command,
                "timeout": timeout.as_secs(),
            }))
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        // A vanished session surfaces as 404; treat it like a dropped connection.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SandboxError::Disconnected(format!("Session {} no longer exists", session_id)));
        }
        let out: RunResponse = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Transient(format!("Invalid command response: {}", e)))?;
        Ok(CommandOutput {
            stdout: out.stdout,
            stderr: out.stderr,
            exit_code: out.exit_code,
        })
    }

    async fn close(&self, session_id: &str) -> Result<(), SandboxError> {
        let timeout = Duration::from_secs(30);
        let resp = self
            .client
            .delete(format!("{}/sandboxes/{}", self.api_url, session_id))
            .header("X-API-Key", self.key()?)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), SandboxError> {
        let timeout = Duration::from_secs(10);
        let resp = self
            .client
            .get(format!("{}/sandboxes", self.api_url))
            .header("X-API-Key", self.key()?)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_classification() {
        assert!(matches!(status_error(401, String::new()), SandboxError::Auth(_)));
        assert!(matches!(status_error(429, "quota".into()), SandboxError::QuotaExceeded(_)));
        assert!(matches!(status_error(503, String::new()), SandboxError::Transient(_)));
        assert!(matches!(status_error(400, String::new()), SandboxError::Rejected(_)));
    }

    #[test]
    fn test_run_response_accepts_camel_case_exit_code() {
        let out: RunResponse =
            serde_json::from_str(r#"{"stdout":"ok","exitCode":127}"#).unwrap();
        assert_eq!(out.exit_code, 127);
        assert!(out.stderr.is_empty());
    }

    #[test]
    fn test_combined_output() {
        let out = CommandOutput {
            stdout: "a".into(),
            stderr: "b".into(),
            exit_code: 1,
        };
        assert_eq!(out.combined(), "a\nb");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_missing_key_is_auth_error_without_network() {
        let provider = HttpSandboxProvider::new(&SandboxConfig::default());
        let err = provider.ping().await.unwrap_err();
        assert!(matches!(err, SandboxError::Auth(_)));
    }
}
