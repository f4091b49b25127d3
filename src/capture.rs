//! Visual evidence capture through a rate-limited browser service.
//!
//! The service allows very few concurrent sessions, so one session is shared
//! by every run and reused while it is younger than the freshness window.
//! The pool is the only resource shared across concurrent runs; access to it
//! is serialized by a tokio mutex. Capture is optional: a disabled or failing
//! client degrades the report, it never fails a run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cache::TtlCache;
use crate::config::{CaptureConfig, Secret};
use crate::errors::CaptureError;
use crate::retry::{RetryError, RetryPolicy, retry};

const EVIDENCE_SESSION: &str = "evidence";

/// Reference to captured evidence for one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureArtifact {
    pub session_id: String,
    pub target_url: String,
    /// Where the rendered capture can be viewed.
    pub view_url: String,
}

#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn create_session(&self) -> Result<String, CaptureError>;
    async fn capture(&self, session_id: &str, url: &str) -> Result<CaptureArtifact, CaptureError>;
    async fn close_session(&self, session_id: &str) -> Result<(), CaptureError>;
    async fn ping(&self) -> Result<(), CaptureError>;
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
}

/// Browser-session service client speaking the hosted REST API.
pub struct HttpCaptureBackend {
    client: reqwest::Client,
    api_url: String,
    api_key: Secret,
    project_id: String,
}

impl HttpCaptureBackend {
    pub fn new(api_url: &str, api_key: Secret, project_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            project_id,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, CaptureError> {
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            401 | 403 => CaptureError::Auth(format!("HTTP {}: {}", status, body)),
            429 => CaptureError::RateLimited { attempts: 1 },
            _ => CaptureError::Transient(format!("HTTP {}: {}", status, body)),
        })
    }
}

#[async_trait]
impl CaptureBackend for HttpCaptureBackend {
    async fn create_session(&self) -> Result<String, CaptureError> {
        let resp = self
            .client
            .post(format!("{}/sessions", self.api_url))
            .header("X-BB-API-Key", self.api_key.expose())
            .json(&serde_json::json!({ "projectId": self.project_id }))
            .send()
            .await
            .map_err(|e| CaptureError::Transient(e.to_string()))?;
        let session: SessionResponse = Self::check(resp)
            .await?
            .json()
            .await
            .map_err(|e| CaptureError::Transient(format!("Invalid session response: {}", e)))?;
        Ok(session.id)
    }

    async fn capture(&self, session_id: &str, url: &str) -> Result<CaptureArtifact, CaptureError> {
        let resp = self
            .client
            .get(format!("{}/sessions/{}", self.api_url, session_id))
            .header("X-BB-API-Key", self.api_key.expose())
            .send()
            .await
            .map_err(|e| CaptureError::Transient(e.to_string()))?;
        Self::check(resp).await?;
        Ok(CaptureArtifact {
            session_id: session_id.to_string(),
            target_url: url.to_string(),
            view_url: format!("https://www.browserbase.com/sessions/{}", session_id),
        })
    }

    async fn close_session(&self, session_id: &str) -> Result<(), CaptureError> {
        let resp = self
            .client
            .post(format!("{}/sessions/{}", self.api_url, session_id))
            .header("X-BB-API-Key", self.api_key.expose())
            .json(&serde_json::json!({
                "projectId": self.project_id,
                "status": "REQUEST_RELEASE",
            }))
            .send()
            .await
            .map_err(|e| CaptureError::Transient(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CaptureError> {
        let resp = self
            .client
            .get(format!("{}/projects/{}", self.api_url, self.project_id))
            .header("X-BB-API-Key", self.api_key.expose())
            .send()
            .await
            .map_err(|e| CaptureError::Transient(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }
}

pub struct CaptureClient {
    backend: Option<Arc<dyn CaptureBackend>>,
    sessions: Mutex<TtlCache<&'static str, String>>,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl CaptureClient {
    pub fn new(
        backend: Option<Arc<dyn CaptureBackend>>,
        freshness_window: Duration,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            sessions: Mutex::new(TtlCache::new(freshness_window)),
            policy,
            request_timeout,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        let backend: Option<Arc<dyn CaptureBackend>> = match (&config.api_key, &config.project_id) {
            (Some(key), Some(project)) if config.is_configured() => Some(Arc::new(
                HttpCaptureBackend::new(&config.api_url, key.clone(), project.clone()),
            )),
            _ => {
                tracing::warn!("Capture service not configured, visual evidence disabled");
                None
            }
        };
        Self::new(
            backend,
            Duration::from_secs(config.freshness_window_secs),
            config.retry_policy(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(300), RetryPolicy::default(), Duration::from_secs(60))
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    fn backend(&self) -> Result<&Arc<dyn CaptureBackend>, CaptureError> {
        self.backend.as_ref().ok_or(CaptureError::Disabled)
    }

    /// Return the shared session while it is inside the freshness window,
    /// otherwise replace it with a new one.
    pub async fn create_or_reuse_session(&self) -> Result<String, CaptureError> {
        let backend = self.backend()?.clone();
        let mut sessions = self.sessions.lock().await;
        if let Some(id) = sessions.get_fresh(&EVIDENCE_SESSION) {
            tracing::debug!(
                session_id = %id,
                age_secs = sessions.age(&EVIDENCE_SESSION).map(|a| a.as_secs()).unwrap_or(0),
                "Reusing capture session"
            );
            return Ok(id);
        }
        if let Some(stale) = sessions.invalidate(&EVIDENCE_SESSION) {
            if let Err(e) = backend.close_session(&stale).await {
                tracing::debug!(session_id = %stale, error = %e, "Failed to close stale capture session");
            }
        }

        let timeout = self.request_timeout;
        let (id, attempts) = retry(&self.policy, "capture.create_session", CaptureError::is_retryable, |_| {
            let backend = backend.clone();
            async move { bounded(timeout, backend.create_session()).await }
        })
        .await
        .map_err(exhausted)?;
        tracing::info!(session_id = %id, attempts, "Capture session created");
        sessions.insert(EVIDENCE_SESSION, id.clone());
        Ok(id)
    }

    /// Capture `url` in `session_id`, retrying rate limits and transient
    /// failures up to the policy ceiling.
    pub async fn capture(&self, session_id: &str, url: &str) -> Result<CaptureArtifact, CaptureError> {
        let backend = self.backend()?.clone();
        let timeout = self.request_timeout;
        let (artifact, attempts) = retry(&self.policy, "capture.capture", CaptureError::is_retryable, |_| {
            let backend = backend.clone();
            async move { bounded(timeout, backend.capture(session_id, url)).await }
        })
        .await
        .map_err(exhausted)?;
        if attempts > 1 {
            tracing::info!(url = %url, attempts, "Capture succeeded after retries");
        }
        Ok(artifact)
    }

    /// Capture `url` in the shared session. A session that keeps failing is
    /// dropped from the pool so the next call starts a fresh one.
    pub async fn capture_evidence(&self, url: &str) -> Result<CaptureArtifact, CaptureError> {
        let session = self.create_or_reuse_session().await?;
        match self.capture(&session, url).await {
            Ok(artifact) => Ok(artifact),
            Err(e) => {
                if matches!(e, CaptureError::Transient(_)) {
                    self.invalidate().await;
                }
                Err(e)
            }
        }
    }

    pub async fn invalidate(&self) {
        let stale = self.sessions.lock().await.invalidate(&EVIDENCE_SESSION);
        if let (Some(id), Ok(backend)) = (stale, self.backend()) {
            if let Err(e) = backend.close_session(&id).await {
                tracing::debug!(session_id = %id, error = %e, "Failed to close capture session");
            }
        }
    }

    /// Close every pooled session. Called once at process exit.
    pub async fn close_all(&self) {
        let Ok(backend) = self.backend() else {
            return;
        };
        let drained = self.sessions.lock().await.drain();
        for (_, id) in drained {
            match backend.close_session(&id).await {
                Ok(()) => tracing::info!(session_id = %id, "Capture session closed"),
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to close capture session"),
            }
        }
    }

    pub async fn pooled_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn ping(&self) -> Result<(), CaptureError> {
        let backend = self.backend()?;
        bounded(self.request_timeout, backend.ping()).await
    }
}

async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, CaptureError>
where
    F: std::future::Future<Output = Result<T, CaptureError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| Err(CaptureError::Transient(format!("request timed out after {:?}", timeout))))
}

fn exhausted(err: RetryError<CaptureError>) -> CaptureError {
    match err.error {
        CaptureError::RateLimited { .. } => CaptureError::RateLimited { attempts: err.attempts },
        CaptureError::Transient(m) if err.exhausted => {
            CaptureError::Transient(format!("{} (gave up after {} attempts)", m, err.attempts))
        }
        other => other,
    }
}
