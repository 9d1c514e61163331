//! Execution backend client.
//!
//! The agent runtime is reached over HTTP: open a session, post one message,
//! read the assistant's text parts, delete the session. The session is torn
//! down on every path once its id is known, including timeouts and transport
//! errors.
//!
//! A create request that times out is abandoned without teardown. If the
//! runtime created the session anyway, its id never reaches us and the session
//! is left for the runtime to expire.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};

use crate::config::{AgentProfile, AgentRole, BackendConfig};
use crate::{rlog_debug, rlog_warn, Error, Result};

/// Something that can run a prompt for a role and return raw output.
///
/// Output is untrusted free text; callers parse it.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn send(
        &self,
        prompt: &str,
        role: AgentRole,
        directory: &Path,
        timeout: Duration,
    ) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    title: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    id: String,
}

#[derive(Debug, Serialize)]
struct ModelSelection<'a> {
    #[serde(rename = "providerID")]
    provider_id: &'a str,
    #[serde(rename = "modelID")]
    model_id: &'a str,
}

#[derive(Debug, Serialize)]
struct TextPartInput<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    agent: &'a str,
    model: ModelSelection<'a>,
    parts: Vec<TextPartInput<'a>>,
}

#[derive(Debug, Deserialize)]
struct MessagePart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    parts: Vec<MessagePart>,
}

impl MessageResponse {
    /// Concatenate the text parts, skipping tool calls and reasoning.
    fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|part| part.kind == "text")
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// HTTP client for the agent runtime.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    implementer: AgentProfile,
    reviewer: AgentProfile,
    teardown_timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::AgentTransport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            implementer: config.implementer.clone(),
            reviewer: config.reviewer.clone(),
            teardown_timeout: config.teardown_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn profile(&self, role: AgentRole) -> &AgentProfile {
        match role {
            AgentRole::Implementer => &self.implementer,
            AgentRole::Reviewer => &self.reviewer,
        }
    }

    async fn create_session(&self, role: AgentRole, directory: &Path) -> Result<String> {
        let url = format!("{}/session", self.base_url);
        let title = format!("ralph {}", role);
        let dir = directory.to_string_lossy().into_owned();
        let response = self
            .client
            .post(&url)
            .query(&[("directory", dir.as_str())])
            .json(&CreateSessionRequest { title: &title })
            .send()
            .await
            .map_err(transport)?;
        let response = check_status(response, &url)?;
        let session: SessionInfo = response.json().await.map_err(transport)?;
        Ok(session.id)
    }

    async fn post_message(
        &self,
        session_id: &str,
        prompt: &str,
        role: AgentRole,
        directory: &Path,
    ) -> Result<String> {
        let url = format!("{}/session/{}/message", self.base_url, session_id);
        let profile = self.profile(role);
        let dir = directory.to_string_lossy().into_owned();
        let body = MessageRequest {
            agent: &profile.agent,
            model: ModelSelection {
                provider_id: &profile.model.provider_id,
                model_id: &profile.model.model_id,
            },
            parts: vec![TextPartInput {
                kind: "text",
                text: prompt,
            }],
        };
        let response = self
            .client
            .post(&url)
            .query(&[("directory", dir.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let response = check_status(response, &url)?;
        let message: MessageResponse = response.json().await.map_err(transport)?;
        Ok(message.text())
    }

    /// Delete a session. Failures are logged, never returned.
    async fn delete_session(&self, session_id: &str) {
        let url = format!("{}/session/{}", self.base_url, session_id);
        let request = self.client.delete(&url).send();
        match tokio::time::timeout(self.teardown_timeout, request).await {
            Ok(Ok(response)) if response.status().is_success() => {
                rlog_debug!("Session {} deleted", session_id);
            }
            Ok(Ok(response)) => {
                rlog_warn!("Session {} teardown returned {}", session_id, response.status());
            }
            Ok(Err(e)) => rlog_warn!("Session {} teardown failed: {}", session_id, e),
            Err(_) => rlog_warn!(
                "Session {} teardown timed out after {:?}",
                session_id,
                self.teardown_timeout
            ),
        }
    }
}

#[async_trait]
impl AgentBackend for HttpBackend {
    async fn send(
        &self,
        prompt: &str,
        role: AgentRole,
        directory: &Path,
        timeout: Duration,
    ) -> Result<String> {
        let deadline = Instant::now() + timeout;
        rlog_debug!(
            "Backend send role={} dir={} prompt_len={}",
            role,
            directory.display(),
            prompt.len()
        );

        // No id yet, so a timeout here has nothing to delete.
        let session_id = match timeout_at(deadline, self.create_session(role, directory)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::AgentTimeout(timeout)),
        };

        let result = match timeout_at(
            deadline,
            self.post_message(&session_id, prompt, role, directory),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::AgentTimeout(timeout)),
        };

        self.delete_session(&session_id).await;
        result
    }
}

fn transport(e: reqwest::Error) -> Error {
    Error::AgentTransport(e.to_string())
}

fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::AgentTransport(format!("{} returned {}", url, status)))
    }
}
