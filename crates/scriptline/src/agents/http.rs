use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::config::AgentConfig;
use crate::pipeline::stage::StageId;

use super::{AgentError, AgentRequest, AgentResponse, ContentAgent};

/// Posts each stage request as JSON to `{endpoint}/stages/{slug}`.
pub struct HttpContentAgent {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpContentAgent {
    pub fn new(config: &AgentConfig, api_key: Option<SecretString>) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn stage_url(&self, stage: StageId) -> String {
        format!("{}/stages/{}", self.endpoint, stage.slug())
    }
}

impl std::fmt::Debug for HttpContentAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpContentAgent")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

fn map_send_error(e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout
    } else {
        AgentError::Transport(e.to_string())
    }
}

#[async_trait]
impl ContentAgent for HttpContentAgent {
    async fn run(&self, stage: StageId, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        let url = self.stage_url(stage);
        debug!(stage = stage.slug(), item_id = %request.item_id, "sending stage request");

        let mut req = self.http.post(&url).json(request);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let response = req.send().await.map_err(map_send_error)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(AgentError::Unauthorized(body));
            }
            return Err(AgentError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: AgentResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout
            } else {
                AgentError::InvalidResponse(format!("failed to parse response: {e}"))
            }
        })?;

        debug!(
            stage = stage.slug(),
            cost_cents = parsed.cost_cents,
            "stage response received"
        );
        Ok(parsed)
    }
}
