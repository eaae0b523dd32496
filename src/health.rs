//! Client for the proxy's `/_claude_proxy/health` endpoint.

use std::time::Duration;

use serde::Deserialize;

use crate::error::HealthError;
use crate::proxy::HEALTH_PATH;

pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    ok: bool,
    #[serde(default)]
    instance_id: String,
}

#[derive(Clone, Debug)]
pub struct HealthClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl Default for HealthClient {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_TIMEOUT)
    }
}

impl HealthClient {
    /// Build a client that never goes through `HTTP(S)_PROXY`; the
    /// endpoint is on loopback.
    pub fn try_new(timeout: Duration) -> Result<Self, HealthError> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|err| HealthError::Transport(format!("cannot build health client: {err}")))?;
        Ok(Self { http, timeout })
    }

    /// Like [`HealthClient::try_new`]. If the client cannot be built, falls
    /// back to reqwest's default client and logs that proxy bypass is lost.
    pub fn new(timeout: Duration) -> Self {
        match Self::try_new(timeout) {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(
                    target = "claude_proxy::health",
                    error = %err,
                    "falling back to default HTTP client; proxy env may apply to health checks"
                );
                Self {
                    http: reqwest::Client::new(),
                    timeout,
                }
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Succeeds iff the endpoint answers 200 with `{"ok":true,"instanceId":<expected>}`.
    pub async fn check_http_proxy(&self, port: u16, expected_instance_id: &str) -> Result<(), HealthError> {
        let url = format!("http://127.0.0.1:{port}{HEALTH_PATH}");
        let response = self.http.get(&url).send().await.map_err(|err| self.classify(err))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(HealthError::HttpStatus(status.as_u16()));
        }

        let bytes = response.bytes().await.map_err(|err| self.classify(err))?;
        let body: HealthBody = serde_json::from_slice(&bytes)
            .map_err(|err| HealthError::BodyMismatch(format!("invalid JSON: {err}")))?;
        if !body.ok {
            return Err(HealthError::BodyMismatch("ok=false".into()));
        }
        if body.instance_id != expected_instance_id {
            return Err(HealthError::BodyMismatch(format!(
                "instance id {:?}, expected {:?}",
                body.instance_id, expected_instance_id
            )));
        }
        Ok(())
    }

    fn classify(&self, err: reqwest::Error) -> HealthError {
        if err.is_timeout() {
            HealthError::Timeout(self.timeout)
        } else {
            HealthError::Transport(err.to_string())
        }
    }
}
