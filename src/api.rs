//! Client for the VM registry/telemetry service.

use crate::state::VmRecord;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("сервис недоступен: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("сервис вернул {status}")]
    Status {
        status: u16,
        message: Option<String>,
    },
    #[error("некорректный ответ сервиса: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// Server-provided `error` text, if the failed response carried one.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ApiError::Status {
                message: Some(m), ..
            } if !m.trim().is_empty() => Some(m.as_str()),
            _ => None,
        }
    }
}

/// One-time install command and the URL that reports its token status.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupData {
    pub command: String,
    pub polling_link: String,
}

/// Token status decoded from the polling endpoint's integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Installed,
    Expired,
    Invalid,
}

impl PollStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => PollStatus::Installed,
            -2 => PollStatus::Expired,
            c if c < 0 => PollStatus::Invalid,
            _ => PollStatus::Pending,
        }
    }

    /// Anything that is not a whole number means the agent has not reported
    /// yet. `1.0` and `1` are the same code.
    pub fn from_body(body: &serde_json::Value) -> Self {
        if let Some(code) = body.as_i64() {
            return Self::from_code(code);
        }
        body.as_f64()
            .filter(|f| f.is_finite() && f.fract() == 0.0)
            .map_or(PollStatus::Pending, |f| Self::from_code(f as i64))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Pending => "pending",
            PollStatus::Installed => "installed",
            PollStatus::Expired => "expired",
            PollStatus::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateVmRequest<'a> {
    #[serde(rename = "vmName")]
    vm_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[async_trait]
pub trait VmApi: Send + Sync {
    async fn list_vms(&self) -> Result<Vec<VmRecord>, ApiError>;
    async fn get_vm(&self, vm_id: &str, limit: usize) -> Result<VmRecord, ApiError>;
    async fn create_vm(&self, vm_name: &str) -> Result<SetupData, ApiError>;
    async fn poll_token(&self, polling_link: &str) -> Result<PollStatus, ApiError>;
}

#[derive(Clone)]
pub struct HttpVmApi {
    client: Client,
    base_url: String,
}

impl HttpVmApi {
    pub fn new(base_url: impl Into<String>, user_agent: &str) -> Self {
        let client = Client::builder()
            .user_agent(user_agent.to_string())
            .build()
            .unwrap_or_else(|err| {
                warn!(error = %err, user_agent, "не удалось собрать HTTP-клиент, используем настройки по умолчанию");
                Client::new()
            });
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn error_for_status(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp
            .bytes()
            .await
            .ok()
            .and_then(|b| serde_json::from_slice::<ErrorBody>(&b).ok())
            .and_then(|b| b.error);
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ApiError> {
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl VmApi for HttpVmApi {
    async fn list_vms(&self) -> Result<Vec<VmRecord>, ApiError> {
        let resp = self
            .client
            .get(format!("{}/vm", self.base_url))
            .send()
            .await?;
        Self::decode(Self::error_for_status(resp).await?).await
    }

    async fn get_vm(&self, vm_id: &str, limit: usize) -> Result<VmRecord, ApiError> {
        let resp = self
            .client
            .get(format!("{}/vm/{}", self.base_url, vm_id))
            .query(&[("limit", limit)])
            .send()
            .await?;
        Self::decode(Self::error_for_status(resp).await?).await
    }

    async fn create_vm(&self, vm_name: &str) -> Result<SetupData, ApiError> {
        let resp = self
            .client
            .post(format!("{}/vm/create", self.base_url))
            .json(&CreateVmRequest { vm_name })
            .send()
            .await?;
        Self::decode(Self::error_for_status(resp).await?).await
    }

    async fn poll_token(&self, polling_link: &str) -> Result<PollStatus, ApiError> {
        let resp = self.client.get(polling_link).send().await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(PollStatus::Pending);
        }
        let body: serde_json::Value = Self::decode(resp).await?;
        Ok(PollStatus::from_body(&body))
    }
}

/// A real `reqwest` transport error for exercising failure paths.
#[cfg(test)]
pub(crate) fn transport_error() -> ApiError {
    let err = reqwest::Client::new()
        .get("not a url")
        .build()
        .expect_err("некорректный URL");
    ApiError::Unreachable(err)
}
