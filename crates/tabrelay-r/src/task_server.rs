use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tabrelay_common::task::{
    FetchRequest, FetchResponse, LoginRequest, LoginResponse, NodeIdentity, ReplyRequest,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TaskServerError {
    #[error("Credential rejected (HTTP {0})")]
    AuthExpired(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Task server answered HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode task server response: {0}")]
    Decode(String),
}

impl TaskServerError {
    /// Any non-2xx answer invalidates the cached credential.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            TaskServerError::AuthExpired(_) | TaskServerError::Status { .. }
        )
    }
}

/// The remote service that hands out work and collects outcomes.
#[async_trait]
pub trait TaskServer: Send + Sync {
    async fn login(&self, identity: &NodeIdentity) -> Result<String, TaskServerError>;

    async fn fetch(
        &self,
        token: &str,
        request: &FetchRequest,
    ) -> Result<FetchResponse, TaskServerError>;

    async fn reply_instructions(
        &self,
        token: &str,
        request: &ReplyRequest,
    ) -> Result<(), TaskServerError>;

    async fn reply_task(&self, token: &str, request: &ReplyRequest) -> Result<(), TaskServerError>;
}

pub struct HttpTaskServer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTaskServer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TaskServerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        token: Option<&str>,
        body: &B,
    ) -> Result<reqwest::Response, TaskServerError> {
        let mut request = self.client.post(self.url(path)).json(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        debug!("POST {}", path);
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let code = status.as_u16();
        if code == 401 || code == 403 {
            return Err(TaskServerError::AuthExpired(code));
        }
        let body = response.text().await.unwrap_or_default();
        Err(TaskServerError::Status { status: code, body })
    }

    async fn post_json<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        token: Option<&str>,
        body: &B,
    ) -> Result<R, TaskServerError> {
        let response = self.post(path, token, body).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| TaskServerError::Decode(e.to_string()))
    }
}

#[async_trait]
impl TaskServer for HttpTaskServer {
    async fn login(&self, identity: &NodeIdentity) -> Result<String, TaskServerError> {
        let request = LoginRequest {
            identity: identity.public(),
        };
        let response: LoginResponse = self.post_json("/auth/login", None, &request).await?;
        Ok(response.token)
    }

    async fn fetch(
        &self,
        token: &str,
        request: &FetchRequest,
    ) -> Result<FetchResponse, TaskServerError> {
        self.post_json("/instructions/list", Some(token), request)
            .await
    }

    async fn reply_instructions(
        &self,
        token: &str,
        request: &ReplyRequest,
    ) -> Result<(), TaskServerError> {
        self.post("/instructions/reply", Some(token), request)
            .await
            .map(|_| ())
    }

    async fn reply_task(&self, token: &str, request: &ReplyRequest) -> Result<(), TaskServerError> {
        self.post("/tasks/reply", Some(token), request)
            .await
            .map(|_| ())
    }
}
