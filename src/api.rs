//! REST client for the messaging backend
//!
//! Requests go to a fixed base URL with a request timeout. Every request
//! carries `Authorization: Bearer <token>`: the public token for the
//! configured public path prefixes, the private token for everything else.

use crate::config::ApiSection;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub public_token: Option<String>,
    pub private_token: Option<String>,
    pub public_paths: Vec<String>,
}

impl ApiClientConfig {
    /// Resolve tokens from the environment variables named in `section`
    pub fn from_section(section: &ApiSection) -> Self {
        let read = |name: &Option<String>| name.as_ref().and_then(|var| std::env::var(var).ok());
        Self {
            base_url: section.base_url.clone(),
            timeout: Duration::from_millis(section.timeout_ms),
            public_token: read(&section.public_token_env),
            private_token: read(&section.private_token_env),
            public_paths: section.public_paths.clone(),
        }
    }
}

pub struct ApiClient {
    base_url: Url,
    public_token: Option<String>,
    private_token: Option<String>,
    public_paths: Vec<String>,
    client: Client,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> Result<Self, ApiError> {
        // a trailing slash keeps the base path when joining relative paths
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|_| ApiError::InvalidUrl(config.base_url))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Http(e.to_string()))?;

        Ok(Self {
            base_url,
            public_token: config.public_token,
            private_token: config.private_token,
            public_paths: config.public_paths,
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Token sent with a request to `path`
    pub fn token_for(&self, path: &str) -> Option<&str> {
        let path = path.trim_start_matches('/');
        let public = self
            .public_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.trim_start_matches('/')));

        if public {
            self.public_token.as_deref()
        } else {
            self.private_token.as_deref()
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(Method::GET, path, None::<&Value>).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::PUT, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(Method::DELETE, path, None::<&Value>).await
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|_| ApiError::InvalidUrl(path.to_string()))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let request = self.client.request(method, self.url(path)?);
        Ok(match self.token_for(path) {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(method = %method, path = %path, "API request");
        let mut request = self.request(method, path)?;
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(path = %path, status = status.as_u16(), "API request failed");
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;
        let decoded = if bytes.is_empty() {
            serde_json::from_value(Value::Null)
        } else {
            serde_json::from_slice(&bytes)
        };
        decoded.map_err(|e| ApiError::Decode(e.to_string()))
    }
}
