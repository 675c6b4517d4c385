//! Crash notifications to the cloud controller.

use crate::prelude::*;
use async_trait::async_trait;
use coord::message::AppCrashedRequest;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("controller answered {0}")]
    Status(reqwest::StatusCode),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("controller URL {0} cannot carry a path")]
    BaseUrl(Url),
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Where detected crashes go. One call per crash; no retries.
#[async_trait]
pub trait CrashSink: Send + Sync + std::fmt::Debug {
    async fn app_crashed(&self, event: &InstanceCrashEvent) -> Result<(), ForwardError>;
}

#[derive(Debug, Clone)]
pub struct CrashForwarder {
    client: reqwest::Client,
    base_url: Url,
    credentials: Option<Credentials>,
}

impl CrashForwarder {
    pub fn new(base_url: Url, credentials: Option<Credentials>, timeout: Duration) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    /// `<base>/internal/apps/<process_guid>/crashed`, with the guid escaped
    /// as a single path segment.
    pub fn crashed_url(&self, process_guid: &str) -> Result<Url, ForwardError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ForwardError::BaseUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["internal", "apps", process_guid, "crashed"]);
        Ok(url)
    }
}

#[async_trait]
impl CrashSink for CrashForwarder {
    async fn app_crashed(&self, event: &InstanceCrashEvent) -> Result<(), ForwardError> {
        let url = self.crashed_url(&event.process_guid)?;
        let mut request = self.client.post(url).json(&AppCrashedRequest::from(event));
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Status(status));
        }

        debug!(process_guid = %event.process_guid, status = %status, "forwarder.delivered");
        Ok(())
    }
}
