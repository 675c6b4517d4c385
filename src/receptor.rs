// Orchestrator (receptor) API: actual LRP records and the read client.

use crate::prelude::*;
use async_trait::async_trait;
use url::Url;

/// Domain application LRPs are desired in. Crashes outside it are not
/// reported.
pub const APP_LRP_DOMAIN: &str = "cf-apps";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActualLrp {
    pub process_guid: String,
    pub instance_guid: String,
    pub cell_id: String,
    pub domain: String,
    pub index: i32,
    pub state: String,
    pub crash_count: i32,
    pub crash_reason: String,
    /// Nanoseconds since the unix epoch of the last state change.
    pub since: i64,
}

#[async_trait]
pub trait LrpReader: Send + Sync + std::fmt::Debug {
    async fn actual_lrps_by_process_guid(&self, process_guid: &str) -> Result<Vec<ActualLrp>>;
}

#[derive(Debug, Clone)]
pub struct ReceptorClient {
    client: reqwest::Client,
    base_url: Url,
}

impl ReceptorClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Appends `segments` to the base URL's path, percent-encoding each one.
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("receptor URL {} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl LrpReader for ReceptorClient {
    async fn actual_lrps_by_process_guid(&self, process_guid: &str) -> Result<Vec<ActualLrp>> {
        let url = self.endpoint(&["v1", "actual_lrps", process_guid])?;
        let lrps = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?
            .json::<Vec<ActualLrp>>()
            .await
            .with_context(|| format!("decoding actual LRPs from {url}"))?;
        Ok(lrps)
    }
}
