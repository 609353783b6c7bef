use std::collections::HashMap;

use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::error::{is_auth_status, FetchError};
use crate::session::Session;
use crate::types::{DeviceStats, Sample};

/// One-shot bulk reads of recorded telemetry. Holds no cache; the sample
/// store is the only place fetched data is kept.
#[derive(Clone)]
pub struct HistoryLoader {
    client: Client,
    api_url: String,
    session: Session,
}

impl HistoryLoader {
    pub fn new(client: Client, api_url: &str, session: Session) -> Self {
        HistoryLoader {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    pub fn with_session(&self, session: Session) -> Self {
        HistoryLoader {
            client: self.client.clone(),
            api_url: self.api_url.clone(),
            session,
        }
    }

    /// Up to `limit` recent samples of one device, in whatever order the
    /// backend returns them.
    pub async fn fetch_device_history(&self, device_id: &str, limit: usize) -> Result<Vec<Sample>, FetchError> {
        let url = format!("{}/devices/{}/telemetry?limit={}", self.api_url, device_id, limit);
        let samples: Vec<Sample> = self.get_json(&url).await?;

        log::info!("Fetched {} history samples for device {}.", samples.len(), device_id);
        Ok(samples
            .into_iter()
            .map(|sample| sample.for_device(device_id))
            .collect())
    }

    /// Latest sample of every device in a farm that has reported at least once.
    pub async fn fetch_farm_latest(&self, farm_id: &str) -> Result<HashMap<String, Sample>, FetchError> {
        let url = format!("{}/farms/{}/telemetry/latest", self.api_url, farm_id);
        let samples: Vec<Sample> = self.get_json(&url).await?;

        let mut latest = HashMap::with_capacity(samples.len());
        for sample in samples {
            if sample.device_id.is_empty() {
                log::warn!("Skipping latest telemetry record without device_id in farm {}.", farm_id);
                continue;
            }
            latest.insert(sample.device_id.clone(), sample);
        }

        log::info!("Fetched latest telemetry for {} devices in farm {}.", latest.len(), farm_id);
        Ok(latest)
    }

    pub async fn fetch_device_stats(&self, device_id: &str) -> Result<DeviceStats, FetchError> {
        let url = format!("{}/devices/{}/stats", self.api_url, device_id);
        self.get_json(&url).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(self.session.token())
            .send()
            .await?;

        let status = response.status();
        if is_auth_status(status) {
            return Err(FetchError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(FetchError::Decode)
    }
}
