//! Social profile client: handle -> follower count + verification flag.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::ApiError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The reputation signals the admission policy runs on.
#[derive(Debug, Clone, Copy)]
pub struct SocialProfile {
    pub followers: u64,
    pub verified: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserResponse {
    followers_count: u64,
    #[serde(default)]
    verified: bool,
}

#[derive(Debug, Clone)]
pub struct SocialClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl SocialClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("Failed to create HTTP client for social API"),
        }
    }

    pub async fn get_profile(&self, handle: &str) -> Result<SocialProfile, ApiError> {
        let url = format!("{}/users/{}", self.base_url, handle);
        debug!("Fetching social profile: {}", url);

        let mut request = self.client.get(&url).header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Unavailable(format!("social request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Unavailable(format!(
                "social API status {status} for @{handle}"
            )));
        }

        let user: UserResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Malformed(format!("social response: {e}")))?;

        Ok(SocialProfile {
            followers: user.followers_count,
            verified: user.verified,
        })
    }
}
