//! Room metadata client. Maps a subject token address to the room record
//! that carries the creator's social handle. The endpoint is best-effort:
//! rooms appear some time after the creation trade, so a 404 is a normal
//! "not yet" answer rather than an error.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ApiError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct RoomResponse {
    room: Option<RoomInfo>,
}

/// Room record, reduced to the fields the sniper cares about.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub creator_handle: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RoomsClient {
    base_url: String,
    client: Client,
}

impl RoomsClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("Failed to create HTTP client for rooms API"),
        }
    }

    /// Fetch the room for a token address. `Ok(None)` means the room does
    /// not exist yet; transport and server failures map to `Unavailable`.
    pub async fn get_room(&self, token_address: &str) -> Result<Option<RoomInfo>, ApiError> {
        let url = format!("{}/rooms/{}", self.base_url, token_address);
        debug!("Fetching room metadata: {}", url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ApiError::Unavailable(format!("rooms request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            warn!("Rooms API returned {} for {}", status, token_address);
            return Err(ApiError::Unavailable(format!(
                "rooms API status {status}"
            )));
        }

        let data: RoomResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Malformed(format!("rooms response: {e}")))?;

        Ok(data.room)
    }
}
