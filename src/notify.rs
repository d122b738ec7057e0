//! Fire-and-forget admission notifications. Delivery happens on a spawned
//! task; failures are logged and never reach the buy path.

use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::Candidate;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Notifier {
    webhook_url: String,
    client: Client,
}

impl Notifier {
    pub fn new(webhook_url: &str) -> Self {
        Self {
            webhook_url: webhook_url.to_string(),
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("Failed to create HTTP client for notifications"),
        }
    }

    /// Push an admission message. Returns immediately; the POST runs in the
    /// background and its outcome only shows up in the logs.
    pub fn notify_admission(&self, candidate: &Candidate, followers: u64, verified: bool) {
        let client = self.client.clone();
        let url = self.webhook_url.clone();
        let payload = json!({
            "event": "admission",
            "token": candidate.address_checksum,
            "creatorHandle": candidate.creator_handle,
            "followerCount": followers,
            "isVerified": verified,
            "curveIndex": candidate.curve_index,
            "text": format!(
                "🎯 Admitted {} (@{}): {} followers, verified: {}",
                candidate.address_checksum,
                candidate.creator_handle.as_deref().unwrap_or("unknown"),
                followers,
                verified
            ),
        });

        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Admission notification delivered");
                }
                Ok(response) => {
                    warn!("Admission notification rejected: {}", response.status());
                }
                Err(e) => {
                    warn!("Admission notification failed: {}", e);
                }
            }
        });
    }
}
