pub mod rooms;
pub mod social;

use async_trait::async_trait;

use crate::error::ApiError;

pub use rooms::RoomsClient;
pub use social::{SocialClient, SocialProfile};

/// Resolves the reputation signals for a token: first the room's creator
/// handle, then the social profile behind it. Both lookups treat timeouts
/// and non-success responses as "unavailable", never as fatal.
#[async_trait]
pub trait ReputationEvaluator: Send + Sync {
    /// Creator social handle for the room bound to this token address, if
    /// the room exists and has one.
    async fn creator_handle(&self, token_address: &str) -> Result<Option<String>, ApiError>;

    /// Follower count and verification flag for a handle.
    async fn profile(&self, handle: &str) -> Result<SocialProfile, ApiError>;
}

/// Production evaluator composing the two HTTP clients.
pub struct HttpReputationEvaluator {
    rooms: RoomsClient,
    social: SocialClient,
}

impl HttpReputationEvaluator {
    pub fn new(rooms: RoomsClient, social: SocialClient) -> Self {
        Self { rooms, social }
    }
}

#[async_trait]
impl ReputationEvaluator for HttpReputationEvaluator {
    async fn creator_handle(&self, token_address: &str) -> Result<Option<String>, ApiError> {
        Ok(self
            .rooms
            .get_room(token_address)
            .await?
            .and_then(|room| room.creator_handle))
    }

    async fn profile(&self, handle: &str) -> Result<SocialProfile, ApiError> {
        self.social.get_profile(handle).await
    }
}
