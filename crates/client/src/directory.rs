//! User directory: display names for sender and receiver ids.
//!
//! Messages only carry user ids. Profiles are fetched on first use and
//! cached for the session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chatline_shared::{UserId, UserProfile};

use crate::api_client::MessageApi;
use crate::error::ChatError;

#[derive(Clone)]
pub struct UserDirectory {
    api: Arc<dyn MessageApi>,
    cache: Arc<Mutex<HashMap<UserId, UserProfile>>>,
}

impl UserDirectory {
    pub fn new(api: Arc<dyn MessageApi>) -> Self {
        Self {
            api,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<UserId, UserProfile>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cached(&self, id: &str) -> Option<UserProfile> {
        self.cache().get(id).cloned()
    }

    pub fn insert(&self, profile: UserProfile) {
        self.cache().insert(profile.id.clone(), profile);
    }

    pub fn invalidate(&self, id: &str) -> bool {
        self.cache().remove(id).is_some()
    }

    /// Cached profile, or fetch it from the backend.
    pub async fn profile(&self, id: &str) -> Result<UserProfile, ChatError> {
        if let Some(profile) = self.cached(id) {
            return Ok(profile);
        }
        let profile = self.api.get_user(id).await?;
        crate::log_debug!("Cached profile for {}", id);
        self.insert(profile.clone());
        Ok(profile)
    }

    /// Name to show for `id`. Falls back to the id itself when the profile
    /// cannot be loaded.
    pub async fn label(&self, id: &str) -> String {
        match self.profile(id).await {
            Ok(profile) => profile.label().to_string(),
            Err(e) => {
                crate::log_warn!("No profile for {}: {}", id, e);
                id.to_string()
            }
        }
    }
}
