//! Profile persistence seam. The engine only needs settings load/save; the
//! backing document schema belongs to the embedding application.

use anyhow::Result;
use async_trait::async_trait;
use parla_core::settings::ConversationSettings;
use tokio::sync::RwLock;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load_settings(&self) -> Result<Option<ConversationSettings>>;
    async fn save_settings(&self, settings: &ConversationSettings) -> Result<()>;
}

/// In-memory profile store.
pub struct MemoryProfileStore {
    settings: RwLock<Option<ConversationSettings>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self {
            settings: RwLock::new(None),
        }
    }
}

impl Default for MemoryProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn load_settings(&self) -> Result<Option<ConversationSettings>> {
        Ok(self.settings.read().await.clone())
    }

    async fn save_settings(&self, settings: &ConversationSettings) -> Result<()> {
        *self.settings.write().await = Some(settings.clone());
        Ok(())
    }
}
