use crate::{
    actors::{connection_manager::ConnectionManager, delivery_bus::DeliveryBus},
    blob::{BlobStore, LocalBlobStore},
    config::Config,
    error::ChatResult,
    ledger::VisibilityLedger,
    messages::MessageService,
    paginator::Paginator,
    registry::ConversationRegistry,
    store::{ChatStore, MemoryStore, PgStore},
    unread::UnreadTracker,
};

use std::sync::Arc;
use tracing::info;

pub struct AppState {
    pub config: Config,
    pub bus: DeliveryBus,
    pub connection_manager: Arc<ConnectionManager>,
    pub registry: ConversationRegistry,
    pub ledger: VisibilityLedger,
    pub unread: UnreadTracker,
    pub paginator: Paginator,
    pub messages: MessageService,
}

impl AppState {
    fn new(config: Config, store: Arc<dyn ChatStore>, blobs: Arc<dyn BlobStore>) -> Self {
        // Spawns the router actor
        let bus = DeliveryBus::spawn();
        let connection_manager = Arc::new(ConnectionManager::new(
            bus.clone(),
            config.session_buffer_size,
            config.delivery_send_timeout,
        ));

        Self {
            registry: ConversationRegistry::new(store.clone(), bus.clone()),
            ledger: VisibilityLedger::new(store.clone(), blobs.clone(), bus.clone()),
            unread: UnreadTracker::new(store.clone(), bus.clone()),
            paginator: Paginator::new(store.clone(), config.default_page_size),
            messages: MessageService::new(store, blobs, bus.clone(), config.max_files_per_message),
            connection_manager,
            bus,
            config,
        }
    }
}

pub struct AppStateBuilder {
    config: Config,
    store: Option<Arc<dyn ChatStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            store: None,
            blobs: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ChatStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Falls back to Postgres when `DATABASE_URL` is configured, otherwise to
    /// the in-memory store, and to local disk for blobs.
    pub async fn build(self) -> ChatResult<AppState> {
        let store: Arc<dyn ChatStore> = match self.store {
            Some(store) => store,
            None => match &self.config.database_url {
                Some(url) => {
                    info!("Using Postgres store");
                    Arc::new(PgStore::connect(url).await?)
                }
                None => {
                    info!("DATABASE_URL not set, using in-memory store");
                    Arc::new(MemoryStore::new())
                }
            },
        };

        let blobs: Arc<dyn BlobStore> = match self.blobs {
            Some(blobs) => blobs,
            None => Arc::new(LocalBlobStore::new(&self.config.storage_dir).await?),
        };

        Ok(AppState::new(self.config, store, blobs))
    }
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
