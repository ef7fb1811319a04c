//! Shared application state.

use std::sync::Arc;

use crate::backend::BackendManager;
use crate::config::Config;
use crate::error::Result;
use crate::models::download::HubClient;
use crate::models::ModelManager;
use crate::orchestrator::Orchestrator;
use crate::transfers::TransferRegistry;

/// Shared state passed to all handlers. Owned values, constructed once at
/// server start and torn down in reverse order.
pub struct AppState {
    pub config: Config,
    pub backends: Arc<BackendManager>,
    pub models: Arc<ModelManager>,
    pub transfers: Arc<TransferRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_hub(config, HubClient::new())
    }

    /// Hub override for tests.
    pub fn with_hub(config: Config, hub: HubClient) -> Result<Self> {
        let backends = Arc::new(BackendManager::new(&config)?);
        let models = Arc::new(ModelManager::new(
            config.models_dir(),
            config.user_models_path(),
        )?);
        let transfers = Arc::new(TransferRegistry::new());
        let orchestrator = Arc::new(Orchestrator::with_hub(
            config.clone(),
            backends.clone(),
            models.clone(),
            transfers.clone(),
            hub,
        ));

        Ok(Self {
            config,
            backends,
            models,
            transfers,
            orchestrator,
        })
    }
}
