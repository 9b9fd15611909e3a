use std::sync::Arc;
use tracing::info;

use onboard_orchestrator::{
    config::Config,
    integration::{HttpIntegrationProvider, ProviderRegistry},
    metrics,
    registry::TemplateRegistry,
    server::Server,
    store::{create_store, IntegrationKind},
    workflow::{InMemoryDirectory, WorkflowEngine},
    Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::load()?;
    info!("Loaded configuration: {:?}", config);

    // Initialize store
    let store = create_store(&config.database).await?;
    store.init().await?;

    // Register workflow templates
    let registry = Arc::new(TemplateRegistry::new());
    if let Some(dir) = &config.templates.dir {
        let loaded = registry.load_dir(dir)?;
        info!("Loaded {} workflow templates from {}", loaded, dir.display());
    }

    // Wire integration providers
    let mut providers = ProviderRegistry::new();
    if let Some(base_url) = &config.invoker.provider_base_url {
        let client = reqwest::Client::new();
        for kind in [IntegrationKind::Esignature, IntegrationKind::Document] {
            providers.register(
                kind,
                Arc::new(HttpIntegrationProvider::new(
                    client.clone(),
                    base_url.clone(),
                    kind,
                )),
            );
        }
    }

    // The surrounding HR application supplies employee context; the bundled
    // directory starts empty and is populated through the library API.
    let directory = Arc::new(InMemoryDirectory::new());

    // Initialize engine
    let engine = WorkflowEngine::new(
        store,
        registry.clone(),
        directory,
        providers,
        config.invoker.settings(),
    );
    engine.start();

    metrics::register_metrics();

    // Start server
    info!("Starting server on {}", config.server.addr);
    let server = Server::new(engine, registry);
    server.start(&config.server.addr).await?;

    Ok(())
}
