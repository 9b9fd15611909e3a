mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{registry::TemplateRegistry, workflow::WorkflowEngine};

pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub registry: Arc<TemplateRegistry>,
}

pub struct Server {
    engine: Arc<WorkflowEngine>,
    registry: Arc<TemplateRegistry>,
}

impl Server {
    pub fn new(engine: Arc<WorkflowEngine>, registry: Arc<TemplateRegistry>) -> Self {
        Self { engine, registry }
    }

    pub fn build_router(self) -> Router {
        let state = Arc::new(AppState {
            engine: self.engine,
            registry: self.registry,
        });

        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/templates", post(routes::register_template))
            .route("/templates/{name}", get(routes::get_template))
            .route("/workflows", post(routes::create_workflow))
            .route("/workflows", get(routes::list_workflows))
            .route("/workflows/{id}", get(routes::get_workflow))
            .route("/workflows/{id}/cancel", post(routes::cancel_workflow))
            .route("/workflows/{id}/exceptions", get(routes::list_exceptions))
            .route("/steps/{id}/complete", post(routes::complete_step))
            .route("/exceptions", post(routes::raise_exception))
            .route("/exceptions/{id}/resolve", post(routes::resolve_exception))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub async fn start(self, addr: &str) -> crate::Result<()> {
        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on {}", addr);
        axum::serve(listener, router)
            .await
            .map_err(crate::Error::Io)?;
        Ok(())
    }
}
