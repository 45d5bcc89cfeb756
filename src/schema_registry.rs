use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::ServiceConfig;
use crate::supergraph::Supergraph;

/// Holds the configured subgraphs and the current supergraph snapshot.
///
/// Readers take an `Arc` to the snapshot and keep using it for the whole
/// request, even if a newer one is published meanwhile.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Adds a subgraph, or replaces the one with the same name in place.
    async fn register_service(&self, service: ServiceConfig);
    async fn services(&self) -> Vec<ServiceConfig>;
    fn current_schema(&self) -> Option<Arc<Supergraph>>;
    /// Stamps the next version on `schema` and makes it current.
    fn publish(&self, schema: Supergraph) -> Arc<Supergraph>;
}

#[derive(Default)]
pub struct InMemorySchemaRegistry {
    services: RwLock<Vec<ServiceConfig>>,
    current: ArcSwapOption<Supergraph>,
    version: AtomicU64,
}

impl InMemorySchemaRegistry {
    pub fn new(services: Vec<ServiceConfig>) -> Self {
        InMemorySchemaRegistry {
            services: RwLock::new(services),
            current: ArcSwapOption::empty(),
            version: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn register_service(&self, service: ServiceConfig) {
        let mut services = self.services.write().await;
        match services.iter_mut().find(|existing| existing.name == service.name) {
            Some(existing) => *existing = service,
            None => services.push(service),
        }
    }

    async fn services(&self) -> Vec<ServiceConfig> {
        self.services.read().await.clone()
    }

    fn current_schema(&self) -> Option<Arc<Supergraph>> {
        self.current.load_full()
    }

    fn publish(&self, mut schema: Supergraph) -> Arc<Supergraph> {
        schema.version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let schema = Arc::new(schema);
        self.current.store(Some(Arc::clone(&schema)));
        tracing::info!(version = schema.version, services = schema.services.len(), "published supergraph");
        schema
    }
}
