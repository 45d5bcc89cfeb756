//! Periodic `_service { sdl }` introspection of every subgraph.

use futures::future::join_all;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::composition::compose;
use crate::error::CompositionError;
use crate::graphql;
use crate::schema_registry::SchemaRegistry;
use crate::{GraphQLRequest, ServiceConfig};

pub const SERVICE_DEFINITION_QUERY: &str = "query __ApolloGetServiceDefinition__ { _service { sdl } }";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A new supergraph was composed and published with this version.
    Updated(u64),
    /// Every subgraph returned the SDL the current supergraph was built from.
    Unchanged(u64),
}

pub struct SchemaPoller {
    registry: Arc<dyn SchemaRegistry>,
    client: Client,
    interval: Duration,
}

impl SchemaPoller {
    pub fn new(registry: Arc<dyn SchemaRegistry>, client: Client, interval: Duration) -> Self {
        SchemaPoller {
            registry,
            client,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Runs one poll cycle. On any error the current supergraph stays as is.
    pub async fn poll(&self) -> Result<PollOutcome, CompositionError> {
        let services = self.registry.services().await;
        let results = join_all(services.iter().map(|service| self.fetch_sdl(service))).await;

        let mut subgraphs = Vec::with_capacity(services.len());
        for (service, sdl) in services.into_iter().zip(results) {
            subgraphs.push((service, sdl?));
        }

        if let Some(current) = self.registry.current_schema() {
            if current.is_composed_from(&subgraphs) {
                return Ok(PollOutcome::Unchanged(current.version()));
            }
        }

        let supergraph = compose(subgraphs)?;
        Ok(PollOutcome::Updated(self.registry.publish(supergraph).version()))
    }

    async fn fetch_sdl(&self, service: &ServiceConfig) -> Result<String, CompositionError> {
        let failed = |reason: String| CompositionError::Introspection {
            service: service.name.clone(),
            reason,
        };

        let response = self
            .client
            .post(&service.url)
            .json(&GraphQLRequest::new(SERVICE_DEFINITION_QUERY))
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("unexpected status {}", response.status())));
        }
        let body: graphql::Response = response.json().await.map_err(|e| failed(e.to_string()))?;
        if let Some(error) = body.errors.first() {
            return Err(failed(error.message.clone()));
        }
        body.data
            .as_ref()
            .and_then(|data| data.pointer("/_service/sdl"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| failed("response did not contain _service.sdl".to_owned()))
    }

    /// Polls immediately, then every interval, until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = token.cancelled() => break,
                outcome = self.poll().instrument(tracing::debug_span!("schema_poll")) => match outcome {
                    Ok(PollOutcome::Updated(version)) => tracing::info!(version, "supergraph updated"),
                    Ok(PollOutcome::Unchanged(version)) => tracing::debug!(version, "supergraph unchanged"),
                    Err(error) => tracing::warn!(%error, "schema poll failed, keeping the current supergraph"),
                }
            }
        }
        tracing::debug!("schema poller stopped");
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}
