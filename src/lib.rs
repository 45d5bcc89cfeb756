pub mod composition;
pub mod config;
pub mod error;
pub mod federation_gateway;
pub mod graphql;
pub mod json_ext;
pub mod operation;
pub mod query_executor;
pub mod query_plan;
pub mod query_planner;
mod response_shape;
pub mod schema_poller;
pub mod schema_registry;
pub mod server;
pub mod subscription_bridge;
pub mod supergraph;
mod websocket;

#[cfg(test)]
mod test_fixtures;

pub use config::GatewayConfig;
pub use federation_gateway::FederationGateway;
pub use query_executor::HttpQueryExecutor;
pub use query_planner::FederatedQueryPlanner;
pub use schema_poller::SchemaPoller;
pub use schema_registry::InMemorySchemaRegistry;
pub use subscription_bridge::{SubscriptionBridge, WebSocketProtocol};
pub use supergraph::Supergraph;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One configured subgraph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub ws_protocol: WebSocketProtocol,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        ServiceConfig {
            name: name.into(),
            url: url.into(),
            ws_url: None,
            ws_protocol: WebSocketProtocol::default(),
        }
    }

    pub fn with_subscriptions(
        mut self,
        ws_url: impl Into<String>,
        protocol: WebSocketProtocol,
    ) -> Self {
        self.ws_url = Some(ws_url.into());
        self.ws_protocol = protocol;
        self
    }
}

/// A GraphQL-over-HTTP request body, used both for client requests and for
/// the sub-requests sent to subgraphs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(
        default,
        rename = "operationName",
        alias = "operation_name",
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
    #[serde(skip)]
    pub auth_headers: Option<HashMap<String, String>>,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        GraphQLRequest {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_operation_name(mut self, operation_name: impl Into<String>) -> Self {
        self.operation_name = Some(operation_name.into());
        self
    }

    /// Variables as an object; anything other than a JSON object counts as none.
    pub fn variables_object(&self) -> Map<String, Value> {
        match &self.variables {
            Some(Value::Object(variables)) => variables.clone(),
            _ => Map::new(),
        }
    }
}
