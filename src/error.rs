use serde_json::Value;
use thiserror::Error;

use crate::graphql;
use crate::json_ext::Path;

/// Problems loading the gateway configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("configuration declares no subgraphs")]
    NoSubgraphs,
    #[error("subgraph '{service}' has an invalid {field}: {reason}")]
    InvalidUrl {
        service: String,
        field: &'static str,
        reason: String,
    },
    #[error("poll_interval must be greater than zero")]
    InvalidPollInterval,
}

/// Composition failures. Any of these leaves the previous supergraph in place.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompositionError {
    #[error("introspection of subgraph '{service}' failed: {reason}")]
    Introspection { service: String, reason: String },
    #[error("subgraph '{service}' returned an invalid schema: {reason}")]
    InvalidSdl { service: String, reason: String },
    #[error(
        "field '{type_name}.{field}' is declared as '{first_type}' by '{first_service}' and as '{second_type}' by '{second_service}'"
    )]
    FieldTypeConflict {
        type_name: String,
        field: String,
        first_service: String,
        first_type: String,
        second_service: String,
        second_type: String,
    },
    #[error(
        "type '{type_name}' is declared as {first_kind} by '{first_service}' and as {second_kind} by '{second_service}'"
    )]
    TypeKindConflict {
        type_name: String,
        first_service: String,
        first_kind: String,
        second_service: String,
        second_kind: String,
    },
    #[error("no subgraph declares any field on the query root type")]
    MissingQueryType,
}

/// Errors raised while normalizing or planning a client operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanningError {
    #[error("failed to parse operation: {0}")]
    Parse(String),
    #[error("unknown operation named '{0}'")]
    UnknownOperation(String),
    #[error("must provide operation name if query contains multiple operations")]
    OperationNameRequired,
    #[error("document does not contain any operation")]
    NoOperation,
    #[error("schema does not define a {0} root type")]
    MissingRootType(String),
    #[error("unknown type '{0}'")]
    UnknownType(String),
    #[error("cannot query field '{field}' on type '{type_name}'")]
    UnknownField { type_name: String, field: String },
    #[error("alias '{0}' is reserved: aliases must not start with \"__\"")]
    ReservedAlias(String),
    #[error("unknown fragment '{0}'")]
    UnknownFragment(String),
    #[error("fragment '{0}' spreads itself")]
    FragmentCycle(String),
    #[error("variable '${0}' is not defined by the operation")]
    UnknownVariable(String),
    #[error("subscription operations must select exactly one root field")]
    SubscriptionRootFields,
    #[error("subscription requires fields from multiple subgraphs: {}", services.join(", "))]
    UnsupportedSubscription { services: Vec<String> },
    #[error("field '{type_name}.{field}' is not resolvable by any subgraph")]
    NoOwner { type_name: String, field: String },
    #[error("type '{type_name}' has no entity key in subgraph '{service}'")]
    NoEntityKey { type_name: String, service: String },
    #[error("subgraph '{service}' cannot resolve the key fields of type '{type_name}'")]
    UnresolvableKey { type_name: String, service: String },
}

impl PlanningError {
    /// Internal errors point at an inconsistent supergraph rather than a bad
    /// client operation.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            PlanningError::NoOwner { .. }
                | PlanningError::NoEntityKey { .. }
                | PlanningError::UnresolvableKey { .. }
        )
    }

    pub fn extension_code(&self) -> &'static str {
        match self {
            PlanningError::Parse(_) => "GRAPHQL_PARSE_FAILED",
            PlanningError::UnsupportedSubscription { .. }
            | PlanningError::SubscriptionRootFields => "SUBSCRIPTION_NOT_SUPPORTED",
            error if error.is_internal() => "QUERY_PLANNING_FAILED",
            _ => "GRAPHQL_VALIDATION_FAILED",
        }
    }

    pub fn to_graphql_error(&self) -> graphql::Error {
        graphql::Error::new(self.to_string()).with_code(self.extension_code())
    }
}

/// A failed subgraph fetch. The error is attached to the response at the
/// fetch's location and sibling fetches carry on.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("HTTP fetch failed from '{service}': {reason}")]
    SubrequestHttpError {
        service: String,
        status_code: Option<u16>,
        reason: String,
    },
    #[error("service '{service}' response was malformed: {reason}")]
    SubrequestMalformedResponse { service: String, reason: String },
}

impl FetchError {
    pub fn extension_code(&self) -> &'static str {
        match self {
            FetchError::SubrequestHttpError { .. } => "SUBREQUEST_HTTP_ERROR",
            FetchError::SubrequestMalformedResponse { .. } => "SUBREQUEST_MALFORMED_RESPONSE",
        }
    }

    pub fn to_graphql_error(&self, path: Option<Path>) -> graphql::Error {
        let mut error = graphql::Error::new(self.to_string())
            .with_code(self.extension_code())
            .with_path(path);
        match self {
            FetchError::SubrequestHttpError {
                service,
                status_code,
                ..
            } => {
                error = error.with_extension("service", Value::String(service.clone()));
                if let Some(status) = status_code {
                    error = error.with_extension("http", serde_json::json!({ "status": status }));
                }
            }
            FetchError::SubrequestMalformedResponse { service, .. } => {
                error = error.with_extension("service", Value::String(service.clone()));
            }
        }
        error
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("request was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubscriptionError {
    #[error("operation is not a subscription")]
    NotASubscription,
    #[error("subscriptions are only served over a WebSocket connection")]
    RequiresWebSocket,
    #[error("subgraph '{0}' has no subscription endpoint configured")]
    NoWebSocketUrl(String),
    #[error("websocket connection to '{service}' failed: {reason}")]
    Connect { service: String, reason: String },
    #[error("subgraph '{service}' did not acknowledge the connection: {reason}")]
    ConnectionAck { service: String, reason: String },
    #[error("cannot send to the websocket connection of '{service}': {reason}")]
    Send { service: String, reason: String },
}

impl SubscriptionError {
    pub fn to_graphql_error(&self) -> graphql::Error {
        let code = match self {
            SubscriptionError::NotASubscription => "GRAPHQL_VALIDATION_FAILED",
            SubscriptionError::RequiresWebSocket => "SUBSCRIPTION_REQUIRES_WEBSOCKET",
            SubscriptionError::NoWebSocketUrl(_) => "SUBSCRIPTION_NOT_SUPPORTED",
            _ => "SUBSCRIPTION_UPSTREAM_FAILED",
        };
        graphql::Error::new(self.to_string()).with_code(code)
    }
}
