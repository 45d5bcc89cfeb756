use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{ExecutionError, PlanningError, SubscriptionError};
use crate::graphql::{self, Response};
use crate::operation::{Operation, OperationKind};
use crate::query_executor::{ExecutionRequest, QueryExecutor};
use crate::query_plan::ExecutionPlan;
use crate::query_planner::QueryPlanner;
use crate::schema_registry::SchemaRegistry;
use crate::subscription_bridge::{SubscriptionBridge, SubscriptionSession};
use crate::GraphQLRequest;

/// Ties the registry, planner, executor and subscription bridge together.
/// Every client-facing failure comes back as a GraphQL response.
pub struct FederationGateway {
    schema_registry: Arc<dyn SchemaRegistry>,
    query_planner: Box<dyn QueryPlanner>,
    query_executor: Box<dyn QueryExecutor>,
    subscription_bridge: SubscriptionBridge,
}

impl FederationGateway {
    pub fn new(
        schema_registry: Arc<dyn SchemaRegistry>,
        query_planner: Box<dyn QueryPlanner>,
        query_executor: Box<dyn QueryExecutor>,
        subscription_bridge: SubscriptionBridge,
    ) -> Self {
        FederationGateway {
            schema_registry,
            query_planner,
            query_executor,
            subscription_bridge,
        }
    }

    pub fn schema_registry(&self) -> &Arc<dyn SchemaRegistry> {
        &self.schema_registry
    }

    /// Plans and executes a query or mutation against the current supergraph.
    pub async fn process_request(
        &self,
        request: GraphQLRequest,
        token: CancellationToken,
    ) -> Response {
        let plan = match self.plan(&request) {
            Ok(plan) => plan,
            Err(response) => return response,
        };
        if plan.kind() == OperationKind::Subscription {
            return Response::from_error(SubscriptionError::RequiresWebSocket.to_graphql_error());
        }
        tracing::debug!(
            schema_version = plan.schema_version(),
            fetches = plan.fetches().count(),
            "planned operation"
        );

        let execution_request = ExecutionRequest::from(&request);
        match self
            .query_executor
            .execute(&plan, &execution_request, &token)
            .await
        {
            Ok(response) => response,
            Err(ExecutionError::Cancelled) => Response::from_error(
                graphql::Error::new("request was cancelled").with_code("REQUEST_CANCELLED"),
            ),
        }
    }

    /// Opens a subscription. Failures are returned as the response to send
    /// to the client in place of events.
    pub async fn subscribe(
        &self,
        request: GraphQLRequest,
        token: CancellationToken,
    ) -> Result<SubscriptionSession, Response> {
        let plan = self.plan(&request)?;
        if plan.kind() != OperationKind::Subscription {
            return Err(Response::from_error(
                graphql::Error::new("only subscription operations can be sent over this socket")
                    .with_code("GRAPHQL_VALIDATION_FAILED"),
            ));
        }
        let execution_request = ExecutionRequest::from(&request);
        self.subscription_bridge
            .open(&plan, &execution_request, token)
            .await
            .map_err(|error| {
                tracing::warn!(%error, "failed to open subscription");
                Response::from_error(error.to_graphql_error())
            })
    }

    fn plan(&self, request: &GraphQLRequest) -> Result<ExecutionPlan, Response> {
        let Some(schema) = self.schema_registry.current_schema() else {
            return Err(Response::from_error(
                graphql::Error::new("no supergraph has been composed yet")
                    .with_code("SCHEMA_UNAVAILABLE"),
            ));
        };
        Operation::parse(&schema, &request.query, request.operation_name.as_deref())
            .and_then(|operation| self.query_planner.plan(&schema, Arc::new(operation)))
            .map_err(|error| {
                log_planning_error(&error);
                Response::from_error(error.to_graphql_error())
            })
    }
}

fn log_planning_error(error: &PlanningError) {
    if error.is_internal() {
        tracing::error!(%error, "query planning failed");
    } else {
        tracing::debug!(%error, "rejected operation");
    }
}
