use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use indexmap::IndexMap;
use reqwest::header::CONTENT_TYPE;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{ExecutionError, FetchError};
use crate::graphql::{self, Response};
use crate::json_ext::{Path, PathElement, ValueExt};
use crate::query_plan::{ExecutionPlan, FetchNode, NodeId, PlanNode, key_alias};
use crate::response_shape::shape_response;
use crate::{GraphQLRequest, ServiceConfig};

/// Per-request inputs to plan execution.
#[derive(Clone, Debug, Default)]
pub struct ExecutionRequest {
    pub variables: Map<String, Value>,
    /// Headers forwarded to every subgraph request.
    pub headers: HashMap<String, String>,
}

impl From<&GraphQLRequest> for ExecutionRequest {
    fn from(request: &GraphQLRequest) -> Self {
        ExecutionRequest {
            variables: request.variables_object(),
            headers: request.auth_headers.clone().unwrap_or_default(),
        }
    }
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs a query or mutation plan. Subgraph failures end up in the
    /// response's `errors`; only cancellation fails the whole call.
    async fn execute(
        &self,
        plan: &ExecutionPlan,
        request: &ExecutionRequest,
        token: &CancellationToken,
    ) -> Result<Response, ExecutionError>;
}

pub struct HttpQueryExecutor {
    client: reqwest::Client,
}

impl HttpQueryExecutor {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        HttpQueryExecutor { client }
    }
}

impl Default for HttpQueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute(
        &self,
        plan: &ExecutionPlan,
        request: &ExecutionRequest,
        token: &CancellationToken,
    ) -> Result<Response, ExecutionError> {
        let context = ExecutionContext {
            client: &self.client,
            plan,
            request,
        };
        let root_dir = Path::empty();
        let initial = Value::Null;
        let run = async {
            match plan.root() {
                Some(root) => context.execute_node(root, &root_dir, &initial).await,
                None => (Value::Null, Vec::new()),
            }
        }
        .instrument(tracing::info_span!(
            "execute",
            kind = %plan.kind(),
            schema_version = plan.schema_version()
        ));

        // Dropping `run` aborts every in-flight subgraph request.
        let (data, errors) = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!("execution cancelled");
                return Err(ExecutionError::Cancelled);
            }
            result = run => result,
        };

        let data = shape_response(plan.schema(), plan.operation(), &data, &request.variables);
        Ok(Response {
            data: Some(data),
            errors,
        })
    }
}

struct ExecutionContext<'a> {
    client: &'a reqwest::Client,
    plan: &'a ExecutionPlan,
    request: &'a ExecutionRequest,
}

impl<'a> ExecutionContext<'a> {
    /// Executes one node against `parent`, the data merged so far, and
    /// returns the data it produced.
    fn execute_node<'b>(
        &'b self,
        id: NodeId,
        current_dir: &'b Path,
        parent: &'b Value,
    ) -> BoxFuture<'b, (Value, Vec<graphql::Error>)>
    where
        'a: 'b,
    {
        async move {
            match self.plan.node(id) {
                PlanNode::Sequence { nodes } => {
                    let span = tracing::debug_span!("sequence", nodes = nodes.len());
                    async {
                        let mut value = parent.clone();
                        let mut errors = Vec::new();
                        for node in nodes {
                            let (result, node_errors) =
                                self.execute_node(*node, current_dir, &value).await;
                            value.deep_merge(result);
                            errors.extend(node_errors);
                        }
                        (value, errors)
                    }
                    .instrument(span)
                    .await
                }
                PlanNode::Parallel { nodes } => {
                    let span = tracing::debug_span!("parallel", nodes = nodes.len());
                    async {
                        let results = join_all(
                            nodes
                                .iter()
                                .map(|node| self.execute_node(*node, current_dir, parent)),
                        )
                        .await;
                        let mut value = Value::Null;
                        let mut errors = Vec::new();
                        for (result, node_errors) in results {
                            value.deep_merge(result);
                            errors.extend(node_errors);
                        }
                        (value, errors)
                    }
                    .instrument(span)
                    .await
                }
                PlanNode::Flatten(flatten) => {
                    let dir = current_dir.join(&flatten.path);
                    let span = tracing::debug_span!("flatten", path = %dir);
                    async { self.execute_node(flatten.node, &dir, parent).await }
                        .instrument(span)
                        .await
                }
                PlanNode::Fetch(fetch) => {
                    let span = tracing::info_span!(
                        "fetch",
                        service = %fetch.service_name,
                        path = %current_dir
                    );
                    self.fetch(fetch, current_dir, parent).instrument(span).await
                }
            }
        }
        .boxed()
    }

    async fn fetch(
        &self,
        fetch: &FetchNode,
        current_dir: &Path,
        data: &Value,
    ) -> (Value, Vec<graphql::Error>) {
        let Some(service) = self.plan.schema().service(&fetch.service_name) else {
            return (
                Value::Null,
                vec![
                    graphql::Error::new(format!(
                        "subgraph '{}' is not configured",
                        fetch.service_name
                    ))
                    .with_code("UNKNOWN_SUBGRAPH"),
                ],
            );
        };

        let mut variables: Map<String, Value> = fetch
            .variable_usages
            .iter()
            .filter_map(|name| {
                self.request
                    .variables
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();

        let representations = if fetch.is_entity_fetch() {
            let representations = Representations::collect(data, current_dir, &fetch.requires);
            if representations.is_empty() {
                tracing::debug!("no entities to fetch");
                return (Value::Null, Vec::new());
            }
            tracing::debug!(count = representations.len(), "fetching entities");
            variables.insert("representations".to_owned(), representations.to_value());
            Some(representations)
        } else {
            None
        };

        let request = GraphQLRequest {
            query: fetch.operation.clone(),
            variables: Some(Value::Object(variables)),
            operation_name: fetch.operation_name.clone(),
            auth_headers: None,
        };
        let response = match self.send(service, &request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%error, "subgraph fetch failed");
                let path = current_dir.before_flatten();
                return (Value::Null, vec![error.to_graphql_error(Some(path))]);
            }
        };

        let graphql::Response { data, errors } = response;
        let errors = errors
            .into_iter()
            .map(|error| rewrite_error(error, &service.name, representations.as_ref()))
            .collect();
        let value = match representations {
            Some(representations) => representations.merge_entities(data),
            None => {
                let mut value = Value::Null;
                value.insert_at_path(current_dir, data.unwrap_or(Value::Null));
                value
            }
        };
        (value, errors)
    }

    async fn send(
        &self,
        service: &ServiceConfig,
        request: &GraphQLRequest,
    ) -> Result<graphql::Response, FetchError> {
        let mut builder = self
            .client
            .post(&service.url)
            .header(CONTENT_TYPE, "application/json")
            .json(request);
        for (name, value) in &self.request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::SubrequestHttpError {
                service: service.name.clone(),
                status_code: e.status().map(|status| status.as_u16()),
                reason: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::SubrequestHttpError {
                service: service.name.clone(),
                status_code: Some(status.as_u16()),
                reason: format!("subgraph responded with status {status}"),
            });
        }
        response
            .json::<graphql::Response>()
            .await
            .map_err(|e| FetchError::SubrequestMalformedResponse {
                service: service.name.clone(),
                reason: e.to_string(),
            })
    }
}

/// Entity representations collected for one `_entities` fetch, deduplicated
/// by key. Each one remembers every response path it was found at.
struct Representations<'r> {
    requires: &'r IndexMap<String, Vec<String>>,
    entries: IndexMap<String, (Value, Vec<Path>)>,
}

impl<'r> Representations<'r> {
    fn collect(data: &Value, dir: &Path, requires: &'r IndexMap<String, Vec<String>>) -> Self {
        let mut entries: IndexMap<String, (Value, Vec<Path>)> = IndexMap::new();
        data.select_values_and_paths(dir, &mut |path, value| {
            let Some(representation) = value
                .as_object()
                .and_then(|object| representation(object, requires))
            else {
                return;
            };
            entries
                .entry(representation.to_string())
                .or_insert_with(|| (representation, Vec::new()))
                .1
                .push(path.clone());
        });
        Representations { requires, entries }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn to_value(&self) -> Value {
        Value::Array(
            self.entries
                .values()
                .map(|(representation, _)| representation.clone())
                .collect(),
        )
    }

    fn first_path(&self, index: usize) -> Option<&Path> {
        self.entries
            .get_index(index)
            .and_then(|(_, (_, paths))| paths.first())
    }

    /// Places each returned entity at the paths of the representation with
    /// the same key. Position in the `_entities` list is not relied on.
    fn merge_entities(&self, data: Option<Value>) -> Value {
        let mut merged = Value::Null;
        let entities = match data {
            Some(Value::Object(mut data)) => data.remove("_entities"),
            _ => None,
        };
        let Some(Value::Array(entities)) = entities else {
            return merged;
        };
        for entity in entities {
            let Some(representation) = entity
                .as_object()
                .and_then(|object| representation(object, self.requires))
            else {
                continue;
            };
            match self.entries.get(&representation.to_string()) {
                Some((_, paths)) => {
                    for path in paths {
                        merged.insert_at_path(path, entity.clone());
                    }
                }
                None => {
                    tracing::debug!(%representation, "dropping entity that matches no representation")
                }
            }
        }
        merged
    }
}

/// `{__typename, key fields...}` for an object, or `None` when it has no
/// typename, isn't a required entity type or lacks a key value. Key values
/// are read from their reserved aliases first.
fn representation(
    object: &Map<String, Value>,
    requires: &IndexMap<String, Vec<String>>,
) -> Option<Value> {
    let typename = object.get("__typename")?.as_str()?;
    let key = requires.get(typename)?;
    let mut representation = Map::new();
    representation.insert("__typename".to_owned(), Value::String(typename.to_owned()));
    for field in key {
        let value = object
            .get(&key_alias(field))
            .or_else(|| object.get(field))
            .filter(|value| !value.is_null())?;
        representation.insert(field.clone(), value.clone());
    }
    Some(Value::Object(representation))
}

fn rewrite_error(
    mut error: graphql::Error,
    service: &str,
    representations: Option<&Representations<'_>>,
) -> graphql::Error {
    error
        .extensions
        .entry("service")
        .or_insert_with(|| Value::String(service.to_owned()));
    if let Some(representations) = representations {
        error.path = error.path.take().and_then(|path| match path.0.as_slice() {
            [PathElement::Key(entities), PathElement::Index(index), rest @ ..]
                if entities == "_entities" =>
            {
                representations
                    .first_path(*index)
                    .map(|found| found.join(&Path(rest.to_vec())))
            }
            _ => Some(path),
        });
    }
    error
}
