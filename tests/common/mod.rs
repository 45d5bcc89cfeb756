#![allow(dead_code)]

//! Mock accounts / products / reviews subgraphs shared by the integration tests.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fedgate::graphql::Response;
use fedgate::json_ext::ValueExt;
use fedgate::{
    FederatedQueryPlanner, FederationGateway, GraphQLRequest, HttpQueryExecutor,
    InMemorySchemaRegistry, SchemaPoller, ServiceConfig, SubscriptionBridge, WebSocketProtocol,
};
use futures::{SinkExt, StreamExt};
use graphql_parser::query::{
    Definition, OperationDefinition, Selection, SelectionSet, TypeCondition,
};
use serde_json::{Map, Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Respond, ResponseTemplate};

pub const ACCOUNTS_SDL: &str = r#"
extend type Query {
    me: User
    histories: [History]
}

extend type Mutation {
    login(username: String!): User
}

type User @key(fields: "id") {
    id: ID!
    username: String!
    history: [History]
}

type Purchase {
    product: Product!
    wallet: Wallet
}

type Sale {
    product: Product!
    rating: Int!
}

union History = Purchase | Sale

interface Wallet {
    currency: String!
    amount: Float!
}

type WalletType1 implements Wallet {
    currency: String!
    amount: Float!
    specialField1: String
}

type WalletType2 implements Wallet {
    currency: String!
    amount: Float!
    specialField2: String
}

extend type Product @key(fields: "upc") {
    upc: String! @external
}
"#;

pub const PRODUCTS_SDL: &str = r#"
extend type Query {
    topProducts(first: Int = 5): [Product]
}

extend type Subscription {
    updatedPrice: Product!
    updateProductPrice(upc: String!): Product!
}

type Product @key(fields: "upc") {
    upc: String!
    name: String!
    price: Int!
}
"#;

pub const REVIEWS_SDL: &str = r#"
type Review {
    body: String!
    author: User!
    product: Product!
}

extend type User @key(fields: "id") {
    id: ID! @external
    username: String! @external
    reviews: [Review]
}

extend type Product @key(fields: "upc") {
    upc: String! @external
    reviews: [Review]
}

extend type Mutation {
    addReview(authorID: String!, upc: String!, review: String!): Review
}
"#;

pub type Resolver = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// One non-introspection request a subgraph received.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub service: String,
    pub body: Value,
    pub at: Instant,
}

impl Recorded {
    pub fn query(&self) -> &str {
        self.body["query"].as_str().unwrap_or_default()
    }

    pub fn representations(&self) -> Vec<Value> {
        self.body["variables"]["representations"]
            .as_array()
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<Recorded>>>);

impl RequestLog {
    fn push(&self, recorded: Recorded) {
        self.0.lock().unwrap().push(recorded);
    }

    pub fn for_service(&self, service: &str) -> Vec<Recorded> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|recorded| recorded.service == service)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

struct SubgraphResponder {
    name: String,
    sdl: Arc<Mutex<Option<String>>>,
    status: Arc<AtomicU16>,
    graphql_errors: Arc<Mutex<Option<Value>>>,
    resolve: Resolver,
    delay: Duration,
    log: RequestLog,
}

impl Respond for SubgraphResponder {
    fn respond(&self, request: &wiremock::Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let query = body["query"].as_str().unwrap_or_default();
        if query.contains("_service") {
            return match self.sdl.lock().unwrap().clone() {
                Some(sdl) => ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"_service": {"sdl": sdl}}})),
                None => ResponseTemplate::new(500),
            };
        }

        self.log.push(Recorded {
            service: self.name.clone(),
            body: body.clone(),
            at: Instant::now(),
        });
        let status = self.status.load(Ordering::SeqCst);
        if status != 200 {
            return ResponseTemplate::new(status);
        }
        if let Some(errors) = self.graphql_errors.lock().unwrap().clone() {
            return ResponseTemplate::new(200).set_body_json(json!({"data": null, "errors": errors}));
        }
        let mut response = (self.resolve)(&body);
        if let Some(data) = response.get_mut("data").filter(|data| data.is_object()) {
            *data = project(query, data);
        }
        ResponseTemplate::new(200)
            .set_body_json(response)
            .set_delay(self.delay)
    }
}

/// Abstract types of the fixture schema; fragments on them match any object.
const ABSTRACT_TYPES: [&str; 2] = ["History", "Wallet"];

/// Answers `query` from the canned `data` the way a GraphQL server would:
/// only the selected fields, each under its response key.
fn project(query: &str, data: &Value) -> Value {
    let Ok(document) = graphql_parser::parse_query::<String>(query) else {
        return data.clone();
    };
    let selection_set = document.definitions.iter().find_map(|definition| match definition {
        Definition::Operation(OperationDefinition::SelectionSet(set)) => Some(set),
        Definition::Operation(OperationDefinition::Query(query)) => Some(&query.selection_set),
        Definition::Operation(OperationDefinition::Mutation(mutation)) => {
            Some(&mutation.selection_set)
        }
        Definition::Operation(OperationDefinition::Subscription(subscription)) => {
            Some(&subscription.selection_set)
        }
        Definition::Fragment(_) => None,
    });
    match selection_set {
        Some(set) => project_value(set, data),
        None => data.clone(),
    }
}

fn project_value(set: &SelectionSet<'_, String>, value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| project_value(set, item)).collect())
        }
        Value::Object(object) => {
            let mut projected = Map::new();
            project_into(set, object, &mut projected);
            Value::Object(projected)
        }
        other => other.clone(),
    }
}

fn project_into(
    set: &SelectionSet<'_, String>,
    object: &Map<String, Value>,
    projected: &mut Map<String, Value>,
) {
    let typename = object.get("__typename").and_then(Value::as_str);
    for selection in &set.items {
        match selection {
            Selection::Field(field) => {
                let key = field.alias.clone().unwrap_or_else(|| field.name.clone());
                let value = match object.get(&field.name) {
                    Some(value) if !field.selection_set.items.is_empty() => {
                        project_value(&field.selection_set, value)
                    }
                    Some(value) => value.clone(),
                    None => Value::Null,
                };
                match projected.get_mut(&key) {
                    Some(existing) => existing.deep_merge(value),
                    None => {
                        projected.insert(key, value);
                    }
                }
            }
            Selection::InlineFragment(fragment) => {
                let applies = match &fragment.type_condition {
                    Some(TypeCondition::On(condition)) => {
                        ABSTRACT_TYPES.contains(&condition.as_str())
                            || typename.is_none_or(|typename| typename == condition)
                    }
                    None => true,
                };
                if applies {
                    project_into(&fragment.selection_set, object, projected);
                }
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

/// A wiremock-backed subgraph that answers introspection with its SDL and
/// everything else with `resolve`.
pub struct Subgraph {
    pub name: String,
    pub server: MockServer,
    sdl: Arc<Mutex<Option<String>>>,
    status: Arc<AtomicU16>,
    graphql_errors: Arc<Mutex<Option<Value>>>,
}

impl Subgraph {
    pub async fn start(
        name: &str,
        sdl: &str,
        resolve: Resolver,
        delay: Duration,
        log: RequestLog,
    ) -> Self {
        let server = MockServer::start().await;
        let sdl = Arc::new(Mutex::new(Some(sdl.to_owned())));
        let status = Arc::new(AtomicU16::new(200));
        let graphql_errors = Arc::new(Mutex::new(None));
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(SubgraphResponder {
                name: name.to_owned(),
                sdl: Arc::clone(&sdl),
                status: Arc::clone(&status),
                graphql_errors: Arc::clone(&graphql_errors),
                resolve,
                delay,
                log,
            })
            .mount(&server)
            .await;
        Subgraph {
            name: name.to_owned(),
            server,
            sdl,
            status,
            graphql_errors,
        }
    }

    pub fn url(&self) -> String {
        format!("{}/graphql", self.server.uri())
    }

    /// `None` makes introspection fail with a 500.
    pub fn set_sdl(&self, sdl: Option<&str>) {
        *self.sdl.lock().unwrap() = sdl.map(str::to_owned);
    }

    /// Answers every operation with `status` and no body.
    pub fn fail_with(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    /// Answers every operation with `{"data": null, "errors": errors}`.
    pub fn fail_with_errors(&self, errors: Value) {
        *self.graphql_errors.lock().unwrap() = Some(errors);
    }
}

fn representations(body: &Value) -> Vec<Value> {
    body["variables"]["representations"]
        .as_array()
        .cloned()
        .unwrap_or_default()
}

fn user(id: &str) -> Value {
    let username = if id == "1234" {
        "Me".to_owned()
    } else {
        format!("User {id}")
    };
    json!({"__typename": "User", "id": id, "username": username, "history": history()})
}

fn history() -> Value {
    json!([
        {
            "__typename": "Purchase",
            "product": {"__typename": "Product", "upc": "top-1"},
            "wallet": {"__typename": "WalletType1", "currency": "USD", "amount": 123, "specialField1": "some special value 1"}
        },
        {
            "__typename": "Sale",
            "product": {"__typename": "Product", "upc": "top-2"},
            "rating": 5
        },
        {
            "__typename": "Purchase",
            "product": {"__typename": "Product", "upc": "top-3"},
            "wallet": {"__typename": "WalletType2", "currency": "USD", "amount": 123, "specialField2": "some special value 2"}
        }
    ])
}

pub fn accounts() -> Resolver {
    Arc::new(|body| {
        let query = body["query"].as_str().unwrap_or_default();
        if query.contains("_entities") {
            let entities: Vec<Value> = representations(body)
                .iter()
                .map(|representation| match representation["__typename"].as_str() {
                    Some("User") => user(representation["id"].as_str().unwrap_or_default()),
                    _ => Value::Null,
                })
                .collect();
            return json!({"data": {"_entities": entities}});
        }
        if query.contains("login") {
            return json!({"data": {"login": user("1234")}});
        }
        json!({"data": {"me": user("1234"), "histories": history()}})
    })
}

fn product(index: usize) -> Value {
    let name = match index {
        0 => "Trilby".to_owned(),
        1 => "Fedora".to_owned(),
        2 => "Boater".to_owned(),
        _ => format!("Product {}", index + 1),
    };
    json!({
        "__typename": "Product",
        "upc": format!("top-{}", index + 1),
        "name": name,
        "price": (index as u64 + 1) * 11
    })
}

fn product_index(upc: &str) -> usize {
    upc.strip_prefix("top-")
        .and_then(|n| n.parse::<usize>().ok())
        .map_or(0, |n| n.saturating_sub(1))
}

pub fn products(count: usize) -> Resolver {
    Arc::new(move |body| {
        let query = body["query"].as_str().unwrap_or_default();
        if query.contains("_entities") {
            let entities: Vec<Value> = representations(body)
                .iter()
                .map(|representation| {
                    product(product_index(representation["upc"].as_str().unwrap_or_default()))
                })
                .collect();
            return json!({"data": {"_entities": entities}});
        }
        let top: Vec<Value> = (0..count).map(product).collect();
        json!({"data": {"topProducts": top}})
    })
}

fn reviews_for(upc: &str) -> Value {
    let (body, author) = match upc {
        "top-1" => ("A highly effective form of birth control.", "1234"),
        "top-2" => (
            "Fedoras are one of the most fashionable hats around and can look great with a variety of outfits.",
            "1234",
        ),
        "top-3" => ("This is the last straw. Hat you will wear. 11/10", "7777"),
        _ => ("Fine hat.", "1234"),
    };
    json!([{
        "__typename": "Review",
        "body": body,
        "author": {"__typename": "User", "id": author},
        "product": {"__typename": "Product", "upc": upc}
    }])
}

/// With `reverse`, `_entities` comes back in the opposite order of the
/// representations. Products listed in `failing` resolve to `null` with an
/// error at their `_entities` position.
pub fn reviews(reverse: bool, failing: &'static [&'static str]) -> Resolver {
    Arc::new(move |body| {
        let query = body["query"].as_str().unwrap_or_default();
        if query.contains("_entities") {
            let mut errors = Vec::new();
            let mut entities: Vec<Value> = representations(body)
                .iter()
                .enumerate()
                .map(|(index, representation)| match representation["__typename"].as_str() {
                    Some("Product") => {
                        let upc = representation["upc"].as_str().unwrap_or_default();
                        if failing.contains(&upc) {
                            errors.push(json!({
                                "message": format!("reviews of {upc} are unavailable"),
                                "path": ["_entities", index, "reviews"]
                            }));
                            return Value::Null;
                        }
                        json!({"__typename": "Product", "upc": upc, "reviews": reviews_for(upc)})
                    }
                    Some("User") => {
                        let id = representation["id"].as_str().unwrap_or_default();
                        json!({"__typename": "User", "id": id, "reviews": reviews_for("top-1")})
                    }
                    _ => Value::Null,
                })
                .collect();
            if reverse {
                entities.reverse();
            }
            if errors.is_empty() {
                return json!({"data": {"_entities": entities}});
            }
            return json!({"data": {"_entities": entities}, "errors": errors});
        }
        let variables = &body["variables"];
        json!({"data": {"addReview": {
            "__typename": "Review",
            "body": variables["review"],
            "author": {"__typename": "User", "id": variables["authorID"]},
            "product": {"__typename": "Product", "upc": variables["upc"]}
        }}})
    })
}

pub struct FederationOptions {
    pub product_count: usize,
    pub products_delay: Duration,
    pub reverse_entities: bool,
    /// Products whose reviews fail with a GraphQL error.
    pub failing_reviews: &'static [&'static str],
    /// Subscription endpoint of the products subgraph.
    pub products_ws: Option<(String, WebSocketProtocol)>,
}

impl Default for FederationOptions {
    fn default() -> Self {
        FederationOptions {
            product_count: 3,
            products_delay: Duration::ZERO,
            reverse_entities: false,
            failing_reviews: &[],
            products_ws: None,
        }
    }
}

/// Three running subgraphs and a gateway over their composed supergraph.
pub struct Federation {
    pub accounts: Subgraph,
    pub products: Subgraph,
    pub reviews: Subgraph,
    pub log: RequestLog,
    pub registry: Arc<InMemorySchemaRegistry>,
    pub gateway: Arc<FederationGateway>,
}

impl Federation {
    pub async fn start() -> Self {
        Self::start_with(FederationOptions::default()).await
    }

    pub async fn start_with(options: FederationOptions) -> Self {
        let log = RequestLog::default();
        let accounts =
            Subgraph::start("accounts", ACCOUNTS_SDL, accounts(), Duration::ZERO, log.clone())
                .await;
        let products = Subgraph::start(
            "products",
            PRODUCTS_SDL,
            products(options.product_count),
            options.products_delay,
            log.clone(),
        )
        .await;
        let reviews = Subgraph::start(
            "reviews",
            REVIEWS_SDL,
            reviews(options.reverse_entities, options.failing_reviews),
            Duration::ZERO,
            log.clone(),
        )
        .await;

        let mut products_service = ServiceConfig::new("products", products.url());
        if let Some((ws_url, protocol)) = options.products_ws {
            products_service = products_service.with_subscriptions(ws_url, protocol);
        }
        let registry = Arc::new(InMemorySchemaRegistry::new(vec![
            ServiceConfig::new("accounts", accounts.url()),
            products_service,
            ServiceConfig::new("reviews", reviews.url()),
        ]));

        let gateway = Arc::new(FederationGateway::new(
            registry.clone(),
            Box::new(FederatedQueryPlanner::new()),
            Box::new(HttpQueryExecutor::new()),
            SubscriptionBridge::new(16).with_ack_timeout(Duration::from_secs(2)),
        ));
        let federation = Federation {
            accounts,
            products,
            reviews,
            log,
            registry,
            gateway,
        };
        federation
            .poller()
            .poll()
            .await
            .expect("fixture subgraphs compose");
        federation
    }

    pub fn poller(&self) -> SchemaPoller {
        SchemaPoller::new(
            self.registry.clone(),
            reqwest::Client::new(),
            Duration::from_secs(3600),
        )
    }

    pub async fn query(&self, query: &str, variables: Option<Value>) -> Response {
        let mut request = GraphQLRequest::new(query);
        request.variables = variables;
        self.gateway
            .process_request(request, CancellationToken::new())
            .await
    }
}

/// What the mock WebSocket subgraph does after sending its pushes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfterPushes {
    /// Keep the socket open and record whatever the gateway sends.
    Hold,
    /// Drop the TCP connection without a close frame.
    Drop,
}

/// A single-connection GraphQL WebSocket subgraph. Every JSON message the
/// gateway sends it shows up on `received`.
pub struct WsSubgraph {
    pub url: String,
    pub received: mpsc::UnboundedReceiver<Value>,
    task: JoinHandle<()>,
}

impl WsSubgraph {
    pub async fn start(
        protocol: WebSocketProtocol,
        pushes: Vec<Value>,
        after: AfterPushes,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/graphql", listener.local_addr().unwrap());
        let (sender, received) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_hdr_async(
                stream,
                move |_request: &Request,
                      mut response: HandshakeResponse|
                      -> Result<HandshakeResponse, ErrorResponse> {
                    response.headers_mut().insert(
                        SEC_WEBSOCKET_PROTOCOL,
                        HeaderValue::from_static(protocol.subprotocol()),
                    );
                    Ok(response)
                },
            )
            .await
            .unwrap();

            let Some(init) = next_json(&mut socket).await else {
                return;
            };
            let _ = sender.send(init);
            send_json(&mut socket, json!({"type": "connection_ack"})).await;

            let Some(start) = next_json(&mut socket).await else {
                return;
            };
            let id = start["id"].clone();
            let _ = sender.send(start);

            for payload in pushes {
                send_json(
                    &mut socket,
                    json!({"type": protocol.data_type(), "id": id, "payload": payload}),
                )
                .await;
            }

            match after {
                AfterPushes::Hold => {
                    while let Some(message) = next_json(&mut socket).await {
                        let _ = sender.send(message);
                    }
                }
                AfterPushes::Drop => drop(socket),
            }
        });

        WsSubgraph {
            url,
            received,
            task,
        }
    }

    /// The next message from the gateway, failing the test after two seconds.
    pub async fn next_received(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("gateway sent nothing upstream")
            .expect("mock subgraph stopped")
    }
}

impl Drop for WsSubgraph {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn next_json(socket: &mut WebSocketStream<TcpStream>) -> Option<Value> {
    while let Some(message) = socket.next().await {
        match message {
            Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn send_json(socket: &mut WebSocketStream<TcpStream>, value: Value) {
    let _ = socket.send(Message::text(value.to_string())).await;
}

pub fn price_update(price: u64) -> Value {
    json!({"data": {"updateProductPrice": {"upc": "top-1", "name": "Trilby", "price": price}}})
}
