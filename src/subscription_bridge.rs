//! Relays a planned subscription to the subgraph that owns it over a
//! WebSocket, speaking either the legacy `graphql-ws` protocol
//! (subscriptions-transport-ws) or the modern `graphql-transport-ws` one.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::GraphQLRequest;
use crate::error::SubscriptionError;
use crate::graphql::{self, errors_from_payload};
use crate::operation::OperationKind;
use crate::query_executor::ExecutionRequest;
use crate::query_plan::ExecutionPlan;

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Each upstream connection carries exactly one subscription.
const UPSTREAM_ID: &str = "1";

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebSocketProtocol {
    /// subscriptions-transport-ws: `start` / `data` / `stop`.
    #[default]
    GraphqlWs,
    /// graphql-ws: `subscribe` / `next` / `complete`.
    GraphqlTransportWs,
}

impl WebSocketProtocol {
    /// The `Sec-WebSocket-Protocol` value.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            WebSocketProtocol::GraphqlWs => "graphql-ws",
            WebSocketProtocol::GraphqlTransportWs => "graphql-transport-ws",
        }
    }

    pub fn from_subprotocol(value: &str) -> Option<Self> {
        match value.trim() {
            "graphql-ws" => Some(WebSocketProtocol::GraphqlWs),
            "graphql-transport-ws" => Some(WebSocketProtocol::GraphqlTransportWs),
            _ => None,
        }
    }

    /// The message type carrying subscription results.
    pub fn data_type(&self) -> &'static str {
        match self {
            WebSocketProtocol::GraphqlWs => "data",
            WebSocketProtocol::GraphqlTransportWs => "next",
        }
    }

    fn subscribe(&self, id: String, payload: GraphQLRequest) -> ClientMessage {
        match self {
            WebSocketProtocol::GraphqlWs => ClientMessage::Start { id, payload },
            WebSocketProtocol::GraphqlTransportWs => ClientMessage::Subscribe { id, payload },
        }
    }

    fn complete(&self, id: String) -> ClientMessage {
        match self {
            WebSocketProtocol::GraphqlWs => ClientMessage::Stop { id },
            WebSocketProtocol::GraphqlTransportWs => ClientMessage::Complete { id },
        }
    }
}

/// Messages sent by the client side of a GraphQL WebSocket, for both protocols.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ClientMessage {
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: GraphQLRequest,
    },
    Start {
        id: String,
        payload: GraphQLRequest,
    },
    Complete {
        id: String,
    },
    Stop {
        id: String,
    },
    ConnectionTerminate,
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

/// Messages received from a subgraph's WebSocket.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ServerMessage {
    ConnectionAck,
    #[serde(alias = "data")]
    Next {
        id: String,
        payload: Value,
    },
    #[serde(alias = "connection_error")]
    Error {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        payload: Value,
    },
    Complete {
        id: String,
    },
    #[serde(rename = "ka")]
    KeepAlive,
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default)]
        payload: Option<Value>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    /// An execution result, exactly as the subgraph sent it.
    Data(Value),
    /// Terminal. The subgraph reported errors or the connection dropped.
    Error(Vec<graphql::Error>),
    /// Terminal. The subgraph ended the subscription.
    Complete,
}

impl SubscriptionEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, SubscriptionEvent::Data(_))
    }
}

pub struct SubscriptionBridge {
    buffer: usize,
    ack_timeout: Duration,
}

impl SubscriptionBridge {
    /// `buffer` bounds the events queued per session. A full queue stops the
    /// relay from reading the upstream socket until the consumer catches up.
    pub fn new(buffer: usize) -> Self {
        SubscriptionBridge {
            buffer: buffer.max(1),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Connects to the owning subgraph, performs the handshake and starts
    /// relaying. The session ends when `token` is cancelled, the session is
    /// closed or dropped, or the subgraph ends it.
    pub async fn open(
        &self,
        plan: &ExecutionPlan,
        request: &ExecutionRequest,
        token: CancellationToken,
    ) -> Result<SubscriptionSession, SubscriptionError> {
        if plan.kind() != OperationKind::Subscription {
            return Err(SubscriptionError::NotASubscription);
        }
        let fetch = plan
            .fetches()
            .next()
            .ok_or(SubscriptionError::NotASubscription)?;
        let service_name = fetch.service_name.clone();
        let service = plan
            .schema()
            .service(&service_name)
            .ok_or_else(|| SubscriptionError::NoWebSocketUrl(service_name.clone()))?;
        let ws_url = service
            .ws_url
            .as_deref()
            .ok_or_else(|| SubscriptionError::NoWebSocketUrl(service_name.clone()))?;
        let protocol = service.ws_protocol;

        let mut socket = connect(&service_name, ws_url, protocol, &request.headers).await?;

        send(&mut socket, &ClientMessage::ConnectionInit { payload: None })
            .await
            .map_err(|reason| SubscriptionError::Send {
                service: service_name.clone(),
                reason,
            })?;
        match tokio::time::timeout(self.ack_timeout, await_ack(&mut socket, protocol)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                return Err(SubscriptionError::ConnectionAck {
                    service: service_name,
                    reason,
                });
            }
            Err(_) => {
                return Err(SubscriptionError::ConnectionAck {
                    service: service_name,
                    reason: format!("no connection_ack within {:?}", self.ack_timeout),
                });
            }
        }

        let variables: Map<String, Value> = fetch
            .variable_usages
            .iter()
            .filter_map(|name| {
                request
                    .variables
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect();
        let payload = GraphQLRequest {
            query: fetch.operation.clone(),
            variables: Some(Value::Object(variables)),
            operation_name: fetch.operation_name.clone(),
            auth_headers: None,
        };
        send(&mut socket, &protocol.subscribe(UPSTREAM_ID.to_owned(), payload))
            .await
            .map_err(|reason| SubscriptionError::Send {
                service: service_name.clone(),
                reason,
            })?;

        let token = token.child_token();
        let (sender, receiver) = mpsc::channel(self.buffer);
        let span = tracing::info_span!("subscription", service = %service_name);
        let relay = tokio::spawn(relay(socket, protocol, sender, token.clone()).instrument(span));
        tracing::debug!(service = %service_name, "subscription opened");

        Ok(SubscriptionSession {
            service: service_name,
            receiver,
            token,
            relay: Some(relay),
        })
    }
}

/// One open upstream subscription.
pub struct SubscriptionSession {
    service: String,
    receiver: mpsc::Receiver<SubscriptionEvent>,
    token: CancellationToken,
    relay: Option<JoinHandle<()>>,
}

impl SubscriptionSession {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The next event, or `None` once the session has ended.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.receiver.recv().await
    }

    /// Stops the upstream subscription and waits for the socket to close.
    pub async fn close(mut self) {
        self.token.cancel();
        if let Some(relay) = self.relay.take() {
            let _ = relay.await;
        }
    }
}

impl Drop for SubscriptionSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn connect(
    service: &str,
    ws_url: &str,
    protocol: WebSocketProtocol,
    headers: &HashMap<String, String>,
) -> Result<UpstreamSocket, SubscriptionError> {
    let connect_error = |reason: String| SubscriptionError::Connect {
        service: service.to_owned(),
        reason,
    };
    let mut request = ws_url
        .into_client_request()
        .map_err(|e| connect_error(e.to_string()))?;
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(protocol.subprotocol()),
    );
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                request.headers_mut().insert(name, value);
            }
            _ => tracing::debug!(header = %name, "skipping header that is not valid HTTP"),
        }
    }
    let (socket, _response) = connect_async(request)
        .await
        .map_err(|e| connect_error(e.to_string()))?;
    Ok(socket)
}

async fn send(socket: &mut UpstreamSocket, message: &ClientMessage) -> Result<(), String> {
    let text = serde_json::to_string(message).map_err(|e| e.to_string())?;
    socket
        .send(Message::text(text))
        .await
        .map_err(|e| e.to_string())
}

/// Waits for `connection_ack`, skipping keep-alives.
async fn await_ack(socket: &mut UpstreamSocket, protocol: WebSocketProtocol) -> Result<(), String> {
    loop {
        let text = match socket.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                return Err("connection closed before connection_ack".to_owned());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.to_string()),
        };
        match serde_json::from_str::<ServerMessage>(text.as_str()) {
            Ok(ServerMessage::ConnectionAck) => return Ok(()),
            Ok(ServerMessage::Ping { payload }) => {
                if protocol == WebSocketProtocol::GraphqlTransportWs {
                    send(socket, &ClientMessage::Pong { payload }).await?;
                }
            }
            Ok(ServerMessage::KeepAlive | ServerMessage::Pong { .. }) => {}
            Ok(ServerMessage::Error { payload, .. }) => {
                let reasons: Vec<String> = errors_from_payload(payload)
                    .into_iter()
                    .map(|error| error.message)
                    .collect();
                return Err(reasons.join("; "));
            }
            Ok(other) => return Err(format!("expected connection_ack, got {other:?}")),
            Err(e) => return Err(format!("invalid message: {e}")),
        }
    }
}

async fn relay(
    mut socket: UpstreamSocket,
    protocol: WebSocketProtocol,
    sender: mpsc::Sender<SubscriptionEvent>,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => {
                stop(&mut socket, protocol).await;
                return;
            }
            _ = sender.closed() => {
                tracing::debug!("subscriber went away");
                stop(&mut socket, protocol).await;
                return;
            }
            message = socket.next() => message,
        };

        let event = match message {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                Ok(ServerMessage::Next { payload, .. }) => SubscriptionEvent::Data(payload),
                Ok(ServerMessage::Error { payload, .. }) => {
                    SubscriptionEvent::Error(errors_from_payload(payload))
                }
                Ok(ServerMessage::Complete { .. }) => SubscriptionEvent::Complete,
                Ok(ServerMessage::Ping { payload }) => {
                    if protocol == WebSocketProtocol::GraphqlTransportWs {
                        if let Err(reason) = send(&mut socket, &ClientMessage::Pong { payload }).await {
                            tracing::debug!(%reason, "failed to answer ping");
                        }
                    }
                    continue;
                }
                Ok(
                    ServerMessage::ConnectionAck
                    | ServerMessage::KeepAlive
                    | ServerMessage::Pong { .. },
                ) => continue,
                Err(error) => {
                    tracing::warn!(%error, "ignoring malformed subscription message");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|frame| format!("{} {}", u16::from(frame.code), frame.reason))
                    .unwrap_or_else(|| "no close frame".to_owned());
                disconnected(format!("subgraph closed the connection ({reason})"))
            }
            Some(Ok(_)) => continue,
            Some(Err(error)) => disconnected(error.to_string()),
            None => disconnected("connection ended unexpectedly".to_owned()),
        };

        let terminal = event.is_terminal();
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                stop(&mut socket, protocol).await;
                return;
            }
            sent = sender.send(event) => {
                if sent.is_err() {
                    stop(&mut socket, protocol).await;
                    return;
                }
            }
        }
        if terminal {
            let _ = socket.close(None).await;
            tracing::debug!("subscription ended");
            return;
        }
    }
}

fn disconnected(reason: String) -> SubscriptionEvent {
    tracing::warn!(%reason, "upstream subscription dropped");
    SubscriptionEvent::Error(vec![
        graphql::Error::new(format!("subscription connection lost: {reason}"))
            .with_code("SUBSCRIPTION_UPSTREAM_DISCONNECTED"),
    ])
}

/// Ends the upstream subscription and closes the socket.
async fn stop(socket: &mut UpstreamSocket, protocol: WebSocketProtocol) {
    if let Err(reason) = send(socket, &protocol.complete(UPSTREAM_ID.to_owned())).await {
        tracing::debug!(%reason, "failed to send stop upstream");
    }
    let _ = socket.close(None).await;
    tracing::debug!("subscription stopped");
}
