//! The client side of GraphQL subscriptions: WebSocket upgrade and one
//! relay task per client subscription.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use http::header::{
    CONNECTION, HeaderMap, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::server::{self, Body, FORWARDED_HEADERS};
use crate::subscription_bridge::{ClientMessage, SubscriptionEvent, WebSocketProtocol};
use crate::{FederationGateway, GraphQLRequest};

const OUTGOING_BUFFER: usize = 64;

pub(crate) fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let headers = req.headers();
    let connection_upgrade = headers
        .get(CONNECTION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
    let upgrade_websocket = headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    connection_upgrade && upgrade_websocket
}

/// Completes the handshake and serves the socket on a separate task once
/// hyper hands the connection over.
pub(crate) fn upgrade(
    mut req: Request<Incoming>,
    gateway: Arc<FederationGateway>,
    shutdown: CancellationToken,
) -> Response<Body> {
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        return server::text_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key");
    };
    let accept = derive_accept_key(key.as_bytes());
    let offered = negotiate(req.headers());
    let headers = server::extract_auth_headers(req.headers()).unwrap_or_default();
    let on_upgrade = hyper::upgrade::on(&mut req);

    let span = tracing::info_span!(
        "websocket",
        protocol = offered.unwrap_or_default().subprotocol()
    );
    tokio::task::spawn(
        async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let socket = WebSocketStream::from_raw_socket(
                        TokioIo::new(upgraded),
                        Role::Server,
                        None,
                    )
                    .await;
                    serve_socket(socket, headers, gateway, shutdown).await;
                }
                Err(error) => tracing::warn!(%error, "websocket upgrade failed"),
            }
        }
        .instrument(span),
    );

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = offered {
        builder = builder.header(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(protocol.subprotocol()),
        );
    }
    builder
        .body(server::full(""))
        .unwrap_or_else(|_| server::internal_server_error())
}

/// The first offered sub-protocol the gateway speaks.
fn negotiate(headers: &HeaderMap) -> Option<WebSocketProtocol> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(WebSocketProtocol::from_subprotocol)
}

async fn serve_socket<S>(
    socket: WebSocketStream<S>,
    mut headers: HashMap<String, String>,
    gateway: Arc<FederationGateway>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = socket.split();
    let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(OUTGOING_BUFFER);
    let writer = tokio::task::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            if let Err(error) = sink.send(message).await {
                tracing::debug!(%error, "client socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let connection = shutdown.child_token();
    let mut subscriptions: HashMap<String, CancellationToken> = HashMap::new();
    let mut relays: JoinSet<String> = JoinSet::new();

    loop {
        let message = tokio::select! {
            _ = connection.cancelled() => break,
            Some(finished) = relays.join_next(), if !relays.is_empty() => {
                if let Ok(id) = finished {
                    if subscriptions.get(&id).is_some_and(CancellationToken::is_cancelled) {
                        subscriptions.remove(&id);
                    }
                }
                continue;
            }
            message = stream.next() => message,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(error)) => {
                tracing::debug!(%error, "client socket read failed");
                break;
            }
        };
        let message = match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(%error, "malformed client message");
                let reply = json!({"type": "connection_error", "payload": {"message": error.to_string()}});
                if outgoing.send(Message::text(reply.to_string())).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let reply = match message {
            ClientMessage::ConnectionInit { payload } => {
                merge_init_headers(&mut headers, payload.as_ref());
                Some(json!({"type": "connection_ack"}))
            }
            ClientMessage::Start { id, payload } | ClientMessage::Subscribe { id, payload } => {
                if subscriptions.contains_key(&id) {
                    Some(envelope(
                        &id,
                        "error",
                        json!([{"message": format!("subscription id '{id}' is already in use")}]),
                    ))
                } else {
                    let token = connection.child_token();
                    subscriptions.insert(id.clone(), token.clone());
                    let mut request = payload;
                    if !headers.is_empty() {
                        request.auth_headers = Some(headers.clone());
                    }
                    let span = tracing::debug_span!("client_subscription", %id);
                    relays.spawn(
                        relay(id, request, Arc::clone(&gateway), outgoing.clone(), token)
                            .instrument(span),
                    );
                    None
                }
            }
            ClientMessage::Stop { id } | ClientMessage::Complete { id } => {
                if let Some(token) = subscriptions.remove(&id) {
                    token.cancel();
                }
                None
            }
            ClientMessage::ConnectionTerminate => break,
            ClientMessage::Ping { payload } => {
                let mut pong = json!({"type": "pong"});
                if let Some(payload) = payload {
                    pong["payload"] = payload;
                }
                Some(pong)
            }
            ClientMessage::Pong { .. } => None,
        };
        if let Some(reply) = reply {
            if outgoing.send(Message::text(reply.to_string())).await.is_err() {
                break;
            }
        }
    }

    // Every relay stops its upstream subscription before it returns.
    connection.cancel();
    while relays.join_next().await.is_some() {}
    drop(outgoing);
    let _ = writer.await;
    tracing::debug!("websocket closed");
}

/// Runs one client subscription until it ends or `token` is cancelled.
/// Results go out as `data` envelopes whichever sub-protocol the client
/// negotiated.
async fn relay(
    id: String,
    request: GraphQLRequest,
    gateway: Arc<FederationGateway>,
    outgoing: mpsc::Sender<Message>,
    token: CancellationToken,
) -> String {
    let opened = tokio::select! {
        biased;
        _ = token.cancelled() => return id,
        opened = gateway.subscribe(request, token.clone()) => opened,
    };
    let mut session = match opened {
        Ok(session) => session,
        Err(response) => {
            let payload = serde_json::to_value(&response.errors).unwrap_or(Value::Null);
            let _ = outgoing
                .send(Message::text(envelope(&id, "error", payload).to_string()))
                .await;
            token.cancel();
            return id;
        }
    };

    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => {
                session.close().await;
                return id;
            }
            event = session.recv() => event,
        };
        let (message, last) = match event {
            Some(SubscriptionEvent::Data(payload)) => {
                (envelope(&id, "data", payload), false)
            }
            Some(SubscriptionEvent::Error(errors)) => (
                envelope(&id, "error", serde_json::to_value(&errors).unwrap_or(Value::Null)),
                true,
            ),
            Some(SubscriptionEvent::Complete) | None => {
                (json!({"id": id, "type": "complete"}), true)
            }
        };
        if outgoing.send(Message::text(message.to_string())).await.is_err() {
            session.close().await;
            break;
        }
        if last {
            break;
        }
    }
    token.cancel();
    id
}

fn envelope(id: &str, kind: &str, payload: Value) -> Value {
    json!({"id": id, "type": kind, "payload": payload})
}

/// Forwarded headers may also arrive in the `connection_init` payload,
/// either at the top level or under `headers`.
fn merge_init_headers(headers: &mut HashMap<String, String>, payload: Option<&Value>) {
    let Some(payload) = payload.and_then(Value::as_object) else {
        return;
    };
    let nested = payload.get("headers").and_then(Value::as_object);
    for object in std::iter::once(payload).chain(nested) {
        for (name, value) in object {
            let lower = name.to_ascii_lowercase();
            if let (true, Some(value)) = (FORWARDED_HEADERS.contains(&lower.as_str()), value.as_str()) {
                headers.insert(lower, value.to_owned());
            }
        }
    }
}
