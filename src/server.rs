//! The HTTP front door: GraphQL over POST, WebSocket upgrades for
//! subscriptions, a health check and CORS preflight.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{FederationGateway, GraphQLRequest, websocket};

/// Client headers passed on to subgraphs.
pub(crate) const FORWARDED_HEADERS: [&str; 3] = ["authorization", "x-api-key", "x-token"];

pub(crate) type Body = BoxBody<Bytes, hyper::Error>;

/// Accepts connections until `shutdown` is cancelled, then lets in-flight
/// connections finish.
pub async fn serve(
    listener: TcpListener,
    gateway: Arc<FederationGateway>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    tracing::info!(address = %listener.local_addr()?, "gateway listening");

    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(%error, "failed to accept connection");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let gateway = Arc::clone(&gateway);
        let shutdown = shutdown.clone();
        let span = tracing::debug_span!("connection", %remote);

        tokio::task::spawn(
            async move {
                let service_shutdown = shutdown.clone();
                let service = service_fn(move |req| {
                    handle_request(req, Arc::clone(&gateway), service_shutdown.clone())
                });

                let builder = auto::Builder::new(TokioExecutor::new());
                let connection = builder.serve_connection_with_upgrades(io, service);
                tokio::pin!(connection);

                let result = tokio::select! {
                    result = connection.as_mut() => result,
                    _ = shutdown.cancelled() => {
                        connection.as_mut().graceful_shutdown();
                        connection.await
                    }
                };
                match result {
                    Ok(()) => tracing::debug!("connection closed"),
                    Err(error) => tracing::debug!(%error, "error processing connection"),
                }
            }
            .instrument(span),
        );
    }
}

pub(crate) async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<FederationGateway>,
    shutdown: CancellationToken,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => graphql_post(req, &gateway, &shutdown).await,

        (&Method::GET, "/graphql") if websocket::is_upgrade_request(&req) => {
            websocket::upgrade(req, gateway, shutdown)
        }

        (&Method::GET, "/graphql") => text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "Send queries with POST or open a WebSocket for subscriptions",
        ),

        (&Method::GET, "/health") => {
            let (status, body) = match gateway.schema_registry().current_schema() {
                Some(schema) => (
                    StatusCode::OK,
                    json!({"status": "ok", "schema_version": schema.version()}),
                ),
                None => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({"status": "waiting for schema"}),
                ),
            };
            json_response(status, body.to_string())
        }

        (&Method::OPTIONS, _) => Response::builder()
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header(
                "Access-Control-Allow-Headers",
                "Content-Type, Authorization, x-api-key, x-token",
            )
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

async fn graphql_post(
    req: Request<Incoming>,
    gateway: &FederationGateway,
    shutdown: &CancellationToken,
) -> Response<Body> {
    let auth_headers = extract_auth_headers(req.headers());
    let body_bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return text_response(StatusCode::BAD_REQUEST, "Failed to read request body"),
    };
    let mut request = match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
        Ok(request) => request,
        Err(e) => {
            return text_response(StatusCode::BAD_REQUEST, format!("Invalid JSON request: {e}"));
        }
    };
    request.auth_headers = auth_headers;

    // hyper drops this future when the client goes away, which cancels the plan.
    let token = shutdown.child_token();
    let _guard = token.clone().drop_guard();
    let response = gateway.process_request(request, token).await;
    json_response(StatusCode::OK, response.to_json())
}

pub(crate) fn full<T: Into<Bytes>>(value: T) -> Body {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(full(body))
        .unwrap_or_else(|_| internal_server_error())
}

pub(crate) fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Access-Control-Allow-Origin", "*")
        .body(full(body))
        .unwrap_or_else(|_| internal_server_error())
}

pub(crate) fn internal_server_error() -> Response<Body> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

/// Picks the forwarded headers out of a client request.
pub(crate) fn extract_auth_headers(headers: &HeaderMap) -> Option<HashMap<String, String>> {
    let auth_headers: HashMap<String, String> = FORWARDED_HEADERS
        .iter()
        .filter_map(|name| {
            let value = headers.get(*name)?.to_str().ok()?;
            Some(((*name).to_owned(), value.to_owned()))
        })
        .collect();

    if auth_headers.is_empty() {
        None
    } else {
        Some(auth_headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{AUTHORIZATION, HeaderValue};

    #[test]
    fn only_forwarded_headers_are_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert("x-token", HeaderValue::from_static("t"));
        headers.insert("cookie", HeaderValue::from_static("session=1"));

        let extracted = extract_auth_headers(&headers).unwrap();
        assert_eq!(extracted.len(), 2);
        assert_eq!(extracted["authorization"], "Bearer abc");
        assert_eq!(extracted["x-token"], "t");

        assert_eq!(extract_auth_headers(&HeaderMap::new()), None);
    }
}
