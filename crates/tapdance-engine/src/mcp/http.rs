//! HTTP transports: streamable HTTP and the legacy SSE pair.
//!
//! Both feed [`super::stdio::dispatch`], so tool semantics are identical to
//! the stdio transport. Streamable HTTP is one `POST /mcp` endpoint with an
//! `Mcp-Session-Id` header assigned on first contact; legacy SSE splits the
//! exchange into a `GET /sse` event stream and `POST /message?sessionId=`
//! requests whose responses arrive on the stream.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;
use warp::Filter;
use warp::http::StatusCode;

use super::server::McpServer;
use super::stdio::{JsonRpcRequest, JsonRpcResponse, dispatch};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";

type SseSessions = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<JsonRpcResponse>>>>;

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

fn with<T: Clone + Send>(value: T) -> impl Filter<Extract = (T,), Error = Infallible> + Clone {
    warp::any().map(move || value.clone())
}

/// The complete route set for one server: `/mcp`, `/sse`, `/message`, and a
/// `/health` probe.
pub fn routes(
    server: Arc<McpServer>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let sessions: SseSessions = Arc::new(Mutex::new(HashMap::new()));

    let mcp = warp::path("mcp")
        .and(warp::path::end())
        .and(warp::post())
        .and(with(server.clone()))
        .and(warp::header::optional::<String>("mcp-session-id"))
        .and(warp::body::json())
        .and_then(handle_mcp);

    let sse = warp::path("sse")
        .and(warp::path::end())
        .and(warp::get())
        .and(with(server.clone()))
        .and(with(sessions.clone()))
        .and_then(handle_sse);

    let message = warp::path("message")
        .and(warp::path::end())
        .and(warp::post())
        .and(with(server.clone()))
        .and(with(sessions))
        .and(warp::query::<MessageQuery>())
        .and(warp::body::json())
        .and_then(handle_message);

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with(server))
        .map(|server: Arc<McpServer>| warp::reply::json(&server.ping()));

    mcp.or(sse).or(message).or(health)
}

pub async fn serve(server: Arc<McpServer>, addr: SocketAddr) {
    info!(%addr, "http transport listening");
    warp::serve(routes(server)).run(addr).await;
}

async fn handle_mcp(
    server: Arc<McpServer>,
    session: Option<String>,
    body: Value,
) -> Result<impl warp::Reply, Infallible> {
    let session_id = session.unwrap_or_else(|| Uuid::new_v4().to_string());

    let outgoing = match serde_json::from_value::<JsonRpcRequest>(body) {
        Ok(request) => dispatch(&server, request).await,
        Err(e) => Some(JsonRpcResponse::parse_error(e)),
    };
    let (body, status) = match outgoing {
        Some(response) => (
            serde_json::to_value(&response).unwrap_or_else(|_| json!(null)),
            StatusCode::OK,
        ),
        // Notifications are accepted with no body.
        None => (json!(null), StatusCode::ACCEPTED),
    };
    Ok(warp::reply::with_header(
        warp::reply::with_status(warp::reply::json(&body), status),
        SESSION_HEADER,
        session_id,
    ))
}

async fn handle_sse(
    server: Arc<McpServer>,
    sessions: SseSessions,
) -> Result<impl warp::Reply, Infallible> {
    let session_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
    sessions.lock().unwrap().insert(session_id.clone(), tx);
    info!(session_id, "sse session opened");

    // The first event tells the client where to post its requests.
    let endpoint_data = format!("/message?sessionId={session_id}");
    let endpoint = futures::stream::once(async move {
        Ok::<_, Infallible>(
            warp::sse::Event::default()
                .event("endpoint")
                .data(endpoint_data),
        )
    });
    let responses = futures::stream::unfold(rx, |mut rx| async move {
        let response = rx.recv().await?;
        let event = warp::sse::Event::default()
            .event("message")
            .json_data(&response)
            .unwrap_or_else(|_| warp::sse::Event::default().event("message").data("{}"));
        Some((Ok::<_, Infallible>(event), rx))
    });
    // Progress from long-running tools rides the same stream as
    // notifications. A lagged receiver just skips to the newest events.
    let progress = futures::stream::unfold(
        server.context().subscribe_progress(),
        |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let notification = json!({
                            "jsonrpc": "2.0",
                            "method": "notifications/progress",
                            "params": event,
                        });
                        let event = warp::sse::Event::default()
                            .event("message")
                            .json_data(&notification)
                            .unwrap_or_else(|_| {
                                warp::sse::Event::default().event("message").data("{}")
                            });
                        return Some((Ok::<_, Infallible>(event), rx));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );

    Ok(warp::sse::reply(
        warp::sse::keep_alive().stream(endpoint.chain(futures::stream::select(responses, progress))),
    ))
}

async fn handle_message(
    server: Arc<McpServer>,
    sessions: SseSessions,
    query: MessageQuery,
    body: Value,
) -> Result<impl warp::Reply, Infallible> {
    let outgoing = match serde_json::from_value::<JsonRpcRequest>(body) {
        Ok(request) => dispatch(&server, request).await,
        Err(e) => Some(JsonRpcResponse::parse_error(e)),
    };

    if let Some(response) = outgoing {
        let tx = sessions.lock().unwrap().get(&query.session_id).cloned();
        match tx {
            Some(tx) => {
                if tx.send(response).is_err() {
                    // Client hung up; forget the session.
                    sessions.lock().unwrap().remove(&query.session_id);
                    warn!(session_id = %query.session_id, "sse session dropped");
                }
            }
            None => {
                return Ok(warp::reply::with_status(
                    "unknown sessionId",
                    StatusCode::NOT_FOUND,
                ));
            }
        }
    }
    Ok(warp::reply::with_status("Accepted", StatusCode::ACCEPTED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use crate::mcp::context::EngineContext;
    use crate::session::{DeviceDiscovery, DeviceSessionManager};
    use crate::testutil::MockBridge;
    use async_trait::async_trait;
    use tapdance_adb::Device;

    struct EmptyDiscovery;

    #[async_trait]
    impl DeviceDiscovery for EmptyDiscovery {
        async fn list(&self) -> Result<Vec<Device>> {
            Ok(Vec::new())
        }
    }

    fn server() -> Arc<McpServer> {
        let bridge = Arc::new(MockBridge::new());
        let sessions = Arc::new(DeviceSessionManager::new(Arc::new(EmptyDiscovery)));
        let context = Arc::new(EngineContext::new(bridge, sessions));
        McpServer::new(context).unwrap()
    }

    #[tokio::test]
    async fn mcp_post_assigns_session_header_on_first_contact() {
        let routes = routes(server());
        let response = warp::test::request()
            .method("POST")
            .path("/mcp")
            .json(&json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("mcp-session-id"));
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["result"]["tools"].as_array().is_some());
    }

    #[tokio::test]
    async fn mcp_post_echoes_an_existing_session_id() {
        let routes = routes(server());
        let response = warp::test::request()
            .method("POST")
            .path("/mcp")
            .header("mcp-session-id", "abc-123")
            .json(&json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
            .reply(&routes)
            .await;
        assert_eq!(response.headers()["mcp-session-id"], "abc-123");
    }

    #[tokio::test]
    async fn message_with_unknown_session_is_not_found() {
        let routes = routes(server());
        let response = warp::test::request()
            .method("POST")
            .path("/message?sessionId=nope")
            .json(&json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_probe_reports_tool_count() {
        let routes = routes(server());
        let response = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["tools"].as_u64().unwrap() > 0);
    }
}
