//! Recording fake MCP server for client transport tests.
//!
//! Replies are canned per route key: `"POST <rpc method>"`, `"GET"`,
//! `"GET <last-event-id>"` or `"DELETE"`. A route with several replies
//! hands them out in order and then repeats the last one. `{id}` in a body
//! is replaced by the JSON id of the POSTed request.

#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    response::Response,
    routing::any,
    Router,
};
use mcpwire_mcp::{ClientConfig, ReconnectConfig};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const INIT_RESULT: &str = r#"{"jsonrpc":"2.0","id":{id},"result":{"protocolVersion":"2025-06-18","capabilities":{},"serverInfo":{"name":"testServer","version":"v1.0.0"}}}"#;

pub const EMPTY_RESULT: &str = r#"{"jsonrpc":"2.0","id":{id},"result":{}}"#;

/// One canned HTTP reply.
#[derive(Debug, Clone)]
pub struct Canned {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: String,
    pub session_id: Option<String>,
    pub hang: bool,
}

impl Canned {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: String::new(),
            session_id: None,
            hang: false,
        }
    }

    pub fn json(body: &str) -> Self {
        Self {
            status: 200,
            content_type: Some("application/json"),
            body: body.to_string(),
            session_id: None,
            hang: false,
        }
    }

    pub fn sse(body: &str) -> Self {
        Self {
            status: 200,
            content_type: Some("text/event-stream"),
            body: body.to_string(),
            session_id: None,
            hang: false,
        }
    }

    pub fn content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn with_session(mut self, id: &str) -> Self {
        self.session_id = Some(id.to_string());
        self
    }

    /// Keep the body open after writing it.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

/// A request the fake server saw.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub key: String,
    pub session_id: Option<String>,
    pub protocol_version: Option<String>,
    pub last_event_id: Option<String>,
    pub body: Option<Value>,
}

#[derive(Default)]
struct Inner {
    routes: HashMap<String, VecDeque<Canned>>,
    calls: Vec<Recorded>,
}

#[derive(Clone, Default)]
struct Shared(Arc<Mutex<Inner>>);

pub struct FakeServer {
    pub endpoint: String,
    shared: Shared,
    task: JoinHandle<()>,
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FakeServer {
    /// Start a server. Routes for initialize, initialized, cancelled, GET
    /// and DELETE get defaults unless given.
    pub async fn start(routes: Vec<(&str, Canned)>) -> Self {
        let shared = Shared::default();
        {
            let mut inner = shared.0.lock().unwrap();
            for (key, canned) in routes {
                inner
                    .routes
                    .entry(key.to_string())
                    .or_default()
                    .push_back(canned);
            }
            let defaults = [
                ("POST initialize", Canned::json(INIT_RESULT).with_session("123")),
                ("POST notifications/initialized", Canned::status(202)),
                ("POST notifications/cancelled", Canned::status(202)),
                ("GET", Canned::status(405)),
                ("DELETE", Canned::status(204)),
            ];
            for (key, canned) in defaults {
                inner
                    .routes
                    .entry(key.to_string())
                    .or_insert_with(|| VecDeque::from([canned]));
            }
        }

        let router = Router::new()
            .route("/mcp", any(handle))
            .with_state(shared.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            endpoint: format!("http://{addr}/mcp"),
            shared,
            task,
        }
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.shared.0.lock().unwrap().calls.clone()
    }

    pub fn count(&self, key: &str) -> usize {
        self.calls().iter().filter(|c| c.key == key).count()
    }

    pub fn find(&self, key: &str) -> Option<Recorded> {
        self.calls().into_iter().find(|c| c.key == key)
    }

    /// Wait until a request with `key` has been seen.
    pub async fn wait_for(&self, key: &str) -> Recorded {
        for _ in 0..200 {
            if let Some(call) = self.find(key) {
                return call;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no {key} request seen; calls: {:?}", self.calls());
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn handle(
    State(shared): State<Shared>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let json: Option<Value> = serde_json::from_slice(&body).ok();
    let last_event_id = header(&headers, "last-event-id");
    let key = match method.as_str() {
        "POST" => {
            let rpc_method = json
                .as_ref()
                .and_then(|v| v.get("method"))
                .and_then(Value::as_str)
                .unwrap_or("<response>");
            format!("POST {rpc_method}")
        }
        "GET" => match &last_event_id {
            Some(id) => format!("GET {id}"),
            None => "GET".to_string(),
        },
        other => other.to_string(),
    };
    let request_id = json
        .as_ref()
        .and_then(|v| v.get("id"))
        .map(Value::to_string)
        .unwrap_or_else(|| "null".to_string());

    let canned = {
        let mut inner = shared.0.lock().unwrap();
        inner.calls.push(Recorded {
            key: key.clone(),
            session_id: header(&headers, "mcp-session-id"),
            protocol_version: header(&headers, "mcp-protocol-version"),
            last_event_id,
            body: json,
        });
        match inner.routes.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
    };

    let Some(canned) = canned else {
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from(format!("no canned reply for {key}")))
            .unwrap();
    };

    let mut builder = Response::builder().status(canned.status);
    if let Some(content_type) = canned.content_type {
        builder = builder.header("content-type", content_type);
    }
    if let Some(session_id) = &canned.session_id {
        builder = builder.header("mcp-session-id", session_id.as_str());
    }

    let text = canned.body.replace("{id}", &request_id);
    if canned.hang {
        let stream = async_stream::stream! {
            yield Ok::<_, Infallible>(Bytes::from(text));
            futures::future::pending::<()>().await;
        };
        builder.body(Body::from_stream(stream)).unwrap()
    } else {
        builder.body(Body::from(text)).unwrap()
    }
}

/// A reconnect policy fast enough for tests.
pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay_ms: 10,
        max_delay_ms: 50,
        growth_factor: 2.0,
        max_elapsed_ms: 2_000,
    }
}

pub fn client_config(server: &FakeServer) -> ClientConfig {
    ClientConfig::new(&server.endpoint).with_reconnect(fast_reconnect())
}

/// An SSE record carrying one message.
pub fn sse_event(id: u64, message: &str) -> String {
    format!("id: {id}\ndata: {message}\n\n")
}
