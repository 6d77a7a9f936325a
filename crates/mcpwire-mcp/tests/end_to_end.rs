//! The client transport against the real streamable HTTP router.

mod common;

use common::fast_reconnect;
use mcpwire_mcp::protocol::{ListChangedCapability, ListKind, ServerCapabilities};
use mcpwire_mcp::{
    create_mcp_router, ClientConfig, ClientOptions, ClientSession, JsonRpcError, McpError,
    McpHttpState, MethodRegistry, RequestContext, ServerOptions, VersionPolicy,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestServer {
    endpoint: String,
    state: McpHttpState,
    task: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn methods() -> MethodRegistry<RequestContext> {
    MethodRegistry::new()
        .with("echo", |_ctx: RequestContext, params: Value| async move {
            Ok::<_, JsonRpcError>(params)
        })
        .with("count", |ctx: RequestContext, _params: Value| async move {
            for step in 1..=3 {
                ctx.progress(step as f64, Some(3.0), None)
                    .await
                    .map_err(|e| JsonRpcError::internal(e.to_string()))?;
            }
            Ok::<_, JsonRpcError>(json!({ "done": true }))
        })
        .with("reconnect", |ctx: RequestContext, _params: Value| async move {
            ctx.notify("notifications/message", Some(json!({"level": "info", "data": "before"})))
                .await
                .map_err(|e| JsonRpcError::internal(e.to_string()))?;
            ctx.close_stream(Some(Duration::from_millis(10))).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.notify("notifications/message", Some(json!({"level": "info", "data": "after"})))
                .await
                .map_err(|e| JsonRpcError::internal(e.to_string()))?;
            Ok::<_, JsonRpcError>(json!({ "resumed": true }))
        })
        .with("ask_client", |ctx: RequestContext, _params: Value| async move {
            ctx.session()
                .request("ping", None)
                .await
                .map_err(|e| JsonRpcError::internal(e.to_string()))
        })
        .with("wait_cancel", |ctx: RequestContext, _params: Value| async move {
            ctx.cancellation().cancelled().await;
            Ok::<_, JsonRpcError>(json!({ "cancelled": true }))
        })
}

async fn start(state: McpHttpState) -> TestServer {
    let router = create_mcp_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    TestServer {
        endpoint: format!("http://{addr}/mcp"),
        state,
        task,
    }
}

async fn start_default() -> TestServer {
    start(McpHttpState::new(
        "test-server",
        "1.0.0",
        ServerOptions::default(),
        methods(),
    ))
    .await
}

fn config(server: &TestServer) -> ClientConfig {
    ClientConfig::new(&server.endpoint).with_reconnect(fast_reconnect())
}

async fn connect(server: &TestServer) -> ClientSession {
    ClientSession::connect(config(server), ClientOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_json_fast_path() {
    let server = start_default().await;
    let session = connect(&server).await;

    let info = session.server_info().unwrap();
    assert_eq!(info.server_info.name, "test-server");

    let result = session.call("echo", Some(json!({"text": "hi"}))).await.unwrap();
    assert_eq!(result, json!({"text": "hi"}));
    session.ping().await.unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_progress_streams_before_result() {
    let server = start_default().await;
    let session = connect(&server).await;
    let mut notifications = session.subscribe();

    let result = session
        .call("count", Some(json!({"_meta": {"progressToken": "p1"}})))
        .await
        .unwrap();
    assert_eq!(result, json!({"done": true}));

    for step in 1..=3 {
        let notification = notifications.try_recv().unwrap();
        assert_eq!(notification.method, "notifications/progress");
        let params = notification.params.unwrap();
        assert_eq!(params["progressToken"], json!("p1"));
        assert_eq!(params["progress"], json!(step as f64));
    }
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_resumes_after_server_closes_stream() {
    let server = start_default().await;
    let session = connect(&server).await;
    let mut notifications = session.subscribe();

    let result = session.call("reconnect", None).await.unwrap();
    assert_eq!(result, json!({"resumed": true}));

    let mut seen = Vec::new();
    while let Ok(notification) = notifications.try_recv() {
        if notification.method == "notifications/message" {
            seen.push(notification.params.unwrap()["data"].clone());
        }
    }
    assert_eq!(seen, vec![json!("before"), json!("after")]);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls() {
    let server = start_default().await;
    let session = connect(&server).await;

    let calls = (0..20).map(|i| {
        let session = session.clone();
        async move { (i, session.call("echo", Some(json!({ "n": i }))).await) }
    });
    for (i, result) in futures::future::join_all(calls).await {
        assert_eq!(result.unwrap(), json!({ "n": i }));
    }
    assert_eq!(session.pending_calls().await, 0);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_server_request_answered_by_client() {
    let server = start_default().await;
    let session = connect(&server).await;

    let result = tokio::time::timeout(Duration::from_secs(5), session.call("ask_client", None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, json!({}));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_reaches_server_handler() {
    let server = start_default().await;
    let session = connect(&server).await;
    let id = session.session_id().await.unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });
    let err = session
        .call_with_cancel("wait_cancel", None, cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Cancelled));

    let server_session = server.state.sessions().get(&id).await.unwrap();
    let mut drained = false;
    for _ in 0..100 {
        if server_session.in_flight().await == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(drained, "handler was not cancelled");
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_close_deletes_server_session() {
    let server = start_default().await;
    let session = connect(&server).await;
    let id = session.session_id().await.unwrap();
    assert!(server.state.sessions().get(&id).await.is_some());

    session.close().await.unwrap();
    assert!(server.state.sessions().get(&id).await.is_none());
    assert!(matches!(session.ping().await, Err(McpError::Closed)));
}

#[tokio::test]
async fn test_strict_version_header() {
    let options = ServerOptions {
        version_policy: VersionPolicy::Strict,
        ..Default::default()
    };
    let server = start(McpHttpState::new("test-server", "1.0.0", options, methods())).await;
    let session = connect(&server).await;
    session.ping().await.unwrap();

    let id = session.session_id().await.unwrap();
    let ping = json!({"jsonrpc": "2.0", "id": 99, "method": "ping"});
    let response = reqwest::Client::new()
        .post(&server.endpoint)
        .header("accept", "application/json, text/event-stream")
        .header("mcp-session-id", &id)
        .json(&ping)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_bearer_auth() {
    let state = McpHttpState::new("test-server", "1.0.0", ServerOptions::default(), methods())
        .with_api_key("secret");
    let server = start(state).await;

    let err = ClientSession::connect(config(&server), ClientOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_fatal(), "{err}");
    assert!(err.to_string().contains("401"), "{err}");

    let session = ClientSession::connect(
        config(&server).with_auth_token("secret"),
        ClientOptions::default(),
    )
    .await
    .unwrap();
    session.ping().await.unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_list_changed_follows_capabilities() {
    let options = ServerOptions {
        capabilities: ServerCapabilities {
            tools: Some(ListChangedCapability { list_changed: true }),
            ..Default::default()
        },
        ..Default::default()
    };
    let server = start(McpHttpState::new("test-server", "1.0.0", options, methods())).await;
    let session = connect(&server).await;
    let mut notifications = session.subscribe();

    let id = session.session_id().await.unwrap();
    let server_session = server.state.sessions().get(&id).await.unwrap();
    assert!(server_session.notify_list_changed(ListKind::Tools).await.unwrap());
    assert!(!server_session.notify_list_changed(ListKind::Prompts).await.unwrap());

    let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.method, "notifications/tools/list_changed");
    session.close().await.unwrap();
}
