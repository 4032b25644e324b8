//! End-to-end tests: a real tool host on a loopback port and a client session.

use std::sync::Arc;
use std::time::Duration;

use mcp::{
    ClientSession, Error, ErrorKind, ServerConfig, SessionConfig, ToolContext, ToolDescriptor,
    ToolHandler, ToolRegistry, ToolServer,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Deserialize)]
struct AddParams {
    a: i64,
    b: i64,
}

fn registry() -> Arc<ToolRegistry> {
    let registry = ToolRegistry::new();
    registry
        .register(
            ToolDescriptor::new(
                "add",
                json!({
                    "type": "object",
                    "properties": { "a": { "type": "integer" }, "b": { "type": "integer" } },
                    "required": ["a", "b"]
                }),
            )
            .with_description("Add two integers"),
            ToolHandler::typed(|p: AddParams, _ctx| async move {
                Ok(json!({ "result": p.a + p.b }))
            }),
        )
        .unwrap();
    registry
        .register(
            ToolDescriptor::new("div", json!({ "type": "object" })),
            ToolHandler::from_async(|params: Value, _ctx| {
                let b = params["b"].as_i64().unwrap();
                async move { Ok(json!(10 / b)) }
            }),
        )
        .unwrap();
    registry
        .register(
            ToolDescriptor::new("echo", json!({ "type": "object" })),
            ToolHandler::from_async(|params: Value, _ctx| async move {
                let delay = params["delay_ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(params)
            }),
        )
        .unwrap();
    registry
        .register(
            ToolDescriptor::new("progress", json!({})),
            ToolHandler::from_async(|_, ctx: ToolContext| async move {
                ctx.progress(json!({ "pct": 50 })).await;
                Ok(json!("done"))
            }),
        )
        .unwrap();
    Arc::new(registry)
}

struct Host {
    url: String,
    server: ToolServer,
    shutdown: CancellationToken,
}

async fn start_host() -> Host {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let server = ToolServer::new(registry(), ServerConfig::default().with_name("test-host"));
    let shutdown = CancellationToken::new();
    let serve = server.clone();
    let token = shutdown.clone();
    tokio::spawn(async move {
        serve
            .serve(listener, async move { token.cancelled().await })
            .await
            .unwrap();
    });
    Host {
        url,
        server,
        shutdown,
    }
}

#[tokio::test]
async fn add_tool_round_trip() {
    let host = start_host().await;
    let session = ClientSession::connect(&host.url, SessionConfig::default())
        .await
        .unwrap();

    let out = session.call("add", json!({ "a": 7, "b": 22 })).await.unwrap();
    assert_eq!(out, json!({ "result": 29 }));

    session.close().await;
    host.shutdown.cancel();
}

#[tokio::test]
async fn discovery_lists_registered_tools() {
    let host = start_host().await;
    let session = ClientSession::connect(&host.url, SessionConfig::default())
        .await
        .unwrap();

    let tools = session.discover().await.unwrap();
    let names: Vec<_> = tools.iter().map(|t| t.name().to_string()).collect();
    assert_eq!(names, ["add", "div", "echo", "progress"]);

    let add = tools.iter().find(|t| t.name() == "add").unwrap();
    assert_eq!(add.description(), Some("Add two integers"));
    assert_eq!(add.call(json!({ "a": 1, "b": 2 })).await.unwrap(), json!({ "result": 3 }));

    session.ping().await.unwrap();
    session.close().await;
}

#[tokio::test]
async fn unknown_tool_does_not_break_session() {
    let host = start_host().await;
    let session = ClientSession::connect(&host.url, SessionConfig::default())
        .await
        .unwrap();

    let err = session.call("ghost", json!({})).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some(ErrorKind::UnknownTool));

    let err = session.call("add", json!({ "a": "seven" })).await.unwrap_err();
    assert_eq!(err.remote_kind(), Some(ErrorKind::Validation));

    let out = session.call("add", json!({ "a": 1, "b": 1 })).await.unwrap();
    assert_eq!(out, json!({ "result": 2 }));
    session.close().await;
}

#[tokio::test]
async fn panicking_handler_returns_handler_error() {
    let host = start_host().await;
    let session = ClientSession::connect(&host.url, SessionConfig::default())
        .await
        .unwrap();

    let err = session
        .call_with_timeout("div", json!({}), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert_eq!(err.remote_kind(), Some(ErrorKind::Handler));

    let out = session.call("div", json!({ "b": 5 })).await.unwrap();
    assert_eq!(out, json!(2));
    session.close().await;
    host.shutdown.cancel();
}

#[tokio::test]
async fn concurrent_calls_resolve_to_their_own_results() {
    let host = start_host().await;
    let session = ClientSession::connect(&host.url, SessionConfig::default())
        .await
        .unwrap();

    // Later calls finish first.
    let calls = (0..16u64).map(|i| {
        let session = session.clone();
        async move {
            let params = json!({ "n": i, "delay_ms": (16 - i) * 5 });
            let out = session.call("echo", params.clone()).await.unwrap();
            assert_eq!(out, params);
        }
    });
    futures::future::join_all(calls).await;
    assert_eq!(session.in_flight(), 0);
    session.close().await;
}

#[tokio::test]
async fn timed_out_call_leaves_session_usable() {
    let host = start_host().await;
    let session = ClientSession::connect(&host.url, SessionConfig::default())
        .await
        .unwrap();

    let err = session
        .call_with_timeout("echo", json!({ "delay_ms": 500 }), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    let out = session.call("add", json!({ "a": 2, "b": 3 })).await.unwrap();
    assert_eq!(out, json!({ "result": 5 }));
    session.close().await;
}

#[tokio::test]
async fn progress_notifications_reach_subscribers() {
    let host = start_host().await;
    let session = ClientSession::connect(&host.url, SessionConfig::default())
        .await
        .unwrap();
    let mut notes = session.subscribe();

    let out = session.call("progress", json!({})).await.unwrap();
    assert_eq!(out, json!("done"));

    let note = notes.recv().await.unwrap();
    assert_eq!(note.params["data"], json!({ "pct": 50 }));
    session.close().await;
}

#[tokio::test]
async fn host_shutdown_fails_pending_calls() {
    let host = start_host().await;
    let session = ClientSession::connect(&host.url, SessionConfig::default())
        .await
        .unwrap();

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.call("echo", json!({ "delay_ms": 5_000 })).await })
    };
    while session.in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    host.shutdown.cancel();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed), "{err:?}");
    assert!(!session.is_open());
}

#[tokio::test]
async fn close_removes_host_session() {
    let host = start_host().await;
    let session = ClientSession::connect(&host.url, SessionConfig::default())
        .await
        .unwrap();
    assert_eq!(host.server.session_count(), 1);

    session.close().await;
    for _ in 0..100 {
        if host.server.session_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(host.server.session_count(), 0);
    assert!(matches!(
        session.call("add", json!({ "a": 1, "b": 1 })).await,
        Err(Error::ConnectionClosed)
    ));
}
