// tests/gateway_tcp.rs
//! The gateway over a real socket

mod common;

use futures::{SinkExt, StreamExt};
use sandbox_engine::gateway::{GatewayServer, StaticTokenAuthenticator};
use sandbox_engine::observability::TracingTelemetry;
use sandbox_engine::utils::config::TokenGrant;
use sandbox_engine::{Dispatcher, Engines, ResourceGovernor};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

struct Running {
    _dir: tempfile::TempDir,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
}

async fn start() -> Running {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(&dir);
    config.server.port = 0;
    config.auth.tokens.insert(
        "token-a".into(),
        TokenGrant {
            user_id: "alice".into(),
            project: "demo".into(),
        },
    );

    let governor = Arc::new(ResourceGovernor::new(config.quotas.clone()));
    let engines = Engines::from_config(&config, Arc::clone(&governor)).unwrap();
    let dispatcher = Dispatcher::new(config.dispatcher.clone(), engines, governor, Arc::new(TracingTelemetry));
    let server = Arc::new(GatewayServer::new(
        &config.server,
        &config.workspace,
        dispatcher,
        Arc::new(StaticTokenAuthenticator::new(&config.auth)),
    ));

    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&server).serve(listener, shutdown.clone()));

    Running {
        _dir: dir,
        addr,
        shutdown,
    }
}

async fn next(conn: &mut Framed<TcpStream, LinesCodec>) -> Value {
    let line = conn.next().await.unwrap().unwrap();
    serde_json::from_str(&line).unwrap()
}

#[tokio::test]
async fn test_roundtrip_over_tcp() {
    let running = start().await;
    let stream = TcpStream::connect(running.addr).await.unwrap();
    let mut conn = Framed::new(stream, LinesCodec::new());

    let write = json!({
        "id": 1, "token": "token-a", "method": "fs.write",
        "params": {"path": "hello.txt", "content": {"encoding": "utf-8", "data": "hi there"}}
    });
    conn.send(write.to_string()).await.unwrap();
    let response = next(&mut conn).await;
    assert_eq!(response["id"], json!(1));
    assert_eq!(response["ok"], json!(true), "{}", response);

    let exec = json!({
        "id": 2, "token": "token-a", "method": "run.exec",
        "params": {"command": "cat", "args": ["hello.txt"]}
    });
    conn.send(exec.to_string()).await.unwrap();
    let response = next(&mut conn).await;
    assert_eq!(response["ok"], json!(true), "{}", response);
    assert_eq!(response["result"]["output"]["output"]["stdout"], json!("hi there"));

    running.shutdown.cancel();
}

#[tokio::test]
async fn test_stream_frames_precede_response() {
    let running = start().await;
    let stream = TcpStream::connect(running.addr).await.unwrap();
    let mut conn = Framed::new(stream, LinesCodec::new());

    let request = json!({
        "id": "stream-1", "token": "token-a", "method": "run.stream",
        "params": {"command": "sh", "args": ["-c", "echo one; echo two >&2"]}
    });
    conn.send(request.to_string()).await.unwrap();

    let mut frames = Vec::new();
    let response = loop {
        let value = next(&mut conn).await;
        if value.get("ok").is_some() {
            break value;
        }
        frames.push(value);
    };

    assert_eq!(response["ok"], json!(true), "{}", response);
    let streams: Vec<&Value> = frames
        .iter()
        .filter(|f| f["type"] == "output")
        .map(|f| &f["stream"])
        .collect();
    assert!(streams.contains(&&json!("stdout")));
    assert!(streams.contains(&&json!("stderr")));
    assert_eq!(frames.first().unwrap()["to"], json!("pending"));
    assert_eq!(frames.last().unwrap()["to"], json!("completed"));

    running.shutdown.cancel();
}

#[tokio::test]
async fn test_malformed_line_gets_an_error() {
    let running = start().await;
    let stream = TcpStream::connect(running.addr).await.unwrap();
    let mut conn = Framed::new(stream, LinesCodec::new());

    conn.send("{not json".to_string()).await.unwrap();
    let response = next(&mut conn).await;
    assert_eq!(response["ok"], json!(false));
    assert_eq!(response["error"]["code"], json!("sandbox.invalid_params"));

    conn.send(json!({"id": 5, "method": "fs.list"}).to_string()).await.unwrap();
    let response = next(&mut conn).await;
    assert_eq!(response["error"]["code"], json!("sandbox.unauthorized"));

    running.shutdown.cancel();
}
