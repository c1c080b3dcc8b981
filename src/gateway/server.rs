// src/gateway/server.rs
//! JSON-lines TCP front end
//!
//! Every connection gets a writer task fed by a channel, and every request
//! line is handled on its own task, so a long `run.stream` never blocks a
//! `run.kill` sent over the same connection.

use super::auth::{Authenticator, Principal};
use super::rpc::{CommonParams, ListParams, Method, RpcError, RpcEvent, RpcRequest, RpcResponse};
use crate::dispatcher::{Dispatcher, TaskError, TaskId, TaskSnapshot, TaskSpec, TaskState};
use crate::runtime::contract::SessionContext;
use crate::runtime::workspace::Workspace;
use crate::utils::config::{ServerConfig, WorkspaceConfig};
use crate::utils::errors::{EngineError, ErrorCode, Result};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Large enough for a base64-encoded wasm module at its size cap
const MAX_LINE_BYTES: usize = 32 * 1024 * 1024;
const WRITE_QUEUE: usize = 256;
const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_NAME_LEN: usize = 64;

pub struct GatewayServer {
    addr: String,
    workspace_root: PathBuf,
    dispatcher: Dispatcher,
    auth: Arc<dyn Authenticator>,
}

impl GatewayServer {
    pub fn new(
        server: &ServerConfig,
        workspaces: &WorkspaceConfig,
        dispatcher: Dispatcher,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            addr: format!("{}:{}", server.host, server.port),
            workspace_root: workspaces.base_dir.clone(),
            dispatcher,
            auth,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.addr)
            .await
            .map_err(|e| EngineError::ConfigError(format!("failed to bind {}: {}", self.addr, e)))
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(addr = %listener.local_addr()?, "gateway listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("gateway stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let shutdown = shutdown.child_token();
                        tokio::spawn(async move {
                            server.connection(stream, peer, shutdown).await;
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                },
            }
        }
    }

    async fn connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        debug!(%peer, "connection accepted");
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let (mut sink, mut lines) = framed.split();
        let (tx, mut rx) = mpsc::channel::<String>(WRITE_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = sink.send(line).await {
                    debug!(error = %e, "connection write failed");
                    break;
                }
            }
        });

        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next() => line,
            };
            match line {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => {
                    let server = Arc::clone(&self);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = server.handle_line(&line, &tx).await;
                        send(&tx, &response).await;
                    });
                }
                Some(Err(e)) => {
                    warn!(%peer, error = %e, "closing connection after bad frame");
                    let error = RpcError {
                        code: ErrorCode::InvalidParams,
                        message: e.to_string(),
                        data: None,
                    };
                    send(&tx, &RpcResponse::failure(Value::Null, error)).await;
                    break;
                }
                None => break,
            }
        }

        // In-flight handlers hold senders; the writer drains until they finish.
        drop(tx);
        if let Err(e) = writer.await {
            warn!(%peer, error = %e, "connection writer panicked");
        }
        debug!(%peer, "connection closed");
    }

    /// Decode and answer one request line. Stream frames go to `frames`.
    pub async fn handle_line(&self, line: &str, frames: &mpsc::Sender<String>) -> RpcResponse {
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                return RpcResponse::failure(Value::Null, RpcError::from(&EngineError::from(e)));
            }
        };

        let id = request.id.clone();
        match self.handle(request, frames).await {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => RpcResponse::failure(id, error),
        }
    }

    async fn handle(&self, request: RpcRequest, frames: &mpsc::Sender<String>) -> std::result::Result<Value, RpcError> {
        let principal = self.auth.authenticate(request.token.as_deref()).await.map_err(rpc_error)?;
        let method = Method::parse(&request.method, &request.params).map_err(rpc_error)?;
        let common: CommonParams = match &request.params {
            Value::Null => CommonParams::default(),
            params => serde_json::from_value(params.clone()).map_err(|e| rpc_error(e.into()))?,
        };
        debug!(method = %request.method, user = %principal.user_id, "rpc call");

        match method {
            Method::Engine(op) => {
                let session = self.session(&principal, &common.session).await.map_err(rpc_error)?;
                let spec = with_timeout(TaskSpec::engine(session, op), &common);
                let id = self.dispatcher.dispatch(spec).map_err(rpc_error)?;
                let snapshot = self.dispatcher.wait(id).await.map_err(rpc_error)?;
                task_result(snapshot)
            }
            Method::Stream(op) => {
                let session = self.session(&principal, &common.session).await.map_err(rpc_error)?;
                let spec = with_timeout(TaskSpec::engine(session, op), &common);
                self.stream(&request.id, spec, frames).await
            }
            Method::Kill(task) | Method::AgentCancel(task) => {
                self.owned(&principal, task.task_id).map_err(rpc_error)?;
                let snapshot = self.dispatcher.cancel(task.task_id).await.map_err(rpc_error)?;
                to_value(&snapshot)
            }
            Method::AgentDispatch(agent_request) => {
                let session = self.session(&principal, &common.session).await.map_err(rpc_error)?;
                let spec = with_timeout(TaskSpec::agent(session, agent_request), &common);
                let id = self.dispatcher.dispatch(spec).map_err(rpc_error)?;
                Ok(json!({ "task_id": id, "state": TaskState::Pending }))
            }
            Method::AgentStatus(task) => {
                let snapshot = self.owned(&principal, task.task_id).map_err(rpc_error)?;
                to_value(&snapshot)
            }
            Method::AgentList(params) => {
                let session = self.session_filter(&principal, &params);
                let tasks: Vec<TaskSnapshot> = self
                    .dispatcher
                    .list(session.as_deref())
                    .into_iter()
                    .filter(|snapshot| snapshot.user_id == principal.user_id)
                    .take(params.limit.unwrap_or(usize::MAX))
                    .collect();
                to_value(&tasks)
            }
            Method::AgentHistory(params) => {
                let session = self.session_filter(&principal, &params);
                let tasks: Vec<TaskSnapshot> = self
                    .dispatcher
                    .history(usize::MAX)
                    .into_iter()
                    .filter(|snapshot| snapshot.user_id == principal.user_id)
                    .filter(|snapshot| session.as_ref().map_or(true, |s| &snapshot.session_id == s))
                    .take(params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
                    .collect();
                to_value(&tasks)
            }
            Method::AgentProfiles => {
                let agents = self.dispatcher.agents().ok_or_else(|| {
                    rpc_error(EngineError::InvalidParameters("agent tasks are not enabled".into()))
                })?;
                to_value(&agents.profiles())
            }
        }
    }

    /// Run a task while forwarding its events as they occur
    async fn stream(
        &self,
        request_id: &Value,
        spec: TaskSpec,
        frames: &mpsc::Sender<String>,
    ) -> std::result::Result<Value, RpcError> {
        // Subscribe first so the pending transition is not missed.
        let mut events = self.dispatcher.subscribe();
        let task_id = self.dispatcher.dispatch(spec).map_err(rpc_error)?;

        let finished = self.dispatcher.wait(task_id);
        tokio::pin!(finished);

        let snapshot = loop {
            tokio::select! {
                biased;
                received = events.recv() => match received {
                    Ok(event) if event.task_id == task_id => {
                        send(frames, &RpcEvent::new(request_id, &event)).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(task_id = %task_id, skipped, "stream fell behind, events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break (&mut finished).await,
                },
                snapshot = &mut finished => {
                    // The terminal event is published before waiters wake.
                    while let Ok(event) = events.try_recv() {
                        if event.task_id == task_id {
                            send(frames, &RpcEvent::new(request_id, &event)).await;
                        }
                    }
                    break snapshot;
                }
            }
        };

        task_result(snapshot.map_err(rpc_error)?)
    }

    /// Resolve (creating if needed) the workspace of `project/session`
    async fn session(&self, principal: &Principal, session: &str) -> Result<SessionContext> {
        check_name("project", &principal.project)?;
        check_name("session", session)?;

        let root = self.workspace_root.join(&principal.project).join(session);
        let workspace = tokio::task::spawn_blocking(move || Workspace::open(root))
            .await
            .map_err(|e| EngineError::Internal(format!("workspace open panicked: {}", e)))??;

        Ok(SessionContext::new(
            principal.user_id.clone(),
            session_key(&principal.project, session),
            workspace,
        ))
    }

    fn session_filter(&self, principal: &Principal, params: &ListParams) -> Option<String> {
        params
            .session
            .as_deref()
            .map(|session| session_key(&principal.project, session))
    }

    /// A task visible to `principal`; other users' tasks look absent
    fn owned(&self, principal: &Principal, id: TaskId) -> Result<TaskSnapshot> {
        let snapshot = self.dispatcher.status(id)?;
        if snapshot.user_id != principal.user_id {
            return Err(EngineError::NotFound(format!("task '{}'", id)));
        }
        Ok(snapshot)
    }
}

fn session_key(project: &str, session: &str) -> String {
    format!("{}/{}", project, session)
}

fn check_name(what: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidParameters(format!("invalid {} name '{}'", what, name)))
    }
}

fn with_timeout(spec: TaskSpec, common: &CommonParams) -> TaskSpec {
    match common.timeout() {
        Some(timeout) => spec.with_timeout(timeout),
        None => spec,
    }
}

/// Completed tasks answer with their output; anything else is an error
/// carrying whatever output the task produced.
fn task_result(snapshot: TaskSnapshot) -> std::result::Result<Value, RpcError> {
    if snapshot.state == TaskState::Completed {
        return Ok(json!({ "task_id": snapshot.id, "output": snapshot.output }));
    }

    let error = snapshot.error.clone().unwrap_or_else(|| TaskError {
        code: ErrorCode::InternalError,
        message: format!("task ended in state {}", snapshot.state),
    });
    Err(RpcError {
        code: error.code,
        message: error.message,
        data: Some(json!({
            "task_id": snapshot.id,
            "state": snapshot.state,
            "output": snapshot.output,
        })),
    })
}

fn rpc_error(err: EngineError) -> RpcError {
    RpcError::from(&err)
}

fn to_value<T: Serialize>(value: &T) -> std::result::Result<Value, RpcError> {
    serde_json::to_value(value)
        .map_err(|e| rpc_error(EngineError::Internal(format!("failed to encode result: {}", e))))
}

async fn send<T: Serialize>(frames: &mpsc::Sender<String>, frame: &T) {
    match serde_json::to_string(frame) {
        Ok(line) => {
            if frames.send(line).await.is_err() {
                debug!("connection gone, frame dropped");
            }
        }
        Err(e) => error!(error = %e, "failed to encode frame"),
    }
}
