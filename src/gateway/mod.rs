// src/gateway/mod.rs
//! RPC gateway
//!
//! Authenticates callers, maps `{method, params}` onto dispatcher tasks, and
//! writes structured responses back over newline-delimited JSON.

pub mod auth;
pub mod rpc;
pub mod server;

pub use auth::{Authenticator, Principal, StaticTokenAuthenticator};
pub use rpc::{Method, RpcError, RpcEvent, RpcRequest, RpcResponse};
pub use server::GatewayServer;
