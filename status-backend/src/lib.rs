//! Status Backend
//!
//! Drive status-backend containers from functional tests: the JSON-RPC
//! client, the application API and the signal stream of one session.

pub mod accounts;
mod backend;
pub mod config;
pub mod logger;
pub mod rpc;
pub mod service;


use std::time::Duration;

use serde_json::Value;

pub use backend::{
    restored_session, signals_url, verify_is_valid_api_response, StatusBackend, ANVIL_NETWORK_ID,
    ANVIL_RPC_URL,
};
pub use config::{BackendPool, Config, ConfigError};
pub use rpc::{HttpResponse, RequestId, RetryPolicy, RpcClient};
pub use service::{Service, WalletService};
pub use status_signals::{self as signals, Received, Signal, SignalClient};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Rpc(#[from] rpc::Error),
    #[error("{0}")]
    Signal(#[from] status_signals::Error),
    #[error("Failed to start the signal listener: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid backend URL '{0}': {1}")]
    InvalidUrl(String, String),
    #[error("Not enough status-backend containers, please add more")]
    NoBackendAvailable,
    #[error("status-backend {0} is not available")]
    BackendInUse(String),
    #[error("API error: {0}")]
    Api(Value),
    #[error("Login failed: {0}")]
    Login(String),
    #[error("RPC client was not started after {} seconds", .0.as_secs())]
    RpcClientNotStarted(Duration),
    #[error("Public key not found for display name: {0}")]
    PubkeyNotFound(String),
}
