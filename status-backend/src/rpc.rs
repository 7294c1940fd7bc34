//! JSON-RPC client
//!
//! JSON-RPC 2.0 over HTTP POST, as served by the backend on
//! `/statusgo/CallRPC` and by statusd on its RPC port.

use std::fmt::Debug;
use std::time::{Duration, Instant};
use std::{error, fmt, thread};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Id used when the caller does not pick one.
pub const DEFAULT_REQUEST_ID: u64 = 13;

/// Error the backend returns while its RPC client is still starting.
pub const RPC_CLIENT_UNAVAILABLE: &str = "JSON-RPC client is unavailable";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl Default for RequestId {
    fn default() -> Self {
        RequestId::Number(DEFAULT_REQUEST_ID)
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

fn no_params(params: &&[Value]) -> bool {
    params.is_empty()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// A JSONRPC request object
pub struct Request<'f> {
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: &'f str,
    /// The name of the RPC call
    pub method: &'f str,
    /// Identifier for this Request, which should appear in the response
    pub id: RequestId,
    /// Parameters to the RPC call, left out when there are none
    #[serde(skip_serializing_if = "no_params")]
    pub params: &'f [Value],
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// A JSONRPC response object
pub struct Response<T> {
    /// A result if there is one, or null
    pub result: Option<T>,
    /// An error if there is one, or null
    pub error: Option<RpcError>,
    /// Identifier for this Request, which should match that of the request
    pub id: Option<RequestId>,
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: Option<String>,
}

impl<T> Response<T> {
    /// Extract the result from a response, consuming the response
    pub fn into_result(self) -> Result<T, Error> {
        if let Some(e) = self.error {
            return Err(Error::Rpc(e));
        }

        self.result.ok_or(Error::NoErrorOrResult)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
/// A JSONRPC error object
pub struct RpcError {
    /// The integer identifier of the error
    pub code: i64,
    /// A string describing the error
    pub message: String,
    /// Additional data specific to the error
    pub data: Option<Value>,
}

/// Raw HTTP answer of the backend, kept as-is so tests can assert on both the
/// status and the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn json(&self) -> Result<Value, Error> {
        serde_json::from_str(&self.body).map_err(Error::Json)
    }

    /// The `error` member of the body, if the body is a JSON object with one.
    pub fn error(&self) -> Option<Value> {
        self.json().ok()?.get("error").cloned()
    }

    /// Whether the backend answered that its RPC client is not up yet.
    pub fn is_rpc_client_unavailable(&self) -> bool {
        match self.error() {
            Some(Value::String(e)) => e == RPC_CLIENT_UNAVAILABLE,
            Some(Value::Object(e)) => e.get("message").and_then(Value::as_str) == Some(RPC_CLIENT_UNAVAILABLE),
            _ => false,
        }
    }

    pub(crate) fn check_status(&self) -> Result<(), Error> {
        if self.status != 200 {
            return Err(Error::Status(self.status, self.body.clone()));
        }
        if self.body.is_empty() {
            return Err(Error::EmptyBody);
        }
        Ok(())
    }

    pub(crate) fn key(&self, key: &'static str) -> Result<Value, Error> {
        self.json()?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::MissingKey(key, self.body.clone()))
    }
}

/// A library error
#[derive(Debug)]
pub enum Error {
    /// HTTP transport error
    Http(reqwest::Error),
    /// Json error
    Json(serde_json::Error),
    /// Non-200 answer, with its body
    Status(u16, String),
    /// 200 answer without a body
    EmptyBody,
    /// The body is missing an expected member
    MissingKey(&'static str, String),
    /// Error response
    Rpc(RpcError),
    /// Response has neither error nor result
    NoErrorOrResult,
    /// Response to a request did not have the expected id
    IdMismatch { expected: RequestId, got: Option<RequestId> },
    /// Response to a request had a jsonrpc field other than "2.0"
    VersionMismatch,
    /// The backend kept answering that its RPC client is unavailable
    Unavailable,
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Error {
        Error::Http(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Json(e)
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Error {
        Error::Rpc(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::Json(e) => write!(f, "Invalid JSON in response: {}", e),
            Error::Status(status, body) => write!(f, "Got response {}, status code {}", body, status),
            Error::EmptyBody => write!(f, "Empty response body"),
            Error::MissingKey(key, body) => {
                write!(f, "Key '{}' not found in the JSON response: {}", key, body)
            }
            Error::Rpc(r) => write!(f, "RPC error response: {:?}", r),
            Error::NoErrorOrResult => write!(f, "Malformed RPC response"),
            Error::IdMismatch { expected, got } => {
                write!(f, "got id: {:?} instead of expected id: {:?}", got, expected)
            }
            Error::VersionMismatch => write!(f, "`jsonrpc` field set to non-\"2.0\""),
            Error::Unavailable => write!(f, "{}", RPC_CLIENT_UNAVAILABLE),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}

/// POST `body` as JSON and keep whatever comes back.
pub(crate) fn post_json<B: Serialize + ?Sized>(
    client: &reqwest::blocking::Client,
    url: &str,
    body: &B,
) -> Result<HttpResponse, Error> {
    info!(
        "Sending POST request to url {} with data: {}",
        url,
        serde_json::to_string_pretty(body)?
    );
    let response = client.post(url).json(body).send()?;
    let status = response.status().as_u16();
    let body = response.text()?;
    match serde_json::from_str::<Value>(&body) {
        Ok(json) => info!("Got response: {}", json),
        Err(_) => info!("Got response: {}", body),
    }
    Ok(HttpResponse { status, body })
}

/// Fixed-interval retry bounded by a total delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub stop_after: Duration,
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            stop_after: Duration::from_secs(10),
            wait: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Call `f` until it succeeds or `stop_after` has elapsed, and return the
    /// last outcome.
    pub fn run<T, E: fmt::Display, F: FnMut() -> Result<T, E>>(&self, mut f: F) -> Result<T, E> {
        let start = Instant::now();
        loop {
            match f() {
                Ok(t) => return Ok(t),
                Err(e) => {
                    if start.elapsed() + self.wait > self.stop_after {
                        return Err(e);
                    }
                    debug!("retrying in {:?} after: {}", self.wait, e);
                    thread::sleep(self.wait);
                }
            }
        }
    }
}

/// A handle to a backend JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: reqwest::blocking::Client,
    rpc_url: String,
    retry: RetryPolicy,
}

impl RpcClient {
    pub fn new(rpc_url: impl Into<String>) -> RpcClient {
        Self::with_client(rpc_url, reqwest::blocking::Client::new())
    }

    pub fn with_client(rpc_url: impl Into<String>, client: reqwest::blocking::Client) -> RpcClient {
        RpcClient {
            client,
            rpc_url: rpc_url.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// POST a request, retrying while the transport fails or the backend
    /// reports its RPC client as unavailable. Any other answer, error or not,
    /// is returned as-is.
    pub fn rpc_request(
        &self,
        method: &str,
        params: &[Value],
        id: Option<RequestId>,
    ) -> Result<HttpResponse, Error> {
        self.rpc_request_to(&self.rpc_url, method, params, id)
    }

    pub fn rpc_request_to(
        &self,
        url: &str,
        method: &str,
        params: &[Value],
        id: Option<RequestId>,
    ) -> Result<HttpResponse, Error> {
        let request = Request {
            jsonrpc: "2.0",
            method,
            id: id.unwrap_or_default(),
            params,
        };
        self.retry.run(|| {
            let response = self.post(url, &request)?;
            if response.is_rpc_client_unavailable() {
                warn!("{} on {}", RPC_CLIENT_UNAVAILABLE, url);
                return Err(Error::Unavailable);
            }
            Ok(response)
        })
    }

    fn post(&self, url: &str, request: &Request) -> Result<HttpResponse, Error> {
        post_json(&self.client, url, request)
    }

    /// Send a request and require a successful JSON-RPC envelope.
    pub fn rpc_valid_request(
        &self,
        method: &str,
        params: &[Value],
        id: Option<RequestId>,
    ) -> Result<HttpResponse, Error> {
        let response = self.rpc_request(method, params, id.clone())?;
        self.verify_is_valid_json_rpc_response(&response, id.as_ref())?;
        Ok(response)
    }

    /// Send a request and deserialize its `result`.
    pub fn call<D: DeserializeOwned + Debug>(
        &self,
        method: &str,
        params: &[Value],
    ) -> Result<D, Error> {
        let response = self.rpc_request(method, params, None)?;
        response.check_status()?;
        let response: Response<D> = serde_json::from_str(&response.body)?;
        if response
            .jsonrpc
            .as_ref()
            .map_or(false, |version| version != "2.0")
        {
            return Err(Error::VersionMismatch);
        }
        response.into_result()
    }

    pub fn verify_is_valid_json_rpc_response(
        &self,
        response: &HttpResponse,
        id: Option<&RequestId>,
    ) -> Result<(), Error> {
        response.check_status()?;
        response.key("result")?;
        if let Some(expected) = id {
            let got = response
                .key("id")
                .ok()
                .and_then(|id| serde_json::from_value::<RequestId>(id).ok());
            if got.as_ref() != Some(expected) {
                return Err(Error::IdMismatch {
                    expected: expected.clone(),
                    got,
                });
            }
        }
        Ok(())
    }

    pub fn verify_is_json_rpc_error(&self, response: &HttpResponse) -> Result<RpcError, Error> {
        response.check_status()?;
        let error = response.key("error")?;
        Ok(serde_json::from_value(error)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serialization() {
        let params = [json!(1), json!("a")];
        let request = Request {
            jsonrpc: "2.0",
            method: "wallet_getBalancesByChain",
            id: RequestId::default(),
            params: &params,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"jsonrpc": "2.0", "method": "wallet_getBalancesByChain", "id": 13, "params": [1, "a"]})
        );

        let request = Request {
            jsonrpc: "2.0",
            method: "accounts_getAccounts",
            id: "4242".into(),
            params: &[],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"jsonrpc": "2.0", "method": "accounts_getAccounts", "id": "4242"})
        );
    }

    #[test]
    fn response_into_result() {
        let response: Response<Value> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":13,"result":{"a":1}}"#).unwrap();
        assert_eq!(response.id, Some(RequestId::Number(13)));
        assert_eq!(response.into_result().unwrap(), json!({"a": 1}));

        let response: Response<Value> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":"1","error":{"code":-32000,"message":"messenger already started"}}"#,
        )
        .unwrap();
        match response.into_result() {
            Err(Error::Rpc(e)) => {
                assert_eq!(e.code, -32000);
                assert_eq!(e.message, "messenger already started");
            }
            r => panic!("Expected an RPC error, got {:?}", r),
        }

        let response: Response<Value> = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1}"#).unwrap();
        assert!(matches!(response.into_result(), Err(Error::NoErrorOrResult)));
    }

    #[test]
    fn unavailable_detection() {
        let response = HttpResponse {
            status: 200,
            body: json!({"error": RPC_CLIENT_UNAVAILABLE}).to_string(),
        };
        assert!(response.is_rpc_client_unavailable());
        let response = HttpResponse {
            status: 200,
            body: json!({"jsonrpc": "2.0", "error": {"code": -32000, "message": RPC_CLIENT_UNAVAILABLE}})
                .to_string(),
        };
        assert!(response.is_rpc_client_unavailable());
        let response = HttpResponse {
            status: 500,
            body: "internal error".to_string(),
        };
        assert!(!response.is_rpc_client_unavailable());
    }

    #[test]
    fn retry_policy_gives_up() {
        let policy = RetryPolicy {
            stop_after: Duration::from_millis(100),
            wait: Duration::from_millis(30),
        };
        let mut calls = 0;
        let res: Result<(), String> = policy.run(|| {
            calls += 1;
            Err(format!("attempt {}", calls))
        });
        assert!(calls >= 2);
        assert_eq!(res.unwrap_err(), format!("attempt {}", calls));

        let mut calls = 0;
        let res: Result<u32, String> = policy.run(|| {
            calls += 1;
            if calls < 2 {
                Err("not yet".to_string())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(res.unwrap(), 2);
    }
}
