//! Backend session
//!
//! A [`StatusBackend`] drives one status-backend container: the application
//! API on `/statusgo`, JSON-RPC on `/statusgo/CallRPC` and the signal stream
//! on `/signals`.

use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use status_signals::signal::NODE_LOGIN;
use status_signals::{Received, Signal, SignalClient, DEFAULT_TIMEOUT};
use tracing::{debug, info};
use url::Url;

use crate::accounts::{Account, DEFAULT_DISPLAY_NAME, USER_1};
use crate::config::{BackendPool, Config};
use crate::rpc::{self, post_json, HttpResponse, RequestId, RpcClient};
use crate::Error;

/// Chain id of the local Anvil node.
pub const ANVIL_NETWORK_ID: u64 = 31337;
/// Anvil, as seen from inside the backend containers.
pub const ANVIL_RPC_URL: &str = "http://anvil:8545";

const KDF_ITERATIONS: u32 = 256000;
const MESSENGER_ALREADY_STARTED: &str = "messenger already started";
const MESSENGER_ALREADY_STARTED_CODE: i64 = -32000;
const RPC_CLIENT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// null, false, 0, "" and empty containers.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// The signals endpoint of a backend: same host, websocket scheme.
pub fn signals_url(url: &str) -> Result<String, Error> {
    let mut ws_url = Url::parse(url).map_err(|e| Error::InvalidUrl(url.to_string(), e.to_string()))?;
    let scheme = match ws_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(Error::InvalidUrl(
                url.to_string(),
                format!("unsupported scheme '{}'", other),
            ))
        }
    };
    ws_url
        .set_scheme(scheme)
        .map_err(|_| Error::InvalidUrl(url.to_string(), "cannot switch to websocket".to_string()))?;
    Ok(format!("{}/signals", ws_url.as_str().trim_end_matches('/')))
}

/// Check an application API answer: HTTP 200, a JSON body, and no error
/// unless it is empty.
pub fn verify_is_valid_api_response(response: &HttpResponse) -> Result<(), Error> {
    response.check_status()?;
    match response.json()?.get("error") {
        Some(error) if !is_falsy(error) => Err(Error::Api(error.clone())),
        _ => Ok(()),
    }
}

#[derive(Debug)]
pub struct StatusBackend {
    url: String,
    api_url: String,
    client: reqwest::blocking::Client,
    rpc: RpcClient,
    signals: SignalClient,
    signal_timeout: Duration,
}

impl StatusBackend {
    /// Open a session on the backend at `url` and start listening for
    /// `await_signals`.
    pub fn new<I, S>(url: &str, await_signals: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let url = url.trim_end_matches('/').to_string();
        let ws_url = signals_url(&url)?;
        let client = reqwest::blocking::Client::new();
        let rpc = RpcClient::with_client(format!("{}/statusgo/CallRPC", url), client.clone());
        let signals = SignalClient::connect(ws_url, await_signals)?;
        info!("Opened status-backend session on {}", url);

        Ok(Self {
            api_url: format!("{}/statusgo", url),
            url,
            client,
            rpc,
            signals,
            signal_timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Open a session on a backend from the pool: `url` if given and still
    /// free, any free one otherwise.
    pub fn from_pool<I, S>(pool: &BackendPool, url: Option<&str>, await_signals: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let url = match url {
            Some(url) => pool
                .take_url(url)
                .ok_or_else(|| Error::BackendInUse(url.to_string()))?,
            None => pool.take().ok_or(Error::NoBackendAvailable)?,
        };
        Self::new(&url, await_signals)
    }

    /// Like [`StatusBackend::from_pool`], with the configured signal timeout.
    pub fn from_config<I, S>(
        config: &Config,
        pool: &BackendPool,
        url: Option<&str>,
        await_signals: I,
    ) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut backend = Self::from_pool(pool, url, await_signals)?;
        backend.signal_timeout = config.signal_timeout;
        Ok(backend)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn rpc_mut(&mut self) -> &mut RpcClient {
        &mut self.rpc
    }

    pub fn signals(&self) -> &SignalClient {
        &self.signals
    }

    pub fn signal_timeout(&self) -> Duration {
        self.signal_timeout
    }

    pub fn set_signal_timeout(&mut self, timeout: Duration) {
        self.signal_timeout = timeout;
    }

    pub fn api_request(&self, method: &str, data: &Value) -> Result<HttpResponse, Error> {
        let url = format!("{}/{}", self.api_url, method);
        Ok(post_json(&self.client, &url, data)?)
    }

    pub fn api_valid_request(&self, method: &str, data: &Value) -> Result<HttpResponse, Error> {
        let response = self.api_request(method, data)?;
        verify_is_valid_api_response(&response)?;
        Ok(response)
    }

    pub fn rpc_request(&self, method: &str, params: &[Value]) -> Result<HttpResponse, Error> {
        Ok(self.rpc.rpc_request(method, params, None)?)
    }

    pub fn rpc_valid_request(
        &self,
        method: &str,
        params: &[Value],
        id: Option<RequestId>,
    ) -> Result<HttpResponse, Error> {
        Ok(self.rpc.rpc_valid_request(method, params, id)?)
    }

    pub fn init_status_backend(&self, data_dir: &str) -> Result<HttpResponse, Error> {
        let data = json!({
            "dataDir": data_dir,
            "logEnabled": true,
            "logLevel": "DEBUG",
            "apiLogging": true,
        });
        self.api_valid_request("InitializeApplication", &data)
    }

    pub fn create_account_and_login(
        &self,
        data_dir: &str,
        display_name: &str,
        password: &str,
    ) -> Result<HttpResponse, Error> {
        let data = json!({
            "rootDataDir": data_dir,
            "kdfIterations": KDF_ITERATIONS,
            "displayName": display_name,
            "password": password,
            "customizationColor": "primary",
            "logEnabled": true,
            "logLevel": "DEBUG",
        });
        self.api_valid_request("CreateAccountAndLogin", &data)
    }

    /// Restore `account` from its mnemonic, with the Anvil node as the only
    /// network.
    pub fn restore_account_and_login(
        &self,
        data_dir: &str,
        display_name: &str,
        account: &Account,
        network_id: u64,
    ) -> Result<HttpResponse, Error> {
        let data = json!({
            "rootDataDir": data_dir,
            "kdfIterations": KDF_ITERATIONS,
            "displayName": display_name,
            "password": account.password,
            "mnemonic": account.passphrase,
            "customizationColor": "blue",
            "logEnabled": true,
            "logLevel": "DEBUG",
            "testNetworksEnabled": false,
            "networkId": network_id,
            "networksOverride": [{
                "ChainID": network_id,
                "ChainName": "Anvil",
                "DefaultRPCURL": ANVIL_RPC_URL,
                "RPCURL": ANVIL_RPC_URL,
                "ShortName": "eth",
                "NativeCurrencyName": "Ether",
                "NativeCurrencySymbol": "ETH",
                "NativeCurrencyDecimals": 18,
                "IsTest": false,
                "Layer": 1,
                "Enabled": true,
            }],
        });
        self.api_valid_request("RestoreAccountAndLogin", &data)
    }

    pub fn login(&self, key_uid: &str, account: &Account) -> Result<HttpResponse, Error> {
        let data = json!({
            "password": account.password,
            "keyUid": key_uid,
            "kdfIterations": KDF_ITERATIONS,
        });
        self.api_valid_request("LoginAccount", &data)
    }

    pub fn logout(&self) -> Result<HttpResponse, Error> {
        self.api_valid_request("Logout", &json!({}))
    }

    /// Wait for `node.login` and return the key uid of the logged in account.
    /// Requires `node.login` among the awaited signals.
    pub fn wait_for_login(&self, timeout: Duration) -> Result<String, Error> {
        let signal = self.signals.wait_for_single_signal(NODE_LOGIN, timeout)?;
        let event = signal.event();
        if let Some(error) = event.get("error").filter(|e| !is_falsy(e)) {
            let reason = error.as_str().map_or_else(|| error.to_string(), str::to_string);
            return Err(Error::Login(reason));
        }
        event["account"]["key-uid"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Login(format!("no key-uid in {}", signal)))
    }

    /// Restore `account` then poll `accounts_getKeypairs` until the RPC client
    /// of the backend answers.
    pub fn restore_account_and_wait_for_rpc_client_to_start(
        &self,
        account: &Account,
        network_id: u64,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.restore_account_and_login("/", DEFAULT_DISPLAY_NAME, account, network_id)?;
        let start = Instant::now();
        loop {
            match self.rpc.rpc_valid_request("accounts_getKeypairs", &[], None) {
                Ok(_) => return Ok(()),
                Err(e) => debug!("RPC client not ready yet: {}", e),
            }
            if start.elapsed() + RPC_CLIENT_POLL_INTERVAL > timeout {
                return Err(Error::RpcClientNotStarted(timeout));
            }
            thread::sleep(RPC_CLIENT_POLL_INTERVAL);
        }
    }

    /// Start the messenger. Answers that it is already running count as
    /// success.
    pub fn start_messenger(&self) -> Result<(), Error> {
        self.rpc
            .retry_policy()
            .run(|| {
                let response = self.rpc.rpc_request("wakuext_startMessenger", &[], None)?;
                if matches!(response.error(), Some(e) if !e.is_null()) {
                    let error = self.rpc.verify_is_json_rpc_error(&response)?;
                    if error.code == MESSENGER_ALREADY_STARTED_CODE
                        && error.message == MESSENGER_ALREADY_STARTED
                    {
                        return Ok(());
                    }
                    return Err(rpc::Error::Rpc(error));
                }
                self.rpc.verify_is_valid_json_rpc_response(&response, None)
            })
            .map_err(Error::from)
    }

    pub fn start_wallet(&self) -> Result<(), Error> {
        self.rpc_valid_request("wallet_startWallet", &[], None)?;
        Ok(())
    }

    pub fn get_settings(&self) -> Result<Value, Error> {
        Ok(self.rpc_valid_request("settings_getSettings", &[], None)?.json()?)
    }

    pub fn get_accounts(&self) -> Result<Value, Error> {
        Ok(self.rpc_valid_request("accounts_getAccounts", &[], None)?.json()?)
    }

    /// Public key of the account named `display_name`.
    pub fn get_pubkey(&self, display_name: &str) -> Result<String, Error> {
        let accounts = self.get_accounts()?;
        accounts["result"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|account| account["name"] == display_name)
            .and_then(|account| account["public-key"].as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::PubkeyNotFound(display_name.to_string()))
    }

    pub fn send_contact_request(&self, params: &[Value]) -> Result<Value, Error> {
        Ok(self
            .rpc_valid_request("wakuext_sendContactRequest", params, None)?
            .json()?)
    }

    pub fn send_message(&self, params: &[Value]) -> Result<Value, Error> {
        Ok(self
            .rpc_valid_request("wakuext_sendOneToOneMessage", params, None)?
            .json()?)
    }

    pub fn prepare_wait_for_signal(&self, signal_type: &str, delta_count: usize) -> Result<(), Error> {
        Ok(self.signals.prepare_wait_for_signal(signal_type, delta_count)?)
    }

    pub fn prepare_wait_for_signal_matching<F>(
        &self,
        signal_type: &str,
        delta_count: usize,
        accept: F,
    ) -> Result<(), Error>
    where
        F: Fn(&Signal) -> bool + Send + Sync + 'static,
    {
        Ok(self
            .signals
            .prepare_wait_for_signal_matching(signal_type, delta_count, accept)?)
    }

    /// Wait for the armed signals, bounded by the session's signal timeout.
    pub fn wait_for_signal(&self, signal_type: &str) -> Result<Received, Error> {
        Ok(self.signals.wait_for_signal(signal_type, self.signal_timeout)?)
    }

    pub fn wait_for_single_signal(&self, signal_type: &str) -> Result<Signal, Error> {
        Ok(self
            .signals
            .wait_for_single_signal(signal_type, self.signal_timeout)?)
    }

    pub fn find_signal_containing_pattern(
        &self,
        signal_type: &str,
        pattern: &str,
        timeout: Duration,
    ) -> Result<Signal, Error> {
        Ok(self
            .signals
            .find_signal_containing_pattern(signal_type, pattern, timeout)?)
    }
}

/// Bring up a session the way most suites start: initialize the backend,
/// restore [`USER_1`] and wait for the login.
pub fn restored_session(
    config: &Config,
    pool: &BackendPool,
    await_signals: &[&str],
) -> Result<(StatusBackend, String), Error> {
    let mut signals: Vec<&str> = await_signals.to_vec();
    if !signals.contains(&NODE_LOGIN) {
        signals.push(NODE_LOGIN);
    }
    let backend = StatusBackend::from_config(config, pool, None, signals)?;
    backend.init_status_backend("/")?;
    backend.restore_account_and_login("/", DEFAULT_DISPLAY_NAME, &USER_1, config.network_id)?;
    let key_uid = backend.wait_for_login(backend.signal_timeout())?;
    Ok((backend, key_uid))
}
