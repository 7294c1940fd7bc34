//! Functional test binary for status backends
//!
//! Runs end-to-end checks against running status-backend containers and prints
//! a checklist report to stdout.

use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};
use status_backend::accounts::{DEFAULT_DISPLAY_NAME, USER_1};
use status_backend::logger::{parse_log_level, setup_logger};
use status_backend::{
    restored_session, BackendPool, Config, RequestId, RpcClient, StatusBackend, WalletService,
};
use status_signals::signal::{
    wallet_event, MEDIASERVER_STARTED, MESSAGES_NEW, MESSAGE_DELIVERED, NODE_LOGIN, NODE_READY,
    NODE_STARTED, WALLET,
};
use status_signals::{Signal, SignalClient};
use tracing::level_filters::LevelFilter;
use uuid::Uuid;

/// Messages can take a while to go through the network.
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the RPC client of a freshly restored account may take to start.
const RPC_CLIENT_START_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for the statusd signals endpoint to accept us.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "status-tester")]
#[command(about = "Functional checks against status-backend containers")]
#[command(version)]
struct Args {
    /// Configuration file (TOML). Every setting has a default.
    #[arg(long)]
    config: Option<PathBuf>,

    /// status-backend base URL (e.g. http://127.0.0.1:3314), replaces the
    /// configured ones. May be repeated.
    #[arg(long = "backend-url")]
    backend_urls: Vec<String>,

    /// Also write the logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Enable verbose output (debug logs, details on failure)
    #[arg(long, short)]
    verbose: bool,
}

// =============================================================================
// Test Result Types
// =============================================================================

#[derive(Debug, Clone)]
struct TestResult {
    name: String,
    action: String,
    expected: String,
    result: String,
    passed: bool,
}

impl TestResult {
    fn pass(name: &str, action: &str, expected: &str, result: &str) -> Self {
        Self {
            name: name.to_string(),
            action: action.to_string(),
            expected: expected.to_string(),
            result: result.to_string(),
            passed: true,
        }
    }

    fn fail(name: &str, action: &str, expected: &str, result: &str) -> Self {
        Self {
            name: name.to_string(),
            action: action.to_string(),
            expected: expected.to_string(),
            result: result.to_string(),
            passed: false,
        }
    }
}

struct TestCategory {
    name: String,
    results: Vec<TestResult>,
}

/// What every check needs: the settings and the backends left to use.
struct Context {
    config: Config,
    pool: BackendPool,
}

impl Context {
    fn session(&self, await_signals: &[&str]) -> Result<StatusBackend, String> {
        StatusBackend::from_config(&self.config, &self.pool, None, await_signals.iter().copied())
            .map_err(|e| e.to_string())
    }
}

// =============================================================================
// Test Runner
// =============================================================================

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if !args.backend_urls.is_empty() {
        config.status_backend_urls = args.backend_urls.clone();
        config.check()?;
    }
    let log_level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        parse_log_level()?.unwrap_or(config.log_level)
    };
    setup_logger(log_level, args.log_file.as_deref())?;

    println!("Functional Test Report");
    println!("======================");
    println!("Backends: {}", config.backend_urls().join(", "));
    println!();

    let ctx = Context {
        pool: BackendPool::from_config(&config),
        config,
    };

    let categories = vec![
        TestCategory {
            name: "Application Init".to_string(),
            results: run_init_tests(&ctx),
        },
        TestCategory {
            name: "Login".to_string(),
            results: run_login_tests(&ctx),
        },
        TestCategory {
            name: "Wallet Signals".to_string(),
            results: run_wallet_tests(&ctx),
        },
        TestCategory {
            name: "One-to-one Messages".to_string(),
            results: run_message_tests(&ctx),
        },
        TestCategory {
            name: "Statusd".to_string(),
            results: run_statusd_tests(&ctx),
        },
    ];

    let passed = report(&categories, args.verbose);
    std::process::exit(if passed { 0 } else { 1 });
}

/// Print the checklist, and tell whether everything passed.
fn report(categories: &[TestCategory], verbose: bool) -> bool {
    let mut failed_tests: Vec<&TestResult> = Vec::new();
    let mut total_tests = 0;

    for category in categories {
        if category.results.is_empty() {
            continue;
        }
        println!("{}", category.name);
        println!("{}", "-".repeat(category.name.len()));

        for result in &category.results {
            total_tests += 1;
            let icon = if result.passed { "✓" } else { "✗" };
            println!("[{}] {}", icon, result.name);
            if verbose || !result.passed {
                println!("    Action: {}", result.action);
                println!("    Expected: {}", result.expected);
            }
            println!("    Result: {}", result.result);
            println!();

            if !result.passed {
                failed_tests.push(result);
            }
        }
    }

    println!("======================");
    println!(
        "Result: {}/{} tests passed",
        total_tests - failed_tests.len(),
        total_tests
    );
    println!();

    if !failed_tests.is_empty() {
        println!("Failed tests:");
        for test in &failed_tests {
            println!("  - {}: {}", test.name, test.result);
        }
    }

    failed_tests.is_empty()
}

// =============================================================================
// Helper: Run single check
// =============================================================================

fn run_test<F>(name: &str, action: &str, expected: &str, test_fn: F) -> TestResult
where
    F: FnOnce() -> Result<String, String>,
{
    tracing::info!("Running check '{}'", name);
    match test_fn() {
        Ok(msg) => TestResult::pass(name, action, expected, &msg),
        Err(msg) => {
            tracing::error!("Check '{}' failed: {}", name, msg);
            TestResult::fail(name, action, expected, &msg)
        }
    }
}

/// A check that needs a session which could not be opened.
fn skipped(name: &str, action: &str, expected: &str, reason: &str) -> TestResult {
    TestResult::fail(name, action, expected, &format!("Not run: {}", reason))
}

fn expect_signal(backend: &StatusBackend, signal_type: &str) -> Result<Signal, String> {
    backend
        .wait_for_single_signal(signal_type)
        .map_err(|e| e.to_string())
}

// =============================================================================
// Application Init Tests
// =============================================================================

fn run_init_tests(ctx: &Context) -> Vec<TestResult> {
    const INIT_SIGNALS: [&str; 4] = [MEDIASERVER_STARTED, NODE_STARTED, NODE_READY, NODE_LOGIN];
    let mut results = Vec::new();

    let mut session = None;
    results.push(run_test(
        "Initialize and restore",
        "InitializeApplication then RestoreAccountAndLogin",
        "Both requests accepted",
        || {
            let backend = ctx.session(&INIT_SIGNALS)?;
            backend.init_status_backend("/").map_err(|e| e.to_string())?;
            backend
                .restore_account_and_login("/", DEFAULT_DISPLAY_NAME, &USER_1, ctx.config.network_id)
                .map_err(|e| e.to_string())?;
            let url = backend.url().to_string();
            session = Some(backend);
            Ok(format!("Session opened on {}", url))
        },
    ));

    for signal_type in INIT_SIGNALS {
        let name = format!("Signal {}", signal_type);
        let action = format!("Wait for '{}'", signal_type);
        let Some(backend) = session.as_ref() else {
            results.push(skipped(&name, &action, "Signal received", "no session"));
            continue;
        };
        results.push(run_test(&name, &action, "Signal received", || {
            let signal = expect_signal(backend, signal_type)?;
            if signal.event().is_null() {
                return Err(format!("Signal without event: {}", signal));
            }
            Ok(format!("Received {}", signal.signal_type()))
        }));
    }

    results
}

// =============================================================================
// Login Tests
// =============================================================================

fn run_login_tests(ctx: &Context) -> Vec<TestResult> {
    let mut results = Vec::new();

    let mut session = None;
    results.push(run_test(
        "Restore account",
        "RestoreAccountAndLogin with user_1, wait for node.login",
        "node.login with the account key uid",
        || {
            let (backend, key_uid) =
                restored_session(&ctx.config, &ctx.pool, &[]).map_err(|e| e.to_string())?;
            let msg = format!("Logged in as {}", key_uid);
            session = Some((backend, key_uid));
            Ok(msg)
        },
    ));

    let Some((backend, key_uid)) = session else {
        for name in ["Logout", "Login again"] {
            results.push(skipped(name, "-", "-", "account was not restored"));
        }
        return results;
    };

    results.push(run_test(
        "Logout",
        "Logout",
        "Request accepted",
        || {
            backend.logout().map_err(|e| e.to_string())?;
            Ok("Logged out".to_string())
        },
    ));

    results.push(run_test(
        "Login again",
        "LoginAccount with the restored key uid",
        "node.login for the same account",
        || {
            backend
                .login(&key_uid, &USER_1)
                .map_err(|e| e.to_string())?;
            let again = backend
                .wait_for_login(backend.signal_timeout())
                .map_err(|e| e.to_string())?;
            if again != key_uid {
                return Err(format!("Logged in as {} instead of {}", again, key_uid));
            }
            Ok(format!("Logged in as {}", again))
        },
    ));

    results
}

// =============================================================================
// Wallet Signal Tests
// =============================================================================

fn activity_filter() -> Value {
    json!({
        "period": {"startTimestamp": 0, "endTimestamp": 0},
        "types": [],
        "statuses": [],
        "counterpartyAddresses": [],
        "assets": [],
        "collectibles": [],
        "filterOutAssets": false,
        "filterOutCollectibles": false,
    })
}

fn request_id() -> RequestId {
    RequestId::from(Uuid::new_v4().to_string())
}

/// Wallet events carry their payload as a JSON string, sometimes single-quoted.
fn wallet_message(signal: &Signal) -> Result<Value, String> {
    let message = signal.event()["message"]
        .as_str()
        .ok_or_else(|| format!("No message in {}", signal))?;
    serde_json::from_str(&message.replace('\'', "\""))
        .map_err(|e| format!("Invalid wallet message '{}': {}", message, e))
}

/// Every activity must have user_1 as its sender.
fn check_activities(message: &Value) -> Result<usize, String> {
    let activities = message["activities"]
        .as_array()
        .ok_or_else(|| format!("No activities in {}", message))?;
    for activity in activities {
        let sender = activity["sender"].as_str().unwrap_or_default();
        if !sender.contains(USER_1.address) {
            return Err(format!(
                "Activity from '{}' to '{}' is not user_1's",
                sender, activity["recipient"]
            ));
        }
    }
    Ok(activities.len())
}

/// Arm for the wallet event of `event_type`, send the request and return the
/// matching signal.
fn wallet_event_for(
    backend: &StatusBackend,
    method: &str,
    params: &[Value],
    event_type: &'static str,
) -> Result<Signal, String> {
    backend
        .prepare_wait_for_signal_matching(WALLET, 1, move |signal| {
            signal.event_type() == Some(event_type)
        })
        .map_err(|e| e.to_string())?;
    backend
        .rpc_valid_request(method, params, Some(request_id()))
        .map_err(|e| e.to_string())?;
    expect_signal(backend, WALLET)
}

fn run_wallet_tests(ctx: &Context) -> Vec<TestResult> {
    let mut results = Vec::new();
    let network_id = ctx.config.network_id;

    let mut session = None;
    results.push(run_test(
        "Wallet session",
        "Restore user_1 and wait for its RPC client",
        "accounts_getKeypairs answers",
        || {
            let backend = ctx.session(&[WALLET])?;
            backend.init_status_backend("/").map_err(|e| e.to_string())?;
            backend
                .restore_account_and_wait_for_rpc_client_to_start(
                    &USER_1,
                    network_id,
                    RPC_CLIENT_START_TIMEOUT,
                )
                .map_err(|e| e.to_string())?;
            session = Some(backend);
            Ok("RPC client started".to_string())
        },
    ));

    let Some(backend) = session else {
        for name in ["Balances", "Activity filter", "Owned collectibles"] {
            results.push(skipped(name, "-", "-", "no wallet session"));
        }
        return results;
    };

    results.push(run_test(
        "Balances",
        "wallet_getBalancesByChain for user_1",
        "Valid JSON-RPC result",
        || {
            let wallet = WalletService::new(backend.rpc().clone());
            let response = wallet
                .get_balances_at_by_chain(&[network_id], &[USER_1.address], &[])
                .map_err(|e| e.to_string())?;
            backend
                .rpc()
                .verify_is_valid_json_rpc_response(&response, None)
                .map_err(|e| e.to_string())?;
            Ok("Balances returned".to_string())
        },
    ));

    results.push(run_test(
        "Activity filter",
        "wallet_filterActivityAsync",
        "wallet signal 'wallet-activity-filtering-done' with user_1 as sender",
        || {
            let params = [
                json!(1),
                json!([USER_1.address]),
                json!([network_id]),
                activity_filter(),
                json!(0),
                json!(50),
            ];
            let signal = wallet_event_for(
                &backend,
                "wallet_filterActivityAsync",
                &params,
                wallet_event::ACTIVITY_FILTERING_DONE,
            )?;
            let count = check_activities(&wallet_message(&signal)?)?;
            Ok(format!("{} activities, all sent by user_1", count))
        },
    ));

    results.push(run_test(
        "Owned collectibles",
        "wallet_getOwnedCollectiblesAsync",
        "wallet signal 'wallet-owned-collectibles-filtering-done' listing user_1",
        || {
            let params = [
                json!(0),
                json!([network_id]),
                json!([USER_1.address]),
                Value::Null,
                json!(0),
                json!(25),
                json!(1),
                json!({"fetch-type": 2, "max-cache-age-seconds": 3600}),
            ];
            let signal = wallet_event_for(
                &backend,
                "wallet_getOwnedCollectiblesAsync",
                &params,
                wallet_event::OWNED_COLLECTIBLES_FILTERING_DONE,
            )?;
            let message = wallet_message(&signal)?;
            let owners = message["ownershipStatus"]
                .as_object()
                .ok_or_else(|| format!("No ownershipStatus in {}", message))?;
            if !owners.contains_key(USER_1.address) {
                return Err(format!("user_1 missing from {}", message));
            }
            Ok("user_1 collectibles listed".to_string())
        },
    ));

    results
}

// =============================================================================
// One-to-one Message Tests
// =============================================================================

/// A messenger-ready session with a fresh account.
fn messenger_session(ctx: &Context, display_name: &str) -> Result<StatusBackend, String> {
    let backend = ctx.session(&[MESSAGES_NEW, MESSAGE_DELIVERED])?;
    backend.init_status_backend("/").map_err(|e| e.to_string())?;
    backend
        .create_account_and_login("/", display_name, &ctx.config.password)
        .map_err(|e| e.to_string())?;
    backend.start_messenger().map_err(|e| e.to_string())?;
    Ok(backend)
}

/// The message of `response` must show up, with the same text, in the
/// receiver's `messages.new` signal.
fn validate_event_against_response(signal: &Signal, response: &Value) -> Result<(), String> {
    let messages = signal.event()["messages"]
        .as_array()
        .filter(|messages| !messages.is_empty())
        .ok_or("No messages found in the event")?;
    let last_message = &response["result"]["chats"][0]["lastMessage"];
    let message_id = &last_message["id"];
    let message = messages
        .iter()
        .find(|message| &message["id"] == message_id)
        .ok_or_else(|| format!("Message with ID {} not found in the event", message_id))?;
    if message["text"] != last_message["text"] {
        return Err(format!(
            "Field 'text': Expected '{}', Found '{}'",
            last_message["text"], message["text"]
        ));
    }
    Ok(())
}

fn run_message_tests(ctx: &Context) -> Vec<TestResult> {
    let mut results = Vec::new();

    let mut sessions = None;
    results.push(run_test(
        "Messenger sessions",
        "Create sender and receiver accounts, start their messengers",
        "Both messengers running",
        || {
            let sender = messenger_session(ctx, "Sender")?;
            let receiver = messenger_session(ctx, DEFAULT_DISPLAY_NAME)?;
            sessions = Some((sender, receiver));
            Ok("Sender and receiver ready".to_string())
        },
    ));

    let Some((sender, receiver)) = sessions else {
        results.push(skipped("Message delivery", "-", "-", "no messenger sessions"));
        return results;
    };

    results.push(run_test(
        "Message delivery",
        "Contact request then wakuext_sendOneToOneMessage",
        "Receiver gets messages.new with the sent text",
        || {
            let pubkey = receiver
                .get_pubkey(DEFAULT_DISPLAY_NAME)
                .map_err(|e| e.to_string())?;
            sender
                .send_contact_request(&[json!({"id": pubkey, "message": "contact_request"})])
                .map_err(|e| e.to_string())?;

            let text = format!("test_message_1_{}", Uuid::new_v4());
            let response = sender
                .send_message(&[json!({"id": pubkey, "message": text})])
                .map_err(|e| e.to_string())?;
            let signal = receiver
                .find_signal_containing_pattern(MESSAGES_NEW, &text, MESSAGE_TIMEOUT)
                .map_err(|e| e.to_string())?;
            validate_event_against_response(&signal, &response)?;
            Ok(format!("Received '{}'", text))
        },
    ));

    results
}

// =============================================================================
// Statusd Tests
// =============================================================================

fn parse_chain_id(chain_id: &str) -> Result<u64, String> {
    u64::from_str_radix(chain_id.trim_start_matches("0x"), 16)
        .map_err(|e| format!("Invalid chain id '{}': {}", chain_id, e))
}

fn chain_id(rpc: &RpcClient) -> Result<u64, String> {
    let chain_id: String = rpc.call("eth_chainId", &[]).map_err(|e| e.to_string())?;
    parse_chain_id(&chain_id)
}

fn run_statusd_tests(ctx: &Context) -> Vec<TestResult> {
    let mut results = Vec::new();
    let config = &ctx.config;

    results.push(run_test(
        "Anvil chain",
        "eth_chainId on the anvil node",
        "The configured network id",
        || {
            let id = chain_id(&RpcClient::new(&config.anvil_url))?;
            if id != config.network_id {
                return Err(format!("Chain {} instead of {}", id, config.network_id));
            }
            Ok(format!("Chain {}", id))
        },
    ));

    let mut signals = None;
    results.push(run_test(
        "Statusd signals",
        "Connect to the statusd signals endpoint",
        "Connection open",
        || {
            let client = SignalClient::connect(format!("{}/signals", config.ws_url_statusd), [WALLET])
                .map_err(|e| e.to_string())?;
            if !client.wait_until_connected(CONNECT_TIMEOUT) {
                return Err(format!("Could not connect to {}", client.url()));
            }
            let msg = format!("Connected to {}", client.url());
            signals = Some(client);
            Ok(msg)
        },
    ));

    let Some(signals) = signals else {
        results.push(skipped("Activity session", "-", "-", "no statusd signals"));
        return results;
    };

    results.push(run_test(
        "Activity session",
        "wallet_startActivityFilterSessionV2 on statusd",
        "Session id, then 'wallet-activity-filtering-done' for it",
        || {
            let rpc = RpcClient::new(&config.rpc_url_statusd);
            signals
                .prepare_wait_for_signal_matching(WALLET, 1, |signal| {
                    signal.event_type() == Some(wallet_event::ACTIVITY_FILTERING_DONE)
                })
                .map_err(|e| e.to_string())?;
            let params = [
                json!([USER_1.address]),
                json!([config.network_id]),
                activity_filter(),
                json!(10),
            ];
            let response = rpc
                .rpc_valid_request("wallet_startActivityFilterSessionV2", &params, Some(request_id()))
                .map_err(|e| e.to_string())?;
            let session_id = response
                .json()
                .map_err(|e| e.to_string())?["result"]
                .as_i64()
                .filter(|id| *id > 0)
                .ok_or_else(|| format!("No session id in {}", response.body))?;
            let signal = signals
                .wait_for_single_signal(WALLET, MESSAGE_TIMEOUT)
                .map_err(|e| e.to_string())?;
            if signal.event()["requestId"].as_i64() != Some(session_id) {
                return Err(format!("Signal for another session: {}", signal));
            }
            wallet_message(&signal)?;
            Ok(format!("Session {} filtered", session_id))
        },
    ));

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use status_backend::accounts::USER_2;

    fn wallet_signal(message: &str) -> Signal {
        Signal::from_value(json!({
            "type": "wallet",
            "event": {"type": wallet_event::ACTIVITY_FILTERING_DONE, "message": message},
        }))
        .unwrap()
    }

    #[test]
    fn wallet_message_decoding() {
        let signal = wallet_signal(&format!("{{'ownershipStatus': {{'{}': {{}}}}}}", USER_1.address));
        let message = wallet_message(&signal).unwrap();
        assert!(message["ownershipStatus"]
            .as_object()
            .unwrap()
            .contains_key(USER_1.address));

        let signal = wallet_signal(r#"{"errorCode": 1, "activities": []}"#);
        assert_eq!(wallet_message(&signal).unwrap()["errorCode"], 1);

        assert!(wallet_message(&wallet_signal("not json")).is_err());
        let no_message = Signal::from_value(json!({"type": "wallet", "event": {}})).unwrap();
        assert!(wallet_message(&no_message).is_err());
    }

    #[test]
    fn activities_must_be_sent_by_user_1() {
        let sent = json!({"sender": USER_1.address, "recipient": USER_2.address});
        assert_eq!(check_activities(&json!({"activities": [sent, sent]})).unwrap(), 2);
        assert_eq!(check_activities(&json!({"activities": []})).unwrap(), 0);

        let received = json!({"sender": USER_2.address, "recipient": USER_1.address});
        let err = check_activities(&json!({"activities": [sent, received]})).unwrap_err();
        assert!(err.contains(USER_2.address));

        assert!(check_activities(&json!({"errorCode": 1})).is_err());
    }

    #[test]
    fn chain_id_is_hex() {
        assert_eq!(parse_chain_id("0x7a69").unwrap(), 31337);
        assert_eq!(parse_chain_id("0x1").unwrap(), 1);
        assert!(parse_chain_id("0xzz").is_err());
    }
}
