use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::registry::{AcceptFn, SignalRegistry};
use crate::signal::Signal;
use crate::transport::{self, FrameHandler};
use crate::wait::Received;

/// Lifecycle of the signals connection, as seen by the transport thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug)]
struct Shared {
    registry: SignalRegistry,
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("poisoned") = state;
        self.state_changed.notify_all();
    }
}

impl FrameHandler for Shared {
    fn on_message(&self, text: &str) {
        self.registry.on_message(text);
    }

    fn on_open(&self, url: &str) {
        tracing::info!("Connection opened: {}", url);
        self.set_state(ConnectionState::Open);
    }

    fn on_close(&self, code: Option<u16>, reason: &str) {
        tracing::info!("Connection closed: {:?}, {}", code, reason);
        self.set_state(ConnectionState::Closed);
    }
}

/// Client of the backend signals channel.
///
/// Owns one WebSocket connection, read on a background thread for the whole
/// life of the client, and one bucket per awaited signal type.
///
/// Typical use: arm with [`SignalClient::prepare_wait_for_signal`], trigger
/// the action (usually an RPC call), then [`SignalClient::wait_for_signal`].
/// A successful wait re-arms the bucket for the next single signal, so a
/// caller that needs more than one must arm again.
#[derive(Debug, Clone)]
pub struct SignalClient {
    url: String,
    shared: Arc<Shared>,
}

impl SignalClient {
    /// Start listening on `url` for the given signal types.
    ///
    /// The connection is opened on the background thread; a failure to
    /// connect is only logged and shows up later as wait timeouts.
    pub fn connect<I, S>(url: impl Into<String>, await_signals: I) -> std::io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let url = url.into();
        let shared = Arc::new(Shared {
            registry: SignalRegistry::new(await_signals),
            state: Mutex::new(ConnectionState::Connecting),
            state_changed: Condvar::new(),
        });
        transport::spawn(url.clone(), shared.clone())?;
        Ok(Self { url, shared })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.shared.registry
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.lock().expect("poisoned")
    }

    /// Block until the connection left the `Connecting` state, and tell
    /// whether it is open.
    ///
    /// A timeout too large to be represented as a deadline waits without one.
    pub fn wait_until_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.state.lock().expect("poisoned");
        while *state == ConnectionState::Connecting {
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.shared
                        .state_changed
                        .wait_timeout(state, deadline - now)
                        .expect("poisoned")
                        .0
                }
                None => self.shared.state_changed.wait(state).expect("poisoned"),
            };
        }
        *state == ConnectionState::Open
    }

    pub fn prepare_wait_for_signal(&self, signal_type: &str, delta_count: usize) -> Result<(), Error> {
        self.shared
            .registry
            .prepare_wait_for_signal(signal_type, delta_count, None)
    }

    /// Like [`SignalClient::prepare_wait_for_signal`], but only signals for
    /// which `accept` returns true are recorded until the next arm.
    pub fn prepare_wait_for_signal_matching<F>(
        &self,
        signal_type: &str,
        delta_count: usize,
        accept: F,
    ) -> Result<(), Error>
    where
        F: Fn(&Signal) -> bool + Send + Sync + 'static,
    {
        let accept_fn: AcceptFn = Arc::new(accept);
        self.shared
            .registry
            .prepare_wait_for_signal(signal_type, delta_count, Some(accept_fn))
    }

    pub fn wait_for_signal(&self, signal_type: &str, timeout: Duration) -> Result<Received, Error> {
        self.shared.registry.wait_for_signal(signal_type, timeout)
    }

    /// Wait for a bucket armed for a single signal and return it.
    pub fn wait_for_single_signal(
        &self,
        signal_type: &str,
        timeout: Duration,
    ) -> Result<Signal, Error> {
        self.wait_for_signal(signal_type, timeout)
            .map(|received| received.last().clone())
    }

    pub fn find_signal_containing_pattern(
        &self,
        signal_type: &str,
        pattern: &str,
        timeout: Duration,
    ) -> Result<Signal, Error> {
        self.shared
            .registry
            .find_signal_containing_pattern(signal_type, pattern, timeout)
    }
}
