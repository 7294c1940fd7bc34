//! Signal registry and classifier
//!
//! One bucket per awaited signal type. Each bucket owns its own lock and
//! condition variable, so the receive loop appending to one type never
//! contends with a caller waiting on another.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::error::Error;
use crate::signal::Signal;

/// Acceptance predicate armed on a bucket.
///
/// It runs on the receive thread while the bucket is locked: it must be fast
/// and must not block or call back into the client.
pub type AcceptFn = Arc<dyn Fn(&Signal) -> bool + Send + Sync>;

pub(crate) struct BucketState {
    /// Every accepted signal, in arrival order. Never trimmed.
    pub(crate) received: Vec<Signal>,
    pub(crate) delta_count: usize,
    pub(crate) expected_count: usize,
    pub(crate) accept_fn: Option<AcceptFn>,
}

impl BucketState {
    fn new() -> Self {
        Self {
            received: Vec::new(),
            delta_count: 1,
            expected_count: 1,
            accept_fn: None,
        }
    }

    pub(crate) fn arm(&mut self, delta_count: usize, accept_fn: Option<AcceptFn>) {
        self.delta_count = delta_count;
        self.expected_count = self.received.len() + delta_count;
        self.accept_fn = accept_fn;
    }

    pub(crate) fn is_satisfied(&self) -> bool {
        self.received.len() >= self.expected_count
    }
}

impl std::fmt::Debug for BucketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketState")
            .field("received", &self.received.len())
            .field("delta_count", &self.delta_count)
            .field("expected_count", &self.expected_count)
            .field("accept_fn", &self.accept_fn.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct Bucket {
    pub(crate) state: Mutex<BucketState>,
    /// Notified after every accepted append.
    pub(crate) arrived: Condvar,
}

impl Bucket {
    fn new() -> Self {
        Self {
            state: Mutex::new(BucketState::new()),
            arrived: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().expect("poisoned")
    }
}

/// The set of buckets of a signal client. Fixed at construction.
#[derive(Debug)]
pub struct SignalRegistry {
    buckets: BTreeMap<String, Bucket>,
}

impl SignalRegistry {
    pub fn new<I, S>(await_signals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let buckets = await_signals
            .into_iter()
            .map(|signal_type| (signal_type.into(), Bucket::new()))
            .collect();
        Self { buckets }
    }

    pub fn await_signals(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    pub fn is_awaited(&self, signal_type: &str) -> bool {
        self.buckets.contains_key(signal_type)
    }

    pub(crate) fn bucket(&self, signal_type: &str) -> Result<&Bucket, Error> {
        self.buckets
            .get(signal_type)
            .ok_or_else(|| Error::UnknownSignal(signal_type.to_string()))
    }

    /// Classify one raw frame from the transport.
    ///
    /// Malformed frames and frames of types nobody awaits are dropped.
    pub fn on_message(&self, text: &str) {
        let signal = match Signal::from_frame(text) {
            Ok(signal) => signal,
            Err(e) => {
                debug!("on_message: dropping frame: {}", e);
                return;
            }
        };
        let bucket = match self.buckets.get(signal.signal_type()) {
            Some(bucket) => bucket,
            None => {
                trace!("on_message: ignoring signal {}", signal.signal_type());
                return;
            }
        };

        let mut state = bucket.lock();
        if let Some(accept_fn) = &state.accept_fn {
            if !accept_fn(&signal) {
                trace!("on_message: signal {} rejected", signal.signal_type());
                return;
            }
        }
        debug!("on_message: received signal {}", signal.signal_type());
        state.received.push(signal);
        drop(state);
        bucket.arrived.notify_all();
    }

    /// Set up how many instances of a signal to wait for, before triggering
    /// the action that causes them to be emitted.
    ///
    /// `accept_fn` only filters signals arriving from now on; signals already
    /// received are not re-examined.
    pub fn prepare_wait_for_signal(
        &self,
        signal_type: &str,
        delta_count: usize,
        accept_fn: Option<AcceptFn>,
    ) -> Result<(), Error> {
        let bucket = self.bucket(signal_type)?;
        if delta_count < 1 {
            return Err(Error::InvalidDeltaCount);
        }
        bucket.lock().arm(delta_count, accept_fn);
        Ok(())
    }

    /// Snapshot of every signal of this type accepted so far.
    pub fn received(&self, signal_type: &str) -> Result<Vec<Signal>, Error> {
        Ok(self.bucket(signal_type)?.lock().received.clone())
    }

    pub fn received_count(&self, signal_type: &str) -> Result<usize, Error> {
        Ok(self.bucket(signal_type)?.lock().received.len())
    }

    /// `(delta_count, expected_count)` as currently armed.
    pub fn armed(&self, signal_type: &str) -> Result<(usize, usize), Error> {
        let state = self.bucket(signal_type)?.lock();
        Ok((state.delta_count, state.expected_count))
    }
}
