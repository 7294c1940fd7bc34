//! Wait coordinator
//!
//! Blocking waits on top of the registry buckets. Waiters sleep on the
//! bucket's condition variable, re-checking their condition under the bucket
//! lock on every wake-up and at least every [`POLL_INTERVAL`].

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::Error;
use crate::registry::SignalRegistry;
use crate::signal::Signal;

/// Upper bound between two checks of a wait condition.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Timeout used by callers that have no better estimate.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Result of a successful [`SignalRegistry::wait_for_signal`].
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// The wait was armed for a single signal: the most recent one.
    Single(Signal),
    /// The wait was armed for `n > 1` signals: the last `n`, oldest first.
    Batch(Vec<Signal>),
}

impl Received {
    /// The most recent signal of the result.
    pub fn last(&self) -> &Signal {
        match self {
            Received::Single(signal) => signal,
            Received::Batch(signals) => signals.last().expect("a batch is never empty"),
        }
    }

    pub fn into_single(self) -> Option<Signal> {
        match self {
            Received::Single(signal) => Some(signal),
            Received::Batch(_) => None,
        }
    }

    pub fn into_vec(self) -> Vec<Signal> {
        match self {
            Received::Single(signal) => vec![signal],
            Received::Batch(signals) => signals,
        }
    }
}

impl SignalRegistry {
    /// Block until the bucket of `signal_type` reaches the count armed by the
    /// last [`SignalRegistry::prepare_wait_for_signal`].
    ///
    /// On success the bucket is re-armed to wait for exactly one more signal,
    /// counted from its current length, with no predicate. On timeout the
    /// bucket is left as it was.
    pub fn wait_for_signal(&self, signal_type: &str, timeout: Duration) -> Result<Received, Error> {
        let bucket = self.bucket(signal_type)?;
        let start = Instant::now();

        let mut state = bucket.lock();
        while !state.is_satisfied() {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::Timeout {
                    signal_type: signal_type.to_string(),
                    timeout,
                });
            }
            let pause = (timeout - elapsed).min(POLL_INTERVAL);
            state = bucket.arrived.wait_timeout(state, pause).expect("poisoned").0;
        }
        debug!(
            "Signal {} is received in {} seconds",
            signal_type,
            start.elapsed().as_secs()
        );

        let delta_count = state.delta_count;
        let received = &state.received;
        let result = if delta_count == 1 {
            Received::Single(received[received.len() - 1].clone())
        } else {
            Received::Batch(received[received.len() - delta_count..].to_vec())
        };
        state.arm(1, None);
        Ok(result)
    }

    /// Find the first signal of `signal_type`, already received or arriving
    /// before the timeout, whose serialized frame contains `pattern`.
    ///
    /// This does not touch the arming state of the bucket.
    pub fn find_signal_containing_pattern(
        &self,
        signal_type: &str,
        pattern: &str,
        timeout: Duration,
    ) -> Result<Signal, Error> {
        let bucket = self.bucket(signal_type)?;
        let start = Instant::now();

        let mut scanned = 0;
        let mut state = bucket.lock();
        loop {
            if let Some(signal) = state.received[scanned..]
                .iter()
                .find(|signal| signal.contains(pattern))
            {
                debug!(
                    "Signal {} containing {:?} found in {} seconds",
                    signal_type,
                    pattern,
                    start.elapsed().as_secs()
                );
                return Ok(signal.clone());
            }
            scanned = state.received.len();

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::Timeout {
                    signal_type: signal_type.to_string(),
                    timeout,
                });
            }
            let pause = (timeout - elapsed).min(POLL_INTERVAL);
            state = bucket.arrived.wait_timeout(state, pause).expect("poisoned").0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AcceptFn;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(300);

    fn frame(signal_type: &str, event: serde_json::Value) -> String {
        json!({"type": signal_type, "event": event}).to_string()
    }

    fn feed(registry: &SignalRegistry, signal_type: &str, n: usize) {
        for i in 0..n {
            registry.on_message(&frame(signal_type, json!({ "n": i })));
        }
    }

    #[test]
    fn single_wait_returns_last_arrival() {
        let registry = SignalRegistry::new(["wallet"]);
        registry.prepare_wait_for_signal("wallet", 1, None).unwrap();
        feed(&registry, "wallet", 3);

        let signal = registry
            .wait_for_signal("wallet", SHORT)
            .unwrap()
            .into_single()
            .unwrap();
        assert_eq!(signal.event()["n"], 2);
    }

    #[test]
    fn batch_wait_returns_last_k_in_order() {
        let registry = SignalRegistry::new(["wallet"]);
        feed(&registry, "wallet", 2);
        registry.prepare_wait_for_signal("wallet", 3, None).unwrap();
        feed(&registry, "wallet", 4);

        let received = registry.wait_for_signal("wallet", SHORT).unwrap();
        let ns: Vec<_> = received
            .into_vec()
            .iter()
            .map(|s| s.event()["n"].as_u64().unwrap())
            .collect();
        assert_eq!(ns, vec![1, 2, 3]);
    }

    #[test]
    fn wait_rearms_to_next_single_signal() {
        let registry = SignalRegistry::new(["wallet"]);
        registry.prepare_wait_for_signal("wallet", 2, None).unwrap();
        feed(&registry, "wallet", 2);
        assert!(matches!(
            registry.wait_for_signal("wallet", SHORT).unwrap(),
            Received::Batch(_)
        ));
        assert_eq!(registry.armed("wallet").unwrap(), (1, 3));

        let err = registry.wait_for_signal("wallet", SHORT).unwrap_err();
        assert!(err.is_timeout());

        feed(&registry, "wallet", 1);
        assert!(matches!(
            registry.wait_for_signal("wallet", SHORT).unwrap(),
            Received::Single(_)
        ));
    }

    #[test]
    fn timeout_leaves_bucket_armed() {
        let registry = SignalRegistry::new(["wallet"]);
        registry.prepare_wait_for_signal("wallet", 2, None).unwrap();
        feed(&registry, "wallet", 1);

        let start = Instant::now();
        let err = registry.wait_for_signal("wallet", SHORT).unwrap_err();
        assert!(start.elapsed() >= SHORT);
        assert_eq!(
            err,
            Error::Timeout {
                signal_type: "wallet".to_string(),
                timeout: SHORT,
            }
        );
        assert_eq!(registry.armed("wallet").unwrap(), (2, 2));

        feed(&registry, "wallet", 1);
        assert_eq!(registry.wait_for_signal("wallet", SHORT).unwrap().into_vec().len(), 2);
    }

    #[test]
    fn wait_rejects_unknown_type() {
        let registry = SignalRegistry::new(["wallet"]);
        let err = registry.wait_for_signal("node.login", SHORT).unwrap_err();
        assert_eq!(err, Error::UnknownSignal("node.login".to_string()));
    }

    #[test]
    fn rejecting_predicate_times_out() {
        let registry = SignalRegistry::new(["wallet"]);
        let accept: AcceptFn = Arc::new(|s: &Signal| s.event_type() == Some("X"));
        registry
            .prepare_wait_for_signal("wallet", 1, Some(accept))
            .unwrap();
        for _ in 0..5 {
            registry.on_message(&frame("wallet", json!({"type": "Y"})));
        }

        let err = registry.wait_for_signal("wallet", SHORT).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(registry.received_count("wallet").unwrap(), 0);
    }

    #[test]
    fn predicate_selects_matching_frame() {
        let registry = SignalRegistry::new(["wallet"]);
        let accept: AcceptFn = Arc::new(|s: &Signal| {
            s.event_type() == Some(crate::signal::wallet_event::ACTIVITY_FILTERING_DONE)
        });
        registry
            .prepare_wait_for_signal("wallet", 1, Some(accept))
            .unwrap();
        registry.on_message(&frame("wallet", json!({"type": "other"})));
        registry.on_message(&frame(
            "wallet",
            json!({"type": "wallet-activity-filtering-done", "requestId": 7}),
        ));

        let signal = registry
            .wait_for_signal("wallet", SHORT)
            .unwrap()
            .into_single()
            .unwrap();
        assert_eq!(signal.event()["requestId"], 7);
    }

    #[test]
    fn wait_unblocks_exactly_at_threshold() {
        let registry = Arc::new(SignalRegistry::new(["wallet"]));
        registry.prepare_wait_for_signal("wallet", 5, None).unwrap();

        let producer = {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..8 {
                    thread::sleep(Duration::from_millis(20));
                    registry.on_message(&frame("wallet", json!({ "n": i })));
                }
            })
        };

        let received = registry
            .wait_for_signal("wallet", Duration::from_secs(5))
            .unwrap();
        let ns: Vec<_> = received
            .into_vec()
            .iter()
            .map(|s| s.event()["n"].as_u64().unwrap())
            .collect();
        // The waiter may observe a few extra arrivals before it gets the
        // lock back, but never fewer than five.
        assert_eq!(ns.len(), 5);
        assert!(ns[4] >= 4);
        assert_eq!(ns, (ns[0]..ns[0] + 5).collect::<Vec<_>>());
        producer.join().unwrap();
    }

    #[test]
    fn concurrent_waiters_on_different_types() {
        let registry = Arc::new(SignalRegistry::new(["wallet", "node.login"]));
        registry.prepare_wait_for_signal("wallet", 1, None).unwrap();
        registry
            .prepare_wait_for_signal("node.login", 1, None)
            .unwrap();

        let waiters: Vec<_> = ["wallet", "node.login"]
            .into_iter()
            .map(|signal_type| {
                let registry = registry.clone();
                thread::spawn(move || registry.wait_for_signal(signal_type, Duration::from_secs(5)))
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        registry.on_message(&frame("node.login", json!({})));
        registry.on_message(&frame("wallet", json!({})));

        for waiter in waiters {
            assert!(waiter.join().unwrap().is_ok());
        }
    }

    #[test]
    fn find_pattern_in_already_received() {
        let registry = SignalRegistry::new(["messages.new"]);
        registry.on_message(&frame("messages.new", json!({"messages": [{"text": "first"}]})));
        registry.on_message(&frame("messages.new", json!({"messages": [{"text": "second"}]})));

        let signal = registry
            .find_signal_containing_pattern("messages.new", "second", SHORT)
            .unwrap();
        assert_eq!(signal.event()["messages"][0]["text"], "second");
        // Pure search: arming state is untouched.
        assert_eq!(registry.armed("messages.new").unwrap(), (1, 1));
    }

    #[test]
    fn find_pattern_waits_for_later_arrival() {
        let registry = Arc::new(SignalRegistry::new(["messages.new"]));
        let producer = {
            let registry = registry.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                registry.on_message(&frame("messages.new", json!({"messages": [{"text": "noise"}]})));
                thread::sleep(Duration::from_millis(50));
                registry.on_message(&frame("messages.new", json!({"messages": [{"text": "needle"}]})));
            })
        };

        let signal = registry
            .find_signal_containing_pattern("messages.new", "needle", Duration::from_secs(5))
            .unwrap();
        assert!(signal.contains("needle"));
        producer.join().unwrap();
    }

    #[test]
    fn find_pattern_times_out() {
        let registry = SignalRegistry::new(["messages.new"]);
        registry.on_message(&frame("messages.new", json!({"text": "hay"})));
        let err = registry
            .find_signal_containing_pattern("messages.new", "needle", SHORT)
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(registry
            .find_signal_containing_pattern("wallet", "needle", SHORT)
            .unwrap_err()
            .is_invalid_argument());
    }

    #[test]
    fn received_accessors() {
        let registry = SignalRegistry::new(["wallet"]);
        feed(&registry, "wallet", 1);
        let single = registry.wait_for_signal("wallet", SHORT).unwrap();
        assert_eq!(single.last().event()["n"], 0);
        assert_eq!(single.clone().into_vec(), vec![single.last().clone()]);
        assert!(single.into_single().is_some());

        registry.prepare_wait_for_signal("wallet", 2, None).unwrap();
        feed(&registry, "wallet", 2);
        let batch = registry.wait_for_signal("wallet", SHORT).unwrap();
        assert_eq!(batch.last().event()["n"], 1);
        assert!(batch.clone().into_single().is_none());
        assert_eq!(batch.into_vec().len(), 2);
    }
}
