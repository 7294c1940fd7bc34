//! Status Signals
//!
//! Client for the signals WebSocket of a status backend. Frames pushed by the
//! backend are classified by their `type` into per-type buckets, and tests
//! wait declaratively for "the next N signals of type X matching P".

mod client;
mod error;
mod registry;
pub mod signal;
pub mod transport;
mod wait;


pub use client::{ConnectionState, SignalClient};
pub use error::Error;
pub use registry::{AcceptFn, SignalRegistry};
pub use signal::{FrameError, Signal};
pub use wait::{Received, DEFAULT_TIMEOUT, POLL_INTERVAL};
