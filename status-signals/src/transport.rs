//! Connection transport
//!
//! A single WebSocket connection read on a background thread. Text frames are
//! handed to a [`FrameHandler`] one at a time, in arrival order. There is no
//! reconnection: once the socket is gone the thread exits.

use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info};
use tungstenite::Message as WsMessage;

/// Receiver of everything the transport thread observes.
///
/// Lifecycle hooks only log by default; they are not recovery triggers.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_message(&self, text: &str);

    fn on_open(&self, url: &str) {
        info!("Connection opened: {}", url);
    }

    fn on_error(&self, error: &tungstenite::Error) {
        error!("Error: {}", error);
    }

    fn on_close(&self, code: Option<u16>, reason: &str) {
        info!("Connection closed: {:?}, {}", code, reason);
    }
}

/// Open `url` and run the receive loop on a new thread.
///
/// The returned handle is never joined by the client: the thread lives until
/// the connection ends and does not keep the process alive.
pub fn spawn<H: FrameHandler>(
    url: String,
    handler: Arc<H>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || run(&url, handler.as_ref()))
}

/// Connect to `url` and forward frames to `handler` until the connection ends.
pub fn run<H: FrameHandler + ?Sized>(url: &str, handler: &H) {
    debug!("signals thread: connecting to {}", url);
    let (mut ws_stream, _) = match tungstenite::connect(url) {
        Ok(stream) => stream,
        Err(e) => {
            handler.on_error(&e);
            handler.on_close(None, "connection failed");
            return;
        }
    };
    handler.on_open(url);

    let mut close_frame = None;
    loop {
        match ws_stream.read() {
            Ok(WsMessage::Text(text)) => handler.on_message(&text),
            Ok(WsMessage::Close(frame)) => {
                debug!("signals thread: close frame received: {:?}", frame);
                close_frame = frame.map(|f| (u16::from(f.code), f.reason.into_owned()));
            }
            // Pings are answered by tungstenite itself.
            Ok(_) => {}
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                match close_frame {
                    Some((code, reason)) => handler.on_close(Some(code), &reason),
                    None => handler.on_close(None, ""),
                }
                break;
            }
            Err(e) => {
                handler.on_error(&e);
                handler.on_close(None, "connection lost");
                break;
            }
        }
    }
    debug!("signals thread: exiting");
}
