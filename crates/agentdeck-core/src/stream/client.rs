//! SSE client for the server's `/stream` channel.
//!
//! One tokio task drives a [`reqwest_eventsource::EventSource`]; decoded
//! notifications go to whatever handler sits in the [`HandlerSlot`] at the
//! moment they arrive, so callers can swap handlers without reconnecting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::RwLock;
use reqwest::{Client, Url};
use reqwest_eventsource::retry::ExponentialBackoff;
use reqwest_eventsource::{Event, EventSource};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::notification::{decode, Inbound, StreamNotification};
use crate::config::StreamSettings;

/// Callback invoked for every forwarded notification
pub type Handler = Arc<dyn Fn(StreamNotification) + Send + Sync>;

/// Re-settable single-slot handler registration
#[derive(Clone, Default)]
pub struct HandlerSlot {
    handler: Arc<RwLock<Option<Handler>>>,
}

impl HandlerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current handler; takes effect for the next notification.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(StreamNotification) + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Arc::new(handler));
    }

    pub fn clear(&self) {
        *self.handler.write() = None;
    }

    pub fn is_set(&self) -> bool {
        self.handler.read().is_some()
    }

    /// Deliver to the current handler. Returns false when the slot is empty.
    pub fn dispatch(&self, notification: StreamNotification) -> bool {
        // Clone out so the handler may re-set the slot
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => {
                handler(notification);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSlot")
            .field("is_set", &self.is_set())
            .finish()
    }
}

/// Connection state of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Transport lost; the event source is retrying
    Disconnected,
    /// Closed by the caller or retries exhausted
    Closed,
}

/// Error type for starting a stream
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid stream url: {0}")]
    InvalidUrl(String),

    #[error("failed to build stream request: {0}")]
    Request(String),
}

/// Owner of a running stream task.
///
/// Dropping the handle stops the stream; [`StreamHandle::close`] also
/// waits until the connection is released.
pub struct StreamHandle {
    state: watch::Receiver<ConnectionState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver for connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop the stream and wait for the task to finish.
    pub async fn close(mut self) {
        self.signal_shutdown();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Event stream task ended abnormally: {}", e);
            }
        }
    }

    fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Client holding at most one live stream plus its handler slot
pub struct EventStreamClient {
    http: Client,
    retry: StreamSettings,
    slot: HandlerSlot,
    handle: Option<StreamHandle>,
}

impl EventStreamClient {
    pub fn new(settings: &StreamSettings) -> Result<Self, StreamError> {
        let http = Client::builder()
            .build()
            .map_err(|e| StreamError::Request(e.to_string()))?;
        Ok(Self {
            http,
            retry: settings.clone(),
            slot: HandlerSlot::new(),
            handle: None,
        })
    }

    /// The slot notifications are delivered through
    pub fn slot(&self) -> HandlerSlot {
        self.slot.clone()
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(StreamNotification) + Send + Sync + 'static,
    {
        self.slot.set_handler(handler);
    }

    /// Open the stream at `url`, closing any previous one first.
    pub async fn connect(&mut self, url: &str) -> Result<(), StreamError> {
        self.close().await;
        let handle = spawn_stream(&self.http, url, self.slot.clone(), &self.retry)?;
        self.handle = Some(handle);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.handle
            .as_ref()
            .map(StreamHandle::state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn watch_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.handle.as_ref().map(StreamHandle::watch_state)
    }

    pub async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close().await;
        }
    }
}

/// Start a stream task delivering into `slot`.
pub fn spawn_stream(
    http: &Client,
    url: &str,
    slot: HandlerSlot,
    retry: &StreamSettings,
) -> Result<StreamHandle, StreamError> {
    let url = Url::parse(url).map_err(|e| StreamError::InvalidUrl(format!("{}: {}", url, e)))?;
    let mut source = EventSource::new(http.get(url.clone()))
        .map_err(|e| StreamError::Request(e.to_string()))?;
    source.set_retry_policy(Box::new(ExponentialBackoff::new(
        Duration::from_millis(retry.retry_initial_ms),
        2.0,
        Some(Duration::from_millis(retry.retry_max_ms)),
        None,
    )));

    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    debug!("Opening event stream at {}", url);
    let task = tokio::spawn(run_stream(source, slot, state_tx, shutdown_rx));

    Ok(StreamHandle {
        state: state_rx,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn run_stream(
    mut source: EventSource,
    slot: HandlerSlot,
    state: watch::Sender<ConnectionState>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("Event stream closed by owner");
                break;
            }
            event = source.next() => match event {
                Some(Ok(Event::Open)) => {
                    if set_state(&state, ConnectionState::Connected) {
                        info!("Event stream connected");
                    }
                }
                Some(Ok(Event::Message(message))) => {
                    handle_frame(&message.data, &slot, &state);
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) => {
                    if set_state(&state, ConnectionState::Disconnected) {
                        debug!("Event stream ended, reconnecting");
                    }
                }
                Some(Err(e)) => {
                    if set_state(&state, ConnectionState::Disconnected) {
                        warn!("Event stream error: {}", e);
                    }
                }
                None => {
                    warn!("Event stream gave up reconnecting");
                    break;
                }
            }
        }
    }

    source.close();
    set_state(&state, ConnectionState::Closed);
}

fn handle_frame(data: &str, slot: &HandlerSlot, state: &watch::Sender<ConnectionState>) {
    match decode(data) {
        Some(Inbound::Connected) => {
            if set_state(state, ConnectionState::Connected) {
                info!("Event stream connected");
            }
        }
        Some(Inbound::Notification(notification)) => {
            if !slot.dispatch(notification) {
                debug!("No stream handler registered, notification dropped");
            }
        }
        None => {}
    }
}

/// Returns true when the state actually changed
fn set_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::NotificationKind;
    use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
    use axum::routing::get;
    use axum::Router;
    use pretty_assertions::assert_eq;
    use std::convert::Infallible;
    use tokio::sync::mpsc;

    /// Serve `frames` once per connection on `/stream`, then hold the connection open.
    async fn spawn_sse(frames: Vec<&'static str>) -> String {
        let app = Router::new().route(
            "/stream",
            get(move || {
                let frames = frames.clone();
                async move {
                    let events = futures_util::stream::iter(frames)
                        .map(|data| Ok::<_, Infallible>(SseEvent::default().data(data)))
                        .chain(futures_util::stream::pending());
                    Sse::new(events).keep_alive(KeepAlive::default())
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/stream", addr)
    }

    /// Serve frames pushed through the returned sender to the first connection.
    async fn spawn_live_sse() -> (String, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(parking_lot::Mutex::new(Some(rx)));
        let app = Router::new().route(
            "/stream",
            get(move || {
                let rx = rx.lock().take();
                async move {
                    let events = futures_util::stream::unfold(rx, |rx| async move {
                        let mut rx = rx?;
                        let data = rx.recv().await?;
                        Some((
                            Ok::<_, Infallible>(SseEvent::default().data(data)),
                            Some(rx),
                        ))
                    })
                    .chain(futures_util::stream::pending());
                    Sse::new(events).keep_alive(KeepAlive::default())
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/stream", addr), tx)
    }

    fn channel_client() -> (EventStreamClient, mpsc::UnboundedReceiver<StreamNotification>) {
        let client = EventStreamClient::new(&StreamSettings::default()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        client.set_handler(move |n| {
            let _ = tx.send(n);
        });
        (client, rx)
    }

    #[test]
    fn test_slot_dispatches_to_latest_handler() {
        let slot = HandlerSlot::new();
        let n = StreamNotification::for_team(NotificationKind::TaskUpdate, "alpha");
        assert!(!slot.dispatch(n.clone()));

        let seen = Arc::new(RwLock::new(Vec::new()));
        let first = seen.clone();
        slot.set_handler(move |_| first.write().push("first"));
        assert!(slot.dispatch(n.clone()));

        let second = seen.clone();
        slot.set_handler(move |_| second.write().push("second"));
        slot.dispatch(n.clone());
        slot.dispatch(n);

        assert_eq!(*seen.read(), vec!["first", "second", "second"]);
    }

    #[test]
    fn test_handler_may_replace_itself() {
        let slot = HandlerSlot::new();
        let inner = slot.clone();
        let count = Arc::new(RwLock::new(0));
        let c = count.clone();
        slot.set_handler(move |_| {
            *c.write() += 1;
            inner.clear();
        });
        let n = StreamNotification::new(NotificationKind::TeamUpdate);
        assert!(slot.dispatch(n.clone()));
        assert!(!slot.dispatch(n));
        assert_eq!(*count.read(), 1);
    }

    #[test]
    fn test_frame_handling_keeps_state_on_garbage() {
        let slot = HandlerSlot::new();
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        handle_frame("{{{", &slot, &tx);
        handle_frame("null", &slot, &tx);
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_stream_forwards_notifications() {
        let url = spawn_sse(vec![
            r#"{"type":"connected"}"#,
            r#"{"type":"task_update","team":"alpha","task_id":7}"#,
        ])
        .await;
        let (mut client, mut rx) = channel_client();
        client.connect(&url).await.unwrap();

        let n = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.kind, NotificationKind::TaskUpdate);
        assert_eq!(n.task_id, Some(7));
        assert_eq!(client.state(), ConnectionState::Connected);

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_handler_swap_on_live_stream() {
        let (url, frames) = spawn_live_sse().await;
        let (mut client, mut first) = channel_client();
        client.connect(&url).await.unwrap();

        frames.send(r#"{"type":"connected"}"#.to_string()).unwrap();
        frames
            .send(r#"{"type":"task_update","team":"alpha","task_id":1}"#.to_string())
            .unwrap();
        let n = tokio::time::timeout(Duration::from_secs(5), first.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.task_id, Some(1));

        let (tx, mut second) = mpsc::unbounded_channel();
        client.set_handler(move |n| {
            let _ = tx.send(n);
        });
        frames
            .send(r#"{"type":"task_update","team":"alpha","task_id":2}"#.to_string())
            .unwrap();
        let n = tokio::time::timeout(Duration::from_secs(5), second.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.task_id, Some(2));
        assert!(first.try_recv().is_err());
        assert_eq!(client.state(), ConnectionState::Connected);

        client.close().await;
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let url = spawn_sse(vec![
            r#"{"type":"connected"}"#,
            "this is not json",
            r#"{"team":"alpha"}"#,
            r#"{"type":"team_update","team":"alpha"}"#,
        ])
        .await;
        let (mut client, mut rx) = channel_client();
        client.connect(&url).await.unwrap();

        let n = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n.kind, NotificationKind::TeamUpdate);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut client, _rx) = channel_client();
        client
            .connect(&format!("http://{}/stream", addr))
            .await
            .unwrap();
        let mut state = client.watch_state().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let (mut client, _rx) = channel_client();
        assert!(matches!(
            client.connect("not a url").await,
            Err(StreamError::InvalidUrl(_))
        ));
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
