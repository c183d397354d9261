use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rally_types::events::{ClientFrame, ServerFrame};
use rally_types::normalize::unwrap_envelope;

use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::socket::{self, WsStream};

type MessageCallback = Arc<dyn Fn(Value) + Send + Sync>;
type ConnectedCallback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(RealtimeError) + Send + Sync>;

struct SubEntry {
    id: Uuid,
    callback: MessageCallback,
}

/// One persistent connection to the realtime endpoint, multiplexing named
/// topic subscriptions over it. At most one live subscription per exact
/// topic string; inbound payloads are normalized (envelope-unwrapped)
/// before reaching the per-topic callback.
///
/// Cloning is cheap and clones share the connection and registry.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    config: RealtimeConfig,
    connected: AtomicBool,
    connecting: AtomicBool,
    subs: Mutex<HashMap<String, SubEntry>>,
    writer: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// Cancel handle for one subscription. Safe to call any number of times;
/// once the underlying subscription is gone (cancelled, or invalidated by
/// a connection close) further calls are no-ops.
pub struct Unsubscribe {
    target: Option<(Arc<ChannelInner>, String, Uuid)>,
}

impl Unsubscribe {
    fn noop() -> Self {
        Self { target: None }
    }

    pub fn cancel(&self) {
        let Some((inner, topic, id)) = self.target.as_ref() else {
            return;
        };
        let removed = {
            let mut subs = lock(&inner.subs);
            match subs.get(topic) {
                // Only remove the generation this handle was issued for; a
                // newer subscription under the same topic is left alone.
                Some(entry) if entry.id == *id => {
                    subs.remove(topic);
                    true
                }
                _ => false,
            }
        };
        if removed {
            debug!("unsubscribed from {topic}");
            send_frame(inner, ClientFrame::Unsubscribe {
                topic: topic.clone(),
            });
        }
    }
}

impl RealtimeChannel {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                config,
                connected: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                subs: Mutex::new(HashMap::new()),
                writer: Mutex::new(None),
                shutdown: Mutex::new(None),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Connect and authenticate. Idempotent: when already connected,
    /// `on_connected` fires immediately and no new connection is made.
    /// An initial connect failure is reported through `on_error` and not
    /// retried; an unexpected close after that reconnects with a bounded
    /// attempt count and fixed delay, firing `on_connected` again on each
    /// successful reconnect. All subscriptions are invalidated on close —
    /// callers re-subscribe from `on_connected`.
    pub fn connect(
        &self,
        token: &str,
        on_connected: impl Fn() + Send + Sync + 'static,
        on_error: impl Fn(RealtimeError) + Send + Sync + 'static,
    ) {
        if self.is_connected() {
            on_connected();
            return;
        }
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            warn!("connect while a connect is already in progress, ignoring");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *lock(&self.inner.shutdown) = Some(shutdown_tx);

        let inner = self.inner.clone();
        let token = token.to_string();
        tokio::spawn(supervise(
            inner,
            token,
            Arc::new(on_connected),
            Arc::new(on_error),
            shutdown_rx,
        ));
    }

    /// Register interest in a topic. Requires an established connection;
    /// otherwise logs and returns a no-op handle. Idempotent per exact
    /// topic string: a second subscribe before cancelling returns a handle
    /// to the same underlying subscription.
    pub fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(Value) + Send + Sync + 'static,
    ) -> Unsubscribe {
        if !self.is_connected() {
            warn!("subscribe({topic}) before connect, ignoring");
            return Unsubscribe::noop();
        }

        let id = {
            let mut subs = lock(&self.inner.subs);
            if let Some(existing) = subs.get(topic) {
                debug!("already subscribed to {topic}");
                return Unsubscribe {
                    target: Some((self.inner.clone(), topic.to_string(), existing.id)),
                };
            }
            let id = Uuid::new_v4();
            subs.insert(topic.to_string(), SubEntry {
                id,
                callback: Arc::new(callback),
            });
            id
        };

        debug!("subscribing to {topic}");
        send_frame(&self.inner, ClientFrame::Subscribe {
            topic: topic.to_string(),
        });
        Unsubscribe {
            target: Some((self.inner.clone(), topic.to_string(), id)),
        }
    }

    /// Convenience form of cancel, keyed by topic string.
    pub fn unsubscribe(&self, topic: &str) {
        let removed = lock(&self.inner.subs).remove(topic).is_some();
        if removed {
            debug!("unsubscribed from {topic}");
            send_frame(&self.inner, ClientFrame::Unsubscribe {
                topic: topic.to_string(),
            });
        }
    }

    /// Fire-and-forget publish.
    pub fn send(&self, topic: &str, body: Value) {
        if !self.is_connected() {
            warn!("send({topic}) while disconnected, dropping");
            return;
        }
        send_frame(&self.inner, ClientFrame::Publish {
            topic: topic.to_string(),
            body,
        });
    }

    /// Cancel every subscription and tear down the transport. Idempotent.
    pub fn disconnect(&self) {
        let Some(shutdown) = lock(&self.inner.shutdown).take() else {
            return;
        };
        info!("disconnecting realtime channel");
        let _ = shutdown.send(true);
        lock(&self.inner.subs).clear();
        *lock(&self.inner.writer) = None;
        self.inner.connected.store(false, Ordering::Release);
    }
}

/// Own the connection for its whole lifetime: initial connect, per-session
/// pump, bounded reconnects after unexpected closes.
async fn supervise(
    inner: Arc<ChannelInner>,
    token: String,
    on_connected: ConnectedCallback,
    on_error: ErrorCallback,
    shutdown: watch::Receiver<bool>,
) {
    // An initial connect failure is terminal for this attempt; only an
    // unexpected close of an established connection triggers reconnects.
    let mut stream = match socket::open(&inner.config.url, &token).await {
        Ok(stream) => stream,
        Err(e) => {
            inner.connecting.store(false, Ordering::SeqCst);
            on_error(e);
            return;
        }
    };

    loop {
        run_session(&inner, stream, &on_connected, shutdown.clone()).await;
        if *shutdown.borrow() {
            break;
        }
        info!("realtime connection closed unexpectedly");
        match reconnect(&inner, &token, shutdown.clone()).await {
            Some(next) => stream = next,
            None => break,
        }
    }

    inner.connecting.store(false, Ordering::SeqCst);
}

async fn run_session(
    inner: &Arc<ChannelInner>,
    stream: WsStream,
    on_connected: &ConnectedCallback,
    shutdown: watch::Receiver<bool>,
) {
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    *lock(&inner.writer) = Some(writer_tx);
    inner.connected.store(true, Ordering::Release);
    on_connected();

    let dispatch_inner = inner.clone();
    socket::pump(stream, writer_rx, shutdown, move |text| {
        dispatch(&dispatch_inner, text);
    })
    .await;

    inner.connected.store(false, Ordering::Release);
    *lock(&inner.writer) = None;

    // The close invalidated every subscription server-side; drop them so
    // stale cancel handles become no-ops and callers re-subscribe.
    let dropped = lock(&inner.subs).drain().count();
    if dropped > 0 {
        info!("invalidated {dropped} subscriptions on close");
    }
}

async fn reconnect(
    inner: &Arc<ChannelInner>,
    token: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Option<WsStream> {
    let max = inner.config.max_reconnect_attempts;
    for attempt in 1..=max {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
            _ = sleep(inner.config.reconnect_delay) => {}
        }
        match socket::open(&inner.config.url, token).await {
            Ok(stream) => {
                info!("reconnected on attempt {attempt}");
                return Some(stream);
            }
            Err(e) => warn!("reconnect attempt {attempt}/{max} failed: {e}"),
        }
    }
    // Out of attempts: give up quietly, callers polling is_connected()
    // will see it stay false.
    warn!("giving up after {max} reconnect attempts");
    None
}

/// Parse one inbound frame and deliver it. A malformed frame is logged and
/// dropped; it never tears down the subscription or the read loop.
fn dispatch(inner: &Arc<ChannelInner>, text: &str) {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            let preview: String = text.chars().take(200).collect();
            warn!("dropping malformed realtime frame: {e} -- raw: {preview}");
            return;
        }
    };

    match frame {
        ServerFrame::Ready => debug!("realtime endpoint ready"),
        ServerFrame::Error { message } => warn!("realtime endpoint error: {message}"),
        ServerFrame::Message { topic, body } => {
            let callback = lock(&inner.subs).get(&topic).map(|s| s.callback.clone());
            match callback {
                Some(callback) => callback(unwrap_envelope(body)),
                None => debug!("message on inactive topic {topic}"),
            }
        }
    }
}

fn send_frame(inner: &ChannelInner, frame: ClientFrame) {
    match lock(&inner.writer).as_ref() {
        Some(writer) => {
            let _ = writer.send(frame);
        }
        None => debug!("no active connection, frame dropped"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
