//! Push channel adapter over a single WebSocket.
//!
//! ```text
//!            connect()                     handshake ok
//!   Closed ───────────► Connecting ─────────────────────► Open
//!     ▲                     │                               │
//!     │   handshake failed  │           close / error       │
//!     └─────────────────────┴───────────────────────────────┘
//!     │
//!     └── one reconnect timer (fixed delay, optional doubling up to a cap)
//! ```
//!
//! One `PushChannel` exists per page session. Every text frame is decoded
//! into an [`InboundEvent`] and published on the [`EventBus`] once per
//! receipt; state transitions are published as well. Consumers multiplex
//! by event kind and thread correlation, never by opening more sockets.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::bus::{BusEvent, EventBus};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{InboundEvent, OutboundCommand, ProtocolError};

const OUTGOING_CAPACITY: usize = 64;

/// Push channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Reconnect delay bookkeeping. At most one timer is ever pending.
#[derive(Debug)]
struct Backoff {
    base: Duration,
    cap: Option<Duration>,
    current: Duration,
    pending: bool,
}

impl Backoff {
    fn new(base: Duration, cap: Option<Duration>) -> Self {
        Self {
            base,
            cap,
            current: base,
            pending: false,
        }
    }

    /// Delay for the next attempt; doubles toward the cap when one is set.
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        if let Some(cap) = self.cap {
            self.current = (self.current * 2).min(cap);
        }
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Snapshot of channel counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub decode_errors: u64,
    pub connects: u64,
    pub reconnects_scheduled: u64,
}

#[derive(Default)]
struct AtomicChannelStats {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    decode_errors: AtomicU64,
    connects: AtomicU64,
    reconnects_scheduled: AtomicU64,
}

/// The shared push connection.
pub struct PushChannel {
    url: String,
    bus: EventBus,
    state: watch::Sender<ConnectionState>,
    /// Writer task inbox; `Some` only while a socket is open
    outgoing: Mutex<Option<mpsc::Sender<Message>>>,
    backoff: Mutex<Backoff>,
    shutdown: watch::Sender<bool>,
    stats: AtomicChannelStats,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn shut_down(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|s| *s).await;
}

impl PushChannel {
    pub fn new(config: &SyncConfig, bus: EventBus) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            url: config.push_url.clone(),
            bus,
            state,
            outgoing: Mutex::new(None),
            backoff: Mutex::new(Backoff::new(
                config.reconnect_delay(),
                config.reconnect_max_delay(),
            )),
            shutdown,
            stats: AtomicChannelStats::default(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch state transitions without going through the bus.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            decode_errors: self.stats.decode_errors.load(Ordering::Relaxed),
            connects: self.stats.connects.load(Ordering::Relaxed),
            reconnects_scheduled: self.stats.reconnects_scheduled.load(Ordering::Relaxed),
        }
    }

    /// Start connecting. No-op while connecting, open, or shut down.
    pub fn connect(self: &Arc<Self>) {
        if self.is_shut_down() {
            return;
        }
        let started = self.state.send_if_modified(|s| {
            if *s == ConnectionState::Closed {
                *s = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            log::debug!("connect() ignored, channel is {:?}", self.state());
            return;
        }
        self.bus.publish(BusEvent::Connection(ConnectionState::Connecting));

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = this.shutdown.subscribe();
            let result = tokio::select! {
                r = this.run_socket() => r,
                _ = shut_down(&mut shutdown) => Ok(()),
            };
            if let Err(e) = result {
                log::warn!("Push channel error: {e}");
            }
            this.on_closed();
        });
    }

    /// Hand a command to the writer task. `false` when not open; nothing
    /// is ever queued for later.
    pub fn send(&self, command: &OutboundCommand) -> bool {
        if !self.is_open() {
            return false;
        }
        let text = match command.encode() {
            Ok(text) => text,
            Err(e) => {
                log::warn!("Dropping unencodable command: {e}");
                return false;
            }
        };
        let guard = lock(&self.outgoing);
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(Message::Text(text.into())) {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::debug!("Push channel writer unavailable: {e}");
                false
            }
        }
    }

    /// Close the socket and stop reconnecting.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        log::info!("Push channel shutting down");
        lock(&self.outgoing).take();
    }

    async fn run_socket(&self) -> SyncResult<()> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut writer, mut reader) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTGOING_CAPACITY);
        *lock(&self.outgoing) = Some(out_tx);

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        self.stats.connects.fetch_add(1, Ordering::Relaxed);
        lock(&self.backoff).reset();
        self.set_state(ConnectionState::Open);
        log::info!("Push channel open: {}", self.url);

        // The server pushes a count on accept too; ask anyway so a
        // reconnect after a long outage is never stale.
        self.send(&OutboundCommand::GetUnread);

        let result = loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                Some(Ok(Message::Binary(data))) => {
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("{}", ProtocolError::UnexpectedBinary(data.len()));
                }
                Some(Ok(Message::Close(frame))) => {
                    log::info!("Push channel closed by server: {frame:?}");
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(SyncError::from(e)),
                None => break Err(SyncError::ConnectionClosed),
            }
        };

        lock(&self.outgoing).take();
        writer_task.abort();
        result
    }

    fn dispatch(&self, text: &str) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        log::trace!("← {text}");
        match InboundEvent::decode(text) {
            Ok(InboundEvent::Unknown) => log::debug!("Ignoring frame of unknown type"),
            Ok(event) => {
                self.bus.publish_inbound(event);
            }
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping malformed frame: {e}");
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Push channel {previous:?} → {state:?}");
            self.bus.publish(BusEvent::Connection(state));
        }
    }

    fn on_closed(self: &Arc<Self>) {
        lock(&self.outgoing).take();
        self.set_state(ConnectionState::Closed);
        if self.is_shut_down() {
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let delay = {
            let mut backoff = lock(&self.backoff);
            if backoff.pending {
                return;
            }
            backoff.pending = true;
            backoff.next_delay()
        };
        self.stats.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
        log::info!("Reconnecting in {}ms", delay.as_millis());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = this.shutdown.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shut_down(&mut shutdown) => return,
            }
            lock(&this.backoff).pending = false;
            this.connect();
        });
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
