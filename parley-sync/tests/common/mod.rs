//! Shared fixtures: an in-process push server and a recording HTTP fake.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use parley_sync::{
    Effect, HttpApi, HttpError, MessageId, OutboundCommand, OutgoingMessage, PolledMessage,
    SendError, SentMessage, SyncConfig, ThreadDelta, ThreadKey,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(3);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Config with short timers pointing at `port`.
pub fn test_config(port: u16) -> SyncConfig {
    SyncConfig {
        push_url: format!("ws://127.0.0.1:{port}/ws/notifications/"),
        reconnect_delay_ms: 50,
        connect_grace_ms: 1000,
        thread_poll_interval_ms: 40,
        unread_poll_interval_ms: 40,
        mark_read_retry_interval_ms: 10,
        mark_read_retry_window_ms: 50,
        ..SyncConfig::default()
    }
}

// ─── Push server ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum ServerCmd {
    Text(String),
    DropAll,
}

/// A WebSocket endpoint playing the notification server.
pub struct PushServer {
    pub port: u16,
    commands: broadcast::Sender<ServerCmd>,
    received: mpsc::UnboundedReceiver<OutboundCommand>,
    connections: Arc<AtomicUsize>,
}

impl PushServer {
    pub async fn start() -> Self {
        let port = free_port().await;
        Self::start_on(port).await
    }

    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await.unwrap();
        let (commands, _) = broadcast::channel::<ServerCmd>(64);
        let (received_tx, received) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));

        let cmd_tx = commands.clone();
        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                // Subscribe before the handshake so nothing pushed after
                // the client sees Open is missed
                let mut cmd_rx = cmd_tx.subscribe();
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let received_tx = received_tx.clone();
                tokio::spawn(async move {
                    let (mut writer, mut reader) = ws.split();
                    loop {
                        tokio::select! {
                            frame = reader.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    if let Ok(cmd) = OutboundCommand::decode(text.as_str()) {
                                        let _ = received_tx.send(cmd);
                                    }
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                            cmd = cmd_rx.recv() => match cmd {
                                Ok(ServerCmd::Text(text)) => {
                                    if writer.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(ServerCmd::DropAll) | Err(_) => {
                                    let _ = writer.close().await;
                                    break;
                                }
                            },
                        }
                    }
                });
            }
        });

        Self {
            port,
            commands,
            received,
            connections,
        }
    }

    /// Push a raw JSON frame to every connected client.
    pub fn push(&self, json: serde_json::Value) {
        let _ = self.commands.send(ServerCmd::Text(json.to_string()));
    }

    /// Close every open connection.
    pub fn drop_connections(&self) {
        let _ = self.commands.send(ServerCmd::DropAll);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wait for a client command matching `pred`, skipping others.
    pub async fn expect(&mut self, pred: impl Fn(&OutboundCommand) -> bool) -> OutboundCommand {
        let received = &mut self.received;
        timeout(WAIT, async {
            loop {
                let cmd = received.recv().await.expect("server stopped");
                if pred(&cmd) {
                    return cmd;
                }
            }
        })
        .await
        .expect("expected command not received")
    }

    /// Commands received so far, without waiting.
    pub fn drain(&mut self) -> Vec<OutboundCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.received.try_recv() {
            out.push(cmd);
        }
        out
    }
}

pub fn is_mark_read(last: u64) -> impl Fn(&OutboundCommand) -> bool {
    move |cmd| {
        matches!(cmd, OutboundCommand::MarkRead { last_id: Some(id), .. } if *id == MessageId(last))
    }
}

pub fn message_new(chat_id: u64, id: u64, incoming: bool) -> serde_json::Value {
    serde_json::json!({
        "type": "message_new",
        "chat_id": chat_id,
        "message_id": id,
        "html": format!("<div class=\"msg\">{id}</div>"),
        "incoming": incoming,
        "unread_total": 0,
    })
}

/// A `message_new` addressed the legacy way, by the peer's username.
pub fn peer_message_new(
    chat_id: u64,
    username: &str,
    id: u64,
    incoming: bool,
) -> serde_json::Value {
    serde_json::json!({
        "type": "message_new",
        "chat_id": chat_id,
        "other_username": username,
        "message_id": id,
        "html": format!("<div class=\"msg\">{id}</div>"),
        "incoming": incoming,
        "unread_total": 0,
    })
}

pub fn polled(id: u64, incoming: bool) -> PolledMessage {
    PolledMessage {
        id: MessageId(id),
        html: format!("<div class=\"msg\">{id}</div>"),
        incoming,
    }
}

// ─── HTTP fake ───────────────────────────────────────────────────────

/// One request made through the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Send { thread: ThreadKey, text: String },
    Poll { thread: ThreadKey, after: Option<MessageId> },
    Unread,
    MarkRead {
        thread: ThreadKey,
        last_id: MessageId,
        unread: Vec<MessageId>,
    },
    Header { thread: ThreadKey },
}

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    sends: VecDeque<Result<SentMessage, SendError>>,
    polls: VecDeque<ThreadDelta>,
    next_id: u64,
    unread: u64,
}

/// Recording [`HttpApi`]. Clones share state.
#[derive(Clone, Default)]
pub struct FakeApi {
    state: Arc<Mutex<FakeState>>,
}

impl FakeApi {
    pub fn new() -> Self {
        let api = Self::default();
        api.state.lock().unwrap().next_id = 1000;
        api
    }

    pub fn queue_send(&self, result: Result<SentMessage, SendError>) {
        self.state.lock().unwrap().sends.push_back(result);
    }

    pub fn queue_poll(&self, messages: Vec<PolledMessage>) {
        self.state.lock().unwrap().polls.push_back(ThreadDelta {
            count: Some(messages.len() as u64),
            messages,
            has_more: false,
        });
    }

    pub fn set_unread(&self, count: u64) {
        self.state.lock().unwrap().unread = count;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| pred(c)).count()
    }

    /// Poll the call log until `pred` matches one call.
    pub async fn wait_for(&self, pred: impl Fn(&Call) -> bool) -> Call {
        timeout(WAIT, async {
            loop {
                if let Some(call) = self.calls().into_iter().find(|c| pred(c)) {
                    return call;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expected HTTP call not made")
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

impl HttpApi for FakeApi {
    async fn send_message(
        &self,
        thread: &ThreadKey,
        message: &OutgoingMessage,
    ) -> Result<SentMessage, SendError> {
        self.record(Call::Send {
            thread: thread.clone(),
            text: message.text.clone(),
        });
        let mut state = self.state.lock().unwrap();
        if let Some(result) = state.sends.pop_front() {
            return result;
        }
        state.next_id += 1;
        let id = state.next_id;
        Ok(SentMessage {
            id: MessageId(id),
            html: format!("<div class=\"msg own\">{}</div>", message.text),
            chat_id: match thread {
                ThreadKey::Chat(chat) => Some(*chat),
                ThreadKey::Peer(_) => None,
            },
        })
    }

    async fn poll_thread(
        &self,
        thread: &ThreadKey,
        after: Option<MessageId>,
    ) -> Result<ThreadDelta, HttpError> {
        self.record(Call::Poll {
            thread: thread.clone(),
            after,
        });
        Ok(self.state.lock().unwrap().polls.pop_front().unwrap_or_default())
    }

    async fn unread_total(&self) -> Result<u64, HttpError> {
        self.record(Call::Unread);
        Ok(self.state.lock().unwrap().unread)
    }

    async fn mark_read(
        &self,
        thread: &ThreadKey,
        last_id: MessageId,
        unread: &[MessageId],
    ) -> Result<(), HttpError> {
        self.record(Call::MarkRead {
            thread: thread.clone(),
            last_id,
            unread: unread.to_vec(),
        });
        Ok(())
    }

    async fn fetch_header(&self, thread: &ThreadKey) -> Result<String, HttpError> {
        self.record(Call::Header {
            thread: thread.clone(),
        });
        Ok(format!("<header>{thread}</header>"))
    }
}

// ─── Effects ─────────────────────────────────────────────────────────

/// Receive effects until one matches `pred`; returns everything seen.
pub async fn collect_until(
    effects: &mut mpsc::Receiver<Effect>,
    pred: impl Fn(&Effect) -> bool,
) -> Vec<Effect> {
    timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            let effect = effects.recv().await.expect("effect stream ended");
            let done = pred(&effect);
            seen.push(effect);
            if done {
                return seen;
            }
        }
    })
    .await
    .expect("expected effect not emitted")
}

/// Effects already emitted or arriving within `window`.
pub async fn drain_for(effects: &mut mpsc::Receiver<Effect>, window: Duration) -> Vec<Effect> {
    let mut seen = Vec::new();
    while let Ok(Some(effect)) = timeout(window, effects.recv()).await {
        seen.push(effect);
    }
    seen
}

pub fn rendered_ids(effects: &[Effect]) -> Vec<u64> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Render { id, .. } => Some(id.0),
            _ => None,
        })
        .collect()
}
