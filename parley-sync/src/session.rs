//! Page session: the shared push channel, the global unread counter, and
//! one driver task per open thread view.
//!
//! ```text
//!                       ┌──────────────┐
//!   WebSocket ────────► │ PushChannel  │──┐
//!                       └──────────────┘  │ publish
//!                                         ▼
//!                                   ┌──────────┐
//!                     ┌──────────── │ EventBus │ ────────────┐
//!                     │ subscribe   └──────────┘  subscribe  │
//!                     ▼                   ▲                  ▼
//!             ┌──────────────┐            │ poll results  ┌──────────────┐
//!             │ unread loop  │────────────┴───────────────│ ThreadDriver │
//!             │ (run_global) │                            │ (one view)   │
//!             └──────┬───────┘                            └──┬────────▲──┘
//!                    │ watch<UnreadSnapshot>          Effect │        │ ThreadCommand
//!                    ▼                                       ▼        │
//!                                     host page
//! ```
//!
//! Each driver owns its reconciler, read tracker, poller and timers. All
//! mutation happens inside that task; in-flight requests are futures in a
//! `FuturesUnordered` that die with it when the view is closed.

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use std::future::pending;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus, Filter, Subscription};
use crate::channel::{ConnectionState, PushChannel};
use crate::config::SyncConfig;
use crate::error::{ConfigError, ErrorCategory, SyncResult};
use crate::http::{
    HttpApi, HttpError, OutgoingMessage, ReqwestApi, SendError, SentMessage, ThreadDelta,
};
use crate::poller::{FallbackPoller, FallbackPolicy, PolicyDecision, PollTicket};
use crate::protocol::{EventKind, InboundEvent, MessageId, OutboundCommand};
use crate::read_state::{ReadTracker, RetryStep};
use crate::reconciler::{DeliveryReconciler, Effect, ScrollGeometry, ViewToken};
use crate::thread::{ThreadContext, ThreadKey};
use crate::timeline::MessageEntry;

const COMMAND_CAPACITY: usize = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn shut_down(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|s| *s).await;
}

/// Start or stop `poller` (and its ticker) as the policy decided.
fn apply_decision(
    decision: PolicyDecision,
    period: Duration,
    poller: &mut FallbackPoller,
    ticker: &mut Option<Interval>,
) {
    match decision {
        PolicyDecision::Start => {
            if poller.start(period) {
                let mut every = interval(period);
                every.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *ticker = Some(every);
            }
        }
        PolicyDecision::Stop => {
            poller.stop();
            *ticker = None;
        }
        PolicyDecision::Keep => {}
    }
}

// ─── Global unread counter ───────────────────────────────────────────

/// Latest global unread count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadSnapshot {
    pub count: u64,
    /// The count grew since the previous observation (badge pulse)
    pub increased: bool,
}

/// Header badge state, fed by push events and fallback polls.
#[derive(Debug)]
pub struct UnreadCounter {
    tx: watch::Sender<UnreadSnapshot>,
    known: Mutex<bool>,
}

impl UnreadCounter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(UnreadSnapshot::default());
        Self {
            tx,
            known: Mutex::new(false),
        }
    }

    /// Record a count. The first observation never reports an increase.
    pub fn set(&self, count: u64) -> UnreadSnapshot {
        let mut known = lock(&self.known);
        let previous = self.tx.borrow().count;
        let snapshot = UnreadSnapshot {
            count,
            increased: *known && count > previous,
        };
        *known = true;
        self.tx.send_replace(snapshot);
        snapshot
    }

    pub fn get(&self) -> UnreadSnapshot {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<UnreadSnapshot> {
        self.tx.subscribe()
    }
}

impl Default for UnreadCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Session ─────────────────────────────────────────────────────────

/// Explicitly constructed page-session object.
pub struct Session<A: HttpApi = ReqwestApi> {
    config: Arc<SyncConfig>,
    api: Arc<A>,
    bus: EventBus,
    channel: Arc<PushChannel>,
    unread: Arc<UnreadCounter>,
    current_view: Mutex<Option<ViewToken>>,
    global_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Session<ReqwestApi> {
    /// Session talking to the real endpoints.
    pub fn with_reqwest(config: SyncConfig) -> SyncResult<Self> {
        let api = ReqwestApi::new(&config)?;
        Ok(Self::new(config, api)?)
    }
}

impl<A: HttpApi> Session<A> {
    pub fn new(config: SyncConfig, api: A) -> Result<Self, ConfigError> {
        config.validate()?;
        let bus = EventBus::new(config.bus_capacity);
        let channel = PushChannel::new(&config, bus.clone());
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            api: Arc::new(api),
            bus,
            channel,
            unread: Arc::new(UnreadCounter::new()),
            current_view: Mutex::new(None),
            global_task: Mutex::new(None),
            shutdown,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn channel(&self) -> &Arc<PushChannel> {
        &self.channel
    }

    pub fn unread(&self) -> watch::Receiver<UnreadSnapshot> {
        self.unread.subscribe()
    }

    pub fn unread_count(&self) -> UnreadSnapshot {
        self.unread.get()
    }

    /// Connect the push channel and start the unread loop.
    pub fn start(&self) {
        self.run_global();
        self.channel.connect();
    }

    /// Spawn the loop that keeps the global unread counter fresh. Calling
    /// it again while the loop runs does nothing.
    pub fn run_global(&self) {
        let mut task = lock(&self.global_task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let global = UnreadLoop {
            config: self.config.clone(),
            api: self.api.clone(),
            channel: self.channel.clone(),
            unread: self.unread.clone(),
            sub: self.bus.subscribe(
                Filter::kinds(&[EventKind::UnreadTotal, EventKind::MessageNew]).with_connection(),
            ),
            bus: self.bus.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        *task = Some(tokio::spawn(global.run()));
    }

    /// Open a thread view, closing the previous one.
    pub fn open_thread(&self, ctx: ThreadContext) -> ThreadHandle {
        self.open_thread_with_history(ctx, Vec::new())
    }

    /// Open a thread view whose history the page already rendered.
    pub fn open_thread_with_history(
        &self,
        ctx: ThreadContext,
        history: Vec<MessageEntry>,
    ) -> ThreadHandle {
        let mut reconciler = DeliveryReconciler::new(
            ctx.clone(),
            self.config.scroll_threshold_px,
            self.config.max_attachments,
            self.config.endpoints.inbox.clone(),
        );
        reconciler.seed(history);
        // Host-side close signal, separate from the reconciler's own
        // token so a terminated view still delivers its last effects
        let token = ViewToken::new();

        {
            let mut current = lock(&self.current_view);
            if let Some(previous) = current.replace(token.clone()) {
                log::info!("Closing previous thread view");
                previous.revoke();
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (effect_tx, effect_rx) = mpsc::channel(self.config.effect_capacity);
        let key = ctx.key();

        let driver = ThreadDriver {
            sub: self.bus.subscribe(Filter::all()),
            bus: self.bus.clone(),
            tracker: ReadTracker::new(self.config.retry_policy()),
            poller: FallbackPoller::new(),
            policy: FallbackPolicy::new(self.config.connect_grace()),
            geometry: ScrollGeometry::default(),
            retry_at: None,
            ticker: None,
            header_pending: false,
            inflight: FuturesUnordered::new(),
            key: key.clone(),
            ctx,
            reconciler,
            config: self.config.clone(),
            api: self.api.clone(),
            channel: self.channel.clone(),
            effects: effect_tx,
            token: token.clone(),
        };
        let task = tokio::spawn(driver.run(command_rx));

        ThreadHandle {
            key,
            commands: command_tx,
            effects: Some(effect_rx),
            token,
            task,
        }
    }

    /// Close the current view, the unread loop and the push channel.
    pub fn shutdown(&self) {
        if let Some(view) = lock(&self.current_view).take() {
            view.revoke();
        }
        self.shutdown.send_replace(true);
        self.channel.shutdown();
    }
}

impl<A: HttpApi> Drop for Session<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Unread loop ─────────────────────────────────────────────────────

type UnreadFetch = BoxFuture<'static, (Option<PollTicket>, Result<u64, HttpError>)>;

struct UnreadLoop<A: HttpApi> {
    config: Arc<SyncConfig>,
    api: Arc<A>,
    channel: Arc<PushChannel>,
    unread: Arc<UnreadCounter>,
    sub: Subscription,
    bus: EventBus,
    shutdown: watch::Receiver<bool>,
}

impl<A: HttpApi> UnreadLoop<A> {
    async fn run(mut self) {
        let mut policy = FallbackPolicy::new(self.config.connect_grace());
        let mut poller = FallbackPoller::new();
        let mut ticker: Option<Interval> = None;
        // `None` marks a one-shot refresh outside the poller's generations
        let mut inflight: FuturesUnordered<UnreadFetch> = FuturesUnordered::new();

        let period = self.config.unread_poll_interval();

        let initial = policy.on_state(self.channel.state(), Instant::now());
        apply_decision(initial, period, &mut poller, &mut ticker);

        loop {
            tokio::select! {
                event = self.sub.recv() => match event {
                    Some(BusEvent::Inbound(InboundEvent::UnreadTotal { count, .. }))
                    | Some(BusEvent::Inbound(InboundEvent::MessageNew {
                        unread_total: Some(count),
                        ..
                    })) => {
                        let snapshot = self.unread.set(count);
                        log::debug!(
                            "Unread total {} (increased: {})",
                            snapshot.count,
                            snapshot.increased
                        );
                    }
                    Some(BusEvent::Connection(state)) => {
                        let decision = policy.on_state(state, Instant::now());
                        apply_decision(decision, period, &mut poller, &mut ticker);
                    }
                    Some(BusEvent::Lagged(_)) => {
                        // The missed events may include a state change
                        let decision = policy.on_state(self.channel.state(), Instant::now());
                        apply_decision(decision, period, &mut poller, &mut ticker);
                        if !self.channel.send(&OutboundCommand::GetUnread) {
                            let api = self.api.clone();
                            inflight.push(async move { (None, api.unread_total().await) }.boxed());
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = sleep_until_opt(policy.grace_deadline()) => {
                    let decision = policy.on_grace_elapsed(Instant::now());
                    apply_decision(decision, period, &mut poller, &mut ticker);
                }
                _ = tick(&mut ticker) => {
                    if let Some(ticket) = poller.begin() {
                        let api = self.api.clone();
                        let fetch = async move { (Some(ticket), api.unread_total().await) };
                        inflight.push(fetch.boxed());
                    }
                }
                Some((ticket, result)) = inflight.next(), if !inflight.is_empty() => {
                    if ticket.is_some_and(|t| !poller.accept(&t)) {
                        continue;
                    }
                    match result {
                        Ok(count) => {
                            let event = InboundEvent::UnreadTotal { count, updated: None };
                            self.bus.publish_inbound(event);
                        }
                        Err(e) => log::warn!("Unread poll failed: {e}"),
                    }
                }
                _ = shut_down(&mut self.shutdown) => break,
            }
        }
        log::debug!("Unread loop stopped");
    }
}

// ─── Thread views ────────────────────────────────────────────────────

/// Commands from the host to an open thread view.
#[derive(Debug, Clone)]
pub enum ThreadCommand {
    Submit(OutgoingMessage),
    Scrolled(ScrollGeometry),
    JumpToBottom,
    Close,
}

/// The host's end of an open thread view.
///
/// Dropping the handle closes the view without waiting for its task.
pub struct ThreadHandle {
    key: ThreadKey,
    commands: mpsc::Sender<ThreadCommand>,
    effects: Option<mpsc::Receiver<Effect>>,
    token: ViewToken,
    task: JoinHandle<()>,
}

impl ThreadHandle {
    pub fn key(&self) -> &ThreadKey {
        &self.key
    }

    /// Take the effect receiver (can only be called once).
    pub fn take_effects(&mut self) -> Option<mpsc::Receiver<Effect>> {
        self.effects.take()
    }

    pub fn commands(&self) -> mpsc::Sender<ThreadCommand> {
        self.commands.clone()
    }

    pub fn is_live(&self) -> bool {
        self.token.is_live() && !self.task.is_finished()
    }

    /// Queue a command. `false` once the view is gone.
    pub async fn send(&self, command: ThreadCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub async fn submit(&self, message: OutgoingMessage) -> bool {
        self.send(ThreadCommand::Submit(message)).await
    }

    pub async fn scrolled(&self, geometry: ScrollGeometry) -> bool {
        self.send(ThreadCommand::Scrolled(geometry)).await
    }

    pub async fn jump_to_bottom(&self) -> bool {
        self.send(ThreadCommand::JumpToBottom).await
    }

    /// Close the view and wait for its task to finish.
    pub async fn close(mut self) {
        self.token.revoke();
        // Revocation alone wakes the driver; the command is a courtesy
        let _ = self.commands.try_send(ThreadCommand::Close);
        if let Err(e) = (&mut self.task).await {
            log::error!("Thread driver for {} panicked: {e}", self.key);
        }
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.token.revoke();
    }
}

enum Completion {
    Sent {
        client_id: Uuid,
        result: Result<SentMessage, SendError>,
    },
    Polled {
        ticket: PollTicket,
        result: Result<ThreadDelta, HttpError>,
    },
    /// One-shot catch-up after the bus dropped events
    Resynced(Result<ThreadDelta, HttpError>),
    MarkedRead {
        last_id: MessageId,
        result: Result<(), HttpError>,
    },
    Header(Result<String, HttpError>),
    Unread(Result<u64, HttpError>),
}

struct ThreadDriver<A: HttpApi> {
    ctx: ThreadContext,
    key: ThreadKey,
    config: Arc<SyncConfig>,
    api: Arc<A>,
    channel: Arc<PushChannel>,
    bus: EventBus,
    sub: Subscription,
    effects: mpsc::Sender<Effect>,
    /// Revoked by the host or by a newer view
    token: ViewToken,
    reconciler: DeliveryReconciler,
    tracker: ReadTracker,
    poller: FallbackPoller,
    policy: FallbackPolicy,
    /// Last viewport reported by the host
    geometry: ScrollGeometry,
    retry_at: Option<Instant>,
    ticker: Option<Interval>,
    header_pending: bool,
    inflight: FuturesUnordered<BoxFuture<'static, Completion>>,
}

impl<A: HttpApi> ThreadDriver<A> {
    async fn run(mut self, mut commands: mpsc::Receiver<ThreadCommand>) {
        log::info!("Thread view {} opened", self.key);
        let token = self.token.clone();

        let opened = self.reconciler.open();
        self.route(opened).await;
        let state = self.channel.state();
        self.on_connection(state);

        while token.is_live() && self.reconciler.is_live() {
            tokio::select! {
                _ = token.revoked() => break,
                command = commands.recv() => match command {
                    Some(ThreadCommand::Close) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                event = self.sub.recv() => match event {
                    Some(BusEvent::Inbound(event)) => {
                        let effects = self.reconciler.handle_inbound(event, &self.geometry);
                        self.route(effects).await;
                    }
                    Some(BusEvent::Connection(state)) => self.on_connection(state),
                    Some(BusEvent::Lagged(missed)) => self.resync(missed),
                    None => break,
                },
                _ = sleep_until_opt(self.policy.grace_deadline()) => {
                    let decision = self.policy.on_grace_elapsed(Instant::now());
                    self.apply(decision);
                }
                _ = tick(&mut self.ticker) => self.poll(),
                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.attempt_mark_read();
                }
                Some(done) = self.inflight.next(), if !self.inflight.is_empty() => {
                    self.on_completion(done).await;
                }
            }
        }

        self.reconciler.teardown();
        self.token.revoke();
        self.poller.stop();
        log::info!("Thread view {} closed", self.key);
    }

    async fn on_command(&mut self, command: ThreadCommand) {
        match command {
            ThreadCommand::Submit(draft) => match self.reconciler.begin_send(draft) {
                Ok(message) => {
                    let api = self.api.clone();
                    let key = self.key.clone();
                    self.inflight.push(
                        async move {
                            let result = api.send_message(&key, &message).await;
                            Completion::Sent {
                                client_id: message.client_id,
                                result,
                            }
                        }
                        .boxed(),
                    );
                }
                Err(e) => {
                    log::debug!("Submit refused: {e}");
                    let failed = Effect::SendFailed {
                        retryable: false,
                        reason: e.to_string(),
                    };
                    self.emit(failed).await;
                }
            },
            ThreadCommand::Scrolled(geometry) => {
                self.geometry = geometry;
                let effects = self.reconciler.on_scroll(&geometry);
                self.route(effects).await;
            }
            ThreadCommand::JumpToBottom => {
                let effects = self.reconciler.jump_to_bottom();
                self.route(effects).await;
            }
            ThreadCommand::Close => {}
        }
    }

    async fn on_completion(&mut self, done: Completion) {
        match done {
            Completion::Sent { client_id, result } => {
                let effects = self.reconciler.complete_send(client_id, result, &self.geometry);
                self.route(effects).await;
            }
            Completion::Polled { ticket, result } => {
                if self.poller.accept(&ticket) {
                    self.apply_delta(result).await;
                }
            }
            Completion::Resynced(result) => self.apply_delta(result).await,
            Completion::MarkedRead { last_id, result } => match result {
                Ok(()) => self.tracker.acknowledge(last_id),
                Err(e) => {
                    // Stays pending; re-sent once the channel opens
                    let level = match e.category() {
                        ErrorCategory::TransientRequest => log::Level::Debug,
                        _ => log::Level::Warn,
                    };
                    log::log!(level, "HTTP mark_read {last_id} failed: {e}");
                }
            },
            Completion::Header(result) => {
                self.header_pending = false;
                let effects = self.reconciler.complete_header(result);
                self.route(effects).await;
            }
            Completion::Unread(result) => match result {
                Ok(count) => {
                    // Through the bus so the unread loop records it
                    let event = InboundEvent::UnreadTotal { count, updated: None };
                    self.bus.publish_inbound(event);
                }
                Err(e) => log::debug!("Unread refresh failed: {e}"),
            },
        }
    }

    async fn apply_delta(&mut self, result: Result<ThreadDelta, HttpError>) {
        match result {
            Ok(delta) => {
                log::debug!(
                    "Poll of {} returned {} messages (count {:?})",
                    self.key,
                    delta.messages.len(),
                    delta.count
                );
                for message in delta.messages {
                    let event = message.into_event(&self.ctx);
                    let effects = self.reconciler.handle_inbound(event, &self.geometry);
                    self.route(effects).await;
                }
            }
            Err(HttpError::Forbidden { redirect }) => {
                let effects = self.reconciler.access_lost(Some(redirect));
                self.route(effects).await;
            }
            Err(e) => log::warn!("Poll of {} failed: {e}", self.key),
        }
    }

    /// Refetch what the bus dropped. Bypasses the poller, which is
    /// stopped while the channel is open.
    fn resync(&mut self, missed: u64) {
        log::info!("Thread view {} missed {missed} events, resyncing", self.key);
        let state = self.channel.state();
        self.on_connection(state);

        let api = self.api.clone();
        let key = self.key.clone();
        let after = self.reconciler.last_id();
        self.inflight.push(
            async move { Completion::Resynced(api.poll_thread(&key, after).await) }.boxed(),
        );
    }

    fn on_connection(&mut self, state: ConnectionState) {
        let decision = self.policy.on_state(state, Instant::now());
        self.apply(decision);
        if state == ConnectionState::Open && self.tracker.pending().is_some() {
            self.attempt_mark_read();
        }
    }

    fn apply(&mut self, decision: PolicyDecision) {
        let period = self.config.thread_poll_interval();
        apply_decision(decision, period, &mut self.poller, &mut self.ticker);
    }

    fn poll(&mut self) {
        let Some(ticket) = self.poller.begin() else {
            return;
        };
        let api = self.api.clone();
        let key = self.key.clone();
        let after = self.reconciler.last_id();
        self.inflight.push(
            async move {
                let result = api.poll_thread(&key, after).await;
                Completion::Polled { ticket, result }
            }
            .boxed(),
        );
    }

    /// Execute session-owned effects, forward the rest to the host.
    async fn route(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            if !self.token.is_live() {
                break;
            }
            match effect {
                Effect::MarkRead(id) => {
                    if self.tracker.request(id).is_some() {
                        self.retry_at = None;
                        self.attempt_mark_read();
                    }
                }
                Effect::RefreshGlobalUnread => self.refresh_unread(),
                Effect::RefreshHeader => self.refresh_header(),
                Effect::ScrollToBottom { .. } => {
                    self.geometry = self.geometry.scrolled_to_bottom();
                    self.emit(effect).await;
                }
                other => self.emit(other).await,
            }
        }
    }

    /// Hand an effect to the host. Gives up once the view is revoked, so
    /// a host that stopped draining cannot keep a closed view alive.
    async fn emit(&mut self, effect: Effect) {
        tokio::select! {
            sent = self.effects.send(effect) => {
                if sent.is_err() {
                    log::trace!("Effect receiver for {} dropped", self.key);
                }
            }
            _ = self.token.revoked() => {
                log::trace!("Effect for {} dropped, view closed", self.key);
            }
        }
    }

    fn attempt_mark_read(&mut self) {
        let Some(id) = self.tracker.in_flight() else {
            return;
        };
        let unread = self.unread_through(id);
        let sent = self.channel.send(&self.ctx.mark_read_command(id, &unread));
        match self.tracker.on_attempt(sent) {
            RetryStep::Done => self.retry_at = None,
            RetryStep::RetryAfter(delay) => self.retry_at = Some(Instant::now() + delay),
            RetryStep::Exhausted(id) => {
                self.retry_at = None;
                self.tracker.abandon();
                log::info!("mark_read {id} for {} falling back to HTTP", self.key);
                let api = self.api.clone();
                let key = self.key.clone();
                self.inflight.push(
                    async move {
                        let result = api.mark_read(&key, id, &unread).await;
                        Completion::MarkedRead { last_id: id, result }
                    }
                    .boxed(),
                );
            }
        }
    }

    /// Incoming ids a boundary at `id` covers that the server has not
    /// confirmed yet.
    fn unread_through(&self, id: MessageId) -> Vec<MessageId> {
        let acknowledged = self.tracker.boundary().last_acknowledged_id();
        self.reconciler.timeline().incoming_between(acknowledged, id)
    }

    fn refresh_unread(&mut self) {
        if self.channel.send(&OutboundCommand::GetUnread) {
            return;
        }
        if self.poller.is_active() {
            // The unread loop is polling already
            return;
        }
        let api = self.api.clone();
        self.inflight
            .push(async move { Completion::Unread(api.unread_total().await) }.boxed());
    }

    fn refresh_header(&mut self) {
        if self.header_pending {
            return;
        }
        self.header_pending = true;
        let api = self.api.clone();
        let key = self.key.clone();
        self.inflight
            .push(async move { Completion::Header(api.fetch_header(&key).await) }.boxed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unread_counter_increase_flag() {
        let counter = UnreadCounter::new();
        assert_eq!(counter.set(3), UnreadSnapshot { count: 3, increased: false });
        assert_eq!(counter.set(5), UnreadSnapshot { count: 5, increased: true });
        assert_eq!(counter.set(5), UnreadSnapshot { count: 5, increased: false });
        assert_eq!(counter.set(1), UnreadSnapshot { count: 1, increased: false });
        assert_eq!(counter.get().count, 1);
    }

    #[tokio::test]
    async fn test_unread_counter_watch() {
        let counter = UnreadCounter::new();
        let mut rx = counter.subscribe();
        counter.set(2);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().count, 2);
    }

    #[test]
    fn test_task_futures_are_send() {
        fn assert_send<F: std::future::Future + Send>(_: F) {}
        fn check<A: HttpApi>(
            driver: ThreadDriver<A>,
            global: UnreadLoop<A>,
            commands: mpsc::Receiver<ThreadCommand>,
        ) {
            assert_send(driver.run(commands));
            assert_send(global.run());
        }
        let _ = check::<ReqwestApi>;
    }

    #[tokio::test]
    async fn test_tick_without_ticker_never_fires() {
        let mut none: Option<Interval> = None;
        let fired = tokio::time::timeout(Duration::from_millis(20), tick(&mut none)).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_decision_drives_ticker() {
        let period = Duration::from_secs(2);
        let mut poller = FallbackPoller::new();
        let mut ticker = None;

        apply_decision(PolicyDecision::Start, period, &mut poller, &mut ticker);
        assert!(poller.is_active());

        // First tick is immediate, then one per period
        tick(&mut ticker).await;
        let before = Instant::now();
        tick(&mut ticker).await;
        assert!(Instant::now() - before >= period);

        apply_decision(PolicyDecision::Keep, period, &mut poller, &mut ticker);
        assert!(ticker.is_some());
        apply_decision(PolicyDecision::Stop, period, &mut poller, &mut ticker);
        assert!(ticker.is_none());
        assert!(!poller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_timer_fires_once() {
        let mut policy = FallbackPolicy::new(Duration::from_secs(3));
        assert_eq!(
            policy.on_state(ConnectionState::Connecting, Instant::now()),
            PolicyDecision::Keep
        );

        sleep_until_opt(policy.grace_deadline()).await;
        assert_eq!(policy.on_grace_elapsed(Instant::now()), PolicyDecision::Start);
        assert_eq!(policy.grace_deadline(), None);
        assert_eq!(policy.on_grace_elapsed(Instant::now()), PolicyDecision::Keep);
    }
}
