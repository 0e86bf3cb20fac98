//! Delivery reconciler: merges push, poll and local sends into the timeline
//! and decides what the view should do about it.
//!
//! ```text
//!  InboundEvent ──► already stored? ──yes──► duplicate: read-state only
//!                        │ no
//!                        ▼
//!                  belongs to thread? ──no──► ignored (global counter's job)
//!                        │ yes
//!                        ▼
//!          was_at_bottom = geometry.is_at_bottom()   (measured pre-append)
//!                        │
//!                  TimelineStore::append
//!                        │
//!          ┌─────────────┴──────────────┐
//!    was_at_bottom                  scrolled away
//!    Render + ScrollToBottom        Render + unseen += 1 (incoming only)
//!    MarkRead (incoming)            state = Backgrounded
//! ```
//!
//! The reconciler never performs I/O. Every handler returns a list of
//! [`Effect`]s; the session executes the ones it owns (mark-read delivery,
//! header fetches, counter refresh) and forwards the rest to the host.

use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::http::{HttpError, OutgoingMessage, SendError, SentMessage};
use crate::protocol::{InboundEvent, MessageId};
use crate::thread::ThreadContext;
use crate::timeline::{Direction, MessageEntry, TimelineStore};

/// Lifecycle of a thread view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// Before the first render
    InitialLoad,
    /// Foreground and pinned to the bottom
    Live,
    /// Still live, but the user scrolled away; no auto-scroll
    Backgrounded,
}

/// Viewport measurements reported by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollGeometry {
    pub scroll_height: f64,
    pub scroll_top: f64,
    pub client_height: f64,
}

impl ScrollGeometry {
    pub fn new(scroll_height: f64, scroll_top: f64, client_height: f64) -> Self {
        Self {
            scroll_height,
            scroll_top,
            client_height,
        }
    }

    pub fn distance_from_bottom(&self) -> f64 {
        self.scroll_height - (self.scroll_top + self.client_height)
    }

    pub fn is_at_bottom(&self, threshold: f64) -> bool {
        self.distance_from_bottom() <= threshold
    }

    /// The same viewport after the host scrolled it all the way down.
    pub fn scrolled_to_bottom(self) -> Self {
        Self {
            scroll_top: (self.scroll_height - self.client_height).max(0.0),
            ..self
        }
    }
}

/// Instructions produced by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Append a rendered message to the view
    Render {
        id: MessageId,
        content: String,
        direction: Direction,
    },
    ScrollToBottom { smooth: bool },
    /// New value of the "new messages" badge
    UnseenChanged(u32),
    /// Mark everything up to the id read (session-owned)
    MarkRead(MessageId),
    /// Ask for a fresh global unread count (session-owned)
    RefreshGlobalUnread,
    /// Reload the thread header (session-owned)
    RefreshHeader,
    /// Fresh header fragment
    HeaderUpdated(String),
    SetTitle(String),
    /// Outgoing messages now read by the other side
    ReceiptsRead(Vec<MessageId>),
    /// The send succeeded; the draft can go
    ClearComposer,
    /// The send failed; the draft is kept
    SendFailed { retryable: bool, reason: String },
    /// Leave the thread (access lost)
    Navigate(String),
}

/// Liveness flag shared by everything scoped to one thread view.
#[derive(Debug, Clone)]
pub struct ViewToken {
    live: Arc<watch::Sender<bool>>,
}

impl ViewToken {
    pub fn new() -> Self {
        let (live, _) = watch::channel(true);
        Self { live: Arc::new(live) }
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    pub fn revoke(&self) {
        self.live.send_replace(false);
    }

    /// Resolves once the view is torn down.
    pub async fn revoked(&self) {
        let mut rx = self.live.subscribe();
        let _ = rx.wait_for(|live| !*live).await;
    }
}

impl Default for ViewToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Composition state. The draft survives every failure.
#[derive(Debug, Default)]
pub struct Composer {
    draft: Option<OutgoingMessage>,
    in_flight: Option<Uuid>,
}

impl Composer {
    pub fn draft(&self) -> Option<&OutgoingMessage> {
        self.draft.as_ref()
    }

    pub fn is_sending(&self) -> bool {
        self.in_flight.is_some()
    }

    fn clear(&mut self) {
        self.draft = None;
        self.in_flight = None;
    }
}

/// Per-thread reconciliation state machine.
pub struct DeliveryReconciler {
    ctx: ThreadContext,
    timeline: TimelineStore,
    state: ViewState,
    unseen: u32,
    threshold: f64,
    max_attachments: usize,
    inbox_url: String,
    /// Chat id learned from a send response or a peer-matched event
    learned_chat_id: Option<u64>,
    composer: Composer,
    token: ViewToken,
}

impl DeliveryReconciler {
    pub fn new(
        ctx: ThreadContext,
        threshold: f64,
        max_attachments: usize,
        inbox_url: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            timeline: TimelineStore::new(),
            state: ViewState::InitialLoad,
            unseen: 0,
            threshold,
            max_attachments,
            inbox_url: inbox_url.into(),
            learned_chat_id: None,
            composer: Composer::default(),
            token: ViewToken::new(),
        }
    }

    pub fn context(&self) -> &ThreadContext {
        &self.ctx
    }

    pub fn timeline(&self) -> &TimelineStore {
        &self.timeline
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn unseen(&self) -> u32 {
        self.unseen
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn token(&self) -> ViewToken {
        self.token.clone()
    }

    pub fn is_live(&self) -> bool {
        self.token.is_live()
    }

    /// Highest known id, including the one rendered with the page.
    pub fn last_id(&self) -> Option<MessageId> {
        self.timeline.last_id().max(self.ctx.initial_last_id())
    }

    /// Load server-rendered history without render effects.
    pub fn seed(&mut self, entries: impl IntoIterator<Item = MessageEntry>) -> usize {
        if !self.is_live() {
            return 0;
        }
        self.timeline.seed(entries)
    }

    /// First render: pin to the bottom and mark the page's last id read.
    pub fn open(&mut self) -> Vec<Effect> {
        if !self.is_live() || self.state != ViewState::InitialLoad {
            return Vec::new();
        }
        self.state = ViewState::Live;
        let mut effects = vec![Effect::ScrollToBottom { smooth: false }];
        if let Some(id) = self.last_id() {
            effects.push(Effect::MarkRead(id));
        }
        effects
    }

    /// Apply one event from push or poll.
    pub fn handle_inbound(
        &mut self,
        event: InboundEvent,
        geometry: &ScrollGeometry,
    ) -> Vec<Effect> {
        if !self.is_live() {
            return Vec::new();
        }
        match event {
            InboundEvent::MessageNew {
                chat_id,
                other_username,
                message_id,
                html,
                incoming,
                unread_total,
                ..
            } => {
                let Some(id) = message_id else {
                    log::debug!("message_new without id dropped");
                    return Vec::new();
                };
                let refresh = unread_total.is_none();

                if self.timeline.has(id) {
                    return self.duplicate(id, incoming, geometry, refresh);
                }
                if !self.ctx.matches(chat_id, other_username.as_deref()) {
                    return if refresh { vec![Effect::RefreshGlobalUnread] } else { Vec::new() };
                }
                if self.ctx.thread_id().is_none() && self.learned_chat_id.is_none() {
                    self.learned_chat_id = chat_id;
                }

                let mut effects =
                    self.ingest(id, html, Direction::from_incoming(incoming), geometry, false);
                if refresh {
                    effects.push(Effect::RefreshGlobalUnread);
                }
                effects
            }
            InboundEvent::ChatRead {
                chat_id,
                reader_id,
                last_read_id,
            } => {
                if !self.owns_chat(chat_id) || reader_id == self.ctx.local_user_id() {
                    return Vec::new();
                }
                let ids = self.timeline.apply_read_boundary(last_read_id);
                if ids.is_empty() {
                    Vec::new()
                } else {
                    vec![Effect::ReceiptsRead(ids)]
                }
            }
            InboundEvent::ChatAccessRevoked {
                chat_id,
                redirect_url,
            } if self.owns_chat(chat_id) => {
                log::info!("Access to {} revoked", self.ctx.key());
                self.terminate(redirect_url)
            }
            InboundEvent::ChatRenamed { chat_id, title } if self.owns_chat(chat_id) => {
                let mut effects = Vec::with_capacity(2);
                if let Some(title) = title {
                    effects.push(Effect::SetTitle(title));
                }
                effects.push(Effect::RefreshHeader);
                effects
            }
            InboundEvent::ChatMemberAdded { chat_id, .. }
            | InboundEvent::ChatMemberRemoved { chat_id, .. }
                if self.owns_chat(chat_id) =>
            {
                vec![Effect::RefreshHeader]
            }
            InboundEvent::ChatUpdated {
                chat_id,
                refresh_header: true,
            } if self.owns_chat(chat_id) => vec![Effect::RefreshHeader],
            _ => Vec::new(),
        }
    }

    /// The host reported a scroll.
    pub fn on_scroll(&mut self, geometry: &ScrollGeometry) -> Vec<Effect> {
        if !self.is_live() {
            return Vec::new();
        }
        if geometry.is_at_bottom(self.threshold) {
            self.reach_bottom()
        } else {
            if self.state == ViewState::Live {
                self.state = ViewState::Backgrounded;
            }
            Vec::new()
        }
    }

    /// The user pressed "jump to latest".
    pub fn jump_to_bottom(&mut self) -> Vec<Effect> {
        if !self.is_live() {
            return Vec::new();
        }
        let mut effects = vec![Effect::ScrollToBottom { smooth: true }];
        effects.extend(self.reach_bottom());
        effects
    }

    /// Take a draft for sending. The draft is kept until the send succeeds.
    pub fn begin_send(&mut self, draft: OutgoingMessage) -> Result<OutgoingMessage, SendError> {
        if !self.is_live() {
            return Err(SendError::Malformed("thread view closed".into()));
        }
        if self.composer.is_sending() {
            log::debug!("Submit ignored, send {:?} still in flight", self.composer.in_flight);
            return Err(SendError::Rejected {
                status: 0,
                detail: "a send is already in progress".into(),
            });
        }
        draft.validate(self.max_attachments)?;
        self.composer.in_flight = Some(draft.client_id);
        self.composer.draft = Some(draft.clone());
        Ok(draft)
    }

    /// Outcome of the request started by [`DeliveryReconciler::begin_send`].
    pub fn complete_send(
        &mut self,
        client_id: Uuid,
        result: Result<SentMessage, SendError>,
        geometry: &ScrollGeometry,
    ) -> Vec<Effect> {
        if !self.is_live() || self.composer.in_flight != Some(client_id) {
            return Vec::new();
        }
        self.composer.in_flight = None;

        match result {
            Ok(sent) => {
                self.composer.clear();
                if self.ctx.thread_id().is_none() && self.learned_chat_id.is_none() {
                    self.learned_chat_id = sent.chat_id;
                }
                let mut effects = vec![Effect::ClearComposer];
                let own = self.ingest(sent.id, sent.html, Direction::Outgoing, geometry, true);
                effects.extend(own);
                effects.push(Effect::RefreshGlobalUnread);
                effects
            }
            Err(SendError::Forbidden { redirect }) => {
                log::warn!("Send to {} forbidden", self.ctx.key());
                self.terminate(Some(redirect))
            }
            Err(e) => {
                log::warn!("Send {client_id} failed: {e}");
                vec![Effect::SendFailed {
                    retryable: e.is_retryable(),
                    reason: e.to_string(),
                }]
            }
        }
    }

    /// Outcome of a header refresh.
    pub fn complete_header(&mut self, result: Result<String, HttpError>) -> Vec<Effect> {
        if !self.is_live() {
            return Vec::new();
        }
        match result {
            Ok(html) => vec![Effect::HeaderUpdated(html)],
            Err(HttpError::Forbidden { redirect }) => self.access_lost(Some(redirect)),
            Err(e) => {
                log::warn!("Header refresh for {} failed: {e}", self.ctx.key());
                Vec::new()
            }
        }
    }

    /// A request came back 403: leave the thread.
    pub fn access_lost(&mut self, redirect: Option<String>) -> Vec<Effect> {
        if !self.is_live() {
            return Vec::new();
        }
        log::warn!("Access to {} lost", self.ctx.key());
        self.terminate(redirect)
    }

    /// Stop reacting to anything; later calls return no effects.
    pub fn teardown(&mut self) {
        if self.is_live() {
            log::debug!("Tearing down view {}", self.ctx.key());
        }
        self.token.revoke();
    }

    fn owns_chat(&self, chat_id: u64) -> bool {
        self.ctx.matches_chat(chat_id) || self.learned_chat_id == Some(chat_id)
    }

    /// A known id arrived again: no render, but read state may still move.
    fn duplicate(
        &self,
        id: MessageId,
        incoming: bool,
        geometry: &ScrollGeometry,
        refresh: bool,
    ) -> Vec<Effect> {
        log::trace!("Duplicate message {id}");
        let mut effects = Vec::new();
        let at_bottom = geometry.is_at_bottom(self.threshold);
        if incoming && self.state != ViewState::Backgrounded && at_bottom {
            effects.push(Effect::MarkRead(id));
        }
        if refresh {
            effects.push(Effect::RefreshGlobalUnread);
        }
        effects
    }

    fn ingest(
        &mut self,
        id: MessageId,
        html: String,
        direction: Direction,
        geometry: &ScrollGeometry,
        own_send: bool,
    ) -> Vec<Effect> {
        let was_at_bottom =
            self.state == ViewState::InitialLoad || geometry.is_at_bottom(self.threshold);

        let entry = MessageEntry::new(id, self.ctx.key(), direction, html.clone());
        if !self.timeline.append(entry).is_appended() {
            return Vec::new();
        }

        let mut effects = vec![Effect::Render {
            id,
            content: html,
            direction,
        }];
        if self.timeline.get(id).is_some_and(|e| e.read) {
            effects.push(Effect::ReceiptsRead(vec![id]));
        }

        if was_at_bottom || own_send {
            effects.push(Effect::ScrollToBottom { smooth: true });
            self.state = ViewState::Live;
            if self.unseen != 0 {
                self.unseen = 0;
                effects.push(Effect::UnseenChanged(0));
            }
            if direction == Direction::Incoming {
                effects.push(Effect::MarkRead(id));
            }
        } else {
            self.state = ViewState::Backgrounded;
            if direction == Direction::Incoming {
                self.unseen += 1;
                effects.push(Effect::UnseenChanged(self.unseen));
            }
        }
        effects
    }

    fn reach_bottom(&mut self) -> Vec<Effect> {
        let was_behind = self.state != ViewState::Live || self.unseen != 0;
        self.state = ViewState::Live;
        if !was_behind {
            return Vec::new();
        }

        let mut effects = Vec::new();
        if self.unseen != 0 {
            self.unseen = 0;
            effects.push(Effect::UnseenChanged(0));
        }
        if let Some(id) = self.timeline.last_incoming_id() {
            effects.push(Effect::MarkRead(id));
        }
        effects
    }

    fn terminate(&mut self, redirect: Option<String>) -> Vec<Effect> {
        let target = redirect
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.inbox_url.clone());
        self.token.revoke();
        vec![Effect::Navigate(target)]
    }
}
