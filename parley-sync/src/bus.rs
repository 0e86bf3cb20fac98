//! Typed publish/subscribe bus shared by everything in a page session.
//!
//! Uses a tokio broadcast channel so one push connection can feed the
//! global unread counter and the open thread view at the same time.
//! Subscribers pick the event kinds they care about; dispatch happens on
//! the subscriber side, so publishing never blocks.
//!
//! A subscriber that falls behind by more than `capacity` events loses
//! the oldest ones. The subscription yields [`BusEvent::Lagged`] in their
//! place so the owner can resynchronize over HTTP; message ids make the
//! refetched events safe to apply next to the ones that did arrive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::channel::ConnectionState;
use crate::protocol::{EventKind, InboundEvent};

/// Everything that travels over the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A normalized server event (from push or poll)
    Inbound(InboundEvent),
    /// Push channel state transition
    Connection(ConnectionState),
    /// This subscriber missed `n` events. Produced by [`Subscription`],
    /// never published.
    Lagged(u64),
}

/// Which events a [`Subscription`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    /// `None` = every inbound kind
    kinds: Option<Vec<EventKind>>,
    connection: bool,
}

impl Filter {
    /// Every inbound event and every connection transition.
    pub fn all() -> Self {
        Self {
            kinds: None,
            connection: true,
        }
    }

    /// Only the listed inbound kinds.
    pub fn kinds(kinds: &[EventKind]) -> Self {
        Self {
            kinds: Some(kinds.to_vec()),
            connection: false,
        }
    }

    /// Only connection transitions.
    pub fn connection() -> Self {
        Self {
            kinds: Some(Vec::new()),
            connection: true,
        }
    }

    /// Also yield connection transitions.
    pub fn with_connection(mut self) -> Self {
        self.connection = true;
        self
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        match event {
            BusEvent::Connection(_) => self.connection,
            BusEvent::Lagged(_) => true,
            BusEvent::Inbound(inbound) => match &self.kinds {
                None => true,
                Some(kinds) => kinds.contains(&inbound.kind()),
            },
        }
    }
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    /// Events published while nobody was subscribed
    pub unobserved: u64,
    pub lagged: u64,
}

struct AtomicBusStats {
    published: AtomicU64,
    unobserved: AtomicU64,
    lagged: AtomicU64,
}

impl AtomicBusStats {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            unobserved: AtomicU64::new(0),
            lagged: AtomicU64::new(0),
        }
    }
}

/// Session-scoped event bus. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
    capacity: usize,
    stats: Arc<AtomicBusStats>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBusStats::new()),
        }
    }

    /// Publish to every subscriber. Returns how many receivers got it.
    pub fn publish(&self, event: BusEvent) -> usize {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                self.stats.unobserved.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn publish_inbound(&self, event: InboundEvent) -> usize {
        self.publish(BusEvent::Inbound(event))
    }

    pub fn subscribe(&self, filter: Filter) -> Subscription {
        Subscription {
            rx: self.sender.subscribe(),
            filter,
            stats: self.stats.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            unobserved: self.stats.unobserved.load(Ordering::Relaxed),
            lagged: self.stats.lagged.load(Ordering::Relaxed),
        }
    }
}

/// A filtered receiver.
pub struct Subscription {
    rx: broadcast::Receiver<BusEvent>,
    filter: Filter,
    stats: Arc<AtomicBusStats>,
}

impl Subscription {
    /// Wait for the next matching event. `None` once the bus is gone.
    ///
    /// After falling behind, yields [`BusEvent::Lagged`] once before the
    /// oldest event still buffered.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => return Some(self.lagged(n)),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => return Some(self.lagged(n)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn lagged(&self, n: u64) -> BusEvent {
        self.stats.lagged.fetch_add(n, Ordering::Relaxed);
        log::warn!("Bus subscriber lagged by {n} events");
        BusEvent::Lagged(n)
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageId;

    fn message(id: u64) -> InboundEvent {
        InboundEvent::MessageNew {
            chat_id: Some(1),
            other_username: None,
            message_id: Some(MessageId(id)),
            html: format!("<div>{id}</div>"),
            incoming: true,
            inbox_html: None,
            unread_total: None,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe(Filter::all());
        let mut b = bus.subscribe(Filter::all());

        assert_eq!(bus.publish_inbound(message(1)), 2);
        assert_eq!(a.recv().await, Some(BusEvent::Inbound(message(1))));
        assert_eq!(b.recv().await, Some(BusEvent::Inbound(message(1))));
    }

    #[tokio::test]
    async fn test_filter_by_kind() {
        let bus = EventBus::new(16);
        let mut unread = bus.subscribe(Filter::kinds(&[EventKind::UnreadTotal]));

        bus.publish_inbound(message(1));
        bus.publish(BusEvent::Connection(ConnectionState::Open));
        bus.publish_inbound(InboundEvent::UnreadTotal { count: 3, updated: None });

        assert_eq!(
            unread.recv().await,
            Some(BusEvent::Inbound(InboundEvent::UnreadTotal { count: 3, updated: None }))
        );
        assert!(unread.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_connection_filter() {
        let bus = EventBus::new(16);
        let mut conn = bus.subscribe(Filter::connection());

        bus.publish_inbound(message(1));
        bus.publish(BusEvent::Connection(ConnectionState::Closed));

        assert_eq!(conn.recv().await, Some(BusEvent::Connection(ConnectionState::Closed)));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish_inbound(message(1)), 0);

        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.unobserved, 1);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_told() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(Filter::kinds(&[EventKind::UnreadTotal]));

        for id in 1..=5 {
            bus.publish_inbound(message(id));
        }
        bus.publish_inbound(InboundEvent::UnreadTotal { count: 1, updated: None });

        // Reported even though the filter drops every message_new
        assert_eq!(sub.recv().await, Some(BusEvent::Lagged(4)));
        assert_eq!(
            sub.recv().await,
            Some(BusEvent::Inbound(InboundEvent::UnreadTotal { count: 1, updated: None }))
        );
        assert_eq!(bus.stats().lagged, 4);
    }

    #[test]
    fn test_try_recv_reports_lag() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(Filter::all());

        for id in 1..=5 {
            bus.publish_inbound(message(id));
        }

        assert_eq!(sub.try_recv(), Some(BusEvent::Lagged(3)));
        assert_eq!(sub.try_recv(), Some(BusEvent::Inbound(message(4))));
        assert_eq!(sub.try_recv(), Some(BusEvent::Inbound(message(5))));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_filter_matches() {
        let kinds = Filter::kinds(&[EventKind::MessageNew]).with_connection();
        assert!(kinds.matches(&BusEvent::Inbound(message(1))));
        assert!(kinds.matches(&BusEvent::Connection(ConnectionState::Open)));
        assert!(!kinds.matches(&BusEvent::Inbound(InboundEvent::Unknown)));
    }

    #[test]
    fn test_capacity_floor() {
        assert_eq!(EventBus::new(0).capacity(), 1);
    }
}
