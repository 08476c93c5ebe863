//! Session Module
//!
//! Tracks per-client MQTT session state: subscriptions, inflight QoS 1/2
//! message state, queued messages for offline clients, topic aliases and
//! the will message. Sessions outlive individual TCP connections so that
//! a client with `clean_start = false` can resume where it left off.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::codec::{CachedPublish, RawPublish};
use crate::protocol::{Properties, ProtocolVersion, Publish, QoS, SubscriptionOptions};


/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
}

/// QoS 2 handshake state for an outgoing inflight message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    WaitingPubRec,
    WaitingPubComp,
}

/// Outcome of queuing a message for an offline/backpressured session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueResult {
    /// Queued without evicting anything.
    Queued,
    /// Queued, but the oldest pending message was dropped to make room.
    DroppedOldest,
}

/// An unacknowledged outgoing QoS 1/2 message.
///
/// Three shapes share one map so the hot fan-out path (`Raw`/`Cached`) never
/// pays for a full `Publish` clone, while messages built the slow way (topic
/// alias rewrites, subscription identifiers, reloaded from persistence) still
/// have something concrete to retransmit.
#[derive(Debug, Clone)]
pub enum InflightMessage {
    /// Zero-copy: retransmitted by patching the original wire bytes.
    Raw {
        packet_id: u16,
        raw: Arc<RawPublish>,
        qos: QoS,
        retain: bool,
        qos2_state: Option<Qos2State>,
        sent_at: Instant,
        retry_count: u32,
    },
    /// Pre-serialized and shared across subscribers of the same publish.
    Cached {
        packet_id: u16,
        cached: Arc<CachedPublish>,
        qos: QoS,
        retain: bool,
        qos2_state: Option<Qos2State>,
        sent_at: Instant,
        retry_count: u32,
    },
    /// Fully materialized publish, re-encoded on every (re)send.
    Full {
        packet_id: u16,
        publish: Publish,
        qos2_state: Option<Qos2State>,
        sent_at: Instant,
        retry_count: u32,
    },
}

impl InflightMessage {
    pub fn packet_id(&self) -> u16 {
        match self {
            InflightMessage::Raw { packet_id, .. }
            | InflightMessage::Cached { packet_id, .. }
            | InflightMessage::Full { packet_id, .. } => *packet_id,
        }
    }

    pub fn qos(&self) -> QoS {
        match self {
            InflightMessage::Raw { qos, .. } | InflightMessage::Cached { qos, .. } => *qos,
            InflightMessage::Full { publish, .. } => publish.qos,
        }
    }

    pub fn sent_at(&self) -> Instant {
        match self {
            InflightMessage::Raw { sent_at, .. }
            | InflightMessage::Cached { sent_at, .. }
            | InflightMessage::Full { sent_at, .. } => *sent_at,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            InflightMessage::Raw { retry_count, .. }
            | InflightMessage::Cached { retry_count, .. }
            | InflightMessage::Full { retry_count, .. } => *retry_count,
        }
    }

    pub fn retry_count_mut(&mut self) -> &mut u32 {
        match self {
            InflightMessage::Raw { retry_count, .. }
            | InflightMessage::Cached { retry_count, .. }
            | InflightMessage::Full { retry_count, .. } => retry_count,
        }
    }

    pub fn qos2_state_mut(&mut self) -> &mut Option<Qos2State> {
        match self {
            InflightMessage::Raw { qos2_state, .. }
            | InflightMessage::Cached { qos2_state, .. }
            | InflightMessage::Full { qos2_state, .. } => qos2_state,
        }
    }

    /// Reset the retransmit clock, e.g. after a retry attempt.
    pub fn touch(&mut self) {
        let now = Instant::now();
        match self {
            InflightMessage::Raw { sent_at, .. }
            | InflightMessage::Cached { sent_at, .. }
            | InflightMessage::Full { sent_at, .. } => *sent_at = now,
        }
    }
}

/// Per-client limits applied when a session is created or resumed.
///
/// Pulled from the broker's `LimitsConfig` at CONNECT time so that config
/// reloads only affect newly (re)connecting clients, not ones already live.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_pending_messages: usize,
    pub max_inflight: u16,
    pub max_awaiting_rel: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_pending_messages: 1000,
            max_inflight: 32,
            max_awaiting_rel: 100,
        }
    }
}

/// A subscription recorded against a session (mirrors the entry held in the
/// broker-wide `SubscriptionStore`, kept here so session resumption and
/// persistence don't need to reach into the topic tree).
#[derive(Debug, Clone)]
pub struct SessionSubscription {
    pub filter: String,
    pub options: SubscriptionOptions,
    pub subscription_id: Option<u32>,
}

/// A message queued for a client that is currently offline.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub publish: Publish,
    pub queued_at: Instant,
}

/// The will message registered at CONNECT time, published on ungraceful
/// disconnect (or deferred by `will_delay_interval` for MQTT v5.0).
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: bytes::Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

/// Session state for a single client, keyed by client_id in `SessionStore`.
pub struct Session {
    pub client_id: Arc<str>,
    pub protocol_version: ProtocolVersion,
    pub state: SessionState,
    pub clean_start: bool,
    pub session_expiry_interval: u32,
    pub keep_alive: u16,
    pub last_activity: Instant,

    pub subscriptions: HashMap<String, SessionSubscription>,

    /// Outgoing QoS 1/2 messages awaiting PUBACK/PUBREC/PUBCOMP.
    pub inflight_outgoing: HashMap<u16, InflightMessage>,
    /// Incoming QoS 2 messages awaiting PUBREL, stored so the publish can be
    /// routed once the handshake completes.
    pub inflight_incoming: HashMap<u16, Publish>,

    next_packet_id: u16,

    pub pending_messages: VecDeque<Publish>,
    pub max_pending_messages: usize,
    pub max_inflight: u16,
    pub max_awaiting_rel: usize,

    pub receive_maximum: u16,
    pub send_quota: u16,
    pub max_packet_size: u32,

    pub client_topic_aliases: HashMap<u16, String>,
    pub server_topic_aliases: HashMap<String, u16>,
    next_server_alias: u16,
    pub topic_alias_maximum: u16,

    pub will: Option<WillMessage>,
    pub will_delay_interval: u32,

    pub disconnected_at: Option<Instant>,
}

impl Session {
    pub fn new(client_id: Arc<str>, protocol_version: ProtocolVersion, clean_start: bool) -> Self {
        Self::with_limits(client_id, protocol_version, clean_start, SessionLimits::default())
    }

    pub fn with_limits(
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
        clean_start: bool,
        limits: SessionLimits,
    ) -> Self {
        Self {
            client_id,
            protocol_version,
            state: SessionState::Connected,
            clean_start,
            session_expiry_interval: 0,
            keep_alive: 60,
            last_activity: Instant::now(),
            subscriptions: HashMap::new(),
            inflight_outgoing: HashMap::new(),
            inflight_incoming: HashMap::new(),
            next_packet_id: 1,
            pending_messages: VecDeque::new(),
            max_pending_messages: limits.max_pending_messages,
            max_inflight: limits.max_inflight,
            max_awaiting_rel: limits.max_awaiting_rel,
            receive_maximum: 65535,
            send_quota: 65535,
            max_packet_size: 268_435_455,
            client_topic_aliases: HashMap::new(),
            server_topic_aliases: HashMap::new(),
            next_server_alias: 1,
            topic_alias_maximum: 0,
            will: None,
            will_delay_interval: 0,
            disconnected_at: None,
        }
    }

    /// Reapply session limits, e.g. on resumption with a new CONNECT's config.
    pub fn apply_limits(&mut self, limits: SessionLimits) {
        self.max_pending_messages = limits.max_pending_messages;
        self.max_inflight = limits.max_inflight;
        self.max_awaiting_rel = limits.max_awaiting_rel;
    }

    /// Allocate the next outgoing packet identifier, skipping 0 and wrapping
    /// around the 16-bit space.
    pub fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = if self.next_packet_id == u16::MAX {
            1
        } else {
            self.next_packet_id + 1
        };
        id
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }
        if self.session_expiry_interval == 0 {
            return true;
        }
        if self.session_expiry_interval == 0xFFFFFFFF {
            return false;
        }
        match self.disconnected_at {
            Some(at) => at.elapsed() >= Duration::from_secs(self.session_expiry_interval as u64),
            None => false,
        }
    }

    /// Per MQTT-3.1.2-22: server treats keep alive as exceeded after 1.5x
    /// the negotiated interval with no activity.
    pub fn is_keep_alive_expired(&self) -> bool {
        if self.keep_alive == 0 {
            return false;
        }
        let timeout = Duration::from_millis(self.keep_alive as u64 * 1500);
        self.last_activity.elapsed() >= timeout
    }

    /// Queue a publish for later delivery. Drops the oldest entry once
    /// `max_pending_messages` is exceeded rather than rejecting the new one.
    pub fn queue_message(&mut self, publish: Publish) -> QueueResult {
        self.pending_messages.push_back(publish);
        if self.pending_messages.len() > self.max_pending_messages {
            self.pending_messages.pop_front();
            QueueResult::DroppedOldest
        } else {
            QueueResult::Queued
        }
    }

    pub fn drain_pending_messages(&mut self) -> Vec<Publish> {
        self.pending_messages.drain(..).collect()
    }

    pub fn add_subscription(&mut self, sub: SessionSubscription) {
        self.subscriptions.insert(sub.filter.clone(), sub);
    }

    pub fn remove_subscription(&mut self, filter: &str) -> Option<SessionSubscription> {
        self.subscriptions.remove(filter)
    }

    /// Resolve a client-assigned topic alias (v5.0) to a topic name.
    pub fn resolve_topic_alias(&self, alias: u16) -> Option<&String> {
        self.client_topic_aliases.get(&alias)
    }

    /// Register a client-assigned topic alias -> topic mapping.
    pub fn register_topic_alias(&mut self, alias: u16, topic: String) {
        self.client_topic_aliases.insert(alias, topic);
    }

    /// Get or assign a server-side alias for outgoing publishes, bounded by
    /// `topic_alias_maximum` advertised by the client.
    pub fn get_or_create_topic_alias(&mut self, topic: &str) -> Option<u16> {
        if self.topic_alias_maximum == 0 {
            return None;
        }
        if let Some(&alias) = self.server_topic_aliases.get(topic) {
            return Some(alias);
        }
        if self.next_server_alias > self.topic_alias_maximum {
            return None;
        }
        let alias = self.next_server_alias;
        self.next_server_alias += 1;
        self.server_topic_aliases.insert(topic.to_string(), alias);
        Some(alias)
    }

    pub fn decrement_send_quota(&mut self) -> bool {
        if self.send_quota == 0 {
            return false;
        }
        self.send_quota -= 1;
        true
    }

    pub fn increment_send_quota(&mut self) {
        if self.send_quota < self.receive_maximum {
            self.send_quota += 1;
        }
    }
}

/// Broker-wide registry of sessions, keyed by client_id.
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Get or create a session for `client_id`.
    ///
    /// Returns the session handle and whether a prior (non-clean) session
    /// was present. If `clean_start` is set, any existing session is
    /// discarded and a fresh one created in its place.
    pub fn get_or_create(
        &self,
        client_id: &Arc<str>,
        protocol_version: ProtocolVersion,
        clean_start: bool,
        limits: SessionLimits,
    ) -> (Arc<RwLock<Session>>, bool) {
        if clean_start {
            let session = Arc::new(RwLock::new(Session::with_limits(
                client_id.clone(),
                protocol_version,
                clean_start,
                limits,
            )));
            let existed = self.sessions.insert(client_id.clone(), session.clone()).is_some();
            return (session, existed);
        }

        if let Some(existing) = self.sessions.get(client_id) {
            {
                let mut s = existing.write();
                s.state = SessionState::Connected;
                s.protocol_version = protocol_version;
                s.apply_limits(limits);
                s.disconnected_at = None;
            }
            return (existing.clone(), true);
        }

        let session = Arc::new(RwLock::new(Session::with_limits(
            client_id.clone(),
            protocol_version,
            clean_start,
            limits,
        )));
        self.sessions.insert(client_id.clone(), session.clone());
        (session, false)
    }

    /// Insert a session restored from persistence.
    pub fn restore(&self, client_id: Arc<str>, session: Session) -> Arc<RwLock<Session>> {
        let handle = Arc::new(RwLock::new(session));
        self.sessions.insert(client_id, handle.clone());
        handle
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.remove(client_id).map(|(_, s)| s)
    }

    pub fn disconnect(&self, client_id: &str) {
        if let Some(session) = self.sessions.get(client_id) {
            let mut s = session.write();
            s.state = SessionState::Disconnected;
            s.disconnected_at = Some(Instant::now());
        }
    }

    /// Drop sessions whose expiry interval has elapsed.
    pub fn cleanup_expired(&self) {
        let expired: Vec<Arc<str>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().read().is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        for client_id in expired {
            self.sessions.remove(&client_id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
