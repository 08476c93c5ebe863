//! MQTT Broker Core
//!
//! The main broker implementation that handles client connections,
//! message routing, and coordinates all components (persistence, bridges,
//! clustering, metrics, flapping protection).

mod connection;
mod sys_topics;
mod tls;
mod writer;

pub use connection::Connection;
pub use tls::{load_tls_config, TlsError};
pub use writer::{SendError, SharedWriter};

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeConfig, BridgeManager, InboundCallback};
use crate::cluster::{ClusterConfig, ClusterInboundCallback, ClusterManager};
use crate::config::ProxyProtocolConfig;
use crate::flapping::FlappingDetector;
use crate::hooks::{DefaultHooks, Hooks};
use crate::metrics::Metrics;
use crate::persistence::{PersistenceManager, PersistenceOp, StoredProperties, StoredRetainedMessage};
use crate::protocol::{Properties, ProtocolVersion, Publish, QoS};
use crate::proxy::{self, ProxyInfo};
use crate::session::SessionStore;
use crate::topic::SubscriptionStore;
use crate::transport::WsStream;

/// TLS certificate/key configuration for the broker's TLS listener.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    pub ca_cert_path: Option<String>,
    pub require_client_cert: bool,
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// TLS bind address (optional)
    pub tls_bind_addr: Option<SocketAddr>,
    /// TLS certificate/key configuration (required if `tls_bind_addr` is set)
    pub tls_config: Option<TlsConfig>,
    /// WebSocket bind address (optional)
    pub ws_bind_addr: Option<SocketAddr>,
    /// WebSocket path (default: "/mqtt")
    pub ws_path: String,
    /// Maximum connections
    pub max_connections: usize,
    /// Maximum packet size
    pub max_packet_size: usize,
    /// Default keep alive (if client specifies 0)
    pub default_keep_alive: u16,
    /// Maximum keep alive
    pub max_keep_alive: u16,
    /// Session expiry check interval
    pub session_expiry_check_interval: Duration,
    /// Receive maximum (flow control)
    pub receive_maximum: u16,
    /// Maximum QoS
    pub max_qos: QoS,
    /// Retain available
    pub retain_available: bool,
    /// Wildcard subscription available
    pub wildcard_subscription_available: bool,
    /// Subscription identifiers available
    pub subscription_identifiers_available: bool,
    /// Shared subscriptions available
    pub shared_subscriptions_available: bool,
    /// Whether a bare `#` subscription is accepted
    pub allow_root_wildcard_subscription: bool,
    /// Maximum topic alias
    pub max_topic_alias: u16,
    /// Number of worker tasks
    pub num_workers: usize,
    /// Whether $SYS topics are published
    pub sys_topics_enabled: bool,
    /// $SYS topics publish interval, in seconds
    pub sys_topics_interval: u64,
    /// Maximum inflight QoS 1/2 messages per client
    pub max_inflight: u16,
    /// Maximum queued messages per offline session
    pub max_queued_messages: usize,
    /// Maximum awaiting PUBREL (QoS 2) per client
    pub max_awaiting_rel: usize,
    /// Interval between retries of unacked QoS 1/2 messages
    pub retry_interval: Duration,
    /// Per-connection outbound channel capacity
    pub outbound_channel_capacity: usize,
    /// Maximum topic levels in a topic name/filter
    pub max_topic_levels: usize,
    /// PROXY protocol handling for the plain TCP listener
    pub proxy_protocol: ProxyProtocolConfig,
    /// PROXY protocol handling for the TLS listener
    pub tls_proxy_protocol: ProxyProtocolConfig,
    /// PROXY protocol handling for the WebSocket listener
    pub ws_proxy_protocol: ProxyProtocolConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().unwrap(),
            tls_bind_addr: None,
            tls_config: None,
            ws_bind_addr: None,
            ws_path: "/mqtt".to_string(),
            max_connections: 100_000,
            max_packet_size: 1024 * 1024, // 1 MB
            default_keep_alive: 60,
            max_keep_alive: 65535,
            session_expiry_check_interval: Duration::from_secs(60),
            receive_maximum: 65535,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscriptions_available: true,
            allow_root_wildcard_subscription: true,
            max_topic_alias: 65535,
            num_workers: available_parallelism(),
            sys_topics_enabled: true,
            sys_topics_interval: 10,
            max_inflight: 65535,
            max_queued_messages: usize::MAX,
            max_awaiting_rel: usize::MAX,
            retry_interval: Duration::from_secs(30),
            outbound_channel_capacity: 1_000_000,
            max_topic_levels: 128,
            proxy_protocol: ProxyProtocolConfig::default(),
            tls_proxy_protocol: ProxyProtocolConfig::default(),
            ws_proxy_protocol: ProxyProtocolConfig::default(),
        }
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Retained message
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub properties: Properties,
    pub timestamp: Instant,
}

/// Broker events
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Client connected
    ClientConnected {
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
    },
    /// Client disconnected
    ClientDisconnected { client_id: Arc<str> },
    /// Message published (locally originated or routed)
    MessagePublished {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    /// A message was dropped (e.g. offline session queue full)
    MessageDropped,
}

/// Shared handle to the pieces of broker state needed to route a server- or
/// peer-originated publish to local subscribers. Kept separate from `Broker`
/// itself so bridge and cluster inbound callbacks can own a cheap `Clone` of
/// it without requiring `Arc<Broker>`.
#[derive(Clone)]
struct PublishHandle {
    sessions: Arc<SessionStore>,
    subscriptions: Arc<SubscriptionStore>,
    retained: Arc<DashMap<String, RetainedMessage>>,
    connections: Arc<DashMap<Arc<str>, Arc<SharedWriter>>>,
    events: broadcast::Sender<BrokerEvent>,
    metrics: Option<Arc<Metrics>>,
    persistence: Option<Arc<PersistenceManager>>,
}

impl PublishHandle {
    fn publish(&self, topic: String, payload: Bytes, qos: QoS, retain: bool) {
        do_publish(self, topic, payload, qos, retain, None);
    }
}

/// Core publish-and-fan-out routing, shared by `Broker::publish`, bridge
/// inbound delivery, and cluster inbound delivery. `origin_client_id`, when
/// set, identifies the locally-connected client the message originated from
/// so `no_local` subscriptions can exclude it; inbound bridge/cluster/server
/// publishes have no local origin and pass `None`.
fn do_publish(
    handle: &PublishHandle,
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
    origin_client_id: Option<&Arc<str>>,
) {
    let topic_arc: Arc<str> = Arc::from(topic.as_str());

    if retain {
        if payload.is_empty() {
            if handle.retained.remove(&topic).is_some() {
                if let Some(metrics) = &handle.metrics {
                    metrics.retained_message_removed(0);
                }
                if let Some(persistence) = &handle.persistence {
                    persistence.write(PersistenceOp::DeleteRetained {
                        topic: topic.clone(),
                    });
                }
            }
        } else {
            let properties = Properties::default();
            let message = RetainedMessage {
                topic: topic_arc.clone(),
                payload: payload.clone(),
                qos,
                properties: properties.clone(),
                timestamp: Instant::now(),
            };
            let bytes_len = message.payload.len();
            handle.retained.insert(topic.clone(), message);
            if let Some(metrics) = &handle.metrics {
                metrics.retained_message_stored(bytes_len);
            }
            if let Some(persistence) = &handle.persistence {
                persistence.write(PersistenceOp::SetRetained {
                    topic: topic.clone(),
                    message: StoredRetainedMessage {
                        topic: topic.clone(),
                        payload: payload.to_vec(),
                        qos: qos as u8,
                        properties: StoredProperties::from(&properties),
                        timestamp_secs: 0,
                    },
                });
            }
        }
    }

    let _ = handle.events.send(BrokerEvent::MessagePublished {
        topic: topic.clone(),
        payload: payload.clone(),
        qos,
        retain,
    });

    let matches = handle.subscriptions.matches(&topic);

    // Deduplicate by client_id, keeping the highest subscribed QoS and OR-ing
    // retain_as_published (mirrors route_message's per-subscriber gating).
    struct ClientSub {
        qos: QoS,
        retain_as_published: bool,
    }
    let mut client_subs: HashMap<Arc<str>, ClientSub> = HashMap::new();
    for sub in matches {
        if sub.no_local && origin_client_id == Some(&sub.client_id) {
            continue;
        }
        let entry = client_subs.entry(sub.client_id.clone()).or_insert(ClientSub {
            qos: QoS::AtMostOnce,
            retain_as_published: false,
        });
        if sub.qos > entry.qos {
            entry.qos = sub.qos;
        }
        if sub.retain_as_published {
            entry.retain_as_published = true;
        }
    }

    for (client_id, sub_info) in client_subs {
        let effective_qos = qos.min(sub_info.qos);
        let effective_retain = if sub_info.retain_as_published {
            retain
        } else {
            false
        };

        if let Some(writer) = handle.connections.get(&client_id) {
            let mut publish = Publish {
                dup: false,
                qos: effective_qos,
                retain: effective_retain,
                topic: topic_arc.clone(),
                packet_id: None,
                payload: payload.clone(),
                properties: Properties::default(),
            };
            let _ = writer.send_publish(&mut publish, effective_qos, effective_retain);
        } else if let Some(session) = handle.sessions.get(client_id.as_ref()) {
            let mut s = session.write();
            if !s.clean_start {
                let publish = Publish {
                    dup: false,
                    qos: effective_qos,
                    retain: effective_retain,
                    topic: topic_arc.clone(),
                    packet_id: None,
                    payload: payload.clone(),
                    properties: Properties::default(),
                };
                if s.queue_message(publish) == crate::session::QueueResult::DroppedOldest {
                    let _ = handle.events.send(BrokerEvent::MessageDropped);
                }
            }
        }
    }
}

/// The MQTT Broker
pub struct Broker {
    /// Configuration
    config: BrokerConfig,
    /// Session store
    sessions: Arc<SessionStore>,
    /// Subscription store
    subscriptions: Arc<SubscriptionStore>,
    /// Retained messages
    retained: Arc<DashMap<String, RetainedMessage>>,
    /// Active connections (client_id -> direct write buffer)
    connections: Arc<DashMap<Arc<str>, Arc<SharedWriter>>>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
    /// Event channel
    events: broadcast::Sender<BrokerEvent>,
    /// Hooks for auth/ACL and events
    hooks: Arc<dyn Hooks>,
    /// Prometheus metrics
    metrics: Option<Arc<Metrics>>,
    /// Durable storage
    persistence: Option<Arc<PersistenceManager>>,
    /// Connection flood/flapping protection
    flapping: Option<Arc<FlappingDetector>>,
    /// Bridge connections to external brokers
    bridge_manager: Option<Arc<BridgeManager>>,
    /// Cluster gossip/forwarding
    cluster_manager: Option<Arc<ClusterManager>>,
    /// Process start time, for $SYS/broker/uptime
    start_time: Instant,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);

        Self {
            config,
            sessions: Arc::new(SessionStore::new()),
            subscriptions: Arc::new(SubscriptionStore::new()),
            retained: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            shutdown,
            events,
            hooks,
            metrics: None,
            persistence: None,
            flapping: None,
            bridge_manager: None,
            cluster_manager: None,
            start_time: Instant::now(),
        }
    }

    fn publish_handle(&self) -> PublishHandle {
        PublishHandle {
            sessions: self.sessions.clone(),
            subscriptions: self.subscriptions.clone(),
            retained: self.retained.clone(),
            connections: self.connections.clone(),
            events: self.events.clone(),
            metrics: self.metrics.clone(),
            persistence: self.persistence.clone(),
        }
    }

    /// Access the retained-message store directly (used to restore
    /// persisted retained messages on startup).
    pub fn retained(&self) -> &Arc<DashMap<String, RetainedMessage>> {
        &self.retained
    }

    /// Wire up a persistence manager. Must be called before `run()`.
    pub fn set_persistence(&mut self, persistence: Arc<PersistenceManager>) {
        self.persistence = Some(persistence);
    }

    /// Wire up flapping/connection-flood protection. Must be called before `run()`.
    pub fn set_flapping_detector(&mut self, detector: FlappingDetector) {
        self.flapping = Some(Arc::new(detector));
    }

    /// Wire up Prometheus metrics. Must be called before `run()`.
    pub fn set_metrics(&mut self, metrics: Arc<Metrics>) {
        self.metrics = Some(metrics);
    }

    /// Build a bridge manager from configuration, wired to publish inbound
    /// messages from remote brokers into this broker's local routing.
    pub fn create_bridge_manager(&mut self, configs: Vec<BridgeConfig>) -> Arc<BridgeManager> {
        let handle = self.publish_handle();
        let callback: InboundCallback = Arc::new(move |topic, payload, qos, retain| {
            handle.publish(topic, payload, qos, retain);
        });
        Arc::new(BridgeManager::from_configs(configs, callback))
    }

    /// Install a bridge manager created by `create_bridge_manager`.
    pub fn set_bridge_manager(&mut self, manager: Arc<BridgeManager>) {
        self.bridge_manager = Some(manager);
    }

    /// Build a cluster manager from configuration, wired to publish messages
    /// forwarded from peer nodes into this broker's local routing.
    pub async fn create_cluster_manager(
        &mut self,
        config: ClusterConfig,
    ) -> Result<ClusterManager, Box<dyn std::error::Error + Send + Sync>> {
        let handle = self.publish_handle();
        let callback: ClusterInboundCallback =
            Arc::new(move |topic, payload, qos, retain, _origin_node| {
                handle.publish(topic, payload, qos, retain);
            });
        ClusterManager::new(config, callback).await
    }

    /// Install a cluster manager created by `create_cluster_manager`.
    pub fn set_cluster_manager(&mut self, manager: ClusterManager) {
        self.cluster_manager = Some(Arc::new(manager));
    }

    /// Run the broker
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", self.config.bind_addr);

        if let (Some(tls_addr), Some(tls_cfg)) =
            (self.config.tls_bind_addr, self.config.tls_config.as_ref())
        {
            match load_tls_config(tls_cfg) {
                Ok(acceptor) => {
                    let tls_listener = TcpListener::bind(tls_addr).await?;
                    info!("MQTT/TLS listening on {}", tls_addr);
                    self.spawn_tls_accept_loop(tls_listener, acceptor);
                }
                Err(e) => {
                    error!("Failed to load TLS configuration: {}", e);
                }
            }
        }

        if let Some(ws_addr) = self.config.ws_bind_addr {
            let ws_listener = TcpListener::bind(ws_addr).await?;
            info!(
                "MQTT/WebSocket listening on {} (path: {})",
                ws_addr, self.config.ws_path
            );
            self.spawn_ws_accept_loop(ws_listener);
        }

        self.spawn_expiry_task();

        if self.config.sys_topics_enabled {
            sys_topics::spawn_sys_topics_task(
                self.publish_handle(),
                self.metrics.clone(),
                self.config.sys_topics_interval,
                self.start_time,
                self.shutdown.subscribe(),
            );
        }

        if let Some(bridge_manager) = &self.bridge_manager {
            bridge_manager.start_all().await;
        }
        if let Some(cluster_manager) = &self.cluster_manager {
            if let Err(e) = cluster_manager.start().await {
                error!("Failed to start cluster manager: {}", e);
            }
        }
        self.spawn_forwarding_task();

        debug!("Starting TCP accept loop");
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if !self.check_flapping(addr.ip()) {
                        continue;
                    }
                    debug!("New TCP connection from {}", addr);
                    self.handle_connection(stream, addr, self.config.proxy_protocol.clone());
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            }
        }
    }

    fn check_flapping(&self, ip: IpAddr) -> bool {
        if let Some(detector) = &self.flapping {
            match detector.check_connection(ip) {
                Ok(()) => {
                    detector.record_connection(ip);
                    true
                }
                Err(reason) => {
                    debug!("Rejecting connection from {}: {:?}", ip, reason);
                    false
                }
            }
        } else {
            true
        }
    }

    fn spawn_expiry_task(&self) {
        let sessions = self.sessions.clone();
        let interval = self.config.session_expiry_check_interval;
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;

                    _ = ticker.tick() => {
                        sessions.cleanup_expired();
                    }
                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }

    fn spawn_tls_accept_loop(&self, listener: TcpListener, acceptor: tokio_rustls::TlsAcceptor) {
        let sessions = self.sessions.clone();
        let subscriptions = self.subscriptions.clone();
        let retained = self.retained.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let hooks = self.hooks.clone();
        let metrics = self.metrics.clone();
        let persistence = self.persistence.clone();
        let shutdown = self.shutdown.clone();
        let flapping = self.flapping.clone();
        let proxy_cfg = self.config.tls_proxy_protocol.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if let Some(detector) = &flapping {
                            match detector.check_connection(addr.ip()) {
                                Ok(()) => detector.record_connection(addr.ip()),
                                Err(reason) => {
                                    debug!("Rejecting TLS connection from {}: {:?}", addr, reason);
                                    continue;
                                }
                            }
                        }

                        let acceptor = acceptor.clone();
                        let sessions = sessions.clone();
                        let subscriptions = subscriptions.clone();
                        let retained = retained.clone();
                        let connections = connections.clone();
                        let config = config.clone();
                        let events = events.clone();
                        let hooks = hooks.clone();
                        let metrics = metrics.clone();
                        let persistence = persistence.clone();
                        let proxy_cfg = proxy_cfg.clone();
                        let mut shutdown_rx = shutdown.subscribe();

                        tokio::spawn(async move {
                            let stream = match maybe_read_proxy_header(stream, &proxy_cfg).await {
                                Some((stream, _proxy_info)) => stream,
                                None => return,
                            };

                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(s) => s,
                                Err(e) => {
                                    debug!("TLS handshake failed for {}: {}", addr, e);
                                    return;
                                }
                            };

                            let mut conn = Connection::new(
                                tls_stream,
                                addr,
                                None,
                                sessions,
                                subscriptions,
                                retained,
                                connections,
                                config,
                                events,
                                hooks,
                                metrics,
                                persistence,
                            );

                            run_connection_until_shutdown(&mut conn, addr, &mut shutdown_rx).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept TLS connection: {}", e);
                    }
                }
            }
        });
    }

    fn spawn_ws_accept_loop(&self, listener: TcpListener) {
        let sessions = self.sessions.clone();
        let subscriptions = self.subscriptions.clone();
        let retained = self.retained.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        let hooks = self.hooks.clone();
        let metrics = self.metrics.clone();
        let persistence = self.persistence.clone();
        let flapping = self.flapping.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if let Some(detector) = &flapping {
                            match detector.check_connection(addr.ip()) {
                                Ok(()) => detector.record_connection(addr.ip()),
                                Err(reason) => {
                                    debug!("Rejecting WS connection from {}: {:?}", addr, reason);
                                    continue;
                                }
                            }
                        }

                        debug!("New WebSocket connection from {}", addr);
                        let sessions = sessions.clone();
                        let subscriptions = subscriptions.clone();
                        let retained = retained.clone();
                        let connections = connections.clone();
                        let config = config.clone();
                        let events = events.clone();
                        let hooks = hooks.clone();
                        let metrics = metrics.clone();
                        let persistence = persistence.clone();
                        let mut shutdown_rx = shutdown.subscribe();

                        tokio::spawn(async move {
                            match WsStream::accept_with_path(stream, &config.ws_path).await {
                                Ok(ws_stream) => {
                                    debug!("WebSocket handshake complete for {}", addr);
                                    let mut conn = Connection::new(
                                        ws_stream,
                                        addr,
                                        None,
                                        sessions,
                                        subscriptions,
                                        retained,
                                        connections,
                                        config,
                                        events,
                                        hooks,
                                        metrics,
                                        persistence,
                                    );

                                    run_connection_until_shutdown(&mut conn, addr, &mut shutdown_rx)
                                        .await;
                                }
                                Err(e) => {
                                    debug!("WebSocket handshake failed for {}: {}", addr, e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept WebSocket connection: {}", e);
                    }
                }
            }
        });
    }

    /// Handle a new plain-TCP connection
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, proxy_cfg: ProxyProtocolConfig) {
        let sessions = self.sessions.clone();
        let subscriptions = self.subscriptions.clone();
        let retained = self.retained.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let hooks = self.hooks.clone();
        let metrics = self.metrics.clone();
        let persistence = self.persistence.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let (stream, proxy_info) = match maybe_read_proxy_header(stream, &proxy_cfg).await {
                Some(result) => result,
                None => return,
            };

            let mut conn = Connection::new(
                stream,
                addr,
                proxy_info,
                sessions,
                subscriptions,
                retained,
                connections,
                config,
                events,
                hooks,
                metrics,
                persistence,
            );

            run_connection_until_shutdown(&mut conn, addr, &mut shutdown_rx).await;
        });
    }

    /// Shutdown the broker
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get retained message count
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Publish a message from the server (e.g. a management API, not a client connection)
    pub fn publish(&self, topic: String, payload: Bytes, qos: QoS, retain: bool) {
        do_publish(&self.publish_handle(), topic, payload, qos, retain, None);
    }

    /// Forward locally published messages (from client connections or this
    /// broker's own `publish()`) out to configured bridges and cluster peers.
    fn spawn_forwarding_task(&self) {
        if self.bridge_manager.is_none() && self.cluster_manager.is_none() {
            return;
        }
        let bridge_manager = self.bridge_manager.clone();
        let cluster_manager = self.cluster_manager.clone();
        let mut events_rx = self.events.subscribe();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    event = events_rx.recv() => {
                        match event {
                            Ok(BrokerEvent::MessagePublished { topic, payload, qos, retain }) => {
                                if let Some(bridge_manager) = &bridge_manager {
                                    bridge_manager.forward_publish(&topic, payload.clone(), qos, retain).await;
                                }
                                if let Some(cluster_manager) = &cluster_manager {
                                    cluster_manager.forward_publish(&topic, payload, qos, retain).await;
                                }
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

/// Read a PROXY protocol header off `stream` if `cfg.enabled`, otherwise pass it through untouched.
/// Returns `None` if the header read fails (connection is dropped).
async fn maybe_read_proxy_header(
    mut stream: TcpStream,
    cfg: &ProxyProtocolConfig,
) -> Option<(TcpStream, Option<ProxyInfo>)> {
    if !cfg.enabled {
        return Some((stream, None));
    }

    match proxy::read_proxy_header(&mut stream, cfg.timeout).await {
        Ok(info) => Some((stream, Some(info))),
        Err(e) => {
            warn!("Dropping connection: invalid PROXY protocol header ({})", e);
            None
        }
    }
}

/// Drive a connection's main loop until it finishes or the broker shuts down.
async fn run_connection_until_shutdown<S>(
    conn: &mut Connection<S>,
    addr: SocketAddr,
    shutdown_rx: &mut broadcast::Receiver<()>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let conn_fut = conn.run();
    tokio::pin!(conn_fut);

    loop {
        tokio::select! {
            biased;

            result = &mut conn_fut => {
                if let Err(e) = result {
                    debug!("Connection error from {}: {}", addr, e);
                }
                break;
            }
            result = shutdown_rx.recv() => {
                match result {
                    Ok(()) => {
                        debug!("Connection {} shutting down", addr);
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Connection {} shutdown (channel closed)", addr);
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        continue;
                    }
                }
            }
        }
    }
}
