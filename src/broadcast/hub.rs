use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cli::config::BroadcastConfig;
use crate::crawler::progress::{ProgressEnvelope, ProgressEvent, ProgressSink};
use crate::error::CrawlerError;

use super::bus::EventBus;
use super::session::{ConnectionId, ServerMessage, SubscriberSession};
use super::{OwnershipCheck, SnapshotSource, TokenVerifier};

/// Hub tuning, in runtime units.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub auth_deadline: Duration,
    pub idle_timeout: Duration,
    pub throttle_window: Duration,
    pub max_connections_per_addr: usize,
    pub max_new_connections_per_minute: usize,
    /// Rolling window the new-connection counter covers.
    pub connection_window: Duration,
    pub snapshot_ttl: Duration,
    /// Maintenance sweep period when started as a background task.
    pub sweep_interval: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&BroadcastConfig::default())
    }
}

impl From<&BroadcastConfig> for HubSettings {
    fn from(config: &BroadcastConfig) -> Self {
        Self {
            auth_deadline: Duration::from_secs(config.auth_timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            throttle_window: Duration::from_millis(config.throttle_window_ms),
            max_connections_per_addr: config.max_connections_per_addr,
            max_new_connections_per_minute: config.max_new_connections_per_minute,
            connection_window: Duration::from_secs(60),
            snapshot_ttl: Duration::from_secs(config.snapshot_ttl_secs),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// One accepted connection, authenticated or not.
struct Connection {
    sender: UnboundedSender<ServerMessage>,
    addr: IpAddr,
    connected_at: Instant,
    session: Option<SubscriberSession>,
}

/// Per-job delivery throttle. The newest suppressed event is parked and
/// flushed once the window elapses, so a burst's final update always lands.
struct ThrottleEntry {
    last_sent: Instant,
    pending: Option<ProgressEvent>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Connection>,
    job_subscribers: HashMap<Uuid, HashSet<ConnectionId>>,
    user_connections: HashMap<String, HashSet<ConnectionId>>,
    throttle: HashMap<Uuid, ThrottleEntry>,
    addr_history: HashMap<IpAddr, VecDeque<Instant>>,
    snapshots: HashMap<Uuid, (Instant, ProgressEvent)>,
}

/// Fans crawl progress out to authenticated subscribers.
///
/// Transport-agnostic: `connect` hands back a receiver and the excluded
/// presentation layer owns the socket. Delivery is at-most-once best-effort;
/// the only replay is the snapshot handed over at subscribe time.
pub struct BroadcastHub {
    settings: HubSettings,
    state: Mutex<HubState>,
    verifier: Arc<dyn TokenVerifier>,
    ownership: Arc<dyn OwnershipCheck>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    bus: Arc<dyn EventBus>,
    instance_id: Uuid,
}

impl BroadcastHub {
    pub fn new(
        settings: HubSettings,
        verifier: Arc<dyn TokenVerifier>,
        ownership: Arc<dyn OwnershipCheck>,
        snapshots: Option<Arc<dyn SnapshotSource>>,
        bus: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            state: Mutex::new(HubState::default()),
            verifier,
            ownership,
            snapshots,
            bus,
            instance_id: Uuid::new_v4(),
        })
    }

    /// Spawn the periodic maintenance sweep.
    pub fn start(self: &Arc<Self>) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.settings.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                hub.run_maintenance().await;
            }
        });
    }

    /// Accept a connection from `addr`, subject to per-address limits. The
    /// caller gets the message stream; credentials are due within the auth
    /// deadline or the sweep disconnects it.
    pub async fn connect(
        &self,
        addr: IpAddr,
    ) -> Result<(ConnectionId, UnboundedReceiver<ServerMessage>), CrawlerError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let concurrent = state
            .connections
            .values()
            .filter(|c| c.addr == addr)
            .count();
        if concurrent >= self.settings.max_connections_per_addr {
            warn!(%addr, "connection refused, too many concurrent");
            return Err(CrawlerError::RateLimited(addr));
        }

        let history = state.addr_history.entry(addr).or_default();
        while history
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.settings.connection_window)
        {
            history.pop_front();
        }
        if history.len() >= self.settings.max_new_connections_per_minute {
            warn!(%addr, "connection refused, rate limited");
            return Err(CrawlerError::RateLimited(addr));
        }
        history.push_back(now);

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        state.connections.insert(
            id,
            Connection {
                sender,
                addr,
                connected_at: now,
                session: None,
            },
        );
        debug!(connection = %id, %addr, "connection accepted");
        Ok((id, receiver))
    }

    /// Verify the token and promote the connection to a session. A bad
    /// token is reported to the connection and returned as an error; the
    /// connection itself stays open until its auth deadline.
    pub async fn authenticate(
        &self,
        id: ConnectionId,
        token: &str,
    ) -> Result<String, CrawlerError> {
        let user_id = self.verifier.verify(token).await;

        let mut state = self.state.lock().await;
        let connection = state
            .connections
            .get_mut(&id)
            .ok_or(CrawlerError::ConnectionClosed)?;

        let Some(user_id) = user_id else {
            let _ = connection.sender.send(ServerMessage::AuthError {
                message: "invalid token".to_string(),
            });
            return Err(CrawlerError::InvalidToken);
        };

        let session = SubscriberSession::new(id, user_id.clone(), connection.addr);
        let _ = connection.sender.send(ServerMessage::AuthOk {
            user_id: user_id.clone(),
            session_id: session.session_id,
        });
        connection.session = Some(session);

        state
            .user_connections
            .entry(user_id.clone())
            .or_default()
            .insert(id);

        info!(connection = %id, user = %user_id, "connection authenticated");
        Ok(user_id)
    }

    /// Join a job's channel. Requires an authenticated session owning the
    /// job; delivers the latest known snapshot immediately.
    pub async fn subscribe(&self, id: ConnectionId, job_id: Uuid) -> Result<(), CrawlerError> {
        let user_id = {
            let state = self.state.lock().await;
            let connection = state
                .connections
                .get(&id)
                .ok_or(CrawlerError::ConnectionClosed)?;
            connection
                .session
                .as_ref()
                .map(|s| s.user_id.clone())
                .ok_or(CrawlerError::NotAuthenticated)?
        };

        // Ownership is checked without holding the hub lock; the
        // collaborator may do I/O.
        if !self.ownership.user_owns_job(&user_id, job_id).await {
            let mut state = self.state.lock().await;
            if let Some(connection) = state.connections.get_mut(&id) {
                let _ = connection.sender.send(ServerMessage::Error {
                    message: format!("job {job_id} does not belong to you"),
                });
            }
            return Err(CrawlerError::NotAuthorized { user_id, job_id });
        }

        let snapshot = self.latest_snapshot(job_id).await;

        let mut state = self.state.lock().await;
        let connection = state
            .connections
            .get_mut(&id)
            .ok_or(CrawlerError::ConnectionClosed)?;
        if let Some(session) = connection.session.as_mut() {
            session.subscriptions.insert(job_id);
            session.touch();
        }
        if let Some(event) = snapshot {
            let _ = connection.sender.send(ServerMessage::Snapshot { event });
        }
        state.job_subscribers.entry(job_id).or_default().insert(id);

        debug!(connection = %id, job_id = %job_id, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, id: ConnectionId, job_id: Uuid) -> Result<(), CrawlerError> {
        let mut state = self.state.lock().await;
        let connection = state
            .connections
            .get_mut(&id)
            .ok_or(CrawlerError::ConnectionClosed)?;
        if let Some(session) = connection.session.as_mut() {
            session.subscriptions.remove(&job_id);
            session.touch();
        }
        if let Some(subscribers) = state.job_subscribers.get_mut(&job_id) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                state.job_subscribers.remove(&job_id);
            }
        }
        Ok(())
    }

    /// Drop a connection and all its channel memberships.
    pub async fn disconnect(&self, id: ConnectionId) {
        let mut state = self.state.lock().await;
        Self::remove_connection(&mut state, id, None);
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Deliver an envelope that arrived over the bus from another instance.
    pub async fn deliver_remote(&self, envelope: ProgressEnvelope) {
        if envelope.origin == self.instance_id {
            return;
        }
        let mut state = self.state.lock().await;
        Self::throttled_deliver(&mut state, &self.settings, envelope.event);
    }

    /// Evict expired connections, flush parked throttle entries and prune
    /// caches. Runs on the sweep interval; also callable directly.
    pub async fn run_maintenance(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let expired: Vec<(ConnectionId, &'static str)> = state
            .connections
            .iter()
            .filter_map(|(id, connection)| match &connection.session {
                None if now.duration_since(connection.connected_at)
                    > self.settings.auth_deadline =>
                {
                    Some((*id, "authentication timeout"))
                }
                Some(session)
                    if now.duration_since(session.last_activity) > self.settings.idle_timeout =>
                {
                    Some((*id, "idle timeout"))
                }
                _ => None,
            })
            .collect();
        for (id, reason) in expired {
            debug!(connection = %id, reason, "evicting connection");
            Self::remove_connection(&mut state, id, Some(reason));
        }

        // Flush parked events whose window has elapsed.
        let due: Vec<Uuid> = state
            .throttle
            .iter()
            .filter(|(_, entry)| {
                entry.pending.is_some()
                    && now.duration_since(entry.last_sent) >= self.settings.throttle_window
            })
            .map(|(job_id, _)| *job_id)
            .collect();
        for job_id in due {
            if let Some(event) = state
                .throttle
                .get_mut(&job_id)
                .and_then(|entry| entry.pending.take())
            {
                Self::throttled_deliver(&mut state, &self.settings, event);
            }
        }

        // Stale throttle entries and snapshots.
        let idle_cutoff = self.settings.throttle_window * 10;
        state
            .throttle
            .retain(|_, entry| entry.pending.is_some() || now.duration_since(entry.last_sent) < idle_cutoff);
        state
            .snapshots
            .retain(|_, (cached_at, _)| now.duration_since(*cached_at) < self.settings.snapshot_ttl);
        state.addr_history.retain(|_, history| {
            while history
                .front()
                .is_some_and(|t| now.duration_since(*t) > self.settings.connection_window)
            {
                history.pop_front();
            }
            !history.is_empty()
        });
    }

    async fn latest_snapshot(&self, job_id: Uuid) -> Option<ProgressEvent> {
        {
            let state = self.state.lock().await;
            if let Some((cached_at, event)) = state.snapshots.get(&job_id) {
                if cached_at.elapsed() < self.settings.snapshot_ttl {
                    return Some(event.clone());
                }
            }
        }
        match &self.snapshots {
            Some(source) => source.latest_progress(job_id).await,
            None => None,
        }
    }

    /// Apply the per-job throttle, then fan out if the window allows.
    fn throttled_deliver(state: &mut HubState, settings: &HubSettings, event: ProgressEvent) {
        let now = Instant::now();
        state.snapshots.insert(event.job_id, (now, event.clone()));

        match state.throttle.get_mut(&event.job_id) {
            Some(entry) if now.duration_since(entry.last_sent) < settings.throttle_window => {
                // Park the newest event; the sweep flushes it.
                entry.pending = Some(event);
                return;
            }
            Some(entry) => {
                entry.last_sent = now;
                entry.pending = None;
            }
            None => {
                state.throttle.insert(
                    event.job_id,
                    ThrottleEntry {
                        last_sent: now,
                        pending: None,
                    },
                );
            }
        }
        Self::fan_out(state, event);
    }

    /// Deliver to the job channel and the owner's user channel, at most
    /// once per connection. Dead senders are removed on the way.
    fn fan_out(state: &mut HubState, event: ProgressEvent) {
        let mut targets: HashSet<ConnectionId> = state
            .job_subscribers
            .get(&event.job_id)
            .cloned()
            .unwrap_or_default();
        if let Some(user_conns) = state.user_connections.get(&event.user_id) {
            targets.extend(user_conns.iter().copied());
        }

        let mut dead = Vec::new();
        for id in targets {
            match state.connections.get(&id) {
                Some(connection) => {
                    if connection
                        .sender
                        .send(ServerMessage::Progress {
                            event: event.clone(),
                        })
                        .is_err()
                    {
                        dead.push(id);
                    }
                }
                None => dead.push(id),
            }
        }
        for id in dead {
            Self::remove_connection(state, id, None);
        }
    }

    fn remove_connection(state: &mut HubState, id: ConnectionId, reason: Option<&str>) {
        let Some(connection) = state.connections.remove(&id) else {
            return;
        };
        if let Some(reason) = reason {
            let _ = connection.sender.send(ServerMessage::Disconnected {
                reason: reason.to_string(),
            });
        }
        if let Some(session) = connection.session {
            if let Some(user_conns) = state.user_connections.get_mut(&session.user_id) {
                user_conns.remove(&id);
                if user_conns.is_empty() {
                    state.user_connections.remove(&session.user_id);
                }
            }
            for job_id in session.subscriptions {
                if let Some(subscribers) = state.job_subscribers.get_mut(&job_id) {
                    subscribers.remove(&id);
                    if subscribers.is_empty() {
                        state.job_subscribers.remove(&job_id);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ProgressSink for BroadcastHub {
    async fn publish(&self, event: ProgressEvent) {
        {
            let mut state = self.state.lock().await;
            Self::throttled_deliver(&mut state, &self.settings, event.clone());
        }

        let envelope = ProgressEnvelope {
            origin: self.instance_id,
            event,
        };
        if let Err(e) = self.bus.publish(&envelope).await {
            warn!("bus forward failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::bus::NullBus;
    use crate::broadcast::StaticTokenVerifier;
    use crate::crawler::progress::CrawlProgress;
    use std::net::Ipv4Addr;

    struct AllowAll;

    #[async_trait]
    impl OwnershipCheck for AllowAll {
        async fn user_owns_job(&self, _user_id: &str, _job_id: Uuid) -> bool {
            true
        }
    }

    struct DenyAll;

    #[async_trait]
    impl OwnershipCheck for DenyAll {
        async fn user_owns_job(&self, _user_id: &str, _job_id: Uuid) -> bool {
            false
        }
    }

    fn fast_settings() -> HubSettings {
        HubSettings {
            auth_deadline: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(60),
            throttle_window: Duration::from_millis(100),
            max_connections_per_addr: 5,
            max_new_connections_per_minute: 10,
            connection_window: Duration::from_millis(200),
            snapshot_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(10),
        }
    }

    fn hub_with(settings: HubSettings, ownership: Arc<dyn OwnershipCheck>) -> Arc<BroadcastHub> {
        let verifier = Arc::new(StaticTokenVerifier::single("token-1", "user-1"));
        BroadcastHub::new(settings, verifier, ownership, None, Arc::new(NullBus))
    }

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, last))
    }

    fn event_for(job_id: Uuid, crawled: usize) -> ProgressEvent {
        let mut progress = CrawlProgress::new();
        progress.crawled = crawled;
        ProgressEvent::new(job_id, "user-1", progress)
    }

    async fn authed_subscriber(
        hub: &BroadcastHub,
        job_id: Uuid,
    ) -> (ConnectionId, UnboundedReceiver<ServerMessage>) {
        let (id, mut rx) = hub.connect(addr(1)).await.unwrap();
        hub.authenticate(id, "token-1").await.unwrap();
        assert!(matches!(rx.recv().await, Some(ServerMessage::AuthOk { .. })));
        hub.subscribe(id, job_id).await.unwrap();
        (id, rx)
    }

    #[tokio::test]
    async fn bad_token_is_rejected_and_reported() {
        let hub = hub_with(fast_settings(), Arc::new(AllowAll));
        let (id, mut rx) = hub.connect(addr(1)).await.unwrap();

        let result = hub.authenticate(id, "wrong").await;
        assert!(matches!(result, Err(CrawlerError::InvalidToken)));
        assert!(matches!(rx.recv().await, Some(ServerMessage::AuthError { .. })));

        // Subscribing without a session is refused.
        let result = hub.subscribe(id, Uuid::new_v4()).await;
        assert!(matches!(result, Err(CrawlerError::NotAuthenticated)));
    }

    #[tokio::test]
    async fn ownership_denial_blocks_subscription() {
        let hub = hub_with(fast_settings(), Arc::new(DenyAll));
        let (id, mut rx) = hub.connect(addr(1)).await.unwrap();
        hub.authenticate(id, "token-1").await.unwrap();
        let _ = rx.recv().await;

        let result = hub.subscribe(id, Uuid::new_v4()).await;
        assert!(matches!(result, Err(CrawlerError::NotAuthorized { .. })));
        assert!(matches!(rx.recv().await, Some(ServerMessage::Error { .. })));
    }

    #[tokio::test]
    async fn burst_is_throttled_with_trailing_flush() {
        let hub = hub_with(fast_settings(), Arc::new(AllowAll));
        let job_id = Uuid::new_v4();
        let (_id, mut rx) = authed_subscriber(&hub, job_id).await;

        for crawled in 0..10 {
            hub.publish(event_for(job_id, crawled)).await;
        }

        // Only the first of the burst arrives inside the window.
        let first = rx.recv().await.unwrap();
        let ServerMessage::Progress { event } = first else {
            panic!("expected progress, got {first:?}");
        };
        assert_eq!(event.progress.crawled, 0);
        assert!(rx.try_recv().is_err());

        // After the window the sweep flushes the newest parked event.
        tokio::time::sleep(Duration::from_millis(120)).await;
        hub.run_maintenance().await;
        let flushed = rx.recv().await.unwrap();
        let ServerMessage::Progress { event } = flushed else {
            panic!("expected progress, got {flushed:?}");
        };
        assert_eq!(event.progress.crawled, 9);
    }

    #[tokio::test]
    async fn unauthenticated_connections_are_evicted_at_deadline() {
        let hub = hub_with(fast_settings(), Arc::new(AllowAll));
        let (_id, mut rx) = hub.connect(addr(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        hub.run_maintenance().await;

        assert_eq!(hub.connection_count().await, 0);
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_with_their_memberships() {
        let mut settings = fast_settings();
        settings.auth_deadline = Duration::from_secs(5);
        settings.idle_timeout = Duration::from_millis(50);
        let hub = hub_with(settings, Arc::new(AllowAll));
        let job_id = Uuid::new_v4();
        let (_id, mut rx) = authed_subscriber(&hub, job_id).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        hub.run_maintenance().await;

        assert_eq!(hub.connection_count().await, 0);
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::Disconnected { .. })
        ));

        // The evicted session's job subscription is gone with it.
        hub.publish(event_for(job_id, 3)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_address_limits_are_enforced() {
        let mut settings = fast_settings();
        settings.max_new_connections_per_minute = 100;
        let hub = hub_with(settings, Arc::new(AllowAll));

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(hub.connect(addr(1)).await.unwrap());
        }
        // Sixth concurrent connection from the same address is refused.
        assert!(matches!(
            hub.connect(addr(1)).await,
            Err(CrawlerError::RateLimited(_))
        ));
        // Another address is unaffected.
        assert!(hub.connect(addr(2)).await.is_ok());

        // Rolling-window limit on new connections.
        let mut settings = fast_settings();
        settings.max_connections_per_addr = 100;
        settings.max_new_connections_per_minute = 10;
        let hub = hub_with(settings, Arc::new(AllowAll));
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(hub.connect(addr(3)).await.unwrap());
        }
        assert!(matches!(
            hub.connect(addr(3)).await,
            Err(CrawlerError::RateLimited(_))
        ));
        // The window expires and new connections are admitted again.
        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(held);
        assert!(hub.connect(addr(3)).await.is_ok());
    }

    #[tokio::test]
    async fn subscribe_delivers_cached_snapshot() {
        let hub = hub_with(fast_settings(), Arc::new(AllowAll));
        let job_id = Uuid::new_v4();

        // A publish with no subscribers still primes the snapshot cache.
        hub.publish(event_for(job_id, 7)).await;

        let (id, mut rx) = hub.connect(addr(1)).await.unwrap();
        hub.authenticate(id, "token-1").await.unwrap();
        let _ = rx.recv().await;
        hub.subscribe(id, job_id).await.unwrap();

        let message = rx.recv().await.unwrap();
        let ServerMessage::Snapshot { event } = message else {
            panic!("expected snapshot, got {message:?}");
        };
        assert_eq!(event.progress.crawled, 7);
    }

    #[tokio::test]
    async fn disconnect_leaves_no_memberships_behind() {
        let hub = hub_with(fast_settings(), Arc::new(AllowAll));
        let job_id = Uuid::new_v4();
        let (id, rx) = authed_subscriber(&hub, job_id).await;
        drop(rx);

        hub.disconnect(id).await;
        assert_eq!(hub.connection_count().await, 0);

        // Publishing afterwards must not panic or resurrect the connection.
        hub.publish(event_for(job_id, 1)).await;
        assert_eq!(hub.connection_count().await, 0);
    }
}
