//! Supervised broker connection.
//!
//! [`BrokerClient`] owns one connection and one shared channel. Error or
//! close events on either link drop the client to `Disconnected` and start a
//! reconnect cycle: wait the cooldown, then make up to `max_attempts`
//! connect attempts spaced by `attempt_delay`. Exhausted cycles leave the
//! client `Degraded` and schedule the next cycle; the supervisor never gives
//! up. At most one cycle runs at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::broker::{BrokerChannel, BrokerConnection, BrokerConnector};
use super::error::BrokerError;
use super::topology::{assert_topology, QueueTopology};
use crate::clock::Clock;
use crate::types::ReconnectPolicy;

/// Link state as observed by producers, consumers and the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// A full connect cycle failed; another one is scheduled.
    Degraded(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded(_) => "degraded",
        }
    }
}

struct LiveLink {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    generation: u64,
}

struct ClientInner {
    connector: Arc<dyn BrokerConnector>,
    clock: Arc<dyn Clock>,
    policy: ReconnectPolicy,
    topology: Option<QueueTopology>,
    link: RwLock<Option<LiveLink>>,
    state: watch::Sender<ConnectionState>,
    reconnecting: AtomicBool,
    shutdown: AtomicBool,
    generation: AtomicU64,
    cycles: AtomicU64,
}

/// Broker client with reconnect supervision. Clones share the same link.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

impl BrokerClient {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        clock: Arc<dyn Clock>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self::build(connector, clock, policy, None)
    }

    /// Like [`BrokerClient::new`], but asserts `topology` on the shared
    /// channel every time a link is opened.
    pub fn with_topology(
        connector: Arc<dyn BrokerConnector>,
        clock: Arc<dyn Clock>,
        policy: ReconnectPolicy,
        topology: QueueTopology,
    ) -> Self {
        Self::build(connector, clock, policy, Some(topology))
    }

    fn build(
        connector: Arc<dyn BrokerConnector>,
        clock: Arc<dyn Clock>,
        policy: ReconnectPolicy,
        topology: Option<QueueTopology>,
    ) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                connector,
                clock,
                policy,
                topology,
                link: RwLock::new(None),
                state,
                reconnecting: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                cycles: AtomicU64::new(0),
            }),
        }
    }

    /// One transport connection attempt.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.inner.connector.connect().await
    }

    /// Open a channel on `connection`.
    pub async fn open_channel(
        &self,
        connection: &Arc<dyn BrokerConnection>,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        connection.open_channel().await
    }

    /// True when both the connection and the shared channel are live.
    pub fn is_ready(&self) -> bool {
        self.inner
            .link
            .read()
            .as_ref()
            .map(|link| link.connection.is_open() && link.channel.is_open())
            .unwrap_or(false)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// Reconnect cycles started so far.
    pub fn reconnect_cycles(&self) -> u64 {
        self.inner.cycles.load(Ordering::SeqCst)
    }

    /// Initial bounded connect. On failure the client is left `Degraded`
    /// and a background reconnect cycle is already scheduled.
    pub async fn start(&self) -> Result<(), BrokerError> {
        info!("Connecting to RabbitMQ");
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "Initial RabbitMQ connect failed, retrying in background");
                self.trigger_reconnect();
                Err(e)
            }
        }
    }

    /// Run one bounded connect cycle and install the resulting link.
    pub async fn establish(&self) -> Result<(), BrokerError> {
        let (connection, channel) = self.attempt_link().await?;
        self.install(connection, channel);
        Ok(())
    }

    /// The shared channel, or `ServiceUnavailable` when the link is down.
    pub fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let link = self.inner.link.read();
        match link.as_ref() {
            Some(link) if link.connection.is_open() && link.channel.is_open() => {
                Ok(link.channel.clone())
            }
            _ => Err(self.unavailable()),
        }
    }

    /// Open a channel owned by the caller over the live connection.
    pub async fn open_dedicated_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let connection = {
            let link = self.inner.link.read();
            match link.as_ref() {
                Some(link) if link.connection.is_open() => link.connection.clone(),
                _ => return Err(self.unavailable()),
            }
        };
        connection.open_channel().await
    }

    /// Poll readiness up to `attempts` times, `delay` apart.
    pub async fn wait_until_ready(&self, attempts: u32, delay: Duration) -> bool {
        for attempt in 1..=attempts.max(1) {
            if self.is_ready() {
                return true;
            }
            debug!(attempt, "RabbitMQ not ready yet");
            if attempt < attempts {
                self.inner.clock.sleep(delay).await;
            }
        }
        self.is_ready()
    }

    /// Start a reconnect cycle unless one is already running.
    ///
    /// Returns `false` when the request was coalesced into the running cycle
    /// or the client is shut down.
    pub fn trigger_reconnect(&self) -> bool {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnect already in flight");
            return false;
        }

        self.inner.cycles.fetch_add(1, Ordering::SeqCst);
        let client = self.clone();
        tokio::spawn(async move { client.reconnect_loop().await });
        true
    }

    /// Stop supervising and close the link.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let link = self.inner.link.write().take();
        if let Some(link) = link {
            if let Err(e) = link.channel.close().await {
                warn!(error = %e, "Error closing RabbitMQ channel");
            }
            if let Err(e) = link.connection.close().await {
                warn!(error = %e, "Error closing RabbitMQ connection");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("RabbitMQ client shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    fn unavailable(&self) -> BrokerError {
        match self.state() {
            ConnectionState::Degraded(reason) => BrokerError::unavailable(reason),
            state => BrokerError::unavailable(format!("RabbitMQ is {}", state.as_str())),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn attempt_link(
        &self,
    ) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), BrokerError> {
        let policy = self.inner.policy;
        let max_attempts = policy.max_attempts.max(1);
        self.set_state(ConnectionState::Connecting);

        let mut last_error = BrokerError::unavailable("no connect attempt made");
        for attempt in 1..=max_attempts {
            match self.open_link().await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "RabbitMQ connect attempt failed"
                    );
                    last_error = e;
                }
            }
            if attempt < max_attempts {
                self.inner.clock.sleep(policy.attempt_delay).await;
            }
            if self.is_shut_down() {
                break;
            }
        }

        self.set_state(ConnectionState::Degraded(last_error.to_string()));
        Err(BrokerError::unavailable(format!(
            "RabbitMQ service unavailable: {last_error}"
        )))
    }

    async fn open_link(
        &self,
    ) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>), BrokerError> {
        let connection = self.connect().await?;
        let channel = match self.open_channel(&connection).await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close().await;
                return Err(e);
            }
        };
        if let Some(topology) = &self.inner.topology {
            if let Err(e) = assert_topology(channel.as_ref(), topology).await {
                let _ = connection.close().await;
                return Err(e);
            }
        }
        Ok((connection, channel))
    }

    fn install(&self, connection: Arc<dyn BrokerConnection>, channel: Arc<dyn BrokerChannel>) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let connection_monitor = connection.monitor().clone();
        let channel_monitor = channel.monitor().clone();

        *self.inner.link.write() = Some(LiveLink {
            connection,
            channel,
            generation,
        });
        self.set_state(ConnectionState::Connected);
        info!(generation, "RabbitMQ connection established");

        let client = self.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                reason = connection_monitor.tripped() => reason,
                reason = channel_monitor.tripped() => reason,
            };
            client.on_link_failure(generation, reason).await;
        });
    }

    async fn on_link_failure(&self, generation: u64, reason: String) {
        if self.is_shut_down() {
            return;
        }
        let stale = {
            let mut link = self.inner.link.write();
            if link.as_ref().map(|current| current.generation) != Some(generation) {
                debug!(generation, "Ignoring failure of a replaced link");
                return;
            }
            link.take()
        };

        warn!(generation, reason = %reason, "RabbitMQ link lost");
        self.set_state(ConnectionState::Disconnected);

        // A channel-level failure leaves the connection up; close it so the
        // next cycle replaces it instead of opening a second one.
        if let Some(stale) = stale {
            if stale.connection.is_open() {
                if let Err(e) = stale.connection.close().await {
                    debug!(error = %e, "Error closing stale RabbitMQ connection");
                }
            }
        }
        self.trigger_reconnect();
    }

    async fn reconnect_loop(&self) {
        let policy = self.inner.policy;
        loop {
            self.inner.clock.sleep(policy.cooldown).await;
            if self.is_shut_down() {
                break;
            }

            match self.attempt_link().await {
                Ok((connection, channel)) => {
                    if self.is_shut_down() {
                        let _ = connection.close().await;
                        break;
                    }
                    // A failure of the new link must be able to start the
                    // next cycle, so release the flag before installing.
                    self.inner.reconnecting.store(false, Ordering::SeqCst);
                    self.install(connection, channel);
                    return;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        cooldown_ms = policy.cooldown.as_millis() as u64,
                        "Reconnect cycle failed, scheduling another"
                    );
                }
            }
        }
        self.inner.reconnecting.store(false, Ordering::SeqCst);
    }
}
