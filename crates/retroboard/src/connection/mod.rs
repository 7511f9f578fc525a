//! Connection resilience for the peer transport.
//!
//! The manager probes the configured signaling endpoints, drives the
//! transport's connect/disconnect cycle, and turns raw transport events
//! into a small status state machine with exponential-backoff retries.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use crate::error::BoardResult;
use crate::notify::{Disposer, Publisher};

/// How long a single endpoint probe may take.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Base delay before the first reconnect attempt.
pub const RETRY_BASE_MS: u64 = 1000;

/// Ceiling for the exponential backoff.
pub const RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Reconnect attempts before giving up.
pub const MAX_RETRIES: u32 = 5;

/// Backoff before retry number `attempt` (zero-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_MS.saturating_mul(1u64 << attempt.min(31));
    Duration::from_millis(exp.min(RETRY_MAX_DELAY_MS))
}

/// Lifecycle phase of the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Initial probe and first connect are in progress.
    Connecting,
    Connected,
    /// The transport dropped; a retry is not scheduled yet.
    Disconnected,
    /// Waiting out the backoff before the next reconnect attempt.
    Retrying,
    /// Retries are exhausted; only an explicit reconnect leaves this state.
    Failed,
}

/// Snapshot of the connection state, published on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    /// The endpoint the probe selected, once known.
    pub endpoint: Option<String>,
    /// Whether initial document sync has completed on this connection.
    pub synced: bool,
    /// Ordinal of the pending retry, 1-based; 0 outside of retries.
    pub retry_attempt: u32,
}

impl ConnectionStatus {
    fn initial() -> Self {
        Self {
            phase: ConnectionPhase::Connecting,
            endpoint: None,
            synced: false,
            retry_attempt: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    pub fn is_retrying(&self) -> bool {
        self.phase == ConnectionPhase::Retrying
    }
}

/// Raw event stream of a peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Status { connected: bool },
    Synced { synced: bool },
}

/// Seam to the actual peer-to-peer transport provider.
///
/// `connect` only starts the transport; success or failure of the session
/// arrives later through the event stream.
pub trait PeerTransport: Send + Sync {
    fn connect(&self) -> BoardResult<()>;
    fn disconnect(&self);
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Reachability probe for one signaling endpoint.
pub trait EndpointProber: Send + Sync + 'static {
    fn probe(&self, endpoint: &str, deadline: Duration) -> impl Future<Output = bool> + Send;
}

/// Probes an endpoint by opening and immediately closing a websocket.
#[derive(Debug, Default, Clone)]
pub struct WsProber;

impl EndpointProber for WsProber {
    async fn probe(&self, endpoint: &str, deadline: Duration) -> bool {
        match timeout(deadline, tokio_tungstenite::connect_async(endpoint)).await {
            Ok(Ok((mut socket, _response))) => {
                let _ = socket.close(None).await;
                true
            }
            Ok(Err(e)) => {
                debug!(endpoint, error = %e, "endpoint probe failed");
                false
            }
            Err(_) => {
                debug!(endpoint, "endpoint probe timed out");
                false
            }
        }
    }
}

struct RetryState {
    attempt: u32,
    timer: Option<JoinHandle<()>>,
}

struct ManagerInner<P> {
    endpoints: Vec<String>,
    transport: Arc<dyn PeerTransport>,
    prober: P,
    status: Mutex<ConnectionStatus>,
    publisher: Publisher<ConnectionStatus>,
    retry: Mutex<RetryState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Drives the peer transport through probe, connect and retry.
///
/// Cloning shares the same state machine.
pub struct ConnectionManager<P = WsProber> {
    inner: Arc<ManagerInner<P>>,
}

impl<P> Clone for ConnectionManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ConnectionManager<WsProber> {
    pub fn new(endpoints: Vec<String>, transport: Arc<dyn PeerTransport>) -> Self {
        Self::with_prober(endpoints, transport, WsProber)
    }
}

impl<P: EndpointProber> ConnectionManager<P> {
    pub fn with_prober(
        endpoints: Vec<String>,
        transport: Arc<dyn PeerTransport>,
        prober: P,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                endpoints,
                transport,
                prober,
                status: Mutex::new(ConnectionStatus::initial()),
                publisher: Publisher::new(),
                retry: Mutex::new(RetryState {
                    attempt: 0,
                    timer: None,
                }),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock_status().clone()
    }

    /// Subscribe to status changes. The current snapshot is delivered
    /// immediately, then every subsequent change until the disposer drops.
    pub fn subscribe(
        &self,
        callback: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> Disposer {
        callback(&self.status());
        self.inner.publisher.subscribe(callback)
    }

    /// Probe the endpoints and bring the transport up.
    ///
    /// Spawns the probe and the transport event loop; returns immediately.
    pub fn start(&self) {
        // Subscribe before the probe can connect; a status event emitted
        // during connect() would otherwise be dropped on the floor.
        let events = self.inner.transport.events();
        let event_loop = {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                ManagerInner::run_event_loop(inner, events).await;
            })
        };
        let probe = {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                ManagerInner::run_probe(inner).await;
            })
        };
        let mut tasks = self.inner.lock_tasks();
        tasks.push(event_loop);
        tasks.push(probe);
    }

    /// Tear the transport down and reconnect from scratch, resetting the
    /// retry budget. This is the only way out of the Failed phase.
    pub fn reconnect(&self) {
        info!("manual reconnect requested");
        {
            let mut retry = self.inner.lock_retry();
            retry.attempt = 0;
            if let Some(timer) = retry.timer.take() {
                timer.abort();
            }
        }
        self.inner.update_status(|status| {
            status.phase = ConnectionPhase::Connecting;
            status.synced = false;
            status.retry_attempt = 0;
        });
        self.inner.transport.disconnect();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            ManagerInner::run_probe(inner).await;
        });
    }

    /// Stop all background tasks and disconnect the transport.
    pub fn stop(&self) {
        {
            let mut retry = self.inner.lock_retry();
            if let Some(timer) = retry.timer.take() {
                timer.abort();
            }
        }
        for task in self.inner.lock_tasks().drain(..) {
            task.abort();
        }
        self.inner.transport.disconnect();
    }
}

impl<P: EndpointProber> ManagerInner<P> {
    fn lock_status(&self) -> std::sync::MutexGuard<'_, ConnectionStatus> {
        self.status.lock().expect("status lock poisoned")
    }

    fn lock_retry(&self) -> std::sync::MutexGuard<'_, RetryState> {
        self.retry.lock().expect("retry lock poisoned")
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().expect("task lock poisoned")
    }

    /// Mutate the status under the lock, then publish the new snapshot
    /// outside of it.
    fn update_status(&self, mutate: impl FnOnce(&mut ConnectionStatus)) {
        let snapshot = {
            let mut status = self.lock_status();
            mutate(&mut status);
            status.clone()
        };
        self.publisher.emit(&snapshot);
    }

    /// Try the endpoints in order and connect through the first one that
    /// answers. Exhausting the list fails the connection, unless the
    /// transport came up through other means in the meantime.
    async fn run_probe(inner: Arc<Self>) {
        for endpoint in &inner.endpoints {
            if inner.prober.probe(endpoint, PROBE_TIMEOUT).await {
                info!(endpoint, "signaling endpoint reachable");
                inner.update_status(|status| {
                    status.endpoint = Some(endpoint.clone());
                });
                if let Err(e) = inner.transport.connect() {
                    warn!(error = %e, "initial connect failed");
                    Self::schedule_retry(inner.clone());
                }
                return;
            }
        }
        warn!("no signaling endpoint reachable");
        inner.update_status(|status| {
            if status.phase == ConnectionPhase::Connecting {
                status.phase = ConnectionPhase::Failed;
            }
        });
    }

    async fn run_event_loop(inner: Arc<Self>, mut events: broadcast::Receiver<TransportEvent>) {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Status { connected: true }) => {
                    {
                        let mut retry = inner.lock_retry();
                        retry.attempt = 0;
                        if let Some(timer) = retry.timer.take() {
                            timer.abort();
                        }
                    }
                    inner.update_status(|status| {
                        status.phase = ConnectionPhase::Connected;
                        status.retry_attempt = 0;
                    });
                }
                Ok(TransportEvent::Status { connected: false }) => {
                    let phase = inner.lock_status().phase;
                    match phase {
                        // Leaving Failed takes an explicit reconnect.
                        ConnectionPhase::Failed => {}
                        // Initial connect never came up; go straight to
                        // the backoff ladder.
                        ConnectionPhase::Connecting => Self::schedule_retry(inner.clone()),
                        _ => {
                            inner.update_status(|status| {
                                status.phase = ConnectionPhase::Disconnected;
                                status.synced = false;
                            });
                            Self::schedule_retry(inner.clone());
                        }
                    }
                }
                Ok(TransportEvent::Synced { synced }) => {
                    inner.update_status(|status| {
                        status.synced = synced;
                    });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "transport event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Schedule the next reconnect attempt, or fail once the budget is
    /// spent. Replaces any retry timer already pending.
    fn schedule_retry(inner: Arc<Self>) {
        let attempt = {
            let retry = inner.lock_retry();
            retry.attempt
        };
        if attempt >= MAX_RETRIES {
            info!(attempts = attempt, "retry budget exhausted");
            inner.update_status(|status| {
                status.phase = ConnectionPhase::Failed;
                status.retry_attempt = 0;
            });
            return;
        }

        let delay = backoff_delay(attempt);
        debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "scheduling retry");
        inner.update_status(|status| {
            status.phase = ConnectionPhase::Retrying;
            status.retry_attempt = attempt + 1;
        });

        let timer = {
            let inner = inner.clone();
            tokio::spawn(async move {
                sleep(delay).await;
                {
                    let mut retry = inner.lock_retry();
                    retry.attempt += 1;
                }
                if let Err(e) = inner.transport.connect() {
                    warn!(error = %e, "reconnect attempt failed");
                    Self::schedule_retry(inner.clone());
                }
            })
        };
        let mut retry = inner.lock_retry();
        if let Some(previous) = retry.timer.replace(timer) {
            previous.abort();
        }
    }
}
