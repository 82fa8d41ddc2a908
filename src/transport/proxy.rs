// Proxy Supervisor - lifecycle of the anonymizing proxy
//
// The supervisor does not own the proxy daemon; it decides whether the
// transport may route through it. Enabling checks the proxy under a
// startup timeout, then a monitor task re-checks it periodically.
// Every stop bumps a cancellation epoch that in-flight anonymized dials
// watch, so they unwind without waiting for their own timeout.

use super::{BoxedStream, Dialer, PeerAddress, ProxyConnector, TcpDialer, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// Observed state of the proxy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyState {
    Disabled,
    Starting,
    Running,
    /// Enabled, but the last health check failed
    Degraded(String),
}

impl ProxyState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, ProxyState::Running | ProxyState::Degraded(_))
    }
}

pub struct ProxySupervisor {
    connector: Arc<dyn ProxyConnector>,
    startup_timeout: Duration,
    health_interval: Duration,
    state: Arc<Mutex<ProxyState>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    epoch: watch::Sender<u64>,
}

impl ProxySupervisor {
    pub fn new(connector: Arc<dyn ProxyConnector>, startup_timeout: Duration, health_interval: Duration) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            connector,
            startup_timeout,
            health_interval,
            state: Arc::new(Mutex::new(ProxyState::Disabled)),
            monitor: Mutex::new(None),
            epoch,
        }
    }

    pub fn connector(&self) -> Arc<dyn ProxyConnector> {
        Arc::clone(&self.connector)
    }

    pub fn state(&self) -> ProxyState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_state(&self, state: ProxyState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_enabled(&self) -> bool {
        self.state().is_enabled()
    }

    /// Receiver that fires on the next stop
    pub fn cancellation(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    /// Check the proxy and start supervising it
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.is_enabled() {
            return Ok(());
        }
        self.set_state(ProxyState::Starting);

        let checked = timeout(self.startup_timeout, self.connector.health_check()).await;
        let failure = match checked {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "{} did not answer within {:?}",
                self.connector.endpoint(),
                self.startup_timeout
            )),
        };
        if let Some(reason) = failure {
            self.set_state(ProxyState::Disabled);
            warn!(proxy = %self.connector.endpoint(), reason = %reason, "Proxy startup failed");
            return Err(TransportError::ProxyStartup(reason));
        }

        self.set_state(ProxyState::Running);
        self.spawn_monitor();
        info!(proxy = %self.connector.endpoint(), "Proxy running");
        Ok(())
    }

    /// Stop supervising and cancel in-flight dials
    pub fn stop(&self) {
        if let Some(handle) = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        self.set_state(ProxyState::Disabled);
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    fn spawn_monitor(&self) {
        let connector = Arc::clone(&self.connector);
        let state = Arc::clone(&self.state);
        let interval = self.health_interval;
        let check_timeout = self.startup_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let result = match timeout(check_timeout, connector.health_check()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("health check timed out".to_string()),
                };

                let mut current = state.lock().unwrap_or_else(PoisonError::into_inner);
                if *current == ProxyState::Disabled {
                    break;
                }
                match result {
                    Ok(()) => {
                        if matches!(*current, ProxyState::Degraded(_)) {
                            info!(proxy = %connector.endpoint(), "Proxy recovered");
                        }
                        *current = ProxyState::Running;
                    }
                    Err(reason) => {
                        warn!(proxy = %connector.endpoint(), reason = %reason, "Proxy health check failed");
                        *current = ProxyState::Degraded(reason);
                    }
                }
            }
        });

        if let Some(old) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            old.abort();
        }
    }
}

impl Drop for ProxySupervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

// ============================================================================
// MOCK PROXY (for testing)
// ============================================================================

/// In-process stand-in for an anonymizing proxy
///
/// Dials targets directly over TCP. Clones share health and counters, so a
/// test can keep a handle and flip the proxy up or down.
#[derive(Clone)]
pub struct MockProxy {
    healthy: Arc<AtomicBool>,
    check_delay: Duration,
    dial_delay: Duration,
    checks: Arc<AtomicU64>,
    dials: Arc<AtomicU64>,
}

impl Default for MockProxy {
    fn default() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
            check_delay: Duration::ZERO,
            dial_delay: Duration::ZERO,
            checks: Arc::new(AtomicU64::new(0)),
            dials: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl MockProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A proxy that is not listening
    pub fn unreachable() -> Self {
        let proxy = Self::default();
        proxy.set_healthy(false);
        proxy
    }

    pub fn with_check_delay(mut self, delay: Duration) -> Self {
        self.check_delay = delay;
        self
    }

    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = delay;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn check_count(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyConnector for MockProxy {
    fn endpoint(&self) -> String {
        "mock://proxy".to_string()
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.check_delay).await;
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(TransportError::ProxyUnavailable("mock proxy is down".to_string()));
        }
        Ok(())
    }

    async fn dial(&self, address: &PeerAddress) -> Result<BoxedStream, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.dial_delay).await;
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(TransportError::ProxyUnavailable("mock proxy is down".to_string()));
        }
        if address.is_onion() {
            return Err(TransportError::ConnectionFailed(format!("mock proxy cannot reach {}", address)));
        }
        TcpDialer::new().dial(address).await
    }
}
