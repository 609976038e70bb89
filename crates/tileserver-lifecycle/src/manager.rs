//! Drives the renewal machine: runs its actions against the store, the
//! solver and the server supervisor

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rustls::ServerConfig;
use serde::Serialize;
use thiserror::Error;
use tileserver_cert::{CertificateMaterial, CertificateStore, ChallengeSolver, StorageError};
use tileserver_server_https::{
    strict_server_config, GenerationHandle, MaterialResolver, ServerError, ServerGeneration,
    ServerSupervisor, StopOutcome,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::machine::{
    Action, CacheStatus, ExitReason, Input, LifecycleState, RenewalEvent, RenewalMachine,
    TransitionError,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Fatal lifecycle error: {0}")]
    Fatal(String),

    #[error("Invalid lifecycle transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Where each secure generation binds
    pub https_addr: SocketAddr,
    /// Names the certificate must cover
    pub domains: Vec<String>,
    /// Renew this long before expiry
    pub lead_time: Duration,
    /// Delay before retrying a failed renewal (capped at `lead_time`)
    pub retry_interval: Duration,
    /// Drain budget when stopping a generation
    pub shutdown_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            https_addr: SocketAddr::from(([0, 0, 0, 0], 8443)),
            domains: Vec::new(),
            lead_time: Duration::from_secs(30 * 24 * 60 * 60),
            retry_interval: Duration::from_secs(60 * 60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Published on the controller's broadcast channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StateChanged { state: LifecycleState },
    Renewal { event: RenewalEvent, renewals: u64 },
    GenerationStarted { generation: u64, renewals: u64 },
    GenerationStopped { generation: u64, forced: bool },
    RenewalScheduled { delay_secs: u64 },
    RetryScheduled { delay_secs: u64 },
}

/// Returned by a graceful run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleReport {
    pub renewals: u64,
    pub generations: u64,
}

/// Cloneable handle for steering a running manager
#[derive(Debug, Clone)]
pub struct LifecycleController {
    shutdown: CancellationToken,
    force: mpsc::Sender<()>,
    events: broadcast::Sender<LifecycleEvent>,
    state: watch::Receiver<LifecycleState>,
}

impl LifecycleController {
    /// Renew now instead of waiting for the schedule. Returns false if one is already queued.
    pub fn force_renewal(&self) -> bool {
        self.force.try_send(()).is_ok()
    }

    /// Idempotent
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.clone()
    }
}

/// Owns the certificate lifecycle and the live secure generation
pub struct CertificateLifecycleManager {
    config: LifecycleConfig,
    store: Arc<CertificateStore>,
    solver: Arc<dyn ChallengeSolver>,
    supervisor: ServerSupervisor,
    tls_config: Arc<ServerConfig>,
    machine: RenewalMachine,
    controller: LifecycleController,
    force_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<LifecycleState>,
    live: Option<GenerationHandle>,
    pending: Option<CertificateMaterial>,
    /// Set by a successful persist, consumed by the next schedule
    issued: bool,
    last_failure: Option<String>,
    wake_at: Option<Instant>,
    generations: u64,
}

impl CertificateLifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        store: Arc<CertificateStore>,
        solver: Arc<dyn ChallengeSolver>,
        supervisor: ServerSupervisor,
    ) -> Result<Self, LifecycleError> {
        let resolver = Arc::new(MaterialResolver::new(store.clone()));
        let tls_config = Arc::new(strict_server_config(resolver)?);

        let (force, force_rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state) = watch::channel(LifecycleState::Idle);

        Ok(Self {
            config,
            store,
            solver,
            supervisor,
            tls_config,
            machine: RenewalMachine::new(),
            controller: LifecycleController {
                shutdown: CancellationToken::new(),
                force,
                events,
                state,
            },
            force_rx,
            state_tx,
            live: None,
            pending: None,
            issued: false,
            last_failure: None,
            wake_at: None,
            generations: 0,
        })
    }

    pub fn controller(&self) -> LifecycleController {
        self.controller.clone()
    }

    /// Run until shutdown or a fatal error
    pub async fn run(mut self) -> Result<LifecycleReport, LifecycleError> {
        let cache = self.inspect_cache();
        let mut inputs = VecDeque::from([Input::Start { cache }]);

        loop {
            let input = match inputs.pop_front() {
                Some(input) => input,
                None => self.next_input().await,
            };

            let before = self.machine.state();
            let actions = self.machine.handle(input)?;
            let after = self.machine.state();
            debug!(?input, from = %before, to = %after, "Lifecycle transition");
            if before != after {
                self.publish_state(after);
            }

            for action in actions {
                match action {
                    Action::Exit(reason) => return self.exit(reason),
                    action => {
                        if let Some(follow_up) = self.execute(action).await {
                            inputs.push_back(follow_up);
                        }
                    }
                }
            }
        }
    }

    /// Wait for the schedule, a forced renewal, shutdown or the live generation ending
    async fn next_input(&mut self) -> Input {
        tokio::select! {
            biased;

            _ = self.controller.shutdown.cancelled() => {
                info!("Lifecycle shutdown requested");
                Input::Shutdown
            }
            Some(()) = self.force_rx.recv() => {
                info!("Forced certificate renewal requested");
                Input::RenewalDue
            }
            _ = sleep_until(self.wake_at) => {
                info!("Certificate renewal due");
                Input::RenewalDue
            }
            result = live_completion(&mut self.live) => {
                let reason = match result {
                    Ok(()) => "HTTPS generation exited unexpectedly".to_string(),
                    Err(e) => format!("HTTPS generation failed: {}", e),
                };
                error!("{}", reason);
                self.live = None;
                self.last_failure = Some(reason);
                Input::GenerationFailed
            }
        }
    }

    async fn execute(&mut self, action: Action) -> Option<Input> {
        match action {
            Action::BeginChallenge => Some(self.begin_challenge().await),
            Action::Emit(event) => {
                let renewals = self.machine.renewals();
                match event {
                    RenewalEvent::WillRenew => info!(renewals, "Certificate renewal starting"),
                    RenewalEvent::DidRenew => info!(renewals, "Certificate renewed"),
                }
                self.publish(LifecycleEvent::Renewal { event, renewals });
                None
            }
            Action::StopGeneration => {
                self.stop_generation().await;
                None
            }
            Action::PersistMaterial => Some(self.persist_material()),
            Action::InstallMaterial => {
                self.install_material();
                None
            }
            Action::StartGeneration => {
                self.start_generation();
                None
            }
            Action::ScheduleRenewal => {
                self.schedule_renewal();
                None
            }
            Action::ScheduleRetry => {
                self.schedule_retry();
                None
            }
            // Handled by run()
            Action::Exit(_) => None,
        }
    }

    fn inspect_cache(&mut self) -> CacheStatus {
        let material = match self.store.load() {
            Ok(material) => material,
            Err(StorageError::NotFound(_)) => {
                info!("No cached certificate; obtaining one");
                return CacheStatus::Missing;
            }
            Err(e) => {
                warn!("Cached certificate unusable, obtaining a new one: {}", e);
                return CacheStatus::Missing;
            }
        };

        if material.is_expired() {
            warn!(expires = %material.expires_at(), "Cached certificate has expired");
            return CacheStatus::Missing;
        }

        match self.store.load_meta() {
            Ok(Some(meta)) if !covers(&meta.domains, &self.config.domains) => {
                info!(
                    cached = ?meta.domains,
                    configured = ?self.config.domains,
                    "Configured domains changed; obtaining a new certificate"
                );
                return CacheStatus::Missing;
            }
            Ok(_) => {}
            Err(e) => debug!("Certificate metadata unreadable: {}", e),
        }

        info!(
            expires = %material.expires_at(),
            days_left = material.days_until_expiry(),
            "Using cached certificate"
        );
        self.pending = Some(material);
        CacheStatus::Valid
    }

    async fn begin_challenge(&mut self) -> Input {
        info!(domains = ?self.config.domains, "Requesting certificate");

        let result = tokio::select! {
            result = self.solver.solve() => result,
            _ = self.controller.shutdown.cancelled() => {
                info!("Shutdown requested during certificate request");
                return Input::Shutdown;
            }
        };
        self.discard_forced_renewals();

        match result {
            Ok(material) => {
                info!(expires = %material.expires_at(), "Certificate obtained");
                self.pending = Some(material);
                Input::ChallengeSucceeded
            }
            Err(e) => {
                error!("Certificate request failed: {}", e);
                self.last_failure = Some(format!("certificate request failed: {}", e));
                Input::ChallengeFailed
            }
        }
    }

    /// Save, then read back what was written; only that copy is installed
    fn persist_material(&mut self) -> Input {
        let Some(material) = self.pending.take() else {
            self.last_failure = Some("no certificate to persist".to_string());
            return Input::PersistFailed;
        };

        let result = self
            .store
            .save(&material, &self.config.domains)
            .and_then(|()| self.store.load());

        match result {
            Ok(reloaded) => {
                self.pending = Some(reloaded);
                self.issued = true;
                Input::Persisted
            }
            Err(e) => {
                error!("Failed to persist certificate: {}", e);
                self.last_failure = Some(format!("failed to persist certificate: {}", e));
                Input::PersistFailed
            }
        }
    }

    /// Reload the cache into the store; the read-back copy is the fallback
    fn install_material(&mut self) {
        let fallback = self.pending.take();
        match self.store.reload_now() {
            Ok(material) => info!(
                expires = %material.expires_at(),
                days_left = material.days_until_expiry(),
                "Installed certificate"
            ),
            Err(e) => match fallback {
                Some(material) => {
                    warn!("Reloading the certificate cache failed, installing the copy in memory: {}", e);
                    self.store.install(Arc::new(material));
                }
                None => error!("No certificate to install: {}", e),
            },
        }
    }

    /// Requests that arrived while a challenge ran are satisfied by it
    fn discard_forced_renewals(&mut self) {
        let mut discarded = 0;
        while self.force_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "Forced renewal already covered by this challenge");
        }
    }

    fn start_generation(&mut self) {
        self.generations += 1;
        let renewals = self.machine.renewals();
        let generation = ServerGeneration::new(
            self.generations,
            self.config.https_addr,
            self.tls_config.clone(),
            renewals,
        );

        info!(
            generation = self.generations,
            renewals,
            "Starting HTTPS generation on {}",
            self.config.https_addr
        );
        self.live = Some(self.supervisor.start(generation));
        self.publish(LifecycleEvent::GenerationStarted {
            generation: self.generations,
            renewals,
        });
    }

    async fn stop_generation(&mut self) {
        let Some(handle) = self.live.take() else {
            return;
        };
        let generation = handle.id();

        let outcome = self
            .supervisor
            .stop(handle, self.config.shutdown_grace)
            .await;
        let forced = matches!(outcome, StopOutcome::Forced);
        if let StopOutcome::AlreadyFinished(Err(e)) = &outcome {
            warn!(generation, "Generation had already failed: {}", e);
        }

        info!(generation, forced, "HTTPS generation stopped");
        self.publish(LifecycleEvent::GenerationStopped { generation, forced });
    }

    fn schedule_renewal(&mut self) {
        let issued = std::mem::take(&mut self.issued);
        let Some(material) = self.store.current_material() else {
            warn!("No certificate installed; renewal scheduled immediately");
            self.wake_at = Some(Instant::now());
            return;
        };

        let lead_time = chrono::Duration::from_std(self.config.lead_time)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let due = material.renewal_due_at(lead_time);
        let mut delay = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        // A fresh certificate shorter lived than the lead time would renew forever
        if issued && delay.is_zero() {
            let remaining = (material.expires_at() - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let floor = self.config.retry_interval.min(self.config.lead_time);
            delay = (remaining / 2).max(floor);
            warn!(
                expires = %material.expires_at(),
                lead_time_secs = self.config.lead_time.as_secs(),
                "Lead time is not shorter than the certificate lifetime; renewing halfway instead"
            );
        }

        info!(
            expires = %material.expires_at(),
            renew_at = %due,
            "Next certificate renewal in {}s",
            delay.as_secs()
        );
        self.wake_at = Some(Instant::now() + delay);
        self.publish(LifecycleEvent::RenewalScheduled {
            delay_secs: delay.as_secs(),
        });
    }

    fn schedule_retry(&mut self) {
        let delay = self.config.retry_interval.min(self.config.lead_time);

        match self.store.current_material() {
            Some(material) if material.is_expired() => warn!(
                expired = %material.expires_at(),
                "Serving an expired certificate (degraded); retrying renewal in {}s",
                delay.as_secs()
            ),
            _ => info!("Retrying certificate renewal in {}s", delay.as_secs()),
        }

        self.wake_at = Some(Instant::now() + delay);
        self.publish(LifecycleEvent::RetryScheduled {
            delay_secs: delay.as_secs(),
        });
    }

    fn exit(&mut self, reason: ExitReason) -> Result<LifecycleReport, LifecycleError> {
        let report = LifecycleReport {
            renewals: self.machine.renewals(),
            generations: self.generations,
        };

        match reason {
            ExitReason::Graceful => {
                info!(
                    renewals = report.renewals,
                    generations = report.generations,
                    "Certificate lifecycle stopped"
                );
                Ok(report)
            }
            ExitReason::Fatal => {
                let reason = self
                    .last_failure
                    .take()
                    .unwrap_or_else(|| "unknown failure".to_string());
                Err(LifecycleError::Fatal(reason))
            }
        }
    }

    fn publish_state(&self, state: LifecycleState) {
        info!(state = %state, "Lifecycle state changed");
        self.state_tx.send_replace(state);
        self.publish(LifecycleEvent::StateChanged { state });
    }

    fn publish(&self, event: LifecycleEvent) {
        // No subscribers is fine
        let _ = self.controller.events.send(event);
    }
}

/// Every configured domain is in the cached certificate's list
fn covers(cached: &[String], configured: &[String]) -> bool {
    configured
        .iter()
        .all(|domain| cached.iter().any(|c| c.eq_ignore_ascii_case(domain)))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn live_completion(live: &mut Option<GenerationHandle>) -> Result<(), ServerError> {
    match live {
        Some(handle) => handle.completed().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers() {
        let cached = vec!["a.example.com".to_string(), "B.example.com".to_string()];
        assert!(covers(&cached, &["a.example.com".to_string()]));
        assert!(covers(&cached, &["b.example.com".to_string(), "a.example.com".to_string()]));
        assert!(!covers(&cached, &["c.example.com".to_string()]));
        assert!(covers(&cached, &[]));
    }

    #[test]
    fn test_default_config() {
        let config = LifecycleConfig::default();
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert!(config.retry_interval < config.lead_time);
    }

    #[test]
    fn test_event_serialization() {
        let event = LifecycleEvent::Renewal {
            event: RenewalEvent::DidRenew,
            renewals: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "renewal");
        assert_eq!(json["event"], "did_renew");
        assert_eq!(json["renewals"], 3);
    }
}
