//! Lifecycle runs against a scripted solver and an in-memory generation service

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tileserver_cert::{
    generate_self_signed_material, generate_self_signed_material_between, AcmeError,
    CertificateMaterial, CertificateStore, ChallengeSolver,
};
use tileserver_lifecycle::{
    CertificateLifecycleManager, LifecycleConfig, LifecycleController, LifecycleError,
    LifecycleEvent, LifecycleReport, LifecycleState, RenewalEvent,
};
use tileserver_server_https::{GenerationService, ServerError, ServerGeneration, ServerSupervisor};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn domains() -> Vec<String> {
    vec!["tiles.example.com".to_string()]
}

fn material(valid_days: i64) -> CertificateMaterial {
    generate_self_signed_material(&domains(), chrono::Duration::days(valid_days)).unwrap()
}

fn expired_material() -> CertificateMaterial {
    let now = Utc::now();
    generate_self_signed_material_between(
        &domains(),
        now - chrono::Duration::days(90),
        now - chrono::Duration::days(1),
    )
    .unwrap()
}

enum Step {
    Issue(i64),
    /// Issue once the gate is opened
    Gated(Arc<Notify>, i64),
    Fail,
    Hang,
}

/// Plays back a fixed list of outcomes
struct ScriptedSolver {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedSolver {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChallengeSolver for ScriptedSolver {
    async fn solve(&self) -> Result<CertificateMaterial, AcmeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Issue(days)) => Ok(material(days)),
            Some(Step::Gated(gate, days)) => {
                gate.notified().await;
                Ok(material(days))
            }
            Some(Step::Hang) => {
                std::future::pending::<()>().await;
                Err(AcmeError::Timeout)
            }
            Some(Step::Fail) | None => Err(AcmeError::OrderFailed("scripted failure".to_string())),
        }
    }
}

/// Serves until cancelled and records any overlap between generations
#[derive(Default)]
struct SingleOwnerService {
    live: AtomicUsize,
    overlapped: AtomicBool,
    runs: AtomicUsize,
}

#[async_trait]
impl GenerationService for SingleOwnerService {
    async fn serve(&self, generation: ServerGeneration) -> Result<(), ServerError> {
        if self.live.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        generation.shutdown.cancelled().await;
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingService;

#[async_trait]
impl GenerationService for FailingService {
    async fn serve(&self, generation: ServerGeneration) -> Result<(), ServerError> {
        Err(ServerError::BindError {
            address: generation.bind_addr.ip().to_string(),
            port: generation.bind_addr.port(),
            reason: "Address already in use".to_string(),
        })
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<CertificateStore>,
    controller: LifecycleController,
    events: broadcast::Receiver<LifecycleEvent>,
    run: JoinHandle<Result<LifecycleReport, LifecycleError>>,
}

fn config() -> LifecycleConfig {
    LifecycleConfig {
        https_addr: "127.0.0.1:0".parse().unwrap(),
        domains: domains(),
        lead_time: 30 * DAY,
        retry_interval: Duration::from_secs(3600),
        shutdown_grace: Duration::from_millis(500),
    }
}

fn start(
    config: LifecycleConfig,
    cached: Option<CertificateMaterial>,
    solver: Arc<dyn ChallengeSolver>,
    service: Arc<dyn GenerationService>,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(CertificateStore::open(dir.path()).unwrap());
    if let Some(cached) = cached {
        store.save(&cached, &domains()).unwrap();
    }

    let manager = CertificateLifecycleManager::new(
        config,
        store.clone(),
        solver,
        ServerSupervisor::new(service),
    )
    .unwrap();
    let controller = manager.controller();
    let events = controller.subscribe();
    let run = tokio::spawn(manager.run());

    Harness {
        _dir: dir,
        store,
        controller,
        events,
        run,
    }
}

/// Collect events up to and including the first one matching `done`
async fn collect_until(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    done: impl Fn(&LifecycleEvent) -> bool,
) -> Vec<LifecycleEvent> {
    let mut seen = Vec::new();
    let wait = async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            let finished = done(&event);
            seen.push(event);
            if finished {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("timed out waiting for lifecycle event");
    seen
}

fn position(events: &[LifecycleEvent], wanted: &LifecycleEvent) -> usize {
    events
        .iter()
        .position(|e| e == wanted)
        .unwrap_or_else(|| panic!("{:?} not in {:?}", wanted, events))
}

fn started(generation: u64) -> impl Fn(&LifecycleEvent) -> bool {
    move |e| matches!(e, LifecycleEvent::GenerationStarted { generation: g, .. } if *g == generation)
}

#[tokio::test]
async fn test_warm_start_skips_challenge() {
    init_tracing();
    let solver = ScriptedSolver::new(vec![]);
    let service = Arc::new(SingleOwnerService::default());
    let mut harness = start(config(), Some(material(90)), solver.clone(), service.clone());

    let events = collect_until(&mut harness.events, |e| {
        matches!(e, LifecycleEvent::RenewalScheduled { .. })
    })
    .await;
    assert!(events.contains(&LifecycleEvent::GenerationStarted {
        generation: 1,
        renewals: 0
    }));
    assert_eq!(*harness.controller.state().borrow(), LifecycleState::Serving);
    assert_eq!(solver.calls(), 0);
    // What is served is what the cache holds on disk
    let served = harness.store.current_material().unwrap();
    assert_eq!(
        served.certificate_pem(),
        harness.store.load().unwrap().certificate_pem()
    );

    harness.controller.shutdown();
    let report = harness.run.await.unwrap().unwrap();
    assert_eq!(
        report,
        LifecycleReport {
            renewals: 0,
            generations: 1
        }
    );
    assert_eq!(service.live.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cold_start_failure_is_fatal() {
    init_tracing();
    let solver = ScriptedSolver::new(vec![Step::Fail]);
    let service = Arc::new(SingleOwnerService::default());
    let harness = start(config(), None, solver.clone(), service.clone());
    let state = harness.controller.state();

    let result = tokio::time::timeout(Duration::from_secs(10), harness.run)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(result, Err(LifecycleError::Fatal(_))));
    assert_eq!(*state.borrow(), LifecycleState::Terminated);
    assert_eq!(solver.calls(), 1);
    assert_eq!(service.runs.load(Ordering::SeqCst), 0);
    assert!(harness.store.current_material().is_none());
}

#[tokio::test]
async fn test_expired_cache_is_a_cold_start() {
    init_tracing();
    let solver = ScriptedSolver::new(vec![Step::Issue(90)]);
    let service = Arc::new(SingleOwnerService::default());
    let mut harness = start(config(), Some(expired_material()), solver.clone(), service);

    collect_until(&mut harness.events, started(1)).await;
    assert_eq!(solver.calls(), 1);

    let served = harness.store.current_material().unwrap();
    assert!(!served.is_expired());
    // The fresh certificate replaced the expired one on disk too
    assert!(!harness.store.load().unwrap().is_expired());

    harness.controller.shutdown();
    harness.run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_renewal_hands_off_between_generations() {
    init_tracing();
    let solver = ScriptedSolver::new(vec![Step::Issue(90), Step::Issue(90)]);
    let service = Arc::new(SingleOwnerService::default());
    let mut harness = start(config(), None, solver.clone(), service.clone());

    collect_until(&mut harness.events, started(1)).await;
    let first = harness.store.current_material().unwrap();

    assert!(harness.controller.force_renewal());
    let events = collect_until(&mut harness.events, started(2)).await;

    let will = position(
        &events,
        &LifecycleEvent::Renewal {
            event: RenewalEvent::WillRenew,
            renewals: 0,
        },
    );
    let stopped = position(
        &events,
        &LifecycleEvent::GenerationStopped {
            generation: 1,
            forced: false,
        },
    );
    let did = position(
        &events,
        &LifecycleEvent::Renewal {
            event: RenewalEvent::DidRenew,
            renewals: 1,
        },
    );
    let restarted = position(
        &events,
        &LifecycleEvent::GenerationStarted {
            generation: 2,
            renewals: 1,
        },
    );
    assert!(will < stopped && stopped < did && did < restarted, "{:?}", events);

    let second = harness.store.current_material().unwrap();
    assert_ne!(first.private_key_pem(), second.private_key_pem());
    assert_eq!(
        harness.store.load().unwrap().private_key_pem(),
        second.private_key_pem()
    );

    harness.controller.shutdown();
    let report = harness.run.await.unwrap().unwrap();
    assert_eq!(
        report,
        LifecycleReport {
            renewals: 1,
            generations: 2
        }
    );
    assert!(!service.overlapped.load(Ordering::SeqCst));
    assert_eq!(service.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_renewal_failure_keeps_serving_and_retries() {
    init_tracing();
    // Ten days left with a thirty day lead time: renewal is due immediately
    let cached = material(10);
    let cached_key = cached.private_key_pem().to_string();
    let solver = ScriptedSolver::new(vec![Step::Fail]);
    let service = Arc::new(SingleOwnerService::default());
    let mut harness = start(config(), Some(cached), solver.clone(), service.clone());

    let events = collect_until(&mut harness.events, |e| {
        matches!(e, LifecycleEvent::RetryScheduled { .. })
    })
    .await;

    assert!(events.contains(&LifecycleEvent::GenerationStarted {
        generation: 2,
        renewals: 0
    }));
    assert!(!events.iter().any(|e| matches!(
        e,
        LifecycleEvent::Renewal {
            event: RenewalEvent::DidRenew,
            ..
        }
    )));
    match events.last() {
        Some(LifecycleEvent::RetryScheduled { delay_secs }) => {
            assert!(Duration::from_secs(*delay_secs) <= config().lead_time);
            assert_eq!(*delay_secs, 3600);
        }
        other => panic!("expected RetryScheduled, got {:?}", other),
    }

    assert_eq!(*harness.controller.state().borrow(), LifecycleState::Serving);
    assert_eq!(
        harness.store.current_material().unwrap().private_key_pem(),
        cached_key
    );
    // The recovery generation comes up on the old material
    tokio::time::timeout(Duration::from_secs(5), async {
        while service.runs.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("recovery generation should start");
    assert_eq!(service.live.load(Ordering::SeqCst), 1);

    harness.controller.shutdown();
    let report = harness.run.await.unwrap().unwrap();
    assert_eq!(report.renewals, 0);
    assert!(!service.overlapped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_retry_delay_is_capped_by_lead_time() {
    init_tracing();
    let config = LifecycleConfig {
        lead_time: Duration::from_secs(600),
        retry_interval: Duration::from_secs(3600),
        ..config()
    };
    let solver = ScriptedSolver::new(vec![Step::Fail]);
    let service = Arc::new(SingleOwnerService::default());
    let mut harness = start(config, Some(material(90)), solver, service);

    collect_until(&mut harness.events, started(1)).await;
    harness.controller.force_renewal();

    let events = collect_until(&mut harness.events, |e| {
        matches!(e, LifecycleEvent::RetryScheduled { .. })
    })
    .await;
    assert_eq!(
        events.last(),
        Some(&LifecycleEvent::RetryScheduled { delay_secs: 600 })
    );

    harness.controller.shutdown();
    harness.run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_generation_failure_is_fatal() {
    init_tracing();
    let solver = ScriptedSolver::new(vec![]);
    let harness = start(config(), Some(material(90)), solver, Arc::new(FailingService));
    let state = harness.controller.state();

    let result = tokio::time::timeout(Duration::from_secs(10), harness.run)
        .await
        .unwrap()
        .unwrap();

    match result {
        Err(LifecycleError::Fatal(reason)) => assert!(reason.contains("HTTPS generation failed")),
        other => panic!("expected a fatal error, got {:?}", other),
    }
    assert_eq!(*state.borrow(), LifecycleState::Terminated);
}

#[tokio::test]
async fn test_shutdown_during_challenge() {
    init_tracing();
    let solver = ScriptedSolver::new(vec![Step::Hang]);
    let service = Arc::new(SingleOwnerService::default());
    let mut harness = start(config(), None, solver.clone(), service.clone());

    collect_until(&mut harness.events, |e| {
        *e == LifecycleEvent::StateChanged {
            state: LifecycleState::Obtaining,
        }
    })
    .await;

    harness.controller.shutdown();
    harness.controller.shutdown();
    let report = tokio::time::timeout(Duration::from_secs(10), harness.run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(report.generations, 0);
    assert_eq!(service.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_short_lived_certificate_does_not_renew_in_a_loop() {
    init_tracing();
    // Ten day certificates against the default thirty day lead time
    let solver = ScriptedSolver::new((0..40).map(|_| Step::Issue(10)).collect());
    let service = Arc::new(SingleOwnerService::default());
    let mut harness = start(config(), None, solver.clone(), service.clone());

    let events = collect_until(&mut harness.events, |e| {
        matches!(e, LifecycleEvent::RenewalScheduled { .. })
    })
    .await;
    match events.last() {
        Some(LifecycleEvent::RenewalScheduled { delay_secs }) => {
            let delay = Duration::from_secs(*delay_secs);
            assert!(delay >= 4 * DAY && delay <= 5 * DAY, "delay {:?}", delay);
        }
        other => panic!("expected RenewalScheduled, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(solver.calls(), 1);
    assert_eq!(service.runs.load(Ordering::SeqCst), 1);

    harness.controller.shutdown();
    let report = harness.run.await.unwrap().unwrap();
    assert_eq!(report.renewals, 0);
}

#[tokio::test]
async fn test_forced_renewal_during_challenge_collapses() {
    init_tracing();
    let gate = Arc::new(Notify::new());
    let solver = ScriptedSolver::new(vec![
        Step::Issue(90),
        Step::Gated(gate.clone(), 90),
        Step::Issue(90),
    ]);
    let service = Arc::new(SingleOwnerService::default());
    let mut harness = start(config(), None, solver.clone(), service.clone());

    collect_until(&mut harness.events, started(1)).await;
    assert!(harness.controller.force_renewal());
    collect_until(&mut harness.events, |e| {
        *e == LifecycleEvent::StateChanged {
            state: LifecycleState::Renewing,
        }
    })
    .await;

    // A second request while the first renewal is still running
    assert!(harness.controller.force_renewal());
    gate.notify_one();

    collect_until(&mut harness.events, started(2)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(solver.calls(), 2);
    assert_eq!(*harness.controller.state().borrow(), LifecycleState::Serving);

    harness.controller.shutdown();
    let report = harness.run.await.unwrap().unwrap();
    assert_eq!(
        report,
        LifecycleReport {
            renewals: 1,
            generations: 2
        }
    );
}
