//! End-to-end batches through the coordinator with scripted devices.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lockstep_core::app::steps::{Click, LaunchApp, TextSource, TypeText, WaitForElement};
use lockstep_core::app::{JobRegistry, ReadinessPolicy, Step, WorkerCoordinator};
use lockstep_core::config::{BarrierTimeoutPolicy, CoordinatorConfig, ReadinessConfig, RegistryConfig};
use lockstep_core::domain::{
    JobStatus, LockstepError, PairId, PairStatus, ParticipantId, ParticipantStatus, RunId, StepStatus,
};
use lockstep_core::impls::{InMemoryBarrier, MemorySink, ScriptedConnector, ScriptedControlAgent, ScriptedDevice};
use lockstep_core::ports::{DeviceCapability, PairSpec, ParticipantSpec, Selector, SystemClock};
use lockstep_core::CancelToken;

const CHAT: &str = "com.example.chat";

fn input() -> Selector {
    Selector::ResourceId("chat_input".into())
}

fn send() -> Selector {
    Selector::Description("Send".into())
}

fn chat_script(
    participant: &ParticipantSpec,
    device: Arc<dyn DeviceCapability>,
) -> Result<Vec<Arc<dyn Step>>, LockstepError> {
    Ok(vec![
        Arc::new(LaunchApp::new(device.clone(), CHAT)),
        Arc::new(WaitForElement::new(device.clone(), input(), Duration::from_secs(2))),
        Arc::new(TypeText::new(
            device.clone(),
            input(),
            TextSource::Literal(format!("hi from {}", participant.id)),
        )),
        Arc::new(Click::new(device, send())),
    ])
}

fn chat_device(serial: &str) -> ScriptedDevice {
    ScriptedDevice::new(serial).with_app(CHAT, [input(), send()])
}

fn pair(name: &str) -> PairSpec {
    PairSpec {
        pair_id: PairId::new(name),
        participants: ["a", "b"]
            .iter()
            .enumerate()
            .map(|(i, side)| ParticipantSpec {
                id: ParticipantId::new(format!("{name}-{side}")),
                endpoint: format!("10.0.0.{}:5555", i + 1),
            })
            .collect(),
    }
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        stagger_ms: 10,
        stagger_jitter_ms: 5,
        pre_barrier_timeout_ms: 2_000,
        post_barrier_timeout_ms: 2_000,
        batch_timeout_ms: 10_000,
        liveness_interval_ms: 20,
        ..CoordinatorConfig::default()
    }
}

fn fast_readiness() -> ReadinessPolicy {
    ReadinessPolicy::from(&ReadinessConfig {
        retries: 1,
        settle_delay_ms: 5,
        readiness_timeout_ms: 50,
        probe_interval_ms: 5,
        backoff_ms: 5,
    })
}

struct Harness {
    coordinator: WorkerCoordinator,
    registry: Arc<JobRegistry>,
    connector: Arc<ScriptedConnector>,
    sink: Arc<MemorySink>,
}

fn harness(connector: ScriptedConnector, config: CoordinatorConfig) -> Harness {
    let sink = Arc::new(MemorySink::new());
    let registry = JobRegistry::new(RegistryConfig::default(), Arc::new(SystemClock), sink.clone());
    let barrier = Arc::new(InMemoryBarrier::new(
        Arc::new(SystemClock),
        Duration::from_secs(600),
        Duration::from_millis(25),
    ));
    let connector = Arc::new(connector);
    let coordinator = WorkerCoordinator::new(
        Arc::clone(&registry),
        barrier,
        connector.clone(),
        Arc::new(chat_script),
        config,
    )
    .with_readiness(fast_readiness())
    .with_sink(sink.clone());

    Harness {
        coordinator,
        registry,
        connector,
        sink,
    }
}

#[tokio::test]
async fn two_pairs_complete_together() {
    let connector = ScriptedConnector::new()
        .with_device("p1-a", chat_device("p1-a"))
        .with_device("p1-b", chat_device("p1-b"))
        .with_device("p2-a", chat_device("p2-a"))
        .with_device("p2-b", chat_device("p2-b"));
    let h = harness(connector, fast_config());

    let report = h
        .coordinator
        .run_batch(RunId::new(), vec![pair("p1"), pair("p2")], &CancelToken::new())
        .await;

    assert_eq!(report.pairs.len(), 2);
    assert_eq!(report.count(PairStatus::Completed), 2);
    for outcome in &report.pairs {
        assert!(outcome.error.is_none());
        assert!(outcome.hung.is_empty());
        for p in &outcome.participants {
            assert_eq!(p.status, ParticipantStatus::Completed);
            assert!(!p.is_degraded());
            assert!(p.steps.iter().all(|s| s.status == StepStatus::Completed));
        }

        let job = h.registry.get_job(outcome.job_id.unwrap()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(!h.registry.is_pair_running(&outcome.pair_id));
    }

    let device = h.connector.device(&ParticipantId::new("p1-b")).unwrap();
    assert_eq!(
        device.actions(),
        vec![
            format!("launch {CHAT}"),
            "type resource-id=chat_input hi from p1-b".to_string(),
            "click description=Send".to_string(),
        ]
    );
    assert_eq!(h.sink.metric("pairs.completed"), 2.0);
    assert_eq!(h.sink.metric("jobs.completed"), 2.0);
    assert_eq!(h.connector.disconnected().len(), 4);
}

#[tokio::test]
async fn one_failing_participant_gives_partial_success() {
    let connector = ScriptedConnector::new()
        .with_device("p1-a", chat_device("p1-a"))
        .with_device("p1-b", chat_device("p1-b").failing_on(send()));
    let h = harness(connector, fast_config());

    let report = h
        .coordinator
        .run_batch(RunId::new(), vec![pair("p1")], &CancelToken::new())
        .await;

    let outcome = report.pair(&PairId::new("p1")).unwrap();
    assert_eq!(outcome.status, PairStatus::PartialSuccess);
    assert!(outcome.error.as_deref().unwrap().contains("p1-b"));

    let failed = outcome
        .participants
        .iter()
        .find(|p| p.participant.as_str() == "p1-b")
        .unwrap();
    assert_eq!(failed.status, ParticipantStatus::Failed);
    assert_eq!(failed.steps[3].status, StepStatus::Failed);
    // 失敗した側も post バリアに到着するので相手は待たされない
    let peer = outcome
        .participants
        .iter()
        .find(|p| p.participant.as_str() == "p1-a")
        .unwrap();
    assert!(!peer.post_barrier_timed_out);
}

#[tokio::test]
async fn unreachable_participant_fails_the_connection() {
    let connector = ScriptedConnector::new().unreachable("p1-b");
    let h = harness(connector, fast_config());

    let report = h
        .coordinator
        .run_batch(RunId::new(), vec![pair("p1")], &CancelToken::new())
        .await;

    let outcome = &report.pairs[0];
    assert_eq!(outcome.status, PairStatus::ConnectionFailed);
    assert!(outcome.error.as_deref().unwrap().contains("p1-b"));
    assert_eq!(h.connector.disconnected(), vec![ParticipantId::new("p1-a")]);

    let job = h.registry.get_job(outcome.job_id.unwrap()).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(!h.registry.is_pair_running(&PairId::new("p1")));
    assert_eq!(h.sink.metric("pairs.connection_failed"), 1.0);
}

#[tokio::test]
async fn exhausted_readiness_fails_the_pair() {
    let connector = ScriptedConnector::new().with_agent("p1-a", ScriptedControlAgent::failing("10.0.0.1:5555", 10));
    let h = harness(connector, fast_config());

    let report = h
        .coordinator
        .run_batch(RunId::new(), vec![pair("p1")], &CancelToken::new())
        .await;

    let outcome = &report.pairs[0];
    assert_eq!(outcome.status, PairStatus::Failed);
    let error = outcome.error.as_deref().unwrap();
    assert!(error.contains("10.0.0.1:5555"));
    assert!(error.contains("2 attempts"));
    assert!(outcome.participants.is_empty());

    let agent = h.connector.agent(&ParticipantId::new("p1-a")).unwrap();
    assert_eq!(agent.start_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(h.registry.get_job(outcome.job_id.unwrap()).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn busy_pair_is_reported_without_a_job() {
    let h = harness(ScriptedConnector::new(), fast_config());
    let existing = h
        .registry
        .create_job(RunId::new(), PairId::new("p1"), Vec::new(), BTreeMap::new())
        .unwrap();

    let report = h
        .coordinator
        .run_batch(RunId::new(), vec![pair("p1")], &CancelToken::new())
        .await;

    let outcome = &report.pairs[0];
    assert_eq!(outcome.status, PairStatus::Failed);
    assert!(outcome.job_id.is_none());
    assert!(outcome.error.as_deref().unwrap().contains("already running"));
    assert_eq!(h.registry.get_pair_job(&PairId::new("p1")).unwrap().job_id, existing);
}

fn late_start_config(policy: BarrierTimeoutPolicy) -> CoordinatorConfig {
    CoordinatorConfig {
        // the second participant arrives long after the first one's deadline
        stagger_ms: 400,
        stagger_jitter_ms: 0,
        pre_barrier_timeout_ms: 100,
        post_barrier_timeout_ms: 100,
        barrier_timeout_policy: policy,
        readiness_enabled: false,
        ..fast_config()
    }
}

#[tokio::test]
async fn barrier_timeout_proceeds_degraded_by_default() {
    let connector = ScriptedConnector::new()
        .with_device("p1-a", chat_device("p1-a"))
        .with_device("p1-b", chat_device("p1-b"));
    let h = harness(connector, late_start_config(BarrierTimeoutPolicy::Proceed));

    let report = h
        .coordinator
        .run_batch(RunId::new(), vec![pair("p1")], &CancelToken::new())
        .await;

    let outcome = &report.pairs[0];
    assert_eq!(outcome.status, PairStatus::Completed);
    for p in &outcome.participants {
        assert_eq!(p.status, ParticipantStatus::Completed);
        assert!(p.pre_barrier_timed_out, "{} not flagged", p.participant);
    }
}

#[tokio::test]
async fn barrier_timeout_aborts_under_abort_policy() {
    let connector = ScriptedConnector::new()
        .with_device("p1-a", chat_device("p1-a"))
        .with_device("p1-b", chat_device("p1-b"));
    let h = harness(connector, late_start_config(BarrierTimeoutPolicy::Abort));

    let report = h
        .coordinator
        .run_batch(RunId::new(), vec![pair("p1")], &CancelToken::new())
        .await;

    let outcome = &report.pairs[0];
    assert_eq!(outcome.status, PairStatus::Failed);
    assert!(outcome.error.as_deref().unwrap().contains("timed out"));
    // 何も実行していない
    let device = h.connector.device(&ParticipantId::new("p1-a")).unwrap();
    assert!(device.actions().is_empty());
}

#[tokio::test]
async fn hung_workers_are_reported_at_the_batch_deadline() {
    let connector = ScriptedConnector::new()
        .with_device("p1-a", chat_device("p1-a").with_latency(Duration::from_secs(30)))
        .with_device("p1-b", chat_device("p1-b").with_latency(Duration::from_secs(30)));
    let h = harness(
        connector,
        CoordinatorConfig {
            batch_timeout_ms: 300,
            readiness_enabled: false,
            ..fast_config()
        },
    );

    let started = std::time::Instant::now();
    let report = h
        .coordinator
        .run_batch(RunId::new(), vec![pair("p1")], &CancelToken::new())
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    let outcome = &report.pairs[0];
    assert_eq!(outcome.status, PairStatus::Failed);
    assert_eq!(outcome.hung.len(), 2);
    assert!(!h.registry.is_pair_running(&PairId::new("p1")));
}

#[tokio::test]
async fn cancelling_the_batch_stops_every_pair() {
    let connector = ScriptedConnector::new()
        .with_device("p1-a", chat_device("p1-a").with_latency(Duration::from_millis(200)))
        .with_device("p1-b", chat_device("p1-b").with_latency(Duration::from_millis(200)));
    let h = harness(
        connector,
        CoordinatorConfig {
            readiness_enabled: false,
            ..fast_config()
        },
    );

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.signal();
    });

    let report = h
        .coordinator
        .run_batch(RunId::new(), vec![pair("p1")], &cancel)
        .await;

    let outcome = &report.pairs[0];
    assert!(outcome.participants.iter().all(|p| p.status == ParticipantStatus::Stopped));
    let job = h.registry.get_job(outcome.job_id.unwrap()).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(!h.registry.is_pair_running(&PairId::new("p1")));
}
