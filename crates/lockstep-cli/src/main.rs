use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal;
use tokio::time::Duration;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

use lockstep_core::app::steps::{Click, LaunchApp, PressKey, Swipe, TextSource, TypeText, WaitForElement};
use lockstep_core::app::{JobRegistry, ReadinessPolicy, Step, WorkerCoordinator};
use lockstep_core::domain::{LockstepError, PairId, ParticipantId, RunId};
use lockstep_core::impls::{FileBarrier, InMemoryBarrier, ScriptedConnector, ScriptedDevice, TracingSink};
use lockstep_core::ports::{
    Barrier, DeviceCapability, KeyCode, PairSpec, ParticipantSpec, Point, Selector, SystemClock,
};
use lockstep_core::{CancelToken, LockstepConfig};

const CHAT: &str = "com.example.chat";

/// Runs one coordinated batch against scripted devices.
#[derive(Parser, Debug)]
#[command(name = "lockstep")]
#[command(version = "0.1.0")]
#[command(about = "Coordinated multi-device batch runner (demo)", long_about = None)]
struct Args {
    /// JSON config file (defaults are used for missing fields)
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON file with a list of pairs; two demo pairs when omitted
    #[arg(long)]
    pairs: Option<PathBuf>,

    /// Share barrier state through this directory instead of memory
    #[arg(long)]
    barrier_dir: Option<PathBuf>,

    /// Participant whose send button is broken (repeatable)
    #[arg(long)]
    fail_participant: Vec<String>,

    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

fn input() -> Selector {
    Selector::ResourceId("chat_input".into())
}

fn send() -> Selector {
    Selector::Description("Send".into())
}

/// 各参加者のスクリプト：アプリ起動 → 入力 → 送信 → スクロール → ホーム
fn chat_script(
    participant: &ParticipantSpec,
    device: Arc<dyn DeviceCapability>,
) -> Result<Vec<Arc<dyn Step>>, LockstepError> {
    let message = format!("hello from {}", participant.id);
    Ok(vec![
        Arc::new(LaunchApp::new(device.clone(), CHAT)),
        Arc::new(WaitForElement::new(device.clone(), input(), Duration::from_secs(5))),
        Arc::new(TypeText::new(device.clone(), input(), TextSource::Literal(message))),
        Arc::new(Click::new(device.clone(), send())),
        Arc::new(Swipe::new(
            device.clone(),
            Point::new(540, 1600),
            Point::new(540, 600),
            Duration::from_millis(300),
        )),
        Arc::new(PressKey::new(device, KeyCode::Home)),
    ])
}

fn demo_pairs() -> Vec<PairSpec> {
    (1..=2)
        .map(|n| PairSpec {
            pair_id: PairId::new(format!("pair-{n}")),
            participants: ["a", "b"]
                .iter()
                .enumerate()
                .map(|(i, side)| ParticipantSpec {
                    id: ParticipantId::new(format!("dev{n}{side}")),
                    endpoint: format!("192.168.5.{}:5555", 70 + n * 2 + i),
                })
                .collect(),
        })
        .collect()
}

fn load_pairs(path: Option<&PathBuf>) -> Result<Vec<PairSpec>> {
    let Some(path) = path else {
        return Ok(demo_pairs());
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn connector(pairs: &[PairSpec], failing: &[String]) -> ScriptedConnector {
    let mut connector = ScriptedConnector::new();
    for spec in pairs.iter().flat_map(|p| &p.participants) {
        let mut device = ScriptedDevice::new(spec.endpoint.clone())
            .with_app(CHAT, [input(), send()])
            .with_latency(Duration::from_millis(50));
        if failing.iter().any(|f| f == spec.id.as_str()) {
            device = device.failing_on(send());
        }
        connector = connector.with_device(spec.id.clone(), device);
    }
    connector
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::from(args.log_level).into()))
        .init();

    // (A) 設定とペア
    let config = match &args.config {
        Some(path) => LockstepConfig::load(path)?,
        None => LockstepConfig::default(),
    };
    let pairs = load_pairs(args.pairs.as_ref())?;

    // (B) レジストリとバリア
    let clock = Arc::new(SystemClock);
    let registry = JobRegistry::new(config.registry.clone(), clock.clone(), Arc::new(TracingSink));
    let barrier_dir = args.barrier_dir.clone().or_else(|| config.barrier.directory.clone());
    let barrier: Arc<dyn Barrier> = match barrier_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "using file barrier");
            Arc::new(FileBarrier::new(dir, clock.clone(), &config.barrier)?)
        }
        None => Arc::new(
            InMemoryBarrier::new(
                clock.clone(),
                config.barrier.stale_after(),
                config.barrier.poll_interval(),
            )
            .with_settle_grace(config.barrier.settle_grace()),
        ),
    };

    // (C) コーディネータ
    let coordinator = WorkerCoordinator::new(
        Arc::clone(&registry),
        barrier,
        Arc::new(connector(&pairs, &args.fail_participant)),
        Arc::new(chat_script),
        config.coordinator.clone(),
    )
    .with_readiness(ReadinessPolicy::from(&config.readiness));

    // (D) Ctrl-C でバッチを止める
    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling batch");
            on_signal.signal();
        }
    });

    let run_id = RunId::new();
    let report = coordinator.run_batch(run_id, pairs, &cancel).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    info!(counts = ?registry.counts(), "registry");

    // (E) 後片付け
    registry
        .shutdown(config.registry.default_cancel_timeout())
        .await;
    Ok(())
}
