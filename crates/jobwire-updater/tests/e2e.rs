use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use jobwire_core::{
    BackoffConfig, EndpointConfig, EndpointRole, JobRegistry, MemoryRegistry, ScriptedPoller,
    Subscribe, UpdaterConfig,
};
use jobwire_model::{
    Envelope, EventKind, JobId, JobObservation, JobRecord, JobState, JobUpdate, UpdaterEvent,
};
use jobwire_secure::{Credential, CredentialUsage, NoiseMechanism, channel};
use jobwire_updater::{Collector, Engine, EngineHandle, EndpointState, Received, UpdaterError};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

const AGENT: &str = "/O=Grid/CN=agent";
const LIFETIME: Duration = Duration::from_secs(24 * 3600);
const WAIT: Duration = Duration::from_secs(15);

/// Agent credential trusting every collector, plus each collector's credential trusting the agent.
fn credentials(collectors: &[&str]) -> (Credential, Vec<Credential>) {
    let mut agent = Credential::generate(AGENT, CredentialUsage::Initiate, LIFETIME).unwrap();
    let agent_key = agent.public_key().to_vec();
    let mut out = Vec::new();
    for name in collectors {
        let c = Credential::generate(*name, CredentialUsage::Accept, LIFETIME).unwrap();
        agent = agent.with_trusted(*name, c.public_key());
        out.push(c.with_trusted(AGENT, &agent_key));
    }
    (agent, out)
}

fn fast_config(endpoints: Vec<EndpointConfig>) -> UpdaterConfig {
    UpdaterConfig {
        query_interval_secs: 1,
        final_query_interval_secs: 1,
        connect_timeout_secs: 2,
        handshake_timeout_secs: 2,
        backoff: BackoffConfig {
            first_ms: 50,
            max_ms: 200,
            factor: 2.0,
        },
        endpoints,
        ..UpdaterConfig::default()
    }
}

fn registered(ids: &[&str]) -> MemoryRegistry {
    let at = SystemTime::now() - Duration::from_secs(60);
    MemoryRegistry::with_records(ids.iter().map(|id| JobRecord::new(*id, JobState::Idle, at)))
}

fn observe(id: &str, state: JobState) -> JobObservation {
    JobObservation::new(id, state, SystemTime::now())
}

async fn start_collector(
    collector: Collector,
) -> (String, mpsc::Receiver<Received>, CancellationToken) {
    let addr = collector.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    tokio::spawn(collector.serve(tx, cancel.clone()));
    (addr, rx, cancel)
}

fn spawn_engine(
    config: UpdaterConfig,
    agent: Credential,
    registry: MemoryRegistry,
    poller: &ScriptedPoller,
    subscriber: Option<Arc<dyn Subscribe>>,
) -> (EngineHandle, CancellationToken, JoinHandle<Result<(), UpdaterError>>) {
    let mut builder = Engine::builder(config, agent, registry, Arc::new(poller.clone()))
        .with_origin("ce01.example.org");
    if let Some(sub) = subscriber {
        builder = builder.with_subscriber(sub);
    }
    let (engine, handle) = builder.build().unwrap();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(engine.run(cancel.clone()));
    (handle, cancel, task)
}

async fn next(rx: &mut mpsc::Receiver<Received>) -> Received {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an update")
        .expect("collector channel closed")
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[derive(Default)]
struct Recorder {
    kinds: Mutex<Vec<EventKind>>,
}

#[async_trait]
impl Subscribe for Recorder {
    async fn on_event(&self, event: &UpdaterEvent) {
        self.kinds.lock().unwrap().push(event.kind);
    }

    fn name(&self) -> &'static str {
        "recorder"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transitions_reach_every_collector_in_order() {
    let (agent, collectors) = credentials(&["/CN=collector-a", "/CN=collector-b"]);
    let mut collectors = collectors.into_iter();
    let a = Collector::bind("127.0.0.1:0", collectors.next().unwrap()).await.unwrap();
    let b = Collector::bind("127.0.0.1:0", collectors.next().unwrap()).await.unwrap();
    let (addr_a, mut rx_a, stop_a) = start_collector(a.with_expected_peer(AGENT)).await;
    let (addr_b, mut rx_b, stop_b) = start_collector(b).await;

    let poller = ScriptedPoller::new();
    poller.push_snapshot(vec![observe("J1", JobState::Running)]);
    poller.push_snapshot(vec![observe("J1", JobState::Completed)]);

    let registry = registered(&["J1"]);
    let recorder = Arc::new(Recorder::default());
    let config = fast_config(vec![
        EndpointConfig::new("a", addr_a).with_peer_name("/CN=collector-a"),
        EndpointConfig::new("b", addr_b).with_peer_name("/CN=collector-b"),
    ]);
    let (handle, cancel, task) =
        spawn_engine(config, agent, registry.clone(), &poller, Some(recorder.clone()));

    for rx in [&mut rx_a, &mut rx_b] {
        let first = next(rx).await;
        assert_eq!(first.peer, AGENT);
        assert_eq!(first.update.origin, "ce01.example.org");
        assert_eq!(
            (first.update.job_id.as_str(), first.update.state, first.update.revision),
            ("J1", JobState::Running, 1)
        );
        let second = next(rx).await;
        assert_eq!(
            (second.update.state, second.update.revision),
            (JobState::Completed, 2)
        );
        assert!(second.update.seq > first.update.seq);
    }

    eventually("acknowledgements in the registry", || {
        let record = registry.get(&JobId::from("J1")).unwrap().unwrap();
        record.delivery("a").acked_revision == 2 && record.delivery("b").acked_revision == 2
    })
    .await;

    let status = handle.status().await.unwrap();
    assert_eq!(status.len(), 2);
    assert!(status.iter().all(|s| s.queue_depth == 0 && s.unacked == 0));

    cancel.cancel();
    task.await.unwrap().unwrap();
    stop_a.cancel();
    stop_b.cancel();

    let kinds = recorder.kinds.lock().unwrap().clone();
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::JobTransition).count(), 2);
    assert!(kinds.contains(&EventKind::EndpointReady));
    assert!(kinds.contains(&EventKind::UpdateAcked));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn order_survives_a_dropped_connection() {
    let jobs = ["J1", "J2", "J3", "J4", "J5"];
    let (agent, collectors) = credentials(&["/CN=collector"]);
    let collector = Collector::bind("127.0.0.1:0", collectors.into_iter().next().unwrap())
        .await
        .unwrap()
        .disconnect_after(2);
    let (addr, mut rx, stop) = start_collector(collector).await;

    let poller = ScriptedPoller::new();
    poller.push_snapshot(jobs.iter().map(|id| observe(id, JobState::Running)).collect());

    let config = fast_config(vec![
        EndpointConfig::new("central", addr).with_peer_name("/CN=collector"),
    ]);
    let (_handle, cancel, task) = spawn_engine(config, agent, registered(&jobs), &poller, None);

    let mut per_connection: Vec<(u64, Vec<usize>)> = Vec::new();
    let mut seen = BTreeSet::new();
    while seen.len() < jobs.len() {
        let got = next(&mut rx).await;
        let idx = jobs
            .iter()
            .position(|j| *j == got.update.job_id.as_str())
            .unwrap();
        seen.insert(idx);
        match per_connection.last_mut() {
            Some((conn, list)) if *conn == got.connection => list.push(idx),
            _ => per_connection.push((got.connection, vec![idx])),
        }
    }

    assert!(per_connection.len() >= 2, "expected a reconnect: {per_connection:?}");
    assert_eq!(per_connection[0].1, vec![0, 1]);
    for (conn, list) in &per_connection {
        assert!(
            list.windows(2).all(|w| w[1] == w[0] + 1),
            "connection {conn} delivered out of order: {list:?}"
        );
    }
    let resumed = per_connection[1].1[0];
    assert!(resumed <= 2, "update J3 was skipped: {per_connection:?}");

    cancel.cancel();
    task.await.unwrap().unwrap();
    stop.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delegated_collector_identity_is_accepted() {
    let (agent, collectors) = credentials(&["host/CN=proxy"]);
    let collector = Collector::bind("127.0.0.1:0", collectors.into_iter().next().unwrap())
        .await
        .unwrap();
    let (addr, mut rx, stop) = start_collector(collector).await;

    let poller = ScriptedPoller::new();
    poller.push_snapshot(vec![observe("J1", JobState::Running)]);
    let config = fast_config(vec![EndpointConfig::new("central", addr).with_peer_name("host")]);
    let (_handle, cancel, task) = spawn_engine(config, agent, registered(&["J1"]), &poller, None);

    let got = next(&mut rx).await;
    assert_eq!(got.update.job_id.as_str(), "J1");

    cancel.cancel();
    task.await.unwrap().unwrap();
    stop.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mismatched_collector_never_sees_data() {
    let (agent, collectors) = credentials(&["host/CN=proxy"]);
    let collector = Collector::bind("127.0.0.1:0", collectors.into_iter().next().unwrap())
        .await
        .unwrap();
    let (addr, mut rx, stop) = start_collector(collector).await;

    let poller = ScriptedPoller::new();
    poller.push_snapshot(vec![observe("J1", JobState::Running)]);
    let config = fast_config(vec![
        EndpointConfig::new("central", addr).with_peer_name("otherhost"),
    ]);
    let (handle, cancel, task) = spawn_engine(config, agent, registered(&["J1"]), &poller, None);

    assert!(timeout(Duration::from_millis(1500), rx.recv()).await.is_err());

    let status = handle.status().await.unwrap();
    assert!(status[0].consecutive_failures >= 1);
    assert_eq!(status[0].queue_depth, 1);
    assert!(
        status[0]
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("otherhost")),
        "unexpected status: {:?}",
        status[0]
    );

    cancel.cancel();
    task.await.unwrap().unwrap();
    stop.cancel();
}

async fn unreachable_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn purge_waits_for_unreachable_endpoint_budget() {
    let addr = unreachable_address().await;

    let run = |budget: u32| {
        let (agent, _) = credentials(&[]);
        let poller = ScriptedPoller::new();
        poller.push_snapshot(vec![observe("J1", JobState::Completed)]);
        let registry = registered(&["J1"]);
        let config = UpdaterConfig {
            purge_interval_secs: 1,
            max_delivery_attempts: budget,
            ..fast_config(vec![EndpointConfig::new("central", addr.clone())])
        };
        let (_handle, cancel, task) = spawn_engine(config, agent, registry.clone(), &poller, None);
        (registry, cancel, task)
    };

    let (kept, cancel_kept, task_kept) = run(1_000);
    let (purged, cancel_purged, task_purged) = run(2);

    eventually("purge after the delivery budget", || purged.is_empty()).await;

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let record = kept.get(&JobId::from("J1")).unwrap().unwrap();
    assert_eq!(record.state, JobState::Completed);
    assert!(record.delivery("central").failures >= 1);

    for (cancel, task) in [(cancel_kept, task_kept), (cancel_purged, task_purged)] {
        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconfiguration_adds_an_endpoint_and_rejects_empty_lists() {
    let (agent, collectors) = credentials(&["/CN=collector"]);
    let collector = Collector::bind("127.0.0.1:0", collectors.into_iter().next().unwrap())
        .await
        .unwrap();
    let (addr, mut rx, stop) = start_collector(collector).await;
    let dead = EndpointConfig::new("dead", unreachable_address().await);

    let poller = ScriptedPoller::new();
    poller.push_snapshot(vec![observe("J1", JobState::Running)]);
    let config = fast_config(vec![dead.clone()]);
    let (handle, cancel, task) = spawn_engine(config, agent, registered(&["J1"]), &poller, None);

    until_queued(&handle).await;

    let live = EndpointConfig::new("live", addr).with_peer_name("/CN=collector");
    handle.reconfigure(vec![dead, live]).await.unwrap();
    let got = next(&mut rx).await;
    assert_eq!((got.update.job_id.as_str(), got.update.revision), ("J1", 1));

    let status = handle.status().await.unwrap();
    assert_eq!(
        status.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
        ["dead", "live"]
    );
    assert_eq!(status[0].queue_depth + status[0].unacked, 1);

    assert!(matches!(
        handle.reconfigure(Vec::new()).await,
        Err(UpdaterError::Config(_))
    ));

    cancel.cancel();
    task.await.unwrap().unwrap();
    stop.cancel();
}

/// Wait until the first endpoint holds the J1 update.
async fn until_queued(handle: &EngineHandle) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = handle.status().await.unwrap();
        if status[0].queue_depth + status[0].unacked > 0 {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "update never queued");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn expired_credential_is_fatal() {
    let agent = Credential::generate(AGENT, CredentialUsage::Initiate, Duration::ZERO).unwrap();
    let config = fast_config(vec![EndpointConfig::new("central", "127.0.0.1:9")]);
    let (engine, _handle) =
        Engine::builder(config, agent, MemoryRegistry::new(), Arc::new(ScriptedPoller::new()))
            .build()
            .unwrap();

    let res = engine.run(CancellationToken::new()).await;
    assert!(matches!(res, Err(UpdaterError::Credential(_))));
}

const HUB: &str = "/O=Grid/CN=hub";
const PEER: &str = "/O=Grid/CN=ce02";

fn peer_update(seq: u64, job: &str, revision: u64, state: JobState) -> JobUpdate {
    JobUpdate {
        seq,
        origin: "ce02.example.org".into(),
        job_id: JobId::from(job),
        revision,
        state,
        timestamp: SystemTime::now(),
        exit_info: None,
    }
}

/// Connect to the hub as `cred` and authenticate.
async fn connect_peer(
    addr: std::net::SocketAddr,
    cred: &Credential,
) -> (TcpStream, jobwire_secure::SecurityContext) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let ctx = channel::initiate(&NoiseMechanism, cred, HUB, &mut stream, WAIT)
        .await
        .unwrap();
    (stream, ctx)
}

async fn send(stream: &mut TcpStream, ctx: &mut jobwire_secure::SecurityContext, envelope: Envelope) {
    channel::wrap_and_send(ctx, &envelope.to_bytes().unwrap(), stream)
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_updates_are_applied_acknowledged_and_relayed() {
    let hub = Credential::generate(HUB, CredentialUsage::Both, LIFETIME).unwrap();
    let peer = Credential::generate(PEER, CredentialUsage::Initiate, LIFETIME).unwrap();
    let intruder = Credential::generate("/O=Grid/CN=intruder", CredentialUsage::Initiate, LIFETIME)
        .unwrap();
    let collector = Credential::generate("/CN=collector", CredentialUsage::Accept, LIFETIME).unwrap();

    let hub_key = hub.public_key().to_vec();
    let hub = hub
        .with_trusted(PEER, peer.public_key())
        .with_trusted("/O=Grid/CN=intruder", intruder.public_key())
        .with_trusted("/CN=collector", collector.public_key());
    let peer = peer.with_trusted(HUB, &hub_key);
    let intruder = intruder.with_trusted(HUB, &hub_key);
    let collector = collector.with_trusted(HUB, &hub_key);

    let collector = Collector::bind("127.0.0.1:0", collector).await.unwrap();
    let (collector_addr, mut rx, stop) = start_collector(collector).await;

    let registry = MemoryRegistry::new();
    let recorder = Arc::new(Recorder::default());
    let config = fast_config(vec![
        EndpointConfig::acceptor("peers", "127.0.0.1:0").with_peer_name(PEER),
        EndpointConfig::new("central", collector_addr).with_peer_name("/CN=collector"),
    ]);
    let (handle, cancel, task) = spawn_engine(
        config,
        hub,
        registry.clone(),
        &ScriptedPoller::new(),
        Some(recorder.clone()),
    );

    let deadline = tokio::time::Instant::now() + WAIT;
    let listening = loop {
        let status = handle.status().await.unwrap();
        assert_eq!(status[0].role, EndpointRole::Acceptor);
        if let Some(addr) = status[0].listening {
            assert_eq!(status[0].state, EndpointState::Listening);
            break addr;
        }
        assert!(tokio::time::Instant::now() < deadline, "acceptor never listened");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    // An identity other than the configured peer is dropped before anything is applied.
    let (mut stream, mut ctx) = connect_peer(listening, &intruder).await;
    let bytes = Envelope::Update(peer_update(1, "J9", 1, JobState::Running)).to_bytes().unwrap();
    let _ = channel::wrap_and_send(&mut ctx, &bytes, &mut stream).await;
    assert!(channel::receive_and_unwrap(&mut ctx, &mut stream).await.is_err());
    drop(stream);

    let (mut stream, mut ctx) = connect_peer(listening, &peer).await;
    send(&mut stream, &mut ctx, Envelope::Update(peer_update(1, "J7", 1, JobState::Running))).await;
    let ack = channel::receive_and_unwrap(&mut ctx, &mut stream).await.unwrap();
    assert_eq!(Envelope::from_bytes(ack.as_bytes()).unwrap(), Envelope::Ack { seq: 1 });

    send(&mut stream, &mut ctx, Envelope::Update(peer_update(2, "J7", 2, JobState::Completed))).await;
    let ack = channel::receive_and_unwrap(&mut ctx, &mut stream).await.unwrap();
    assert_eq!(Envelope::from_bytes(ack.as_bytes()).unwrap(), Envelope::Ack { seq: 2 });

    // A late non-terminal report is rejected by the record but still acknowledged.
    send(&mut stream, &mut ctx, Envelope::Update(peer_update(3, "J7", 3, JobState::Running))).await;
    let ack = channel::receive_and_unwrap(&mut ctx, &mut stream).await.unwrap();
    assert_eq!(Envelope::from_bytes(ack.as_bytes()).unwrap(), Envelope::Ack { seq: 3 });

    let record = registry.get(&JobId::from("J7")).unwrap().unwrap();
    assert_eq!((record.state, record.revision), (JobState::Completed, 2));
    assert!(registry.get(&JobId::from("J9")).unwrap().is_none());

    let first = next(&mut rx).await;
    assert_eq!(first.peer, HUB);
    assert_eq!(first.update.origin, "ce01.example.org");
    assert_eq!(
        (first.update.job_id.as_str(), first.update.state, first.update.revision),
        ("J7", JobState::Running, 1)
    );
    let second = next(&mut rx).await;
    assert_eq!((second.update.state, second.update.revision), (JobState::Completed, 2));

    drop(stream);
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = handle.status().await.unwrap();
        if status[0].state == EndpointState::Listening {
            assert_eq!(status[0].listening, Some(listening));
            assert_eq!(status[0].consecutive_failures, 0);
            assert!(!status[0].stale);
            assert_eq!(status[0].queue_depth, 0);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "acceptor never went back to listening");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancel.cancel();
    task.await.unwrap().unwrap();
    stop.cancel();

    let kinds = recorder.kinds.lock().unwrap().clone();
    assert!(kinds.contains(&EventKind::EndpointListening));
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::UpdateReceived).count(), 3);
    assert!(kinds.contains(&EventKind::TransitionRejected));
}

#[tokio::test]
async fn acceptor_needs_an_accepting_credential() {
    let agent = Credential::generate(AGENT, CredentialUsage::Initiate, LIFETIME).unwrap();
    let config = fast_config(vec![EndpointConfig::acceptor("peers", "127.0.0.1:0")]);
    let res = Engine::builder(config, agent, MemoryRegistry::new(), Arc::new(ScriptedPoller::new()))
        .build();
    assert!(matches!(res, Err(UpdaterError::Credential(_))));
}
