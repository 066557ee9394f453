use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use vigil::capture::mock::{MockConnector, MockStep};
use vigil::capture::{Connector, StreamOutcome};
use vigil::display::{FrameSink, HeadlessSink, Overlay};
use vigil::vision::{Capabilities, IdentityMap};
use vigil::{
    Orchestrator, PipelineConfig, StreamEntry, StreamEvent, StreamPhase, StreamResources,
};

fn pipeline() -> PipelineConfig {
    PipelineConfig {
        retry_backoff_ms: 10,
        poll_interval_ms: 20,
        ..PipelineConfig::default()
    }
}

fn resources(connector: impl Connector + 'static) -> StreamResources {
    resources_with(connector, Arc::new(HeadlessSink), None)
}

fn resources_with(
    connector: impl Connector + 'static,
    sink: Arc<dyn FrameSink>,
    events: Option<flume::Sender<StreamEvent>>,
) -> StreamResources {
    StreamResources {
        connector: Arc::new(connector),
        capabilities: Arc::new(Capabilities::disabled(Arc::new(IdentityMap::default()), 100.0)),
        overlay: Arc::new(Overlay::plain()),
        sink,
        events,
    }
}

async fn wait_for(mut done: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_malformed_entries_are_excluded() {
    let entries = vec![
        StreamEntry::new("rtsp://a/1", "A"),
        StreamEntry::new("not-a-url", "B"),
        StreamEntry::new("http://b/2", "C"),
    ];
    let orchestrator = Orchestrator::new(
        &entries,
        &pipeline(),
        resources(MockConnector::streaming(Duration::from_millis(10))),
        CancellationToken::new(),
    );

    let names: Vec<&str> = orchestrator.supervisors().iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["A", "C"]);
    assert_eq!(orchestrator.rejected().len(), 1);
    assert_eq!(orchestrator.rejected()[0].name, "B");
    assert!(orchestrator.supervisor("B").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stopping_one_stream_leaves_others_running() {
    let entries = vec![
        StreamEntry::new("http://cam-a/1", "A"),
        StreamEntry::new("http://cam-b/2", "B"),
        StreamEntry::new("http://cam-c/3", "C"),
    ];
    let mut orchestrator = Orchestrator::new(
        &entries,
        &pipeline(),
        resources(MockConnector::streaming(Duration::from_millis(10))),
        CancellationToken::new(),
    );
    orchestrator.start_all();

    wait_for(
        || {
            orchestrator
                .supervisors()
                .iter()
                .all(|s| s.snapshot().fps > 0.0)
        },
        "all streams to report fps",
    )
    .await;

    let report = orchestrator.stop_stream("B").await.unwrap();
    assert_eq!(report.outcome, StreamOutcome::Stopped);
    assert_eq!(report.final_state.phase, StreamPhase::Stopped);

    let before: Vec<_> = ["A", "C"]
        .iter()
        .map(|n| orchestrator.supervisor(n).unwrap().snapshot().last_frame_timestamp.unwrap())
        .collect();
    tokio::time::sleep(Duration::from_millis(200)).await;

    for (name, before) in ["A", "C"].iter().zip(before) {
        let snapshot = orchestrator.supervisor(name).unwrap().snapshot();
        assert_eq!(snapshot.phase, StreamPhase::Streaming, "stream {name}");
        assert!(snapshot.last_frame_timestamp.unwrap() > before, "stream {name} stalled");
        assert!(snapshot.fps > 0.0);
    }
    assert_eq!(
        orchestrator.supervisor("B").unwrap().phase(),
        StreamPhase::Stopped
    );

    let summary = orchestrator.shutdown_all().await;
    assert_eq!(summary.streams.len(), 3);
    assert!(summary
        .streams
        .iter()
        .all(|r| r.final_state.phase == StreamPhase::Stopped));
    assert_eq!(summary.failed(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_global_shutdown_stops_everything_promptly() {
    let entries = vec![
        StreamEntry::new("http://cam-a/1", "A"),
        StreamEntry::new("http://cam-b/2", "B"),
    ];
    let shutdown = CancellationToken::new();
    let mut orchestrator = Orchestrator::new(
        &entries,
        &pipeline(),
        resources(MockConnector::streaming(Duration::from_millis(10))),
        shutdown.clone(),
    );
    orchestrator.start_all();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let summary = tokio::time::timeout(Duration::from_secs(3), orchestrator.run())
        .await
        .expect("shutdown must finish within the poll interval");
    assert_eq!(summary.streams.len(), 2);
    for report in &summary.streams {
        assert_eq!(report.outcome, StreamOutcome::Stopped);
        assert!(report.frames_processed > 0, "stream {} processed nothing", report.name);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_returns_when_every_stream_failed() {
    let entries = vec![
        StreamEntry::new("http://dead-a/1", "A"),
        StreamEntry::new("http://dead-b/2", "B"),
    ];
    let config = PipelineConfig {
        max_retries: 2,
        ..pipeline()
    };
    let shutdown = CancellationToken::new();
    let mut orchestrator = Orchestrator::new(
        &entries,
        &config,
        resources(MockConnector::scripted([]).then_fail()),
        shutdown.clone(),
    );
    orchestrator.start_all();

    let summary = tokio::time::timeout(Duration::from_secs(5), orchestrator.run())
        .await
        .expect("run must return once every stream has failed");
    assert_eq!(summary.failed(), 2);
    for report in &summary.streams {
        assert!(matches!(report.outcome, StreamOutcome::Failed { attempts: 2, .. }));
    }
    // A failed stream never cancels the global token.
    assert!(!shutdown.is_cancelled());
}

#[tokio::test]
async fn test_run_with_no_valid_streams_returns_immediately() {
    let entries = vec![StreamEntry::new("not-a-url", "B")];
    let mut orchestrator = Orchestrator::new(
        &entries,
        &pipeline(),
        resources(MockConnector::streaming(Duration::from_millis(10))),
        CancellationToken::new(),
    );
    orchestrator.start_all();
    let summary = tokio::time::timeout(Duration::from_secs(1), orchestrator.run())
        .await
        .unwrap();
    assert!(summary.streams.is_empty());
    assert_eq!(summary.rejected.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_then_stream_phase_sequence() {
    let connector = MockConnector::scripted([
        MockStep::ReadError,
        MockStep::ConnectError,
        MockStep::ReadError,
        MockStep::ReadError,
        MockStep::ReadError,
        MockStep::Frame,
    ])
    .then_frames()
    .with_frame_interval(Duration::from_millis(5));
    let (events_tx, events) = flume::unbounded();
    let entries = vec![StreamEntry::new("http://flaky/1", "flaky")];
    // Five failures in a row need a budget above five to recover.
    let config = PipelineConfig {
        max_retries: 6,
        ..pipeline()
    };
    let mut orchestrator = Orchestrator::new(
        &entries,
        &config,
        resources_with(connector, Arc::new(HeadlessSink), Some(events_tx)),
        CancellationToken::new(),
    );
    orchestrator.start_all();

    wait_for(
        || orchestrator.supervisors()[0].phase() == StreamPhase::Streaming,
        "stream to recover",
    )
    .await;
    assert_eq!(orchestrator.supervisors()[0].snapshot().retry_count, 0);
    orchestrator.shutdown_all().await;

    let phases: Vec<StreamPhase> = events
        .try_iter()
        .filter_map(|e| match e {
            StreamEvent::PhaseChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    use StreamPhase::*;
    assert_eq!(
        phases,
        vec![
            Connecting,
            Reconnecting,
            Reconnecting,
            Reconnecting,
            Reconnecting,
            Reconnecting,
            Streaming,
            Stopped
        ]
    );
}
