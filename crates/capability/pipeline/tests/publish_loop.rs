use pubsub_pipeline::{
    LoopExit, PayloadPolicy, PipelineError, PublishLoop, PublishLoopConfig,
};
use pubsub_source::FixtureSource;
use pubsub_transport::{
    Connection, ConnectionConfig, ConnectionState, MemoryLink, OutboundMessage, TransportError,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "devices/dev1/messages/events/";

fn loop_config(max_iterations: Option<u64>) -> PublishLoopConfig {
    PublishLoopConfig {
        publisher_id: "Festo".to_string(),
        writer_id: "12345".to_string(),
        payload_field: "Energy".to_string(),
        topic: TOPIC.to_string(),
        interval: Duration::from_secs(1),
        max_iterations,
        ..PublishLoopConfig::default()
    }
}

fn connection(link: &Arc<MemoryLink>, auto_reconnect: bool) -> Connection {
    Connection::new(
        link.clone(),
        None,
        ConnectionConfig {
            client_id: "dev1".to_string(),
            auto_reconnect,
            ..ConnectionConfig::default()
        },
    )
}

fn fixture(lines: &[&str]) -> FixtureSource {
    FixtureSource::from_lines("fixture", lines.iter().copied()).expect("fixture")
}

fn envelope(message: &OutboundMessage) -> Value {
    serde_json::from_slice(&message.payload).expect("json envelope")
}

fn energy(message: &OutboundMessage) -> f64 {
    envelope(message)["Messages"][0]["Payload"]["Energy"]["Body"]
        .as_f64()
        .expect("energy body")
}

#[tokio::test(start_paused = true)]
async fn accumulates_and_publishes_at_fixed_cadence() {
    let link = Arc::new(MemoryLink::new());
    let publish_loop = PublishLoop::new(
        loop_config(Some(3)),
        fixture(&["12.5", "oops", "7.0"]),
        connection(&link, true),
    );

    let started = Instant::now();
    let report = publish_loop
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(report.exit, LoopExit::Completed);
    assert_eq!(report.iterations, 3);
    assert_eq!(report.published, 3);
    assert!(started.elapsed() >= Duration::from_secs(2));

    let sent = link.sent_to(TOPIC);
    let values: Vec<f64> = sent.iter().map(energy).collect();
    assert_eq!(values, vec![12.5, 12.5, 19.5]);

    let ids: Vec<String> = sent
        .iter()
        .map(|message| envelope(message)["MessageId"].as_str().expect("id").to_string())
        .collect();
    assert_eq!(ids, vec!["0", "1", "2"]);

    let first = envelope(&sent[0]);
    assert_eq!(first["MessageType"], "ua-data");
    assert_eq!(first["PublisherId"], "Festo");
    assert_eq!(first["Messages"][0]["DataSetWriterId"], "12345");
    assert_eq!(first["Messages"][0]["Payload"]["Energy"]["Type"], 11);
    assert_eq!(sent[0].content_type.as_deref(), Some("application/json"));
    assert!(sent[0].property("iothub-creation-time-utc").is_some());

    // 结束时总是关闭连接
    assert_eq!(link.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn fixture_wraps_around_between_publishes() {
    let link = Arc::new(MemoryLink::new());
    let mut config = loop_config(Some(4));
    config.policy = PayloadPolicy::Gauge;
    let publish_loop = PublishLoop::new(config, fixture(&["1.0", "2.0", "3.0"]), connection(&link, true));

    publish_loop
        .run(CancellationToken::new())
        .await
        .expect("run");

    let values: Vec<f64> = link.sent_to(TOPIC).iter().map(energy).collect();
    assert_eq!(values, vec![1.0, 2.0, 3.0, 1.0]);
}

#[tokio::test(start_paused = true)]
async fn publish_failure_on_manual_connection_tears_down() {
    let link = Arc::new(MemoryLink::new());
    link.reject_sends(true);
    let publish_loop = PublishLoop::new(loop_config(Some(5)), fixture(&["1.0"]), connection(&link, false));
    let connection = publish_loop.connection().clone();

    let err = publish_loop
        .run(CancellationToken::new())
        .await
        .expect_err("publish failure");

    assert!(matches!(
        err,
        PipelineError::Transport(TransportError::Publish { .. })
    ));
    assert_eq!(link.closes(), 1);
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn publish_failure_on_auto_connection_is_dropped() {
    let link = Arc::new(MemoryLink::new());
    link.reject_sends(true);
    let publish_loop = PublishLoop::new(loop_config(Some(3)), fixture(&["1.0"]), connection(&link, true));

    let report = publish_loop
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(report.iterations, 3);
    assert_eq!(report.published, 0);
    assert_eq!(report.dropped, 3);
    assert_eq!(link.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_disconnect_stops_the_loop() {
    let link = Arc::new(MemoryLink::new());
    let publish_loop = PublishLoop::new(loop_config(None), fixture(&["1.0"]), connection(&link, false));

    let injector = link.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        injector.inject_disconnect("socket closed");
    });

    let report = publish_loop
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(report.exit, LoopExit::Disconnected);
    assert_eq!(report.published, 3);
    assert_eq!(link.open_attempts(), 1);
    assert_eq!(link.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_the_sleep() {
    let link = Arc::new(MemoryLink::new());
    let mut config = loop_config(None);
    config.interval = Duration::from_secs(60);
    let publish_loop = PublishLoop::new(config, fixture(&["1.0"]), connection(&link, true));

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = publish_loop.run(shutdown).await.expect("run");

    assert_eq!(report.exit, LoopExit::Cancelled);
    assert_eq!(report.published, 1);
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(link.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn initial_connect_failure_on_manual_connection_is_fatal() {
    let link = Arc::new(MemoryLink::new());
    link.fail_next_opens(1);
    let publish_loop = PublishLoop::new(loop_config(Some(1)), fixture(&["1.0"]), connection(&link, false));

    let err = publish_loop
        .run(CancellationToken::new())
        .await
        .expect_err("connect failure");

    assert!(matches!(
        err,
        PipelineError::Transport(TransportError::Connect { .. })
    ));
    assert_eq!(link.open_attempts(), 1);
    assert!(link.sent().is_empty());
    assert_eq!(link.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn initial_connect_failure_on_auto_connection_is_retried() {
    let link = Arc::new(MemoryLink::new());
    link.fail_next_opens(1);
    let publish_loop = PublishLoop::new(loop_config(Some(8)), fixture(&["1.0"]), connection(&link, true));

    let started = Instant::now();
    let report = publish_loop
        .run(CancellationToken::new())
        .await
        .expect("run");

    // 重连延迟 5 秒：之前的节拍被丢弃，之后的节拍正常发布
    assert_eq!(report.exit, LoopExit::Completed);
    assert_eq!(report.iterations, 8);
    assert_eq!(report.published + report.dropped, 8);
    assert!(report.dropped >= 5);
    assert!(report.published >= 2);
    assert_eq!(link.open_attempts(), 2);
    assert_eq!(link.opens(), 1);
    assert!(link.open_instants()[0] - started >= Duration::from_secs(5));
    assert_eq!(link.sent_to(TOPIC).len() as u64, report.published);
    assert_eq!(link.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn auto_connection_that_never_connects_stops_when_closed() {
    let link = Arc::new(MemoryLink::new());
    link.fail_next_opens(10);
    let connection = Connection::new(
        link.clone(),
        None,
        ConnectionConfig {
            client_id: "dev1".to_string(),
            max_reconnect_attempts: Some(2),
            ..ConnectionConfig::default()
        },
    );
    let publish_loop = PublishLoop::new(loop_config(None), fixture(&["1.0"]), connection);

    let report = publish_loop
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(report.exit, LoopExit::Closed);
    assert_eq!(report.published, 0);
    assert_eq!(link.open_attempts(), 3);
    assert!(link.sent().is_empty());
}
