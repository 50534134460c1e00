//! 遥测发布进程：读取数据源，按固定节拍把信封发布到云端 broker。

mod wiring;

use pubsub_config::{AppConfig, SourceKind};
use pubsub_pipeline::{LoopReport, PipelineError, PublishLoop, PublishLoopConfig};
use pubsub_source::{DataSource, FixtureSource};
use pubsub_telemetry::{init_tracing, metrics};
use pubsub_transport::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = AppConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();
    info!(
        target: "pubsub.app",
        transport = ?config.transport,
        broker_host = %config.broker_host,
        broker_port = config.broker_port,
        client_id = %config.client_id,
        "publisher_starting"
    );

    let connection = wiring::build_connection(&config)?;
    let loop_config = wiring::loop_config(&config);

    // Ctrl-C 触发优雅退出：打断节拍等待并关闭连接
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(target: "pubsub.app", "shutdown_requested"),
            Err(err) => warn!(target: "pubsub.app", error = %err, "signal_listener_failed"),
        }
        signal.cancel();
    });

    let report = match &config.source {
        SourceKind::Fixture { path } => {
            let source = FixtureSource::load(path).await?;
            info!(target: "pubsub.app", path = %path, lines = source.len(), "fixture_loaded");
            run_loop(loop_config, source, connection, shutdown).await?
        }
        SourceKind::Tcp {
            host,
            port,
            request,
        } => {
            let source = wiring::tcp_source(host, *port, request.clone());
            run_loop(loop_config, source, connection, shutdown).await?
        }
    };

    info!(
        target: "pubsub.app",
        iterations = report.iterations,
        published = report.published,
        dropped = report.dropped,
        exit = ?report.exit,
        metrics = ?metrics().snapshot(),
        "publisher_stopped"
    );
    Ok(())
}

async fn run_loop<S: DataSource>(
    config: PublishLoopConfig,
    source: S,
    connection: Connection,
    shutdown: CancellationToken,
) -> Result<LoopReport, PipelineError> {
    PublishLoop::new(config, source, connection)
        .run(shutdown)
        .await
}
