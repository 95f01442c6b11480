/// Binlog 브리지 실행 파일
///
/// stdin으로 들어오는 줄 단위 JSON CDC 레코드를 MySQL binlog 파일로 기록하고,
/// 같은 파일을 복제 클라이언트에게 덤프 프로토콜로 제공합니다.
use binlog_bridge::cdc_engine::BridgeEngine;
use binlog_bridge::config::BridgeConfig;
use binlog_bridge::server::BinlogServer;
use binlog_bridge::source::JsonLinesSource;
use std::env;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 설정: BINLOG_BRIDGE_CONFIG 또는 첫 번째 인자, 없으면 기본값
    let config = match env::var("BINLOG_BRIDGE_CONFIG").ok().or_else(|| env::args().nth(1)) {
        Some(path) => BridgeConfig::from_json_file(path)?,
        None => BridgeConfig::default(),
    };
    let config = Arc::new(config.with_env_overrides()?);
    info!(
        "Starting binlog bridge: dir={}, server_uuid={}, listen={}",
        config.binlog_dir.display(),
        config.server_uuid,
        config.listen_addr
    );

    let engine = BridgeEngine::new(Arc::clone(&config));
    let cancel = engine.cancel_token();

    let server = Arc::new(BinlogServer::new(Arc::clone(&config))?);
    let server_task = tokio::spawn(server.run(cancel.child_token()));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
        }
        shutdown.cancel();
    });

    let source = JsonLinesSource::new(BufReader::new(tokio::io::stdin()));
    let result = engine.run(source).await;
    if let Err(e) = &result {
        error!("Binlog bridge engine failed: {}", e);
    }

    // 입력이 끝나도 복제 클라이언트에게는 계속 제공
    if result.is_ok() && !cancel.is_cancelled() {
        info!("Record input finished, still serving binlog dump until Ctrl-C");
    } else {
        cancel.cancel();
    }
    server_task.await??;
    result?;

    info!("Binlog bridge stopped");
    Ok(())
}
