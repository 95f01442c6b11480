//! CDC → binlog 파이프라인 엔진
//!
//! 엔진은 다음 단계로 진행됩니다:
//! 1. 저장소 초기화 (인덱스 준비, 마지막 파일의 GTID 구간 복원)
//! 2. 변환기 복구 (마지막 파일을 잘라내거나 이어쓸 위치 결정)
//! 3. 읽기 → 변환 → 저장 태스크 실행 (bounded 채널로 연결)

use crate::config::BridgeConfig;
use crate::converter::BinlogConverter;
use crate::error::{BridgeError, Result};
use crate::source::{ChannelSource, DdlTranslator, PassthroughTranslator, RecordSource};
use crate::storage::BinlogStorage;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// CDC 엔진
pub struct BridgeEngine {
    config: Arc<BridgeConfig>,
    translator: Box<dyn DdlTranslator>,
    cancel: CancellationToken,
}

impl BridgeEngine {
    /// 새 엔진 생성
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        BridgeEngine {
            config,
            translator: Box::new(PassthroughTranslator),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_translator(mut self, translator: Box<dyn DdlTranslator>) -> Self {
        self.translator = translator;
        self
    }

    /// 엔진을 멈추는 토큰 (취소하면 세 태스크가 모두 종료)
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 소스가 끝나거나 취소될 때까지 파이프라인 실행
    pub async fn run<S>(self, source: S) -> Result<()>
    where
        S: RecordSource + 'static,
    {
        let config = self.config;
        let cancel = self.cancel;
        info!("Starting binlog bridge engine on {}", config.binlog_dir.display());

        let storage = BinlogStorage::init(Arc::clone(&config))?;
        let mut converter = BinlogConverter::new(Arc::clone(&config), self.translator);
        let initial = converter.recover()?;
        info!(
            "Recovered at {}:{}, next gtid {}",
            config.binlog_file_name(converter.state().file_index),
            storage.position(),
            converter.state().txn_id + 1
        );

        let capacity = config.queue_capacity.max(1);
        let (records, reader) = spawn_reader(source, capacity, config.source_poll_timeout(), cancel.clone());
        let (tx, rx) = mpsc::channel(capacity);

        let reporter_stop = cancel.child_token();
        let reporter = spawn_reporter(
            &config,
            converter.progress(),
            storage.progress(),
            reporter_stop.clone(),
        );

        let converter_task = tokio::spawn(cancel_on_error(
            converter.run(records, initial, tx, cancel.clone()),
            cancel.clone(),
        ));
        let storage_task = tokio::spawn(cancel_on_error(storage.run(rx, cancel.clone()), cancel.clone()));

        let (read, converted, stored) = tokio::join!(reader, converter_task, storage_task);
        reporter_stop.cancel();
        if let Err(e) = reporter.await {
            debug!("progress reporter ended: {}", e);
        }

        // 저장소 에러가 원인이면 변환기는 ChannelClosed로 끝나므로 저장소 에러를 먼저 확인
        joined(stored, "storage")?;
        joined(converted, "converter")?;
        joined(read, "reader")?;
        info!("Binlog bridge engine stopped");
        Ok(())
    }
}

/// 한 단계가 실패하면 나머지 단계도 멈추도록 토큰 취소
async fn cancel_on_error<F>(stage: F, cancel: CancellationToken) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = stage.await;
    if result.is_err() {
        cancel.cancel();
    }
    result
}

fn joined(result: std::result::Result<Result<()>, tokio::task::JoinError>, stage: &str) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!("{} stage failed: {}", stage, e);
            Err(e)
        }
        Err(e) => Err(BridgeError::Other(format!("{} task panicked: {}", stage, e))),
    }
}

/// 소스에서 레코드를 읽어 변환기 채널로 넘기는 태스크
///
/// 소스가 끝나면 채널을 닫아 변환기와 저장소가 차례로 종료되게 합니다.
fn spawn_reader<S>(
    mut source: S,
    capacity: usize,
    poll_timeout: Duration,
    cancel: CancellationToken,
) -> (ChannelSource, JoinHandle<Result<()>>)
where
    S: RecordSource + 'static,
{
    let (tx, records) = ChannelSource::new(capacity);
    let stop = cancel.clone();
    let handle = tokio::spawn(cancel_on_error(async move {
        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tx.closed() => {
                    debug!("converter gone, reader exits");
                    return Ok(());
                }
                fetched = source.fetch(poll_timeout) => fetched,
            };
            match fetched {
                Ok(Some(record)) => {
                    if tx.send(record).await.is_err() {
                        debug!("converter gone, reader exits");
                        return Ok(());
                    }
                }
                Ok(None) => continue,
                Err(BridgeError::ChannelClosed) => {
                    info!("Record source drained");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }, stop));
    (records, handle)
}

fn spawn_reporter(
    config: &BridgeConfig,
    converter: Arc<crate::converter::ConvertProgress>,
    storage: Arc<crate::storage::StorageProgress>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    let period = Duration::from_secs(config.counter_interval_s.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {
                    info!(
                        records = converter.records.load(Ordering::Relaxed),
                        converted = converter.events.load(Ordering::Relaxed),
                        stored = storage.events.load(Ordering::Relaxed),
                        bytes = storage.bytes.load(Ordering::Relaxed),
                        flushes = storage.flushes.load(Ordering::Relaxed),
                        checkpoint_us = storage.checkpoint_us.load(Ordering::Relaxed),
                        "bridge progress"
                    );
                }
            }
        }
    })
}
