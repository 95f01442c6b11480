//! Binlog 파일 저장소
//!
//! 변환기가 보낸 이벤트를 버퍼에 모아 현재 binlog 파일에 덧붙이고,
//! 플러시할 때마다 인덱스의 마지막 레코드(위치, 트랜잭션 매핑)를 갱신합니다.

use crate::binlog::{write_file_header, BinlogParser};
use crate::config::{BridgeConfig, RecoveryMode};
use crate::converter::{PipelineEvent, RotateOp, RotatePlan};
use crate::error::{BridgeError, Result};
use crate::events::{BinlogEvent, BINLOG_MAGIC, FLAGS_OFFSET};
use crate::gtid::{GtidMessage, TxnRange};
use crate::index::{BinlogIndex, BinlogIndexRecord, TxnMapping};
use bytes::BytesMut;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 한 번에 큐에서 꺼내는 최대 이벤트 수
const MAX_BATCH: usize = 256;

/// 저장 진행 카운터
#[derive(Debug, Default)]
pub struct StorageProgress {
    pub events: AtomicU64,
    pub bytes: AtomicU64,
    pub flushes: AtomicU64,
    pub checkpoint_us: AtomicU64,
    pub timestamp_us: AtomicU64,
}

/// 현재 쓰는 파일
struct ActiveFile {
    file: File,
    /// 파일에 기록된 바이트 수 (버퍼 제외)
    written: u64,
}

pub struct BinlogStorage {
    config: Arc<BridgeConfig>,
    index: BinlogIndex,
    /// 인덱스 마지막 레코드의 메모리 사본
    record: BinlogIndexRecord,
    active: Option<ActiveFile>,
    buffer: BytesMut,
    /// 현재 파일에 기록된 GTID 구간
    range: Option<TxnRange>,
    /// 마지막 플러시 또는 빈 버퍼에 첫 이벤트가 들어온 시점
    last_flush: Instant,
    progress: Arc<StorageProgress>,
}

impl BinlogStorage {
    /// 인덱스를 준비하고 마지막 파일에서 실행된 GTID 구간을 복원
    pub fn init(config: Arc<BridgeConfig>) -> Result<Self> {
        fs::create_dir_all(&config.binlog_dir)?;
        let index = BinlogIndex::new(&config.binlog_dir);

        let record = match index.last()? {
            Some(record) => record,
            None => {
                let mut record = BinlogIndexRecord::new(config.binlog_file_name(1), 1);
                if let Some(xid) = &config.initial_trx_xid {
                    record.current_mapping = TxnMapping::new(xid.clone(), config.initial_trx_gtid_seq);
                }
                record.checkpoint = config.start_timestamp_us;
                index.add(&record)?;
                record
            }
        };

        let path = index.binlog_path(&record.file_name);
        let range = if path.exists() && fs::metadata(&path)?.len() > BINLOG_MAGIC.len() as u64 {
            let scan = BinlogParser::last_complete_txn(&path)?;
            let last = match config.recovery_mode {
                RecoveryMode::ExactlyOnce => scan.last_gtid.as_ref().map_or(0, |g| g.gno),
                RecoveryMode::Truncate => scan.last_complete_txn_id,
            };
            let start = if scan.start_complete_txn_id != 0 { scan.start_complete_txn_id } else { last };
            (last != 0).then(|| TxnRange { start, end: last + 1 })
        } else {
            match &config.initial_trx_xid {
                Some(_) if config.initial_trx_gtid_seq > 1 => {
                    Some(TxnRange { start: 1, end: config.initial_trx_gtid_seq })
                }
                _ => None,
            }
        };
        info!(
            "Binlog storage initialized, last file:{} position:{} executed:{:?}",
            record.file_name, record.position, range
        );

        Ok(BinlogStorage {
            buffer: BytesMut::with_capacity(config.max_event_buffer_bytes.min(1 << 20)),
            config,
            index,
            record,
            active: None,
            range,
            last_flush: Instant::now(),
            progress: Arc::new(StorageProgress::default()),
        })
    }

    pub fn progress(&self) -> Arc<StorageProgress> {
        self.progress.clone()
    }

    pub fn index(&self) -> &BinlogIndex {
        &self.index
    }

    /// 현재 파일의 논리적 끝 (버퍼 포함)
    pub fn position(&self) -> u64 {
        self.active.as_ref().map_or(self.record.position, |a| a.written) + self.buffer.len() as u64
    }

    /// 이벤트 하나 저장
    pub fn store(&mut self, event: PipelineEvent) -> Result<()> {
        if let Some(plan) = event.rotate {
            return self.rotate(event, plan);
        }
        self.ensure_open()?;
        self.check_position(&event.event)?;

        if let BinlogEvent::Gtid(gtid) = &event.event {
            self.record.before_mapping = std::mem::take(&mut self.record.current_mapping);
            self.record.current_mapping =
                TxnMapping::new(event.ext_txn_id.clone().unwrap_or_default(), gtid.gno);
            self.record.checkpoint = event.checkpoint_us;
            self.range = Some(match self.range {
                Some(range) => TxnRange { start: range.start.min(gtid.gno), end: gtid.gno + 1 },
                None => TxnRange { start: gtid.gno, end: gtid.gno + 1 },
            });
        }

        let len = event.event.encoded_len(event.checksum);
        if !self.buffer.is_empty() && self.buffer.len() + len > self.config.max_event_buffer_bytes {
            self.flush()?;
        }
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
        }
        event.event.write_to(&mut self.buffer, event.checksum);

        self.progress.events.fetch_add(1, Ordering::Relaxed);
        self.progress.bytes.fetch_add(len as u64, Ordering::Relaxed);
        if event.checkpoint_us != 0 {
            self.progress.checkpoint_us.store(event.checkpoint_us, Ordering::Relaxed);
        }
        if event.timestamp_us != 0 {
            self.progress.timestamp_us.store(event.timestamp_us, Ordering::Relaxed);
        }
        Ok(())
    }

    fn check_position(&self, event: &BinlogEvent) -> Result<()> {
        let expected = self.position();
        let actual = event.header().start_position();
        if expected != actual {
            return Err(BridgeError::PositionMismatch { expected, actual });
        }
        Ok(())
    }

    /// 인덱스 마지막 레코드의 파일을 이어쓰기로 열기
    fn ensure_open(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }
        let path = self.index.binlog_path(&self.record.file_name);
        let file = OpenOptions::new().append(true).open(&path)?;
        let written = file.metadata()?.len();
        debug!("open {} for append at {}", path.display(), written);
        self.active = Some(ActiveFile { file, written });
        Ok(())
    }

    /// 버퍼를 파일에 쓰고 인덱스 위치 갱신
    pub fn flush(&mut self) -> Result<()> {
        self.last_flush = Instant::now();
        if self.buffer.is_empty() {
            return Ok(());
        }
        let Some(active) = self.active.as_mut() else {
            return Err(BridgeError::Other("no binlog file is open for writing".to_string()));
        };
        active.file.write_all(&self.buffer)?;
        active.file.sync_data()?;
        active.written += self.buffer.len() as u64;
        self.buffer.clear();

        self.record.position = active.written;
        self.index.update_last(&self.record)?;
        self.progress.flushes.fetch_add(1, Ordering::Relaxed);
        debug!("flush binlog {} to {}", self.record.file_name, self.record.position);
        Ok(())
    }

    fn rotate(&mut self, event: PipelineEvent, plan: RotatePlan) -> Result<()> {
        let timestamp = event.event.header().timestamp;
        let mut messages = vec![GtidMessage::new(self.config.server_uuid)];

        if plan.op == RotateOp::Rotate {
            self.flush()?;
            if !plan.existed {
                self.ensure_open()?;
                self.check_position(&event.event)?;
                event.event.write_to(&mut self.buffer, event.checksum);
                self.flush()?;
            }
            self.active = None;

            let old_path = self.index.binlog_path(&self.record.file_name);
            clear_in_use_flag(&old_path)?;
            self.record.position = fs::metadata(&old_path)?.len();
            self.index.update_last(&self.record)?;

            let previous = BinlogParser::previous_gtids(&old_path)?;
            if !previous.is_empty() {
                messages = previous;
            }
        }

        if let Some(range) = self.range {
            match messages.iter_mut().find(|m| m.sid == self.config.server_uuid) {
                Some(message) => message.merge(&[range]),
                None => {
                    let mut message = GtidMessage::new(self.config.server_uuid);
                    message.merge(&[range]);
                    messages.push(message);
                }
            }
        }

        let file_name = self.config.binlog_file_name(plan.index);
        if plan.op == RotateOp::Rotate || self.record.file_name != file_name {
            let mut record = BinlogIndexRecord::new(file_name.clone(), plan.index);
            record.checkpoint = self.record.checkpoint;
            self.index.add(&record)?;
            self.record = record;
        }

        let mut header = BytesMut::new();
        let written = write_file_header(
            &mut header,
            timestamp,
            self.config.server_id,
            self.config.checksum,
            messages,
        );
        let path = self.index.binlog_path(&file_name);
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        file.write_all(&header)?;
        file.sync_data()?;
        drop(file);

        self.range = None;
        self.record.position = written;
        self.index.update_last(&self.record)?;
        info!("{:?} binlog file {} (header {} bytes)", plan.op, file_name, written);
        Ok(())
    }

    /// 큐에서 이벤트를 받아 저장
    ///
    /// 버퍼가 `max_event_buffer_bytes`에 닿거나 `flush_timeout`이 지나면 플러시합니다.
    /// 큐가 닫히거나 취소되면 버퍼를 비우고 종료합니다.
    pub async fn run(mut self, mut rx: mpsc::Receiver<PipelineEvent>, cancel: CancellationToken) -> Result<()> {
        let flush_timeout = self.config.flush_timeout();
        let mut batch = Vec::with_capacity(MAX_BATCH);
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush()?;
                    info!("Binlog storage stopped");
                    return Ok(());
                }
                received = tokio::time::timeout(flush_timeout, rx.recv_many(&mut batch, MAX_BATCH)) => received,
            };
            match received {
                Err(_) => {
                    if self.flush_due(flush_timeout) {
                        self.flush()?;
                    }
                }
                Ok(0) => {
                    self.flush()?;
                    info!("Event queue closed, binlog storage exits");
                    return Ok(());
                }
                Ok(_) => {
                    for event in batch.drain(..) {
                        if let Err(e) = self.store(event) {
                            warn!("failed to store binlog event: {}", e);
                            return Err(e);
                        }
                    }
                    if self.flush_due(flush_timeout) {
                        self.flush()?;
                    }
                }
            }
        }
    }

    fn flush_due(&self, flush_timeout: std::time::Duration) -> bool {
        self.buffer.len() >= self.config.max_event_buffer_bytes
            || (!self.buffer.is_empty() && self.last_flush.elapsed() >= flush_timeout)
    }
}

/// 닫힌 파일의 FDE에서 LOG_EVENT_BINLOG_IN_USE_F 제거
///
/// FDE의 CRC는 플래그를 0으로 두고 계산되므로 다시 계산할 필요가 없습니다.
fn clear_in_use_flag(path: &std::path::Path) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start((BINLOG_MAGIC.len() + FLAGS_OFFSET) as u64))?;
    file.write_all(&0u16.to_le_bytes())?;
    file.sync_data()?;
    Ok(())
}
