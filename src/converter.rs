//! CDC 레코드 → Binlog 이벤트 변환기
//!
//! 레코드 하나마다 상태 머신을 한 단계 진행합니다.
//! - `filter == false`: 모든 레코드를 변환해서 내보냄
//! - `filter == true`: 재시작 시점에 이미 기록된 트랜잭션을 건너뜀.
//!   매핑된 외부 트랜잭션의 BEGIN을 만나면 `within_filtered`가 켜지고, 이어지는 COMMIT에서 필터가 풀립니다.
//!
//! 내보내는 모든 이벤트는 `cur_pos`에서 봉인(seal)되므로 next_position은 항상 저장소가 쓰는 파일 끝과 같습니다.

use crate::binlog::{file_header_len, BinlogParser};
use crate::column::{binlog_type, encode_value, fill_bitmap, bitmap_bytes, write_column_metadata, ColumnDef};
use crate::config::{BridgeConfig, MappingFallback, RecoveryMode};
use crate::error::{BridgeError, Result};
use crate::events::*;
use crate::index::{BinlogIndex, BinlogIndexRecord, TxnMapping};
use crate::source::{DdlTranslator, LogRecord, RecordKind, RecordSource};
use bytes::BytesMut;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 48비트 테이블 ID 최대값
const MAX_TABLE_ID: u64 = 0xFFFF_FFFF_FFFF;

/// 저장소가 처리할 로테이션 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOp {
    /// 첫 파일 생성 (이전 파일 없음)
    Init,
    /// 현재 파일을 닫고 다음 파일로
    Rotate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotatePlan {
    pub op: RotateOp,
    /// 새 파일 번호
    pub index: u64,
    /// 닫을 파일에 ROTATE 이벤트가 이미 있는지 여부
    pub existed: bool,
}

/// 변환기 → 저장소로 전달되는 이벤트
#[derive(Debug, Clone)]
pub struct PipelineEvent {
    pub event: BinlogEvent,
    /// GTID 이벤트의 외부 트랜잭션 ID
    pub ext_txn_id: Option<String>,
    pub checkpoint_us: u64,
    pub timestamp_us: u64,
    /// ROTATE 이벤트에만 존재
    pub rotate: Option<RotatePlan>,
    /// 이 이벤트를 기록할 파일의 체크섬 설정
    pub checksum: bool,
}

/// 변환기 런타임 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertState {
    pub file_index: u64,
    pub cur_pos: u64,
    /// 현재 파일의 체크섬 설정 (이전 실행의 파일에 이어 쓸 때는 설정과 다를 수 있음)
    pub file_checksum: bool,
    pub txn_id: u64,
    pub xid: u64,
    /// 재개 기준 트랜잭션 (로컬 GTID ↔ 외부 ID)
    pub mapping: TxnMapping,
    pub filter: bool,
    pub specified_gtids: bool,
    pub within_filtered: bool,
    /// 마지막 파일의 미완료 트랜잭션을 이어 쓰는 중인지 여부
    pub resume_partial: bool,
    /// 이미 파일에 있어서 다시 내보내지 않을 이벤트 수
    pub skip_events: u64,
    pub start_timestamp_us: u64,
}

impl ConvertState {
    fn new(checksum: bool) -> Self {
        ConvertState {
            file_index: 1,
            cur_pos: file_header_len(checksum, false),
            file_checksum: checksum,
            txn_id: 0,
            xid: 0,
            mapping: TxnMapping::default(),
            filter: true,
            specified_gtids: false,
            within_filtered: false,
            resume_partial: false,
            skip_events: 0,
            start_timestamp_us: 0,
        }
    }
}

/// (db, table) → 테이블 ID 캐시
#[derive(Debug)]
pub struct TableCache {
    ids: HashMap<(String, String), u64>,
    next_id: u64,
}

impl TableCache {
    pub fn new() -> Self {
        TableCache { ids: HashMap::new(), next_id: 1 }
    }

    pub fn table_id(&mut self, db: &str, table: &str) -> u64 {
        if let Some(id) = self.ids.get(&(db.to_string(), table.to_string())) {
            return *id;
        }
        self.assign(db, table)
    }

    /// DDL 이후 새 ID 부여
    pub fn refresh(&mut self, db: &str, table: &str) -> u64 {
        self.assign(db, table)
    }

    fn assign(&mut self, db: &str, table: &str) -> u64 {
        if self.next_id > MAX_TABLE_ID {
            debug!("table id overflow, clearing table cache");
            self.ids.clear();
            self.next_id = 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert((db.to_string(), table.to_string()), id);
        id
    }
}

/// 변환 진행 카운터
#[derive(Debug, Default)]
pub struct ConvertProgress {
    pub records: AtomicU64,
    pub events: AtomicU64,
    pub checkpoint_us: AtomicU64,
    pub timestamp_us: AtomicU64,
}

impl ConvertProgress {
    fn mark(&self, record: &LogRecord) {
        self.records.fetch_add(1, Ordering::Relaxed);
        if record.checkpoint_us != 0 {
            self.checkpoint_us.store(record.checkpoint_us, Ordering::Relaxed);
        }
        if record.timestamp != 0 {
            self.timestamp_us.store(record.timestamp_us(), Ordering::Relaxed);
        }
    }
}

/// `tenant.db` → `db`, 테넌트 이름만 있으면 빈 문자열
pub fn strip_tenant(full_db: &str) -> &str {
    match full_db.split_once('.') {
        Some((_, db)) => db,
        None => "",
    }
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Binlog 이벤트 변환기
pub struct BinlogConverter {
    config: Arc<BridgeConfig>,
    index: BinlogIndex,
    state: ConvertState,
    tables: TableCache,
    translator: Box<dyn DdlTranslator>,
    progress: Arc<ConvertProgress>,
}

impl BinlogConverter {
    pub fn new(config: Arc<BridgeConfig>, translator: Box<dyn DdlTranslator>) -> Self {
        let index = BinlogIndex::new(&config.binlog_dir);
        BinlogConverter {
            state: ConvertState::new(config.checksum),
            config,
            index,
            tables: TableCache::new(),
            translator,
            progress: Arc::new(ConvertProgress::default()),
        }
    }

    pub fn state(&self) -> &ConvertState {
        &self.state
    }

    pub fn progress(&self) -> Arc<ConvertProgress> {
        self.progress.clone()
    }

    /// 인덱스와 마지막 파일을 보고 상태를 복원하고, 첫 ROTATE 이벤트를 만듦
    pub fn recover(&mut self) -> Result<Vec<PipelineEvent>> {
        match self.config.recovery_mode {
            RecoveryMode::Truncate => self.recover_truncate(),
            RecoveryMode::ExactlyOnce => self.consume_exactly_once(),
        }
    }

    fn rotate_timestamp(&self) -> u32 {
        if self.config.start_timestamp_us != 0 {
            (self.config.start_timestamp_us / 1_000_000) as u32
        } else {
            now_secs()
        }
    }

    /// 인덱스가 비어 있거나 첫 파일에 아무것도 기록되지 않은 경우
    fn init_fresh(&mut self, index: u64) -> Result<Vec<PipelineEvent>> {
        let checksum = self.config.checksum;
        self.state.file_index = index;
        self.state.file_checksum = checksum;
        self.state.filter = false;

        if let Some(xid) = &self.config.initial_trx_xid {
            let seq = self.config.initial_trx_gtid_seq;
            self.state.mapping = TxnMapping::new(xid.clone(), seq);
            self.state.txn_id = seq.saturating_sub(1);
            self.state.xid = self.state.txn_id;
            self.state.start_timestamp_us = self.config.start_timestamp_us;
            self.state.filter = true;
            self.state.specified_gtids = true;
            info!(
                "Specify gtid mapping relationship to start,initial_trx_xid:{},initial_trx_gtid_seq:{}",
                xid, seq
            );
        }

        let mut rotate = BinlogEvent::Rotate(RotateEvent::new(
            self.rotate_timestamp(),
            self.config.server_id,
            &self.config.binlog_file_name(index),
            BINLOG_MAGIC.len() as u64,
        ));
        rotate.seal(BINLOG_MAGIC.len() as u64, checksum);
        self.state.cur_pos = file_header_len(checksum, self.state.txn_id > 0);
        info!("Initialize binlog file {} at cur_pos {}", self.config.binlog_file_name(index), self.state.cur_pos);

        Ok(vec![self.rotate_event(rotate, RotateOp::Init, index, false, checksum)])
    }

    fn rotate_event(&self, event: BinlogEvent, op: RotateOp, index: u64, existed: bool, checksum: bool) -> PipelineEvent {
        PipelineEvent {
            event,
            ext_txn_id: None,
            checkpoint_us: self.state.start_timestamp_us,
            timestamp_us: 0,
            rotate: Some(RotatePlan { op, index, existed }),
            checksum,
        }
    }

    /// 인덱스 레코드에서 GTID 번호에 대응하는 매핑 찾기
    fn mapping_for(record: &BinlogIndexRecord, gtid_seq: u64) -> Result<TxnMapping> {
        if record.current_mapping.gtid_seq == gtid_seq {
            Ok(record.current_mapping.clone())
        } else if record.before_mapping.gtid_seq == gtid_seq {
            Ok(record.before_mapping.clone())
        } else {
            Err(BridgeError::Recovery(format!(
                "Could not find mapping record for transaction:{}",
                gtid_seq
            )))
        }
    }

    /// 잘라내기 복구: 마지막 파일을 마지막 완료 트랜잭션까지 자르고 새 파일로 회전
    fn recover_truncate(&mut self) -> Result<Vec<PipelineEvent>> {
        let records = self.index.fetch_all(true)?;
        let Some(last) = records.last().cloned() else {
            return self.init_fresh(1);
        };
        if records.len() == 1 && last.position == 0 {
            return self.init_fresh(last.index);
        }

        let chosen = if last.current_mapping.is_empty() && last.before_mapping.is_empty() && records.len() > 1 {
            match self.config.mapping_fallback {
                MappingFallback::PreviousRecord => records[records.len() - 2].current_mapping.clone(),
                MappingFallback::Strict => {
                    return Err(BridgeError::Recovery(format!(
                        "index record {} has no transaction mapping",
                        last.file_name
                    )));
                }
            }
        } else {
            last.current_mapping.clone()
        };
        self.state.txn_id = chosen.gtid_seq;
        self.state.mapping = chosen;

        let path = self.index.binlog_path(&last.file_name);
        if !path.exists() {
            return Err(BridgeError::Recovery(format!(
                "binlog file {} listed in the index is missing",
                path.display()
            )));
        }
        let scan = BinlogParser::last_complete_txn(&path)?;

        if self.config.recover_backup {
            self.backup(&last)?;
        }
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(scan.complete_pos)?;
        file.sync_all()?;
        info!(
            "The last complete transaction id is {},checkpoint:{}",
            scan.last_complete_txn_id, scan.complete_pos
        );

        if scan.last_complete_txn_id != 0 {
            self.state.txn_id = scan.last_complete_txn_id;
            self.state.mapping = Self::mapping_for(&last, scan.last_complete_txn_id)?;
        }
        // 건너뛸 트랜잭션이 없으면 바로 정상 상태
        self.state.filter = !self.state.mapping.is_empty();
        self.state.xid = self.state.txn_id;
        self.state.start_timestamp_us = last.checkpoint;

        let next_index = last.index + 1;
        let mut rotate = BinlogEvent::Rotate(RotateEvent::new(
            self.rotate_timestamp(),
            self.config.server_id,
            &self.config.binlog_file_name(next_index),
            BINLOG_MAGIC.len() as u64,
        ));
        rotate.seal(scan.complete_pos, scan.checksum);

        self.state.file_index = next_index;
        self.state.file_checksum = self.config.checksum;
        self.state.cur_pos = file_header_len(self.config.checksum, self.state.txn_id > 0);
        info!(
            "Recovered at transaction {} ({}), rotating to {}",
            self.state.mapping.gtid_seq,
            self.state.mapping.ext_txn_id,
            self.config.binlog_file_name(next_index)
        );
        Ok(vec![self.rotate_event(rotate, RotateOp::Rotate, next_index, scan.rotate_existed, scan.checksum)])
    }

    /// 정확히 한 번 모드: 파일을 자르지 않고 이미 기록된 이벤트를 건너뜀
    fn consume_exactly_once(&mut self) -> Result<Vec<PipelineEvent>> {
        let Some(last) = self.index.last()? else {
            return self.init_fresh(1);
        };
        let path = self.index.binlog_path(&last.file_name);
        if !path.exists() {
            if last.position == 0 {
                return self.init_fresh(last.index);
            }
            return Err(BridgeError::Recovery(format!(
                "binlog file {} listed in the index is missing",
                path.display()
            )));
        }

        let scan = BinlogParser::last_complete_txn(&path)?;
        if scan.torn_tail {
            warn!("Dropping torn trailing event bytes of {} after {}", path.display(), scan.end_pos);
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(scan.end_pos)?;
        }

        let mut txn_ts = 0u64;
        let mut op = RotateOp::Rotate;
        match &scan.last_gtid {
            Some(gtid) => {
                self.state.txn_id = gtid.gno;
                self.state.xid = gtid.gno;
                txn_ts = gtid.last_committed as u64 * 1_000_000 + gtid.sequence_number as u64;
                self.state.start_timestamp_us = last.checkpoint;
                self.state.mapping = Self::mapping_for(&last, gtid.gno)?;
                info!(
                    "current transaction:{}<>{} pending events:{}",
                    self.state.mapping.gtid_seq, self.state.mapping.ext_txn_id, scan.pending_events
                );
            }
            None if last.position == 0 => op = RotateOp::Init,
            None => info!("No gtid event found in {}", path.display()),
        }
        if op == RotateOp::Init {
            return self.init_fresh(last.index);
        }

        if scan.pending_events > 0 {
            // 미완료 트랜잭션을 같은 파일에 이어 씀
            self.state.file_index = last.index;
            self.state.file_checksum = scan.checksum;
            self.state.cur_pos = scan.end_pos;
            self.state.filter = true;
            self.state.resume_partial = true;
            self.state.skip_events = scan.pending_events;
            info!(
                "Resume the incomplete transaction {} in {} at {}, skipping {} written events",
                self.state.mapping.ext_txn_id, last.file_name, scan.end_pos, scan.pending_events
            );
            return Ok(Vec::new());
        }

        // 같은 트랜잭션이 다시 전달될 수 있으므로 마지막 트랜잭션 시각이 체크포인트 이후면 건너뜀
        self.state.filter = txn_ts != 0 && self.state.start_timestamp_us <= txn_ts;
        if !self.state.filter {
            info!("The transactions in the binlog file are complete and do not need to be filtered");
        }

        let next_index = last.index + 1;
        let mut rotate = BinlogEvent::Rotate(RotateEvent::new(
            self.rotate_timestamp(),
            self.config.server_id,
            &self.config.binlog_file_name(next_index),
            BINLOG_MAGIC.len() as u64,
        ));
        rotate.seal(scan.end_pos, scan.checksum);
        self.state.file_index = next_index;
        self.state.file_checksum = self.config.checksum;
        self.state.cur_pos = file_header_len(self.config.checksum, self.state.txn_id > 0);
        Ok(vec![self.rotate_event(rotate, RotateOp::Rotate, next_index, scan.rotate_existed, scan.checksum)])
    }

    /// 잘라내기 전에 binlog 파일과 인덱스를 백업
    fn backup(&self, last: &BinlogIndexRecord) -> Result<()> {
        let dir = self.config.recover_backup_dir();
        fs::create_dir_all(&dir)?;
        let ts = chrono::Utc::now().timestamp();
        let binlog_backup = dir.join(format!("{}_{}", last.file_name, ts));
        let index_backup = dir.join(format!("index_{}", ts));
        fs::copy(self.index.binlog_path(&last.file_name), &binlog_backup)?;
        fs::copy(self.index.index_path(), &index_backup)?;
        info!("Backup {} to {}", last.file_name, binlog_backup.display());
        Ok(())
    }

    /// 레코드 하나를 변환
    pub fn convert(&mut self, record: LogRecord) -> Result<Vec<PipelineEvent>> {
        self.progress.mark(&record);
        let mut out = Vec::new();
        match record.kind {
            RecordKind::Begin => self.convert_gtid(&record, &mut out)?,
            RecordKind::Commit => self.convert_xid(&record, &mut out),
            RecordKind::Ddl => {
                if self.state.filter && !self.resumes_here(&record) {
                    info!("skip ddl: {}", record.sql.as_deref().unwrap_or(""));
                    if self.state.mapping.ext_txn_id == record.txn_id {
                        self.state.filter = false;
                    }
                } else {
                    self.convert_gtid(&record, &mut out)?;
                }
            }
            RecordKind::Insert | RecordKind::Update | RecordKind::Delete => {
                if !self.state.filter {
                    self.convert_rows(&record, &mut out)?;
                }
            }
            RecordKind::Heartbeat => {}
            RecordKind::Unknown => {
                error!("Unsupported record type in transaction {}", record.txn_id);
                if !self.config.ignore_unsupported_record {
                    return Err(BridgeError::UnsupportedRecord(format!("{:?}", record.kind)));
                }
            }
        }
        self.progress.events.fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(out)
    }

    fn resumes_here(&self, record: &LogRecord) -> bool {
        self.state.resume_partial && self.state.mapping.ext_txn_id == record.txn_id
    }

    fn emit(&mut self, out: &mut Vec<PipelineEvent>, mut event: BinlogEvent, record: &LogRecord, ext: Option<String>) {
        if self.state.skip_events > 0 {
            self.state.skip_events -= 1;
            debug!("skip already written {:?} event", event.event_type());
            return;
        }
        self.state.cur_pos = event.seal(self.state.cur_pos, self.state.file_checksum);
        out.push(PipelineEvent {
            event,
            ext_txn_id: ext,
            checkpoint_us: record.checkpoint_us,
            timestamp_us: record.timestamp_us(),
            rotate: None,
            checksum: self.state.file_checksum,
        });
    }

    /// BEGIN/DDL → GTID + QUERY
    fn convert_gtid(&mut self, record: &LogRecord, out: &mut Vec<PipelineEvent>) -> Result<()> {
        if self.state.filter {
            if self.state.mapping.ext_txn_id != record.txn_id {
                return Ok(());
            }
            if self.state.specified_gtids {
                self.state.filter = false;
                info!(
                    "If the gtid is specified, the transmission will resume from the current mapping [{}={}].",
                    self.state.mapping.ext_txn_id, self.state.mapping.gtid_seq
                );
            } else if self.state.resume_partial {
                self.state.filter = false;
                self.state.resume_partial = false;
                self.state.txn_id = self.state.mapping.gtid_seq.saturating_sub(1);
            } else {
                info!(
                    "Find the last complete transaction and complete the transaction filtering:[{},{}]",
                    self.state.mapping.gtid_seq, self.state.mapping.ext_txn_id
                );
                self.state.within_filtered = true;
                return Ok(());
            }
        }

        let gno = self.state.txn_id + 1;
        let mut gtid = GtidEvent::new(record.timestamp, self.config.server_id, self.config.server_uuid, gno);
        gtid.last_committed = record.timestamp as i64;
        gtid.sequence_number = record.record_usec as i64;
        self.state.txn_id = gno;
        self.emit(out, BinlogEvent::Gtid(gtid), record, Some(record.txn_id.clone()));
        self.convert_query(record, out);
        Ok(())
    }

    fn convert_query(&mut self, record: &LogRecord, out: &mut Vec<PipelineEvent>) {
        let (schema, sql) = match record.kind {
            RecordKind::Begin => (String::new(), "BEGIN".to_string()),
            _ => {
                let db = strip_tenant(&record.db).to_string();
                self.tables.refresh(&db, &record.table);
                let ddl = record.sql.clone().unwrap_or_default();
                let sql = if self.config.ddl_convert {
                    match self.translator.translate(&ddl) {
                        Ok(sql) => sql,
                        Err(e) => {
                            warn!("Failed to convert ddl, use the original statement: {} ({})", ddl, e);
                            ddl
                        }
                    }
                } else {
                    ddl
                };
                (db, sql)
            }
        };
        let query = QueryEvent::new(record.timestamp, self.config.server_id, 0, &schema, &sql);
        self.emit(out, BinlogEvent::Query(query), record, None);
    }

    /// COMMIT → XID, 크기를 넘으면 ROTATE
    fn convert_xid(&mut self, record: &LogRecord, out: &mut Vec<PipelineEvent>) {
        if self.state.filter {
            if self.state.within_filtered {
                self.state.filter = false;
                self.state.within_filtered = false;
            }
            return;
        }

        self.state.xid += 1;
        let xid = XidEvent::new(record.timestamp, self.config.server_id, self.state.xid);
        self.emit(out, BinlogEvent::Xid(xid), record, None);

        if self.state.cur_pos > self.config.max_binlog_size {
            let checksum = self.state.file_checksum;
            self.state.file_index += 1;
            let index = self.state.file_index;
            let mut rotate = BinlogEvent::Rotate(RotateEvent::new(
                record.timestamp,
                self.config.server_id,
                &self.config.binlog_file_name(index),
                BINLOG_MAGIC.len() as u64,
            ));
            rotate.seal(self.state.cur_pos, checksum);
            out.push(self.rotate_event(rotate, RotateOp::Rotate, index, false, checksum));

            self.state.file_checksum = self.config.checksum;
            self.state.cur_pos = file_header_len(self.config.checksum, self.state.txn_id > 0);
            info!("rotate to {} after transaction {}", self.config.binlog_file_name(index), self.state.txn_id);
        }
    }

    /// INSERT/UPDATE/DELETE → TABLE_MAP + ROWS
    fn convert_rows(&mut self, record: &LogRecord, out: &mut Vec<PipelineEvent>) -> Result<()> {
        let db = strip_tenant(&record.db).to_string();
        let table_id = self.tables.table_id(&db, &record.table);
        let columns = &record.columns;

        let mut metadata = BytesMut::new();
        let mut null_bitmap = vec![0u8; bitmap_bytes(columns.len())];
        for (i, column) in columns.iter().enumerate() {
            write_column_metadata(column, &mut metadata);
            if column.nullable {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        let table_map = TableMapEvent {
            header: EventHeader::new(EventType::TableMap, record.timestamp, self.config.server_id),
            table_id,
            flags: TM_BIT_LEN_EXACT_F,
            schema: db,
            table: record.table.clone(),
            column_types: columns.iter().map(|c| binlog_type(c) as u8).collect(),
            column_metadata: metadata.to_vec(),
            null_bitmap,
        };

        let (event_type, before, after) = match record.kind {
            RecordKind::Insert => (EventType::WriteRows, None, Some(row_image(columns, &record.after)?)),
            RecordKind::Delete => (EventType::DeleteRows, Some(row_image(columns, &record.before)?), None),
            _ => (
                EventType::UpdateRows,
                Some(row_image(columns, &record.before)?),
                Some(row_image(columns, &record.after)?),
            ),
        };
        let rows = RowsEvent::new(
            event_type,
            record.timestamp,
            self.config.server_id,
            table_id,
            columns.len() as u64,
            before,
            after,
        );
        let rows = match event_type {
            EventType::WriteRows => BinlogEvent::WriteRows(rows),
            EventType::DeleteRows => BinlogEvent::DeleteRows(rows),
            _ => BinlogEvent::UpdateRows(rows),
        };

        self.emit(out, BinlogEvent::TableMap(table_map), record, None);
        self.emit(out, rows, record, None);
        Ok(())
    }

    /// 레코드를 읽어 변환하고 저장소 큐로 보냄
    ///
    /// 큐가 가득 차면 버리지 않고 재시도합니다. 소스가 닫히거나 취소되면 종료합니다.
    pub async fn run<S: RecordSource>(
        mut self,
        mut source: S,
        initial: Vec<PipelineEvent>,
        tx: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        for event in initial {
            self.offer(&tx, event, &cancel).await?;
        }

        let poll_timeout = self.config.source_poll_timeout();
        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Converter stopped");
                    return Ok(());
                }
                fetched = source.fetch(poll_timeout) => fetched,
            };
            let record = match fetched {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!("record source empty, retry...");
                    continue;
                }
                Err(BridgeError::ChannelClosed) => {
                    info!("Record source closed, converter exits");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            for event in self.convert(record)? {
                self.offer(&tx, event, &cancel).await?;
            }
        }
    }

    async fn offer(
        &self,
        tx: &mpsc::Sender<PipelineEvent>,
        mut event: PipelineEvent,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout = self.config.queue_offer_timeout();
        loop {
            match tx.send_timeout(event, timeout).await {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    info!("storage queue full({}), retry...", tx.max_capacity());
                    event = back;
                }
                Err(SendTimeoutError::Closed(_)) => return Err(BridgeError::ChannelClosed),
            }
        }
    }
}

/// 컬럼 값 목록 → 행 이미지
fn row_image(columns: &[ColumnDef], values: &[Option<String>]) -> Result<RowImage> {
    if values.len() != columns.len() {
        return Err(BridgeError::Conversion(format!(
            "row has {} values for {} columns",
            values.len(),
            columns.len()
        )));
    }
    let n_bytes = bitmap_bytes(columns.len());
    let mut null_bitmap = fill_bitmap(columns.len(), n_bytes);
    let mut data = BytesMut::new();
    for (i, (column, value)) in columns.iter().zip(values).enumerate() {
        match value {
            Some(value) => encode_value(column, value.as_bytes(), &mut data)?,
            None => null_bitmap[i / 8] |= 1 << (i % 8),
        }
    }
    Ok(RowImage { null_bitmap, values: data.to_vec() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::tests::FileBuilder;
    use crate::column::ColumnType;
    use crate::source::{ChannelSource, PassthroughTranslator};
    use std::path::Path;

    fn test_config(dir: &Path) -> BridgeConfig {
        BridgeConfig {
            binlog_dir: dir.join("data"),
            recover_backup: false,
            ..Default::default()
        }
    }

    fn converter(config: BridgeConfig) -> BinlogConverter {
        std::fs::create_dir_all(&config.binlog_dir).unwrap();
        BinlogConverter::new(Arc::new(config), Box::new(PassthroughTranslator))
    }

    fn record(kind: RecordKind, txn: &str) -> LogRecord {
        let mut r = LogRecord::new(kind, txn);
        r.timestamp = 1_700_000_000;
        r.checkpoint_us = 1_700_000_000_000_000;
        r
    }

    fn insert(txn: &str) -> LogRecord {
        let mut r = record(RecordKind::Insert, txn);
        r.db = "tenant1.shop".to_string();
        r.table = "t1".to_string();
        r.columns = vec![ColumnDef::new("col", ColumnType::Long)];
        r.after = vec![Some("1".to_string())];
        r
    }

    fn types(events: &[PipelineEvent]) -> Vec<EventType> {
        events.iter().map(|e| e.event.event_type()).collect()
    }

    fn txn(conv: &mut BinlogConverter, id: &str) -> Vec<PipelineEvent> {
        let mut out = conv.convert(record(RecordKind::Begin, id)).unwrap();
        out.extend(conv.convert(insert(id)).unwrap());
        out.extend(conv.convert(record(RecordKind::Commit, id)).unwrap());
        out
    }

    #[test]
    fn test_strip_tenant() {
        assert_eq!(strip_tenant("tenant1.shop"), "shop");
        assert_eq!(strip_tenant("tenant1"), "");
        assert_eq!(strip_tenant(""), "");
    }

    #[test]
    fn test_table_cache() {
        let mut cache = TableCache::new();
        let a = cache.table_id("db", "a");
        assert_eq!(cache.table_id("db", "a"), a);
        let b = cache.table_id("db", "b");
        assert_ne!(a, b);
        let refreshed = cache.refresh("db", "a");
        assert_ne!(refreshed, a);
        assert_eq!(cache.table_id("db", "a"), refreshed);

        cache.next_id = MAX_TABLE_ID + 1;
        assert_eq!(cache.table_id("db", "c"), 1);
        assert_eq!(cache.table_id("db", "b"), 2);
    }

    #[test]
    fn test_fresh_start_emits_init_then_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut conv = converter(test_config(dir.path()));
        let init = conv.recover().unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(
            init[0].rotate,
            Some(RotatePlan { op: RotateOp::Init, index: 1, existed: false })
        );
        let base = file_header_len(true, false);
        assert_eq!(conv.state().cur_pos, base);

        let events = txn(&mut conv, "ob-1");
        assert_eq!(
            types(&events),
            vec![
                EventType::Gtid,
                EventType::Query,
                EventType::TableMap,
                EventType::WriteRows,
                EventType::Xid
            ]
        );

        let mut pos = base;
        for e in &events {
            let header = e.event.header();
            assert_eq!(header.start_position(), pos);
            assert_eq!(header.event_length as usize, e.event.encoded_len(true));
            pos = header.next_position as u64;
        }
        assert_eq!(pos, conv.state().cur_pos);

        match &events[0].event {
            BinlogEvent::Gtid(g) => {
                assert_eq!(g.gno, 1);
                assert_eq!(g.sid, conv.config.server_uuid);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events[0].ext_txn_id.as_deref(), Some("ob-1"));
        match &events[2].event {
            BinlogEvent::TableMap(t) => {
                assert_eq!(t.schema, "shop");
                assert_eq!(t.column_types, vec![ColumnType::Long as u8]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rotation_after_commit_over_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_binlog_size = 300;
        let mut conv = converter(config);
        conv.recover().unwrap();

        let events = txn(&mut conv, "ob-1");
        let rotate = events.last().unwrap();
        assert_eq!(rotate.event.event_type(), EventType::Rotate);
        assert_eq!(rotate.rotate, Some(RotatePlan { op: RotateOp::Rotate, index: 2, existed: false }));
        let xid_end = events[events.len() - 2].event.header().next_position;
        assert_eq!(rotate.event.header().start_position(), xid_end as u64);
        assert_eq!(conv.state().cur_pos, file_header_len(true, true));
        assert_eq!(conv.state().file_index, 2);

        // 다음 트랜잭션은 새 파일 머리 뒤에서 시작
        let next = txn(&mut conv, "ob-2");
        assert_eq!(next[0].event.header().start_position(), file_header_len(true, true));
    }

    #[test]
    fn test_specified_gtid_mapping_skips_until_mapped_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.initial_trx_xid = Some("ob-5".to_string());
        config.initial_trx_gtid_seq = 5;
        config.start_timestamp_us = 1_700_000_000_000_000;
        let mut conv = converter(config);
        conv.recover().unwrap();
        assert_eq!(conv.state().cur_pos, file_header_len(true, true));

        assert!(txn(&mut conv, "ob-4").is_empty());
        let events = txn(&mut conv, "ob-5");
        match &events[0].event {
            BinlogEvent::Gtid(g) => assert_eq!(g.gno, 5),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!conv.state().filter);
    }

    #[test]
    fn test_ddl_and_unknown_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut conv = converter(test_config(dir.path()));
        conv.recover().unwrap();

        let mut ddl = record(RecordKind::Ddl, "ob-1");
        ddl.db = "tenant1.shop".to_string();
        ddl.table = "t1".to_string();
        ddl.sql = Some("CREATE TABLE t1 (id INT)".to_string());
        let events = conv.convert(ddl).unwrap();
        assert_eq!(types(&events), vec![EventType::Gtid, EventType::Query]);
        assert_eq!(events[1].event.info(), "use `shop`; CREATE TABLE t1 (id INT)");

        assert!(conv.convert(record(RecordKind::Heartbeat, "")).unwrap().is_empty());
        assert!(conv.convert(record(RecordKind::Unknown, "ob-2")).unwrap().is_empty());
        assert_eq!(conv.progress().records.load(Ordering::Relaxed), 3);

        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.ignore_unsupported_record = false;
        let mut strict = converter(config);
        strict.recover().unwrap();
        assert!(matches!(
            strict.convert(record(RecordKind::Unknown, "ob-2")),
            Err(BridgeError::UnsupportedRecord(_))
        ));
    }

    #[test]
    fn test_update_and_delete_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut conv = converter(test_config(dir.path()));
        conv.recover().unwrap();
        conv.convert(record(RecordKind::Begin, "ob-1")).unwrap();

        let mut update = insert("ob-1");
        update.kind = RecordKind::Update;
        update.columns.push(ColumnDef::new("note", ColumnType::VarChar));
        update.columns[1].length = 10;
        update.before = vec![Some("1".to_string()), None];
        update.after = vec![Some("1".to_string()), Some("".to_string())];
        let events = conv.convert(update).unwrap();
        match &events[1].event {
            BinlogEvent::UpdateRows(rows) => {
                let before = rows.before.as_ref().unwrap();
                let after = rows.after.as_ref().unwrap();
                assert!(before.is_null(1));
                assert!(!after.is_null(1));
                // 빈 문자열은 길이 0으로 기록
                assert_eq!(after.values, vec![1, 0, 0, 0, 0]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut delete = insert("ob-1");
        delete.kind = RecordKind::Delete;
        delete.before = vec![Some("1".to_string())];
        delete.after = Vec::new();
        let events = conv.convert(delete).unwrap();
        assert_eq!(events[1].event.event_type(), EventType::DeleteRows);

        let mut bad = insert("ob-1");
        bad.after = Vec::new();
        assert!(matches!(conv.convert(bad), Err(BridgeError::Conversion(_))));
    }

    fn write_index(dir: &Path, records: &[BinlogIndexRecord]) {
        let index = BinlogIndex::new(dir);
        for r in records {
            index.add(r).unwrap();
        }
    }

    #[test]
    fn test_recover_truncates_partial_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.recover_backup = true;
        std::fs::create_dir_all(&config.binlog_dir).unwrap();
        let path = config.binlog_dir.join("mysql-bin.000001");

        let mut builder = FileBuilder::new(true, None);
        builder.txn(1).txn(2);
        let complete = builder.pos;
        builder.begin(3).insert();
        builder.write(&path);

        let mut record = BinlogIndexRecord::new("mysql-bin.000001", 1);
        record.current_mapping = TxnMapping::new("ob-3", 3);
        record.before_mapping = TxnMapping::new("ob-2", 2);
        record.position = builder.buf.len() as u64;
        write_index(&config.binlog_dir, &[record]);

        let backup_dir = config.recover_backup_dir();
        let mut conv = converter(config);
        let events = conv.recover().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), complete);
        assert!(std::fs::read_dir(backup_dir).unwrap().count() >= 2);

        assert_eq!(conv.state().txn_id, 2);
        assert_eq!(conv.state().mapping, TxnMapping::new("ob-2", 2));
        assert!(conv.state().filter);
        let rotate = &events[0];
        assert_eq!(rotate.rotate, Some(RotatePlan { op: RotateOp::Rotate, index: 2, existed: false }));
        assert_eq!(rotate.event.header().start_position(), complete);

        // 이미 기록된 ob-2는 건너뛰고 ob-3부터 다시 씀
        assert!(txn(&mut conv, "ob-2").is_empty());
        let events = txn(&mut conv, "ob-3");
        match &events[0].event {
            BinlogEvent::Gtid(g) => assert_eq!(g.gno, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events[0].event.header().start_position(), file_header_len(true, true));
    }

    fn rotated_index(config: &BridgeConfig) {
        std::fs::create_dir_all(&config.binlog_dir).unwrap();
        // 회전 직후 머리만 있는 파일
        let builder = FileBuilder::new(true, Some(crate::gtid::TxnRange { start: 1, end: 5 }));
        builder.write(&config.binlog_dir.join("mysql-bin.000002"));

        let mut first = BinlogIndexRecord::new("mysql-bin.000001", 1);
        first.current_mapping = TxnMapping::new("ob-4", 4);
        first.before_mapping = TxnMapping::new("ob-3", 3);
        first.position = 1000;
        let mut second = BinlogIndexRecord::new("mysql-bin.000002", 2);
        second.position = builder.buf.len() as u64;
        write_index(&config.binlog_dir, &[first, second]);
    }

    #[test]
    fn test_mapping_fallback_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        rotated_index(&config);

        let mut conv = converter(config);
        let events = conv.recover().unwrap();
        assert_eq!(conv.state().mapping, TxnMapping::new("ob-4", 4));
        assert_eq!(conv.state().txn_id, 4);
        assert_eq!(events[0].rotate.map(|r| r.index), Some(3));
    }

    #[test]
    fn test_mapping_fallback_strict() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.mapping_fallback = MappingFallback::Strict;
        rotated_index(&config);

        let mut conv = converter(config);
        assert!(matches!(conv.recover(), Err(BridgeError::Recovery(_))));
    }

    #[test]
    fn test_exactly_once_resumes_partial_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.recovery_mode = RecoveryMode::ExactlyOnce;
        std::fs::create_dir_all(&config.binlog_dir).unwrap();
        let path = config.binlog_dir.join("mysql-bin.000001");

        let mut builder = FileBuilder::new(true, None);
        builder.txn(1).begin(2).insert();
        builder.write(&path);
        let mut record = BinlogIndexRecord::new("mysql-bin.000001", 1);
        record.current_mapping = TxnMapping::new("ob-2", 2);
        record.before_mapping = TxnMapping::new("ob-1", 1);
        record.position = builder.buf.len() as u64;
        write_index(&config.binlog_dir, &[record]);

        let mut conv = converter(config);
        assert!(conv.recover().unwrap().is_empty());
        assert_eq!(conv.state().cur_pos, builder.pos);

        // ob-1은 이미 완료, ob-2는 XID만 남음
        assert!(txn(&mut conv, "ob-1").is_empty());
        let events = txn(&mut conv, "ob-2");
        assert_eq!(types(&events), vec![EventType::Xid]);
        assert_eq!(events[0].event.header().start_position(), builder.pos);
        assert_eq!(conv.state().txn_id, 2);
    }

    #[tokio::test]
    async fn test_run_forwards_events_until_source_closes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.source_poll_timeout_us = 1_000;
        let mut conv = converter(config);
        let initial = conv.recover().unwrap();

        let (record_tx, source) = ChannelSource::new(8);
        let (event_tx, mut event_rx) = mpsc::channel(2);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(conv.run(source, initial, event_tx, cancel.clone()));

        for r in [record(RecordKind::Begin, "ob-1"), insert("ob-1"), record(RecordKind::Commit, "ob-1")] {
            record_tx.send(r).await.unwrap();
        }
        drop(record_tx);

        let mut received = Vec::new();
        while let Some(event) = event_rx.recv().await {
            received.push(event.event.event_type());
        }
        assert_eq!(received.len(), 6);
        assert_eq!(received[0], EventType::Rotate);
        assert!(task.await.unwrap().is_ok());
    }
}
