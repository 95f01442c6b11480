//! Binlog 덤프 세션
//!
//! 복제 클라이언트 하나에 대해 시작 위치를 정하고, 파일을 읽어 이벤트를 보내고,
//! 파일 끝에서는 새 데이터나 다음 파일을 기다립니다.
//!
//! 상태 흐름: 시작 파일 결정 → 위치 검증 → 가짜 ROTATE → 이벤트 전송 → (EOF | 대기 → 다음 파일)

use crate::binlog::{BinlogParser, BinlogReader, RawEvent};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::events::*;
use crate::gtid::GtidSet;
use crate::index::{BinlogIndex, BinlogIndexRecord};
use crate::protocol::{BinlogDumpRequest, PacketChannel};
use bytes::{BufMut, BytesMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ERR_POSITION_TOO_SMALL: &str = "Client requested master to start replication from position < 4.";
pub const ERR_OPEN_FAILED: &str = "failed to open binlog file";
pub const ERR_BAD_MAGIC: &str =
    "Binlog has bad magic number;  It's not a binary log file that can be used by this version of MySQL.";
pub const ERR_CHECKSUM_UNSUPPORTED: &str =
    "Slave can not handle replication events with the checksum that master is configured to log";
pub const ERR_NO_NEXT_LOG: &str = "could not find next log.";
pub const ERR_GTID_PURGED: &str = "The requested gtid transaction no longer exists and may have been cleaned up";
pub const ERR_FIRST_LOG_NOT_FOUND: &str = "Could not find first log file name in binary log index file";

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// 덤프 세션 카운터
#[derive(Debug)]
pub struct DumperMetric {
    pub client: String,
    events: AtomicU64,
    ios: AtomicU64,
    checkpoint_us: AtomicU64,
    last_sample: Mutex<Instant>,
}

impl DumperMetric {
    pub fn new(client: impl Into<String>) -> Self {
        DumperMetric {
            client: client.into(),
            events: AtomicU64::new(0),
            ios: AtomicU64::new(0),
            checkpoint_us: AtomicU64::new(0),
            last_sample: Mutex::new(Instant::now()),
        }
    }

    pub fn record_event(&self, timestamp: u32) {
        self.events.fetch_add(1, Ordering::Relaxed);
        if timestamp != 0 {
            self.checkpoint_us.store(timestamp as u64 * 1_000_000, Ordering::Relaxed);
        }
    }

    pub fn record_io(&self) {
        self.ios.fetch_add(1, Ordering::Relaxed);
    }

    /// 마지막 샘플 이후의 (초당 이벤트, 초당 IO)
    ///
    /// 카운터는 읽으면서 0으로 되돌립니다.
    pub fn sample(&self) -> (u64, u64) {
        let mut last = self.last_sample.lock();
        let elapsed = last.elapsed().as_secs().max(1);
        *last = Instant::now();
        let events = self.events.swap(0, Ordering::Relaxed);
        let ios = self.ios.swap(0, Ordering::Relaxed);
        (events / elapsed, ios / elapsed)
    }

    /// 마지막으로 보낸 이벤트 시각과 현재 시각의 차이
    pub fn delay_us(&self) -> u64 {
        let checkpoint = self.checkpoint_us.load(Ordering::Relaxed);
        if checkpoint == 0 {
            return 0;
        }
        now_us().saturating_sub(checkpoint)
    }
}

/// SET으로 협상된 세션 변수
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionVars {
    /// @master_binlog_checksum = 'CRC32'
    pub checksum: bool,
    /// @master_heartbeat_period (나노초 단위로 전달됨)
    pub heartbeat_period: Option<Duration>,
}

/// 현재 읽고 있는 파일
struct FileCursor {
    file_name: String,
    reader: BinlogReader,
    checksum: bool,
}

pub struct BinlogDumper<'a, S> {
    config: Arc<BridgeConfig>,
    index: BinlogIndex,
    channel: &'a mut PacketChannel<S>,
    request: BinlogDumpRequest,
    session: SessionVars,
    metric: Arc<DumperMetric>,
    cancel: CancellationToken,
    executed: Option<GtidSet>,
    /// 클라이언트가 이미 실행한 트랜잭션을 건너뛰는 중
    skipping: bool,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> BinlogDumper<'a, S> {
    pub fn new(
        config: Arc<BridgeConfig>,
        channel: &'a mut PacketChannel<S>,
        request: BinlogDumpRequest,
        session: SessionVars,
        metric: Arc<DumperMetric>,
        cancel: CancellationToken,
    ) -> Self {
        let executed = request.executed.as_ref().map(|m| GtidSet::from_messages(m));
        BinlogDumper {
            index: BinlogIndex::new(&config.binlog_dir),
            config,
            channel,
            request,
            session,
            metric,
            cancel,
            executed,
            skipping: false,
        }
    }

    /// 덤프 실행, 클라이언트에게 보낼 수 있는 에러는 ERR 패킷으로 알림
    pub async fn run(mut self) -> Result<()> {
        match self.dump().await {
            Err(BridgeError::Dump { code, message }) => {
                warn!(client = %self.metric.client, "binlog dump failed: {}", message);
                self.channel.write_error(code, &message).await?;
                Err(BridgeError::Dump { code, message })
            }
            other => other,
        }
    }

    async fn dump(&mut self) -> Result<()> {
        let (file_name, position) = self.start_position()?;
        info!(
            client = %self.metric.client,
            "start binlog dump from {}:{} (gtid mode: {})",
            file_name,
            position,
            self.executed.is_some()
        );

        let mut cursor = self.open(&file_name)?;
        self.validate_position(&mut cursor, position)?;

        let fake = BinlogEvent::Rotate(RotateEvent::fake(self.config.server_id, &file_name, position, cursor.checksum));
        self.send_event(&fake.serialize(cursor.checksum)).await?;
        if position > BINLOG_MAGIC.len() as u64 {
            self.send_format_description(&mut cursor).await?;
            cursor.reader.seek(position);
        }
        self.stream(cursor).await
    }

    /// 요청에서 시작 파일과 위치 결정
    fn start_position(&self) -> Result<(String, u64)> {
        let records = self.index.fetch_all(true)?;
        if let Some(executed) = &self.executed {
            return self.find_gtid_start(&records, executed).map(|f| (f, BINLOG_MAGIC.len() as u64));
        }
        if self.request.position < BINLOG_MAGIC.len() as u64 {
            return Err(BridgeError::dump(ERR_POSITION_TOO_SMALL));
        }
        if self.request.file_name.is_empty() {
            return match records.first() {
                Some(first) => Ok((first.file_name.clone(), self.request.position)),
                None => Err(BridgeError::dump(ERR_FIRST_LOG_NOT_FOUND)),
            };
        }
        match records.iter().find(|r| r.file_name == self.request.file_name) {
            Some(record) => Ok((record.file_name.clone(), self.request.position)),
            None => Err(BridgeError::dump(ERR_FIRST_LOG_NOT_FOUND)),
        }
    }

    /// 뒤에서부터 PREVIOUS_GTIDS가 클라이언트 집합에 포함되는 첫 파일
    fn find_gtid_start(&self, records: &[BinlogIndexRecord], executed: &GtidSet) -> Result<String> {
        for record in records.iter().rev() {
            let path = self.index.binlog_path(&record.file_name);
            let previous = match BinlogParser::previous_gtids(&path) {
                Ok(previous) => GtidSet::from_messages(&previous),
                Err(e) => {
                    debug!("skip {} while searching gtid start: {}", record.file_name, e);
                    continue;
                }
            };
            if previous.is_subset(executed) {
                return Ok(record.file_name.clone());
            }
        }
        Err(BridgeError::dump(ERR_GTID_PURGED))
    }

    fn path(&self, file_name: &str) -> PathBuf {
        self.index.binlog_path(file_name)
    }

    /// 파일을 열고 FDE로 체크섬 설정 확인
    fn open(&self, file_name: &str) -> Result<FileCursor> {
        let path = self.path(file_name);
        if !path.is_file() {
            return Err(BridgeError::dump(ERR_OPEN_FAILED));
        }
        let mut reader = BinlogReader::open(&path).map_err(|e| match e {
            BridgeError::Io(_) => BridgeError::dump(ERR_OPEN_FAILED),
            _ => BridgeError::dump(ERR_BAD_MAGIC),
        })?;
        let checksum = match reader.next_raw()? {
            Some(raw) => match BinlogEvent::deserialize(&raw.data, false)? {
                BinlogEvent::FormatDescription(fde) => fde.checksum_alg == ChecksumAlg::Crc32,
                _ => return Err(BridgeError::dump(ERR_BAD_MAGIC)),
            },
            None => return Err(BridgeError::dump(ERR_OPEN_FAILED)),
        };
        if checksum && !self.session.checksum {
            return Err(BridgeError::dump(ERR_CHECKSUM_UNSUPPORTED));
        }
        reader.seek(BINLOG_MAGIC.len() as u64);
        Ok(FileCursor { file_name: file_name.to_string(), reader, checksum })
    }

    /// 시작 위치가 이벤트 경계인지 앞에서부터 따라가며 확인
    fn validate_position(&self, cursor: &mut FileCursor, position: u64) -> Result<()> {
        let illegal = || BridgeError::dump(format!("The offset of the current subscription is illegal,offset:{}", position));
        while cursor.reader.position() < position {
            let Some(raw) = cursor.reader.next_raw()? else {
                return Err(illegal());
            };
            if cursor.checksum {
                verify_checksum(&raw.data).map_err(|e| checksum_error(&cursor.file_name, &raw, e))?;
            }
        }
        if cursor.reader.position() != position {
            return Err(illegal());
        }
        cursor.reader.seek(BINLOG_MAGIC.len() as u64);
        Ok(())
    }

    /// 중간 위치에서 시작할 때 파일의 FDE를 log_pos 0으로 보냄
    async fn send_format_description(&mut self, cursor: &mut FileCursor) -> Result<()> {
        cursor.reader.seek(BINLOG_MAGIC.len() as u64);
        let Some(raw) = cursor.reader.next_raw()? else {
            return Err(BridgeError::dump(ERR_OPEN_FAILED));
        };
        let mut fde = BinlogEvent::deserialize(&raw.data, false)?;
        fde.header_mut().next_position = 0;
        self.send_event(&fde.serialize(cursor.checksum)).await
    }

    async fn send_event(&mut self, data: &[u8]) -> Result<()> {
        let mut packet = BytesMut::with_capacity(data.len() + 1);
        packet.put_u8(0x00);
        packet.put_slice(data);
        self.channel.write_packet(&packet).await?;
        self.metric.record_io();
        Ok(())
    }

    /// 클라이언트가 이미 실행한 트랜잭션이면 건너뜀
    fn should_skip(&mut self, raw: &RawEvent, checksum: bool) -> Result<bool> {
        let Some(executed) = &self.executed else {
            return Ok(false);
        };
        match raw.header.event_type {
            EventType::Gtid => {
                if let BinlogEvent::Gtid(gtid) = BinlogEvent::deserialize(&raw.data, checksum)? {
                    self.skipping = executed.contains(&gtid.sid, gtid.gno);
                }
                Ok(self.skipping)
            }
            EventType::Rotate | EventType::FormatDescription | EventType::PreviousGtids => {
                self.skipping = false;
                Ok(false)
            }
            _ => Ok(self.skipping),
        }
    }

    async fn stream(&mut self, mut cursor: FileCursor) -> Result<()> {
        let heartbeat = self.session.heartbeat_period.unwrap_or_else(|| self.config.heartbeat_interval());
        let mut last_sent = Instant::now();
        let mut index_poll = IndexPoll::new(Duration::from_micros(self.config.next_file_wait_us));

        loop {
            if self.cancel.is_cancelled() {
                info!(client = %self.metric.client, "binlog dump cancelled");
                return Ok(());
            }

            if let Some(raw) = cursor.reader.next_raw()? {
                if cursor.checksum {
                    verify_checksum(&raw.data).map_err(|e| checksum_error(&cursor.file_name, &raw, e))?;
                }
                if self.should_skip(&raw, cursor.checksum)? {
                    continue;
                }
                self.send_event(&raw.data).await?;
                self.metric.record_event(raw.header.timestamp);
                last_sent = Instant::now();

                if raw.header.event_type == EventType::Rotate {
                    if let BinlogEvent::Rotate(rotate) = BinlogEvent::deserialize(&raw.data, cursor.checksum)? {
                        cursor = self.next_file(&rotate.next_file).await?;
                        cursor.reader.seek(rotate.position.max(BINLOG_MAGIC.len() as u64));
                    }
                }
                continue;
            }

            // 현재 파일 끝
            if self.request.non_blocking() {
                self.channel.write_eof().await?;
                info!(client = %self.metric.client, "non-blocking dump reached {}:{}", cursor.file_name, cursor.reader.position());
                return Ok(());
            }

            // ROTATE 없이 다음 파일이 생긴 경우 (이미 기록된 ROTATE를 재사용한 복구 등)
            // 인덱스 잠금은 파일을 끝까지 읽었을 때만, next_file_wait_us 간격으로 잡음
            if cursor.reader.position() >= cursor.reader.file_len()? && index_poll.due() {
                if let Some(next) = self.index.next_after(&cursor.file_name)? {
                    let file_name = next.file_name;
                    cursor = self.next_file(&file_name).await?;
                    let fake = BinlogEvent::Rotate(RotateEvent::fake(
                        self.config.server_id,
                        &file_name,
                        BINLOG_MAGIC.len() as u64,
                        cursor.checksum,
                    ));
                    self.send_event(&fake.serialize(cursor.checksum)).await?;
                    continue;
                }
            }

            if last_sent.elapsed() >= heartbeat {
                let event = BinlogEvent::Heartbeat(HeartbeatEvent::new(
                    0,
                    self.config.server_id,
                    &cursor.file_name,
                    cursor.reader.position(),
                    cursor.checksum,
                ));
                self.send_event(&event.serialize(cursor.checksum)).await?;
                debug!(client = %self.metric.client, "heartbeat at {}:{}", cursor.file_name, cursor.reader.position());
                last_sent = Instant::now();
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.tail_poll_interval()) => {}
            }
        }
    }

    /// 다음 파일이 만들어질 때까지 잠시 기다린 후 열기
    async fn next_file(&mut self, file_name: &str) -> Result<FileCursor> {
        let path = self.path(file_name);
        let wait = Duration::from_micros(self.config.next_file_wait_us);
        for _ in 0..self.config.next_file_wait_rounds {
            let ready = std::fs::metadata(&path)
                .map(|m| m.len() >= (BINLOG_MAGIC.len() + format_description_len()) as u64)
                .unwrap_or(false);
            if ready {
                debug!(client = %self.metric.client, "switch to next binlog {}", file_name);
                return self.open(file_name);
            }
            tokio::time::sleep(wait).await;
        }
        Err(BridgeError::dump(ERR_NO_NEXT_LOG))
    }
}

/// 파일 끝에서 인덱스를 다시 확인하는 간격
struct IndexPoll {
    interval: Duration,
    last: Option<Instant>,
}

impl IndexPoll {
    fn new(interval: Duration) -> Self {
        IndexPoll { interval, last: None }
    }

    /// 확인할 차례면 시각을 갱신하고 true
    fn due(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn checksum_error(file_name: &str, raw: &RawEvent, err: BridgeError) -> BridgeError {
    BridgeError::dump(format!(
        "event read from binlog did not pass crc check; {} at {}: {}",
        file_name, raw.position, err
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::tests::{server_uuid, FileBuilder};
    use crate::gtid::{GtidMessage, TxnRange};
    use crate::index::TxnMapping;
    use crate::protocol::{is_eof_packet, is_error_packet, parse_error_packet, BINLOG_DUMP_NON_BLOCK};
    use std::path::Path;
    use tokio::io::DuplexStream;

    fn test_config(dir: &Path) -> BridgeConfig {
        BridgeConfig {
            binlog_dir: dir.join("data"),
            heartbeat_interval_us: 20_000,
            next_file_wait_rounds: 5,
            next_file_wait_us: 1_000,
            ..Default::default()
        }
    }

    fn write_file(config: &BridgeConfig, index: u64, builder: &FileBuilder) {
        std::fs::create_dir_all(&config.binlog_dir).unwrap();
        let name = config.binlog_file_name(index);
        builder.write(&config.binlog_dir.join(&name));
        let mut record = BinlogIndexRecord::new(name, index);
        record.current_mapping = TxnMapping::new("ob-1", 1);
        record.position = builder.buf.len() as u64;
        BinlogIndex::new(&config.binlog_dir).add(&record).unwrap();
    }

    fn request(file: &str, position: u64, flags: u16) -> BinlogDumpRequest {
        BinlogDumpRequest { position, flags, server_id: 2, file_name: file.to_string(), executed: None }
    }

    fn session() -> SessionVars {
        SessionVars { checksum: true, heartbeat_period: None }
    }

    /// 서버 측 덤프를 백그라운드로 실행하고 클라이언트 채널 반환
    fn spawn_dump(
        config: BridgeConfig,
        request: BinlogDumpRequest,
        session: SessionVars,
        cancel: CancellationToken,
    ) -> (PacketChannel<DuplexStream>, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let task = tokio::spawn(async move {
            let mut channel = PacketChannel::new(server);
            let metric = Arc::new(DumperMetric::new("test"));
            BinlogDumper::new(Arc::new(config), &mut channel, request, session, metric, cancel)
                .run()
                .await
        });
        (PacketChannel::new(client), task)
    }

    /// 이벤트 패킷 → 이벤트 타입
    async fn next_type(client: &mut PacketChannel<DuplexStream>) -> EventType {
        let packet = client.read_packet().await.unwrap();
        assert_eq!(packet[0], 0x00, "unexpected packet {:?}", packet);
        EventType::from_u8(packet[1 + 4])
    }

    fn two_transactions() -> FileBuilder {
        let mut builder = FileBuilder::new(true, None);
        builder.txn(1).txn(2);
        builder
    }

    const TXN: [EventType; 5] = [
        EventType::Gtid,
        EventType::Query,
        EventType::TableMap,
        EventType::WriteRows,
        EventType::Xid,
    ];

    #[tokio::test]
    async fn test_dump_from_start_then_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_file(&config, 1, &two_transactions());

        let cancel = CancellationToken::new();
        let (mut client, task) = spawn_dump(config, request("mysql-bin.000001", 4, 0), session(), cancel.clone());

        assert_eq!(next_type(&mut client).await, EventType::Rotate);
        assert_eq!(next_type(&mut client).await, EventType::FormatDescription);
        assert_eq!(next_type(&mut client).await, EventType::PreviousGtids);
        for _ in 0..2 {
            for expected in TXN {
                assert_eq!(next_type(&mut client).await, expected);
            }
        }
        let heartbeat = tokio::time::timeout(Duration::from_secs(5), next_type(&mut client)).await.unwrap();
        assert_eq!(heartbeat, EventType::Heartbeat);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_non_blocking_dump_from_middle() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut builder = FileBuilder::new(true, None);
        builder.txn(1);
        let second_txn = builder.pos;
        builder.txn(2);
        write_file(&config, 1, &builder);

        let cancel = CancellationToken::new();
        let (mut client, task) = spawn_dump(
            config,
            request("mysql-bin.000001", second_txn, BINLOG_DUMP_NON_BLOCK),
            session(),
            cancel,
        );

        assert_eq!(next_type(&mut client).await, EventType::Rotate);
        let fde = client.read_packet().await.unwrap();
        assert_eq!(EventType::from_u8(fde[5]), EventType::FormatDescription);
        // log_pos 0
        assert_eq!(&fde[1 + 13..1 + 17], &[0, 0, 0, 0]);
        assert!(verify_checksum(&fde[1..]).is_ok());
        for expected in TXN {
            assert_eq!(next_type(&mut client).await, expected);
        }
        assert!(is_eof_packet(&client.read_packet().await.unwrap()));
        assert!(task.await.unwrap().is_ok());
    }

    async fn expect_error(config: BridgeConfig, request: BinlogDumpRequest, session: SessionVars) -> (u16, String) {
        let (mut client, task) = spawn_dump(config, request, session, CancellationToken::new());
        let mut packet = client.read_packet().await.unwrap();
        // 가짜 ROTATE 이후 에러가 날 수도 있음
        while !is_error_packet(&packet) {
            packet = client.read_packet().await.unwrap();
        }
        assert!(task.await.unwrap().is_err());
        parse_error_packet(&packet).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_start_positions() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let builder = two_transactions();
        write_file(&config, 1, &builder);

        let (code, message) = expect_error(config.clone(), request("mysql-bin.000001", 2, 0), session()).await;
        assert_eq!(code, 1236);
        assert_eq!(message, ERR_POSITION_TOO_SMALL);

        let (_, message) = expect_error(config.clone(), request("mysql-bin.000001", 100, 0), session()).await;
        assert_eq!(message, "The offset of the current subscription is illegal,offset:100");

        let past_end = builder.pos + 10;
        let (_, message) = expect_error(config.clone(), request("mysql-bin.000001", past_end, 0), session()).await;
        assert_eq!(message, format!("The offset of the current subscription is illegal,offset:{}", past_end));

        let no_checksum = SessionVars { checksum: false, heartbeat_period: None };
        let (_, message) = expect_error(config.clone(), request("mysql-bin.000001", 4, 0), no_checksum).await;
        assert_eq!(message, ERR_CHECKSUM_UNSUPPORTED);

        let (_, message) = expect_error(config, request("mysql-bin.000009", 4, 0), session()).await;
        assert_eq!(message, ERR_FIRST_LOG_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_magic_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        write_file(&config, 1, &two_transactions());
        std::fs::write(config.binlog_path(1), b"not a binlog").unwrap();
        let (_, message) = expect_error(config.clone(), request("mysql-bin.000001", 4, 0), session()).await;
        assert_eq!(message, ERR_BAD_MAGIC);

        std::fs::remove_file(config.binlog_path(1)).unwrap();
        let (_, message) = expect_error(config, request("mysql-bin.000001", 4, 0), session()).await;
        assert_eq!(message, ERR_OPEN_FAILED);
    }

    #[tokio::test]
    async fn test_gtid_exclusion_and_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let mut first = FileBuilder::new(true, None);
        first.txn(1).txn(2).txn(3);
        let mut rotate = BinlogEvent::Rotate(RotateEvent::new(0, 1, "mysql-bin.000002", 4));
        first.pos = rotate.seal(first.pos, true);
        rotate.write_to(&mut first.buf, true);
        write_file(&config, 1, &first);

        let mut second = FileBuilder::new(true, Some(TxnRange { start: 1, end: 4 }));
        second.txn(4).txn(5).txn(6).txn(7);
        write_file(&config, 2, &second);

        let mut request = request("", 4, BINLOG_DUMP_NON_BLOCK);
        request.executed = Some(vec![GtidMessage::with_range(server_uuid(), 1, 5)]);
        let (mut client, task) = spawn_dump(config, request, session(), CancellationToken::new());

        // 두 번째 파일의 PREVIOUS_GTIDS [1,4)가 포함되므로 두 번째 파일부터 시작
        assert_eq!(next_type(&mut client).await, EventType::Rotate);
        assert_eq!(next_type(&mut client).await, EventType::FormatDescription);
        assert_eq!(next_type(&mut client).await, EventType::PreviousGtids);

        let mut gnos = Vec::new();
        loop {
            let packet = client.read_packet().await.unwrap();
            if is_eof_packet(&packet) {
                break;
            }
            if EventType::from_u8(packet[5]) == EventType::Gtid {
                if let BinlogEvent::Gtid(gtid) = BinlogEvent::deserialize(&packet[1..], true).unwrap() {
                    gnos.push(gtid.gno);
                }
            }
        }
        assert_eq!(gnos, vec![5, 6, 7]);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_follows_rotate_into_next_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let mut first = FileBuilder::new(true, None);
        first.txn(1);
        let mut rotate = BinlogEvent::Rotate(RotateEvent::new(0, 1, "mysql-bin.000002", 4));
        first.pos = rotate.seal(first.pos, true);
        rotate.write_to(&mut first.buf, true);
        write_file(&config, 1, &first);
        let mut second = FileBuilder::new(true, Some(TxnRange { start: 1, end: 2 }));
        second.txn(2);
        write_file(&config, 2, &second);

        let (mut client, task) = spawn_dump(
            config,
            request("mysql-bin.000001", 4, BINLOG_DUMP_NON_BLOCK),
            session(),
            CancellationToken::new(),
        );
        let mut types = Vec::new();
        loop {
            let packet = client.read_packet().await.unwrap();
            if is_eof_packet(&packet) {
                break;
            }
            types.push(EventType::from_u8(packet[5]));
        }
        let fdes = types.iter().filter(|t| **t == EventType::FormatDescription).count();
        assert_eq!(fdes, 2);
        assert_eq!(types.iter().filter(|t| **t == EventType::Gtid).count(), 2);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_gtid_purged() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut builder = FileBuilder::new(true, Some(TxnRange { start: 1, end: 10 }));
        builder.txn(10);
        write_file(&config, 5, &builder);

        let mut request = request("", 4, 0);
        request.executed = Some(vec![GtidMessage::with_range(server_uuid(), 1, 3)]);
        let (_, message) = expect_error(config, request, session()).await;
        assert_eq!(message, ERR_GTID_PURGED);
    }

    #[test]
    fn test_index_poll_backs_off() {
        let mut poll = IndexPoll::new(Duration::from_millis(200));
        assert!(poll.due());
        assert!(!poll.due());
        assert!(!poll.due());

        let mut poll = IndexPoll::new(Duration::from_millis(1));
        assert!(poll.due());
        std::thread::sleep(Duration::from_millis(5));
        assert!(poll.due());
    }

    #[tokio::test]
    async fn test_tail_switches_to_new_file_without_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut first = FileBuilder::new(true, None);
        first.txn(1);
        write_file(&config, 1, &first);

        let cancel = CancellationToken::new();
        let (mut client, task) =
            spawn_dump(config.clone(), request("mysql-bin.000001", 4, 0), session(), cancel.clone());
        assert_eq!(next_type(&mut client).await, EventType::Rotate);
        assert_eq!(next_type(&mut client).await, EventType::FormatDescription);
        assert_eq!(next_type(&mut client).await, EventType::PreviousGtids);
        for expected in TXN {
            assert_eq!(next_type(&mut client).await, expected);
        }

        let mut second = FileBuilder::new(true, Some(TxnRange { start: 1, end: 2 }));
        second.txn(2);
        write_file(&config, 2, &second);

        let switched = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match next_type(&mut client).await {
                    EventType::Heartbeat => continue,
                    other => return other,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(switched, EventType::Rotate);
        assert_eq!(next_type(&mut client).await, EventType::FormatDescription);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn test_metric_rates_reset() {
        let metric = DumperMetric::new("client");
        for _ in 0..10 {
            metric.record_event(0);
            metric.record_io();
        }
        let (rps, iops) = metric.sample();
        assert_eq!((rps, iops), (10, 10));
        assert_eq!(metric.sample(), (0, 0));
        assert_eq!(metric.delay_us(), 0);
        metric.record_event(1);
        assert!(metric.delay_us() > 0);
    }
}
