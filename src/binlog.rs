//! Binlog 파일 읽기 및 스캔
//!
//! 파일 구조: 4 바이트 매직 넘버 (0xfe 0x62 0x69 0x6e) + FORMAT_DESCRIPTION + PREVIOUS_GTIDS + 이벤트들.
//! 쓰기 도중의 파일을 읽을 수 있으므로 끝부분의 불완전한 이벤트는 에러가 아니라 "아직 없음"으로 취급합니다.

use crate::error::{BridgeError, Result};
use crate::events::*;
use crate::gtid::GtidMessage;
use bytes::BytesMut;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info, warn};

/// 파일에서 읽은 원본 이벤트
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// 파일 내 시작 위치
    pub position: u64,
    pub header: EventHeader,
    pub data: Vec<u8>,
}

impl RawEvent {
    pub fn end_position(&self) -> u64 {
        self.position + self.data.len() as u64
    }
}

/// Binlog 파일 순차 리더
pub struct BinlogReader {
    file: File,
    position: u64,
}

impl BinlogReader {
    /// 파일을 열고 매직 넘버 검증 후 첫 이벤트 위치(4)에 둡니다.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let mut magic = [0u8; 4];
        let read = read_fully(&mut file, &mut magic)?;
        BinlogParser::verify_magic(&magic[..read])?;
        Ok(BinlogReader { file, position: BINLOG_MAGIC.len() as u64 })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// 현재 위치의 이벤트 하나를 읽음
    ///
    /// 헤더나 본문이 아직 다 기록되지 않았으면 `None`을 반환하고 위치는 그대로 둡니다.
    pub fn next_raw(&mut self) -> Result<Option<RawEvent>> {
        let mut head = [0u8; EVENT_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(self.position))?;
        if read_fully(&mut self.file, &mut head)? < EVENT_HEADER_SIZE {
            return Ok(None);
        }
        let header = EventHeader::parse(&head)?;
        let len = header.event_length as usize;
        if len < EVENT_HEADER_SIZE {
            return Err(BridgeError::InvalidEvent(format!(
                "event at {} has invalid length {}",
                self.position, len
            )));
        }
        let mut data = vec![0u8; len];
        data[..EVENT_HEADER_SIZE].copy_from_slice(&head);
        if read_fully(&mut self.file, &mut data[EVENT_HEADER_SIZE..])? < len - EVENT_HEADER_SIZE {
            return Ok(None);
        }
        let raw = RawEvent { position: self.position, header, data };
        self.position += len as u64;
        Ok(Some(raw))
    }
}

/// 버퍼가 다 차거나 EOF일 때까지 읽고 읽은 바이트 수 반환
fn read_fully(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// 파일의 FDE 체크섬 설정을 따라가며 이벤트를 디코딩
///
/// UPDATE_ROWS 이미지를 나누기 위해 직전 TABLE_MAP을 기억합니다.
pub struct EventDecoder {
    checksum: bool,
    table_map: Option<TableMapEvent>,
}

impl EventDecoder {
    pub fn new(checksum: bool) -> Self {
        EventDecoder { checksum, table_map: None }
    }

    pub fn checksum(&self) -> bool {
        self.checksum
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<BinlogEvent> {
        let event = BinlogEvent::deserialize_with(data, self.checksum, self.table_map.as_ref())?;
        match &event {
            BinlogEvent::FormatDescription(fde) => {
                self.checksum = fde.checksum_alg == ChecksumAlg::Crc32;
            }
            BinlogEvent::TableMap(map) => self.table_map = Some(map.clone()),
            _ => {}
        }
        Ok(event)
    }
}

/// 파일 끝부분 스캔 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnScan {
    /// 마지막 완료 트랜잭션(또는 DDL, ROTATE) 직후 위치
    pub complete_pos: u64,
    /// 마지막으로 읽은 완전한 이벤트의 끝 위치
    pub end_pos: u64,
    /// 파일 끝에 불완전한 이벤트 바이트가 남아 있는지 여부
    pub torn_tail: bool,
    pub last_complete_txn_id: u64,
    pub start_complete_txn_id: u64,
    /// 파일의 마지막 GTID 이벤트
    pub last_gtid: Option<GtidEvent>,
    /// 마지막 XID 이후의 이벤트 수 (커밋되지 않은 트랜잭션)
    pub pending_events: u64,
    /// 마지막 완료 트랜잭션의 이벤트 수 (XID 제외)
    pub last_txn_events: u64,
    pub rotate_existed: bool,
    pub checksum: bool,
}

/// Binlog 파일 단위 스캔 기능
pub struct BinlogParser;

impl BinlogParser {
    /// Binlog 파일 헤더 검증
    pub fn verify_magic(data: &[u8]) -> Result<()> {
        if data.len() < 4 {
            return Err(BridgeError::InvalidEvent("Invalid binlog: too short".to_string()));
        }

        if data[0..4] == BINLOG_MAGIC[..] {
            Ok(())
        } else {
            Err(BridgeError::InvalidEvent("Invalid binlog magic number".to_string()))
        }
    }

    /// 파일 전체를 읽어 마지막 완료 트랜잭션 위치를 찾음
    ///
    /// BEGIN 이후 XID 전까지는 트랜잭션 안으로 보고, BEGIN이 아닌 QUERY는 DDL로 즉시 완료로 봅니다.
    /// 각 이벤트는 파일의 FDE 설정에 따라 CRC32를 검증합니다.
    pub fn last_complete_txn(path: impl AsRef<Path>) -> Result<TxnScan> {
        let path = path.as_ref();
        let mut reader = BinlogReader::open(path)?;
        let mut scan = TxnScan {
            complete_pos: BINLOG_MAGIC.len() as u64,
            end_pos: BINLOG_MAGIC.len() as u64,
            ..Default::default()
        };
        let mut within_transaction = false;
        let mut current_gtid = 0u64;
        let mut events_since_xid = 0u64;

        while let Some(raw) = reader.next_raw()? {
            if scan.checksum || raw.header.event_type == EventType::FormatDescription {
                if raw.header.event_type != EventType::FormatDescription
                    || raw.data.get(raw.data.len().saturating_sub(CHECKSUM_LEN + 1)) == Some(&(ChecksumAlg::Crc32 as u8))
                {
                    verify_checksum(&raw.data)?;
                }
            }

            match raw.header.event_type {
                EventType::FormatDescription => {
                    if let BinlogEvent::FormatDescription(fde) = BinlogEvent::deserialize(&raw.data, false)? {
                        scan.checksum = fde.checksum_alg == ChecksumAlg::Crc32;
                        debug!("Binlog file {} checksum: {:?}", path.display(), fde.checksum_alg);
                    }
                }
                EventType::Gtid => {
                    if let BinlogEvent::Gtid(gtid) = BinlogEvent::deserialize(&raw.data, scan.checksum)? {
                        current_gtid = gtid.gno;
                        scan.last_gtid = Some(gtid);
                    }
                    events_since_xid += 1;
                }
                EventType::Query => {
                    events_since_xid += 1;
                    if let BinlogEvent::Query(query) = BinlogEvent::deserialize(&raw.data, scan.checksum)? {
                        if query.is_begin() {
                            within_transaction = true;
                        } else {
                            scan.last_complete_txn_id = current_gtid;
                            if scan.start_complete_txn_id == 0 {
                                scan.start_complete_txn_id = current_gtid;
                            }
                        }
                    }
                }
                EventType::Xid => {
                    if !within_transaction {
                        return Err(BridgeError::Recovery(format!(
                            "XID without BEGIN at {} in {}",
                            raw.position,
                            path.display()
                        )));
                    }
                    within_transaction = false;
                    scan.last_complete_txn_id = current_gtid;
                    if scan.start_complete_txn_id == 0 {
                        scan.start_complete_txn_id = current_gtid;
                    }
                    scan.last_txn_events = events_since_xid;
                    events_since_xid = 0;
                }
                EventType::TableMap | EventType::WriteRows | EventType::UpdateRows | EventType::DeleteRows => {
                    events_since_xid += 1;
                }
                EventType::Rotate => scan.rotate_existed = true,
                _ => {}
            }

            if !within_transaction && raw.header.event_type != EventType::Gtid {
                scan.complete_pos = raw.end_position();
                // DDL은 XID 없이 완료되므로 대기 중인 이벤트가 없음
                events_since_xid = 0;
            }
            scan.end_pos = raw.end_position();
        }

        scan.pending_events = events_since_xid;
        scan.torn_tail = reader.file_len()? > scan.end_pos;
        if scan.torn_tail {
            warn!(
                "Binlog file {} has {} trailing bytes after the last complete event",
                path.display(),
                reader.file_len()? - scan.end_pos
            );
        }
        info!(
            "Scanned {}: complete_pos={}, last_complete_txn={}, pending_events={}",
            path.display(),
            scan.complete_pos,
            scan.last_complete_txn_id,
            scan.pending_events
        );
        Ok(scan)
    }

    /// 파일의 첫 PREVIOUS_GTIDS 이벤트 내용
    pub fn previous_gtids(path: impl AsRef<Path>) -> Result<Vec<GtidMessage>> {
        let mut reader = BinlogReader::open(path)?;
        let mut decoder = EventDecoder::new(false);
        while let Some(raw) = reader.next_raw()? {
            match decoder.decode(&raw.data)? {
                BinlogEvent::PreviousGtids(event) => return Ok(event.messages),
                BinlogEvent::FormatDescription(_) => continue,
                _ => break,
            }
        }
        Ok(Vec::new())
    }

    /// `from` 위치부터 `skip`개를 건너뛰고 최대 `limit`개의 이벤트를 읽음
    ///
    /// `from`이 4보다 크면 FDE를 먼저 읽어 체크섬 설정을 맞춥니다.
    pub fn read_events(
        path: impl AsRef<Path>,
        from: u64,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<(u64, BinlogEvent)>> {
        let mut reader = BinlogReader::open(path)?;
        let mut decoder = EventDecoder::new(false);
        if from > BINLOG_MAGIC.len() as u64 {
            if let Some(raw) = reader.next_raw()? {
                decoder.decode(&raw.data)?;
            }
            reader.seek(from);
        }

        let mut events = Vec::new();
        let mut index = 0usize;
        while events.len() < limit {
            let Some(raw) = reader.next_raw()? else { break };
            let event = decoder.decode(&raw.data)?;
            if index >= skip {
                events.push((raw.position, event));
            }
            index += 1;
        }
        Ok(events)
    }

    /// 파일의 FDE 체크섬 설정
    pub fn checksum_enabled(path: impl AsRef<Path>) -> Result<bool> {
        let mut reader = BinlogReader::open(path)?;
        match reader.next_raw()? {
            Some(raw) if raw.header.event_type == EventType::FormatDescription => {
                let alg = raw.data[raw.data.len() - CHECKSUM_LEN - 1];
                Ok(ChecksumAlg::from_u8(alg)? == ChecksumAlg::Crc32)
            }
            _ => Err(BridgeError::InvalidEvent("binlog file does not start with a format description".to_string())),
        }
    }
}

/// 파일 머리 (매직 + FDE + PREVIOUS_GTIDS) 길이
///
/// PREVIOUS_GTIDS에는 항상 서버 UUID 하나가 들어가고, 실행된 트랜잭션이 있으면 구간 하나를 가집니다.
pub fn file_header_len(checksum: bool, has_executed: bool) -> u64 {
    let messages_len = 8 + 16 + 8 + if has_executed { 16 } else { 0 };
    let checksum_len = if checksum { CHECKSUM_LEN } else { 0 };
    (BINLOG_MAGIC.len() + format_description_len() + EVENT_HEADER_SIZE + messages_len + checksum_len) as u64
}

/// 새 파일의 머리를 버퍼에 기록하고 파일 내 다음 위치를 반환
pub fn write_file_header(
    out: &mut BytesMut,
    timestamp: u32,
    server_id: u32,
    checksum: bool,
    messages: Vec<GtidMessage>,
) -> u64 {
    out.extend_from_slice(&BINLOG_MAGIC);
    let mut pos = BINLOG_MAGIC.len() as u64;
    let mut fde = BinlogEvent::FormatDescription(FormatDescriptionEvent::new(timestamp, server_id, checksum));
    pos = fde.seal(pos, checksum);
    fde.write_to(out, checksum);
    let mut previous = BinlogEvent::PreviousGtids(PreviousGtidsEvent::new(timestamp, server_id, messages));
    pos = previous.seal(pos, checksum);
    previous.write_to(out, checksum);
    pos
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gtid::TxnRange;
    use std::io::Write;
    use uuid::Uuid;

    pub(crate) fn server_uuid() -> Uuid {
        Uuid::parse_str("7bff0a2b-4a3c-11ee-b0c4-0242ac110002").unwrap()
    }

    /// 테스트용 파일 작성기: 트랜잭션 단위로 이벤트를 이어 씀
    pub(crate) struct FileBuilder {
        pub buf: BytesMut,
        pub pos: u64,
        pub checksum: bool,
    }

    impl FileBuilder {
        pub fn new(checksum: bool, executed: Option<TxnRange>) -> Self {
            let mut buf = BytesMut::new();
            let mut message = GtidMessage::new(server_uuid());
            if let Some(range) = executed {
                message.merge(&[range]);
            }
            let pos = write_file_header(&mut buf, 1_700_000_000, 1, checksum, vec![message]);
            FileBuilder { buf, pos, checksum }
        }

        pub fn push(&mut self, mut event: BinlogEvent) -> &mut Self {
            self.pos = event.seal(self.pos, self.checksum);
            event.write_to(&mut self.buf, self.checksum);
            self
        }

        pub fn begin(&mut self, gno: u64) -> &mut Self {
            self.push(BinlogEvent::Gtid(GtidEvent::new(1_700_000_000, 1, server_uuid(), gno)))
                .push(BinlogEvent::Query(QueryEvent::new(1_700_000_000, 1, 0, "", "BEGIN")))
        }

        pub fn insert(&mut self) -> &mut Self {
            let table_map = TableMapEvent {
                header: EventHeader::new(EventType::TableMap, 1_700_000_000, 1),
                table_id: 1,
                flags: TM_BIT_LEN_EXACT_F,
                schema: "db".to_string(),
                table: "t1".to_string(),
                column_types: vec![3],
                column_metadata: vec![],
                null_bitmap: vec![0xfe],
            };
            let rows = RowsEvent::new(
                EventType::WriteRows,
                1_700_000_000,
                1,
                1,
                1,
                None,
                Some(RowImage { null_bitmap: vec![0xfe], values: vec![1, 0, 0, 0] }),
            );
            self.push(BinlogEvent::TableMap(table_map)).push(BinlogEvent::WriteRows(rows))
        }

        pub fn commit(&mut self, xid: u64) -> &mut Self {
            self.push(BinlogEvent::Xid(XidEvent::new(1_700_000_000, 1, xid)))
        }

        pub fn txn(&mut self, gno: u64) -> &mut Self {
            self.begin(gno).insert().commit(gno)
        }

        pub fn write(&self, path: &Path) {
            let mut file = File::create(path).unwrap();
            file.write_all(&self.buf).unwrap();
        }
    }

    #[test]
    fn test_verify_magic() {
        let valid = vec![0xfe, 0x62, 0x69, 0x6e];
        assert!(BinlogParser::verify_magic(&valid).is_ok());

        let invalid = vec![0x00, 0x00, 0x00, 0x00];
        assert!(BinlogParser::verify_magic(&invalid).is_err());
        assert!(BinlogParser::verify_magic(&valid[..2]).is_err());
    }

    #[test]
    fn test_file_header_len_matches_writer() {
        for checksum in [true, false] {
            let mut buf = BytesMut::new();
            let end = write_file_header(&mut buf, 0, 1, checksum, vec![GtidMessage::new(server_uuid())]);
            assert_eq!(end, buf.len() as u64);
            assert_eq!(end, file_header_len(checksum, false));

            let mut buf = BytesMut::new();
            let end = write_file_header(
                &mut buf,
                0,
                1,
                checksum,
                vec![GtidMessage::with_range(server_uuid(), 1, 10)],
            );
            assert_eq!(end, file_header_len(checksum, true));
        }
        assert_eq!(file_header_len(true, true), 194);
        assert_eq!(file_header_len(false, true), 190);
    }

    #[test]
    fn test_last_complete_txn_with_partial_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mysql-bin.000001");
        let mut builder = FileBuilder::new(true, None);
        builder.txn(1).txn(2);
        let complete = builder.pos;
        builder.begin(3).insert();
        builder.write(&path);

        let scan = BinlogParser::last_complete_txn(&path).unwrap();
        assert_eq!(scan.complete_pos, complete);
        assert_eq!(scan.last_complete_txn_id, 2);
        assert_eq!(scan.start_complete_txn_id, 1);
        assert_eq!(scan.last_gtid.as_ref().map(|g| g.gno), Some(3));
        assert_eq!(scan.pending_events, 4);
        assert_eq!(scan.last_txn_events, 4);
        assert!(scan.checksum);
        assert!(!scan.rotate_existed);
        assert!(!scan.torn_tail);
    }

    #[test]
    fn test_ddl_completes_without_xid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mysql-bin.000001");
        let mut builder = FileBuilder::new(false, None);
        builder
            .txn(1)
            .push(BinlogEvent::Gtid(GtidEvent::new(0, 1, server_uuid(), 2)))
            .push(BinlogEvent::Query(QueryEvent::new(0, 1, 0, "db", "CREATE TABLE t2 (id INT)")));
        builder.write(&path);

        let scan = BinlogParser::last_complete_txn(&path).unwrap();
        assert_eq!(scan.complete_pos, builder.pos);
        assert_eq!(scan.last_complete_txn_id, 2);
        assert_eq!(scan.pending_events, 0);
        assert!(!scan.checksum);
    }

    #[test]
    fn test_torn_tail_ends_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mysql-bin.000001");
        let mut builder = FileBuilder::new(true, None);
        builder.txn(1);
        let complete = builder.pos;
        builder.begin(2);
        let cut = builder.buf.len() - 5;
        builder.buf.truncate(cut);
        builder.write(&path);

        let scan = BinlogParser::last_complete_txn(&path).unwrap();
        assert_eq!(scan.complete_pos, complete);
        assert!(scan.torn_tail);
    }

    #[test]
    fn test_corrupted_event_fails_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mysql-bin.000001");
        let mut builder = FileBuilder::new(true, None);
        builder.txn(1);
        let at = builder.buf.len() - 6;
        builder.buf[at] ^= 0xff;
        builder.write(&path);

        assert!(matches!(
            BinlogParser::last_complete_txn(&path),
            Err(BridgeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_previous_gtids_and_read_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mysql-bin.000002");
        let mut builder = FileBuilder::new(true, Some(TxnRange { start: 1, end: 5 }));
        builder.txn(5);
        builder.write(&path);

        let messages = BinlogParser::previous_gtids(&path).unwrap();
        assert_eq!(messages, vec![GtidMessage::with_range(server_uuid(), 1, 5)]);

        let events = BinlogParser::read_events(&path, 4, 0, 100).unwrap();
        assert_eq!(events.len(), 2 + 5);
        assert_eq!(events[0].0, 4);
        assert_eq!(events[2].1.event_type(), EventType::Gtid);

        let header = file_header_len(true, true);
        let page = BinlogParser::read_events(&path, header, 1, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].1.event_type(), EventType::Query);
        assert!(BinlogParser::checksum_enabled(&path).unwrap());
    }

    #[test]
    fn test_reader_waits_for_complete_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mysql-bin.000001");
        let mut builder = FileBuilder::new(false, None);
        builder.txn(1);
        let full = builder.buf.clone();
        builder.buf.truncate(full.len() - 3);
        builder.write(&path);

        let mut reader = BinlogReader::open(&path).unwrap();
        let mut count = 0;
        while reader.next_raw().unwrap().is_some() {
            count += 1;
        }
        // 마지막 XID는 아직 불완전
        assert_eq!(count, 2 + 4);
        let stalled = reader.position();

        std::fs::write(&path, &full).unwrap();
        let raw = reader.next_raw().unwrap().unwrap();
        assert_eq!(raw.position, stalled);
        assert_eq!(raw.header.event_type, EventType::Xid);
    }
}
