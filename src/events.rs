//! MySQL Binlog 이벤트 타입 및 바이너리 코덱
//!
//! 모든 이벤트는 19바이트 공통 헤더 + 본문 + (체크섬 사용 시) 4바이트 CRC32로 구성됩니다.
//! 헤더:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)

use crate::column::{bitmap_bytes, lcb_len, metadata_len, read_lcb, value_len, write_lcb};
use crate::error::{BridgeError, Result};
use crate::gtid::{decode_gtid_messages, encode_gtid_messages, gtid_messages_len, GtidMessage};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use uuid::Uuid;

pub const BINLOG_MAGIC: [u8; 4] = [0xfe, 0x62, 0x69, 0x6e]; // ".bin" in ASCII
pub const EVENT_HEADER_SIZE: usize = 19;
pub const CHECKSUM_LEN: usize = 4;
/// 헤더 내 event_length 필드 위치
pub const EVENT_LEN_OFFSET: usize = 9;
/// 헤더 내 flags 필드 위치
pub const FLAGS_OFFSET: usize = 17;

pub const BINLOG_VERSION: u16 = 4;
pub const SERVER_VERSION: &str = "5.7.38";
const SERVER_VERSION_LEN: usize = 50;

/// 헤더 기본 플래그
pub const DEFAULT_EVENT_FLAGS: u16 = 0x1;
pub const LOG_EVENT_BINLOG_IN_USE_F: u16 = 0x1;
pub const LOG_EVENT_ARTIFICIAL_F: u16 = 0x20;
pub const STMT_END_F: u16 = 0x1;
/// TABLE_MAP 플래그 (TM_BIT_LEN_EXACT_F)
pub const TM_BIT_LEN_EXACT_F: u16 = 0x1;

const Q_FLAGS2_CODE: u8 = 0;
const Q_CHARSET_CODE: u8 = 4;

/// MySQL 5.7의 이벤트 타입별 post-header 길이 (타입 1..=38)
const POST_HEADER_LENGTHS: [u8; 38] = [
    56, 13, 0, 8, 0, 18, 0, 4, 4, 4, 4, 18, 0, 0, 95, 0, 4, 26, 8, 0, 0, 0, 8, 8, 8, 2, 0, 0, 0,
    10, 10, 10, 42, 42, 0, 18, 52, 0,
];

/// FDE 본문 길이 (checksum_alg + 체크섬 자리 포함)
const FDE_BODY_LEN: usize = 2 + SERVER_VERSION_LEN + 4 + 1 + POST_HEADER_LENGTHS.len() + 1;
const GTID_BODY_LEN: usize = 42;
const QUERY_POST_HEADER_LEN: usize = 13;
const ROWS_POST_HEADER_LEN: usize = 10;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (BEGIN, DDL)
    Query = 2,
    /// 로테이션 이벤트 (새 binlog 파일)
    Rotate = 4,
    /// 포맷 설명 이벤트 (파일 첫 이벤트)
    FormatDescription = 15,
    /// 트랜잭션 커밋
    Xid = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMap = 19,
    /// 하트비트 (파일에 기록되지 않음)
    Heartbeat = 27,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRows = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRows = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRows = 32,
    /// GTID 이벤트 (Global Transaction ID)
    Gtid = 33,
    /// 익명 GTID 이벤트
    AnonymousGtid = 34,
    /// 이전 파일까지의 GTID 집합
    PreviousGtids = 35,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::Query,
            4 => EventType::Rotate,
            15 => EventType::FormatDescription,
            16 => EventType::Xid,
            19 => EventType::TableMap,
            27 => EventType::Heartbeat,
            30 => EventType::WriteRows,
            31 => EventType::UpdateRows,
            32 => EventType::DeleteRows,
            33 => EventType::Gtid,
            34 => EventType::AnonymousGtid,
            35 => EventType::PreviousGtids,
            _ => EventType::Unknown,
        }
    }

    /// SHOW BINLOG EVENTS의 Event_type 컬럼 이름
    pub fn name(&self) -> &'static str {
        match self {
            EventType::Unknown => "Unknown",
            EventType::Query => "Query",
            EventType::Rotate => "Rotate",
            EventType::FormatDescription => "Format_desc",
            EventType::Xid => "Xid",
            EventType::TableMap => "Table_map",
            EventType::Heartbeat => "Heartbeat",
            EventType::WriteRows => "Write_rows",
            EventType::UpdateRows => "Update_rows",
            EventType::DeleteRows => "Delete_rows",
            EventType::Gtid => "Gtid",
            EventType::AnonymousGtid => "Anonymous_Gtid",
            EventType::PreviousGtids => "Previous_gtids",
        }
    }
}

/// 체크섬 알고리즘 (FDE에 기록)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChecksumAlg {
    Off = 0,
    Crc32 = 1,
}

impl ChecksumAlg {
    pub fn from_u8(val: u8) -> Result<Self> {
        match val {
            0 => Ok(ChecksumAlg::Off),
            1 => Ok(ChecksumAlg::Crc32),
            other => Err(BridgeError::InvalidEvent(format!("unknown checksum algorithm {}", other))),
        }
    }

    pub fn from_enabled(checksum: bool) -> Self {
        if checksum {
            ChecksumAlg::Crc32
        } else {
            ChecksumAlg::Off
        }
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타입스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (바이트, 체크섬 포함)
    pub event_length: u32,
    /// 다음 이벤트의 파일 내 위치
    pub next_position: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    pub fn new(event_type: EventType, timestamp: u32, server_id: u32) -> Self {
        EventHeader {
            timestamp,
            event_type,
            server_id,
            event_length: 0,
            next_position: 0,
            flags: DEFAULT_EVENT_FLAGS,
        }
    }

    /// 이벤트 헤더 파싱
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(BridgeError::Truncated {
                needed: EVENT_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut cursor = Cursor::new(data);
        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let event_type = cursor.read_u8()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let event_length = cursor.read_u32::<LittleEndian>()?;
        let next_position = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        Ok(EventHeader {
            timestamp,
            event_type: EventType::from_u8(event_type),
            server_id,
            event_length,
            next_position,
            flags,
        })
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_u32_le(self.timestamp);
        out.put_u8(self.event_type as u8);
        out.put_u32_le(self.server_id);
        out.put_u32_le(self.event_length);
        out.put_u32_le(self.next_position);
        out.put_u16_le(self.flags);
    }

    /// 이 이벤트가 시작하는 파일 위치
    pub fn start_position(&self) -> u64 {
        (self.next_position as u64).saturating_sub(self.event_length as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptionEvent {
    pub header: EventHeader,
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub header_length: u8,
    pub post_header_lengths: Vec<u8>,
    pub checksum_alg: ChecksumAlg,
}

impl FormatDescriptionEvent {
    pub fn new(timestamp: u32, server_id: u32, checksum: bool) -> Self {
        let mut header = EventHeader::new(EventType::FormatDescription, timestamp, server_id);
        header.flags = LOG_EVENT_BINLOG_IN_USE_F;
        FormatDescriptionEvent {
            header,
            binlog_version: BINLOG_VERSION,
            server_version: SERVER_VERSION.to_string(),
            create_timestamp: timestamp,
            header_length: EVENT_HEADER_SIZE as u8,
            post_header_lengths: POST_HEADER_LENGTHS.to_vec(),
            checksum_alg: ChecksumAlg::from_enabled(checksum),
        }
    }

    fn body_len(&self) -> usize {
        2 + SERVER_VERSION_LEN + 4 + 1 + self.post_header_lengths.len() + 1
    }

    fn write_body(&self, out: &mut BytesMut) {
        out.put_u16_le(self.binlog_version);
        let mut version = [0u8; SERVER_VERSION_LEN];
        let bytes = self.server_version.as_bytes();
        let n = bytes.len().min(SERVER_VERSION_LEN);
        version[..n].copy_from_slice(&bytes[..n]);
        out.put_slice(&version);
        out.put_u32_le(self.create_timestamp);
        out.put_u8(self.header_length);
        out.put_slice(&self.post_header_lengths);
        out.put_u8(self.checksum_alg as u8);
    }

    fn parse_body(header: EventHeader, body: &[u8]) -> Result<Self> {
        if body.len() < 2 + SERVER_VERSION_LEN + 4 + 1 + 1 {
            return Err(BridgeError::InvalidEvent("Invalid format description event".to_string()));
        }
        let mut cursor = Cursor::new(body);
        let binlog_version = cursor.read_u16::<LittleEndian>()?;
        let mut version = [0u8; SERVER_VERSION_LEN];
        cursor.read_exact(&mut version)?;
        let end = version.iter().position(|b| *b == 0).unwrap_or(SERVER_VERSION_LEN);
        let server_version = String::from_utf8_lossy(&version[..end]).to_string();
        let create_timestamp = cursor.read_u32::<LittleEndian>()?;
        let header_length = cursor.read_u8()?;
        let pos = cursor.position() as usize;
        let post_header_lengths = body[pos..body.len() - 1].to_vec();
        let checksum_alg = ChecksumAlg::from_u8(body[body.len() - 1])?;
        Ok(FormatDescriptionEvent {
            header,
            binlog_version,
            server_version,
            create_timestamp,
            header_length,
            post_header_lengths,
            checksum_alg,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateEvent {
    pub header: EventHeader,
    /// 다음 파일에서 읽기 시작할 위치
    pub position: u64,
    pub next_file: String,
}

impl RotateEvent {
    pub fn new(timestamp: u32, server_id: u32, next_file: &str, position: u64) -> Self {
        RotateEvent {
            header: EventHeader::new(EventType::Rotate, timestamp, server_id),
            position,
            next_file: next_file.to_string(),
        }
    }

    /// 덤프 시작 시 클라이언트에게 보내는 가짜 ROTATE (파일에 기록되지 않음)
    pub fn fake(server_id: u32, next_file: &str, position: u64, checksum: bool) -> Self {
        let mut event = RotateEvent::new(0, server_id, next_file, position);
        event.header.flags = LOG_EVENT_ARTIFICIAL_F;
        event.header.event_length =
            (EVENT_HEADER_SIZE + 8 + next_file.len() + checksum_len(checksum)) as u32;
        event.header.next_position = 0;
        event
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidEvent {
    pub header: EventHeader,
    pub commit_flag: u8,
    pub sid: Uuid,
    pub gno: u64,
    pub ts_type: u8,
    pub last_committed: i64,
    pub sequence_number: i64,
}

impl GtidEvent {
    pub fn new(timestamp: u32, server_id: u32, sid: Uuid, gno: u64) -> Self {
        GtidEvent {
            header: EventHeader::new(EventType::Gtid, timestamp, server_id),
            commit_flag: 1,
            sid,
            gno,
            ts_type: 2,
            last_committed: 0,
            sequence_number: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousGtidsEvent {
    pub header: EventHeader,
    pub messages: Vec<GtidMessage>,
}

impl PreviousGtidsEvent {
    pub fn new(timestamp: u32, server_id: u32, messages: Vec<GtidMessage>) -> Self {
        PreviousGtidsEvent {
            header: EventHeader::new(EventType::PreviousGtids, timestamp, server_id),
            messages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEvent {
    pub header: EventHeader,
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub status_vars: Vec<u8>,
    pub schema: String,
    pub query: String,
}

impl QueryEvent {
    pub fn new(timestamp: u32, server_id: u32, thread_id: u32, schema: &str, query: &str) -> Self {
        QueryEvent {
            header: EventHeader::new(EventType::Query, timestamp, server_id),
            thread_id,
            exec_time: 0,
            error_code: 0,
            status_vars: default_status_vars(),
            schema: schema.to_string(),
            query: query.to_string(),
        }
    }

    pub fn is_begin(&self) -> bool {
        self.query == "BEGIN"
    }
}

/// Q_FLAGS2 = 0, Q_CHARSET = (utf8mb4_general_ci, utf8mb4_general_ci, utf8_bin)
fn default_status_vars() -> Vec<u8> {
    let mut vars = BytesMut::with_capacity(12);
    vars.put_u8(Q_FLAGS2_CODE);
    vars.put_u32_le(0);
    vars.put_u8(Q_CHARSET_CODE);
    vars.put_u16_le(45);
    vars.put_u16_le(45);
    vars.put_u16_le(83);
    vars.to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XidEvent {
    pub header: EventHeader,
    pub xid: u64,
}

impl XidEvent {
    pub fn new(timestamp: u32, server_id: u32, xid: u64) -> Self {
        XidEvent {
            header: EventHeader::new(EventType::Xid, timestamp, server_id),
            xid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapEvent {
    pub header: EventHeader,
    pub table_id: u64,
    pub flags: u16,
    pub schema: String,
    pub table: String,
    pub column_types: Vec<u8>,
    pub column_metadata: Vec<u8>,
    pub null_bitmap: Vec<u8>,
}

impl TableMapEvent {
    /// 컬럼별 메타데이터 조각
    pub fn column_meta(&self) -> Result<Vec<&[u8]>> {
        let mut metas = Vec::with_capacity(self.column_types.len());
        let mut pos = 0;
        for t in &self.column_types {
            let len = metadata_len(*t);
            if pos + len > self.column_metadata.len() {
                return Err(BridgeError::InvalidEvent(format!(
                    "table map metadata too short for {}.{}",
                    self.schema, self.table
                )));
            }
            metas.push(&self.column_metadata[pos..pos + len]);
            pos += len;
        }
        Ok(metas)
    }
}

/// 행 이미지 하나 (null 비트맵 + 값들)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowImage {
    pub null_bitmap: Vec<u8>,
    pub values: Vec<u8>,
}

impl RowImage {
    pub fn encoded_len(&self) -> usize {
        self.null_bitmap.len() + self.values.len()
    }

    pub fn is_null(&self, column: usize) -> bool {
        self.null_bitmap
            .get(column / 8)
            .map_or(false, |b| b & (1 << (column % 8)) != 0)
    }
}

/// WRITE/UPDATE/DELETE_ROWS v2 공통 구조
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowsEvent {
    pub header: EventHeader,
    pub table_id: u64,
    pub flags: u16,
    /// var-header 추가 데이터 (항상 비어 있음)
    pub extra_data: Vec<u8>,
    pub column_count: u64,
    /// 변경 전 이미지의 컬럼 존재 비트맵 (UPDATE/DELETE)
    pub columns_before: Option<Vec<u8>>,
    /// 변경 후 이미지의 컬럼 존재 비트맵 (INSERT/UPDATE)
    pub columns_after: Option<Vec<u8>>,
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
}

impl RowsEvent {
    pub fn new(
        event_type: EventType,
        timestamp: u32,
        server_id: u32,
        table_id: u64,
        column_count: u64,
        before: Option<RowImage>,
        after: Option<RowImage>,
    ) -> Self {
        let present = vec![0xffu8; bitmap_bytes(column_count as usize)];
        RowsEvent {
            header: EventHeader::new(event_type, timestamp, server_id),
            table_id,
            flags: STMT_END_F,
            extra_data: Vec::new(),
            column_count,
            columns_before: before.as_ref().map(|_| present.clone()),
            columns_after: after.as_ref().map(|_| present),
            before,
            after,
        }
    }

    fn body_len(&self) -> usize {
        ROWS_POST_HEADER_LEN
            + self.extra_data.len()
            + lcb_len(self.column_count)
            + self.columns_before.as_ref().map_or(0, |b| b.len())
            + self.columns_after.as_ref().map_or(0, |b| b.len())
            + self.before.as_ref().map_or(0, |r| r.encoded_len())
            + self.after.as_ref().map_or(0, |r| r.encoded_len())
    }

    fn write_body(&self, out: &mut BytesMut) {
        out.put_uint_le(self.table_id, 6);
        out.put_u16_le(self.flags);
        out.put_u16_le((2 + self.extra_data.len()) as u16);
        out.put_slice(&self.extra_data);
        write_lcb(out, self.column_count);
        if let Some(bitmap) = &self.columns_before {
            out.put_slice(bitmap);
        }
        if let Some(bitmap) = &self.columns_after {
            out.put_slice(bitmap);
        }
        for image in [&self.before, &self.after].into_iter().flatten() {
            out.put_slice(&image.null_bitmap);
            out.put_slice(&image.values);
        }
    }

    fn parse_body(header: EventHeader, body: &[u8], table_map: Option<&TableMapEvent>) -> Result<Self> {
        let mut cursor = Cursor::new(body);
        let table_id = cursor.read_u48::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let var_len = cursor.read_u16::<LittleEndian>()? as usize;
        let mut extra_data = vec![0u8; var_len.saturating_sub(2)];
        cursor.read_exact(&mut extra_data)?;
        let column_count = read_lcb(&mut cursor)?;
        let n_bytes = bitmap_bytes(column_count as usize);

        let (has_before, has_after) = match header.event_type {
            EventType::WriteRows => (false, true),
            EventType::DeleteRows => (true, false),
            _ => (true, true),
        };
        let mut read_bitmap = |present: bool| -> Result<Option<Vec<u8>>> {
            if !present {
                return Ok(None);
            }
            let mut bitmap = vec![0u8; n_bytes];
            cursor.read_exact(&mut bitmap)?;
            Ok(Some(bitmap))
        };
        let columns_before = read_bitmap(has_before)?;
        let columns_after = read_bitmap(has_after)?;

        let mut pos = cursor.position() as usize;
        let metas = match table_map {
            Some(map) if map.table_id == table_id => Some(map.column_meta()?),
            _ => None,
        };

        let mut read_image = |present: bool, last: bool| -> Result<Option<RowImage>> {
            if !present {
                return Ok(None);
            }
            if body.len() < pos + n_bytes {
                return Err(BridgeError::Truncated { needed: pos + n_bytes, available: body.len() });
            }
            let null_bitmap = body[pos..pos + n_bytes].to_vec();
            pos += n_bytes;
            let start = pos;
            match (&metas, table_map) {
                (Some(metas), Some(map)) => {
                    if map.column_types.len() != column_count as usize || metas.len() != map.column_types.len() {
                        return Err(BridgeError::InvalidEvent(format!(
                            "rows event has {} columns but table map {}.{} has {}",
                            column_count,
                            map.schema,
                            map.table,
                            map.column_types.len()
                        )));
                    }
                    for (i, t) in map.column_types.iter().enumerate() {
                        if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
                            continue;
                        }
                        let overrun = || {
                            BridgeError::InvalidEvent(format!(
                                "column {} of rows event for table {} runs past the event body",
                                i, table_id
                            ))
                        };
                        let len = value_len(*t, metas[i], &body[pos..])
                            .map_err(|e| if e.is_truncated() { overrun() } else { e })?;
                        if len > body.len() - pos {
                            return Err(overrun());
                        }
                        pos += len;
                    }
                }
                _ if last => pos = body.len(),
                _ => {
                    return Err(BridgeError::InvalidEvent(format!(
                        "update rows event for table {} needs its table map",
                        table_id
                    )));
                }
            }
            Ok(Some(RowImage { null_bitmap, values: body[start..pos].to_vec() }))
        };
        let before = read_image(has_before, !has_after)?;
        let after = read_image(has_after, true)?;

        if pos != body.len() {
            return Err(BridgeError::InvalidEvent(format!(
                "rows event has {} trailing bytes",
                body.len() - pos
            )));
        }

        Ok(RowsEvent {
            header,
            table_id,
            flags,
            extra_data,
            column_count,
            columns_before,
            columns_after,
            before,
            after,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatEvent {
    pub header: EventHeader,
    pub log_ident: String,
}

impl HeartbeatEvent {
    /// `position`은 현재 파일에서 클라이언트가 읽은 위치
    pub fn new(timestamp: u32, server_id: u32, log_ident: &str, position: u64, checksum: bool) -> Self {
        let mut header = EventHeader::new(EventType::Heartbeat, timestamp, server_id);
        header.event_length = (EVENT_HEADER_SIZE + log_ident.len() + checksum_len(checksum)) as u32;
        header.next_position = position as u32;
        HeartbeatEvent {
            header,
            log_ident: log_ident.to_string(),
        }
    }
}

/// 모든 Binlog 이벤트를 포함하는 열거형
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinlogEvent {
    FormatDescription(FormatDescriptionEvent),
    Rotate(RotateEvent),
    Gtid(GtidEvent),
    PreviousGtids(PreviousGtidsEvent),
    Query(QueryEvent),
    TableMap(TableMapEvent),
    WriteRows(RowsEvent),
    UpdateRows(RowsEvent),
    DeleteRows(RowsEvent),
    Xid(XidEvent),
    Heartbeat(HeartbeatEvent),
}

fn checksum_len(checksum: bool) -> usize {
    if checksum {
        CHECKSUM_LEN
    } else {
        0
    }
}

impl BinlogEvent {
    pub fn header(&self) -> &EventHeader {
        match self {
            BinlogEvent::FormatDescription(e) => &e.header,
            BinlogEvent::Rotate(e) => &e.header,
            BinlogEvent::Gtid(e) => &e.header,
            BinlogEvent::PreviousGtids(e) => &e.header,
            BinlogEvent::Query(e) => &e.header,
            BinlogEvent::TableMap(e) => &e.header,
            BinlogEvent::WriteRows(e) | BinlogEvent::UpdateRows(e) | BinlogEvent::DeleteRows(e) => &e.header,
            BinlogEvent::Xid(e) => &e.header,
            BinlogEvent::Heartbeat(e) => &e.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut EventHeader {
        match self {
            BinlogEvent::FormatDescription(e) => &mut e.header,
            BinlogEvent::Rotate(e) => &mut e.header,
            BinlogEvent::Gtid(e) => &mut e.header,
            BinlogEvent::PreviousGtids(e) => &mut e.header,
            BinlogEvent::Query(e) => &mut e.header,
            BinlogEvent::TableMap(e) => &mut e.header,
            BinlogEvent::WriteRows(e) | BinlogEvent::UpdateRows(e) | BinlogEvent::DeleteRows(e) => {
                &mut e.header
            }
            BinlogEvent::Xid(e) => &mut e.header,
            BinlogEvent::Heartbeat(e) => &mut e.header,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.header().event_type
    }

    fn body_len(&self) -> usize {
        match self {
            BinlogEvent::FormatDescription(e) => e.body_len(),
            BinlogEvent::Rotate(e) => 8 + e.next_file.len(),
            BinlogEvent::Gtid(_) => GTID_BODY_LEN,
            BinlogEvent::PreviousGtids(e) => gtid_messages_len(&e.messages),
            BinlogEvent::Query(e) => {
                QUERY_POST_HEADER_LEN + e.status_vars.len() + e.schema.len() + 1 + e.query.len()
            }
            BinlogEvent::TableMap(e) => {
                let n = e.column_types.len() as u64;
                6 + 2
                    + 1 + e.schema.len() + 1
                    + 1 + e.table.len() + 1
                    + lcb_len(n) + e.column_types.len()
                    + lcb_len(e.column_metadata.len() as u64) + e.column_metadata.len()
                    + e.null_bitmap.len()
            }
            BinlogEvent::WriteRows(e) | BinlogEvent::UpdateRows(e) | BinlogEvent::DeleteRows(e) => e.body_len(),
            BinlogEvent::Xid(_) => 8,
            BinlogEvent::Heartbeat(e) => e.log_ident.len(),
        }
    }

    /// FDE는 체크섬 사용 여부와 관계없이 알고리즘 바이트 뒤에 4바이트 자리를 가집니다.
    fn trailer_len(&self, checksum: bool) -> usize {
        match self {
            BinlogEvent::FormatDescription(_) => CHECKSUM_LEN,
            _ => checksum_len(checksum),
        }
    }

    /// 헤더 + 본문 + 체크섬 길이
    pub fn encoded_len(&self, checksum: bool) -> usize {
        EVENT_HEADER_SIZE + self.body_len() + self.trailer_len(checksum)
    }

    /// `cur_pos`에서 시작하는 이벤트로 길이와 next_position을 확정하고 새 위치 반환
    pub fn seal(&mut self, cur_pos: u64, checksum: bool) -> u64 {
        let len = self.encoded_len(checksum) as u64;
        let header = self.header_mut();
        header.event_length = len as u32;
        header.next_position = (cur_pos + len) as u32;
        cur_pos + len
    }

    /// 버퍼에 이벤트를 기록하고 기록한 바이트 수 반환
    pub fn write_to(&self, out: &mut BytesMut, checksum: bool) -> usize {
        let start = out.len();
        self.header().write_to(out);
        match self {
            BinlogEvent::FormatDescription(e) => e.write_body(out),
            BinlogEvent::Rotate(e) => {
                out.put_u64_le(e.position);
                out.put_slice(e.next_file.as_bytes());
            }
            BinlogEvent::Gtid(e) => {
                out.put_u8(e.commit_flag);
                out.put_slice(e.sid.as_bytes());
                out.put_u64_le(e.gno);
                out.put_u8(e.ts_type);
                out.put_i64_le(e.last_committed);
                out.put_i64_le(e.sequence_number);
            }
            BinlogEvent::PreviousGtids(e) => encode_gtid_messages(&e.messages, out),
            BinlogEvent::Query(e) => {
                out.put_u32_le(e.thread_id);
                out.put_u32_le(e.exec_time);
                out.put_u8(e.schema.len() as u8);
                out.put_u16_le(e.error_code);
                out.put_u16_le(e.status_vars.len() as u16);
                out.put_slice(&e.status_vars);
                out.put_slice(e.schema.as_bytes());
                out.put_u8(0);
                out.put_slice(e.query.as_bytes());
            }
            BinlogEvent::TableMap(e) => {
                out.put_uint_le(e.table_id, 6);
                out.put_u16_le(e.flags);
                out.put_u8(e.schema.len() as u8);
                out.put_slice(e.schema.as_bytes());
                out.put_u8(0);
                out.put_u8(e.table.len() as u8);
                out.put_slice(e.table.as_bytes());
                out.put_u8(0);
                write_lcb(out, e.column_types.len() as u64);
                out.put_slice(&e.column_types);
                write_lcb(out, e.column_metadata.len() as u64);
                out.put_slice(&e.column_metadata);
                out.put_slice(&e.null_bitmap);
            }
            BinlogEvent::WriteRows(e) | BinlogEvent::UpdateRows(e) | BinlogEvent::DeleteRows(e) => {
                e.write_body(out)
            }
            BinlogEvent::Xid(e) => out.put_u64_le(e.xid),
            BinlogEvent::Heartbeat(e) => out.put_slice(e.log_ident.as_bytes()),
        }

        match self {
            BinlogEvent::FormatDescription(e) => {
                // FDE 체크섬은 IN_USE 플래그를 지운 상태로 계산
                let mut copy = out[start..].to_vec();
                copy[FLAGS_OFFSET..FLAGS_OFFSET + 2].copy_from_slice(&[0, 0]);
                let crc = match e.checksum_alg {
                    ChecksumAlg::Crc32 => crc32fast::hash(&copy),
                    ChecksumAlg::Off => 0,
                };
                out.put_u32_le(crc);
            }
            _ if checksum => {
                let crc = crc32fast::hash(&out[start..]);
                out.put_u32_le(crc);
            }
            _ => {}
        }
        out.len() - start
    }

    pub fn serialize(&self, checksum: bool) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(self.encoded_len(checksum));
        self.write_to(&mut out, checksum);
        out.to_vec()
    }

    /// 버퍼 앞부분의 이벤트 하나를 디코딩
    pub fn deserialize(data: &[u8], checksum: bool) -> Result<Self> {
        Self::deserialize_with(data, checksum, None)
    }

    /// UPDATE_ROWS 이미지 분리를 위해 직전 TABLE_MAP을 함께 전달
    pub fn deserialize_with(data: &[u8], checksum: bool, table_map: Option<&TableMapEvent>) -> Result<Self> {
        let header = EventHeader::parse(data)?;
        let len = header.event_length as usize;
        if len < EVENT_HEADER_SIZE {
            return Err(BridgeError::InvalidEvent(format!("event length {} too small", len)));
        }
        if data.len() < len {
            return Err(BridgeError::Truncated { needed: len, available: data.len() });
        }
        let event = &data[..len];

        if header.event_type == EventType::FormatDescription {
            if len < EVENT_HEADER_SIZE + CHECKSUM_LEN + 1 {
                return Err(BridgeError::InvalidEvent("Invalid format description event".to_string()));
            }
            let fde = FormatDescriptionEvent::parse_body(header, &event[EVENT_HEADER_SIZE..len - CHECKSUM_LEN])?;
            if fde.checksum_alg == ChecksumAlg::Crc32 {
                verify_checksum(event)?;
            }
            return Ok(BinlogEvent::FormatDescription(fde));
        }

        let body_end = if checksum {
            if len < EVENT_HEADER_SIZE + CHECKSUM_LEN {
                return Err(BridgeError::InvalidEvent(format!("event length {} too small", len)));
            }
            verify_checksum(event)?;
            len - CHECKSUM_LEN
        } else {
            len
        };
        let body = &event[EVENT_HEADER_SIZE..body_end];
        let mut cursor = Cursor::new(body);

        let parsed = match header.event_type {
            EventType::Rotate => {
                let position = cursor.read_u64::<LittleEndian>()?;
                let next_file = String::from_utf8_lossy(&body[8..]).to_string();
                BinlogEvent::Rotate(RotateEvent { header, position, next_file })
            }
            EventType::Gtid | EventType::AnonymousGtid => {
                let commit_flag = cursor.read_u8()?;
                let mut sid = [0u8; 16];
                cursor.read_exact(&mut sid)?;
                let gno = cursor.read_u64::<LittleEndian>()?;
                let ts_type = cursor.read_u8()?;
                let last_committed = cursor.read_i64::<LittleEndian>()?;
                let sequence_number = cursor.read_i64::<LittleEndian>()?;
                BinlogEvent::Gtid(GtidEvent {
                    header,
                    commit_flag,
                    sid: Uuid::from_bytes(sid),
                    gno,
                    ts_type,
                    last_committed,
                    sequence_number,
                })
            }
            EventType::PreviousGtids => BinlogEvent::PreviousGtids(PreviousGtidsEvent {
                header,
                messages: decode_gtid_messages(body)?,
            }),
            EventType::Query => {
                let thread_id = cursor.read_u32::<LittleEndian>()?;
                let exec_time = cursor.read_u32::<LittleEndian>()?;
                let db_len = cursor.read_u8()? as usize;
                let error_code = cursor.read_u16::<LittleEndian>()?;
                let status_len = cursor.read_u16::<LittleEndian>()? as usize;
                let mut status_vars = vec![0u8; status_len];
                cursor.read_exact(&mut status_vars)?;
                let mut schema = vec![0u8; db_len];
                cursor.read_exact(&mut schema)?;
                // null terminator
                cursor.read_u8()?;
                let query = String::from_utf8_lossy(&body[cursor.position() as usize..]).to_string();
                BinlogEvent::Query(QueryEvent {
                    header,
                    thread_id,
                    exec_time,
                    error_code,
                    status_vars,
                    schema: String::from_utf8_lossy(&schema).to_string(),
                    query,
                })
            }
            EventType::Xid => BinlogEvent::Xid(XidEvent {
                header,
                xid: cursor.read_u64::<LittleEndian>()?,
            }),
            EventType::TableMap => {
                let table_id = cursor.read_u48::<LittleEndian>()?;
                let flags = cursor.read_u16::<LittleEndian>()?;
                let schema = read_name(&mut cursor)?;
                let table = read_name(&mut cursor)?;
                let column_count = read_lcb(&mut cursor)? as usize;
                let mut column_types = vec![0u8; column_count];
                cursor.read_exact(&mut column_types)?;
                let metadata_length = read_lcb(&mut cursor)? as usize;
                let mut column_metadata = vec![0u8; metadata_length];
                cursor.read_exact(&mut column_metadata)?;
                let mut null_bitmap = vec![0u8; bitmap_bytes(column_count)];
                cursor.read_exact(&mut null_bitmap)?;
                BinlogEvent::TableMap(TableMapEvent {
                    header,
                    table_id,
                    flags,
                    schema,
                    table,
                    column_types,
                    column_metadata,
                    null_bitmap,
                })
            }
            EventType::WriteRows => BinlogEvent::WriteRows(RowsEvent::parse_body(header, body, table_map)?),
            EventType::UpdateRows => BinlogEvent::UpdateRows(RowsEvent::parse_body(header, body, table_map)?),
            EventType::DeleteRows => BinlogEvent::DeleteRows(RowsEvent::parse_body(header, body, table_map)?),
            EventType::Heartbeat => BinlogEvent::Heartbeat(HeartbeatEvent {
                header,
                log_ident: String::from_utf8_lossy(body).to_string(),
            }),
            EventType::FormatDescription | EventType::Unknown => {
                return Err(BridgeError::InvalidEvent(format!(
                    "unsupported event type {}",
                    data[4]
                )));
            }
        };
        Ok(parsed)
    }

    /// SHOW BINLOG EVENTS의 Info 컬럼
    pub fn info(&self) -> String {
        match self {
            BinlogEvent::FormatDescription(e) => {
                format!("Server ver: {}, Binlog ver: {}", e.server_version, e.binlog_version)
            }
            BinlogEvent::Rotate(e) => format!("{};pos={}", e.next_file, e.position),
            BinlogEvent::Gtid(e) => format!("SET @@SESSION.GTID_NEXT= '{}:{}'", e.sid, e.gno),
            BinlogEvent::PreviousGtids(e) => e
                .messages
                .iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(","),
            BinlogEvent::Query(e) if e.schema.is_empty() || e.is_begin() => e.query.clone(),
            BinlogEvent::Query(e) => format!("use `{}`; {}", e.schema, e.query),
            BinlogEvent::TableMap(e) => format!("table_id: {} ({}.{})", e.table_id, e.schema, e.table),
            BinlogEvent::WriteRows(e) | BinlogEvent::UpdateRows(e) | BinlogEvent::DeleteRows(e) => {
                if e.flags & STMT_END_F != 0 {
                    format!("table_id: {} flags: STMT_END_F", e.table_id)
                } else {
                    format!("table_id: {}", e.table_id)
                }
            }
            BinlogEvent::Xid(e) => format!("COMMIT /* xid={} */", e.xid),
            BinlogEvent::Heartbeat(e) => e.log_ident.clone(),
        }
    }
}

/// 길이 1바이트 + 이름 + null
fn read_name(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u8()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    cursor.read_u8()?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// 이벤트 전체(헤더 + 본문 + CRC) 체크섬 검증
///
/// FDE는 IN_USE 플래그를 지운 상태로 계산합니다.
pub fn verify_checksum(event: &[u8]) -> Result<()> {
    if event.len() < EVENT_HEADER_SIZE + CHECKSUM_LEN {
        return Err(BridgeError::Truncated {
            needed: EVENT_HEADER_SIZE + CHECKSUM_LEN,
            available: event.len(),
        });
    }
    let split = event.len() - CHECKSUM_LEN;
    let expected = u32::from_le_bytes([event[split], event[split + 1], event[split + 2], event[split + 3]]);
    let actual = if event[4] == EventType::FormatDescription as u8 {
        let mut copy = event[..split].to_vec();
        copy[FLAGS_OFFSET..FLAGS_OFFSET + 2].copy_from_slice(&[0, 0]);
        crc32fast::hash(&copy)
    } else {
        crc32fast::hash(&event[..split])
    };
    if expected != actual {
        return Err(BridgeError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// FDE 이벤트 길이 (파일 헤더 계산용)
pub fn format_description_len() -> usize {
    EVENT_HEADER_SIZE + FDE_BODY_LEN + CHECKSUM_LEN
}
