//! MySQL 프로토콜 패킷 처리 (서버 측)
//!
//! 패킷 = 3바이트 길이 + 1바이트 시퀀스 + 본문.
//! 16MB 이상의 본문은 여러 패킷으로 나누어 보냅니다.

use crate::column::{read_lcb, write_lcb};
use crate::error::{BridgeError, Result};
use crate::gtid::{decode_gtid_messages, GtidMessage};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use std::io::{Cursor, Read};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// 패킷 본문 최대 길이
pub const MAX_PACKET_LEN: usize = 0xFF_FFFF;

/// Command 코드
pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_INIT_DB: u8 = 0x02;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_PING: u8 = 0x0e;
    pub const COM_BINLOG_DUMP: u8 = 0x12;
    pub const COM_REGISTER_SLAVE: u8 = 0x15;
    pub const COM_BINLOG_DUMP_GTID: u8 = 0x1e;
}

/// COM_BINLOG_DUMP 플래그: 파일 끝에서 EOF를 보내고 종료
pub const BINLOG_DUMP_NON_BLOCK: u16 = 0x01;
/// COM_BINLOG_DUMP_GTID 플래그: 파일명/위치 대신 GTID로 시작
pub const BINLOG_THROUGH_GTID: u16 = 0x04;

pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
/// utf8mb4_general_ci
pub const DEFAULT_COLLATION: u8 = 45;

/// 텍스트 결과셋 컬럼 타입
pub const MYSQL_TYPE_LONGLONG: u8 = 0x08;
pub const MYSQL_TYPE_VAR_STRING: u8 = 0xfd;

/// MySQL 패킷 채널
pub struct PacketChannel<S> {
    stream: S,
    sequence: u8,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketChannel<S> {
    pub fn new(stream: S) -> Self {
        PacketChannel { stream, sequence: 0 }
    }

    /// 새 명령 시작 시 시퀀스 초기화
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// 패킷 읽기 (분할된 패킷은 이어붙임)
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        // Cursor 파싱용 동기 Read와 겹치지 않도록 여기서만 가져옴
        use tokio::io::AsyncReadExt;

        let mut body = Vec::new();
        loop {
            let mut header = [0u8; 4];
            self.stream.read_exact(&mut header).await?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = body.len();
            body.resize(start + length, 0);
            self.stream.read_exact(&mut body[start..]).await?;
            if length < MAX_PACKET_LEN {
                break;
            }
        }
        trace!(len = body.len(), "read packet");
        Ok(body)
    }

    /// 패킷 쓰기
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(MAX_PACKET_LEN) {
            self.write_frame(chunk).await?;
        }
        // 길이가 최대값의 배수면 빈 패킷으로 끝을 알림
        if data.len() % MAX_PACKET_LEN == 0 {
            self.write_frame(&[]).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_frame(&mut self, chunk: &[u8]) -> Result<()> {
        let len = chunk.len() as u32;
        let header = [len as u8, (len >> 8) as u8, (len >> 16) as u8, self.sequence];
        self.stream.write_all(&header).await?;
        self.stream.write_all(chunk).await?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    pub async fn write_ok(&mut self) -> Result<()> {
        self.write_packet(&ok_packet(0, 0)).await
    }

    pub async fn write_error(&mut self, code: u16, message: &str) -> Result<()> {
        self.write_packet(&error_packet(code, message)).await
    }

    pub async fn write_eof(&mut self) -> Result<()> {
        self.write_packet(&eof_packet()).await
    }

    /// 텍스트 결과셋 전송 (컬럼 정의 + 행, `None`은 NULL)
    pub async fn write_result_set(&mut self, columns: &[ResultColumn], rows: &[Vec<Option<String>>]) -> Result<()> {
        let mut count = BytesMut::new();
        write_lcb(&mut count, columns.len() as u64);
        self.write_packet(&count).await?;
        for column in columns {
            self.write_packet(&column.encode()).await?;
        }
        self.write_eof().await?;
        for row in rows {
            let mut packet = BytesMut::new();
            for value in row {
                match value {
                    Some(value) => put_lenenc_str(&mut packet, value.as_bytes()),
                    None => packet.put_u8(0xfb),
                }
            }
            self.write_packet(&packet).await?;
        }
        self.write_eof().await
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// 결과셋 컬럼 정의
#[derive(Debug, Clone)]
pub struct ResultColumn {
    pub name: String,
    pub column_type: u8,
}

impl ResultColumn {
    pub fn text(name: &str) -> Self {
        ResultColumn { name: name.to_string(), column_type: MYSQL_TYPE_VAR_STRING }
    }

    pub fn number(name: &str) -> Self {
        ResultColumn { name: name.to_string(), column_type: MYSQL_TYPE_LONGLONG }
    }

    /// ColumnDefinition41
    fn encode(&self) -> BytesMut {
        let mut out = BytesMut::new();
        put_lenenc_str(&mut out, b"def");
        put_lenenc_str(&mut out, b"");
        put_lenenc_str(&mut out, b"");
        put_lenenc_str(&mut out, b"");
        put_lenenc_str(&mut out, self.name.as_bytes());
        put_lenenc_str(&mut out, self.name.as_bytes());
        out.put_u8(0x0c);
        out.put_u16_le(DEFAULT_COLLATION as u16);
        out.put_u32_le(if self.column_type == MYSQL_TYPE_LONGLONG { 20 } else { 1024 });
        out.put_u8(self.column_type);
        out.put_u16_le(0);
        out.put_u8(0);
        out.put_u16_le(0);
        out
    }
}

pub fn put_lenenc_str(out: &mut BytesMut, data: &[u8]) {
    write_lcb(out, data.len() as u64);
    out.put_slice(data);
}

pub fn ok_packet(affected_rows: u64, last_insert_id: u64) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u8(0x00);
    write_lcb(&mut out, affected_rows);
    write_lcb(&mut out, last_insert_id);
    out.put_u16_le(SERVER_STATUS_AUTOCOMMIT);
    out.put_u16_le(0);
    out
}

/// ERR 패킷 (SQL state는 항상 HY000)
pub fn error_packet(code: u16, message: &str) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u8(0xff);
    out.put_u16_le(code);
    out.put_u8(b'#');
    out.put_slice(b"HY000");
    out.put_slice(message.as_bytes());
    out
}

pub fn eof_packet() -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u8(0xfe);
    out.put_u16_le(0);
    out.put_u16_le(SERVER_STATUS_AUTOCOMMIT);
    out
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFF
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0x00
}

/// EOF 패킷 확인
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFE && data.len() < 9
}

/// ERR 패킷 파싱 → (코드, 메시지)
pub fn parse_error_packet(data: &[u8]) -> Result<(u16, String)> {
    if !is_error_packet(data) || data.len() < 9 {
        return Err(BridgeError::Protocol("not an error packet".to_string()));
    }
    let code = u16::from_le_bytes([data[1], data[2]]);
    Ok((code, String::from_utf8_lossy(&data[9..]).to_string()))
}

/// COM_BINLOG_DUMP 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogDumpRequest {
    pub position: u64,
    pub flags: u16,
    pub server_id: u32,
    pub file_name: String,
    /// COM_BINLOG_DUMP_GTID로 전달된 실행 완료 GTID
    pub executed: Option<Vec<GtidMessage>>,
}

impl BinlogDumpRequest {
    pub fn non_blocking(&self) -> bool {
        self.flags & BINLOG_DUMP_NON_BLOCK != 0
    }

    /// COM_BINLOG_DUMP 본문 (명령 바이트 제외)
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let position = cursor.read_u32::<LittleEndian>()? as u64;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let mut name = Vec::new();
        cursor.read_to_end(&mut name)?;
        while name.last() == Some(&0) {
            name.pop();
        }
        Ok(BinlogDumpRequest {
            position,
            flags,
            server_id,
            file_name: String::from_utf8_lossy(&name).to_string(),
            executed: None,
        })
    }

    /// COM_BINLOG_DUMP_GTID 본문 (명령 바이트 제외)
    pub fn parse_gtid(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let flags = cursor.read_u16::<LittleEndian>()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let name_len = cursor.read_u32::<LittleEndian>()? as usize;
        let name = take_bytes(&mut cursor, name_len)?;
        let position = cursor.read_u64::<LittleEndian>()?;

        let executed = if flags & BINLOG_THROUGH_GTID != 0 {
            let size = cursor.read_u32::<LittleEndian>()? as usize;
            let gtid_data = take_bytes(&mut cursor, size)?;
            Some(decode_gtid_messages(&gtid_data)?)
        } else {
            None
        };
        Ok(BinlogDumpRequest {
            position,
            flags,
            server_id,
            file_name: String::from_utf8_lossy(&name).to_string(),
            executed,
        })
    }

    /// 테스트 클라이언트용 직렬화 (명령 바이트 포함)
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::new();
        match &self.executed {
            None => {
                out.put_u8(command::COM_BINLOG_DUMP);
                out.put_u32_le(self.position as u32);
                out.put_u16_le(self.flags);
                out.put_u32_le(self.server_id);
                out.put_slice(self.file_name.as_bytes());
            }
            Some(messages) => {
                out.put_u8(command::COM_BINLOG_DUMP_GTID);
                out.put_u16_le(self.flags | BINLOG_THROUGH_GTID);
                out.put_u32_le(self.server_id);
                out.put_u32_le(self.file_name.len() as u32);
                out.put_slice(self.file_name.as_bytes());
                out.put_u64_le(self.position);
                let mut data = BytesMut::new();
                crate::gtid::encode_gtid_messages(messages, &mut data);
                out.put_u32_le(data.len() as u32);
                out.put_slice(&data);
            }
        }
        out
    }
}

/// 텍스트 결과셋 행 파싱 (테스트 클라이언트용)
pub fn parse_text_row(data: &[u8]) -> Result<Vec<Option<String>>> {
    let mut cursor = Cursor::new(data);
    let mut values = Vec::new();
    while (cursor.position() as usize) < data.len() {
        if data[cursor.position() as usize] == 0xfb {
            cursor.set_position(cursor.position() + 1);
            values.push(None);
            continue;
        }
        let len = read_lcb(&mut cursor)? as usize;
        let value = take_bytes(&mut cursor, len)?;
        values.push(Some(String::from_utf8_lossy(&value).to_string()));
    }
    Ok(values)
}

/// 남은 바이트가 충분할 때만 `len` 바이트를 읽음
fn take_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let start = cursor.position() as usize;
    let available = cursor.get_ref().len().saturating_sub(start);
    if len > available {
        return Err(BridgeError::Truncated { needed: len, available });
    }
    let bytes = cursor.get_ref()[start..start + len].to_vec();
    cursor.set_position((start + len) as u64);
    Ok(bytes)
}

/// null로 끝나는 문자열 읽기
pub fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = reader.read_u8()?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes).map_err(|e| BridgeError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
}
