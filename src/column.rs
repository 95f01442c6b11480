//! 컬럼 타입 및 행 값 인코딩
//!
//! CDC 레코드의 텍스트 값을 MySQL binlog 행 이미지 형식으로 변환합니다.
//! 테이블 맵 이벤트의 타입/메타데이터 변환과, 디코딩 시 값 길이 계산도 여기서 담당합니다.

use crate::error::{BridgeError, Result};
use crate::jsonb;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::warn;

/// MySQL 컬럼 타입 (binlog 타입 코드)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    VarChar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(val: u8) -> Option<Self> {
        use ColumnType::*;
        let t = match val {
            0 => Decimal,
            1 => Tiny,
            2 => Short,
            3 => Long,
            4 => Float,
            5 => Double,
            6 => Null,
            7 => Timestamp,
            8 => LongLong,
            9 => Int24,
            10 => Date,
            11 => Time,
            12 => DateTime,
            13 => Year,
            14 => NewDate,
            15 => VarChar,
            16 => Bit,
            17 => Timestamp2,
            18 => DateTime2,
            19 => Time2,
            245 => Json,
            246 => NewDecimal,
            247 => Enum,
            248 => Set,
            249 => TinyBlob,
            250 => MediumBlob,
            251 => LongBlob,
            252 => Blob,
            253 => VarString,
            254 => String,
            255 => Geometry,
            _ => return None,
        };
        Some(t)
    }
}

/// CDC 레코드가 전달하는 컬럼 정의
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    /// 문자 길이 (문자열 타입)
    #[serde(default)]
    pub length: u64,
    /// DECIMAL 정밀도, FLOAT 정밀도, BIT 비트 수
    #[serde(default)]
    pub precision: Option<u32>,
    /// DECIMAL 소수 자릿수, 시간 타입의 소수초 자릿수
    #[serde(default)]
    pub scale: u32,
    /// 문자셋 이름 (비어 있으면 utf8mb4)
    #[serde(default)]
    pub encoding: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// ENUM/SET 값 목록
    #[serde(default)]
    pub values: Vec<String>,
}

const MAX_VARCHAR_BYTES: u64 = 65_535;

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        ColumnDef {
            name: name.to_string(),
            column_type,
            length: 0,
            precision: None,
            scale: 0,
            encoding: String::new(),
            nullable: true,
            values: Vec::new(),
        }
    }

    /// 문자열 컬럼의 최대 바이트 길이
    ///
    /// 길이를 모르는 VARCHAR는 65535 바이트로 간주해 2바이트 길이 접두어를 씁니다.
    fn max_byte_len(&self) -> u64 {
        let len = self.length.saturating_mul(charset_encoding_bytes(&self.encoding) as u64);
        match self.column_type {
            ColumnType::VarChar | ColumnType::VarString if len == 0 => MAX_VARCHAR_BYTES,
            ColumnType::VarChar | ColumnType::VarString => len.min(MAX_VARCHAR_BYTES),
            _ => len,
        }
    }

    fn is_double_float(&self) -> bool {
        self.precision.map_or(false, |p| p > 24)
    }
}

/// 문자셋별 최대 문자 바이트 수
pub fn charset_encoding_bytes(charset: &str) -> u32 {
    match charset.to_ascii_lowercase().as_str() {
        "" => 4,
        "dec8" | "cp850" | "hp8" | "koi8r" | "latin1" | "latin2" | "swe7" | "ascii" | "hebrew"
        | "tis620" | "koi8u" | "greek" | "cp1250" | "latin5" | "armscii8" | "cp866"
        | "keybcs2" | "macce" | "macroman" | "cp852" | "latin7" | "cp1251" | "cp1256"
        | "cp1257" | "binary" | "geostd8" => 1,
        "big5" | "sjis" | "euckr" | "gb2312" | "gbk" | "ucs2" | "cp932" => 2,
        "ujis" | "utf8" | "utf8mb3" | "eucjpms" => 3,
        "utf8mb4" | "utf16" | "utf16le" | "utf32" | "gb18030" => 4,
        other => {
            warn!(charset = other, "non-mysql character set, assuming 4 bytes per char");
            4
        }
    }
}

/// 테이블 맵 이벤트에 기록할 binlog 타입 (MySQL 5.7 클라이언트 기준으로 축소)
pub fn binlog_type(column: &ColumnDef) -> ColumnType {
    use ColumnType::*;
    match column.column_type {
        TinyBlob | MediumBlob | LongBlob | Blob => Blob,
        VarString | VarChar => VarChar,
        DateTime | DateTime2 => DateTime2,
        Time | Time2 => Time2,
        Timestamp | Timestamp2 => Timestamp2,
        Enum | Set | String => String,
        Float if column.is_double_float() => Double,
        Decimal | NewDecimal => NewDecimal,
        NewDate => Date,
        other => other,
    }
}

/// 테이블 맵 메타데이터 기록, 기록한 바이트 수 반환
pub fn write_column_metadata(column: &ColumnDef, out: &mut BytesMut) -> usize {
    use ColumnType::*;
    match column.column_type {
        Bit => {
            let bits = column.precision.unwrap_or(1);
            out.put_u8((bits % 8) as u8);
            out.put_u8((bits / 8) as u8);
            2
        }
        Float => {
            out.put_u8(if column.is_double_float() { 8 } else { 4 });
            1
        }
        Double => {
            out.put_u8(8);
            1
        }
        String => {
            let len = column.max_byte_len();
            out.put_u8(String as u8 ^ ((len & 0x300) >> 4) as u8);
            out.put_u8((len & 0xff) as u8);
            2
        }
        VarString | VarChar => {
            out.put_u16_le(column.max_byte_len() as u16);
            2
        }
        Decimal | NewDecimal => {
            out.put_u8(decimal_precision(column) as u8);
            out.put_u8(column.scale as u8);
            2
        }
        Enum => {
            out.put_u8(Enum as u8);
            out.put_u8(enum_pack_len(column.values.len()) as u8);
            2
        }
        Set => {
            out.put_u8(Set as u8);
            out.put_u8(set_pack_len(column.values.len()) as u8);
            2
        }
        TinyBlob => {
            out.put_u8(1);
            1
        }
        Blob => {
            out.put_u8(2);
            1
        }
        MediumBlob => {
            out.put_u8(3);
            1
        }
        LongBlob | Json | Geometry => {
            out.put_u8(4);
            1
        }
        Timestamp | Timestamp2 | DateTime | DateTime2 | Time | Time2 => {
            out.put_u8(column.scale.min(6) as u8);
            1
        }
        Tiny | Short | Int24 | Long | LongLong | Null | Date | NewDate | Year => 0,
    }
}

/// binlog 타입별 테이블 맵 메타데이터 길이
pub fn metadata_len(binlog_type: u8) -> usize {
    match binlog_type {
        4 | 5 | 17 | 18 | 19 | 245 | 252 | 255 => 1,
        15 | 16 | 246 | 247 | 248 | 253 | 254 => 2,
        _ => 0,
    }
}

fn decimal_precision(column: &ColumnDef) -> u32 {
    column.precision.unwrap_or(10)
}

fn enum_pack_len(value_count: usize) -> usize {
    if value_count > 255 {
        2
    } else {
        1
    }
}

fn set_pack_len(value_count: usize) -> usize {
    ((value_count + 7) / 8).max(1)
}

/// 사용하지 않는 상위 비트를 1로 채운 비트맵 생성
///
/// `col_count`개의 컬럼에 해당하는 비트는 0, 마지막 바이트의 남는 비트는 1입니다.
pub fn fill_bitmap(col_count: usize, col_bytes: usize) -> Vec<u8> {
    let mut bitmap = vec![0u8; col_bytes];
    for bit in col_count..col_bytes * 8 {
        bitmap[bit / 8] |= 1 << (bit % 8);
    }
    bitmap
}

pub fn bitmap_bytes(col_count: usize) -> usize {
    (col_count + 7) / 8
}

/// Length-encoded 정수 쓰기
pub fn write_lcb(out: &mut BytesMut, value: u64) {
    if value < 251 {
        out.put_u8(value as u8);
    } else if value < (1 << 16) {
        out.put_u8(0xfc);
        out.put_u16_le(value as u16);
    } else if value < (1 << 24) {
        out.put_u8(0xfd);
        out.put_uint_le(value, 3);
    } else {
        out.put_u8(0xfe);
        out.put_u64_le(value);
    }
}

pub fn lcb_len(value: u64) -> usize {
    if value < 251 {
        1
    } else if value < (1 << 16) {
        3
    } else if value < (1 << 24) {
        4
    } else {
        9
    }
}

/// LCB (Length-Coded Binary) 읽기
pub fn read_lcb(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let byte = cursor.read_u8()?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        0xfb => Ok(0),
        0xfc => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        0xfe => Ok(cursor.read_u64::<LittleEndian>()?),
        0xff => Err(BridgeError::InvalidEvent("Invalid LCB value".to_string())),
    }
}

const DIG_PER_DEC: usize = 9;
const DIG2BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

/// DECIMAL(precision, scale)의 바이너리 길이
pub fn decimal_bin_size(precision: usize, scale: usize) -> usize {
    let intg = precision.saturating_sub(scale);
    (intg / DIG_PER_DEC) * 4 + DIG2BYTES[intg % DIG_PER_DEC] + (scale / DIG_PER_DEC) * 4 + DIG2BYTES[scale % DIG_PER_DEC]
}

/// MySQL decimal2bin 형식으로 인코딩
pub fn encode_decimal(text: &str, precision: usize, scale: usize, out: &mut BytesMut) -> Result<()> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_text, frac_text) = digits.split_once('.').unwrap_or((digits, ""));
    if !int_text.bytes().chain(frac_text.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(BridgeError::Conversion(format!("invalid decimal value: {}", text)));
    }

    let intg = precision.saturating_sub(scale);
    let int_digits = int_text.trim_start_matches('0');
    if int_digits.len() > intg {
        return Err(BridgeError::Conversion(format!(
            "decimal value {} out of range for ({},{})",
            text, precision, scale
        )));
    }
    // 정수부는 앞을 0으로, 소수부는 뒤를 0으로 채워 자릿수를 맞춤
    let int_padded = format!("{:0>width$}", int_digits, width = intg);
    let mut frac_padded: String = frac_text.chars().take(scale).collect();
    while frac_padded.len() < scale {
        frac_padded.push('0');
    }

    let mask: u8 = if negative { 0xff } else { 0x00 };
    let start = out.len();

    let lead = intg % DIG_PER_DEC;
    let mut groups = Vec::new();
    if lead > 0 {
        groups.push((&int_padded[..lead], DIG2BYTES[lead]));
    }
    let mut pos = lead;
    while pos < int_padded.len() {
        groups.push((&int_padded[pos..pos + DIG_PER_DEC], 4));
        pos += DIG_PER_DEC;
    }
    let mut pos = 0;
    while pos + DIG_PER_DEC <= frac_padded.len() {
        groups.push((&frac_padded[pos..pos + DIG_PER_DEC], 4));
        pos += DIG_PER_DEC;
    }
    let tail = scale % DIG_PER_DEC;
    if tail > 0 {
        groups.push((&frac_padded[pos..], DIG2BYTES[tail]));
    }

    for (group, size) in groups {
        let value: u64 = group
            .parse()
            .map_err(|_| BridgeError::Conversion(format!("invalid decimal value: {}", text)))?;
        let be = value.to_be_bytes();
        for byte in &be[8 - size..] {
            out.put_u8(byte ^ mask);
        }
    }

    if out.len() > start {
        out[start] ^= 0x80;
    }
    Ok(())
}

/// 시간 타입 소수초 저장 바이트 수
fn frac_bytes(scale: u32) -> usize {
    ((scale.min(6) + 1) / 2) as usize
}

/// 소수초를 자릿수에 맞춰 저장 (big-endian)
fn put_frac(out: &mut BytesMut, usec: u32, scale: u32) {
    match scale.min(6) {
        1 | 2 => out.put_u8((usec / 10_000) as u8),
        3 | 4 => out.put_u16((usec / 100) as u16),
        5 | 6 => out.put_uint(usec as u64, 3),
        _ => {}
    }
}

/// "123" → 123000 마이크로초
fn parse_usec(frac: &str) -> Result<u32> {
    let digits: String = frac.chars().take(6).collect();
    if digits.is_empty() {
        return Ok(0);
    }
    let value: u32 = digits
        .parse()
        .map_err(|_| BridgeError::Conversion(format!("invalid fraction: {}", frac)))?;
    Ok(value * 10u32.pow(6 - digits.len() as u32))
}

fn parse_num<T: std::str::FromStr>(text: &str, what: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| BridgeError::Conversion(format!("invalid {}: {}", what, text)))
}

/// "YYYY-MM-DD" 파싱
fn parse_date(text: &str) -> Result<(u32, u32, u32)> {
    let mut parts = text.trim().splitn(3, '-');
    let year = parse_num(parts.next().unwrap_or(""), "year")?;
    let month = parse_num(parts.next().unwrap_or(""), "month")?;
    let day = parse_num(parts.next().unwrap_or(""), "day")?;
    Ok((year, month, day))
}

/// "[-]HHH:MM:SS[.ffffff]" 파싱 → (음수 여부, 시, 분, 초, 마이크로초)
fn parse_time(text: &str) -> Result<(bool, u32, u32, u32, u32)> {
    let text = text.trim();
    let (negative, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (hms, frac) = text.split_once('.').unwrap_or((text, ""));
    let mut parts = hms.splitn(3, ':');
    let hour = parse_num(parts.next().unwrap_or(""), "hour")?;
    let minute = parse_num(parts.next().unwrap_or("0"), "minute")?;
    let second = parse_num(parts.next().unwrap_or("0"), "second")?;
    Ok((negative, hour, minute, second, parse_usec(frac)?))
}

fn encode_datetime2(text: &str, scale: u32, out: &mut BytesMut) -> Result<()> {
    let text = text.trim();
    let (date, time) = text.split_once(' ').unwrap_or((text, "00:00:00"));
    let (year, month, day) = parse_date(date)?;
    let (_, hour, minute, second, usec) = parse_time(time)?;
    let ym = (year as u64) * 13 + month as u64;
    let packed = (ym << 22) | ((day as u64) << 17) | ((hour as u64) << 12) | ((minute as u64) << 6) | second as u64;
    out.put_uint(0x80_0000_0000 + packed, 5);
    put_frac(out, usec, scale);
    Ok(())
}

fn encode_time2(text: &str, scale: u32, out: &mut BytesMut) -> Result<()> {
    let (negative, hour, minute, second, usec) = parse_time(text)?;
    let hms = ((hour as i64) << 12) | ((minute as i64) << 6) | second as i64;
    let mut packed = (hms << 24) + usec as i64;
    if negative {
        packed = -packed;
    }
    let int_part = packed >> 24;
    let frac_part = packed % (1 << 24);
    match scale.min(6) {
        0 => out.put_uint((0x80_0000 + int_part) as u64, 3),
        1 | 2 => {
            out.put_uint((0x80_0000 + int_part) as u64, 3);
            out.put_i8((frac_part / 10_000) as i8);
        }
        3 | 4 => {
            out.put_uint((0x80_0000 + int_part) as u64, 3);
            out.put_i16((frac_part / 100) as i16);
        }
        _ => out.put_uint((0x8000_0000_0000 + packed) as u64, 6),
    }
    Ok(())
}

/// "1662034855.000000" 형식의 유닉스 시간
fn encode_timestamp2(text: &str, scale: u32, out: &mut BytesMut) -> Result<()> {
    let text = text.trim();
    let (sec, frac) = text.split_once('.').unwrap_or((text, ""));
    let sec: u32 = parse_num(sec, "timestamp")?;
    out.put_u32(sec);
    put_frac(out, parse_usec(frac)?, scale);
    Ok(())
}

fn encode_integer(text: &str, width: usize, out: &mut BytesMut) -> Result<()> {
    let text = text.trim();
    let value: u64 = match text.parse::<i64>() {
        Ok(v) => v as u64,
        Err(_) => parse_num::<u64>(text, "integer")?,
    };
    out.put_uint_le(value & width_mask(width), width);
    Ok(())
}

fn width_mask(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

/// 길이 접두어와 값 기록, 접두어 폭이나 선언된 최대 길이를 넘으면 에러
fn put_length_prefixed(
    out: &mut BytesMut,
    column: &ColumnDef,
    data: &[u8],
    prefix: usize,
    max_len: u64,
) -> Result<()> {
    let limit = width_mask(prefix).min(max_len);
    if data.len() as u64 > limit {
        return Err(BridgeError::Conversion(format!(
            "column {} value of {} bytes exceeds limit {}",
            column.name,
            data.len(),
            limit
        )));
    }
    out.put_uint_le(data.len() as u64, prefix);
    out.put_slice(data);
    Ok(())
}

/// 행 이미지에 컬럼 값 하나를 기록 (NULL 값은 호출자가 null 비트맵으로 처리)
pub fn encode_value(column: &ColumnDef, data: &[u8], out: &mut BytesMut) -> Result<()> {
    use ColumnType::*;
    let text = || {
        std::str::from_utf8(data)
            .map_err(|_| BridgeError::Conversion(format!("column {} is not valid utf-8", column.name)))
    };

    match column.column_type {
        Tiny => encode_integer(text()?, 1, out)?,
        Short => encode_integer(text()?, 2, out)?,
        Int24 => encode_integer(text()?, 3, out)?,
        Long => encode_integer(text()?, 4, out)?,
        LongLong => encode_integer(text()?, 8, out)?,
        Year => {
            let year: u32 = parse_num(text()?, "year")?;
            out.put_u8(if year == 0 { 0 } else { year.saturating_sub(1900) as u8 });
        }
        Float if !column.is_double_float() => {
            let value: f32 = parse_num(text()?, "float")?;
            out.put_f32_le(value);
        }
        Float | Double => {
            let value: f64 = parse_num(text()?, "double")?;
            out.put_f64_le(value);
        }
        Decimal | NewDecimal => encode_decimal(
            text()?,
            decimal_precision(column) as usize,
            column.scale as usize,
            out,
        )?,
        Date | NewDate => {
            let (year, month, day) = parse_date(text()?)?;
            out.put_uint_le((day + month * 32 + year * 16 * 32) as u64, 3);
        }
        DateTime | DateTime2 => encode_datetime2(text()?, column.scale, out)?,
        Time | Time2 => encode_time2(text()?, column.scale, out)?,
        Timestamp | Timestamp2 => encode_timestamp2(text()?, column.scale, out)?,
        VarChar | VarString | String => {
            let max_len = column.max_byte_len();
            let prefix = if max_len > 255 { 2 } else { 1 };
            // 길이를 모르는 CHAR는 1바이트 접두어 한도까지 허용
            let max_len = if max_len == 0 { u64::MAX } else { max_len };
            put_length_prefixed(out, column, data, prefix, max_len)?;
        }
        TinyBlob => put_length_prefixed(out, column, data, 1, u64::MAX)?,
        Blob => put_length_prefixed(out, column, data, 2, u64::MAX)?,
        MediumBlob => put_length_prefixed(out, column, data, 3, u64::MAX)?,
        LongBlob | Geometry => put_length_prefixed(out, column, data, 4, u64::MAX)?,
        Json => {
            let binary = match serde_json::from_slice::<serde_json::Value>(data) {
                Ok(value) => jsonb::to_binary(&value)?,
                Err(e) => {
                    warn!(column = %column.name, error = %e, "json column is not valid json, storing as string");
                    jsonb::to_binary(&serde_json::Value::String(std::string::String::from_utf8_lossy(data).into_owned()))?
                }
            };
            put_length_prefixed(out, column, &binary, 4, u64::MAX)?;
        }
        Enum => {
            let value = text()?;
            let index = column
                .values
                .iter()
                .position(|v| v == value)
                .map_or(0, |i| i + 1);
            out.put_uint_le(index as u64, enum_pack_len(column.values.len()));
        }
        Set => {
            let value = text()?;
            let mut bits: u64 = 0;
            for member in value.split(',').filter(|m| !m.is_empty()) {
                if let Some(i) = column.values.iter().position(|v| v == member) {
                    bits |= 1 << i;
                }
            }
            out.put_uint_le(bits, set_pack_len(column.values.len()));
        }
        Bit => {
            let bits = column.precision.unwrap_or((data.len() * 8) as u32);
            let value: u64 = parse_num(text()?, "bit")?;
            let len = ((bits + 7) / 8).clamp(1, 8) as usize;
            out.put_uint(value & width_mask(len), len);
        }
        Null => {}
    }
    Ok(())
}

/// 디코딩 시 행 이미지에서 컬럼 값 하나의 길이 계산
pub fn value_len(binlog_type: u8, meta: &[u8], data: &[u8]) -> Result<usize> {
    let need = |n: usize| -> Result<()> {
        if data.len() < n {
            Err(BridgeError::Truncated { needed: n, available: data.len() })
        } else {
            Ok(())
        }
    };
    let meta_at = |i: usize| meta.get(i).copied().unwrap_or(0);
    let prefixed = |prefix: usize| -> Result<usize> {
        need(prefix)?;
        let mut len = 0usize;
        for (i, byte) in data[..prefix].iter().enumerate() {
            len |= (*byte as usize) << (8 * i);
        }
        Ok(prefix + len)
    };

    let len = match binlog_type {
        1 | 13 => 1,
        2 => 2,
        9 | 10 => 3,
        3 => 4,
        8 => 8,
        4 => meta_at(0).max(4) as usize,
        5 => 8,
        6 => 0,
        16 => {
            let bits = meta_at(1) as usize * 8 + meta_at(0) as usize;
            (bits + 7) / 8
        }
        246 => decimal_bin_size(meta_at(0) as usize, meta_at(1) as usize),
        17 => 4 + frac_bytes(meta_at(0) as u32),
        18 => 5 + frac_bytes(meta_at(0) as u32),
        19 => 3 + frac_bytes(meta_at(0) as u32),
        15 | 253 => {
            let max = u16::from_le_bytes([meta_at(0), meta_at(1)]);
            return prefixed(if max > 255 { 2 } else { 1 });
        }
        254 => {
            let (byte0, byte1) = (meta_at(0), meta_at(1));
            let (real_type, max_len) = if byte0 & 0x30 != 0x30 {
                (byte0 | 0x30, byte1 as usize | ((((byte0 & 0x30) ^ 0x30) as usize) << 4))
            } else {
                (byte0, byte1 as usize)
            };
            match real_type {
                247 | 248 => byte1 as usize,
                _ => return prefixed(if max_len > 255 { 2 } else { 1 }),
            }
        }
        245 | 252 | 255 => return prefixed(meta_at(0).clamp(1, 4) as usize),
        other => {
            return Err(BridgeError::InvalidEvent(format!("unsupported column type {}", other)));
        }
    };
    need(len)?;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(column: &ColumnDef, value: &str) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_value(column, value.as_bytes(), &mut out).unwrap();
        out.to_vec()
    }

    fn meta(column: &ColumnDef) -> Vec<u8> {
        let mut out = BytesMut::new();
        write_column_metadata(column, &mut out);
        out.to_vec()
    }

    #[test]
    fn test_fill_bitmap() {
        assert_eq!(fill_bitmap(20, 3), vec![0x00, 0x00, 0xF0]);
        assert_eq!(fill_bitmap(16, 2), vec![0x00, 0x00]);
        assert_eq!(fill_bitmap(1, 1), vec![0xFE]);
    }

    #[test]
    fn test_lcb_boundaries() {
        for value in [0u64, 250, 251, 65535, 65536, 16_777_215, 16_777_216, u64::MAX] {
            let mut out = BytesMut::new();
            write_lcb(&mut out, value);
            assert_eq!(out.len(), lcb_len(value));
            let mut cursor = Cursor::new(&out[..]);
            assert_eq!(read_lcb(&mut cursor).unwrap(), value);
        }
    }

    #[test]
    fn test_decimal_encoding() {
        let mut column = ColumnDef::new("amount", ColumnType::NewDecimal);
        column.precision = Some(14);
        column.scale = 4;
        assert_eq!(
            encode(&column, "1234567890.1234"),
            vec![0x81, 0x0D, 0xFB, 0x38, 0xD2, 0x04, 0xD2]
        );
        assert_eq!(
            encode(&column, "-1234567890.1234"),
            vec![0x7E, 0xF2, 0x04, 0xC7, 0x2D, 0xFB, 0x2D]
        );
        assert_eq!(decimal_bin_size(14, 4), 7);
        assert_eq!(meta(&column), vec![14, 4]);
    }

    #[test]
    fn test_decimal_pads_short_values() {
        let mut column = ColumnDef::new("price", ColumnType::NewDecimal);
        column.precision = Some(5);
        column.scale = 2;
        // 1.5 → 정수부 001, 소수부 50
        assert_eq!(encode(&column, "1.5"), vec![0x80, 0x01, 0x32]);
        let mut out = BytesMut::new();
        assert!(encode_decimal("12345.6", 5, 2, &mut out).is_err());
    }

    #[test]
    fn test_integer_widths() {
        assert_eq!(encode(&ColumnDef::new("a", ColumnType::Tiny), "-1"), vec![0xff]);
        assert_eq!(encode(&ColumnDef::new("a", ColumnType::Short), "258"), vec![0x02, 0x01]);
        assert_eq!(encode(&ColumnDef::new("a", ColumnType::Int24), "1"), vec![1, 0, 0]);
        assert_eq!(encode(&ColumnDef::new("a", ColumnType::Long), "1"), vec![1, 0, 0, 0]);
        assert_eq!(
            encode(&ColumnDef::new("a", ColumnType::LongLong), "18446744073709551615"),
            vec![0xff; 8]
        );
    }

    #[test]
    fn test_date_and_year() {
        // 2023-01-15 → 15 + 1*32 + 2023*512 = 1035823
        assert_eq!(encode(&ColumnDef::new("d", ColumnType::Date), "2023-01-15"), vec![0x2F, 0xCE, 0x0F]);
        assert_eq!(encode(&ColumnDef::new("y", ColumnType::Year), "2023"), vec![123]);
        assert_eq!(encode(&ColumnDef::new("y", ColumnType::Year), "0"), vec![0]);
    }

    #[test]
    fn test_datetime2_encoding() {
        let column = ColumnDef::new("ts", ColumnType::DateTime);
        // 2017-08-13 18:17:54, 정밀도 0
        let ym: u64 = 2017 * 13 + 8;
        let packed = (ym << 22) | (13 << 17) | (18 << 12) | (17 << 6) | 54;
        let expected = (0x80_0000_0000u64 + packed).to_be_bytes()[3..].to_vec();
        assert_eq!(encode(&column, "2017-08-13 18:17:54"), expected);

        let mut column = ColumnDef::new("ts", ColumnType::DateTime);
        column.scale = 3;
        let bytes = encode(&column, "2017-08-13 18:17:54.123");
        assert_eq!(bytes.len(), 7);
        assert_eq!(&bytes[5..], &[0x04, 0xCE]); // 123000 / 100 = 1230
    }

    #[test]
    fn test_time2_encoding() {
        let column = ColumnDef::new("t", ColumnType::Time);
        let hms: u64 = (10 << 12) | (2 << 6) | 3;
        assert_eq!(encode(&column, "10:02:03"), (0x80_0000 + hms).to_be_bytes()[5..].to_vec());
        // -00:00:01 → 0x800000 - 1
        assert_eq!(encode(&column, "-00:00:01"), vec![0x7F, 0xFF, 0xFF]);
    }

    #[test]
    fn test_timestamp2_encoding() {
        let mut column = ColumnDef::new("ts", ColumnType::Timestamp);
        column.scale = 6;
        let bytes = encode(&column, "1662034855.000001");
        assert_eq!(bytes, vec![0x63, 0x10, 0xA3, 0xA7, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_string_prefix_by_max_len() {
        let mut short = ColumnDef::new("name", ColumnType::VarChar);
        short.length = 20;
        short.encoding = "latin1".to_string();
        assert_eq!(encode(&short, "ab"), vec![2, b'a', b'b']);
        assert_eq!(meta(&short), vec![20, 0]);

        let mut long = ColumnDef::new("name", ColumnType::VarString);
        long.length = 100; // utf8mb4 → 400 바이트
        assert_eq!(encode(&long, "ab"), vec![2, 0, b'a', b'b']);
        assert_eq!(binlog_type(&long), ColumnType::VarChar);
        assert_eq!(value_len(15, &meta(&long), &[2, 0, b'a', b'b']).unwrap(), 4);
    }

    #[test]
    fn test_varchar_without_length_uses_two_byte_prefix() {
        let column = ColumnDef::new("c", ColumnType::VarChar);
        assert_eq!(meta(&column), vec![0xff, 0xff]);

        let value = encode(&column, &"a".repeat(300));
        assert_eq!(&value[..2], &[0x2C, 0x01]);
        assert_eq!(value.len(), 302);
        assert_eq!(value_len(15, &meta(&column), &value).unwrap(), value.len());
    }

    #[test]
    fn test_oversized_string_values_are_rejected() {
        let mut short = ColumnDef::new("name", ColumnType::VarChar);
        short.length = 20;
        short.encoding = "latin1".to_string();
        let mut out = BytesMut::new();
        let err = encode_value(&short, &[b'a'; 21], &mut out).unwrap_err();
        assert!(matches!(err, BridgeError::Conversion(_)));
        assert!(out.is_empty());

        let tiny = ColumnDef::new("b", ColumnType::TinyBlob);
        assert!(encode_value(&tiny, &[b'a'; 300], &mut out).is_err());
        assert_eq!(encode(&tiny, &"a".repeat(255)).len(), 256);

        let blob = ColumnDef::new("b", ColumnType::Blob);
        assert!(encode_value(&blob, &vec![0u8; 70_000], &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_char_metadata_round_trip() {
        let mut column = ColumnDef::new("code", ColumnType::String);
        column.length = 100;
        column.encoding = "utf8mb4".to_string();
        let m = meta(&column);
        // 400 = 0x190 → (0x190 & 0x300) >> 4 = 0x10
        assert_eq!(m, vec![0xFE ^ 0x10, 0x90]);
        let value = encode(&column, "xyz");
        assert_eq!(value_len(254, &m, &value).unwrap(), value.len());
        assert_eq!(value.len(), 5);
    }

    #[test]
    fn test_enum_and_set() {
        let mut column = ColumnDef::new("color", ColumnType::Enum);
        column.values = vec!["red".into(), "green".into(), "blue".into()];
        assert_eq!(encode(&column, "green"), vec![2]);
        assert_eq!(binlog_type(&column), ColumnType::String);
        assert_eq!(meta(&column), vec![247, 1]);

        let mut column = ColumnDef::new("flags", ColumnType::Set);
        column.values = (0..10).map(|i| format!("f{}", i)).collect();
        assert_eq!(encode(&column, "f0,f9"), vec![0x01, 0x02]);
        let m = meta(&column);
        assert_eq!(m, vec![248, 2]);
        assert_eq!(value_len(254, &m, &[0x01, 0x02]).unwrap(), 2);
    }

    #[test]
    fn test_blob_family_narrowing() {
        for (t, prefix) in [
            (ColumnType::TinyBlob, 1u8),
            (ColumnType::Blob, 2),
            (ColumnType::MediumBlob, 3),
            (ColumnType::LongBlob, 4),
        ] {
            let column = ColumnDef::new("b", t);
            assert_eq!(binlog_type(&column), ColumnType::Blob);
            assert_eq!(meta(&column), vec![prefix]);
            let value = encode(&column, "hello");
            assert_eq!(value.len(), prefix as usize + 5);
            assert_eq!(value_len(252, &[prefix], &value).unwrap(), value.len());
        }
    }

    #[test]
    fn test_float_precision_switches_to_double() {
        let mut column = ColumnDef::new("f", ColumnType::Float);
        assert_eq!(encode(&column, "1.5"), 1.5f32.to_le_bytes().to_vec());
        column.precision = Some(30);
        assert_eq!(binlog_type(&column), ColumnType::Double);
        assert_eq!(encode(&column, "1.5"), 1.5f64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_bit_encoding() {
        let mut column = ColumnDef::new("b", ColumnType::Bit);
        column.precision = Some(10);
        assert_eq!(encode(&column, "513"), vec![0x02, 0x01]);
        assert_eq!(meta(&column), vec![2, 1]);
        assert_eq!(value_len(16, &[2, 1], &[0x02, 0x01]).unwrap(), 2);
    }

    #[test]
    fn test_value_len_detects_truncation() {
        let err = value_len(3, &[], &[1, 2]).unwrap_err();
        assert!(err.is_truncated());
    }

    #[test]
    fn test_charset_widths() {
        assert_eq!(charset_encoding_bytes(""), 4);
        assert_eq!(charset_encoding_bytes("latin1"), 1);
        assert_eq!(charset_encoding_bytes("GBK"), 2);
        assert_eq!(charset_encoding_bytes("utf8"), 3);
        assert_eq!(charset_encoding_bytes("utf8mb4"), 4);
        assert_eq!(charset_encoding_bytes("klingon"), 4);
    }
}
