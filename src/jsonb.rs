//! MySQL 바이너리 JSON 인코더
//!
//! JSON 컬럼 값은 행 이미지 안에 MySQL 내부 바이너리 형식으로 저장됩니다.

use crate::error::{BridgeError, Result};
use serde_json::Value;

const TYPE_SMALL_OBJECT: u8 = 0x00;
const TYPE_LARGE_OBJECT: u8 = 0x01;
const TYPE_SMALL_ARRAY: u8 = 0x02;
const TYPE_LARGE_ARRAY: u8 = 0x03;
const TYPE_LITERAL: u8 = 0x04;
const TYPE_INT16: u8 = 0x05;
const TYPE_INT32: u8 = 0x07;
const TYPE_INT64: u8 = 0x09;
const TYPE_UINT64: u8 = 0x0a;
const TYPE_DOUBLE: u8 = 0x0b;
const TYPE_STRING: u8 = 0x0c;

const LITERAL_NULL: u8 = 0x00;
const LITERAL_TRUE: u8 = 0x01;
const LITERAL_FALSE: u8 = 0x02;

/// JSON 값을 바이너리 문서로 변환 (첫 바이트는 타입)
pub fn to_binary(value: &Value) -> Result<Vec<u8>> {
    let mut out = vec![0u8];
    let value_type = append_value(value, &mut out)?;
    out[0] = value_type;
    Ok(out)
}

/// 값 본문을 추가하고 타입 코드 반환
fn append_value(value: &Value, out: &mut Vec<u8>) -> Result<u8> {
    match value {
        Value::Null => {
            out.push(LITERAL_NULL);
            Ok(TYPE_LITERAL)
        }
        Value::Bool(b) => {
            out.push(if *b { LITERAL_TRUE } else { LITERAL_FALSE });
            Ok(TYPE_LITERAL)
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(v) = i16::try_from(i) {
                    out.extend_from_slice(&v.to_le_bytes());
                    Ok(TYPE_INT16)
                } else if let Ok(v) = i32::try_from(i) {
                    out.extend_from_slice(&v.to_le_bytes());
                    Ok(TYPE_INT32)
                } else {
                    out.extend_from_slice(&i.to_le_bytes());
                    Ok(TYPE_INT64)
                }
            } else if let Some(u) = n.as_u64() {
                out.extend_from_slice(&u.to_le_bytes());
                Ok(TYPE_UINT64)
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                out.extend_from_slice(&f.to_le_bytes());
                Ok(TYPE_DOUBLE)
            }
        }
        Value::String(s) => {
            write_varlen(out, s.len());
            out.extend_from_slice(s.as_bytes());
            Ok(TYPE_STRING)
        }
        Value::Array(items) => {
            let entries: Vec<(Option<&str>, &Value)> = items.iter().map(|v| (None, v)).collect();
            append_container(&entries, out, TYPE_SMALL_ARRAY, TYPE_LARGE_ARRAY)
        }
        Value::Object(map) => {
            let mut entries: Vec<(Option<&str>, &Value)> =
                map.iter().map(|(k, v)| (Some(k.as_str()), v)).collect();
            // 키는 길이 순, 같은 길이면 바이트 순
            entries.sort_by(|a, b| {
                let (ka, kb) = (a.0.unwrap_or(""), b.0.unwrap_or(""));
                ka.len().cmp(&kb.len()).then_with(|| ka.as_bytes().cmp(kb.as_bytes()))
            });
            append_container(&entries, out, TYPE_SMALL_OBJECT, TYPE_LARGE_OBJECT)
        }
    }
}

fn append_container(
    entries: &[(Option<&str>, &Value)],
    out: &mut Vec<u8>,
    small_type: u8,
    large_type: u8,
) -> Result<u8> {
    if let Some(body) = encode_container(entries, false)? {
        out.extend_from_slice(&body);
        return Ok(small_type);
    }
    match encode_container(entries, true)? {
        Some(body) => {
            out.extend_from_slice(&body);
            Ok(large_type)
        }
        None => Err(BridgeError::Conversion("json document too large".to_string())),
    }
}

/// 오브젝트/배열 본문 인코딩, small 형식에 맞지 않으면 None
fn encode_container(entries: &[(Option<&str>, &Value)], large: bool) -> Result<Option<Vec<u8>>> {
    let offset_size = if large { 4 } else { 2 };
    let max_offset: u64 = if large { u32::MAX as u64 } else { u16::MAX as u64 };
    let is_object = entries.first().map_or(false, |(k, _)| k.is_some());
    let count = entries.len();

    let key_entry_size = if is_object { offset_size + 2 } else { 0 };
    let value_entry_size = 1 + offset_size;
    let header_size = 2 * offset_size + count * (key_entry_size + value_entry_size);
    if count as u64 > max_offset || header_size as u64 > max_offset {
        return Ok(None);
    }

    let mut buf = vec![0u8; header_size];
    let value_entries_start = 2 * offset_size + count * key_entry_size;

    if is_object {
        for (i, (key, _)) in entries.iter().enumerate() {
            let key = key.unwrap_or("");
            if key.len() > u16::MAX as usize {
                return Err(BridgeError::Conversion("json key too long".to_string()));
            }
            let offset = buf.len();
            if offset as u64 > max_offset {
                return Ok(None);
            }
            buf.extend_from_slice(key.as_bytes());
            let at = 2 * offset_size + i * key_entry_size;
            put_offset(&mut buf[at..], offset as u64, offset_size);
            buf[at + offset_size..at + offset_size + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        }
    }

    for (i, (_, value)) in entries.iter().enumerate() {
        let at = value_entries_start + i * value_entry_size;
        if let Some((value_type, inline)) = inline_value(value, large) {
            buf[at] = value_type;
            put_offset(&mut buf[at + 1..], inline, offset_size);
            continue;
        }
        let offset = buf.len();
        if offset as u64 > max_offset {
            return Ok(None);
        }
        let value_type = append_value(value, &mut buf)?;
        buf[at] = value_type;
        put_offset(&mut buf[at + 1..], offset as u64, offset_size);
    }

    if buf.len() as u64 > max_offset {
        return Ok(None);
    }
    let total = buf.len() as u64;
    put_offset(&mut buf[..], count as u64, offset_size);
    put_offset(&mut buf[offset_size..], total, offset_size);
    Ok(Some(buf))
}

/// 값 엔트리에 직접 넣을 수 있는 값 (리터럴, int16, large 형식에서는 int32)
fn inline_value(value: &Value, large: bool) -> Option<(u8, u64)> {
    match value {
        Value::Null => Some((TYPE_LITERAL, LITERAL_NULL as u64)),
        Value::Bool(true) => Some((TYPE_LITERAL, LITERAL_TRUE as u64)),
        Value::Bool(false) => Some((TYPE_LITERAL, LITERAL_FALSE as u64)),
        Value::Number(n) => {
            let i = n.as_i64()?;
            if let Ok(v) = i16::try_from(i) {
                Some((TYPE_INT16, v as u16 as u64))
            } else if large {
                i32::try_from(i).ok().map(|v| (TYPE_INT32, v as u32 as u64))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn put_offset(buf: &mut [u8], value: u64, size: usize) {
    buf[..size].copy_from_slice(&value.to_le_bytes()[..size]);
}

/// 7비트 단위 가변 길이 정수
fn write_varlen(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len & 0x7f) as u8;
        len >>= 7;
        if len != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}
