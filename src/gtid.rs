//! GTID (Global Transaction ID) 관리
//!
//! 트랜잭션 구간은 반개구간 `[start, end)`으로 저장하고,
//! 텍스트 형식은 MySQL과 동일한 닫힌 구간을 사용합니다: "uuid:1-5:7,uuid2:1-3"

use crate::error::{BridgeError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};
use uuid::Uuid;

/// 트랜잭션 번호 구간 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnRange {
    pub start: u64,
    pub end: u64,
}

impl TxnRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(BridgeError::Gtid(format!("Invalid range: [{}, {})", start, end)));
        }
        Ok(TxnRange { start, end })
    }

    pub fn contains(&self, gno: u64) -> bool {
        gno >= self.start && gno < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// 하나의 소스 UUID에 대한 GTID 구간 목록
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidMessage {
    pub sid: Uuid,
    pub ranges: Vec<TxnRange>,
}

impl GtidMessage {
    pub fn new(sid: Uuid) -> Self {
        GtidMessage { sid, ranges: Vec::new() }
    }

    pub fn with_range(sid: Uuid, start: u64, end: u64) -> Self {
        let mut msg = GtidMessage::new(sid);
        if start < end {
            msg.ranges.push(TxnRange { start, end });
        }
        msg
    }

    /// 구간을 합치고 겹치거나 인접한 구간을 하나로 병합
    pub fn merge(&mut self, ranges: &[TxnRange]) {
        let mut all: Vec<TxnRange> = self
            .ranges
            .iter()
            .chain(ranges.iter())
            .filter(|r| !r.is_empty())
            .copied()
            .collect();
        all.sort();

        let mut merged: Vec<TxnRange> = Vec::with_capacity(all.len());
        for range in all {
            match merged.last_mut() {
                Some(last) if range.start <= last.end => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    pub fn contains(&self, gno: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(gno))
    }

    /// 모든 구간이 `other`에 포함되는지 여부
    pub fn is_subset_of(&self, other: &GtidMessage) -> bool {
        if self.sid != other.sid {
            return self.ranges.iter().all(|r| r.is_empty());
        }
        let mut normalized = other.clone();
        normalized.merge(&[]);
        self.ranges.iter().filter(|r| !r.is_empty()).all(|r| {
            normalized
                .ranges
                .iter()
                .any(|o| o.start <= r.start && r.end <= o.end)
        })
    }

    /// 구간 차집합
    pub fn subtract(&self, other: &GtidMessage) -> GtidMessage {
        let mut result = GtidMessage::new(self.sid);
        for range in &self.ranges {
            let mut pieces = vec![*range];
            for cut in &other.ranges {
                let mut next = Vec::new();
                for piece in pieces {
                    if cut.end <= piece.start || cut.start >= piece.end {
                        next.push(piece);
                        continue;
                    }
                    if piece.start < cut.start {
                        next.push(TxnRange { start: piece.start, end: cut.start });
                    }
                    if cut.end < piece.end {
                        next.push(TxnRange { start: cut.end, end: piece.end });
                    }
                }
                pieces = next;
            }
            result.ranges.extend(pieces);
        }
        result.merge(&[]);
        result
    }

    /// 마지막 구간의 끝 (다음에 할당될 번호)
    pub fn next_gno(&self) -> u64 {
        self.ranges.iter().map(|r| r.end).max().unwrap_or(1)
    }

    /// PREVIOUS_GTIDS 본문에서 차지하는 길이
    pub fn encoded_len(&self) -> usize {
        16 + 8 + 16 * self.ranges.len()
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_slice(self.sid.as_bytes());
        out.put_u64_le(self.ranges.len() as u64);
        for range in &self.ranges {
            out.put_u64_le(range.start);
            out.put_u64_le(range.end);
        }
    }

    pub fn read_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut sid = [0u8; 16];
        cursor.read_exact(&mut sid)?;
        let n_ranges = cursor.read_u64::<LittleEndian>()?;
        let remaining = (cursor.get_ref().len() as u64).saturating_sub(cursor.position());
        if n_ranges > remaining / 16 {
            return Err(BridgeError::Truncated {
                needed: wire_len(n_ranges, 16),
                available: remaining as usize,
            });
        }
        let mut ranges = Vec::with_capacity(n_ranges as usize);
        for _ in 0..n_ranges {
            let start = cursor.read_u64::<LittleEndian>()?;
            let end = cursor.read_u64::<LittleEndian>()?;
            ranges.push(TxnRange { start, end });
        }
        Ok(GtidMessage { sid: Uuid::from_bytes(sid), ranges })
    }
}

impl fmt::Display for GtidMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sid)?;
        for range in self.ranges.iter().filter(|r| !r.is_empty()) {
            if range.end - 1 == range.start {
                write!(f, ":{}", range.start)?;
            } else {
                write!(f, ":{}-{}", range.start, range.end - 1)?;
            }
        }
        Ok(())
    }
}

/// n_sids + 각 GtidMessage (PREVIOUS_GTIDS, COM_BINLOG_DUMP_GTID 공통 형식)
pub fn encode_gtid_messages(messages: &[GtidMessage], out: &mut BytesMut) {
    out.put_u64_le(messages.len() as u64);
    for msg in messages {
        msg.write_to(out);
    }
}

pub fn decode_gtid_messages(data: &[u8]) -> Result<Vec<GtidMessage>> {
    let mut cursor = Cursor::new(data);
    let n_sids = cursor.read_u64::<LittleEndian>()?;
    if n_sids > data.len() as u64 / 24 {
        return Err(BridgeError::Truncated {
            needed: (n_sids * 24) as usize,
            available: data.len(),
        });
    }
    let mut messages = Vec::with_capacity(n_sids as usize);
    for _ in 0..n_sids {
        messages.push(GtidMessage::read_from(&mut cursor)?);
    }
    Ok(messages)
}

/// 요청된 항목 수로 계산한 바이트 길이 (넘치면 usize::MAX)
fn wire_len(count: u64, item: u64) -> usize {
    usize::try_from(count.saturating_mul(item)).unwrap_or(usize::MAX)
}

pub fn gtid_messages_len(messages: &[GtidMessage]) -> usize {
    8 + messages.iter().map(|m| m.encoded_len()).sum::<usize>()
}

/// 전체 GTID 집합 (여러 UUID)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    pub sets: BTreeMap<Uuid, GtidMessage>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet { sets: BTreeMap::new() }
    }

    pub fn from_messages(messages: &[GtidMessage]) -> Self {
        let mut set = GtidSet::new();
        for msg in messages {
            set.add(msg);
        }
        set
    }

    /// GTID 문자열 파싱 (format: "uuid1:1-100:200,uuid2:1-50")
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = GtidSet::new();
        let gtid_str = gtid_str.trim();
        if gtid_str.is_empty() || gtid_str.eq_ignore_ascii_case("NULL") {
            return Ok(gtid_set);
        }

        for part in gtid_str.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut fields = part.split(':');
            let uuid_text = fields.next().unwrap_or("").trim();
            let sid = Uuid::parse_str(uuid_text)
                .map_err(|_| BridgeError::Gtid(format!("Invalid uuid: {}", uuid_text)))?;

            let mut msg = GtidMessage::new(sid);
            for interval in fields {
                let interval = interval.trim();
                let (start, last) = match interval.split_once('-') {
                    Some((a, b)) => (parse_gno(a)?, parse_gno(b)?),
                    None => {
                        let gno = parse_gno(interval)?;
                        (gno, gno)
                    }
                };
                if start == 0 || last < start {
                    return Err(BridgeError::Gtid(format!("Invalid interval: {}", interval)));
                }
                msg.ranges.push(TxnRange { start, end: last + 1 });
            }
            gtid_set.add(&msg);
        }

        Ok(gtid_set)
    }

    pub fn add(&mut self, msg: &GtidMessage) {
        self.sets
            .entry(msg.sid)
            .or_insert_with(|| GtidMessage::new(msg.sid))
            .merge(&msg.ranges);
    }

    pub fn contains(&self, sid: &Uuid, gno: u64) -> bool {
        self.sets.get(sid).map_or(false, |msg| msg.contains(gno))
    }

    /// self ⊆ other
    pub fn is_subset(&self, other: &GtidSet) -> bool {
        self.sets.values().all(|msg| match other.sets.get(&msg.sid) {
            Some(o) => msg.is_subset_of(o),
            None => msg.ranges.iter().all(|r| r.is_empty()),
        })
    }

    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut result = GtidSet::new();
        for (sid, msg) in &self.sets {
            let rest = match other.sets.get(sid) {
                Some(o) => msg.subtract(o),
                None => msg.clone(),
            };
            if !rest.ranges.is_empty() {
                result.sets.insert(*sid, rest);
            }
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|msg| msg.ranges.is_empty())
    }

    pub fn messages(&self) -> Vec<GtidMessage> {
        self.sets.values().cloned().collect()
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .sets
            .values()
            .filter(|msg| msg.ranges.iter().any(|r| !r.is_empty()))
            .map(|msg| msg.to_string())
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

fn parse_gno(text: &str) -> Result<u64> {
    text.trim()
        .parse::<u64>()
        .map_err(|_| BridgeError::Gtid(format!("Invalid sequence: {}", text)))
}
