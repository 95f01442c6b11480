//! Binlog 위치와 마스터 상태
//!
//! 인덱스와 마지막 파일에서 SHOW MASTER STATUS / SHOW BINARY LOGS에 필요한 값을 계산합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치, 실행된 GTID "uuid:1-120"

use crate::binlog::BinlogParser;
use crate::error::Result;
use crate::gtid::{GtidMessage, GtidSet, TxnRange};
use crate::index::BinlogIndex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl BinlogPosition {
    pub fn new(filename: String, position: u64) -> Self {
        BinlogPosition { filename, position }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// SHOW MASTER STATUS 결과
#[derive(Debug, Clone)]
pub struct MasterStatus {
    pub position: BinlogPosition,
    pub executed: GtidSet,
}

impl MasterStatus {
    /// 마지막 인덱스 레코드 기준 상태
    ///
    /// 실행된 GTID = 마지막 파일의 PREVIOUS_GTIDS + 그 파일에서 완료된 트랜잭션
    pub fn load(index: &BinlogIndex, server_uuid: Uuid) -> Result<Option<Self>> {
        let Some(last) = index.last()? else {
            return Ok(None);
        };
        let path = index.binlog_path(&last.file_name);
        let mut executed = GtidSet::new();
        if path.is_file() && last.position > 0 {
            executed = GtidSet::from_messages(&BinlogParser::previous_gtids(&path)?);
            let scan = BinlogParser::last_complete_txn(&path)?;
            if scan.last_complete_txn_id != 0 {
                let start = scan.start_complete_txn_id.max(1);
                executed.add(&GtidMessage {
                    sid: server_uuid,
                    ranges: vec![TxnRange { start, end: scan.last_complete_txn_id + 1 }],
                });
            }
        }
        debug!("master status {}:{} {}", last.file_name, last.position, executed);
        Ok(Some(MasterStatus {
            position: BinlogPosition::new(last.file_name, last.position),
            executed,
        }))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "file": self.position.filename,
            "pos": self.position.position,
            "executed_gtid_set": self.executed.to_string(),
        })
    }
}

impl fmt::Display for MasterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterStatus {{ {}, gtid: {} }}", self.position, self.executed)
    }
}

/// SHOW BINARY LOGS 한 줄
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryLog {
    pub name: String,
    pub size: u64,
}

/// 인덱스에 있는 파일 목록과 실제 크기
pub fn binary_logs(index: &BinlogIndex) -> Result<Vec<BinaryLog>> {
    Ok(index
        .fetch_all(true)?
        .into_iter()
        .map(|record| {
            let size = std::fs::metadata(index.binlog_path(&record.file_name))
                .map(|m| m.len())
                .unwrap_or(record.position);
            BinaryLog { name: record.file_name, size }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::tests::{server_uuid, FileBuilder};
    use crate::index::BinlogIndexRecord;

    #[test]
    fn test_binlog_position_parse() {
        let pos = BinlogPosition::new("mysql-bin.000123".to_string(), 4096);
        assert_eq!(pos.file_sequence(), Some(123));
        assert_eq!(pos.to_string(), "mysql-bin.000123:4096");
    }

    #[test]
    fn test_master_status_from_last_file() {
        let dir = tempfile::tempdir().unwrap();
        let index = BinlogIndex::new(dir.path());
        assert!(MasterStatus::load(&index, server_uuid()).unwrap().is_none());

        let mut builder = FileBuilder::new(true, Some(TxnRange { start: 1, end: 4 }));
        builder.txn(4).txn(5).begin(6);
        builder.write(&dir.path().join("mysql-bin.000002"));
        let mut record = BinlogIndexRecord::new("mysql-bin.000002", 2);
        record.position = builder.buf.len() as u64;
        index.add(&record).unwrap();

        let status = MasterStatus::load(&index, server_uuid()).unwrap().unwrap();
        assert_eq!(status.position.position, builder.buf.len() as u64);
        assert_eq!(status.executed.to_string(), format!("{}:1-5", server_uuid()));
        assert_eq!(status.to_json()["file"], "mysql-bin.000002");

        let logs = binary_logs(&index).unwrap();
        assert_eq!(logs, vec![BinaryLog { name: "mysql-bin.000002".to_string(), size: builder.buf.len() as u64 }]);
    }
}
