//! CDC 레코드 입력
//!
//! 변환기는 `RecordSource`에서 레코드를 하나씩 가져옵니다.
//! 레코드는 소유권 이동으로 전달되므로 별도의 release 호출이 필요 없습니다.

use crate::column::ColumnDef;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tracing::debug;

/// 레코드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Begin,
    Commit,
    Insert,
    Update,
    Delete,
    Ddl,
    Heartbeat,
    /// 알 수 없는 레코드 (설정에 따라 건너뛰거나 중단)
    #[serde(other)]
    Unknown,
}

/// 논리 변경 레코드 하나
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub kind: RecordKind,
    /// `tenant.db` 형식의 데이터베이스 이름
    #[serde(default)]
    pub db: String,
    #[serde(default)]
    pub table: String,
    /// 외부 트랜잭션 ID
    #[serde(default)]
    pub txn_id: String,
    /// 커밋 시각 (초)
    #[serde(default)]
    pub timestamp: u32,
    /// 커밋 시각의 마이크로초 부분
    #[serde(default)]
    pub record_usec: u32,
    /// 소스 체크포인트 (마이크로초)
    #[serde(default)]
    pub checkpoint_us: u64,
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
    /// 변경 전 값, `None`은 NULL (빈 문자열과 구분)
    #[serde(default)]
    pub before: Vec<Option<String>>,
    /// 변경 후 값
    #[serde(default)]
    pub after: Vec<Option<String>>,
    /// DDL 문장
    #[serde(default)]
    pub sql: Option<String>,
}

impl LogRecord {
    pub fn new(kind: RecordKind, txn_id: impl Into<String>) -> Self {
        LogRecord {
            kind,
            db: String::new(),
            table: String::new(),
            txn_id: txn_id.into(),
            timestamp: 0,
            record_usec: 0,
            checkpoint_us: 0,
            columns: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            sql: None,
        }
    }

    /// 커밋 시각 (마이크로초)
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp as u64 * 1_000_000 + self.record_usec as u64
    }
}

/// 레코드 공급자
pub trait RecordSource: Send {
    /// 최대 `timeout` 동안 기다려 레코드 하나를 가져옴, 시간 초과면 `None`
    ///
    /// 소스가 끝나면 `ChannelClosed`를 반환합니다.
    fn fetch(&mut self, timeout: Duration) -> impl Future<Output = Result<Option<LogRecord>>> + Send;
}

/// 프로세스 내부 채널 소스 (테스트 및 임베딩용)
pub struct ChannelSource {
    rx: mpsc::Receiver<LogRecord>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<LogRecord>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, ChannelSource { rx })
    }
}

impl RecordSource for ChannelSource {
    async fn fetch(&mut self, timeout: Duration) -> Result<Option<LogRecord>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => Err(BridgeError::ChannelClosed),
            Err(_) => Ok(None),
        }
    }
}

/// 줄 단위 JSON 레코드 소스 (예: stdin)
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        JsonLinesSource { lines: reader.lines() }
    }
}

impl<R: AsyncBufRead + Unpin + Send> RecordSource for JsonLinesSource<R> {
    async fn fetch(&mut self, timeout: Duration) -> Result<Option<LogRecord>> {
        loop {
            let line = match tokio::time::timeout(timeout, self.lines.next_line()).await {
                Ok(line) => line?,
                Err(_) => return Ok(None),
            };
            let Some(line) = line else {
                return Err(BridgeError::ChannelClosed);
            };
            if line.trim().is_empty() {
                continue;
            }
            let record: LogRecord = serde_json::from_str(&line)?;
            debug!(kind = ?record.kind, txn = %record.txn_id, "fetched record");
            return Ok(Some(record));
        }
    }
}

/// DDL을 표준 MySQL 문장으로 바꾸는 외부 변환기
pub trait DdlTranslator: Send + Sync {
    fn translate(&self, ddl: &str) -> Result<String>;
}

/// 변환 없이 그대로 전달
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTranslator;

impl DdlTranslator for PassthroughTranslator {
    fn translate(&self, ddl: &str) -> Result<String> {
        Ok(ddl.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnType;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_channel_source_timeout_and_close() {
        let (tx, mut source) = ChannelSource::new(4);
        assert!(source.fetch(Duration::from_millis(5)).await.unwrap().is_none());

        tx.send(LogRecord::new(RecordKind::Begin, "ob-1")).await.unwrap();
        let record = source.fetch(Duration::from_millis(5)).await.unwrap().unwrap();
        assert_eq!(record.kind, RecordKind::Begin);

        drop(tx);
        assert!(matches!(
            source.fetch(Duration::from_millis(5)).await,
            Err(BridgeError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_json_lines_source() {
        let input = concat!(
            r#"{"kind":"begin","txn_id":"ob-7","timestamp":1700000000,"checkpoint_us":5}"#,
            "\n\n",
            r#"{"kind":"insert","db":"t1.shop","table":"orders","txn_id":"ob-7","#,
            r#""columns":[{"name":"id","column_type":"long"},{"name":"note","column_type":"var_char","length":20}],"#,
            r#""after":["1",null]}"#,
            "\n",
            r#"{"kind":"checkpoint_marker"}"#,
            "\n",
        );
        let mut source = JsonLinesSource::new(BufReader::new(input.as_bytes()));
        let timeout = Duration::from_millis(50);

        let begin = source.fetch(timeout).await.unwrap().unwrap();
        assert_eq!(begin.kind, RecordKind::Begin);
        assert_eq!(begin.timestamp_us(), 1_700_000_000_000_000);

        let insert = source.fetch(timeout).await.unwrap().unwrap();
        assert_eq!(insert.columns[1].column_type, ColumnType::VarChar);
        assert_eq!(insert.after, vec![Some("1".to_string()), None]);

        let unknown = source.fetch(timeout).await.unwrap().unwrap();
        assert_eq!(unknown.kind, RecordKind::Unknown);

        assert!(matches!(source.fetch(timeout).await, Err(BridgeError::ChannelClosed)));
    }

    #[test]
    fn test_passthrough_translator() {
        let ddl = "ALTER TABLE t ADD COLUMN c INT";
        assert_eq!(PassthroughTranslator.translate(ddl).unwrap(), ddl);
    }
}
