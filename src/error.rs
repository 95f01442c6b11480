//! Binlog 브리지 에러 타입

use thiserror::Error;
use std::io;

/// 복제 프로토콜 에러 코드 (ER_MASTER_FATAL_ERROR_READING_BINLOG)
pub const ER_MASTER_FATAL_ERROR_READING_BINLOG: u16 = 1236;

/// SHOW BINLOG EVENTS 에러 코드 (ER_ERROR_WHEN_EXECUTING_COMMAND)
pub const ER_ERROR_WHEN_EXECUTING_COMMAND: u16 = 1220;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("I/O 에러: {0}")]
    Io(String),

    #[error("유효하지 않은 이벤트: {0}")]
    InvalidEvent(String),

    #[error("이벤트가 잘렸습니다: 필요 {needed} 바이트, 실제 {available} 바이트")]
    Truncated { needed: usize, available: usize },

    #[error("체크섬 불일치: 기대값 {expected:#010x}, 실제값 {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("인덱스 에러: {0}")]
    Index(String),

    #[error("파일 잠금 에러: {0}")]
    Lock(String),

    #[error("GTID 처리 에러: {0}")]
    Gtid(String),

    #[error("설정 에러: {0}")]
    Config(String),

    #[error("복구 에러: {0}")]
    Recovery(String),

    #[error("위치 불일치: 기대값 {expected}, 실제값 {actual}")]
    PositionMismatch { expected: u64, actual: u64 },

    #[error("프로토콜 에러: {0}")]
    Protocol(String),

    #[error("변환 에러: {0}")]
    Conversion(String),

    #[error("지원하지 않는 레코드 타입: {0}")]
    UnsupportedRecord(String),

    #[error("{message}")]
    Dump { code: u16, message: String },

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout 에러")]
    Timeout,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl BridgeError {
    /// 복제 클라이언트에게 보낼 덤프 에러 (1236)
    pub fn dump(message: impl Into<String>) -> Self {
        BridgeError::Dump {
            code: ER_MASTER_FATAL_ERROR_READING_BINLOG,
            message: message.into(),
        }
    }

    /// 버퍼가 부족해서 발생한 에러인지 여부
    pub fn is_truncated(&self) -> bool {
        matches!(self, BridgeError::Truncated { .. })
    }

    /// 클라이언트 ERR 패킷용 (코드, 메시지)
    pub fn client_error(&self) -> (u16, String) {
        match self {
            BridgeError::Dump { code, message } => (*code, message.clone()),
            other => (ER_MASTER_FATAL_ERROR_READING_BINLOG, other.to_string()),
        }
    }
}

impl From<io::Error> for BridgeError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return BridgeError::Truncated { needed: 0, available: 0 };
        }
        BridgeError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
