//! CDC 레코드 → MySQL Binlog 브리지
//!
//! 논리 변경 레코드를 MySQL 바이너리 로그 파일로 기록하고, 그 파일을 복제 프로토콜로 제공합니다.
//! 주요 기능:
//! - Binlog 이벤트 인코딩/디코딩 (CRC32 포함)
//! - 인덱스 파일과 파일 회전, 재시작 복구
//! - GTID (Global Transaction ID) 관리
//! - COM_BINLOG_DUMP / COM_BINLOG_DUMP_GTID 서버

pub mod auth;
pub mod binlog;
pub mod cdc_engine;
pub mod column;
pub mod config;
pub mod converter;
pub mod dumper;
pub mod error;
pub mod events;
pub mod gtid;
pub mod index;
pub mod jsonb;
pub mod offset;
pub mod protocol;
pub mod server;
pub mod source;
pub mod storage;

pub use cdc_engine::BridgeEngine;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use events::{BinlogEvent, EventType};
pub use gtid::GtidSet;
pub use server::BinlogServer;
pub use source::{LogRecord, RecordSource};
