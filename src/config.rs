//! 브리지 설정
//!
//! 설정은 한 번 만들어진 뒤 변경되지 않으며 `Arc<BridgeConfig>`로 각 컴포넌트에 전달됩니다.
//! JSON 파일에서 읽고, 일부 항목은 환경 변수로 덮어쓸 수 있습니다.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// 기본 서버 ID
pub const DEFAULT_SERVER_ID: u32 = 1147473732;

/// 기본 서버 UUID
pub const DEFAULT_SERVER_UUID: &str = "7bff0a2b-4a3c-11ee-b0c4-0242ac110002";

/// 재시작 시 복구 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// 마지막 파일의 불완전한 트랜잭션을 잘라내고 새 파일로 회전
    #[default]
    Truncate,
    /// 파일을 자르지 않고 이미 기록된 이벤트를 건너뜀
    ExactlyOnce,
}

/// 마지막 인덱스 레코드의 매핑이 비어 있을 때의 처리 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingFallback {
    /// 직전 레코드의 current 매핑 사용
    #[default]
    PreviousRecord,
    /// 복구 실패로 처리
    Strict,
}

/// 브리지 전체 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// binlog 파일과 인덱스가 위치하는 디렉토리
    pub binlog_dir: PathBuf,
    /// binlog 파일명 접두사
    pub log_bin_prefix: String,
    /// 파일 번호 자릿수
    pub file_name_width: usize,
    pub server_uuid: Uuid,
    pub server_id: u32,

    /// CRC32 체크섬 사용 여부
    pub checksum: bool,
    /// 파일 회전 기준 크기 (바이트)
    pub max_binlog_size: u64,
    /// 쓰기 버퍼 최대 크기
    pub max_event_buffer_bytes: usize,
    /// 버퍼 flush 주기 (마이크로초)
    pub flush_timeout_us: u64,

    /// 최초 시작 시 이어받을 외부 트랜잭션 ID
    pub initial_trx_xid: Option<String>,
    /// 최초 시작 시 해당 트랜잭션에 대응하는 GTID 시퀀스
    pub initial_trx_gtid_seq: u64,
    /// 최초 시작 체크포인트 (마이크로초)
    pub start_timestamp_us: u64,
    pub recovery_mode: RecoveryMode,
    pub mapping_fallback: MappingFallback,
    /// 복구로 파일을 자르기 전에 백업할지 여부
    pub recover_backup: bool,

    /// 알 수 없는 레코드를 건너뛸지 여부
    pub ignore_unsupported_record: bool,
    /// DDL 변환기 사용 여부
    pub ddl_convert: bool,
    /// 변환기 → 저장소 큐 크기
    pub queue_capacity: usize,
    pub queue_offer_timeout_us: u64,
    pub source_poll_timeout_us: u64,

    /// 클라이언트가 지정하지 않았을 때의 하트비트 주기 (마이크로초)
    pub heartbeat_interval_us: u64,
    pub listen_addr: String,
    pub user: String,
    pub password: String,
    /// 덤퍼 지표 출력 주기 (초)
    pub counter_interval_s: u64,
    pub tail_poll_interval_us: u64,
    pub next_file_wait_rounds: u32,
    pub next_file_wait_us: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            binlog_dir: PathBuf::from("./binlog/data"),
            log_bin_prefix: "mysql-bin".to_string(),
            file_name_width: 6,
            server_uuid: Uuid::parse_str(DEFAULT_SERVER_UUID).unwrap_or_else(|_| Uuid::nil()),
            server_id: DEFAULT_SERVER_ID,
            checksum: true,
            max_binlog_size: 500 * 1024 * 1024,
            max_event_buffer_bytes: 64 * 1024 * 1024,
            flush_timeout_us: 100_000,
            initial_trx_xid: None,
            initial_trx_gtid_seq: 1,
            start_timestamp_us: 0,
            recovery_mode: RecoveryMode::Truncate,
            mapping_fallback: MappingFallback::PreviousRecord,
            recover_backup: true,
            ignore_unsupported_record: true,
            ddl_convert: false,
            queue_capacity: 1024,
            queue_offer_timeout_us: 100_000,
            source_poll_timeout_us: 100_000,
            heartbeat_interval_us: 1_000_000,
            listen_addr: "0.0.0.0:8100".to_string(),
            user: "root".to_string(),
            password: String::new(),
            counter_interval_s: 10,
            tail_poll_interval_us: 1_000,
            next_file_wait_rounds: 100,
            next_file_wait_us: 10_000,
        }
    }
}

impl BridgeConfig {
    /// JSON 파일에서 설정 읽기
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: BridgeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// 환경 변수로 일부 항목 덮어쓰기
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = env::var("BINLOG_DIR") {
            self.binlog_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = env::var("BINLOG_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(user) = env::var("BINLOG_USER") {
            self.user = user;
        }
        if let Ok(password) = env::var("BINLOG_PASSWORD") {
            self.password = password;
        }
        if let Ok(uuid) = env::var("BINLOG_SERVER_UUID") {
            self.server_uuid = Uuid::parse_str(&uuid)
                .map_err(|e| BridgeError::Config(format!("invalid BINLOG_SERVER_UUID: {}", e)))?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.file_name_width == 0 {
            return Err(BridgeError::Config("file_name_width must be positive".to_string()));
        }
        if self.log_bin_prefix.is_empty() {
            return Err(BridgeError::Config("log_bin_prefix must not be empty".to_string()));
        }
        if self.initial_trx_gtid_seq == 0 {
            return Err(BridgeError::Config("initial_trx_gtid_seq starts at 1".to_string()));
        }
        if self.initial_trx_xid.is_some() && self.start_timestamp_us == 0 {
            return Err(BridgeError::Config(
                "start_timestamp_us is required when initial_trx_xid is set".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(BridgeError::Config("queue_capacity must be positive".to_string()));
        }
        Ok(())
    }

    /// 인덱스 번호에 대응하는 binlog 파일명 (예: mysql-bin.000001)
    pub fn binlog_file_name(&self, index: u64) -> String {
        fill_binlog_file_name(&self.log_bin_prefix, index, self.file_name_width)
    }

    /// 인덱스 번호에 대응하는 binlog 파일 전체 경로
    pub fn binlog_path(&self, index: u64) -> PathBuf {
        self.binlog_dir.join(self.binlog_file_name(index))
    }

    /// 복구 백업 디렉토리
    pub fn recover_backup_dir(&self) -> PathBuf {
        match self.binlog_dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join("recover_backup"),
            _ => self.binlog_dir.join("recover_backup"),
        }
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_micros(self.flush_timeout_us)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_micros(self.heartbeat_interval_us)
    }

    pub fn queue_offer_timeout(&self) -> Duration {
        Duration::from_micros(self.queue_offer_timeout_us)
    }

    pub fn source_poll_timeout(&self) -> Duration {
        Duration::from_micros(self.source_poll_timeout_us)
    }

    pub fn tail_poll_interval(&self) -> Duration {
        Duration::from_micros(self.tail_poll_interval_us)
    }
}

/// 접두사 + "." + 0으로 채운 번호
pub fn fill_binlog_file_name(prefix: &str, index: u64, width: usize) -> String {
    format!("{}.{:0width$}", prefix, index, width = width)
}
