//! Binlog 덤프 서버
//!
//! 복제 클라이언트 연결마다 태스크 하나를 띄워 handshake, 인증, 명령 처리를 합니다.
//! 복제 시작에 필요한 관리 SQL (SHOW MASTER STATUS, SHOW BINLOG EVENTS, PURGE, SET, SELECT)은
//! 정규식으로 구분해 직접 응답합니다.

use crate::auth::{generate_scramble, handshake_packet, verify_native_password, HandshakeResponse};
use crate::binlog::BinlogParser;
use crate::config::BridgeConfig;
use crate::dumper::{BinlogDumper, DumperMetric, SessionVars};
use crate::error::{BridgeError, Result, ER_ERROR_WHEN_EXECUTING_COMMAND};
use crate::events::SERVER_VERSION;
use crate::gtid::GtidSet;
use crate::index::{BinlogIndex, PurgeTarget};
use crate::offset::{binary_logs, MasterStatus};
use crate::protocol::{command, BinlogDumpRequest, PacketChannel, ResultColumn};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
pub const ER_WRONG_VALUE_FOR_VAR: u16 = 1231;
pub const ER_WRONG_TYPE_FOR_VAR: u16 = 1232;

/// 실행 중인 덤프 세션 목록
#[derive(Debug, Default)]
pub struct DumperRegistry {
    dumpers: Mutex<HashMap<u32, Arc<DumperMetric>>>,
}

impl DumperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: u32, metric: Arc<DumperMetric>) {
        self.dumpers.lock().insert(connection_id, metric);
    }

    pub fn unregister(&self, connection_id: u32) -> Option<Arc<DumperMetric>> {
        self.dumpers.lock().remove(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.dumpers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dumpers.lock().is_empty()
    }

    /// 세션별 지표 출력 (카운터는 읽으면서 초기화됨)
    pub fn log_counters(&self) {
        let dumpers: Vec<_> = self.dumpers.lock().iter().map(|(id, m)| (*id, Arc::clone(m))).collect();
        for (id, metric) in dumpers {
            let (rps, iops) = metric.sample();
            info!(
                connection = id,
                client = %metric.client,
                rps,
                iops,
                delay_us = metric.delay_us(),
                "binlog dumper counter"
            );
        }
    }
}

/// 관리 명령 응답
#[derive(Debug, Clone)]
pub enum Reply {
    Ok,
    Rows(Vec<ResultColumn>, Vec<Vec<Option<String>>>),
    Error(u16, String),
}

impl Reply {
    fn single(name: &str, value: Option<String>) -> Self {
        Reply::Rows(vec![ResultColumn::text(name)], vec![vec![value]])
    }
}

/// 연결별 세션 상태
#[derive(Debug, Default)]
pub struct Session {
    pub vars: SessionVars,
    /// SET @name = value 로 저장된 사용자 변수
    pub user_vars: HashMap<String, String>,
}

/// 관리 SQL 패턴
struct AdminCommands {
    show_master_status: Regex,
    show_binary_logs: Regex,
    show_binlog_events: Regex,
    purge: Regex,
    set: Regex,
    assignment: Regex,
    gtid_function: Regex,
    select_variable: Regex,
    select_unix_timestamp: Regex,
}

impl AdminCommands {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| BridgeError::Other(format!("invalid admin pattern {}: {}", pattern, e)))
        };
        Ok(AdminCommands {
            show_master_status: compile(r"(?i)^\s*SHOW\s+(?:MASTER|BINARY\s+LOG)\s+STATUS\s*;?\s*$")?,
            show_binary_logs: compile(r"(?i)^\s*SHOW\s+(?:BINARY|MASTER)\s+LOGS\s*;?\s*$")?,
            show_binlog_events: compile(
                r"(?i)^\s*SHOW\s+BINLOG\s+EVENTS(?:\s+IN\s+'([^']+)')?(?:\s+FROM\s+(\d+))?(?:\s+LIMIT\s+(?:(\d+)\s*,\s*)?(\d+))?\s*;?\s*$",
            )?,
            purge: compile(r"(?i)^\s*PURGE\s+(?:BINARY|MASTER)\s+LOGS\s+(TO|BEFORE)\s+'([^']+)'\s*;?\s*$")?,
            set: compile(r"(?i)^\s*SET\s+(.+?)\s*;?\s*$")?,
            assignment: compile(r"(?i)^\s*(@@|@)?(?:(?:GLOBAL|SESSION|LOCAL)(?:\s+|\s*\.\s*))?([\w$]+)\s*:?=\s*(.+?)\s*$")?,
            gtid_function: compile(
                r#"(?i)^\s*SELECT\s+(GTID_SUBSET|GTID_SUBTRACT)\s*\(\s*['"]([^'"]*)['"]\s*,\s*['"]([^'"]*)['"]\s*\)\s*;?\s*$"#,
            )?,
            select_variable: compile(r"(?i)^\s*SELECT\s+(@@|@)((?:(?:GLOBAL|SESSION)\.)?[\w$]+)(?:\s+(?:AS\s+)?\S+)?\s*;?\s*$")?,
            select_unix_timestamp: compile(r"(?i)^\s*SELECT\s+UNIX_TIMESTAMP\s*\(\s*\)\s*;?\s*$")?,
        })
    }
}

/// 복제 클라이언트용 MySQL 서버
pub struct BinlogServer {
    config: Arc<BridgeConfig>,
    index: BinlogIndex,
    registry: Arc<DumperRegistry>,
    commands: AdminCommands,
    next_connection_id: AtomicU32,
}

impl BinlogServer {
    pub fn new(config: Arc<BridgeConfig>) -> Result<Self> {
        Ok(BinlogServer {
            index: BinlogIndex::new(&config.binlog_dir),
            config,
            registry: Arc::new(DumperRegistry::new()),
            commands: AdminCommands::new()?,
            next_connection_id: AtomicU32::new(1),
        })
    }

    pub fn registry(&self) -> Arc<DumperRegistry> {
        Arc::clone(&self.registry)
    }

    /// 설정된 주소에서 연결 수신
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!("Binlog dump server listening on {}", listener.local_addr()?);
        self.serve(listener, cancel).await
    }

    /// 연결마다 태스크를 띄우고, 주기적으로 덤퍼 지표를 출력
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let mut counter = tokio::time::interval(Duration::from_secs(self.config.counter_interval_s.max(1)));
        counter.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Binlog dump server stopped");
                    return Ok(());
                }
                _ = counter.tick() => self.registry.log_counters(),
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed for {}: {}", addr, e);
                    }
                    let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    let server = Arc::clone(&self);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        let peer = addr.to_string();
                        if let Err(e) = server.handle_connection(stream, connection_id, &peer, cancel).await {
                            warn!(connection = connection_id, peer = %peer, "connection closed with error: {}", e);
                        }
                    });
                }
            }
        }
    }

    /// 연결 하나 처리: handshake → 인증 → 명령 루프
    pub async fn handle_connection<S>(
        &self,
        stream: S,
        connection_id: u32,
        peer: &str,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut channel = PacketChannel::new(stream);
        let scramble = generate_scramble();
        channel.write_packet(&handshake_packet(connection_id, &scramble)).await?;

        let response = HandshakeResponse::parse(&channel.read_packet().await?)?;
        if response.username != self.config.user
            || !verify_native_password(&self.config.password, &scramble, &response.auth_response)
        {
            warn!(connection = connection_id, peer, user = %response.username, "authentication failed");
            let message = format!(
                "Access denied for user '{}'@'{}' (using password: {})",
                response.username,
                peer.rsplit_once(':').map_or(peer, |(host, _)| host),
                if response.auth_response.is_empty() { "NO" } else { "YES" }
            );
            channel.write_error(ER_ACCESS_DENIED_ERROR, &message).await?;
            return Ok(());
        }
        channel.write_ok().await?;
        debug!(connection = connection_id, peer, "client authenticated");

        let mut session = Session::default();
        loop {
            channel.reset_sequence();
            let packet = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                packet = channel.read_packet() => packet,
            };
            let packet = match packet {
                Ok(packet) => packet,
                Err(e) if e.is_truncated() => {
                    debug!(connection = connection_id, "client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let Some((&cmd, body)) = packet.split_first() else {
                return Err(BridgeError::Protocol("empty command packet".to_string()));
            };

            match cmd {
                command::COM_QUIT => return Ok(()),
                command::COM_PING | command::COM_INIT_DB | command::COM_REGISTER_SLAVE => channel.write_ok().await?,
                command::COM_QUERY => {
                    let query = String::from_utf8_lossy(body);
                    debug!(connection = connection_id, "query: {}", query);
                    match self.execute_query(&query, &mut session) {
                        Reply::Ok => channel.write_ok().await?,
                        Reply::Rows(columns, rows) => channel.write_result_set(&columns, &rows).await?,
                        Reply::Error(code, message) => channel.write_error(code, &message).await?,
                    }
                }
                command::COM_BINLOG_DUMP | command::COM_BINLOG_DUMP_GTID => {
                    let request = if cmd == command::COM_BINLOG_DUMP {
                        BinlogDumpRequest::parse(body)?
                    } else {
                        BinlogDumpRequest::parse_gtid(body)?
                    };
                    return self.dump(&mut channel, request, &session, connection_id, peer, &cancel).await;
                }
                other => {
                    debug!(connection = connection_id, "unsupported command {:#04x}", other);
                    channel.write_error(ER_UNKNOWN_COM_ERROR, "Unknown command").await?;
                }
            }
        }
    }

    async fn dump<S>(
        &self,
        channel: &mut PacketChannel<S>,
        request: BinlogDumpRequest,
        session: &Session,
        connection_id: u32,
        peer: &str,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(
            connection = connection_id,
            peer,
            slave_id = request.server_id,
            file = %request.file_name,
            pos = request.position,
            gtid = request.executed.is_some(),
            "binlog dump requested"
        );
        let metric = Arc::new(DumperMetric::new(format!("{}({})", peer, request.server_id)));
        self.registry.register(connection_id, Arc::clone(&metric));
        let result = BinlogDumper::new(
            Arc::clone(&self.config),
            channel,
            request,
            session.vars.clone(),
            metric,
            cancel.child_token(),
        )
        .run()
        .await;
        self.registry.unregister(connection_id);

        match result {
            // 이미 ERR 패킷으로 알림
            Err(BridgeError::Dump { .. }) => Ok(()),
            other => other,
        }
    }

    /// COM_QUERY 처리
    pub fn execute_query(&self, query: &str, session: &mut Session) -> Reply {
        let commands = &self.commands;
        let result = if commands.show_master_status.is_match(query) {
            self.show_master_status()
        } else if commands.show_binary_logs.is_match(query) {
            self.show_binary_logs()
        } else if let Some(caps) = commands.show_binlog_events.captures(query) {
            self.show_binlog_events(&caps)
        } else if let Some(caps) = commands.purge.captures(query) {
            self.purge(&caps[1], &caps[2])
        } else if let Some(caps) = commands.set.captures(query) {
            Ok(self.set(&caps[1], session))
        } else if let Some(caps) = commands.gtid_function.captures(query) {
            gtid_function(&caps[1], &caps[2], &caps[3])
        } else if let Some(caps) = commands.select_variable.captures(query) {
            Ok(self.select_variable(&caps[1], &caps[2], session))
        } else if commands.select_unix_timestamp.is_match(query) {
            Ok(Reply::single("UNIX_TIMESTAMP()", Some(chrono::Utc::now().timestamp().to_string())))
        } else {
            Ok(Reply::Ok)
        };
        result.unwrap_or_else(|e| {
            warn!("admin query failed: {}: {}", query, e);
            let (code, message) = e.client_error();
            Reply::Error(code, message)
        })
    }

    fn show_master_status(&self) -> Result<Reply> {
        let columns = vec![
            ResultColumn::text("File"),
            ResultColumn::number("Position"),
            ResultColumn::text("Binlog_Do_DB"),
            ResultColumn::text("Binlog_Ignore_DB"),
            ResultColumn::text("Executed_Gtid_Set"),
        ];
        let rows = match MasterStatus::load(&self.index, self.config.server_uuid)? {
            Some(status) => vec![vec![
                Some(status.position.filename),
                Some(status.position.position.to_string()),
                Some(String::new()),
                Some(String::new()),
                Some(status.executed.to_string()),
            ]],
            None => Vec::new(),
        };
        Ok(Reply::Rows(columns, rows))
    }

    fn show_binary_logs(&self) -> Result<Reply> {
        let rows = binary_logs(&self.index)?
            .into_iter()
            .map(|log| vec![Some(log.name), Some(log.size.to_string())])
            .collect();
        Ok(Reply::Rows(vec![ResultColumn::text("Log_name"), ResultColumn::number("File_size")], rows))
    }

    fn show_binlog_events(&self, caps: &Captures<'_>) -> Result<Reply> {
        let command_error = |reason: String| BridgeError::Dump {
            code: ER_ERROR_WHEN_EXECUTING_COMMAND,
            message: format!("Error when executing command SHOW BINLOG EVENTS: {}", reason),
        };
        let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u64>().ok());

        let file_name = match caps.get(1) {
            Some(name) => name.as_str().to_string(),
            None => match self.index.fetch_all(true)?.into_iter().next() {
                Some(first) => first.file_name,
                None => return Ok(Reply::Rows(binlog_event_columns(), Vec::new())),
            },
        };
        if self.index.find(&file_name)?.is_none() {
            return Err(command_error("Could not find target log".to_string()));
        }
        let from = number(2).unwrap_or(4).max(4);
        let skip = number(3).unwrap_or(0) as usize;
        let limit = number(4).map_or(usize::MAX, |n| n as usize);

        let events = BinlogParser::read_events(self.index.binlog_path(&file_name), from, skip, limit)
            .map_err(|e| command_error(e.to_string()))?;
        let rows = events
            .into_iter()
            .map(|(pos, event)| {
                let header = event.header();
                vec![
                    Some(file_name.clone()),
                    Some(pos.to_string()),
                    Some(header.event_type.name().to_string()),
                    Some(header.server_id.to_string()),
                    Some(header.next_position.to_string()),
                    Some(event.info()),
                ]
            })
            .collect();
        Ok(Reply::Rows(binlog_event_columns(), rows))
    }

    fn purge(&self, kind: &str, target: &str) -> Result<Reply> {
        let target = if kind.eq_ignore_ascii_case("TO") {
            PurgeTarget::To(target.to_string())
        } else {
            let datetime = NaiveDateTime::parse_from_str(target, "%Y-%m-%d %H:%M:%S")
                .map_err(|e| BridgeError::Other(format!("Incorrect datetime value: '{}': {}", target, e)))?;
            PurgeTarget::Before(datetime.and_utc().timestamp_micros().max(0) as u64)
        };
        self.index.purge(&target).map_err(|e| BridgeError::Dump {
            code: ER_ERROR_WHEN_EXECUTING_COMMAND,
            message: format!("Error when executing command PURGE BINARY LOGS: {}", e),
        })?;
        Ok(Reply::Ok)
    }

    /// SET @a = x, @@b = y, NAMES utf8 ...
    ///
    /// 사용자 변수만 저장하고, 시스템 변수 변경이나 알 수 없는 구문은 OK로 응답합니다.
    fn set(&self, assignments: &str, session: &mut Session) -> Reply {
        for assignment in assignments.split(',') {
            let Some(caps) = self.commands.assignment.captures(assignment) else {
                continue;
            };
            if caps.get(1).map(|m| m.as_str()) != Some("@") {
                continue;
            }
            let name = caps[2].to_ascii_lowercase();
            let value = match self.evaluate(&caps[3], session) {
                Some(value) => value,
                None => continue,
            };

            match name.as_str() {
                "master_binlog_checksum" => {
                    if value.eq_ignore_ascii_case("CRC32") {
                        session.vars.checksum = true;
                    } else if value.eq_ignore_ascii_case("NONE") {
                        session.vars.checksum = false;
                    } else {
                        return Reply::Error(
                            ER_WRONG_VALUE_FOR_VAR,
                            format!("Variable '{}' can't be set to the value of '{}'", name, value),
                        );
                    }
                }
                "master_heartbeat_period" => match value.parse::<u64>() {
                    Ok(0) => session.vars.heartbeat_period = None,
                    Ok(ns) => session.vars.heartbeat_period = Some(Duration::from_nanos(ns)),
                    Err(_) => {
                        return Reply::Error(ER_WRONG_TYPE_FOR_VAR, format!("Incorrect argument type to variable '{}'", name))
                    }
                },
                _ => {}
            }
            debug!("session variable @{} = {}", name, value);
            session.user_vars.insert(name, value);
        }
        Reply::Ok
    }

    /// 대입 우변 계산: 따옴표 문자열, 숫자, @@시스템 변수, @사용자 변수
    fn evaluate(&self, expr: &str, session: &Session) -> Option<String> {
        let expr = expr.trim();
        if let Some(name) = expr.strip_prefix("@@") {
            return self.system_variable(name);
        }
        if let Some(name) = expr.strip_prefix('@') {
            return session.user_vars.get(&name.to_ascii_lowercase()).cloned();
        }
        let unquoted = expr
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .or_else(|| expr.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
            .unwrap_or(expr);
        Some(unquoted.to_string())
    }

    fn select_variable(&self, sigil: &str, name: &str, session: &Session) -> Reply {
        let column = format!("{}{}", sigil, name);
        let value = if sigil == "@@" {
            self.system_variable(name)
        } else {
            session.user_vars.get(&name.to_ascii_lowercase()).cloned()
        };
        Reply::single(&column, value)
    }

    /// 복제 클라이언트가 확인하는 시스템 변수, 모르는 변수는 NULL
    fn system_variable(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        let name = name
            .strip_prefix("global.")
            .or_else(|| name.strip_prefix("session."))
            .unwrap_or(&name);
        let value = match name {
            "server_id" => self.config.server_id.to_string(),
            "server_uuid" => self.config.server_uuid.to_string(),
            "gtid_mode" | "enforce_gtid_consistency" => "ON".to_string(),
            "binlog_checksum" => (if self.config.checksum { "CRC32" } else { "NONE" }).to_string(),
            "binlog_format" => "ROW".to_string(),
            "binlog_row_image" => "FULL".to_string(),
            "log_bin" => "1".to_string(),
            "version" => SERVER_VERSION.to_string(),
            "version_comment" => "binlog bridge".to_string(),
            "gtid_executed" => match MasterStatus::load(&self.index, self.config.server_uuid) {
                Ok(Some(status)) => status.executed.to_string(),
                Ok(None) => String::new(),
                Err(e) => {
                    warn!("failed to load master status: {}", e);
                    String::new()
                }
            },
            "gtid_purged" => match self.purged_gtids() {
                Ok(purged) => purged.to_string(),
                Err(e) => {
                    warn!("failed to read purged gtids: {}", e);
                    String::new()
                }
            },
            _ => return None,
        };
        Some(value)
    }

    /// 남아 있는 첫 파일의 PREVIOUS_GTIDS (그 이전 트랜잭션은 모두 정리됨)
    fn purged_gtids(&self) -> Result<GtidSet> {
        let Some(first) = self.index.fetch_all(true)?.into_iter().next() else {
            return Ok(GtidSet::new());
        };
        let messages = BinlogParser::previous_gtids(self.index.binlog_path(&first.file_name))?;
        Ok(GtidSet::from_messages(&messages))
    }
}

fn binlog_event_columns() -> Vec<ResultColumn> {
    vec![
        ResultColumn::text("Log_name"),
        ResultColumn::number("Pos"),
        ResultColumn::text("Event_type"),
        ResultColumn::number("Server_id"),
        ResultColumn::number("End_log_pos"),
        ResultColumn::text("Info"),
    ]
}

/// GTID_SUBSET(a, b) → 1/0, GTID_SUBTRACT(a, b) → 집합 문자열
fn gtid_function(function: &str, a: &str, b: &str) -> Result<Reply> {
    let left = GtidSet::parse(a)?;
    let right = GtidSet::parse(b)?;
    let column = format!("{}('{}', '{}')", function.to_ascii_uppercase(), a, b);
    let value = if function.eq_ignore_ascii_case("GTID_SUBSET") {
        (if left.is_subset(&right) { "1" } else { "0" }).to_string()
    } else {
        left.subtract(&right).to_string()
    };
    Ok(Reply::single(&column, Some(value)))
}
