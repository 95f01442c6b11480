//! Binlog 인덱스 파일 관리
//!
//! 인덱스는 파일 하나당 한 줄인 탭 구분 텍스트입니다:
//! `파일명 \t 번호 \t 현재매핑(ext=seq) \t 이전매핑(ext=seq) \t 체크포인트(us) \t 위치`
//!
//! 변환 프로세스와 덤프 서버가 같은 파일을 공유하므로 모든 접근은 잠금 파일에 대한
//! OS 권고 잠금(fs2) 안에서 이루어집니다. 읽기는 공유 잠금, 쓰기는 배타 잠금을 쓰고
//! 잠금은 `IndexLock`이 drop될 때 해제됩니다.

use crate::error::{BridgeError, Result};
use fs2::FileExt;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const INDEX_FILE_NAME: &str = "mysql-bin.index";
pub const INDEX_LOCK_FILE_NAME: &str = "index.LOCK";
pub const PURGED_FILE_NAME: &str = "mysql-bin.purged";

/// 마지막 줄을 찾을 때 끝에서부터 읽는 첫 구간 크기
const TAIL_CHUNK: u64 = 4096;

/// 외부 트랜잭션 ID와 로컬 GTID 번호의 대응
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnMapping {
    pub ext_txn_id: String,
    pub gtid_seq: u64,
}

impl TxnMapping {
    pub fn new(ext_txn_id: impl Into<String>, gtid_seq: u64) -> Self {
        TxnMapping { ext_txn_id: ext_txn_id.into(), gtid_seq }
    }

    pub fn is_empty(&self) -> bool {
        self.gtid_seq == 0
    }

    fn parse(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Ok(TxnMapping::default());
        }
        let (ext, seq) = text
            .rsplit_once('=')
            .ok_or_else(|| BridgeError::Index(format!("invalid mapping: {}", text)))?;
        let gtid_seq = seq
            .parse()
            .map_err(|_| BridgeError::Index(format!("invalid mapping sequence: {}", text)))?;
        Ok(TxnMapping { ext_txn_id: ext.to_string(), gtid_seq })
    }
}

impl fmt::Display for TxnMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.ext_txn_id, self.gtid_seq)
    }
}

/// 인덱스 한 줄
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinlogIndexRecord {
    /// binlog 파일명 (디렉토리 제외)
    pub file_name: String,
    pub index: u64,
    pub current_mapping: TxnMapping,
    pub before_mapping: TxnMapping,
    /// 마지막으로 기록된 트랜잭션의 체크포인트 (마이크로초)
    pub checkpoint: u64,
    /// 파일에 기록된 바이트 수
    pub position: u64,
}

impl BinlogIndexRecord {
    pub fn new(file_name: impl Into<String>, index: u64) -> Self {
        BinlogIndexRecord {
            file_name: file_name.into(),
            index,
            ..Default::default()
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.trim_end_matches(['\n', '\r']).split('\t').collect();
        if fields.len() != 6 {
            return Err(BridgeError::Index(format!(
                "index record needs 6 fields, got {}: {}",
                fields.len(),
                line
            )));
        }
        let number = |text: &str, what: &str| -> Result<u64> {
            text.parse()
                .map_err(|_| BridgeError::Index(format!("invalid {} in index record: {}", what, text)))
        };
        Ok(BinlogIndexRecord {
            file_name: fields[0].to_string(),
            index: number(fields[1], "index")?,
            current_mapping: TxnMapping::parse(fields[2])?,
            before_mapping: TxnMapping::parse(fields[3])?,
            checkpoint: number(fields[4], "checkpoint")?,
            position: number(fields[5], "position")?,
        })
    }

    /// 줄바꿈 없는 직렬화
    pub fn serialize(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.file_name, self.index, self.current_mapping, self.before_mapping, self.checkpoint, self.position
        )
    }
}

/// PURGE BINARY LOGS 대상
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeTarget {
    /// 지정한 파일까지 (지정 파일 포함)
    To(String),
    /// 체크포인트가 지정 시각(마이크로초)보다 이전인 파일
    Before(u64),
}

/// 인덱스 잠금 가드
pub struct IndexLock {
    file: File,
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            error!("Failed to unlock index lock file: {}", e);
        }
    }
}

/// 인덱스 파일 접근
#[derive(Debug, Clone)]
pub struct BinlogIndex {
    dir: PathBuf,
    index_path: PathBuf,
    lock_path: PathBuf,
    purged_path: PathBuf,
}

impl BinlogIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        BinlogIndex {
            index_path: dir.join(INDEX_FILE_NAME),
            lock_path: dir.join(INDEX_LOCK_FILE_NAME),
            purged_path: dir.join(PURGED_FILE_NAME),
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// 레코드가 가리키는 binlog 파일 경로
    pub fn binlog_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    fn open_lock_file(&self) -> Result<File> {
        fs::create_dir_all(&self.dir)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.lock_path)
            .map_err(|e| BridgeError::Lock(format!("failed to open {}: {}", self.lock_path.display(), e)))
    }

    /// 잠금 파일에 배타 잠금 획득
    pub fn lock(&self) -> Result<IndexLock> {
        let file = self.open_lock_file()?;
        file.lock_exclusive()
            .map_err(|e| BridgeError::Lock(format!("failed to lock {}: {}", self.lock_path.display(), e)))?;
        Ok(IndexLock { file })
    }

    /// 읽기용 공유 잠금 획득
    pub fn lock_shared(&self) -> Result<IndexLock> {
        let file = self.open_lock_file()?;
        FileExt::lock_shared(&file)
            .map_err(|e| BridgeError::Lock(format!("failed to lock {}: {}", self.lock_path.display(), e)))?;
        Ok(IndexLock { file })
    }

    /// 모든 레코드 읽기 (정리된 파일 제외)
    ///
    /// 인덱스 파일이 아직 없으면 빈 목록입니다.
    pub fn fetch_all(&self, lock: bool) -> Result<Vec<BinlogIndexRecord>> {
        let _guard = if lock { Some(self.lock_shared()?) } else { None };
        self.read_records()
    }

    fn read_records(&self) -> Result<Vec<BinlogIndexRecord>> {
        let last_purged = self.last_purged()?;
        let content = match fs::read_to_string(&self.index_path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match BinlogIndexRecord::parse(line) {
                Ok(record) if record.index > 0 && last_purged.map_or(true, |p| record.index > p) => {
                    records.push(record)
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to parse index record: {}", e),
            }
        }
        Ok(records)
    }

    /// 마지막으로 정리된 파일 번호
    fn last_purged(&self) -> Result<Option<u64>> {
        match fs::read_to_string(&self.purged_path) {
            Ok(content) => Ok(content.lines().rev().find_map(|l| l.trim().parse().ok())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 레코드 한 줄 추가
    pub fn add(&self, record: &BinlogIndexRecord) -> Result<()> {
        let _guard = self.lock()?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.index_path)?;
        writeln!(file, "{}", record.serialize())?;
        file.sync_data()?;
        info!("add binlog index file:{} value:{}", record.file_name, record.serialize());
        Ok(())
    }

    /// 마지막 줄을 새 레코드로 교체
    ///
    /// 끝에서부터 읽어 마지막 줄의 시작을 찾고, 그 앞부분을 임시 파일에 복사한 뒤
    /// 새 레코드를 붙여 rename합니다. 마지막 레코드가 다른 파일이면 덮어쓰지 않고 추가합니다.
    pub fn update_last(&self, record: &BinlogIndexRecord) -> Result<()> {
        let _guard = self.lock()?;
        let mut current = match File::open(&self.index_path) {
            Ok(file) => Some(file),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        // (유지할 앞부분 길이, 새 줄 앞에 줄바꿈이 필요한지)
        let (keep, separate) = match current.as_mut() {
            None => (0, false),
            Some(file) => {
                let tail = read_last_line(file)?;
                match BinlogIndexRecord::parse(&tail.line) {
                    Ok(last) if last.file_name == record.file_name => (tail.start, false),
                    Ok(last) => {
                        error!(
                            "The latest binlog index file:{} is not the file being updated:{}",
                            last.file_name, record.file_name
                        );
                        (tail.end, true)
                    }
                    Err(_) if tail.end == 0 => (0, false),
                    Err(e) => return Err(e),
                }
            }
        };

        let temp = self.index_path.with_extension("index.tmp");
        {
            let mut out = File::create(&temp)?;
            if let Some(file) = current.as_mut() {
                file.seek(SeekFrom::Start(0))?;
                std::io::copy(&mut (&mut *file).take(keep), &mut out)?;
            }
            if separate {
                out.write_all(b"\n")?;
            }
            writeln!(out, "{}", record.serialize())?;
            out.sync_data()?;
        }
        fs::rename(&temp, &self.index_path)?;
        debug!("update binlog index: {}", record.serialize());
        Ok(())
    }

    /// 뒤에서 `reverse_offset`번째 레코드 (0은 마지막)
    pub fn get(&self, reverse_offset: usize) -> Result<Option<BinlogIndexRecord>> {
        let records = self.fetch_all(true)?;
        Ok(records.into_iter().rev().nth(reverse_offset))
    }

    pub fn last(&self) -> Result<Option<BinlogIndexRecord>> {
        self.get(0)
    }

    /// 파일명으로 찾기
    pub fn find(&self, file_name: &str) -> Result<Option<BinlogIndexRecord>> {
        Ok(self.fetch_all(true)?.into_iter().find(|r| r.file_name == file_name))
    }

    /// 지정 파일 바로 다음 레코드
    pub fn next_after(&self, file_name: &str) -> Result<Option<BinlogIndexRecord>> {
        let records = self.fetch_all(true)?;
        let position = records.iter().position(|r| r.file_name == file_name);
        Ok(position.and_then(|i| records.get(i + 1).cloned()))
    }

    /// 파일 정리, 정리된 파일명 목록 반환
    ///
    /// 현재 쓰는 파일(마지막 레코드)은 절대 정리하지 않습니다.
    pub fn purge(&self, target: &PurgeTarget) -> Result<Vec<String>> {
        let _guard = self.lock()?;
        let records = self.read_records()?;
        let Some(active) = records.last().map(|r| r.file_name.clone()) else {
            return match target {
                PurgeTarget::To(file) => Err(BridgeError::Index(format!("Failed to find file: {}", file))),
                PurgeTarget::Before(_) => Ok(Vec::new()),
            };
        };

        let cutoff = match target {
            PurgeTarget::To(file) => {
                let found = records
                    .iter()
                    .position(|r| &r.file_name == file)
                    .ok_or_else(|| BridgeError::Index(format!("Failed to find file: {}", file)))?;
                found + 1
            }
            PurgeTarget::Before(ts) => records.iter().take_while(|r| r.checkpoint < *ts).count(),
        };

        let (purged, kept): (Vec<_>, Vec<_>) = records
            .into_iter()
            .enumerate()
            .partition(|(i, r)| *i < cutoff && r.file_name != active);
        let Some(last_purged) = purged.last().map(|(_, r)| r.index) else {
            return Ok(Vec::new());
        };

        let temp = self.index_path.with_extension("index.remove");
        {
            let mut file = File::create(&temp)?;
            for (_, record) in &kept {
                writeln!(file, "{}", record.serialize())?;
            }
            file.sync_data()?;
        }
        fs::rename(&temp, &self.index_path)?;

        let mut ledger = OpenOptions::new().create(true).append(true).open(&self.purged_path)?;
        writeln!(ledger, "{}", last_purged)?;

        let mut names = Vec::with_capacity(purged.len());
        for (_, record) in purged {
            let path = self.binlog_path(&record.file_name);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove purged binlog {}: {}", path.display(), e);
            }
            names.push(record.file_name);
        }
        info!("Purged binlog files: {:?}", names);
        Ok(names)
    }
}

/// 인덱스 파일의 마지막 줄 위치
struct LastLine {
    /// 마지막 줄의 시작 오프셋
    start: u64,
    /// 마지막 줄 내용의 끝 오프셋 (뒤따르는 줄바꿈 제외)
    end: u64,
    line: String,
}

/// 끝에서부터 구간을 두 배씩 늘려 읽으며 마지막 줄을 찾음
fn read_last_line(file: &mut File) -> Result<LastLine> {
    let len = file.metadata()?.len();
    let mut window = TAIL_CHUNK;
    let mut tail = Vec::new();
    loop {
        let from = len.saturating_sub(window);
        file.seek(SeekFrom::Start(from))?;
        tail.clear();
        (&mut *file).take(len - from).read_to_end(&mut tail)?;

        let body_len = tail.iter().rposition(|b| *b != b'\n').map_or(0, |i| i + 1);
        let body = &tail[..body_len];
        let end = from + body_len as u64;
        if let Some(i) = body.iter().rposition(|b| *b == b'\n') {
            return Ok(LastLine {
                start: from + i as u64 + 1,
                end,
                line: String::from_utf8_lossy(&body[i + 1..]).into_owned(),
            });
        }
        if from == 0 {
            return Ok(LastLine { start: 0, end, line: String::from_utf8_lossy(body).into_owned() });
        }
        window = window.saturating_mul(2);
    }
}

/// 현재 쓰는 파일인지 여부
pub fn is_active(file_name: &str, records: &[BinlogIndexRecord]) -> bool {
    records.last().map_or(true, |r| r.file_name == file_name || r.file_name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u64, checkpoint: u64) -> BinlogIndexRecord {
        BinlogIndexRecord {
            file_name: format!("mysql-bin.{:06}", index),
            index,
            current_mapping: TxnMapping::new(format!("ob-{}", index), index * 10),
            before_mapping: TxnMapping::new(format!("ob-{}", index - 1), index * 10 - 1),
            checkpoint,
            position: 0,
        }
    }

    #[test]
    fn test_record_line_format() {
        let r = record(1, 1_700_000_000_000_000);
        assert_eq!(
            r.serialize(),
            "mysql-bin.000001\t1\tob-1=10\tob-0=9\t1700000000000000\t0"
        );
        assert_eq!(BinlogIndexRecord::parse(&r.serialize()).unwrap(), r);
        assert!(BinlogIndexRecord::parse("mysql-bin.000001\t1\t=0").is_err());

        let empty = BinlogIndexRecord::new("mysql-bin.000002", 2);
        let parsed = BinlogIndexRecord::parse(&empty.serialize()).unwrap();
        assert!(parsed.current_mapping.is_empty());
    }

    #[test]
    fn test_missing_index_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let index = BinlogIndex::new(dir.path());
        assert!(index.fetch_all(true).unwrap().is_empty());
        assert!(index.last().unwrap().is_none());
    }

    #[test]
    fn test_add_get_and_update_last() {
        let dir = tempfile::tempdir().unwrap();
        let index = BinlogIndex::new(dir.path());
        index.add(&record(1, 10)).unwrap();
        index.add(&record(2, 20)).unwrap();

        let mut last = index.last().unwrap().unwrap();
        assert_eq!(last.index, 2);
        assert_eq!(index.get(1).unwrap().unwrap().index, 1);
        assert!(index.get(2).unwrap().is_none());

        last.position = 4096;
        index.update_last(&last).unwrap();
        let records = index.fetch_all(false).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].position, 4096);
        assert_eq!(records[0], record(1, 10));

        // 다른 파일이면 추가
        index.update_last(&record(3, 30)).unwrap();
        assert_eq!(index.fetch_all(true).unwrap().len(), 3);
        assert_eq!(index.next_after("mysql-bin.000002").unwrap().unwrap().index, 3);
        assert!(index.next_after("mysql-bin.000003").unwrap().is_none());
    }

    #[test]
    fn test_update_last_with_long_records() {
        let dir = tempfile::tempdir().unwrap();
        let index = BinlogIndex::new(dir.path());
        for i in 1..=50 {
            index.add(&record(i, i * 10)).unwrap();
        }
        // 마지막 줄이 첫 읽기 구간보다 길어도 줄 시작을 찾음
        let mut last = record(51, 510);
        last.current_mapping = TxnMapping::new("x".repeat(10_000), 510);
        index.add(&last).unwrap();

        last.position = 4096;
        index.update_last(&last).unwrap();
        let content = fs::read_to_string(index.index_path()).unwrap();
        assert_eq!(content.lines().count(), 51);
        assert!(content.ends_with(&format!("{}\n", last.serialize())));
        let records = index.fetch_all(true).unwrap();
        assert_eq!(records[49], record(50, 500));
        assert_eq!(records[50], last);
    }

    #[test]
    fn test_reads_take_shared_lock() {
        let dir = tempfile::tempdir().unwrap();
        let index = BinlogIndex::new(dir.path());
        index.add(&record(1, 10)).unwrap();

        let _reader = index.lock_shared().unwrap();
        // 공유 잠금끼리는 막히지 않음
        assert_eq!(index.fetch_all(true).unwrap().len(), 1);
        assert!(index.find("mysql-bin.000001").unwrap().is_some());

        let other = File::open(dir.path().join(INDEX_LOCK_FILE_NAME)).unwrap();
        assert!(other.try_lock_exclusive().is_err());
    }

    #[test]
    fn test_purge_to_is_inclusive_and_keeps_active() {
        let dir = tempfile::tempdir().unwrap();
        let index = BinlogIndex::new(dir.path());
        for i in 1..=4 {
            index.add(&record(i, i * 100)).unwrap();
            fs::write(index.binlog_path(&format!("mysql-bin.{:06}", i)), b"\xfebin").unwrap();
        }

        let purged = index.purge(&PurgeTarget::To("mysql-bin.000002".to_string())).unwrap();
        assert_eq!(purged, vec!["mysql-bin.000001", "mysql-bin.000002"]);
        assert!(!index.binlog_path("mysql-bin.000001").exists());
        let remaining: Vec<u64> = index.fetch_all(true).unwrap().iter().map(|r| r.index).collect();
        assert_eq!(remaining, vec![3, 4]);

        // 활성 파일은 남음
        let purged = index.purge(&PurgeTarget::To("mysql-bin.000004".to_string())).unwrap();
        assert_eq!(purged, vec!["mysql-bin.000003"]);
        assert!(index.binlog_path("mysql-bin.000004").exists());

        assert!(index.purge(&PurgeTarget::To("mysql-bin.000009".to_string())).is_err());
    }

    #[test]
    fn test_purge_before_and_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let index = BinlogIndex::new(dir.path());
        for i in 1..=3 {
            index.add(&record(i, i * 100)).unwrap();
        }
        let purged = index.purge(&PurgeTarget::Before(250)).unwrap();
        assert_eq!(purged.len(), 2);

        // 다른 경로로 인덱스에 남아 있던 레코드도 ledger 기준으로 무시
        let mut file = OpenOptions::new().append(true).open(index.index_path()).unwrap();
        writeln!(file, "{}", record(1, 100).serialize()).unwrap();
        let remaining: Vec<u64> = index.fetch_all(true).unwrap().iter().map(|r| r.index).collect();
        assert_eq!(remaining, vec![3]);
    }

    #[test]
    fn test_is_active() {
        let records = vec![record(1, 1), record(2, 2)];
        assert!(is_active("mysql-bin.000002", &records));
        assert!(!is_active("mysql-bin.000001", &records));
        assert!(is_active("anything", &[]));
    }
}
