//! 디스크 큐 저장소 -- 이벤트 로그와 ACK 커서
//!
//! # 디렉토리 구조
//! ```text
//! {dir}/queue.log   JSON Lines: {"seq":N,"event":{...}}  (적재 순서대로 append)
//! {dir}/ack.json    {"acked_seq":N}                       (임시 파일 + rename으로 원자적 교체)
//! ```
//!
//! - 이벤트는 큐에 들어가기 전에 로그에 기록됩니다.
//! - `acked_seq` 이하의 시퀀스는 모두 출력이 확인한 것입니다.
//! - 재시작 시 `acked_seq`보다 큰 엔트리를 원래 순서대로 재생합니다.
//! - 모든 엔트리가 확인되면 로그를 비웁니다. 시퀀스 번호는 `ack.json` 덕분에 이어집니다.
//! - 확인된 앞부분이 임계값을 넘고 로그의 절반 이상이면 미확인 꼬리만 `queue.log.tmp`에
//!   옮겨 쓰고 rename으로 교체합니다. 재시작 시에도 같은 방식으로 압축합니다.
//! - 마지막 줄이 잘려 있으면 (쓰기 도중 크래시) 경고 후 버립니다.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ironbeat_core::event::Event;
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::error::QueueError;

const LOG_FILE: &str = "queue.log";
const ACK_FILE: &str = "ack.json";
const ACK_TMP_FILE: &str = "ack.json.tmp";
const LOG_TMP_FILE: &str = "queue.log.tmp";

/// 확인된 앞부분이 이 크기를 넘으면 로그를 압축
const COMPACT_THRESHOLD: u64 = 1 << 20;

#[derive(Debug, Default, Serialize, Deserialize)]
struct AckState {
    acked_seq: u64,
}

#[derive(Deserialize)]
struct LogRecord {
    seq: u64,
    event: Event,
}

/// 로그에서 읽은 레코드
struct LogLine {
    seq: u64,
    event: Event,
    /// 이벤트 JSON 크기
    size: usize,
    /// 줄 끝 (개행 포함) 오프셋
    end: u64,
}

/// 재시작 시 복구된 상태
#[derive(Debug, Default)]
pub(crate) struct Recovered {
    /// 영속화된 ACK 커서
    pub acked_seq: u64,
    /// 아직 확인되지 않은 엔트리 (시퀀스 순)
    pub entries: Vec<(u64, Event, usize)>,
}

/// 큐 디렉토리 하나에 대한 로그/커서 파일 핸들
pub(crate) struct DiskStore {
    dir: PathBuf,
    log: File,
    last_appended: u64,
    acked_seq: u64,
    /// 현재 로그 길이
    log_len: u64,
    /// 미확인 레코드의 (시퀀스, 줄 끝 오프셋)
    unacked: VecDeque<(u64, u64)>,
    /// 확인된 앞부분의 끝 오프셋
    acked_len: u64,
    compact_threshold: u64,
}

impl DiskStore {
    /// 큐 디렉토리를 열고 미확인 엔트리를 복구합니다.
    pub fn open(dir: &Path) -> Result<(Self, Recovered), QueueError> {
        fs::create_dir_all(dir)?;

        let acked_seq = read_ack_state(&dir.join(ACK_FILE))?.acked_seq;
        let log_path = dir.join(LOG_FILE);
        let (records, valid_len, total_len) = read_log(&log_path)?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        if valid_len < total_len {
            log.set_len(valid_len)?;
        }

        let last_appended = records
            .last()
            .map_or(acked_seq, |line| line.seq.max(acked_seq));
        let acked_len = records
            .iter()
            .take_while(|line| line.seq <= acked_seq)
            .last()
            .map_or(0, |line| line.end);

        let mut unacked = VecDeque::new();
        let mut entries = Vec::new();
        for line in records.into_iter().filter(|line| line.seq > acked_seq) {
            unacked.push_back((line.seq, line.end));
            entries.push((line.seq, line.event, line.size));
        }

        let mut store = Self {
            dir: dir.to_path_buf(),
            log,
            last_appended,
            acked_seq,
            log_len: valid_len,
            unacked,
            acked_len,
            compact_threshold: COMPACT_THRESHOLD,
        };
        if entries.is_empty() {
            if valid_len > 0 {
                // 모두 확인된 로그는 비워서 재생 비용을 없앰
                store.truncate()?;
            }
        } else if acked_len > 0 {
            store.compact()?;
        }

        tracing::info!(
            dir = %dir.display(),
            acked_seq,
            pending = entries.len(),
            "disk queue opened"
        );

        Ok((store, Recovered { acked_seq, entries }))
    }

    /// 다음에 할당할 시퀀스 번호
    pub fn next_seq(&self) -> u64 {
        self.last_appended + 1
    }

    /// 직렬화된 이벤트를 로그에 추가합니다.
    pub fn append(&mut self, seq: u64, encoded_event: &[u8]) -> Result<(), QueueError> {
        let mut line = Vec::with_capacity(encoded_event.len() + 32);
        line.extend_from_slice(format!("{{\"seq\":{seq},\"event\":").as_bytes());
        line.extend_from_slice(encoded_event);
        line.extend_from_slice(b"}\n");
        // 한 번의 write로 기록해 줄 단위 원자성을 최대한 유지
        self.log.write_all(&line)?;
        self.log.flush()?;
        self.last_appended = seq;
        self.log_len += line.len() as u64;
        self.unacked.push_back((seq, self.log_len));
        Ok(())
    }

    /// ACK 커서를 원자적으로 영속화합니다.
    ///
    /// 커서가 마지막으로 기록한 시퀀스에 도달하면 로그를 비우고,
    /// 확인된 앞부분이 충분히 커지면 로그를 압축합니다.
    pub fn persist_ack(&mut self, acked_seq: u64) -> Result<(), QueueError> {
        if acked_seq <= self.acked_seq {
            return Ok(());
        }

        let tmp_path = self.dir.join(ACK_TMP_FILE);
        let body = serde_json::to_vec(&AckState { acked_seq })?;
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&body)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, self.dir.join(ACK_FILE))?;
        self.acked_seq = acked_seq;

        while let Some(&(seq, end)) = self.unacked.front()
            && seq <= acked_seq
        {
            self.acked_len = end;
            self.unacked.pop_front();
        }

        if acked_seq >= self.last_appended {
            self.truncate()?;
            tracing::debug!(acked_seq, "disk queue fully acknowledged, log truncated");
        } else if self.acked_len >= self.compact_threshold && self.acked_len * 2 >= self.log_len {
            self.compact()?;
        }
        Ok(())
    }

    fn truncate(&mut self) -> Result<(), QueueError> {
        self.log.set_len(0)?;
        self.log_len = 0;
        self.acked_len = 0;
        self.unacked.clear();
        Ok(())
    }

    /// 확인된 앞부분을 버리고 미확인 꼬리만 남긴 로그로 교체합니다.
    fn compact(&mut self) -> Result<(), QueueError> {
        let log_path = self.dir.join(LOG_FILE);
        let tmp_path = self.dir.join(LOG_TMP_FILE);
        let content = fs::read(&log_path)?;
        let start = self.acked_len;
        let tail = usize::try_from(start)
            .ok()
            .and_then(|start| content.get(start..))
            .unwrap_or_default();
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(tail)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &log_path)?;
        self.log = OpenOptions::new().append(true).open(&log_path)?;

        for (_, end) in self.unacked.iter_mut() {
            *end -= start;
        }
        self.log_len = tail.len() as u64;
        self.acked_len = 0;
        tracing::debug!(
            reclaimed_bytes = start,
            log_bytes = self.log_len,
            pending = self.unacked.len(),
            "disk queue log compacted"
        );
        Ok(())
    }

    /// 로그 파일을 디스크에 동기화합니다.
    pub fn sync(&self) -> Result<(), QueueError> {
        self.log.sync_all()?;
        Ok(())
    }
}

/// 파일 IO를 실행합니다.
///
/// 멀티 스레드 런타임 워커에서는 [`tokio::task::block_in_place`]로 감싸 같은 워커의
/// 다른 태스크가 다른 스레드로 옮겨지게 합니다. 런타임 밖이나 current-thread
/// 런타임에서는 그대로 실행합니다.
pub(crate) fn blocking_io<T>(io: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(io)
        }
        _ => io(),
    }
}

fn read_ack_state(path: &Path) -> Result<AckState, QueueError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| QueueError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AckState::default()),
        Err(e) => Err(e.into()),
    }
}

/// 로그를 읽어 (레코드, 유효 길이, 전체 길이)를 반환합니다.
fn read_log(path: &Path) -> Result<(Vec<LogLine>, u64, u64), QueueError> {
    let content = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0, 0)),
        Err(e) => return Err(e.into()),
    };
    let total_len = content.len() as u64;

    let mut records = Vec::new();
    let mut offset = 0_usize;
    while offset < content.len() {
        let rest = &content[offset..];
        let (line, consumed, terminated) = match rest.iter().position(|b| *b == b'\n') {
            Some(pos) => (&rest[..pos], pos + 1, true),
            None => (rest, rest.len(), false),
        };

        if line.iter().all(u8::is_ascii_whitespace) {
            offset += consumed;
            continue;
        }

        match serde_json::from_slice::<LogRecord>(line) {
            Ok(record) => {
                let size = serde_json::to_vec(&record.event)?.len();
                records.push(LogLine {
                    seq: record.seq,
                    event: record.event,
                    size,
                    end: (offset + consumed) as u64,
                });
            }
            Err(e) if !terminated => {
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    error = %e,
                    "ignoring torn trailing record in disk queue"
                );
                return Ok((records, offset as u64, total_len));
            }
            Err(e) => {
                return Err(QueueError::Corrupt {
                    path: path.display().to_string(),
                    reason: format!("record at offset {offset}: {e}"),
                });
            }
        }
        offset += consumed;
    }

    Ok((records, total_len, total_len))
}
