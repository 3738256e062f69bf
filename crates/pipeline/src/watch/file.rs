//! 파일 와처 — 로그 파일 tail
//!
//! 라이브 모드는 각 파일을 EOF로 시크한 뒤 폴링으로 따라가며,
//! inode 변경(로테이션)과 파일 축소(truncation)를 감지해 다시
//! 읽습니다. 테스트 모드는 처음부터 끝까지 한 번 읽습니다.
//!
//! 파일마다 태스크 하나가 돌고, 마지막 태스크가 끝나면 라인 채널이
//! 닫혀 와처가 자동으로 마무리됩니다.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use go2jail_core::counters::{Counter, Counters};
use go2jail_core::types::{Line, StringList};

use super::{Watch, WatchMode, LINE_CHANNEL_CAPACITY};
use crate::error::PipelineError;

/// 파일 상태 폴링 주기
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// tail 시작 재시도 횟수와 간격
const OPEN_RETRIES: u32 = 3;
const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// 파일 와처 설정
#[derive(Debug, Deserialize)]
pub struct FileWatchConfig {
    pub id: String,
    #[serde(rename = "type", default)]
    pub type_tag: String,
    pub files: StringList,
    #[serde(default)]
    pub skip_when_file_not_exists: bool,
}

/// 파일 tail 와처
#[derive(Debug)]
pub struct FileWatch {
    id: String,
    files: Vec<PathBuf>,
    skip_when_file_not_exists: bool,
    lines_counter: Counter,
    files_counter: Counter,
    cancel: CancellationToken,
    tracker: TaskTracker,
    /// 모든 파일이 스킵되어 생산 태스크가 없을 때 채널을 열어 두는 손잡이
    idle_tx: std::sync::Mutex<Option<mpsc::Sender<Line>>>,
}

impl FileWatch {
    /// 설정으로 와처를 만듭니다. 파일 목록이 비면 에러입니다.
    pub fn new(cfg: FileWatchConfig) -> Result<Self, PipelineError> {
        if cfg.files.is_empty() {
            return Err(PipelineError::Watch {
                id: cfg.id.clone(),
                reason: "files is empty".to_owned(),
            });
        }
        let counters = Counters::global();
        Ok(Self {
            lines_counter: counters.register("watch", &cfg.id, "lines"),
            files_counter: counters.register("watch", &cfg.id, "files"),
            id: cfg.id,
            files: cfg.files.iter().map(PathBuf::from).collect(),
            skip_when_file_not_exists: cfg.skip_when_file_not_exists,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            idle_tx: std::sync::Mutex::new(None),
        })
    }
}

impl Watch for FileWatch {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self, mode: WatchMode) -> Result<mpsc::Receiver<Line>, PipelineError> {
        tracing::debug!(watch = %self.id, "watch starting");
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);

        let mut opened = Vec::new();
        for path in &self.files {
            if self.skip_when_file_not_exists && !path.exists() {
                tracing::debug!(watch = %self.id, file = %path.display(), "missing file skipped");
                continue;
            }
            let state = open_tail(path, mode)
                .await
                .map_err(|e| PipelineError::Watch {
                    id: self.id.clone(),
                    reason: format!("tail {}: {e}", path.display()),
                })?;
            opened.push(state);
        }

        if opened.is_empty() {
            // 생산 태스크가 없으면 close까지 채널만 열어 둔다
            *self.idle_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
            self.tracker.close();
            return Ok(rx);
        }

        for state in opened {
            let ctx = TailContext {
                watch_id: self.id.clone(),
                tx: tx.clone(),
                lines: self.lines_counter.clone(),
                files: self.files_counter.clone(),
                cancel: self.cancel.clone(),
            };
            self.tracker.spawn(run_file_task(state, mode, ctx));
        }
        self.tracker.close();
        Ok(rx)
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.idle_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[derive(Debug)]
struct TailState {
    path: PathBuf,
    offset: u64,
    #[cfg(unix)]
    inode: u64,
}

struct TailContext {
    watch_id: String,
    tx: mpsc::Sender<Line>,
    lines: Counter,
    files: Counter,
    cancel: CancellationToken,
}

/// tail을 시작합니다. 실패 시 1초 간격으로 최대 3회 시도합니다.
async fn open_tail(path: &Path, mode: WatchMode) -> std::io::Result<TailState> {
    let mut last_err = std::io::Error::other("tail open failed");
    for attempt in 0..OPEN_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(OPEN_RETRY_DELAY).await;
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {
                return Ok(TailState {
                    path: path.to_path_buf(),
                    offset: match mode {
                        WatchMode::Live => meta.len(),
                        WatchMode::Test => 0,
                    },
                    #[cfg(unix)]
                    inode: inode_of(&meta),
                });
            }
            Ok(_) => {
                last_err = std::io::Error::other(format!("{} is not a file", path.display()));
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

async fn run_file_task(mut state: TailState, mode: WatchMode, ctx: TailContext) {
    ctx.files.incr();
    tracing::debug!(watch = %ctx.watch_id, file = %state.path.display(), "watch file");

    match mode {
        WatchMode::Test => {
            if let Err(TailError::Io(e)) = read_new_lines(&mut state, true, &ctx).await {
                tracing::error!(
                    watch = %ctx.watch_id,
                    file = %state.path.display(),
                    error = %e,
                    "tail file fail"
                );
            }
        }
        WatchMode::Live => loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let meta = match tokio::fs::metadata(&state.path).await {
                Ok(meta) => meta,
                // 로테이션 도중 잠시 사라질 수 있으니 다음 폴링까지 대기
                Err(_) => continue,
            };
            #[cfg(unix)]
            {
                let inode = inode_of(&meta);
                if inode != state.inode {
                    tracing::info!(
                        watch = %ctx.watch_id,
                        file = %state.path.display(),
                        "file rotation detected"
                    );
                    state.inode = inode;
                    state.offset = 0;
                }
            }
            if meta.len() < state.offset {
                tracing::warn!(
                    watch = %ctx.watch_id,
                    file = %state.path.display(),
                    "file truncation detected"
                );
                state.offset = 0;
            }

            match read_new_lines(&mut state, false, &ctx).await {
                Ok(()) => {}
                Err(TailError::Closed) => break,
                Err(TailError::Io(e)) => {
                    tracing::error!(
                        watch = %ctx.watch_id,
                        file = %state.path.display(),
                        error = %e,
                        "tail file fail"
                    );
                    break;
                }
            }
        },
    }
    tracing::info!(watch = %ctx.watch_id, file = %state.path.display(), "file closed");
}

enum TailError {
    /// 수신 측이 사라짐
    Closed,
    Io(std::io::Error),
}

impl From<std::io::Error> for TailError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// 오프셋부터 새로 완성된 라인을 읽어 내보냅니다.
///
/// 개행으로 끝나지 않은 꼬리는 오프셋을 남겨 두었다가 다음 호출에서
/// 다시 읽습니다. `include_partial`이면 (테스트 모드) 꼬리도
/// 마지막 라인으로 내보냅니다.
async fn read_new_lines(
    state: &mut TailState,
    include_partial: bool,
    ctx: &TailContext,
) -> Result<(), TailError> {
    let file = File::open(&state.path).await?;
    let mut reader = BufReader::new(file);
    reader
        .seek(std::io::SeekFrom::Start(state.offset))
        .await?;

    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            break;
        }
        let complete = buf.last() == Some(&b'\n');
        if !complete && !include_partial {
            break;
        }
        state.offset += n as u64;
        let end = if complete { buf.len() - 1 } else { buf.len() };
        let text = String::from_utf8_lossy(&buf[..end]);
        let text = text.trim_end_matches('\r');
        if text.is_empty() {
            continue;
        }
        tracing::debug!(watch = %ctx.watch_id, line = text, "get line");
        if ctx
            .tx
            .send(Line::new(ctx.watch_id.clone(), text))
            .await
            .is_err()
        {
            return Err(TailError::Closed);
        }
        ctx.lines.incr();
        if !complete {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config(id: &str, files: Vec<String>, skip: bool) -> FileWatchConfig {
        FileWatchConfig {
            id: id.to_owned(),
            type_tag: "file".to_owned(),
            files: StringList(files),
            skip_when_file_not_exists: skip,
        }
    }

    #[test]
    fn empty_files_is_rejected() {
        let err = FileWatch::new(config("w", vec![], false)).unwrap_err();
        assert!(err.to_string().contains("files is empty"));
    }

    #[tokio::test]
    async fn test_mode_reads_existing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        std::fs::write(&path, "1.1.1.1\n2.2.2.2\ntail-no-newline").unwrap();

        let watch = FileWatch::new(config(
            "file-test",
            vec![path.to_string_lossy().into_owned()],
            false,
        ))
        .unwrap();
        let mut rx = watch.start(WatchMode::Test).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().text, "1.1.1.1");
        assert_eq!(rx.recv().await.unwrap().text, "2.2.2.2");
        assert_eq!(rx.recv().await.unwrap().text, "tail-no-newline");
        // 모든 파일을 다 읽으면 채널이 닫힌다
        assert!(rx.recv().await.is_none());
        watch.close().await;
    }

    #[tokio::test]
    async fn live_mode_follows_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.log");
        std::fs::write(&path, "old line\n").unwrap();

        let watch = FileWatch::new(config(
            "file-live",
            vec![path.to_string_lossy().into_owned()],
            false,
        ))
        .unwrap();
        let mut rx = watch.start(WatchMode::Live).await.unwrap();

        // EOF에서 시작하므로 기존 라인은 나오지 않는다
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "fresh line").unwrap();
        f.flush().unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.text, "fresh line");
        watch.close().await;
    }

    #[tokio::test]
    async fn live_mode_detects_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.log");
        std::fs::write(&path, "a very long old content here\n").unwrap();

        let watch = FileWatch::new(config(
            "file-trunc",
            vec![path.to_string_lossy().into_owned()],
            false,
        ))
        .unwrap();
        let mut rx = watch.start(WatchMode::Live).await.unwrap();

        tokio::time::sleep(POLL_INTERVAL * 2).await;
        std::fs::write(&path, "new\n").unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.text, "new");
        watch.close().await;
    }

    #[tokio::test]
    async fn missing_file_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.log");
        let watch = FileWatch::new(config(
            "file-missing",
            vec![path.to_string_lossy().into_owned()],
            false,
        ))
        .unwrap();
        assert!(watch.start(WatchMode::Test).await.is_err());
    }

    #[tokio::test]
    async fn missing_file_skipped_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.log");
        let present = dir.path().join("present.log");
        std::fs::write(&present, "1.1.1.1\n").unwrap();

        let watch = FileWatch::new(config(
            "file-skip",
            vec![
                absent.to_string_lossy().into_owned(),
                present.to_string_lossy().into_owned(),
            ],
            true,
        ))
        .unwrap();
        let mut rx = watch.start(WatchMode::Test).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().text, "1.1.1.1");
        assert!(rx.recv().await.is_none());
        watch.close().await;
    }

    #[tokio::test]
    async fn all_files_skipped_keeps_channel_open_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.log");
        let watch = FileWatch::new(config(
            "file-all-skipped",
            vec![absent.to_string_lossy().into_owned()],
            true,
        ))
        .unwrap();
        let mut rx = watch.start(WatchMode::Live).await.unwrap();

        // 생산자가 없어도 채널은 닫히지 않는다
        let poll = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(poll.is_err(), "channel should stay open");

        watch.close().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn empty_lines_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaps.log");
        std::fs::write(&path, "one\n\n\ntwo\n").unwrap();

        let watch = FileWatch::new(config(
            "file-gaps",
            vec![path.to_string_lossy().into_owned()],
            false,
        ))
        .unwrap();
        let mut rx = watch.start(WatchMode::Test).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().text, "one");
        assert_eq!(rx.recv().await.unwrap().text, "two");
        assert!(rx.recv().await.is_none());
        watch.close().await;
    }
}
